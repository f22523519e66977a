pub mod config;
pub mod control;
mod db;
mod error;
mod executor;
pub mod logging;
mod progress;
mod remote;
mod repository;
mod retry;
mod scheduler;
pub mod status;
mod store;
mod task;

pub const APP_NAME: &str = "Cumulus";

pub use error::{Error, Result};
pub use executor::{DEFAULT_CHUNK_SIZE, ExecutionOutcome, ExecutorConfig, TransferExecutor};
pub use progress::{
    DEFAULT_SUBSCRIBER_BACKLOG, ProgressBus, ProgressSink, Subscription, TransferEvent,
    TransferEventKind,
};
pub use remote::{
    CHECKSUM_HEADER, HttpRemote, HttpRemoteConfig, InMemoryRemote, RemoteFuture, RemoteStorage,
    UploadMeta, blake3_hex, classify_status,
};
pub use repository::{TransferRepository, task_db_path};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
pub use store::{
    InMemoryTaskStore, SqliteTaskStore, StoreFuture, TaskStore, WriteRetryPolicy,
    update_with_retry,
};
pub use task::{
    Direction, ErrorClass, NewTransfer, Transition, TransferFailure, TransferStatus, TransferTask,
};
