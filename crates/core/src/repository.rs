use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Settings;
use crate::progress::{ProgressBus, Subscription};
use crate::remote::RemoteStorage;
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
use crate::status::{QueueSnapshot, now_unix_ms};
use crate::store::{SqliteTaskStore, TaskStore};
use crate::task::{Direction, NewTransfer, TransferTask};
use crate::Result;

pub fn task_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("transfers.sqlite")
}

/// The queue as seen by everything outside this crate.
///
/// Mutations are serialized through the scheduler loop. Reads go straight to
/// the store and may lag an in-flight transition by one step.
#[derive(Clone)]
pub struct TransferRepository {
    store: Arc<dyn TaskStore>,
    bus: ProgressBus,
    scheduler: SchedulerHandle,
}

impl TransferRepository {
    /// Reconciles leftovers from a previous run and starts scheduling.
    pub async fn start(
        store: Arc<dyn TaskStore>,
        remote: Arc<dyn RemoteStorage>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        let bus = ProgressBus::new();
        let scheduler = Scheduler::new(store.clone(), remote, bus.clone(), config)
            .start()
            .await?;
        Ok(Self {
            store,
            bus,
            scheduler,
        })
    }

    /// Durable queue at `<data_dir>/transfers.sqlite`.
    pub async fn open(
        settings: &Settings,
        data_dir: &Path,
        remote: Arc<dyn RemoteStorage>,
    ) -> Result<Self> {
        let store = SqliteTaskStore::open(&task_db_path(data_dir)).await?;
        Self::start(Arc::new(store), remote, settings.scheduler_config()).await
    }

    pub async fn submit(&self, request: NewTransfer) -> Result<TransferTask> {
        self.scheduler.submit(request).await
    }

    pub async fn cancel(&self, id: &str) -> Result<TransferTask> {
        self.scheduler.cancel(id).await
    }

    /// Hard delete of a terminal task.
    pub async fn remove(&self, id: &str) -> Result<TransferTask> {
        self.scheduler.remove(id).await
    }

    pub async fn resubmit(&self, id: &str) -> Result<TransferTask> {
        self.scheduler.resubmit(id).await
    }

    pub async fn clear_finished(&self, direction: Direction) -> Result<usize> {
        self.scheduler.clear_finished(direction).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<TransferTask>> {
        self.store.get(id).await
    }

    pub async fn list(&self, direction: Option<Direction>) -> Result<Vec<TransferTask>> {
        match direction {
            Some(d) => self.store.list_by_direction(d).await,
            None => {
                let mut all = Vec::new();
                for d in Direction::ALL {
                    all.extend(self.store.list_by_direction(d).await?);
                }
                Ok(all)
            }
        }
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        Ok(QueueSnapshot::from_tasks(self.list(None).await?, now_unix_ms()))
    }

    pub fn observe_by_direction(&self, direction: Direction) -> Subscription {
        self.bus.subscribe(Some(direction))
    }

    pub fn observe_all(&self) -> Subscription {
        self.bus.subscribe(None)
    }

    /// Stops scheduling. Running tasks stay RUNNING in the store and resume
    /// after the next start. Observers see the end of their stream.
    pub async fn shutdown(&self) -> Result<()> {
        let res = self.scheduler.shutdown().await;
        self.bus.close();
        res
    }
}
