use std::path::PathBuf;

use crate::task::{ErrorClass, Transition, TransferStatus};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("validation failed: {message}")]
    Validation { message: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("task not found: {id}")]
    NotFound { id: String },

    #[error("duplicate task id: {id}")]
    DuplicateId { id: String },

    #[error("task {id} is {status}; operation requires a terminal task")]
    InvalidState { id: String, status: TransferStatus },

    #[error("invalid transition: {from} --{transition}-->")]
    InvalidTransition {
        from: TransferStatus,
        transition: Transition,
    },

    #[error("transfer error ({}): {message}", class.code())]
    Transfer { class: ErrorClass, message: String },

    #[error("corrupt task record: {message}")]
    CorruptRecord { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("sqlite migrate error: {0}")]
    SqliteMigrate(#[from] sqlx::migrate::MigrateError),

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },

    #[error("scheduler is not running")]
    SchedulerClosed,
}

impl Error {
    pub fn transfer(class: ErrorClass, message: impl Into<String>) -> Self {
        Error::Transfer {
            class,
            message: message.into(),
        }
    }

    /// Maps any error surfaced while executing a transfer onto the class recorded
    /// in `lastError`.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Transfer { class, .. } => *class,
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ErrorClass::LocalFileMissing
            }
            Error::Io(_) | Error::NonUtf8Path { .. } => ErrorClass::LocalIo,
            Error::Sqlite(_)
            | Error::SqliteMigrate(_)
            | Error::CorruptRecord { .. }
            | Error::NotFound { .. }
            | Error::DuplicateId { .. } => ErrorClass::Storage,
            _ => ErrorClass::Rejected,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class().is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_is_local_file_missing() {
        let e = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(e.class(), ErrorClass::LocalFileMissing);
        assert!(!e.is_transient());
    }

    #[test]
    fn transfer_error_keeps_its_class() {
        let e = Error::transfer(ErrorClass::Timeout, "chunk timed out");
        assert_eq!(e.class(), ErrorClass::Timeout);
        assert!(e.is_transient());
        assert!(e.to_string().contains("transfer.timeout"));
    }

    #[test]
    fn sqlite_errors_are_storage_class() {
        let e = Error::Sqlite(sqlx::Error::PoolClosed);
        assert_eq!(e.class(), ErrorClass::Storage);
    }
}
