use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Upload, Direction::Download];

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upload" => Some(Direction::Upload),
            "download" => Some(Direction::Download),
            _ => None,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Direction::Upload => 0,
            Direction::Download => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a transfer.
///
/// ```text
/// WAITING --admit--> RUNNING --complete--> COMPLETED
///    |                  |----fail------> FAILED --retry--> WAITING
///    |                  |----cancel----> CANCELLED
///    +------cancel------------------------^
/// RUNNING --recover--> WAITING   (startup reconciliation only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Waiting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Waiting => "waiting",
            TransferStatus::Running => "running",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(TransferStatus::Waiting),
            "running" => Some(TransferStatus::Running),
            "completed" => Some(TransferStatus::Completed),
            "failed" => Some(TransferStatus::Failed),
            "cancelled" => Some(TransferStatus::Cancelled),
            _ => None,
        }
    }

    /// A stored FAILED row is terminal: a retry moves it back to WAITING in the
    /// same scheduler step that recorded the failure.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, TransferStatus::Waiting | TransferStatus::Running)
    }

    /// The single transition table. Every status change in the crate goes
    /// through here.
    pub fn apply(self, transition: Transition) -> Result<TransferStatus> {
        use TransferStatus::*;
        use Transition::*;

        let next = match (self, transition) {
            (Waiting, Admit) => Running,
            (Running, Complete) => Completed,
            (Running, Fail) => Failed,
            (Waiting, Cancel) | (Running, Cancel) => Cancelled,
            (Failed, Retry) => Waiting,
            (Running, Recover) => Waiting,
            (from, transition) => return Err(Error::InvalidTransition { from, transition }),
        };
        Ok(next)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Admit,
    Complete,
    Fail,
    Cancel,
    Retry,
    Recover,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transition::Admit => "admit",
            Transition::Complete => "complete",
            Transition::Fail => "fail",
            Transition::Cancel => "cancel",
            Transition::Retry => "retry",
            Transition::Recover => "recover",
        };
        f.write_str(s)
    }
}

/// Failure classification persisted as `lastError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Timeout,
    ConnectionReset,
    Network,
    ServerError,
    Rejected,
    QuotaExceeded,
    ChecksumMismatch,
    SizeMismatch,
    LocalFileMissing,
    LocalIo,
    Storage,
}

impl ErrorClass {
    pub fn code(self) -> &'static str {
        match self {
            ErrorClass::Timeout => "transfer.timeout",
            ErrorClass::ConnectionReset => "transfer.connection_reset",
            ErrorClass::Network => "transfer.network",
            ErrorClass::ServerError => "transfer.server_error",
            ErrorClass::Rejected => "transfer.rejected",
            ErrorClass::QuotaExceeded => "transfer.quota_exceeded",
            ErrorClass::ChecksumMismatch => "transfer.checksum_mismatch",
            ErrorClass::SizeMismatch => "transfer.size_mismatch",
            ErrorClass::LocalFileMissing => "local.file_missing",
            ErrorClass::LocalIo => "local.io",
            ErrorClass::Storage => "store.write_failed",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        const ALL: [ErrorClass; 11] = [
            ErrorClass::Timeout,
            ErrorClass::ConnectionReset,
            ErrorClass::Network,
            ErrorClass::ServerError,
            ErrorClass::Rejected,
            ErrorClass::QuotaExceeded,
            ErrorClass::ChecksumMismatch,
            ErrorClass::SizeMismatch,
            ErrorClass::LocalFileMissing,
            ErrorClass::LocalIo,
            ErrorClass::Storage,
        ];
        ALL.into_iter().find(|c| c.code() == code)
    }

    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorClass::Timeout
                | ErrorClass::ConnectionReset
                | ErrorClass::Network
                | ErrorClass::ServerError
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferFailure {
    pub class: ErrorClass,
    pub message: String,
}

impl TransferFailure {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

impl From<&Error> for TransferFailure {
    fn from(e: &Error) -> Self {
        let message = match e {
            Error::Transfer { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self::new(e.class(), message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferTask {
    pub id: String,
    pub direction: Direction,
    pub local_path: PathBuf,
    pub remote_ref: Option<String>,
    pub file_name: String,
    pub file_size: Option<u64>,
    pub status: TransferStatus,
    pub progress: u64,
    pub attempt: u32,
    pub created_at: u64,
    pub updated_at: u64,
    pub last_error: Option<TransferFailure>,
    /// Earliest dispatch time (unix ms) of a task re-enqueued after a failure.
    pub retry_at: Option<u64>,
    /// Opaque blake3 hex identifier of the transferred content.
    pub checksum: Option<String>,
}

impl TransferTask {
    pub fn new(request: NewTransfer, now_ms: u64) -> Self {
        Self {
            id: format!("xfr_{}", uuid::Uuid::new_v4()),
            direction: request.direction,
            local_path: request.local_path,
            remote_ref: request.remote_ref,
            file_name: request.file_name.unwrap_or_default(),
            file_size: request.file_size,
            status: TransferStatus::Waiting,
            progress: 0,
            attempt: 1,
            created_at: now_ms,
            updated_at: now_ms,
            last_error: None,
            retry_at: None,
            checksum: request.checksum,
        }
    }

    pub fn apply(&mut self, transition: Transition) -> Result<()> {
        let next = self.status.apply(transition)?;
        match transition {
            Transition::Admit => self.retry_at = None,
            Transition::Complete => self.last_error = None,
            Transition::Retry => self.attempt = self.attempt.saturating_add(1),
            Transition::Fail | Transition::Cancel | Transition::Recover => {}
        }
        self.status = next;
        Ok(())
    }

    /// Records bytes transferred so far, clamped to the known size.
    pub fn set_progress(&mut self, bytes: u64) {
        self.progress = match self.file_size {
            Some(size) => bytes.min(size),
            None => bytes,
        };
    }

    /// Key under which upload chunks are staged until the server assigns a ref.
    pub fn upload_key(&self) -> &str {
        self.remote_ref.as_deref().unwrap_or(&self.id)
    }

    pub fn local_path_str(&self) -> Result<&str> {
        path_to_utf8(&self.local_path)
    }
}

/// Input to `submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTransfer {
    pub direction: Direction,
    pub local_path: PathBuf,
    #[serde(default)]
    pub remote_ref: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub checksum: Option<String>,
}

impl NewTransfer {
    pub fn upload(local_path: impl Into<PathBuf>) -> Self {
        Self {
            direction: Direction::Upload,
            local_path: local_path.into(),
            remote_ref: None,
            file_name: None,
            file_size: None,
            checksum: None,
        }
    }

    pub fn download(remote_ref: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            direction: Direction::Download,
            local_path: local_path.into(),
            remote_ref: Some(remote_ref.into()),
            file_name: None,
            file_size: None,
            checksum: None,
        }
    }

    pub fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = Some(file_size);
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Checks required fields and fills in what can be derived (file name, and
    /// the size of an upload's source file).
    pub fn validate(mut self) -> Result<Self> {
        self.local_path = normalize_lexically(&self.local_path);
        if self.local_path.as_os_str().is_empty() {
            return Err(validation("local_path must not be empty"));
        }
        path_to_utf8(&self.local_path)?;

        if let Some(r) = &self.remote_ref
            && r.trim().is_empty()
        {
            self.remote_ref = None;
        }

        match self.direction {
            Direction::Download => {
                if self.remote_ref.is_none() {
                    return Err(validation("remote_ref is required for a download"));
                }
            }
            Direction::Upload => {
                let meta = std::fs::metadata(&self.local_path).map_err(|e| {
                    validation(format!(
                        "upload source not readable: {}: {e}",
                        self.local_path.display()
                    ))
                })?;
                if !meta.is_file() {
                    return Err(validation(format!(
                        "upload source is not a regular file: {}",
                        self.local_path.display()
                    )));
                }
                if self.file_size.is_none() {
                    self.file_size = Some(meta.len());
                }
            }
        }

        let derived = self
            .file_name
            .take()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| {
                self.local_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
            });
        match derived {
            Some(name) => self.file_name = Some(name),
            None => return Err(validation("file_name could not be derived from local_path")),
        }

        Ok(self)
    }
}

fn validation(message: impl Into<String>) -> Error {
    Error::Validation {
        message: message.into(),
    }
}

/// Drops `.` and folds `..` into its parent without touching the filesystem,
/// so two spellings of one destination compare equal. Symlinks are not
/// resolved.
pub(crate) fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other),
        }
    }
    out
}

pub(crate) fn path_to_utf8(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| Error::NonUtf8Path {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [TransferStatus; 5] = [
        TransferStatus::Waiting,
        TransferStatus::Running,
        TransferStatus::Completed,
        TransferStatus::Failed,
        TransferStatus::Cancelled,
    ];
    const ALL_TRANSITIONS: [Transition; 6] = [
        Transition::Admit,
        Transition::Complete,
        Transition::Fail,
        Transition::Cancel,
        Transition::Retry,
        Transition::Recover,
    ];

    #[test]
    fn only_defined_edges_are_accepted() {
        use TransferStatus::*;
        use Transition::*;

        let allowed = [
            (Waiting, Admit, Running),
            (Running, Complete, Completed),
            (Running, Fail, Failed),
            (Waiting, Cancel, Cancelled),
            (Running, Cancel, Cancelled),
            (Failed, Retry, Waiting),
            (Running, Recover, Waiting),
        ];

        for from in ALL_STATUSES {
            for t in ALL_TRANSITIONS {
                let expected = allowed
                    .iter()
                    .find(|(f, tr, _)| *f == from && *tr == t)
                    .map(|(_, _, to)| *to);
                match (from.apply(t), expected) {
                    (Ok(got), Some(want)) => assert_eq!(got, want, "{from} --{t}-->"),
                    (Err(Error::InvalidTransition { .. }), None) => {}
                    (other, want) => panic!("{from} --{t}--> gave {other:?}, want {want:?}"),
                }
            }
        }
    }

    #[test]
    fn completed_and_cancelled_accept_nothing() {
        for t in ALL_TRANSITIONS {
            assert!(TransferStatus::Completed.apply(t).is_err());
            assert!(TransferStatus::Cancelled.apply(t).is_err());
        }
    }

    #[test]
    fn retry_increments_attempt_and_complete_clears_error() {
        let mut task = TransferTask::new(
            NewTransfer::download("obj", "/tmp/x").with_file_size(10),
            1,
        );
        task.apply(Transition::Admit).unwrap();
        task.apply(Transition::Fail).unwrap();
        task.last_error = Some(TransferFailure::new(ErrorClass::Timeout, "slow"));
        task.apply(Transition::Retry).unwrap();
        assert_eq!(task.attempt, 2);
        assert_eq!(task.status, TransferStatus::Waiting);

        task.apply(Transition::Admit).unwrap();
        task.apply(Transition::Complete).unwrap();
        assert!(task.last_error.is_none());
    }

    #[test]
    fn progress_is_clamped_to_known_size() {
        let mut task = TransferTask::new(
            NewTransfer::download("obj", "/tmp/x").with_file_size(10),
            1,
        );
        task.set_progress(25);
        assert_eq!(task.progress, 10);
    }

    #[test]
    fn error_class_codes_roundtrip() {
        for class in [
            ErrorClass::Timeout,
            ErrorClass::QuotaExceeded,
            ErrorClass::Storage,
            ErrorClass::SizeMismatch,
        ] {
            assert_eq!(ErrorClass::from_code(class.code()), Some(class));
        }
        assert_eq!(ErrorClass::from_code("nope"), None);
    }

    #[test]
    fn download_requires_remote_ref() {
        let mut req = NewTransfer::download("", "/tmp/out.bin");
        req.remote_ref = Some("  ".to_string());
        let err = req.validate().unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn upload_size_and_name_are_derived() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, [1u8; 42]).unwrap();

        let req = NewTransfer::upload(&path).validate().unwrap();
        assert_eq!(req.file_size, Some(42));
        assert_eq!(req.file_name.as_deref(), Some("photo.jpg"));
    }

    #[test]
    fn upload_of_missing_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = NewTransfer::upload(dir.path().join("missing"))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("not readable"));
    }

    #[test]
    fn dot_segments_are_folded() {
        for (raw, want) in [
            ("/d/x/../a.bin", "/d/a.bin"),
            ("/d/./a.bin", "/d/a.bin"),
            ("/d//x/./../a.bin", "/d/a.bin"),
            ("/../a.bin", "/a.bin"),
            ("../up/a.bin", "../up/a.bin"),
            ("x/../../a.bin", "../a.bin"),
        ] {
            assert_eq!(normalize_lexically(Path::new(raw)), Path::new(want), "{raw}");
        }
    }

    #[test]
    fn validated_download_path_is_normalized() {
        let req = NewTransfer::download("obj", "/d/sub/./../a.bin")
            .validate()
            .unwrap();
        assert_eq!(req.local_path, Path::new("/d/a.bin"));
        assert_eq!(req.file_name.as_deref(), Some("a.bin"));

        let err = NewTransfer::download("obj", "/d/..").validate().unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{err:?}");
    }
}
