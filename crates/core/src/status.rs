use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::task::{Direction, TransferStatus, TransferTask};

pub const STATUS_SCHEMA_VERSION: u32 = 1;

/// Wall-clock milliseconds that never go backwards within a process.
pub fn now_unix_ms() -> u64 {
    static LAST_UNIX_MS: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut prev = LAST_UNIX_MS.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev);
        match LAST_UNIX_MS.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => prev = current,
        }
    }
}

pub fn status_json_path(data_dir: &Path) -> PathBuf {
    data_dir.join("status").join("status.json")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionSummary {
    pub waiting: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub bytes_done: u64,
    /// Sum of known sizes of active tasks.
    pub bytes_total: u64,
}

impl DirectionSummary {
    fn add(&mut self, task: &TransferTask) {
        match task.status {
            TransferStatus::Waiting => self.waiting += 1,
            TransferStatus::Running => self.running += 1,
            TransferStatus::Completed => self.completed += 1,
            TransferStatus::Failed => self.failed += 1,
            TransferStatus::Cancelled => self.cancelled += 1,
        }
        if task.status.is_active() {
            self.bytes_done += task.progress;
            self.bytes_total += task.file_size.unwrap_or(task.progress);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    #[serde(rename = "type")]
    pub type_: String, // "queue.snapshot"
    pub schema_version: u32,
    pub generated_at: u64,
    pub uploads: DirectionSummary,
    pub downloads: DirectionSummary,
    #[serde(default)]
    pub tasks: Vec<TransferTask>,
}

impl QueueSnapshot {
    pub fn from_tasks(tasks: Vec<TransferTask>, generated_at: u64) -> Self {
        let mut uploads = DirectionSummary::default();
        let mut downloads = DirectionSummary::default();
        for t in &tasks {
            match t.direction {
                Direction::Upload => uploads.add(t),
                Direction::Download => downloads.add(t),
            }
        }
        Self {
            type_: "queue.snapshot".to_string(),
            schema_version: STATUS_SCHEMA_VERSION,
            generated_at,
            uploads,
            downloads,
            tasks,
        }
    }

    pub fn summary(&self, direction: Direction) -> &DirectionSummary {
        match direction {
            Direction::Upload => &self.uploads,
            Direction::Download => &self.downloads,
        }
    }
}

pub fn read_queue_snapshot_json(path: &Path) -> std::io::Result<QueueSnapshot> {
    let mut f = File::open(path)?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    let snap: QueueSnapshot = serde_json::from_slice(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(snap)
}

#[derive(Debug, Clone, Copy)]
pub struct StatusWriteOptions {
    pub fsync_file: bool,
    pub fsync_dir: bool,
}

impl Default for StatusWriteOptions {
    fn default() -> Self {
        Self {
            fsync_file: true,
            fsync_dir: true,
        }
    }
}

pub fn write_queue_snapshot_json_atomic(
    path: &Path,
    snapshot: &QueueSnapshot,
) -> std::io::Result<()> {
    write_queue_snapshot_json_atomic_with_options(path, snapshot, StatusWriteOptions::default())
}

pub fn write_queue_snapshot_json_atomic_with_options(
    path: &Path,
    snapshot: &QueueSnapshot,
    options: StatusWriteOptions,
) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension(format!("json.tmp.{}", std::process::id()));
    let data = serde_json::to_vec(snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    f.write_all(&data)?;
    if options.fsync_file {
        f.sync_all()?;
    }
    drop(f);

    std::fs::rename(&tmp, path)?;

    // Best-effort directory sync (ignored on platforms where it isn't supported).
    if options.fsync_dir
        && let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::NewTransfer;

    fn task(direction: Direction, status: TransferStatus, progress: u64, size: u64) -> TransferTask {
        let req = match direction {
            Direction::Upload => NewTransfer::upload("/tmp/a.bin").with_file_size(size),
            Direction::Download => NewTransfer::download("obj", "/tmp/b.bin").with_file_size(size),
        };
        let mut t = TransferTask::new(req.with_file_name("x"), 1);
        t.status = status;
        t.progress = progress;
        t
    }

    #[test]
    fn now_unix_ms_is_monotonic() {
        let a = now_unix_ms();
        let b = now_unix_ms();
        assert!(b >= a);
    }

    #[test]
    fn summary_counts_by_direction_and_status() {
        let snap = QueueSnapshot::from_tasks(
            vec![
                task(Direction::Upload, TransferStatus::Running, 5, 10),
                task(Direction::Upload, TransferStatus::Waiting, 0, 7),
                task(Direction::Upload, TransferStatus::Completed, 3, 3),
                task(Direction::Download, TransferStatus::Failed, 1, 9),
            ],
            42,
        );

        assert_eq!(snap.uploads.running, 1);
        assert_eq!(snap.uploads.waiting, 1);
        assert_eq!(snap.uploads.completed, 1);
        assert_eq!(snap.uploads.bytes_done, 5);
        assert_eq!(snap.uploads.bytes_total, 17);
        assert_eq!(snap.summary(Direction::Download).failed, 1);
        assert_eq!(snap.downloads.bytes_total, 0);
    }

    #[test]
    fn write_then_read_queue_snapshot_json_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = status_json_path(dir.path());

        let snap = QueueSnapshot::from_tasks(
            vec![task(Direction::Download, TransferStatus::Waiting, 0, 4)],
            123,
        );
        write_queue_snapshot_json_atomic(&path, &snap).unwrap();
        let got = read_queue_snapshot_json(&path).unwrap();

        assert_eq!(got.type_, "queue.snapshot");
        assert_eq!(got.generated_at, 123);
        assert_eq!(got.tasks.len(), 1);
        assert_eq!(got.downloads.waiting, 1);
    }

    #[test]
    fn deserializes_without_task_list() {
        let json = r#"
{
  "type": "queue.snapshot",
  "schemaVersion": 1,
  "generatedAt": 1700000000000,
  "uploads": { "waiting": 1, "running": 0, "completed": 0, "failed": 0, "cancelled": 0, "bytesDone": 0, "bytesTotal": 10 },
  "downloads": { "waiting": 0, "running": 0, "completed": 2, "failed": 0, "cancelled": 0, "bytesDone": 0, "bytesTotal": 0 }
}
"#;
        let snap: QueueSnapshot = serde_json::from_str(json).unwrap();
        assert!(snap.tasks.is_empty());
        assert_eq!(snap.downloads.completed, 2);
    }
}
