use std::future::Future;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::progress::{ProgressSink, TransferEvent};
use crate::remote::{RemoteStorage, UploadMeta};
use crate::store::{TaskStore, WriteRetryPolicy, update_with_retry};
use crate::task::{Direction, ErrorClass, TransferFailure, TransferTask};
use crate::{Error, Result};

pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub chunk_size: u64,
    /// Upper bound on any single remote call.
    pub chunk_timeout: Duration,
    /// Leave a cancelled download's bytes on disk.
    pub keep_partial_on_cancel: bool,
    pub store_write: WriteRetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_timeout: Duration::from_secs(30),
            keep_partial_on_cancel: true,
            store_write: WriteRetryPolicy::default(),
        }
    }
}

/// How one attempt ended. The task is RUNNING in every case; the caller
/// applies the terminal transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed(TransferTask),
    Cancelled(TransferTask),
    Failed(TransferTask, TransferFailure),
}

impl ExecutionOutcome {
    pub fn task(&self) -> &TransferTask {
        match self {
            ExecutionOutcome::Completed(t)
            | ExecutionOutcome::Cancelled(t)
            | ExecutionOutcome::Failed(t, _) => t,
        }
    }
}

enum Step {
    Done,
    Cancelled,
}

/// Moves the bytes of one RUNNING task, chunk by chunk, resuming from its
/// persisted progress.
pub struct TransferExecutor {
    store: Arc<dyn TaskStore>,
    remote: Arc<dyn RemoteStorage>,
    sink: Arc<dyn ProgressSink>,
    config: ExecutorConfig,
}

impl TransferExecutor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        remote: Arc<dyn RemoteStorage>,
        sink: Arc<dyn ProgressSink>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            remote,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub async fn run(&self, mut task: TransferTask, cancel: CancellationToken) -> ExecutionOutcome {
        info!(
            event = "transfer.start",
            task_id = %task.id,
            direction = %task.direction,
            attempt = task.attempt,
            resume_from = task.progress,
            provider = self.remote.provider(),
            "transfer.start"
        );

        let res = match task.direction {
            Direction::Upload => self.upload(&mut task, &cancel).await,
            Direction::Download => self.download(&mut task, &cancel).await,
        };

        match res {
            Ok(Step::Done) => {
                info!(
                    event = "transfer.finished",
                    task_id = %task.id,
                    bytes = task.progress,
                    "transfer.finished"
                );
                ExecutionOutcome::Completed(task)
            }
            Ok(Step::Cancelled) => {
                if task.direction == Direction::Download && !self.config.keep_partial_on_cancel {
                    discard_partial(&task).await;
                }
                info!(
                    event = "transfer.cancelled",
                    task_id = %task.id,
                    bytes = task.progress,
                    "transfer.cancelled"
                );
                ExecutionOutcome::Cancelled(task)
            }
            Err(e) => {
                let failure = TransferFailure::from(&e);
                warn!(
                    event = "transfer.attempt_failed",
                    task_id = %task.id,
                    attempt = task.attempt,
                    error_code = failure.class.code(),
                    error = %e,
                    "transfer.attempt_failed"
                );
                ExecutionOutcome::Failed(task, failure)
            }
        }
    }

    async fn upload(&self, task: &mut TransferTask, cancel: &CancellationToken) -> Result<Step> {
        let mut file = File::open(&task.local_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::transfer(
                    ErrorClass::LocalFileMissing,
                    format!("upload source missing: {}", task.local_path.display()),
                )
            } else {
                Error::Io(e)
            }
        })?;
        let len = file.metadata().await?.len();
        task.file_size = Some(len);
        if task.progress > len {
            task.progress = 0;
        }

        let chunk_size = self.chunk_size();
        let mut buf = vec![0u8; chunk_size];
        let mut hasher = blake3::Hasher::new();
        hash_prefix(&mut file, task.progress, &mut hasher, &mut buf).await?;

        let upload_key = task.upload_key().to_string();
        let mut offset = task.progress;
        while offset < len {
            if cancel.is_cancelled() {
                return Ok(Step::Cancelled);
            }
            let want = usize::try_from((len - offset).min(chunk_size as u64)).unwrap_or(chunk_size);
            file.read_exact(&mut buf[..want]).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Error::transfer(
                        ErrorClass::SizeMismatch,
                        format!("upload source shrank below {len} bytes"),
                    )
                } else {
                    Error::Io(e)
                }
            })?;
            hasher.update(&buf[..want]);

            // A chunk already in flight is finished and committed; cancel is
            // observed at the next boundary.
            self.timed(
                "push_chunk",
                self.remote.push_chunk(&upload_key, offset, buf[..want].to_vec()),
            )
            .await?;

            offset += want as u64;
            task.set_progress(offset);
            self.record_progress(task).await?;
        }

        if cancel.is_cancelled() {
            return Ok(Step::Cancelled);
        }

        let checksum = hasher.finalize().to_hex().to_string();
        if let Some(expected) = &task.checksum
            && !expected.eq_ignore_ascii_case(&checksum)
        {
            return Err(Error::transfer(
                ErrorClass::ChecksumMismatch,
                format!("upload source hashes to {checksum}, expected {expected}"),
            ));
        }

        let meta = UploadMeta {
            upload_key,
            remote_ref: task.remote_ref.clone(),
            file_name: task.file_name.clone(),
            file_size: len,
            checksum: checksum.clone(),
        };
        let remote_ref = self
            .timed("finalize_upload", self.remote.finalize_upload(&meta))
            .await?;
        debug!(
            event = "transfer.upload_finalized",
            task_id = %task.id,
            remote_ref = %remote_ref,
            "transfer.upload_finalized"
        );

        task.remote_ref = Some(remote_ref);
        task.checksum = Some(checksum);
        task.set_progress(len);
        update_with_retry(self.store.as_ref(), task, &self.config.store_write).await?;
        Ok(Step::Done)
    }

    async fn download(&self, task: &mut TransferTask, cancel: &CancellationToken) -> Result<Step> {
        let remote_ref = task.remote_ref.clone().ok_or_else(|| {
            Error::transfer(ErrorClass::Rejected, "download task has no remote_ref")
        })?;

        if let Some(parent) = task.local_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let on_disk = match tokio::fs::metadata(&task.local_path).await {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        // Bytes past the last recorded boundary are not trusted.
        let mut offset = if on_disk >= task.progress {
            task.progress
        } else {
            0
        };
        if offset != task.progress {
            debug!(
                event = "transfer.resume_reset",
                task_id = %task.id,
                recorded = task.progress,
                on_disk,
                "transfer.resume_reset"
            );
            task.progress = offset;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&task.local_path)
            .await?;
        file.set_len(offset).await?;

        let chunk_size = self.chunk_size();
        let mut buf = vec![0u8; chunk_size];
        let mut hasher = blake3::Hasher::new();
        file.seek(SeekFrom::Start(0)).await?;
        hash_prefix(&mut file, offset, &mut hasher, &mut buf).await?;
        drop(buf);

        loop {
            let want = match task.file_size {
                Some(size) if offset >= size => break,
                Some(size) => (size - offset).min(chunk_size as u64),
                None => chunk_size as u64,
            };
            if cancel.is_cancelled() {
                return Ok(Step::Cancelled);
            }

            let mut bytes = self
                .timed("pull_chunk", self.remote.pull_chunk(&remote_ref, offset, want))
                .await?;

            if bytes.is_empty() {
                if let Some(size) = task.file_size {
                    return Err(Error::transfer(
                        ErrorClass::SizeMismatch,
                        format!("remote object ended at {offset} of {size} bytes"),
                    ));
                }
                break;
            }
            bytes.truncate(usize::try_from(want).unwrap_or(usize::MAX));
            let short = (bytes.len() as u64) < want;

            file.write_all(&bytes).await?;
            file.sync_data().await?;
            hasher.update(&bytes);

            offset += bytes.len() as u64;
            task.set_progress(offset);
            self.record_progress(task).await?;

            if short && task.file_size.is_none() {
                break;
            }
        }
        file.sync_all().await?;
        drop(file);

        if task.file_size.is_none() {
            task.file_size = Some(offset);
        }

        if cancel.is_cancelled() {
            return Ok(Step::Cancelled);
        }

        let actual = hasher.finalize().to_hex().to_string();
        let expected = match task.checksum.clone() {
            Some(c) => Some(c),
            None => {
                self.timed("remote_checksum", self.remote.remote_checksum(&remote_ref))
                    .await?
            }
        };
        if let Some(expected) = expected
            && !expected.eq_ignore_ascii_case(&actual)
        {
            return Err(Error::transfer(
                ErrorClass::ChecksumMismatch,
                format!("downloaded content hashes to {actual}, expected {expected}"),
            ));
        }

        task.checksum = Some(actual);
        update_with_retry(self.store.as_ref(), task, &self.config.store_write).await?;
        Ok(Step::Done)
    }

    async fn record_progress(&self, task: &mut TransferTask) -> Result<()> {
        update_with_retry(self.store.as_ref(), task, &self.config.store_write).await?;
        self.sink.publish(TransferEvent::progress(task));
        Ok(())
    }

    fn chunk_size(&self) -> usize {
        usize::try_from(self.config.chunk_size.max(1)).unwrap_or(usize::MAX)
    }

    async fn timed<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.chunk_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::transfer(
                ErrorClass::Timeout,
                format!(
                    "{what} timed out after {}ms",
                    self.config.chunk_timeout.as_millis()
                ),
            )),
        }
    }
}

async fn hash_prefix(
    file: &mut File,
    len: u64,
    hasher: &mut blake3::Hasher,
    buf: &mut [u8],
) -> Result<()> {
    let mut remaining = len;
    while remaining > 0 {
        let want = usize::try_from(remaining.min(buf.len() as u64)).unwrap_or(buf.len());
        file.read_exact(&mut buf[..want]).await?;
        hasher.update(&buf[..want]);
        remaining -= want as u64;
    }
    Ok(())
}

async fn discard_partial(task: &TransferTask) {
    match tokio::fs::remove_file(&task.local_path).await {
        Ok(()) => debug!(
            event = "transfer.partial_removed",
            task_id = %task.id,
            path = %task.local_path.display(),
            "transfer.partial_removed"
        ),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            event = "transfer.partial_remove_failed",
            task_id = %task.id,
            path = %task.local_path.display(),
            error = %e,
            "transfer.partial_remove_failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ProgressBus, TransferEventKind};
    use crate::remote::{InMemoryRemote, blake3_hex};
    use crate::store::InMemoryTaskStore;
    use crate::task::{NewTransfer, Transition};

    struct Harness {
        store: Arc<InMemoryTaskStore>,
        remote: Arc<InMemoryRemote>,
        bus: ProgressBus,
        executor: TransferExecutor,
    }

    fn harness(remote: InMemoryRemote, chunk_size: u64, keep_partial: bool) -> Harness {
        let store = Arc::new(InMemoryTaskStore::new());
        let remote = Arc::new(remote);
        let bus = ProgressBus::new();
        let executor = TransferExecutor::new(
            store.clone(),
            remote.clone(),
            Arc::new(bus.clone()),
            ExecutorConfig {
                chunk_size,
                chunk_timeout: Duration::from_secs(5),
                keep_partial_on_cancel: keep_partial,
                store_write: WriteRetryPolicy {
                    retries: 0,
                    delay: Duration::ZERO,
                },
            },
        );
        Harness {
            store,
            remote,
            bus,
            executor,
        }
    }

    async fn running(store: &InMemoryTaskStore, req: NewTransfer) -> TransferTask {
        let mut task = TransferTask::new(req.validate().unwrap(), 1);
        store.insert(&mut task).await.unwrap();
        task.apply(Transition::Admit).unwrap();
        store.update(&mut task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn upload_sends_every_chunk_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("video.bin");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        let h = harness(InMemoryRemote::new(), 4096, true);
        let mut sub = h.bus.subscribe(None);
        let task = running(&h.store, NewTransfer::upload(&src)).await;

        let outcome = h.executor.run(task, CancellationToken::new()).await;
        let ExecutionOutcome::Completed(task) = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(task.progress, 10_000);
        assert_eq!(task.checksum.as_deref(), Some(blake3_hex(&data).as_str()));

        let remote_ref = task.remote_ref.clone().unwrap();
        assert_eq!(h.remote.object(&remote_ref).await.unwrap(), data);
        assert_eq!(h.remote.pushed_chunks.load(std::sync::atomic::Ordering::Relaxed), 3);

        let mut progress = Vec::new();
        while let Some(ev) = sub.try_recv() {
            assert_eq!(ev.kind, TransferEventKind::Progress);
            progress.push(ev.task.progress);
        }
        assert_eq!(progress, [4096, 8192, 10_000]);

        let stored = h.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 10_000);
    }

    #[tokio::test]
    async fn upload_resumes_from_recorded_progress() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("doc.pdf");
        let data = vec![7u8; 300];
        std::fs::write(&src, &data).unwrap();

        let h = harness(InMemoryRemote::new(), 100, true);
        let mut task = running(&h.store, NewTransfer::upload(&src)).await;
        h.remote
            .push_chunk(task.upload_key(), 0, data[..100].to_vec())
            .await
            .unwrap();
        task.progress = 100;

        let outcome = h.executor.run(task, CancellationToken::new()).await;
        assert!(matches!(outcome, ExecutionOutcome::Completed(_)), "{outcome:?}");
        assert_eq!(h.remote.pushed_chunks.load(std::sync::atomic::Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn missing_upload_source_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("gone.txt");
        std::fs::write(&src, b"x").unwrap();

        let h = harness(InMemoryRemote::new(), 100, true);
        let task = running(&h.store, NewTransfer::upload(&src)).await;
        std::fs::remove_file(&src).unwrap();

        match h.executor.run(task, CancellationToken::new()).await {
            ExecutionOutcome::Failed(_, failure) => {
                assert_eq!(failure.class, ErrorClass::LocalFileMissing)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn download_without_known_size_stops_at_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("nested").join("out.bin");
        let h = harness(InMemoryRemote::new(), 64, true);
        let data = vec![3u8; 150];
        h.remote.put_object("obj-1", data.clone()).await;

        let task = running(&h.store, NewTransfer::download("obj-1", &dst)).await;
        let ExecutionOutcome::Completed(task) = h.executor.run(task, CancellationToken::new()).await
        else {
            panic!("download did not complete");
        };
        assert_eq!(task.file_size, Some(150));
        assert_eq!(std::fs::read(&dst).unwrap(), data);
    }

    #[tokio::test]
    async fn truncated_remote_object_is_a_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out.bin");
        let h = harness(InMemoryRemote::new(), 64, true);
        h.remote.put_object("obj-1", vec![1u8; 100]).await;

        let task = running(
            &h.store,
            NewTransfer::download("obj-1", &dst).with_file_size(200),
        )
        .await;
        match h.executor.run(task, CancellationToken::new()).await {
            ExecutionOutcome::Failed(task, failure) => {
                assert_eq!(failure.class, ErrorClass::SizeMismatch);
                assert_eq!(task.progress, 100);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn download_checksum_is_verified() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out.bin");
        let h = harness(InMemoryRemote::new(), 64, true);
        h.remote.put_object("obj-1", vec![1u8; 10]).await;

        let task = running(
            &h.store,
            NewTransfer::download("obj-1", &dst).with_checksum(blake3_hex(b"other")),
        )
        .await;
        match h.executor.run(task, CancellationToken::new()).await {
            ExecutionOutcome::Failed(_, failure) => {
                assert_eq!(failure.class, ErrorClass::ChecksumMismatch)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_download_discards_partial_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out.bin");
        let h = harness(InMemoryRemote::new(), 64, false);
        h.remote.put_object("obj-1", vec![1u8; 1000]).await;

        let task = running(&h.store, NewTransfer::download("obj-1", &dst)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = h.executor.run(task, cancel).await;
        assert!(matches!(outcome, ExecutionOutcome::Cancelled(_)), "{outcome:?}");
        assert!(!dst.exists());
    }

    #[tokio::test]
    async fn cancel_lands_after_the_in_flight_chunk_commits() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out.bin");
        let h = harness(
            InMemoryRemote::new().with_chunk_delay(Duration::from_millis(300)),
            64,
            true,
        );
        h.remote.put_object("obj-1", vec![5u8; 1000]).await;
        let mut sub = h.bus.subscribe(None);

        let task = running(&h.store, NewTransfer::download("obj-1", &dst)).await;
        let cancel = CancellationToken::new();
        let (outcome, ()) = tokio::join!(h.executor.run(task, cancel.clone()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let ExecutionOutcome::Cancelled(task) = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(task.progress, 64);
        assert_eq!(std::fs::metadata(&dst).unwrap().len(), 64);
        assert_eq!(h.remote.pulled_chunks.load(std::sync::atomic::Ordering::Relaxed), 1);

        let ev = sub.try_recv().expect("committed chunk reports progress");
        assert_eq!(ev.kind, TransferEventKind::Progress);
        assert_eq!(ev.task.progress, 64);
        let stored = h.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 64);
    }

    #[tokio::test]
    async fn transient_remote_error_surfaces_its_class() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out.bin");
        let h = harness(InMemoryRemote::new(), 64, true);
        h.remote.put_object("obj-1", vec![1u8; 100]).await;
        h.remote.fail_next(ErrorClass::ServerError).await;

        let task = running(&h.store, NewTransfer::download("obj-1", &dst)).await;
        match h.executor.run(task, CancellationToken::new()).await {
            ExecutionOutcome::Failed(_, failure) => {
                assert_eq!(failure.class, ErrorClass::ServerError);
                assert!(failure.class.is_transient());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_chunk_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out.bin");
        let mut h = harness(
            InMemoryRemote::new().with_chunk_delay(Duration::from_millis(200)),
            64,
            true,
        );
        h.executor.config.chunk_timeout = Duration::from_millis(20);
        h.remote.put_object("obj-1", vec![1u8; 100]).await;

        let task = running(&h.store, NewTransfer::download("obj-1", &dst)).await;
        match h.executor.run(task, CancellationToken::new()).await {
            ExecutionOutcome::Failed(_, failure) => assert_eq!(failure.class, ErrorClass::Timeout),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
