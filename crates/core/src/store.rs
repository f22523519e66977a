use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::warn;

use crate::db::open_task_db;
use crate::status::now_unix_ms;
use crate::task::{Direction, ErrorClass, TransferFailure, TransferStatus, TransferTask};
use crate::{Error, Result};

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable record of every transfer task, keyed by id.
///
/// Writes stamp `updated_at` on the caller's task when they succeed. Listings
/// are ordered by `created_at`, ties broken by insertion order.
pub trait TaskStore: Send + Sync {
    fn insert<'a>(&'a self, task: &'a mut TransferTask) -> StoreFuture<'a, String>;

    /// Full-row replace.
    fn update<'a>(&'a self, task: &'a mut TransferTask) -> StoreFuture<'a, ()>;

    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<TransferTask>>;

    fn list_by_status<'a>(
        &'a self,
        direction: Direction,
        status: TransferStatus,
    ) -> StoreFuture<'a, Vec<TransferTask>>;

    fn list_by_direction<'a>(&'a self, direction: Direction) -> StoreFuture<'a, Vec<TransferTask>>;

    /// Both directions, for startup reconciliation.
    fn list_by_status_any<'a>(&'a self, status: TransferStatus) -> StoreFuture<'a, Vec<TransferTask>>;

    /// Hard delete. Only explicit user cleanup of terminal tasks reaches here.
    fn delete<'a>(&'a self, id: &'a str) -> StoreFuture<'a, ()>;
}

#[derive(Debug, Clone)]
pub struct WriteRetryPolicy {
    /// Extra attempts after the first failed write.
    pub retries: u32,
    pub delay: Duration,
}

impl Default for WriteRetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_millis(50),
        }
    }
}

/// `update` with a bounded number of retries. `NotFound` is returned at once.
pub async fn update_with_retry(
    store: &dyn TaskStore,
    task: &mut TransferTask,
    policy: &WriteRetryPolicy,
) -> Result<()> {
    let mut retries = 0u32;
    loop {
        match store.update(task).await {
            Ok(()) => return Ok(()),
            Err(e @ Error::NotFound { .. }) => return Err(e),
            Err(e) if retries < policy.retries => {
                retries += 1;
                warn!(
                    event = "store.write_retry",
                    task_id = %task.id,
                    status = %task.status,
                    retry = retries,
                    error = %e,
                    "store.write_retry"
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct SqliteTaskStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteTaskStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = open_task_db(path).await?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, direction, local_path, remote_ref, file_name, file_size, status, progress,
           attempt, created_at, updated_at, last_error, last_error_message, retry_at, checksum
    FROM transfer_tasks
"#;

impl TaskStore for SqliteTaskStore {
    fn insert<'a>(&'a self, task: &'a mut TransferTask) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let now = now_unix_ms();
            let local_path = task.local_path_str()?.to_string();
            let (error_code, error_message) = split_failure(task.last_error.as_ref());

            let res = sqlx::query(
                r#"
                INSERT INTO transfer_tasks (
                    id, direction, local_path, remote_ref, file_name, file_size, status, progress,
                    attempt, created_at, updated_at, last_error, last_error_message, retry_at, checksum
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&task.id)
            .bind(task.direction.as_str())
            .bind(local_path)
            .bind(&task.remote_ref)
            .bind(&task.file_name)
            .bind(task.file_size.map(to_i64))
            .bind(task.status.as_str())
            .bind(to_i64(task.progress))
            .bind(i64::from(task.attempt))
            .bind(to_i64(task.created_at))
            .bind(to_i64(now))
            .bind(error_code)
            .bind(error_message)
            .bind(task.retry_at.map(to_i64))
            .bind(&task.checksum)
            .execute(&self.pool)
            .await;

            if let Err(e) = res {
                let unique = matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation());
                if unique {
                    return Err(Error::DuplicateId {
                        id: task.id.clone(),
                    });
                }
                return Err(Error::Sqlite(e));
            }

            task.updated_at = now;
            Ok(task.id.clone())
        })
    }

    fn update<'a>(&'a self, task: &'a mut TransferTask) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let now = now_unix_ms();
            let local_path = task.local_path_str()?.to_string();
            let (error_code, error_message) = split_failure(task.last_error.as_ref());

            let res = sqlx::query(
                r#"
                UPDATE transfer_tasks
                SET direction = ?, local_path = ?, remote_ref = ?, file_name = ?, file_size = ?,
                    status = ?, progress = ?, attempt = ?, created_at = ?, updated_at = ?,
                    last_error = ?, last_error_message = ?, retry_at = ?, checksum = ?
                WHERE id = ?
                "#,
            )
            .bind(task.direction.as_str())
            .bind(local_path)
            .bind(&task.remote_ref)
            .bind(&task.file_name)
            .bind(task.file_size.map(to_i64))
            .bind(task.status.as_str())
            .bind(to_i64(task.progress))
            .bind(i64::from(task.attempt))
            .bind(to_i64(task.created_at))
            .bind(to_i64(now))
            .bind(error_code)
            .bind(error_message)
            .bind(task.retry_at.map(to_i64))
            .bind(&task.checksum)
            .bind(&task.id)
            .execute(&self.pool)
            .await?;

            if res.rows_affected() == 0 {
                return Err(Error::NotFound {
                    id: task.id.clone(),
                });
            }
            task.updated_at = now;
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<TransferTask>> {
        Box::pin(async move {
            let sql = format!("{SELECT_COLUMNS} WHERE id = ?");
            let row = sqlx::query(&sql)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(task_from_row).transpose()
        })
    }

    fn list_by_status<'a>(
        &'a self,
        direction: Direction,
        status: TransferStatus,
    ) -> StoreFuture<'a, Vec<TransferTask>> {
        Box::pin(async move {
            let sql = format!(
                "{SELECT_COLUMNS} WHERE direction = ? AND status = ? ORDER BY created_at ASC, rowid ASC"
            );
            let rows = sqlx::query(&sql)
                .bind(direction.as_str())
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(task_from_row).collect()
        })
    }

    fn list_by_direction<'a>(&'a self, direction: Direction) -> StoreFuture<'a, Vec<TransferTask>> {
        Box::pin(async move {
            let sql =
                format!("{SELECT_COLUMNS} WHERE direction = ? ORDER BY created_at ASC, rowid ASC");
            let rows = sqlx::query(&sql)
                .bind(direction.as_str())
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(task_from_row).collect()
        })
    }

    fn list_by_status_any<'a>(&'a self, status: TransferStatus) -> StoreFuture<'a, Vec<TransferTask>> {
        Box::pin(async move {
            let sql = format!("{SELECT_COLUMNS} WHERE status = ? ORDER BY created_at ASC, rowid ASC");
            let rows = sqlx::query(&sql)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(task_from_row).collect()
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let res = sqlx::query("DELETE FROM transfer_tasks WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            if res.rows_affected() == 0 {
                return Err(Error::NotFound { id: id.to_string() });
            }
            Ok(())
        })
    }
}

fn task_from_row(row: &SqliteRow) -> Result<TransferTask> {
    let id: String = row.try_get("id")?;

    let direction: String = row.try_get("direction")?;
    let direction = Direction::parse(&direction)
        .ok_or_else(|| corrupt(&id, format!("unknown direction {direction:?}")))?;

    let status: String = row.try_get("status")?;
    let status = TransferStatus::parse(&status)
        .ok_or_else(|| corrupt(&id, format!("unknown status {status:?}")))?;

    let local_path: String = row.try_get("local_path")?;
    let file_size: Option<i64> = row.try_get("file_size")?;
    let progress: i64 = row.try_get("progress")?;
    let attempt: i64 = row.try_get("attempt")?;
    let created_at: i64 = row.try_get("created_at")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    let retry_at: Option<i64> = row.try_get("retry_at")?;

    let last_error_code: Option<String> = row.try_get("last_error")?;
    let last_error_message: Option<String> = row.try_get("last_error_message")?;
    let last_error = match last_error_code {
        Some(code) => {
            let class = ErrorClass::from_code(&code)
                .ok_or_else(|| corrupt(&id, format!("unknown error class {code:?}")))?;
            Some(TransferFailure::new(class, last_error_message.unwrap_or_default()))
        }
        None => None,
    };

    Ok(TransferTask {
        direction,
        local_path: PathBuf::from(local_path),
        remote_ref: row.try_get("remote_ref")?,
        file_name: row.try_get("file_name")?,
        file_size: file_size.map(to_u64),
        status,
        progress: to_u64(progress),
        attempt: u32::try_from(attempt).map_err(|_| corrupt(&id, "attempt out of range"))?,
        created_at: to_u64(created_at),
        updated_at: to_u64(updated_at),
        last_error,
        retry_at: retry_at.map(to_u64),
        checksum: row.try_get("checksum")?,
        id,
    })
}

fn split_failure(failure: Option<&TransferFailure>) -> (Option<&'static str>, Option<String>) {
    match failure {
        Some(f) => (Some(f.class.code()), Some(f.message.clone())),
        None => (None, None),
    }
}

fn corrupt(id: &str, message: impl std::fmt::Display) -> Error {
    Error::CorruptRecord {
        message: format!("task {id}: {message}"),
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

#[derive(Debug, Default)]
struct InMemoryState {
    next_seq: u64,
    rows: HashMap<String, (u64, TransferTask)>,
}

impl InMemoryState {
    fn sorted<'s>(&'s self, keep: impl Fn(&TransferTask) -> bool) -> Vec<TransferTask> {
        let mut rows: Vec<&'s (u64, TransferTask)> =
            self.rows.values().filter(|(_, t)| keep(t)).collect();
        rows.sort_by_key(|(seq, t)| (t.created_at, *seq));
        rows.into_iter().map(|(_, t)| t.clone()).collect()
    }
}

/// Non-durable store with the same contract, for tests and ephemeral queues.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    inner: Mutex<InMemoryState>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl TaskStore for InMemoryTaskStore {
    fn insert<'a>(&'a self, task: &'a mut TransferTask) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            if state.rows.contains_key(&task.id) {
                return Err(Error::DuplicateId {
                    id: task.id.clone(),
                });
            }
            task.updated_at = now_unix_ms();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.rows.insert(task.id.clone(), (seq, task.clone()));
            Ok(task.id.clone())
        })
    }

    fn update<'a>(&'a self, task: &'a mut TransferTask) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            let Some((_, row)) = state.rows.get_mut(&task.id) else {
                return Err(Error::NotFound {
                    id: task.id.clone(),
                });
            };
            task.updated_at = now_unix_ms();
            *row = task.clone();
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<TransferTask>> {
        Box::pin(async move { Ok(self.inner.lock().await.rows.get(id).map(|(_, t)| t.clone())) })
    }

    fn list_by_status<'a>(
        &'a self,
        direction: Direction,
        status: TransferStatus,
    ) -> StoreFuture<'a, Vec<TransferTask>> {
        Box::pin(async move {
            let state = self.inner.lock().await;
            Ok(state.sorted(|t| t.direction == direction && t.status == status))
        })
    }

    fn list_by_direction<'a>(&'a self, direction: Direction) -> StoreFuture<'a, Vec<TransferTask>> {
        Box::pin(async move {
            let state = self.inner.lock().await;
            Ok(state.sorted(|t| t.direction == direction))
        })
    }

    fn list_by_status_any<'a>(&'a self, status: TransferStatus) -> StoreFuture<'a, Vec<TransferTask>> {
        Box::pin(async move {
            let state = self.inner.lock().await;
            Ok(state.sorted(|t| t.status == status))
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match self.inner.lock().await.rows.remove(id) {
                Some(_) => Ok(()),
                None => Err(Error::NotFound { id: id.to_string() }),
            }
        })
    }
}
