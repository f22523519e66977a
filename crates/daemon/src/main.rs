use std::path::{Path, PathBuf};
use std::sync::Arc;

use cumulus_core::config as settings_config;
use cumulus_core::control::control_ipc_socket_path;
use cumulus_core::logging::{init_logging, start_session_log};
use cumulus_core::status::{
    StatusWriteOptions, status_json_path, write_queue_snapshot_json_atomic_with_options,
};
use cumulus_core::{APP_NAME, HttpRemote, RemoteStorage, TransferRepository};
use tokio::time::{Duration, sleep};

mod control_ipc;

const CONFIG_DIR_ENV: &str = "CUMULUS_CONFIG_DIR";
const DATA_DIR_ENV: &str = "CUMULUS_DATA_DIR";
const REMOTE_TOKEN_ENV: &str = "CUMULUS_REMOTE_TOKEN";

/// Progress events arriving closer together than this share one status write.
const STATUS_MIN_INTERVAL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_root = env_dir(CONFIG_DIR_ENV).unwrap_or_else(default_config_dir);
    let data_root = env_dir(DATA_DIR_ENV).unwrap_or_else(default_data_dir);

    let _session_log = match start_session_log("daemon", &data_root) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!(
                "WARN: log.session_open_failed: dir={} error={}",
                data_root.display(),
                e
            );
            init_logging();
            None
        }
    };

    let settings = settings_config::load_settings(&config_root)?;
    let token = std::env::var(REMOTE_TOKEN_ENV)
        .ok()
        .filter(|t| !t.trim().is_empty());
    let remote_config = settings
        .http_remote_config(token)
        .ok_or("remote.base_url is not configured")?;
    let remote = Arc::new(HttpRemote::new(remote_config)?);

    tracing::info!(
        event = "daemon.start",
        config_dir = %config_root.display(),
        data_dir = %data_root.display(),
        provider = remote.provider(),
        max_concurrent_uploads = settings.transfers.max_concurrent_uploads,
        max_concurrent_downloads = settings.transfers.max_concurrent_downloads,
        "daemon.start"
    );

    let repo = TransferRepository::open(&settings, &data_root, remote).await?;
    let status_task = tokio::spawn(status_writer_loop(
        repo.clone(),
        status_json_path(&data_root),
    ));

    let socket_path = control_ipc_socket_path(&data_root);
    let server = match control_ipc::spawn_control_ipc_server(socket_path.clone(), repo.clone()) {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(
                event = "control.ipc_bind_failed",
                error = %e,
                path = %socket_path.display(),
                "control.ipc_bind_failed"
            );
            repo.shutdown().await?;
            let _ = status_task.await;
            return Err(e.into());
        }
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!(event = "daemon.shutdown", "daemon.shutdown");

    server.shutdown().await;
    repo.shutdown().await?;
    let _ = status_task.await;
    Ok(())
}

/// Mirrors the queue into `status.json` until the repository shuts down.
async fn status_writer_loop(repo: TransferRepository, status_path: PathBuf) {
    let mut events = repo.observe_all();
    loop {
        write_status(&repo, &status_path).await;
        if events.recv().await.is_none() {
            break;
        }
        sleep(STATUS_MIN_INTERVAL).await;
        while events.try_recv().is_some() {}
    }
    write_status(&repo, &status_path).await;
}

async fn write_status(repo: &TransferRepository, status_path: &Path) {
    let snapshot = match repo.snapshot().await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(event = "status.snapshot_failed", error = %e, "status.snapshot_failed");
            return;
        }
    };

    // Readers only need a whole file, not a durable one.
    let options = StatusWriteOptions {
        fsync_file: false,
        fsync_dir: false,
    };
    let path = status_path.to_path_buf();
    let res = tokio::task::spawn_blocking(move || {
        write_queue_snapshot_json_atomic_with_options(&path, &snapshot, options)
    })
    .await;
    let err = match res {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(e) => e.to_string(),
    };
    tracing::warn!(
        event = "status.write_failed",
        error = %err,
        path = %status_path.display(),
        "status.write_failed"
    );
}

fn env_dir(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join("Library")
        .join("Application Support")
        .join(APP_NAME)
}

fn default_data_dir() -> PathBuf {
    default_config_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    use cumulus_core::status::read_queue_snapshot_json;
    use cumulus_core::{
        Direction, InMemoryRemote, InMemoryTaskStore, NewTransfer, SchedulerConfig,
        TransferStatus,
    };

    #[tokio::test]
    async fn status_file_follows_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let status_path = status_json_path(dir.path());
        let remote = Arc::new(InMemoryRemote::new());
        remote.put_object("obj-1", vec![9u8; 64]).await;

        let repo = TransferRepository::start(
            Arc::new(InMemoryTaskStore::new()),
            remote,
            SchedulerConfig::default(),
        )
        .await
        .unwrap();
        let writer = tokio::spawn(status_writer_loop(repo.clone(), status_path.clone()));

        let task = repo
            .submit(NewTransfer::download("obj-1", dir.path().join("a.bin")))
            .await
            .unwrap();

        let mut completed = false;
        for _ in 0..200 {
            if let Ok(snap) = read_queue_snapshot_json(&status_path)
                && snap.summary(Direction::Download).completed == 1
            {
                assert_eq!(snap.tasks[0].id, task.id);
                assert_eq!(snap.tasks[0].status, TransferStatus::Completed);
                completed = true;
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(completed);

        repo.shutdown().await.unwrap();
        writer.await.unwrap();
    }

    #[test]
    fn blank_env_dir_is_ignored() {
        assert!(env_dir("CUMULUS_TEST_UNSET_DIR_VARIABLE").is_none());
    }
}
