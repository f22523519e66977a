use std::path::PathBuf;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, oneshot};

use cumulus_core::TransferRepository;
use cumulus_core::control::{
    ClearFinishedParams, ClearFinishedResult, ControlError, ControlRequest, ControlResponse,
    ListParams, METHOD_CANCEL, METHOD_CLEAR_FINISHED, METHOD_GET, METHOD_LIST, METHOD_REMOVE,
    METHOD_RESUBMIT, METHOD_SUBMIT, SubmitParams, TaskIdParams,
};

const MAX_REQUEST_LINE_BYTES: usize = 64 * 1024;

pub struct ControlIpcServerHandle {
    socket_path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ControlIpcServerHandle {
    pub async fn shutdown(self) {
        let mut this = self;
        if let Some(tx) = this.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = this.task.take() {
            let _ = task.await;
        }
        let _ = std::fs::remove_file(&this.socket_path);
    }
}

impl Drop for ControlIpcServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

fn restrict_permissions(path: &std::path::Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
            tracing::error!(
                event = "control.ipc_permissions_failed",
                error = %e,
                path = %path.display(),
                "control.ipc_permissions_failed"
            );
            return Err(e);
        }
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

/// One request line in, one response line out, per connection.
pub fn spawn_control_ipc_server(
    socket_path: PathBuf,
    repo: TransferRepository,
) -> std::io::Result<ControlIpcServerHandle> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
        restrict_permissions(parent, 0o700)?;
    }

    match std::fs::remove_file(&socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(&socket_path)?;
    if let Err(e) = restrict_permissions(&socket_path, 0o600) {
        drop(listener);
        let _ = std::fs::remove_file(&socket_path);
        return Err(e);
    }

    let handle_socket_path = socket_path.clone();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let (shutdown_broadcast, _) = broadcast::channel::<()>(8);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    let _ = shutdown_broadcast.send(());
                    break;
                }
                accept = listener.accept() => {
                    let (stream, _) = match accept {
                        Ok(x) => x,
                        Err(e) => {
                            tracing::warn!(
                                event = "control.ipc_accept_failed",
                                error = %e,
                                path = %socket_path.display(),
                                "control.ipc_accept_failed"
                            );
                            continue;
                        }
                    };

                    let mut shutdown = shutdown_broadcast.subscribe();
                    let repo = repo.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_control_ipc_client(stream, &repo, &mut shutdown).await {
                            tracing::debug!(event = "control.ipc_client_failed", error = %e, "control.ipc_client_failed");
                        }
                    });
                }
            }
        }
    });

    Ok(ControlIpcServerHandle {
        socket_path: handle_socket_path,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

async fn handle_control_ipc_client(
    stream: UnixStream,
    repo: &TransferRepository,
    shutdown: &mut broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let (r, w) = stream.into_split();
    let mut w = BufWriter::new(w);

    // One byte over the limit is enough to tell an oversized line apart.
    let mut r = BufReader::new(r).take(MAX_REQUEST_LINE_BYTES as u64 + 1);
    let mut buf: Vec<u8> = Vec::new();
    tokio::select! {
        res = r.read_until(b'\n', &mut buf) => {
            res?;
        }
        _ = shutdown.recv() => return Ok(()),
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.is_empty() {
        return Ok(());
    }

    let resp = match decode_request(buf) {
        Ok(req) => {
            tokio::select! {
                resp = handle_request(&req, repo) => resp,
                _ = shutdown.recv() => ControlResponse::err(
                    req.id.clone(),
                    ControlError::unavailable("daemon is shutting down", serde_json::json!({})),
                ),
            }
        }
        Err(e) => ControlResponse::err("unknown", e),
    };
    write_json_line(&mut w, &resp).await
}

fn decode_request(buf: Vec<u8>) -> Result<ControlRequest, ControlError> {
    if buf.len() > MAX_REQUEST_LINE_BYTES {
        return Err(ControlError::invalid_request(
            "request too large",
            serde_json::json!({ "maxBytes": MAX_REQUEST_LINE_BYTES }),
        ));
    }
    let line = String::from_utf8(buf)
        .map_err(|_| ControlError::invalid_request("invalid utf-8", serde_json::json!({})))?;
    serde_json::from_str(line.trim_end()).map_err(|e| {
        ControlError::invalid_request("invalid json", serde_json::json!({ "error": e.to_string() }))
    })
}

fn parse_params<T: DeserializeOwned>(req: &ControlRequest) -> Result<T, ControlError> {
    serde_json::from_value(req.params.clone()).map_err(|e| {
        ControlError::invalid_request(
            "invalid params",
            serde_json::json!({ "error": e.to_string() }),
        )
    })
}

fn to_result<T: Serialize>(
    res: cumulus_core::Result<T>,
) -> Result<serde_json::Value, ControlError> {
    let value = res.map_err(|e| ControlError::from(&e))?;
    Ok(serde_json::to_value(value).unwrap_or(serde_json::json!({})))
}

async fn handle_request(req: &ControlRequest, repo: &TransferRepository) -> ControlResponse {
    if req.type_ != "control.request" || req.id.trim().is_empty() || req.method.trim().is_empty() {
        return ControlResponse::err(
            req.id.clone(),
            ControlError::invalid_request(
                "invalid request envelope",
                serde_json::json!({
                    "type": req.type_,
                    "method": req.method,
                }),
            ),
        );
    }

    tracing::debug!(event = "control.request", id = %req.id, method = %req.method, "control.request");
    match dispatch(req, repo).await {
        Ok(v) => ControlResponse::ok(req.id.clone(), v),
        Err(e) => {
            tracing::info!(
                event = "control.request_failed",
                id = %req.id,
                method = %req.method,
                code = %e.code,
                "control.request_failed"
            );
            ControlResponse::err(req.id.clone(), e)
        }
    }
}

async fn dispatch(
    req: &ControlRequest,
    repo: &TransferRepository,
) -> Result<serde_json::Value, ControlError> {
    match req.method.as_str() {
        METHOD_SUBMIT => {
            let params: SubmitParams = parse_params(req)?;
            to_result(repo.submit(params).await)
        }
        METHOD_CANCEL => {
            let params: TaskIdParams = parse_params(req)?;
            to_result(repo.cancel(&params.id).await)
        }
        METHOD_REMOVE => {
            let params: TaskIdParams = parse_params(req)?;
            to_result(repo.remove(&params.id).await)
        }
        METHOD_RESUBMIT => {
            let params: TaskIdParams = parse_params(req)?;
            to_result(repo.resubmit(&params.id).await)
        }
        METHOD_GET => {
            let params: TaskIdParams = parse_params(req)?;
            match repo.get(&params.id).await {
                Ok(Some(task)) => to_result(Ok(task)),
                Ok(None) => Err(ControlError::from(&cumulus_core::Error::NotFound {
                    id: params.id,
                })),
                Err(e) => Err(ControlError::from(&e)),
            }
        }
        METHOD_LIST => {
            let params: ListParams = if req.params.is_null() {
                ListParams::default()
            } else {
                parse_params(req)?
            };
            let tasks = to_result(repo.list(params.direction).await)?;
            Ok(serde_json::json!({ "tasks": tasks }))
        }
        METHOD_CLEAR_FINISHED => {
            let params: ClearFinishedParams = parse_params(req)?;
            let removed = repo
                .clear_finished(params.direction)
                .await
                .map_err(|e| ControlError::from(&e))?;
            to_result(Ok(ClearFinishedResult { removed }))
        }
        _ => Err(ControlError::method_not_found(
            "method not found",
            serde_json::json!({ "method": req.method }),
        )),
    }
}

async fn write_json_line(
    w: &mut BufWriter<tokio::net::unix::OwnedWriteHalf>,
    v: &ControlResponse,
) -> std::io::Result<()> {
    let line = serde_json::to_string(v).map_err(|e| std::io::Error::other(e.to_string()))?;
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    w.flush().await?;
    Ok(())
}
