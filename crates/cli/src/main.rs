use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use cumulus_core::control::{
    ClearFinishedParams, ClearFinishedResult, ControlError, ControlRequest, ControlResponse,
    ListParams, METHOD_CANCEL, METHOD_CLEAR_FINISHED, METHOD_GET, METHOD_LIST, METHOD_REMOVE,
    METHOD_RESUBMIT, METHOD_SUBMIT, TaskIdParams, control_ipc_socket_path,
};
use cumulus_core::status::{QueueSnapshot, read_queue_snapshot_json, status_json_path};
use cumulus_core::{APP_NAME, Direction, NewTransfer, TransferTask};

const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "cumulus")]
#[command(about = "Cumulus transfer queue CLI", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Queue a local file for upload.
    Upload {
        path: PathBuf,
        #[arg(long)]
        file_name: Option<String>,
        /// Expected blake3 hex of the file.
        #[arg(long)]
        checksum: Option<String>,
    },
    /// Queue a remote object for download into `dest`.
    Download {
        remote_ref: String,
        dest: PathBuf,
        #[arg(long)]
        file_name: Option<String>,
        #[arg(long)]
        file_size: Option<u64>,
        #[arg(long)]
        checksum: Option<String>,
    },
    List {
        #[arg(long, value_enum)]
        direction: Option<DirectionArg>,
    },
    Get {
        id: String,
    },
    Cancel {
        id: String,
    },
    /// Delete a finished, failed or cancelled task.
    Remove {
        id: String,
    },
    /// Re-queue a failed or cancelled task from scratch.
    Retry {
        id: String,
    },
    /// Delete every finished, failed or cancelled task in one direction.
    Clear {
        #[arg(long, value_enum)]
        direction: DirectionArg,
    },
    /// Last queue snapshot written by the daemon.
    Status,
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    /// Replace settings with TOML read from stdin.
    Set,
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    Upload,
    Download,
}

impl From<DirectionArg> for Direction {
    fn from(d: DirectionArg) -> Self {
        match d {
            DirectionArg::Upload => Direction::Upload,
            DirectionArg::Download => Direction::Download,
        }
    }
}

#[derive(Debug, Serialize)]
struct CliError {
    code: String,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &str, message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(code, message)
        }
    }
}

impl From<ControlError> for CliError {
    fn from(e: ControlError) -> Self {
        Self {
            code: e.code,
            message: e.message,
            details: e.details,
            retryable: e.retryable,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| env_dir("CUMULUS_CONFIG_DIR"))
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| env_dir("CUMULUS_DATA_DIR"))
        .unwrap_or_else(default_data_dir);
    let client = ControlClient::new(control_ipc_socket_path(&data_dir));
    let json = cli.json;

    match cli.cmd {
        Command::Upload {
            path,
            file_name,
            checksum,
        } => {
            let mut req = NewTransfer::upload(absolute(path)?);
            req.file_name = file_name;
            req.checksum = checksum;
            let task: TransferTask = client.call(METHOD_SUBMIT, &req).await?;
            print_task(&task, json);
            Ok(())
        }
        Command::Download {
            remote_ref,
            dest,
            file_name,
            file_size,
            checksum,
        } => {
            let mut req = NewTransfer::download(remote_ref, absolute(dest)?);
            req.file_name = file_name;
            req.file_size = file_size;
            req.checksum = checksum;
            let task: TransferTask = client.call(METHOD_SUBMIT, &req).await?;
            print_task(&task, json);
            Ok(())
        }
        Command::List { direction } => {
            let params = ListParams {
                direction: direction.map(Direction::from),
            };
            let res: serde_json::Value = client.call(METHOD_LIST, &params).await?;
            if json {
                println!("{res}");
                return Ok(());
            }
            let tasks: Vec<TransferTask> = serde_json::from_value(res["tasks"].clone())
                .map_err(|e| CliError::new("control.invalid_response", e.to_string()))?;
            for t in &tasks {
                println!("{}", task_line(t));
            }
            Ok(())
        }
        Command::Get { id } => {
            let task: TransferTask = client.call(METHOD_GET, &TaskIdParams { id }).await?;
            print_task(&task, json);
            Ok(())
        }
        Command::Cancel { id } => {
            let task: TransferTask = client.call(METHOD_CANCEL, &TaskIdParams { id }).await?;
            print_task(&task, json);
            Ok(())
        }
        Command::Remove { id } => {
            let task: TransferTask = client.call(METHOD_REMOVE, &TaskIdParams { id }).await?;
            print_task(&task, json);
            Ok(())
        }
        Command::Retry { id } => {
            let task: TransferTask = client.call(METHOD_RESUBMIT, &TaskIdParams { id }).await?;
            print_task(&task, json);
            Ok(())
        }
        Command::Clear { direction } => {
            let params = ClearFinishedParams {
                direction: direction.into(),
            };
            let res: ClearFinishedResult = client.call(METHOD_CLEAR_FINISHED, &params).await?;
            if json {
                println!("{}", serde_json::json!({ "removed": res.removed }));
            } else {
                println!("removed={}", res.removed);
            }
            Ok(())
        }
        Command::Status => status_get(&data_dir, json),
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, json),
            SettingsCmd::Set => settings_set(&config_dir, json),
        },
    }
}

struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    async fn call<P: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<R, CliError> {
        let params = serde_json::to_value(params)
            .map_err(|e| CliError::new("control.invalid_request", e.to_string()))?;
        let req = ControlRequest::new(uuid::Uuid::new_v4().to_string(), method, params);

        let resp = tokio::time::timeout(CONTROL_TIMEOUT, self.round_trip(&req))
            .await
            .map_err(|_| {
                CliError::from(ControlError::timeout(
                    "daemon did not answer in time",
                    serde_json::json!({ "method": method }),
                ))
            })??;

        if resp.id != req.id {
            return Err(CliError::new(
                "control.invalid_response",
                format!("response id mismatch: {} != {}", resp.id, req.id),
            ));
        }
        match (resp.ok, resp.result, resp.error) {
            (true, Some(result), _) => serde_json::from_value(result)
                .map_err(|e| CliError::new("control.invalid_response", e.to_string())),
            (false, _, Some(e)) => Err(e.into()),
            _ => Err(CliError::new(
                "control.invalid_response",
                "response carries neither result nor error",
            )),
        }
    }

    async fn round_trip(&self, req: &ControlRequest) -> Result<ControlResponse, CliError> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            let mut err = CliError::retryable(
                "control.unavailable",
                format!("daemon not reachable: {e}"),
            );
            err.details = serde_json::json!({ "socketPath": self.socket_path.display().to_string() });
            err
        })?;
        let (r, mut w) = stream.into_split();

        let line = serde_json::to_string(req)
            .map_err(|e| CliError::new("control.invalid_request", e.to_string()))?;
        let io_err = |e: std::io::Error| CliError::retryable("control.io_failed", e.to_string());
        w.write_all(line.as_bytes()).await.map_err(io_err)?;
        w.write_all(b"\n").await.map_err(io_err)?;
        w.flush().await.map_err(io_err)?;

        let mut lines = BufReader::new(r).lines();
        let resp_line = lines
            .next_line()
            .await
            .map_err(io_err)?
            .ok_or_else(|| CliError::retryable("control.io_failed", "daemon closed the connection"))?;
        serde_json::from_str(&resp_line)
            .map_err(|e| CliError::new("control.invalid_response", e.to_string()))
    }
}

fn status_get(data_dir: &Path, json: bool) -> Result<(), CliError> {
    let path = status_json_path(data_dir);
    let snapshot = match read_queue_snapshot_json(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CliError::retryable(
                "status.unavailable",
                format!("no status written yet: {}", path.display()),
            ));
        }
        Err(e) => return Err(CliError::new("status.invalid", e.to_string())),
    };

    if json {
        let text = serde_json::to_string(&snapshot)
            .map_err(|e| CliError::new("status.invalid", e.to_string()))?;
        println!("{text}");
        return Ok(());
    }
    print_summary(&snapshot);
    Ok(())
}

fn print_summary(snapshot: &QueueSnapshot) {
    for d in Direction::ALL {
        let s = snapshot.summary(d);
        println!(
            "{d}: waiting={} running={} completed={} failed={} cancelled={} bytes={}/{}",
            s.waiting,
            s.running,
            s.completed,
            s.failed,
            s.cancelled,
            s.bytes_done,
            s.bytes_total
        );
    }
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = cumulus_core::config::load_settings(config_dir).map_err(map_core_err)?;
    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    } else {
        let text = cumulus_core::config::to_toml(&settings).map_err(map_core_err)?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn settings_set(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings = cumulus_core::config::parse_settings(&input)
        .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    cumulus_core::config::save_settings(config_dir, &settings).map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    }
    Ok(())
}

fn print_task(task: &TransferTask, json: bool) {
    if json {
        match serde_json::to_string(task) {
            Ok(s) => println!("{s}"),
            Err(e) => emit_error(&CliError::new("control.invalid_response", e.to_string())),
        }
    } else {
        println!("{}", task_line(task));
    }
}

fn task_line(t: &TransferTask) -> String {
    let size = t
        .file_size
        .map(|s| s.to_string())
        .unwrap_or_else(|| "?".to_string());
    let mut line = format!(
        "{} {} {} {}/{} attempt={} {}",
        t.id, t.direction, t.status, t.progress, size, t.attempt, t.file_name
    );
    if let Some(e) = &t.last_error {
        line.push_str(&format!(" error={}", e.class.code()));
    }
    line
}

/// The daemon resolves paths relative to its own cwd, so send absolute ones.
fn absolute(path: PathBuf) -> Result<PathBuf, CliError> {
    std::path::absolute(&path)
        .map_err(|e| CliError::new("transfer.validation", format!("{}: {e}", path.display())))
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

fn map_core_err(e: cumulus_core::Error) -> CliError {
    CliError::from(ControlError::from(&e))
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
