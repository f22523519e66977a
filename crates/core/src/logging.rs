use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::Utc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "CUMULUS_LOG";
pub const LOG_DIR_ENV: &str = "CUMULUS_LOG_DIR";

static SESSION_LOGGER: OnceLock<SessionLogger> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

#[derive(Debug)]
struct SessionState {
    writer: Option<BufWriter<std::fs::File>>,
}

/// Routes formatted events into the active session file, or nowhere when no
/// session is open.
#[derive(Debug)]
struct SessionLogger {
    state: Mutex<SessionState>,
}

impl SessionLogger {
    fn new() -> Self {
        Self {
            state: Mutex::new(SessionState { writer: None }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, path: &Path) -> std::io::Result<()> {
        let mut guard = self.lock();
        if guard.writer.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "session log already active",
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        guard.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn close(&self) -> std::io::Result<()> {
        let Some(mut writer) = self.lock().writer.take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()
    }
}

enum SessionWriter<'a> {
    Sink(std::io::Sink),
    File(MutexGuard<'a, SessionState>),
}

impl Write for SessionWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Sink(sink) => sink.write(buf),
            Self::File(guard) => match guard.writer.as_mut() {
                Some(w) => w.write(buf),
                None => Ok(buf.len()),
            },
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Sink(sink) => sink.flush(),
            Self::File(guard) => match guard.writer.as_mut() {
                Some(w) => w.flush(),
                None => Ok(()),
            },
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SessionLogger {
    type Writer = SessionWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        let guard = self.lock();
        if guard.writer.is_some() {
            SessionWriter::File(guard)
        } else {
            SessionWriter::Sink(std::io::sink())
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &SessionLogger {
    type Writer = SessionWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

fn build_env_filter_from(cumulus_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("info");

    if let Some(v) = cumulus_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    if let Some(v) = rust_log {
        return EnvFilter::try_new(v).unwrap_or_else(|_| default());
    }
    default()
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var(LOG_ENV).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

/// Installs the global ndjson subscriber. Safe to call more than once.
pub fn init_logging() {
    TRACING_INIT.get_or_init(|| {
        let logger = SESSION_LOGGER.get_or_init(SessionLogger::new);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(logger);

        let _ = tracing_subscriber::registry()
            .with(build_env_filter())
            .with(layer)
            .try_init();
    });
}

/// Keeps the session log open. Dropping it flushes and syncs the file.
pub struct SessionLogGuard {
    path: PathBuf,
}

impl SessionLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLogGuard {
    fn drop(&mut self) {
        if let Some(logger) = SESSION_LOGGER.get() {
            let _ = logger.close();
        }
    }
}

/// Opens `<log dir>/cumulus-<component>-<utc stamp>-<pid>.ndjson`.
pub fn start_session_log(component: &str, data_dir: &Path) -> std::io::Result<SessionLogGuard> {
    init_logging();

    let log_dir = resolve_log_dir(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_name = format!(
        "cumulus-{}-{}-{}.ndjson",
        sanitize_filename_component(component),
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
        std::process::id()
    );
    let path = log_dir.join(file_name);
    SESSION_LOGGER.get_or_init(SessionLogger::new).open(&path)?;

    Ok(SessionLogGuard { path })
}

pub fn resolve_log_dir(data_dir: &Path) -> PathBuf {
    match std::env::var(LOG_DIR_ENV) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v),
        _ => data_dir.join("logs"),
    }
}

fn sanitize_filename_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}
