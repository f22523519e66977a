use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::executor::ExecutorConfig;
use crate::remote::HttpRemoteConfig;
use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerConfig;
use crate::store::WriteRetryPolicy;
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

/// Upper bound on a single chunk. Larger values defeat checkpointing.
pub const MAX_CHUNK_SIZE_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    #[serde(default)]
    pub transfers: Transfers,
    #[serde(default)]
    pub retry: Retry,
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub remote: Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Transfers {
    pub max_concurrent_uploads: u32,
    pub max_concurrent_downloads: u32,
    pub chunk_size_bytes: u64,
    pub chunk_timeout_ms: u64,
    pub keep_partial_on_cancel: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Retry {
    /// Retries after the first failed attempt; a task runs at most
    /// `max_retries + 1` times.
    #[serde(alias = "max_retry_attempts")]
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Store {
    pub write_retries: u32,
    pub write_retry_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Remote {
    /// Empty means no remote is configured.
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for Transfers {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 2,
            max_concurrent_downloads: 3,
            chunk_size_bytes: 1024 * 1024,
            chunk_timeout_ms: 30_000,
            keep_partial_on_cancel: true,
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self {
            write_retries: 3,
            write_retry_delay_ms: 50,
        }
    }
}

impl Default for Remote {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_timeout_ms: 60_000,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            transfers: Transfers::default(),
            retry: Retry::default(),
            store: Store::default(),
            remote: Remote::default(),
        }
    }
}

impl Settings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_uploads: self.transfers.max_concurrent_uploads as usize,
            max_concurrent_downloads: self.transfers.max_concurrent_downloads as usize,
            retry: self.retry_policy(),
            executor: ExecutorConfig {
                chunk_size: self.transfers.chunk_size_bytes,
                chunk_timeout: Duration::from_millis(self.transfers.chunk_timeout_ms),
                keep_partial_on_cancel: self.transfers.keep_partial_on_cancel,
                store_write: WriteRetryPolicy {
                    retries: self.store.write_retries,
                    delay: Duration::from_millis(self.store.write_retry_delay_ms),
                },
            },
        }
    }

    /// `None` when `remote.base_url` is unset.
    pub fn http_remote_config(&self, bearer_token: Option<String>) -> Option<HttpRemoteConfig> {
        let base_url = self.remote.base_url.trim();
        if base_url.is_empty() {
            return None;
        }
        Some(HttpRemoteConfig {
            base_url: base_url.to_string(),
            request_timeout: Duration::from_millis(self.remote.request_timeout_ms),
            bearer_token,
        })
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

/// Reads `<config_dir>/config.toml`; a missing file yields the defaults.
pub fn load_settings(config_dir: &Path) -> Result<Settings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(Settings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<Settings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = match raw.get("version") {
        None => None,
        Some(v) => Some(
            v.as_integer()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| toml::de::Error::custom("settings version must be an integer"))?,
        ),
    };

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => toml::from_str::<Settings>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => {
            let mut table = raw;
            if let Some(t) = table.as_table_mut() {
                t.insert(
                    "version".to_string(),
                    toml::Value::Integer(i64::from(SETTINGS_SCHEMA_VERSION)),
                );
            }
            table.try_into::<Settings>()
        }
    }
}

pub fn to_toml(settings: &Settings) -> Result<String> {
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &Settings) -> Result<()> {
    validate_settings(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    let text = to_toml(settings)?;
    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(invalid(format!(
            "unsupported settings schema version: {} (expected {SETTINGS_SCHEMA_VERSION})",
            settings.version
        )));
    }

    let t = &settings.transfers;
    if t.max_concurrent_uploads == 0 {
        return Err(invalid("transfers.max_concurrent_uploads must be > 0"));
    }
    if t.max_concurrent_downloads == 0 {
        return Err(invalid("transfers.max_concurrent_downloads must be > 0"));
    }
    if t.chunk_size_bytes == 0 || t.chunk_size_bytes > MAX_CHUNK_SIZE_BYTES {
        return Err(invalid(format!(
            "transfers.chunk_size_bytes must be within 1..={MAX_CHUNK_SIZE_BYTES}"
        )));
    }
    if t.chunk_timeout_ms == 0 {
        return Err(invalid("transfers.chunk_timeout_ms must be > 0"));
    }

    let r = &settings.retry;
    if r.base_delay_ms > r.max_delay_ms {
        return Err(invalid(format!(
            "retry.base_delay_ms ({}) must not exceed retry.max_delay_ms ({})",
            r.base_delay_ms, r.max_delay_ms
        )));
    }

    let base_url = settings.remote.base_url.trim();
    if !base_url.is_empty()
        && !(base_url.starts_with("http://") || base_url.starts_with("https://"))
    {
        return Err(invalid("remote.base_url must be an http(s) url"));
    }
    if settings.remote.request_timeout_ms == 0 {
        return Err(invalid("remote.request_timeout_ms must be > 0"));
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidConfig {
        message: message.into(),
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings(dir.path()).unwrap();
        assert_eq!(s, Settings::default());
        assert_eq!(s.transfers.max_concurrent_uploads, 2);
        assert_eq!(s.transfers.max_concurrent_downloads, 3);
        assert_eq!(s.retry.max_retries, 5);
    }

    #[test]
    fn partial_sections_fill_in_defaults() {
        let s = parse_settings(
            r#"
version = 1

[transfers]
max_concurrent_uploads = 4

[retry]
base_delay_ms = 250
"#,
        )
        .unwrap();
        assert_eq!(s.transfers.max_concurrent_uploads, 4);
        assert_eq!(s.transfers.max_concurrent_downloads, 3);
        assert_eq!(s.retry.base_delay_ms, 250);
        assert_eq!(s.retry.max_delay_ms, 60_000);
        assert_eq!(s.store.write_retries, 3);
    }

    #[test]
    fn older_retry_key_is_still_accepted() {
        let s = parse_settings("[retry]\nmax_retry_attempts = 2\n").unwrap();
        assert_eq!(s.retry.max_retries, 2);
        assert_eq!(s.retry_policy().max_retries, 2);
    }

    #[test]
    fn unversioned_file_is_read_as_current_schema() {
        let s = parse_settings("[transfers]\nchunk_size_bytes = 4096\n").unwrap();
        assert_eq!(s.version, SETTINGS_SCHEMA_VERSION);
        assert_eq!(s.transfers.chunk_size_bytes, 4096);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let err = parse_settings("version = 9\n").unwrap_err();
        assert!(err.to_string().contains("unsupported settings schema version"));
    }

    #[test]
    fn validation_rejects_bad_bounds() {
        let mut s = Settings::default();
        s.transfers.max_concurrent_downloads = 0;
        assert!(validate_settings(&s).is_err());

        let mut s = Settings::default();
        s.retry.base_delay_ms = 120_000;
        assert!(validate_settings(&s).is_err());

        let mut s = Settings::default();
        s.remote.base_url = "ftp://example.com".to_string();
        assert!(validate_settings(&s).is_err());

        let mut s = Settings::default();
        s.transfers.chunk_size_bytes = 0;
        assert!(validate_settings(&s).is_err());
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = Settings::default();
        s.transfers.keep_partial_on_cancel = false;
        s.remote.base_url = "https://storage.example.com".to_string();
        save_settings(dir.path(), &s).unwrap();

        let loaded = load_settings(dir.path()).unwrap();
        assert_eq!(loaded, s);
        assert!(!dir.path().join("config.toml.tmp").exists());
    }

    #[test]
    fn settings_map_onto_runtime_configs() {
        let s = Settings::default();
        let sched = s.scheduler_config();
        assert_eq!(sched.max_concurrent_uploads, 2);
        assert_eq!(sched.executor.chunk_size, 1024 * 1024);
        assert_eq!(sched.executor.chunk_timeout, Duration::from_secs(30));
        assert_eq!(sched.retry.base_delay, Duration::from_secs(1));
        assert!(s.http_remote_config(None).is_none());
    }
}
