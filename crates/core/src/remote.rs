use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::task::ErrorClass;
use crate::{Error, Result};

pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

pub const CHECKSUM_HEADER: &str = "x-content-blake3";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMeta {
    pub upload_key: String,
    /// Destination requested by the caller, if any.
    pub remote_ref: Option<String>,
    pub file_name: String,
    pub file_size: u64,
    /// blake3 hex of the complete content.
    pub checksum: String,
}

/// Chunked object storage on the far side of a transfer.
///
/// Every error returned should be an `Error::Transfer` carrying the class the
/// retry policy decides on.
pub trait RemoteStorage: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Stages `bytes` at `offset` of an in-progress upload. Re-sending a range
    /// that was already staged overwrites it.
    fn push_chunk<'a>(
        &'a self,
        upload_key: &'a str,
        offset: u64,
        bytes: Vec<u8>,
    ) -> RemoteFuture<'a, ()>;

    /// Up to `length` bytes from `offset`. A short or empty read means end of
    /// object.
    fn pull_chunk<'a>(
        &'a self,
        remote_ref: &'a str,
        offset: u64,
        length: u64,
    ) -> RemoteFuture<'a, Vec<u8>>;

    /// Commits the staged upload and returns the object's remote ref.
    fn finalize_upload<'a>(&'a self, meta: &'a UploadMeta) -> RemoteFuture<'a, String>;

    fn remote_checksum<'a>(&'a self, _remote_ref: &'a str) -> RemoteFuture<'a, Option<String>> {
        Box::pin(async { Ok(None) })
    }
}

#[derive(Debug, Clone)]
pub struct HttpRemoteConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub bearer_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeResponse {
    remote_ref: String,
}

pub struct HttpRemote {
    base: Url,
    bearer_token: Option<String>,
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(config: HttpRemoteConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url).map_err(|e| Error::InvalidConfig {
            message: format!("remote.base_url is not a valid url: {e}"),
        })?;
        if base.cannot_be_a_base() {
            return Err(Error::InvalidConfig {
                message: format!("remote.base_url cannot be a base url: {base}"),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::InvalidConfig {
                message: format!("http client init failed: {e}"),
            })?;
        Ok(Self {
            base,
            bearer_token: config.bearer_token,
            client,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidConfig {
                message: format!("remote.base_url cannot be a base url: {}", self.base),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        self.authorize(req).send().await.map_err(|e| {
            Error::transfer(classify_request_error(&e), format!("{what} request failed: {e}"))
        })
    }
}

impl RemoteStorage for HttpRemote {
    fn provider(&self) -> &'static str {
        "http"
    }

    fn push_chunk<'a>(
        &'a self,
        upload_key: &'a str,
        offset: u64,
        bytes: Vec<u8>,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            let mut url = self.url(&["uploads", upload_key, "chunks"])?;
            url.query_pairs_mut()
                .append_pair("offset", &offset.to_string());
            let res = self.send(self.client.put(url).body(bytes), "push_chunk").await?;
            let status = res.status();
            if !status.is_success() {
                let body = res.text().await.unwrap_or_default();
                return Err(status_error(status, "push_chunk", &body));
            }
            Ok(())
        })
    }

    fn pull_chunk<'a>(
        &'a self,
        remote_ref: &'a str,
        offset: u64,
        length: u64,
    ) -> RemoteFuture<'a, Vec<u8>> {
        Box::pin(async move {
            if length == 0 {
                return Ok(Vec::new());
            }
            let url = self.url(&["objects", remote_ref])?;
            let range = format!("bytes={}-{}", offset, offset + length - 1);
            let res = self
                .send(self.client.get(url).header(RANGE, range), "pull_chunk")
                .await?;

            let status = res.status();
            if status == StatusCode::RANGE_NOT_SATISFIABLE {
                return Ok(Vec::new());
            }
            if !status.is_success() {
                let body = res.text().await.unwrap_or_default();
                return Err(status_error(status, "pull_chunk", &body));
            }
            let ranged = status == StatusCode::PARTIAL_CONTENT || res.headers().contains_key(CONTENT_RANGE);
            let bytes = res.bytes().await.map_err(|e| {
                Error::transfer(
                    classify_request_error(&e),
                    format!("pull_chunk read failed: {e}"),
                )
            })?;

            if ranged {
                return Ok(bytes.to_vec());
            }
            // Server ignored the range and sent the whole object.
            let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
            let end = start
                .saturating_add(usize::try_from(length).unwrap_or(usize::MAX))
                .min(bytes.len());
            Ok(bytes[start..end].to_vec())
        })
    }

    fn finalize_upload<'a>(&'a self, meta: &'a UploadMeta) -> RemoteFuture<'a, String> {
        Box::pin(async move {
            let url = self.url(&["uploads", &meta.upload_key, "finalize"])?;
            let res = self
                .send(self.client.post(url).json(meta), "finalize_upload")
                .await?;
            let status = res.status();
            let body = res.text().await.map_err(|e| {
                Error::transfer(
                    classify_request_error(&e),
                    format!("finalize_upload read failed: {e}"),
                )
            })?;
            if !status.is_success() {
                return Err(status_error(status, "finalize_upload", &body));
            }
            let parsed: FinalizeResponse = serde_json::from_str(&body).map_err(|e| {
                Error::transfer(
                    ErrorClass::Rejected,
                    format!("finalize_upload invalid json: {e}; body={body}"),
                )
            })?;
            Ok(parsed.remote_ref)
        })
    }

    fn remote_checksum<'a>(&'a self, remote_ref: &'a str) -> RemoteFuture<'a, Option<String>> {
        Box::pin(async move {
            let url = self.url(&["objects", remote_ref])?;
            let res = self.send(self.client.head(url), "remote_checksum").await?;
            let status = res.status();
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !status.is_success() {
                return Err(status_error(status, "remote_checksum", ""));
            }
            Ok(res
                .headers()
                .get(CHECKSUM_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_ascii_lowercase()))
        })
    }
}

pub fn classify_status(status: StatusCode) -> ErrorClass {
    match status {
        StatusCode::REQUEST_TIMEOUT => ErrorClass::Timeout,
        StatusCode::TOO_MANY_REQUESTS => ErrorClass::ServerError,
        StatusCode::PAYLOAD_TOO_LARGE | StatusCode::INSUFFICIENT_STORAGE => {
            ErrorClass::QuotaExceeded
        }
        s if s.is_server_error() => ErrorClass::ServerError,
        _ => ErrorClass::Rejected,
    }
}

fn classify_request_error(e: &reqwest::Error) -> ErrorClass {
    if e.is_timeout() {
        ErrorClass::Timeout
    } else if e.is_connect() {
        ErrorClass::ConnectionReset
    } else if e.is_builder() {
        ErrorClass::Rejected
    } else {
        ErrorClass::Network
    }
}

fn status_error(status: StatusCode, what: &str, body: &str) -> Error {
    let body = body.trim();
    let message = if body.is_empty() {
        format!("{what} http {status}")
    } else {
        format!("{what} http {status}: {body}")
    };
    Error::transfer(classify_status(status), message)
}

pub fn blake3_hex(bytes: &[u8]) -> String {
    hex::encode(blake3::hash(bytes).as_bytes())
}

#[derive(Debug, Default)]
struct InMemoryRemoteState {
    staging: HashMap<String, Vec<u8>>,
    objects: HashMap<String, Vec<u8>>,
    failures: VecDeque<ErrorClass>,
}

/// Remote kept in process memory. Tests use it to script failures and pace
/// chunk operations.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    pub pushed_chunks: AtomicUsize,
    pub pulled_chunks: AtomicUsize,
    pub finalized: AtomicUsize,
    chunk_delay: Duration,
    inner: Mutex<InMemoryRemoteState>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every chunk operation sleeps this long before completing.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// The next chunk operation fails with `class`. Calls queue up.
    pub async fn fail_next(&self, class: ErrorClass) {
        self.inner.lock().await.failures.push_back(class);
    }

    pub async fn put_object(&self, remote_ref: &str, bytes: Vec<u8>) {
        self.inner
            .lock()
            .await
            .objects
            .insert(remote_ref.to_string(), bytes);
    }

    pub async fn object(&self, remote_ref: &str) -> Option<Vec<u8>> {
        self.inner.lock().await.objects.get(remote_ref).cloned()
    }

    pub async fn staged_len(&self, upload_key: &str) -> Option<usize> {
        self.inner
            .lock()
            .await
            .staging
            .get(upload_key)
            .map(Vec::len)
    }

    pub async fn object_count(&self) -> usize {
        self.inner.lock().await.objects.len()
    }

    async fn pace(&self) -> Result<()> {
        if !self.chunk_delay.is_zero() {
            tokio::time::sleep(self.chunk_delay).await;
        }
        match self.inner.lock().await.failures.pop_front() {
            Some(class) => Err(Error::transfer(class, "injected failure")),
            None => Ok(()),
        }
    }
}

impl RemoteStorage for InMemoryRemote {
    fn provider(&self) -> &'static str {
        "test.mem"
    }

    fn push_chunk<'a>(
        &'a self,
        upload_key: &'a str,
        offset: u64,
        bytes: Vec<u8>,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(async move {
            self.pace().await?;
            let mut state = self.inner.lock().await;
            let staged = state.staging.entry(upload_key.to_string()).or_default();
            let offset = usize::try_from(offset).unwrap_or(usize::MAX);
            if offset > staged.len() {
                return Err(Error::transfer(
                    ErrorClass::Rejected,
                    format!(
                        "chunk offset {offset} beyond staged length {}",
                        staged.len()
                    ),
                ));
            }
            staged.truncate(offset);
            staged.extend_from_slice(&bytes);
            self.pushed_chunks.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn pull_chunk<'a>(
        &'a self,
        remote_ref: &'a str,
        offset: u64,
        length: u64,
    ) -> RemoteFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.pace().await?;
            let state = self.inner.lock().await;
            let object = state.objects.get(remote_ref).ok_or_else(|| {
                Error::transfer(
                    ErrorClass::Rejected,
                    format!("object not found: {remote_ref}"),
                )
            })?;
            let start = usize::try_from(offset).unwrap_or(usize::MAX).min(object.len());
            let end = start
                .saturating_add(usize::try_from(length).unwrap_or(usize::MAX))
                .min(object.len());
            self.pulled_chunks.fetch_add(1, Ordering::Relaxed);
            Ok(object[start..end].to_vec())
        })
    }

    fn finalize_upload<'a>(&'a self, meta: &'a UploadMeta) -> RemoteFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.inner.lock().await;
            let bytes = state.staging.remove(&meta.upload_key).unwrap_or_default();
            if bytes.len() as u64 != meta.file_size {
                return Err(Error::transfer(
                    ErrorClass::SizeMismatch,
                    format!(
                        "staged {} bytes, expected {}",
                        bytes.len(),
                        meta.file_size
                    ),
                ));
            }
            let actual = blake3_hex(&bytes);
            if actual != meta.checksum {
                return Err(Error::transfer(
                    ErrorClass::ChecksumMismatch,
                    format!("staged content hashes to {actual}"),
                ));
            }
            let remote_ref = meta
                .remote_ref
                .clone()
                .unwrap_or_else(|| format!("mem:{}", uuid::Uuid::new_v4()));
            state.objects.insert(remote_ref.clone(), bytes);
            self.finalized.fetch_add(1, Ordering::Relaxed);
            Ok(remote_ref)
        })
    }

    fn remote_checksum<'a>(&'a self, remote_ref: &'a str) -> RemoteFuture<'a, Option<String>> {
        Box::pin(async move {
            Ok(self
                .inner
                .lock()
                .await
                .objects
                .get(remote_ref)
                .map(|b| blake3_hex(b)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_error_classes() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), ErrorClass::ServerError);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), ErrorClass::ServerError);
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), ErrorClass::Timeout);
        assert_eq!(
            classify_status(StatusCode::INSUFFICIENT_STORAGE),
            ErrorClass::QuotaExceeded
        );
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ErrorClass::Rejected);
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE).is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND).is_transient());
    }

    #[test]
    fn http_remote_builds_escaped_urls() {
        let remote = HttpRemote::new(HttpRemoteConfig {
            base_url: "https://storage.example.com/api/".to_string(),
            request_timeout: Duration::from_secs(5),
            bearer_token: None,
        })
        .unwrap();
        let url = remote.url(&["objects", "a b/c"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.example.com/api/objects/a%20b%2Fc"
        );
    }

    #[test]
    fn http_remote_rejects_bad_base_url() {
        let err = HttpRemote::new(HttpRemoteConfig {
            base_url: "not a url".to_string(),
            request_timeout: Duration::from_secs(5),
            bearer_token: None,
        })
        .err()
        .unwrap();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn in_memory_upload_is_staged_then_committed() {
        let remote = InMemoryRemote::new();
        remote.push_chunk("k", 0, b"hello ".to_vec()).await.unwrap();
        remote.push_chunk("k", 6, b"world".to_vec()).await.unwrap();
        // Resending the last chunk is harmless.
        remote.push_chunk("k", 6, b"world".to_vec()).await.unwrap();

        let err = remote.push_chunk("k", 99, b"x".to_vec()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Rejected);

        let meta = UploadMeta {
            upload_key: "k".to_string(),
            remote_ref: None,
            file_name: "greeting.txt".to_string(),
            file_size: 11,
            checksum: blake3_hex(b"hello world"),
        };
        let remote_ref = remote.finalize_upload(&meta).await.unwrap();
        assert_eq!(remote.object(&remote_ref).await.unwrap(), b"hello world");
        assert_eq!(remote.staged_len("k").await, None);
        assert_eq!(
            remote.remote_checksum(&remote_ref).await.unwrap(),
            Some(meta.checksum.clone())
        );

        let tail = remote.pull_chunk(&remote_ref, 6, 100).await.unwrap();
        assert_eq!(tail, b"world");
        assert!(remote.pull_chunk(&remote_ref, 11, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn in_memory_finalize_detects_corruption() {
        let remote = InMemoryRemote::new();
        remote.push_chunk("k", 0, b"abc".to_vec()).await.unwrap();
        let err = remote
            .finalize_upload(&UploadMeta {
                upload_key: "k".to_string(),
                remote_ref: None,
                file_name: "f".to_string(),
                file_size: 3,
                checksum: blake3_hex(b"xyz"),
            })
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::ChecksumMismatch);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let remote = InMemoryRemote::new();
        remote.put_object("o", vec![1, 2, 3]).await;
        remote.fail_next(ErrorClass::ConnectionReset).await;

        let err = remote.pull_chunk("o", 0, 3).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::ConnectionReset);
        assert_eq!(remote.pull_chunk("o", 0, 3).await.unwrap(), vec![1, 2, 3]);
    }
}
