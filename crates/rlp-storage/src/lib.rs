//! Rate-limited HTTP fetching and crash-safe file storage for RLP.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
pub use reqwest::{StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rlp-storage";

/// Temp file next to `path`, so the final rename never crosses a filesystem.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4()))
}

/// Write-to-temp then rename. Readers see either the old file or the new one.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let temp_path = temp_sibling(path);

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    write_atomic(path, &bytes).await
}

/// `Ok(None)` when the file does not exist yet.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let value = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

/// Immutable JSONL segments. A segment only counts once a caller records its name
/// in a committed state file; anything else in the directory is an orphan.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    root: PathBuf,
}

impl SegmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn write_segment<T: Serialize>(
        &self,
        prefix: &str,
        records: &[T],
    ) -> anyhow::Result<String> {
        let name = format!(
            "{}-{}-{}.jsonl",
            prefix,
            Utc::now().format("%Y%m%d_%H%M%S"),
            Uuid::new_v4().simple()
        );
        let mut body = Vec::new();
        for record in records {
            serde_json::to_writer(&mut body, record).context("serializing segment record")?;
            body.push(b'\n');
        }
        write_atomic(&self.root.join(&name), &body).await?;
        Ok(name)
    }

    pub async fn read_segment<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Vec<T>> {
        let path = self.root.join(name);
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading segment {}", path.display()))?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("parsing {} line {}", path.display(), idx + 1))
            })
            .collect()
    }

    pub async fn read_segments<T: DeserializeOwned>(
        &self,
        names: &[String],
    ) -> anyhow::Result<Vec<T>> {
        let mut out = Vec::new();
        for name in names {
            out.extend(self.read_segment::<T>(name).await?);
        }
        Ok(out)
    }

    /// Segment files on disk that no committed state refers to.
    pub async fn orphaned_segments(&self, committed: &[String]) -> anyhow::Result<Vec<String>> {
        if !fs::try_exists(&self.root).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("listing {}", self.root.display()))?;
        let mut orphans = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".jsonl") && !committed.contains(&name) {
                orphans.push(name);
            }
        }
        orphans.sort();
        Ok(orphans)
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed store for raw fetched pages, kept for auditing parses.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        area_code: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(source_id)
            .join(area_code)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Identical bytes for the same day/source/area land on the same path and are written once.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        area_code: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.page_relative_path(fetched_at, source_id, area_code, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes).await?;
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    Blocked,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Blocked
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// `base_delay * multiplier^attempt_index`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.base_delay.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64)
    }
}

/// Minimum spacing between requests to the same host, with the gap drawn from a range.
#[derive(Debug)]
pub struct HostPacer {
    min_delay: Duration,
    max_delay: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl HostPacer {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        let (min_delay, max_delay) = if min_delay <= max_delay {
            (min_delay, max_delay)
        } else {
            (max_delay, min_delay)
        };
        Self {
            min_delay,
            max_delay,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    fn draw_gap(&self) -> Duration {
        if self.max_delay <= self.min_delay {
            return self.min_delay;
        }
        let low = self.min_delay.as_millis() as u64;
        let high = self.max_delay.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }

    /// Reserve the next request slot for `host`. Concurrent callers get distinct,
    /// properly spaced slots; the lock is released before anyone sleeps.
    pub async fn reserve(&self, host: &str) -> Instant {
        let gap = self.draw_gap();
        let mut slots = self.next_slot.lock().await;
        let now = Instant::now();
        let slot = match slots.get(host) {
            Some(previous) => (*previous + gap).max(now),
            None => now,
        };
        slots.insert(host.to_string(), slot);
        slot
    }

    pub async fn wait_turn(&self, host: &str) {
        let slot = self.reserve(host).await;
        tokio::time::sleep_until(slot).await;
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 8,
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(6),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Transient,
    Blocked,
    Fatal,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("transient failure for {url} after {attempts} attempts: {reason}")]
    Transient {
        url: String,
        attempts: usize,
        reason: String,
    },
    #[error("blocked by {host} (http {status}) fetching {url}")]
    Blocked {
        host: String,
        status: u16,
        url: String,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl FetchError {
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            FetchError::Transient { .. } => FetchErrorKind::Transient,
            FetchError::Blocked { .. } => FetchErrorKind::Blocked,
            FetchError::InvalidUrl { .. } | FetchError::HttpStatus { .. } | FetchError::Request(_) => {
                FetchErrorKind::Fatal
            }
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.kind() == FetchErrorKind::Blocked
    }
}

/// Seam for anything that issues paced HTTP GETs; tests inject fakes here.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, headers: &[(&str, &str)]) -> Result<FetchedResponse, FetchError>;
}

pub fn host_of(url: &str) -> Result<String, FetchError> {
    let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    let host = parsed.host_str().ok_or_else(|| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: "missing host".to_string(),
    })?;
    Ok(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    pacer: HostPacer,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            pacer: HostPacer::new(config.min_delay, config.max_delay),
            backoff: config.backoff,
        })
    }

    async fn fetch_with_retries(
        &self,
        host: &str,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let max_retries = self.backoff.max_retries;
        let mut last_reason = String::from("no attempt made");

        for attempt in 0..=max_retries {
            self.pacer.wait_turn(host).await;

            let mut request = self.client.get(url);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    match classify_status(status) {
                        RetryDisposition::NonRetryable => {
                            return Err(FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url,
                            });
                        }
                        RetryDisposition::Blocked if attempt >= max_retries => {
                            warn!(%status, "host keeps refusing requests; reporting blocked");
                            return Err(FetchError::Blocked {
                                host: host.to_string(),
                                status: status.as_u16(),
                                url: final_url,
                            });
                        }
                        RetryDisposition::Blocked | RetryDisposition::Retryable => {
                            last_reason = format!("http {status}");
                        }
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request(err));
                    }
                    last_reason = err.to_string();
                }
            }

            if attempt < max_retries {
                let delay = self.backoff.delay_for_attempt(attempt);
                debug!(attempt, ?delay, reason = %last_reason, "retrying after backoff");
                tokio::time::sleep(delay).await;
            }
        }

        Err(FetchError::Transient {
            url: url.to_string(),
            attempts: max_retries + 1,
            reason: last_reason,
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, headers: &[(&str, &str)]) -> Result<FetchedResponse, FetchError> {
        let host = host_of(url)?;
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Transient {
                url: url.to_string(),
                attempts: 0,
                reason: "fetcher shut down".to_string(),
            })?;

        let span = info_span!("http_fetch", host = %host, url);
        self.fetch_with_retries(&host, url, headers)
            .instrument(span)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 responder that replays `statuses`, repeating the last one.
    async fn spawn_responder(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let idx = counter.fetch_add(1, Ordering::SeqCst);
                let status = statuses
                    .get(idx)
                    .or(statuses.last())
                    .copied()
                    .unwrap_or(200);
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                loop {
                    let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    read += n;
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") || read == buf.len() {
                        break;
                    }
                }
                let body = format!("status {status}");
                let response = format!(
                    "HTTP/1.1 {status} Test\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}/rentals/78701"), hits)
    }

    fn fast_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("rlp-test/0.1".to_string()),
            global_concurrency: 2,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(5),
                multiplier: 2.0,
                max_delay: Duration::from_millis(20),
            },
        })
        .expect("fetcher")
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn stored_pages_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_page(fetched_at, "redfin", "78701", "html", b"<html>same</html>")
            .await
            .expect("first store");
        let second = store
            .store_page(fetched_at, "redfin", "78701", "html", b"<html>same</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(350));
    }

    #[test]
    fn status_classification_separates_blocked_from_transient() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Blocked);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::Blocked);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn pacer_spaces_requests_per_host_only() {
        let pacer = HostPacer::new(Duration::from_millis(40), Duration::from_millis(40));
        let first = pacer.reserve("www.redfin.com").await;
        let second = pacer.reserve("www.redfin.com").await;
        let third = pacer.reserve("www.redfin.com").await;
        assert!(second.duration_since(first) >= Duration::from_millis(40));
        assert!(third.duration_since(second) >= Duration::from_millis(40));

        let other = pacer.reserve("geocoder.example").await;
        assert!(other <= Instant::now());
    }

    #[test]
    fn host_of_keeps_port_and_rejects_garbage() {
        assert_eq!(host_of("http://127.0.0.1:8080/x").unwrap(), "127.0.0.1:8080");
        assert_eq!(host_of("https://www.redfin.com/zipcode/78701").unwrap(), "www.redfin.com");
        assert!(matches!(host_of("not a url"), Err(FetchError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn transient_server_errors_are_retried_until_success() {
        let (url, hits) = spawn_responder(vec![503, 502, 200]).await;
        let fetcher = fast_fetcher(3);
        let resp = fetcher.fetch(&url, &[("accept", "text/html")]).await.expect("eventual success");
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.text(), "status 200");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_rate_limiting_reports_blocked() {
        let (url, hits) = spawn_responder(vec![429]).await;
        let fetcher = fast_fetcher(2);
        let err = fetcher.fetch(&url, &[]).await.expect_err("blocked");
        assert_eq!(err.kind(), FetchErrorKind::Blocked);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_as_transient() {
        let (url, hits) = spawn_responder(vec![500]).await;
        let fetcher = fast_fetcher(1);
        let err = fetcher.fetch(&url, &[]).await.expect_err("transient");
        assert!(matches!(err, FetchError::Transient { attempts: 2, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn not_found_is_fatal_without_retry() {
        let (url, hits) = spawn_responder(vec![404]).await;
        let fetcher = fast_fetcher(3);
        let err = fetcher.fetch(&url, &[]).await.expect_err("fatal");
        assert_eq!(err.kind(), FetchErrorKind::Fatal);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn atomic_json_writes_replace_whole_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("cache.json");
        write_json_atomic(&path, &vec![1, 2, 3]).await.expect("first");
        write_json_atomic(&path, &vec![4]).await.expect("second");
        let back: Option<Vec<i32>> = read_json(&path).await.expect("read");
        assert_eq!(back, Some(vec![4]));

        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);

        let missing: Option<Vec<i32>> = read_json(&dir.path().join("nope.json")).await.expect("read");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn segments_round_trip_and_orphans_are_reported() {
        let dir = tempdir().expect("tempdir");
        let store = SegmentStore::new(dir.path().join("segments"));
        let committed = store
            .write_segment("listings", &["a".to_string(), "b".to_string()])
            .await
            .expect("segment");
        let orphan = store
            .write_segment("listings", &["c".to_string()])
            .await
            .expect("orphan");

        let names = vec![committed.clone()];
        let records: Vec<String> = store.read_segments(&names).await.expect("read");
        assert_eq!(records, vec!["a".to_string(), "b".to_string()]);

        let orphans = store.orphaned_segments(&names).await.expect("orphans");
        assert_eq!(orphans, vec![orphan]);
    }
}
