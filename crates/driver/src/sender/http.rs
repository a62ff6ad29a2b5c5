//! Http — batching, retrying, disk-spooled delivery to the Logz.io listener.
//!
//! `send` appends to an in-memory batch. A background drain task ships the
//! batch every `drain_timeout` (or sooner once it grows past the batch limit)
//! as newline-delimited JSON. Batches that still fail after the retry budget
//! are written to the spool directory and retried, oldest first, on later
//! drains.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use reqwest::StatusCode;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{SendError, Sender};

pub const DEFAULT_BATCH_LIMIT: usize = 3 * 1024 * 1024;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpSenderConfig {
    /// Listener base URL, without trailing slash.
    pub url: String,
    pub token: String,
    pub source_type: String,
    /// Directory holding batches that could not be delivered.
    pub spool_dir: PathBuf,
    pub drain_timeout: Duration,
    /// Disk usage percentage at which spooling stops.
    pub disk_threshold: u8,
    pub batch_limit: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl HttpSenderConfig {
    pub fn new(url: &str, token: &str, source_type: &str, spool_dir: PathBuf) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            source_type: source_type.to_string(),
            spool_dir,
            drain_timeout: Duration::from_secs(5),
            disk_threshold: 70,
            batch_limit: DEFAULT_BATCH_LIMIT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }

    fn endpoint(&self) -> Result<reqwest::Url, SendError> {
        let base = format!("{}/", self.url);
        reqwest::Url::parse_with_params(
            &base,
            &[("token", self.token.as_str()), ("type", self.source_type.as_str())],
        )
        .map_err(|e| SendError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })
    }
}

enum Outcome {
    Delivered,
    Rejected,
    Failed(SendError),
}

struct Inner {
    config: HttpSenderConfig,
    endpoint: reqwest::Url,
    client: RwLock<reqwest::Client>,
    batch: Mutex<Vec<Bytes>>,
    batch_bytes: AtomicUsize,
    spool_seq: AtomicU64,
    wake: Notify,
    /// Serializes drains so the timer and an explicit flush never interleave.
    drain_lock: tokio::sync::Mutex<()>,
}

pub struct HttpSender {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    stopped: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn build_client() -> Result<reqwest::Client, SendError> {
    Ok(reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

impl HttpSender {
    /// Build the sender and start its drain task. Must be called inside a
    /// tokio runtime. Does no I/O.
    pub fn new(config: HttpSenderConfig) -> Result<Self, SendError> {
        let endpoint = config.endpoint()?;
        let inner = Arc::new(Inner {
            config,
            endpoint,
            client: RwLock::new(build_client()?),
            batch: Mutex::new(Vec::new()),
            batch_bytes: AtomicUsize::new(0),
            spool_seq: AtomicU64::new(0),
            wake: Notify::new(),
            drain_lock: tokio::sync::Mutex::new(()),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(drain_loop(inner.clone(), cancel.clone()));

        Ok(Self {
            inner,
            cancel,
            stopped: AtomicBool::new(false),
            task: Mutex::new(Some(task)),
        })
    }

    pub fn spool_dir(&self) -> &Path {
        &self.inner.config.spool_dir
    }
}

async fn drain_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut interval = time::interval(inner.config.drain_timeout);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
            _ = inner.wake.notified() => {}
        }
        if let Err(e) = inner.drain().await {
            warn!(error = %e, "Drain cycle failed");
        }
    }

    if let Err(e) = inner.drain().await {
        error!(error = %e, "Final drain failed");
    }
    debug!("Drain task finished");
}

impl Inner {
    async fn drain(&self) -> Result<(), SendError> {
        let _guard = self.drain_lock.lock().await;

        let spool_ok = self.drain_spool().await;

        let batch = {
            let mut batch = self.batch.lock();
            self.batch_bytes.store(0, Ordering::SeqCst);
            std::mem::take(&mut *batch)
        };
        if batch.is_empty() {
            return Ok(());
        }

        let body = join_lines(&batch);
        if !spool_ok {
            // Listener still unreachable; keep order by queueing behind the spool.
            return self.spool(&body);
        }

        match self.post_with_retry(body.clone()).await {
            Outcome::Delivered | Outcome::Rejected => Ok(()),
            Outcome::Failed(e) => {
                warn!(error = %e, lines = batch.len(), "Batch delivery failed, spooling to disk");
                self.spool(&body)
            }
        }
    }

    /// Resend spooled batches oldest first. Returns false if one still failed.
    async fn drain_spool(&self) -> bool {
        let files = match list_spool(&self.config.spool_dir) {
            Ok(files) => files,
            Err(e) => {
                warn!(dir = %self.config.spool_dir.display(), error = %e, "Cannot list spool directory");
                return true;
            }
        };

        for path in files {
            let body = match tokio::fs::read(&path).await {
                Ok(body) => Bytes::from(body),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Cannot read spooled batch");
                    continue;
                }
            };
            match self.post_with_retry(body).await {
                Outcome::Delivered | Outcome::Rejected => {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!(file = %path.display(), error = %e, "Cannot remove spooled batch");
                    }
                }
                Outcome::Failed(e) => {
                    debug!(file = %path.display(), error = %e, "Spooled batch still undeliverable");
                    return false;
                }
            }
        }
        true
    }

    async fn post_with_retry(&self, body: Bytes) -> Outcome {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let client = self.client.read().clone();
            let result = client.post(self.endpoint.clone()).body(body.clone()).send().await;

            let err = match result {
                Ok(resp) if resp.status().is_success() => return Outcome::Delivered,
                Ok(resp) if is_permanent(resp.status()) => {
                    let status = resp.status().as_u16();
                    let text = resp.text().await.unwrap_or_default();
                    error!(status, body = %text, "Listener rejected batch, dropping");
                    return Outcome::Rejected;
                }
                Ok(resp) => SendError::Status(resp.status().as_u16()),
                Err(e) => SendError::Http(e),
            };

            if attempt >= max_attempts {
                return Outcome::Failed(err);
            }
            let backoff = self.config.backoff_base * 2u32.saturating_pow(attempt - 1);
            debug!(attempt, error = %err, backoff_ms = backoff.as_millis() as u64, "Retrying batch");
            time::sleep(backoff).await;
        }
    }

    fn spool(&self, body: &[u8]) -> Result<(), SendError> {
        let dir = &self.config.spool_dir;
        std::fs::create_dir_all(dir)?;

        match disk_usage_percent(dir) {
            Ok(usage) if usage >= f64::from(self.config.disk_threshold) => {
                error!(
                    usage = %format!("{:.1}", usage),
                    threshold = self.config.disk_threshold,
                    "Disk usage above threshold, dropping undeliverable batch"
                );
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Cannot read disk usage, spooling anyway"),
        }

        let seq = self.spool_seq.fetch_add(1, Ordering::SeqCst);
        let name = format!(
            "{:020}-{:06}.batch",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            seq
        );
        std::fs::write(dir.join(name), body)?;
        Ok(())
    }
}

fn is_permanent(status: StatusCode) -> bool {
    status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
}

fn join_lines(batch: &[Bytes]) -> Bytes {
    let size = batch.iter().map(|b| b.len() + 1).sum();
    let mut body = BytesMut::with_capacity(size);
    for (i, line) in batch.iter().enumerate() {
        if i > 0 {
            body.extend_from_slice(b"\n");
        }
        body.extend_from_slice(line);
    }
    body.freeze()
}

fn list_spool(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "batch"))
        .collect();
    files.sort();
    Ok(files)
}

fn disk_usage_percent(path: &Path) -> std::io::Result<f64> {
    let stat = nix::sys::statfs::statfs(path).map_err(std::io::Error::from)?;
    let blocks = stat.blocks() as f64;
    if blocks == 0.0 {
        return Ok(0.0);
    }
    let available = stat.blocks_available() as f64;
    Ok((blocks - available) * 100.0 / blocks)
}

#[async_trait]
impl Sender for HttpSender {
    fn send(&self, payload: Bytes) -> Result<(), SendError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SendError::Stopped);
        }
        let size = payload.len() + 1;
        self.inner.batch.lock().push(payload);
        let total = self.inner.batch_bytes.fetch_add(size, Ordering::SeqCst) + size;
        if total > self.inner.config.batch_limit {
            self.inner.wake.notify_one();
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), SendError> {
        self.inner.drain().await
    }

    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Drain task panicked");
            }
        }
        info!(url = %self.inner.config.url, "Sender stopped");
    }

    fn close_idle_connections(&self) {
        match build_client() {
            Ok(client) => *self.inner.client.write() = client,
            Err(e) => warn!(error = %e, "Cannot rebuild http client"),
        }
    }
}
