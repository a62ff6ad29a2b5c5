//! Container — one container's pipeline from FIFO to store and sender.
//!
//! Two tasks per container:
//! - the reader decodes frames, reassembles partials, groups lines, enriches
//!   and pushes events onto a bounded queue (blocking when it is full)
//! - the sender task serializes queued events and hands them to the shared
//!   [`Sender`]
//!
//! [`ContainerPipeline::close`] stops the reader, lets the sender task drain
//! whatever was admitted to the queue, and returns once it has.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_stream::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::conf::{DriverConfig, MultilineConfig};
use crate::sender::Sender;
use crate::store::{LocalStore, StoredEntry};
use crate::transport::{FrameReader, LogEntryCodec, LogStream, TransportError};
use super::enrich::{Metadata, OutboundMessage};
use super::model::{AggregatedEvent, LogFragment, LogRecord};
use super::multiline::{MultilineAggregator, MultilineError};
use super::partial::PartialBuffer;

const READ_RETRY_DELAY: Duration = Duration::from_millis(100);
/// After cancel, the reader keeps going until the stream has been quiet this long.
const DRAIN_IDLE: Duration = Duration::from_millis(20);

/// Queue and buffer sizing taken from the process config.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub channel_size: usize,
    pub max_msg_buffer_size: usize,
    pub partial_timeout: Duration,
}

impl From<&DriverConfig> for PipelineSettings {
    fn from(config: &DriverConfig) -> Self {
        Self {
            channel_size: config.channel_size,
            max_msg_buffer_size: config.max_msg_buffer_size,
            partial_timeout: config.partial_timeout,
        }
    }
}

/// Everything a pipeline needs, already opened and validated.
pub struct PipelineParts {
    pub container_id: String,
    pub file: String,
    pub stream: LogStream,
    pub metadata: Metadata,
    pub multiline: Option<MultilineConfig>,
    pub store: Arc<LocalStore>,
    pub sender: Arc<dyn Sender>,
    pub settings: PipelineSettings,
}

/// Earliest instant at which some buffer of the reader goes stale.
struct Deadline {
    epoch: Instant,
    nanos: AtomicU64,
}

impl Deadline {
    const NONE: u64 = u64::MAX;

    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            nanos: AtomicU64::new(Self::NONE),
        }
    }

    fn set(&self, at: Option<Instant>) {
        let nanos = at
            .map(|at| at.saturating_duration_since(self.epoch).as_nanos() as u64)
            .unwrap_or(Self::NONE);
        self.nanos.store(nanos, Ordering::Release);
    }

    fn is_due(&self, now: Instant) -> bool {
        let nanos = self.nanos.load(Ordering::Acquire);
        nanos != Self::NONE && now >= self.epoch + Duration::from_nanos(nanos)
    }
}

pub struct ContainerPipeline {
    container_id: String,
    file: String,
    store: Arc<LocalStore>,
    cancel: CancellationToken,
    sweep: Arc<Notify>,
    deadline: Arc<Deadline>,
    closed: AtomicBool,
    tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<usize>)>>,
}

impl ContainerPipeline {
    /// Spawn the reader and sender tasks.
    pub fn start(parts: PipelineParts) -> Result<Arc<Self>, MultilineError> {
        let aggregator = parts
            .multiline
            .as_ref()
            .map(MultilineAggregator::new)
            .transpose()?;

        let (tx, rx) = mpsc::channel(parts.settings.channel_size.max(1));
        let cancel = CancellationToken::new();
        let sweep = Arc::new(Notify::new());
        let deadline = Arc::new(Deadline::new());

        let reader = Reader {
            container_id: parts.container_id.clone(),
            sources: HashMap::new(),
            prototype: aggregator,
            multiline_timeout: parts.multiline.as_ref().map(|m| m.timeout),
            settings: parts.settings,
            emitter: Emitter {
                metadata: parts.metadata,
                store: parts.store.clone(),
                tx,
            },
            deadline: deadline.clone(),
        };
        let frames = FrameReader::new(parts.stream, LogEntryCodec::new());

        let reader_task = tokio::spawn(reader.run(frames, cancel.clone(), sweep.clone()));
        let sender_task = tokio::spawn(send_loop(rx, parts.sender, parts.container_id.clone()));

        info!(container_id = %parts.container_id, file = %parts.file, "Started logging pipeline");

        Ok(Arc::new(Self {
            container_id: parts.container_id,
            file: parts.file,
            store: parts.store,
            cancel,
            sweep,
            deadline,
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Some((reader_task, sender_task))),
        }))
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn store(&self) -> Arc<LocalStore> {
        self.store.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Ask the reader to flush buffers that outlived their timeout.
    /// Returns true when a flush was requested.
    pub fn flush_if_stale(&self, now: Instant) -> bool {
        if self.is_closed() || !self.deadline.is_due(now) {
            return false;
        }
        self.sweep.notify_one();
        true
    }

    /// Stop reading, drain the send queue into the sender, close the store.
    /// Later calls return immediately.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let tasks = self.tasks.lock().take();
        let Some((reader, sender)) = tasks else {
            return;
        };

        if let Err(e) = reader.await {
            error!(container_id = %self.container_id, error = %e, "Reader task panicked");
        }
        self.store.close();

        match sender.await {
            Ok(sent) => info!(container_id = %self.container_id, sent, "Pipeline drained"),
            Err(e) => error!(container_id = %self.container_id, error = %e, "Sender task panicked"),
        }
    }
}

struct SourceState {
    partial: PartialBuffer,
    aggregator: Option<MultilineAggregator>,
}

struct Emitter {
    metadata: Metadata,
    store: Arc<LocalStore>,
    tx: mpsc::Sender<OutboundMessage>,
}

impl Emitter {
    async fn emit(&self, event: AggregatedEvent) {
        let entry = StoredEntry::new(&event.bytes, &event.source, event.timestamp_nanos);
        if let Err(e) = self.store.write(&entry) {
            warn!(error = %e, "Failed to write event to local store");
        }

        if event.bytes.iter().all(u8::is_ascii_whitespace) {
            trace!("Skipping blank event");
            return;
        }

        let message = self.metadata.enrich(&event);
        if self.tx.send(message).await.is_err() {
            warn!("Send queue closed, dropping event");
        }
    }
}

struct Reader {
    container_id: String,
    sources: HashMap<String, SourceState>,
    prototype: Option<MultilineAggregator>,
    multiline_timeout: Option<Duration>,
    settings: PipelineSettings,
    emitter: Emitter,
    deadline: Arc<Deadline>,
}

fn is_terminal(err: &TransportError) -> bool {
    match err {
        TransportError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::NotConnected
        ),
        TransportError::Encode(_) => false,
    }
}

impl Reader {
    async fn run(
        mut self,
        mut frames: FrameReader<LogStream>,
        cancel: CancellationToken,
        sweep: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let drained = self.drain_buffered(&mut frames).await;
                    debug!(container_id = %self.container_id, drained, "Reader cancelled");
                    break;
                }
                _ = sweep.notified() => {
                    self.flush_expired(Instant::now()).await;
                }
                frame = frames.next() => match frame {
                    Some(Ok(entry)) => self.handle(LogFragment::from(entry)).await,
                    Some(Err(e)) if is_terminal(&e) => {
                        debug!(container_id = %self.container_id, error = %e, "Log stream closed");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(container_id = %self.container_id, error = %e, "Error reading log stream, retrying");
                        // Buffered partial state lives in `self`, not in the framer.
                        frames = FrameReader::new(frames.into_inner(), LogEntryCodec::new());
                        tokio::time::sleep(READ_RETRY_DELAY).await;
                    }
                    None => {
                        debug!(container_id = %self.container_id, "Log stream reached EOF");
                        break;
                    }
                },
            }
            self.publish_deadline();
        }

        self.finish().await;
    }

    /// Read whatever the writer already put in the stream. The FIFO is held
    /// open read-write, so EOF never comes; stop once it goes quiet.
    async fn drain_buffered(&mut self, frames: &mut FrameReader<LogStream>) -> usize {
        let mut drained = 0;
        loop {
            match tokio::time::timeout(DRAIN_IDLE, frames.next()).await {
                Ok(Some(Ok(entry))) => {
                    self.handle(LogFragment::from(entry)).await;
                    drained += 1;
                }
                Ok(Some(Err(e))) => {
                    if !is_terminal(&e) {
                        warn!(container_id = %self.container_id, error = %e, "Error reading log stream while draining");
                    }
                    return drained;
                }
                Ok(None) | Err(_) => return drained,
            }
        }
    }

    async fn handle(&mut self, fragment: LogFragment) {
        let now = Instant::now();
        let settings = &self.settings;
        let prototype = &self.prototype;
        let state = self
            .sources
            .entry(fragment.source.clone())
            .or_insert_with(|| SourceState {
                partial: PartialBuffer::new(settings.max_msg_buffer_size, settings.partial_timeout),
                aggregator: prototype.clone(),
            });
        let mut events = Vec::new();

        if state.partial.is_expired(now) {
            if let Some(stale) = state.partial.flush() {
                events.extend(aggregate(&mut state.aggregator, stale));
            }
        }
        if let Some(record) = state.partial.add(&fragment) {
            events.extend(aggregate(&mut state.aggregator, record));
        }

        for event in events {
            self.emitter.emit(event).await;
        }
    }

    async fn flush_expired(&mut self, now: Instant) {
        let mut events = Vec::new();
        for state in self.sources.values_mut() {
            if state.partial.is_expired(now) {
                if let Some(record) = state.partial.flush() {
                    events.extend(aggregate(&mut state.aggregator, record));
                }
            }
            if let Some(agg) = state.aggregator.as_mut() {
                if agg.is_expired(now) {
                    events.extend(agg.flush());
                }
            }
        }
        if !events.is_empty() {
            debug!(container_id = %self.container_id, count = events.len(), "Flushed stale buffers");
        }
        for event in events {
            self.emitter.emit(event).await;
        }
    }

    /// Flush everything still buffered; runs once when the stream ends.
    async fn finish(mut self) {
        let mut events = Vec::new();
        for (source, state) in self.sources.iter_mut() {
            if !state.partial.is_empty() {
                warn!(
                    container_id = %self.container_id,
                    source = %source,
                    bytes = state.partial.len(),
                    "Flushing incomplete partial log line on shutdown"
                );
            }
            if let Some(record) = state.partial.flush() {
                events.extend(aggregate(&mut state.aggregator, record));
            }
            if let Some(agg) = state.aggregator.as_mut() {
                events.extend(agg.flush());
            }
        }
        for event in events {
            self.emitter.emit(event).await;
        }
        self.deadline.set(None);
        // Dropping the emitter closes the queue; the sender task drains and exits.
    }

    fn publish_deadline(&self) {
        let mut earliest: Option<Instant> = None;
        for state in self.sources.values() {
            let partial = state
                .partial
                .pending_since()
                .map(|t| t + self.settings.partial_timeout);
            let grouped = match (&state.aggregator, self.multiline_timeout) {
                (Some(agg), Some(timeout)) => agg.pending_since().map(|t| t + timeout),
                _ => None,
            };
            for at in [partial, grouped].into_iter().flatten() {
                earliest = Some(earliest.map_or(at, |e| e.min(at)));
            }
        }
        self.deadline.set(earliest);
    }
}

fn aggregate(
    aggregator: &mut Option<MultilineAggregator>,
    record: LogRecord,
) -> Vec<AggregatedEvent> {
    match aggregator {
        Some(agg) => agg.add(record),
        None => vec![AggregatedEvent::from(record)],
    }
}

async fn send_loop(
    mut rx: mpsc::Receiver<OutboundMessage>,
    sender: Arc<dyn Sender>,
    container_id: String,
) -> usize {
    let mut sent = 0usize;
    while let Some(message) = rx.recv().await {
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                error!(container_id = %container_id, error = %e, "Failed to serialize event, dropping");
                continue;
            }
        };
        match sender.send(Bytes::from(payload)) {
            Ok(()) => sent += 1,
            Err(e) => warn!(container_id = %container_id, error = %e, "Failed to enqueue event"),
        }
    }
    sent
}
