//! Manager — registry of running pipelines, lifecycle and stale-buffer sweep.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use futures_util::Stream;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conf::{DriverConfig, LogOptions};
use crate::error::{DriverError, DriverResult};
use crate::sender::{fingerprint, HttpSender, HttpSenderConfig, SendError, Sender, SenderRegistry};
use crate::store::{LocalStore, ReadConfig, StoreError, StoredEntry};
use crate::transport::{self, LogStream};
use super::container::{ContainerPipeline, PipelineParts, PipelineSettings};
use super::enrich::Metadata;
use super::model::ContainerInfo;
use super::multiline::MultilineAggregator;

/// Destination a new sender is built for.
#[derive(Debug, Clone)]
pub struct SenderTarget {
    pub url: String,
    pub token: String,
    pub source_type: String,
    pub fingerprint: String,
    pub spool_dir: PathBuf,
}

pub type SenderFactory =
    Arc<dyn Fn(&SenderTarget) -> Result<Arc<dyn Sender>, SendError> + Send + Sync>;

/// Options and metadata checked before any resource is opened.
struct Prepared {
    options: LogOptions,
    metadata: Metadata,
}

impl Prepared {
    fn new(info: &ContainerInfo) -> DriverResult<Self> {
        let options = LogOptions::parse(&info.config, &info.id)?;
        if let Some(multiline) = &options.multiline {
            MultilineAggregator::new(multiline)?;
        }
        let host = hostname::get().map_err(DriverError::Hostname)?;
        let metadata = Metadata::new(&options, info, host.to_string_lossy())?;
        Ok(Self { options, metadata })
    }
}

struct Running {
    pipeline: Arc<ContainerPipeline>,
    token: String,
}

#[derive(Default)]
struct Indices {
    by_stream: HashMap<String, Running>,
    /// Stores outlive their pipeline so `docker logs` works after stop.
    by_container: HashMap<String, Arc<LocalStore>>,
    /// Stopped container ids, oldest first.
    retired: VecDeque<String>,
}

impl Indices {
    /// Record that `container_id` stopped and forget the stores of the
    /// oldest stopped containers beyond `keep`.
    fn retire(&mut self, container_id: &str, keep: usize) {
        self.retired.retain(|id| id != container_id);
        self.retired.push_back(container_id.to_string());

        while self.retired.len() > keep {
            let Some(id) = self.retired.pop_front() else {
                break;
            };
            let running = self.by_stream.values().any(|r| r.pipeline.container_id() == id);
            if !running {
                self.by_container.remove(&id);
                debug!(container_id = %id, "Forgot local store of stopped container");
            }
        }
    }
}

pub struct PipelineManager {
    config: DriverConfig,
    registry: Arc<SenderRegistry>,
    factory: SenderFactory,
    indices: Mutex<Indices>,
    drains: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl PipelineManager {
    pub fn new(config: DriverConfig, factory: SenderFactory) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Arc::new(SenderRegistry::new()),
            factory,
            indices: Mutex::new(Indices::default()),
            drains: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            sweep: Mutex::new(None),
        })
    }

    /// Manager whose senders ship to the Logz.io listener over HTTP.
    pub fn with_http_senders(config: DriverConfig) -> Arc<Self> {
        let drain_timeout = config.drain_timeout;
        let disk_threshold = config.disk_threshold;
        let factory: SenderFactory = Arc::new(move |target: &SenderTarget| {
            let mut http = HttpSenderConfig::new(
                &target.url,
                &target.token,
                &target.source_type,
                target.spool_dir.clone(),
            );
            http.drain_timeout = drain_timeout;
            http.disk_threshold = disk_threshold;
            Ok(Arc::new(HttpSender::new(http)?) as Arc<dyn Sender>)
        });
        Self::new(config, factory)
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn registry(&self) -> &SenderRegistry {
        &self.registry
    }

    /// Validate the container's options, then open the FIFO at `file` and
    /// start a pipeline reading it.
    pub async fn start_logging(&self, file: &str, info: ContainerInfo) -> DriverResult<()> {
        self.ensure_absent(file)?;
        let prepared = Prepared::new(&info)?;
        let stream = transport::fifo::open(file).map_err(|source| DriverError::Stream {
            path: file.to_string(),
            source,
        })?;
        self.launch(file, info, prepared, stream).await
    }

    /// Start a pipeline over an already opened stream.
    pub async fn attach(&self, file: &str, info: ContainerInfo, stream: LogStream) -> DriverResult<()> {
        self.ensure_absent(file)?;
        let prepared = Prepared::new(&info)?;
        self.launch(file, info, prepared, stream).await
    }

    async fn launch(
        &self,
        file: &str,
        info: ContainerInfo,
        prepared: Prepared,
        stream: LogStream,
    ) -> DriverResult<()> {
        let Prepared { options, metadata } = prepared;
        let store = LocalStore::open(self.store_path(&info))?;

        let fp = fingerprint(&options.token, &options.dir_path, options.format.as_str());
        let target = SenderTarget {
            url: options.url.clone(),
            token: options.token.clone(),
            source_type: options.source_type.clone(),
            spool_dir: PathBuf::from(&options.dir_path).join(&fp),
            fingerprint: fp.clone(),
        };
        let factory = self.factory.clone();
        let acquired = self.registry.acquire(&options.token, &fp, || factory(&target)).await;
        let (sender, created) = match acquired {
            Ok(acquired) => acquired,
            Err(e) => {
                store.close();
                return Err(e.into());
            }
        };
        debug!(container_id = %info.id, fingerprint = %fp, created, "Acquired sender");

        let started = ContainerPipeline::start(PipelineParts {
            container_id: info.id.clone(),
            file: file.to_string(),
            stream,
            metadata,
            multiline: options.multiline.clone(),
            store: store.clone(),
            sender,
            settings: PipelineSettings::from(&self.config),
        });
        let pipeline = match started {
            Ok(pipeline) => pipeline,
            Err(e) => {
                store.close();
                self.registry.release(&options.token).await;
                return Err(e.into());
            }
        };

        let duplicate = {
            let mut indices = self.indices.lock();
            if indices.by_stream.contains_key(file) {
                true
            } else {
                indices.by_stream.insert(
                    file.to_string(),
                    Running {
                        pipeline: pipeline.clone(),
                        token: options.token.clone(),
                    },
                );
                indices.by_container.insert(info.id.clone(), store);
                false
            }
        };
        if duplicate {
            pipeline.close().await;
            self.registry.release(&options.token).await;
            return Err(DriverError::AlreadyExists(file.to_string()));
        }

        info!(container_id = %info.id, file = %file, "Logging started");
        Ok(())
    }

    /// Detach the pipeline reading `file`. Draining continues in the
    /// background; unknown files are ignored.
    pub fn stop_logging(&self, file: &str) -> DriverResult<()> {
        let running = {
            let mut indices = self.indices.lock();
            let running = indices.by_stream.remove(file);
            if let Some(running) = &running {
                indices.retire(running.pipeline.container_id(), self.config.retained_stores);
            }
            running
        };
        let Some(running) = running else {
            debug!(file = %file, "StopLogging for unknown stream, ignoring");
            return Ok(());
        };

        info!(container_id = %running.pipeline.container_id(), file = %file, "Logging stopped, draining");
        let registry = Arc::clone(&self.registry);
        let Running { pipeline, token } = running;
        let handle = tokio::spawn(async move {
            pipeline.close().await;
            registry.release(&token).await;
        });

        let mut drains = self.drains.lock();
        drains.retain(|h| !h.is_finished());
        drains.push(handle);
        Ok(())
    }

    /// Stream stored entries for a container.
    pub fn read_logs(
        &self,
        container_id: &str,
        config: ReadConfig,
    ) -> DriverResult<impl Stream<Item = Result<StoredEntry, StoreError>> + Send + 'static> {
        let store = self
            .indices
            .lock()
            .by_container
            .get(container_id)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(container_id.to_string()))?;
        Ok(store.watch(config))
    }

    pub fn active(&self) -> usize {
        self.indices.lock().by_stream.len()
    }

    /// Start the periodic stale-buffer sweep.
    pub fn start_sweep(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = time::interval(manager.config.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!(interval = ?manager.config.sweep_interval, "Starting stale buffer sweep");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let flushed = manager.sweep_once(Instant::now());
                        if flushed > 0 {
                            debug!(flushed, "Requested flush of stale buffers");
                        }
                    }
                }
            }
        });
        *self.sweep.lock() = Some(handle);
    }

    /// Ask every pipeline with expired buffers to flush them.
    pub fn sweep_once(&self, now: Instant) -> usize {
        let pipelines: Vec<Arc<ContainerPipeline>> = self
            .indices
            .lock()
            .by_stream
            .values()
            .map(|r| r.pipeline.clone())
            .collect();

        pipelines
            .iter()
            .filter(|pipeline| pipeline.flush_if_stale(now))
            .count()
    }

    /// Stop every pipeline and wait for all drains, including ones started by
    /// earlier `stop_logging` calls.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let sweep = self.sweep.lock().take();
        if let Some(sweep) = sweep {
            let _ = sweep.await;
        }

        let running: Vec<Running> = {
            let mut indices = self.indices.lock();
            indices.by_stream.drain().map(|(_, r)| r).collect()
        };
        info!(pipelines = running.len(), "Shutting down logging pipelines");

        join_all(running.into_iter().map(|r| async move {
            r.pipeline.close().await;
            self.registry.release(&r.token).await;
        }))
        .await;

        let drains: Vec<JoinHandle<()>> = std::mem::take(&mut *self.drains.lock());
        for result in join_all(drains).await {
            if let Err(e) = result {
                warn!(error = %e, "Drain task failed");
            }
        }
    }

    fn ensure_absent(&self, file: &str) -> DriverResult<()> {
        if self.indices.lock().by_stream.contains_key(file) {
            return Err(DriverError::AlreadyExists(file.to_string()));
        }
        Ok(())
    }

    fn store_path(&self, info: &ContainerInfo) -> PathBuf {
        if info.log_path.is_empty() {
            PathBuf::from(&self.config.log_root)
                .join(&info.id)
                .join("json.log")
        } else {
            PathBuf::from(&info.log_path)
        }
    }
}
