//! Engine facade.
//!
//! [`Engine`] owns the configuration and the lifecycle of everything else:
//! it starts the persistence workers, primes the parse channel semaphore,
//! hands parser tasks an [`EngineContext`], and exposes queueing, flushing,
//! progress, and plugin activation to callers.
//!
//! ```no_run
//! # async fn demo(storage: std::sync::Arc<dyn logfacts::storage::Storage>,
//! #               rules: std::sync::Arc<dyn logfacts::rules::LogRules>,
//! #               files: Vec<logfacts::models::LogFile>) -> anyhow::Result<()> {
//! use logfacts::config::EngineConfig;
//! use logfacts::engine::Engine;
//!
//! let engine = Engine::start(EngineConfig::default(), storage, rules).await?;
//! for handle in engine.submit_all(files)? {
//!     let report = handle.join().await?;
//!     println!("{}: {} facts", report.file.path.display(), report.file.facts_count);
//! }
//! engine.flush_and_wait("parse").await?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::{Config, EngineConfig, PluginsConfig};
use crate::error::{EngineError, EngineResult};
use crate::models::{LogFile, Statement};
use crate::parse::ParseHandle;
use crate::plugin::{ActivationContext, ActivationMode, Plugin, PluginDescriptor, PluginRegistry, PluginRejection};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::queue::{FactQueue, OperationId};
use crate::rules::LogRules;
use crate::semaphore::ParseChannels;
use crate::storage::{ConnectionRole, Storage, StorageConnection};
use crate::workers::{ShutdownReport, WorkerPool};

/// State shared by the facade, parser tasks and workers.
pub struct EngineContext {
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) rules: Arc<dyn LogRules>,
    pub(crate) progress: ProgressReporter,
    pub(crate) queue: Arc<FactQueue>,
    /// Workers run while this is set.
    pub(crate) alive: Arc<AtomicBool>,
    settings: RwLock<EngineConfig>,
    channels: Arc<ParseChannels>,
}

impl EngineContext {
    /// Current semaphore. Replaced on reconfigure; tasks keep the one they
    /// acquired from.
    pub(crate) fn channels(&self) -> Arc<ParseChannels> {
        self.channels.clone()
    }

    pub(crate) fn write_behind_active(&self) -> bool {
        self.settings.read().write_behind_active()
    }
}

pub struct Engine {
    ctx: Arc<EngineContext>,
    workers: tokio::sync::Mutex<Option<WorkerPool>>,
    stopped: AtomicBool,
    sync_conn: tokio::sync::Mutex<Option<Box<dyn StorageConnection>>>,
    plugin_settings: PluginsConfig,
    plugins: RwLock<PluginRegistry>,
}

impl Engine {
    /// Validate settings, prime `max_parse_channels` permits and start
    /// `persistence_workers` workers.
    pub async fn start(
        settings: EngineConfig,
        storage: Arc<dyn Storage>,
        rules: Arc<dyn LogRules>,
    ) -> EngineResult<Self> {
        settings
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let channels = Arc::new(ParseChannels::new(settings.max_parse_channels));
        channels.release_all();

        let queue = Arc::new(FactQueue::new(
            settings.queue_routing,
            settings.persistence_workers,
        ));
        let alive = Arc::new(AtomicBool::new(true));
        let pool = WorkerPool::start(
            settings.persistence_workers,
            queue.clone(),
            storage.clone(),
            alive.clone(),
            settings.idle_poll(),
        );

        tracing::info!(
            parse_channels = settings.max_parse_channels,
            workers = settings.persistence_workers,
            write_behind = settings.write_behind_active(),
            routing = ?settings.queue_routing,
            "engine started"
        );

        let ctx = Arc::new(EngineContext {
            storage,
            rules,
            progress: ProgressReporter::new(),
            queue,
            alive,
            settings: RwLock::new(settings),
            channels,
        });

        Ok(Self {
            ctx,
            workers: tokio::sync::Mutex::new(Some(pool)),
            stopped: AtomicBool::new(false),
            sync_conn: tokio::sync::Mutex::new(None),
            plugin_settings: PluginsConfig::default(),
            plugins: RwLock::new(PluginRegistry::new()),
        })
    }

    /// Start from a full config: engine settings plus plugin discovery
    /// settings.
    pub async fn from_config(
        config: &Config,
        storage: Arc<dyn Storage>,
        rules: Arc<dyn LogRules>,
    ) -> EngineResult<Self> {
        let mut engine = Self::start(config.engine.clone(), storage, rules).await?;
        engine.plugin_settings = config.plugins.clone();
        Ok(engine)
    }

    pub fn is_alive(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> EngineResult<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(EngineError::Stopped)
        }
    }

    pub fn settings(&self) -> EngineConfig {
        self.ctx.settings.read().clone()
    }

    pub fn channels(&self) -> Arc<ParseChannels> {
        self.ctx.channels()
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.ctx.storage.clone()
    }

    /// Operations waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.ctx.queue.len()
    }

    /// Queued plus in-flight operations.
    pub fn outstanding(&self) -> usize {
        self.ctx.queue.outstanding()
    }

    // ============ Parsing ============

    /// Start a parser task for one file. The task waits for a parse channel
    /// on its own; this call never blocks.
    pub fn submit_parse(&self, file: LogFile) -> EngineResult<ParseHandle> {
        self.ensure_alive()?;
        Ok(ParseHandle::spawn(self.ctx.clone(), file, false))
    }

    /// Submit a batch: emits `Setup(len)` and one `Step(1)` per finished file.
    pub fn submit_all(&self, files: Vec<LogFile>) -> EngineResult<Vec<ParseHandle>> {
        self.ensure_alive()?;
        self.ctx.progress.setup(files.len() as u64);
        Ok(files
            .into_iter()
            .map(|file| ParseHandle::spawn(self.ctx.clone(), file, true))
            .collect())
    }

    // ============ Persistence ============

    /// Queue a statement for the persistence workers.
    pub fn enqueue(&self, statement: Statement, caption: impl Into<String>) -> EngineResult<OperationId> {
        self.ensure_alive()?;
        Ok(self.ctx.queue.enqueue(None, caption.into(), statement))
    }

    /// Execute a statement now on the engine's own synchronous connection.
    pub async fn execute_now(&self, statement: &Statement) -> EngineResult<u64> {
        self.ensure_alive()?;
        let caption = "execute_now".to_string();

        let mut guard = self.sync_conn.lock().await;
        if guard.is_none() {
            let conn = self
                .ctx
                .storage
                .connect(ConnectionRole::Synchronous)
                .await
                .map_err(|source| EngineError::Storage {
                    caption: caption.clone(),
                    source,
                })?;
            *guard = Some(conn);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(EngineError::Stopped);
        };

        conn.execute(statement).await.map_err(|source| {
            tracing::warn!(caption = %caption, error = %source, "synchronous statement failed");
            EngineError::Storage { caption, source }
        })
    }

    /// Block until nothing is queued or in flight, emitting a `Step` per
    /// poll with the number of operations drained since the last one.
    ///
    /// A drain barrier, not a watermark: operations enqueued by others while
    /// waiting are waited for too.
    pub async fn flush_and_wait(&self, label: &str) -> EngineResult<()> {
        let poll = self.ctx.settings.read().flush_poll();
        let mut last = self.ctx.queue.outstanding();

        loop {
            let outstanding = self.ctx.queue.outstanding();
            if outstanding == 0 {
                self.ctx.progress.completed(label, "flushed");
                return Ok(());
            }
            self.ensure_alive()?;
            if self.ctx.settings.read().persistence_workers == 0 {
                tracing::warn!(label, pending = outstanding, "flush requested with no workers");
                return Err(EngineError::NoWorkers {
                    pending: outstanding,
                });
            }

            self.ctx.progress.step(
                last.saturating_sub(outstanding) as u64,
                format!("{}: {} pending", label, outstanding),
            );
            last = outstanding;
            tokio::time::sleep(poll).await;
        }
    }

    // ============ Progress ============

    /// Register the single progress observer, replacing any previous one.
    pub fn subscribe(&self) -> UnboundedReceiver<ProgressEvent> {
        self.ctx.progress.subscribe()
    }

    pub fn report(&self, event: ProgressEvent) {
        self.ctx.progress.report(event);
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.ctx.progress
    }

    // ============ Plugins ============

    /// Load Lua plugins from `dir` using the configured naming pattern.
    /// Bad candidates are rejected one by one; this never fails.
    ///
    /// Reads and runs plugin scripts on the calling thread.
    pub fn discover_plugins(&self, dir: &Path) -> Vec<PluginDescriptor> {
        self.plugins.write().discover(
            dir,
            &self.plugin_settings.pattern,
            self.plugin_settings.timeout_secs,
        )
    }

    /// Register a compiled-in plugin under the same validation rules as
    /// discovered ones.
    /// Register a compiled-in plugin. Validation failures and name clashes
    /// come back as [`EngineError::PluginRejected`] and are also kept in
    /// [`plugin_rejections`](Self::plugin_rejections).
    pub fn register_plugin(&self, source: &str, plugin: Arc<dyn Plugin>) -> EngineResult<PluginDescriptor> {
        Ok(self.plugins.write().register(source, plugin)?)
    }

    pub fn plugins(&self) -> Vec<PluginDescriptor> {
        self.plugins.read().plugins().to_vec()
    }

    pub fn plugin_rejections(&self) -> Vec<PluginRejection> {
        self.plugins.read().rejections().to_vec()
    }

    pub fn plugin(&self, name: &str) -> Option<PluginDescriptor> {
        self.plugins.read().find(name).cloned()
    }

    pub fn plugins_for(&self, log_type: &str, mode: ActivationMode) -> Vec<PluginDescriptor> {
        self.plugins.read().matching(log_type, mode)
    }

    /// Build the context a plugin sees on activation.
    pub fn activation_context(
        &self,
        descriptor: &PluginDescriptor,
        project_id: i64,
        log_id: Option<i64>,
    ) -> EngineResult<ActivationContext> {
        let table = self
            .ctx
            .rules
            .table_for(&descriptor.log_type)
            .ok_or_else(|| EngineError::UnknownLogType(descriptor.log_type.clone()))?;
        Ok(ActivationContext {
            storage: self.ctx.storage.clone(),
            table,
            log_type: descriptor.log_type.clone(),
            project_id,
            log_id,
        })
    }

    /// Run a plugin's `activate`. Failures and panics are contained,
    /// reported as an `Error` progress event, and returned.
    pub async fn activate(
        &self,
        descriptor: &PluginDescriptor,
        ctx: &ActivationContext,
    ) -> EngineResult<()> {
        self.ensure_alive()?;
        let entry = descriptor.entry();
        let activation = ctx.clone();
        let name = descriptor.name.clone();

        tracing::debug!(plugin = %name, project_id = ctx.project_id, log_id = ?ctx.log_id, "activating plugin");
        let outcome = match tokio::spawn(async move { entry.activate(&activation).await }).await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("activation panicked: {}", e)),
        };

        match outcome {
            Ok(()) => {
                tracing::info!(plugin = %name, "plugin activated");
                self.ctx.progress.completed(name, "activated");
                Ok(())
            }
            Err(source) => {
                tracing::warn!(plugin = %name, source = %descriptor.source, error = %source, "plugin activation failed");
                self.ctx.progress.error(name.as_str(), format!("{:#}", source));
                Err(EngineError::PluginActivation { plugin: name, source })
            }
        }
    }

    // ============ Lifecycle ============

    /// Apply new engine settings.
    ///
    /// Workers are quiesced (alive off, joined, pause, alive on) and a new
    /// pool is started; queued operations are carried over. The parse
    /// channels are resized in place: tasks already running keep their
    /// permits, and waiting tasks start only once fewer than the new
    /// `max_parse_channels` are held.
    pub async fn reconfigure(&self, settings: EngineConfig) -> EngineResult<()> {
        self.ensure_alive()?;
        settings
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let mut guard = self.workers.lock().await;
        if let Some(pool) = guard.take() {
            let report = pool.stop().await;
            tracing::debug!(
                executed = report.executed,
                failed = report.failed,
                carried_over = report.abandoned,
                "workers quiesced"
            );
        }
        tokio::time::sleep(settings.quiesce()).await;

        self.ctx
            .queue
            .relane(settings.queue_routing, settings.persistence_workers);

        self.ctx.channels.resize(settings.max_parse_channels);

        tracing::info!(
            parse_channels = settings.max_parse_channels,
            workers = settings.persistence_workers,
            write_behind = settings.write_behind_active(),
            routing = ?settings.queue_routing,
            "engine reconfigured"
        );

        let workers = settings.persistence_workers;
        let idle = settings.idle_poll();
        *self.ctx.settings.write() = settings;

        self.ctx.alive.store(true, Ordering::Release);
        *guard = Some(WorkerPool::start(
            workers,
            self.ctx.queue.clone(),
            self.ctx.storage.clone(),
            self.ctx.alive.clone(),
            idle,
        ));
        Ok(())
    }

    /// Clear the alive flag and wait for workers to finish their current
    /// operation. Anything still queued is abandoned and counted.
    pub async fn shutdown(&self) -> EngineResult<ShutdownReport> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Err(EngineError::Stopped);
        }

        let pool = self.workers.lock().await.take();
        let report = match pool {
            Some(pool) => pool.stop().await,
            None => {
                self.ctx.alive.store(false, Ordering::Release);
                ShutdownReport {
                    abandoned: self.ctx.queue.len(),
                    ..ShutdownReport::default()
                }
            }
        };
        self.ctx.channels().close();

        if let Some(conn) = self.sync_conn.lock().await.take() {
            if let Err(e) = conn.close().await {
                tracing::warn!(error = %e, "failed to close synchronous connection");
            }
        }

        if report.abandoned > 0 {
            tracing::warn!(abandoned = report.abandoned, "operations left in queue at shutdown");
        }
        tracing::info!(
            executed = report.executed,
            failed = report.failed,
            "engine stopped"
        );
        Ok(report)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.ctx.alive.store(false, Ordering::Release);
        self.ctx.queue.wake_all();
    }
}
