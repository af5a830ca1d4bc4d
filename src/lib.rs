//! polyglot-press: LLM-backed post translation with a priority queue,
//! progress tracking and source/translation bookkeeping.
//! Main library: service wiring, tracing setup and the server entry point.

pub mod api;
pub mod config;
pub mod content;
pub mod decompose;
pub mod engine;
pub mod metrics;
pub mod progress;
pub mod queue;
pub mod relationship;
pub mod storage;
pub mod throttle;
pub mod translate;
pub mod translation_log;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use config::Config;
use content::{PostStore, SqlitePostStore};
use engine::{EngineParts, TranslationEngine};
use metrics::MetricsRegistry;
use progress::ProgressTracker;
use queue::{QueueStore, QueueWorker};
use relationship::RelationshipStore;
use storage::{Database, StoreResult};
use throttle::Throttle;
use translate::cache::TranslationCache;
use translate::claude::ClaudeClient;
use translate::glossary::Glossary;
use translate::Translator;
use translation_log::TranslationLog;

const DEFAULT_LOG_FILTER: &str = "polyglot_press=debug,tower_http=info";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

/// Stores and shared services, opened from one config.
pub struct AppContext {
    pub config: Config,
    pub posts: Arc<SqlitePostStore>,
    pub relationships: Arc<RelationshipStore>,
    pub log: Arc<TranslationLog>,
    pub queue: Arc<QueueStore>,
    pub progress: Arc<ProgressTracker>,
    pub metrics: Arc<MetricsRegistry>,
}

impl AppContext {
    /// Open every store on the configured database. Must run inside a Tokio
    /// runtime (the log writer is a task).
    pub fn open(config: Config) -> StoreResult<Self> {
        let db = Database::file(&config.storage.database_path);
        Self::open_with(config, &db)
    }

    pub fn open_with(config: Config, db: &Database) -> StoreResult<Self> {
        let ctx = Self {
            posts: Arc::new(SqlitePostStore::open(db)?),
            relationships: Arc::new(RelationshipStore::open(db)?),
            log: TranslationLog::open(db)?,
            queue: Arc::new(QueueStore::open(db, config.queue.retry_delay_secs)?),
            progress: Arc::new(ProgressTracker::new(Duration::from_secs(
                config.translation.progress_ttl_secs,
            ))),
            metrics: Arc::new(MetricsRegistry::new()),
            config,
        };
        info!(database = ?db, "stores opened");
        Ok(ctx)
    }

    /// Build the engine around a translator backend.
    pub fn engine(&self, translator: Arc<dyn Translator>) -> Arc<TranslationEngine> {
        let cfg = &self.config;
        let glossary = match &cfg.translation.glossary_path {
            Some(path) => Glossary::load_from_file(path).unwrap_or_else(|e| {
                warn!(error = %e, path = %path.display(), "glossary load failed, using empty");
                Glossary::empty()
            }),
            None => Glossary::empty(),
        };
        info!(entries = glossary.len(), version = glossary.version(), "glossary ready");

        let posts: Arc<dyn PostStore> = self.posts.clone();
        Arc::new(TranslationEngine::new(EngineParts {
            posts,
            translator,
            throttle: Arc::new(Throttle::new(cfg.throttle.max_calls, cfg.throttle.period())),
            cache: Arc::new(TranslationCache::new(
                cfg.translation.cache_capacity,
                Duration::from_secs(cfg.translation.cache_ttl_secs),
            )),
            glossary: Arc::new(glossary),
            relationships: Arc::clone(&self.relationships),
            log: Arc::clone(&self.log),
            progress: Arc::clone(&self.progress),
            metrics: Arc::clone(&self.metrics),
            retry: cfg.retry.clone(),
            publish_status: cfg.translation.publish_status.clone(),
            source_language: cfg.translation.source_language.clone(),
        }))
    }

    /// Engine backed by the Claude client (key from the environment).
    pub fn claude_engine(&self) -> anyhow::Result<Arc<TranslationEngine>> {
        let client = ClaudeClient::from_env(&self.config.api)?;
        info!(model = %self.config.api.model, "Claude client initialized");
        Ok(self.engine(Arc::new(client)))
    }

    pub fn api_state(&self, engine: Arc<TranslationEngine>) -> api::ApiState {
        api::ApiState {
            engine,
            queue: Arc::clone(&self.queue),
            default_languages: self.config.translation.target_languages.clone(),
            default_priority: self.config.queue.default_priority,
            default_max_attempts: self.config.queue.default_max_attempts,
        }
    }
}

/// Run the HTTP API and the queue worker until Ctrl-C.
pub async fn serve(ctx: AppContext) -> anyhow::Result<()> {
    let engine = ctx.claude_engine()?;
    let shutdown = CancellationToken::new();

    let retention = ctx.config.storage.log_retention_days;
    if retention > 0 {
        let pruned = ctx.log.cleanup_older_than_days(retention)?;
        info!(pruned, retention_days = retention, "translation log pruned");
    }

    ProgressTracker::start_sweep_loop(
        Arc::clone(&ctx.progress),
        Duration::from_secs(60),
        shutdown.clone(),
    );
    let worker = Arc::new(QueueWorker::new(
        Arc::clone(&ctx.queue),
        Arc::clone(&engine),
        Duration::from_millis(ctx.config.queue.poll_interval_ms),
        ctx.config.queue.batch_size,
    ));
    let worker_handle = worker.spawn(shutdown.clone());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        signal.cancel();
    });

    let state = ctx.api_state(engine);
    let result = api::serve(state, &ctx.config.server.bind, shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = worker_handle.await {
        warn!(error = %e, "queue worker task ended abnormally");
    }
    if !ctx.log.flush().await {
        warn!("translation log could not be flushed on shutdown");
    }
    info!("polyglot-press stopped");
    result
}
