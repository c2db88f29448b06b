//! Warning-workflow engine for regional geological-hazard risk
//!
//! Fuses heterogeneous meteorological and geological signals into
//! per-region risk warnings and streams incremental updates to subscribers.
//! The crate exposes typed operations for an outer API layer; it serves no
//! HTTP traffic itself.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::broadcast;

pub mod config;
pub mod error;
pub mod external;
pub mod logging;
pub mod models;
pub mod services;

pub use config::Config;
pub use error::{EngineError, EngineResult};
pub use models::DeltaMessage;

use external::{FetchClient, LlmClient, SourceRegistry};
use services::{
    CacheService, CollectionService, DeltaPublisher, PipelineService, RunController,
    ScraperRuntime, WarningStore,
};

/// Wired engine instance: database pool plus all services.
pub struct Engine {
    config: Arc<Config>,
    db: PgPool,
    controller: Arc<RunController>,
    publisher: Arc<DeltaPublisher>,
}

impl Engine {
    /// Connects to the database, runs migrations, loads the station map,
    /// and wires the service graph.
    pub async fn connect(config: Config) -> EngineResult<Self> {
        let db = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&db)
            .await
            .map_err(|e| EngineError::Internal(format!("migration failed: {e}")))?;

        let config = Arc::new(config);
        let cache = Arc::new(CacheService::new(db.clone()));
        let store = Arc::new(WarningStore::new(db.clone()));
        let http = Arc::new(FetchClient::new(&config));
        let runtime = Arc::new(ScraperRuntime::new(&config));

        let stations = Arc::new(store.station_map().await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "station map unavailable; CMA live mode degraded");
            Default::default()
        }));

        let registry = Arc::new(SourceRegistry::build(
            config.clone(),
            http.clone(),
            cache.clone(),
            runtime.clone(),
            stations,
        )?);
        let collector = Arc::new(CollectionService::new(
            registry.clone(),
            store.clone(),
            &config,
        ));
        let llm = Arc::new(LlmClient::new(&config));
        let pipeline = Arc::new(PipelineService::new(config.clone(), registry.clone(), llm));
        let publisher = Arc::new(DeltaPublisher::new(cache.clone()));
        let controller = Arc::new(RunController::new(
            config.clone(),
            store,
            cache,
            collector,
            pipeline,
            publisher.clone(),
            runtime,
            registry,
            http,
        ));

        tracing::info!("warning-workflow engine initialized");
        Ok(Self {
            config,
            db,
            controller,
            publisher,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &PgPool {
        &self.db
    }

    /// The run controller exposing the control operations.
    pub fn controller(&self) -> Arc<RunController> {
        self.controller.clone()
    }

    /// Subscribe to per-batch delta broadcasts.
    pub fn subscribe(&self) -> broadcast::Receiver<DeltaMessage> {
        self.publisher.subscribe()
    }
}
