//! HTTP API server
//!
//! Wires the translator, schema matcher and validation runner behind an
//! axum router. Connections are opened per request from the connection
//! details in the body; nothing is shared between callers except the run
//! store.

pub mod error;
pub mod handler;
pub mod router;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::config::AppConfig;
use crate::engine::ConnectorFactory;
use crate::error::{ShiftError, ShiftResult};
use crate::memory::MemoryCatalog;
use crate::report::RunStore;
use crate::runner::{RunnerSettings, ValidationRunner};
use crate::schema::SchemaMatcher;
use crate::translator::Translator;

pub use error::{ApiError, ApiResult};
pub use router::create_router;

/// Shared state for the server
pub struct AppState {
    pub config: AppConfig,
    pub factory: ConnectorFactory,
    pub runner: ValidationRunner,
    pub matcher: SchemaMatcher,
    pub translator: Translator,
}

impl AppState {
    /// State with an empty in-memory catalog.
    pub fn new(config: AppConfig) -> ShiftResult<Self> {
        Self::with_catalog(config, Arc::new(MemoryCatalog::new()))
    }

    /// State whose `memory` connections resolve against `catalog`.
    pub fn with_catalog(config: AppConfig, catalog: Arc<MemoryCatalog>) -> ShiftResult<Self> {
        let store = Arc::new(RunStore::new(config.runs_dir.clone())?.with_retention(config.max_retained_runs));
        let runner = ValidationRunner::new(store, RunnerSettings::from(&config));
        let factory = ConnectorFactory::new(catalog, Duration::from_secs(config.connect_timeout_secs.max(1)));
        Ok(Self {
            config,
            factory,
            runner,
            matcher: SchemaMatcher::new(),
            translator: Translator::new(),
        })
    }
}

/// The dbshift HTTP server
pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    pub fn new(config: AppConfig) -> ShiftResult<Self> {
        Ok(Self::from_state(Arc::new(AppState::new(config)?)))
    }

    pub fn from_state(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Start serving requests
    ///
    /// # Errors
    /// Returns error if the listener cannot be bound
    pub async fn serve(&self) -> ShiftResult<()> {
        let router = create_router(Arc::clone(&self.state));

        let addr = &self.state.config.bind_address;
        tracing::info!("dbshift server starting on {}", addr);
        tracing::info!("   POST /api/sql-conversion/convert - Teradata to DB2");
        tracing::info!("   POST /api/run-validation         - Start a validation run");
        tracing::info!("   GET  /api/health                 - Health check");
        if let Some(dir) = self.state.runner.store().dir() {
            tracing::info!("Persisting runs to {}", dir.display());
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ShiftError::Config(format!("Failed to bind to {}: {}", addr, e)))?;

        axum::serve(listener, router).await?;

        Ok(())
    }
}
