//! Gateway context - wiring container for a running gateway
//!
//! Picks the state backend, builds the [`Gateway`] around an upstream
//! client, hooks the metrics exporter into it and owns the transaction
//! reaper task.

use std::sync::Arc;

use anyhow::Context as _;
use sheetgate_core::{Gateway, InMemoryStateStore, SpreadsheetApi, StateStore};
use sheetgate_domain::{GatewayConfig, StateBackend, StateStoreSettings};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config;
use crate::database::SqliteStateStore;
use crate::http::{AccessTokenProvider, SheetsHttpClient};
use crate::logging;
use crate::observability::MetricsExporter;

/// Open the configured state backend
pub fn build_state_store(settings: &StateStoreSettings) -> anyhow::Result<Arc<dyn StateStore>> {
    match settings.backend {
        StateBackend::Memory => Ok(Arc::new(InMemoryStateStore::new())),
        StateBackend::Sqlite => {
            let store = SqliteStateStore::open(&settings.path, settings.pool_size)
                .with_context(|| format!("failed to open state database at {}", settings.path))?;
            Ok(Arc::new(store))
        }
    }
}

/// Everything an MCP server needs to serve gateway actions
pub struct GatewayContext {
    pub config: GatewayConfig,
    pub gateway: Gateway,
    pub metrics: Arc<MetricsExporter>,
    reaper: Option<JoinHandle<()>>,
}

impl GatewayContext {
    /// Wire a context around `api`; must run inside a Tokio runtime
    pub fn new(config: GatewayConfig, api: Arc<dyn SpreadsheetApi>) -> anyhow::Result<Self> {
        let store = build_state_store(&config.state_store)?;
        Self::with_store(config, api, store)
    }

    /// Same as [`new`](Self::new) with a caller-supplied store
    pub fn with_store(
        config: GatewayConfig,
        api: Arc<dyn SpreadsheetApi>,
        store: Arc<dyn StateStore>,
    ) -> anyhow::Result<Self> {
        let metrics =
            Arc::new(MetricsExporter::new().context("failed to register gateway metrics")?);
        let gateway = Gateway::builder(api, store)
            .config(config.clone())
            .cache_eviction_listener(metrics.eviction_listener())
            .build()
            .context("failed to build gateway")?;
        let reaper = gateway.spawn_reaper();

        info!(
            backend = %config.state_store.backend,
            reaper_interval_ms = config.transactions.reaper_interval_ms,
            "gateway context ready"
        );

        Ok(Self { config, gateway, metrics, reaper: Some(reaper) })
    }

    /// Load config from file and environment, install logging and talk to
    /// the Google Sheets API with `tokens`
    pub fn from_env(tokens: Arc<dyn AccessTokenProvider>) -> anyhow::Result<Self> {
        let config = config::load().context("failed to load configuration")?;
        logging::init(&config.logging).context("failed to initialise logging")?;
        let client = SheetsHttpClient::builder(tokens)
            .build()
            .context("failed to build Sheets HTTP client")?;
        Self::new(config, Arc::new(client))
    }

    /// Refresh every metric from a fresh snapshot and render it
    pub async fn render_metrics(&self) -> anyhow::Result<String> {
        let snapshot = self.gateway.snapshot().await.context("failed to snapshot gateway state")?;
        self.metrics.update_from(&snapshot);
        Ok(self.metrics.render()?)
    }

    /// Stop the reaper; the gateway itself stays usable
    pub fn shutdown(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
            info!("transaction reaper stopped");
        }
    }
}

impl Drop for GatewayContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
