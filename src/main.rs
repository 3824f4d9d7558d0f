use anyhow::{Context, Result};
use tracing::info;
use std::fs;
use std::sync::Arc;

use feedback_guard::clock::{Clock, SystemClock};
use feedback_guard::config::{self, StoreBackend, StoreConfig};
use feedback_guard::metrics::{run_metrics_server, Metrics};
use feedback_guard::server;
use feedback_guard::session::SessionManager;
use feedback_guard::store::{DocumentStore, MemoryDocumentStore, RestDocumentStore};

fn build_store(config: &StoreConfig) -> Result<Arc<dyn DocumentStore>> {
    match config.backend {
        StoreBackend::Memory => {
            let store = match &config.seed_file {
                Some(path) => {
                    let seed = fs::read_to_string(path)
                        .with_context(|| format!("Failed to read seed file: {}", path))?;
                    MemoryDocumentStore::from_seed(&seed)
                        .with_context(|| format!("Failed to parse seed file: {}", path))?
                }
                None => MemoryDocumentStore::new(),
            };
            info!("Document store: memory");
            Ok(Arc::new(store))
        }
        StoreBackend::Rest => {
            let store = RestDocumentStore::new(config.base_url.clone(), config.timeout_ms)?;
            info!("Document store: {}", config.base_url);
            Ok(Arc::new(store))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("feedback_guard=info".parse()?)
        )
        .init();

    info!("Starting feedback guard");

    let config = config::load_config()?;
    info!("Configuration loaded");
    info!("Server: {}", config.server.bind_addr);

    let store = build_store(&config.store)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let session_manager = Arc::new(SessionManager::new(
        config.server.max_connections_per_ip,
        config.guard_config(),
        config.query.clone(),
        store,
        clock,
    ));

    let metrics = Arc::new(Metrics::new());
    tokio::spawn(run_metrics_server(config.metrics.clone(), metrics.clone()));

    server::run(config, session_manager, metrics).await?;

    Ok(())
}
