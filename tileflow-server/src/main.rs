use std::net::SocketAddr;
use std::sync::Arc;

use tileflow_core::executor::TileExecutor;
use tileflow_core::store::WorkflowStore;
use tileflow_core::store_memory::MemoryStore;
use tileflow_core::{Scheduler, SchedulerConfig};
use tileflow_server::http;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = SchedulerConfig::from_env()?;
    let bind: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()?;

    let store: Arc<dyn WorkflowStore> = Arc::new(MemoryStore::new());
    let executor = Arc::new(TileExecutor::new(config.results_dir.clone()));
    let scheduler = Arc::new(Scheduler::new(config, store, executor));
    scheduler.start().await;

    let app = http::router(scheduler.clone());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("tileflow listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to install shutdown handler: {err}");
    }
}
