use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use extvisor::config::GlobalConfig;
use extvisor::extension::ExtensionRegistry;
use extvisor::instance::Fleet;
use extvisor::supervisor::LogNotifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("extvisor {} starting", env!("CARGO_PKG_VERSION"));

    let config = GlobalConfig::load()?;
    let registry = ExtensionRegistry::with_builtins();
    tracing::info!("Registered extensions: {}", registry.names().join(", "));

    let mut fleet = Fleet::from_config(&config, &registry, Arc::new(LogNotifier));
    let failed = fleet.start_all().await;
    if !failed.is_empty() {
        tracing::warn!("{} instance(s) failed to start", failed.len());
    }

    // Ctrl+C 까지 대기
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping instances...");

    for (id, e) in fleet.stop_all().await {
        tracing::error!("[{}] {}", id, e);
    }
    tracing::info!("extvisor stopped");
    Ok(())
}
