use anyhow::{Context, bail};
use std::sync::Arc;
use stockroom::{HttpRestockClient, InventoryService, ServiceConfig, ShutdownSignal};
use tracing::{Level, event};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServiceConfig::from_env().context("loading service configuration")?;
    let Some(base_url) = config.restock.base_url.as_deref() else {
        bail!("restock.base_url must be configured");
    };
    let restock_client = HttpRestockClient::new(
        base_url,
        std::time::Duration::from_millis(config.restock.request_timeout_ms),
    )?;

    let service = InventoryService::open(&config, Arc::new(restock_client))
        .await
        .context("opening inventory service")?;

    // The store starts empty in a fresh process; recover the latest backup if one exists.
    let startup = ShutdownSignal::never();
    if service.backup().has_archived_backups(&startup).await? {
        service
            .backup()
            .restore_on_data_loss(&startup)
            .await
            .context("restoring from latest backup")?;
    }

    let handle = service.start();
    event!(Level::INFO, data_dir = %config.data_dir.display(), "stockroomd running; ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    event!(Level::INFO, "shutdown requested");
    handle.shutdown().await?;
    Ok(())
}
