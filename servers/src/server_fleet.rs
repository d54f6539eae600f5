//! # Fleet State-Sync Server
//!
//! Keeps one live event stream per configured tunnel-proxy endpoint, serves
//! the dashboard WebSocket and the operator API, and writes fleet state back
//! to PostgreSQL (or memory when no database is configured).
//!
//! Configuration is read from `server_fleet.conf` (or `--config-path`),
//! then overridden by `FLEET_*` environment variables and CLI flags.

use std::sync::Arc;

use anyhow::Result;
use tokio_graceful::Shutdown;
use tracing::{error, info, warn};

use lib_fleet::SyncContext;
use lib_fleet::loggers::logger::setup_logging;

mod fleet_logic;
use fleet_logic::{config, downstream};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let (server_config, sync_config) = config::load_config()?;
    let _log_guard = setup_logging("server_fleet", &server_config.log_dir(), server_config.log_level())?;
    info!(
        "Starting server_fleet v{} with {} endpoints",
        env!("CARGO_PKG_VERSION"),
        sync_config.endpoints.len()
    );

    let ctx = Arc::new(SyncContext::bootstrap(sync_config).await?);
    let listener = downstream::bind(server_config.port()).await?;
    ctx.start().await?;

    let shutdown: Shutdown = Shutdown::default();

    let server_ctx = Arc::clone(&ctx);
    shutdown.spawn_task_fn(move |guard| async move {
        if let Err(e) = downstream::run(listener, server_ctx, guard).await {
            error!("Downstream server failed: {}", e);
        }
    });

    let limit = server_config.shutdown_timeout();
    match shutdown.shutdown_with_limit(limit).await {
        Ok(elapsed) => {
            info!(
                "shutdown: server stopped {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            warn!("shutdown: server stopped forcefully due to timeout: {}", e);
        }
    }

    if ctx.shutdown(limit).await {
        info!("shutdown: engine stopped cleanly");
    } else {
        warn!("shutdown: engine did not stop cleanly");
    }

    info!("Bye!");
    Ok(())
}
