//! rustcache server binary
//!
//! Runs a cache server on the default address (or `host:port` passed as the
//! first argument) with graceful shutdown on ctrl-c.

use std::env;
use std::sync::Arc;

use rustcache::{Result, RustCacheServer, ServerConfig};
use tokio::signal;
use tracing::{error, info};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn config_from_args() -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Some(addr) = env::args().nth(1) {
        if let Some((host, port)) = addr.rsplit_once(':') {
            config.host = host.to_string();
            config.port = port.parse().unwrap_or(config.port);
        }
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let server = Arc::new(RustCacheServer::new(config_from_args())?);

    let shutdown_server = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {err}");
            return;
        }

        info!("received ctrl-c, shutting down");
        if let Err(err) = shutdown_server.stop().await {
            error!("failed to stop server: {err}");
        }
    });

    server.run().await
}
