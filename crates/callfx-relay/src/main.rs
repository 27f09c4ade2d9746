#![forbid(unsafe_code)]

//! callfx-relay - signaling slots for callfx peers.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use callfx_common::MAX_RELAY_VALUE_BYTES;
use callfx_relay::{
    serve_with_shutdown, RelayServerConfig, RelayState, DEFAULT_BIND_ADDR,
    DEFAULT_SLOT_IDLE_TIMEOUT,
};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "callfx-relay")]
#[command(about = "Last-value-wins signaling relay for callfx peers")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "CALLFX_RELAY_BIND", default_value = DEFAULT_BIND_ADDR)]
    bind: SocketAddr,

    /// Largest slot value accepted, in bytes
    #[arg(long, default_value_t = MAX_RELAY_VALUE_BYTES)]
    max_value_bytes: usize,

    /// Seconds an unobserved slot may sit idle before it is dropped
    #[arg(long, default_value_t = DEFAULT_SLOT_IDLE_TIMEOUT.as_secs())]
    idle_timeout: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    callfx_common::init_tracing_with_default(&format!("{},hyper=warn,tokio=warn", args.log_level));

    info!("Starting callfx-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = RelayServerConfig {
        bind: args.bind,
        max_value_bytes: args.max_value_bytes,
        max_message_bytes: args.max_value_bytes.saturating_mul(4),
        slot_idle_timeout: Duration::from_secs(args.idle_timeout),
        ..Default::default()
    };
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    if !config.bind.ip().is_loopback() {
        warn!("relay bound to non-loopback address {}", config.bind);
    }

    serve_with_shutdown(listener, RelayState::new(config), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("shutting down");
    })
    .await?;

    Ok(())
}
