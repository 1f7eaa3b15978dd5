//! gatewayd - wildlife edge gateway daemon
//!
//! This daemon:
//! 1. Captures frames from the configured cameras and runs detection on them
//! 2. Accepts field-node traffic over HTTP, WebSocket and the radio link
//! 3. Stores everything durably and syncs it to the cloud when reachable
//! 4. Posts a telemetry snapshot on a fixed interval

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use wildlife_gateway::{Gateway, GatewayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Wildlife edge gateway daemon")]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check_config: bool,

    /// Log a status line every N seconds (0 disables).
    #[arg(long, env = "GATEWAY_STATUS_INTERVAL", default_value_t = 60)]
    status_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = GatewayConfig::load_from(args.config.as_deref())?;
    if args.check_config {
        println!(
            "configuration ok: {} camera(s), node api {}, cloud {}",
            config.cameras.len(),
            config.bridge.http_addr.as_deref().unwrap_or("disabled"),
            config.cloud.base_url
        );
        return Ok(());
    }

    let gateway = Gateway::new(config)?;
    gateway.start()?;
    log::info!(
        "gatewayd {} running as {}",
        env!("CARGO_PKG_VERSION"),
        gateway.id()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let status_interval = Duration::from_secs(args.status_interval);
    loop {
        let signalled = if status_interval.is_zero() {
            rx.recv().map(|_| true).unwrap_or(true)
        } else {
            match rx.recv_timeout(status_interval) {
                Ok(()) => true,
                Err(mpsc::RecvTimeoutError::Timeout) => false,
                Err(mpsc::RecvTimeoutError::Disconnected) => true,
            }
        };
        if signalled {
            break;
        }
        let status = gateway.get_status();
        log::info!(
            "status: cameras {}/{} streaming ({} failed), nodes {}/{} online, cloud {}, {} queued",
            status.cameras_streaming,
            status.cameras_total,
            status.cameras_failed,
            status.nodes_online,
            status.nodes_total,
            if status.cloud_online { "online" } else { "offline" },
            status.sync_queued
        );
    }

    log::info!("shutdown signal received, stopping gateway...");
    gateway.shutdown();
    Ok(())
}
