//! aquactl - PROFINET IO controller daemon
//!
//! Standalone service that:
//! - Discovers RTUs via DCP and keeps the process image current
//! - Maintains one AR per RTU with cyclic RT data exchange
//! - Runs operator step sequences at the control-scan cadence
//!
//! Collaborating services (HMI, historian, alarm engine) attach to the
//! registry event stream through the library interface.

use anyhow::{Context, Result};
use aquactl::transport::{PacketSocket, RpcSocket};
use aquactl::{Controller, ControllerConfig};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,aquactl=debug")),
        )
        .init();

    info!("Starting aquactl PROFINET IO controller");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ControllerConfig::from_env();
    info!(
        "Interface {}, vendor id {:#06X}, cycle {} us",
        config.interface, config.vendor_id, config.cycle_time_us
    );

    let l2 = PacketSocket::open(&config.interface)
        .with_context(|| format!("binding interface {}", config.interface))?;
    let rpc = RpcSocket::bind().await.context("binding UDP 34964")?;

    let topology_path = config.topology_path.clone();
    let discovery = std::env::var("AQUACTL_DISCOVER_ON_START")
        .map(|v| v != "0")
        .unwrap_or(true);

    let controller = Controller::new(config, Arc::new(l2), Arc::new(rpc));
    controller.start();

    match controller.load_topology().await {
        Ok(count) => info!("restored {} device(s) from {}", count, topology_path),
        Err(e) => info!("no saved topology ({e})"),
    }

    if discovery {
        match controller.discover().await {
            Ok(devices) => {
                info!("discovery found {} device(s)", devices.len());
                for device in devices {
                    info!("  {} at {} ({})", device.station, device.ip, device.mac);
                }
            }
            Err(e) => warn!("discovery failed: {e}"),
        }
    }

    info!("aquactl running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("signal handler")?;

    info!("shutting down");
    if let Err(e) = controller.save_topology().await {
        warn!("topology save failed: {e}");
    }
    controller.shutdown().await;
    Ok(())
}
