mod command;
mod config;
mod mqtt;
mod poller;
mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use intellichem_proto::IntellichemStatus;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

use command::Command;
use config::BridgeConfig;
use poller::{BusPoller, SharedStatus};
use stats::BridgeStats;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "intellichem2mqtt=info,rumqttc=warn".into()),
        )
        .init();

    let cfg = Arc::new(BridgeConfig::default());
    info!(
        "🧪 Intellichem2MQTT v{} starting — bus {}, IntelliChem {}, broker {}:{}",
        env!("CARGO_PKG_VERSION"),
        cfg.serial_device,
        cfg.intellichem_addr,
        cfg.broker_host,
        cfg.broker_port,
    );

    // The RS-485 side is fixed by the device: 9600 8N1, half-duplex.
    let port = tokio_serial::new(&cfg.serial_device, 9600)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .open_native_async()
        .with_context(|| format!("opening serial device {}", cfg.serial_device))?;

    // Shared slots and queues — created before any task, destroyed after all.
    let stats = Arc::new(BridgeStats::default());
    let last_status: SharedStatus = Arc::new(RwLock::new(None::<IntellichemStatus>));
    let (state_tx, state_rx) = mpsc::channel(cfg.state_queue_depth);
    let (command_tx, command_rx) = mpsc::channel::<Command>(cfg.command_queue_depth);
    let stop = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(Notify::new());

    // Bus poller (C-side of the bridge)
    let poller = BusPoller::new(
        &cfg,
        port,
        stats.clone(),
        last_status.clone(),
        state_tx,
        command_rx,
        stop.clone(),
        shutdown.clone(),
    );
    let poller_handle = tokio::spawn(poller.run());

    // Broker task (MQTT side)
    let broker_handle = tokio::spawn(mqtt::run_broker(
        cfg.clone(),
        stats.clone(),
        state_rx,
        command_tx,
        stop.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("shutting down");

    // Stop protocol: broker task quiesces (offline published, session torn
    // down) before the poller releases the bus and the queues go away.
    stop.store(true, Ordering::Relaxed);
    shutdown.notify_waiters();
    let _ = broker_handle.await;
    let _ = poller_handle.await;

    info!("bridge stopped");
    Ok(())
}
