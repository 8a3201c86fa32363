//! main.rs — bench IntelliChem simulator entry point
//!
//! Speaks the device side of the RS-485 protocol on a serial device so the
//! bridge can be developed without a pool attached. Pair it with the bridge
//! through a virtual null-modem, e.g.:
//!
//!   socat -d -d pty,raw,echo=0,link=/tmp/chem-a pty,raw,echo=0,link=/tmp/chem-b
//!   chem-sim --device /tmp/chem-a
//!   SERIAL_DEVICE=/tmp/chem-b intellichem2mqtt
//!
//! Behavior:
//!   - answers status requests addressed to it with the simulated state
//!   - applies config writes to its setpoints and tank levels
//!   - drifts chemistry between polls, so dosing is observable end to end
//!   - optionally emits the unsolicited broadcast frames a live bus carries

mod pool;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use intellichem_proto::frame::{
    self, ACTION_BROADCAST, ACTION_CONFIG_WRITE, ACTION_STATUS_REQUEST, ACTION_STATUS_RESPONSE,
    CONTROLLER_ADDR,
};
use intellichem_proto::{ChemSettings, StreamResync, MAX_FRAME_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use pool::{FullConfig, PoolSim};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "chem-sim", about = "Bench IntelliChem controller simulator")]
struct Args {
    /// Serial device to speak on (e.g. a socat pty)
    #[arg(short, long)]
    device: String,
    /// Scenario config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Bus address to answer on (144–158)
    #[arg(long, default_value = "144")]
    address: u8,
    /// Delay before answering a poll, in milliseconds
    #[arg(long, default_value = "25")]
    respond_delay_ms: u64,
    /// Emit an unsolicited broadcast frame every this many seconds (0 = off)
    #[arg(long, default_value = "0")]
    chatter_secs: u64,
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chem_sim=info".into()),
        )
        .init();

    let args = Args::parse();

    let config_str = std::fs::read_to_string(&args.config)
        .unwrap_or_else(|_| include_str!("../config.toml").to_string());
    let cfg: FullConfig = toml::from_str(&config_str).context("invalid config.toml")?;

    info!(
        "🧫 chem-sim starting — address {}, pH {:.2} → {:.2}, ORP {} → {}",
        args.address,
        cfg.chemistry.ph,
        cfg.chemistry.ph_setpoint,
        cfg.chemistry.orp,
        cfg.chemistry.orp_setpoint
    );

    let mut port = tokio_serial::new(&args.device, 9600)
        .open_native_async()
        .with_context(|| format!("opening serial device {}", args.device))?;

    let mut sim = PoolSim::new(&cfg);
    let mut resync = StreamResync::new();
    let mut read_buf = [0u8; 256];
    let mut frame_buf = [0u8; MAX_FRAME_LEN];

    let mut drift = tokio::time::interval(Duration::from_secs(cfg.simulation.step_secs.max(1)));
    let chatter_period = if args.chatter_secs > 0 {
        Duration::from_secs(args.chatter_secs)
    } else {
        // Effectively never; keeps the select arm uniform.
        Duration::from_secs(u32::MAX as u64)
    };
    let mut chatter = tokio::time::interval(chatter_period);

    loop {
        tokio::select! {
            _ = drift.tick() => sim.step(),
            _ = chatter.tick() => {
                if args.chatter_secs > 0 {
                    send_broadcast(&mut port, args.address).await;
                }
            }
            res = port.read(&mut read_buf) => match res {
                Ok(0) => {
                    warn!("serial device returned EOF");
                }
                Ok(n) => {
                    resync.push(&read_buf[..n]);
                    while let Some(len) = resync.try_take_frame(&mut frame_buf) {
                        handle_frame(&frame_buf[..len], &mut sim, &mut port, &args).await;
                    }
                }
                Err(e) => warn!("serial read error: {e}"),
            },
        }
    }
}

// ── Frame handling ────────────────────────────────────────────────────────────

async fn handle_frame(
    frame_buf: &[u8],
    sim: &mut PoolSim,
    port: &mut tokio_serial::SerialStream,
    args: &Args,
) {
    if frame::destination(frame_buf) != args.address {
        return;
    }
    match frame::action(frame_buf) {
        ACTION_STATUS_REQUEST => {
            debug!("poll from {}", frame::source(frame_buf));
            // Real devices take a beat to answer; keeps direction switching
            // honest on the bridge side.
            tokio::time::sleep(Duration::from_millis(args.respond_delay_ms)).await;
            let payload = sim.status_payload();
            send_frame(
                port,
                CONTROLLER_ADDR,
                args.address,
                ACTION_STATUS_RESPONSE,
                &payload,
            )
            .await;
        }
        ACTION_CONFIG_WRITE => match ChemSettings::from_payload(frame::payload(frame_buf)) {
            Ok(settings) => {
                info!(
                    "config write: pH→{:.2} ORP→{} tanks {}/{}",
                    settings.ph_setpoint,
                    settings.orp_setpoint,
                    settings.ph_tank_level,
                    settings.orp_tank_level
                );
                sim.apply_config(&settings);
            }
            Err(e) => warn!("bad config payload: {e}"),
        },
        other => debug!("ignoring action {other}"),
    }
}

async fn send_frame(
    port: &mut tokio_serial::SerialStream,
    dest: u8,
    src: u8,
    action: u8,
    payload: &[u8],
) {
    let mut buf = [0u8; MAX_FRAME_LEN];
    match frame::build(&mut buf, dest, src, action, payload) {
        Ok(len) => {
            if let Err(e) = port.write_all(&buf[..len]).await {
                warn!("serial write failed: {e}");
            }
        }
        Err(e) => warn!("frame build failed: {e}"),
    }
}

/// The unsolicited broadcast a live bus exhibits; the bridge must ignore it.
async fn send_broadcast(port: &mut tokio_serial::SerialStream, address: u8) {
    send_frame(port, CONTROLLER_ADDR, address, ACTION_BROADCAST, &[0x00]).await;
}
