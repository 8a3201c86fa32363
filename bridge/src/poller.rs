//! # poller
//!
//! Bus poller — owns the RS-485 serial line and speaks to the IntelliChem.
//!
//! ## Architecture
//! Runs as its own Tokio task alongside the broker task. It:
//!   1. Sends an empty status request every poll interval (and on demand)
//!   2. Drains receive bytes through the resynchronizer and decoder
//!   3. Publishes decoded snapshots into a bounded state queue (non-blocking;
//!      a full queue drops the update rather than stalling the bus loop)
//!   4. Merges single-field commands onto the last-known settings, encodes
//!      and transmits the config frame
//!
//! ## Half-duplex discipline
//! The bus direction follows Rx → TxPre → Tx → TxPost → Rx. TX-enable is
//! asserted, the transceiver gets ≥ 1 ms to settle, the frame is written,
//! and the line is released after flush-done (bounded by a 100 ms guard)
//! plus one more settle interval. No receive bytes are processed outside Rx;
//! the select loop guarantees that because transmission completes inline.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use intellichem_proto::frame::{self, ACTION_BROADCAST, ACTION_STATUS_REQUEST};
use intellichem_proto::settings::encode_config;
use intellichem_proto::status::decode_status;
use intellichem_proto::{ChemSettings, IntellichemStatus, SettingChange, StreamResync, MAX_FRAME_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_serial::{ClearBuffer, SerialPort, SerialStream};
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::config::BridgeConfig;
use crate::stats::BridgeStats;

/// Last decoded status, readable by the broker task and the debug HTTP
/// surface. Written only by the poller, under a short-held lock.
pub type SharedStatus = Arc<RwLock<Option<IntellichemStatus>>>;

/// Transceiver settle time around direction switches.
const DIR_SETTLE: Duration = Duration::from_millis(1);
/// Upper bound on waiting for the UART to drain after a write.
const TX_GUARD: Duration = Duration::from_millis(100);

/// Sleeps until `deadline`, or forever when there is none. Keeps the
/// response-abandonment arm of the poller's select loop inert while no
/// request is outstanding.
async fn await_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

// ── Direction control ─────────────────────────────────────────────────────────

/// RS-485 TX-enable via the adapter's RTS line. A negative pin number in the
/// config means an auto-direction transceiver; toggling is then suppressed.
struct DirectionControl {
    enabled: bool,
}

impl DirectionControl {
    fn new(dir_pin: i32) -> Self {
        Self { enabled: dir_pin >= 0 }
    }

    fn set_tx(&self, port: &mut SerialStream) {
        if self.enabled {
            if let Err(e) = port.write_request_to_send(true) {
                warn!("RS-485: failed to assert TX direction: {e}");
            }
        }
    }

    fn set_rx(&self, port: &mut SerialStream) {
        if self.enabled {
            if let Err(e) = port.write_request_to_send(false) {
                warn!("RS-485: failed to release TX direction: {e}");
            }
        }
    }
}

// ── Poller task ───────────────────────────────────────────────────────────────

pub struct BusPoller {
    port: SerialStream,
    dir: DirectionControl,
    resync: StreamResync,
    address: u8,
    poll_interval: Duration,
    response_timeout: Duration,
    stale_after: Duration,
    stats: Arc<BridgeStats>,
    last_status: SharedStatus,
    /// Baseline for partial updates; refreshed from every decode so a
    /// single-field command never zeroes the other writable fields.
    last_settings: Option<ChemSettings>,
    state_tx: mpsc::Sender<IntellichemStatus>,
    command_rx: mpsc::Receiver<Command>,
    stop: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    started: Instant,
    last_decode: Option<Instant>,
    awaiting_since: Option<Instant>,
}

impl BusPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &BridgeConfig,
        port: SerialStream,
        stats: Arc<BridgeStats>,
        last_status: SharedStatus,
        state_tx: mpsc::Sender<IntellichemStatus>,
        command_rx: mpsc::Receiver<Command>,
        stop: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            port,
            dir: DirectionControl::new(cfg.dir_pin),
            resync: StreamResync::new(),
            address: cfg.intellichem_addr,
            poll_interval: cfg.poll_interval,
            response_timeout: cfg.response_timeout,
            stale_after: cfg.stale_after,
            stats,
            last_status,
            last_settings: None,
            state_tx,
            command_rx,
            stop,
            shutdown,
            started: Instant::now(),
            last_decode: None,
            awaiting_since: None,
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub async fn run(mut self) {
        info!(
            "📟 bus poller up — IntelliChem at {}, polling every {:?}",
            self.address, self.poll_interval
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut read_buf = [0u8; 256];

        while !self.stop.load(Ordering::Relaxed) {
            // Re-armed every iteration: receive activity refreshes
            // `awaiting_since`, pushing the abandonment deadline out.
            let response_deadline = self
                .awaiting_since
                .map(|t| tokio::time::Instant::from_std(t + self.response_timeout));

            tokio::select! {
                _ = ticker.tick() => self.on_tick().await,
                cmd = self.command_rx.recv() => match cmd {
                    Some(Command::ForcePoll) => self.send_status_request().await,
                    Some(Command::Set(change)) => self.handle_setting(change).await,
                    None => break,
                },
                res = self.port.read(&mut read_buf) => match res {
                    Ok(0) => {
                        warn!("serial device returned EOF");
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(n) => self.ingest(&read_buf[..n]).await,
                    Err(e) => self.on_serial_error(&e),
                },
                _ = await_deadline(response_deadline) => {
                    debug!(
                        "abandoning response after {:?} inter-byte gap",
                        self.response_timeout
                    );
                    self.awaiting_since = None;
                }
                _ = self.shutdown.notified() => break,
            }
        }

        // Leave the bus listening and the transceiver quiet.
        self.dir.set_rx(&mut self.port);
        info!("bus poller stopped");
    }

    // ── Poll scheduling ───────────────────────────────────────────────────────

    async fn on_tick(&mut self) {
        self.check_staleness().await;
        self.send_status_request().await;
    }

    /// No decode within the threshold: flag the stats view, flip
    /// `comms_lost` on the held snapshot, and emit that snapshot so broker
    /// subscribers learn about the outage too.
    async fn check_staleness(&mut self) {
        let stale = match self.last_decode {
            Some(at) => at.elapsed() >= self.stale_after,
            None => false,
        };
        if stale && !self.stats.is_stale() {
            warn!("no status response for {:?}, marking state stale", self.stale_after);
            self.stats.set_stale(true);
            let marked = {
                let mut slot = self.last_status.write().await;
                match slot.as_mut() {
                    Some(s) => {
                        s.comms_lost = true;
                        Some(s.clone())
                    }
                    None => None,
                }
            };
            if let Some(status) = marked {
                self.offer_snapshot(status);
            }
        }
    }

    async fn send_status_request(&mut self) {
        self.stats.polls.fetch_add(1, Ordering::Relaxed);
        let mut buf = [0u8; MAX_FRAME_LEN];
        match frame::build(
            &mut buf,
            self.address,
            frame::CONTROLLER_ADDR,
            ACTION_STATUS_REQUEST,
            &[],
        ) {
            Ok(len) => {
                debug!("polling IntelliChem {}", self.address);
                self.transmit(&buf[..len]).await;
                self.awaiting_since = Some(Instant::now());
            }
            Err(e) => {
                warn!("failed to build status request: {e}");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // ── Transmit path ─────────────────────────────────────────────────────────

    /// Half-duplex write: Rx → TxPre → Tx → TxPost → Rx.
    async fn transmit(&mut self, frame_buf: &[u8]) {
        self.dir.set_tx(&mut self.port);
        tokio::time::sleep(DIR_SETTLE).await;

        if let Err(e) = self.port.write_all(frame_buf).await {
            warn!("serial write failed: {e}");
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
        } else {
            match tokio::time::timeout(TX_GUARD, self.port.flush()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("serial flush failed: {e}");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    warn!("TX drain guard expired after {TX_GUARD:?}");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        // Final stop bit clocks out during the settle window; then drop any
        // echo of our own transmission before listening again.
        tokio::time::sleep(DIR_SETTLE).await;
        self.dir.set_rx(&mut self.port);
        let _ = self.port.clear(ClearBuffer::Input);
    }

    // ── Receive path ──────────────────────────────────────────────────────────

    async fn ingest(&mut self, bytes: &[u8]) {
        // Any receive activity restarts the inter-byte abandonment clock.
        if self.awaiting_since.is_some() {
            self.awaiting_since = Some(Instant::now());
        }
        self.resync.push(bytes);
        let mut frame_buf = [0u8; MAX_FRAME_LEN];
        while let Some(len) = self.resync.try_take_frame(&mut frame_buf) {
            self.dispatch(&frame_buf[..len]).await;
        }
        self.stats.sync_link(&self.resync.counters());
    }

    async fn dispatch(&mut self, frame_buf: &[u8]) {
        if frame::action(frame_buf) == ACTION_BROADCAST {
            // Bus chatter from the controller side; not for us.
            return;
        }
        match decode_status(frame_buf, self.now_ms()) {
            Ok(status) => self.accept_status(status).await,
            Err(e) => {
                debug!("dropping frame: {e}");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn accept_status(&mut self, status: IntellichemStatus) {
        self.stats.responses.fetch_add(1, Ordering::Relaxed);
        self.last_decode = Some(Instant::now());
        self.awaiting_since = None;
        self.stats.set_stale(false);
        self.last_settings = Some(ChemSettings::from(&status));

        {
            let mut slot = self.last_status.write().await;
            *slot = Some(status.clone());
        }
        self.offer_snapshot(status);
    }

    /// Never block the bus loop on a slow consumer: a full queue costs
    /// this update, not bus time.
    fn offer_snapshot(&self, status: IntellichemStatus) {
        match self.state_tx.try_send(status) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.dropped_snapshots.fetch_add(1, Ordering::Relaxed);
                debug!("state queue full, dropping snapshot");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    // ── Command path ──────────────────────────────────────────────────────────

    async fn handle_setting(&mut self, change: SettingChange) {
        let Some(mut settings) = self.last_settings else {
            warn!("no settings baseline yet (no status decoded), dropping {change:?}");
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        };
        settings.apply(change);

        let mut buf = [0u8; MAX_FRAME_LEN];
        match encode_config(&settings, self.address, &mut buf) {
            Ok(len) => {
                info!("writing config {change:?}");
                self.transmit(&buf[..len]).await;
            }
            Err(e) => {
                warn!("config rejected: {e}");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // ── Error branches ────────────────────────────────────────────────────────

    fn on_serial_error(&mut self, e: &io::Error) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        match e.kind() {
            // Parity / framing damage: the resynchronizer copes byte-wise.
            io::ErrorKind::InvalidData => warn!("serial line error: {e}"),
            // Receiver overrun or driver buffer loss: the buffered stream has
            // an unknowable gap, start framing over.
            _ => {
                warn!("serial read error: {e}, flushing receive path");
                self.resync.clear();
                let _ = self.port.clear(ClearBuffer::Input);
                self.stats.sync_link(&self.resync.counters());
            }
        }
    }
}
