//! # mqtt
//!
//! Broker task — fans decoded status out to topics and feeds validated
//! commands back to the bus poller.
//!
//! ## Architecture
//! Two independent sub-loops plus the broker session pump:
//!   - publish loop: blocks on the state queue (1 s slices so the stop flag
//!     stays live), emits one aggregate JSON message and one message per
//!     leaf field
//!   - event pump: drives the rumqttc event loop; on connect it subscribes
//!     to the command glob, flips the availability topic to `online` and
//!     requests an immediate poll so subscribers see fresh state; inbound
//!     messages are parsed and enqueued with a bounded wait — the pump
//!     itself never blocks on the bus
//!
//! The broker session carries a retained last-will of `offline` on the
//! availability topic, so consumers see the bridge drop even on a crash.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use intellichem_proto::IntellichemStatus;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::command::{self, Command};
use crate::config::BridgeConfig;
use crate::stats::{BridgeStats, ConnectionState};

/// Bounded wait when handing a parsed command to the poller.
const COMMAND_ENQUEUE_WAIT: Duration = Duration::from_millis(100);
/// Best-effort window for the final `offline` publish on stop.
const OFFLINE_WAIT: Duration = Duration::from_millis(100);

// ── Topics ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Topics {
    pub status: String,
    pub field_root: String,
    pub availability: String,
    pub command_glob: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            status: format!("{prefix}/intellichem/status"),
            field_root: format!("{prefix}/intellichem"),
            availability: format!("{prefix}/intellichem/availability"),
            command_glob: format!("{prefix}/intellichem/set/#"),
        }
    }

    fn field(&self, path: &str) -> String {
        format!("{}/{path}", self.field_root)
    }
}

// ── Field fan-out ─────────────────────────────────────────────────────────────

fn bool_str(v: bool) -> String {
    if v { "true".into() } else { "false".into() }
}

/// One `(topic path, payload)` pair per leaf field of the status record.
/// pH renders with two decimals, ORP as plain millivolts, enums as their
/// human-readable names.
fn field_messages(s: &IntellichemStatus) -> Vec<(&'static str, String)> {
    vec![
        ("address", s.address.to_string()),
        ("ph/level", format!("{:.2}", s.ph.level)),
        ("ph/setpoint", format!("{:.2}", s.ph.setpoint)),
        ("ph/dose_time", s.ph.dose_time_s.to_string()),
        ("ph/dose_volume", s.ph.dose_volume_ml.to_string()),
        ("ph/tank_level", s.ph.tank_level.to_string()),
        ("ph/dosing_status", s.ph.dosing_status.as_str().to_string()),
        ("ph/is_dosing", bool_str(s.ph.is_dosing)),
        ("orp/level", s.orp.level.to_string()),
        ("orp/setpoint", s.orp.setpoint.to_string()),
        ("orp/dose_time", s.orp.dose_time_s.to_string()),
        ("orp/dose_volume", s.orp.dose_volume_ml.to_string()),
        ("orp/tank_level", s.orp.tank_level.to_string()),
        ("orp/dosing_status", s.orp.dosing_status.as_str().to_string()),
        ("orp/is_dosing", bool_str(s.orp.is_dosing)),
        ("lsi", format!("{:.2}", s.lsi)),
        ("calcium_hardness", s.calcium_hardness.to_string()),
        ("cyanuric_acid", s.cyanuric_acid.to_string()),
        ("alkalinity", s.alkalinity.to_string()),
        ("salt_level", s.salt_level.to_string()),
        ("temperature", s.temperature.to_string()),
        ("firmware", s.firmware.clone()),
        ("alarms/flow", bool_str(s.alarms.flow)),
        ("alarms/ph_tank_empty", bool_str(s.alarms.ph_tank_empty)),
        ("alarms/orp_tank_empty", bool_str(s.alarms.orp_tank_empty)),
        ("alarms/probe_fault", bool_str(s.alarms.probe_fault)),
        ("warnings/ph_lockout", bool_str(s.warnings.ph_lockout)),
        ("warnings/ph_daily_limit", bool_str(s.warnings.ph_daily_limit)),
        ("warnings/orp_daily_limit", bool_str(s.warnings.orp_daily_limit)),
        ("warnings/invalid_setup", bool_str(s.warnings.invalid_setup)),
        ("warnings/chlorinator_comm", bool_str(s.warnings.chlorinator_comm)),
        ("warnings/water_balance", s.warnings.water_balance.as_str().to_string()),
        ("flow_detected", bool_str(s.flow_detected)),
        ("comms_lost", bool_str(s.comms_lost)),
    ]
}

// ── Publish path ──────────────────────────────────────────────────────────────

async fn publish_status(
    client: &AsyncClient,
    topics: &Topics,
    status: &IntellichemStatus,
    stats: &BridgeStats,
) {
    if stats.connection_state() != ConnectionState::BrokerConnected {
        // No session: skip this snapshot, the next one carries fresh values.
        debug!("broker not connected, skipping snapshot");
        return;
    }

    match serde_json::to_string(status) {
        Ok(body) => match client
            .publish(topics.status.clone(), QoS::AtLeastOnce, false, body)
            .await
        {
            Ok(()) => {
                stats.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!("status publish failed: {e}"),
        },
        Err(e) => warn!("status serialize failed: {e}"),
    }

    for (path, value) in field_messages(status) {
        match client
            .publish(topics.field(path), QoS::AtLeastOnce, false, value)
            .await
        {
            Ok(()) => {
                stats.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("publish {path} failed: {e}");
            }
        }
    }
}

// ── Command path ──────────────────────────────────────────────────────────────

/// Parse and forward one inbound message. Parse or range failures stop
/// here; a full command queue costs the command, never bus time.
async fn handle_command_message(
    topic: &str,
    payload: &[u8],
    command_tx: &mpsc::Sender<Command>,
    stats: &BridgeStats,
) {
    match command::parse(topic, payload) {
        Ok(cmd) => {
            debug!("command accepted on '{topic}': {cmd:?}");
            if command_tx
                .send_timeout(cmd, COMMAND_ENQUEUE_WAIT)
                .await
                .is_err()
            {
                stats.dropped_commands.fetch_add(1, Ordering::Relaxed);
                warn!("command queue full, dropping command from '{topic}'");
            }
        }
        Err(e) => {
            stats.command_parse_errors.fetch_add(1, Ordering::Relaxed);
            warn!("rejected command on '{topic}': {e}");
        }
    }
}

// ── Session pump ──────────────────────────────────────────────────────────────

async fn event_pump(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    topics: Topics,
    command_tx: mpsc::Sender<Command>,
    stats: Arc<BridgeStats>,
    stop: Arc<AtomicBool>,
) {
    let mut connected_before = false;
    stats.set_connection_state(ConnectionState::NetConnecting);

    while !stop.load(Ordering::Relaxed) {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("📡 broker connected");
                stats.set_connection_state(ConnectionState::BrokerConnected);
                if connected_before {
                    stats.reconnections.fetch_add(1, Ordering::Relaxed);
                }
                connected_before = true;

                if let Err(e) = client
                    .subscribe(topics.command_glob.clone(), QoS::AtLeastOnce)
                    .await
                {
                    warn!("command subscribe failed: {e}");
                }
                if let Err(e) = client
                    .publish(topics.availability.clone(), QoS::AtLeastOnce, true, "online")
                    .await
                {
                    warn!("availability publish failed: {e}");
                }
                // Fresh session, fresh state: don't make new subscribers
                // wait out the remainder of the poll interval.
                let _ = command_tx.try_send(Command::ForcePoll);
            }
            Ok(Event::Incoming(Packet::Publish(msg))) => {
                handle_command_message(&msg.topic, &msg.payload, &command_tx, &stats).await;
            }
            Ok(_) => {}
            Err(e) => {
                stats.set_connection_state(ConnectionState::Disconnected);
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                warn!("broker connection lost: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                stats.set_connection_state(ConnectionState::NetConnecting);
            }
        }
    }
}

// ── Task entry ────────────────────────────────────────────────────────────────

pub async fn run_broker(
    cfg: Arc<BridgeConfig>,
    stats: Arc<BridgeStats>,
    mut state_rx: mpsc::Receiver<IntellichemStatus>,
    command_tx: mpsc::Sender<Command>,
    stop: Arc<AtomicBool>,
) {
    let topics = Topics::new(&cfg.topic_prefix);

    let mut opts = MqttOptions::new("intellichem2mqtt", &cfg.broker_host, cfg.broker_port);
    opts.set_keep_alive(Duration::from_secs(30));
    opts.set_last_will(LastWill::new(
        &topics.availability,
        "offline",
        QoS::AtLeastOnce,
        true,
    ));
    if let (Some(user), Some(pass)) = (&cfg.broker_user, &cfg.broker_pass) {
        opts.set_credentials(user, pass);
    }

    let (client, eventloop) = AsyncClient::new(opts, 16);
    let pump = tokio::spawn(event_pump(
        eventloop,
        client.clone(),
        topics.clone(),
        command_tx,
        stats.clone(),
        stop.clone(),
    ));

    // Publish loop: 1 s slices keep the stop flag polled even when the bus
    // is silent.
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        match tokio::time::timeout(Duration::from_secs(1), state_rx.recv()).await {
            Ok(Some(status)) => publish_status(&client, &topics, &status, &stats).await,
            Ok(None) => break,
            Err(_) => {}
        }
    }

    // Stop protocol: best-effort offline, then tear the session down.
    let _ = tokio::time::timeout(
        OFFLINE_WAIT,
        client.publish(topics.availability.clone(), QoS::AtLeastOnce, true, "offline"),
    )
    .await;
    let _ = client.disconnect().await;
    pump.abort();
    stats.set_connection_state(ConnectionState::Disconnected);
    info!("broker task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use intellichem_proto::frame::{build, ACTION_STATUS_RESPONSE, MAX_FRAME_LEN};
    use intellichem_proto::status::{decode_status, STATUS_PAYLOAD_LEN};

    fn sample_status() -> IntellichemStatus {
        let mut p = [0u8; STATUS_PAYLOAD_LEN];
        p[0] = 0x02;
        p[1] = 0xD4; // pH 7.24
        p[2] = 0x02;
        p[3] = 0xBC; // ORP 700
        p[4] = 0x02;
        p[5] = 0xD0;
        p[6] = 0x02;
        p[7] = 0x8A;
        p[20] = 5;
        p[22] = 0xEE; // LSI -0.18
        p[29] = 62;
        p[31] = 82;
        p[36] = 60;
        p[37] = 1;
        let mut buf = [0u8; MAX_FRAME_LEN];
        let len = build(&mut buf, 16, 144, ACTION_STATUS_RESPONSE, &p).unwrap();
        decode_status(&buf[..len], 42).unwrap()
    }

    #[test]
    fn field_encodings_match_topic_contract() {
        let msgs = field_messages(&sample_status());
        let get = |path: &str| {
            msgs.iter()
                .find(|(p, _)| *p == path)
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| panic!("missing field {path}"))
        };

        assert_eq!(get("ph/level"), "7.24");
        assert_eq!(get("ph/setpoint"), "7.20");
        assert_eq!(get("orp/level"), "700");
        assert_eq!(get("ph/tank_level"), "4");
        assert_eq!(get("lsi"), "-0.18");
        assert_eq!(get("salt_level"), "3100");
        assert_eq!(get("firmware"), "1.060");
        assert_eq!(get("ph/dosing_status"), "Dosing");
        assert_eq!(get("flow_detected"), "true");
        assert_eq!(get("comms_lost"), "false");
    }

    #[test]
    fn aggregate_json_is_well_formed() {
        let body = serde_json::to_string(&sample_status()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["address"], 144);
        assert_eq!(v["orp"]["level"], 700);
        assert_eq!(v["warnings"]["water_balance"], "Ok");
    }

    #[tokio::test]
    async fn unparseable_command_never_reaches_the_queue() {
        let stats = BridgeStats::default();
        let (tx, mut rx) = mpsc::channel::<Command>(4);

        handle_command_message(
            "intellichem2mqtt/intellichem/set/ph_setpoint",
            b"9.9",
            &tx,
            &stats,
        )
        .await;

        assert_eq!(stats.snapshot().command_parse_errors, 1);
        assert!(rx.try_recv().is_err(), "queue must stay empty");
    }

    #[tokio::test]
    async fn valid_command_is_enqueued() {
        let stats = BridgeStats::default();
        let (tx, mut rx) = mpsc::channel::<Command>(4);

        handle_command_message(
            "intellichem2mqtt/intellichem/set/orp_setpoint",
            b"700",
            &tx,
            &stats,
        )
        .await;

        assert_eq!(stats.snapshot().command_parse_errors, 0);
        assert!(matches!(rx.try_recv(), Ok(Command::Set(_))));
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let stats = BridgeStats::default();
        let (tx, _rx) = mpsc::channel::<Command>(1);
        tx.try_send(Command::ForcePoll).unwrap();

        handle_command_message(
            "intellichem2mqtt/intellichem/set/orp_setpoint",
            b"700",
            &tx,
            &stats,
        )
        .await;

        assert_eq!(stats.snapshot().dropped_commands, 1);
    }
}
