//! Bridge configuration.
//!
//! Every knob reads an environment variable and falls back to a
//! compile-time default, so a bare `intellichem2mqtt` run works against a
//! local broker and the usual USB RS-485 adapter path.

use std::time::Duration;

use intellichem_proto::{DEFAULT_INTELLICHEM_ADDR, INTELLICHEM_ADDR_MAX, INTELLICHEM_ADDR_MIN};

pub struct BridgeConfig {
    /// Serial device for the RS-485 adapter (default /dev/ttyUSB0)
    pub serial_device: String,
    /// Direction control: ≥ 0 means the adapter's TX-enable is wired to RTS
    /// and the bridge toggles it; < 0 means an auto-direction transceiver.
    pub dir_pin: i32,
    /// Bus address of the IntelliChem unit (144–158, default 144)
    pub intellichem_addr: u8,
    /// Status poll period (default 30 s)
    pub poll_interval: Duration,
    /// Inter-byte gap after which an awaited response is abandoned (default 5 s)
    pub response_timeout: Duration,
    /// No decode for this long marks state stale / comms lost (default 30 s)
    pub stale_after: Duration,
    /// MQTT broker host and port (default localhost:1883)
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_user: Option<String>,
    pub broker_pass: Option<String>,
    /// Leading topic segment (default "intellichem2mqtt")
    pub topic_prefix: String,
    /// Bounded queue depths between poller and broker task
    pub state_queue_depth: usize,
    pub command_queue_depth: usize,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            serial_device: std::env::var("SERIAL_DEVICE")
                .unwrap_or_else(|_| "/dev/ttyUSB0".to_string()),
            dir_pin: env_parse("RS485_DIR_PIN", -1),
            intellichem_addr: std::env::var("INTELLICHEM_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|a| (INTELLICHEM_ADDR_MIN..=INTELLICHEM_ADDR_MAX).contains(a))
                .unwrap_or(DEFAULT_INTELLICHEM_ADDR),
            poll_interval: Duration::from_secs(env_parse("POLL_INTERVAL_SECS", 30)),
            response_timeout: Duration::from_secs(env_parse("RESPONSE_TIMEOUT_SECS", 5)),
            stale_after: Duration::from_secs(env_parse("STALE_AFTER_SECS", 30)),
            broker_host: std::env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".to_string()),
            broker_port: env_parse("MQTT_PORT", 1883),
            broker_user: std::env::var("MQTT_USER").ok(),
            broker_pass: std::env::var("MQTT_PASS").ok(),
            topic_prefix: std::env::var("TOPIC_PREFIX")
                .unwrap_or_else(|_| "intellichem2mqtt".to_string()),
            state_queue_depth: env_parse("STATE_QUEUE_DEPTH", 8),
            command_queue_depth: env_parse("COMMAND_QUEUE_DEPTH", 8),
        }
    }
}
