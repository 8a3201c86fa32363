//! Status decode: 41-byte response payload → typed record.
//!
//! The payload is a dense mix of big-endian words, sign-magnitude bytes,
//! bit-packed registers and scaled integers. Offsets below are into the
//! payload, not the frame.
//!
//! | offset | field                               |
//! |--------|-------------------------------------|
//! | 0      | pH level × 100, BE16                |
//! | 2      | ORP level mV, BE16                  |
//! | 4      | pH setpoint × 100, BE16             |
//! | 6      | ORP setpoint mV, BE16               |
//! | 10/14  | pH / ORP dose time s, BE16          |
//! | 16/18  | pH / ORP dose volume mL, BE16       |
//! | 20/21  | pH / ORP tank level, raw 0–7        |
//! | 22     | LSI × 100, sign-magnitude           |
//! | 23     | calcium hardness ppm, BE16          |
//! | 26     | cyanuric acid ppm                   |
//! | 27     | alkalinity ppm, BE16                |
//! | 29     | salt ÷ 50                           |
//! | 31     | water temperature °                 |
//! | 32     | alarm register                      |
//! | 33     | warning register                    |
//! | 34     | dosing register (types + statuses)  |
//! | 35     | bit 7: controller comms lost        |
//! | 36/37  | firmware minor / major              |
//! | 38     | water balance 0=OK 1=corr 2=scal    |

use serde::Serialize;

use crate::error::ProtocolError;
use crate::frame::{self, ACTION_STATUS_RESPONSE};

/// Status responses carry at least this much payload.
pub const STATUS_PAYLOAD_LEN: usize = 41;

// Alarm register bits. The device also defines pair-masks for pH (0x06)
// and ORP (0x18) alarms; those are not surfaced individually.
const ALARM_FLOW: u8 = 0x01;
const ALARM_PH_TANK_EMPTY: u8 = 0x20;
const ALARM_ORP_TANK_EMPTY: u8 = 0x40;
const ALARM_PROBE_FAULT: u8 = 0x80;

// Warning register bits.
const WARN_PH_LOCKOUT: u8 = 0x01;
const WARN_PH_DAILY_LIMIT: u8 = 0x02;
const WARN_ORP_DAILY_LIMIT: u8 = 0x04;
const WARN_INVALID_SETUP: u8 = 0x08;
const WARN_CHLORINATOR_COMM: u8 = 0x10;

// ── Enums ─────────────────────────────────────────────────────────────────────

/// The device's own view of what its doser is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DosingStatus {
    Dosing,
    Monitoring,
    Mixing,
}

impl DosingStatus {
    /// Two-bit register field, clamped into range.
    fn from_bits(v: u8) -> Self {
        match v {
            0 => Self::Dosing,
            1 => Self::Monitoring,
            _ => Self::Mixing,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dosing => "Dosing",
            Self::Monitoring => "Monitoring",
            Self::Mixing => "Mixing",
        }
    }
}

/// Langelier-style water balance verdict from the device.
/// Unknown register values clamp to `Scaling`, matching observed firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WaterBalance {
    Ok,
    Corrosive,
    Scaling,
}

impl WaterBalance {
    fn from_byte(v: u8) -> Self {
        match v {
            0 => Self::Ok,
            1 => Self::Corrosive,
            _ => Self::Scaling,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Corrosive => "Corrosive",
            Self::Scaling => "Scaling",
        }
    }
}

// ── Bit-register views ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Alarms {
    pub flow: bool,
    pub ph_tank_empty: bool,
    pub orp_tank_empty: bool,
    pub probe_fault: bool,
}

impl Alarms {
    fn from_byte(v: u8) -> Self {
        Self {
            flow: v & ALARM_FLOW != 0,
            ph_tank_empty: v & ALARM_PH_TANK_EMPTY != 0,
            orp_tank_empty: v & ALARM_ORP_TANK_EMPTY != 0,
            probe_fault: v & ALARM_PROBE_FAULT != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Warnings {
    pub ph_lockout: bool,
    pub ph_daily_limit: bool,
    pub orp_daily_limit: bool,
    pub invalid_setup: bool,
    pub chlorinator_comm: bool,
    pub water_balance: WaterBalance,
}

impl Warnings {
    fn from_bytes(reg: u8, balance: u8) -> Self {
        Self {
            ph_lockout: reg & WARN_PH_LOCKOUT != 0,
            ph_daily_limit: reg & WARN_PH_DAILY_LIMIT != 0,
            orp_daily_limit: reg & WARN_ORP_DAILY_LIMIT != 0,
            invalid_setup: reg & WARN_INVALID_SETUP != 0,
            chlorinator_comm: reg & WARN_CHLORINATOR_COMM != 0,
            water_balance: WaterBalance::from_byte(balance),
        }
    }
}

// ── Per-chemistry state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PhState {
    /// Measured pH, hundredths resolution.
    pub level: f32,
    /// Target pH. May report outside the settable 7.0–7.6 window.
    pub setpoint: f32,
    /// Seconds the doser ran in the current cycle.
    pub dose_time_s: u16,
    /// Millilitres dosed in the current cycle.
    pub dose_volume_ml: u16,
    /// Remaining acid, 0–6.
    pub tank_level: u8,
    pub dosing_status: DosingStatus,
    /// Actively injecting: `dosing_status == Dosing` with a doser fitted.
    pub is_dosing: bool,
    /// Doser type bits, diagnostic. 0 means none fitted.
    pub doser_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OrpState {
    /// Measured ORP in millivolts.
    pub level: u16,
    /// Target ORP in millivolts.
    pub setpoint: u16,
    pub dose_time_s: u16,
    pub dose_volume_ml: u16,
    /// Remaining chlorine, 0–6.
    pub tank_level: u8,
    pub dosing_status: DosingStatus,
    pub is_dosing: bool,
    pub doser_type: u8,
}

// ── Full record ───────────────────────────────────────────────────────────────

/// One decoded status response. Built fresh per successful decode and
/// replaced wholesale by the next; nothing in it is accumulated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntellichemStatus {
    /// Bus address the response came from (144–158).
    pub address: u8,
    pub ph: PhState,
    pub orp: OrpState,
    /// Langelier Saturation Index, hundredths, negative = corrosive.
    pub lsi: f32,
    pub calcium_hardness: u16,
    pub cyanuric_acid: u8,
    pub alkalinity: u16,
    pub salt_level: u16,
    pub temperature: u8,
    /// Firmware as reported, e.g. "1.060".
    pub firmware: String,
    pub alarms: Alarms,
    pub warnings: Warnings,
    pub flow_detected: bool,
    /// Controller ↔ IntelliChem comms flag from the device, or set by the
    /// poller when responses go stale.
    pub comms_lost: bool,
    /// Monotonic milliseconds at decode time.
    pub last_update_ms: u64,
}

fn be16(p: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([p[off], p[off + 1]])
}

/// Tank levels arrive as raw 0–7: 0 means no tank, 1–7 map to 0–6.
fn tank_level(raw: u8) -> u8 {
    raw.saturating_sub(1).min(6)
}

/// Sign-magnitude hundredths: bit 7 set means `-(256 - v) / 100`.
fn lsi(raw: u8) -> f32 {
    if raw & 0x80 != 0 {
        -((256 - i32::from(raw)) as f32) / 100.0
    } else {
        f32::from(raw) / 100.0
    }
}

/// Decode a validated status-response frame.
///
/// `now_ms` stamps `last_update_ms`; the poller passes its monotonic clock
/// so staleness can be judged without wall-time jumps.
pub fn decode_status(frame_buf: &[u8], now_ms: u64) -> Result<IntellichemStatus, ProtocolError> {
    let src = frame::source(frame_buf);
    if !frame::source_is_intellichem(frame_buf) {
        return Err(ProtocolError::BadSource(src));
    }
    let action = frame::action(frame_buf);
    if action != ACTION_STATUS_RESPONSE {
        return Err(ProtocolError::BadAction(action));
    }
    let p = frame::payload(frame_buf);
    if p.len() < STATUS_PAYLOAD_LEN {
        return Err(ProtocolError::ShortPayload(p.len()));
    }

    // Dosing register: types in the low nibble, statuses in the high.
    let dosing = p[34];
    let ph_doser_type = dosing & 0x03;
    let orp_doser_type = (dosing >> 2) & 0x03;
    let ph_status = DosingStatus::from_bits((dosing >> 4) & 0x03);
    let orp_status = DosingStatus::from_bits((dosing >> 6) & 0x03);

    let alarms = Alarms::from_byte(p[32]);

    Ok(IntellichemStatus {
        address: src,
        ph: PhState {
            level: f32::from(be16(p, 0)) / 100.0,
            setpoint: f32::from(be16(p, 4)) / 100.0,
            dose_time_s: be16(p, 10),
            dose_volume_ml: be16(p, 16),
            tank_level: tank_level(p[20]),
            dosing_status: ph_status,
            is_dosing: ph_status == DosingStatus::Dosing && ph_doser_type != 0,
            doser_type: ph_doser_type,
        },
        orp: OrpState {
            level: be16(p, 2),
            setpoint: be16(p, 6),
            dose_time_s: be16(p, 14),
            dose_volume_ml: be16(p, 18),
            tank_level: tank_level(p[21]),
            dosing_status: orp_status,
            is_dosing: orp_status == DosingStatus::Dosing && orp_doser_type != 0,
            doser_type: orp_doser_type,
        },
        lsi: lsi(p[22]),
        calcium_hardness: be16(p, 23),
        cyanuric_acid: p[26],
        alkalinity: be16(p, 27),
        salt_level: u16::from(p[29]) * 50,
        temperature: p[31],
        firmware: format!("{}.{:03}", p[37], p[36]),
        alarms,
        warnings: Warnings::from_bytes(p[33], p[38]),
        flow_detected: !alarms.flow,
        comms_lost: p[35] & 0x80 != 0,
        last_update_ms: now_ms,
    })
}
