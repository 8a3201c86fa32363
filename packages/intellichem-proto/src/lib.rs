//! # intellichem-proto
//!
//! Pentair IntelliChem RS-485 wire protocol, shared by:
//! - `bridge`: polling the controller and translating state/commands to MQTT
//! - `chem-simulator`: speaking the device side of the bus on a bench
//!
//! The bus is half-duplex multi-drop at 9600 8N1. Every frame is
//! `FF 00 FF | A5 00 dest src action len | payload | ck_hi ck_lo`
//! where the checksum is the 16-bit wrapping sum of header + payload.
//!
//! ## Layers
//! - [`frame`]: build / validate / field access on a single frame. Pure.
//! - [`resync`]: ring-buffered byte sink that recovers framing from a
//!   noisy stream (partial packets, line garbage, mid-frame joins).
//! - [`status`]: decode of the 41-byte status payload into a typed record.
//! - [`settings`]: writable-settings record, range validation and the
//!   21-byte config payload codec.
//!
//! Nothing here does I/O, allocates after construction, or panics on
//! malformed input — every fallible path returns [`ProtocolError`].

pub mod error;
pub mod frame;
pub mod resync;
pub mod settings;
pub mod status;

pub use error::ProtocolError;
pub use frame::{
    ACTION_BROADCAST, ACTION_CONFIG_WRITE, ACTION_STATUS_REQUEST, ACTION_STATUS_RESPONSE,
    CONTROLLER_ADDR, DEFAULT_INTELLICHEM_ADDR, FRAME_OVERHEAD, INTELLICHEM_ADDR_MAX,
    INTELLICHEM_ADDR_MIN, MAX_FRAME_LEN,
};
pub use resync::{LinkCounters, StreamResync};
pub use settings::{ChemSettings, SettingChange, CONFIG_PAYLOAD_LEN};
pub use status::{
    Alarms, DosingStatus, IntellichemStatus, OrpState, PhState, Warnings, WaterBalance,
    STATUS_PAYLOAD_LEN,
};
