//! Protocol error taxonomy.
//!
//! Every fallible operation in this crate returns one of these variants;
//! none of them is fatal to a caller. The bridge maps each variant to a
//! counter and keeps running.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum ProtocolError {
    /// Caller's output buffer cannot hold the frame being built.
    #[error("output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Preamble or start byte missing, or buffer shorter than declared.
    #[error("invalid frame structure")]
    InvalidStructure,

    /// Stored checksum does not match the computed header+payload sum.
    #[error("checksum mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    BadChecksum { stored: u16, computed: u16 },

    /// Source address outside the IntelliChem range 144–158.
    #[error("source address {0} is not an IntelliChem")]
    BadSource(u8),

    /// Frame action is not a status response.
    #[error("unexpected action code {0}")]
    BadAction(u8),

    /// Status payload shorter than the 41 bytes the decoder needs.
    #[error("status payload too short: {0} bytes")]
    ShortPayload(usize),

    /// A settings field failed its closed-range check on encode.
    #[error("{field} out of range: {value}")]
    InvalidSettings { field: &'static str, value: f64 },
}
