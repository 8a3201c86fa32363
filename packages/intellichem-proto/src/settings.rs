//! Writable settings: range validation and the 21-byte config payload.
//!
//! A config write must carry *every* writable field, so a single-field
//! command is expressed as a [`SettingChange`] applied onto a clone of the
//! last decoded settings. The encoder never merges with prior state itself;
//! merging is the caller's duty.

use serde::Serialize;

use crate::error::ProtocolError;
use crate::frame::{self, ACTION_CONFIG_WRITE, CONTROLLER_ADDR, FRAME_OVERHEAD};
use crate::status::IntellichemStatus;

/// Config writes always carry exactly this much payload.
pub const CONFIG_PAYLOAD_LEN: usize = 21;

/// Settable ranges, enforced on encode (and again at MQTT parse time).
pub const PH_SETPOINT_MIN: f32 = 7.0;
pub const PH_SETPOINT_MAX: f32 = 7.6;
pub const ORP_SETPOINT_MIN: u16 = 400;
pub const ORP_SETPOINT_MAX: u16 = 800;
pub const TANK_LEVEL_MAX: u8 = 7;
pub const HARDNESS_MIN: u16 = 25;
pub const HARDNESS_MAX: u16 = 800;
pub const CYA_MAX: u8 = 210;
pub const ALKALINITY_MIN: u16 = 25;
pub const ALKALINITY_MAX: u16 = 800;

// Payload offsets
const OFF_PH_SETPOINT: usize = 0;
const OFF_ORP_SETPOINT: usize = 2;
const OFF_PH_TANK: usize = 4;
const OFF_ORP_TANK: usize = 5;
const OFF_HARDNESS: usize = 6;
const OFF_CYA: usize = 9;
// Alkalinity is split around a reserved byte: high at 10, low at 12.
const OFF_ALK_HI: usize = 10;
const OFF_ALK_LO: usize = 12;

// ── Records ───────────────────────────────────────────────────────────────────

/// The writable subset of controller state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChemSettings {
    pub ph_setpoint: f32,
    pub orp_setpoint: u16,
    /// 0–7; 7 enables dosing from a full tank, 0 disables it.
    pub ph_tank_level: u8,
    pub orp_tank_level: u8,
    pub calcium_hardness: u16,
    pub cyanuric_acid: u8,
    pub alkalinity: u16,
}

impl From<&IntellichemStatus> for ChemSettings {
    /// Project the writable fields out of a status record. This is the
    /// baseline a single-field command is merged onto, so unchanged fields
    /// keep their device-reported values instead of zeroing.
    fn from(s: &IntellichemStatus) -> Self {
        Self {
            ph_setpoint: s.ph.setpoint,
            orp_setpoint: s.orp.setpoint,
            ph_tank_level: s.ph.tank_level,
            orp_tank_level: s.orp.tank_level,
            calcium_hardness: s.calcium_hardness,
            cyanuric_acid: s.cyanuric_acid,
            alkalinity: s.alkalinity,
        }
    }
}

/// A single-field mutation, parsed from one MQTT command message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingChange {
    PhSetpoint(f32),
    OrpSetpoint(u16),
    PhDosingEnabled(bool),
    OrpDosingEnabled(bool),
    CalciumHardness(u16),
    CyanuricAcid(u8),
    Alkalinity(u16),
}

impl ChemSettings {
    /// Apply one mutation, leaving every other field untouched.
    pub fn apply(&mut self, change: SettingChange) {
        match change {
            SettingChange::PhSetpoint(v) => self.ph_setpoint = v,
            SettingChange::OrpSetpoint(v) => self.orp_setpoint = v,
            SettingChange::PhDosingEnabled(on) => {
                self.ph_tank_level = if on { TANK_LEVEL_MAX } else { 0 };
            }
            SettingChange::OrpDosingEnabled(on) => {
                self.orp_tank_level = if on { TANK_LEVEL_MAX } else { 0 };
            }
            SettingChange::CalciumHardness(v) => self.calcium_hardness = v,
            SettingChange::CyanuricAcid(v) => self.cyanuric_acid = v,
            SettingChange::Alkalinity(v) => self.alkalinity = v,
        }
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        if !(PH_SETPOINT_MIN..=PH_SETPOINT_MAX).contains(&self.ph_setpoint) {
            return Err(ProtocolError::InvalidSettings {
                field: "ph_setpoint",
                value: f64::from(self.ph_setpoint),
            });
        }
        if !(ORP_SETPOINT_MIN..=ORP_SETPOINT_MAX).contains(&self.orp_setpoint) {
            return Err(ProtocolError::InvalidSettings {
                field: "orp_setpoint",
                value: f64::from(self.orp_setpoint),
            });
        }
        if self.ph_tank_level > TANK_LEVEL_MAX {
            return Err(ProtocolError::InvalidSettings {
                field: "ph_tank_level",
                value: f64::from(self.ph_tank_level),
            });
        }
        if self.orp_tank_level > TANK_LEVEL_MAX {
            return Err(ProtocolError::InvalidSettings {
                field: "orp_tank_level",
                value: f64::from(self.orp_tank_level),
            });
        }
        if !(HARDNESS_MIN..=HARDNESS_MAX).contains(&self.calcium_hardness) {
            return Err(ProtocolError::InvalidSettings {
                field: "calcium_hardness",
                value: f64::from(self.calcium_hardness),
            });
        }
        if self.cyanuric_acid > CYA_MAX {
            return Err(ProtocolError::InvalidSettings {
                field: "cyanuric_acid",
                value: f64::from(self.cyanuric_acid),
            });
        }
        if !(ALKALINITY_MIN..=ALKALINITY_MAX).contains(&self.alkalinity) {
            return Err(ProtocolError::InvalidSettings {
                field: "alkalinity",
                value: f64::from(self.alkalinity),
            });
        }
        Ok(())
    }

    /// Validate and pack into the 21-byte payload. Reserved bytes stay zero.
    pub fn to_payload(&self) -> Result<[u8; CONFIG_PAYLOAD_LEN], ProtocolError> {
        self.validate()?;

        let mut p = [0u8; CONFIG_PAYLOAD_LEN];
        let ph = (self.ph_setpoint * 100.0).round() as u16;
        p[OFF_PH_SETPOINT..OFF_PH_SETPOINT + 2].copy_from_slice(&ph.to_be_bytes());
        p[OFF_ORP_SETPOINT..OFF_ORP_SETPOINT + 2].copy_from_slice(&self.orp_setpoint.to_be_bytes());
        p[OFF_PH_TANK] = self.ph_tank_level;
        p[OFF_ORP_TANK] = self.orp_tank_level;
        p[OFF_HARDNESS..OFF_HARDNESS + 2].copy_from_slice(&self.calcium_hardness.to_be_bytes());
        p[OFF_CYA] = self.cyanuric_acid;
        p[OFF_ALK_HI] = (self.alkalinity >> 8) as u8;
        p[OFF_ALK_LO] = (self.alkalinity & 0xFF) as u8;
        Ok(p)
    }

    /// Read settings back out of a config payload, as a device would store
    /// them. Used by the bench simulator and the echo round-trip tests.
    pub fn from_payload(p: &[u8]) -> Result<Self, ProtocolError> {
        if p.len() < CONFIG_PAYLOAD_LEN {
            return Err(ProtocolError::ShortPayload(p.len()));
        }
        Ok(Self {
            ph_setpoint: f32::from(u16::from_be_bytes([p[0], p[1]])) / 100.0,
            orp_setpoint: u16::from_be_bytes([p[2], p[3]]),
            ph_tank_level: p[OFF_PH_TANK],
            orp_tank_level: p[OFF_ORP_TANK],
            calcium_hardness: u16::from_be_bytes([p[6], p[7]]),
            cyanuric_acid: p[OFF_CYA],
            alkalinity: u16::from(p[OFF_ALK_HI]) << 8 | u16::from(p[OFF_ALK_LO]),
        })
    }
}

/// Validate `settings` and build the complete config-write frame into `out`.
pub fn encode_config(
    settings: &ChemSettings,
    dest: u8,
    out: &mut [u8],
) -> Result<usize, ProtocolError> {
    let payload = settings.to_payload()?;
    if out.len() < FRAME_OVERHEAD + CONFIG_PAYLOAD_LEN {
        return Err(ProtocolError::BufferTooSmall {
            needed: FRAME_OVERHEAD + CONFIG_PAYLOAD_LEN,
            available: out.len(),
        });
    }
    frame::build(out, dest, CONTROLLER_ADDR, ACTION_CONFIG_WRITE, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MAX_FRAME_LEN;

    fn sample() -> ChemSettings {
        ChemSettings {
            ph_setpoint: 7.3,
            orp_setpoint: 700,
            ph_tank_level: 5,
            orp_tank_level: 6,
            calcium_hardness: 300,
            cyanuric_acid: 30,
            alkalinity: 80,
        }
    }

    #[test]
    fn payload_layout_matches_device() {
        let p = sample().to_payload().unwrap();
        assert_eq!(&p[0..2], &[0x02, 0xDA]);
        assert_eq!(&p[2..4], &[0x02, 0xBC]);
        assert_eq!(p[4], 0x05);
        assert_eq!(p[5], 0x06);
        assert_eq!(&p[6..8], &[0x01, 0x2C]);
        assert_eq!(p[9], 0x1E);
        assert_eq!(p[10], 0x00);
        assert_eq!(p[11], 0x00);
        assert_eq!(p[12], 0x50);
        for (i, b) in p.iter().enumerate() {
            if ![0, 1, 2, 3, 4, 5, 6, 7, 9, 10, 12].contains(&i) {
                assert_eq!(*b, 0, "reserved byte {i} must stay zero");
            }
        }
    }

    #[test]
    fn alkalinity_split_covers_high_byte() {
        let mut s = sample();
        s.alkalinity = 0x0150; // 336
        let p = s.to_payload().unwrap();
        assert_eq!(p[10], 0x01);
        assert_eq!(p[11], 0x00);
        assert_eq!(p[12], 0x50);
        assert_eq!(ChemSettings::from_payload(&p).unwrap().alkalinity, 336);
    }

    #[test]
    fn each_field_is_range_checked() {
        let cases: [(&str, ChemSettings); 7] = [
            ("ph_setpoint", ChemSettings { ph_setpoint: 7.7, ..sample() }),
            ("ph_setpoint", ChemSettings { ph_setpoint: 6.9, ..sample() }),
            ("orp_setpoint", ChemSettings { orp_setpoint: 399, ..sample() }),
            ("ph_tank_level", ChemSettings { ph_tank_level: 8, ..sample() }),
            ("orp_tank_level", ChemSettings { orp_tank_level: 9, ..sample() }),
            ("calcium_hardness", ChemSettings { calcium_hardness: 801, ..sample() }),
            ("alkalinity", ChemSettings { alkalinity: 24, ..sample() }),
        ];
        for (field, s) in cases {
            match s.to_payload() {
                Err(ProtocolError::InvalidSettings { field: f, .. }) => assert_eq!(f, field),
                other => panic!("expected InvalidSettings for {field}, got {other:?}"),
            }
        }
        // cyanuric_acid: u8 cannot go below 0, only above 210
        let s = ChemSettings { cyanuric_acid: 211, ..sample() };
        assert!(matches!(
            s.to_payload(),
            Err(ProtocolError::InvalidSettings { field: "cyanuric_acid", .. })
        ));
    }

    #[test]
    fn boundaries_are_inclusive() {
        for s in [
            ChemSettings { ph_setpoint: 7.0, ..sample() },
            ChemSettings { ph_setpoint: 7.6, ..sample() },
            ChemSettings { orp_setpoint: 400, ..sample() },
            ChemSettings { orp_setpoint: 800, ..sample() },
            ChemSettings { ph_tank_level: 0, orp_tank_level: 7, ..sample() },
            ChemSettings { cyanuric_acid: 0, ..sample() },
            ChemSettings { cyanuric_acid: 210, ..sample() },
            ChemSettings { calcium_hardness: 25, alkalinity: 800, ..sample() },
        ] {
            assert!(s.to_payload().is_ok(), "{s:?} should encode");
        }
    }

    #[test]
    fn payload_round_trips() {
        let s = sample();
        let back = ChemSettings::from_payload(&s.to_payload().unwrap()).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn apply_touches_one_field_only() {
        let mut s = sample();
        s.apply(SettingChange::OrpSetpoint(750));
        assert_eq!(s.orp_setpoint, 750);
        assert_eq!(ChemSettings { orp_setpoint: 750, ..sample() }, s);

        s.apply(SettingChange::PhDosingEnabled(true));
        assert_eq!(s.ph_tank_level, 7);
        s.apply(SettingChange::PhDosingEnabled(false));
        assert_eq!(s.ph_tank_level, 0);
    }

    #[test]
    fn encode_builds_a_valid_config_frame() {
        let mut buf = [0u8; MAX_FRAME_LEN];
        let len = encode_config(&sample(), 144, &mut buf).unwrap();
        assert_eq!(len, FRAME_OVERHEAD + CONFIG_PAYLOAD_LEN);
        crate::frame::validate_structure(&buf[..len]).unwrap();
        crate::frame::validate_checksum(&buf[..len]).unwrap();
        assert_eq!(crate::frame::action(&buf[..len]), ACTION_CONFIG_WRITE);
        assert_eq!(crate::frame::destination(&buf[..len]), 144);
        assert_eq!(crate::frame::source(&buf[..len]), CONTROLLER_ADDR);
    }
}
