//! Inbound command grammar.
//!
//! Commands arrive as MQTT messages under `{prefix}/intellichem/set/<name>`;
//! the trailing topic segment selects the command and the payload is parsed
//! under that command's grammar. Anything that fails to parse or falls
//! outside its settable range is rejected here and never reaches the bus.

use intellichem_proto::settings::{
    SettingChange, ALKALINITY_MAX, ALKALINITY_MIN, CYA_MAX, HARDNESS_MAX, HARDNESS_MIN,
    ORP_SETPOINT_MAX, ORP_SETPOINT_MIN, PH_SETPOINT_MAX, PH_SETPOINT_MIN,
};
use thiserror::Error;

/// A validated command for the bus poller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Merge one settings change onto the last-known settings and transmit.
    Set(SettingChange),
    /// Send a status request now instead of waiting for the next tick.
    ForcePoll,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandParseError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("payload is not UTF-8")]
    NotUtf8,
    #[error("cannot parse '{payload}' as {expected}")]
    BadPayload {
        expected: &'static str,
        payload: String,
    },
    #[error("{name} {value} outside {min}..={max}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

fn parse_f32(
    name: &'static str,
    text: &str,
    min: f32,
    max: f32,
) -> Result<f32, CommandParseError> {
    let v: f32 = text.parse().map_err(|_| CommandParseError::BadPayload {
        expected: "a decimal number",
        payload: text.to_string(),
    })?;
    if !(min..=max).contains(&v) {
        return Err(CommandParseError::OutOfRange {
            name,
            value: f64::from(v),
            min: f64::from(min),
            max: f64::from(max),
        });
    }
    Ok(v)
}

fn parse_u16(
    name: &'static str,
    text: &str,
    min: u16,
    max: u16,
) -> Result<u16, CommandParseError> {
    let v: u16 = text.parse().map_err(|_| CommandParseError::BadPayload {
        expected: "an integer",
        payload: text.to_string(),
    })?;
    if !(min..=max).contains(&v) {
        return Err(CommandParseError::OutOfRange {
            name,
            value: f64::from(v),
            min: f64::from(min),
            max: f64::from(max),
        });
    }
    Ok(v)
}

/// ON/OFF/true/false/1/0, case-insensitive.
fn parse_switch(text: &str) -> Result<bool, CommandParseError> {
    match text.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(CommandParseError::BadPayload {
            expected: "ON/OFF/true/false/1/0",
            payload: text.to_string(),
        }),
    }
}

/// Parse one command message. `topic` is the full topic the message arrived
/// on; only its trailing segment matters.
pub fn parse(topic: &str, payload: &[u8]) -> Result<Command, CommandParseError> {
    let name = topic.rsplit('/').next().unwrap_or(topic);
    let text = std::str::from_utf8(payload)
        .map_err(|_| CommandParseError::NotUtf8)?
        .trim();

    let change = match name {
        "ph_setpoint" => SettingChange::PhSetpoint(parse_f32(
            "ph_setpoint",
            text,
            PH_SETPOINT_MIN,
            PH_SETPOINT_MAX,
        )?),
        "orp_setpoint" => SettingChange::OrpSetpoint(parse_u16(
            "orp_setpoint",
            text,
            ORP_SETPOINT_MIN,
            ORP_SETPOINT_MAX,
        )?),
        "ph_dosing_enabled" => SettingChange::PhDosingEnabled(parse_switch(text)?),
        "orp_dosing_enabled" => SettingChange::OrpDosingEnabled(parse_switch(text)?),
        "calcium_hardness" => SettingChange::CalciumHardness(parse_u16(
            "calcium_hardness",
            text,
            HARDNESS_MIN,
            HARDNESS_MAX,
        )?),
        "cyanuric_acid" => {
            SettingChange::CyanuricAcid(parse_u16("cyanuric_acid", text, 0, u16::from(CYA_MAX))? as u8)
        }
        "alkalinity" => SettingChange::Alkalinity(parse_u16(
            "alkalinity",
            text,
            ALKALINITY_MIN,
            ALKALINITY_MAX,
        )?),
        other => return Err(CommandParseError::UnknownCommand(other.to_string())),
    };
    Ok(Command::Set(change))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "intellichem2mqtt/intellichem/set";

    fn set(name: &str, payload: &str) -> Result<Command, CommandParseError> {
        parse(&format!("{TOPIC}/{name}"), payload.as_bytes())
    }

    #[test]
    fn ph_setpoint_in_range_parses() {
        assert_eq!(
            set("ph_setpoint", "7.3").unwrap(),
            Command::Set(SettingChange::PhSetpoint(7.3))
        );
        assert_eq!(
            set("ph_setpoint", " 7.0\n").unwrap(),
            Command::Set(SettingChange::PhSetpoint(7.0))
        );
    }

    #[test]
    fn ph_setpoint_out_of_range_is_refused() {
        assert!(matches!(
            set("ph_setpoint", "9.9"),
            Err(CommandParseError::OutOfRange {
                name: "ph_setpoint",
                ..
            })
        ));
        assert!(matches!(
            set("ph_setpoint", "pool"),
            Err(CommandParseError::BadPayload { .. })
        ));
    }

    #[test]
    fn orp_setpoint_wants_an_integer() {
        assert_eq!(
            set("orp_setpoint", "700").unwrap(),
            Command::Set(SettingChange::OrpSetpoint(700))
        );
        assert!(set("orp_setpoint", "700.5").is_err());
        assert!(set("orp_setpoint", "399").is_err());
        assert!(set("orp_setpoint", "801").is_err());
    }

    #[test]
    fn dosing_switch_accepts_all_spellings() {
        for on in ["ON", "on", "True", "1"] {
            assert_eq!(
                set("ph_dosing_enabled", on).unwrap(),
                Command::Set(SettingChange::PhDosingEnabled(true)),
                "{on}"
            );
        }
        for off in ["OFF", "off", "FALSE", "0"] {
            assert_eq!(
                set("orp_dosing_enabled", off).unwrap(),
                Command::Set(SettingChange::OrpDosingEnabled(false)),
                "{off}"
            );
        }
        assert!(set("ph_dosing_enabled", "maybe").is_err());
    }

    #[test]
    fn chemistry_ranges() {
        assert!(set("calcium_hardness", "300").is_ok());
        assert!(set("calcium_hardness", "24").is_err());
        assert!(set("cyanuric_acid", "0").is_ok());
        assert!(set("cyanuric_acid", "210").is_ok());
        assert!(set("cyanuric_acid", "211").is_err());
        assert!(set("alkalinity", "80").is_ok());
        assert!(set("alkalinity", "801").is_err());
    }

    #[test]
    fn unknown_command_and_bad_encoding() {
        assert!(matches!(
            set("salt_level", "3000"),
            Err(CommandParseError::UnknownCommand(_))
        ));
        assert_eq!(
            parse(&format!("{TOPIC}/ph_setpoint"), &[0xFF, 0xFE]),
            Err(CommandParseError::NotUtf8)
        );
    }
}
