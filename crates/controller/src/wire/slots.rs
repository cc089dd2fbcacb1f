//! Per-slot IO data encoding
//!
//! A sensor slot is exactly 5 bytes on the wire: an IEEE-754 float in
//! big-endian byte order followed by one quality byte. An actuator slot
//! is exactly 4 bytes: command, PWM duty, two reserved zero bytes.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

pub const SENSOR_SLOT_SIZE: usize = 5;
pub const ACTUATOR_SLOT_SIZE: usize = 4;

/// Provider/consumer status "good" marker (DataItem state bit)
pub const IO_STATUS_GOOD: u8 = 0x80;
pub const IO_STATUS_BAD: u8 = 0x00;

/// Data quality accompanying every sensor sample. Codepoints are fixed
/// by the shared header the HMI and historian consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Quality {
    NotConnected = 0,
    Bad = 1,
    Uncertain = 2,
    Good = 3,
}

impl Quality {
    pub fn from_wire(v: u8) -> CoreResult<Self> {
        match v {
            0 => Ok(Self::NotConnected),
            1 => Ok(Self::Bad),
            2 => Ok(Self::Uncertain),
            3 => Ok(Self::Good),
            other => Err(CoreError::InvalidField {
                field: "quality",
                reason: format!("unknown codepoint {other}"),
            }),
        }
    }

    /// BAD and NOT_CONNECTED readings must never drive control logic
    pub fn usable_for_control(&self) -> bool {
        matches!(self, Self::Good | Self::Uncertain)
    }
}

/// IO provider status: the producer's claim that its data is valid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Iops {
    Good,
    Bad,
}

impl Iops {
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Good => IO_STATUS_GOOD,
            Self::Bad => IO_STATUS_BAD,
        }
    }

    pub fn from_wire(v: u8) -> Self {
        if v & IO_STATUS_GOOD != 0 {
            Self::Good
        } else {
            Self::Bad
        }
    }
}

/// Actuator command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ActuatorCommand {
    Off = 0,
    On = 1,
    Auto = 2,
    Manual = 3,
}

impl ActuatorCommand {
    pub fn from_wire(v: u8) -> CoreResult<Self> {
        match v {
            0 => Ok(Self::Off),
            1 => Ok(Self::On),
            2 => Ok(Self::Auto),
            3 => Ok(Self::Manual),
            other => Err(CoreError::InvalidField {
                field: "actuator_command",
                reason: format!("unknown command {other}"),
            }),
        }
    }
}

/// One actuator slot's worth of output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorOutput {
    pub command: ActuatorCommand,
    pub pwm_duty: u8,
}

impl ActuatorOutput {
    pub const OFF: ActuatorOutput = ActuatorOutput {
        command: ActuatorCommand::Off,
        pwm_duty: 0,
    };
}

pub fn pack_sensor(value: f32, quality: Quality) -> [u8; SENSOR_SLOT_SIZE] {
    let mut out = [0u8; SENSOR_SLOT_SIZE];
    out[..4].copy_from_slice(&value.to_bits().to_be_bytes());
    out[4] = quality as u8;
    out
}

pub fn unpack_sensor(bytes: &[u8]) -> CoreResult<(f32, Quality)> {
    if bytes.len() < SENSOR_SLOT_SIZE {
        return Err(CoreError::ShortBuffer {
            needed: SENSOR_SLOT_SIZE,
            available: bytes.len(),
        });
    }
    let bits = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Ok((f32::from_bits(bits), Quality::from_wire(bytes[4])?))
}

pub fn pack_actuator(output: &ActuatorOutput) -> [u8; ACTUATOR_SLOT_SIZE] {
    [output.command as u8, output.pwm_duty, 0, 0]
}

pub fn unpack_actuator(bytes: &[u8]) -> CoreResult<ActuatorOutput> {
    if bytes.len() < ACTUATOR_SLOT_SIZE {
        return Err(CoreError::ShortBuffer {
            needed: ACTUATOR_SLOT_SIZE,
            available: bytes.len(),
        });
    }
    Ok(ActuatorOutput {
        command: ActuatorCommand::from_wire(bytes[0])?,
        pwm_duty: bytes[1],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_pack_is_big_endian_float_plus_quality() {
        let wire = pack_sensor(12.56, Quality::Good);
        assert_eq!(wire, [0x41, 0x48, 0xF5, 0xC3, 0x03]);

        let (value, quality) = unpack_sensor(&wire).unwrap();
        assert!((value - 12.56).abs() < 1e-5);
        assert_eq!(quality, Quality::Good);
    }

    #[test]
    fn sensor_round_trip_is_byte_exact() {
        for &value in &[0.0f32, -1.5, 1e-10, f32::MAX, f32::MIN_POSITIVE, 7.25] {
            for quality in [
                Quality::NotConnected,
                Quality::Bad,
                Quality::Uncertain,
                Quality::Good,
            ] {
                let wire = pack_sensor(value, quality);
                let (v, q) = unpack_sensor(&wire).unwrap();
                assert_eq!(v.to_bits(), value.to_bits());
                assert_eq!(q, quality);
                assert_eq!(pack_sensor(v, q), wire);
            }
        }
    }

    #[test]
    fn bad_quality_codepoint_is_rejected() {
        let wire = [0, 0, 0, 0, 9];
        assert!(unpack_sensor(&wire).is_err());
    }

    #[test]
    fn actuator_reserved_bytes_are_zero() {
        let out = ActuatorOutput {
            command: ActuatorCommand::On,
            pwm_duty: 128,
        };
        let wire = pack_actuator(&out);
        assert_eq!(wire, [1, 128, 0, 0]);
        assert_eq!(unpack_actuator(&wire).unwrap(), out);
    }

    #[test]
    fn iops_wire_form_uses_state_bit() {
        assert_eq!(Iops::Good.to_wire(), 0x80);
        assert_eq!(Iops::from_wire(0x80), Iops::Good);
        assert_eq!(Iops::from_wire(0xA0), Iops::Good);
        assert_eq!(Iops::from_wire(0x00), Iops::Bad);
    }

    #[test]
    fn quality_control_gating() {
        assert!(Quality::Good.usable_for_control());
        assert!(Quality::Uncertain.usable_for_control());
        assert!(!Quality::Bad.usable_for_control());
        assert!(!Quality::NotConnected.usable_for_control());
    }
}
