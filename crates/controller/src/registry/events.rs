//! Events broadcast to registry subscribers
//!
//! Everything the HMI, historian and alarm engine see flows through
//! this stream. Events are emitted after the registry lock is
//! released, in the order the mutations occurred.

use crate::registry::device::{ActuatorState, ArState, DeviceSnapshot, SensorReading};
use serde::Serialize;

/// Alarm bound a sensor value crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmBound {
    LoLo,
    Low,
    High,
    HiHi,
}

/// Event broadcast to subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryEvent {
    DeviceAdded {
        device: DeviceSnapshot,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    DeviceRemoved {
        station: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    DeviceStateChanged {
        station: String,
        old: ArState,
        new: ArState,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    SensorUpdated {
        station: String,
        slot: u16,
        reading: SensorReading,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    ActuatorUpdated {
        station: String,
        slot: u16,
        state: ActuatorState,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// A sensor value crossed one of its configured alarm bounds.
    /// Rule evaluation and acknowledgement live in the alarm engine;
    /// this is only the raw crossing.
    AlarmRaised {
        station: String,
        slot: u16,
        bound: AlarmBound,
        value: f32,
        limit: f32,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl RegistryEvent {
    /// Station the event concerns, for per-station filtering
    pub fn station(&self) -> &str {
        match self {
            Self::DeviceAdded { device, .. } => &device.station,
            Self::DeviceRemoved { station, .. }
            | Self::DeviceStateChanged { station, .. }
            | Self::SensorUpdated { station, .. }
            | Self::ActuatorUpdated { station, .. }
            | Self::AlarmRaised { station, .. } => station,
        }
    }
}
