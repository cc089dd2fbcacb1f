//! Device records, slot configuration and sample types

use crate::clock::now_monotonic_us;
use crate::wire::{ActuatorOutput, Iops, MacAddr, Quality};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Application-relationship state of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArState {
    /// Initial, and terminal on teardown
    Offline,
    /// Seen in a DCP round, no AR yet
    Discovered,
    /// Connect RPC in flight
    Connecting,
    /// Connect accepted, writing parameter records
    Parameterizing,
    /// Waiting for application-ready
    Applying,
    /// Cyclic data is exchanged only in this state
    Running,
    /// Torn down after a frame timeout or release
    Disconnect,
    /// Connect or parameterization failed; reset required
    Error,
}

impl ArState {
    /// Edges of the state machine. Backward movement exists only
    /// through Disconnect -> Offline and Error -> Offline.
    pub fn can_transition_to(self, next: ArState) -> bool {
        use ArState::*;
        matches!(
            (self, next),
            (Offline, Discovered)
                | (Offline, Connecting)
                | (Discovered, Connecting)
                | (Connecting, Parameterizing)
                | (Connecting, Error)
                | (Parameterizing, Applying)
                | (Parameterizing, Error)
                | (Applying, Running)
                | (Applying, Error)
                | (Running, Disconnect)
                | (Disconnect, Offline)
                | (Error, Offline)
        )
    }
}

impl std::fmt::Display for ArState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Offline => "offline",
            Self::Discovered => "discovered",
            Self::Connecting => "connecting",
            Self::Parameterizing => "parameterizing",
            Self::Applying => "applying",
            Self::Running => "running",
            Self::Disconnect => "disconnect",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Sensor,
    Actuator,
}

/// Configuration of one IO slot. The RTU dictates the layout; the
/// controller adapts to whatever the device reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub slot_number: u16,
    pub subslot: u16,
    pub kind: SlotKind,
    /// Measurement type for sensors ("turbidity"), actuator type for
    /// outputs ("valve")
    pub signal: String,
    pub name: String,
    pub unit: String,
    pub scale_min: f32,
    pub scale_max: f32,
    #[serde(default)]
    pub warn_low: Option<f32>,
    #[serde(default)]
    pub warn_high: Option<f32>,
    #[serde(default)]
    pub alarm_low: Option<f32>,
    #[serde(default)]
    pub alarm_high: Option<f32>,
    #[serde(default)]
    pub alarm_lolo: Option<f32>,
    #[serde(default)]
    pub alarm_hihi: Option<f32>,
    pub enabled: bool,
}

impl SlotConfig {
    pub fn sensor(slot_number: u16, signal: &str, name: &str, unit: &str) -> Self {
        Self {
            slot_number,
            subslot: 1,
            kind: SlotKind::Sensor,
            signal: signal.to_string(),
            name: name.to_string(),
            unit: unit.to_string(),
            scale_min: 0.0,
            scale_max: 100.0,
            warn_low: None,
            warn_high: None,
            alarm_low: None,
            alarm_high: None,
            alarm_lolo: None,
            alarm_hihi: None,
            enabled: true,
        }
    }

    pub fn actuator(slot_number: u16, signal: &str, name: &str) -> Self {
        Self {
            slot_number,
            subslot: 1,
            kind: SlotKind::Actuator,
            signal: signal.to_string(),
            name: name.to_string(),
            unit: String::new(),
            scale_min: 0.0,
            scale_max: 100.0,
            warn_low: None,
            warn_high: None,
            alarm_low: None,
            alarm_high: None,
            alarm_lolo: None,
            alarm_hihi: None,
            enabled: true,
        }
    }
}

/// Stored sensor sample. Staleness is never stored; it is derived on
/// every read from the timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorSample {
    pub value: f32,
    pub quality: Quality,
    pub iops: Iops,
    pub timestamp_us: u64,
}

impl Default for SensorSample {
    fn default() -> Self {
        Self {
            value: 0.0,
            quality: Quality::NotConnected,
            iops: Iops::Bad,
            timestamp_us: 0,
        }
    }
}

/// Sensor sample as handed to consumers, staleness resolved
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorReading {
    pub value: f32,
    pub quality: Quality,
    pub iops: Iops,
    pub timestamp_us: u64,
    pub stale: bool,
}

impl SensorReading {
    pub fn from_sample(sample: &SensorSample, stale_threshold_ms: u64) -> Self {
        let age_us = now_monotonic_us().saturating_sub(sample.timestamp_us);
        Self {
            value: sample.value,
            quality: sample.quality,
            iops: sample.iops,
            timestamp_us: sample.timestamp_us,
            stale: age_us > stale_threshold_ms * 1000,
        }
    }
}

/// Last commanded actuator state
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ActuatorState {
    pub output: ActuatorOutput,
    pub last_change_ms: u64,
}

impl Default for ActuatorState {
    fn default() -> Self {
        Self {
            output: ActuatorOutput::OFF,
            last_change_ms: 0,
        }
    }
}

/// Registry-internal device record. Owned exclusively by the registry;
/// the outside world only ever sees `DeviceSnapshot` copies.
#[derive(Debug, Clone)]
pub(crate) struct DeviceRecord {
    pub station: String,
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub vendor_id: u16,
    pub device_id: u16,
    pub ar_state: ArState,
    pub last_seen_us: u64,
    pub slots: Vec<SlotConfig>,
    pub sensors: Vec<SensorSample>,
    pub actuators: Vec<ActuatorState>,
    pub config_dirty: bool,
}

impl DeviceRecord {
    pub fn new(
        station: String,
        ip: Ipv4Addr,
        mac: MacAddr,
        vendor_id: u16,
        device_id: u16,
        slots: Vec<SlotConfig>,
    ) -> Self {
        let (sensors, actuators) = parallel_vectors(&slots);
        Self {
            station,
            ip,
            mac,
            vendor_id,
            device_id,
            ar_state: ArState::Offline,
            last_seen_us: now_monotonic_us(),
            slots,
            sensors,
            actuators,
            config_dirty: false,
        }
    }

    /// Index into `sensors` for a slot number, in slot order
    pub fn sensor_ordinal(&self, slot_number: u16) -> Option<usize> {
        self.slots
            .iter()
            .filter(|s| s.kind == SlotKind::Sensor)
            .position(|s| s.slot_number == slot_number)
    }

    /// Index into `actuators` for a slot number, in slot order
    pub fn actuator_ordinal(&self, slot_number: u16) -> Option<usize> {
        self.slots
            .iter()
            .filter(|s| s.kind == SlotKind::Actuator)
            .position(|s| s.slot_number == slot_number)
    }

    pub fn sensor_slots(&self) -> impl Iterator<Item = &SlotConfig> {
        self.slots.iter().filter(|s| s.kind == SlotKind::Sensor)
    }

    pub fn actuator_slots(&self) -> impl Iterator<Item = &SlotConfig> {
        self.slots.iter().filter(|s| s.kind == SlotKind::Actuator)
    }

    pub fn snapshot(&self, stale_threshold_ms: u64) -> DeviceSnapshot {
        DeviceSnapshot {
            station: self.station.clone(),
            ip: self.ip,
            mac: self.mac,
            vendor_id: self.vendor_id,
            device_id: self.device_id,
            ar_state: self.ar_state,
            last_seen_us: self.last_seen_us,
            slots: self.slots.clone(),
            sensors: self
                .sensors
                .iter()
                .map(|s| SensorReading::from_sample(s, stale_threshold_ms))
                .collect(),
            actuators: self.actuators.clone(),
            config_dirty: self.config_dirty,
        }
    }
}

/// Fresh default sample/state vectors matching a slot plan
pub(crate) fn parallel_vectors(slots: &[SlotConfig]) -> (Vec<SensorSample>, Vec<ActuatorState>) {
    let sensors = slots.iter().filter(|s| s.kind == SlotKind::Sensor).count();
    let actuators = slots
        .iter()
        .filter(|s| s.kind == SlotKind::Actuator)
        .count();
    (
        vec![SensorSample::default(); sensors],
        vec![ActuatorState::default(); actuators],
    )
}

/// Consistent by-value copy of a device record
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub station: String,
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub vendor_id: u16,
    pub device_id: u16,
    pub ar_state: ArState,
    pub last_seen_us: u64,
    pub slots: Vec<SlotConfig>,
    pub sensors: Vec<SensorReading>,
    pub actuators: Vec<ActuatorState>,
    pub config_dirty: bool,
}

impl DeviceSnapshot {
    pub fn n_sensor_slots(&self) -> usize {
        self.sensors.len()
    }

    pub fn n_actuator_slots(&self) -> usize {
        self.actuators.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixed_slots() -> Vec<SlotConfig> {
        vec![
            SlotConfig::sensor(1, "turbidity", "Raw water turbidity", "NTU"),
            SlotConfig::sensor(2, "ph", "Contact tank pH", "pH"),
            SlotConfig::actuator(3, "pump", "Backwash pump"),
        ]
    }

    #[test]
    fn ordinals_follow_slot_order_per_kind() {
        let record = DeviceRecord::new(
            "rtu-1".to_string(),
            Ipv4Addr::new(10, 0, 0, 1),
            MacAddr::ZERO,
            1,
            1,
            mixed_slots(),
        );
        assert_eq!(record.sensor_ordinal(1), Some(0));
        assert_eq!(record.sensor_ordinal(2), Some(1));
        assert_eq!(record.sensor_ordinal(3), None);
        assert_eq!(record.actuator_ordinal(3), Some(0));
        assert_eq!(record.actuator_ordinal(1), None);
        assert_eq!(record.sensors.len(), 2);
        assert_eq!(record.actuators.len(), 1);
    }

    #[test]
    fn state_machine_edges() {
        use ArState::*;
        assert!(Offline.can_transition_to(Discovered));
        assert!(Discovered.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Parameterizing));
        assert!(Parameterizing.can_transition_to(Applying));
        assert!(Applying.can_transition_to(Running));
        assert!(Running.can_transition_to(Disconnect));
        assert!(Disconnect.can_transition_to(Offline));
        assert!(Error.can_transition_to(Offline));

        // no shortcuts, no backward movement
        assert!(!Running.can_transition_to(Connecting));
        assert!(!Offline.can_transition_to(Running));
        assert!(!Parameterizing.can_transition_to(Running));
        assert!(!Error.can_transition_to(Connecting));
    }

    #[test]
    fn fresh_sample_is_not_connected() {
        let sample = SensorSample::default();
        assert_eq!(sample.quality, Quality::NotConnected);
        let reading = SensorReading::from_sample(&sample, 5_000);
        assert_eq!(reading.quality, Quality::NotConnected);
    }
}
