//! RTU registry / process image
//!
//! The single source of truth for discovered devices, their slot
//! layouts, latest samples and AR states. Producers are the discovery,
//! connection and cyclic engines; consumers are the HMI, historian,
//! alarm engine and the sequence engine. All reads return by-value
//! snapshots; events fire after the lock is released.

pub mod device;
pub mod events;
pub mod topology;

pub use device::{
    ActuatorState, ArState, DeviceSnapshot, SensorReading, SensorSample, SlotConfig, SlotKind,
};
pub use events::{AlarmBound, RegistryEvent};

use crate::clock::{now_monotonic_ms, now_monotonic_us};
use crate::error::{CoreError, CoreResult};
use crate::wire::{ActuatorOutput, Iops, MacAddr, Quality};
use device::{parallel_vectors, DeviceRecord};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

const MAX_EVENT_SUBSCRIBERS: usize = 256;

/// Station names are DNS labels
static STATION_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").unwrap());

pub const MAX_STATION_NAME_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of devices
    pub capacity: usize,
    /// Samples older than this read as stale
    pub stale_threshold_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            stale_threshold_ms: 5_000,
        }
    }
}

/// Thread-safe device registry. One exclusive lock covers all
/// mutations; every accessor copies out under the lock and emits its
/// events afterwards.
pub struct Registry {
    inner: RwLock<Vec<DeviceRecord>>,
    event_tx: broadcast::Sender<RegistryEvent>,
    config: RegistryConfig,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(MAX_EVENT_SUBSCRIBERS);
        Arc::new(Self {
            inner: RwLock::new(Vec::new()),
            event_tx,
            config,
        })
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    pub fn stale_threshold_ms(&self) -> u64 {
        self.config.stale_threshold_ms
    }

    fn emit(&self, events: Vec<RegistryEvent>) {
        for event in events {
            // send fails only when nobody subscribes, which is fine
            let _ = self.event_tx.send(event);
        }
    }

    /// Add a device. Fails with `AlreadyExists` on a duplicate station
    /// and `Full` at capacity.
    pub async fn add_device(
        &self,
        station: &str,
        ip: Ipv4Addr,
        mac: MacAddr,
        vendor_id: u16,
        device_id: u16,
        slots: Vec<SlotConfig>,
    ) -> CoreResult<DeviceSnapshot> {
        validate_station_name(station)?;

        let (snapshot, event) = {
            let mut devices = self.inner.write().await;
            if devices.iter().any(|d| d.station == station) {
                return Err(CoreError::AlreadyExists(station.to_string()));
            }
            if devices.len() >= self.config.capacity {
                return Err(CoreError::Full(self.config.capacity));
            }
            let record = DeviceRecord::new(
                station.to_string(),
                ip,
                mac,
                vendor_id,
                device_id,
                slots,
            );
            let snapshot = record.snapshot(self.config.stale_threshold_ms);
            devices.push(record);
            let event = RegistryEvent::DeviceAdded {
                device: snapshot.clone(),
                timestamp: chrono::Utc::now(),
            };
            (snapshot, event)
        };

        info!("device added: {} at {}", station, ip);
        self.emit(vec![event]);
        Ok(snapshot)
    }

    /// Remove a device and release everything it owned. Remaining
    /// records keep contiguous indices.
    pub async fn remove_device(&self, station: &str) -> CoreResult<()> {
        let event = {
            let mut devices = self.inner.write().await;
            let idx = devices
                .iter()
                .position(|d| d.station == station)
                .ok_or_else(|| CoreError::NotFound(station.to_string()))?;
            devices.remove(idx);
            RegistryEvent::DeviceRemoved {
                station: station.to_string(),
                timestamp: chrono::Utc::now(),
            }
        };

        info!("device removed: {}", station);
        self.emit(vec![event]);
        Ok(())
    }

    /// Consistent snapshot of one device
    pub async fn get_device(&self, station: &str) -> CoreResult<DeviceSnapshot> {
        let devices = self.inner.read().await;
        devices
            .iter()
            .find(|d| d.station == station)
            .map(|d| d.snapshot(self.config.stale_threshold_ms))
            .ok_or_else(|| CoreError::NotFound(station.to_string()))
    }

    /// Bounded snapshot of all devices
    pub async fn list_devices(&self, max: usize) -> Vec<DeviceSnapshot> {
        let devices = self.inner.read().await;
        devices
            .iter()
            .take(max)
            .map(|d| d.snapshot(self.config.stale_threshold_ms))
            .collect()
    }

    pub async fn device_count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Move a device through the AR state machine. Emits
    /// `DeviceStateChanged` if and only if the state actually changes.
    pub async fn set_device_state(&self, station: &str, new: ArState) -> CoreResult<()> {
        let event = {
            let mut devices = self.inner.write().await;
            let record = devices
                .iter_mut()
                .find(|d| d.station == station)
                .ok_or_else(|| CoreError::NotFound(station.to_string()))?;
            let old = record.ar_state;
            if old == new {
                return Ok(());
            }
            if !old.can_transition_to(new) {
                return Err(CoreError::InvalidParam(format!(
                    "illegal AR transition {old} -> {new} for {station}"
                )));
            }
            record.ar_state = new;
            RegistryEvent::DeviceStateChanged {
                station: station.to_string(),
                old,
                new,
                timestamp: chrono::Utc::now(),
            }
        };

        debug!("{}: ar state -> {}", station, new);
        self.emit(vec![event]);
        Ok(())
    }

    /// Replace the slot vector. Sample vectors are reallocated to
    /// match; existing live samples do not survive a re-configuration.
    pub async fn set_device_config(
        &self,
        station: &str,
        slots: Vec<SlotConfig>,
    ) -> CoreResult<()> {
        let mut devices = self.inner.write().await;
        let record = devices
            .iter_mut()
            .find(|d| d.station == station)
            .ok_or_else(|| CoreError::NotFound(station.to_string()))?;
        let (sensors, actuators) = parallel_vectors(&slots);
        record.slots = slots;
        record.sensors = sensors;
        record.actuators = actuators;
        record.config_dirty = true;
        debug!(
            "{}: slot config replaced ({} sensors, {} actuators)",
            station,
            record.sensors.len(),
            record.actuators.len()
        );
        Ok(())
    }

    /// Refresh discovery liveness without touching the AR state
    pub async fn touch_seen(&self, station: &str, ip: Ipv4Addr, mac: MacAddr) -> CoreResult<()> {
        let mut devices = self.inner.write().await;
        let record = devices
            .iter_mut()
            .find(|d| d.station == station)
            .ok_or_else(|| CoreError::NotFound(station.to_string()))?;
        record.ip = ip;
        record.mac = mac;
        record.last_seen_us = now_monotonic_us();
        Ok(())
    }

    /// Store a sensor sample for a slot number. Unknown stations are an
    /// error; an out-of-range slot is a silent no-op so a device that
    /// shrank its layout mid-flight cannot wedge the input path.
    pub async fn update_sensor(
        &self,
        station: &str,
        slot: u16,
        value: f32,
        iops: Iops,
        quality: Quality,
    ) -> CoreResult<()> {
        let events = {
            let mut devices = self.inner.write().await;
            let record = devices
                .iter_mut()
                .find(|d| d.station == station)
                .ok_or_else(|| CoreError::NotFound(station.to_string()))?;
            let Some(ordinal) = record.sensor_ordinal(slot) else {
                return Ok(());
            };

            // a slot whose provider reports BAD is never stored GOOD
            let quality = if iops == Iops::Bad && quality == Quality::Good {
                Quality::Bad
            } else {
                quality
            };
            let sample = SensorSample {
                value,
                quality,
                iops,
                timestamp_us: now_monotonic_us(),
            };
            record.sensors[ordinal] = sample;

            let mut events = vec![RegistryEvent::SensorUpdated {
                station: station.to_string(),
                slot,
                reading: SensorReading::from_sample(&sample, self.config.stale_threshold_ms),
                timestamp: chrono::Utc::now(),
            }];
            let slot_cfg = record
                .slots
                .iter()
                .find(|s| s.slot_number == slot && s.kind == SlotKind::Sensor)
                .expect("ordinal implies the slot exists");
            if slot_cfg.enabled && quality.usable_for_control() {
                if let Some((bound, limit)) = crossed_alarm_bound(slot_cfg, value) {
                    events.push(RegistryEvent::AlarmRaised {
                        station: station.to_string(),
                        slot,
                        bound,
                        value,
                        limit,
                        timestamp: chrono::Utc::now(),
                    });
                }
            }
            events
        };

        self.emit(events);
        Ok(())
    }

    /// Record the last commanded actuator output
    pub async fn update_actuator(
        &self,
        station: &str,
        slot: u16,
        output: ActuatorOutput,
    ) -> CoreResult<()> {
        let event = {
            let mut devices = self.inner.write().await;
            let record = devices
                .iter_mut()
                .find(|d| d.station == station)
                .ok_or_else(|| CoreError::NotFound(station.to_string()))?;
            let Some(ordinal) = record.actuator_ordinal(slot) else {
                return Ok(());
            };
            let state = ActuatorState {
                output,
                last_change_ms: now_monotonic_ms(),
            };
            record.actuators[ordinal] = state;
            RegistryEvent::ActuatorUpdated {
                station: station.to_string(),
                slot,
                state,
                timestamp: chrono::Utc::now(),
            }
        };

        self.emit(vec![event]);
        Ok(())
    }

    /// Latest sample for a sensor slot, staleness computed on read
    pub async fn get_sensor(&self, station: &str, slot: u16) -> CoreResult<SensorReading> {
        let devices = self.inner.read().await;
        let record = devices
            .iter()
            .find(|d| d.station == station)
            .ok_or_else(|| CoreError::NotFound(station.to_string()))?;
        let ordinal = record.sensor_ordinal(slot).ok_or_else(|| {
            CoreError::InvalidParam(format!("{station} has no sensor slot {slot}"))
        })?;
        Ok(SensorReading::from_sample(
            &record.sensors[ordinal],
            self.config.stale_threshold_ms,
        ))
    }

    /// Last commanded state of an actuator slot
    pub async fn get_actuator(&self, station: &str, slot: u16) -> CoreResult<ActuatorState> {
        let devices = self.inner.read().await;
        let record = devices
            .iter()
            .find(|d| d.station == station)
            .ok_or_else(|| CoreError::NotFound(station.to_string()))?;
        let ordinal = record.actuator_ordinal(slot).ok_or_else(|| {
            CoreError::InvalidParam(format!("{station} has no actuator slot {slot}"))
        })?;
        Ok(record.actuators[ordinal])
    }
}

fn validate_station_name(name: &str) -> CoreResult<()> {
    if name.is_empty() || name.len() > MAX_STATION_NAME_LEN {
        return Err(CoreError::InvalidParam(format!(
            "station name length {} out of range",
            name.len()
        )));
    }
    if !STATION_NAME_PATTERN.is_match(name) {
        return Err(CoreError::InvalidParam(format!(
            "station name {name:?} is not a DNS label"
        )));
    }
    Ok(())
}

/// Most severe alarm bound the value sits beyond, if any
fn crossed_alarm_bound(slot: &SlotConfig, value: f32) -> Option<(AlarmBound, f32)> {
    if let Some(limit) = slot.alarm_hihi {
        if value >= limit {
            return Some((AlarmBound::HiHi, limit));
        }
    }
    if let Some(limit) = slot.alarm_lolo {
        if value <= limit {
            return Some((AlarmBound::LoLo, limit));
        }
    }
    if let Some(limit) = slot.alarm_high {
        if value >= limit {
            return Some((AlarmBound::High, limit));
        }
    }
    if let Some(limit) = slot.alarm_low {
        if value <= limit {
            return Some((AlarmBound::Low, limit));
        }
    }
    None
}
