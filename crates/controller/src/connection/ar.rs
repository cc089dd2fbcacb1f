//! Application relationship record and IOCR buffers
//!
//! The AR owns the two cyclic data buffers. The cyclic engine is the
//! only writer of the input buffer and the only reader of the output
//! buffer; operator commands reach the output buffer through the O(1)
//! accessor. The per-AR mutex is never held across an await point.
//! Lock order where both are needed: registry first, then AR.

use crate::clock::now_monotonic_us;
use crate::error::{CoreError, CoreResult};
use crate::wire::rt::RtFrame;
use crate::wire::{
    pack_actuator, unpack_sensor, ActuatorCommand, ActuatorOutput, Iops, Quality,
    ACTUATOR_SLOT_SIZE, SENSOR_SLOT_SIZE,
};
use serde::Serialize;
use std::sync::Mutex;
use uuid::Uuid;

/// Cyclic exchange counters for one AR
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CyclicStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub overruns: u64,
    pub parse_errors: u64,
    /// Delta between the two most recent input frames
    pub last_cycle_us: u64,
}

#[derive(Debug)]
struct ArIo {
    /// Sensor data, `n_sensors * 5` bytes
    input: Vec<u8>,
    /// Provider status per sensor slot, captured from input frames
    input_status: Vec<Iops>,
    /// Actuator data, `n_actuators * 4` bytes
    output: Vec<u8>,
    output_cycle: u16,
    input_cycle: u16,
    last_data_status: u8,
    last_input_us: Option<u64>,
}

/// One application relationship. Shared between the connection manager
/// and the cyclic engine behind `Arc`.
#[derive(Debug)]
pub struct Ar {
    pub station: String,
    pub session_key: u16,
    pub ar_uuid: Uuid,
    pub input_frame_id: u16,
    pub output_frame_id: u16,
    pub cycle_time_us: u64,
    pub watchdog_ms: u64,
    /// Slot numbers backing each sensor ordinal, for registry mirroring
    sensor_slot_numbers: Vec<u16>,
    /// Disabled actuator slots report IOPS BAD on the wire
    actuator_enabled: Vec<bool>,
    io: Mutex<ArIo>,
    stats: Mutex<CyclicStats>,
}

impl Ar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        station: String,
        session_key: u16,
        ar_uuid: Uuid,
        sensor_slot_numbers: Vec<u16>,
        actuator_enabled: Vec<bool>,
        cycle_time_us: u64,
        watchdog_ms: u64,
    ) -> Self {
        let n_sensors = sensor_slot_numbers.len();
        let n_actuators = actuator_enabled.len();
        Self {
            station,
            session_key,
            ar_uuid,
            input_frame_id: RtFrame::frame_id_input(session_key),
            output_frame_id: RtFrame::frame_id_output(session_key),
            cycle_time_us,
            watchdog_ms,
            sensor_slot_numbers,
            actuator_enabled,
            io: Mutex::new(ArIo {
                input: vec![0; n_sensors * SENSOR_SLOT_SIZE],
                input_status: vec![Iops::Bad; n_sensors],
                output: vec![0; n_actuators * ACTUATOR_SLOT_SIZE],
                output_cycle: 0,
                input_cycle: 0,
                last_data_status: 0,
                last_input_us: None,
            }),
            stats: Mutex::new(CyclicStats::default()),
        }
    }

    pub fn input_data_length(&self) -> usize {
        self.io.lock().expect("ar io lock").input.len()
    }

    pub fn output_data_length(&self) -> usize {
        self.io.lock().expect("ar io lock").output.len()
    }

    pub fn n_sensor_slots(&self) -> usize {
        self.sensor_slot_numbers.len()
    }

    /// Slot number behind a sensor ordinal
    pub fn sensor_slot_number(&self, ordinal: usize) -> Option<u16> {
        self.sensor_slot_numbers.get(ordinal).copied()
    }

    pub fn n_actuator_slots(&self) -> usize {
        self.actuator_enabled.len()
    }

    /// Read one sensor slot from the input buffer. O(1).
    pub fn get_slot_input(&self, ordinal: usize) -> CoreResult<(f32, Iops, Quality)> {
        let io = self.io.lock().expect("ar io lock");
        let offset = ordinal * SENSOR_SLOT_SIZE;
        if offset + SENSOR_SLOT_SIZE > io.input.len() {
            return Err(CoreError::InvalidParam(format!(
                "sensor ordinal {ordinal} out of range"
            )));
        }
        let iops = io.input_status[ordinal];
        match unpack_sensor(&io.input[offset..offset + SENSOR_SLOT_SIZE]) {
            Ok((value, quality)) => Ok((value, iops, quality)),
            // a garbled quality byte reads as not connected
            Err(_) => Ok((0.0, iops, Quality::NotConnected)),
        }
    }

    /// Write one actuator slot into the output buffer. O(1); picked up
    /// by the next cyclic tick.
    pub fn set_slot_output(
        &self,
        ordinal: usize,
        command: ActuatorCommand,
        pwm_duty: u8,
    ) -> CoreResult<()> {
        let mut io = self.io.lock().expect("ar io lock");
        let offset = ordinal * ACTUATOR_SLOT_SIZE;
        if offset + ACTUATOR_SLOT_SIZE > io.output.len() {
            return Err(CoreError::InvalidParam(format!(
                "actuator ordinal {ordinal} out of range"
            )));
        }
        let wire = pack_actuator(&ActuatorOutput { command, pwm_duty });
        io.output[offset..offset + ACTUATOR_SLOT_SIZE].copy_from_slice(&wire);
        Ok(())
    }

    /// Copy of the output data plus per-slot IOPS, and the cycle
    /// counter for the frame about to go out.
    pub(crate) fn next_output_payload(&self) -> (Vec<u8>, u16) {
        let mut io = self.io.lock().expect("ar io lock");
        let mut payload = Vec::with_capacity(io.output.len() + self.actuator_enabled.len());
        payload.extend_from_slice(&io.output);
        for &enabled in &self.actuator_enabled {
            payload.push(if enabled {
                Iops::Good.to_wire()
            } else {
                Iops::Bad.to_wire()
            });
        }
        let cycle = io.output_cycle;
        io.output_cycle = io.output_cycle.wrapping_add(1);
        let mut stats = self.stats.lock().expect("ar stats lock");
        stats.frames_sent += 1;
        (payload, cycle)
    }

    /// Consume one received input frame: length check, buffer copy,
    /// provider status capture, trailer bookkeeping, overrun check.
    pub(crate) fn accept_input_frame(
        &self,
        rt: &RtFrame,
        tolerance_pct: u32,
    ) -> CoreResult<()> {
        let mut io = self.io.lock().expect("ar io lock");
        let data_len = io.input.len();
        let n_sensors = io.input_status.len();
        if rt.payload.len() < data_len + n_sensors {
            let mut stats = self.stats.lock().expect("ar stats lock");
            stats.parse_errors += 1;
            return Err(CoreError::InvalidField {
                field: "rt_payload",
                reason: format!(
                    "{} bytes, expected at least {}",
                    rt.payload.len(),
                    data_len + n_sensors
                ),
            });
        }

        let dst = &mut io.input[..];
        dst.copy_from_slice(&rt.payload[..data_len]);
        for i in 0..n_sensors {
            io.input_status[i] = Iops::from_wire(rt.payload[data_len + i]);
        }
        io.input_cycle = rt.cycle_counter;
        io.last_data_status = rt.data_status;

        let now = now_monotonic_us();
        let previous = io.last_input_us.replace(now);
        drop(io);

        let mut stats = self.stats.lock().expect("ar stats lock");
        stats.frames_received += 1;
        if let Some(previous) = previous {
            let delta = now.saturating_sub(previous);
            stats.last_cycle_us = delta;
            let limit = self.cycle_time_us * (100 + tolerance_pct as u64) / 100;
            if delta > limit {
                stats.overruns += 1;
            }
        }
        Ok(())
    }

    /// All sensor slots decoded from the input buffer, by ordinal
    pub fn sensor_values(&self) -> Vec<(usize, f32, Iops, Quality)> {
        let io = self.io.lock().expect("ar io lock");
        let n = io.input_status.len();
        let mut out = Vec::with_capacity(n);
        for ordinal in 0..n {
            let offset = ordinal * SENSOR_SLOT_SIZE;
            let iops = io.input_status[ordinal];
            match unpack_sensor(&io.input[offset..offset + SENSOR_SLOT_SIZE]) {
                Ok((value, quality)) => out.push((ordinal, value, iops, quality)),
                Err(_) => out.push((ordinal, 0.0, iops, Quality::NotConnected)),
            }
        }
        out
    }

    pub fn last_input_us(&self) -> Option<u64> {
        self.io.lock().expect("ar io lock").last_input_us
    }

    /// Milliseconds since the last accepted input frame, if any
    pub fn input_age_ms(&self) -> Option<u64> {
        self.last_input_us()
            .map(|t| now_monotonic_us().saturating_sub(t) / 1000)
    }

    pub fn input_cycle_counter(&self) -> u16 {
        self.io.lock().expect("ar io lock").input_cycle
    }

    pub fn last_data_status(&self) -> u8 {
        self.io.lock().expect("ar io lock").last_data_status
    }

    pub fn stats(&self) -> CyclicStats {
        *self.stats.lock().expect("ar stats lock")
    }
}
