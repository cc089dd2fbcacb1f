//! Cyclic RT exchange engine
//!
//! One output ticker task per AR plus one shared receive pump for the
//! interface. Operator writes land in the output buffer between ticks
//! and are on the wire at the next tick; received input frames update
//! the IOCR buffer and are mirrored into the registry before the next
//! frame is taken off the socket.

use crate::connection::{Ar, ConnectionManager};
use crate::error::CoreError;
use crate::registry::Registry;
use crate::transport::L2Transport;
use crate::wire::rt::{
    build_rt_frame, parse_rt_frame, RtFrame, DATA_STATUS_GOOD, TRANSFER_STATUS_OK,
};
use crate::wire::MacAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Poll granularity of the blocking receive loop
const RECV_POLL_MS: u64 = 100;
/// Bounded hand-off between the pump and the dispatcher; the newest
/// frames win if the dispatcher ever falls behind
const FRAME_QUEUE_DEPTH: usize = 64;

#[derive(Clone)]
pub struct CyclicEngine {
    l2: Arc<dyn L2Transport>,
    manager: Arc<ConnectionManager>,
    registry: Arc<Registry>,
    cycle_tolerance_pct: u32,
    shutdown: watch::Receiver<bool>,
    /// Active discovery round, if any; the pump owns the socket, so
    /// DCP responses are handed over instead of read directly
    dcp_listener: Arc<std::sync::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl CyclicEngine {
    pub fn new(
        l2: Arc<dyn L2Transport>,
        manager: Arc<ConnectionManager>,
        registry: Arc<Registry>,
        cycle_tolerance_pct: u32,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            l2,
            manager,
            registry,
            cycle_tolerance_pct,
            shutdown,
            dcp_listener: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Route DCP frames to a discovery round for the duration of the
    /// returned receiver
    pub fn register_dcp_listener(&self) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.dcp_listener.lock().expect("dcp listener lock") = Some(tx);
        rx
    }

    pub fn clear_dcp_listener(&self) {
        *self.dcp_listener.lock().expect("dcp listener lock") = None;
    }

    /// Start the shared receive pump: a blocking socket loop feeding an
    /// async dispatcher that routes frames to their ARs and mirrors
    /// samples into the registry.
    pub fn spawn_receive_pump(&self) {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(FRAME_QUEUE_DEPTH);

        let l2 = Arc::clone(&self.l2);
        let mut shutdown = self.shutdown.clone();
        tokio::task::spawn_blocking(move || loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            match l2.recv_frame(Duration::from_millis(RECV_POLL_MS)) {
                Ok(Some(frame)) => {
                    // freshest-wins: drop the frame when the queue is full
                    if tx.try_send(frame).is_err() {
                        debug!("frame queue full, dropping input frame");
                    }
                }
                Ok(None) => {}
                Err(CoreError::Fatal(e)) => {
                    warn!("receive pump terminating: {e}");
                    break;
                }
                Err(e) => {
                    warn!("receive error: {e}");
                }
            }
        });

        let engine = self.clone();
        tokio::spawn(async move {
            let mut rx = rx;
            while let Some(frame) = rx.recv().await {
                engine.dispatch_input_frame(&frame).await;
            }
            info!("input dispatcher stopped");
        });
    }

    async fn dispatch_input_frame(&self, frame: &[u8]) {
        // acyclic frame IDs (DCP) belong to a discovery round
        if is_dcp_frame(frame) {
            let listener = self.dcp_listener.lock().expect("dcp listener lock");
            if let Some(tx) = listener.as_ref() {
                let _ = tx.send(frame.to_vec());
            }
            return;
        }
        let (_, rt) = match parse_rt_frame(frame) {
            Ok(parsed) => parsed,
            Err(_) => return, // not cyclic traffic
        };
        let Some(ar) = self.manager.ar_by_input_frame_id(rt.frame_id) else {
            return;
        };
        if let Err(e) = ar.accept_input_frame(&rt, self.cycle_tolerance_pct) {
            debug!("{}: dropped input frame: {e}", ar.station);
            return;
        }

        // mirror the fresh samples so registry readers observe them
        // before the next frame is processed
        for (ordinal, value, iops, quality) in ar.sensor_values() {
            let Some(slot) = ar.sensor_slot_number(ordinal) else {
                continue;
            };
            if let Err(e) = self
                .registry
                .update_sensor(&ar.station, slot, value, iops, quality)
                .await
            {
                debug!("{}: sensor mirror failed: {e}", ar.station);
                break;
            }
        }
    }

    /// Start the output ticker and watchdog for one AR. The task ends
    /// when the AR is torn down or replaced.
    pub fn spawn_ar_task(&self, ar: Arc<Ar>, device_mac: MacAddr) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_micros(ar.cycle_time_us));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let started_us = crate::clock::now_monotonic_us();
            let mut shutdown = engine.shutdown.clone();

            info!(
                "{}: cyclic exchange started, cycle {} us",
                ar.station, ar.cycle_time_us
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                // stop when this AR is no longer the live one
                match engine.manager.ar(&ar.station) {
                    Some(current) if Arc::ptr_eq(&current, &ar) => {}
                    _ => break,
                }

                let (payload, cycle_counter) = ar.next_output_payload();
                let frame = RtFrame {
                    frame_id: ar.output_frame_id,
                    payload,
                    cycle_counter,
                    data_status: DATA_STATUS_GOOD,
                    transfer_status: TRANSFER_STATUS_OK,
                };
                match build_rt_frame(device_mac, engine.l2.mac(), &frame) {
                    Ok(wire) => {
                        if let Err(e) = engine.l2.send_frame(&wire) {
                            warn!("{}: output frame send failed: {e}", ar.station);
                        }
                    }
                    Err(e) => warn!("{}: output frame build failed: {e}", ar.station),
                }

                // watchdog: no input frame for too long tears the AR down
                let silent_ms = ar.input_age_ms().unwrap_or_else(|| {
                    (crate::clock::now_monotonic_us().saturating_sub(started_us)) / 1000
                });
                if silent_ms > ar.watchdog_ms {
                    warn!(
                        "{}: frame timeout after {} ms without input",
                        ar.station, silent_ms
                    );
                    if let Err(e) = engine.manager.mark_disconnected(&ar.station).await {
                        warn!("{}: teardown failed: {e}", ar.station);
                    }
                    break;
                }
            }
            info!("{}: cyclic exchange stopped", ar.station);
        });
    }
}

/// Acyclic (DCP) frame IDs live in 0xFC00..=0xFEFF
fn is_dcp_frame(frame: &[u8]) -> bool {
    if frame.len() < 16 || frame[12] != 0x88 || frame[13] != 0x92 {
        return false;
    }
    let frame_id = u16::from_be_bytes([frame[14], frame[15]]);
    (0xFC00..=0xFEFF).contains(&frame_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::connect::{
        build_connect_response, build_control_response, build_write_response,
        parse_request_header,
    };
    use crate::connection::ConnectionConfig;
    use crate::registry::{ArState, RegistryConfig, RegistryEvent, SlotConfig};
    use crate::transport::{loopback_pair, LoopbackLink, ScriptedRpc};
    use crate::wire::rpc::OpNum;
    use crate::wire::{pack_sensor, ActuatorCommand, Iops, Quality};
    use std::net::Ipv4Addr;

    const CONTROLLER_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
    const DEVICE_MAC: MacAddr = MacAddr([0x28, 0x63, 0x36, 0x81, 0x4B, 0x64]);

    fn accepting_device() -> ScriptedRpc {
        ScriptedRpc::new(|request| {
            let (hdr, _) = parse_request_header(request).ok()?;
            let response = match OpNum::from_wire(hdr.opnum).ok()? {
                OpNum::Connect => {
                    build_connect_response(&hdr, hdr.object_uuid, 1, DEVICE_MAC).ok()?
                }
                OpNum::Write => build_write_response(&hdr, hdr.object_uuid).ok()?,
                OpNum::Control => build_control_response(&hdr, hdr.object_uuid, 1).ok()?,
                OpNum::Read => return None,
            };
            Some(response)
        })
    }

    struct Rig {
        engine: CyclicEngine,
        manager: Arc<ConnectionManager>,
        registry: Arc<Registry>,
        device_end: LoopbackLink,
        _shutdown_tx: watch::Sender<bool>,
    }

    async fn rig(watchdog_ms: u64) -> Rig {
        let (ctl, device_end) = loopback_pair(CONTROLLER_MAC, DEVICE_MAC);
        let registry = Registry::new(RegistryConfig::default());
        let mut slots = Vec::new();
        for i in 1..=8u16 {
            slots.push(SlotConfig::sensor(i, "level", &format!("Sensor {i}"), "m"));
        }
        for i in 9..=15u16 {
            slots.push(SlotConfig::actuator(i, "valve", &format!("Valve {i}")));
        }
        registry
            .add_device(
                "rtu-4b64",
                Ipv4Addr::new(192, 168, 6, 21),
                DEVICE_MAC,
                0x0493,
                1,
                slots,
            )
            .await
            .unwrap();

        let mut strategies = crate::connection::ConnectStrategy::default_list();
        // fast cycle for the tests
        for s in &mut strategies {
            s.timing.send_clock_factor = 32;
            s.timing.reduction_ratio = 1; // 1 ms
        }
        let manager = ConnectionManager::new(
            Arc::clone(&registry),
            Arc::new(accepting_device()),
            CONTROLLER_MAC,
            ConnectionConfig {
                watchdog_ms,
                strategies,
                ..Default::default()
            },
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = CyclicEngine::new(
            Arc::new(ctl),
            Arc::clone(&manager),
            Arc::clone(&registry),
            50,
            shutdown_rx,
        );
        Rig {
            engine,
            manager,
            registry,
            device_end,
            _shutdown_tx: shutdown_tx,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn operator_write_reaches_the_next_frame() {
        let rig = rig(10_000).await;
        let ar = rig.manager.connect("rtu-4b64").await.unwrap();
        rig.engine.spawn_ar_task(Arc::clone(&ar), DEVICE_MAC);

        // first frame goes out before the write
        let first = tokio::task::block_in_place(|| {
            rig.device_end.recv_frame(Duration::from_millis(500)).unwrap()
        })
        .expect("first output frame");
        let (_, rt) = parse_rt_frame(&first).unwrap();
        assert_eq!(rt.frame_id, 0xC003);
        // actuator ordinal 2, byte offset 4 * 2
        assert_eq!(&rt.payload[8..12], &[0, 0, 0, 0]);

        ar.set_slot_output(2, ActuatorCommand::On, 64).unwrap();

        // the command appears on the wire within a couple of ticks and
        // stays there (FIFO, no reordering)
        let mut seen = false;
        for _ in 0..500 {
            let frame = tokio::task::block_in_place(|| {
                rig.device_end.recv_frame(Duration::from_millis(500)).unwrap()
            })
            .expect("output frame");
            let (_, rt) = parse_rt_frame(&frame).unwrap();
            if rt.payload[8..12] == [1, 64, 0, 0] {
                seen = true;
                break;
            }
            assert_eq!(&rt.payload[8..12], &[0, 0, 0, 0]);
        }
        assert!(seen, "command never reached the wire");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn input_frames_are_mirrored_into_the_registry() {
        let rig = rig(10_000).await;
        let ar = rig.manager.connect("rtu-4b64").await.unwrap();
        rig.engine.spawn_receive_pump();

        let mut payload = Vec::new();
        payload.extend_from_slice(&pack_sensor(12.56, Quality::Good));
        payload.extend_from_slice(&[0u8; 35]);
        payload.extend_from_slice(&[0x80; 8]);
        let frame = build_rt_frame(
            CONTROLLER_MAC,
            DEVICE_MAC,
            &RtFrame {
                frame_id: ar.input_frame_id,
                payload,
                cycle_counter: 1,
                data_status: DATA_STATUS_GOOD,
                transfer_status: 0,
            },
        )
        .unwrap();
        rig.device_end.send_frame(&frame).unwrap();

        // wait for the dispatcher to mirror the sample
        let mut reading = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let r = rig.registry.get_sensor("rtu-4b64", 1).await.unwrap();
            if r.quality == Quality::Good {
                reading = Some(r);
                break;
            }
        }
        let reading = reading.expect("sample never reached the registry");
        assert!((reading.value - 12.56).abs() < 1e-5);
        assert_eq!(reading.iops, Iops::Good);
        assert!(!reading.stale);

        let (value, iops, quality) = ar.get_slot_input(0).unwrap();
        assert!((value - 12.56).abs() < 1e-5);
        assert_eq!(iops, Iops::Good);
        assert_eq!(quality, Quality::Good);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watchdog_tears_the_ar_down() {
        let rig = rig(100).await;
        let ar = rig.manager.connect("rtu-4b64").await.unwrap();
        let mut events = rig.registry.subscribe();
        rig.engine.spawn_ar_task(Arc::clone(&ar), DEVICE_MAC);

        // no input frames at all: the watchdog must fire
        let mut saw_disconnect = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
                Ok(Ok(RegistryEvent::DeviceStateChanged { old, new, .. })) => {
                    if old == ArState::Running && new == ArState::Disconnect {
                        saw_disconnect = true;
                        break;
                    }
                }
                Ok(Ok(_)) => {}
                _ => break,
            }
        }
        assert!(saw_disconnect, "watchdog never fired");
        assert!(rig.manager.ar("rtu-4b64").is_none());

        let device = rig.registry.get_device("rtu-4b64").await.unwrap();
        assert_eq!(device.ar_state, ArState::Offline);
    }
}
