//! End-to-end scenarios over loopback transports
//!
//! A scripted RTU plays the device side of DCP, the Connect exchange
//! and the cyclic wire while the controller runs its real stack.

use aquactl::connection::connect::{
    build_connect_response, build_control_response, build_write_response, parse_request_header,
};
use aquactl::registry::{ArState, RegistryEvent, SlotConfig};
use aquactl::sequence::{Sequence, SequenceEvent, SequenceState, Step};
use aquactl::transport::{loopback_pair, L2Transport, LoopbackLink, ScriptedRpc};
use aquactl::wire::rpc::OpNum;
use aquactl::wire::rt::{build_rt_frame, parse_rt_frame, RtFrame, DATA_STATUS_GOOD};
use aquactl::wire::{ActuatorCommand, DcpIdentifyRequest, DcpIdentifyResponse, Iops, MacAddr, Quality};
use aquactl::{Controller, ControllerConfig, CoreError};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

const CONTROLLER_MAC: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
const DEVICE_MAC: MacAddr = MacAddr([0x28, 0x63, 0x36, 0x81, 0x4B, 0x64]);

fn slots_8_7() -> Vec<SlotConfig> {
    let mut slots = Vec::new();
    for i in 1..=8u16 {
        slots.push(SlotConfig::sensor(i, "level", &format!("Sensor {i}"), "m"));
    }
    for i in 9..=15u16 {
        slots.push(SlotConfig::actuator(i, "valve", &format!("Valve {i}")));
    }
    slots
}

/// RTU that accepts every acyclic exchange
fn accepting_rpc() -> ScriptedRpc {
    ScriptedRpc::new(|request| {
        let (hdr, _) = parse_request_header(request).ok()?;
        let response = match OpNum::from_wire(hdr.opnum).ok()? {
            OpNum::Connect => build_connect_response(&hdr, hdr.object_uuid, 1, DEVICE_MAC).ok()?,
            OpNum::Write => build_write_response(&hdr, hdr.object_uuid).ok()?,
            OpNum::Control => build_control_response(&hdr, hdr.object_uuid, 1).ok()?,
            OpNum::Read => return None,
        };
        Some(response)
    })
}

fn test_config() -> ControllerConfig {
    ControllerConfig {
        watchdog_ms: 400,
        retry_backoff_ms: 60_000, // keep the reconnector out of the way
        discovery_timeout_ms: 300,
        sequence_tick_ms: 20,
        ..ControllerConfig::default()
    }
}

struct Rig {
    controller: Arc<Controller>,
    device_end: LoopbackLink,
}

async fn rig_with_device() -> Rig {
    let (ctl, device_end) = loopback_pair(CONTROLLER_MAC, DEVICE_MAC);
    let controller = Controller::new(test_config(), Arc::new(ctl), Arc::new(accepting_rpc()));
    controller
        .registry()
        .add_device(
            "rtu-4b64",
            Ipv4Addr::new(192, 168, 6, 21),
            DEVICE_MAC,
            0x0493,
            0x0001,
            slots_8_7(),
        )
        .await
        .unwrap();
    Rig {
        controller,
        device_end,
    }
}

#[tokio::test]
async fn discovery_populates_an_empty_registry() {
    let (ctl, device_end) = loopback_pair(CONTROLLER_MAC, DEVICE_MAC);
    let controller = Controller::new(test_config(), Arc::new(ctl), Arc::new(accepting_rpc()));
    let mut events = controller.subscribe();

    let sim = std::thread::spawn(move || {
        let frame = device_end
            .recv_frame(Duration::from_millis(500))
            .unwrap()
            .expect("identify request");
        let request = DcpIdentifyRequest::parse(&frame).unwrap();
        let response = DcpIdentifyResponse {
            xid: request.xid,
            mac: DEVICE_MAC,
            station_name: "rtu-4b64".to_string(),
            ip: Ipv4Addr::new(192, 168, 6, 21),
            vendor_id: 0x0493,
            device_id: 0x0001,
        };
        device_end
            .send_frame(&response.encode(CONTROLLER_MAC).unwrap())
            .unwrap();
    });

    let found = controller.discover().await.unwrap();
    sim.join().unwrap();

    assert_eq!(found.len(), 1);
    assert_eq!(controller.registry().list_devices(16).await.len(), 1);

    // exactly one DeviceAdded with the reported identity
    let mut added = 0;
    while let Ok(event) = events.try_recv() {
        if let RegistryEvent::DeviceAdded { device, .. } = event {
            assert_eq!(device.station, "rtu-4b64");
            assert_eq!(device.ip, Ipv4Addr::new(192, 168, 6, 21));
            assert_eq!(device.vendor_id, 0x0493);
            assert_eq!(device.device_id, 0x0001);
            added += 1;
        }
    }
    assert_eq!(added, 1);

    let device = controller.registry().get_device("rtu-4b64").await.unwrap();
    assert_eq!(device.ar_state, ArState::Discovered);
}

#[tokio::test]
async fn connect_happy_path_reaches_running_with_spec_iocrs() {
    let rig = rig_with_device().await;
    let mut events = rig.controller.subscribe();

    let ar = rig.controller.connect("rtu-4b64").await.unwrap();
    assert_eq!(ar.session_key, 1);
    assert_eq!(ar.input_frame_id, 0xC000 + 2);
    assert_eq!(ar.input_data_length(), 40);
    assert_eq!(ar.output_data_length(), 28);

    let device = rig.controller.registry().get_device("rtu-4b64").await.unwrap();
    assert_eq!(device.ar_state, ArState::Running);

    // every emitted transition is an edge of the AR state machine
    let mut path = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RegistryEvent::DeviceStateChanged { old, new, .. } = event {
            assert!(old.can_transition_to(new), "illegal edge {old} -> {new}");
            path.push(new);
        }
    }
    assert_eq!(
        path,
        vec![
            ArState::Connecting,
            ArState::Parameterizing,
            ArState::Applying,
            ArState::Running,
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sensor_sample_flows_from_wire_to_registry() {
    let rig = rig_with_device().await;
    rig.controller.start();
    let ar = rig.controller.connect("rtu-4b64").await.unwrap();

    // slot 1 carries 12.56 with GOOD quality: 41 48 F5 C3 03
    let mut payload = vec![0x41, 0x48, 0xF5, 0xC3, 0x03];
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

    let mut reading = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let r = rig
            .controller
            .registry()
            .get_sensor("rtu-4b64", 1)
            .await
            .unwrap();
        if r.quality == Quality::Good {
            reading = Some(r);
            break;
        }
    }
    let reading = reading.expect("sample never surfaced");
    assert!((reading.value - 12.56).abs() < 1e-5);
    assert_eq!(reading.iops, Iops::Good);
    assert!(!reading.stale);

    let (value, iops, quality) = ar.get_slot_input(0).unwrap();
    assert!((value - 12.56).abs() < 1e-5);
    assert_eq!(iops, Iops::Good);
    assert_eq!(quality, Quality::Good);

    rig.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn operator_command_reaches_the_next_output_frame() {
    let rig = rig_with_device().await;
    rig.controller.connect("rtu-4b64").await.unwrap();

    // drain the first frame, then command valve 9 (actuator ordinal 0)
    let first = rig
        .device_end
        .recv_frame(Duration::from_millis(2_000))
        .unwrap()
        .expect("first output frame");
    let (_, rt) = parse_rt_frame(&first).unwrap();
    assert_eq!(rt.frame_id, 0xC003);
    assert_eq!(&rt.payload[0..4], &[0, 0, 0, 0]);

    rig.controller
        .submit_command("rtu-4b64", 9, ActuatorCommand::On, 0)
        .await
        .unwrap();

    let mut seen = false;
    for _ in 0..500 {
        let frame = rig
            .device_end
            .recv_frame(Duration::from_millis(2_000))
            .unwrap()
            .expect("output frame");
        let (_, rt) = parse_rt_frame(&frame).unwrap();
        if rt.payload[0..4] == [1, 0, 0, 0] {
            seen = true;
            break;
        }
        assert_eq!(&rt.payload[0..4], &[0, 0, 0, 0]);
    }
    assert!(seen, "command never appeared on the wire");

    // the registry mirrors the arbitrated command
    let actuator = rig
        .controller
        .registry()
        .get_actuator("rtu-4b64", 9)
        .await
        .unwrap();
    assert_eq!(actuator.output.command, ActuatorCommand::On);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_rtu_trips_the_watchdog() {
    let rig = rig_with_device().await;
    let mut events = rig.controller.subscribe();
    rig.controller.connect("rtu-4b64").await.unwrap();

    // never send an input frame; the AR must tear down
    let mut saw_disconnect = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Ok(RegistryEvent::DeviceStateChanged { old, new, .. })) => {
                if old == ArState::Running && new == ArState::Disconnect {
                    saw_disconnect = true;
                    break;
                }
            }
            Ok(Ok(_)) => {}
            _ => {}
        }
    }
    assert!(saw_disconnect, "watchdog never fired");
    assert!(rig.controller.manager().ar("rtu-4b64").is_none());
}

#[tokio::test]
async fn command_while_offline_is_rejected_cleanly() {
    let rig = rig_with_device().await;

    let err = rig
        .controller
        .submit_command("rtu-4b64", 9, ActuatorCommand::On, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotRunning(_)));

    // nothing was written anywhere
    let actuator = rig
        .controller
        .registry()
        .get_actuator("rtu-4b64", 9)
        .await
        .unwrap();
    assert_eq!(actuator.last_change_ms, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequence_deadline_faults_with_a_single_completion() {
    let rig = rig_with_device().await;
    rig.controller.start();
    let mut events = rig.controller.subscribe_sequences();

    let mut seq = Sequence::new(1, "stalls", vec![Step::WaitTime { duration_ms: 2_000 }]).unwrap();
    seq.sequence_timeout_ms = 1_000;
    rig.controller.sequences().add(seq).await.unwrap();
    rig.controller.sequences().start(1).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1_400)).await;

    let state = rig.controller.sequences().get(1).await.unwrap().state;
    assert_eq!(state, SequenceState::Faulted);

    let mut completions = 0;
    while let Ok(event) = events.try_recv() {
        if let SequenceEvent::Completed { id: 1, success } = event {
            assert!(!success);
            completions += 1;
        }
    }
    assert_eq!(completions, 1);

    rig.controller.shutdown().await;
}
