//! Per-device AR connection management
//!
//! One state machine per RTU. Connect walks the configured strategy
//! list under a total deadline with a fresh AR UUID and a monotone
//! session key per attempt; at most one connect runs per device at a
//! time. All state transitions go through the registry so subscribers
//! see them in order.

use crate::connection::ar::Ar;
use crate::connection::connect::{
    build_connect_request, build_control_request, build_read_inventory_request,
    build_write_request, parse_connect_response, parse_control_response,
    parse_read_inventory_response, parse_write_response, ConnectParams,
    CONTROL_APPLICATION_READY,
};
use crate::connection::strategy::ConnectStrategy;
use crate::error::{CoreError, CoreResult};
use crate::registry::{ArState, DeviceSnapshot, Registry, SlotConfig, SlotKind};
use crate::transport::{RpcTransport, PNIO_RPC_PORT};
use crate::wire::MacAddr;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    pub watchdog_ms: u64,
    pub retry_backoff_ms: u64,
    /// CMInitiatorStationName sent in every Connect
    pub initiator_station: String,
    pub strategies: Vec<ConnectStrategy>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            rpc_timeout_ms: 1_000,
            watchdog_ms: 3_000,
            retry_backoff_ms: 2_000,
            initiator_station: "aquactl".to_string(),
            strategies: ConnectStrategy::default_list(),
        }
    }
}

/// Connection manager for all devices on the segment
pub struct ConnectionManager {
    registry: Arc<Registry>,
    rpc: Arc<dyn RpcTransport>,
    local_mac: MacAddr,
    config: ConnectionConfig,
    /// Live ARs by station. Plain RwLock so the blocking receive pump
    /// can resolve frame IDs without entering the async runtime.
    ars: RwLock<HashMap<String, Arc<Ar>>>,
    /// Next session key per station, monotone across reconnects
    session_keys: Mutex<HashMap<String, u16>>,
    /// Stations with a connect in flight
    connecting: Mutex<HashSet<String>>,
    sequence: AtomicU32,
}

impl ConnectionManager {
    pub fn new(
        registry: Arc<Registry>,
        rpc: Arc<dyn RpcTransport>,
        local_mac: MacAddr,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            rpc,
            local_mac,
            config,
            ars: RwLock::new(HashMap::new()),
            session_keys: Mutex::new(HashMap::new()),
            connecting: Mutex::new(HashSet::new()),
            sequence: AtomicU32::new(1),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The live AR for a station, if connected
    pub fn ar(&self, station: &str) -> Option<Arc<Ar>> {
        self.ars.read().expect("ars lock").get(station).cloned()
    }

    /// Resolve a received RT frame to its AR
    pub fn ar_by_input_frame_id(&self, frame_id: u16) -> Option<Arc<Ar>> {
        self.ars
            .read()
            .expect("ars lock")
            .values()
            .find(|ar| ar.input_frame_id == frame_id)
            .cloned()
    }

    pub fn active_ars(&self) -> Vec<Arc<Ar>> {
        self.ars.read().expect("ars lock").values().cloned().collect()
    }

    fn next_session_key(&self, station: &str) -> u16 {
        let mut keys = self.session_keys.lock().expect("session key lock");
        let key = keys.entry(station.to_string()).or_insert(0);
        *key = key.wrapping_add(1).max(1);
        *key
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Establish an AR with a device. Walks the strategy list under the
    /// configured total deadline; on failure the device lands in ERROR
    /// and is retriable after a back-off.
    #[tracing::instrument(skip(self), fields(station = %station))]
    pub async fn connect(&self, station: &str) -> CoreResult<Arc<Ar>> {
        let device = self.registry.get_device(station).await?;
        match device.ar_state {
            ArState::Offline | ArState::Discovered => {}
            ArState::Running => {
                return Err(CoreError::Busy(format!("{station} is already connected")));
            }
            other => {
                return Err(CoreError::Busy(format!(
                    "{station} is {other}; reset it before connecting"
                )));
            }
        }

        {
            let mut connecting = self.connecting.lock().expect("connecting lock");
            if !connecting.insert(station.to_string()) {
                return Err(CoreError::Busy(format!(
                    "connect already in progress for {station}"
                )));
            }
        }

        let result = self.connect_guarded(station, &device).await;

        self.connecting
            .lock()
            .expect("connecting lock")
            .remove(station);

        if result.is_err() {
            // best effort; the device may have been removed meanwhile
            let _ = self.registry.set_device_state(station, ArState::Error).await;
        }
        result
    }

    async fn connect_guarded(
        &self,
        station: &str,
        device: &DeviceSnapshot,
    ) -> CoreResult<Arc<Ar>> {
        self.registry
            .set_device_state(station, ArState::Connecting)
            .await?;

        let deadline = Duration::from_millis(self.config.connect_timeout_ms);
        match tokio::time::timeout(deadline, self.try_strategies(station, device)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("{}: connect deadline of {:?} expired", station, deadline);
                Err(CoreError::ConnectTimeout(self.config.connect_timeout_ms))
            }
        }
    }

    async fn try_strategies(
        &self,
        station: &str,
        device: &DeviceSnapshot,
    ) -> CoreResult<Arc<Ar>> {
        let peer = SocketAddrV4::new(device.ip, PNIO_RPC_PORT);
        let rpc_timeout = Duration::from_millis(self.config.rpc_timeout_ms);
        let mut last_err = CoreError::ConnectRejected("no strategies configured".to_string());

        for strategy in &self.config.strategies {
            let session_key = self.next_session_key(station);
            let ar_uuid = Uuid::new_v4();
            let activity_uuid = Uuid::new_v4();
            debug!(
                "{}: connect attempt '{}', session key {}",
                station, strategy.name, session_key
            );

            let request = build_connect_request(&ConnectParams {
                strategy,
                ar_uuid,
                activity_uuid,
                session_key,
                sequence: self.next_sequence(),
                initiator_station: &self.config.initiator_station,
                local_mac: self.local_mac,
                slots: &device.slots,
            })?;

            let response = self.rpc.call(peer, request, rpc_timeout).await?;
            let Some(response) = response else {
                debug!("{}: strategy '{}' timed out", station, strategy.name);
                last_err = CoreError::ConnectTimeout(self.config.rpc_timeout_ms);
                continue;
            };
            match parse_connect_response(&response) {
                Ok(ack) => {
                    debug!(
                        "{}: device accepted strategy '{}' (ar {})",
                        station, strategy.name, ack.ar_uuid
                    );
                    return self
                        .parameterize(station, device, strategy, session_key, ar_uuid, activity_uuid, peer)
                        .await;
                }
                Err(e) => {
                    debug!("{}: strategy '{}' rejected: {}", station, strategy.name, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    #[allow(clippy::too_many_arguments)]
    async fn parameterize(
        &self,
        station: &str,
        device: &DeviceSnapshot,
        strategy: &ConnectStrategy,
        session_key: u16,
        ar_uuid: Uuid,
        activity_uuid: Uuid,
        peer: SocketAddrV4,
    ) -> CoreResult<Arc<Ar>> {
        let rpc_timeout = Duration::from_millis(self.config.rpc_timeout_ms);

        self.registry
            .set_device_state(station, ArState::Parameterizing)
            .await?;
        let request = build_write_request(ar_uuid, activity_uuid, self.next_sequence())?;
        let response = self
            .rpc
            .call(peer, request, rpc_timeout)
            .await?
            .ok_or_else(|| {
                CoreError::ParameterizationFailed("write record timed out".to_string())
            })?;
        parse_write_response(&response)?;

        self.registry
            .set_device_state(station, ArState::Applying)
            .await?;
        let request = build_control_request(
            ar_uuid,
            activity_uuid,
            self.next_sequence(),
            session_key,
            CONTROL_APPLICATION_READY,
        )?;
        let response = self
            .rpc
            .call(peer, request, rpc_timeout)
            .await?
            .ok_or_else(|| {
                CoreError::ParameterizationFailed("application ready timed out".to_string())
            })?;
        parse_control_response(&response)?;

        let sensor_slot_numbers: Vec<u16> = device
            .slots
            .iter()
            .filter(|s| s.kind == SlotKind::Sensor)
            .map(|s| s.slot_number)
            .collect();
        let actuator_enabled: Vec<bool> = device
            .slots
            .iter()
            .filter(|s| s.kind == SlotKind::Actuator)
            .map(|s| s.enabled)
            .collect();
        let ar = Arc::new(Ar::new(
            station.to_string(),
            session_key,
            ar_uuid,
            sensor_slot_numbers,
            actuator_enabled,
            strategy.timing.cycle_time_us(),
            self.config.watchdog_ms,
        ));
        self.ars
            .write()
            .expect("ars lock")
            .insert(station.to_string(), Arc::clone(&ar));

        self.registry
            .set_device_state(station, ArState::Running)
            .await?;
        info!(
            "{}: AR established, session key {}, cycle {} us, frames {:#06X}/{:#06X}",
            station, session_key, ar.cycle_time_us, ar.input_frame_id, ar.output_frame_id
        );
        Ok(ar)
    }

    /// Tear an AR down after a frame timeout or an operator release.
    /// Idempotent: a second watchdog firing on the same AR is a no-op.
    pub async fn mark_disconnected(&self, station: &str) -> CoreResult<()> {
        let removed = self
            .ars
            .write()
            .expect("ars lock")
            .remove(station)
            .is_some();
        if !removed {
            return Ok(());
        }
        warn!("{}: AR torn down", station);
        self.registry
            .set_device_state(station, ArState::Disconnect)
            .await?;
        self.registry
            .set_device_state(station, ArState::Offline)
            .await
    }

    /// Operator acknowledgement of an ERROR state
    pub async fn reset_error(&self, station: &str) -> CoreResult<()> {
        self.registry
            .set_device_state(station, ArState::Offline)
            .await
    }

    /// Re-read the expected submodule configuration and replace the
    /// registry's slot plan. Richer per-slot config (names, units,
    /// alarm bounds) survives for slots that still exist.
    pub async fn read_inventory(&self, station: &str) -> CoreResult<Vec<SlotConfig>> {
        let device = self.registry.get_device(station).await?;
        let peer = SocketAddrV4::new(device.ip, PNIO_RPC_PORT);
        let rpc_timeout = Duration::from_millis(self.config.rpc_timeout_ms);

        let ar_uuid = self
            .ar(station)
            .map(|ar| ar.ar_uuid)
            .unwrap_or_else(Uuid::new_v4);
        let request = build_read_inventory_request(ar_uuid, Uuid::new_v4(), self.next_sequence())?;
        let response = self
            .rpc
            .call(peer, request, rpc_timeout)
            .await?
            .ok_or_else(|| CoreError::ConnectTimeout(self.config.rpc_timeout_ms))?;
        let fresh = parse_read_inventory_response(&response)?;

        let merged: Vec<SlotConfig> = fresh
            .into_iter()
            .map(|slot| {
                device
                    .slots
                    .iter()
                    .find(|old| old.slot_number == slot.slot_number && old.kind == slot.kind)
                    .cloned()
                    .unwrap_or(slot)
            })
            .collect();
        self.registry
            .set_device_config(station, merged.clone())
            .await?;
        info!("{}: inventory refreshed, {} slot(s)", station, merged.len());
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::connect::{
        build_connect_response, build_control_response, build_empty_response,
        build_write_response, parse_request_header,
    };
    use crate::registry::{RegistryConfig, RegistryEvent};
    use crate::transport::ScriptedRpc;
    use crate::wire::rpc::OpNum;
    use std::net::Ipv4Addr;

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

    /// A well-behaved device: accepts connect, write and control
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

    async fn manager_with_device(rpc: ScriptedRpc) -> (Arc<ConnectionManager>, Arc<Registry>) {
        let registry = Registry::new(RegistryConfig::default());
        registry
            .add_device(
                "rtu-4b64",
                Ipv4Addr::new(192, 168, 6, 21),
                DEVICE_MAC,
                0x0493,
                1,
                slots_8_7(),
            )
            .await
            .unwrap();
        let manager = ConnectionManager::new(
            Arc::clone(&registry),
            Arc::new(rpc),
            MacAddr([0x02, 0, 0, 0, 0, 1]),
            ConnectionConfig::default(),
        );
        (manager, registry)
    }

    #[tokio::test]
    async fn happy_path_walks_the_state_machine() {
        let (manager, registry) = manager_with_device(accepting_device()).await;
        let mut events = registry.subscribe();

        let ar = manager.connect("rtu-4b64").await.unwrap();
        assert_eq!(ar.session_key, 1);
        assert_eq!(ar.input_frame_id, 0xC002);
        assert_eq!(ar.output_frame_id, 0xC003);
        assert_eq!(ar.input_data_length(), 40);
        assert_eq!(ar.output_data_length(), 28);

        let mut transitions = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RegistryEvent::DeviceStateChanged { old, new, .. } = event {
                transitions.push((old, new));
            }
        }
        assert_eq!(
            transitions,
            vec![
                (ArState::Offline, ArState::Connecting),
                (ArState::Connecting, ArState::Parameterizing),
                (ArState::Parameterizing, ArState::Applying),
                (ArState::Applying, ArState::Running),
            ]
        );

        assert!(manager.ar("rtu-4b64").is_some());
        assert!(manager.ar_by_input_frame_id(0xC002).is_some());
    }

    #[tokio::test]
    async fn empty_responses_exhaust_strategies_and_error() {
        let rpc = ScriptedRpc::new(|request| {
            let (hdr, _) = parse_request_header(request).ok()?;
            build_empty_response(&hdr).ok()
        });
        let (manager, registry) = manager_with_device(rpc).await;

        let err = manager.connect("rtu-4b64").await.unwrap_err();
        assert!(matches!(err, CoreError::ConnectRejected(_)));

        let device = registry.get_device("rtu-4b64").await.unwrap();
        assert_eq!(device.ar_state, ArState::Error);
        assert!(manager.ar("rtu-4b64").is_none());
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let rpc = ScriptedRpc::new(|_| None);
        let registry = Registry::new(RegistryConfig::default());
        registry
            .add_device(
                "rtu-4b64",
                Ipv4Addr::new(192, 168, 6, 21),
                DEVICE_MAC,
                0x0493,
                1,
                slots_8_7(),
            )
            .await
            .unwrap();
        let manager = ConnectionManager::new(
            Arc::clone(&registry),
            Arc::new(rpc),
            MacAddr([0x02, 0, 0, 0, 0, 1]),
            ConnectionConfig {
                connect_timeout_ms: 200,
                rpc_timeout_ms: 20,
                ..Default::default()
            },
        );

        let err = manager.connect("rtu-4b64").await.unwrap_err();
        assert!(matches!(err, CoreError::ConnectTimeout(_)));
        let device = registry.get_device("rtu-4b64").await.unwrap();
        assert_eq!(device.ar_state, ArState::Error);
    }

    #[tokio::test]
    async fn session_keys_are_monotone_across_reconnects() {
        let (manager, _registry) = manager_with_device(accepting_device()).await;

        let ar = manager.connect("rtu-4b64").await.unwrap();
        assert_eq!(ar.session_key, 1);

        manager.mark_disconnected("rtu-4b64").await.unwrap();
        // second watchdog fire on the same AR is a no-op
        manager.mark_disconnected("rtu-4b64").await.unwrap();

        let ar = manager.connect("rtu-4b64").await.unwrap();
        assert_eq!(ar.session_key, 2);
    }

    #[tokio::test]
    async fn connect_while_running_is_busy() {
        let (manager, _registry) = manager_with_device(accepting_device()).await;
        manager.connect("rtu-4b64").await.unwrap();
        let err = manager.connect("rtu-4b64").await.unwrap_err();
        assert!(matches!(err, CoreError::Busy(_)));
    }

    #[tokio::test]
    async fn error_state_requires_reset_before_reconnect() {
        let rpc = ScriptedRpc::new(|request| {
            let (hdr, _) = parse_request_header(request).ok()?;
            build_empty_response(&hdr).ok()
        });
        let (manager, registry) = manager_with_device(rpc).await;

        manager.connect("rtu-4b64").await.unwrap_err();
        let err = manager.connect("rtu-4b64").await.unwrap_err();
        assert!(matches!(err, CoreError::Busy(_)));

        manager.reset_error("rtu-4b64").await.unwrap();
        let device = registry.get_device("rtu-4b64").await.unwrap();
        assert_eq!(device.ar_state, ArState::Offline);
    }

    #[tokio::test]
    async fn unknown_station_is_not_found() {
        let (manager, _registry) = manager_with_device(accepting_device()).await;
        assert!(matches!(
            manager.connect("rtu-ghost").await,
            Err(CoreError::NotFound(_))
        ));
    }
}
