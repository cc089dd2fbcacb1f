//! Controller facade
//!
//! Owns the registry, connection manager, cyclic engine and sequence
//! engine, and runs the background tasks. Everything is explicitly
//! constructed and handed out as handles; there are no process-wide
//! globals.

use crate::config::ControllerConfig;
use crate::connection::{Ar, ConnectionConfig, ConnectionManager};
use crate::cyclic::CyclicEngine;
use crate::discovery;
use crate::error::{CoreError, CoreResult};
use crate::registry::{
    ArState, DeviceSnapshot, Registry, RegistryConfig, RegistryEvent, SlotConfig, SlotKind,
};
use crate::sequence::{CommandSink, SequenceEngine, SequenceEvent};
use crate::transport::{L2Transport, RpcTransport};
use crate::wire::{ActuatorCommand, ActuatorOutput};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Routes SET_OUTPUT commands into the AR output buffer and mirrors
/// them into the registry. Shared by operators and the sequence
/// engine.
pub struct CommandRouter {
    registry: Arc<Registry>,
    manager: Arc<ConnectionManager>,
}

impl CommandRouter {
    /// Arbitrate one actuator command. Rejected with `NotRunning`
    /// unless the device AR is exchanging cyclic data; nothing is
    /// written on rejection.
    pub async fn submit(
        &self,
        station: &str,
        slot: u16,
        command: ActuatorCommand,
        pwm: u8,
    ) -> CoreResult<()> {
        let device = self.registry.get_device(station).await?;
        if device.ar_state != ArState::Running {
            return Err(CoreError::NotRunning(station.to_string()));
        }
        let ordinal = device
            .slots
            .iter()
            .filter(|s| s.kind == SlotKind::Actuator)
            .position(|s| s.slot_number == slot)
            .ok_or_else(|| {
                CoreError::InvalidParam(format!("{station} has no actuator slot {slot}"))
            })?;
        let ar = self
            .manager
            .ar(station)
            .ok_or_else(|| CoreError::NotRunning(station.to_string()))?;
        ar.set_slot_output(ordinal, command, pwm)?;
        self.registry
            .update_actuator(
                station,
                slot,
                ActuatorOutput {
                    command,
                    pwm_duty: pwm,
                },
            )
            .await
    }
}

#[async_trait]
impl CommandSink for CommandRouter {
    async fn submit(
        &self,
        station: &str,
        slot: u16,
        command: ActuatorCommand,
        pwm: u8,
    ) -> CoreResult<()> {
        CommandRouter::submit(self, station, slot, command, pwm).await
    }
}

/// The assembled controller core
pub struct Controller {
    config: ControllerConfig,
    l2: Arc<dyn L2Transport>,
    registry: Arc<Registry>,
    manager: Arc<ConnectionManager>,
    router: Arc<CommandRouter>,
    sequences: Arc<SequenceEngine>,
    cyclic: CyclicEngine,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        l2: Arc<dyn L2Transport>,
        rpc: Arc<dyn RpcTransport>,
    ) -> Arc<Self> {
        let registry = Registry::new(RegistryConfig {
            capacity: config.capacity,
            stale_threshold_ms: config.stale_threshold_ms,
        });
        let manager = ConnectionManager::new(
            Arc::clone(&registry),
            rpc,
            l2.mac(),
            ConnectionConfig {
                connect_timeout_ms: config.connect_timeout_ms,
                rpc_timeout_ms: config.rpc_timeout_ms,
                watchdog_ms: config.watchdog_ms,
                retry_backoff_ms: config.retry_backoff_ms,
                ..Default::default()
            },
        );
        let router = Arc::new(CommandRouter {
            registry: Arc::clone(&registry),
            manager: Arc::clone(&manager),
        });
        let sequences = SequenceEngine::new(
            Arc::clone(&registry),
            Arc::clone(&router) as Arc<dyn CommandSink>,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cyclic = CyclicEngine::new(
            Arc::clone(&l2),
            Arc::clone(&manager),
            Arc::clone(&registry),
            config.cycle_tolerance_pct,
            shutdown_rx,
        );
        Arc::new(Self {
            config,
            l2,
            registry,
            manager,
            router,
            sequences,
            cyclic,
            shutdown_tx,
            started: AtomicBool::new(false),
        })
    }

    /// Start the background workers: receive pump, sequence tick and
    /// the reconnect-after-backoff watcher.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cyclic.spawn_receive_pump();
        self.spawn_sequence_ticker();
        self.spawn_reconnector();
        info!("controller core started on {}", self.config.interface);
    }

    fn spawn_sequence_ticker(self: &Arc<Self>) {
        let sequences = Arc::clone(&self.sequences);
        let mut shutdown = self.shutdown_tx.subscribe();
        let tick = Duration::from_millis(self.config.sequence_tick_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                sequences.process().await;
            }
        });
    }

    /// Devices torn down by the watchdog come back automatically after
    /// the back-off; devices in ERROR wait for an operator reset.
    fn spawn_reconnector(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        let mut events = self.registry.subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        let backoff = Duration::from_millis(self.config.retry_backoff_ms);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = shutdown.changed() => break,
                };
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(_) => continue, // lagged; missed transitions are fine
                };
                let RegistryEvent::DeviceStateChanged {
                    station,
                    old: ArState::Disconnect,
                    new: ArState::Offline,
                    ..
                } = event
                else {
                    continue;
                };
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let still_offline = matches!(
                        controller.registry.get_device(&station).await,
                        Ok(d) if d.ar_state == ArState::Offline
                    );
                    if !still_offline {
                        return;
                    }
                    info!("{}: reconnecting after back-off", station);
                    if let Err(e) = controller.connect(&station).await {
                        warn!("{}: reconnect failed: {e}", station);
                    }
                });
            }
        });
    }

    /// One DCP discovery round. New stations are added to the
    /// registry; known ones are refreshed. While the receive pump is
    /// running it owns the socket, so responses arrive through it.
    pub async fn discover(&self) -> CoreResult<Vec<DeviceSnapshot>> {
        let timeout = Duration::from_millis(self.config.discovery_timeout_ms);
        let reports = if self.started.load(Ordering::Acquire) {
            let mut frames = self.cyclic.register_dcp_listener();
            let xid = discovery::send_identify(self.l2.as_ref())?;
            let reports = discovery::collect_from_channel(&mut frames, xid, timeout).await;
            self.cyclic.clear_dcp_listener();
            reports
        } else {
            discovery::discover(Arc::clone(&self.l2), timeout).await?
        };

        let mut snapshots = Vec::with_capacity(reports.len());
        for report in reports {
            match self.registry.get_device(&report.station_name).await {
                Ok(_) => {
                    self.registry
                        .touch_seen(&report.station_name, report.ip, report.mac)
                        .await?;
                }
                Err(CoreError::NotFound(_)) => {
                    self.registry
                        .add_device(
                            &report.station_name,
                            report.ip,
                            report.mac,
                            report.vendor_id,
                            report.device_id,
                            Vec::new(),
                        )
                        .await?;
                }
                Err(e) => return Err(e),
            }
            // freshly added and idle devices become DISCOVERED; a
            // device mid-connection keeps its state
            let device = self.registry.get_device(&report.station_name).await?;
            if device.ar_state == ArState::Offline {
                self.registry
                    .set_device_state(&report.station_name, ArState::Discovered)
                    .await?;
            }
            snapshots.push(self.registry.get_device(&report.station_name).await?);
        }
        Ok(snapshots)
    }

    /// Connect a device and start its cyclic exchange
    pub async fn connect(&self, station: &str) -> CoreResult<Arc<Ar>> {
        let ar = self.manager.connect(station).await?;
        let device = self.registry.get_device(station).await?;
        self.cyclic.spawn_ar_task(Arc::clone(&ar), device.mac);
        Ok(ar)
    }

    pub async fn disconnect(&self, station: &str) -> CoreResult<()> {
        self.manager.mark_disconnected(station).await
    }

    /// Operator/API command submission
    pub async fn submit_command(
        &self,
        station: &str,
        slot: u16,
        command: ActuatorCommand,
        pwm: u8,
    ) -> CoreResult<()> {
        self.router.submit(station, slot, command, pwm).await
    }

    /// Re-read the device's expected submodules and replace its slot
    /// configuration
    pub async fn refresh_inventory(&self, station: &str) -> CoreResult<Vec<SlotConfig>> {
        self.manager.read_inventory(station).await
    }

    pub async fn save_topology(&self) -> CoreResult<usize> {
        self.registry.save_topology(&self.config.topology_path).await
    }

    pub async fn load_topology(&self) -> CoreResult<usize> {
        self.registry.load_topology(&self.config.topology_path).await
    }

    /// Cyclic exchange counters for a connected device
    pub fn cyclic_stats(&self, station: &str) -> Option<crate::connection::CyclicStats> {
        self.manager.ar(station).map(|ar| ar.stats())
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn sequences(&self) -> &Arc<SequenceEngine> {
        &self.sequences
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    pub fn subscribe_sequences(&self) -> tokio::sync::broadcast::Receiver<SequenceEvent> {
        self.sequences.subscribe()
    }

    /// Cooperative shutdown: stop the workers and release every AR
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for ar in self.manager.active_ars() {
            if let Err(e) = self.manager.mark_disconnected(&ar.station).await {
                warn!("{}: shutdown teardown failed: {e}", ar.station);
            }
        }
        info!("controller core stopped");
    }
}
