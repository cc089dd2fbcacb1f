//! Topology persistence
//!
//! Only the slot maps and device identities are persisted; live
//! samples belong to the historian. The file is plain JSON so field
//! crews can inspect and hand-edit it.

use crate::error::{CoreError, CoreResult};
use crate::registry::device::SlotConfig;
use crate::registry::Registry;
use crate::wire::MacAddr;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedDevice {
    pub station: String,
    pub ip: Ipv4Addr,
    #[serde(default = "zero_mac")]
    pub mac: MacAddr,
    pub vendor_id: u16,
    pub device_id: u16,
    pub slots: Vec<SlotConfig>,
}

fn zero_mac() -> MacAddr {
    MacAddr::ZERO
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedTopology {
    pub devices: Vec<SavedDevice>,
}

impl Registry {
    /// Write the current slot topology to `path`
    pub async fn save_topology(&self, path: impl AsRef<Path>) -> CoreResult<usize> {
        let devices = self.list_devices(usize::MAX).await;
        let saved = SavedTopology {
            devices: devices
                .iter()
                .map(|d| SavedDevice {
                    station: d.station.clone(),
                    ip: d.ip,
                    mac: d.mac,
                    vendor_id: d.vendor_id,
                    device_id: d.device_id,
                    slots: d.slots.clone(),
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&saved)
            .map_err(|e| CoreError::Protocol(format!("topology encode: {e}")))?;
        tokio::fs::write(path.as_ref(), json)
            .await
            .map_err(|e| CoreError::Protocol(format!("topology write: {e}")))?;
        info!(
            "saved topology: {} device(s) to {}",
            saved.devices.len(),
            path.as_ref().display()
        );
        Ok(saved.devices.len())
    }

    /// Restore devices from a saved topology. Stations already present
    /// get their slot config replaced; new stations are added offline.
    pub async fn load_topology(&self, path: impl AsRef<Path>) -> CoreResult<usize> {
        let json = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| CoreError::NotFound(format!("{}: {e}", path.as_ref().display())))?;
        let saved: SavedTopology = serde_json::from_str(&json)
            .map_err(|e| CoreError::InvalidField {
                field: "topology",
                reason: e.to_string(),
            })?;

        let count = saved.devices.len();
        for device in saved.devices {
            if self.get_device(&device.station).await.is_ok() {
                self.set_device_config(&device.station, device.slots).await?;
            } else {
                self.add_device(
                    &device.station,
                    device.ip,
                    device.mac,
                    device.vendor_id,
                    device.device_id,
                    device.slots,
                )
                .await?;
            }
        }
        info!(
            "loaded topology: {} device(s) from {}",
            count,
            path.as_ref().display()
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryConfig, SlotConfig};

    #[tokio::test]
    async fn topology_round_trip_preserves_slot_maps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.json");

        let registry = Registry::new(RegistryConfig::default());
        let mut turbidity = SlotConfig::sensor(3, "turbidity", "Filter outlet turbidity", "NTU");
        turbidity.alarm_high = Some(10.0);
        registry
            .add_device(
                "rtu-4b64",
                Ipv4Addr::new(192, 168, 6, 21),
                MacAddr([0x28, 0x63, 0x36, 0x81, 0x4B, 0x64]),
                0x0493,
                0x0001,
                vec![
                    turbidity.clone(),
                    SlotConfig::actuator(9, "valve", "Backwash inlet valve"),
                ],
            )
            .await
            .unwrap();
        registry.save_topology(&path).await.unwrap();

        let restored = Registry::new(RegistryConfig::default());
        let count = restored.load_topology(&path).await.unwrap();
        assert_eq!(count, 1);

        let device = restored.get_device("rtu-4b64").await.unwrap();
        assert_eq!(device.ip, Ipv4Addr::new(192, 168, 6, 21));
        assert_eq!(device.vendor_id, 0x0493);
        assert_eq!(device.slots.len(), 2);
        assert_eq!(device.slots[0], turbidity);
        assert_eq!(device.ar_state, crate::registry::ArState::Offline);
        // live samples are not persisted
        assert_eq!(
            device.sensors[0].quality,
            crate::wire::Quality::NotConnected
        );
    }

    #[tokio::test]
    async fn loading_over_existing_station_replaces_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.json");

        let registry = Registry::new(RegistryConfig::default());
        registry
            .add_device(
                "rtu-1",
                Ipv4Addr::LOCALHOST,
                MacAddr::ZERO,
                1,
                1,
                vec![SlotConfig::sensor(1, "ph", "pH", "pH")],
            )
            .await
            .unwrap();
        registry.save_topology(&path).await.unwrap();

        registry
            .set_device_config("rtu-1", vec![])
            .await
            .unwrap();
        registry.load_topology(&path).await.unwrap();

        let device = registry.get_device("rtu-1").await.unwrap();
        assert_eq!(device.slots.len(), 1);
        assert_eq!(device.slots[0].signal, "ph");
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let registry = Registry::new(RegistryConfig::default());
        let result = registry.load_topology("/nonexistent/topology.json").await;
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }
}
