//! Controller configuration

use serde::Serialize;

/// Controller configuration
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Network interface the controller binds for layer-2 traffic
    pub interface: String,

    /// Vendor ID written into Connect requests
    pub vendor_id: u16,

    /// Maximum number of devices the registry will hold
    pub capacity: usize,

    /// Sensor samples older than this are reported stale
    pub stale_threshold_ms: u64,

    /// Cyclic update interval (send-clock-factor x 31.25 us x reduction-ratio)
    pub cycle_time_us: u64,

    /// No input frame for this long tears the AR down
    pub watchdog_ms: u64,

    /// Total deadline for one connect attempt, strategies included
    pub connect_timeout_ms: u64,

    /// Per-RPC request timeout inside a connect attempt
    pub rpc_timeout_ms: u64,

    /// Back-off before a failed device is retried
    pub retry_backoff_ms: u64,

    /// Inter-frame delta beyond cycle time by this percentage counts as an overrun
    pub cycle_tolerance_pct: u32,

    /// DCP identify collection window
    pub discovery_timeout_ms: u64,

    /// Cadence of the sequence engine tick
    pub sequence_tick_ms: u64,

    /// Where the slot topology is persisted
    pub topology_path: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            vendor_id: 0x0493,
            capacity: 32,
            stale_threshold_ms: 5_000,
            cycle_time_us: 32_000, // 1 ms send clock x 32 reduction
            watchdog_ms: 3_000,
            connect_timeout_ms: 5_000,
            rpc_timeout_ms: 1_000,
            retry_backoff_ms: 2_000,
            cycle_tolerance_pct: 50,
            discovery_timeout_ms: 2_000,
            sequence_tick_ms: 100,
            topology_path: "topology.json".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(iface) = std::env::var("AQUACTL_INTERFACE") {
            config.interface = iface;
        }

        if let Ok(vendor) = std::env::var("AQUACTL_VENDOR_ID") {
            if let Ok(val) = parse_u16(&vendor) {
                config.vendor_id = val;
            }
        }

        if let Ok(capacity) = std::env::var("AQUACTL_CAPACITY") {
            if let Ok(val) = capacity.parse() {
                config.capacity = val;
            }
        }

        if let Ok(ms) = std::env::var("AQUACTL_STALE_THRESHOLD_MS") {
            if let Ok(val) = ms.parse() {
                config.stale_threshold_ms = val;
            }
        }

        if let Ok(us) = std::env::var("AQUACTL_CYCLE_TIME_US") {
            if let Ok(val) = us.parse() {
                config.cycle_time_us = val;
            }
        }

        if let Ok(ms) = std::env::var("AQUACTL_WATCHDOG_MS") {
            if let Ok(val) = ms.parse() {
                config.watchdog_ms = val;
            }
        }

        if let Ok(ms) = std::env::var("AQUACTL_CONNECT_TIMEOUT_MS") {
            if let Ok(val) = ms.parse() {
                config.connect_timeout_ms = val;
            }
        }

        if let Ok(ms) = std::env::var("AQUACTL_DISCOVERY_TIMEOUT_MS") {
            if let Ok(val) = ms.parse() {
                config.discovery_timeout_ms = val;
            }
        }

        if let Ok(path) = std::env::var("AQUACTL_TOPOLOGY_PATH") {
            config.topology_path = path;
        }

        config
    }
}

/// Accept both decimal and 0x-prefixed hex vendor ids
fn parse_u16(s: &str) -> Result<u16, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ControllerConfig::default();
        assert_eq!(config.vendor_id, 0x0493);
        assert_eq!(config.stale_threshold_ms, 5_000);
        assert_eq!(config.cycle_time_us, 32_000);
        assert_eq!(config.watchdog_ms, 3_000);
    }

    #[test]
    fn vendor_id_parses_hex_and_decimal() {
        assert_eq!(parse_u16("0x0493").unwrap(), 0x0493);
        assert_eq!(parse_u16("1171").unwrap(), 1171);
        assert!(parse_u16("bogus").is_err());
    }
}
