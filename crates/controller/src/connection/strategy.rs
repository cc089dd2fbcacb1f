//! Connect wire-format strategies
//!
//! Real IO-device stacks disagree on edge cases of the Connect
//! exchange. Rather than hard-coding one peer's quirks, each attempt
//! is described by five discrete knobs and the manager walks a
//! bounded, configurable list until one variant is accepted.

use serde::{Deserialize, Serialize};

/// How the RPC header UUID fields are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UuidEncoding {
    /// Follow the declared DREP (little-endian time fields)
    Drep,
    /// Big-endian UUIDs despite a little-endian DREP
    ForcedBigEndian,
}

/// Breadth of the expected-submodule block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotScope {
    /// Only the slots learned from discovery or topology
    ExpectedOnly,
    /// Also announce the device access point at slot 0
    WithDap,
}

/// Cycle timing advertised in the IOCR blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingTuple {
    /// Units of 31.25 us
    pub send_clock_factor: u16,
    pub reduction_ratio: u16,
    pub watchdog_factor: u16,
}

impl TimingTuple {
    pub const STANDARD: TimingTuple = TimingTuple {
        send_clock_factor: 32, // 1 ms
        reduction_ratio: 32,   // 32 ms effective update
        watchdog_factor: 3,
    };

    pub const RELAXED: TimingTuple = TimingTuple {
        send_clock_factor: 32,
        reduction_ratio: 128,
        watchdog_factor: 6,
    };

    pub fn cycle_time_us(&self) -> u64 {
        // 31.25 us granularity
        (self.send_clock_factor as u64 * 125 / 4) * self.reduction_ratio as u64
    }
}

/// One connect attempt variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectStrategy {
    pub name: String,
    pub uuid_encoding: UuidEncoding,
    pub ndr_header: bool,
    pub slot_scope: SlotScope,
    pub timing: TimingTuple,
    pub opnum: u16,
}

impl ConnectStrategy {
    /// Default attempt order: the conformant encoding first, then the
    /// quirk tolerances observed in the field. Deployments reorder or
    /// trim this through configuration.
    pub fn default_list() -> Vec<ConnectStrategy> {
        vec![
            ConnectStrategy {
                name: "standard".to_string(),
                uuid_encoding: UuidEncoding::Drep,
                ndr_header: true,
                slot_scope: SlotScope::ExpectedOnly,
                timing: TimingTuple::STANDARD,
                opnum: 0,
            },
            ConnectStrategy {
                name: "no-ndr".to_string(),
                uuid_encoding: UuidEncoding::Drep,
                ndr_header: false,
                slot_scope: SlotScope::ExpectedOnly,
                timing: TimingTuple::STANDARD,
                opnum: 0,
            },
            ConnectStrategy {
                name: "be-uuid".to_string(),
                uuid_encoding: UuidEncoding::ForcedBigEndian,
                ndr_header: true,
                slot_scope: SlotScope::ExpectedOnly,
                timing: TimingTuple::STANDARD,
                opnum: 0,
            },
            ConnectStrategy {
                name: "with-dap".to_string(),
                uuid_encoding: UuidEncoding::Drep,
                ndr_header: true,
                slot_scope: SlotScope::WithDap,
                timing: TimingTuple::STANDARD,
                opnum: 0,
            },
            ConnectStrategy {
                name: "relaxed-timing".to_string(),
                uuid_encoding: UuidEncoding::Drep,
                ndr_header: true,
                slot_scope: SlotScope::ExpectedOnly,
                timing: TimingTuple::RELAXED,
                opnum: 0,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_timing_is_32ms() {
        assert_eq!(TimingTuple::STANDARD.cycle_time_us(), 32_000);
        assert_eq!(TimingTuple::RELAXED.cycle_time_us(), 128_000);
    }

    #[test]
    fn default_list_is_bounded_and_starts_conformant() {
        let list = ConnectStrategy::default_list();
        assert!(list.len() <= 8);
        assert_eq!(list[0].name, "standard");
        assert_eq!(list[0].uuid_encoding, UuidEncoding::Drep);
        assert!(list[0].ndr_header);
    }
}
