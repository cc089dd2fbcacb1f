//! Ethernet II framing

use crate::error::{CoreError, CoreResult};
use crate::wire::buffer::{FrameBuilder, FrameParser};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// EtherType for all PROFINET traffic (DCP and cyclic RT)
pub const ETHERTYPE_PROFINET: u16 = 0x8892;

/// Minimum on-wire Ethernet frame length without FCS; shorter frames
/// are zero-padded before transmission
pub const ETH_MIN_FRAME_LEN: usize = 60;

/// Ethernet II header length: two MACs plus the EtherType
pub const ETH_HEADER_LEN: usize = 14;

/// Upper bound used to size frame builders
pub const MAX_FRAME_LEN: usize = 1518;

/// DCP identify multicast address all IO devices listen on
pub const DCP_IDENTIFY_MULTICAST: MacAddr = MacAddr([0x01, 0x0E, 0xCF, 0x00, 0x00, 0x00]);

/// A 48-bit MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(CoreError::InvalidParam(format!("bad MAC address: {s}")));
        }
        for (i, part) in parts.iter().enumerate() {
            octets[i] = u8::from_str_radix(part, 16)
                .map_err(|_| CoreError::InvalidParam(format!("bad MAC address: {s}")))?;
        }
        Ok(MacAddr(octets))
    }
}

/// Ethernet II header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

impl EthHeader {
    pub fn profinet(dst: MacAddr, src: MacAddr) -> Self {
        Self {
            dst,
            src,
            ethertype: ETHERTYPE_PROFINET,
        }
    }

    pub fn encode(&self, b: &mut FrameBuilder) -> CoreResult<()> {
        b.put_bytes(&self.dst.0)?;
        b.put_bytes(&self.src.0)?;
        b.put_u16_be(self.ethertype)
    }

    pub fn parse(p: &mut FrameParser<'_>) -> CoreResult<Self> {
        let dst = p.take_bytes(6)?;
        let src = p.take_bytes(6)?;
        let ethertype = p.take_u16_be()?;
        Ok(Self {
            dst: MacAddr(dst.try_into().expect("6-byte slice")),
            src: MacAddr(src.try_into().expect("6-byte slice")),
            ethertype,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_display_and_parse() {
        let mac: MacAddr = "01:0E:CF:00:00:00".parse().unwrap();
        assert_eq!(mac, DCP_IDENTIFY_MULTICAST);
        assert!(mac.is_multicast());
        assert_eq!(mac.to_string(), "01:0E:CF:00:00:00");
        assert!("01:0E:CF".parse::<MacAddr>().is_err());
        assert!("zz:0E:CF:00:00:00".parse::<MacAddr>().is_err());
    }

    #[test]
    fn header_round_trip() {
        let hdr = EthHeader::profinet(
            DCP_IDENTIFY_MULTICAST,
            MacAddr([0x02, 0x00, 0x00, 0xAB, 0xCD, 0xEF]),
        );
        let mut b = FrameBuilder::new(ETH_HEADER_LEN);
        hdr.encode(&mut b).unwrap();
        let frame = b.into_vec();
        assert_eq!(frame.len(), ETH_HEADER_LEN);
        assert_eq!(&frame[12..14], &[0x88, 0x92]);

        let mut p = FrameParser::new(&frame);
        assert_eq!(EthHeader::parse(&mut p).unwrap(), hdr);
    }
}
