//! Cyclic real-time frames (EtherType 0x8892)
//!
//! Wire layout after the Ethernet header: FrameID (u16 BE), IO payload,
//! then a 4-byte trailer (cycle counter u16 BE, data status, transfer
//! status). Short frames are zero-padded in front of the trailer so the
//! trailer stays at the very end of the minimum-length frame.

use crate::error::{CoreError, CoreResult};
use crate::wire::buffer::{FrameBuilder, FrameParser};
use crate::wire::eth::{
    EthHeader, MacAddr, ETHERTYPE_PROFINET, ETH_HEADER_LEN, ETH_MIN_FRAME_LEN, MAX_FRAME_LEN,
};

/// Base of the RT class 1 frame-ID range. Per-AR frame IDs are
/// `RTC1_BASE + 2 * session_key` (input) and `+ 1` more (output).
pub const RTC1_BASE: u16 = 0xC000;

pub const RT_TRAILER_LEN: usize = 4;

/// Data-status bits carried in the trailer
pub const DATA_STATUS_STATE: u8 = 0x01;
pub const DATA_STATUS_VALID: u8 = 0x04;
pub const DATA_STATUS_RUN: u8 = 0x10;

/// Output frames are stamped with all three healthy bits
pub const DATA_STATUS_GOOD: u8 = DATA_STATUS_STATE | DATA_STATUS_VALID | DATA_STATUS_RUN;

pub const TRANSFER_STATUS_OK: u8 = 0;

/// One cyclic frame, separated from its Ethernet envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtFrame {
    pub frame_id: u16,
    /// IO payload including any wire padding in front of the trailer
    pub payload: Vec<u8>,
    pub cycle_counter: u16,
    pub data_status: u8,
    pub transfer_status: u8,
}

impl RtFrame {
    pub fn frame_id_input(session_key: u16) -> u16 {
        RTC1_BASE + 2 * session_key
    }

    pub fn frame_id_output(session_key: u16) -> u16 {
        RTC1_BASE + 2 * session_key + 1
    }
}

/// Build the full Ethernet frame for an RT payload
pub fn build_rt_frame(dst: MacAddr, src: MacAddr, rt: &RtFrame) -> CoreResult<Vec<u8>> {
    let mut b = FrameBuilder::new(MAX_FRAME_LEN);
    EthHeader::profinet(dst, src).encode(&mut b)?;
    b.put_u16_be(rt.frame_id)?;
    b.put_bytes(&rt.payload)?;
    // zero padding ahead of the trailer keeps the frame at minimum length
    b.pad_to(ETH_MIN_FRAME_LEN - RT_TRAILER_LEN)?;
    b.put_u16_be(rt.cycle_counter)?;
    b.put_u8(rt.data_status)?;
    b.put_u8(rt.transfer_status)?;
    Ok(b.into_vec())
}

/// Split a received Ethernet frame into its header and RT content.
/// The returned payload still carries wire padding; the caller knows
/// the IOCR data length and slices accordingly.
pub fn parse_rt_frame(frame: &[u8]) -> CoreResult<(EthHeader, RtFrame)> {
    let mut p = FrameParser::new(frame);
    let eth = EthHeader::parse(&mut p)?;
    if eth.ethertype != ETHERTYPE_PROFINET {
        return Err(CoreError::InvalidField {
            field: "ethertype",
            reason: format!("expected 0x8892, got {:#06X}", eth.ethertype),
        });
    }
    let frame_id = p.take_u16_be()?;
    if p.remaining() < RT_TRAILER_LEN {
        return Err(CoreError::ShortBuffer {
            needed: RT_TRAILER_LEN,
            available: p.remaining(),
        });
    }
    let payload = p.take_bytes(p.remaining() - RT_TRAILER_LEN)?.to_vec();
    let cycle_counter = p.take_u16_be()?;
    let data_status = p.take_u8()?;
    let transfer_status = p.take_u8()?;
    Ok((
        eth,
        RtFrame {
            frame_id,
            payload,
            cycle_counter,
            data_status,
            transfer_status,
        },
    ))
}
