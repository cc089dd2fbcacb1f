//! DCE/RPC connectionless framing (UDP 34964)
//!
//! The 80-byte header is encoded per the sender's DREP declaration:
//! with DREP 0x10 every multi-byte header integer and the three UUID
//! time fields are little-endian. PNIO block payloads inside the body
//! stay big-endian regardless.

use crate::error::{CoreError, CoreResult};
use crate::wire::buffer::{FrameBuilder, FrameParser};
use uuid::Uuid;

/// Fixed PNIO device interface UUID (DEA00001-6C97-11D1-8271-00A02442DF7D)
pub const PNIO_DEVICE_INTERFACE_UUID: Uuid = Uuid::from_bytes([
    0xDE, 0xA0, 0x00, 0x01, 0x6C, 0x97, 0x11, 0xD1, 0x82, 0x71, 0x00, 0xA0, 0x24, 0x42, 0xDF,
    0x7D,
]);

/// DREP byte 0 with the little-endian integer representation bit set
pub const DREP_LITTLE_ENDIAN: u8 = 0x10;

/// Fragment lengths above this are treated as implausible and trigger
/// the endianness fallback in the parser
const MAX_PLAUSIBLE_FRAGMENT: u16 = 8192;

pub const RPC_VERSION: u8 = 4;
pub const RPC_HEADER_LEN: usize = 80;
pub const NDR_HEADER_LEN: usize = 20;

/// Connectionless RPC packet types
pub const PTYPE_REQUEST: u8 = 0;
pub const PTYPE_RESPONSE: u8 = 2;
pub const PTYPE_FAULT: u8 = 3;
pub const PTYPE_REJECT: u8 = 6;

/// PNIO operation numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OpNum {
    Connect = 0,
    Write = 1,
    Read = 2,
    Control = 3,
}

impl OpNum {
    pub fn from_wire(v: u16) -> CoreResult<Self> {
        match v {
            0 => Ok(Self::Connect),
            1 => Ok(Self::Write),
            2 => Ok(Self::Read),
            3 => Ok(Self::Control),
            other => Err(CoreError::InvalidField {
                field: "opnum",
                reason: format!("unknown operation {other}"),
            }),
        }
    }
}

/// UUIDs are held in canonical big-endian byte order; this produces the
/// on-wire form, swapping time-low/mid/hi when the DREP demands LE.
pub fn uuid_to_wire(uuid: &Uuid, little_endian: bool) -> [u8; 16] {
    let mut b = *uuid.as_bytes();
    if little_endian {
        b[0..4].reverse();
        b[4..6].reverse();
        b[6..8].reverse();
    }
    b
}

pub fn uuid_from_wire(bytes: &[u8], little_endian: bool) -> CoreResult<Uuid> {
    if bytes.len() != 16 {
        return Err(CoreError::ShortBuffer {
            needed: 16,
            available: bytes.len(),
        });
    }
    let mut b = [0u8; 16];
    b.copy_from_slice(bytes);
    if little_endian {
        b[0..4].reverse();
        b[4..6].reverse();
        b[6..8].reverse();
    }
    Ok(Uuid::from_bytes(b))
}

/// 80-byte DCE/RPC CL header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcHeader {
    pub version: u8,
    pub packet_type: u8,
    pub flags1: u8,
    pub flags2: u8,
    pub drep: [u8; 3],
    pub serial_high: u8,
    pub object_uuid: Uuid,
    pub interface_uuid: Uuid,
    pub activity_uuid: Uuid,
    pub server_boot_time: u32,
    pub interface_version: u32,
    pub sequence_number: u32,
    pub opnum: u16,
    pub interface_hint: u16,
    pub activity_hint: u16,
    pub fragment_length: u16,
    pub fragment_number: u16,
    pub auth_protocol: u8,
    pub serial_low: u8,
}

impl RpcHeader {
    /// Header for an outgoing request. The controller always declares
    /// DREP little-endian; the object UUID is the per-AR UUID.
    pub fn request(opnum: OpNum, object_uuid: Uuid, activity_uuid: Uuid, sequence: u32) -> Self {
        Self {
            version: RPC_VERSION,
            packet_type: PTYPE_REQUEST,
            flags1: 0x20, // idempotent
            flags2: 0,
            drep: [DREP_LITTLE_ENDIAN, 0, 0],
            serial_high: 0,
            object_uuid,
            interface_uuid: PNIO_DEVICE_INTERFACE_UUID,
            activity_uuid,
            server_boot_time: 0,
            interface_version: 1,
            sequence_number: sequence,
            opnum: opnum as u16,
            interface_hint: 0xFFFF,
            activity_hint: 0xFFFF,
            fragment_length: 0,
            fragment_number: 0,
            auth_protocol: 0,
            serial_low: 0,
        }
    }

    pub fn is_little_endian(&self) -> bool {
        self.drep[0] & 0xF0 == DREP_LITTLE_ENDIAN
    }

    pub fn encode(&self, b: &mut FrameBuilder) -> CoreResult<()> {
        self.encode_inner(b, self.is_little_endian())
    }

    /// Keep header integers per DREP but force big-endian UUID fields.
    /// Some device stacks only accept this hybrid form; it is one of
    /// the connect strategy knobs.
    pub fn encode_forced_be_uuids(&self, b: &mut FrameBuilder) -> CoreResult<()> {
        self.encode_inner(b, false)
    }

    fn encode_inner(&self, b: &mut FrameBuilder, uuid_le: bool) -> CoreResult<()> {
        let le = self.is_little_endian();
        b.put_u8(self.version)?;
        b.put_u8(self.packet_type)?;
        b.put_u8(self.flags1)?;
        b.put_u8(self.flags2)?;
        b.put_bytes(&self.drep)?;
        b.put_u8(self.serial_high)?;
        b.put_bytes(&uuid_to_wire(&self.object_uuid, uuid_le))?;
        b.put_bytes(&uuid_to_wire(&self.interface_uuid, uuid_le))?;
        b.put_bytes(&uuid_to_wire(&self.activity_uuid, uuid_le))?;
        b.put_u32(self.server_boot_time, le)?;
        b.put_u32(self.interface_version, le)?;
        b.put_u32(self.sequence_number, le)?;
        b.put_u16(self.opnum, le)?;
        b.put_u16(self.interface_hint, le)?;
        b.put_u16(self.activity_hint, le)?;
        b.put_u16(self.fragment_length, le)?;
        b.put_u16(self.fragment_number, le)?;
        b.put_u8(self.auth_protocol)?;
        b.put_u8(self.serial_low)
    }

    /// Parse a header, honouring the peer's declared DREP. Some device
    /// stacks declare big-endian but encode little-endian; when the
    /// declared decoding yields an implausible fragment length the
    /// opposite endianness is tried before giving up.
    pub fn parse(p: &mut FrameParser<'_>) -> CoreResult<Self> {
        let raw = p.take_bytes(RPC_HEADER_LEN)?;
        let declared_le = raw[4] & 0xF0 == DREP_LITTLE_ENDIAN;

        let declared = Self::decode_with(raw, declared_le)?;
        if declared.plausible() {
            return Ok(declared);
        }

        let flipped = Self::decode_with(raw, !declared_le)?;
        if flipped.plausible() {
            return Ok(flipped);
        }

        Err(CoreError::InvalidField {
            field: "fragment_length",
            reason: format!(
                "{} implausible under either endianness",
                declared.fragment_length
            ),
        })
    }

    fn decode_with(raw: &[u8], le: bool) -> CoreResult<Self> {
        let mut p = FrameParser::new(raw);
        let version = p.take_u8()?;
        if version != RPC_VERSION {
            return Err(CoreError::InvalidField {
                field: "rpc_version",
                reason: format!("expected {RPC_VERSION}, got {version}"),
            });
        }
        let packet_type = p.take_u8()?;
        let flags1 = p.take_u8()?;
        let flags2 = p.take_u8()?;
        let drep_bytes = p.take_bytes(3)?;
        let serial_high = p.take_u8()?;
        let object_uuid = uuid_from_wire(p.take_bytes(16)?, le)?;
        let interface_uuid = uuid_from_wire(p.take_bytes(16)?, le)?;
        let activity_uuid = uuid_from_wire(p.take_bytes(16)?, le)?;
        Ok(Self {
            version,
            packet_type,
            flags1,
            flags2,
            drep: drep_bytes.try_into().expect("3-byte slice"),
            serial_high,
            object_uuid,
            interface_uuid,
            activity_uuid,
            server_boot_time: p.take_u32(le)?,
            interface_version: p.take_u32(le)?,
            sequence_number: p.take_u32(le)?,
            opnum: p.take_u16(le)?,
            interface_hint: p.take_u16(le)?,
            activity_hint: p.take_u16(le)?,
            fragment_length: p.take_u16(le)?,
            fragment_number: p.take_u16(le)?,
            auth_protocol: p.take_u8()?,
            serial_low: p.take_u8()?,
        })
    }

    fn plausible(&self) -> bool {
        self.fragment_length <= MAX_PLAUSIBLE_FRAGMENT
            && self.interface_version <= 0xFFFF
    }
}

/// 20-byte NDR sub-header carried before PNIO blocks in Connect bodies.
/// Presence is peer-dependent; the connection manager decides whether
/// to emit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdrHeader {
    pub args_maximum: u32,
    pub args_length: u32,
    pub maximum_count: u32,
    pub offset: u32,
    pub actual_count: u32,
}

impl NdrHeader {
    pub fn for_body(len: u32) -> Self {
        Self {
            args_maximum: len,
            args_length: len,
            maximum_count: len,
            offset: 0,
            actual_count: len,
        }
    }

    pub fn encode(&self, b: &mut FrameBuilder, little_endian: bool) -> CoreResult<()> {
        b.put_u32(self.args_maximum, little_endian)?;
        b.put_u32(self.args_length, little_endian)?;
        b.put_u32(self.maximum_count, little_endian)?;
        b.put_u32(self.offset, little_endian)?;
        b.put_u32(self.actual_count, little_endian)
    }

    pub fn parse(p: &mut FrameParser<'_>, little_endian: bool) -> CoreResult<Self> {
        Ok(Self {
            args_maximum: p.take_u32(little_endian)?,
            args_length: p.take_u32(little_endian)?,
            maximum_count: p.take_u32(little_endian)?,
            offset: p.take_u32(little_endian)?,
            actual_count: p.take_u32(little_endian)?,
        })
    }

    pub fn plausible(&self, body_len: usize) -> bool {
        self.actual_count as usize <= body_len && self.args_length as usize <= body_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> RpcHeader {
        let mut hdr = RpcHeader::request(
            OpNum::Connect,
            Uuid::from_u128(0x1122334455667788_99AABBCCDDEEFF00),
            Uuid::from_u128(0xCAFEBABE_DEAD_BEEF_0123_456789ABCDEF),
            7,
        );
        hdr.fragment_length = 692;
        hdr
    }

    #[test]
    fn le_encoding_matches_fixed_offsets() {
        let hdr = sample_header();
        let mut b = FrameBuilder::new(RPC_HEADER_LEN);
        hdr.encode(&mut b).unwrap();
        let wire = b.into_vec();
        assert_eq!(wire.len(), RPC_HEADER_LEN);

        // interface_version = 1 at offset 60, little-endian
        assert_eq!(&wire[60..64], &[0x01, 0x00, 0x00, 0x00]);
        // fragment_length = 692 = 0x02B4 at offset 74
        assert_eq!(&wire[74..76], &[0xB4, 0x02]);

        let mut p = FrameParser::new(&wire);
        let parsed = RpcHeader::parse(&mut p).unwrap();
        assert_eq!(parsed.interface_version, 1);
        assert_eq!(parsed.fragment_length, 692);
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn interface_uuid_wire_form_swaps_time_fields() {
        let be = uuid_to_wire(&PNIO_DEVICE_INTERFACE_UUID, false);
        assert_eq!(&be[..4], &[0xDE, 0xA0, 0x00, 0x01]);

        let le = uuid_to_wire(&PNIO_DEVICE_INTERFACE_UUID, true);
        assert_eq!(&le[..4], &[0x01, 0x00, 0xA0, 0xDE]);
        assert_eq!(&le[4..6], &[0x97, 0x6C]);
        assert_eq!(&le[6..8], &[0xD1, 0x11]);
        // node part is never swapped
        assert_eq!(&le[8..], &be[8..]);

        assert_eq!(
            uuid_from_wire(&le, true).unwrap(),
            PNIO_DEVICE_INTERFACE_UUID
        );
    }

    #[test]
    fn parser_falls_back_when_declared_endianness_is_wrong() {
        // Encode little-endian, then overwrite the DREP to claim BE;
        // mimics the observed rogue device stack.
        let hdr = sample_header();
        let mut b = FrameBuilder::new(RPC_HEADER_LEN);
        hdr.encode(&mut b).unwrap();
        let mut wire = b.into_vec();
        wire[4] = 0x00;

        let mut p = FrameParser::new(&wire);
        let parsed = RpcHeader::parse(&mut p).unwrap();
        assert_eq!(parsed.fragment_length, 692);
        assert_eq!(parsed.interface_version, 1);
    }

    #[test]
    fn ndr_round_trip() {
        let ndr = NdrHeader::for_body(444);
        let mut b = FrameBuilder::new(NDR_HEADER_LEN);
        ndr.encode(&mut b, true).unwrap();
        let wire = b.into_vec();
        assert_eq!(wire.len(), NDR_HEADER_LEN);

        let mut p = FrameParser::new(&wire);
        assert_eq!(NdrHeader::parse(&mut p, true).unwrap(), ndr);
    }
}
