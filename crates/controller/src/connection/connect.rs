//! Connect, Write, Control and Read RPC bodies
//!
//! PNIO block payloads are always big-endian regardless of the header
//! DREP. Request builders cover the controller side; the response
//! builders encode the device side for the simulator and tests.

use crate::connection::strategy::{ConnectStrategy, SlotScope, UuidEncoding};
use crate::error::{CoreError, CoreResult};
use crate::registry::{SlotConfig, SlotKind};
use crate::wire::rpc::{
    NdrHeader, OpNum, RpcHeader, NDR_HEADER_LEN, PTYPE_FAULT, PTYPE_REJECT, PTYPE_RESPONSE,
    RPC_HEADER_LEN,
};
use crate::wire::rt::RtFrame;
use crate::wire::{FrameBuilder, FrameParser, MacAddr, ACTUATOR_SLOT_SIZE, SENSOR_SLOT_SIZE};
use uuid::Uuid;

const BLOCK_AR_REQ: u16 = 0x0101;
const BLOCK_IOCR_REQ: u16 = 0x0102;
const BLOCK_ALARM_CR_REQ: u16 = 0x0103;
const BLOCK_EXPECTED_SUBMODULE: u16 = 0x0104;
const BLOCK_IOD_WRITE_REQ: u16 = 0x0008;
const BLOCK_IOD_READ_REQ: u16 = 0x0009;
const BLOCK_CONTROL_REQ: u16 = 0x0110;

const BLOCK_AR_RES: u16 = 0x8101;
const BLOCK_IOCR_RES: u16 = 0x8102;
const BLOCK_IOD_WRITE_RES: u16 = 0x8008;
const BLOCK_IOD_READ_RES: u16 = 0x8009;
const BLOCK_CONTROL_RES: u16 = 0x8110;

pub const CONTROL_PRM_END: u16 = 0x0001;
pub const CONTROL_APPLICATION_READY: u16 = 0x0002;
pub const CONTROL_DONE: u16 = 0x0008;

const IOCR_TYPE_INPUT: u16 = 1;
const IOCR_TYPE_OUTPUT: u16 = 2;

const MODULE_IDENT_DAP: u32 = 0x0000_0001;
const MODULE_IDENT_SENSOR: u32 = 0x0000_0042;
const MODULE_IDENT_ACTUATOR: u32 = 0x0000_0043;

const DATA_DIRECTION_INPUT: u16 = 1;
const DATA_DIRECTION_OUTPUT: u16 = 2;

const MAX_RPC_BODY: usize = 4096;

/// Everything a Connect request is built from
pub struct ConnectParams<'a> {
    pub strategy: &'a ConnectStrategy,
    pub ar_uuid: Uuid,
    pub activity_uuid: Uuid,
    pub session_key: u16,
    pub sequence: u32,
    /// CMInitiatorStationName: the controller's own station name
    pub initiator_station: &'a str,
    pub local_mac: MacAddr,
    pub slots: &'a [SlotConfig],
}

/// What the device acknowledged in its Connect response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAck {
    pub ar_uuid: Uuid,
    pub session_key: u16,
    pub responder_mac: MacAddr,
}

fn encode_block(b: &mut FrameBuilder, block_type: u16, payload: &[u8]) -> CoreResult<()> {
    b.put_u16_be(block_type)?;
    // BlockLength counts the version bytes plus the payload
    b.put_u16_be((payload.len() + 2) as u16)?;
    b.put_u8(1)?; // BlockVersionHigh
    b.put_u8(0)?; // BlockVersionLow
    b.put_bytes(payload)
}

struct Block<'a> {
    block_type: u16,
    payload: &'a [u8],
}

fn parse_blocks(data: &[u8]) -> CoreResult<Vec<Block<'_>>> {
    let mut p = FrameParser::new(data);
    let mut blocks = Vec::new();
    while p.remaining() >= 6 {
        let block_type = p.take_u16_be()?;
        let block_len = p.take_u16_be()? as usize;
        if block_len < 2 || block_len - 2 > p.remaining().saturating_sub(2) {
            return Err(CoreError::InvalidField {
                field: "block_length",
                reason: format!("{block_len} exceeds {} remaining", p.remaining()),
            });
        }
        p.skip(2)?; // version
        let payload = p.take_bytes(block_len - 2)?;
        blocks.push(Block {
            block_type,
            payload,
        });
    }
    Ok(blocks)
}

/// The response-side block types a body may legally start with;
/// used to tell an NDR header from a bare block list.
fn starts_with_known_block(data: &[u8]) -> bool {
    if data.len() < 2 {
        return false;
    }
    matches!(
        u16::from_be_bytes([data[0], data[1]]),
        BLOCK_AR_RES
            | BLOCK_IOCR_RES
            | BLOCK_IOD_WRITE_RES
            | BLOCK_IOD_READ_RES
            | BLOCK_CONTROL_RES
            | BLOCK_EXPECTED_SUBMODULE
    )
}

fn initiator_object_uuid(session_key: u16) -> Uuid {
    let mut bytes = [
        0xDE, 0xA0, 0x00, 0x00, 0x6C, 0x97, 0x11, 0xD1, 0x82, 0x71, 0x00, 0x01, 0x00, 0x00, 0x00,
        0x00,
    ];
    bytes[14..16].copy_from_slice(&session_key.to_be_bytes());
    Uuid::from_bytes(bytes)
}

fn encode_header(
    b: &mut FrameBuilder,
    hdr: &RpcHeader,
    uuid_encoding: UuidEncoding,
) -> CoreResult<()> {
    match uuid_encoding {
        UuidEncoding::Drep => hdr.encode(b),
        UuidEncoding::ForcedBigEndian => hdr.encode_forced_be_uuids(b),
    }
}

/// Build a full Connect request datagram
pub fn build_connect_request(p: &ConnectParams<'_>) -> CoreResult<Vec<u8>> {
    let mut blocks = FrameBuilder::new(MAX_RPC_BODY);
    encode_ar_block_req(&mut blocks, p)?;
    encode_iocr_block_req(&mut blocks, p, IOCR_TYPE_INPUT)?;
    encode_iocr_block_req(&mut blocks, p, IOCR_TYPE_OUTPUT)?;
    encode_alarm_cr_block_req(&mut blocks)?;
    encode_expected_submodule_block(&mut blocks, p.slots, p.strategy.slot_scope)?;
    let blocks = blocks.into_vec();

    let mut body = FrameBuilder::new(MAX_RPC_BODY + NDR_HEADER_LEN);
    if p.strategy.ndr_header {
        NdrHeader::for_body(blocks.len() as u32).encode(&mut body, true)?;
    }
    body.put_bytes(&blocks)?;
    let body = body.into_vec();

    let mut hdr = RpcHeader::request(OpNum::Connect, p.ar_uuid, p.activity_uuid, p.sequence);
    hdr.opnum = p.strategy.opnum;
    hdr.fragment_length = body.len() as u16;

    let mut out = FrameBuilder::new(RPC_HEADER_LEN + body.len());
    encode_header(&mut out, &hdr, p.strategy.uuid_encoding)?;
    out.put_bytes(&body)?;
    Ok(out.into_vec())
}

fn encode_ar_block_req(b: &mut FrameBuilder, p: &ConnectParams<'_>) -> CoreResult<()> {
    let name = p.initiator_station.as_bytes();
    let mut payload = FrameBuilder::new(64 + name.len());
    payload.put_u16_be(1)?; // ARType: IOCARSingle
    payload.put_bytes(p.ar_uuid.as_bytes())?;
    payload.put_u16_be(p.session_key)?;
    payload.put_bytes(&p.local_mac.octets())?;
    payload.put_bytes(initiator_object_uuid(p.session_key).as_bytes())?;
    payload.put_u32_be(0x0000_0131)?; // ARProperties
    payload.put_u16_be(600)?; // CMInitiatorActivityTimeout, 100 ms units
    payload.put_u16_be(0x8892)?; // InitiatorUDPRTPort
    payload.put_u16_be(name.len() as u16)?;
    payload.put_bytes(name)?;
    encode_block(b, BLOCK_AR_REQ, payload.as_slice())
}

fn encode_iocr_block_req(
    b: &mut FrameBuilder,
    p: &ConnectParams<'_>,
    iocr_type: u16,
) -> CoreResult<()> {
    let (kind, slot_size, frame_id) = if iocr_type == IOCR_TYPE_INPUT {
        (
            SlotKind::Sensor,
            SENSOR_SLOT_SIZE,
            RtFrame::frame_id_input(p.session_key),
        )
    } else {
        (
            SlotKind::Actuator,
            ACTUATOR_SLOT_SIZE,
            RtFrame::frame_id_output(p.session_key),
        )
    };
    let slots: Vec<&SlotConfig> = p.slots.iter().filter(|s| s.kind == kind).collect();
    let data_length = (slots.len() * slot_size) as u16;
    let timing = &p.strategy.timing;

    let mut payload = FrameBuilder::new(64 + slots.len() * 12);
    payload.put_u16_be(iocr_type)?;
    payload.put_u16_be(iocr_type)?; // IOCRReference
    payload.put_u16_be(0x8892)?; // LT
    payload.put_u32_be(0x0000_0001)?; // IOCRProperties: RT class 1
    payload.put_u16_be(data_length)?;
    payload.put_u16_be(frame_id)?;
    payload.put_u16_be(timing.send_clock_factor)?;
    payload.put_u16_be(timing.reduction_ratio)?;
    payload.put_u16_be(1)?; // Phase
    payload.put_u16_be(0)?; // Sequence
    payload.put_u32_be(0xFFFF_FFFF)?; // FrameSendOffset: best effort
    payload.put_u16_be(timing.watchdog_factor)?;
    payload.put_u16_be(timing.watchdog_factor)?; // DataHoldFactor
    payload.put_u16_be(0xC000)?; // IOCRTagHeader
    payload.put_bytes(&MacAddr::ZERO.octets())?; // FrameMulticastMAC
    payload.put_u16_be(1)?; // NumberOfAPIs
    payload.put_u32_be(0)?; // API
    payload.put_u16_be(slots.len() as u16)?;
    for (ordinal, slot) in slots.iter().enumerate() {
        payload.put_u16_be(slot.slot_number)?;
        payload.put_u16_be(slot.subslot)?;
        payload.put_u16_be((ordinal * slot_size) as u16)?; // data offset
    }
    payload.put_u16_be(slots.len() as u16)?; // NumberOfIOCS
    for (ordinal, slot) in slots.iter().enumerate() {
        payload.put_u16_be(slot.slot_number)?;
        payload.put_u16_be(slot.subslot)?;
        payload.put_u16_be((data_length as usize + ordinal) as u16)?; // IOCS offset
    }
    encode_block(b, BLOCK_IOCR_REQ, payload.as_slice())
}

fn encode_alarm_cr_block_req(b: &mut FrameBuilder) -> CoreResult<()> {
    let mut payload = FrameBuilder::new(32);
    payload.put_u16_be(1)?; // AlarmCRType
    payload.put_u16_be(0x8892)?; // LT
    payload.put_u32_be(0)?; // AlarmCRProperties
    payload.put_u16_be(1)?; // RTATimeoutFactor
    payload.put_u16_be(3)?; // RTARetries
    payload.put_u16_be(3)?; // LocalAlarmReference
    payload.put_u16_be(200)?; // MaxAlarmDataLength
    payload.put_u16_be(0xC000)?; // AlarmCRTagHeaderHigh
    payload.put_u16_be(0xA000)?; // AlarmCRTagHeaderLow
    encode_block(b, BLOCK_ALARM_CR_REQ, payload.as_slice())
}

fn encode_expected_submodule_block(
    b: &mut FrameBuilder,
    slots: &[SlotConfig],
    scope: SlotScope,
) -> CoreResult<()> {
    let with_dap = scope == SlotScope::WithDap;
    let entries = slots.len() + usize::from(with_dap);

    let mut payload = FrameBuilder::new(16 + entries * 32);
    payload.put_u16_be(entries as u16)?;
    if with_dap {
        encode_submodule_entry(&mut payload, 0, 1, MODULE_IDENT_DAP, 0, 0)?;
    }
    for slot in slots {
        let (ident, direction, data_length) = match slot.kind {
            SlotKind::Sensor => (
                MODULE_IDENT_SENSOR,
                DATA_DIRECTION_INPUT,
                SENSOR_SLOT_SIZE as u16,
            ),
            SlotKind::Actuator => (
                MODULE_IDENT_ACTUATOR,
                DATA_DIRECTION_OUTPUT,
                ACTUATOR_SLOT_SIZE as u16,
            ),
        };
        encode_submodule_entry(
            &mut payload,
            slot.slot_number,
            slot.subslot,
            ident,
            direction,
            data_length,
        )?;
    }
    encode_block(b, BLOCK_EXPECTED_SUBMODULE, payload.as_slice())
}

fn encode_submodule_entry(
    b: &mut FrameBuilder,
    slot_number: u16,
    subslot: u16,
    ident: u32,
    direction: u16,
    data_length: u16,
) -> CoreResult<()> {
    b.put_u32_be(0)?; // API
    b.put_u16_be(slot_number)?;
    b.put_u32_be(ident)?; // ModuleIdentNumber
    b.put_u16_be(0)?; // ModuleProperties
    b.put_u16_be(1)?; // NumberOfSubmodules
    b.put_u16_be(subslot)?;
    b.put_u32_be(ident)?; // SubmoduleIdentNumber
    b.put_u16_be(0)?; // SubmoduleProperties
    b.put_u16_be(direction)?;
    b.put_u16_be(data_length)?;
    b.put_u8(1)?; // LengthIOCS
    b.put_u8(1) // LengthIOPS
}

/// Reconstruct a slot plan from an expected-submodule payload. Names
/// are generic; the registry merges in whatever richer config it has.
pub fn parse_expected_submodules(payload: &[u8]) -> CoreResult<Vec<SlotConfig>> {
    let mut p = FrameParser::new(payload);
    let entries = p.take_u16_be()? as usize;
    let mut slots = Vec::with_capacity(entries);
    for _ in 0..entries {
        p.skip(4)?; // API
        let slot_number = p.take_u16_be()?;
        let ident = p.take_u32_be()?;
        p.skip(2)?; // ModuleProperties
        let n_submodules = p.take_u16_be()? as usize;
        for _ in 0..n_submodules {
            let subslot = p.take_u16_be()?;
            p.skip(4 + 2)?; // SubmoduleIdentNumber, SubmoduleProperties
            let direction = p.take_u16_be()?;
            p.skip(2)?; // data length
            p.skip(2)?; // IOCS/IOPS lengths
            if ident == MODULE_IDENT_DAP {
                continue;
            }
            let mut slot = match direction {
                DATA_DIRECTION_INPUT => SlotConfig::sensor(
                    slot_number,
                    "sensor",
                    &format!("Slot {slot_number}"),
                    "",
                ),
                DATA_DIRECTION_OUTPUT => SlotConfig::actuator(
                    slot_number,
                    "actuator",
                    &format!("Slot {slot_number}"),
                ),
                _ => continue,
            };
            slot.subslot = subslot;
            slots.push(slot);
        }
    }
    Ok(slots)
}

/// Header plus body of a parsed response datagram
fn split_response(bytes: &[u8]) -> CoreResult<(RpcHeader, &[u8])> {
    let mut p = FrameParser::new(bytes);
    let hdr = RpcHeader::parse(&mut p)?;
    match hdr.packet_type {
        PTYPE_RESPONSE => {}
        PTYPE_FAULT | PTYPE_REJECT => {
            return Err(CoreError::ConnectRejected(format!(
                "peer answered packet type {}",
                hdr.packet_type
            )));
        }
        other => {
            return Err(CoreError::Protocol(format!(
                "unexpected rpc packet type {other}"
            )));
        }
    }
    let body = p.rest();
    // tolerate peers whose fragment length disagrees with the datagram,
    // as long as something is there
    Ok((hdr, body))
}

/// Strip the optional NDR section off a response body
fn strip_ndr<'a>(hdr: &RpcHeader, body: &'a [u8]) -> &'a [u8] {
    if body.len() >= NDR_HEADER_LEN && !starts_with_known_block(body) {
        let mut p = FrameParser::new(body);
        if let Ok(ndr) = NdrHeader::parse(&mut p, hdr.is_little_endian()) {
            if ndr.plausible(body.len() - NDR_HEADER_LEN) {
                return &body[NDR_HEADER_LEN..];
            }
        }
    }
    body
}

/// Validate a Connect response. An empty body or a missing ARBlockRes
/// is a rejection.
pub fn parse_connect_response(bytes: &[u8]) -> CoreResult<ConnectAck> {
    let (hdr, body) = split_response(bytes)?;
    if hdr.fragment_length == 0 || body.is_empty() {
        return Err(CoreError::ConnectRejected("empty response body".to_string()));
    }
    let blocks_data = strip_ndr(&hdr, body);
    let blocks = parse_blocks(blocks_data)?;
    let ar_block = blocks
        .iter()
        .find(|b| b.block_type == BLOCK_AR_RES)
        .ok_or_else(|| CoreError::ConnectRejected("no ARBlockRes in response".to_string()))?;

    let mut p = FrameParser::new(ar_block.payload);
    p.skip(2)?; // ARType
    let ar_uuid = Uuid::from_bytes(p.take_bytes(16)?.try_into().expect("16-byte slice"));
    let session_key = p.take_u16_be()?;
    let mac = p.take_bytes(6)?;
    Ok(ConnectAck {
        ar_uuid,
        session_key,
        responder_mac: MacAddr(mac.try_into().expect("6-byte slice")),
    })
}

/// Parameter-record write sent while PARAMETERIZING
pub fn build_write_request(
    ar_uuid: Uuid,
    activity_uuid: Uuid,
    sequence: u32,
) -> CoreResult<Vec<u8>> {
    let mut payload = FrameBuilder::new(64);
    payload.put_u16_be(0)?; // SeqNumber
    payload.put_bytes(ar_uuid.as_bytes())?;
    payload.put_u32_be(0)?; // API
    payload.put_u16_be(0)?; // Slot
    payload.put_u16_be(1)?; // Subslot
    payload.put_u16_be(0)?; // padding
    payload.put_u16_be(0x8071)?; // Index: interface parameters
    payload.put_u32_be(0)?; // RecordDataLength

    let mut body = FrameBuilder::new(128);
    encode_block(&mut body, BLOCK_IOD_WRITE_REQ, payload.as_slice())?;
    finish_request(OpNum::Write, ar_uuid, activity_uuid, sequence, body.into_vec())
}

pub fn parse_write_response(bytes: &[u8]) -> CoreResult<()> {
    let (hdr, body) = split_response(bytes)?;
    let blocks = parse_blocks(strip_ndr(&hdr, body))?;
    if blocks.iter().any(|b| b.block_type == BLOCK_IOD_WRITE_RES) {
        Ok(())
    } else {
        Err(CoreError::ParameterizationFailed(
            "no IODWriteRes in response".to_string(),
        ))
    }
}

/// Control request (PrmEnd, ApplicationReady) sent while APPLYING
pub fn build_control_request(
    ar_uuid: Uuid,
    activity_uuid: Uuid,
    sequence: u32,
    session_key: u16,
    command: u16,
) -> CoreResult<Vec<u8>> {
    let mut payload = FrameBuilder::new(32);
    payload.put_u16_be(0)?; // reserved
    payload.put_bytes(ar_uuid.as_bytes())?;
    payload.put_u16_be(session_key)?;
    payload.put_u16_be(0)?; // reserved
    payload.put_u16_be(command)?;
    payload.put_u16_be(0)?; // ControlBlockProperties

    let mut body = FrameBuilder::new(64);
    encode_block(&mut body, BLOCK_CONTROL_REQ, payload.as_slice())?;
    finish_request(
        OpNum::Control,
        ar_uuid,
        activity_uuid,
        sequence,
        body.into_vec(),
    )
}

pub fn parse_control_response(bytes: &[u8]) -> CoreResult<()> {
    let (hdr, body) = split_response(bytes)?;
    let blocks = parse_blocks(strip_ndr(&hdr, body))?;
    let control = blocks
        .iter()
        .find(|b| b.block_type == BLOCK_CONTROL_RES)
        .ok_or_else(|| {
            CoreError::ParameterizationFailed("no IODControlRes in response".to_string())
        })?;
    let mut p = FrameParser::new(control.payload);
    p.skip(2 + 16 + 2 + 2)?; // reserved, ARUUID, SessionKey, reserved
    let command = p.take_u16_be()?;
    if command & CONTROL_DONE != 0 {
        Ok(())
    } else {
        Err(CoreError::ParameterizationFailed(format!(
            "control not acknowledged (command {command:#06X})"
        )))
    }
}

/// Implicit read of the expected submodule configuration
pub fn build_read_inventory_request(
    ar_uuid: Uuid,
    activity_uuid: Uuid,
    sequence: u32,
) -> CoreResult<Vec<u8>> {
    let mut payload = FrameBuilder::new(64);
    payload.put_u16_be(0)?; // SeqNumber
    payload.put_bytes(ar_uuid.as_bytes())?;
    payload.put_u32_be(0)?; // API
    payload.put_u16_be(0xFFFF)?; // Slot: all
    payload.put_u16_be(0xFFFF)?; // Subslot: all
    payload.put_u16_be(0)?; // padding
    payload.put_u16_be(0x8000)?; // Index: expected identification data
    payload.put_u32_be(0)?; // RecordDataLength

    let mut body = FrameBuilder::new(128);
    encode_block(&mut body, BLOCK_IOD_READ_REQ, payload.as_slice())?;
    finish_request(OpNum::Read, ar_uuid, activity_uuid, sequence, body.into_vec())
}

pub fn parse_read_inventory_response(bytes: &[u8]) -> CoreResult<Vec<SlotConfig>> {
    let (hdr, body) = split_response(bytes)?;
    let blocks = parse_blocks(strip_ndr(&hdr, body))?;
    let submodules = blocks
        .iter()
        .find(|b| b.block_type == BLOCK_EXPECTED_SUBMODULE)
        .ok_or_else(|| CoreError::Protocol("no submodule block in read response".to_string()))?;
    parse_expected_submodules(submodules.payload)
}

fn finish_request(
    opnum: OpNum,
    ar_uuid: Uuid,
    activity_uuid: Uuid,
    sequence: u32,
    body: Vec<u8>,
) -> CoreResult<Vec<u8>> {
    let mut hdr = RpcHeader::request(opnum, ar_uuid, activity_uuid, sequence);
    hdr.fragment_length = body.len() as u16;
    let mut out = FrameBuilder::new(RPC_HEADER_LEN + body.len());
    hdr.encode(&mut out)?;
    out.put_bytes(&body)?;
    Ok(out.into_vec())
}

// ---------------------------------------------------------------------------
// Device-side encodings, used by the RTU simulator and the test suite
// ---------------------------------------------------------------------------

fn response_header(request: &RpcHeader, fragment_length: u16) -> RpcHeader {
    let mut hdr = request.clone();
    hdr.packet_type = PTYPE_RESPONSE;
    hdr.fragment_length = fragment_length;
    hdr
}

/// Parse just the RPC header of a request datagram
pub fn parse_request_header(bytes: &[u8]) -> CoreResult<(RpcHeader, Vec<u8>)> {
    let mut p = FrameParser::new(bytes);
    let hdr = RpcHeader::parse(&mut p)?;
    Ok((hdr, p.rest().to_vec()))
}

pub fn build_connect_response(
    request: &RpcHeader,
    ar_uuid: Uuid,
    session_key: u16,
    device_mac: MacAddr,
) -> CoreResult<Vec<u8>> {
    let mut payload = FrameBuilder::new(64);
    payload.put_u16_be(1)?; // ARType
    payload.put_bytes(ar_uuid.as_bytes())?;
    payload.put_u16_be(session_key)?;
    payload.put_bytes(&device_mac.octets())?;
    payload.put_u16_be(0x8892)?; // ResponderUDPRTPort

    let mut blocks = FrameBuilder::new(256);
    encode_block(&mut blocks, BLOCK_AR_RES, payload.as_slice())?;
    for frame_id in [
        RtFrame::frame_id_input(session_key),
        RtFrame::frame_id_output(session_key),
    ] {
        let mut iocr = FrameBuilder::new(16);
        iocr.put_u16_be(if frame_id % 2 == 0 {
            IOCR_TYPE_INPUT
        } else {
            IOCR_TYPE_OUTPUT
        })?;
        iocr.put_u16_be(1)?; // IOCRReference
        iocr.put_u16_be(frame_id)?;
        encode_block(&mut blocks, BLOCK_IOCR_RES, iocr.as_slice())?;
    }
    finish_response(request, blocks.into_vec())
}

/// An empty-bodied response; conforming controllers treat it as a
/// rejection
pub fn build_empty_response(request: &RpcHeader) -> CoreResult<Vec<u8>> {
    finish_response(request, Vec::new())
}

pub fn build_write_response(request: &RpcHeader, ar_uuid: Uuid) -> CoreResult<Vec<u8>> {
    let mut payload = FrameBuilder::new(64);
    payload.put_u16_be(0)?;
    payload.put_bytes(ar_uuid.as_bytes())?;
    payload.put_u32_be(0)?;
    let mut blocks = FrameBuilder::new(128);
    encode_block(&mut blocks, BLOCK_IOD_WRITE_RES, payload.as_slice())?;
    finish_response(request, blocks.into_vec())
}

pub fn build_control_response(
    request: &RpcHeader,
    ar_uuid: Uuid,
    session_key: u16,
) -> CoreResult<Vec<u8>> {
    let mut payload = FrameBuilder::new(32);
    payload.put_u16_be(0)?;
    payload.put_bytes(ar_uuid.as_bytes())?;
    payload.put_u16_be(session_key)?;
    payload.put_u16_be(0)?;
    payload.put_u16_be(CONTROL_DONE)?;
    payload.put_u16_be(0)?;
    let mut blocks = FrameBuilder::new(64);
    encode_block(&mut blocks, BLOCK_CONTROL_RES, payload.as_slice())?;
    finish_response(request, blocks.into_vec())
}

pub fn build_read_inventory_response(
    request: &RpcHeader,
    slots: &[SlotConfig],
) -> CoreResult<Vec<u8>> {
    let mut read_payload = FrameBuilder::new(32);
    read_payload.put_u16_be(0)?;
    read_payload.put_bytes(request.object_uuid.as_bytes())?;
    read_payload.put_u32_be(0)?;

    let mut blocks = FrameBuilder::new(MAX_RPC_BODY);
    encode_block(&mut blocks, BLOCK_IOD_READ_RES, read_payload.as_slice())?;
    encode_expected_submodule_block(&mut blocks, slots, SlotScope::ExpectedOnly)?;
    finish_response(request, blocks.into_vec())
}

fn finish_response(request: &RpcHeader, blocks: Vec<u8>) -> CoreResult<Vec<u8>> {
    let mut body = FrameBuilder::new(MAX_RPC_BODY + NDR_HEADER_LEN);
    if !blocks.is_empty() {
        NdrHeader::for_body(blocks.len() as u32).encode(&mut body, request.is_little_endian())?;
        body.put_bytes(&blocks)?;
    }
    let body = body.into_vec();
    let hdr = response_header(request, body.len() as u16);
    let mut out = FrameBuilder::new(RPC_HEADER_LEN + body.len());
    hdr.encode(&mut out)?;
    out.put_bytes(&body)?;
    Ok(out.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::strategy::ConnectStrategy;

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

    fn params<'a>(strategy: &'a ConnectStrategy, slots: &'a [SlotConfig]) -> ConnectParams<'a> {
        ConnectParams {
            strategy,
            ar_uuid: Uuid::from_u128(0x11112222_3333_4444_5555_666677778888),
            activity_uuid: Uuid::from_u128(0xAAAA_BBBB_CCCC_DDDD_0000_1111_2222_3333),
            session_key: 1,
            sequence: 1,
            initiator_station: "aquactl",
            local_mac: MacAddr([0x02, 0, 0, 0, 0, 1]),
            slots,
        }
    }

    #[test]
    fn connect_request_has_header_ndr_and_blocks() {
        let strategies = ConnectStrategy::default_list();
        let slots = slots_8_7();
        let wire = build_connect_request(&params(&strategies[0], &slots)).unwrap();

        let (hdr, body) = parse_request_header(&wire).unwrap();
        assert_eq!(hdr.opnum, 0);
        assert_eq!(hdr.fragment_length as usize, body.len());
        assert!(hdr.is_little_endian());
        assert_eq!(
            hdr.interface_uuid,
            crate::wire::PNIO_DEVICE_INTERFACE_UUID
        );

        // NDR present, then the five blocks
        let blocks = parse_blocks(&body[NDR_HEADER_LEN..]).unwrap();
        let types: Vec<u16> = blocks.iter().map(|b| b.block_type).collect();
        assert_eq!(
            types,
            vec![
                BLOCK_AR_REQ,
                BLOCK_IOCR_REQ,
                BLOCK_IOCR_REQ,
                BLOCK_ALARM_CR_REQ,
                BLOCK_EXPECTED_SUBMODULE
            ]
        );
    }

    #[test]
    fn no_ndr_strategy_omits_the_section() {
        let strategies = ConnectStrategy::default_list();
        let no_ndr = strategies.iter().find(|s| !s.ndr_header).unwrap();
        let slots = slots_8_7();
        let wire = build_connect_request(&params(no_ndr, &slots)).unwrap();
        let (_, body) = parse_request_header(&wire).unwrap();
        // body starts directly with the AR block
        assert_eq!(&body[..2], &BLOCK_AR_REQ.to_be_bytes());
    }

    #[test]
    fn iocr_blocks_carry_spec_lengths_and_frame_ids() {
        let strategies = ConnectStrategy::default_list();
        let slots = slots_8_7();
        let wire = build_connect_request(&params(&strategies[0], &slots)).unwrap();
        let (_, body) = parse_request_header(&wire).unwrap();
        let blocks = parse_blocks(&body[NDR_HEADER_LEN..]).unwrap();

        let iocrs: Vec<&Block<'_>> = blocks
            .iter()
            .filter(|b| b.block_type == BLOCK_IOCR_REQ)
            .collect();
        assert_eq!(iocrs.len(), 2);

        for iocr in iocrs {
            let mut p = FrameParser::new(iocr.payload);
            let iocr_type = p.take_u16_be().unwrap();
            p.skip(2 + 2 + 4).unwrap(); // reference, LT, properties
            let data_length = p.take_u16_be().unwrap();
            let frame_id = p.take_u16_be().unwrap();
            if iocr_type == IOCR_TYPE_INPUT {
                assert_eq!(data_length, 40);
                assert_eq!(frame_id, 0xC002);
            } else {
                assert_eq!(data_length, 28);
                assert_eq!(frame_id, 0xC003);
            }
        }
    }

    #[test]
    fn connect_response_round_trip() {
        let strategies = ConnectStrategy::default_list();
        let slots = slots_8_7();
        let p = params(&strategies[0], &slots);
        let wire = build_connect_request(&p).unwrap();
        let (hdr, _) = parse_request_header(&wire).unwrap();

        let device_mac = MacAddr([0x28, 0x63, 0x36, 0x81, 0x4B, 0x64]);
        let response = build_connect_response(&hdr, p.ar_uuid, 1, device_mac).unwrap();
        let ack = parse_connect_response(&response).unwrap();
        assert_eq!(ack.ar_uuid, p.ar_uuid);
        assert_eq!(ack.session_key, 1);
        assert_eq!(ack.responder_mac, device_mac);
    }

    #[test]
    fn empty_response_reads_as_rejection() {
        let strategies = ConnectStrategy::default_list();
        let slots = slots_8_7();
        let p = params(&strategies[0], &slots);
        let wire = build_connect_request(&p).unwrap();
        let (hdr, _) = parse_request_header(&wire).unwrap();

        let response = build_empty_response(&hdr).unwrap();
        assert!(matches!(
            parse_connect_response(&response),
            Err(CoreError::ConnectRejected(_))
        ));
    }

    #[test]
    fn write_and_control_round_trips() {
        let ar_uuid = Uuid::new_v4();
        let activity = Uuid::new_v4();

        let write = build_write_request(ar_uuid, activity, 2).unwrap();
        let (hdr, _) = parse_request_header(&write).unwrap();
        assert_eq!(hdr.opnum, OpNum::Write as u16);
        let response = build_write_response(&hdr, ar_uuid).unwrap();
        parse_write_response(&response).unwrap();

        let control =
            build_control_request(ar_uuid, activity, 3, 1, CONTROL_APPLICATION_READY).unwrap();
        let (hdr, body) = parse_request_header(&control).unwrap();
        assert_eq!(hdr.opnum, OpNum::Control as u16);
        let blocks = parse_blocks(&body).unwrap();
        assert_eq!(blocks[0].block_type, BLOCK_CONTROL_REQ);
        let response = build_control_response(&hdr, ar_uuid, 1).unwrap();
        parse_control_response(&response).unwrap();
    }

    #[test]
    fn inventory_read_round_trip() {
        let ar_uuid = Uuid::new_v4();
        let request = build_read_inventory_request(ar_uuid, Uuid::new_v4(), 4).unwrap();
        let (hdr, _) = parse_request_header(&request).unwrap();
        assert_eq!(hdr.opnum, OpNum::Read as u16);

        let slots = slots_8_7();
        let response = build_read_inventory_response(&hdr, &slots).unwrap();
        let parsed = parse_read_inventory_response(&response).unwrap();
        assert_eq!(parsed.len(), 15);
        assert_eq!(parsed[0].kind, SlotKind::Sensor);
        assert_eq!(parsed[0].slot_number, 1);
        assert_eq!(parsed[8].kind, SlotKind::Actuator);
        assert_eq!(parsed[8].slot_number, 9);
    }
}
