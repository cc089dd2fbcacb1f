//! DCP identify codec (layer-2 discovery)
//!
//! Identify-All requests go to the 01:0E:CF:00:00:00 multicast address
//! with frame ID 0xFEFE; responses come back unicast with 0xFEFF and
//! carry the station name, IP parameters and device identity in TLV
//! blocks.

use crate::error::{CoreError, CoreResult};
use crate::wire::buffer::{FrameBuilder, FrameParser};
use crate::wire::eth::{EthHeader, MacAddr, DCP_IDENTIFY_MULTICAST, ETHERTYPE_PROFINET, ETH_MIN_FRAME_LEN, MAX_FRAME_LEN};
use std::net::Ipv4Addr;

pub const FRAME_ID_DCP_IDENTIFY_REQUEST: u16 = 0xFEFE;
pub const FRAME_ID_DCP_IDENTIFY_RESPONSE: u16 = 0xFEFF;

pub const SERVICE_ID_IDENTIFY: u8 = 5;
pub const SERVICE_TYPE_REQUEST: u8 = 0;
pub const SERVICE_TYPE_RESPONSE_SUCCESS: u8 = 1;

const OPTION_IP: u8 = 1;
const SUBOPTION_IP_PARAMETER: u8 = 2;
const OPTION_DEVICE: u8 = 2;
const SUBOPTION_STATION_NAME: u8 = 2;
const SUBOPTION_DEVICE_ID: u8 = 3;
const OPTION_ALL: u8 = 0xFF;
const SUBOPTION_ALL: u8 = 0xFF;

/// Identify-All request broadcast at the start of a discovery round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcpIdentifyRequest {
    pub xid: u32,
    /// Spreads device answers across the collection window
    pub response_delay: u16,
}

impl DcpIdentifyRequest {
    pub fn encode(&self, src: MacAddr) -> CoreResult<Vec<u8>> {
        let mut b = FrameBuilder::new(MAX_FRAME_LEN);
        EthHeader::profinet(DCP_IDENTIFY_MULTICAST, src).encode(&mut b)?;
        b.put_u16_be(FRAME_ID_DCP_IDENTIFY_REQUEST)?;
        b.put_u8(SERVICE_ID_IDENTIFY)?;
        b.put_u8(SERVICE_TYPE_REQUEST)?;
        b.put_u32_be(self.xid)?;
        b.put_u16_be(self.response_delay)?;
        b.put_u16_be(4)?; // DCPDataLength: one AllSelector block
        b.put_u8(OPTION_ALL)?;
        b.put_u8(SUBOPTION_ALL)?;
        b.put_u16_be(0)?;
        b.pad_to(ETH_MIN_FRAME_LEN)?;
        Ok(b.into_vec())
    }

    pub fn parse(frame: &[u8]) -> CoreResult<Self> {
        let mut p = FrameParser::new(frame);
        let eth = EthHeader::parse(&mut p)?;
        if eth.ethertype != ETHERTYPE_PROFINET {
            return Err(CoreError::Protocol("not a PROFINET frame".to_string()));
        }
        if p.take_u16_be()? != FRAME_ID_DCP_IDENTIFY_REQUEST {
            return Err(CoreError::Protocol("not a DCP identify request".to_string()));
        }
        let service_id = p.take_u8()?;
        let service_type = p.take_u8()?;
        if service_id != SERVICE_ID_IDENTIFY || service_type != SERVICE_TYPE_REQUEST {
            return Err(CoreError::Protocol(format!(
                "unexpected DCP service {service_id}/{service_type}"
            )));
        }
        let xid = p.take_u32_be()?;
        let response_delay = p.take_u16_be()?;
        Ok(Self {
            xid,
            response_delay,
        })
    }
}

/// Everything a device tells us in one identify response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcpIdentifyResponse {
    pub xid: u32,
    pub mac: MacAddr,
    pub station_name: String,
    pub ip: Ipv4Addr,
    pub vendor_id: u16,
    pub device_id: u16,
}

impl DcpIdentifyResponse {
    /// Encode as the device would answer. The controller only parses
    /// this in production; the simulator and tests build it.
    pub fn encode(&self, dst: MacAddr) -> CoreResult<Vec<u8>> {
        let mut b = FrameBuilder::new(MAX_FRAME_LEN);
        EthHeader::profinet(dst, self.mac).encode(&mut b)?;
        b.put_u16_be(FRAME_ID_DCP_IDENTIFY_RESPONSE)?;
        b.put_u8(SERVICE_ID_IDENTIFY)?;
        b.put_u8(SERVICE_TYPE_RESPONSE_SUCCESS)?;
        b.put_u32_be(self.xid)?;
        b.put_u16_be(0)?; // reserved in responses

        let name = self.station_name.as_bytes();
        let name_block = 2 + name.len();
        let ip_block = 2 + 12;
        let id_block = 2 + 4;
        let mut data_len = (4 + name_block) + (4 + ip_block) + (4 + id_block);
        if name.len() % 2 != 0 {
            data_len += 1;
        }
        b.put_u16_be(data_len as u16)?;

        // NameOfStation
        b.put_u8(OPTION_DEVICE)?;
        b.put_u8(SUBOPTION_STATION_NAME)?;
        b.put_u16_be(name_block as u16)?;
        b.put_u16_be(0)?; // BlockInfo
        b.put_bytes(name)?;
        if name.len() % 2 != 0 {
            b.put_u8(0)?;
        }

        // IPParameter: address, netmask, gateway
        b.put_u8(OPTION_IP)?;
        b.put_u8(SUBOPTION_IP_PARAMETER)?;
        b.put_u16_be(ip_block as u16)?;
        b.put_u16_be(0x0001)?; // BlockInfo: IP set
        b.put_bytes(&self.ip.octets())?;
        b.put_bytes(&Ipv4Addr::new(255, 255, 255, 0).octets())?;
        b.put_bytes(&Ipv4Addr::UNSPECIFIED.octets())?;

        // DeviceId
        b.put_u8(OPTION_DEVICE)?;
        b.put_u8(SUBOPTION_DEVICE_ID)?;
        b.put_u16_be(id_block as u16)?;
        b.put_u16_be(0)?;
        b.put_u16_be(self.vendor_id)?;
        b.put_u16_be(self.device_id)?;

        b.pad_to(ETH_MIN_FRAME_LEN)?;
        Ok(b.into_vec())
    }

    /// Parse a frame that may be an identify response. Returns Ok(None)
    /// for unrelated PROFINET frames so the discovery loop can skip
    /// them without counting a parse error.
    pub fn parse(frame: &[u8]) -> CoreResult<Option<Self>> {
        let mut p = FrameParser::new(frame);
        let eth = EthHeader::parse(&mut p)?;
        if eth.ethertype != ETHERTYPE_PROFINET {
            return Ok(None);
        }
        if p.take_u16_be()? != FRAME_ID_DCP_IDENTIFY_RESPONSE {
            return Ok(None);
        }
        let service_id = p.take_u8()?;
        let service_type = p.take_u8()?;
        if service_id != SERVICE_ID_IDENTIFY || service_type != SERVICE_TYPE_RESPONSE_SUCCESS {
            return Ok(None);
        }
        let xid = p.take_u32_be()?;
        p.skip(2)?; // reserved
        let data_len = p.take_u16_be()? as usize;
        if data_len > p.remaining() {
            return Err(CoreError::InvalidField {
                field: "dcp_data_length",
                reason: format!("{data_len} exceeds {} remaining", p.remaining()),
            });
        }

        let mut station_name = None;
        let mut ip = None;
        let mut vendor_id = 0u16;
        let mut device_id = 0u16;

        let mut blocks = FrameParser::new(p.take_bytes(data_len)?);
        while blocks.remaining() >= 4 {
            let option = blocks.take_u8()?;
            let suboption = blocks.take_u8()?;
            let block_len = blocks.take_u16_be()? as usize;
            if block_len < 2 || block_len > blocks.remaining() {
                return Err(CoreError::InvalidField {
                    field: "dcp_block_length",
                    reason: format!("{block_len} exceeds {} remaining", blocks.remaining()),
                });
            }
            blocks.skip(2)?; // BlockInfo
            let data = blocks.take_bytes(block_len - 2)?;
            // blocks are padded to even length
            if block_len % 2 != 0 && blocks.remaining() > 0 {
                blocks.skip(1)?;
            }

            match (option, suboption) {
                (OPTION_DEVICE, SUBOPTION_STATION_NAME) => {
                    let name = std::str::from_utf8(data).map_err(|_| CoreError::InvalidField {
                        field: "station_name",
                        reason: "not valid UTF-8".to_string(),
                    })?;
                    station_name = Some(name.trim_end_matches('\0').to_string());
                }
                (OPTION_IP, SUBOPTION_IP_PARAMETER) => {
                    if data.len() >= 4 {
                        ip = Some(Ipv4Addr::new(data[0], data[1], data[2], data[3]));
                    }
                }
                (OPTION_DEVICE, SUBOPTION_DEVICE_ID) => {
                    if data.len() >= 4 {
                        vendor_id = u16::from_be_bytes([data[0], data[1]]);
                        device_id = u16::from_be_bytes([data[2], data[3]]);
                    }
                }
                _ => {} // unknown blocks are skipped
            }
        }

        let station_name = station_name.ok_or_else(|| CoreError::InvalidField {
            field: "station_name",
            reason: "identify response without NameOfStation block".to_string(),
        })?;
        Ok(Some(Self {
            xid,
            mac: eth.src,
            station_name,
            ip: ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
            vendor_id,
            device_id,
        }))
    }
}
