//! Frame codec - builds and parses Ethernet/DCP/RPC/RT frames
//!
//! Everything is encoded field by field through the buffer layer;
//! endianness is explicit at every call site and DREP-dependent only
//! inside the RPC header.

pub mod buffer;
pub mod dcp;
pub mod eth;
pub mod rpc;
pub mod rt;
pub mod slots;

pub use buffer::{FrameBuilder, FrameParser};
pub use dcp::{DcpIdentifyRequest, DcpIdentifyResponse};
pub use eth::{EthHeader, MacAddr, ETHERTYPE_PROFINET, ETH_MIN_FRAME_LEN};
pub use rpc::{NdrHeader, OpNum, RpcHeader, PNIO_DEVICE_INTERFACE_UUID};
pub use rt::{build_rt_frame, parse_rt_frame, RtFrame, RTC1_BASE};
pub use slots::{
    pack_actuator, pack_sensor, unpack_actuator, unpack_sensor, ActuatorCommand, ActuatorOutput,
    Iops, Quality, ACTUATOR_SLOT_SIZE, SENSOR_SLOT_SIZE,
};
