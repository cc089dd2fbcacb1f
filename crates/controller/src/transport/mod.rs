//! Socket seam between the codec and the OS
//!
//! The discovery and cyclic engines speak `L2Transport`; the connection
//! manager speaks `RpcTransport`. Production code binds an AF_PACKET
//! socket and UDP 34964; tests swap in the loopback pair.

pub mod loopback;
pub mod packet;
pub mod rpc_socket;

use crate::error::CoreResult;
use crate::wire::MacAddr;
use async_trait::async_trait;
use std::net::SocketAddrV4;
use std::time::Duration;

/// Raw Ethernet send/receive on one bound interface.
///
/// Receive blocks the calling thread; callers run it from a dedicated
/// blocking task.
pub trait L2Transport: Send + Sync {
    fn send_frame(&self, frame: &[u8]) -> CoreResult<()>;

    /// Wait up to `timeout` for the next frame. `Ok(None)` on timeout.
    fn recv_frame(&self, timeout: Duration) -> CoreResult<Option<Vec<u8>>>;

    /// Hardware address of the bound interface
    fn mac(&self) -> MacAddr;
}

/// One acyclic request/response exchange over UDP 34964.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Send `request` to `peer` and wait for its answer.
    /// `Ok(None)` when the peer stays silent past `timeout`.
    async fn call(
        &self,
        peer: SocketAddrV4,
        request: Vec<u8>,
        timeout: Duration,
    ) -> CoreResult<Option<Vec<u8>>>;
}

pub use loopback::{loopback_pair, LoopbackLink, ScriptedRpc};
pub use packet::PacketSocket;
pub use rpc_socket::{RpcSocket, PNIO_RPC_PORT};
