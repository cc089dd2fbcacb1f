//! UDP transport for acyclic DCE/RPC exchanges

use crate::error::{CoreError, CoreResult};
use crate::transport::RpcTransport;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// The one UDP port PROFINET uses for DCP/RPC
pub const PNIO_RPC_PORT: u16 = 34964;

const MAX_DATAGRAM: usize = 4096;

/// Shared RPC socket bound to 34964. Calls are serialized so a slow
/// peer cannot interleave its answer into another exchange.
pub struct RpcSocket {
    socket: UdpSocket,
    call_lock: Mutex<()>,
}

impl RpcSocket {
    pub async fn bind() -> CoreResult<Self> {
        Self::bind_to(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, PNIO_RPC_PORT)).await
    }

    pub async fn bind_to(addr: SocketAddrV4) -> CoreResult<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| CoreError::InterfaceUnavailable(format!("udp bind {addr}: {e}")))?;
        Ok(Self {
            socket,
            call_lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl RpcTransport for RpcSocket {
    async fn call(
        &self,
        peer: SocketAddrV4,
        request: Vec<u8>,
        timeout: Duration,
    ) -> CoreResult<Option<Vec<u8>>> {
        let _guard = self.call_lock.lock().await;

        self.socket
            .send_to(&request, peer)
            .await
            .map_err(|e| CoreError::Protocol(format!("rpc send to {peer}: {e}")))?;
        debug!("rpc request: {} bytes to {}", request.len(), peer);

        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match tokio::time::timeout(remaining, self.socket.recv_from(&mut buf)).await {
                Err(_) => return Ok(None),
                Ok(Err(e)) => {
                    return Err(CoreError::Protocol(format!("rpc recv: {e}")));
                }
                Ok(Ok((len, from))) => {
                    if from != std::net::SocketAddr::V4(peer) {
                        warn!("dropping stray datagram from {}", from);
                        continue;
                    }
                    return Ok(Some(buf[..len].to_vec()));
                }
            }
        }
    }
}
