//! In-memory transports for tests and the device simulator

use crate::error::{CoreError, CoreResult};
use crate::transport::{L2Transport, RpcTransport};
use crate::wire::MacAddr;
use async_trait::async_trait;
use std::net::SocketAddrV4;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

/// One end of a crossed in-memory Ethernet link
pub struct LoopbackLink {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    mac: MacAddr,
}

/// Two connected endpoints: frames sent on one are received on the other
pub fn loopback_pair(mac_a: MacAddr, mac_b: MacAddr) -> (LoopbackLink, LoopbackLink) {
    let (tx_ab, rx_ab) = mpsc::channel();
    let (tx_ba, rx_ba) = mpsc::channel();
    (
        LoopbackLink {
            tx: tx_ab,
            rx: Mutex::new(rx_ba),
            mac: mac_a,
        },
        LoopbackLink {
            tx: tx_ba,
            rx: Mutex::new(rx_ab),
            mac: mac_b,
        },
    )
}

impl L2Transport for LoopbackLink {
    fn send_frame(&self, frame: &[u8]) -> CoreResult<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| CoreError::InterfaceUnavailable("loopback peer gone".to_string()))
    }

    fn recv_frame(&self, timeout: Duration) -> CoreResult<Option<Vec<u8>>> {
        let rx = self.rx.lock().expect("loopback receiver poisoned");
        match rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(CoreError::InterfaceUnavailable("loopback peer gone".to_string()))
            }
        }
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }
}

type RpcHandler = dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync;

/// RPC transport backed by a handler closure playing the device role.
/// Returning `None` simulates a silent peer.
pub struct ScriptedRpc {
    handler: Box<RpcHandler>,
}

impl ScriptedRpc {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
        }
    }
}

#[async_trait]
impl RpcTransport for ScriptedRpc {
    async fn call(
        &self,
        _peer: SocketAddrV4,
        request: Vec<u8>,
        _timeout: Duration,
    ) -> CoreResult<Option<Vec<u8>>> {
        Ok((self.handler)(&request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_cross_the_link() {
        let (a, b) = loopback_pair(
            MacAddr([2, 0, 0, 0, 0, 1]),
            MacAddr([2, 0, 0, 0, 0, 2]),
        );
        a.send_frame(&[1, 2, 3]).unwrap();
        let got = b.recv_frame(Duration::from_millis(50)).unwrap();
        assert_eq!(got, Some(vec![1, 2, 3]));

        // nothing queued in the other direction
        assert_eq!(a.recv_frame(Duration::from_millis(10)).unwrap(), None);
    }

    #[tokio::test]
    async fn scripted_rpc_echoes() {
        let rpc = ScriptedRpc::new(|req| Some(req.to_vec()));
        let peer = "192.168.6.21:34964".parse().unwrap();
        let res = rpc
            .call(peer, vec![9, 9], Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(res, Some(vec![9, 9]));
    }
}
