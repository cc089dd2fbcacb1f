//! AF_PACKET transport bound to one Ethernet interface

use crate::error::{CoreError, CoreResult};
use crate::transport::L2Transport;
use crate::wire::eth::MAX_FRAME_LEN;
use crate::wire::{MacAddr, ETHERTYPE_PROFINET};
use nix::sys::socket::{setsockopt, sockopt};
use nix::sys::time::TimeVal;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;
use tracing::{debug, info};

/// Raw layer-2 socket filtered to the PROFINET EtherType.
///
/// Send and receive go through the raw fd directly; the socket carries
/// a receive timeout so `recv_frame` can be polled with a deadline.
pub struct PacketSocket {
    fd: OwnedFd,
    ifindex: u32,
    mac: MacAddr,
}

impl PacketSocket {
    /// Open and bind the interface. Fails with `InterfaceUnavailable`
    /// when the interface does not exist or the process lacks
    /// CAP_NET_RAW.
    pub fn open(interface: &str) -> CoreResult<Self> {
        let ifindex = nix::net::if_::if_nametoindex(interface).map_err(|e| {
            CoreError::InterfaceUnavailable(format!("{interface}: {e}"))
        })?;
        let mac = interface_mac(interface)?;

        // AF_PACKET sockets take the EtherType in network byte order.
        let protocol = (ETHERTYPE_PROFINET as u16).to_be() as libc::c_int;
        // SAFETY: plain socket(2) call; the fd is owned immediately below.
        let raw = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol) };
        if raw < 0 {
            return Err(CoreError::InterfaceUnavailable(format!(
                "socket(AF_PACKET): {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: raw is a freshly created, valid fd.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = (ETHERTYPE_PROFINET as u16).to_be();
        addr.sll_ifindex = ifindex as i32;
        // SAFETY: addr is a fully initialized sockaddr_ll for this fd.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(CoreError::InterfaceUnavailable(format!(
                "bind({interface}): {}",
                std::io::Error::last_os_error()
            )));
        }

        info!("bound AF_PACKET socket on {} ({})", interface, mac);
        Ok(Self { fd, ifindex, mac })
    }

    fn set_recv_timeout(&self, timeout: Duration) -> CoreResult<()> {
        let tv = TimeVal::new(timeout.as_secs() as _, timeout.subsec_micros() as _);
        setsockopt(&self.fd, sockopt::ReceiveTimeout, &tv)
            .map_err(|e| CoreError::Fatal(format!("SO_RCVTIMEO: {e}")))
    }
}

impl L2Transport for PacketSocket {
    fn send_frame(&self, frame: &[u8]) -> CoreResult<()> {
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = (ETHERTYPE_PROFINET as u16).to_be();
        addr.sll_ifindex = self.ifindex as i32;
        addr.sll_halen = 6;
        if frame.len() >= 6 {
            addr.sll_addr[..6].copy_from_slice(&frame[..6]);
        }

        // SAFETY: frame points at valid memory of frame.len() bytes and
        // addr is a fully initialized sockaddr_ll.
        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENETDOWN) {
                return Err(CoreError::Fatal(format!("interface down: {err}")));
            }
            return Err(CoreError::InterfaceUnavailable(err.to_string()));
        }
        Ok(())
    }

    fn recv_frame(&self, timeout: Duration) -> CoreResult<Option<Vec<u8>>> {
        self.set_recv_timeout(timeout)?;
        let mut buf = vec![0u8; MAX_FRAME_LEN];
        // SAFETY: buf is a valid writable buffer of MAX_FRAME_LEN bytes.
        let rc = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
                Some(libc::ENETDOWN) => Err(CoreError::Fatal(format!("interface down: {err}"))),
                _ => Err(CoreError::InterfaceUnavailable(err.to_string())),
            };
        }
        buf.truncate(rc as usize);
        debug!("received {} byte frame", buf.len());
        Ok(Some(buf))
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }
}

/// Look up the interface's hardware address
fn interface_mac(interface: &str) -> CoreResult<MacAddr> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| CoreError::InterfaceUnavailable(format!("getifaddrs: {e}")))?;
    for ifaddr in addrs {
        if ifaddr.interface_name != interface {
            continue;
        }
        if let Some(link) = ifaddr.address.as_ref().and_then(|a| a.as_link_addr()) {
            if let Some(octets) = link.addr() {
                return Ok(MacAddr(octets));
            }
        }
    }
    Err(CoreError::InterfaceUnavailable(format!(
        "{interface}: no hardware address"
    )))
}
