//! Datagram transport abstraction for KNXnet/IP communication.
//!
//! The [`Transport`] trait is the seam between a
//! [`ChannelCommunicator`](crate::net::ChannelCommunicator) and the network,
//! enabling:
//! - Testability through [`MockTransport`](crate::net::MockTransport)
//! - Unicast and multicast sockets behind one interface
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::net::{Ipv4Addr, SocketAddrV4};
//! use std::time::Duration;
//! use knx_link::net::{Transport, UdpTransport};
//!
//! let transport = UdpTransport::bind(
//!     SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
//!     Duration::from_millis(100),
//! )?;
//! transport.send_to(&[0x06, 0x10], "192.168.1.10:3671".parse().unwrap())?;
//! # Ok::<(), knx_link::KnxError>(())
//! ```

use core::fmt::Debug;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{KnxError, Result};

/// Blocking datagram transport shared between the receive thread and senders.
///
/// Implementations must be usable through `&self` from several threads at
/// once: one thread blocked in [`recv_from`](Self::recv_from) while others
/// call [`send_to`](Self::send_to).
pub trait Transport: Send + Sync + Debug {
    /// Send one datagram
    ///
    /// # Errors
    ///
    /// Transport error if the socket rejects the datagram.
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()>;

    /// Receive one datagram.
    ///
    /// Blocks at most for the transport's receive timeout and returns
    /// `Ok(None)` when nothing arrived in that window.
    fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>>;

    /// Address the transport is bound to
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Release the transport; later receives return immediately.
    ///
    /// Default implementation does nothing: the socket closes when the last
    /// reference is dropped.
    fn close(&self) {}
}

/// UDP socket transport
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind a unicast socket
    ///
    /// # Errors
    ///
    /// Transport error if the address is in use or the timeout cannot be set.
    pub fn bind(local: SocketAddrV4, recv_timeout: Duration) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(KnxError::socket_error)?;
        socket
            .bind(&SocketAddr::V4(local).into())
            .map_err(KnxError::bind_failed)?;
        Self::finish(socket, recv_timeout)
    }

    /// Bind to `group`'s port on all interfaces and join the multicast group
    /// on `interface`.
    ///
    /// Address reuse is enabled so several routing clients can share a host.
    ///
    /// # Errors
    ///
    /// Transport error if binding or joining the group fails.
    pub fn bind_multicast(
        group: SocketAddrV4,
        interface: Ipv4Addr,
        recv_timeout: Duration,
    ) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(KnxError::socket_error)?;
        socket.set_reuse_address(true).map_err(KnxError::socket_error)?;
        let local = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());
        socket
            .bind(&SocketAddr::V4(local).into())
            .map_err(KnxError::bind_failed)?;
        socket
            .join_multicast_v4(group.ip(), &interface)
            .map_err(KnxError::socket_error)?;
        socket
            .set_multicast_loop_v4(true)
            .map_err(KnxError::socket_error)?;
        if !interface.is_unspecified() {
            socket
                .set_multicast_if_v4(&interface)
                .map_err(KnxError::socket_error)?;
        }
        Self::finish(socket, recv_timeout)
    }

    fn finish(socket: Socket, recv_timeout: Duration) -> Result<Self> {
        socket
            .set_read_timeout(Some(recv_timeout))
            .map_err(KnxError::socket_error)?;
        Ok(Self {
            socket: socket.into(),
        })
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        self.socket
            .send_to(data, addr)
            .map(|_| ())
            .map_err(KnxError::send_failed)
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(KnxError::receive_failed(e)),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(KnxError::socket_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
    }

    #[test]
    fn test_send_receive_loopback() {
        let a = UdpTransport::bind(loopback(), Duration::from_millis(200)).unwrap();
        let b = UdpTransport::bind(loopback(), Duration::from_millis(200)).unwrap();

        a.send_to(&[0x06, 0x10], b.local_addr().unwrap()).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], &[0x06, 0x10]);
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn test_receive_timeout_is_none() {
        let t = UdpTransport::bind(loopback(), Duration::from_millis(20)).unwrap();
        let mut buf = [0u8; 16];
        assert!(t.recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_bind_conflict() {
        let a = UdpTransport::bind(loopback(), Duration::from_millis(20)).unwrap();
        let SocketAddr::V4(taken) = a.local_addr().unwrap() else {
            panic!("expected IPv4 address");
        };
        let err = UdpTransport::bind(taken, Duration::from_millis(20)).unwrap_err();
        assert!(err.is_transport());
    }
}
