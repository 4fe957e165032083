//! In-memory transport for testing communicators without a network.
//!
//! A [`MockTransport`] records every datagram sent through it and hands out
//! queued datagrams to the receive thread. An optional responder closure is
//! run on every send, which lets a test script a peer (for example a gateway
//! that acknowledges tunneling requests).
//!
//! ## Example
//!
//! ```rust
//! use knx_link::net::{MockTransport, Transport};
//!
//! let gateway = "192.168.1.10:3671".parse().unwrap();
//! let mock = MockTransport::new();
//! mock.add_response(vec![0x06, 0x10, 0x02, 0x08, 0x00, 0x08, 0x01, 0x00]);
//!
//! mock.send_to(&[0xAA, 0xBB], gateway)?;
//! assert_eq!(mock.sent_packets(), vec![(vec![0xAA, 0xBB], gateway)]);
//!
//! let mut buf = [0u8; 16];
//! let (n, from) = mock.recv_from(&mut buf)?.unwrap();
//! assert_eq!(n, 8);
//! assert_eq!(from, gateway);
//! # Ok::<(), knx_link::KnxError>(())
//! ```

use core::fmt;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::Result;
use crate::net::transport::Transport;
use crate::utility::{poll_until, POLL_INTERVAL};

type Datagram = (Vec<u8>, SocketAddr);
type Responder = Box<dyn FnMut(&[u8], SocketAddr) -> Vec<Datagram> + Send>;

const DEFAULT_PEER: ([u8; 4], u16) = ([192, 168, 1, 10], 3671);
const DEFAULT_LOCAL: ([u8; 4], u16) = ([192, 168, 1, 100], 50000);

/// Mock transport for exercising KNX communication without real sockets.
///
/// This mock transport allows you to:
/// - Queue datagrams that will be returned by `recv_from()`
/// - Inspect datagrams sent via `send_to()`
/// - Script a peer that answers each datagram sent
pub struct MockTransport {
    inbound: Mutex<VecDeque<Datagram>>,
    sent: Mutex<Vec<Datagram>>,
    responder: Mutex<Option<Responder>>,
    local: SocketAddr,
    recv_timeout: Duration,
    closed: AtomicBool,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("local", &self.local)
            .field("pending", &self.pending_responses())
            .field("sent", &lock(&self.sent).len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    /// Mock bound to `192.168.1.100:50000` with a 20 ms receive timeout
    pub fn new() -> Self {
        Self::with_local_addr(SocketAddr::from(DEFAULT_LOCAL))
    }

    pub fn with_local_addr(local: SocketAddr) -> Self {
        Self {
            inbound: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            local,
            recv_timeout: Duration::from_millis(20),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a datagram from the default peer `192.168.1.10:3671`.
    ///
    /// Datagrams are returned in FIFO order.
    pub fn add_response(&self, data: Vec<u8>) {
        self.add_response_from(data, SocketAddr::from(DEFAULT_PEER));
    }

    /// Queue a datagram with a specific source address
    pub fn add_response_from(&self, data: Vec<u8>, from: SocketAddr) {
        lock(&self.inbound).push_back((data, from));
    }

    /// Run `responder` on every datagram sent; whatever it returns is queued
    /// for the receive side.
    pub fn set_responder(
        &self,
        responder: impl FnMut(&[u8], SocketAddr) -> Vec<Datagram> + Send + 'static,
    ) {
        *lock(&self.responder) = Some(Box::new(responder));
    }

    /// Copy of every `(data, destination)` pair sent so far
    pub fn sent_packets(&self) -> Vec<Datagram> {
        lock(&self.sent).clone()
    }

    pub fn last_sent(&self) -> Option<Datagram> {
        lock(&self.sent).last().cloned()
    }

    /// Forget the sent history
    pub fn clear_sent(&self) {
        lock(&self.sent).clear();
    }

    pub fn clear_responses(&self) {
        lock(&self.inbound).clear();
    }

    pub fn has_responses(&self) -> bool {
        !lock(&self.inbound).is_empty()
    }

    pub fn pending_responses(&self) -> usize {
        lock(&self.inbound).len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for MockTransport {
    fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<()> {
        lock(&self.sent).push((data.to_vec(), addr));
        let replies = lock(&self.responder)
            .as_mut()
            .map(|respond| respond(data, addr))
            .unwrap_or_default();
        lock(&self.inbound).extend(replies);
        Ok(())
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        if self.is_closed() {
            return Ok(None);
        }
        let next = poll_until(self.recv_timeout, POLL_INTERVAL, || {
            lock(&self.inbound).pop_front()
        });
        Ok(next.map(|(data, from)| {
            let len = data.len().min(buf.len());
            buf[..len].copy_from_slice(&data[..len]);
            (len, from)
        }))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.clear_responses();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> SocketAddr {
        SocketAddr::from(DEFAULT_PEER)
    }

    #[test]
    fn test_mock_send_receive() {
        let mock = MockTransport::new();
        mock.add_response(vec![0x01, 0x02, 0x03]);

        mock.send_to(&[0xAA, 0xBB], gateway()).unwrap();
        assert_eq!(mock.sent_packets(), vec![(vec![0xAA, 0xBB], gateway())]);

        let mut buf = [0u8; 10];
        let (n, from) = mock.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], &[0x01, 0x02, 0x03]);
        assert_eq!(from, gateway());
    }

    #[test]
    fn test_mock_no_response_times_out() {
        let mock = MockTransport::new();
        let mut buf = [0u8; 10];
        assert!(mock.recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_mock_fifo_order() {
        let mock = MockTransport::new();
        mock.add_response(vec![0x01]);
        mock.add_response(vec![0x02]);
        mock.add_response(vec![0x03]);

        let mut buf = [0u8; 10];
        for expected in 1..=3u8 {
            mock.recv_from(&mut buf).unwrap().unwrap();
            assert_eq!(buf[0], expected);
        }
        assert!(!mock.has_responses());
    }

    #[test]
    fn test_mock_responder() {
        let mock = MockTransport::new();
        mock.set_responder(|data, from| vec![(data.iter().rev().copied().collect(), from)]);

        mock.send_to(&[1, 2, 3], gateway()).unwrap();
        assert_eq!(mock.pending_responses(), 1);

        let mut buf = [0u8; 10];
        let (n, _) = mock.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], &[3, 2, 1]);
    }

    #[test]
    fn test_mock_close() {
        let mock = MockTransport::new();
        mock.add_response(vec![0x01]);
        mock.close();
        assert!(mock.is_closed());

        let mut buf = [0u8; 10];
        assert!(mock.recv_from(&mut buf).unwrap().is_none());
    }
}
