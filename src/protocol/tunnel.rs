//! Tunneling and routing bodies.
//!
//! Tunneling carries one cEMI telegram per request over the unicast data
//! channel and expects a `TUNNELING_ACK` with the same channel id and
//! sequence number. Routing carries telegrams over multicast without any
//! acknowledgement, with two flow-control notifications (`ROUTING_LOST_MESSAGE`
//! and `ROUTING_BUSY`).
//!
//! ```text
//! TUNNELING_REQUEST                 TUNNELING_ACK
//! ┌────────────────────────┐        ┌────────────────────────┐
//! │ Connection Header (4)  │        │ Connection Header (4)  │
//! │  - Structure Len 0x04  │        │  - Structure Len 0x04  │
//! │  - Channel ID          │        │  - Channel ID          │
//! │  - Sequence Counter    │        │  - Sequence Counter    │
//! │  - Reserved            │        │  - Status              │
//! ├────────────────────────┤        └────────────────────────┘
//! │ cEMI frame             │
//! └────────────────────────┘
//! ```

use core::sync::atomic::{AtomicU8, Ordering};

use crate::error::{KnxError, Result};
use crate::protocol::cemi::Cemi;
use crate::protocol::constants::E_NO_ERROR;
use crate::protocol::frame::require;

/// Connection header shared by tunneling requests and acknowledgements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHeader {
    pub channel_id: u8,
    pub sequence: u8,
    /// Reserved (0) on requests, status code on acknowledgements
    pub status: u8,
}

impl ConnectionHeader {
    pub const SIZE: usize = 4;

    pub const fn new(channel_id: u8, sequence: u8, status: u8) -> Self {
        Self {
            channel_id,
            sequence,
            status,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        require(data, Self::SIZE)?;
        if usize::from(data[0]) != Self::SIZE {
            return Err(KnxError::invalid_structure());
        }
        Ok(Self::new(data[1], data[2], data[3]))
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        require(buf, Self::SIZE)?;
        buf[0] = Self::SIZE as u8;
        buf[1] = self.channel_id;
        buf[2] = self.sequence;
        buf[3] = self.status;
        Ok(Self::SIZE)
    }
}

/// `TUNNELING_REQUEST` service (0x0420)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelingRequest {
    pub header: ConnectionHeader,
    pub cemi: Cemi,
}

impl TunnelingRequest {
    pub const fn new(channel_id: u8, sequence: u8, cemi: Cemi) -> Self {
        Self {
            header: ConnectionHeader::new(channel_id, sequence, 0),
            cemi,
        }
    }

    pub fn encoded_len(&self) -> usize {
        ConnectionHeader::SIZE + self.cemi.encoded_len()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = ConnectionHeader::parse(data)?;
        let cemi = Cemi::parse(&data[ConnectionHeader::SIZE..])?;
        Ok(Self { header, cemi })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.header.encode(buf)?;
        Ok(n + self.cemi.encode(&mut buf[n..])?)
    }
}

/// `TUNNELING_ACK` service (0x0421)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelingAck {
    pub header: ConnectionHeader,
}

impl TunnelingAck {
    pub const fn new(channel_id: u8, sequence: u8, status: u8) -> Self {
        Self {
            header: ConnectionHeader::new(channel_id, sequence, status),
        }
    }

    pub const fn is_ok(&self) -> bool {
        self.header.status == E_NO_ERROR
    }

    pub const fn encoded_len(&self) -> usize {
        ConnectionHeader::SIZE
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(Self {
            header: ConnectionHeader::parse(data)?,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.header.encode(buf)
    }
}

/// `ROUTING_INDICATION` service (0x0530)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingIndication {
    pub cemi: Cemi,
}

impl RoutingIndication {
    pub const fn new(cemi: Cemi) -> Self {
        Self { cemi }
    }

    pub fn encoded_len(&self) -> usize {
        self.cemi.encoded_len()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(Self {
            cemi: Cemi::parse(data)?,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.cemi.encode(buf)
    }
}

/// `ROUTING_LOST_MESSAGE` service (0x0531)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingLostMessage {
    pub device_state: u8,
    /// Telegrams the router dropped since the last notification
    pub lost_messages: u16,
}

impl RoutingLostMessage {
    const SIZE: usize = 4;

    pub const fn encoded_len(&self) -> usize {
        Self::SIZE
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        require(data, Self::SIZE)?;
        if usize::from(data[0]) != Self::SIZE {
            return Err(KnxError::invalid_structure());
        }
        Ok(Self {
            device_state: data[1],
            lost_messages: u16::from_be_bytes([data[2], data[3]]),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        require(buf, Self::SIZE)?;
        buf[0] = Self::SIZE as u8;
        buf[1] = self.device_state;
        buf[2..4].copy_from_slice(&self.lost_messages.to_be_bytes());
        Ok(Self::SIZE)
    }
}

/// `ROUTING_BUSY` service (0x0532)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingBusy {
    pub device_state: u8,
    /// Time senders should pause, in milliseconds
    pub wait_time_ms: u16,
    pub control: u16,
}

impl RoutingBusy {
    const SIZE: usize = 6;

    pub const fn encoded_len(&self) -> usize {
        Self::SIZE
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        require(data, Self::SIZE)?;
        if usize::from(data[0]) != Self::SIZE {
            return Err(KnxError::invalid_structure());
        }
        Ok(Self {
            device_state: data[1],
            wait_time_ms: u16::from_be_bytes([data[2], data[3]]),
            control: u16::from_be_bytes([data[4], data[5]]),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        require(buf, Self::SIZE)?;
        buf[0] = Self::SIZE as u8;
        buf[1] = self.device_state;
        buf[2..4].copy_from_slice(&self.wait_time_ms.to_be_bytes());
        buf[4..6].copy_from_slice(&self.control.to_be_bytes());
        Ok(Self::SIZE)
    }
}

/// Outbound tunneling sequence counter, wrapping `255 -> 0`.
///
/// Safe to share between threads: every caller of [`next`](Self::next)
/// receives a distinct value until the counter wraps.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: AtomicU8,
}

impl SequenceCounter {
    pub const fn new() -> Self {
        Self {
            next: AtomicU8::new(0),
        }
    }

    /// Take the next sequence number
    pub fn next(&self) -> u8 {
        // fetch_add wraps on overflow
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// Sequence number the next call to `next` returns
    pub fn peek(&self) -> u8 {
        self.next.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.next.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::GroupAddress;

    #[test]
    fn test_tunneling_request_layout() {
        let cemi = Cemi::group_write(GroupAddress::from(0x0A03), &[0x01]).unwrap();
        let req = TunnelingRequest::new(0x15, 0x07, cemi);
        let mut buf = [0u8; 64];
        let n = req.encode(&mut buf).unwrap();
        assert_eq!(n, req.encoded_len());
        assert_eq!(&buf[..4], &[0x04, 0x15, 0x07, 0x00]);
        assert_eq!(buf[4], 0x11);
        assert_eq!(TunnelingRequest::parse(&buf[..n]).unwrap(), req);
    }

    #[test]
    fn test_tunneling_ack() {
        let data = [0x04, 0x15, 0x07, 0x00];
        let ack = TunnelingAck::parse(&data).unwrap();
        assert_eq!(ack.header.channel_id, 0x15);
        assert_eq!(ack.header.sequence, 0x07);
        assert!(ack.is_ok());
        assert!(!TunnelingAck::new(1, 2, 0x21).is_ok());
    }

    #[test]
    fn test_connection_header_bad_length() {
        assert!(ConnectionHeader::parse(&[0x05, 0x01, 0x02, 0x00]).is_err());
        assert!(ConnectionHeader::parse(&[0x04, 0x01]).is_err());
    }

    #[test]
    fn test_routing_flow_control() {
        let lost = RoutingLostMessage::parse(&[0x04, 0x01, 0x00, 0x05]).unwrap();
        assert_eq!(lost.lost_messages, 5);

        let busy = RoutingBusy {
            device_state: 0,
            wait_time_ms: 100,
            control: 0,
        };
        let mut buf = [0u8; 6];
        busy.encode(&mut buf).unwrap();
        assert_eq!(buf, [0x06, 0x00, 0x00, 0x64, 0x00, 0x00]);
        assert_eq!(RoutingBusy::parse(&buf).unwrap(), busy);
    }

    #[test]
    fn test_sequence_counter_wraps() {
        let counter = SequenceCounter::new();
        for expected in 0..=255u8 {
            assert_eq!(counter.next(), expected);
        }
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.peek(), 1);
        counter.reset();
        assert_eq!(counter.next(), 0);
    }

    #[test]
    fn test_sequence_counter_concurrent_wrap() {
        let counter = SequenceCounter::new();
        let mut seen = [0usize; 256];
        std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| s.spawn(|| (0..64).map(|_| counter.next()).collect::<Vec<_>>()))
                .collect();
            for worker in workers {
                for sequence in worker.join().unwrap() {
                    seen[usize::from(sequence)] += 1;
                }
            }
        });
        // 512 numbers: two full laps, every value handed out exactly twice
        assert!(seen.iter().all(|&n| n == 2));
        assert_eq!(counter.peek(), 0);
    }
}
