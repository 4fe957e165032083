//! KNXnet/IP frame parsing and encoding.
//!
//! ## Frame Structure
//!
//! All KNXnet/IP frames follow this structure:
//!
//! ```text
//! ┌─────────────────────────────┐
//! │  Header (6 bytes)           │
//! │  - Header Length: 0x06      │
//! │  - Protocol Version: 0x10   │
//! │  - Service Type: 2 bytes    │
//! │  - Total Length: 2 bytes    │
//! ├─────────────────────────────┤
//! │  Body (variable)            │
//! │  - Service-specific data    │
//! └─────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use knx_link::protocol::{Body, Frame, Hpai, SearchRequest, ServiceType};
//!
//! let frame = Frame::new(SearchRequest::new(Hpai::new([192, 168, 1, 10], 40000)));
//! let bytes = frame.to_bytes().unwrap();
//! assert_eq!(&bytes[..6], &[0x06, 0x10, 0x02, 0x01, 0x00, 0x0E]);
//!
//! let decoded = Frame::decode(&bytes).unwrap();
//! assert_eq!(decoded.service_type(), ServiceType::SearchRequest);
//! assert!(matches!(decoded.body(), Body::SearchRequest(_)));
//! ```

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::error::{KnxError, Result};
use crate::protocol::constants::{
    ServiceType, HEADER_SIZE_10, IPV4_UDP, KNXNETIP_VERSION_10, MAX_FRAME_SIZE,
};
use crate::protocol::services::{
    ConnectRequest, ConnectResponse, ConnectionStateRequest, ConnectionStateResponse,
    DescriptionRequest, DescriptionResponse, DisconnectRequest, DisconnectResponse,
    SearchRequest, SearchResponse,
};
use crate::protocol::tunnel::{
    RoutingBusy, RoutingIndication, RoutingLostMessage, TunnelingAck, TunnelingRequest,
};

/// Encoded frame bytes
pub type FrameBuffer = heapless::Vec<u8, MAX_FRAME_SIZE>;

/// Fail with a framing error unless `data` holds at least `needed` bytes.
#[inline(always)]
pub(crate) fn require(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        return Err(KnxError::buffer_too_small());
    }
    Ok(())
}

/// KNXnet/IP frame header (6 bytes)
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Header Len   │ Protocol Ver │  Service Type ID    │
/// │   (1 byte)   │   (1 byte)   │     (2 bytes)       │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │           Total Length (2 bytes)                   │
/// └────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnxnetIpHeader {
    /// Service type identifier
    pub service_type: ServiceType,
    /// Total length of frame (header + body)
    pub total_length: u16,
}

impl KnxnetIpHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 6;

    /// Create a header for a body of the given length
    pub const fn new(service_type: ServiceType, body_length: u16) -> Self {
        Self {
            service_type,
            total_length: Self::SIZE as u16 + body_length,
        }
    }

    /// Parse a header from a byte slice
    ///
    /// # Errors
    ///
    /// Returns a framing error if the buffer is too small, the header length
    /// or protocol version is wrong, or the service type is unknown.
    #[inline]
    pub fn parse(data: &[u8]) -> Result<Self> {
        require(data, Self::SIZE)?;

        if data[0] != HEADER_SIZE_10 {
            return Err(KnxError::invalid_header());
        }
        if data[1] != KNXNETIP_VERSION_10 {
            return Err(KnxError::unsupported_version());
        }

        let service_type = ServiceType::from_u16(u16::from_be_bytes([data[2], data[3]]))
            .ok_or_else(KnxError::unsupported_service_type)?;
        let total_length = u16::from_be_bytes([data[4], data[5]]);

        Ok(Self {
            service_type,
            total_length,
        })
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        require(buf, Self::SIZE)?;

        buf[0] = HEADER_SIZE_10;
        buf[1] = KNXNETIP_VERSION_10;
        buf[2..4].copy_from_slice(&self.service_type.to_u16().to_be_bytes());
        buf[4..6].copy_from_slice(&self.total_length.to_be_bytes());

        Ok(Self::SIZE)
    }

    /// Expected body length
    pub const fn body_length(&self) -> u16 {
        self.total_length.saturating_sub(Self::SIZE as u16)
    }
}

/// Host Protocol Address Information (HPAI)
///
/// Endpoint descriptor telling the peer where to send replies.
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Structure Len│ Host Protocol│   IP Address        │
/// │   (1 byte)   │   (1 byte)   │   (4 bytes IPv4)    │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │                Port (2 bytes)                      │
/// └────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hpai {
    /// IPv4 address
    pub ip: Ipv4Addr,
    /// UDP port
    pub port: u16,
}

impl Hpai {
    /// Size of HPAI structure for IPv4
    pub const SIZE: usize = 8;

    /// `0.0.0.0:0`, the route-back endpoint used behind NAT: the peer
    /// replies to the source address of the datagram.
    pub const UNSPECIFIED: Self = Self {
        ip: Ipv4Addr::UNSPECIFIED,
        port: 0,
    };

    /// Create a new HPAI for IPv4 UDP
    pub const fn new(ip: [u8; 4], port: u16) -> Self {
        Self {
            ip: Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]),
            port,
        }
    }

    /// True for the NAT route-back endpoint
    pub fn is_unspecified(&self) -> bool {
        self.ip.is_unspecified() && self.port == 0
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }

    /// Address replies should go to: the HPAI itself, or `fallback` (the
    /// datagram source) when the HPAI is the NAT route-back endpoint.
    pub fn reply_addr(&self, fallback: SocketAddr) -> SocketAddr {
        if self.ip.is_unspecified() || self.port == 0 {
            fallback
        } else {
            SocketAddr::V4(self.socket_addr())
        }
    }

    /// Parse HPAI from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        require(data, Self::SIZE)?;

        if usize::from(data[0]) != Self::SIZE || data[1] != IPV4_UDP {
            return Err(KnxError::invalid_structure());
        }

        Ok(Self {
            ip: Ipv4Addr::new(data[2], data[3], data[4], data[5]),
            port: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    /// Encode HPAI into bytes
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        require(buf, Self::SIZE)?;

        buf[0] = Self::SIZE as u8;
        buf[1] = IPV4_UDP;
        buf[2..6].copy_from_slice(&self.ip.octets());
        buf[6..8].copy_from_slice(&self.port.to_be_bytes());

        Ok(Self::SIZE)
    }
}

impl From<SocketAddrV4> for Hpai {
    fn from(addr: SocketAddrV4) -> Self {
        Self {
            ip: *addr.ip(),
            port: addr.port(),
        }
    }
}

impl core::fmt::Display for Hpai {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Frame body, one variant per supported service type
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    SearchRequest(SearchRequest),
    SearchResponse(SearchResponse),
    DescriptionRequest(DescriptionRequest),
    DescriptionResponse(DescriptionResponse),
    ConnectRequest(ConnectRequest),
    ConnectResponse(ConnectResponse),
    ConnectionStateRequest(ConnectionStateRequest),
    ConnectionStateResponse(ConnectionStateResponse),
    DisconnectRequest(DisconnectRequest),
    DisconnectResponse(DisconnectResponse),
    TunnelingRequest(TunnelingRequest),
    TunnelingAck(TunnelingAck),
    RoutingIndication(RoutingIndication),
    RoutingLostMessage(RoutingLostMessage),
    RoutingBusy(RoutingBusy),
}

/// Dispatch one expression over every body variant
macro_rules! each_body {
    ($body:expr, $inner:ident => $e:expr) => {
        match $body {
            Body::SearchRequest($inner) => $e,
            Body::SearchResponse($inner) => $e,
            Body::DescriptionRequest($inner) => $e,
            Body::DescriptionResponse($inner) => $e,
            Body::ConnectRequest($inner) => $e,
            Body::ConnectResponse($inner) => $e,
            Body::ConnectionStateRequest($inner) => $e,
            Body::ConnectionStateResponse($inner) => $e,
            Body::DisconnectRequest($inner) => $e,
            Body::DisconnectResponse($inner) => $e,
            Body::TunnelingRequest($inner) => $e,
            Body::TunnelingAck($inner) => $e,
            Body::RoutingIndication($inner) => $e,
            Body::RoutingLostMessage($inner) => $e,
            Body::RoutingBusy($inner) => $e,
        }
    };
}

macro_rules! body_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Body {
                fn from(body: $variant) -> Self {
                    Body::$variant(body)
                }
            }
        )*
    };
}

body_from!(
    SearchRequest,
    SearchResponse,
    DescriptionRequest,
    DescriptionResponse,
    ConnectRequest,
    ConnectResponse,
    ConnectionStateRequest,
    ConnectionStateResponse,
    DisconnectRequest,
    DisconnectResponse,
    TunnelingRequest,
    TunnelingAck,
    RoutingIndication,
    RoutingLostMessage,
    RoutingBusy,
);

impl Body {
    /// Service type identifier of this body
    pub const fn service_type(&self) -> ServiceType {
        match self {
            Self::SearchRequest(_) => ServiceType::SearchRequest,
            Self::SearchResponse(_) => ServiceType::SearchResponse,
            Self::DescriptionRequest(_) => ServiceType::DescriptionRequest,
            Self::DescriptionResponse(_) => ServiceType::DescriptionResponse,
            Self::ConnectRequest(_) => ServiceType::ConnectRequest,
            Self::ConnectResponse(_) => ServiceType::ConnectResponse,
            Self::ConnectionStateRequest(_) => ServiceType::ConnectionStateRequest,
            Self::ConnectionStateResponse(_) => ServiceType::ConnectionStateResponse,
            Self::DisconnectRequest(_) => ServiceType::DisconnectRequest,
            Self::DisconnectResponse(_) => ServiceType::DisconnectResponse,
            Self::TunnelingRequest(_) => ServiceType::TunnelingRequest,
            Self::TunnelingAck(_) => ServiceType::TunnelingAck,
            Self::RoutingIndication(_) => ServiceType::RoutingIndication,
            Self::RoutingLostMessage(_) => ServiceType::RoutingLostMessage,
            Self::RoutingBusy(_) => ServiceType::RoutingBusy,
        }
    }

    /// Channel id carried by session-scoped bodies
    pub const fn channel_id(&self) -> Option<u8> {
        match self {
            Self::ConnectResponse(b) => Some(b.channel_id),
            Self::ConnectionStateRequest(b) => Some(b.channel_id),
            Self::ConnectionStateResponse(b) => Some(b.channel_id),
            Self::DisconnectRequest(b) => Some(b.channel_id),
            Self::DisconnectResponse(b) => Some(b.channel_id),
            Self::TunnelingRequest(b) => Some(b.header.channel_id),
            Self::TunnelingAck(b) => Some(b.header.channel_id),
            _ => None,
        }
    }

    /// Tunneling sequence number, for tunneling requests and acks
    pub const fn sequence(&self) -> Option<u8> {
        match self {
            Self::TunnelingRequest(b) => Some(b.header.sequence),
            Self::TunnelingAck(b) => Some(b.header.sequence),
            _ => None,
        }
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        each_body!(self, b => b.encoded_len())
    }

    /// Encode the body (without header) into a byte buffer
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        each_body!(self, b => b.encode(buf))
    }

    /// Decode a body of the given service type
    pub fn parse(service_type: ServiceType, data: &[u8]) -> Result<Self> {
        Ok(match service_type {
            ServiceType::SearchRequest => SearchRequest::parse(data)?.into(),
            ServiceType::SearchResponse => SearchResponse::parse(data)?.into(),
            ServiceType::DescriptionRequest => DescriptionRequest::parse(data)?.into(),
            ServiceType::DescriptionResponse => DescriptionResponse::parse(data)?.into(),
            ServiceType::ConnectRequest => ConnectRequest::parse(data)?.into(),
            ServiceType::ConnectResponse => ConnectResponse::parse(data)?.into(),
            ServiceType::ConnectionStateRequest => ConnectionStateRequest::parse(data)?.into(),
            ServiceType::ConnectionStateResponse => ConnectionStateResponse::parse(data)?.into(),
            ServiceType::DisconnectRequest => DisconnectRequest::parse(data)?.into(),
            ServiceType::DisconnectResponse => DisconnectResponse::parse(data)?.into(),
            ServiceType::TunnelingRequest => TunnelingRequest::parse(data)?.into(),
            ServiceType::TunnelingAck => TunnelingAck::parse(data)?.into(),
            ServiceType::RoutingIndication => RoutingIndication::parse(data)?.into(),
            ServiceType::RoutingLostMessage => RoutingLostMessage::parse(data)?.into(),
            ServiceType::RoutingBusy => RoutingBusy::parse(data)?.into(),
        })
    }
}

/// A complete KNXnet/IP frame: header plus body.
///
/// The header is derived from the body on construction, so a `Frame` built
/// in code always satisfies the total-length invariant.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    header: KnxnetIpHeader,
    body: Body,
}

impl Frame {
    /// Wrap a body into a frame
    pub fn new(body: impl Into<Body>) -> Self {
        let body = body.into();
        let header = KnxnetIpHeader::new(body.service_type(), body.encoded_len() as u16);
        Self { header, body }
    }

    pub const fn header(&self) -> &KnxnetIpHeader {
        &self.header
    }

    pub const fn body(&self) -> &Body {
        &self.body
    }

    pub fn into_body(self) -> Body {
        self.body
    }

    #[inline(always)]
    pub const fn service_type(&self) -> ServiceType {
        self.header.service_type
    }

    /// Encode the frame into a byte buffer
    ///
    /// Returns the number of bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        require(buf, KnxnetIpHeader::SIZE)?;
        let body_len = self.body.encode(&mut buf[KnxnetIpHeader::SIZE..])?;
        let total = KnxnetIpHeader::SIZE + body_len;
        if total > MAX_FRAME_SIZE {
            return Err(KnxError::payload_too_large());
        }

        // Fill total length from what was actually written
        KnxnetIpHeader::new(self.header.service_type, body_len as u16).encode(buf)?;
        Ok(total)
    }

    /// Encode the frame into an owned buffer
    pub fn to_bytes(&self) -> Result<FrameBuffer> {
        let mut buf = [0u8; MAX_FRAME_SIZE];
        let n = self.encode(&mut buf)?;
        FrameBuffer::from_slice(&buf[..n]).map_err(|_| KnxError::payload_too_large())
    }

    /// Decode one datagram into a frame
    ///
    /// # Errors
    ///
    /// Returns a framing error when the header is invalid, the total length
    /// disagrees with the datagram size or the decoded body size, or the
    /// body is malformed.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = KnxnetIpHeader::parse(data)?;
        if usize::from(header.total_length) != data.len() {
            return Err(KnxError::length_mismatch());
        }
        let body_bytes = &data[KnxnetIpHeader::SIZE..];
        let body = Body::parse(header.service_type, body_bytes)?;
        // Trailing bytes after a complete body
        if body.encoded_len() != body_bytes.len() {
            return Err(KnxError::length_mismatch());
        }
        Ok(Self { header, body })
    }
}

impl From<Body> for Frame {
    fn from(body: Body) -> Self {
        Frame::new(body)
    }
}
