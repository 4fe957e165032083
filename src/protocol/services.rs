//! KNXnet/IP core service bodies: search, description, connect,
//! connection-state and disconnect.
//!
//! Each body knows how to `parse` itself from the bytes following the
//! KNXnet/IP header and how to `encode` itself into a caller supplied buffer.
//! Wrapping a body into a [`Frame`](crate::protocol::Frame) adds the header.
//!
//! ## Protocol Flow
//!
//! ```text
//! Client                          Gateway
//!   |                                |
//!   |------- SEARCH_REQUEST -------->|  (multicast)
//!   |<------ SEARCH_RESPONSE --------|
//!   |                                |
//!   |----- DESCRIPTION_REQUEST ----->|
//!   |<---- DESCRIPTION_RESPONSE -----|
//!   |                                |
//!   |------- CONNECT_REQUEST ------->|
//!   |<------ CONNECT_RESPONSE -------|
//!   |                                |
//!   |------ TUNNELING_REQUEST ------>|
//!   |<------ TUNNELING_ACK ----------|
//!   |                                |
//!   |--- CONNECTIONSTATE_REQUEST --->|  (keep-alive)
//!   |<-- CONNECTIONSTATE_RESPONSE ---|
//!   |                                |
//!   |------ DISCONNECT_REQUEST ----->|
//!   |<----- DISCONNECT_RESPONSE -----|
//! ```

use crate::addressing::IndividualAddress;
use crate::error::{KnxError, Result};
use crate::protocol::constants::{E_NO_ERROR, TUNNEL_CONNECTION, TUNNEL_LINKLAYER};
use crate::protocol::dib::DeviceDescription;
use crate::protocol::frame::{require, Hpai};

/// `SEARCH_REQUEST` service (0x0201)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchRequest {
    /// Endpoint the search responses should be sent to
    pub discovery_endpoint: Hpai,
}

impl SearchRequest {
    pub const fn new(discovery_endpoint: Hpai) -> Self {
        Self { discovery_endpoint }
    }

    pub const fn encoded_len(&self) -> usize {
        Hpai::SIZE
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(Self::new(Hpai::parse(data)?))
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.discovery_endpoint.encode(buf)
    }
}

/// `SEARCH_RESPONSE` service (0x0202)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    /// Control endpoint of the responding device
    pub control_endpoint: Hpai,
    pub description: DeviceDescription,
}

impl SearchResponse {
    pub fn encoded_len(&self) -> usize {
        Hpai::SIZE + self.description.encoded_len()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let control_endpoint = Hpai::parse(data)?;
        let description = DeviceDescription::parse(&data[Hpai::SIZE..])?;
        Ok(Self {
            control_endpoint,
            description,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let offset = self.control_endpoint.encode(buf)?;
        Ok(offset + self.description.encode(&mut buf[offset..])?)
    }
}

/// `DESCRIPTION_REQUEST` service (0x0203)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptionRequest {
    /// Endpoint the description response should be sent to
    pub control_endpoint: Hpai,
}

impl DescriptionRequest {
    pub const fn new(control_endpoint: Hpai) -> Self {
        Self { control_endpoint }
    }

    pub const fn encoded_len(&self) -> usize {
        Hpai::SIZE
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(Self::new(Hpai::parse(data)?))
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.control_endpoint.encode(buf)
    }
}

/// `DESCRIPTION_RESPONSE` service (0x0204)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionResponse {
    pub description: DeviceDescription,
}

impl DescriptionResponse {
    pub fn encoded_len(&self) -> usize {
        self.description.encoded_len()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        Ok(Self {
            description: DeviceDescription::parse(data)?,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        self.description.encode(buf)
    }
}

/// Connection Request Information (CRI)
///
/// ```text
/// [len=4][connection type][knx layer][reserved]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequestInfo {
    /// Connection type (`TUNNEL_CONNECTION` = 0x04)
    pub connection_type: u8,
    /// KNX layer (`TUNNEL_LINKLAYER` = 0x02)
    pub knx_layer: u8,
}

impl ConnectionRequestInfo {
    pub const SIZE: usize = 4;

    /// CRI for a tunnel link layer connection
    pub const fn tunnel_link_layer() -> Self {
        Self {
            connection_type: TUNNEL_CONNECTION,
            knx_layer: TUNNEL_LINKLAYER,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        require(buf, Self::SIZE)?;
        buf[0] = Self::SIZE as u8;
        buf[1] = self.connection_type;
        buf[2] = self.knx_layer;
        buf[3] = 0x00;
        Ok(Self::SIZE)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        require(data, Self::SIZE)?;
        if usize::from(data[0]) != Self::SIZE {
            return Err(KnxError::invalid_structure());
        }
        Ok(Self {
            connection_type: data[1],
            knx_layer: data[2],
        })
    }
}

/// Connection Response Data Block (CRD)
///
/// For tunnel connections the CRD carries the individual address the gateway
/// assigned to this tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionResponseData {
    pub connection_type: u8,
    pub individual_address: IndividualAddress,
}

impl ConnectionResponseData {
    pub const SIZE: usize = 4;

    pub const fn tunnel(individual_address: IndividualAddress) -> Self {
        Self {
            connection_type: TUNNEL_CONNECTION,
            individual_address,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        require(buf, Self::SIZE)?;
        buf[0] = Self::SIZE as u8;
        buf[1] = self.connection_type;
        buf[2..4].copy_from_slice(&self.individual_address.to_bytes());
        Ok(Self::SIZE)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        require(data, Self::SIZE)?;
        if usize::from(data[0]) != Self::SIZE {
            return Err(KnxError::invalid_structure());
        }
        Ok(Self {
            connection_type: data[1],
            individual_address: IndividualAddress::from_bytes([data[2], data[3]]),
        })
    }
}

/// `CONNECT_REQUEST` service (0x0205)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Control endpoint (for connection management)
    pub control_endpoint: Hpai,
    /// Data endpoint (for tunneling data)
    pub data_endpoint: Hpai,
    pub cri: ConnectionRequestInfo,
}

impl ConnectRequest {
    /// Tunnel link layer connect request
    pub const fn new(control_endpoint: Hpai, data_endpoint: Hpai) -> Self {
        Self {
            control_endpoint,
            data_endpoint,
            cri: ConnectionRequestInfo::tunnel_link_layer(),
        }
    }

    pub const fn encoded_len(&self) -> usize {
        2 * Hpai::SIZE + ConnectionRequestInfo::SIZE
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        require(data, 2 * Hpai::SIZE + ConnectionRequestInfo::SIZE)?;
        Ok(Self {
            control_endpoint: Hpai::parse(data)?,
            data_endpoint: Hpai::parse(&data[Hpai::SIZE..])?,
            cri: ConnectionRequestInfo::parse(&data[2 * Hpai::SIZE..])?,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut offset = self.control_endpoint.encode(buf)?;
        offset += self.data_endpoint.encode(&mut buf[offset..])?;
        offset += self.cri.encode(&mut buf[offset..])?;
        Ok(offset)
    }
}

/// `CONNECT_RESPONSE` service (0x0206)
///
/// A rejected connect (status other than `E_NO_ERROR`) may end right after
/// the status byte, so data endpoint and CRD are optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Communication channel ID assigned by the server
    pub channel_id: u8,
    /// Status code (0 = OK)
    pub status: u8,
    /// Data endpoint of the server
    pub data_endpoint: Option<Hpai>,
    pub crd: Option<ConnectionResponseData>,
}

impl ConnectResponse {
    /// Successful tunnel connect response
    pub const fn accepted(channel_id: u8, data_endpoint: Hpai, address: IndividualAddress) -> Self {
        Self {
            channel_id,
            status: E_NO_ERROR,
            data_endpoint: Some(data_endpoint),
            crd: Some(ConnectionResponseData::tunnel(address)),
        }
    }

    /// Rejected connect response carrying only channel id and status
    pub const fn rejected(status: u8) -> Self {
        Self {
            channel_id: 0,
            status,
            data_endpoint: None,
            crd: None,
        }
    }

    pub const fn is_ok(&self) -> bool {
        self.status == E_NO_ERROR
    }

    pub const fn encoded_len(&self) -> usize {
        let mut len = 2;
        if self.data_endpoint.is_some() {
            len += Hpai::SIZE;
            if self.crd.is_some() {
                len += ConnectionResponseData::SIZE;
            }
        }
        len
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        require(data, 2)?;
        let channel_id = data[0];
        let status = data[1];

        let (data_endpoint, crd) = if data.len() > 2 {
            let hpai = Hpai::parse(&data[2..])?;
            let crd_start = 2 + Hpai::SIZE;
            let crd = if data.len() > crd_start {
                Some(ConnectionResponseData::parse(&data[crd_start..])?)
            } else {
                None
            };
            (Some(hpai), crd)
        } else {
            (None, None)
        };

        Ok(Self {
            channel_id,
            status,
            data_endpoint,
            crd,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        require(buf, 2)?;
        buf[0] = self.channel_id;
        buf[1] = self.status;
        let mut offset = 2;
        if let Some(hpai) = &self.data_endpoint {
            offset += hpai.encode(&mut buf[offset..])?;
            if let Some(crd) = &self.crd {
                offset += crd.encode(&mut buf[offset..])?;
            }
        }
        Ok(offset)
    }
}

/// Body shared by connection-state and disconnect requests:
/// `[channel id][reserved][control endpoint HPAI]`
fn parse_channel_request(data: &[u8]) -> Result<(u8, Hpai)> {
    require(data, 2 + Hpai::SIZE)?;
    Ok((data[0], Hpai::parse(&data[2..])?))
}

fn encode_channel_request(channel_id: u8, endpoint: &Hpai, buf: &mut [u8]) -> Result<usize> {
    require(buf, 2 + Hpai::SIZE)?;
    buf[0] = channel_id;
    buf[1] = 0x00;
    Ok(2 + endpoint.encode(&mut buf[2..])?)
}

/// Body shared by connection-state and disconnect responses:
/// `[channel id][status]`
fn parse_channel_response(data: &[u8]) -> Result<(u8, u8)> {
    require(data, 2)?;
    Ok((data[0], data[1]))
}

fn encode_channel_response(channel_id: u8, status: u8, buf: &mut [u8]) -> Result<usize> {
    require(buf, 2)?;
    buf[0] = channel_id;
    buf[1] = status;
    Ok(2)
}

/// `CONNECTIONSTATE_REQUEST` service (0x0207)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateRequest {
    pub channel_id: u8,
    pub control_endpoint: Hpai,
}

impl ConnectionStateRequest {
    pub const fn new(channel_id: u8, control_endpoint: Hpai) -> Self {
        Self {
            channel_id,
            control_endpoint,
        }
    }

    pub const fn encoded_len(&self) -> usize {
        2 + Hpai::SIZE
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let (channel_id, control_endpoint) = parse_channel_request(data)?;
        Ok(Self::new(channel_id, control_endpoint))
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_channel_request(self.channel_id, &self.control_endpoint, buf)
    }
}

/// `CONNECTIONSTATE_RESPONSE` service (0x0208)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateResponse {
    pub channel_id: u8,
    /// Status code (0 = connection alive)
    pub status: u8,
}

impl ConnectionStateResponse {
    pub const fn new(channel_id: u8, status: u8) -> Self {
        Self { channel_id, status }
    }

    pub const fn is_ok(&self) -> bool {
        self.status == E_NO_ERROR
    }

    pub const fn encoded_len(&self) -> usize {
        2
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let (channel_id, status) = parse_channel_response(data)?;
        Ok(Self::new(channel_id, status))
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_channel_response(self.channel_id, self.status, buf)
    }
}

/// `DISCONNECT_REQUEST` service (0x0209)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectRequest {
    pub channel_id: u8,
    pub control_endpoint: Hpai,
}

impl DisconnectRequest {
    pub const fn new(channel_id: u8, control_endpoint: Hpai) -> Self {
        Self {
            channel_id,
            control_endpoint,
        }
    }

    pub const fn encoded_len(&self) -> usize {
        2 + Hpai::SIZE
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let (channel_id, control_endpoint) = parse_channel_request(data)?;
        Ok(Self::new(channel_id, control_endpoint))
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_channel_request(self.channel_id, &self.control_endpoint, buf)
    }
}

/// `DISCONNECT_RESPONSE` service (0x020A)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectResponse {
    pub channel_id: u8,
    pub status: u8,
}

impl DisconnectResponse {
    pub const fn new(channel_id: u8, status: u8) -> Self {
        Self { channel_id, status }
    }

    pub const fn is_ok(&self) -> bool {
        self.status == E_NO_ERROR
    }

    pub const fn encoded_len(&self) -> usize {
        2
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let (channel_id, status) = parse_channel_response(data)?;
        Ok(Self::new(channel_id, status))
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        encode_channel_response(self.channel_id, self.status, buf)
    }
}
