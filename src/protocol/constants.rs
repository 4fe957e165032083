//! KNXnet/IP protocol constants, service type identifiers and the static
//! service-type to channel classification.

use std::net::Ipv4Addr;

/// KNXnet/IP protocol version 1.0
pub const KNXNETIP_VERSION_10: u8 = 0x10;

/// Standard KNXnet/IP header length (6 bytes)
pub const HEADER_SIZE_10: u8 = 0x06;

/// Standard UDP port for KNXnet/IP communication
pub const KNXNETIP_DEFAULT_PORT: u16 = 3671;

/// Maximum size of an encoded KNXnet/IP frame
pub const MAX_FRAME_SIZE: usize = 512;

/// Maximum number of APCI data bytes carried by one standard cEMI telegram
pub const MAX_APCI_DATA: usize = 254;

/// Maximum additional info bytes kept from a cEMI frame
pub const MAX_ADDITIONAL_INFO: usize = 64;

/// KNXnet/IP multicast address for discovery and routing
pub const KNXNETIP_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 23, 12);

// =============================================================================
// Service Type Identifiers
// =============================================================================

/// KNXnet/IP service type identifiers handled by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ServiceType {
    // Core services (0x02xx)
    /// `SEARCH_REQUEST` - Device discovery request
    SearchRequest = 0x0201,
    /// `SEARCH_RESPONSE` - Device discovery response
    SearchResponse = 0x0202,
    /// `DESCRIPTION_REQUEST` - Device description request
    DescriptionRequest = 0x0203,
    /// `DESCRIPTION_RESPONSE` - Device description response
    DescriptionResponse = 0x0204,
    /// `CONNECT_REQUEST` - Connection request
    ConnectRequest = 0x0205,
    /// `CONNECT_RESPONSE` - Connection response
    ConnectResponse = 0x0206,
    /// `CONNECTIONSTATE_REQUEST` - Connection state request (heartbeat)
    ConnectionStateRequest = 0x0207,
    /// `CONNECTIONSTATE_RESPONSE` - Connection state response
    ConnectionStateResponse = 0x0208,
    /// `DISCONNECT_REQUEST` - Disconnect request
    DisconnectRequest = 0x0209,
    /// `DISCONNECT_RESPONSE` - Disconnect response
    DisconnectResponse = 0x020A,

    // Tunnelling (0x04xx)
    /// `TUNNELING_REQUEST` - Tunnelling data request
    TunnelingRequest = 0x0420,
    /// `TUNNELING_ACK` - Tunnelling acknowledgement
    TunnelingAck = 0x0421,

    // Routing (0x05xx)
    /// `ROUTING_INDICATION` - Routing indication (multicast)
    RoutingIndication = 0x0530,
    /// `ROUTING_LOST_MESSAGE` - Routing lost message indication
    RoutingLostMessage = 0x0531,
    /// `ROUTING_BUSY` - Routing busy indication
    RoutingBusy = 0x0532,
}

impl ServiceType {
    /// Every service type handled by this crate
    pub const ALL: [Self; 15] = [
        Self::SearchRequest,
        Self::SearchResponse,
        Self::DescriptionRequest,
        Self::DescriptionResponse,
        Self::ConnectRequest,
        Self::ConnectResponse,
        Self::ConnectionStateRequest,
        Self::ConnectionStateResponse,
        Self::DisconnectRequest,
        Self::DisconnectResponse,
        Self::TunnelingRequest,
        Self::TunnelingAck,
        Self::RoutingIndication,
        Self::RoutingLostMessage,
        Self::RoutingBusy,
    ];

    /// Convert a u16 to `ServiceType`
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0201 => Some(Self::SearchRequest),
            0x0202 => Some(Self::SearchResponse),
            0x0203 => Some(Self::DescriptionRequest),
            0x0204 => Some(Self::DescriptionResponse),
            0x0205 => Some(Self::ConnectRequest),
            0x0206 => Some(Self::ConnectResponse),
            0x0207 => Some(Self::ConnectionStateRequest),
            0x0208 => Some(Self::ConnectionStateResponse),
            0x0209 => Some(Self::DisconnectRequest),
            0x020A => Some(Self::DisconnectResponse),
            0x0420 => Some(Self::TunnelingRequest),
            0x0421 => Some(Self::TunnelingAck),
            0x0530 => Some(Self::RoutingIndication),
            0x0531 => Some(Self::RoutingLostMessage),
            0x0532 => Some(Self::RoutingBusy),
            _ => None,
        }
    }

    /// Convert `ServiceType` to u16
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Channel a frame of this service type travels on.
    ///
    /// This table replaces any runtime inspection of frame types: outbound
    /// frames are routed to the first communicator whose role accepts the
    /// channel returned here.
    pub const fn channel(self) -> Channel {
        match self {
            Self::SearchRequest | Self::SearchResponse => Channel::Discovery,
            Self::DescriptionRequest | Self::DescriptionResponse => Channel::Description,
            Self::ConnectRequest
            | Self::ConnectResponse
            | Self::ConnectionStateRequest
            | Self::ConnectionStateResponse
            | Self::DisconnectRequest
            | Self::DisconnectResponse => Channel::Control,
            Self::TunnelingRequest | Self::TunnelingAck => Channel::Data,
            Self::RoutingIndication | Self::RoutingLostMessage | Self::RoutingBusy => {
                Channel::Routing
            }
        }
    }

    /// Response service type answering a request of this type, if any.
    pub const fn response(self) -> Option<Self> {
        match self {
            Self::SearchRequest => Some(Self::SearchResponse),
            Self::DescriptionRequest => Some(Self::DescriptionResponse),
            Self::ConnectRequest => Some(Self::ConnectResponse),
            Self::ConnectionStateRequest => Some(Self::ConnectionStateResponse),
            Self::DisconnectRequest => Some(Self::DisconnectResponse),
            Self::TunnelingRequest => Some(Self::TunnelingAck),
            _ => None,
        }
    }

    /// Service family (high byte of the identifier)
    pub const fn family(self) -> u8 {
        (self.to_u16() >> 8) as u8
    }
}

/// Communication channel classification of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Search request/response
    Discovery,
    /// Description request/response
    Description,
    /// Connect, connection-state and disconnect exchanges
    Control,
    /// Tunneling requests and acknowledgements
    Data,
    /// Routing indications and flow control
    Routing,
}

// =============================================================================
// Service Families
// =============================================================================

/// Service family identifiers advertised in the supported families DIB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceFamily {
    /// KNXnet/IP Core
    Core = 0x02,
    /// Device Management
    DeviceManagement = 0x03,
    /// Tunnelling
    Tunneling = 0x04,
    /// Routing
    Routing = 0x05,
    /// Remote Logging
    RemoteLogging = 0x06,
    /// Remote Configuration and Diagnosis
    RemoteConfiguration = 0x07,
    /// Object Server
    ObjectServer = 0x08,
}

impl ServiceFamily {
    /// Convert u8 to `ServiceFamily`
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(Self::Core),
            0x03 => Some(Self::DeviceManagement),
            0x04 => Some(Self::Tunneling),
            0x05 => Some(Self::Routing),
            0x06 => Some(Self::RemoteLogging),
            0x07 => Some(Self::RemoteConfiguration),
            0x08 => Some(Self::ObjectServer),
            _ => None,
        }
    }

    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

// =============================================================================
// Connection Type Codes
// =============================================================================

/// Connection type for `DEVICE_MGMT_CONNECTION`
pub const DEVICE_MGMT_CONNECTION: u8 = 0x03;

/// Connection type for `TUNNEL_CONNECTION`
pub const TUNNEL_CONNECTION: u8 = 0x04;

/// KNX layer for `TUNNEL_LINKLAYER`
pub const TUNNEL_LINKLAYER: u8 = 0x02;

// =============================================================================
// Host Protocol Codes
// =============================================================================

/// IPv4 UDP protocol
pub const IPV4_UDP: u8 = 0x01;

/// IPv4 TCP protocol
pub const IPV4_TCP: u8 = 0x02;

// =============================================================================
// Description Information Block Types
// =============================================================================

/// DIB carrying device hardware information
pub const DIB_DEVICE_INFO: u8 = 0x01;

/// DIB listing supported service families
pub const DIB_SUPP_SVC_FAMILIES: u8 = 0x02;

// =============================================================================
// Status Codes
// =============================================================================

/// Error code for successful operation
pub const E_NO_ERROR: u8 = 0x00;

/// Error code for unsupported host protocol
pub const E_HOST_PROTOCOL_TYPE: u8 = 0x01;

/// Error code for unsupported protocol version
pub const E_VERSION_NOT_SUPPORTED: u8 = 0x02;

/// Error code for out-of-order sequence number
pub const E_SEQUENCE_NUMBER: u8 = 0x04;

/// Error code for unknown channel id
pub const E_CONNECTION_ID: u8 = 0x21;

/// Error code for connection type not supported
pub const E_CONNECTION_TYPE: u8 = 0x22;

/// Error code for connection option not supported
pub const E_CONNECTION_OPTION: u8 = 0x23;

/// Error code for no more connections available
pub const E_NO_MORE_CONNECTIONS: u8 = 0x24;

/// Error code for data connection error
pub const E_DATA_CONNECTION: u8 = 0x26;

/// Error code for KNX connection error
pub const E_KNX_CONNECTION: u8 = 0x27;

/// Error code for tunnelling layer not supported
pub const E_TUNNELLING_LAYER: u8 = 0x29;

/// Human readable name of a status code, for log lines
pub const fn status_name(code: u8) -> &'static str {
    match code {
        E_NO_ERROR => "E_NO_ERROR",
        E_HOST_PROTOCOL_TYPE => "E_HOST_PROTOCOL_TYPE",
        E_VERSION_NOT_SUPPORTED => "E_VERSION_NOT_SUPPORTED",
        E_SEQUENCE_NUMBER => "E_SEQUENCE_NUMBER",
        E_CONNECTION_ID => "E_CONNECTION_ID",
        E_CONNECTION_TYPE => "E_CONNECTION_TYPE",
        E_CONNECTION_OPTION => "E_CONNECTION_OPTION",
        E_NO_MORE_CONNECTIONS => "E_NO_MORE_CONNECTIONS",
        E_DATA_CONNECTION => "E_DATA_CONNECTION",
        E_KNX_CONNECTION => "E_KNX_CONNECTION",
        E_TUNNELLING_LAYER => "E_TUNNELLING_LAYER",
        _ => "E_UNKNOWN",
    }
}

// =============================================================================
// cEMI Message Codes
// =============================================================================

/// cEMI message codes of the `L_Data` service family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum CemiMessageCode {
    /// `L_Data.req` - Data request
    LDataReq = 0x11,
    /// `L_Data.con` - Data confirmation
    LDataCon = 0x2E,
    /// `L_Data.ind` - Data indication
    LDataInd = 0x29,
}

impl CemiMessageCode {
    /// Convert u8 to `CemiMessageCode`
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x11 => Some(Self::LDataReq),
            0x2E => Some(Self::LDataCon),
            0x29 => Some(Self::LDataInd),
            _ => None,
        }
    }

    /// Convert `CemiMessageCode` to u8
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

// =============================================================================
// KNX Priority
// =============================================================================

/// KNX message priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Priority {
    /// System priority
    System = 0b00,
    /// Normal priority (default)
    #[default]
    Normal = 0b01,
    /// Urgent priority
    Urgent = 0b10,
    /// Low priority
    Low = 0b11,
}

impl Priority {
    /// Convert the two priority bits to `Priority`
    pub const fn from_u8(value: u8) -> Self {
        match value & 0b11 {
            0b00 => Self::System,
            0b01 => Self::Normal,
            0b10 => Self::Urgent,
            _ => Self::Low,
        }
    }

    /// Convert Priority to u8
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_roundtrip_values() {
        for st in ServiceType::ALL {
            assert_eq!(ServiceType::from_u16(st.to_u16()), Some(st));
        }
        assert_eq!(ServiceType::from_u16(0x0950), None);
    }

    #[test]
    fn test_channel_table() {
        assert_eq!(ServiceType::SearchResponse.channel(), Channel::Discovery);
        assert_eq!(ServiceType::DescriptionRequest.channel(), Channel::Description);
        assert_eq!(ServiceType::ConnectionStateRequest.channel(), Channel::Control);
        assert_eq!(ServiceType::TunnelingAck.channel(), Channel::Data);
        assert_eq!(ServiceType::RoutingBusy.channel(), Channel::Routing);
    }

    #[test]
    fn test_response_pairs() {
        assert_eq!(
            ServiceType::ConnectRequest.response(),
            Some(ServiceType::ConnectResponse)
        );
        assert_eq!(
            ServiceType::TunnelingRequest.response(),
            Some(ServiceType::TunnelingAck)
        );
        assert_eq!(ServiceType::RoutingIndication.response(), None);
    }

    #[test]
    fn test_family() {
        assert_eq!(ServiceType::SearchRequest.family(), ServiceFamily::Core.to_u8());
        assert_eq!(
            ServiceType::TunnelingRequest.family(),
            ServiceFamily::Tunneling.to_u8()
        );
    }

    #[test]
    fn test_status_name() {
        assert_eq!(status_name(E_CONNECTION_ID), "E_CONNECTION_ID");
        assert_eq!(status_name(0x7F), "E_UNKNOWN");
    }

    #[test]
    fn test_priority_bits() {
        assert_eq!(Priority::from_u8(0b11), Priority::Low);
        assert_eq!(Priority::from_u8(0b01), Priority::Normal);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
