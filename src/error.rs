//! Error types for KNXnet/IP operations.
//!
//! Every failure in the crate is a [`KnxError`]. Each variant wraps a small
//! struct holding an internal kind and a backtrace captured at construction
//! (framing errors skip the capture, they sit on the receive hot path).
//! Callers classify errors through the `is_*` predicates instead of matching
//! on the private kinds.

use core::fmt;
use std::backtrace::Backtrace;
use std::io;

use crate::protocol::frame::Body;

/// Result type alias for KNX operations.
pub type Result<T> = core::result::Result<T, KnxError>;

// =============================================================================
// Error Kind Enums (Internal)
// =============================================================================

/// Framing error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProtocolErrorKind {
    BufferTooSmall,
    InvalidHeader,
    UnsupportedVersion,
    UnsupportedServiceType,
    InvalidMessageCode,
    InvalidStructure,
    LengthMismatch,
    PayloadTooLarge,
}

/// Range and argument violations (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueErrorKind {
    OutOfRange,
    IllegalArgument,
}

/// Connection lifecycle error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionErrorKind {
    AlreadyStarted,
    NotStarted,
    DiscoveryNotReceived,
    DescriptionNotReceived,
    TunnelingNotSupported,
    ChannelIdNotReceived,
    WrongChannelId,
    ConnectionLost,
}

/// Transport error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportErrorKind {
    Bind,
    Send,
    Receive,
    Socket,
}

/// Addressing error variants (internal)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddressingErrorKind {
    InvalidIndividualAddress,
    InvalidGroupAddress,
    OutOfRange,
}

// =============================================================================
// Main Error Type
// =============================================================================

/// KNX error type returned by all fallible operations of this crate.
#[derive(Debug)]
pub enum KnxError {
    /// Malformed, truncated or inconsistent frame bytes
    Protocol(ProtocolError),
    /// A value outside its legal range or an inconsistent argument
    Value(ValueError),
    /// Connection lifecycle failures (discovery, connect, channel id, ...)
    Connection(ConnectionError),
    /// Socket level failures
    Transport(TransportError),
    /// Invalid address notation or components
    Addressing(AddressingError),
}

// =============================================================================
// Structured Error Types
// =============================================================================

/// Framing error
#[derive(Debug)]
pub struct ProtocolError {
    kind: ProtocolErrorKind,
    backtrace: Backtrace,
}

impl ProtocolError {
    const fn new(kind: ProtocolErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::disabled(),
        }
    }

    /// Check if the buffer ended before the structure did
    pub fn is_buffer_too_small(&self) -> bool {
        matches!(self.kind, ProtocolErrorKind::BufferTooSmall)
    }

    /// Check if a declared length disagrees with the actual data
    pub fn is_length_mismatch(&self) -> bool {
        matches!(self.kind, ProtocolErrorKind::LengthMismatch)
    }

    /// Check if the service type identifier is unknown
    pub fn is_unsupported_service_type(&self) -> bool {
        matches!(self.kind, ProtocolErrorKind::UnsupportedServiceType)
    }
}

/// Range or argument violation with a short description of the offending value
#[derive(Debug)]
pub struct ValueError {
    kind: ValueErrorKind,
    message: String,
    backtrace: Backtrace,
}

impl ValueError {
    fn new(kind: ValueErrorKind, message: String) -> Self {
        Self {
            kind,
            message,
            backtrace: Backtrace::capture(),
        }
    }

    /// Description of the rejected value
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Connection lifecycle error.
///
/// The not-received variants carry the last request sent and the last
/// response received (if any) so callers can log what the peer saw.
#[derive(Debug)]
pub struct ConnectionError {
    kind: ConnectionErrorKind,
    request: Option<Box<Body>>,
    response: Option<Box<Body>>,
    backtrace: Backtrace,
}

impl ConnectionError {
    fn new(kind: ConnectionErrorKind) -> Self {
        Self {
            kind,
            request: None,
            response: None,
            backtrace: Backtrace::capture(),
        }
    }

    fn with_exchange(mut self, request: Option<Body>, response: Option<Body>) -> Self {
        self.request = request.map(Box::new);
        self.response = response.map(Box::new);
        self
    }

    /// Last request sent before giving up
    pub fn request(&self) -> Option<&Body> {
        self.request.as_deref()
    }

    /// Last response received before giving up
    pub fn response(&self) -> Option<&Body> {
        self.response.as_deref()
    }
}

/// Socket level error wrapping the underlying I/O error
#[derive(Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    source: io::Error,
    backtrace: Backtrace,
}

impl TransportError {
    fn new(kind: TransportErrorKind, source: io::Error) -> Self {
        Self {
            kind,
            source,
            backtrace: Backtrace::capture(),
        }
    }

    /// The I/O error reported by the operating system
    pub fn io_error(&self) -> &io::Error {
        &self.source
    }

    /// Check if the error happened while binding a socket
    pub fn is_bind(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Bind)
    }
}

/// Addressing error
#[derive(Debug)]
pub struct AddressingError {
    kind: AddressingErrorKind,
    backtrace: Backtrace,
}

impl AddressingError {
    fn new(kind: AddressingErrorKind) -> Self {
        Self {
            kind,
            backtrace: Backtrace::capture(),
        }
    }

    /// Check if an address component is out of range
    pub fn is_out_of_range(&self) -> bool {
        matches!(self.kind, AddressingErrorKind::OutOfRange)
    }
}

// =============================================================================
// Convenience Constructors for KnxError
// =============================================================================

impl KnxError {
    // Framing errors
    #[inline]
    pub(crate) const fn buffer_too_small() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::BufferTooSmall))
    }

    #[inline]
    pub(crate) const fn invalid_header() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::InvalidHeader))
    }

    #[inline]
    pub(crate) const fn unsupported_version() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::UnsupportedVersion))
    }

    #[inline]
    pub(crate) const fn unsupported_service_type() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::UnsupportedServiceType))
    }

    #[inline]
    pub(crate) const fn invalid_message_code() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::InvalidMessageCode))
    }

    #[inline]
    pub(crate) const fn invalid_structure() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::InvalidStructure))
    }

    #[inline]
    pub(crate) const fn length_mismatch() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::LengthMismatch))
    }

    #[inline]
    pub(crate) const fn payload_too_large() -> Self {
        Self::Protocol(ProtocolError::new(ProtocolErrorKind::PayloadTooLarge))
    }

    // Value errors
    pub(crate) fn out_of_range(message: impl Into<String>) -> Self {
        Self::Value(ValueError::new(ValueErrorKind::OutOfRange, message.into()))
    }

    pub(crate) fn illegal_argument(message: impl Into<String>) -> Self {
        Self::Value(ValueError::new(ValueErrorKind::IllegalArgument, message.into()))
    }

    // Connection errors
    pub(crate) fn already_started() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::AlreadyStarted))
    }

    pub(crate) fn not_started() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::NotStarted))
    }

    pub(crate) fn discovery_not_received(request: Option<Body>) -> Self {
        Self::Connection(
            ConnectionError::new(ConnectionErrorKind::DiscoveryNotReceived)
                .with_exchange(request, None),
        )
    }

    pub(crate) fn description_not_received(request: Option<Body>) -> Self {
        Self::Connection(
            ConnectionError::new(ConnectionErrorKind::DescriptionNotReceived)
                .with_exchange(request, None),
        )
    }

    pub(crate) fn tunneling_not_supported(request: Body, response: Body) -> Self {
        Self::Connection(
            ConnectionError::new(ConnectionErrorKind::TunnelingNotSupported)
                .with_exchange(Some(request), Some(response)),
        )
    }

    pub(crate) fn channel_id_not_received(request: Option<Body>, response: Option<Body>) -> Self {
        Self::Connection(
            ConnectionError::new(ConnectionErrorKind::ChannelIdNotReceived)
                .with_exchange(request, response),
        )
    }

    pub(crate) fn wrong_channel_id(response: Body) -> Self {
        Self::Connection(
            ConnectionError::new(ConnectionErrorKind::WrongChannelId)
                .with_exchange(None, Some(response)),
        )
    }

    pub(crate) fn connection_lost() -> Self {
        Self::Connection(ConnectionError::new(ConnectionErrorKind::ConnectionLost))
    }

    // Transport errors
    pub(crate) fn bind_failed(source: io::Error) -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::Bind, source))
    }

    pub(crate) fn send_failed(source: io::Error) -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::Send, source))
    }

    pub(crate) fn receive_failed(source: io::Error) -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::Receive, source))
    }

    pub(crate) fn socket_error(source: io::Error) -> Self {
        Self::Transport(TransportError::new(TransportErrorKind::Socket, source))
    }

    // Addressing errors
    pub(crate) fn invalid_group_address() -> Self {
        Self::Addressing(AddressingError::new(AddressingErrorKind::InvalidGroupAddress))
    }

    pub(crate) fn invalid_individual_address() -> Self {
        Self::Addressing(AddressingError::new(
            AddressingErrorKind::InvalidIndividualAddress,
        ))
    }

    pub(crate) fn address_out_of_range() -> Self {
        Self::Addressing(AddressingError::new(AddressingErrorKind::OutOfRange))
    }
}

// =============================================================================
// Classification
// =============================================================================

impl KnxError {
    fn connection_kind(&self) -> Option<ConnectionErrorKind> {
        match self {
            Self::Connection(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Malformed or truncated frame data
    pub fn is_framing(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// A value outside its legal range (NPDU length, hop count, sequence, ...)
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, Self::Value(e) if e.kind == ValueErrorKind::OutOfRange)
    }

    /// An argument inconsistent with the operation (address type, channel selection, ...)
    pub fn is_illegal_argument(&self) -> bool {
        matches!(self, Self::Value(e) if e.kind == ValueErrorKind::IllegalArgument)
    }

    /// `start()` was called on a running client
    pub fn is_already_started(&self) -> bool {
        self.connection_kind() == Some(ConnectionErrorKind::AlreadyStarted)
    }

    /// Operation needs a started client
    pub fn is_not_started(&self) -> bool {
        self.connection_kind() == Some(ConnectionErrorKind::NotStarted)
    }

    /// No search response arrived within the retry budget
    pub fn is_discovery_not_received(&self) -> bool {
        self.connection_kind() == Some(ConnectionErrorKind::DiscoveryNotReceived)
    }

    /// No description response arrived within the retry budget
    pub fn is_description_not_received(&self) -> bool {
        self.connection_kind() == Some(ConnectionErrorKind::DescriptionNotReceived)
    }

    /// The remote device does not offer the tunneling service family
    pub fn is_tunneling_not_supported(&self) -> bool {
        self.connection_kind() == Some(ConnectionErrorKind::TunnelingNotSupported)
    }

    /// The connect handshake did not yield a channel id
    pub fn is_channel_id_not_received(&self) -> bool {
        self.connection_kind() == Some(ConnectionErrorKind::ChannelIdNotReceived)
    }

    /// A frame carried a channel id other than the session's
    pub fn is_wrong_channel_id(&self) -> bool {
        self.connection_kind() == Some(ConnectionErrorKind::WrongChannelId)
    }

    /// Keep-alive detected a dead session
    pub fn is_connection_lost(&self) -> bool {
        self.connection_kind() == Some(ConnectionErrorKind::ConnectionLost)
    }

    /// Socket level failure
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Captured backtrace, when one was recorded
    pub fn backtrace(&self) -> &Backtrace {
        match self {
            Self::Protocol(e) => &e.backtrace,
            Self::Value(e) => &e.backtrace,
            Self::Connection(e) => &e.backtrace,
            Self::Transport(e) => &e.backtrace,
            Self::Addressing(e) => &e.backtrace,
        }
    }
}

// =============================================================================
// Display / Error Implementation
// =============================================================================

impl fmt::Display for KnxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnxError::Protocol(e) => write!(f, "Protocol error: {:?}", e.kind),
            KnxError::Value(e) => write!(f, "Value error ({:?}): {}", e.kind, e.message),
            KnxError::Connection(e) => write!(f, "Connection error: {:?}", e.kind),
            KnxError::Transport(e) => write!(f, "Transport error ({:?}): {}", e.kind, e.source),
            KnxError::Addressing(e) => write!(f, "Addressing error: {:?}", e.kind),
        }
    }
}

impl std::error::Error for KnxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KnxError::Transport(e) => Some(&e.source),
            _ => None,
        }
    }
}

impl From<io::Error> for KnxError {
    fn from(source: io::Error) -> Self {
        Self::socket_error(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_error_classification() {
        let err = KnxError::out_of_range("hop count 9");
        assert!(err.is_out_of_range());
        assert!(!err.is_illegal_argument());
        assert!(err.to_string().contains("hop count 9"));

        let err = KnxError::illegal_argument("no channel");
        assert!(err.is_illegal_argument());
    }

    #[test]
    fn test_connection_error_carries_exchange() {
        let err = KnxError::channel_id_not_received(None, None);
        assert!(err.is_channel_id_not_received());
        match err {
            KnxError::Connection(e) => {
                assert!(e.request().is_none());
                assert!(e.response().is_none());
            }
            _ => panic!("expected connection error"),
        }
    }

    #[test]
    fn test_transport_error_source() {
        let err = KnxError::send_failed(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(err.is_transport());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_framing_errors() {
        assert!(KnxError::buffer_too_small().is_framing());
        assert!(KnxError::length_mismatch().is_framing());
        assert!(!KnxError::connection_lost().is_framing());
    }
}
