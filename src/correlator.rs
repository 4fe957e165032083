//! Request/response correlation.
//!
//! The [`EventCorrelator`] holds one [`EventSlot`] per point-to-point exchange
//! kind (search, description, connect, connection-state, disconnect) plus 256
//! tunneling slots indexed by sequence number. A caller registers its request
//! before transmitting it; the receive thread of a communicator records the
//! matching response; the caller then polls its slot until the response shows
//! up or the timeout elapses.
//!
//! Each slot has its own lock, so a tunneling acknowledgement arriving on the
//! data channel never waits for a connection-state response being recorded on
//! the control channel.
//!
//! ```
//! use std::time::Duration;
//! use knx_link::correlator::{EventCorrelator, EventKey};
//! use knx_link::protocol::{Body, ConnectionStateRequest, ConnectionStateResponse, Hpai};
//!
//! let correlator = EventCorrelator::new();
//! let key = correlator.register(&ConnectionStateRequest::new(1, Hpai::UNSPECIFIED).into()).unwrap();
//! assert_eq!(key, EventKey::ConnectionState);
//!
//! correlator.record_response(&ConnectionStateResponse::new(1, 0).into());
//! let response = correlator.await_response(key, Duration::from_millis(50));
//! assert!(matches!(response, Some(Body::ConnectionStateResponse(_))));
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{KnxError, Result};
use crate::protocol::frame::Body;
use crate::utility::{poll_until, POLL_INTERVAL};

/// Number of tunneling slots (one per sequence number)
pub const TUNNELING_SLOTS: usize = 256;

/// Identifies the slot an exchange is correlated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKey {
    Search,
    Description,
    Connect,
    ConnectionState,
    Disconnect,
    /// Tunneling request/ack pair with the given sequence number
    Tunneling(u8),
}

impl EventKey {
    /// Slot a request body is registered in
    pub const fn for_request(body: &Body) -> Option<Self> {
        match body {
            Body::SearchRequest(_) => Some(Self::Search),
            Body::DescriptionRequest(_) => Some(Self::Description),
            Body::ConnectRequest(_) => Some(Self::Connect),
            Body::ConnectionStateRequest(_) => Some(Self::ConnectionState),
            Body::DisconnectRequest(_) => Some(Self::Disconnect),
            Body::TunnelingRequest(b) => Some(Self::Tunneling(b.header.sequence)),
            _ => None,
        }
    }

    /// Slot a response body resolves
    pub const fn for_response(body: &Body) -> Option<Self> {
        match body {
            Body::SearchResponse(_) => Some(Self::Search),
            Body::DescriptionResponse(_) => Some(Self::Description),
            Body::ConnectResponse(_) => Some(Self::Connect),
            Body::ConnectionStateResponse(_) => Some(Self::ConnectionState),
            Body::DisconnectResponse(_) => Some(Self::Disconnect),
            Body::TunnelingAck(b) => Some(Self::Tunneling(b.header.sequence)),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct SlotState {
    request: Option<(Body, Instant)>,
    /// The request was received from the peer rather than sent by us
    inbound: bool,
    responses: Vec<(Body, Instant)>,
}

/// One correlation slot: the outstanding request and its responses
#[derive(Debug)]
pub struct EventSlot {
    state: Mutex<SlotState>,
    /// Later responses append instead of replacing the first one
    multi_response: bool,
}

impl EventSlot {
    fn new(multi_response: bool) -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            multi_response,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an outgoing request and forget any earlier responses
    pub fn register(&self, request: Body) {
        let mut state = self.lock();
        state.request = Some((request, Instant::now()));
        state.inbound = false;
        state.responses.clear();
    }

    /// Store a request the peer sent us
    pub fn register_inbound(&self, request: Body) {
        let mut state = self.lock();
        state.request = Some((request, Instant::now()));
        state.inbound = true;
    }

    /// Store a response; multi-response slots keep every response in
    /// arrival order, single-response slots keep the latest one.
    pub fn record_response(&self, response: Body) {
        let mut state = self.lock();
        if !self.multi_response {
            state.responses.clear();
        }
        state.responses.push((response, Instant::now()));
    }

    pub fn request(&self) -> Option<Body> {
        self.lock().request.as_ref().map(|(body, _)| body.clone())
    }

    pub fn request_time(&self) -> Option<Instant> {
        self.lock().request.as_ref().map(|(_, at)| *at)
    }

    pub fn has_request(&self) -> bool {
        self.lock().request.is_some()
    }

    /// A request was received from the peer (e.g. a server-initiated disconnect)
    pub fn has_inbound_request(&self) -> bool {
        let state = self.lock();
        state.inbound && state.request.is_some()
    }

    /// First recorded response
    pub fn response(&self) -> Option<Body> {
        self.response_at(0)
    }

    pub fn response_time(&self) -> Option<Instant> {
        self.response_time_at(0)
    }

    pub fn response_at(&self, index: usize) -> Option<Body> {
        self.lock().responses.get(index).map(|(body, _)| body.clone())
    }

    pub fn response_time_at(&self, index: usize) -> Option<Instant> {
        self.lock().responses.get(index).map(|(_, at)| *at)
    }

    /// All responses in arrival order
    pub fn responses(&self) -> Vec<Body> {
        self.lock().responses.iter().map(|(body, _)| body.clone()).collect()
    }

    pub fn response_count(&self) -> usize {
        self.lock().responses.len()
    }

    pub fn clear(&self) {
        *self.lock() = SlotState::default();
    }

    /// Wait for the first response, polling every 10 ms
    pub fn await_response(&self, timeout: Duration) -> Option<Body> {
        poll_until(timeout, POLL_INTERVAL, || self.response())
    }
}

/// Shared correlation table, one per client
#[derive(Debug)]
pub struct EventCorrelator {
    search: EventSlot,
    description: EventSlot,
    connect: EventSlot,
    connection_state: EventSlot,
    disconnect: EventSlot,
    tunneling: Box<[EventSlot]>,
}

impl Default for EventCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl EventCorrelator {
    pub fn new() -> Self {
        Self {
            search: EventSlot::new(true),
            description: EventSlot::new(false),
            connect: EventSlot::new(false),
            connection_state: EventSlot::new(false),
            disconnect: EventSlot::new(false),
            tunneling: (0..TUNNELING_SLOTS).map(|_| EventSlot::new(false)).collect(),
        }
    }

    pub fn slot(&self, key: EventKey) -> &EventSlot {
        match key {
            EventKey::Search => &self.search,
            EventKey::Description => &self.description,
            EventKey::Connect => &self.connect,
            EventKey::ConnectionState => &self.connection_state,
            EventKey::Disconnect => &self.disconnect,
            EventKey::Tunneling(sequence) => &self.tunneling[usize::from(sequence)],
        }
    }

    /// Register an outgoing request in its slot
    ///
    /// # Errors
    ///
    /// Illegal argument when `request` is not a correlated request type.
    pub fn register(&self, request: &Body) -> Result<EventKey> {
        let key = EventKey::for_request(request).ok_or_else(|| {
            KnxError::illegal_argument(format!(
                "{:?} is not a correlated request",
                request.service_type()
            ))
        })?;
        self.slot(key).register(request.clone());
        Ok(key)
    }

    /// Record a request received from the peer
    pub fn register_inbound(&self, request: &Body) -> Option<EventKey> {
        let key = EventKey::for_request(request)?;
        self.slot(key).register_inbound(request.clone());
        Some(key)
    }

    /// Record a response in the slot it resolves; returns that slot's key
    pub fn record_response(&self, response: &Body) -> Option<EventKey> {
        let key = EventKey::for_response(response)?;
        self.slot(key).record_response(response.clone());
        Some(key)
    }

    pub fn await_response(&self, key: EventKey, timeout: Duration) -> Option<Body> {
        self.slot(key).await_response(timeout)
    }

    /// Forget every request and response
    pub fn reset(&self) {
        for key in [
            EventKey::Search,
            EventKey::Description,
            EventKey::Connect,
            EventKey::ConnectionState,
            EventKey::Disconnect,
        ] {
            self.slot(key).clear();
        }
        for slot in self.tunneling.iter() {
            slot.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::GroupAddress;
    use crate::protocol::{
        Cemi, DisconnectRequest, Hpai, SearchRequest, TunnelingAck, TunnelingRequest,
    };
    use std::sync::Arc;

    fn tunneling_request(sequence: u8) -> Body {
        let cemi = Cemi::group_read(GroupAddress::from(0x0A03)).unwrap();
        TunnelingRequest::new(1, sequence, cemi).into()
    }

    #[test]
    fn test_tunneling_isolation() {
        let correlator = EventCorrelator::new();
        let key_a = correlator.register(&tunneling_request(5)).unwrap();
        let key_b = correlator.register(&tunneling_request(6)).unwrap();
        assert_eq!(key_a, EventKey::Tunneling(5));

        correlator.record_response(&TunnelingAck::new(1, 6, 0).into());
        assert!(correlator.await_response(key_a, Duration::from_millis(30)).is_none());
        assert!(correlator.await_response(key_b, Duration::ZERO).is_some());
    }

    #[test]
    fn test_timeout_returns_none() {
        let correlator = EventCorrelator::new();
        let start = Instant::now();
        assert!(correlator
            .await_response(EventKey::Connect, Duration::from_millis(100))
            .is_none());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(600));
    }

    #[test]
    fn test_search_keeps_first_response() {
        use crate::protocol::{DeviceDescription, DeviceInfo, SearchResponse, SupportedFamilies};
        use std::net::Ipv4Addr;

        let response = |port| -> Body {
            SearchResponse {
                control_endpoint: Hpai::new([10, 0, 0, 1], port),
                description: DeviceDescription {
                    device: DeviceInfo {
                        medium: 0x02,
                        device_status: 0,
                        individual_address: crate::addressing::IndividualAddress::from(0x1101),
                        project_installation_id: 0,
                        serial_number: [0; 6],
                        multicast_address: Ipv4Addr::UNSPECIFIED,
                        mac_address: [0; 6],
                        friendly_name: String::new(),
                    },
                    families: SupportedFamilies::default(),
                    other: Vec::new(),
                },
            }
            .into()
        };

        let correlator = EventCorrelator::new();
        correlator.register(&SearchRequest::new(Hpai::UNSPECIFIED).into()).unwrap();
        correlator.record_response(&response(1000));
        correlator.record_response(&response(2000));

        let slot = correlator.slot(EventKey::Search);
        assert_eq!(slot.response_count(), 2);
        assert_eq!(slot.response(), Some(response(1000)));
        assert_eq!(slot.response_at(1), Some(response(2000)));
        assert!(slot.response_time().unwrap() <= slot.response_time_at(1).unwrap());
    }

    #[test]
    fn test_register_clears_old_response() {
        let correlator = EventCorrelator::new();
        correlator.register(&tunneling_request(9)).unwrap();
        correlator.record_response(&TunnelingAck::new(1, 9, 0).into());
        correlator.register(&tunneling_request(9)).unwrap();
        assert!(correlator.slot(EventKey::Tunneling(9)).response().is_none());
    }

    #[test]
    fn test_register_rejects_response_types() {
        let correlator = EventCorrelator::new();
        let err = correlator.register(&TunnelingAck::new(1, 1, 0).into()).unwrap_err();
        assert!(err.is_illegal_argument());
    }

    #[test]
    fn test_inbound_disconnect_flag() {
        let correlator = EventCorrelator::new();
        let slot = correlator.slot(EventKey::Disconnect);
        assert!(!slot.has_inbound_request());

        let request: Body = DisconnectRequest::new(3, Hpai::UNSPECIFIED).into();
        correlator.register_inbound(&request);
        assert!(slot.has_inbound_request());

        correlator.register(&request).unwrap();
        assert!(!slot.has_inbound_request());
    }

    #[test]
    fn test_response_from_other_thread() {
        let correlator = Arc::new(EventCorrelator::new());
        let key = correlator.register(&tunneling_request(200)).unwrap();

        let writer = Arc::clone(&correlator);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            writer.record_response(&TunnelingAck::new(1, 200, 0).into());
        });

        let response = correlator.await_response(key, Duration::from_secs(2));
        assert_eq!(response.and_then(|b| b.sequence()), Some(200));
        handle.join().unwrap();
    }
}
