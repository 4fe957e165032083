//! Traffic counters.
//!
//! Incremented by the receive threads and the send paths; read through a
//! [`StatisticsSnapshot`] copy.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::constants::ServiceType;

/// Live counters, shared through an `Arc`
#[derive(Debug, Default)]
pub struct Statistics {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    search_requests: AtomicU64,
    search_responses: AtomicU64,
    description_requests: AtomicU64,
    description_responses: AtomicU64,
    connect_requests: AtomicU64,
    connect_responses: AtomicU64,
    connection_state_requests: AtomicU64,
    connection_state_responses: AtomicU64,
    disconnect_requests: AtomicU64,
    disconnect_responses: AtomicU64,
    tunneling_requests: AtomicU64,
    tunneling_acks: AtomicU64,
    routing_indications: AtomicU64,
    routing_lost_messages: AtomicU64,
    routing_busy: AtomicU64,
    errors: AtomicU64,
}

/// Point in time copy of [`Statistics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatisticsSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub search_requests: u64,
    pub search_responses: u64,
    pub description_requests: u64,
    pub description_responses: u64,
    pub connect_requests: u64,
    pub connect_responses: u64,
    pub connection_state_requests: u64,
    pub connection_state_responses: u64,
    pub disconnect_requests: u64,
    pub disconnect_responses: u64,
    pub tunneling_requests: u64,
    pub tunneling_acks: u64,
    pub routing_indications: u64,
    pub routing_lost_messages: u64,
    pub routing_busy: u64,
    pub errors: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, service_type: ServiceType) -> &AtomicU64 {
        match service_type {
            ServiceType::SearchRequest => &self.search_requests,
            ServiceType::SearchResponse => &self.search_responses,
            ServiceType::DescriptionRequest => &self.description_requests,
            ServiceType::DescriptionResponse => &self.description_responses,
            ServiceType::ConnectRequest => &self.connect_requests,
            ServiceType::ConnectResponse => &self.connect_responses,
            ServiceType::ConnectionStateRequest => &self.connection_state_requests,
            ServiceType::ConnectionStateResponse => &self.connection_state_responses,
            ServiceType::DisconnectRequest => &self.disconnect_requests,
            ServiceType::DisconnectResponse => &self.disconnect_responses,
            ServiceType::TunnelingRequest => &self.tunneling_requests,
            ServiceType::TunnelingAck => &self.tunneling_acks,
            ServiceType::RoutingIndication => &self.routing_indications,
            ServiceType::RoutingLostMessage => &self.routing_lost_messages,
            ServiceType::RoutingBusy => &self.routing_busy,
        }
    }

    pub fn record_incoming(&self, service_type: ServiceType, bytes: usize) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.counter(service_type).fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outgoing(&self, service_type: ServiceType, bytes: usize) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.counter(service_type).fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of frames of one service type seen in either direction
    pub fn count(&self, service_type: ServiceType) -> u64 {
        self.counter(service_type).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatisticsSnapshot {
            frames_in: load(&self.frames_in),
            frames_out: load(&self.frames_out),
            bytes_in: load(&self.bytes_in),
            bytes_out: load(&self.bytes_out),
            search_requests: load(&self.search_requests),
            search_responses: load(&self.search_responses),
            description_requests: load(&self.description_requests),
            description_responses: load(&self.description_responses),
            connect_requests: load(&self.connect_requests),
            connect_responses: load(&self.connect_responses),
            connection_state_requests: load(&self.connection_state_requests),
            connection_state_responses: load(&self.connection_state_responses),
            disconnect_requests: load(&self.disconnect_requests),
            disconnect_responses: load(&self.disconnect_responses),
            tunneling_requests: load(&self.tunneling_requests),
            tunneling_acks: load(&self.tunneling_acks),
            routing_indications: load(&self.routing_indications),
            routing_lost_messages: load(&self.routing_lost_messages),
            routing_busy: load(&self.routing_busy),
            errors: load(&self.errors),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.frames_in,
            &self.frames_out,
            &self.bytes_in,
            &self.bytes_out,
            &self.errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for service_type in ServiceType::ALL {
            self.counter(service_type).store(0, Ordering::Relaxed);
        }
    }
}
