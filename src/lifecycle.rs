//! Connection lifecycle state machine.
//!
//! A [`Session`] moves through
//!
//! ```text
//! NotStarted ──start()──> StartRequested ──ok──> Started
//!     ^                        │ error               │ close(), peer disconnect,
//!     │                        v                     v keep-alive failure
//!     └──────────────────── StopRequested <──────────┘
//! ```
//!
//! `start()` discovers and describes the gateway when needed, binds the
//! channel sockets, connects and starts the keep-alive monitor. Any failure
//! on the way runs `close()` before the error is returned, so a failed start
//! leaves no socket or thread behind.
//!
//! `close()` is idempotent. It sends a disconnect request only when a channel
//! is open and the gateway did not already disconnect us.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use crate::addressing::IndividualAddress;
use crate::configuration::{Config, TransportMode};
use crate::correlator::EventKey;
use crate::error::{KnxError, Result};
use crate::knx_discovery::{
    advertised_hpai, describe_for_tunneling, discover, local_interface,
};
use crate::knx_log;
use crate::net::communicator::{
    ChannelCommunicator, ChannelContext, CommunicatorRole, PendingResponse,
};
use crate::net::monitor::{ConnectionStateMonitor, MonitorSettings};
use crate::net::transport::UdpTransport;
use crate::protocol::cemi::Cemi;
use crate::protocol::constants::{status_name, Channel};
use crate::protocol::dib::DeviceDescription;
use crate::protocol::frame::{Body, Frame, Hpai};
use crate::protocol::services::{ConnectRequest, ConnectResponse, DisconnectRequest};
use crate::protocol::tunnel::{RoutingIndication, SequenceCounter, TunnelingRequest};

/// Lifecycle state of a [`Session`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    NotStarted = 0,
    StartRequested = 1,
    Started = 2,
    StopRequested = 3,
}

impl ConnectionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::StartRequested,
            2 => Self::Started,
            3 => Self::StopRequested,
            _ => Self::NotStarted,
        }
    }
}

/// Addresses negotiated while starting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    /// Control endpoint of the gateway, or the routing multicast group
    pub remote: Option<SocketAddrV4>,
    /// HPAI advertised for the control channel
    pub control: Option<Hpai>,
    /// HPAI advertised for the data channel
    pub data: Option<Hpai>,
    /// Gateway description obtained while starting a tunnel
    pub description: Option<DeviceDescription>,
    /// Individual address the gateway assigned to the tunnel
    pub tunnel_address: Option<IndividualAddress>,
}

/// Owned by the lifecycle lock
#[derive(Debug, Default)]
struct Lifecycle {
    monitor: Option<ConnectionStateMonitor>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One client connection: channels, channel id, keep-alive and lifecycle
#[derive(Debug)]
pub struct Session {
    config: Config,
    context: Arc<ChannelContext>,
    sequence: SequenceCounter,
    lifecycle: Mutex<Lifecycle>,
    channels: RwLock<Vec<Arc<ChannelCommunicator>>>,
    endpoints: RwLock<Endpoints>,
    state: AtomicU8,
    closed: AtomicBool,
}

impl Session {
    /// Session in `NotStarted` state.
    ///
    /// A peer initiated disconnect or a failed keep-alive closes the session
    /// from a helper thread.
    pub fn new(config: Config, context: Arc<ChannelContext>) -> Arc<Self> {
        let session = Arc::new(Self {
            config,
            context,
            sequence: SequenceCounter::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
            channels: RwLock::new(Vec::new()),
            endpoints: RwLock::new(Endpoints::default()),
            state: AtomicU8::new(ConnectionState::NotStarted as u8),
            closed: AtomicBool::new(true),
        });

        let weak = Arc::downgrade(&session);
        session.context.session.set_close_hook(move || {
            let Some(session) = weak.upgrade() else {
                return;
            };
            // Called from a receive or keep-alive thread that close() joins
            let spawned = std::thread::Builder::new()
                .name("knx-closer".into())
                .spawn(move || {
                    session.close();
                });
            if let Err(e) = spawned {
                knx_log!(error, "Failed to start closer thread: {}", e);
            }
        });
        session
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn context(&self) -> &Arc<ChannelContext> {
        &self.context
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        knx_log!(debug, "Lifecycle -> {:?}", state);
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_started(&self) -> bool {
        self.state() == ConnectionState::Started
    }

    pub fn channel_id(&self) -> Option<u8> {
        self.context.session.channel_id()
    }

    pub fn endpoints(&self) -> Endpoints {
        self.endpoints.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update_endpoints(&self, update: impl FnOnce(&mut Endpoints)) {
        update(&mut self.endpoints.write().unwrap_or_else(PoisonError::into_inner));
    }

    /// Outbound tunneling sequence counter
    pub fn sequence(&self) -> &SequenceCounter {
        &self.sequence
    }

    /// Connect to the gateway (tunneling) or join the multicast group
    /// (routing).
    ///
    /// # Errors
    ///
    /// Already started unless the session is `NotStarted`. Otherwise the
    /// first failure of discovery, description, binding or connecting; the
    /// session is closed again before the error is returned.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);
        if self.state() != ConnectionState::NotStarted {
            return Err(KnxError::already_started());
        }
        self.closed.store(false, Ordering::Release);
        self.set_state(ConnectionState::StartRequested);
        knx_log!(info, "Starting {:?} client", self.config.mode);

        self.context.correlator.reset();
        self.context.session.clear_channel_id();
        self.context.session.reset_inbound_sequence();
        self.sequence.reset();

        match self.start_services(&mut lifecycle) {
            Ok(()) => {
                self.set_state(ConnectionState::Started);
                self.context.plugins.notify_start();
                match self.channel_id() {
                    Some(channel_id) => knx_log!(info, "Connected, channel {}", channel_id),
                    None => knx_log!(info, "Routing via {}", self.config.routing_endpoint),
                }
                Ok(())
            }
            Err(e) => {
                knx_log!(error, "Start failed: {}", e);
                self.close_locked(&mut lifecycle);
                Err(e)
            }
        }
    }

    fn start_services(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        self.config.validate()?;
        match self.config.mode {
            TransportMode::Routing => self.start_routing(),
            TransportMode::Tunneling => self.start_tunneling(lifecycle),
        }
    }

    fn install(&self, channel: ChannelCommunicator) -> Arc<ChannelCommunicator> {
        let channel = Arc::new(channel);
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&channel));
        channel
    }

    fn start_routing(&self) -> Result<()> {
        let group = self.config.routing_endpoint;
        let interface = self.config.local_address.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let transport =
            UdpTransport::bind_multicast(group, interface, self.config.routing.socket_timeout)?;
        let channel = self.install(ChannelCommunicator::new(
            CommunicatorRole::Routing,
            Arc::new(transport),
            SocketAddr::V4(group),
            Arc::clone(&self.context),
        ));
        channel.start()?;
        self.update_endpoints(|e| e.remote = Some(group));
        Ok(())
    }

    fn open_channel(
        &self,
        role: CommunicatorRole,
        port: u16,
        local_ip: Ipv4Addr,
        remote: SocketAddrV4,
    ) -> Result<Arc<ChannelCommunicator>> {
        let settings = match role {
            CommunicatorRole::Data => &self.config.data,
            _ => &self.config.control,
        };
        let channel = ChannelCommunicator::bind(
            role,
            SocketAddrV4::new(local_ip, port),
            settings.socket_timeout,
            SocketAddr::V4(remote),
            Arc::clone(&self.context),
        )?;
        Ok(self.install(channel))
    }

    fn start_tunneling(&self, lifecycle: &mut Lifecycle) -> Result<()> {
        let remote = match self.config.remote_endpoint {
            Some(remote) => remote,
            None => discover(&self.config, &self.context)?.control_endpoint,
        };
        self.update_endpoints(|e| e.remote = Some(remote));

        let description = describe_for_tunneling(&self.config, &self.context, remote)?;
        knx_log!(info, "Tunneling to '{}' at {}", description.device.friendly_name, remote);
        self.update_endpoints(|e| e.description = Some(description));

        let nat = self.config.nat;
        let local_ip = local_interface(&self.config, remote);
        let (control, data) = if nat {
            let shared =
                self.open_channel(CommunicatorRole::Nat, self.config.control.port, local_ip, remote)?;
            (Arc::clone(&shared), shared)
        } else {
            (
                self.open_channel(CommunicatorRole::Control, self.config.control.port, local_ip, remote)?,
                self.open_channel(CommunicatorRole::Data, self.config.data.port, local_ip, remote)?,
            )
        };
        let control_hpai = advertised_hpai(&control, nat)?;
        let data_hpai = advertised_hpai(&data, nat)?;
        self.update_endpoints(|e| {
            e.control = Some(control_hpai);
            e.data = Some(data_hpai);
        });

        let response = self.connect(&control, control_hpai, data_hpai)?;
        self.context.session.set_channel_id(response.channel_id);
        if let Some(endpoint) = response.data_endpoint {
            data.set_data_peer(endpoint.reply_addr(SocketAddr::V4(remote)));
        }
        self.update_endpoints(|e| e.tunnel_address = response.crd.map(|crd| crd.individual_address));

        lifecycle.monitor = Some(ConnectionStateMonitor::start(
            control,
            control_hpai,
            MonitorSettings {
                interval: self.config.connection_state_interval,
                timeout: self.config.timeouts.connection_state,
                max_failures: u32::from(self.config.retries.connection_state),
            },
        )?);
        Ok(())
    }

    fn connect(
        &self,
        control: &ChannelCommunicator,
        control_hpai: Hpai,
        data_hpai: Hpai,
    ) -> Result<ConnectResponse> {
        let request = Frame::new(ConnectRequest::new(control_hpai, data_hpai));
        let attempts = self.config.retries.connect;
        let mut last_response = None;
        for attempt in 1..=attempts {
            knx_log!(debug, "Connect attempt {}/{}", attempt, attempts);
            match control.send_request(&request, self.config.timeouts.connect)? {
                Some(Body::ConnectResponse(response)) if response.is_ok() => return Ok(response),
                Some(body) => {
                    if let Body::ConnectResponse(refused) = &body {
                        knx_log!(warn, "Gateway refused connection: {}", status_name(refused.status));
                    }
                    last_response = Some(body);
                }
                None => knx_log!(debug, "No connect response within {:?}", self.config.timeouts.connect),
            }
        }
        Err(KnxError::channel_id_not_received(
            Some(request.into_body()),
            last_response,
        ))
    }

    /// Disconnect and release every channel.
    ///
    /// Never fails; returns `false` when some thread did not stop within
    /// the shutdown grace period. A second call does nothing.
    pub fn close(&self) -> bool {
        let mut lifecycle = lock(&self.lifecycle);
        self.close_locked(&mut lifecycle)
    }

    fn close_locked(&self, lifecycle: &mut Lifecycle) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return true;
        }
        self.set_state(ConnectionState::StopRequested);
        let mut clean = true;

        if let Some(mut monitor) = lifecycle.monitor.take() {
            if !monitor.stop(self.config.shutdown_grace) {
                knx_log!(warn, "Keep-alive monitor did not stop in time");
                clean = false;
            }
        }

        if let Some(channel_id) = self.channel_id() {
            if self
                .context
                .correlator
                .slot(EventKey::Disconnect)
                .has_inbound_request()
            {
                knx_log!(debug, "Channel {} already closed by the gateway", channel_id);
            } else {
                self.disconnect(channel_id);
            }
        }

        self.context.session.clear_channel_id();
        self.update_endpoints(|e| {
            e.control = None;
            e.data = None;
        });

        let channels = std::mem::take(&mut *self.channels.write().unwrap_or_else(PoisonError::into_inner));
        let grace = self.channel_grace();
        for channel in &channels {
            if !channel.close(grace) {
                knx_log!(warn, "{} channel did not stop in time", channel.role());
                clean = false;
            }
        }

        self.set_state(ConnectionState::NotStarted);
        self.context.plugins.notify_shutdown();
        if clean {
            knx_log!(info, "Client closed");
        } else {
            knx_log!(warn, "Client closed, some threads still running");
        }
        clean
    }

    fn channel_grace(&self) -> Duration {
        let c = &self.config;
        let slowest = [c.control, c.data, c.routing]
            .iter()
            .map(|settings| settings.socket_timeout)
            .max()
            .unwrap_or_default();
        c.shutdown_grace + slowest
    }

    fn disconnect(&self, channel_id: u8) {
        let Some(control) = self.channel_for(Channel::Control) else {
            return;
        };
        let hpai = self.endpoints().control.unwrap_or(Hpai::UNSPECIFIED);
        let request = Frame::new(DisconnectRequest::new(channel_id, hpai));
        match control.send_request(&request, self.config.timeouts.disconnect) {
            Ok(Some(Body::DisconnectResponse(response))) => knx_log!(
                info,
                "Disconnected channel {} ({})",
                channel_id,
                status_name(response.status)
            ),
            Ok(_) => knx_log!(warn, "No disconnect response for channel {}", channel_id),
            Err(e) => knx_log!(warn, "Disconnect of channel {} failed: {}", channel_id, e),
        }
    }

    /// First communicator accepting frames of `channel`
    pub fn channel_for(&self, channel: Channel) -> Option<Arc<ChannelCommunicator>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|communicator| communicator.role().accepts(channel))
            .cloned()
    }

    fn route(&self, frame: &Frame) -> Result<Arc<ChannelCommunicator>> {
        if !self.is_started() {
            return Err(KnxError::not_started());
        }
        let channel = frame.service_type().channel();
        self.channel_for(channel).ok_or_else(|| {
            KnxError::illegal_argument(format!(
                "no {:?} channel for {:?}",
                channel,
                frame.service_type()
            ))
        })
    }

    /// Send `frame` through the channel its service type belongs to
    ///
    /// # Errors
    ///
    /// Not started, or illegal argument when no open channel accepts the
    /// frame (e.g. a tunneling frame in routing mode).
    pub fn send(&self, frame: &Frame) -> Result<()> {
        self.route(frame)?.send(frame)
    }

    /// Send a correlated request and wait up to `timeout` for its response
    pub fn send_request(&self, frame: &Frame, timeout: Duration) -> Result<Option<Body>> {
        self.route(frame)?.send_request(frame, timeout)
    }

    pub fn send_request_async(&self, frame: Frame, timeout: Duration) -> Result<PendingResponse> {
        self.route(&frame)?.send_request_async(frame, timeout)
    }

    /// Put a telegram on the bus.
    ///
    /// Tunneling: wraps `cemi` into a tunneling request with the next
    /// sequence number and waits for the acknowledgement, repeating the
    /// request up to `retries.tunneling_attempts` times. Returns `false` when
    /// no positive acknowledgement arrived. Routing: multicasts a routing
    /// indication and returns `true`.
    pub fn send_cemi(&self, cemi: Cemi) -> Result<bool> {
        if self.config.mode == TransportMode::Routing {
            self.send(&Frame::new(RoutingIndication::new(cemi)))?;
            return Ok(true);
        }

        let channel_id = self.channel_id().ok_or_else(KnxError::not_started)?;
        let sequence = self.sequence.next();
        let request = Frame::new(TunnelingRequest::new(channel_id, sequence, cemi));
        let data = self.route(&request)?;
        let attempts = self.config.retries.tunneling_attempts;
        for attempt in 1..=attempts {
            match data.send_request(&request, self.config.timeouts.tunneling)? {
                Some(Body::TunnelingAck(ack)) if ack.is_ok() => return Ok(true),
                Some(Body::TunnelingAck(ack)) => {
                    knx_log!(warn, "Tunneling request {} refused: {}", sequence, status_name(ack.header.status));
                    return Ok(false);
                }
                _ => knx_log!(debug, "No ack for tunneling request {} ({}/{})", sequence, attempt, attempts),
            }
        }
        knx_log!(warn, "Tunneling request {} not acknowledged", sequence);
        Ok(false)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let mut lifecycle =
                std::mem::take(self.lifecycle.get_mut().unwrap_or_else(PoisonError::into_inner));
            self.close_locked(&mut lifecycle);
        }
    }
}
