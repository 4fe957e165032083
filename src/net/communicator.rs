//! Channel communicators.
//!
//! A [`ChannelCommunicator`] owns one transport and a receive thread. Every
//! datagram it receives is decoded, counted, shown to the plugins, checked
//! against the session's channel id and handed to the task registered for
//! its service type (see [`tasks`](crate::net::tasks)). Datagrams without a
//! task are dropped with a debug log line.
//!
//! Outbound, a communicator sends frames to its peer. The peer of data
//! channel frames can be overridden once the gateway announced its data
//! endpoint in the connect response.
//!
//! ```text
//!            ┌──────────────── ChannelCommunicator ───────────────┐
//! socket ──> │ decode ─> statistics ─> plugins ─> channel id ─> task │
//!            └────────────────────────────────────────────────────┘
//! ```

use core::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicI16, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::correlator::EventCorrelator;
use crate::error::{KnxError, Result};
use crate::knx_log;
use crate::net::tasks::{task_table, TaskTable};
use crate::net::transport::{Transport, UdpTransport};
use crate::plugin::PluginManager;
use crate::protocol::constants::{Channel, MAX_FRAME_SIZE};
use crate::protocol::frame::{Body, Frame};
use crate::statistics::Statistics;
use crate::status::StatusPool;
use crate::utility::{join_with_timeout, POLL_INTERVAL};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a communicator is used for; decides its task table and which
/// outbound frames it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommunicatorRole {
    Discovery,
    Description,
    Control,
    Data,
    /// Control and data over one socket (NAT mode)
    Nat,
    Routing,
}

impl CommunicatorRole {
    /// Whether frames of `channel` are sent through a communicator of this role
    pub const fn accepts(self, channel: Channel) -> bool {
        matches!(
            (self, channel),
            (Self::Discovery, Channel::Discovery)
                | (Self::Description, Channel::Description)
                | (Self::Control | Self::Nat, Channel::Control)
                | (Self::Data | Self::Nat, Channel::Data)
                | (Self::Routing, Channel::Routing)
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Description => "description",
            Self::Control => "control",
            Self::Data => "data",
            Self::Nat => "nat",
            Self::Routing => "routing",
        }
    }
}

impl fmt::Display for CommunicatorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type CloseHook = Arc<dyn Fn() + Send + Sync>;

/// Connection state read by the receive threads.
///
/// Channel id and last inbound sequence are stored as `i16` with `-1`
/// meaning unset.
pub struct SessionState {
    channel_id: AtomicI16,
    last_inbound_sequence: AtomicI16,
    close_hook: Mutex<Option<CloseHook>>,
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("channel_id", &self.channel_id())
            .field("last_inbound_sequence", &self.last_inbound_sequence.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            channel_id: AtomicI16::new(-1),
            last_inbound_sequence: AtomicI16::new(-1),
            close_hook: Mutex::new(None),
        }
    }

    pub fn channel_id(&self) -> Option<u8> {
        u8::try_from(self.channel_id.load(Ordering::Acquire)).ok()
    }

    pub fn set_channel_id(&self, channel_id: u8) {
        self.channel_id.store(i16::from(channel_id), Ordering::Release);
    }

    pub fn clear_channel_id(&self) {
        self.channel_id.store(-1, Ordering::Release);
    }

    /// Remember `sequence` as the last tunneling request received; returns
    /// `false` if it repeats the previous one.
    pub fn accept_inbound_sequence(&self, sequence: u8) -> bool {
        let sequence = i16::from(sequence);
        self.last_inbound_sequence.swap(sequence, Ordering::AcqRel) != sequence
    }

    pub fn reset_inbound_sequence(&self) {
        self.last_inbound_sequence.store(-1, Ordering::Release);
    }

    /// Install the callback run when the peer or the keep-alive monitor ends
    /// the connection. The hook must not block on the receive threads.
    pub fn set_close_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *lock(&self.close_hook) = Some(Arc::new(hook));
    }

    /// Run the close hook, if one is installed
    pub fn request_close(&self) {
        let hook = lock(&self.close_hook).clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// State shared by every communicator of one client
#[derive(Debug)]
pub struct ChannelContext {
    pub correlator: EventCorrelator,
    pub status: StatusPool,
    pub statistics: Statistics,
    pub session: SessionState,
    pub plugins: Arc<PluginManager>,
}

impl ChannelContext {
    pub fn new(plugins: Arc<PluginManager>) -> Self {
        Self {
            correlator: EventCorrelator::new(),
            status: StatusPool::new(),
            statistics: Statistics::new(),
            session: SessionState::new(),
            plugins,
        }
    }

    /// Count an error and forward it to the plugins
    pub fn report(&self, error: KnxError) {
        self.statistics.record_error();
        self.plugins.notify_error(error);
    }
}

/// Reject channel-scoped bodies whose channel id differs from the session's.
///
/// Connect responses are exempt: they are the frames that assign the id.
pub fn verify_channel_id(expected: Option<u8>, body: &Body) -> Result<()> {
    if matches!(body, Body::ConnectResponse(_)) {
        return Ok(());
    }
    match body.channel_id() {
        Some(id) if Some(id) != expected => Err(KnxError::wrong_channel_id(body.clone())),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy)]
struct Peers {
    default: SocketAddr,
    data: Option<SocketAddr>,
}

/// Sending half of a communicator, shared with its receive thread and tasks
#[derive(Debug)]
pub struct Link {
    role: CommunicatorRole,
    transport: Arc<dyn Transport>,
    peers: RwLock<Peers>,
    context: Arc<ChannelContext>,
}

impl Link {
    pub const fn role(&self) -> CommunicatorRole {
        self.role
    }

    pub fn context(&self) -> &ChannelContext {
        &self.context
    }

    /// Destination of frames travelling on `channel`
    pub fn peer_for(&self, channel: Channel) -> SocketAddr {
        let peers = *self.peers.read().unwrap_or_else(PoisonError::into_inner);
        match channel {
            Channel::Data => peers.data.unwrap_or(peers.default),
            _ => peers.default,
        }
    }

    /// Send `frame` to the peer of its channel
    pub fn send(&self, frame: &Frame) -> Result<()> {
        self.send_to(frame, self.peer_for(frame.service_type().channel()))
    }

    pub fn send_to(&self, frame: &Frame, addr: SocketAddr) -> Result<()> {
        let bytes = frame.to_bytes()?;
        self.transport.send_to(&bytes, addr)?;
        knx_log!(trace, "{} -> {}: {:?}", self.role, addr, frame.body());
        self.context
            .statistics
            .record_outgoing(frame.service_type(), bytes.len());
        self.context.plugins.notify_outgoing(frame);
        Ok(())
    }

    /// Register `frame` in the correlator, send it and wait up to `timeout`
    /// for the matching response.
    pub fn request(&self, frame: &Frame, timeout: Duration) -> Result<Option<Body>> {
        let key = self.context.correlator.register(frame.body())?;
        self.send(frame)?;
        Ok(self.context.correlator.await_response(key, timeout))
    }

    fn dispatch(&self, data: &[u8], source: SocketAddr, tasks: &TaskTable) {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                knx_log!(debug, "{} dropped {} bytes from {}: {}", self.role, data.len(), source, e);
                self.context.report(e);
                return;
            }
        };
        let service_type = frame.service_type();
        knx_log!(trace, "{} <- {}: {:?}", self.role, source, frame.body());
        self.context.statistics.record_incoming(service_type, data.len());
        self.context.plugins.notify_incoming(&frame);

        if let Err(e) = verify_channel_id(self.context.session.channel_id(), frame.body()) {
            knx_log!(
                warn,
                "{} rejected {:?} from {}: expected channel {:?}",
                self.role,
                service_type,
                source,
                self.context.session.channel_id()
            );
            self.context.report(e);
            return;
        }

        match tasks.get(&service_type) {
            Some(task) => {
                if let Err(e) = task(self, &frame, source) {
                    knx_log!(warn, "{} task for {:?} failed: {}", self.role, service_type, e);
                    self.context.report(e);
                }
            }
            None => knx_log!(debug, "{} has no task for {:?}, dropped", self.role, service_type),
        }
    }
}

/// Result of [`ChannelCommunicator::send_request_async`]
#[derive(Debug)]
pub struct PendingResponse {
    receiver: Receiver<Result<Option<Body>>>,
}

impl PendingResponse {
    /// Block until the exchange finished; `Ok(None)` means no response
    /// arrived within the request timeout.
    pub fn wait(self) -> Result<Option<Body>> {
        self.receiver.recv().unwrap_or(Ok(None))
    }

    /// Outcome if the exchange already finished. Returns `Some` at most once.
    pub fn try_get(&self) -> Option<Result<Option<Body>>> {
        self.receiver.try_recv().ok()
    }
}

/// One socket, one receive thread
#[derive(Debug)]
pub struct ChannelCommunicator {
    link: Arc<Link>,
    tasks: Arc<TaskTable>,
    running: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelCommunicator {
    /// Communicator sending to `peer`, with the task table of `role`.
    ///
    /// The receive thread starts with [`start`](Self::start).
    pub fn new(
        role: CommunicatorRole,
        transport: Arc<dyn Transport>,
        peer: SocketAddr,
        context: Arc<ChannelContext>,
    ) -> Self {
        Self {
            link: Arc::new(Link {
                role,
                transport,
                peers: RwLock::new(Peers {
                    default: peer,
                    data: None,
                }),
                context,
            }),
            tasks: Arc::new(task_table(role)),
            running: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
        }
    }

    /// Bind a UDP socket on `local` and start receiving on it
    pub fn bind(
        role: CommunicatorRole,
        local: SocketAddrV4,
        recv_timeout: Duration,
        peer: SocketAddr,
        context: Arc<ChannelContext>,
    ) -> Result<Self> {
        let transport = UdpTransport::bind(local, recv_timeout)?;
        let communicator = Self::new(role, Arc::new(transport), peer, context);
        communicator.start()?;
        knx_log!(debug, "{} channel bound to {:?}", role, communicator.local_addr().ok());
        Ok(communicator)
    }

    /// Spawn the receive thread
    ///
    /// # Errors
    ///
    /// Already started if the thread is running.
    pub fn start(&self) -> Result<()> {
        let mut receiver = lock(&self.receiver);
        if receiver.is_some() {
            return Err(KnxError::already_started());
        }
        self.running.store(true, Ordering::Release);

        let link = Arc::clone(&self.link);
        let tasks = Arc::clone(&self.tasks);
        let running = Arc::clone(&self.running);
        let handle = std::thread::Builder::new()
            .name(format!("knx-{}", self.link.role))
            .spawn(move || receive_loop(&link, &tasks, &running))?;
        *receiver = Some(handle);
        Ok(())
    }

    pub fn role(&self) -> CommunicatorRole {
        self.link.role
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.link.transport.local_addr()
    }

    pub fn peer(&self) -> SocketAddr {
        self.link.peer_for(Channel::Control)
    }

    pub fn set_peer(&self, peer: SocketAddr) {
        self.link.peers.write().unwrap_or_else(PoisonError::into_inner).default = peer;
    }

    /// Send data channel frames to `peer` instead of the default peer
    pub fn set_data_peer(&self, peer: SocketAddr) {
        self.link.peers.write().unwrap_or_else(PoisonError::into_inner).data = Some(peer);
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn send(&self, frame: &Frame) -> Result<()> {
        self.link.send(frame)
    }

    /// Send a correlated request and wait for its response.
    ///
    /// # Errors
    ///
    /// Illegal argument if `frame` is not a request; transport errors from
    /// sending. A missing response is `Ok(None)`, not an error.
    pub fn send_request(&self, frame: &Frame, timeout: Duration) -> Result<Option<Body>> {
        self.link.request(frame, timeout)
    }

    /// Like [`send_request`](Self::send_request), but the exchange runs on
    /// a helper thread.
    pub fn send_request_async(&self, frame: Frame, timeout: Duration) -> Result<PendingResponse> {
        let (sender, receiver) = mpsc::channel();
        let link = Arc::clone(&self.link);
        std::thread::Builder::new()
            .name(format!("knx-{}-request", self.link.role))
            .spawn(move || {
                // The caller may have dropped the handle
                let _ = sender.send(link.request(&frame, timeout));
            })?;
        Ok(PendingResponse { receiver })
    }

    /// Stop the receive thread, waiting up to `grace` for it to exit.
    ///
    /// Returns `false` when the thread did not stop in time.
    pub fn close(&self, grace: Duration) -> bool {
        self.running.store(false, Ordering::Release);
        self.link.transport.close();
        match lock(&self.receiver).take() {
            Some(handle) => join_with_timeout(handle, grace),
            None => true,
        }
    }
}

impl Drop for ChannelCommunicator {
    fn drop(&mut self) {
        // Let a still running receiver exit on its next timeout
        self.running.store(false, Ordering::Release);
    }
}

fn receive_loop(link: &Link, tasks: &TaskTable, running: &AtomicBool) {
    let mut buf = [0u8; MAX_FRAME_SIZE];
    knx_log!(debug, "{} receiver started on {:?}", link.role, link.transport.local_addr().ok());
    while running.load(Ordering::Acquire) {
        match link.transport.recv_from(&mut buf) {
            Ok(Some((n, source))) => link.dispatch(&buf[..n], source, tasks),
            Ok(None) => {}
            Err(e) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                knx_log!(warn, "{} receive failed: {}", link.role, e);
                link.context.report(e);
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
    knx_log!(debug, "{} receiver stopped", link.role);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::mock_transport::MockTransport;
    use crate::protocol::{
        ConnectionStateRequest, ConnectionStateResponse, Hpai, RoutingBusy, ServiceType,
    };
    use crate::utility::poll_until;

    fn gateway() -> SocketAddr {
        "192.168.1.10:3671".parse().unwrap()
    }

    fn control(mock: &Arc<MockTransport>) -> (ChannelCommunicator, Arc<ChannelContext>) {
        let context = Arc::new(ChannelContext::new(Arc::new(PluginManager::empty())));
        let comm = ChannelCommunicator::new(
            CommunicatorRole::Control,
            Arc::clone(mock) as Arc<dyn Transport>,
            gateway(),
            Arc::clone(&context),
        );
        (comm, context)
    }

    fn bytes(body: impl Into<Body>) -> Vec<u8> {
        Frame::new(body).to_bytes().unwrap().to_vec()
    }

    #[test]
    fn test_role_accepts() {
        assert!(CommunicatorRole::Nat.accepts(Channel::Control));
        assert!(CommunicatorRole::Nat.accepts(Channel::Data));
        assert!(!CommunicatorRole::Control.accepts(Channel::Data));
        assert!(CommunicatorRole::Routing.accepts(Channel::Routing));
        assert!(!CommunicatorRole::Discovery.accepts(Channel::Description));
    }

    #[test]
    fn test_verify_channel_id() {
        let state_response: Body = ConnectionStateResponse::new(7, 0).into();
        assert!(verify_channel_id(Some(7), &state_response).is_ok());
        assert!(verify_channel_id(Some(8), &state_response)
            .unwrap_err()
            .is_wrong_channel_id());
        assert!(verify_channel_id(None, &state_response).is_err());

        // The connect response assigns the id and is never rejected
        let connect = crate::protocol::ConnectResponse::accepted(
            9,
            Hpai::UNSPECIFIED,
            crate::addressing::IndividualAddress::from(0x1101),
        );
        assert!(verify_channel_id(Some(7), &connect.into()).is_ok());
    }

    #[test]
    fn test_session_state() {
        let session = SessionState::new();
        assert_eq!(session.channel_id(), None);
        session.set_channel_id(0);
        assert_eq!(session.channel_id(), Some(0));
        session.clear_channel_id();
        assert_eq!(session.channel_id(), None);

        assert!(session.accept_inbound_sequence(4));
        assert!(!session.accept_inbound_sequence(4));
        assert!(session.accept_inbound_sequence(5));
        session.reset_inbound_sequence();
        assert!(session.accept_inbound_sequence(5));
    }

    #[test]
    fn test_request_response_roundtrip() {
        let mock = Arc::new(MockTransport::new());
        mock.set_responder(|_, to| vec![(bytes(ConnectionStateResponse::new(3, 0)), to)]);
        let (comm, context) = control(&mock);
        context.session.set_channel_id(3);
        comm.start().unwrap();

        let request = Frame::new(ConnectionStateRequest::new(3, Hpai::UNSPECIFIED));
        let response = comm.send_request(&request, Duration::from_secs(2)).unwrap();
        assert!(matches!(response, Some(Body::ConnectionStateResponse(r)) if r.is_ok()));
        assert_eq!(mock.sent_packets()[0].1, gateway());
        assert_eq!(context.statistics.count(ServiceType::ConnectionStateRequest), 1);
        assert!(comm.close(Duration::from_secs(1)));
    }

    #[test]
    fn test_wrong_channel_id_dropped() {
        let mock = Arc::new(MockTransport::new());
        let (comm, context) = control(&mock);
        context.session.set_channel_id(3);
        comm.start().unwrap();

        mock.add_response(bytes(ConnectionStateResponse::new(4, 0)));
        let errors = poll_until(Duration::from_secs(2), POLL_INTERVAL, || {
            (context.statistics.snapshot().errors > 0).then_some(())
        });
        assert!(errors.is_some());
        assert!(context
            .correlator
            .slot(crate::correlator::EventKey::ConnectionState)
            .response()
            .is_none());
        comm.close(Duration::from_secs(1));
    }

    #[test]
    fn test_frame_without_task_dropped() {
        let mock = Arc::new(MockTransport::new());
        let (comm, context) = control(&mock);
        comm.start().unwrap();

        mock.add_response(bytes(RoutingBusy {
            device_state: 0,
            wait_time_ms: 100,
            control: 0,
        }));
        let seen = poll_until(Duration::from_secs(2), POLL_INTERVAL, || {
            (context.statistics.count(ServiceType::RoutingBusy) == 1).then_some(())
        });
        assert!(seen.is_some());
        assert_eq!(context.statistics.snapshot().errors, 0);
        comm.close(Duration::from_secs(1));
    }

    #[test]
    fn test_garbage_counted_as_error() {
        let mock = Arc::new(MockTransport::new());
        let (comm, context) = control(&mock);
        comm.start().unwrap();

        mock.add_response(vec![0x06, 0x10, 0x02]);
        let errors = poll_until(Duration::from_secs(2), POLL_INTERVAL, || {
            (context.statistics.snapshot().errors == 1).then_some(())
        });
        assert!(errors.is_some());
        comm.close(Duration::from_secs(1));
    }

    #[test]
    fn test_async_request() {
        let mock = Arc::new(MockTransport::new());
        mock.set_responder(|_, to| vec![(bytes(ConnectionStateResponse::new(1, 0)), to)]);
        let (comm, context) = control(&mock);
        context.session.set_channel_id(1);
        comm.start().unwrap();

        let pending = comm
            .send_request_async(
                Frame::new(ConnectionStateRequest::new(1, Hpai::UNSPECIFIED)),
                Duration::from_secs(2),
            )
            .unwrap();
        assert!(matches!(pending.wait().unwrap(), Some(Body::ConnectionStateResponse(_))));
        comm.close(Duration::from_secs(1));
    }

    #[test]
    fn test_data_peer_override() {
        let mock = Arc::new(MockTransport::new());
        let (comm, _) = control(&mock);
        let data: SocketAddr = "192.168.1.10:3672".parse().unwrap();
        comm.set_data_peer(data);
        assert_eq!(comm.link().peer_for(Channel::Data), data);
        assert_eq!(comm.link().peer_for(Channel::Control), gateway());
    }

    #[test]
    fn test_start_twice() {
        let mock = Arc::new(MockTransport::new());
        let (comm, _) = control(&mock);
        comm.start().unwrap();
        assert!(comm.start().unwrap_err().is_already_started());
        assert!(comm.close(Duration::from_secs(1)));
        assert!(mock.is_closed());
    }
}
