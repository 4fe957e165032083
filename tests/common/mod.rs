//! In-process KNXnet/IP gateway on loopback UDP.
//!
//! Answers search, description, connect, connection-state and disconnect
//! requests, acknowledges tunneling requests, confirms them with an
//! `L_Data.con` and answers group reads from a small value table. Every
//! received body is logged so tests can count exchanges.

#![allow(dead_code, reason = "every test binary uses a different subset")]

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use knx_link::addressing::KnxAddress;
use knx_link::configuration::{Config, RetryPolicy, Timeouts};
use knx_link::protocol::{
    Apci, Body, Cemi, CemiMessageCode, ConnectResponse, ConnectionStateResponse,
    DescriptionResponse, DeviceDescription, DeviceInfo, DisconnectResponse, Frame, Hpai,
    SearchResponse, ServiceFamily, ServiceType, SupportedFamilies, TunnelingAck,
    TunnelingRequest,
};
use knx_link::utility::{poll_until, POLL_INTERVAL};
use knx_link::{ia, IndividualAddress};

/// How the simulated gateway reacts
#[derive(Debug, Clone)]
pub struct Behaviour {
    pub channel_id: u8,
    /// Advertise the tunneling service family
    pub tunneling: bool,
    pub answer_search: bool,
    pub answer_connection_state: bool,
    pub ack_tunneling: bool,
    /// Send an `L_Data.con` for every tunneling request
    pub confirm: bool,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            channel_id: 7,
            tunneling: true,
            answer_search: true,
            answer_connection_state: true,
            ack_tunneling: true,
            confirm: true,
        }
    }
}

/// Device answering group reads on the simulated bus
pub const BUS_DEVICE: IndividualAddress = IndividualAddress::from_bytes([0x11, 0x0A]);

#[derive(Debug, Default)]
struct State {
    behaviour: Mutex<Behaviour>,
    received: Mutex<Vec<(Body, SocketAddr)>>,
    values: Mutex<HashMap<KnxAddress, Vec<u8>>>,
    client_control: Mutex<Option<SocketAddr>>,
    client_data: Mutex<Option<SocketAddr>>,
    sequence: AtomicU8,
}

#[derive(Debug)]
pub struct GatewaySimulator {
    addr: SocketAddrV4,
    socket: Arc<UdpSocket>,
    state: Arc<State>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GatewaySimulator {
    pub fn start(behaviour: Behaviour) -> Self {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        socket.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let addr = match socket.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!("bound to an IPv4 address"),
        };
        let socket = Arc::new(socket);
        let state = Arc::new(State {
            behaviour: Mutex::new(behaviour),
            ..State::default()
        });
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let socket = Arc::clone(&socket);
            let state = Arc::clone(&state);
            let running = Arc::clone(&running);
            std::thread::spawn(move || serve(&socket, addr, &state, &running))
        };

        Self {
            addr,
            socket,
            state,
            running,
            handle: Some(handle),
        }
    }

    pub fn addr(&self) -> SocketAddrV4 {
        self.addr
    }

    pub fn channel_id(&self) -> u8 {
        self.state.behaviour.lock().unwrap().channel_id
    }

    pub fn update(&self, change: impl FnOnce(&mut Behaviour)) {
        change(&mut self.state.behaviour.lock().unwrap());
    }

    /// Value the simulated bus device answers group reads of `address` with
    pub fn set_value(&self, address: impl Into<KnxAddress>, data: &[u8]) {
        self.state
            .values
            .lock()
            .unwrap()
            .insert(address.into(), data.to_vec());
    }

    pub fn received(&self) -> Vec<Body> {
        self.state
            .received
            .lock()
            .unwrap()
            .iter()
            .map(|(body, _)| body.clone())
            .collect()
    }

    pub fn count(&self, service_type: ServiceType) -> usize {
        self.state
            .received
            .lock()
            .unwrap()
            .iter()
            .filter(|(body, _)| body.service_type() == service_type)
            .count()
    }

    /// Wait until at least `n` frames of `service_type` arrived
    pub fn wait_for(&self, service_type: ServiceType, n: usize, timeout: Duration) -> bool {
        poll_until(timeout, POLL_INTERVAL, || {
            (self.count(service_type) >= n).then_some(())
        })
        .is_some()
    }

    /// Send `body` to the control endpoint the client connected from
    pub fn send_control(&self, body: impl Into<Body>) {
        let to = self.state.client_control.lock().unwrap().expect("client connected");
        send(&self.socket, body.into(), to);
    }

    /// Send `body` to the data endpoint the client connected from
    pub fn send_data(&self, body: impl Into<Body>) {
        let to = self.state.client_data.lock().unwrap().expect("client connected");
        send(&self.socket, body.into(), to);
    }

    /// Next sequence number of gateway initiated tunneling requests
    pub fn next_sequence(&self) -> u8 {
        self.state.sequence.fetch_add(1, Ordering::SeqCst)
    }
}

impl Drop for GatewaySimulator {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn description(tunneling: bool) -> DeviceDescription {
    let mut families = vec![(ServiceFamily::Core, 1), (ServiceFamily::DeviceManagement, 1)];
    if tunneling {
        families.push((ServiceFamily::Tunneling, 1));
    }
    DeviceDescription {
        device: DeviceInfo {
            medium: 0x02,
            device_status: 0,
            individual_address: ia!(1, 1, 0),
            project_installation_id: 0,
            serial_number: [0x00, 0xC5, 0x01, 0x02, 0x03, 0x04],
            multicast_address: Ipv4Addr::new(224, 0, 23, 12),
            mac_address: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
            friendly_name: "Simulated IP Interface".to_string(),
        },
        families: SupportedFamilies::new(&families),
        other: Vec::new(),
    }
}

/// Client configuration with test friendly timings pointed at `gateway`
pub fn test_config(gateway: &GatewaySimulator) -> Config {
    Config::tunneling(gateway.addr())
        .with_local_address(Ipv4Addr::LOCALHOST)
        .with_socket_timeout(Duration::from_millis(20))
        .with_shutdown_grace(Duration::from_millis(500))
        .with_connection_state_interval(Duration::from_millis(100))
        .with_timeouts(Timeouts {
            search: Duration::from_millis(200),
            description: Duration::from_millis(300),
            connect: Duration::from_millis(300),
            connection_state: Duration::from_millis(200),
            disconnect: Duration::from_millis(300),
            tunneling: Duration::from_millis(300),
        })
        .with_retries(RetryPolicy {
            discovery: 2,
            description: 2,
            connect: 2,
            connection_state: 3,
            tunneling_attempts: 2,
        })
}

fn send(socket: &UdpSocket, body: Body, to: SocketAddr) {
    let bytes = Frame::new(body).to_bytes().unwrap();
    socket.send_to(&bytes, to).unwrap();
}

fn serve(socket: &UdpSocket, addr: SocketAddrV4, state: &State, running: &AtomicBool) {
    let mut buf = [0u8; 512];
    while running.load(Ordering::SeqCst) {
        let Ok((len, source)) = socket.recv_from(&mut buf) else {
            continue;
        };
        let Ok(frame) = Frame::decode(&buf[..len]) else {
            continue;
        };
        let body = frame.into_body();
        state.received.lock().unwrap().push((body.clone(), source));
        let behaviour = state.behaviour.lock().unwrap().clone();
        let own = Hpai::from(addr);

        match body {
            Body::SearchRequest(request) if behaviour.answer_search => {
                let response = SearchResponse {
                    control_endpoint: own,
                    description: description(behaviour.tunneling),
                };
                send(socket, response.into(), request.discovery_endpoint.reply_addr(source));
            }
            Body::DescriptionRequest(request) => {
                let response = DescriptionResponse {
                    description: description(behaviour.tunneling),
                };
                send(socket, response.into(), request.control_endpoint.reply_addr(source));
            }
            Body::ConnectRequest(request) => {
                let control = request.control_endpoint.reply_addr(source);
                *state.client_control.lock().unwrap() = Some(control);
                *state.client_data.lock().unwrap() = Some(request.data_endpoint.reply_addr(source));
                state.sequence.store(0, Ordering::SeqCst);
                let response = ConnectResponse::accepted(behaviour.channel_id, own, ia!(1, 1, 250));
                send(socket, response.into(), control);
            }
            Body::ConnectionStateRequest(request) if behaviour.answer_connection_state => {
                let response = ConnectionStateResponse::new(request.channel_id, 0);
                send(socket, response.into(), request.control_endpoint.reply_addr(source));
            }
            Body::DisconnectRequest(request) => {
                let response = DisconnectResponse::new(request.channel_id, 0);
                send(socket, response.into(), request.control_endpoint.reply_addr(source));
            }
            Body::TunnelingRequest(request) if behaviour.ack_tunneling => {
                let header = request.header;
                send(socket, TunnelingAck::new(header.channel_id, header.sequence, 0).into(), source);
                if behaviour.confirm {
                    on_telegram(socket, state, &behaviour, &request.cemi, source);
                }
            }
            _ => {}
        }
    }
}

fn on_telegram(socket: &UdpSocket, state: &State, behaviour: &Behaviour, cemi: &Cemi, client: SocketAddr) {
    let mut tunnel = |cemi: Cemi| {
        let sequence = state.sequence.fetch_add(1, Ordering::SeqCst);
        send(socket, TunnelingRequest::new(behaviour.channel_id, sequence, cemi).into(), client);
    };

    if cemi.apci() == Some(Apci::GroupValueWrite) {
        state
            .values
            .lock()
            .unwrap()
            .insert(cemi.destination(), cemi.data().to_vec());
    }
    tunnel(cemi.clone().with_message_code(CemiMessageCode::LDataCon));

    if cemi.apci() == Some(Apci::GroupValueRead) {
        let value = state.values.lock().unwrap().get(&cemi.destination()).cloned();
        if let Some(value) = value {
            let response = Cemi::builder(cemi.destination())
                .message_code(CemiMessageCode::LDataInd)
                .source(BUS_DEVICE)
                .apci(Apci::GroupValueResponse)
                .data(&value)
                .build()
                .unwrap();
            tunnel(response);
        }
    }
}
