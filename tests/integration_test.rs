//! Integration tests for knx-link
//!
//! Each test drives a real client over loopback UDP against the in-process
//! gateway of `common`.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{test_config, Behaviour, GatewaySimulator, BUS_DEVICE};
use knx_link::protocol::{
    Apci, Body, Cemi, CemiMessageCode, ConnectionStateRequest, DisconnectRequest, Frame, Hpai,
    ServiceType, TunnelingRequest,
};
use knx_link::utility::{poll_until, POLL_INTERVAL};
use knx_link::{ga, ia, ConnectionState, KnxAddress, KnxClient};

const WAIT: Duration = Duration::from_secs(3);

fn wait_disconnected(client: &KnxClient) -> bool {
    poll_until(WAIT, POLL_INTERVAL, || {
        (client.state() == ConnectionState::NotStarted).then_some(())
    })
    .is_some()
}

#[test]
fn test_discover_connect_and_keepalive() {
    let gateway = GatewaySimulator::start(Behaviour::default());
    let mut config = test_config(&gateway).with_discovery_endpoint(gateway.addr());
    config.remote_endpoint = None;

    let client = KnxClient::connect(config).unwrap();
    assert_eq!(client.state(), ConnectionState::Started);
    assert_eq!(client.channel_id(), Some(gateway.channel_id()));
    assert_eq!(gateway.count(ServiceType::SearchRequest), 1);
    assert_eq!(gateway.count(ServiceType::DescriptionRequest), 1);
    assert_eq!(gateway.count(ServiceType::ConnectRequest), 1);

    let endpoints = client.endpoints();
    assert_eq!(endpoints.remote, Some(gateway.addr()));
    assert!(endpoints.control.is_some_and(|hpai| !hpai.is_unspecified()));
    assert_eq!(
        endpoints.description.map(|d| d.device.friendly_name),
        Some("Simulated IP Interface".to_string())
    );
    assert_eq!(endpoints.tunnel_address, Some(ia!(1, 1, 250)));

    // Keep-alive every 100 ms
    assert!(gateway.wait_for(ServiceType::ConnectionStateRequest, 3, WAIT));
    assert!(client.is_connected());

    assert!(client.close());
    assert_eq!(client.state(), ConnectionState::NotStarted);
    assert_eq!(client.channel_id(), None);
    assert_eq!(gateway.count(ServiceType::DisconnectRequest), 1);
}

#[test]
fn test_gateway_without_tunneling() {
    let gateway = GatewaySimulator::start(Behaviour {
        tunneling: false,
        ..Behaviour::default()
    });

    let err = KnxClient::connect(test_config(&gateway)).unwrap_err();
    assert!(err.is_tunneling_not_supported());
    // Not retried, never connected
    assert_eq!(gateway.count(ServiceType::DescriptionRequest), 1);
    assert_eq!(gateway.count(ServiceType::ConnectRequest), 0);
}

#[test]
fn test_discovery_timeout() {
    let gateway = GatewaySimulator::start(Behaviour {
        answer_search: false,
        ..Behaviour::default()
    });
    let mut config = test_config(&gateway).with_discovery_endpoint(gateway.addr());
    config.remote_endpoint = None;

    let err = KnxClient::connect(config).unwrap_err();
    assert!(err.is_discovery_not_received());
    assert!(gateway.wait_for(ServiceType::SearchRequest, 2, WAIT));
    assert_eq!(gateway.count(ServiceType::SearchRequest), 2);
    assert_eq!(gateway.count(ServiceType::DescriptionRequest), 0);
}

#[test]
fn test_write_is_confirmed_into_status_pool() {
    let gateway = GatewaySimulator::start(Behaviour::default());
    let client = KnxClient::connect(test_config(&gateway)).unwrap();
    let address = KnxAddress::from(ga!(1/2/3));

    assert!(client.write_request(ga!(1/2/3), &[0x01]).unwrap());

    let entry = client
        .status_pool()
        .get(address, true, WAIT)
        .expect("confirmation updates the pool");
    assert_eq!(entry.apci, Apci::GroupValueWrite);
    assert_eq!(entry.data, vec![0x01]);
    assert!(!entry.dirty);

    // The client acknowledged the confirmation
    assert!(gateway.wait_for(ServiceType::TunnelingAck, 1, WAIT));
    client.close();
}

#[test]
fn test_read_value_from_bus() {
    let gateway = GatewaySimulator::start(Behaviour::default());
    gateway.set_value(ga!(1/2/4), &[0x0C, 0x1A]);
    let client = KnxClient::connect(test_config(&gateway)).unwrap();

    let entry = client
        .read_value(ga!(1/2/4), WAIT)
        .unwrap()
        .expect("bus device answers");
    assert_eq!(entry.apci, Apci::GroupValueResponse);
    assert_eq!(entry.data, vec![0x0C, 0x1A]);
    assert_eq!(entry.source, BUS_DEVICE);

    // Nobody answers for an unknown address
    let missing = client.read_value(ga!(1/2/5), Duration::from_millis(200)).unwrap();
    assert!(missing.is_none());
}

#[test]
fn test_dirty_entry_waits_for_confirmation() {
    let gateway = GatewaySimulator::start(Behaviour {
        confirm: false,
        ..Behaviour::default()
    });
    let client = KnxClient::connect(test_config(&gateway)).unwrap();
    let address = KnxAddress::from(ga!(2/0/1));

    // A telegram from the bus creates the entry
    let indication = Cemi::builder(ga!(2/0/1))
        .message_code(CemiMessageCode::LDataInd)
        .source(BUS_DEVICE)
        .apci(Apci::GroupValueWrite)
        .data(&[0x00])
        .build()
        .unwrap();
    gateway.send_data(TunnelingRequest::new(
        gateway.channel_id(),
        gateway.next_sequence(),
        indication,
    ));
    assert!(client.status_pool().get(address, true, WAIT).is_some());

    // Our write is acknowledged but never confirmed
    assert!(client.write_request(ga!(2/0/1), &[0x01]).unwrap());
    assert_eq!(client.status_pool().is_dirty(address), Some(true));
    assert!(client
        .status_pool()
        .get(address, true, Duration::from_millis(200))
        .is_none());
    let stale = client.status_pool().get(address, false, Duration::ZERO).unwrap();
    assert_eq!(stale.data, vec![0x00]);
}

#[test]
fn test_unacknowledged_write_is_repeated() {
    let gateway = GatewaySimulator::start(Behaviour {
        ack_tunneling: false,
        ..Behaviour::default()
    });
    let client = KnxClient::connect(test_config(&gateway)).unwrap();

    assert!(!client.write_request(ga!(1/1/1), &[0x01]).unwrap());
    assert_eq!(gateway.count(ServiceType::TunnelingRequest), 2);

    // Both attempts carry the same sequence number
    let sequences: HashSet<_> = gateway
        .received()
        .iter()
        .filter_map(Body::sequence)
        .collect();
    assert_eq!(sequences.len(), 1);
}

#[test]
fn test_close_is_idempotent() {
    let gateway = GatewaySimulator::start(Behaviour::default());
    let client = KnxClient::connect(test_config(&gateway)).unwrap();

    assert!(client.close());
    assert!(client.close());
    assert_eq!(client.state(), ConnectionState::NotStarted);
    assert_eq!(gateway.count(ServiceType::DisconnectRequest), 1);

    let err = client.write_request(ga!(1/2/3), &[0x01]).unwrap_err();
    assert!(err.is_not_started());
}

#[test]
fn test_gateway_initiated_disconnect() {
    let gateway = GatewaySimulator::start(Behaviour::default());
    let client = KnxClient::connect(test_config(&gateway)).unwrap();
    let channel_id = gateway.channel_id();

    gateway.send_control(DisconnectRequest::new(channel_id, Hpai::from(gateway.addr())));

    assert!(gateway.wait_for(ServiceType::DisconnectResponse, 1, WAIT));
    assert!(wait_disconnected(&client));
    // The client answered instead of sending its own request
    assert_eq!(gateway.count(ServiceType::DisconnectRequest), 0);
    assert!(client.close());
}

#[test]
fn test_silent_gateway_closes_connection() {
    let gateway = GatewaySimulator::start(Behaviour {
        answer_connection_state: false,
        ..Behaviour::default()
    });
    let client = KnxClient::connect(test_config(&gateway)).unwrap();

    assert!(wait_disconnected(&client));
    assert_eq!(gateway.count(ServiceType::ConnectionStateRequest), 3);
    assert!(client.statistics_snapshot().errors >= 1);
}

#[test]
fn test_foreign_channel_is_ignored() {
    let gateway = GatewaySimulator::start(Behaviour::default());
    let client = KnxClient::connect(test_config(&gateway)).unwrap();
    let errors_before = client.statistics_snapshot().errors;

    let indication = Cemi::builder(ga!(3/3/3))
        .message_code(CemiMessageCode::LDataInd)
        .source(BUS_DEVICE)
        .apci(Apci::GroupValueWrite)
        .data(&[0x01])
        .build()
        .unwrap();
    gateway.send_data(TunnelingRequest::new(gateway.channel_id().wrapping_add(1), 0, indication));

    let counted = poll_until(WAIT, POLL_INTERVAL, || {
        (client.statistics_snapshot().errors > errors_before).then_some(())
    });
    assert!(counted.is_some());
    assert!(client.status_pool().peek(ga!(3/3/3).into()).is_none());
    // No acknowledgement for a frame of another channel
    assert_eq!(gateway.count(ServiceType::TunnelingAck), 0);
}

#[test]
fn test_gateway_connection_state_probe_is_answered() {
    let gateway = GatewaySimulator::start(Behaviour::default());
    let client = KnxClient::connect(test_config(&gateway)).unwrap();

    gateway.send_control(ConnectionStateRequest::new(
        gateway.channel_id(),
        Hpai::from(gateway.addr()),
    ));
    assert!(gateway.wait_for(ServiceType::ConnectionStateResponse, 1, WAIT));
    assert!(client.is_connected());
}

#[test]
fn test_raw_request_through_facade() {
    let gateway = GatewaySimulator::start(Behaviour::default());
    // No keep-alive competing for the connection-state slot
    let config = test_config(&gateway).with_connection_state_interval(Duration::from_secs(60));
    let client = KnxClient::connect(config).unwrap();
    let channel_id = client.channel_id().unwrap();
    let hpai = client.endpoints().control.unwrap();

    let request = Frame::new(ConnectionStateRequest::new(channel_id, hpai));
    let response = client.send_request(&request, WAIT).unwrap();
    assert!(matches!(response, Some(Body::ConnectionStateResponse(r)) if r.is_ok()));

    let pending = client.send_request_async(request, WAIT).unwrap();
    assert!(matches!(pending.wait().unwrap(), Some(Body::ConnectionStateResponse(_))));
}

#[test]
fn test_concurrent_writes_share_wrapping_sequence() {
    let gateway = GatewaySimulator::start(Behaviour {
        confirm: false,
        ..Behaviour::default()
    });
    let client = KnxClient::connect(test_config(&gateway)).unwrap();

    std::thread::scope(|scope| {
        for thread in 0..4u8 {
            let client = &client;
            scope.spawn(move || {
                for i in 0..75u8 {
                    let address = knx_link::GroupAddress::new(4, thread, i).unwrap();
                    assert!(client.write_request(address, &[i]).unwrap());
                }
            });
        }
    });

    // 300 writes run the counter past 255 back to 0
    let sequences: HashSet<u8> = gateway
        .received()
        .iter()
        .filter(|body| body.service_type() == ServiceType::TunnelingRequest)
        .filter_map(Body::sequence)
        .collect();
    assert_eq!(sequences.len(), 256);
    assert!(gateway.count(ServiceType::TunnelingRequest) >= 300);
    assert_eq!(client.session().sequence().peek(), (300 % 256) as u8);
}

#[test]
fn test_nat_mode_advertises_route_back() {
    let gateway = GatewaySimulator::start(Behaviour::default());
    let client = KnxClient::connect(test_config(&gateway).with_nat(true)).unwrap();

    assert_eq!(client.endpoints().control, Some(Hpai::UNSPECIFIED));
    let connect = gateway
        .received()
        .into_iter()
        .find_map(|body| match body {
            Body::ConnectRequest(request) => Some(request),
            _ => None,
        })
        .unwrap();
    assert!(connect.control_endpoint.is_unspecified());
    assert!(connect.data_endpoint.is_unspecified());

    assert!(client.write_request(ga!(1/2/3), &[0x01]).unwrap());
    assert!(client.close());
}

#[test]
fn test_local_endpoints_are_loopback() {
    let gateway = GatewaySimulator::start(Behaviour::default());
    let client = KnxClient::connect(test_config(&gateway)).unwrap();
    let data = client.endpoints().data.unwrap().socket_addr();
    assert!(data.ip().is_loopback());
    assert_ne!(data.port(), 0);
}
