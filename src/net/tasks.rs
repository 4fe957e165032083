//! Per-role handlers for received frames.
//!
//! | Role        | Service type                 | Handling                              |
//! |-------------|------------------------------|---------------------------------------|
//! | Discovery   | `SEARCH_RESPONSE`            | record in the correlator              |
//! | Description | `DESCRIPTION_RESPONSE`       | record in the correlator              |
//! | Control     | connect/state/disconnect responses | record in the correlator        |
//! | Control     | `CONNECTIONSTATE_REQUEST`    | answer `E_NO_ERROR`                   |
//! | Control     | `DISCONNECT_REQUEST`         | answer, then close the client         |
//! | Data        | `TUNNELING_REQUEST`          | acknowledge, update the status pool   |
//! | Data        | `TUNNELING_ACK`              | record in the correlator              |
//! | Routing     | `ROUTING_INDICATION`         | update the status pool                |
//! | Routing     | `ROUTING_LOST_MESSAGE`, `ROUTING_BUSY` | log                         |
//!
//! The NAT role carries both the control and the data tasks.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::error::Result;
use crate::knx_log;
use crate::net::communicator::{CommunicatorRole, Link};
use crate::protocol::cemi::Cemi;
use crate::protocol::constants::{Channel, CemiMessageCode, ServiceType, E_NO_ERROR};
use crate::protocol::frame::{Body, Frame};
use crate::protocol::services::{ConnectionStateResponse, DisconnectResponse};
use crate::protocol::tunnel::TunnelingAck;

/// Handler run on the receive thread for one received frame
pub type Task = fn(&Link, &Frame, SocketAddr) -> Result<()>;

pub type TaskTable = HashMap<ServiceType, Task>;

/// Task table of a communicator role
pub fn task_table(role: CommunicatorRole) -> TaskTable {
    let mut table = TaskTable::new();
    match role {
        CommunicatorRole::Discovery => {
            table.insert(ServiceType::SearchResponse, record_response);
        }
        CommunicatorRole::Description => {
            table.insert(ServiceType::DescriptionResponse, record_response);
        }
        CommunicatorRole::Control => control_tasks(&mut table),
        CommunicatorRole::Data => data_tasks(&mut table),
        CommunicatorRole::Nat => {
            control_tasks(&mut table);
            data_tasks(&mut table);
        }
        CommunicatorRole::Routing => {
            table.insert(ServiceType::RoutingIndication, routing_indication);
            table.insert(ServiceType::RoutingLostMessage, routing_lost_message);
            table.insert(ServiceType::RoutingBusy, routing_busy);
        }
    }
    table
}

fn control_tasks(table: &mut TaskTable) {
    table.insert(ServiceType::ConnectResponse, record_response);
    table.insert(ServiceType::ConnectionStateResponse, record_response);
    table.insert(ServiceType::DisconnectResponse, record_response);
    table.insert(ServiceType::ConnectionStateRequest, connection_state_requested);
    table.insert(ServiceType::DisconnectRequest, disconnect_requested);
}

fn data_tasks(table: &mut TaskTable) {
    table.insert(ServiceType::TunnelingRequest, tunneling_requested);
    table.insert(ServiceType::TunnelingAck, record_response);
}

fn record_response(link: &Link, frame: &Frame, _source: SocketAddr) -> Result<()> {
    link.context().correlator.record_response(frame.body());
    Ok(())
}

fn connection_state_requested(link: &Link, frame: &Frame, source: SocketAddr) -> Result<()> {
    let Body::ConnectionStateRequest(request) = frame.body() else {
        return Ok(());
    };
    let reply = Frame::new(ConnectionStateResponse::new(request.channel_id, E_NO_ERROR));
    link.send_to(&reply, request.control_endpoint.reply_addr(source))
}

fn disconnect_requested(link: &Link, frame: &Frame, source: SocketAddr) -> Result<()> {
    let Body::DisconnectRequest(request) = frame.body() else {
        return Ok(());
    };
    knx_log!(info, "Gateway closed channel {}", request.channel_id);
    link.context().correlator.register_inbound(frame.body());
    let reply = Frame::new(DisconnectResponse::new(request.channel_id, E_NO_ERROR));
    let sent = link.send_to(&reply, request.control_endpoint.reply_addr(source));
    link.context().session.request_close();
    sent
}

fn tunneling_requested(link: &Link, frame: &Frame, _source: SocketAddr) -> Result<()> {
    let Body::TunnelingRequest(request) = frame.body() else {
        return Ok(());
    };
    let header = request.header;
    let ack = Frame::new(TunnelingAck::new(header.channel_id, header.sequence, E_NO_ERROR));
    link.send_to(&ack, link.peer_for(Channel::Data))?;

    if !link.context().session.accept_inbound_sequence(header.sequence) {
        knx_log!(debug, "Repeated tunneling request {} acknowledged, not processed", header.sequence);
        return Ok(());
    }
    update_status(link, &request.cemi);
    Ok(())
}

fn routing_indication(link: &Link, frame: &Frame, _source: SocketAddr) -> Result<()> {
    if let Body::RoutingIndication(indication) = frame.body() {
        update_status(link, &indication.cemi);
    }
    Ok(())
}

fn routing_lost_message(_link: &Link, frame: &Frame, source: SocketAddr) -> Result<()> {
    if let Body::RoutingLostMessage(lost) = frame.body() {
        knx_log!(
            warn,
            "Router {} lost {} telegrams (device state {:#04x})",
            source,
            lost.lost_messages,
            lost.device_state
        );
    }
    Ok(())
}

fn routing_busy(_link: &Link, frame: &Frame, source: SocketAddr) -> Result<()> {
    if let Body::RoutingBusy(busy) = frame.body() {
        knx_log!(warn, "Router {} busy, pause {} ms", source, busy.wait_time_ms);
    }
    Ok(())
}

fn update_status(link: &Link, cemi: &Cemi) {
    if cemi.message_code() == CemiMessageCode::LDataCon && cemi.ctrl1().has_error() {
        knx_log!(warn, "Bus rejected telegram to {}", cemi.destination());
        return;
    }
    if link.context().status.update_from_cemi(cemi) {
        knx_log!(debug, "{} <- {:02X?} from {}", cemi.destination(), cemi.data(), cemi.source());
    }
}
