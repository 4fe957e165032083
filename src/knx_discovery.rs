//! KNX gateway discovery and description.
//!
//! Discovery multicasts a `SEARCH_REQUEST` and takes the first gateway that
//! answers; description asks a known gateway for its device information and
//! service families. Each procedure opens a short-lived channel, retries up to
//! its [`RetryPolicy`](crate::configuration::RetryPolicy) budget and closes
//! the channel again.
//!
//! ## Protocol Flow
//!
//! ```text
//! Client                          Gateway
//!   |                                |
//!   |------- SEARCH_REQUEST -------->| (multicast)
//!   |<------ SEARCH_RESPONSE --------|
//!   |                                |
//!   |----- DESCRIPTION_REQUEST ----->| (unicast)
//!   |<---- DESCRIPTION_RESPONSE -----|
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use knx_link::configuration::Config;
//! use knx_link::knx_discovery::search;
//! use knx_link::net::ChannelContext;
//! use knx_link::plugin::PluginManager;
//!
//! let context = Arc::new(ChannelContext::new(Arc::new(PluginManager::empty())));
//! for gateway in search(&Config::default(), &context, Duration::from_secs(3))? {
//!     println!("{} at {}", gateway.description.device.friendly_name, gateway.control_endpoint);
//! }
//! # Ok::<(), knx_link::KnxError>(())
//! ```

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use crate::configuration::{ChannelSettings, Config};
use crate::correlator::EventKey;
use crate::error::{KnxError, Result};
use crate::knx_log;
use crate::net::communicator::{ChannelCommunicator, ChannelContext, CommunicatorRole};
use crate::protocol::constants::ServiceFamily;
use crate::protocol::dib::DeviceDescription;
use crate::protocol::frame::{Body, Frame, Hpai};
use crate::protocol::services::{DescriptionRequest, DescriptionResponse, SearchRequest};
use crate::utility::local_ip_towards;

/// A gateway that answered a search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    /// Where to send the description and connect requests
    pub control_endpoint: SocketAddrV4,
    pub description: DeviceDescription,
}

impl GatewayInfo {
    pub fn supports_tunneling(&self) -> bool {
        self.description.families.supports(ServiceFamily::Tunneling)
    }

    pub fn supports_routing(&self) -> bool {
        self.description.families.supports(ServiceFamily::Routing)
    }
}

/// Local interface address used to reach `remote`
pub(crate) fn local_interface(config: &Config, remote: SocketAddrV4) -> Ipv4Addr {
    config
        .local_address
        .or_else(|| local_ip_towards(remote))
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}

/// HPAI to advertise for `communicator`: its bound address, or the NAT
/// route-back endpoint when `nat` is set.
pub(crate) fn advertised_hpai(communicator: &ChannelCommunicator, nat: bool) -> Result<Hpai> {
    if nat {
        return Ok(Hpai::UNSPECIFIED);
    }
    match communicator.local_addr()? {
        SocketAddr::V4(local) => Ok(Hpai::from(local)),
        SocketAddr::V6(local) => Err(KnxError::illegal_argument(format!(
            "{local} is not an IPv4 endpoint"
        ))),
    }
}

/// Time to wait for a receive thread to notice it was stopped
pub(crate) fn close_grace(config: &Config, settings: &ChannelSettings) -> Duration {
    config.shutdown_grace + settings.socket_timeout
}

fn open_channel(
    config: &Config,
    context: &Arc<ChannelContext>,
    role: CommunicatorRole,
    settings: &ChannelSettings,
    peer: SocketAddrV4,
) -> Result<ChannelCommunicator> {
    let local = SocketAddrV4::new(local_interface(config, peer), settings.port);
    ChannelCommunicator::bind(
        role,
        local,
        settings.socket_timeout,
        SocketAddr::V4(peer),
        Arc::clone(context),
    )
}

/// Run `exchange` on a fresh channel and close the channel whatever the outcome
fn with_channel<T>(
    config: &Config,
    context: &Arc<ChannelContext>,
    role: CommunicatorRole,
    settings: &ChannelSettings,
    peer: SocketAddrV4,
    exchange: impl FnOnce(&ChannelCommunicator) -> Result<T>,
) -> Result<T> {
    let channel = open_channel(config, context, role, settings, peer)?;
    let result = exchange(&channel);
    if !channel.close(close_grace(config, settings)) {
        knx_log!(warn, "{} channel did not stop in time", role);
    }
    result
}

fn gateway_from(body: &Body) -> Option<GatewayInfo> {
    match body {
        Body::SearchResponse(response) => Some(GatewayInfo {
            control_endpoint: response.control_endpoint.socket_addr(),
            description: response.description.clone(),
        }),
        _ => None,
    }
}

/// Find the first gateway answering a search.
///
/// # Errors
///
/// Discovery not received after `retries.discovery` unanswered searches,
/// carrying the search request.
pub fn discover(config: &Config, context: &Arc<ChannelContext>) -> Result<GatewayInfo> {
    let endpoint = config.discovery_endpoint;
    with_channel(config, context, CommunicatorRole::Discovery, &config.discovery, endpoint, |channel| {
        let request = Frame::new(SearchRequest::new(advertised_hpai(channel, config.nat)?));
        for attempt in 1..=config.retries.discovery {
            knx_log!(debug, "Searching gateways via {} ({}/{})", endpoint, attempt, config.retries.discovery);
            let response = channel.send_request(&request, config.timeouts.search)?;
            if let Some(gateway) = response.as_ref().and_then(gateway_from) {
                knx_log!(
                    info,
                    "Discovered '{}' at {}",
                    gateway.description.device.friendly_name,
                    gateway.control_endpoint
                );
                return Ok(gateway);
            }
        }
        knx_log!(error, "No gateway answered {} searches", config.retries.discovery);
        Err(KnxError::discovery_not_received(Some(request.into_body())))
    })
}

/// Send one search and collect every gateway answering within `window`,
/// in arrival order.
pub fn search(
    config: &Config,
    context: &Arc<ChannelContext>,
    window: Duration,
) -> Result<Vec<GatewayInfo>> {
    let endpoint = config.discovery_endpoint;
    with_channel(config, context, CommunicatorRole::Discovery, &config.discovery, endpoint, |channel| {
        let request = Frame::new(SearchRequest::new(advertised_hpai(channel, config.nat)?));
        context.correlator.register(request.body())?;
        channel.send(&request)?;
        std::thread::sleep(window);
        Ok(context
            .correlator
            .slot(EventKey::Search)
            .responses()
            .iter()
            .filter_map(gateway_from)
            .collect())
    })
}

/// Ask `remote` for its description.
///
/// Returns the request sent alongside the response so callers can report
/// both.
fn exchange_description(
    config: &Config,
    context: &Arc<ChannelContext>,
    remote: SocketAddrV4,
) -> Result<(Frame, DescriptionResponse)> {
    with_channel(config, context, CommunicatorRole::Description, &config.description, remote, |channel| {
        let request = Frame::new(DescriptionRequest::new(advertised_hpai(channel, config.nat)?));
        for attempt in 1..=config.retries.description {
            knx_log!(debug, "Describing {} ({}/{})", remote, attempt, config.retries.description);
            if let Some(Body::DescriptionResponse(response)) =
                channel.send_request(&request, config.timeouts.description)?
            {
                return Ok((request, response));
            }
        }
        Err(KnxError::description_not_received(Some(request.into_body())))
    })
}

/// Description of the device at `remote`
///
/// # Errors
///
/// Description not received after `retries.description` attempts.
pub fn describe(
    config: &Config,
    context: &Arc<ChannelContext>,
    remote: SocketAddrV4,
) -> Result<DescriptionResponse> {
    exchange_description(config, context, remote).map(|(_, response)| response)
}

/// Describe `remote` and require the tunneling service family.
///
/// # Errors
///
/// Tunneling not supported (never retried) when the device lacks the family,
/// otherwise the errors of [`describe`].
pub fn describe_for_tunneling(
    config: &Config,
    context: &Arc<ChannelContext>,
    remote: SocketAddrV4,
) -> Result<DeviceDescription> {
    let (request, response) = exchange_description(config, context, remote)?;
    if !response.description.families.supports(ServiceFamily::Tunneling) {
        knx_log!(
            error,
            "'{}' at {} does not support tunneling",
            response.description.device.friendly_name,
            remote
        );
        return Err(KnxError::tunneling_not_supported(request.into_body(), response.into()));
    }
    Ok(response.description)
}
