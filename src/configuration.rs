//! Client configuration.
//!
//! [`Config::default`] holds the KNXnet/IP defaults; chained `with_*` setters
//! adjust single values. A configuration can also be read from a `KEY=VALUE`
//! text block, one entry per line, `#` starting a comment:
//!
//! ```text
//! KNX_GATEWAY_IP=192.168.1.10
//! KNX_GATEWAY_PORT=3671
//! KNX_NAT=true
//! KNX_TIMEOUT_CONNECT_MS=5000
//! ```
//!
//! ```
//! use knx_link::configuration::{Config, TransportMode};
//!
//! let config = Config::from_properties("KNX_GATEWAY_IP=192.168.1.10\nKNX_NAT=true").unwrap();
//! assert_eq!(config.mode, TransportMode::Tunneling);
//! assert!(config.nat);
//! assert_eq!(config.remote_endpoint.unwrap().port(), 3671);
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;

use crate::addressing::IndividualAddress;
use crate::error::{KnxError, Result};
use crate::protocol::constants::{KNXNETIP_DEFAULT_PORT, KNXNETIP_MULTICAST_ADDR};

/// How telegrams reach the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportMode {
    /// Unicast session with a tunneling server
    #[default]
    Tunneling,
    /// Multicast to every router on the network
    Routing,
}

impl FromStr for TransportMode {
    type Err = KnxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tunneling" | "tunnelling" => Ok(Self::Tunneling),
            "routing" => Ok(Self::Routing),
            other => Err(KnxError::illegal_argument(format!("unknown transport mode '{other}'"))),
        }
    }
}

/// Socket settings of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelSettings {
    /// Local port, 0 for an ephemeral one
    pub port: u16,
    /// Receive timeout of the socket; bounds how long the receive loop takes
    /// to notice a shutdown, unrelated to protocol timeouts
    pub socket_timeout: Duration,
}

impl ChannelSettings {
    pub const fn new(port: u16) -> Self {
        Self {
            port,
            socket_timeout: Duration::from_millis(100),
        }
    }
}

/// Response timeouts per exchange kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timeouts {
    pub search: Duration,
    pub description: Duration,
    pub connect: Duration,
    pub connection_state: Duration,
    pub disconnect: Duration,
    pub tunneling: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            search: Duration::from_secs(3),
            description: Duration::from_secs(10),
            connect: Duration::from_secs(10),
            connection_state: Duration::from_secs(10),
            disconnect: Duration::from_secs(10),
            tunneling: Duration::from_secs(1),
        }
    }
}

/// Attempt budgets per exchange kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// Search requests sent before discovery fails
    pub discovery: u8,
    /// Description requests sent before description fails
    pub description: u8,
    /// Connect requests sent before the channel id is declared not received
    pub connect: u8,
    /// Consecutive keep-alive failures tolerated before disconnecting
    pub connection_state: u8,
    /// Transmissions of one tunneling request without acknowledgement
    pub tunneling_attempts: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            discovery: 3,
            description: 3,
            connect: 3,
            connection_state: 3,
            tunneling_attempts: 2,
        }
    }
}

/// Complete client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    pub mode: TransportMode,
    /// Advertise the `0.0.0.0:0` route-back endpoint and use a single
    /// socket for control and data
    pub nat: bool,
    /// Control endpoint of the tunneling server; `None` runs discovery
    pub remote_endpoint: Option<SocketAddrV4>,
    /// Where search requests are sent
    pub discovery_endpoint: SocketAddrV4,
    /// Multicast group used in routing mode
    pub routing_endpoint: SocketAddrV4,
    /// Local interface address; `None` picks the one routing to the peer
    pub local_address: Option<Ipv4Addr>,
    pub control: ChannelSettings,
    pub data: ChannelSettings,
    pub discovery: ChannelSettings,
    pub description: ChannelSettings,
    pub routing: ChannelSettings,
    pub timeouts: Timeouts,
    pub retries: RetryPolicy,
    /// Period of the connection-state keep-alive
    pub connection_state_interval: Duration,
    pub plugin_pool_size: usize,
    /// How long `close` waits for background threads
    pub shutdown_grace: Duration,
    /// Source address of outgoing telegrams (0.0.0 lets the server fill it in)
    pub individual_address: IndividualAddress,
}

impl Default for Config {
    fn default() -> Self {
        let multicast = SocketAddrV4::new(KNXNETIP_MULTICAST_ADDR, KNXNETIP_DEFAULT_PORT);
        Self {
            mode: TransportMode::Tunneling,
            nat: false,
            remote_endpoint: None,
            discovery_endpoint: multicast,
            routing_endpoint: multicast,
            local_address: None,
            control: ChannelSettings::new(0),
            data: ChannelSettings::new(0),
            discovery: ChannelSettings::new(0),
            description: ChannelSettings::new(0),
            routing: ChannelSettings::new(KNXNETIP_DEFAULT_PORT),
            timeouts: Timeouts::default(),
            retries: RetryPolicy::default(),
            connection_state_interval: Duration::from_secs(60),
            plugin_pool_size: 2,
            shutdown_grace: Duration::from_secs(1),
            individual_address: IndividualAddress::UNSPECIFIED,
        }
    }
}

impl Config {
    /// Tunneling to a known server
    pub fn tunneling(remote: SocketAddrV4) -> Self {
        Self::default().with_remote_endpoint(remote)
    }

    /// Routing over the standard multicast group
    pub fn routing() -> Self {
        Self::default().with_mode(TransportMode::Routing)
    }

    #[must_use]
    pub fn with_mode(mut self, mode: TransportMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_nat(mut self, nat: bool) -> Self {
        self.nat = nat;
        self
    }

    #[must_use]
    pub fn with_remote_endpoint(mut self, remote: SocketAddrV4) -> Self {
        self.remote_endpoint = Some(remote);
        self
    }

    #[must_use]
    pub fn with_discovery_endpoint(mut self, endpoint: SocketAddrV4) -> Self {
        self.discovery_endpoint = endpoint;
        self
    }

    #[must_use]
    pub fn with_routing_endpoint(mut self, endpoint: SocketAddrV4) -> Self {
        self.routing_endpoint = endpoint;
        self
    }

    #[must_use]
    pub fn with_local_address(mut self, address: Ipv4Addr) -> Self {
        self.local_address = Some(address);
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn with_retries(mut self, retries: RetryPolicy) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn with_connection_state_interval(mut self, interval: Duration) -> Self {
        self.connection_state_interval = interval;
        self
    }

    #[must_use]
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        for channel in [
            &mut self.control,
            &mut self.data,
            &mut self.discovery,
            &mut self.description,
            &mut self.routing,
        ] {
            channel.socket_timeout = timeout;
        }
        self
    }

    #[must_use]
    pub fn with_plugin_pool_size(mut self, size: usize) -> Self {
        self.plugin_pool_size = size;
        self
    }

    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    #[must_use]
    pub fn with_individual_address(mut self, address: IndividualAddress) -> Self {
        self.individual_address = address;
        self
    }

    /// Check values that would make the client misbehave
    ///
    /// # Errors
    ///
    /// Illegal argument for a zero attempt budget, a zero socket timeout
    /// (blocking receive loops could never stop) or a zero keep-alive period.
    pub fn validate(&self) -> Result<()> {
        let r = &self.retries;
        if [r.discovery, r.description, r.connect, r.connection_state, r.tunneling_attempts]
            .contains(&0)
        {
            return Err(KnxError::illegal_argument("retry budgets must be at least 1"));
        }
        for channel in [
            &self.control,
            &self.data,
            &self.discovery,
            &self.description,
            &self.routing,
        ] {
            if channel.socket_timeout.is_zero() {
                return Err(KnxError::illegal_argument("socket timeout must not be zero"));
            }
        }
        if self.connection_state_interval.is_zero() {
            return Err(KnxError::illegal_argument(
                "connection-state interval must not be zero",
            ));
        }
        Ok(())
    }

    /// Read a configuration from `KEY=VALUE` lines, starting from the defaults.
    ///
    /// Unknown keys are ignored so one file can carry settings of the
    /// embedding application too.
    ///
    /// # Errors
    ///
    /// Illegal argument when a known key holds a value that does not parse.
    pub fn from_properties(text: &str) -> Result<Self> {
        let mut config = Self::default();
        let mut gateway_ip: Option<Ipv4Addr> = None;
        let mut gateway_port = KNXNETIP_DEFAULT_PORT;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(KnxError::illegal_argument(format!("malformed line '{line}'")));
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "KNX_MODE" => config.mode = value.parse()?,
                "KNX_NAT" => config.nat = parse_value(key, value)?,
                "KNX_GATEWAY_IP" => gateway_ip = Some(parse_value(key, value)?),
                "KNX_GATEWAY_PORT" => gateway_port = parse_value(key, value)?,
                "KNX_LOCAL_ADDRESS" => config.local_address = Some(parse_value(key, value)?),
                "KNX_DISCOVERY_ENDPOINT" => config.discovery_endpoint = parse_value(key, value)?,
                "KNX_ROUTING_ENDPOINT" => config.routing_endpoint = parse_value(key, value)?,
                "KNX_CONTROL_PORT" => config.control.port = parse_value(key, value)?,
                "KNX_DATA_PORT" => config.data.port = parse_value(key, value)?,
                "KNX_DISCOVERY_PORT" => config.discovery.port = parse_value(key, value)?,
                "KNX_DESCRIPTION_PORT" => config.description.port = parse_value(key, value)?,
                "KNX_ROUTING_PORT" => config.routing.port = parse_value(key, value)?,
                "KNX_SOCKET_TIMEOUT_MS" => {
                    config = config.with_socket_timeout(parse_millis(key, value)?);
                }
                "KNX_TIMEOUT_SEARCH_MS" => config.timeouts.search = parse_millis(key, value)?,
                "KNX_TIMEOUT_DESCRIPTION_MS" => {
                    config.timeouts.description = parse_millis(key, value)?;
                }
                "KNX_TIMEOUT_CONNECT_MS" => config.timeouts.connect = parse_millis(key, value)?,
                "KNX_TIMEOUT_CONNECTION_STATE_MS" => {
                    config.timeouts.connection_state = parse_millis(key, value)?;
                }
                "KNX_TIMEOUT_DISCONNECT_MS" => {
                    config.timeouts.disconnect = parse_millis(key, value)?;
                }
                "KNX_TIMEOUT_TUNNELING_MS" => config.timeouts.tunneling = parse_millis(key, value)?,
                "KNX_RETRIES_DISCOVERY" => config.retries.discovery = parse_value(key, value)?,
                "KNX_RETRIES_DESCRIPTION" => config.retries.description = parse_value(key, value)?,
                "KNX_RETRIES_CONNECT" => config.retries.connect = parse_value(key, value)?,
                "KNX_RETRIES_CONNECTION_STATE" => {
                    config.retries.connection_state = parse_value(key, value)?;
                }
                "KNX_TUNNELING_ATTEMPTS" => {
                    config.retries.tunneling_attempts = parse_value(key, value)?;
                }
                "KNX_CONNECTION_STATE_INTERVAL_S" => {
                    config.connection_state_interval =
                        Duration::from_secs(parse_value(key, value)?);
                }
                "KNX_PLUGIN_POOL_SIZE" => config.plugin_pool_size = parse_value(key, value)?,
                "KNX_SHUTDOWN_GRACE_MS" => config.shutdown_grace = parse_millis(key, value)?,
                "KNX_INDIVIDUAL_ADDRESS" => config.individual_address = value.parse()?,
                _ => {}
            }
        }

        if let Some(ip) = gateway_ip {
            config.remote_endpoint = Some(SocketAddrV4::new(ip, gateway_port));
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| KnxError::illegal_argument(format!("invalid value '{value}' for {key}")))
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    parse_value(key, value).map(Duration::from_millis)
}
