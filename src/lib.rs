//! # knx-link
//!
//! KNXnet/IP client for tunneling and routing connections to KNX gateways.
//!
//! The crate is split in layers:
//!
//! - [`protocol`]: wire codec for KNXnet/IP frames and cEMI telegrams
//! - [`correlator`]: matches responses to the requests waiting for them
//! - [`net`]: UDP channels with one receive thread each, the per-role
//!   service tasks and the connection-state keep-alive
//! - [`lifecycle`]: discovery, description, connect and disconnect as one
//!   state machine
//! - [`knx_client`]: the [`KnxClient`] facade with its [`StatusPool`] and
//!   [`Statistics`]
//!
//! ## Features
//!
//! - Tunneling with discovery, NAT mode and keep-alive
//! - Routing over the KNX multicast group
//! - Last known value per group address, with dirty tracking for writes
//! - Observer plugins served from a worker pool
//! - Compile-time checked address literals ([`ga!`], [`ia!`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use knx_link::{ga, Config, KnxClient};
//!
//! // Discover a gateway on the local network and switch a light on
//! let client = KnxClient::connect(Config::default())?;
//! client.write_request(ga!(1/2/3), &[0x01])?;
//! # Ok::<(), knx_link::KnxError>(())
//! ```

pub mod addressing;
pub mod configuration;
pub mod correlator;
pub mod error;
pub mod knx_client;
pub mod knx_discovery;
pub mod lifecycle;
pub mod net;
pub mod plugin;
pub mod protocol;
pub mod statistics;
pub mod status;
pub mod utility;

// Macro modules (must be declared before use)
#[macro_use]
pub mod macros;
#[macro_use]
pub mod logging;

#[doc(hidden)]
pub use log as __log;

// Re-export commonly used types
#[doc(inline)]
pub use addressing::{GroupAddress, IndividualAddress, KnxAddress};
#[doc(inline)]
pub use configuration::{Config, TransportMode};
#[doc(inline)]
pub use error::{KnxError, Result};
#[doc(inline)]
pub use knx_client::{KnxClient, KnxClientBuilder};
#[doc(inline)]
pub use lifecycle::{ConnectionState, Session};
#[doc(inline)]
pub use plugin::Plugin;
#[doc(inline)]
pub use protocol::{Body, Cemi, Frame};
#[doc(inline)]
pub use statistics::{Statistics, StatisticsSnapshot};
#[doc(inline)]
pub use status::{StatusEntry, StatusPool};
