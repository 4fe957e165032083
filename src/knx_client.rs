//! High-level KNX client
//!
//! [`KnxClient`] bundles a [`Session`] with its status pool, statistics and
//! plugins and offers the group read/write operations most applications
//! need. Lower level traffic goes through [`KnxClient::send`] and
//! [`KnxClient::send_request`].
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use knx_link::{ga, Config, KnxClient};
//!
//! let client = KnxClient::builder()
//!     .config(Config::tunneling("192.168.1.10:3671".parse().unwrap()))
//!     .build()?;
//!
//! client.write_request(ga!(1/2/3), &[0x01])?;
//! if let Some(entry) = client.read_value(ga!(1/2/4), Duration::from_secs(2))? {
//!     println!("1/2/4 = {:02X?}", entry.data);
//! }
//! client.close();
//! # Ok::<(), knx_link::KnxError>(())
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::addressing::KnxAddress;
use crate::configuration::Config;
use crate::error::Result;
use crate::knx_log;
use crate::lifecycle::{ConnectionState, Endpoints, Session};
use crate::net::communicator::{ChannelContext, PendingResponse};
use crate::plugin::{Plugin, PluginManager};
use crate::protocol::cemi::{Apci, Cemi};
use crate::protocol::frame::{Body, Frame};
use crate::statistics::{Statistics, StatisticsSnapshot};
use crate::status::{StatusEntry, StatusPool};

/// Collects configuration and plugins, then connects
#[derive(Debug, Default)]
pub struct KnxClientBuilder {
    config: Config,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl KnxClientBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Register a plugin; plugins are notified in registration order
    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Start the plugin workers and connect.
    ///
    /// # Errors
    ///
    /// Illegal argument for an invalid configuration, otherwise whatever
    /// [`Session::start`] fails with.
    pub fn build(self) -> Result<KnxClient> {
        self.config.validate()?;
        let plugins = Arc::new(PluginManager::new(self.plugins, self.config.plugin_pool_size));
        plugins.notify_init();
        let context = Arc::new(ChannelContext::new(plugins));
        let client = KnxClient {
            session: Session::new(self.config, context),
        };
        client.session.start()?;
        Ok(client)
    }
}

/// Connected KNXnet/IP client; closes itself when dropped
#[derive(Debug)]
pub struct KnxClient {
    session: Arc<Session>,
}

impl KnxClient {
    pub fn builder() -> KnxClientBuilder {
        KnxClientBuilder::default()
    }

    /// Connect with `config` and no plugins
    pub fn connect(config: Config) -> Result<Self> {
        Self::builder().config(config).build()
    }

    fn context(&self) -> &ChannelContext {
        self.session.context()
    }

    /// Send a `GroupValueWrite` carrying `payload` to `address`.
    ///
    /// The status entry of `address` turns dirty until the bus confirms the
    /// write. Returns `false` when the gateway did not acknowledge.
    pub fn write_request(&self, address: impl Into<KnxAddress>, payload: &[u8]) -> Result<bool> {
        let address = address.into();
        let cemi = Cemi::builder(address)
            .source(self.session.config().individual_address)
            .apci(Apci::GroupValueWrite)
            .data(payload)
            .build()?;
        self.context().status.mark_dirty(address);
        knx_log!(debug, "Write {} <- {:02X?}", address, payload);
        self.session.send_cemi(cemi)
    }

    /// Send a `GroupValueRead` to `address`; the answer lands in the status
    /// pool.
    pub fn read_request(&self, address: impl Into<KnxAddress>) -> Result<bool> {
        let address = address.into();
        let cemi = Cemi::builder(address)
            .source(self.session.config().individual_address)
            .apci(Apci::GroupValueRead)
            .build()?;
        knx_log!(debug, "Read {}", address);
        self.session.send_cemi(cemi)
    }

    /// Ask the bus for the current value of `address` and wait up to
    /// `timeout` for a fresh status entry.
    ///
    /// `Ok(None)` when nobody answered in time.
    pub fn read_value(
        &self,
        address: impl Into<KnxAddress>,
        timeout: Duration,
    ) -> Result<Option<StatusEntry>> {
        let address = address.into();
        let status = &self.context().status;
        status.mark_dirty(address);
        if !self.read_request(address)? {
            return Ok(None);
        }
        Ok(status.get(address, true, timeout))
    }

    /// Send a prebuilt cEMI telegram
    pub fn send_cemi(&self, cemi: Cemi) -> Result<bool> {
        self.session.send_cemi(cemi)
    }

    /// Send a frame without waiting for an answer
    pub fn send(&self, frame: &Frame) -> Result<()> {
        self.session.send(frame)
    }

    /// Send a request frame and wait up to `timeout` for its response
    pub fn send_request(&self, frame: &Frame, timeout: Duration) -> Result<Option<Body>> {
        self.session.send_request(frame, timeout)
    }

    pub fn send_request_async(&self, frame: Frame, timeout: Duration) -> Result<PendingResponse> {
        self.session.send_request_async(frame, timeout)
    }

    pub fn status_pool(&self) -> &StatusPool {
        &self.context().status
    }

    pub fn statistics(&self) -> &Statistics {
        &self.context().statistics
    }

    pub fn statistics_snapshot(&self) -> StatisticsSnapshot {
        self.statistics().snapshot()
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_started()
    }

    /// Channel id assigned by the gateway, `None` in routing mode or once
    /// closed
    pub fn channel_id(&self) -> Option<u8> {
        self.session.channel_id()
    }

    pub fn endpoints(&self) -> Endpoints {
        self.session.endpoints()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Disconnect, stop every thread and the plugin workers.
    ///
    /// Returns `false` if some thread missed the shutdown grace period.
    /// Calling it again is harmless.
    pub fn close(&self) -> bool {
        let closed = self.session.close();
        let drained = self
            .context()
            .plugins
            .shutdown(self.session.config().shutdown_grace);
        closed && drained
    }
}

impl Drop for KnxClient {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::{RetryPolicy, Timeouts};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Lifecycle {
        inits: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    impl Plugin for Lifecycle {
        fn name(&self) -> &str {
            "lifecycle"
        }

        fn on_init(&self) {
            self.inits.fetch_add(1, Ordering::SeqCst);
        }

        fn on_shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let config = Config::default().with_retries(RetryPolicy {
            discovery: 0,
            ..Default::default()
        });
        let err = KnxClient::connect(config).unwrap_err();
        assert!(err.is_illegal_argument());
    }

    #[test]
    fn test_failed_connect_notifies_plugins() {
        let plugin = Arc::new(Lifecycle::default());
        let config = Config::tunneling(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9))
            .with_local_address(Ipv4Addr::LOCALHOST)
            .with_timeouts(Timeouts {
                description: Duration::from_millis(30),
                ..Default::default()
            })
            .with_retries(RetryPolicy {
                description: 1,
                ..Default::default()
            })
            .with_socket_timeout(Duration::from_millis(20));

        let err = KnxClient::builder()
            .config(config)
            .plugin(Arc::clone(&plugin) as Arc<dyn Plugin>)
            .build()
            .unwrap_err();
        assert!(err.is_description_not_received());

        // The client was dropped, which drained the plugin workers
        assert_eq!(plugin.inits.load(Ordering::SeqCst), 1);
        assert_eq!(plugin.shutdowns.load(Ordering::SeqCst), 1);
    }
}
