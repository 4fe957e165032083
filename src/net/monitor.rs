//! Connection-state keep-alive.
//!
//! Gateways drop a tunnel that has been silent for 120 s. The monitor sends a
//! `CONNECTIONSTATE_REQUEST` every interval and asks the client to close
//! after a configured number of consecutive failed checks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{KnxError, Result};
use crate::knx_log;
use crate::net::communicator::ChannelCommunicator;
use crate::protocol::constants::status_name;
use crate::protocol::frame::{Body, Frame, Hpai};
use crate::protocol::services::ConnectionStateRequest;
use crate::utility::{join_with_timeout, poll_until, POLL_INTERVAL};

/// Keep-alive timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Time between two checks
    pub interval: Duration,
    /// Time to wait for each response
    pub timeout: Duration,
    /// Consecutive failed checks tolerated before giving up
    pub max_failures: u32,
}

/// Background keep-alive thread of a tunneling connection
#[derive(Debug)]
pub struct ConnectionStateMonitor {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    /// Longest a check in flight keeps the thread busy
    timeout: Duration,
}

impl ConnectionStateMonitor {
    /// Start checking the connection through `control`.
    ///
    /// `control_endpoint` is the HPAI announced in the connect request.
    pub fn start(
        control: Arc<ChannelCommunicator>,
        control_endpoint: Hpai,
        settings: MonitorSettings,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name("knx-keepalive".into())
            .spawn(move || monitor_loop(&control, control_endpoint, settings, &flag))?;
        Ok(Self {
            running,
            handle: Some(handle),
            timeout: settings.timeout,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the thread, waiting up to `grace` plus the response timeout, as
    /// a check in flight runs to its end.
    pub fn stop(&mut self, grace: Duration) -> bool {
        self.running.store(false, Ordering::Release);
        let wait = grace + self.timeout;
        self.handle
            .take()
            .map_or(true, |handle| join_with_timeout(handle, wait))
    }
}

impl Drop for ConnectionStateMonitor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// One connection-state exchange; `true` when the gateway confirmed the
/// channel.
pub fn check_connection(
    control: &ChannelCommunicator,
    channel_id: u8,
    control_endpoint: Hpai,
    timeout: Duration,
) -> Result<bool> {
    let request = Frame::new(ConnectionStateRequest::new(channel_id, control_endpoint));
    match control.send_request(&request, timeout)? {
        Some(Body::ConnectionStateResponse(response)) if response.is_ok() => Ok(true),
        Some(Body::ConnectionStateResponse(response)) => {
            knx_log!(warn, "Connection state check failed: {}", status_name(response.status));
            Ok(false)
        }
        _ => Ok(false),
    }
}

fn monitor_loop(
    control: &ChannelCommunicator,
    control_endpoint: Hpai,
    settings: MonitorSettings,
    running: &AtomicBool,
) {
    let stopped = || (!running.load(Ordering::Acquire)).then_some(());
    let mut failures = 0;
    loop {
        // Sleep one interval, waking early when stopped
        if poll_until(settings.interval, POLL_INTERVAL, stopped).is_some() {
            return;
        }
        let Some(channel_id) = control.link().context().session.channel_id() else {
            return;
        };

        let alive = check_connection(control, channel_id, control_endpoint, settings.timeout)
            .unwrap_or_else(|e| {
                knx_log!(warn, "Connection state request failed: {}", e);
                false
            });
        if stopped().is_some() {
            return;
        }
        if alive {
            failures = 0;
            continue;
        }

        failures += 1;
        knx_log!(warn, "Connection state check {}/{} failed", failures, settings.max_failures);
        if failures >= settings.max_failures {
            knx_log!(error, "Gateway stopped answering, closing channel {}", channel_id);
            let context = control.link().context();
            context.report(KnxError::connection_lost());
            running.store(false, Ordering::Release);
            context.session.request_close();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::communicator::{ChannelContext, CommunicatorRole};
    use crate::net::mock_transport::MockTransport;
    use crate::net::transport::Transport;
    use crate::plugin::PluginManager;
    use crate::protocol::{ConnectionStateResponse, ServiceType};
    use std::sync::atomic::AtomicUsize;

    fn control(mock: &Arc<MockTransport>) -> (Arc<ChannelCommunicator>, Arc<ChannelContext>) {
        let context = Arc::new(ChannelContext::new(Arc::new(PluginManager::empty())));
        context.session.set_channel_id(2);
        let comm = Arc::new(ChannelCommunicator::new(
            CommunicatorRole::Control,
            Arc::clone(mock) as Arc<dyn Transport>,
            "192.168.1.10:3671".parse().unwrap(),
            Arc::clone(&context),
        ));
        comm.start().unwrap();
        (comm, context)
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_millis(30),
            timeout: Duration::from_millis(50),
            max_failures: 3,
        }
    }

    #[test]
    fn test_keepalive_answered() {
        let mock = Arc::new(MockTransport::new());
        mock.set_responder(|_, to| {
            let reply = Frame::new(ConnectionStateResponse::new(2, 0));
            vec![(reply.to_bytes().unwrap().to_vec(), to)]
        });
        let (comm, context) = control(&mock);
        let mut monitor =
            ConnectionStateMonitor::start(Arc::clone(&comm), Hpai::UNSPECIFIED, settings()).unwrap();

        let checks = poll_until(Duration::from_secs(3), POLL_INTERVAL, || {
            (context.statistics.count(ServiceType::ConnectionStateResponse) >= 3).then_some(())
        });
        assert!(checks.is_some());
        assert!(monitor.is_running());
        assert!(monitor.stop(Duration::from_secs(1)));
        comm.close(Duration::from_secs(1));
    }

    #[test]
    fn test_silent_gateway_requests_close() {
        let mock = Arc::new(MockTransport::new());
        let (comm, context) = control(&mock);
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        context.session.set_close_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut monitor =
            ConnectionStateMonitor::start(Arc::clone(&comm), Hpai::UNSPECIFIED, settings()).unwrap();
        let closed = poll_until(Duration::from_secs(3), POLL_INTERVAL, || {
            (closes.load(Ordering::SeqCst) == 1).then_some(())
        });
        assert!(closed.is_some());
        assert_eq!(context.statistics.count(ServiceType::ConnectionStateRequest), 3);
        assert!(!monitor.is_running());
        assert!(monitor.stop(Duration::from_secs(1)));
        comm.close(Duration::from_secs(1));
    }

    #[test]
    fn test_stop_waits_for_check_in_flight() {
        let mock = Arc::new(MockTransport::new());
        let (comm, context) = control(&mock);
        let settings = MonitorSettings {
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(400),
            max_failures: 3,
        };
        let mut monitor =
            ConnectionStateMonitor::start(Arc::clone(&comm), Hpai::UNSPECIFIED, settings).unwrap();

        let sent = poll_until(Duration::from_secs(3), POLL_INTERVAL, || {
            (context.statistics.count(ServiceType::ConnectionStateRequest) >= 1).then_some(())
        });
        assert!(sent.is_some());
        // The unanswered request keeps the thread busy for longer than the grace
        assert!(monitor.stop(Duration::from_millis(200)));
        assert_eq!(context.statistics.count(ServiceType::ConnectionStateRequest), 1);
        comm.close(Duration::from_secs(1));
    }
}
