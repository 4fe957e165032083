//! Small helpers shared by the correlator, the status pool and the
//! thread-owning components.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Interval between two checks of a polled condition
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Poll `check` every `interval` until it yields a value or `timeout` elapses.
///
/// `check` runs at least once, so a zero timeout still sees a value that is
/// already present. Returns `None` when the deadline passes first.
///
/// ```
/// use std::time::Duration;
/// use knx_link::utility::poll_until;
///
/// let mut calls = 0;
/// let found = poll_until(Duration::from_millis(200), Duration::from_millis(1), || {
///     calls += 1;
///     (calls == 3).then_some(calls)
/// });
/// assert_eq!(found, Some(3));
/// ```
pub fn poll_until<T>(
    timeout: Duration,
    interval: Duration,
    mut check: impl FnMut() -> Option<T>,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = check() {
            return Some(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        std::thread::sleep(interval.min(deadline - now));
    }
}

/// Join a thread, giving up after `timeout`.
///
/// Returns `true` when the thread finished (panicked threads count as
/// finished). A thread still running at the deadline is left detached.
pub fn join_with_timeout<T>(handle: JoinHandle<T>, timeout: Duration) -> bool {
    let finished = poll_until(timeout, POLL_INTERVAL, || handle.is_finished().then_some(()));
    if finished.is_none() {
        return false;
    }
    let _ = handle.join();
    true
}

/// Local IPv4 address the OS would use to reach `remote`.
///
/// Connecting a UDP socket sends nothing; it only selects the route.
pub fn local_ip_towards(remote: SocketAddrV4) -> Option<Ipv4Addr> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    probe.connect(remote).ok()?;
    match probe.local_addr().ok()? {
        std::net::SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Some(*addr.ip()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_until_times_out() {
        let start = Instant::now();
        let result: Option<()> = poll_until(Duration::from_millis(50), POLL_INTERVAL, || None);
        let elapsed = start.elapsed();
        assert!(result.is_none());
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[test]
    fn test_poll_until_zero_timeout_checks_once() {
        let mut calls = 0;
        let result = poll_until(Duration::ZERO, POLL_INTERVAL, || {
            calls += 1;
            Some(7)
        });
        assert_eq!(result, Some(7));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_join_with_timeout() {
        let quick = std::thread::spawn(|| 1);
        assert!(join_with_timeout(quick, Duration::from_secs(1)));

        let slow = std::thread::spawn(|| std::thread::sleep(Duration::from_millis(300)));
        assert!(!join_with_timeout(slow, Duration::from_millis(20)));
    }

    #[test]
    fn test_local_ip_towards_loopback() {
        let ip = local_ip_towards(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 3671));
        assert_eq!(ip, Some(Ipv4Addr::LOCALHOST));
    }
}
