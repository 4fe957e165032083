//! Unified Logging Macro for knx-link
//!
//! Every log line of the crate goes through [`knx_log!`], which forwards to
//! the [`log`] facade. The application picks the backend (`env_logger` in the
//! `knx-monitor` binary, anything else in embedding programs).
//!
//! # Usage
//!
//! ```rust
//! use knx_link::knx_log;
//!
//! knx_log!(info, "Connection established");
//! knx_log!(debug, "Received {} bytes", 42);
//! knx_log!(warn, "Timeout occurred");
//! ```
//!
//! # Levels
//!
//! - `trace` - every frame in and out
//! - `debug` - dispatch decisions, dropped frames
//! - `info` - lifecycle transitions
//! - `warn` - best-effort failures (disconnect, thread join, keep-alive miss)
//! - `error` - failures that abort `start()`

/// Unified logging macro over the `log` facade.
///
/// The first token selects the level, the rest is a regular format string
/// with arguments.
#[macro_export]
macro_rules! knx_log {
    (info, $($arg:tt)*) => { $crate::__log::info!(target: "knx_link", $($arg)*) };
    (debug, $($arg:tt)*) => { $crate::__log::debug!(target: "knx_link", $($arg)*) };
    (warn, $($arg:tt)*) => { $crate::__log::warn!(target: "knx_link", $($arg)*) };
    (error, $($arg:tt)*) => { $crate::__log::error!(target: "knx_link", $($arg)*) };
    (trace, $($arg:tt)*) => { $crate::__log::trace!(target: "knx_link", $($arg)*) };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_all_levels_expand() {
        let n = 3;
        knx_log!(trace, "trace {}", n);
        knx_log!(debug, "debug {}", n);
        knx_log!(info, "info");
        knx_log!(warn, "warn {n}");
        knx_log!(error, "error {}", n);
    }
}
