//! Observer plugins.
//!
//! A [`Plugin`] is notified of lifecycle transitions, of every frame sent or
//! received and of errors raised on the receive threads. Notifications are
//! queued to a small worker pool owned by the [`PluginManager`], so a slow or
//! panicking plugin never stalls protocol processing.

use core::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::KnxError;
use crate::knx_log;
use crate::protocol::frame::Frame;
use crate::utility::join_with_timeout;

/// Observer hooks; every method defaults to doing nothing.
///
/// Hooks run on a worker thread, never on the thread that produced the event.
pub trait Plugin: Send + Sync + Debug {
    /// Name used in log lines
    fn name(&self) -> &str {
        "plugin"
    }

    /// The client was created
    fn on_init(&self) {}

    /// The connection is established
    fn on_start(&self) {}

    /// The client was closed
    fn on_shutdown(&self) {}

    fn on_incoming_frame(&self, _frame: &Frame) {}

    fn on_outgoing_frame(&self, _frame: &Frame) {}

    /// An error occurred on a receive thread or in the keep-alive monitor
    fn on_error(&self, _error: &KnxError) {}
}

#[derive(Debug, Clone)]
enum PluginEvent {
    Init,
    Start,
    Shutdown,
    Incoming(Arc<Frame>),
    Outgoing(Arc<Frame>),
    Error(Arc<KnxError>),
}

impl PluginEvent {
    fn deliver(&self, plugin: &dyn Plugin) {
        match self {
            Self::Init => plugin.on_init(),
            Self::Start => plugin.on_start(),
            Self::Shutdown => plugin.on_shutdown(),
            Self::Incoming(frame) => plugin.on_incoming_frame(frame),
            Self::Outgoing(frame) => plugin.on_outgoing_frame(frame),
            Self::Error(error) => plugin.on_error(error),
        }
    }
}

type Plugins = Arc<[Arc<dyn Plugin>]>;

/// Fans events out to the registered plugins on a bounded worker pool
#[derive(Debug)]
pub struct PluginManager {
    plugins: Plugins,
    sender: Mutex<Option<Sender<PluginEvent>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PluginManager {
    /// Start `pool_size` workers (at least one) serving `plugins`.
    ///
    /// No threads are started when there is no plugin.
    pub fn new(plugins: Vec<Arc<dyn Plugin>>, pool_size: usize) -> Self {
        let plugins: Plugins = plugins.into();
        if plugins.is_empty() {
            return Self {
                plugins,
                sender: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
            };
        }

        let (sender, receiver) = mpsc::channel::<PluginEvent>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..pool_size.max(1))
            .filter_map(|index| {
                let receiver = Arc::clone(&receiver);
                let plugins = Arc::clone(&plugins);
                std::thread::Builder::new()
                    .name(format!("knx-plugin-{index}"))
                    .spawn(move || worker_loop(&receiver, &plugins))
                    .map_err(|e| knx_log!(warn, "Failed to start plugin worker: {}", e))
                    .ok()
            })
            .collect();

        Self {
            plugins,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Manager without plugins
    pub fn empty() -> Self {
        Self::new(Vec::new(), 0)
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    fn dispatch(&self, event: PluginEvent) {
        if self.plugins.is_empty() {
            return;
        }
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = sender.as_ref() {
            // Only fails once every worker is gone
            let _ = sender.send(event);
        }
    }

    pub fn notify_init(&self) {
        self.dispatch(PluginEvent::Init);
    }

    pub fn notify_start(&self) {
        self.dispatch(PluginEvent::Start);
    }

    pub fn notify_shutdown(&self) {
        self.dispatch(PluginEvent::Shutdown);
    }

    pub fn notify_incoming(&self, frame: &Frame) {
        if !self.plugins.is_empty() {
            self.dispatch(PluginEvent::Incoming(Arc::new(frame.clone())));
        }
    }

    pub fn notify_outgoing(&self, frame: &Frame) {
        if !self.plugins.is_empty() {
            self.dispatch(PluginEvent::Outgoing(Arc::new(frame.clone())));
        }
    }

    pub fn notify_error(&self, error: KnxError) {
        self.dispatch(PluginEvent::Error(Arc::new(error)));
    }

    /// Stop accepting events and wait up to `grace` for queued ones to drain.
    ///
    /// Returns `false` if a worker was still busy at the deadline.
    pub fn shutdown(&self, grace: Duration) -> bool {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let mut clean = true;
        for worker in workers {
            if !join_with_timeout(worker, grace) {
                knx_log!(warn, "Plugin worker did not stop within {:?}", grace);
                clean = false;
            }
        }
        clean
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        // Workers exit once the channel closes; no need to wait for them here
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());
    }
}

fn worker_loop(receiver: &Mutex<Receiver<PluginEvent>>, plugins: &[Arc<dyn Plugin>]) {
    loop {
        let event = {
            let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv()
        };
        let Ok(event) = event else {
            return;
        };
        for plugin in plugins {
            let result = catch_unwind(AssertUnwindSafe(|| event.deliver(plugin.as_ref())));
            if result.is_err() {
                knx_log!(error, "Plugin '{}' panicked while handling {:?}", plugin.name(), event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectionStateResponse, Frame};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Counting {
        frames: AtomicUsize,
        lifecycle: AtomicUsize,
    }

    impl Plugin for Counting {
        fn on_start(&self) {
            self.lifecycle.fetch_add(1, Ordering::SeqCst);
        }

        fn on_incoming_frame(&self, _frame: &Frame) {
            self.frames.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug)]
    struct Panicking;

    impl Plugin for Panicking {
        fn on_incoming_frame(&self, _frame: &Frame) {
            panic!("plugin failure");
        }
    }

    #[test]
    fn test_events_delivered() {
        let counting = Arc::new(Counting::default());
        let manager = PluginManager::new(vec![counting.clone() as Arc<dyn Plugin>], 2);
        let frame = Frame::new(ConnectionStateResponse::new(1, 0));

        manager.notify_start();
        for _ in 0..5 {
            manager.notify_incoming(&frame);
        }
        assert!(manager.shutdown(Duration::from_secs(2)));
        assert_eq!(counting.frames.load(Ordering::SeqCst), 5);
        assert_eq!(counting.lifecycle.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_plugin_isolated() {
        let counting = Arc::new(Counting::default());
        let manager = PluginManager::new(
            vec![Arc::new(Panicking) as Arc<dyn Plugin>, counting.clone()],
            1,
        );
        let frame = Frame::new(ConnectionStateResponse::new(1, 0));
        manager.notify_incoming(&frame);
        manager.notify_incoming(&frame);
        assert!(manager.shutdown(Duration::from_secs(2)));
        assert_eq!(counting.frames.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_empty_manager() {
        let manager = PluginManager::empty();
        manager.notify_init();
        assert_eq!(manager.plugin_count(), 0);
        assert!(manager.shutdown(Duration::from_millis(10)));
    }
}
