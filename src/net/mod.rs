//! Sockets and threads.
//!
//! - [`transport`]: the blocking datagram [`Transport`] seam and its UDP
//!   implementation
//! - [`mock_transport`]: an in-memory transport for tests
//! - [`communicator`]: one receive thread per socket, dispatching received
//!   frames to the [`tasks`] of its role
//! - [`monitor`]: the connection-state keep-alive of tunneling connections

pub mod communicator;
pub mod mock_transport;
pub mod monitor;
pub mod tasks;
pub mod transport;

pub use communicator::{
    verify_channel_id, ChannelCommunicator, ChannelContext, CommunicatorRole, Link,
    PendingResponse, SessionState,
};
pub use mock_transport::MockTransport;
pub use monitor::{ConnectionStateMonitor, MonitorSettings};
pub use transport::{Transport, UdpTransport};
