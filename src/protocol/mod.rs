//! KNXnet/IP protocol implementation.
//!
//! This module contains the frame structures and their binary codecs:
//! KNXnet/IP header and HPAI, service bodies, description blocks and the
//! cEMI telegrams carried by tunneling and routing. Everything here is pure;
//! sockets and threads live in [`crate::net`].

pub mod cemi;
pub mod constants;
pub mod dib;
pub mod frame;
pub mod services;
pub mod tunnel;

pub use cemi::*;
pub use constants::*;
pub use dib::*;
pub use frame::*;
pub use services::*;
pub use tunnel::*;
