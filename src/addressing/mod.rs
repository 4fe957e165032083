//! KNX addressing system.
//!
//! KNX uses two types of addresses:
//! - Individual addresses for physical devices (Area.Line.Device)
//! - Group addresses for logical grouping (Main/Middle/Sub or Main/Sub)
//!
//! A telegram destination can be either; [`KnxAddress`] carries the runtime
//! type so the cEMI codec can check it against the address-type bit of the
//! second control field.

use core::fmt;

use crate::error::{KnxError, Result};

pub mod group;
pub mod individual;

pub use group::GroupAddress;
pub use individual::IndividualAddress;

/// Telegram destination: group or individual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum KnxAddress {
    /// Multicast to every device listening on the group
    Group(GroupAddress),
    /// Point-to-point to one device
    Individual(IndividualAddress),
}

impl KnxAddress {
    /// Raw 16-bit value as carried on the wire.
    pub const fn raw(self) -> u16 {
        match self {
            Self::Group(a) => a.raw(),
            Self::Individual(a) => a.raw(),
        }
    }

    pub const fn is_group(self) -> bool {
        matches!(self, Self::Group(_))
    }

    /// Rebuild an address from its raw value and the type bit of a frame.
    pub const fn from_raw(raw: u16, group: bool) -> Self {
        if group {
            Self::Group(GroupAddress::from_bytes(raw.to_be_bytes()))
        } else {
            Self::Individual(IndividualAddress::from_bytes(raw.to_be_bytes()))
        }
    }
}

impl From<GroupAddress> for KnxAddress {
    fn from(addr: GroupAddress) -> Self {
        Self::Group(addr)
    }
}

impl From<IndividualAddress> for KnxAddress {
    fn from(addr: IndividualAddress) -> Self {
        Self::Individual(addr)
    }
}

impl fmt::Display for KnxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group(a) => a.fmt(f),
            Self::Individual(a) => a.fmt(f),
        }
    }
}

impl core::str::FromStr for KnxAddress {
    type Err = KnxError;

    /// `/` separated notation is a group address, `.` separated notation an
    /// individual one.
    fn from_str(s: &str) -> Result<Self> {
        if s.contains('/') {
            s.parse().map(Self::Group)
        } else if s.contains('.') {
            s.parse().map(Self::Individual)
        } else {
            Err(KnxError::invalid_group_address())
        }
    }
}
