//! KNX Individual Address.
//!
//! Individual addresses identify physical devices (and tunneling endpoints)
//! on the KNX bus. Notation: `Area.Line.Device`, e.g. `1.1.5`.
//! - Area: 0-15 (4 bits)
//! - Line: 0-15 (4 bits)
//! - Device: 0-255 (8 bits)

use crate::error::{KnxError, Result};
use core::fmt;

/// KNX Individual Address (Area.Line.Device)
///
/// ```
/// use knx_link::addressing::IndividualAddress;
///
/// let addr = IndividualAddress::new(1, 1, 5).unwrap();
/// assert_eq!(addr.to_string(), "1.1.5");
/// assert_eq!(addr.raw(), 0x1105);
///
/// let parsed: IndividualAddress = "1.1.5".parse().unwrap();
/// assert_eq!(parsed, addr);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IndividualAddress {
    raw: u16,
}

impl IndividualAddress {
    /// Maximum area value (4 bits)
    pub const MAX_AREA: u8 = 15;
    /// Maximum line value (4 bits)
    pub const MAX_LINE: u8 = 15;

    /// `0.0.0`, the address a tunneling client sends when the gateway
    /// should fill in its own tunneling address.
    pub const UNSPECIFIED: Self = Self { raw: 0 };

    /// Create an address from its components.
    ///
    /// # Errors
    ///
    /// Returns an addressing error if area or line exceed 15.
    pub fn new(area: u8, line: u8, device: u8) -> Result<Self> {
        if area > Self::MAX_AREA || line > Self::MAX_LINE {
            return Err(KnxError::address_out_of_range());
        }
        let raw = (u16::from(area) << 12) | (u16::from(line) << 8) | u16::from(device);
        Ok(Self { raw })
    }

    /// Raw 16-bit value as carried on the wire.
    #[inline(always)]
    pub const fn raw(self) -> u16 {
        self.raw
    }

    /// Area component (0-15).
    #[inline(always)]
    pub const fn area(self) -> u8 {
        ((self.raw >> 12) & 0x0F) as u8
    }

    /// Line component (0-15).
    #[inline(always)]
    pub const fn line(self) -> u8 {
        ((self.raw >> 8) & 0x0F) as u8
    }

    /// Device component (0-255).
    #[inline(always)]
    pub const fn device(self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    /// Big-endian wire representation.
    #[inline]
    pub const fn to_bytes(self) -> [u8; 2] {
        self.raw.to_be_bytes()
    }

    /// Build from the big-endian wire representation.
    #[inline]
    pub const fn from_bytes(bytes: [u8; 2]) -> Self {
        Self {
            raw: u16::from_be_bytes(bytes),
        }
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl From<u16> for IndividualAddress {
    #[inline(always)]
    fn from(raw: u16) -> Self {
        Self { raw }
    }
}

impl From<IndividualAddress> for u16 {
    #[inline(always)]
    fn from(addr: IndividualAddress) -> u16 {
        addr.raw
    }
}

impl core::str::FromStr for IndividualAddress {
    type Err = KnxError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split('.').map(|p| p.parse::<u8>().ok());
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(Some(area)), Some(Some(line)), Some(Some(device)), None) => {
                Self::new(area, line, device)
            }
            _ => Err(KnxError::invalid_individual_address()),
        }
    }
}
