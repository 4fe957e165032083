//! KNX Group Address.
//!
//! Group addresses name logical functions ("kitchen light") rather than
//! devices. Two notations exist:
//! - 3-level `Main/Middle/Sub` (e.g. `1/2/3`), the common one
//! - 2-level `Main/Sub` (e.g. `1/234`)
//!
//! Both map onto the same 16 bits: main 5 bits, middle 3 bits, sub 8 bits
//! (or 11 bits in 2-level notation).

use crate::error::{KnxError, Result};
use core::fmt;

/// KNX Group Address
///
/// ```
/// use knx_link::addressing::GroupAddress;
///
/// let addr = GroupAddress::new(1, 2, 3).unwrap();
/// assert_eq!(addr.to_string(), "1/2/3");
///
/// let two_level: GroupAddress = "1/234".parse().unwrap();
/// assert_eq!(two_level.sub_2level(), 234);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroupAddress {
    raw: u16,
}

impl GroupAddress {
    /// Maximum main group value (5 bits)
    pub const MAX_MAIN: u8 = 31;
    /// Maximum middle group value (3 bits)
    pub const MAX_MIDDLE: u8 = 7;
    /// Maximum sub value for 2-level notation (11 bits)
    pub const MAX_SUB_2LEVEL: u16 = 2047;

    /// Create a 3-level address (Main/Middle/Sub).
    ///
    /// # Errors
    ///
    /// Returns an addressing error if main exceeds 31 or middle exceeds 7.
    pub fn new(main: u8, middle: u8, sub: u8) -> Result<Self> {
        if main > Self::MAX_MAIN || middle > Self::MAX_MIDDLE {
            return Err(KnxError::address_out_of_range());
        }
        let raw = (u16::from(main) << 11) | (u16::from(middle) << 8) | u16::from(sub);
        Ok(Self { raw })
    }

    /// Create a 2-level address (Main/Sub).
    ///
    /// # Errors
    ///
    /// Returns an addressing error if main exceeds 31 or sub exceeds 2047.
    pub fn new_2level(main: u8, sub: u16) -> Result<Self> {
        if main > Self::MAX_MAIN || sub > Self::MAX_SUB_2LEVEL {
            return Err(KnxError::address_out_of_range());
        }
        Ok(Self {
            raw: (u16::from(main) << 11) | sub,
        })
    }

    /// Raw 16-bit value as carried on the wire.
    #[inline(always)]
    pub const fn raw(self) -> u16 {
        self.raw
    }

    /// Main group (0-31).
    #[inline(always)]
    pub const fn main(self) -> u8 {
        ((self.raw >> 11) & 0x1F) as u8
    }

    /// Middle group in 3-level notation (0-7).
    #[inline(always)]
    pub const fn middle(self) -> u8 {
        ((self.raw >> 8) & 0x07) as u8
    }

    /// Sub group in 3-level notation (0-255).
    #[inline(always)]
    pub const fn sub(self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    /// Sub group in 2-level notation (0-2047).
    #[inline(always)]
    pub const fn sub_2level(self) -> u16 {
        self.raw & 0x07FF
    }

    /// Format in 2-level notation (Main/Sub).
    pub fn to_string_2level(&self) -> heapless::String<16> {
        use core::fmt::Write;
        let mut s = heapless::String::new();
        // "31/2047" always fits in 16 bytes
        let _ = write!(s, "{}/{}", self.main(), self.sub_2level());
        s
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

impl From<u16> for GroupAddress {
    #[inline(always)]
    fn from(raw: u16) -> Self {
        Self { raw }
    }
}

impl From<GroupAddress> for u16 {
    #[inline(always)]
    fn from(addr: GroupAddress) -> u16 {
        addr.raw
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
    }
}

impl core::str::FromStr for GroupAddress {
    type Err = KnxError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split('/').map(|p| p.parse::<u16>().ok());
        let main = |v: u16| u8::try_from(v).map_err(|_| KnxError::address_out_of_range());
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(Some(m)), Some(Some(mid)), Some(Some(sub)), None) => {
                let sub = u8::try_from(sub).map_err(|_| KnxError::address_out_of_range())?;
                let mid = u8::try_from(mid).map_err(|_| KnxError::address_out_of_range())?;
                Self::new(main(m)?, mid, sub)
            }
            (Some(Some(m)), Some(Some(sub)), None, None) => Self::new_2level(main(m)?, sub),
            _ => Err(KnxError::invalid_group_address()),
        }
    }
}
