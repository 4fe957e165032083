//! Description Information Blocks (DIBs).
//!
//! Search and description responses describe the responding device through a
//! sequence of length-prefixed blocks:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────┐
//! │ Structure Len│  DIB Type    │  Type specific data  │
//! │   (1 byte)   │   (1 byte)   │                      │
//! └──────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! The device information and supported service families blocks are decoded;
//! any other block is kept as raw bytes so it survives re-encoding.

use std::net::Ipv4Addr;

use crate::addressing::IndividualAddress;
use crate::error::{KnxError, Result};
use crate::protocol::constants::{ServiceFamily, DIB_DEVICE_INFO, DIB_SUPP_SVC_FAMILIES};
use crate::protocol::frame::require;

/// Device hardware information DIB (type 0x01, 54 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// KNX medium code (0x02 = TP1, 0x20 = IP)
    pub medium: u8,
    /// Device status (bit 0 = programming mode)
    pub device_status: u8,
    pub individual_address: IndividualAddress,
    pub project_installation_id: u16,
    pub serial_number: [u8; 6],
    /// Routing multicast address (0.0.0.0 for tunneling-only devices)
    pub multicast_address: Ipv4Addr,
    pub mac_address: [u8; 6],
    /// Friendly name, at most 30 ISO 8859-1 characters
    pub friendly_name: String,
}

impl DeviceInfo {
    /// Size of the device information DIB
    pub const SIZE: usize = 54;

    const NAME_LEN: usize = 30;

    pub fn parse(data: &[u8]) -> Result<Self> {
        require(data, Self::SIZE)?;
        if usize::from(data[0]) != Self::SIZE || data[1] != DIB_DEVICE_INFO {
            return Err(KnxError::invalid_structure());
        }

        let mut serial_number = [0u8; 6];
        serial_number.copy_from_slice(&data[8..14]);
        let mut mac_address = [0u8; 6];
        mac_address.copy_from_slice(&data[18..24]);

        // ISO 8859-1 maps byte-for-byte onto the first 256 code points
        let friendly_name = data[24..24 + Self::NAME_LEN]
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| char::from(b))
            .collect();

        Ok(Self {
            medium: data[2],
            device_status: data[3],
            individual_address: IndividualAddress::from_bytes([data[4], data[5]]),
            project_installation_id: u16::from_be_bytes([data[6], data[7]]),
            serial_number,
            multicast_address: Ipv4Addr::new(data[14], data[15], data[16], data[17]),
            mac_address,
            friendly_name,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        require(buf, Self::SIZE)?;

        buf[0] = Self::SIZE as u8;
        buf[1] = DIB_DEVICE_INFO;
        buf[2] = self.medium;
        buf[3] = self.device_status;
        buf[4..6].copy_from_slice(&self.individual_address.to_bytes());
        buf[6..8].copy_from_slice(&self.project_installation_id.to_be_bytes());
        buf[8..14].copy_from_slice(&self.serial_number);
        buf[14..18].copy_from_slice(&self.multicast_address.octets());
        buf[18..24].copy_from_slice(&self.mac_address);

        let name = &mut buf[24..24 + Self::NAME_LEN];
        name.fill(0);
        for (slot, c) in name.iter_mut().zip(self.friendly_name.chars()) {
            *slot = u8::try_from(u32::from(c)).unwrap_or(b'?');
        }

        Ok(Self::SIZE)
    }

    /// Device is in programming mode
    pub const fn programming_mode(&self) -> bool {
        self.device_status & 0x01 != 0
    }
}

/// One entry of the supported service families DIB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyVersion {
    /// Raw family id, see [`ServiceFamily`]
    pub family: u8,
    pub version: u8,
}

/// Supported service families DIB (type 0x02)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SupportedFamilies {
    pub families: heapless::Vec<FamilyVersion, 16>,
}

impl SupportedFamilies {
    /// Build from (family, version) pairs; entries beyond capacity are dropped
    pub fn new(entries: &[(ServiceFamily, u8)]) -> Self {
        let mut families = heapless::Vec::new();
        for &(family, version) in entries {
            let entry = FamilyVersion {
                family: family.to_u8(),
                version,
            };
            if families.push(entry).is_err() {
                break;
            }
        }
        Self { families }
    }

    /// Check whether the device advertises a service family
    pub fn supports(&self, family: ServiceFamily) -> bool {
        self.families.iter().any(|f| f.family == family.to_u8())
    }

    pub fn encoded_len(&self) -> usize {
        2 + 2 * self.families.len()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        require(data, 2)?;
        let len = usize::from(data[0]);
        if data[1] != DIB_SUPP_SVC_FAMILIES || len < 2 || len % 2 != 0 {
            return Err(KnxError::invalid_structure());
        }
        require(data, len)?;

        let mut families = heapless::Vec::new();
        for pair in data[2..len].chunks_exact(2) {
            families
                .push(FamilyVersion {
                    family: pair[0],
                    version: pair[1],
                })
                .map_err(|_| KnxError::payload_too_large())?;
        }
        Ok(Self { families })
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let len = self.encoded_len();
        require(buf, len)?;
        buf[0] = len as u8;
        buf[1] = DIB_SUPP_SVC_FAMILIES;
        for (chunk, f) in buf[2..len].chunks_exact_mut(2).zip(self.families.iter()) {
            chunk[0] = f.family;
            chunk[1] = f.version;
        }
        Ok(len)
    }
}

/// Any DIB this crate does not interpret, kept verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueDib {
    pub dib_type: u8,
    pub data: Vec<u8>,
}

impl OpaqueDib {
    pub fn encoded_len(&self) -> usize {
        2 + self.data.len()
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let len = self.encoded_len();
        let len_byte = u8::try_from(len).map_err(|_| KnxError::payload_too_large())?;
        require(buf, len)?;
        buf[0] = len_byte;
        buf[1] = self.dib_type;
        buf[2..len].copy_from_slice(&self.data);
        Ok(len)
    }
}

/// The DIB sequence of a search or description response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub device: DeviceInfo,
    pub families: SupportedFamilies,
    /// Additional blocks in receive order
    pub other: Vec<OpaqueDib>,
}

impl DeviceDescription {
    pub fn encoded_len(&self) -> usize {
        DeviceInfo::SIZE
            + self.families.encoded_len()
            + self.other.iter().map(OpaqueDib::encoded_len).sum::<usize>()
    }

    /// Parse a DIB sequence running to the end of `data`
    ///
    /// # Errors
    ///
    /// Fails when a block overruns the buffer or when the device information
    /// or supported families block is missing.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut device = None;
        let mut families = None;
        let mut other = Vec::new();

        let mut rest = data;
        while !rest.is_empty() {
            require(rest, 2)?;
            let len = usize::from(rest[0]);
            if len < 2 {
                return Err(KnxError::invalid_structure());
            }
            require(rest, len)?;
            let block = &rest[..len];
            match block[1] {
                DIB_DEVICE_INFO => device = Some(DeviceInfo::parse(block)?),
                DIB_SUPP_SVC_FAMILIES => families = Some(SupportedFamilies::parse(block)?),
                dib_type => other.push(OpaqueDib {
                    dib_type,
                    data: block[2..].to_vec(),
                }),
            }
            rest = &rest[len..];
        }

        match (device, families) {
            (Some(device), Some(families)) => Ok(Self {
                device,
                families,
                other,
            }),
            _ => Err(KnxError::invalid_structure()),
        }
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let mut offset = self.device.encode(buf)?;
        offset += self.families.encode(&mut buf[offset..])?;
        for dib in &self.other {
            offset += dib.encode(&mut buf[offset..])?;
        }
        Ok(offset)
    }
}
