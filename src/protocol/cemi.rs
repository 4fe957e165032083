//! Common External Message Interface (cEMI) implementation.
//!
//! cEMI encapsulates one KNX bus telegram inside a tunneling request or a
//! routing indication. Only the `L_Data` service (request, confirmation,
//! indication) is handled.
//!
//! ## Frame Structure
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Message Code (1 byte)                    │
//! ├──────────────────────────────────────────┤
//! │ Additional Info Length (1 byte)          │
//! ├──────────────────────────────────────────┤
//! │ Additional Info (variable)               │
//! ├──────────────────────────────────────────┤
//! │ Service Information (L_Data)             │
//! │  ├─ Control Field 1 (1 byte)             │
//! │  ├─ Control Field 2 (1 byte)             │
//! │  ├─ Source Address (2 bytes)             │
//! │  ├─ Destination Address (2 bytes)        │
//! │  ├─ NPDU Length (1 byte)                 │
//! │  ├─ TPCI + APCI high bits (1 byte)       │
//! │  └─ APCI low bits + data (1+ bytes)      │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Payload-optimizable encoding
//!
//! `GroupValueWrite` and `GroupValueResponse` may carry a value of up to
//! 6 bits inside the APCI byte itself. A single data byte `<= 0x3F` is always
//! sent that way (NPDU length 1); anything else is appended after the APCI
//! byte (NPDU length 1 + data length).
//!
//! ```
//! use knx_link::ga;
//! use knx_link::protocol::Cemi;
//!
//! let cemi = Cemi::group_write(ga!(1/2/3), &[0x01]).unwrap();
//! let mut buf = [0u8; 32];
//! let n = cemi.encode(&mut buf).unwrap();
//! assert_eq!(&buf[..n], &[0x11, 0x00, 0x94, 0xE0, 0x00, 0x00, 0x0A, 0x03, 0x01, 0x00, 0x81]);
//! assert_eq!(Cemi::parse(&buf[..n]).unwrap(), cemi);
//! ```

use crate::addressing::{GroupAddress, IndividualAddress, KnxAddress};
use crate::error::{KnxError, Result};
use crate::protocol::constants::{
    CemiMessageCode, Priority, MAX_ADDITIONAL_INFO, MAX_APCI_DATA,
};
use crate::protocol::frame::require;

/// APCI data bytes of one telegram
pub type ApciData = heapless::Vec<u8, MAX_APCI_DATA>;

/// Control Field 1 of `L_Data` frame
///
/// ```text
/// Bit 7: Frame Type (0=extended, 1=standard)
/// Bit 6: Reserved
/// Bit 5: Repeat (0=repeat, 1=do not repeat)
/// Bit 4: System Broadcast (0=system, 1=broadcast)
/// Bit 3-2: Priority (00=system, 01=normal, 10=urgent, 11=low)
/// Bit 1: Acknowledge Request (0=no ack, 1=ack requested)
/// Bit 0: Confirm (0=no error, 1=error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlField1 {
    raw: u8,
}

impl From<u8> for ControlField1 {
    #[inline(always)]
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl ControlField1 {
    #[inline(always)]
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Standard (true) or extended (false) frame
    #[inline(always)]
    pub const fn is_standard_frame(self) -> bool {
        (self.raw & 0x80) != 0
    }

    #[inline(always)]
    pub const fn do_not_repeat(self) -> bool {
        (self.raw & 0x20) != 0
    }

    #[inline(always)]
    pub const fn is_broadcast(self) -> bool {
        (self.raw & 0x10) != 0
    }

    #[inline(always)]
    pub const fn priority(self) -> Priority {
        Priority::from_u8((self.raw >> 2) & 0x03)
    }

    #[inline(always)]
    pub const fn ack_requested(self) -> bool {
        (self.raw & 0x02) != 0
    }

    /// Confirm flag: set on an `L_Data.con` reporting a failed transmission
    #[inline(always)]
    pub const fn has_error(self) -> bool {
        (self.raw & 0x01) != 0
    }

    /// Create a new Control Field 1
    pub const fn new(
        standard_frame: bool,
        do_not_repeat: bool,
        broadcast: bool,
        priority: Priority,
        ack_requested: bool,
        has_error: bool,
    ) -> Self {
        let mut raw = 0u8;
        if standard_frame {
            raw |= 0x80;
        }
        if do_not_repeat {
            raw |= 0x20;
        }
        if broadcast {
            raw |= 0x10;
        }
        raw |= (priority.to_u8() & 0x03) << 2;
        if ack_requested {
            raw |= 0x02;
        }
        if has_error {
            raw |= 0x01;
        }
        Self { raw }
    }
}

impl Default for ControlField1 {
    /// Standard frame, repeat allowed, broadcast, normal priority (0x94)
    #[inline]
    fn default() -> Self {
        Self { raw: 0x94 }
    }
}

/// Control Field 2 of `L_Data` frame
///
/// ```text
/// Bit 7: Destination Address Type (0=individual, 1=group)
/// Bit 6-4: Hop Count (0-7)
/// Bit 3-0: Extended Frame Format (0000=standard)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlField2 {
    raw: u8,
}

impl From<u8> for ControlField2 {
    #[inline(always)]
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl ControlField2 {
    /// Default hop count for outgoing telegrams
    pub const DEFAULT_HOP_COUNT: u8 = 6;

    /// Create a new Control Field 2
    ///
    /// # Errors
    ///
    /// Out of range when `hop_count > 7` or `extended_format > 15`.
    pub fn new(is_group: bool, hop_count: u8, extended_format: u8) -> Result<Self> {
        if hop_count > 7 {
            return Err(KnxError::out_of_range(format!("hop count {hop_count} exceeds 7")));
        }
        if extended_format > 0x0F {
            return Err(KnxError::out_of_range(format!(
                "extended frame format {extended_format} exceeds 15"
            )));
        }
        let mut raw = (hop_count << 4) | extended_format;
        if is_group {
            raw |= 0x80;
        }
        Ok(Self { raw })
    }

    /// Hop count 6, standard format, address type matching `destination`
    pub const fn for_destination(destination: KnxAddress) -> Self {
        if destination.is_group() {
            Self { raw: 0xE0 }
        } else {
            Self { raw: 0x60 }
        }
    }

    #[inline(always)]
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Destination is a group address (true) or an individual one (false)
    #[inline(always)]
    pub const fn is_group_address(self) -> bool {
        (self.raw & 0x80) != 0
    }

    #[inline(always)]
    pub const fn hop_count(self) -> u8 {
        (self.raw >> 4) & 0x07
    }

    #[inline(always)]
    pub const fn extended_format(self) -> u8 {
        self.raw & 0x0F
    }
}

impl Default for ControlField2 {
    /// Group address, hop count 6, standard format (0xE0)
    #[inline]
    fn default() -> Self {
        Self { raw: 0xE0 }
    }
}

/// TPCI (Transport Layer Protocol Control Information)
///
/// Bits 7-6 of the TPCI byte select the packet type, bits 5-2 hold the
/// sequence number of numbered packets. Control packets carry a two bit
/// control code in bits 1-0 (connect, disconnect, ack, nack) and no APCI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tpci {
    /// Unnumbered Data Packet
    UnnumberedData,
    /// Numbered Data Packet with sequence number (0-15)
    NumberedData { sequence: u8 },
    /// Unnumbered Control Packet (0 = connect, 1 = disconnect)
    UnnumberedControl { control: u8 },
    /// Numbered Control Packet (2 = ack, 3 = nack)
    NumberedControl { sequence: u8, control: u8 },
}

impl Tpci {
    /// Numbered data packet
    ///
    /// # Errors
    ///
    /// Out of range when `sequence > 15`.
    pub fn numbered_data(sequence: u8) -> Result<Self> {
        Self::check_sequence(sequence)?;
        Ok(Self::NumberedData { sequence })
    }

    /// Numbered control packet
    ///
    /// # Errors
    ///
    /// Out of range when `sequence > 15` or `control > 3`.
    pub fn numbered_control(sequence: u8, control: u8) -> Result<Self> {
        Self::check_sequence(sequence)?;
        Self::check_control(control)?;
        Ok(Self::NumberedControl { sequence, control })
    }

    /// Unnumbered control packet
    ///
    /// # Errors
    ///
    /// Out of range when `control > 3`.
    pub fn unnumbered_control(control: u8) -> Result<Self> {
        Self::check_control(control)?;
        Ok(Self::UnnumberedControl { control })
    }

    fn check_sequence(sequence: u8) -> Result<()> {
        if sequence > 15 {
            return Err(KnxError::out_of_range(format!(
                "TPCI sequence {sequence} exceeds 15"
            )));
        }
        Ok(())
    }

    fn check_control(control: u8) -> Result<()> {
        if control > 3 {
            return Err(KnxError::out_of_range(format!(
                "TPCI control code {control} exceeds 3"
            )));
        }
        Ok(())
    }

    /// Range check of a directly constructed variant
    ///
    /// # Errors
    ///
    /// Out of range when the sequence exceeds 15 or the control code 3.
    pub fn validate(self) -> Result<()> {
        match self {
            Self::UnnumberedData => Ok(()),
            Self::NumberedData { sequence } => Self::check_sequence(sequence),
            Self::UnnumberedControl { control } => Self::check_control(control),
            Self::NumberedControl { sequence, control } => {
                Self::check_sequence(sequence)?;
                Self::check_control(control)
            }
        }
    }

    /// Decode the TPCI part of the TPCI byte
    pub const fn from_byte(byte: u8) -> Self {
        let sequence = (byte >> 2) & 0x0F;
        let control = byte & 0x03;
        match byte >> 6 {
            0b00 => Self::UnnumberedData,
            0b01 => Self::NumberedData { sequence },
            0b10 => Self::UnnumberedControl { control },
            _ => Self::NumberedControl { sequence, control },
        }
    }

    /// TPCI byte with the APCI bits left zero
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::UnnumberedData => 0x00,
            Self::NumberedData { sequence } => 0x40 | ((sequence & 0x0F) << 2),
            Self::UnnumberedControl { control } => 0x80 | (control & 0x03),
            Self::NumberedControl { sequence, control } => {
                0xC0 | ((sequence & 0x0F) << 2) | (control & 0x03)
            }
        }
    }

    /// Data packets carry an APCI, control packets do not
    pub const fn is_data(self) -> bool {
        matches!(self, Self::UnnumberedData | Self::NumberedData { .. })
    }
}

/// APCI (Application Layer Protocol Control Information)
///
/// The APCI is a 10-bit code spread over the TPCI byte (bits 9-8) and the
/// APCI byte (bits 7-0). Most services use only the upper 4 bits; the
/// `0x2C0` and `0x3C0` prefixes escape into 10-bit extended codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Apci {
    GroupValueRead,
    GroupValueResponse,
    GroupValueWrite,
    IndividualAddressWrite,
    IndividualAddressRead,
    IndividualAddressResponse,
    AdcRead,
    AdcResponse,
    MemoryRead,
    MemoryResponse,
    MemoryWrite,
    DeviceDescriptorRead,
    DeviceDescriptorResponse,
    Restart,
    // Extended codes, 0x2C0 family
    UserMemoryRead,
    UserMemoryResponse,
    UserMemoryWrite,
    UserManufacturerInfoRead,
    UserManufacturerInfoResponse,
    FunctionPropertyCommand,
    FunctionPropertyStateRead,
    FunctionPropertyStateResponse,
    // Extended codes, 0x3C0 family
    MemoryBitWrite,
    AuthorizeRequest,
    AuthorizeResponse,
    KeyWrite,
    KeyResponse,
    PropertyValueRead,
    PropertyValueResponse,
    PropertyValueWrite,
    PropertyDescriptionRead,
    PropertyDescriptionResponse,
    NetworkParameterRead,
    NetworkParameterResponse,
    IndividualAddressSerialNumberRead,
    IndividualAddressSerialNumberResponse,
    IndividualAddressSerialNumberWrite,
    DomainAddressWrite,
    DomainAddressRead,
    DomainAddressResponse,
    DomainAddressSelectiveRead,
    NetworkParameterWrite,
    LinkRead,
    LinkResponse,
    LinkWrite,
    /// Extended code without a dedicated variant
    Unknown(u16),
}

impl Apci {
    /// Map a 10-bit APCI code to its variant.
    ///
    /// For 4-bit services only bits 9-6 are significant.
    pub const fn from_code(code: u16) -> Self {
        let code = code & 0x3FF;
        match code & 0x3C0 {
            0x000 => Self::GroupValueRead,
            0x040 => Self::GroupValueResponse,
            0x080 => Self::GroupValueWrite,
            0x0C0 => Self::IndividualAddressWrite,
            0x100 => Self::IndividualAddressRead,
            0x140 => Self::IndividualAddressResponse,
            0x180 => Self::AdcRead,
            0x1C0 => Self::AdcResponse,
            0x200 => Self::MemoryRead,
            0x240 => Self::MemoryResponse,
            0x280 => Self::MemoryWrite,
            0x300 => Self::DeviceDescriptorRead,
            0x340 => Self::DeviceDescriptorResponse,
            0x380 => Self::Restart,
            _ => Self::from_extended(code),
        }
    }

    const fn from_extended(code: u16) -> Self {
        match code {
            0x2C0 => Self::UserMemoryRead,
            0x2C1 => Self::UserMemoryResponse,
            0x2C2 => Self::UserMemoryWrite,
            0x2C5 => Self::UserManufacturerInfoRead,
            0x2C6 => Self::UserManufacturerInfoResponse,
            0x2C7 => Self::FunctionPropertyCommand,
            0x2C8 => Self::FunctionPropertyStateRead,
            0x2C9 => Self::FunctionPropertyStateResponse,
            0x3D0 => Self::MemoryBitWrite,
            0x3D1 => Self::AuthorizeRequest,
            0x3D2 => Self::AuthorizeResponse,
            0x3D3 => Self::KeyWrite,
            0x3D4 => Self::KeyResponse,
            0x3D5 => Self::PropertyValueRead,
            0x3D6 => Self::PropertyValueResponse,
            0x3D7 => Self::PropertyValueWrite,
            0x3D8 => Self::PropertyDescriptionRead,
            0x3D9 => Self::PropertyDescriptionResponse,
            0x3DA => Self::NetworkParameterRead,
            0x3DB => Self::NetworkParameterResponse,
            0x3DC => Self::IndividualAddressSerialNumberRead,
            0x3DD => Self::IndividualAddressSerialNumberResponse,
            0x3DE => Self::IndividualAddressSerialNumberWrite,
            0x3E0 => Self::DomainAddressWrite,
            0x3E1 => Self::DomainAddressRead,
            0x3E2 => Self::DomainAddressResponse,
            0x3E3 => Self::DomainAddressSelectiveRead,
            0x3E4 => Self::NetworkParameterWrite,
            0x3E5 => Self::LinkRead,
            0x3E6 => Self::LinkResponse,
            0x3E7 => Self::LinkWrite,
            other => Self::Unknown(other),
        }
    }

    /// Decode from the TPCI byte and the APCI byte
    pub const fn from_bytes(tpci_byte: u8, apci_byte: u8) -> Self {
        Self::from_code((((tpci_byte & 0x03) as u16) << 8) | apci_byte as u16)
    }

    /// 10-bit APCI code
    pub const fn to_code(self) -> u16 {
        match self {
            Self::GroupValueRead => 0x000,
            Self::GroupValueResponse => 0x040,
            Self::GroupValueWrite => 0x080,
            Self::IndividualAddressWrite => 0x0C0,
            Self::IndividualAddressRead => 0x100,
            Self::IndividualAddressResponse => 0x140,
            Self::AdcRead => 0x180,
            Self::AdcResponse => 0x1C0,
            Self::MemoryRead => 0x200,
            Self::MemoryResponse => 0x240,
            Self::MemoryWrite => 0x280,
            Self::DeviceDescriptorRead => 0x300,
            Self::DeviceDescriptorResponse => 0x340,
            Self::Restart => 0x380,
            Self::UserMemoryRead => 0x2C0,
            Self::UserMemoryResponse => 0x2C1,
            Self::UserMemoryWrite => 0x2C2,
            Self::UserManufacturerInfoRead => 0x2C5,
            Self::UserManufacturerInfoResponse => 0x2C6,
            Self::FunctionPropertyCommand => 0x2C7,
            Self::FunctionPropertyStateRead => 0x2C8,
            Self::FunctionPropertyStateResponse => 0x2C9,
            Self::MemoryBitWrite => 0x3D0,
            Self::AuthorizeRequest => 0x3D1,
            Self::AuthorizeResponse => 0x3D2,
            Self::KeyWrite => 0x3D3,
            Self::KeyResponse => 0x3D4,
            Self::PropertyValueRead => 0x3D5,
            Self::PropertyValueResponse => 0x3D6,
            Self::PropertyValueWrite => 0x3D7,
            Self::PropertyDescriptionRead => 0x3D8,
            Self::PropertyDescriptionResponse => 0x3D9,
            Self::NetworkParameterRead => 0x3DA,
            Self::NetworkParameterResponse => 0x3DB,
            Self::IndividualAddressSerialNumberRead => 0x3DC,
            Self::IndividualAddressSerialNumberResponse => 0x3DD,
            Self::IndividualAddressSerialNumberWrite => 0x3DE,
            Self::DomainAddressWrite => 0x3E0,
            Self::DomainAddressRead => 0x3E1,
            Self::DomainAddressResponse => 0x3E2,
            Self::DomainAddressSelectiveRead => 0x3E3,
            Self::NetworkParameterWrite => 0x3E4,
            Self::LinkRead => 0x3E5,
            Self::LinkResponse => 0x3E6,
            Self::LinkWrite => 0x3E7,
            Self::Unknown(code) => code & 0x3FF,
        }
    }

    /// Uses the full 10 bits (no room for inline data)
    pub const fn is_extended(self) -> bool {
        matches!(self.to_code() & 0x3C0, 0x2C0 | 0x3C0)
    }

    /// May carry a 6-bit value inside the APCI byte
    pub const fn is_payload_optimizable(self) -> bool {
        matches!(self, Self::GroupValueWrite | Self::GroupValueResponse)
    }

    /// Carries a value worth caching for the addressed datapoint
    pub const fn carries_value(self) -> bool {
        matches!(self, Self::GroupValueWrite | Self::GroupValueResponse)
    }
}

/// cEMI `L_Data` telegram
///
/// Built through [`Cemi::builder`] or the group convenience constructors;
/// every constructed value encodes, and decodes back to itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cemi {
    message_code: CemiMessageCode,
    additional_info: heapless::Vec<u8, MAX_ADDITIONAL_INFO>,
    ctrl1: ControlField1,
    ctrl2: ControlField2,
    source: IndividualAddress,
    destination: KnxAddress,
    tpci: Tpci,
    apci: Option<Apci>,
    data: ApciData,
}

impl Cemi {
    /// Message code + add info length + ctrl1 + ctrl2 + src + dst + NPDU length + TPCI
    pub const MIN_SIZE: usize = 10;

    pub fn builder(destination: impl Into<KnxAddress>) -> CemiBuilder {
        CemiBuilder::new(destination.into())
    }

    /// `L_Data.req` group value write
    pub fn group_write(destination: GroupAddress, data: &[u8]) -> Result<Self> {
        Self::builder(destination)
            .apci(Apci::GroupValueWrite)
            .data(data)
            .build()
    }

    /// `L_Data.req` group value read
    pub fn group_read(destination: GroupAddress) -> Result<Self> {
        Self::builder(destination).apci(Apci::GroupValueRead).build()
    }

    /// `L_Data.req` group value response
    pub fn group_response(destination: GroupAddress, data: &[u8]) -> Result<Self> {
        Self::builder(destination)
            .apci(Apci::GroupValueResponse)
            .data(data)
            .build()
    }

    pub const fn message_code(&self) -> CemiMessageCode {
        self.message_code
    }

    pub fn additional_info(&self) -> &[u8] {
        &self.additional_info
    }

    pub const fn ctrl1(&self) -> ControlField1 {
        self.ctrl1
    }

    pub const fn ctrl2(&self) -> ControlField2 {
        self.ctrl2
    }

    pub const fn source(&self) -> IndividualAddress {
        self.source
    }

    pub const fn destination(&self) -> KnxAddress {
        self.destination
    }

    pub const fn tpci(&self) -> Tpci {
        self.tpci
    }

    /// `None` for transport control packets
    pub const fn apci(&self) -> Option<Apci> {
        self.apci
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Copy with a different message code (e.g. the `L_Data.con` of a request)
    #[must_use]
    pub fn with_message_code(mut self, message_code: CemiMessageCode) -> Self {
        self.message_code = message_code;
        self
    }

    /// Copy with a different source address
    #[must_use]
    pub fn with_source(mut self, source: IndividualAddress) -> Self {
        self.source = source;
        self
    }

    /// Data is carried in the low 6 bits of the APCI byte
    pub fn is_inline(&self) -> bool {
        matches!(self.apci, Some(apci) if apci.is_payload_optimizable())
            && self.data.len() == 1
            && self.data[0] <= 0x3F
    }

    /// NPDU length field: bytes following the TPCI byte
    pub fn npdu_length(&self) -> u8 {
        match self.apci {
            None => 0,
            Some(_) if self.is_inline() => 1,
            // Bounded by MAX_APCI_DATA = 254
            Some(_) => (1 + self.data.len()) as u8,
        }
    }

    pub fn encoded_len(&self) -> usize {
        Self::MIN_SIZE + self.additional_info.len() + usize::from(self.npdu_length())
    }

    /// Encode the telegram into a byte buffer
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let len = self.encoded_len();
        require(buf, len)?;

        let info_len = self.additional_info.len();
        buf[0] = self.message_code.to_u8();
        buf[1] = info_len as u8;
        buf[2..2 + info_len].copy_from_slice(&self.additional_info);

        let o = 2 + info_len;
        buf[o] = self.ctrl1.raw();
        buf[o + 1] = self.ctrl2.raw();
        buf[o + 2..o + 4].copy_from_slice(&self.source.to_bytes());
        buf[o + 4..o + 6].copy_from_slice(&self.destination.raw().to_be_bytes());
        buf[o + 6] = self.npdu_length();

        let mut tpci_byte = self.tpci.to_byte();
        if let Some(apci) = self.apci {
            let code = apci.to_code();
            tpci_byte |= ((code >> 8) & 0x03) as u8;
            let mut apci_byte = (code & 0xFF) as u8;
            if self.is_inline() {
                apci_byte |= self.data[0];
                buf[o + 8] = apci_byte;
            } else {
                buf[o + 8] = apci_byte;
                buf[o + 9..o + 9 + self.data.len()].copy_from_slice(&self.data);
            }
        }
        buf[o + 7] = tpci_byte;

        Ok(len)
    }

    /// Decode a telegram
    ///
    /// # Errors
    ///
    /// - framing error when the buffer is truncated or the message code is
    ///   not an `L_Data` one
    /// - out of range when the NPDU length disagrees with the trailing bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        require(data, 2)?;
        let message_code =
            CemiMessageCode::from_u8(data[0]).ok_or_else(KnxError::invalid_message_code)?;
        let info_len = usize::from(data[1]);
        require(data, Self::MIN_SIZE + info_len)?;
        let additional_info = heapless::Vec::from_slice(&data[2..2 + info_len])
            .map_err(|_| KnxError::payload_too_large())?;

        let o = 2 + info_len;
        let ctrl1 = ControlField1::from(data[o]);
        let ctrl2 = ControlField2::from(data[o + 1]);
        let source = IndividualAddress::from_bytes([data[o + 2], data[o + 3]]);
        let destination = KnxAddress::from_raw(
            u16::from_be_bytes([data[o + 4], data[o + 5]]),
            ctrl2.is_group_address(),
        );
        let npdu_length = usize::from(data[o + 6]);
        let tpci_byte = data[o + 7];
        let tpci = Tpci::from_byte(tpci_byte);

        let trailing = &data[o + 8..];
        if trailing.len() != npdu_length {
            return Err(KnxError::out_of_range(format!(
                "NPDU length {npdu_length} does not match {} trailing bytes",
                trailing.len()
            )));
        }

        let (apci, payload) = if tpci.is_data() {
            if npdu_length == 0 {
                return Err(KnxError::out_of_range("data packet without APCI byte"));
            }
            let apci = Apci::from_bytes(tpci_byte, trailing[0]);
            let inline = [trailing[0] & 0x3F];
            let payload = if npdu_length == 1 && apci.is_payload_optimizable() {
                &inline[..]
            } else {
                &trailing[1..]
            };
            let payload =
                ApciData::from_slice(payload).map_err(|_| KnxError::payload_too_large())?;
            (Some(apci), payload)
        } else {
            if npdu_length != 0 {
                return Err(KnxError::out_of_range(format!(
                    "control packet with NPDU length {npdu_length}"
                )));
            }
            (None, ApciData::new())
        };

        Ok(Self {
            message_code,
            additional_info,
            ctrl1,
            ctrl2,
            source,
            destination,
            tpci,
            apci,
            data: payload,
        })
    }
}

impl core::fmt::Display for Cemi {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} {} -> {}", self.message_code, self.source, self.destination)?;
        match self.apci {
            Some(apci) => write!(f, " {apci:?} {:02X?}", &self.data[..]),
            None => write!(f, " {:?}", self.tpci),
        }
    }
}

/// Builder for [`Cemi`] telegrams
///
/// Defaults: `L_Data.req`, no additional info, control field 1 = 0x94,
/// control field 2 derived from the destination type with hop count 6,
/// source `0.0.0`, unnumbered data, `GroupValueRead`, no data.
#[derive(Debug, Clone)]
pub struct CemiBuilder {
    message_code: CemiMessageCode,
    additional_info: heapless::Vec<u8, MAX_ADDITIONAL_INFO>,
    ctrl1: ControlField1,
    ctrl2: Option<ControlField2>,
    source: IndividualAddress,
    destination: KnxAddress,
    tpci: Tpci,
    apci: Option<Apci>,
    data: Option<ApciData>,
    overflow: bool,
}

impl CemiBuilder {
    fn new(destination: KnxAddress) -> Self {
        Self {
            message_code: CemiMessageCode::LDataReq,
            additional_info: heapless::Vec::new(),
            ctrl1: ControlField1::default(),
            ctrl2: None,
            source: IndividualAddress::UNSPECIFIED,
            destination,
            tpci: Tpci::UnnumberedData,
            apci: Some(Apci::GroupValueRead),
            data: Some(ApciData::new()),
            overflow: false,
        }
    }

    #[must_use]
    pub fn message_code(mut self, message_code: CemiMessageCode) -> Self {
        self.message_code = message_code;
        self
    }

    #[must_use]
    pub fn additional_info(mut self, info: &[u8]) -> Self {
        match heapless::Vec::from_slice(info) {
            Ok(v) => self.additional_info = v,
            Err(_) => self.overflow = true,
        }
        self
    }

    #[must_use]
    pub fn control1(mut self, ctrl1: ControlField1) -> Self {
        self.ctrl1 = ctrl1;
        self
    }

    /// Explicit control field 2; its address-type bit must match the destination
    #[must_use]
    pub fn control2(mut self, ctrl2: ControlField2) -> Self {
        self.ctrl2 = Some(ctrl2);
        self
    }

    #[must_use]
    pub fn source(mut self, source: IndividualAddress) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn tpci(mut self, tpci: Tpci) -> Self {
        self.tpci = tpci;
        self
    }

    #[must_use]
    pub fn apci(mut self, apci: Apci) -> Self {
        self.apci = Some(apci);
        self
    }

    /// Transport control packet: no APCI, no data
    #[must_use]
    pub fn control_packet(mut self, tpci: Tpci) -> Self {
        self.tpci = tpci;
        self.apci = None;
        self.data = Some(ApciData::new());
        self
    }

    #[must_use]
    pub fn data(mut self, data: &[u8]) -> Self {
        self.data = ApciData::from_slice(data).ok();
        self
    }

    /// Validate and build the telegram
    ///
    /// # Errors
    ///
    /// - illegal argument when control field 2 disagrees with the
    ///   destination type, when a data APCI is combined with a control TPCI
    ///   (or the reverse) or when an unknown APCI code is named or not an
    ///   extended one
    /// - out of range when data or additional info exceed their capacity, or
    ///   a TPCI field is out of range
    pub fn build(self) -> Result<Cemi> {
        let ctrl2 = self
            .ctrl2
            .unwrap_or_else(|| ControlField2::for_destination(self.destination));
        if ctrl2.is_group_address() != self.destination.is_group() {
            return Err(KnxError::illegal_argument(format!(
                "control field 2 address type does not match destination {}",
                self.destination
            )));
        }
        if self.overflow {
            return Err(KnxError::out_of_range(format!(
                "additional info exceeds {MAX_ADDITIONAL_INFO} bytes"
            )));
        }
        self.tpci.validate()?;
        let Some(mut data) = self.data else {
            return Err(KnxError::out_of_range(format!(
                "APCI data exceeds {MAX_APCI_DATA} bytes"
            )));
        };

        match self.apci {
            Some(apci) => {
                if !self.tpci.is_data() {
                    return Err(KnxError::illegal_argument("APCI on a control packet"));
                }
                // Named or non-extended codes would decode to another variant
                if let Apci::Unknown(code) = apci {
                    if Apci::from_code(code) != apci {
                        return Err(KnxError::illegal_argument(format!(
                            "APCI code {code:#05X} is not an unassigned extended code"
                        )));
                    }
                }
                // A write or response always carries its inline value
                if apci.is_payload_optimizable() && data.is_empty() {
                    let _ = data.push(0);
                }
            }
            None => {
                if self.tpci.is_data() {
                    return Err(KnxError::illegal_argument("data packet without APCI"));
                }
                if !data.is_empty() {
                    return Err(KnxError::illegal_argument("control packet with data"));
                }
            }
        }

        Ok(Cemi {
            message_code: self.message_code,
            additional_info: self.additional_info,
            ctrl1: self.ctrl1,
            ctrl2,
            source: self.source,
            destination: self.destination,
            tpci: self.tpci,
            apci: self.apci,
            data,
        })
    }
}
