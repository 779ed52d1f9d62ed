//! Packet framing shared by every VEX device.
//!
//! Requests are written as simple packets (`C9 36 B8 47 <command> <payload>`)
//! and responses arrive as `AA 55 <command> <length> <payload>`. Extended
//! commands travel inside simple command `0x56` with their own length field
//! and a CRC16 trailer.

use std::fmt;

use bitflags::bitflags;

mod frame;
pub use frame::{region, Frame};

pub mod simple;
pub use simple::{encode_simple, read_simple, SimpleResponse};

pub mod extended;
pub use extended::{decode_extended, encode_extended, ExtendedResponse};

/// Magic bytes that start every host to device packet
pub const REQUEST_HEADER: [u8; 4] = [0xC9, 0x36, 0xB8, 0x47];

/// Magic bytes that start every device to host packet
pub const RESPONSE_HEADER: [u8; 2] = [0xAA, 0x55];

/// The simple command carrying an extended packet
pub const EXTENDED_COMMAND: u8 = 0x56;

/// The acknowledgement byte of a successful extended command
pub const ACK: u8 = 0x76;

/// Largest payload an extended packet can carry
pub const MAX_EXTENDED_PAYLOAD: usize = 0x7FFF;

/// Lengths at or above this use the two byte length encoding
pub const EXTENDED_LENGTH_THRESHOLD: usize = 0x80;

bitflags! {
    /// These flags determine what checks decode_extended will perform
    /// on the received packet.
    pub struct VexExtPacketChecks: u8 {
        const NONE = 0b00000000;
        const ACK = 0b00000001;
        const CRC = 0b00000010;
        const LENGTH = 0b00000100;
        const ALL = Self::ACK.bits | Self::CRC.bits | Self::LENGTH.bits;
    }
}

/// Every known negative acknowledgement a V5 can answer with.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NackCode {
    General = 0xFF,
    CrcError = 0xCE,
    PayloadTooSmall = 0xD0,
    TransferSizeTooLarge = 0xD1,
    ProgramCrcError = 0xD2,
    ProgramFileError = 0xD3,
    UninitializedTransfer = 0xD4,
    InitializationInvalid = 0xD5,
    DataNotMultipleOf4 = 0xD6,
    AddressMismatch = 0xD7,
    LengthMismatch = 0xD8,
    DirectoryEntryMissing = 0xD9,
    NoFileRoom = 0xDA,
    FileExists = 0xDB,
}

impl NackCode {
    /// Every catalogued NACK, in wire order
    pub const ALL: [NackCode; 14] = [
        NackCode::General,
        NackCode::CrcError,
        NackCode::PayloadTooSmall,
        NackCode::TransferSizeTooLarge,
        NackCode::ProgramCrcError,
        NackCode::ProgramFileError,
        NackCode::UninitializedTransfer,
        NackCode::InitializationInvalid,
        NackCode::DataNotMultipleOf4,
        NackCode::AddressMismatch,
        NackCode::LengthMismatch,
        NackCode::DirectoryEntryMissing,
        NackCode::NoFileRoom,
        NackCode::FileExists,
    ];

    /// Looks up the NACK for a byte, if it is one
    pub fn from_u8(value: u8) -> Option<NackCode> {
        Self::ALL.iter().copied().find(|code| *code as u8 == value)
    }

    /// The human readable reason the device gives for this NACK
    pub fn reason(self) -> &'static str {
        match self {
            NackCode::General => "General NACK",
            NackCode::CrcError => "CRC error on recv'd packet",
            NackCode::PayloadTooSmall => "Payload too small",
            NackCode::TransferSizeTooLarge => "Request transfer size too large",
            NackCode::ProgramCrcError => "Program CRC error",
            NackCode::ProgramFileError => "Program file error",
            NackCode::UninitializedTransfer => "Attempted to download/upload uninitialized",
            NackCode::InitializationInvalid => "Initialization invalid for this function",
            NackCode::DataNotMultipleOf4 => "Data not a multiple of 4 bytes",
            NackCode::AddressMismatch => "Packet address does not match expected",
            NackCode::LengthMismatch => "Data downloaded does not match initial length",
            NackCode::DirectoryEntryMissing => "Directory entry does not exist",
            NackCode::NoFileRoom => "Max user files, no more room for another user program",
            NackCode::FileExists => "User file exists",
        }
    }

    /// NACKs caused by corruption on the wire rather than by the request itself
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            NackCode::General | NackCode::CrcError | NackCode::PayloadTooSmall
        )
    }
}

impl fmt::Display for NackCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.reason(), *self as u8)
    }
}

/// Formats bytes as space separated hex for packet logs
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nack_lookup() {
        assert_eq!(NackCode::from_u8(0xD9), Some(NackCode::DirectoryEntryMissing));
        assert_eq!(NackCode::from_u8(0xFF), Some(NackCode::General));
        assert_eq!(NackCode::from_u8(ACK), None);
        assert_eq!(NackCode::from_u8(0x00), None);
    }

    #[test]
    fn nack_reasons() {
        assert_eq!(
            NackCode::DirectoryEntryMissing.reason(),
            "Directory entry does not exist"
        );
        assert_eq!(NackCode::CrcError.reason(), "CRC error on recv'd packet");
        assert_eq!(
            NackCode::NoFileRoom.reason(),
            "Max user files, no more room for another user program"
        );
    }

    #[test]
    fn every_code_round_trips() {
        for code in NackCode::ALL {
            assert_eq!(NackCode::from_u8(code as u8), Some(code));
        }
    }

    #[test]
    fn checks_all_contains_each_flag() {
        assert!(VexExtPacketChecks::ALL.contains(VexExtPacketChecks::ACK));
        assert!(VexExtPacketChecks::ALL.contains(VexExtPacketChecks::CRC));
        assert!(VexExtPacketChecks::ALL.contains(VexExtPacketChecks::LENGTH));
    }

    #[test]
    fn hex_formatting() {
        assert_eq!(hex(&[0xAA, 0x55, 0x0F]), "aa 55 0f");
        assert_eq!(hex(&[]), "");
    }
}
