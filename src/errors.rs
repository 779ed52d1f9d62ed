use std::time::Duration;

use thiserror::Error;

use crate::protocol::NackCode;

/// Errors raised while framing, sending or decoding a packet
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The byte channel failed underneath us
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// No `AA 55` sync header arrived before the deadline
    #[error("no response header received within {0:?}")]
    FrameSyncTimeout(Duration),
    /// The received frame did not hash to zero
    #[error("checksum mismatch (residue {0:#06x})")]
    ChecksumMismatch(u16),
    /// The device answered with a known NACK
    #[error("device rejected request: {0}")]
    DeviceRejected(NackCode),
    /// The acknowledgement byte was neither an ACK nor a known NACK
    #[error("unexpected acknowledgement byte {0:#04x}")]
    UnexpectedAck(u8),
    /// The payload was not the size the command expects
    #[error("unexpected payload length: expected {expected} bytes, got {actual}")]
    UnexpectedLength { expected: usize, actual: usize },
    /// The device answered a different command than the one sent
    #[error("expected a response to command {expected:#04x}, got {actual:#04x}")]
    UnexpectedCommand { expected: u8, actual: u8 },
    /// Extended payloads are limited to a 15 bit length
    #[error("payload of {0} bytes is too large for an extended packet")]
    PayloadTooLarge(usize),
    /// The system version named a product we do not know
    #[error("unknown product type {0:#04x}")]
    UnknownProduct(u8),
}

impl DecodeError {
    /// Returns true if sending the same request again may succeed.
    ///
    /// Transport failures and logical rejections are surfaced immediately.
    /// Lost sync, truncated packets, corruption and transient NACKs are worth
    /// another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            DecodeError::Transport(e) => e.kind() == std::io::ErrorKind::TimedOut,
            DecodeError::PayloadTooLarge(_) | DecodeError::UnknownProduct(_) => false,
            DecodeError::DeviceRejected(code) => code.is_transient(),
            DecodeError::FrameSyncTimeout(_)
            | DecodeError::ChecksumMismatch(_)
            | DecodeError::UnexpectedAck(_)
            | DecodeError::UnexpectedLength { .. }
            | DecodeError::UnexpectedCommand { .. } => true,
        }
    }
}

/// Errors raised by device level operations
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("serial port error: {0}")]
    SerialportError(#[from] serialport::Error),
    #[error("not a recognized VEX device")]
    InvalidDevice,
    /// The STM32 bootloader did not acknowledge a command
    #[error("bootloader did not acknowledge command {command:#04x}")]
    NoAck { command: u8 },
    /// The STM32 bootloader explicitly refused a command
    #[error("bootloader refused command {command:#04x}")]
    BootloaderNack { command: u8 },
    #[error("program of {size} bytes exceeds the {max} bytes available")]
    ProgramTooLarge { size: usize, max: usize },
    #[error("device allocated {allocated} bytes for a {requested} byte transfer")]
    AllocationTooSmall { requested: usize, allocated: usize },
    #[error("controller is not connected to a brain")]
    ControllerNotConnected,
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error("invalid file name {0:?}: names must be ASCII")]
    InvalidFileName(String),
    #[error("invalid program descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("compression failed: {0}")]
    Compression(std::io::Error),
}

impl From<std::io::Error> for DeviceError {
    fn from(e: std::io::Error) -> Self {
        DeviceError::Decode(DecodeError::Transport(e))
    }
}

impl DeviceError {
    /// Returns true if the failed operation may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeviceError::Decode(e) => e.is_retryable(),
            DeviceError::NoAck { .. } => true,
            _ => false,
        }
    }

    /// The NACK the device answered with, if that is why the operation failed
    pub fn nack(&self) -> Option<NackCode> {
        match self {
            DeviceError::Decode(DecodeError::DeviceRejected(code)) => Some(*code),
            _ => None,
        }
    }
}
