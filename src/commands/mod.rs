//! Module that contains all commands that can be sent to a V5

use crate::errors::DecodeError;
use crate::protocol::{SimpleResponse, VexExtPacketChecks};

mod file;
pub use file::*;

mod remote;
pub use remote::SwitchChannel;

mod system;
pub use system::{GetSystemStatus, GetSystemVersion, ScreenCaptureInit, UserFifoRead};

/// A command trait that every command implements
pub trait Command {
    type Response;

    /// Name used when logging the exchange
    const NAME: &'static str;

    /// Encodes the library->v5 request, header included
    fn encode_request(&self) -> Result<Vec<u8>, DecodeError>;

    /// Decodes the v5->library response
    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError>;

    /// How many multiples of the device's default timeout the response may take
    fn timeout_factor(&self) -> u32 {
        1
    }
}

/// Decodes an extended response with every check and an exact length, returning its data
pub(crate) fn checked_extended(
    response: SimpleResponse,
    command: u8,
    length: usize,
) -> Result<Vec<u8>, DecodeError> {
    let ext = crate::protocol::decode_extended(response, command, VexExtPacketChecks::ALL, Some(length))?;
    Ok(ext.data().to_vec())
}

/// Checks that a simple response answers `command` with exactly `length` payload bytes
pub(crate) fn checked_simple(
    response: &SimpleResponse,
    command: u8,
    length: usize,
) -> Result<&[u8], DecodeError> {
    if response.command != command {
        return Err(DecodeError::UnexpectedCommand {
            expected: command,
            actual: response.command,
        });
    }

    let payload = response.payload();
    if payload.len() != length {
        return Err(DecodeError::UnexpectedLength {
            expected: length,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

/// Reads little endian fields off the front of a response payload
pub(crate) struct PayloadReader<'a> {
    data: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        PayloadReader { data }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.data.len() < n {
            return Err(DecodeError::UnexpectedLength {
                expected: n,
                actual: self.data.len(),
            });
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.take(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.take(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_reader_reads_little_endian() {
        let data = [0x01, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0xFF, 0xFF, 0xAA];
        let mut reader = PayloadReader::new(&data);

        assert_eq!(reader.u8().unwrap(), 0x01);
        assert_eq!(reader.u16().unwrap(), 0x1234);
        assert_eq!(reader.u32().unwrap(), 0x1234_5678);
        assert_eq!(reader.i16().unwrap(), -1);
        assert!(matches!(
            reader.u16(),
            Err(DecodeError::UnexpectedLength { expected: 2, actual: 1 })
        ));
        assert_eq!(reader.bytes(1).unwrap(), &[0xAA]);
    }
}
