//! Implements commands that deal directly with the V5 system

use super::{checked_extended, checked_simple, Command, PayloadReader};
use crate::errors::{DecodeError, DeviceError};
use crate::protocol::{
    decode_extended, encode_extended, encode_simple, SimpleResponse, VexExtPacketChecks,
};
use crate::v5::{FirmwareVersion, SystemStatus, V5ControllerChannel, V5SystemVersion, VexProductType};

/// Asks the brain or controller for its firmware version and product type
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GetSystemVersion();

impl Command for GetSystemVersion {
    type Response = V5SystemVersion;
    const NAME: &'static str = "get system version";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        // Just encode an empty command with id 0xA4
        Ok(encode_simple(0xA4, &[]))
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        let v = checked_simple(&response, 0xA4, 8)?;

        // An unknown product byte means we are not talking to a V5 at all
        let product_type = VexProductType::try_from((v[5], v[6]))
            .map_err(|_: DeviceError| DecodeError::UnknownProduct(v[5]))?;

        Ok(V5SystemVersion {
            system_version: FirmwareVersion::new(v[0], v[1], v[2], v[3]),
            beta: v[4],
            product_type,
        })
    }
}

/// Asks the brain for the versions of its firmware components
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GetSystemStatus();

impl Command for GetSystemStatus {
    type Response = SystemStatus;
    const NAME: &'static str = "get system status";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        encode_extended(0x22, &[])
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        let data = checked_extended(response, 0x22, 33)?;
        let mut reader = PayloadReader::new(&data);

        reader.skip(1)?;
        let system_version = FirmwareVersion::from_bytes(reader.array()?);
        let cpu0_version = FirmwareVersion::from_bytes(reader.array()?);
        let cpu1_version = FirmwareVersion::from_bytes(reader.array()?);
        reader.skip(3)?;

        Ok(SystemStatus {
            system_version,
            cpu0_version,
            cpu1_version,
            touch_version: reader.u8()?,
            system_id: reader.u32()?,
        })
    }
}

/// Copies the current screen into the screen transfer target
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ScreenCaptureInit();

impl Command for ScreenCaptureInit {
    type Response = ();
    const NAME: &'static str = "screen capture init";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        encode_extended(0x28, &[])
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        checked_extended(response, 0x28, 0).map(|_| ())
    }
}

/// Reads up to `length` bytes of user program output over the system port.
///
/// Used when no user port exists, as with a controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UserFifoRead {
    pub length: u8,
}

impl Default for UserFifoRead {
    fn default() -> Self {
        UserFifoRead { length: 0x40 }
    }
}

impl Command for UserFifoRead {
    type Response = Vec<u8>;
    const NAME: &'static str = "user fifo read";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        encode_extended(0x27, &[V5ControllerChannel::Download as u8, self.length])
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        // The amount returned varies with how much output is waiting
        let ext = decode_extended(
            response,
            0x27,
            VexExtPacketChecks::ACK | VexExtPacketChecks::CRC,
            None,
        )?;

        // The first byte echoes the channel
        Ok(ext.data().get(1..).unwrap_or_default().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use super::*;
    use crate::protocol::extended::encode_extended_response;
    use crate::protocol::simple::encode_simple_response;
    use crate::protocol::{read_simple, ACK};
    use crate::v5::V5ControllerFlags;

    fn read(packet: Vec<u8>) -> SimpleResponse {
        read_simple(&mut Cursor::new(packet), Duration::from_millis(20)).unwrap()
    }

    #[test]
    fn system_version() {
        let response = read(encode_simple_response(0xA4, &[1, 1, 2, 3, 4, 0x11, 0x02, 0]));
        let version = GetSystemVersion().decode_response(response).unwrap();

        assert_eq!(version.system_version, FirmwareVersion::new(1, 1, 2, 3));
        assert_eq!(version.beta, 4);
        assert_eq!(
            version.product_type,
            VexProductType::V5Controller(V5ControllerFlags::CONNECTED_WIRELESS)
        );
    }

    #[test]
    fn system_version_wrong_length() {
        let response = read(encode_simple_response(0xA4, &[1, 2, 3]));
        assert!(matches!(
            GetSystemVersion().decode_response(response),
            Err(DecodeError::UnexpectedLength { expected: 8, actual: 3 })
        ));
    }

    #[test]
    fn system_status() {
        let mut data = vec![0xEE];
        data.extend([1, 0, 5, 0]);
        data.extend([1, 0, 0, 22]);
        data.extend([1, 0, 0, 30]);
        data.extend([0, 0, 0]);
        data.push(9);
        data.extend(0x1234_5678u32.to_le_bytes());
        data.extend([0u8; 12]);

        let response = read(encode_extended_response(0x22, Some(ACK), &data).unwrap());
        let status = GetSystemStatus().decode_response(response).unwrap();

        assert_eq!(status.system_version, FirmwareVersion::new(1, 0, 5, 0));
        assert_eq!(status.cpu0_version, FirmwareVersion::new(1, 0, 0, 22));
        assert_eq!(status.cpu1_version, FirmwareVersion::new(1, 0, 0, 30));
        assert_eq!(status.touch_version, 9);
        assert_eq!(status.system_id, 0x1234_5678);
        assert!(status.can_compress());
    }

    #[test]
    fn user_fifo_strips_channel() {
        let response = read(encode_extended_response(0x27, Some(ACK), &[0x01, b'h', b'i']).unwrap());
        assert_eq!(UserFifoRead::default().decode_response(response).unwrap(), b"hi".to_vec());

        let empty = read(encode_extended_response(0x27, Some(ACK), &[]).unwrap());
        assert!(UserFifoRead::default().decode_response(empty).unwrap().is_empty());
    }
}
