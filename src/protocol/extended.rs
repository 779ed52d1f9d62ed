//! The extended command layer carried inside simple command `0x56`.
//!
//! A request looks like
//! `C9 36 B8 47 56 <sub> <len> <payload...> <crc_hi> <crc_lo>` and a response like
//! `AA 55 56 <len> <sub> <ack> <payload...> <crc_hi> <crc_lo>`. In both
//! directions the CRC16 covers every byte before it, so a whole packet hashes
//! to zero.

use super::{
    region, Frame, NackCode, SimpleResponse, VexExtPacketChecks, ACK, EXTENDED_COMMAND,
    EXTENDED_LENGTH_THRESHOLD, MAX_EXTENDED_PAYLOAD, REQUEST_HEADER, RESPONSE_HEADER,
};
use crate::crc::crc16;
use crate::errors::DecodeError;

/// A decoded extended response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendedResponse {
    /// The extended command id the device echoed
    pub command: u8,
    /// The raw packet with the extended regions marked
    pub frame: Frame,
}

impl ExtendedResponse {
    /// The response payload, without the ACK byte when it was checked
    pub fn data(&self) -> &[u8] {
        self.frame.region(region::DATA).unwrap_or_default()
    }

    /// The acknowledgement byte, if it was checked
    pub fn ack(&self) -> Option<u8> {
        self.frame.region(region::ACK).and_then(|a| a.first().copied())
    }
}

/// Appends the one or two byte extended length.
///
/// This appears to be a primitive varint implementation capped at two bytes.
pub(crate) fn push_length(packet: &mut Vec<u8>, length: usize) {
    if length >= EXTENDED_LENGTH_THRESHOLD {
        packet.push(((length >> 8) as u8 & 0x7f) | 0x80);
    }
    packet.push((length & 0xff) as u8);
}

/// Reads an extended length from the front of `bytes`, returning it and how many bytes it used.
fn read_length(bytes: &[u8]) -> Option<(usize, usize)> {
    let first = *bytes.first()?;
    if first & 0x80 == 0x80 {
        let second = *bytes.get(1)?;
        Some(((((first & 0x7f) as usize) << 8) | second as usize, 2))
    } else {
        Some((first as usize, 1))
    }
}

fn push_crc(packet: &mut Vec<u8>) {
    // First the upper byte, then the lower byte (big endian)
    let checksum = crc16(packet);
    packet.extend(checksum.to_be_bytes());
}

/// Encodes a host to device extended packet, wrapped in its simple packet.
pub fn encode_extended(command: u8, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    if payload.len() > MAX_EXTENDED_PAYLOAD {
        return Err(DecodeError::PayloadTooLarge(payload.len()));
    }

    // Create the simple packet containing our extended packet
    let mut packet = Vec::with_capacity(REQUEST_HEADER.len() + payload.len() + 6);
    packet.extend(REQUEST_HEADER);
    packet.push(EXTENDED_COMMAND);
    packet.push(command);
    push_length(&mut packet, payload.len());
    packet.extend_from_slice(payload);

    // The CRC covers the simple header too
    push_crc(&mut packet);
    Ok(packet)
}

/// Parses a host to device extended packet back into its command and payload.
///
/// Used when emulating a device.
pub fn parse_extended_request(packet: &[u8]) -> Result<(u8, Vec<u8>), DecodeError> {
    let prefix = REQUEST_HEADER.len() + 2;
    if packet.len() < prefix + 3 {
        return Err(DecodeError::UnexpectedLength {
            expected: prefix + 3,
            actual: packet.len(),
        });
    }
    if packet[REQUEST_HEADER.len()] != EXTENDED_COMMAND {
        return Err(DecodeError::UnexpectedCommand {
            expected: EXTENDED_COMMAND,
            actual: packet[REQUEST_HEADER.len()],
        });
    }

    let residue = crc16(packet);
    if residue != 0 {
        return Err(DecodeError::ChecksumMismatch(residue));
    }

    let command = packet[REQUEST_HEADER.len() + 1];
    let (length, used) = read_length(&packet[prefix..]).ok_or(DecodeError::UnexpectedLength {
        expected: prefix + 3,
        actual: packet.len(),
    })?;

    let start = prefix + used;
    let expected = start + length + 2;
    if packet.len() != expected {
        return Err(DecodeError::UnexpectedLength {
            expected,
            actual: packet.len(),
        });
    }

    Ok((command, packet[start..start + length].to_vec()))
}

/// Encodes a device to host extended packet.
///
/// Used when emulating a device. `ack` is omitted from the packet when `None`.
pub fn encode_extended_response(command: u8, ack: Option<u8>, data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    // Sub-command, optional ack, data, then the crc
    let length = 1 + ack.map_or(0, |_| 1) + data.len() + 2;
    if length > MAX_EXTENDED_PAYLOAD {
        return Err(DecodeError::PayloadTooLarge(data.len()));
    }

    let mut packet = Vec::with_capacity(length + 6);
    packet.extend(RESPONSE_HEADER);
    packet.push(EXTENDED_COMMAND);
    push_length(&mut packet, length);
    packet.push(command);
    packet.extend(ack);
    packet.extend_from_slice(data);

    push_crc(&mut packet);
    Ok(packet)
}

/// Validates a simple response as the extended response to `expected_command`.
///
/// The checks run in a fixed order: the CRC over the whole packet, the echoed
/// command id, the acknowledgement byte and finally the exact payload length.
/// Each is skipped when its flag is absent from `checks`; the length check
/// also needs `expected_len`.
pub fn decode_extended(
    response: SimpleResponse,
    expected_command: u8,
    checks: VexExtPacketChecks,
    expected_len: Option<usize>,
) -> Result<ExtendedResponse, DecodeError> {
    // Ensure that it is an extended packet
    if response.command != EXTENDED_COMMAND {
        return Err(DecodeError::UnexpectedCommand {
            expected: EXTENDED_COMMAND,
            actual: response.command,
        });
    }

    // If the checksum on the packet fails, then return an error
    if checks.contains(VexExtPacketChecks::CRC) {
        let residue = crc16(response.frame.raw());
        if residue != 0 {
            return Err(DecodeError::ChecksumMismatch(residue));
        }
    }

    let payload = response
        .frame
        .region_range(region::PAYLOAD)
        .unwrap_or(0..0);

    // Sub-command plus the two crc bytes at minimum
    if payload.len() < 3 {
        return Err(DecodeError::UnexpectedLength {
            expected: 3,
            actual: payload.len(),
        });
    }

    let raw = response.frame.raw();
    let command = raw[payload.start];
    if command != expected_command {
        return Err(DecodeError::UnexpectedCommand {
            expected: expected_command,
            actual: command,
        });
    }

    let mut data = payload.start + 1..payload.end - 2;
    let mut frame = response.frame.clone();
    frame.set_region(region::EXTENDED_COMMAND, payload.start..payload.start + 1);
    frame.set_region(region::CRC, payload.end - 2..payload.end);

    if checks.contains(VexExtPacketChecks::ACK) {
        let ack = *raw.get(data.start).filter(|_| !data.is_empty()).ok_or(
            DecodeError::UnexpectedLength {
                expected: 1,
                actual: 0,
            },
        )?;

        if ack != ACK {
            return Err(match NackCode::from_u8(ack) {
                Some(code) => DecodeError::DeviceRejected(code),
                None => DecodeError::UnexpectedAck(ack),
            });
        }

        frame.set_region(region::ACK, data.start..data.start + 1);
        data.start += 1;
    }

    if checks.contains(VexExtPacketChecks::LENGTH) {
        if let Some(expected) = expected_len {
            if data.len() != expected {
                return Err(DecodeError::UnexpectedLength {
                    expected,
                    actual: data.len(),
                });
            }
        }
    }

    frame.set_region(region::DATA, data);
    Ok(ExtendedResponse { command, frame })
}
