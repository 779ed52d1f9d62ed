//! Encoding and decoding of simple packets.

use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

use super::{region, Frame, EXTENDED_COMMAND, REQUEST_HEADER, RESPONSE_HEADER};
use crate::errors::DecodeError;

/// How long to back off when the channel has nothing to give us
pub(crate) const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// The response to a simple command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimpleResponse {
    /// The simple command ID the device answered
    pub command: u8,
    /// The entire response, including header and length. Used by the extended layer to verify the CRC.
    pub frame: Frame,
}

impl SimpleResponse {
    /// The payload of the simple command
    pub fn payload(&self) -> &[u8] {
        self.frame.region(region::PAYLOAD).unwrap_or_default()
    }
}

/// Encodes a host to device simple packet
///
/// # Arguments
///
/// * `command` - The simple command id of the command to send. 0x56 is Extended command
/// * `payload` - The payload of the simple command being sent
pub fn encode_simple(command: u8, payload: &[u8]) -> Vec<u8> {
    // Create the simple packet with magic number and command type
    let mut packet = Vec::with_capacity(REQUEST_HEADER.len() + 1 + payload.len());
    packet.extend(REQUEST_HEADER);
    packet.push(command);

    // And just append the payload
    packet.extend_from_slice(payload);
    packet
}

/// Encodes a device to host simple packet.
///
/// Used when emulating a device. Payloads of the extended command longer than
/// 127 bytes get the two byte length encoding, other commands are limited to 255 bytes.
pub fn encode_simple_response(command: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::from(RESPONSE_HEADER);
    packet.push(command);
    if command == EXTENDED_COMMAND {
        super::extended::push_length(&mut packet, payload.len());
    } else {
        packet.push(payload.len() as u8);
    }
    packet.extend_from_slice(payload);
    packet
}

/// Reads a single byte, treating timeouts and empty reads as "nothing yet".
pub(crate) fn poll_byte<R: Read>(stream: &mut R) -> Result<Option<u8>, DecodeError> {
    let mut b = [0u8; 1];
    match stream.read(&mut b) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(b[0])),
        Err(e) if is_idle(&e) => Ok(None),
        Err(e) => Err(DecodeError::Transport(e)),
    }
}

fn is_idle(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

/// Fills `buf` completely, giving up once `deadline` passes.
pub(crate) fn read_exact_by<R: Read>(stream: &mut R, buf: &mut [u8], deadline: Instant) -> Result<(), DecodeError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {}
            Ok(n) => {
                filled += n;
                continue;
            }
            Err(e) if is_idle(&e) => {}
            Err(e) => return Err(DecodeError::Transport(e)),
        }

        if Instant::now() >= deadline {
            return Err(DecodeError::Transport(std::io::Error::new(
                ErrorKind::TimedOut,
                format!("packet truncated after {} of {} bytes", filled, buf.len()),
            )));
        }
        std::thread::sleep(IDLE_BACKOFF);
    }
    Ok(())
}

/// Reads one device to host simple packet from `stream`.
///
/// Bytes are discarded until the `AA 55` header is seen; any mismatch
/// restarts the search. If the header does not arrive within `timeout` the
/// read fails with [`DecodeError::FrameSyncTimeout`]. The rest of the packet
/// must arrive within another `timeout`.
pub fn read_simple<R: Read>(stream: &mut R, timeout: Duration) -> Result<SimpleResponse, DecodeError> {
    // This header needs to be received within the timeout.
    let countdown = Instant::now() + timeout;

    // The index in the header we will be checking next. An unexpected byte resets it.
    let mut header_index = 0;
    while header_index < RESPONSE_HEADER.len() {
        match poll_byte(stream)? {
            Some(b) if b == RESPONSE_HEADER[header_index] => header_index += 1,
            // The mismatching byte is dropped too, even if it is 0xAA
            Some(_) => header_index = 0,
            None => {
                if Instant::now() >= countdown {
                    return Err(DecodeError::FrameSyncTimeout(timeout));
                }
                std::thread::sleep(IDLE_BACKOFF);
            }
        }
    }

    let deadline = Instant::now() + timeout;

    // Now that we know we have received the header, we need to receive the rest of the packet.
    let mut packet: Vec<u8> = Vec::from(RESPONSE_HEADER);

    // Read the command byte and the length byte
    let mut b = [0u8; 2];
    read_exact_by(stream, &mut b, deadline)?;
    packet.extend_from_slice(&b);
    let command = b[0];

    // Extended responses may use a 15 bit length
    let length = if command == EXTENDED_COMMAND && b[1] & 0x80 == 0x80 {
        let mut low = [0u8; 1];
        read_exact_by(stream, &mut low, deadline)?;
        packet.push(low[0]);

        (((b[1] & 0x7f) as usize) << 8) | low[0] as usize
    } else {
        b[1] as usize
    };
    let payload_start = packet.len();

    // Read the rest of the payload
    packet.resize(payload_start + length, 0);
    read_exact_by(stream, &mut packet[payload_start..], deadline)?;

    let mut frame = Frame::new(packet);
    frame.set_region(region::HEADER, 0..RESPONSE_HEADER.len());
    frame.set_region(region::COMMAND, 2..3);
    frame.set_region(region::LENGTH, 3..payload_start);
    frame.set_region(region::PAYLOAD, payload_start..payload_start + length);

    Ok(SimpleResponse { command, frame })
}
