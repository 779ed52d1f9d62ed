//! The byte channel every device talks through.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use tracing::debug;

use crate::errors::DeviceError;

/// The baud rate every VEX serial port runs at
pub const BAUD_RATE: u32 = 115200;

/// A bidirectional byte stream owned by exactly one device.
///
/// Reads are expected to time out on their own so that a silent device does
/// not block forever; timed out reads should surface as
/// [`std::io::ErrorKind::TimedOut`] or return zero bytes.
pub trait ByteChannel: Read + Write + Send {
    /// A human readable name for logs, usually the port path
    fn name(&self) -> String;

    /// False once the far end has gone away
    fn is_open(&self) -> bool {
        true
    }

    /// Discards any bytes received but not yet read
    fn clear_input(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    /// Drives the RTS line, used to reset boards into their bootloader
    fn set_request_to_send(&mut self, _level: bool) -> std::io::Result<()> {
        Ok(())
    }

    /// Changes how long a single read may block
    fn set_timeout(&mut self, _timeout: Duration) -> std::io::Result<()> {
        Ok(())
    }
}

impl<C: ByteChannel + ?Sized> ByteChannel for Box<C> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn clear_input(&mut self) -> std::io::Result<()> {
        (**self).clear_input()
    }

    fn set_request_to_send(&mut self, level: bool) -> std::io::Result<()> {
        (**self).set_request_to_send(level)
    }

    fn set_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        (**self).set_timeout(timeout)
    }
}

/// A [`ByteChannel`] backed by a hardware serial port
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialChannel {
    /// Opens `path` at 115200 baud, 8N1, with the given read timeout.
    pub fn open(path: &str, timeout: Duration) -> Result<Self, DeviceError> {
        let port = serialport::new(path, BAUD_RATE)
            .parity(serialport::Parity::None)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .timeout(timeout)
            .open()?;

        debug!(port = path, "opened serial port");
        Ok(SerialChannel {
            port,
            name: path.to_string(),
        })
    }

    /// Wraps an already opened port
    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        let name = port.name().unwrap_or_else(|| "<unnamed port>".to_string());
        SerialChannel { port, name }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }
}

impl ByteChannel for SerialChannel {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn clear_input(&mut self) -> std::io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(std::io::Error::from)
    }

    fn set_request_to_send(&mut self, level: bool) -> std::io::Result<()> {
        self.port
            .write_request_to_send(level)
            .map_err(std::io::Error::from)
    }

    fn set_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        self.port.set_timeout(timeout).map_err(std::io::Error::from)
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        debug!(port = %self.name, "closing serial port");
    }
}
