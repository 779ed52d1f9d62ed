//! Device state machines layered over the packet protocols.
//!
//! A [`V5Device`] is a file system: it stores, lists and runs files. A
//! [`Stm32Device`] is a bootloader: it erases flash, writes raw memory and
//! jumps into it. The legacy [`CortexDevice`] reaches a bootloader by
//! asking the robot to expose one. [`AnyDevice`] tags an opened device
//! with what it can do.

use std::io::Write;
use std::time::Duration;

use tracing::{debug, info};

use crate::commands::Command;
use crate::errors::{DecodeError, DeviceError};
use crate::io::{ByteChannel, SerialChannel};
use crate::ports::VexSerialDevice;
use crate::protocol::{hex, read_simple};
use crate::retry::RetryPolicy;
use crate::v5::{FileMetadataByIndex, FileTransferVID, SystemStatus};

pub mod cortex;
pub mod stm32;
pub mod v5;

pub use cortex::CortexDevice;
pub use stm32::Stm32Device;
pub use v5::V5Device;

/// How long a single blocking read on the system port may take
pub const SERIAL_TIMEOUT: Duration = Duration::from_millis(50);

/// How long a device has to answer an ordinary request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

/// Controllers relay over radio and answer much slower
pub const CONTROLLER_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a controller may take to reach the download channel
pub const CHANNEL_SWITCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between connection checks while switching channels
pub const CHANNEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// The order the two files of a program are written in
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum UploadOrder {
    /// Stop the running program, write the descriptor, then the binary
    #[default]
    StopThenWrite,
    /// Write the binary first, then replace the descriptor
    WriteThenReplace,
}

/// Settings shared by every device
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Base response timeout. Slow commands wait a multiple of it.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub upload_order: UploadOrder,
    /// Gzip uploads when the firmware supports it
    pub compress: bool,
    pub channel_switch_timeout: Duration,
    pub channel_poll_interval: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
            upload_order: UploadOrder::default(),
            compress: true,
            channel_switch_timeout: CHANNEL_SWITCH_TIMEOUT,
            channel_poll_interval: CHANNEL_POLL_INTERVAL,
        }
    }
}

impl DeviceConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_upload_order(mut self, order: UploadOrder) -> Self {
        self.upload_order = order;
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_channel_switch_timeout(mut self, timeout: Duration) -> Self {
        self.channel_switch_timeout = timeout;
        self
    }

    pub fn with_channel_poll_interval(mut self, interval: Duration) -> Self {
        self.channel_poll_interval = interval;
        self
    }
}

/// Progress of a chunked transfer, reported after every chunk
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    pub transferred: usize,
    pub total: usize,
}

impl TransferProgress {
    /// Completed fraction between 0 and 1
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.transferred as f32 / self.total as f32
        }
    }
}

/// Sends one command and reads its response, without retrying
pub(crate) fn exchange<Ch: ByteChannel, Cmd: Command>(
    channel: &mut Ch,
    command: &Cmd,
    timeout: Duration,
) -> Result<Cmd::Response, DecodeError> {
    if !channel.is_open() {
        return Err(DecodeError::Transport(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            format!("{} is closed", channel.name()),
        )));
    }

    let packet = command.encode_request()?;
    let timeout = timeout * command.timeout_factor();

    channel.clear_input()?;
    debug!(command = Cmd::NAME, tx = %hex(&packet), "TX");
    channel.write_all(&packet)?;
    channel.flush()?;

    let response = read_simple(channel, timeout)?;
    debug!(command = Cmd::NAME, rx = %hex(response.frame.raw()), "RX");
    command.decode_response(response)
}

/// What an opened device can do
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Capability {
    FileSystem,
    Bootloader,
}

/// A device that stores and runs named files
pub trait FileSystemDevice {
    fn status(&mut self) -> Result<SystemStatus, DeviceError>;

    fn write_program(
        &mut self,
        bin: &[u8],
        options: &v5::ProgramOptions<'_>,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), DeviceError>;

    fn write_file(
        &mut self,
        data: &[u8],
        name: &str,
        options: &v5::WriteFileOptions,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), DeviceError>;

    fn read_file(
        &mut self,
        name: &str,
        options: &v5::ReadFileOptions,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<Vec<u8>, DeviceError>;

    fn erase_file(&mut self, name: &str, vid: FileTransferVID) -> Result<(), DeviceError>;

    fn list_files(&mut self, vid: FileTransferVID) -> Result<Vec<FileMetadataByIndex>, DeviceError>;

    fn execute(&mut self, name: &str, vid: FileTransferVID) -> Result<(), DeviceError>;

    fn stop(&mut self) -> Result<(), DeviceError>;

    fn capture_screen(&mut self) -> Result<v5::Screenshot, DeviceError>;
}

/// A device that flashes raw images
pub trait BootloaderDevice {
    fn erase(&mut self, region: stm32::EraseRegion<'_>) -> Result<(), DeviceError>;

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), DeviceError>;

    fn go(&mut self, address: u32) -> Result<(), DeviceError>;

    fn write_program(
        &mut self,
        image: &[u8],
        options: &stm32::FlashOptions,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), DeviceError>;
}

/// An opened device tagged with its kind
pub enum AnyDevice<C: ByteChannel> {
    V5(V5Device<C>),
    Cortex(CortexDevice<C>),
    Stm32(Stm32Device<C>),
}

impl<C: ByteChannel> AnyDevice<C> {
    pub fn capability(&self) -> Capability {
        match self {
            AnyDevice::V5(_) => Capability::FileSystem,
            AnyDevice::Cortex(_) | AnyDevice::Stm32(_) => Capability::Bootloader,
        }
    }

    pub fn as_file_system(&mut self) -> Option<&mut dyn FileSystemDevice> {
        match self {
            AnyDevice::V5(dev) => Some(dev),
            _ => None,
        }
    }

    /// Reaches the bootloader, exposing it first on a Cortex
    pub fn into_bootloader(self) -> Result<Stm32Device<C>, DeviceError> {
        match self {
            AnyDevice::Stm32(dev) => Ok(dev),
            AnyDevice::Cortex(dev) => dev.expose_bootloader(),
            AnyDevice::V5(_) => Err(DeviceError::Unsupported("V5 devices have no bootloader")),
        }
    }
}

impl AnyDevice<SerialChannel> {
    /// Opens the system port of a discovered device
    pub fn open(device: &VexSerialDevice, config: DeviceConfig) -> Result<Self, DeviceError> {
        let port = device.system_port();
        info!(port = %port.name(), "opening device");
        let channel = SerialChannel::open(port.name(), SERIAL_TIMEOUT)?;

        Ok(match device {
            VexSerialDevice::Cortex { .. } => {
                CortexDevice::with_config(channel, config).into_connected_device()?
            }
            _ => AnyDevice::V5(V5Device::with_config(channel, config)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builders() {
        let config = DeviceConfig::default()
            .with_timeout(Duration::from_secs(1))
            .with_retry(RetryPolicy::NONE)
            .with_upload_order(UploadOrder::WriteThenReplace)
            .with_compression(false);

        assert_eq!(config.timeout, Duration::from_secs(1));
        assert_eq!(config.retry.max_attempts(), 1);
        assert_eq!(config.upload_order, UploadOrder::WriteThenReplace);
        assert!(!config.compress);
        assert_eq!(config.channel_switch_timeout, CHANNEL_SWITCH_TIMEOUT);
    }

    #[test]
    fn progress_fraction() {
        assert_eq!(TransferProgress { transferred: 0, total: 0 }.fraction(), 1.0);
        assert_eq!(TransferProgress { transferred: 50, total: 200 }.fraction(), 0.25);
    }
}
