//! A V5 brain or controller reached over its system port.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{DeviceConfig, FileSystemDevice, TransferProgress, CONTROLLER_TIMEOUT};
use crate::commands::{
    Command, EraseFile, ExecuteFile, GetDirectoryCount, GetFileMetadataByIndex,
    GetFileMetadataByName, GetProgramSlot, GetSystemStatus, GetSystemVersion, ScreenCaptureInit,
    SetFileMetadata, SwitchChannel, UserFifoRead, ERASE_ALL, EXECUTE_STOP,
};
use crate::errors::{DecodeError, DeviceError};
use crate::io::ByteChannel;
use crate::v5::{
    encode_file_name, FileMetadataByIndex, FileMetadataByName, FileTransferTarget,
    FileTransferVID, SystemStatus, V5ControllerChannel, V5SystemVersion, VexProductType,
};

mod program;
mod relay;
mod transfer;

pub use program::{LinkedLibrary, ProgramDescriptor, ProgramOptions, PROGRAM_SLOTS};
pub use relay::{RelayReader, WirelessRelay};
pub use transfer::{plan_chunks, ReadFileOptions, WriteFileOptions};

/// Visible columns of the brain's screen
pub const SCREEN_WIDTH: usize = 480;

/// Columns in the screen buffer, including the hidden ones
pub const SCREEN_STRIDE: usize = 512;

pub const SCREEN_HEIGHT: usize = 272;

/// An RGB capture of the brain's screen
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Screenshot {
    pub width: usize,
    pub height: usize,
    /// Row major, three bytes per pixel
    pub rgb: Vec<u8>,
}

impl Screenshot {
    /// Converts the raw screen buffer of little endian ARGB words
    pub fn from_argb(buffer: &[u8]) -> Self {
        let mut rgb = Vec::with_capacity(SCREEN_WIDTH * SCREEN_HEIGHT * 3);
        for row in buffer.chunks(SCREEN_STRIDE * 4).take(SCREEN_HEIGHT) {
            for px in row.chunks_exact(4).take(SCREEN_WIDTH) {
                let argb = u32::from_le_bytes([px[0], px[1], px[2], px[3]]);
                rgb.push((argb >> 16) as u8);
                rgb.push((argb >> 8) as u8);
                rgb.push(argb as u8);
            }
        }

        Screenshot {
            width: SCREEN_WIDTH,
            height: rgb.len() / (SCREEN_WIDTH * 3),
            rgb,
        }
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y * self.width + x) * 3;
        Some([self.rgb[i], self.rgb[i + 1], self.rgb[i + 2]])
    }
}

/// The representation of a V5 device
pub struct V5Device<C: ByteChannel> {
    channel: C,
    config: DeviceConfig,
    status: Option<SystemStatus>,
    product: Option<VexProductType>,
    fifo: Vec<u8>,
}

impl<C: ByteChannel> V5Device<C> {
    pub fn new(channel: C) -> Self {
        Self::with_config(channel, DeviceConfig::default())
    }

    pub fn with_config(channel: C, config: DeviceConfig) -> Self {
        V5Device {
            channel,
            config,
            status: None,
            product: None,
            fifo: Vec::new(),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut DeviceConfig {
        &mut self.config
    }

    pub fn channel_name(&self) -> String {
        self.channel.name()
    }

    /// Releases the device, handing the channel back
    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Sends a command and receives its response, exactly once
    pub fn exchange<Cmd: Command>(&mut self, command: &Cmd) -> Result<Cmd::Response, DecodeError> {
        super::exchange(&mut self.channel, command, self.config.timeout)
    }

    /// Sends a command and receives its response, retrying under the device's policy
    pub fn send_request<Cmd: Command>(&mut self, command: &Cmd) -> Result<Cmd::Response, DeviceError> {
        let retry = self.config.retry;
        Ok(retry.run(Cmd::NAME, |_| self.exchange(command))?)
    }

    /// Checks that a V5 is listening and reports what it is
    pub fn query_system_version(&mut self) -> Result<V5SystemVersion, DeviceError> {
        let version = self.send_request(&GetSystemVersion())?;
        self.product = Some(version.product_type);
        Ok(version)
    }

    /// True if the last version query came from a controller linked over radio
    pub fn is_wireless(&self) -> bool {
        self.product.map_or(false, |p| p.is_connected_controller())
    }

    /// Queries the firmware versions of the brain and caches them
    pub fn system_status(&mut self) -> Result<SystemStatus, DeviceError> {
        let status = self.send_request(&GetSystemStatus())?;
        info!(
            system = %status.system_version,
            cpu0 = %status.cpu0_version,
            cpu1 = %status.cpu1_version,
            "brain status"
        );
        self.status = Some(status);
        Ok(status)
    }

    /// The cached status, queried on first use
    pub fn status(&mut self) -> Result<SystemStatus, DeviceError> {
        match self.status {
            Some(status) => Ok(status),
            None => self.system_status(),
        }
    }

    pub fn switch_channel(&mut self, channel: V5ControllerChannel) -> Result<(), DeviceError> {
        self.send_request(&SwitchChannel(channel))
    }

    /// Runs `op` with a controller moved onto the download channel.
    ///
    /// Brains need no switching and run `op` directly. A controller must be
    /// linked to a brain, and is switched back to the pit channel afterwards
    /// whether or not `op` succeeded.
    pub fn with_download_channel<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        let saved_timeout = match self.begin_download_session()? {
            Some(saved_timeout) => saved_timeout,
            None => return op(self),
        };

        let result = op(self);
        let restore = self.end_download_session(saved_timeout);

        match (result, restore) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), restore) => {
                if let Err(restore) = restore {
                    warn!(error = %restore, "could not restore pit channel");
                }
                Err(e)
            }
        }
    }

    /// Moves a linked controller onto the download channel.
    ///
    /// Returns the timeout to restore afterwards, or `None` for a brain,
    /// which needs no switching. A failed switch is undone before returning.
    pub(crate) fn begin_download_session(&mut self) -> Result<Option<Duration>, DeviceError> {
        let version = self.query_system_version()?;
        if !matches!(version.product_type, VexProductType::V5Controller(_)) {
            return Ok(None);
        }
        if !version.product_type.is_connected_controller() {
            return Err(DeviceError::ControllerNotConnected);
        }

        let saved_timeout = self.config.timeout;
        self.config.timeout = saved_timeout.max(CONTROLLER_TIMEOUT);

        info!("transferring controller to download channel");
        match self.enter_download_channel() {
            Ok(()) => Ok(Some(saved_timeout)),
            Err(e) => {
                if let Err(restore) = self.end_download_session(saved_timeout) {
                    warn!(error = %restore, "could not restore pit channel");
                }
                Err(e)
            }
        }
    }

    /// Puts the controller back on the pit channel
    pub(crate) fn end_download_session(&mut self, saved_timeout: Duration) -> Result<(), DeviceError> {
        let restore = self.switch_channel(V5ControllerChannel::Pit);
        self.config.timeout = saved_timeout;
        info!("controller back on pit channel");
        restore
    }

    fn enter_download_channel(&mut self) -> Result<(), DeviceError> {
        self.switch_channel(V5ControllerChannel::Download)?;
        std::thread::sleep(self.config.channel_poll_interval);

        let deadline = Instant::now() + self.config.channel_switch_timeout;
        loop {
            if self.query_system_version()?.product_type.is_connected_controller() {
                debug!("controller reached download channel");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::ControllerNotConnected);
            }
            std::thread::sleep(self.config.channel_poll_interval);
        }
    }

    pub fn get_dir_count(&mut self, vid: FileTransferVID) -> Result<u16, DeviceError> {
        self.send_request(&GetDirectoryCount { vid, options: 0 })
    }

    pub fn get_file_metadata_by_idx(&mut self, idx: u8) -> Result<FileMetadataByIndex, DeviceError> {
        self.send_request(&GetFileMetadataByIndex { idx, options: 0 })
    }

    /// Lists every file in a VID. The count primes the index lookups.
    pub fn list_files(&mut self, vid: FileTransferVID) -> Result<Vec<FileMetadataByIndex>, DeviceError> {
        let count = self.get_dir_count(vid)?;
        debug!(count, ?vid, "listing files");

        (0..count.min(u8::MAX as u16 + 1))
            .map(|idx| self.get_file_metadata_by_idx(idx as u8))
            .collect()
    }

    pub fn get_file_metadata_by_name(
        &mut self,
        name: &str,
        vid: FileTransferVID,
    ) -> Result<FileMetadataByName, DeviceError> {
        let name = encode_file_name(name)?;
        self.send_request(&GetFileMetadataByName { vid, options: 0, name })
    }

    /// Rewrites a file's metadata, leaving fields set to `0xFF..` untouched
    pub fn set_program_file_metadata(&mut self, metadata: &SetFileMetadata) -> Result<(), DeviceError> {
        self.send_request(metadata)
    }

    /// Erases a file. `erase_all` also removes files linked to it.
    pub fn erase_file(
        &mut self,
        name: &str,
        vid: FileTransferVID,
        erase_all: bool,
    ) -> Result<(), DeviceError> {
        let erase = EraseFile {
            vid,
            options: if erase_all { ERASE_ALL } else { 0 },
            name: encode_file_name(name)?,
        };
        info!(name, "erasing file");

        // The brain only commits the erase once the transfer is closed
        let retry = self.config.retry;
        Ok(retry.run("erase file", |_| {
            self.exchange(&erase)?;
            self.exchange(&crate::commands::FileTransferExit(
                crate::v5::FileTransferComplete::DoNothing,
            ))
        })?)
    }

    pub fn get_program_file_slot(&mut self, name: &str, vid: FileTransferVID) -> Result<u8, DeviceError> {
        let name = encode_file_name(name)?;
        self.send_request(&GetProgramSlot { vid, options: 0, name })
    }

    /// Runs the named program, or stops the running one when `run` is false
    pub fn execute_program_file(
        &mut self,
        name: &str,
        vid: FileTransferVID,
        run: bool,
    ) -> Result<(), DeviceError> {
        info!(name, run, "executing program file");
        let name = encode_file_name(name)?;
        let options = if run { 0 } else { EXECUTE_STOP };
        self.send_request(&ExecuteFile { vid, options, name })
    }

    pub fn stop_program(&mut self) -> Result<(), DeviceError> {
        self.execute_program_file("", FileTransferVID::User, false)
    }

    /// Captures the brain's screen
    pub fn capture_screen(&mut self) -> Result<Screenshot, DeviceError> {
        self.with_download_channel(|dev| {
            dev.send_request(&ScreenCaptureInit())?;

            let options = ReadFileOptions {
                vid: FileTransferVID::System,
                target: FileTransferTarget::Screen,
                addr: Some(0),
                length: Some(SCREEN_STRIDE * SCREEN_HEIGHT * 4),
            };
            let buffer = dev.read_file("", &options, &mut |_| {})?;
            Ok(Screenshot::from_argb(&buffer))
        })
    }

    /// Reports the program name stored in each slot's descriptor
    pub fn used_slots(&mut self) -> Result<BTreeMap<u8, Option<String>>, DeviceError> {
        let mut slots = BTreeMap::new();
        for slot in 1..=PROGRAM_SLOTS {
            let descriptor = self.read_ini(&format!("slot_{slot}.ini"))?;
            slots.insert(slot, descriptor.map(|d| d.name));
        }
        Ok(slots)
    }

    /// Reads and parses a program descriptor. A missing file is `None`.
    pub fn read_ini(&mut self, name: &str) -> Result<Option<ProgramDescriptor>, DeviceError> {
        match self.read_file(name, &ReadFileOptions::default(), &mut |_| {}) {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                ProgramDescriptor::from_ini(&text).map(Some)
            }
            Err(e) if e.nack().is_some() => {
                debug!(name, error = %e, "no descriptor");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Reads user program output over the system port.
    ///
    /// Output is buffered until a `0x00` delimiter arrives; the buffered
    /// bytes up to and including it are returned. Empty until then.
    pub fn user_fifo_read(&mut self) -> Result<Vec<u8>, DeviceError> {
        let data = self.send_request(&UserFifoRead::default())?;
        self.fifo.extend(data);

        match self.fifo.iter().position(|b| *b == 0) {
            Some(end) => Ok(self.fifo.drain(..=end).collect()),
            None => Ok(Vec::new()),
        }
    }
}

impl<C: ByteChannel> FileSystemDevice for V5Device<C> {
    fn status(&mut self) -> Result<SystemStatus, DeviceError> {
        V5Device::status(self)
    }

    fn write_program(
        &mut self,
        bin: &[u8],
        options: &ProgramOptions<'_>,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), DeviceError> {
        V5Device::write_program(self, bin, options, progress)
    }

    fn write_file(
        &mut self,
        data: &[u8],
        name: &str,
        options: &WriteFileOptions,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), DeviceError> {
        V5Device::write_file(self, data, name, options, progress)
    }

    fn read_file(
        &mut self,
        name: &str,
        options: &ReadFileOptions,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<Vec<u8>, DeviceError> {
        V5Device::read_file(self, name, options, progress)
    }

    fn erase_file(&mut self, name: &str, vid: FileTransferVID) -> Result<(), DeviceError> {
        V5Device::erase_file(self, name, vid, false)
    }

    fn list_files(&mut self, vid: FileTransferVID) -> Result<Vec<FileMetadataByIndex>, DeviceError> {
        V5Device::list_files(self, vid)
    }

    fn execute(&mut self, name: &str, vid: FileTransferVID) -> Result<(), DeviceError> {
        self.execute_program_file(name, vid, true)
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.stop_program()
    }

    fn capture_screen(&mut self) -> Result<Screenshot, DeviceError> {
        V5Device::capture_screen(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn screenshot_crops_hidden_columns() {
        let mut buffer = Vec::new();
        for y in 0..2u32 {
            for x in 0..SCREEN_STRIDE as u32 {
                // A, R, G, B packed little endian
                let argb = 0xFF00_0000 | (x & 0xFF) << 16 | y << 8 | 0x42;
                buffer.extend(argb.to_le_bytes());
            }
        }

        let shot = Screenshot::from_argb(&buffer);
        assert_eq!(shot.width, SCREEN_WIDTH);
        assert_eq!(shot.height, 2);
        assert_eq!(shot.rgb.len(), SCREEN_WIDTH * 2 * 3);
        assert_eq!(shot.pixel(7, 1), Some([7, 1, 0x42]));
        assert_eq!(shot.pixel(SCREEN_WIDTH, 0), None);
    }
}
