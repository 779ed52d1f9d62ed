//! Chunked file uploads and downloads.

use std::io::Write;
use std::ops::Range;

use chrono::{DateTime, Utc};
use flate2::{Compression, GzBuilder};
use tracing::{debug, info, warn};

use super::V5Device;
use crate::commands::{
    FileTransferExit, FileTransferInit, FileTransferRead, FileTransferSetLink, FileTransferWrite,
};
use crate::crc::crc32;
use crate::devices::TransferProgress;
use crate::errors::DeviceError;
use crate::io::ByteChannel;
use crate::v5::{
    encode_file_name, vex_timestamp, FileTransferComplete, FileTransferFunction,
    FileTransferOptions, FileTransferSession, FileTransferTarget, FileTransferType,
    FileTransferVID, DEFAULT_FILE_VERSION, USER_PROGRAM_ADDR,
};

/// Transfers above this size are slow over radio
const WIRELESS_WARN_SIZE: usize = 0x25000;

/// Splits `total` bytes into consecutive ranges of at most `max_chunk` bytes.
///
/// Yields `ceil(total / max_chunk)` ranges; every one but the last is full.
pub fn plan_chunks(total: usize, max_chunk: usize) -> impl Iterator<Item = Range<usize>> {
    let step = max_chunk.max(1);
    (0..total)
        .step_by(step)
        .map(move |start| start..(start + step).min(total))
}

/// Settings for [`V5Device::write_file`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteFileOptions {
    pub vid: FileTransferVID,
    pub target: FileTransferTarget,
    /// Taken from the file name's extension when not set
    pub file_type: Option<FileTransferType>,
    pub addr: u32,
    pub overwrite: bool,
    pub run_after: FileTransferComplete,
    pub version: u32,
    /// Defaults to now
    pub timestamp: Option<DateTime<Utc>>,
    /// A library this file depends on, with the VID it lives in
    pub linked_file: Option<(String, FileTransferVID)>,
    /// Gzip the data first if the firmware accepts compressed uploads
    pub compress: bool,
}

impl Default for WriteFileOptions {
    fn default() -> Self {
        WriteFileOptions {
            vid: FileTransferVID::User,
            target: FileTransferTarget::Flash,
            file_type: None,
            addr: USER_PROGRAM_ADDR,
            overwrite: true,
            run_after: FileTransferComplete::DoNothing,
            version: DEFAULT_FILE_VERSION,
            timestamp: None,
            linked_file: None,
            compress: false,
        }
    }
}

/// Settings for [`V5Device::read_file`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ReadFileOptions {
    pub vid: FileTransferVID,
    pub target: FileTransferTarget,
    /// Looked up from the file's metadata when not set
    pub addr: Option<u32>,
    /// Defaults to the size the brain reports for the file
    pub length: Option<usize>,
}

impl Default for ReadFileOptions {
    fn default() -> Self {
        ReadFileOptions {
            vid: FileTransferVID::User,
            target: FileTransferTarget::Flash,
            addr: None,
            length: None,
        }
    }
}

/// The address `offset` bytes past `base`, if it fits in 32 bits
fn offset_addr(base: u32, offset: usize) -> Result<u32, DeviceError> {
    u32::try_from(offset)
        .ok()
        .and_then(|offset| base.checked_add(offset))
        .ok_or(DeviceError::ProgramTooLarge {
            size: offset,
            max: (u32::MAX - base) as usize,
        })
}

/// Gzips `data` with a zeroed timestamp so identical inputs compress identically
pub(crate) fn gzip(data: &[u8]) -> Result<Vec<u8>, DeviceError> {
    let mut encoder = GzBuilder::new()
        .mtime(0)
        .write(Vec::with_capacity(data.len() / 2), Compression::best());
    encoder.write_all(data).map_err(DeviceError::Compression)?;
    encoder.finish().map_err(DeviceError::Compression)
}

impl<C: ByteChannel> V5Device<C> {
    /// Opens a transfer session
    pub fn ft_initialize(&mut self, init: &FileTransferInit) -> Result<FileTransferSession, DeviceError> {
        let session = self.send_request(init)?;
        debug!(
            max_packet_size = session.max_packet_size,
            file_size = session.file_size,
            crc = session.crc,
            "transfer initialized"
        );
        Ok(session)
    }

    /// Closes the transfer session
    pub fn ft_complete(&mut self, action: FileTransferComplete) -> Result<(), DeviceError> {
        self.send_request(&FileTransferExit(action))
    }

    pub fn ft_write(&mut self, addr: u32, data: &[u8]) -> Result<(), DeviceError> {
        self.send_request(&FileTransferWrite { addr, data })
    }

    pub fn ft_read(&mut self, addr: u32, length: u16) -> Result<Vec<u8>, DeviceError> {
        self.send_request(&FileTransferRead { addr, length })
    }

    /// Links the file being uploaded to a library
    pub fn ft_set_link(&mut self, name: &str, vid: FileTransferVID) -> Result<(), DeviceError> {
        let name = encode_file_name(name)?;
        self.send_request(&FileTransferSetLink { vid, options: 0, name })
    }

    /// Uploads `data` as `name`.
    ///
    /// The CRC covers the bytes actually sent, so a compressed upload is
    /// checked after compression. Fails with
    /// [`DeviceError::AllocationTooSmall`] if the brain reserves less space
    /// than the upload needs.
    pub fn write_file(
        &mut self,
        data: &[u8],
        name: &str,
        options: &WriteFileOptions,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), DeviceError> {
        let compressed;
        let data = if options.compress && self.status()?.can_compress() {
            compressed = gzip(data)?;
            debug!(raw = data.len(), compressed = compressed.len(), "compressed upload");
            compressed.as_slice()
        } else {
            data
        };

        if data.len() > WIRELESS_WARN_SIZE && self.is_wireless() {
            warn!(bytes = data.len(), "large upload over radio, consider a cable");
        }

        let length = u32::try_from(data.len()).map_err(|_| DeviceError::ProgramTooLarge {
            size: data.len(),
            max: u32::MAX as usize,
        })?;
        offset_addr(options.addr, data.len())?;
        let timestamp = options.timestamp.unwrap_or_else(Utc::now);
        let init = FileTransferInit {
            function: FileTransferFunction::Upload,
            target: options.target,
            vid: options.vid,
            options: if options.overwrite {
                FileTransferOptions::OVERWRITE
            } else {
                FileTransferOptions::NONE
            },
            file_type: options
                .file_type
                .unwrap_or_else(|| FileTransferType::from_file_name(name)),
            length,
            addr: options.addr,
            crc: crc32(data),
            timestamp: vex_timestamp(timestamp),
            version: options.version,
            name: encode_file_name(name)?,
        };

        info!(name, bytes = data.len(), addr = options.addr, "uploading file");
        let session = self.ft_initialize(&init)?;

        if let Some((linked_name, linked_vid)) = &options.linked_file {
            debug!(linked_name, "setting file link");
            self.ft_set_link(linked_name, *linked_vid)?;
        }

        if (session.file_size as usize) < data.len() {
            return Err(DeviceError::AllocationTooSmall {
                requested: data.len(),
                allocated: session.file_size as usize,
            });
        }

        // Writes carry their own header, so only half the packet is data
        let chunk = session.max_packet_size as usize / 2;
        for range in plan_chunks(data.len(), chunk) {
            let addr = offset_addr(options.addr, range.start)?;
            debug!(bytes = range.len(), addr = format_args!("{addr:#x}"), "writing chunk");
            self.ft_write(addr, &data[range.clone()])?;
            progress(TransferProgress {
                transferred: range.end,
                total: data.len(),
            });
        }

        debug!("data transfer complete, closing session");
        self.ft_complete(options.run_after)
    }

    /// Downloads the file `name`
    pub fn read_file(
        &mut self,
        name: &str,
        options: &ReadFileOptions,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<Vec<u8>, DeviceError> {
        let addr = match options.addr {
            Some(addr) => addr,
            None => self.get_file_metadata_by_name(name, options.vid)?.addr,
        };

        let init = FileTransferInit {
            function: FileTransferFunction::Download,
            target: options.target,
            vid: options.vid,
            options: FileTransferOptions::OVERWRITE,
            file_type: FileTransferType::from_file_name(name),
            length: 0,
            addr,
            crc: 0,
            timestamp: vex_timestamp(Utc::now()),
            version: DEFAULT_FILE_VERSION,
            name: encode_file_name(name)?,
        };

        info!(name, addr = format_args!("{addr:#x}"), "downloading file");
        let session = self.ft_initialize(&init)?;
        let length = options.length.unwrap_or(session.file_size as usize);

        if length > WIRELESS_WARN_SIZE && self.is_wireless() {
            warn!(bytes = length, "large download over radio, consider a cable");
        }

        if let Err(e) = offset_addr(addr, length) {
            self.ft_complete(FileTransferComplete::DoNothing)?;
            return Err(e);
        }

        let mut data = Vec::with_capacity(length);
        for range in plan_chunks(length, session.max_packet_size as usize) {
            let chunk = self.ft_read(offset_addr(addr, range.start)?, range.len() as u16)?;
            data.extend(chunk);
            progress(TransferProgress {
                transferred: range.end,
                total: length,
            });
        }

        self.ft_complete(FileTransferComplete::DoNothing)?;
        Ok(data)
    }
}
