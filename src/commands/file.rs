//! File transfer and file system commands.

use super::{checked_extended, Command, PayloadReader};
use crate::errors::DecodeError;
use crate::protocol::{decode_extended, encode_extended, SimpleResponse, VexExtPacketChecks};
use crate::v5::{
    FileMetadataByIndex, FileMetadataByName, FileTransferComplete, FileTransferFunction,
    FileTransferOptions, FileTransferSession, FileTransferTarget, FileTransferType,
    FileTransferVID, FILE_NAME_LEN,
};

/// Option bit asking the brain to stop a program instead of running it
pub const EXECUTE_STOP: u8 = 0x80;

/// Option bit asking an erase to also remove linked files
pub const ERASE_ALL: u8 = 0x80;

/// Rounds a length up to the next multiple of four
pub fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

/// Initializes a file transfer between the brain and host
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileTransferInit {
    pub function: FileTransferFunction,
    pub target: FileTransferTarget,
    pub vid: FileTransferVID,
    pub options: FileTransferOptions,
    pub file_type: FileTransferType,
    /// Bytes that will be uploaded. Ignored for downloads.
    pub length: u32,
    pub addr: u32,
    /// CRC32 of the bytes that will be uploaded
    pub crc: u32,
    /// Seconds since 2000-01-01
    pub timestamp: u32,
    pub version: u32,
    pub name: [u8; FILE_NAME_LEN],
}

impl Command for FileTransferInit {
    type Response = FileTransferSession;
    const NAME: &'static str = "file transfer init";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        // Load the function, target, vid, and options
        let mut payload = vec![
            self.function as u8,
            self.target as u8,
            self.vid.to_u8(),
            self.options.bits(),
        ];

        payload.extend(self.length.to_le_bytes());
        payload.extend(self.addr.to_le_bytes());
        payload.extend(self.crc.to_le_bytes());
        payload.extend(self.file_type.to_bytes());
        payload.extend(self.timestamp.to_le_bytes());
        payload.extend(self.version.to_le_bytes());
        payload.extend(self.name);

        encode_extended(0x11, &payload)
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        let data = checked_extended(response, 0x11, 10)?;
        let mut reader = PayloadReader::new(&data);

        Ok(FileTransferSession {
            max_packet_size: reader.u16()?,
            file_size: reader.u32()?,
            crc: reader.u32()?,
        })
    }

    fn timeout_factor(&self) -> u32 {
        5
    }
}

/// Completes the current file transfer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileTransferExit(pub FileTransferComplete);

impl Command for FileTransferExit {
    type Response = ();
    const NAME: &'static str = "file transfer complete";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        encode_extended(0x12, &[self.0 as u8])
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        checked_extended(response, 0x12, 0).map(|_| ())
    }

    fn timeout_factor(&self) -> u32 {
        10
    }
}

/// Writes one chunk of the file being uploaded. Data is zero padded to a multiple of four.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileTransferWrite<'a> {
    pub addr: u32,
    pub data: &'a [u8],
}

impl<'a> Command for FileTransferWrite<'a> {
    type Response = ();
    const NAME: &'static str = "file transfer write";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        let mut payload = Vec::with_capacity(4 + padded_len(self.data.len()));
        payload.extend(self.addr.to_le_bytes());
        payload.extend_from_slice(self.data);
        payload.resize(4 + padded_len(self.data.len()), 0);

        encode_extended(0x13, &payload)
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        checked_extended(response, 0x13, 0).map(|_| ())
    }
}

/// Reads one chunk of the file being downloaded
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileTransferRead {
    pub addr: u32,
    pub length: u16,
}

impl Command for FileTransferRead {
    type Response = Vec<u8>;
    const NAME: &'static str = "file transfer read";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        // The brain only hands out whole words
        let padded = padded_len(self.length as usize);
        let requested = u16::try_from(padded).map_err(|_| DecodeError::PayloadTooLarge(padded))?;

        let mut payload = Vec::with_capacity(6);
        payload.extend(self.addr.to_le_bytes());
        payload.extend(requested.to_le_bytes());

        encode_extended(0x14, &payload)
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        // This response carries no ACK byte, instead four bytes precede the data
        let expected = 4 + padded_len(self.length as usize);
        let ext = decode_extended(
            response,
            0x14,
            VexExtPacketChecks::CRC | VexExtPacketChecks::LENGTH,
            Some(expected),
        )?;

        let mut reader = PayloadReader::new(ext.data());
        reader.skip(4)?;
        Ok(reader.bytes(self.length as usize)?.to_vec())
    }
}

/// Links the file being uploaded to another file, such as a shared library
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileTransferSetLink {
    pub vid: FileTransferVID,
    pub options: u8,
    pub name: [u8; FILE_NAME_LEN],
}

impl Command for FileTransferSetLink {
    type Response = ();
    const NAME: &'static str = "file transfer set link";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        encode_extended(0x15, &vid_options_name(self.vid, self.options, &self.name))
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        checked_extended(response, 0x15, 0).map(|_| ())
    }
}

fn vid_options_name(vid: FileTransferVID, options: u8, name: &[u8; FILE_NAME_LEN]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + FILE_NAME_LEN);
    payload.push(vid.to_u8());
    payload.push(options);
    payload.extend_from_slice(name);
    payload
}

/// Counts the files in a VID's directory
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GetDirectoryCount {
    pub vid: FileTransferVID,
    pub options: u8,
}

impl Command for GetDirectoryCount {
    type Response = u16;
    const NAME: &'static str = "get directory count";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        encode_extended(0x16, &[self.vid.to_u8(), self.options])
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        let data = checked_extended(response, 0x16, 2)?;
        let count = PayloadReader::new(&data).i16()?;
        Ok(count.max(0) as u16)
    }
}

/// Gets the metadata of the nth file of the directory last counted
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GetFileMetadataByIndex {
    pub idx: u8,
    pub options: u8,
}

impl Command for GetFileMetadataByIndex {
    type Response = FileMetadataByIndex;
    const NAME: &'static str = "get file metadata by index";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        encode_extended(0x17, &[self.idx, self.options])
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        let data = checked_extended(response, 0x17, 49)?;
        let mut reader = PayloadReader::new(&data);

        let idx = reader.u8()?;
        let length = reader.u32()?;
        let addr = reader.u32()?;
        let crc = reader.u32()?;
        let file_type = FileTransferType::from_bytes(&reader.array()?);
        Ok(FileMetadataByIndex {
            idx,
            file_type,
            length,
            addr,
            crc,
            timestamp: reader.u32()?,
            version: reader.u32()?,
            name: reader.array()?,
        })
    }
}

/// Runs or stops a program on the brain
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExecuteFile {
    pub vid: FileTransferVID,
    /// [EXECUTE_STOP] stops the running program instead
    pub options: u8,
    pub name: [u8; FILE_NAME_LEN],
}

impl Command for ExecuteFile {
    type Response = ();
    const NAME: &'static str = "execute file";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        encode_extended(0x18, &vid_options_name(self.vid, self.options, &self.name))
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        checked_extended(response, 0x18, 0).map(|_| ())
    }
}

/// Gets the metadata of a file by its name
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GetFileMetadataByName {
    pub vid: FileTransferVID,
    pub options: u8,
    pub name: [u8; FILE_NAME_LEN],
}

impl Command for GetFileMetadataByName {
    type Response = FileMetadataByName;
    const NAME: &'static str = "get file metadata by name";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        encode_extended(0x19, &vid_options_name(self.vid, self.options, &self.name))
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        let data = checked_extended(response, 0x19, 49)?;
        let mut reader = PayloadReader::new(&data);

        let linked_vid = FileTransferVID::from_u8(reader.u8()?);
        let length = reader.u32()?;
        let addr = reader.u32()?;
        let crc = reader.u32()?;
        let file_type = FileTransferType::from_bytes(&reader.array()?);
        Ok(FileMetadataByName {
            linked_vid,
            file_type,
            length,
            addr,
            crc,
            timestamp: reader.u32()?,
            version: reader.u32()?,
            linked_filename: reader.array()?,
        })
    }
}

/// Rewrites the metadata of a file. Fields left at `0xFF..` are unchanged by the brain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SetFileMetadata {
    pub vid: FileTransferVID,
    pub options: u8,
    pub addr: u32,
    pub file_type: [u8; 4],
    pub timestamp: u32,
    pub version: u32,
    pub name: [u8; FILE_NAME_LEN],
}

impl SetFileMetadata {
    /// A request that leaves every field of the named file unchanged
    pub fn unchanged(vid: FileTransferVID, name: [u8; FILE_NAME_LEN]) -> Self {
        SetFileMetadata {
            vid,
            options: 0,
            addr: u32::MAX,
            file_type: [0xFF; 4],
            timestamp: u32::MAX,
            version: u32::MAX,
            name,
        }
    }
}

impl Command for SetFileMetadata {
    type Response = ();
    const NAME: &'static str = "set file metadata";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        let mut payload = vec![self.vid.to_u8(), self.options];
        payload.extend(self.addr.to_le_bytes());
        payload.extend(self.file_type);
        payload.extend(self.timestamp.to_le_bytes());
        payload.extend(self.version.to_le_bytes());
        payload.extend(self.name);

        encode_extended(0x1A, &payload)
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        checked_extended(response, 0x1A, 0).map(|_| ())
    }
}

/// Erases a file. The brain expects a transfer completion afterwards.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EraseFile {
    pub vid: FileTransferVID,
    /// [ERASE_ALL] also erases files linked to this one
    pub options: u8,
    pub name: [u8; FILE_NAME_LEN],
}

impl Command for EraseFile {
    type Response = ();
    const NAME: &'static str = "erase file";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        encode_extended(0x1B, &vid_options_name(self.vid, self.options, &self.name))
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        checked_extended(response, 0x1B, 0).map(|_| ())
    }
}

/// Asks which program slot a file occupies
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GetProgramSlot {
    pub vid: FileTransferVID,
    pub options: u8,
    pub name: [u8; FILE_NAME_LEN],
}

impl Command for GetProgramSlot {
    type Response = u8;
    const NAME: &'static str = "get program slot";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        encode_extended(0x1C, &vid_options_name(self.vid, self.options, &self.name))
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        let data = checked_extended(response, 0x1C, 1)?;
        PayloadReader::new(&data).u8()
    }
}
