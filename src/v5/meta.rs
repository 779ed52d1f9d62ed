//! Contains Structs and Enums that can contain metadata about the V5 System and Files stored on the V5 Robot Brain.
use std::fmt;

use bitflags::bitflags;
use chrono::{DateTime, Utc};

use super::{decode_file_name, from_vex_timestamp};

/// Enum that represents the channel
/// for the V5 Controller
///
/// # Variants
///
/// * [V5ControllerChannel::Pit] - Used when controlling the robot outside of a competition match
/// * [V5ControllerChannel::Download] - Used when wirelessly uploading/downloading data to/from the V5 Brain
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum V5ControllerChannel {
    /// Used when controlling the robot outside of a competition match
    Pit = 0x00,
    /// Used when wirelessly uploading or downloading data to/from the V5
    /// Brain
    Download = 0x01,
}

/// Enum that represents a vex product
///
/// # Variants
///
/// * [VexProductType::V5Brain] - Represents a V5 Robot Brain
/// * [VexProductType::V5Controller] - Represents a V5 Robot Controller
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VexProductType {
    /// Represents a V5 Robot Brain
    V5Brain(V5BrainFlags),
    /// Represents a V5 Robot Controller
    V5Controller(V5ControllerFlags),
}

impl VexProductType {
    /// Returns true if this is a controller linked to a brain
    pub fn is_connected_controller(&self) -> bool {
        matches!(self, VexProductType::V5Controller(flags) if flags.contains(V5ControllerFlags::CONNECTED_WIRELESS))
    }
}

impl From<VexProductType> for u8 {
    /// Converts the VexProductType to a u8 usable in the serial protocol.
    ///
    /// # Returns
    /// * [u8] where
    ///     * [VexProductType::V5Brain] == 0x10
    ///     * [VexProductType::V5Controller] == 0x11
    fn from(product: VexProductType) -> u8 {
        match product {
            VexProductType::V5Brain(_) => 0x10,
            VexProductType::V5Controller(_) => 0x11,
        }
    }
}

impl TryFrom<(u8, u8)> for VexProductType {
    type Error = crate::errors::DeviceError;
    /// Converts a product byte and its flag byte into a Vex Product Type.
    /// Unknown flag bits are dropped.
    fn try_from(value: (u8, u8)) -> Result<VexProductType, Self::Error> {
        match value.0 {
            0x10 => Ok(VexProductType::V5Brain(V5BrainFlags::from_bits_truncate(value.1))),
            0x11 => Ok(VexProductType::V5Controller(V5ControllerFlags::from_bits_truncate(value.1))),
            _ => Err(crate::errors::DeviceError::InvalidDevice),
        }
    }
}

bitflags! {
    /// Configuration flags for the v5 brain
    ///
    /// There are no documented flags for the v5 brain.
    pub struct V5BrainFlags: u8 {
        const NONE = 0x0;
    }
    /// Configuration flags for the v5 controller
    pub struct V5ControllerFlags: u8 {
        /// Represents that no flags are set
        const NONE = 0x0;
        /// Set when the controller is connected over a cable to the V5 Brain
        const CONNECTED_CABLE = 0x01;
        /// Set when the controller is linked to a V5 Brain, over VEXLink or the download channel
        const CONNECTED_WIRELESS = 0x02;
    }
}

/// A four part firmware version, displayed as `major.minor.patch-build`
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub build: u8,
}

impl FirmwareVersion {
    pub const fn new(major: u8, minor: u8, patch: u8, build: u8) -> Self {
        FirmwareVersion {
            major,
            minor,
            patch,
            build,
        }
    }

    pub fn from_bytes(b: [u8; 4]) -> Self {
        FirmwareVersion::new(b[0], b[1], b[2], b[3])
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}-{}", self.major, self.minor, self.patch, self.build)
    }
}

/// The answer to the simple system version query
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct V5SystemVersion {
    pub system_version: FirmwareVersion,
    /// A fifth version component reported only by this query
    pub beta: u8,
    pub product_type: VexProductType,
}

/// The answer to the extended system status query
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SystemStatus {
    pub system_version: FirmwareVersion,
    pub cpu0_version: FirmwareVersion,
    pub cpu1_version: FirmwareVersion,
    pub touch_version: u8,
    pub system_id: u32,
}

impl SystemStatus {
    /// Firmware from 1.0.5 on accepts gzip compressed uploads
    pub fn can_compress(&self) -> bool {
        let v = self.system_version;
        (v.major, v.minor, v.patch) >= (1, 0, 5)
    }

    /// The default program icon this firmware can display
    pub fn default_icon(&self) -> &'static str {
        if self.cpu0_version >= FirmwareVersion::new(1, 0, 0, 22) {
            "USER902x.bmp"
        } else {
            "USER999x.bmp"
        }
    }
}

// # File Transfer structures
// These structures are used during file transfers between the brain and the host

/// The function to be performed during the file transfer
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileTransferFunction {
    /// Specifies that a file is being uploaded/written to the brain
    Upload = 0x01,
    /// Specifies that a file is being downloaded/read from the brain.
    Download = 0x02,
}

/// The target storage device of a file transfer
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileTransferTarget {
    /// Volatile memory; programs written here are lost on power off
    Ddr = 0x00,
    /// The flash memory on the robot brain where most program files are stored
    Flash = 0x01,
    /// The memory accessed when taking a screen capture from the brain.
    Screen = 0x02,
}

/// The VID of a file transfer, a namespace for files on the brain
///
/// # Variants
/// * [FileTransferVID::User] - Ordinary user programs and their descriptors
/// * [FileTransferVID::System] - VEXos owned data such as the screen buffer
/// * [FileTransferVID::RMS] - The VID used by Robot Mesh Studio
/// * [FileTransferVID::PROS] - The VID used by Purdue Robotics Operating System libraries
/// * [FileTransferVID::MW] - The VID used by MW
/// * [FileTransferVID::Other] - Allows specifying custom VIDs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileTransferVID {
    User,
    System,
    RMS,
    PROS,
    MW,
    Other(u8),
}

impl FileTransferVID {
    /// Converts a [u8] to a [FileTransferVID]
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::User,
            15 => Self::System,
            16 => Self::RMS,
            24 => Self::PROS,
            32 => Self::MW,
            a => Self::Other(a),
        }
    }

    /// Converts a [FileTransferVID] to a [u8]
    pub fn to_u8(self) -> u8 {
        match self {
            FileTransferVID::User => 1,
            FileTransferVID::System => 15,
            FileTransferVID::RMS => 16,
            FileTransferVID::PROS => 24,
            FileTransferVID::MW => 32,
            FileTransferVID::Other(a) => a,
        }
    }
}

bitflags! {
    /// Options in a file transfer
    pub struct FileTransferOptions: u8 {
        /// Represents that no options are set
        const NONE = 0x0;
        /// Set when the file should be overwritten by the current operation.
        const OVERWRITE = 0b1;
    }
}

/// The File type of a file, maximum three ascii characters
///
/// # Variants
/// * [FileTransferType::Bin] - Binary files, generally programs
/// * [FileTransferType::Ini] - Ini files for program metadata and configuration
/// * [FileTransferType::Other] - Any other file type, including custom user types
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileTransferType {
    Bin,
    Ini,
    Other([u8; 3]),
}

impl FileTransferType {
    /// Converts the [FileTransferType] to 4 bytes where the first three are the file's type and the last is a null terminator.
    pub fn to_bytes(self) -> [u8; 4] {
        match self {
            Self::Bin => *b"bin\0",
            Self::Ini => *b"ini\0",
            Self::Other(t) => [t[0], t[1], t[2], 0u8],
        }
    }

    /// Converts 4 bytes into a [FileTransferType]
    pub fn from_bytes(v: &[u8; 4]) -> Self {
        match &v[..3] {
            b"bin" => Self::Bin,
            b"ini" => Self::Ini,
            _ => Self::Other([v[0], v[1], v[2]]),
        }
    }

    /// Picks the type from a file name's extension
    pub fn from_file_name(name: &str) -> Self {
        let ext = name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
        match ext {
            "bin" => Self::Bin,
            "ini" => Self::Ini,
            other => {
                let mut t = [0u8; 3];
                for (slot, b) in t.iter_mut().zip(other.bytes()) {
                    *slot = b;
                }
                Self::Other(t)
            }
        }
    }
}

impl fmt::Display for FileTransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        write!(f, "{}", String::from_utf8_lossy(&bytes[..end]))
    }
}

/// The action to run when the transfer is complete.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileTransferComplete {
    /// Does nothing when the file transfer is complete.
    DoNothing = 0,
    /// Runs the uploaded program when the transfer is complete.
    RunProgram = 1,
    /// Runs the program and switches the brain to its run screen.
    ShowRunScreen = 3,
}

/// What the brain agreed to when a transfer was initialized
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileTransferSession {
    /// The largest chunk the brain accepts in one read or write
    pub max_packet_size: u16,
    /// Bytes allocated for an upload, or the size of the file being downloaded
    pub file_size: u32,
    /// The CRC32 of the file on the brain, for downloads
    pub crc: u32,
}

/// File metadata returned when requesting file metadata by index
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileMetadataByIndex {
    /// The index of the file
    pub idx: u8,
    /// The type of the file
    pub file_type: FileTransferType,
    /// The length of the file
    pub length: u32,
    /// The address the file should be loaded at
    pub addr: u32,
    /// The crc32 of the file according to [crate::crc::VEX_CRC32].
    pub crc: u32,
    /// Seconds since 2000-01-01 when the file was last written
    pub timestamp: u32,
    /// The version of the file, packed such that 1.2.3.4 == 0x01020304
    pub version: u32,
    /// The name of the file
    pub name: [u8; 24],
}

impl FileMetadataByIndex {
    pub fn file_name(&self) -> String {
        decode_file_name(&self.name)
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        from_vex_timestamp(self.timestamp)
    }
}

/// File metadata returned when requesting file metadata by name
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FileMetadataByName {
    /// The VID of the linked file
    pub linked_vid: FileTransferVID,
    /// The type of the file
    pub file_type: FileTransferType,
    /// The length of the file
    pub length: u32,
    /// The address the file should be loaded at
    pub addr: u32,
    /// The crc32 of the file according to [crate::crc::VEX_CRC32].
    pub crc: u32,
    /// Seconds since 2000-01-01 when the file was last written
    pub timestamp: u32,
    /// The version of the file, packed such that 1.2.3.4 == 0x01020304
    pub version: u32,
    /// The filename of the linked file
    pub linked_filename: [u8; 24],
}

impl FileMetadataByName {
    pub fn linked_file_name(&self) -> String {
        decode_file_name(&self.linked_filename)
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        from_vex_timestamp(self.timestamp)
    }
}
