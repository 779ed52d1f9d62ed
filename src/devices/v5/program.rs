//! Slot based program uploads.
//!
//! A program occupies two files: `slot_<n>.bin` holds the binary and
//! `slot_<n>.ini` describes it to the brain's program menu.

use chrono::Local;
use tracing::{debug, info, warn};

use super::transfer::gzip;
use super::{V5Device, WriteFileOptions};
use crate::crc::crc32;
use crate::devices::{TransferProgress, UploadOrder};
use crate::errors::DeviceError;
use crate::io::ByteChannel;
use crate::v5::{
    FileTransferComplete, FileTransferTarget, FileTransferType, FileTransferVID,
    USER_PROGRAM_ADDR,
};

/// Number of program slots on a brain
pub const PROGRAM_SLOTS: u8 = 8;

/// Longest program or library name the brain displays
const MAX_PROGRAM_NAME: usize = 23;

const DEFAULT_PROGRAM_VERSION: &str = "0.0.0";
const DEFAULT_DESCRIPTION: &str = "Uploaded with vex_serial";
const PROGRAM_SECTION: &str = "program";

fn truncate_name(name: &str) -> String {
    if name.chars().count() > MAX_PROGRAM_NAME {
        let truncated: String = name.chars().take(MAX_PROGRAM_NAME).collect();
        warn!(name, truncated = %truncated, "truncating name for length");
        truncated
    } else {
        name.to_string()
    }
}

/// The `[program]` section of a slot's ini file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramDescriptor {
    pub version: String,
    pub name: String,
    /// Zero based
    pub slot: u8,
    pub icon: String,
    pub description: String,
    /// Local time the program was uploaded, ISO 8601
    pub date: String,
}

impl ProgramDescriptor {
    pub fn to_ini(&self) -> String {
        format!(
            "[{PROGRAM_SECTION}]\n\
             version = {}\n\
             name = {}\n\
             slot = {}\n\
             icon = {}\n\
             description = {}\n\
             date = {}\n\n",
            self.version, self.name, self.slot, self.icon, self.description, self.date
        )
    }

    /// Parses the `[program]` section out of an ini file.
    ///
    /// Keys are case insensitive and may use `=` or `:`. Lines starting with
    /// `#` or `;` are comments. Only `name` is required.
    pub fn from_ini(text: &str) -> Result<Self, DeviceError> {
        let mut in_program = false;
        let mut descriptor = ProgramDescriptor {
            version: DEFAULT_PROGRAM_VERSION.to_string(),
            name: String::new(),
            slot: 0,
            icon: String::new(),
            description: String::new(),
            date: String::new(),
        };
        let mut has_name = false;

        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_program = section.trim() == PROGRAM_SECTION;
                continue;
            }
            if !in_program {
                continue;
            }

            let Some((key, value)) = line.split_once(|c| c == '=' || c == ':') else {
                return Err(DeviceError::InvalidDescriptor(format!("malformed line {line:?}")));
            };
            let value = value.trim().to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "version" => descriptor.version = value,
                "name" => {
                    descriptor.name = value;
                    has_name = true;
                }
                "slot" => {
                    descriptor.slot = value
                        .parse()
                        .map_err(|_| DeviceError::InvalidDescriptor(format!("bad slot {value:?}")))?
                }
                "icon" => descriptor.icon = value,
                "description" => descriptor.description = value,
                "date" => descriptor.date = value,
                other => debug!(key = other, "ignoring descriptor key"),
            }
        }

        if !has_name {
            return Err(DeviceError::InvalidDescriptor(
                "missing [program] name".to_string(),
            ));
        }
        Ok(descriptor)
    }
}

/// A library the program links against, uploaded before the program itself
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkedLibrary<'a> {
    pub data: &'a [u8],
    pub name: String,
    pub vid: FileTransferVID,
    pub addr: u32,
    /// Upload even if an identical copy is already on the brain
    pub force: bool,
}

impl<'a> LinkedLibrary<'a> {
    pub fn new(name: impl Into<String>, data: &'a [u8]) -> Self {
        LinkedLibrary {
            data,
            name: name.into(),
            vid: FileTransferVID::PROS,
            addr: USER_PROGRAM_ADDR,
            force: false,
        }
    }
}

/// Settings for [`V5Device::write_program`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramOptions<'a> {
    pub name: String,
    /// Zero based; slot 0 is shown as slot 1
    pub slot: u8,
    pub version: Option<String>,
    /// Defaults to the icon the firmware supports
    pub icon: Option<String>,
    pub description: Option<String>,
    /// [`FileTransferTarget::Ddr`] writes only the binary
    pub target: FileTransferTarget,
    pub run_after: FileTransferComplete,
    pub addr: u32,
    /// Defaults to the device's configured order
    pub upload_order: Option<UploadOrder>,
    /// Defaults to the device's configured compression
    pub compress: Option<bool>,
    pub linked_library: Option<LinkedLibrary<'a>>,
}

impl<'a> ProgramOptions<'a> {
    pub fn new(name: impl Into<String>, slot: u8) -> Self {
        ProgramOptions {
            name: name.into(),
            slot,
            version: None,
            icon: None,
            description: None,
            target: FileTransferTarget::Flash,
            run_after: FileTransferComplete::DoNothing,
            addr: USER_PROGRAM_ADDR,
            upload_order: None,
            compress: None,
            linked_library: None,
        }
    }
}

impl<C: ByteChannel> V5Device<C> {
    /// Uploads a program binary and its descriptor into a slot
    pub fn write_program(
        &mut self,
        bin: &[u8],
        options: &ProgramOptions<'_>,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), DeviceError> {
        if options.slot >= PROGRAM_SLOTS {
            return Err(DeviceError::InvalidDescriptor(format!(
                "slot {} is out of range 1..={PROGRAM_SLOTS}",
                options.slot as u16 + 1
            )));
        }

        info!(name = %options.name, slot = options.slot + 1, port = %self.channel_name(), "uploading program");
        self.with_download_channel(|dev| dev.write_program_files(bin, options, progress))?;
        info!(name = %options.name, "finished uploading program");
        Ok(())
    }

    fn write_program_files(
        &mut self,
        bin: &[u8],
        options: &ProgramOptions<'_>,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), DeviceError> {
        let base = format!("slot_{}", options.slot + 1);
        let compress = options.compress.unwrap_or(self.config().compress);

        let bin_options = WriteFileOptions {
            file_type: Some(FileTransferType::Bin),
            target: options.target,
            addr: options.addr,
            run_after: options.run_after,
            linked_file: options
                .linked_library
                .as_ref()
                .map(|lib| (truncate_name(&lib.name), lib.vid)),
            compress,
            ..WriteFileOptions::default()
        };

        if options.target == FileTransferTarget::Ddr {
            let bin_options = WriteFileOptions {
                compress: false,
                ..bin_options
            };
            return self.write_file(bin, &format!("{base}.bin"), &bin_options, progress);
        }

        let icon = match &options.icon {
            Some(icon) => icon.clone(),
            None => self.status()?.default_icon().to_string(),
        };
        let descriptor = ProgramDescriptor {
            version: options
                .version
                .clone()
                .unwrap_or_else(|| DEFAULT_PROGRAM_VERSION.to_string()),
            name: truncate_name(&options.name),
            slot: options.slot,
            icon,
            description: options
                .description
                .clone()
                .unwrap_or_else(|| DEFAULT_DESCRIPTION.to_string()),
            date: Local::now()
                .naive_local()
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
        };
        let ini = descriptor.to_ini();
        debug!(ini = %ini, "created program descriptor");

        if let Some(library) = &options.linked_library {
            self.upload_library(library, compress)?;
        }

        let ini_options = WriteFileOptions {
            file_type: Some(FileTransferType::Ini),
            ..WriteFileOptions::default()
        };
        let ini_name = format!("{base}.ini");
        let bin_name = format!("{base}.bin");

        match options.upload_order.unwrap_or(self.config().upload_order) {
            UploadOrder::StopThenWrite => {
                self.stop_program()?;
                self.write_file(ini.as_bytes(), &ini_name, &ini_options, &mut |_| {})?;
                self.write_file(bin, &bin_name, &bin_options, progress)
            }
            UploadOrder::WriteThenReplace => {
                self.write_file(bin, &bin_name, &bin_options, progress)?;
                self.write_file(ini.as_bytes(), &ini_name, &ini_options, &mut |_| {})
            }
        }
    }

    /// Uploads a library unless an identical copy is already on the brain
    pub fn upload_library(&mut self, library: &LinkedLibrary<'_>, compress: bool) -> Result<(), DeviceError> {
        let name = truncate_name(&library.name);

        let compressed;
        let data = if compress && self.status()?.can_compress() {
            compressed = gzip(library.data)?;
            compressed.as_slice()
        } else {
            library.data
        };
        let crc = crc32(data);

        if library.force {
            info!(name = %name, "skipping already uploaded checks");
        } else {
            match self.get_file_metadata_by_name(&name, library.vid) {
                Ok(meta) if meta.length as usize == data.len() && meta.crc == crc => {
                    info!(name = %name, "library is already on the brain");
                    return Ok(());
                }
                Ok(meta) => warn!(
                    name = %name,
                    onboard_len = meta.length,
                    expected_len = data.len(),
                    onboard_crc = format_args!("{:#x}", meta.crc),
                    expected_crc = format_args!("{crc:#x}"),
                    "library on the brain does not match"
                ),
                Err(e) if e.nack().is_some() => debug!(name = %name, error = %e, "library not on the brain"),
                Err(e) => return Err(e),
            }
        }

        let options = WriteFileOptions {
            vid: library.vid,
            addr: library.addr,
            ..WriteFileOptions::default()
        };
        self.write_file(data, &name, &options, &mut |_| {})
    }
}
