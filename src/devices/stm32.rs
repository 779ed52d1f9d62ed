//! The STM32 ROM bootloader found behind a Cortex.
//!
//! Every command is a byte and its complement, every argument block is
//! followed by the XOR of its bytes, and the bootloader answers each with
//! a single ACK or NACK byte.

use std::io::Write;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::v5::plan_chunks;
use super::{BootloaderDevice, DeviceConfig, TransferProgress};
use crate::errors::DeviceError;
use crate::io::ByteChannel;
use crate::protocol::hex;
use crate::protocol::simple::{poll_byte, read_exact_by, IDLE_BACKOFF};

pub const ACK: u8 = 0x79;
pub const NACK: u8 = 0x1F;

/// Sent alone to let the bootloader detect the baud rate
pub const INIT: u8 = 0x7F;

pub const PAGE_SIZE: usize = 0x2000;
pub const NUM_PAGES: usize = 0xFF;
pub const MAX_IMAGE_SIZE: usize = NUM_PAGES * PAGE_SIZE;

/// Where user images are flashed and started from
pub const FLASH_START: u32 = 0x0800_0000;

/// Largest block a single write may carry
pub const MAX_WRITE_SIZE: usize = 256;

/// How long an ordinary command has to be acknowledged
const ACK_TIMEOUT: Duration = Duration::from_millis(10);

/// Jumping can take a while to be acknowledged
const GO_TIMEOUT: Duration = Duration::from_secs(5);

const GET: u8 = 0x00;
const GET_ID: u8 = 0x02;
const READ_MEMORY: u8 = 0x11;
const GO: u8 = 0x21;
const WRITE_MEMORY: u8 = 0x31;
const ERASE: u8 = 0x43;
const EXTENDED_ERASE: u8 = 0x44;

/// Position of the erase command in the list reported by `get`
const ERASE_COMMAND_INDEX: usize = 6;

/// How far a flashing session has progressed
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootloaderState {
    /// Nothing has been exchanged yet
    Unknown,
    /// The bootloader answered `get`
    Negotiated,
    Erased,
    Programming,
    /// The bootloader was told to start the image
    Jumped,
}

/// What the bootloader reported about itself
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootloaderInfo {
    pub version: u8,
    /// Supported command bytes, in the bootloader's order
    pub commands: Vec<u8>,
}

impl Default for BootloaderInfo {
    /// The command set of the bootloader shipped on the Cortex
    fn default() -> Self {
        BootloaderInfo {
            version: 0,
            commands: vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43, 0x63, 0x73, 0x82, 0x92],
        }
    }
}

impl BootloaderInfo {
    fn erase_command(&self) -> Option<u8> {
        self.commands.get(ERASE_COMMAND_INDEX).copied()
    }
}

/// Flash pages to erase
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EraseRegion<'a> {
    All,
    /// Standard erase, at most 255 pages
    Pages(&'a [u8]),
    /// Extended erase with 16 bit page numbers
    ExtendedPages(&'a [u16]),
}

/// Settings for [`Stm32Device::write_program`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FlashOptions {
    /// Erase only the pages the image covers, keeping the file system behind it
    pub preserve_fs: bool,
    /// Start the image once it is written
    pub go_after: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        FlashOptions {
            preserve_fs: false,
            go_after: true,
        }
    }
}

/// One transmission to the bootloader
#[derive(Copy, Clone, Debug)]
enum Message<'a> {
    /// A command byte, sent with its complement
    Command(u8),
    /// An argument block, sent with its XOR checksum
    Block(&'a [u8]),
    /// Bytes sent as they are
    Raw(&'a [u8]),
}

impl Message<'_> {
    fn encode(&self) -> Vec<u8> {
        match *self {
            Message::Command(c) => vec![c, !c],
            Message::Block(data) => {
                let mut out = data.to_vec();
                out.push(data.iter().fold(0, |acc, b| acc ^ b));
                out
            }
            Message::Raw(data) => data.to_vec(),
        }
    }

    /// The byte reported when the message is refused
    fn lead(&self) -> u8 {
        match *self {
            Message::Command(c) => c,
            Message::Block(data) | Message::Raw(data) => data.first().copied().unwrap_or(0),
        }
    }
}

/// A device in STM32 bootloader mode
pub struct Stm32Device<C: ByteChannel> {
    channel: C,
    config: DeviceConfig,
    state: BootloaderState,
    info: BootloaderInfo,
}

impl<C: ByteChannel> Stm32Device<C> {
    /// Wraps a channel without talking to the bootloader
    pub fn new(channel: C, config: DeviceConfig) -> Self {
        Stm32Device {
            channel,
            config,
            state: BootloaderState::Unknown,
            info: BootloaderInfo::default(),
        }
    }

    /// Wraps a channel and negotiates with the bootloader behind it
    pub fn negotiated(channel: C, config: DeviceConfig, must_initialize: bool) -> Result<Self, DeviceError> {
        let mut dev = Self::new(channel, config);
        dev.negotiate(must_initialize)?;
        Ok(dev)
    }

    pub fn state(&self) -> BootloaderState {
        self.state
    }

    pub fn config_mut(&mut self) -> &mut DeviceConfig {
        &mut self.config
    }

    pub fn info(&self) -> &BootloaderInfo {
        &self.info
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Makes sure the bootloader is listening.
    ///
    /// A bootloader that has not seen the `0x7F` initialization byte since
    /// reset ignores everything else. If `get` fails, the initialization is
    /// sent again, up to three times.
    pub fn negotiate(&mut self, must_initialize: bool) -> Result<(), DeviceError> {
        if must_initialize {
            self.transact(Message::Raw(&[INIT]), ACK_TIMEOUT)?;
        }

        let mut last = match self.get_once() {
            Ok(info) => {
                self.negotiated_with(info);
                return Ok(());
            }
            Err(e) => e,
        };

        info!("sending bootloader initialization");
        std::thread::sleep(Duration::from_millis(10));
        self.channel.set_request_to_send(false)?;
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(10));
            let attempt = self.transact(Message::Raw(&[INIT]), ACK_TIMEOUT).and_then(|_| {
                std::thread::sleep(Duration::from_millis(10));
                self.get_once()
            });
            match attempt {
                Ok(info) => {
                    self.negotiated_with(info);
                    return Ok(());
                }
                Err(e) => {
                    debug!(error = %e, "bootloader initialization failed");
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn negotiated_with(&mut self, info: BootloaderInfo) {
        info!(version = format_args!("{:#x}", info.version), "bootloader negotiated");
        debug!(commands = %hex(&info.commands), "bootloader commands");
        self.info = info;
        self.state = BootloaderState::Negotiated;
    }

    /// Runs `op` under the device's retry policy
    fn retrying<T>(
        &mut self,
        operation: &str,
        mut op: impl FnMut(&mut Self) -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        let retry = self.config.retry;
        retry.run(operation, |_| op(self))
    }

    /// Sends one message and waits for it to be acknowledged
    fn transact(&mut self, message: Message<'_>, timeout: Duration) -> Result<(), DeviceError> {
        let bytes = message.encode();
        self.channel.clear_input()?;
        debug!(tx = %hex(&bytes), "STM32 TX");
        self.channel.write_all(&bytes)?;
        self.channel.flush()?;

        let deadline = Instant::now() + timeout;
        loop {
            match poll_byte(&mut self.channel)? {
                Some(ACK) => return Ok(()),
                Some(NACK) => return Err(DeviceError::BootloaderNack { command: message.lead() }),
                Some(other) => debug!(rx = format_args!("{other:#04x}"), "STM32 RX, not an ACK"),
                None => std::thread::sleep(IDLE_BACKOFF),
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::NoAck { command: message.lead() });
            }
        }
    }

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, DeviceError> {
        let mut buf = vec![0u8; n];
        read_exact_by(&mut self.channel, &mut buf, Instant::now() + self.config.timeout)?;
        Ok(buf)
    }

    fn expect_ack(&mut self, command: u8) -> Result<(), DeviceError> {
        match self.read_bytes(1)?[0] {
            ACK => Ok(()),
            NACK => Err(DeviceError::BootloaderNack { command }),
            _ => Err(DeviceError::NoAck { command }),
        }
    }

    fn get_once(&mut self) -> Result<BootloaderInfo, DeviceError> {
        self.transact(Message::Command(GET), ACK_TIMEOUT)?;
        let n = self.read_bytes(1)?[0] as usize;
        let data = self.read_bytes(n + 1)?;
        self.expect_ack(GET)?;

        Ok(BootloaderInfo {
            version: data[0],
            commands: data[1..].to_vec(),
        })
    }

    /// Asks the bootloader for its version and command set
    pub fn get(&mut self) -> Result<BootloaderInfo, DeviceError> {
        let info = self.retrying("stm32 get", |dev| dev.get_once())?;
        self.negotiated_with(info.clone());
        Ok(info)
    }

    /// Reads the chip's product id
    pub fn get_id(&mut self) -> Result<u16, DeviceError> {
        self.retrying("stm32 get id", |dev| {
            dev.transact(Message::Command(GET_ID), ACK_TIMEOUT)?;
            let n = dev.read_bytes(1)?[0] as usize;
            let pid = dev.read_bytes(n + 1)?;
            dev.expect_ack(GET_ID)?;

            let id = match pid.as_slice() {
                [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
                [lo] => *lo as u16,
                [] => 0,
            };
            debug!(pid = %hex(&pid), "bootloader product id");
            Ok(id)
        })
    }

    /// Reads `n` bytes (1 to 256) of memory
    pub fn read_memory(&mut self, address: u32, n: usize) -> Result<Vec<u8>, DeviceError> {
        if n == 0 || n > MAX_WRITE_SIZE {
            return Err(DeviceError::Unsupported("reads must be 1 to 256 bytes"));
        }

        info!(address = format_args!("{address:#x}"), n, "STM32 read memory");
        self.retrying("stm32 read memory", |dev| {
            dev.transact(Message::Command(READ_MEMORY), ACK_TIMEOUT)?;
            dev.transact(Message::Block(&address.to_be_bytes()), ACK_TIMEOUT)?;
            dev.transact(Message::Command((n - 1) as u8), ACK_TIMEOUT)?;
            dev.read_bytes(n)
        })
    }

    /// Starts executing at `address`.
    ///
    /// An unacknowledged jump is only logged; the program may still start.
    pub fn go(&mut self, address: u32) -> Result<(), DeviceError> {
        info!(address = format_args!("{address:#x}"), "STM32 go");
        self.retrying("stm32 go", |dev| {
            dev.transact(Message::Command(GO), ACK_TIMEOUT)?;
            if let Err(e) = dev.transact(Message::Block(&address.to_be_bytes()), GO_TIMEOUT) {
                warn!(
                    error = %e,
                    "bootloader did not acknowledge the jump; the program may take a moment \
                     to start or the device should be rebooted"
                );
            }
            Ok(())
        })?;
        self.state = BootloaderState::Jumped;
        Ok(())
    }

    /// Writes up to 256 bytes, padded to a whole number of words
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), DeviceError> {
        if data.len() > MAX_WRITE_SIZE {
            return Err(DeviceError::ProgramTooLarge {
                size: data.len(),
                max: MAX_WRITE_SIZE,
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        let mut block = Vec::with_capacity(data.len() + 4);
        block.push(0);
        block.extend_from_slice(data);
        block.resize(1 + ((data.len() + 3) & !3), 0);
        block[0] = (block.len() - 2) as u8;

        debug!(address = format_args!("{address:#x}"), bytes = data.len(), "STM32 write memory");
        self.retrying("stm32 write memory", |dev| {
            dev.transact(Message::Command(WRITE_MEMORY), ACK_TIMEOUT)?;
            dev.transact(Message::Block(&address.to_be_bytes()), ACK_TIMEOUT)?;
            dev.transact(Message::Block(&block), ACK_TIMEOUT)
        })
    }

    fn require_erase(&self, command: u8) -> Result<(), DeviceError> {
        if self.info.erase_command() == Some(command) {
            return Ok(());
        }
        Err(DeviceError::Unsupported(if command == ERASE {
            "standard erase not supported on this device (only extended erase)"
        } else {
            "extended erase not supported on this device (only standard erase)"
        }))
    }

    /// Erases every page of flash
    pub fn erase_all(&mut self) -> Result<(), DeviceError> {
        self.require_erase(ERASE)?;
        info!("STM32 erase all pages");
        self.retrying("stm32 erase all", |dev| {
            dev.transact(Message::Command(ERASE), ACK_TIMEOUT)?;
            dev.transact(Message::Command(0xFF), ACK_TIMEOUT)
        })?;
        self.state = BootloaderState::Erased;
        Ok(())
    }

    /// Erases the listed pages with the standard erase command
    pub fn erase_memory(&mut self, pages: &[u8]) -> Result<(), DeviceError> {
        self.require_erase(ERASE)?;
        if pages.is_empty() || pages.len() > NUM_PAGES {
            return Err(DeviceError::Unsupported("standard erase takes 1 to 255 pages"));
        }

        let mut block = vec![(pages.len() - 1) as u8];
        block.extend_from_slice(pages);

        info!(pages = pages.len(), "STM32 erase pages");
        self.retrying("stm32 erase memory", |dev| {
            dev.transact(Message::Command(ERASE), ACK_TIMEOUT)?;
            dev.transact(Message::Block(&block), ACK_TIMEOUT)
        })?;
        self.state = BootloaderState::Erased;
        Ok(())
    }

    /// Erases the listed pages with the extended erase command
    pub fn extended_erase(&mut self, pages: &[u16]) -> Result<(), DeviceError> {
        self.require_erase(EXTENDED_ERASE)?;
        if pages.is_empty() || pages.len() >= 0xFFF0 {
            return Err(DeviceError::Unsupported("extended erase takes 1 to 0xFFEF pages"));
        }

        let mut block = ((pages.len() - 1) as u16).to_be_bytes().to_vec();
        for page in pages {
            block.extend(page.to_be_bytes());
        }

        info!(pages = pages.len(), "STM32 extended erase");
        self.retrying("stm32 extended erase", |dev| {
            dev.transact(Message::Command(EXTENDED_ERASE), ACK_TIMEOUT)?;
            dev.transact(Message::Block(&block), ACK_TIMEOUT)
        })?;
        self.state = BootloaderState::Erased;
        Ok(())
    }

    /// Erases, writes `image` from [`FLASH_START`] and optionally starts it
    pub fn write_program(
        &mut self,
        image: &[u8],
        options: &FlashOptions,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), DeviceError> {
        if image.len() > MAX_IMAGE_SIZE {
            return Err(DeviceError::ProgramTooLarge {
                size: image.len(),
                max: MAX_IMAGE_SIZE,
            });
        }

        if options.preserve_fs {
            let count = (image.len() / PAGE_SIZE + 1).min(NUM_PAGES);
            let pages: Vec<u8> = (0..count).map(|p| p as u8).collect();
            self.erase_memory(&pages)?;
        } else {
            self.erase_all()?;
        }

        info!(bytes = image.len(), "flashing image");
        self.state = BootloaderState::Programming;
        for range in plan_chunks(image.len(), MAX_WRITE_SIZE) {
            self.write_memory(FLASH_START + range.start as u32, &image[range.clone()])?;
            progress(TransferProgress {
                transferred: range.end,
                total: image.len(),
            });
        }

        if options.go_after {
            self.go(FLASH_START)?;
        }
        Ok(())
    }
}

impl<C: ByteChannel> BootloaderDevice for Stm32Device<C> {
    fn erase(&mut self, region: EraseRegion<'_>) -> Result<(), DeviceError> {
        match region {
            EraseRegion::All => self.erase_all(),
            EraseRegion::Pages(pages) => self.erase_memory(pages),
            EraseRegion::ExtendedPages(pages) => self.extended_erase(pages),
        }
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), DeviceError> {
        Stm32Device::write_memory(self, address, data)
    }

    fn go(&mut self, address: u32) -> Result<(), DeviceError> {
        Stm32Device::go(self, address)
    }

    fn write_program(
        &mut self,
        image: &[u8],
        options: &FlashOptions,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), DeviceError> {
        Stm32Device::write_program(self, image, options, progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_framing() {
        assert_eq!(Message::Command(GET).encode(), vec![0x00, 0xFF]);
        assert_eq!(Message::Command(WRITE_MEMORY).encode(), vec![0x31, 0xCE]);
        assert_eq!(
            Message::Block(&0x0800_0100u32.to_be_bytes()).encode(),
            vec![0x08, 0x00, 0x01, 0x00, 0x09]
        );
        assert_eq!(Message::Raw(&[INIT]).encode(), vec![INIT]);
    }

    #[test]
    fn default_command_set_uses_standard_erase() {
        assert_eq!(BootloaderInfo::default().erase_command(), Some(ERASE));
    }
}
