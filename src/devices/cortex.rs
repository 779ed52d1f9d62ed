//! The legacy Cortex microcontroller.
//!
//! The Cortex speaks a handful of simple packets. Programs are not stored
//! as files; instead the Cortex is asked to expose the STM32 bootloader of
//! its user processor, which is then flashed directly.

use std::fmt;
use std::io::Write;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::{debug, info};

use super::stm32::{FlashOptions, Stm32Device};
use super::{AnyDevice, DeviceConfig, TransferProgress};
use crate::commands::{checked_simple, Command};
use crate::errors::{DecodeError, DeviceError};
use crate::io::ByteChannel;
use crate::protocol::simple::{poll_byte, IDLE_BACKOFF};
use crate::protocol::{encode_simple, hex, SimpleResponse, ACK};
use crate::retry::RetryPolicy;

/// Scale of the battery bytes, in volts per count
const BATTERY_SCALE: f32 = 0.059;

const SEND_TO_DOWNLOAD: u8 = 0x35;
const EXPOSE_BOOTLOADER: u8 = 0x25;

const DOWNLOAD_ACK_TIMEOUT: Duration = Duration::from_secs(1);

bitflags! {
    /// How the Cortex is tethered to the host
    pub struct CortexFlags: u8 {
        const DL_MODE = 1 << 0;
        const TETH_VN2 = 1 << 2;
        const FCS_CONNECT = 1 << 3;
        const TETH_USB = 1 << 4;
        const DIRECT_USB = 1 << 5;
        const FCS_AUTON = 1 << 6;
        const FCS_DISABLE = 1 << 7;

        const TETH_BITS = Self::DL_MODE.bits | Self::TETH_VN2.bits | Self::TETH_USB.bits;
    }
}

impl CortexFlags {
    /// Describes the tether the way the field control software does
    pub fn tether(&self) -> &'static str {
        if !self.intersects(CortexFlags::TETH_BITS) {
            "Serial w/VEXnet 1.0 Keys"
        } else if self.contains(CortexFlags::DL_MODE | CortexFlags::TETH_VN2) {
            "Serial w/VEXnet 2.0 Keys (download mode)"
        } else if self.contains(CortexFlags::DL_MODE) {
            "Serial w/VEXnet 1.0 Keys (turbo)"
        } else if self.contains(CortexFlags::TETH_VN2) {
            "Serial w/VEXnet 2.0 Keys"
        } else if self.contains(CortexFlags::TETH_USB) {
            "Serial w/ a USB Cable"
        } else if self.contains(CortexFlags::DIRECT_USB) {
            "Directly w/ a USB Cable"
        } else {
            "Unknown"
        }
    }
}

impl fmt::Display for CortexFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tether())?;
        if self.contains(CortexFlags::FCS_CONNECT) {
            write!(f, " - FCS Connected")?;
        }
        Ok(())
    }
}

/// Firmware versions, batteries and tether of a Cortex and its joystick
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CortexStatus {
    pub joystick_firmware: [u8; 2],
    pub robot_firmware: [u8; 2],
    /// Volts
    pub joystick_battery: f32,
    pub robot_battery: f32,
    pub backup_battery: f32,
    pub flags: CortexFlags,
}

impl fmt::Display for CortexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Tether: {}", self.flags)?;
        writeln!(
            f,
            "  Cortex: F/W {}.{} w/ {:1.2} V (Backup: {:1.2} V)",
            self.robot_firmware[0], self.robot_firmware[1], self.robot_battery, self.backup_battery
        )?;
        write!(
            f,
            "Joystick: F/W {}.{} w/ {:1.2} V",
            self.joystick_firmware[0], self.joystick_firmware[1], self.joystick_battery
        )
    }
}

/// Asks the Cortex for its status
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QuerySystem();

impl Command for QuerySystem {
    type Response = CortexStatus;
    const NAME: &'static str = "cortex query system";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(encode_simple(0x21, &[]))
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        // Two trailing bytes are reserved
        let v = checked_simple(&response, 0x21, 10)?;
        Ok(CortexStatus {
            joystick_firmware: [v[0], v[1]],
            robot_firmware: [v[2], v[3]],
            joystick_battery: v[4] as f32 * BATTERY_SCALE,
            robot_battery: v[5] as f32 * BATTERY_SCALE,
            backup_battery: v[6] as f32 * BATTERY_SCALE,
            flags: CortexFlags::from_bits_truncate(v[7]),
        })
    }
}

/// A Cortex reached over its programming cable
pub struct CortexDevice<C: ByteChannel> {
    channel: C,
    config: DeviceConfig,
}

impl<C: ByteChannel> CortexDevice<C> {
    pub fn new(channel: C) -> Self {
        Self::with_config(channel, DeviceConfig::default())
    }

    pub fn with_config(channel: C, config: DeviceConfig) -> Self {
        CortexDevice { channel, config }
    }

    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Probes for a bootloader already listening on the channel.
    ///
    /// A Cortex left in bootloader mode answers the STM32 `get` command
    /// and is returned as a bootloader; otherwise the Cortex itself is.
    pub fn into_connected_device(self) -> Result<AnyDevice<C>, DeviceError> {
        info!("interrogating cortex");
        let config = self.config;
        let mut probe = Stm32Device::new(self.channel, config.with_retry(RetryPolicy::NONE));

        match probe.get() {
            Ok(_) => {
                probe.config_mut().retry = config.retry;
                Ok(AnyDevice::Stm32(probe))
            }
            Err(e) if e.is_retryable() || matches!(e, DeviceError::BootloaderNack { .. }) => {
                debug!(error = %e, "no bootloader answered");
                Ok(AnyDevice::Cortex(CortexDevice::with_config(probe.into_channel(), config)))
            }
            Err(e) => Err(e),
        }
    }

    pub fn query_system(&mut self) -> Result<CortexStatus, DeviceError> {
        info!("querying system information");
        let retry = self.config.retry;
        let timeout = self.config.timeout;
        let status = retry.run(QuerySystem::NAME, |_| {
            super::exchange(&mut self.channel, &QuerySystem(), timeout)
        })?;
        info!(status = %status, "cortex status");
        Ok(status)
    }

    /// Moves the joystick link onto the download channel
    pub fn send_to_download_channel(&mut self) -> Result<(), DeviceError> {
        info!("sending to download channel");
        let retry = self.config.retry;
        retry.run("send to download channel", |_| {
            let packet = encode_simple(SEND_TO_DOWNLOAD, &[]);
            self.channel.clear_input()?;
            debug!(tx = %hex(&packet), "TX");
            self.channel.write_all(&packet)?;
            self.channel.flush()?;
            self.wait_for_ack(SEND_TO_DOWNLOAD, DOWNLOAD_ACK_TIMEOUT)
        })
    }

    /// Waits for a bare ACK byte
    fn wait_for_ack(&mut self, command: u8, timeout: Duration) -> Result<(), DeviceError> {
        let deadline = Instant::now() + timeout;
        loop {
            match poll_byte(&mut self.channel)? {
                Some(ACK) => return Ok(()),
                Some(_) => {}
                None => std::thread::sleep(IDLE_BACKOFF),
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::NoAck { command });
            }
        }
    }

    /// Asks the user processor to reset into its bootloader and negotiates with it
    pub fn expose_bootloader(mut self) -> Result<Stm32Device<C>, DeviceError> {
        info!("exposing bootloader");
        let packet = encode_simple(EXPOSE_BOOTLOADER, &[]);
        for _ in 0..5 {
            debug!(tx = %hex(&packet), "TX");
            self.channel.write_all(&packet)?;
            self.channel.flush()?;
            std::thread::sleep(Duration::from_millis(100));
        }
        self.channel.clear_input()?;
        std::thread::sleep(Duration::from_millis(300));

        Stm32Device::negotiated(self.channel, self.config, true)
    }

    /// Flashes a program through the exposed bootloader, which is handed back
    pub fn write_program(
        mut self,
        image: &[u8],
        options: &FlashOptions,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<Stm32Device<C>, DeviceError> {
        info!(port = %self.channel.name(), bytes = image.len(), "writing program to cortex");
        let status = self.query_system()?;
        if !status.flags.intersects(CortexFlags::TETH_USB | CortexFlags::DL_MODE) {
            self.send_to_download_channel()?;
        }

        let mut bootloader = self.expose_bootloader()?;
        bootloader.write_program(image, options, progress)?;
        info!("finished uploading to cortex");
        Ok(bootloader)
    }
}
