//! Discovery of VEX serial ports connected over USB.

use serialport::{SerialPortInfo, SerialPortType};
use tracing::debug;

use crate::errors::DeviceError;

/// The USB vendor ID of VEX Robotics
pub const VEX_USB_VID: u16 = 0x2888;

/// The USB product ID of the V5 brain
pub const VEX_V5_BRAIN_USB_PID: u16 = 0x0501;

/// The USB product ID of the V5 controller
pub const VEX_V5_CONTROLLER_USB_PID: u16 = 0x0503;

/// USB vendor IDs of the serial bridges used by the Cortex and its programming kit
pub const VEX_CORTEX_USB_VIDS: [u16; 2] = [0x04D8, 0x067B];

/// The role of a single VEX serial port
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VexPortType {
    /// Talks directly with the running user program
    User,
    /// Talks with VEXos. Commands are sent over this port.
    System,
    /// The single port of a V5 controller
    Controller,
    /// A Cortex microcontroller or its programming cable
    Cortex,
}

/// The information of a VEX serial port
#[derive(Clone, Debug)]
pub struct VexSerialPort {
    pub port_info: SerialPortInfo,
    pub port_type: VexPortType,
}

impl VexSerialPort {
    pub fn name(&self) -> &str {
        &self.port_info.port_name
    }
}

/// This enum represents any possible VEX device connected over serial
#[derive(Clone, Debug)]
pub enum VexSerialDevice {
    V5Brain {
        user: VexSerialPort,
        system: VexSerialPort,
    },
    V5Controller {
        system: VexSerialPort,
    },
    /// A brain system port whose user port could not be found
    V5Unknown {
        system: VexSerialPort,
    },
    Cortex {
        port: VexSerialPort,
    },
}

impl VexSerialDevice {
    /// The port request/response commands should be sent over
    pub fn system_port(&self) -> &VexSerialPort {
        match self {
            Self::V5Brain { system, .. }
            | Self::V5Controller { system }
            | Self::V5Unknown { system } => system,
            Self::Cortex { port } => port,
        }
    }

    /// The port carrying the user program's output, if the device has one
    pub fn user_port(&self) -> Option<&VexSerialPort> {
        match self {
            Self::V5Brain { user, .. } => Some(user),
            _ => None,
        }
    }
}

/// Decides the role of each port from its USB descriptor.
///
/// Ports that are not from VEX are dropped. Brain ports are told apart by
/// their product string; when that is missing the system port is assumed to
/// be listed before the user port.
pub fn classify_ports(ports: Vec<SerialPortInfo>) -> Vec<VexSerialPort> {
    let mut vex_ports: Vec<VexSerialPort> = Vec::new();

    for port in ports {
        // If it is not a USB port, ignore it.
        let usb = match &port.port_type {
            SerialPortType::UsbPort(info) => info.clone(),
            _ => continue,
        };

        let port_type = if VEX_CORTEX_USB_VIDS.contains(&usb.vid) {
            VexPortType::Cortex
        } else if usb.vid != VEX_USB_VID {
            continue;
        } else if usb.pid == VEX_V5_CONTROLLER_USB_PID {
            VexPortType::Controller
        } else if usb.pid == VEX_V5_BRAIN_USB_PID {
            let product = usb.product.unwrap_or_default();
            if product.contains("User") {
                VexPortType::User
            } else if product.contains("Communications") || product.contains("System") {
                VexPortType::System
            } else if vex_ports
                .last()
                .map_or(false, |p| p.port_type == VexPortType::System)
            {
                // User is listed after System
                VexPortType::User
            } else {
                VexPortType::System
            }
        } else {
            continue;
        };

        debug!(port = %port.port_name, ?port_type, "found VEX port");
        vex_ports.push(VexSerialPort {
            port_info: port,
            port_type,
        });
    }

    vex_ports
}

/// Groups classified ports into devices. A brain owns a neighbouring
/// system/user pair; a lone user port is ignored.
pub fn group_ports(ports: Vec<VexSerialPort>) -> Vec<VexSerialDevice> {
    let mut devices = Vec::new();
    let mut port_iter = ports.into_iter().peekable();

    while let Some(current) = port_iter.next() {
        match current.port_type {
            VexPortType::System => {
                match port_iter.next_if(|p| p.port_type == VexPortType::User) {
                    Some(user) => devices.push(VexSerialDevice::V5Brain {
                        user,
                        system: current,
                    }),
                    None => devices.push(VexSerialDevice::V5Unknown { system: current }),
                }
            }
            VexPortType::User => {
                if let Some(system) = port_iter.next_if(|p| p.port_type == VexPortType::System) {
                    devices.push(VexSerialDevice::V5Brain {
                        user: current,
                        system,
                    });
                }
            }
            VexPortType::Controller => devices.push(VexSerialDevice::V5Controller { system: current }),
            VexPortType::Cortex => devices.push(VexSerialDevice::Cortex { port: current }),
        }
    }

    devices
}

/// Finds every VEX device connected to this computer
pub fn find_devices() -> Result<Vec<VexSerialDevice>, DeviceError> {
    let ports = serialport::available_ports()?;
    Ok(group_ports(classify_ports(ports)))
}
