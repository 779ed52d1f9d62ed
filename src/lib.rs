//! Host side of the VEX serial protocols.
//!
//! Talks to V5 brains and controllers, STM32 bootloaders and legacy Cortex
//! microcontrollers over USB serial.

pub mod commands;
pub mod crc;
pub mod devices;
pub mod errors;
pub mod io;
pub mod ports;
pub mod protocol;
pub mod retry;
pub mod stream;
pub mod v5;
