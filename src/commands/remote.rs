//! Implements a command for setting the controller's channel

use super::{checked_extended, Command};
use crate::errors::DecodeError;
use crate::protocol::{encode_extended, SimpleResponse};
use crate::v5::V5ControllerChannel;

/// Switches the controller's radio channel
///
/// # Members
///
/// * `0` - The controller channel to switch to
///
/// # Examples
///
/// ```rust
/// use vex_serial::commands::SwitchChannel;
/// use vex_serial::v5::V5ControllerChannel;
///
/// // Create a SwitchChannel instance that will switch to the download channel
/// let switch = SwitchChannel(V5ControllerChannel::Download);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SwitchChannel(pub V5ControllerChannel);

impl Command for SwitchChannel {
    type Response = ();
    const NAME: &'static str = "switch channel";

    fn encode_request(&self) -> Result<Vec<u8>, DecodeError> {
        // The leading 1 selects the radio
        encode_extended(0x10, &[0x01, self.0 as u8])
    }

    fn decode_response(&self, response: SimpleResponse) -> Result<Self::Response, DecodeError> {
        checked_extended(response, 0x10, 0).map(|_| ())
    }
}
