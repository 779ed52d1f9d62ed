//! V5 brain and controller data types.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::errors::DeviceError;

pub mod meta;
pub use meta::*;

/// Length of a file name field on the wire
pub const FILE_NAME_LEN: usize = 24;

/// Default load address of user programs
pub const USER_PROGRAM_ADDR: u32 = 0x0380_0000;

/// Default version stamped on uploaded files
pub const DEFAULT_FILE_VERSION: u32 = 0x0100_0000;

/// Unix time of 2000-01-01T00:00:00Z, the brain's epoch
pub const VEX_EPOCH_UNIX: i64 = 946_684_800;

/// Seconds since the brain's epoch. Times before it clamp to zero.
pub fn vex_timestamp(time: DateTime<Utc>) -> u32 {
    (time.timestamp() - VEX_EPOCH_UNIX).clamp(0, u32::MAX as i64) as u32
}

/// Converts a brain timestamp back to wall clock time
pub fn from_vex_timestamp(seconds: u32) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(VEX_EPOCH_UNIX + seconds as i64, 0)
}

/// Encodes a file name into the fixed 24 byte, NUL padded field.
///
/// Longer names are truncated with a warning. Names must be ASCII.
pub fn encode_file_name(name: &str) -> Result<[u8; FILE_NAME_LEN], DeviceError> {
    if !name.is_ascii() {
        return Err(DeviceError::InvalidFileName(name.to_string()));
    }

    if name.len() > FILE_NAME_LEN {
        warn!(name, truncated = &name[..FILE_NAME_LEN], "truncating file name");
    }

    let mut field = [0u8; FILE_NAME_LEN];
    for (slot, b) in field.iter_mut().zip(name.bytes()) {
        *slot = b;
    }
    Ok(field)
}

/// Decodes a NUL padded name field
pub fn decode_file_name(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn file_names_are_padded_and_truncated() {
        let field = encode_file_name("slot_1.bin").unwrap();
        assert_eq!(&field[..10], b"slot_1.bin");
        assert!(field[10..].iter().all(|b| *b == 0));
        assert_eq!(decode_file_name(&field), "slot_1.bin");

        let long = encode_file_name("a_very_long_program_name_indeed.bin").unwrap();
        assert_eq!(decode_file_name(&long), "a_very_long_program_name");
    }

    #[test]
    fn non_ascii_names_are_rejected() {
        assert!(matches!(
            encode_file_name("prögram"),
            Err(DeviceError::InvalidFileName(_))
        ));
    }

    #[test]
    fn timestamps_count_from_2000() {
        let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(vex_timestamp(epoch), 0);

        let later = Utc.with_ymd_and_hms(2000, 1, 2, 0, 0, 1).unwrap();
        assert_eq!(vex_timestamp(later), 86_401);
        assert_eq!(from_vex_timestamp(86_401), Some(later));

        let before = Utc.with_ymd_and_hms(1999, 12, 31, 0, 0, 0).unwrap();
        assert_eq!(vex_timestamp(before), 0);
    }
}
