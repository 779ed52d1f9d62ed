use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

/// Names of the regions a decoded frame can carry
pub mod region {
    pub const HEADER: &str = "header";
    pub const COMMAND: &str = "command";
    pub const LENGTH: &str = "length";
    pub const PAYLOAD: &str = "payload";
    pub const EXTENDED_COMMAND: &str = "extended_command";
    pub const ACK: &str = "ack";
    pub const DATA: &str = "data";
    pub const CRC: &str = "crc";
}

/// A received packet: the raw bytes off the wire plus named byte ranges into them.
///
/// The raw bytes are kept so the extended layer can verify the CRC over the
/// whole packet and so failures can be logged exactly as received.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    raw: Vec<u8>,
    regions: BTreeMap<&'static str, Range<usize>>,
}

impl Frame {
    pub fn new(raw: Vec<u8>) -> Self {
        Frame {
            raw,
            regions: BTreeMap::new(),
        }
    }

    /// Names a range of the raw bytes. Ranges past the end are clamped.
    pub fn set_region(&mut self, name: &'static str, range: Range<usize>) {
        let end = range.end.min(self.raw.len());
        let start = range.start.min(end);
        self.regions.insert(name, start..end);
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }

    /// The bytes of a named region, if it was recorded
    pub fn region(&self, name: &str) -> Option<&[u8]> {
        self.regions.get(name).map(|r| &self.raw[r.clone()])
    }

    /// The byte range of a named region, if it was recorded
    pub fn region_range(&self, name: &str) -> Option<Range<usize>> {
        self.regions.get(name).cloned()
    }

    pub fn regions(&self) -> impl Iterator<Item = (&'static str, &[u8])> {
        self.regions
            .iter()
            .map(|(name, range)| (*name, &self.raw[range.clone()]))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", super::hex(&self.raw))?;
        for (name, bytes) in self.regions() {
            write!(f, "\n  {}: {}", name, super::hex(bytes))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_index_into_raw() {
        let mut frame = Frame::new(vec![0xAA, 0x55, 0x21, 0x02, 0x01, 0x02]);
        frame.set_region(region::HEADER, 0..2);
        frame.set_region(region::PAYLOAD, 4..6);

        assert_eq!(frame.region(region::HEADER), Some(&[0xAA, 0x55][..]));
        assert_eq!(frame.region(region::PAYLOAD), Some(&[0x01, 0x02][..]));
        assert_eq!(frame.region(region::CRC), None);
    }

    #[test]
    fn out_of_range_regions_are_clamped() {
        let mut frame = Frame::new(vec![1, 2, 3]);
        frame.set_region(region::DATA, 2..10);
        assert_eq!(frame.region(region::DATA), Some(&[3][..]));

        frame.set_region(region::ACK, 7..9);
        assert_eq!(frame.region(region::ACK), Some(&[][..]));
    }
}
