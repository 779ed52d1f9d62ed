//! Table driven CRC engine used by the VEX protocols.
//!
//! The brain uses a non-reflected CRC16 (XMODEM) to protect extended packets
//! and a non-reflected CRC32 with a zero initial value to check file contents.
//! Tables are built at compile time so they can be shared freely between threads.

/// A precomputed lookup table for a non-reflected CRC of `width` bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrcTable {
    width: u32,
    polynomial: u32,
    table: [u32; 256],
}

impl CrcTable {
    /// Builds the lookup table for a CRC with the given width and polynomial.
    ///
    /// # Arguments
    ///
    /// * `width` - The width of the CRC in bits. Must be between 8 and 32.
    /// * `polynomial` - The generator polynomial without the implicit top bit.
    ///
    /// # Panics
    ///
    /// Panics if `width` is out of range. When used in a `const` or `static`
    /// this is a compile error instead.
    pub const fn new(width: u32, polynomial: u32) -> Self {
        assert!(width >= 8 && width <= 32, "crc width must be between 8 and 32 bits");

        let top_bit = 1u64 << (width - 1);
        let mask = Self::mask_for(width);
        let poly = polynomial as u64 & mask;

        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            // Shift the index into the top byte of the accumulator
            let mut acc = (i as u64) << (width - 8);

            let mut bit = 0;
            while bit < 8 {
                acc = if acc & top_bit != 0 {
                    (acc << 1) ^ poly
                } else {
                    acc << 1
                };
                bit += 1;
            }

            table[i] = (acc & mask) as u32;
            i += 1;
        }

        CrcTable {
            width,
            polynomial,
            table,
        }
    }

    const fn mask_for(width: u32) -> u64 {
        (1u64 << width) - 1
    }

    /// The width of this CRC in bits
    pub fn width(&self) -> u32 {
        self.width
    }

    /// The generator polynomial this table was built from
    pub fn polynomial(&self) -> u32 {
        self.polynomial
    }

    /// Computes the CRC of `data`, starting from `initial`.
    ///
    /// Passing the result of a previous call as `initial` continues the
    /// computation, so a message can be hashed in pieces.
    pub fn compute(&self, data: &[u8], initial: u32) -> u32 {
        let mask = Self::mask_for(self.width);
        let shift = self.width - 8;

        let mut acc = initial as u64 & mask;
        for &byte in data {
            let index = (((acc >> shift) ^ byte as u64) & 0xff) as usize;
            acc = ((acc << 8) ^ self.table[index] as u64) & mask;
        }

        acc as u32
    }
}

/// The CRC16 protecting extended packets. This is CRC-16/XMODEM.
pub static VEX_CRC16: CrcTable = CrcTable::new(16, 0x1021);

/// The CRC32 used for file contents. Non-reflected, zero initial value and no
/// final xor.
pub static VEX_CRC32: CrcTable = CrcTable::new(32, 0x04C1_1DB7);

/// Convenience wrapper computing the VEX CRC16 of `data` from a zero start.
pub fn crc16(data: &[u8]) -> u16 {
    VEX_CRC16.compute(data, 0) as u16
}

/// Convenience wrapper computing the VEX CRC32 of `data` from a zero start.
pub fn crc32(data: &[u8]) -> u32 {
    VEX_CRC32.compute(data, 0)
}
