//! CRC-8 checksums used throughout the tracebuffer format.
//!
//! Polynomial 0x07 (x^8 + x^2 + x + 1), initial value 0, no reflection,
//! no final XOR. Every CRC-protected structure in the file stores its
//! checksum as the last byte, so recomputing the CRC over the full
//! structure (data plus stored CRC) yields 0 for intact data.

/// Lookup table for CRC-8 with polynomial 0x07.
const CRC8_TABLE: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            if crc & 0x80 != 0 {
                crc = (crc << 1) ^ 0x07;
            } else {
                crc <<= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Computes the CRC-8 of `data` starting from an initial value of 0.
#[inline]
#[must_use]
pub fn crc8(data: &[u8]) -> u8 {
    crc8_continue(0, data)
}

/// Continues a CRC-8 computation over another block.
///
/// Used for regions that wrap around the end of the ring-buffer body:
/// the checksum of the first block is fed back in as `crc` for the
/// second.
#[inline]
#[must_use]
pub fn crc8_continue(crc: u8, data: &[u8]) -> u8 {
    let mut crc = crc;
    for &byte in data {
        crc = CRC8_TABLE[usize::from(crc ^ byte)];
    }
    crc
}
