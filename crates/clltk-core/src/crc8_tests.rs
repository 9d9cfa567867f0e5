use super::crc8::{crc8, crc8_continue};

#[test]
fn empty_input_is_zero() {
    assert_eq!(crc8(&[]), 0);
}

#[test]
fn known_vectors() {
    // Reference values for polynomial 0x07, init 0.
    assert_eq!(crc8(b"123456789"), 0xF4);
    assert_eq!(crc8(&[0x00]), 0x00);
    assert_eq!(crc8(&[0x01]), 0x07);
    assert_eq!(crc8(&[0xFF]), 0xF3);
}

#[test]
fn split_computation_matches_whole() {
    let data = b"the quick brown fox jumps over the lazy dog";
    let whole = crc8(data);
    for split in 0..data.len() {
        let (a, b) = data.split_at(split);
        assert_eq!(crc8_continue(crc8(a), b), whole, "split at {split}");
    }
}

#[test]
fn appending_the_crc_self_zeroes() {
    // Every CRC-protected structure in the format relies on this:
    // the checksum over data plus its stored CRC is zero.
    let data = b"some header bytes";
    let crc = crc8(data);
    assert_eq!(crc8_continue(crc, &[crc]), 0);
}
