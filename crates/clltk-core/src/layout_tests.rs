use super::crc8::crc8;
use super::layout::*;

#[test]
fn file_header_round_trip() {
    let header = FileHeader {
        version: FORMAT_VERSION,
        definition_offset: 56,
        ringbuffer_offset: 88,
        stack_offset: 1273,
    };
    let raw = header.encode();
    assert_eq!(raw.len(), FILE_HEADER_SIZE);
    assert_eq!(&raw[..16], &FILE_MAGIC);
    // Stored CRC makes the checksum over all 56 bytes zero.
    assert_eq!(crc8(&raw), 0);
    assert_eq!(FileHeader::decode(&raw).unwrap(), header);
}

#[test]
fn file_header_rejects_bad_magic() {
    let mut raw = FileHeader {
        version: FORMAT_VERSION,
        definition_offset: 56,
        ringbuffer_offset: 88,
        stack_offset: 1273,
    }
    .encode();
    raw[0] = b'!';
    assert_eq!(FileHeader::decode(&raw), Err(HeaderError::BadMagic));
}

#[test]
fn file_header_diagnoses_foreign_endianness() {
    let mut raw = [0u8; FILE_HEADER_SIZE];
    raw[..16].copy_from_slice(&FILE_MAGIC_BIG_ENDIAN);
    assert_eq!(
        FileHeader::decode(&raw),
        Err(HeaderError::ForeignEndianness)
    );
}

#[test]
fn file_header_rejects_crc_damage() {
    let mut raw = FileHeader {
        version: FORMAT_VERSION,
        definition_offset: 56,
        ringbuffer_offset: 88,
        stack_offset: 1273,
    }
    .encode();
    raw[20] ^= 0x40;
    assert_eq!(FileHeader::decode(&raw), Err(HeaderError::BadCrc));
}

#[test]
fn file_header_rejects_unordered_sections() {
    let raw = FileHeader {
        version: FORMAT_VERSION,
        definition_offset: 56,
        ringbuffer_offset: 2000,
        stack_offset: 100,
    }
    .encode();
    assert_eq!(
        FileHeader::decode(&raw),
        Err(HeaderError::BadSectionOffsets)
    );
}

#[test]
fn trace_entry_head_round_trip() {
    let head = TraceEntryHead {
        in_file_offset: 0x1234_5678_9ABC,
        pid: 4711,
        tid: 4712,
        timestamp_ns: 1_700_000_000_123_456_789,
    };
    let raw = head.encode();
    assert_eq!(raw.len(), TRACE_ENTRY_HEAD_SIZE);
    assert_eq!(TraceEntryHead::decode(&raw), Some(head));
}

#[test]
fn trace_entry_head_masks_to_48_bits() {
    let head = TraceEntryHead {
        in_file_offset: 0xFFFF_0000_0000_0001,
        pid: 0,
        tid: 0,
        timestamp_ns: 0,
    };
    let decoded = TraceEntryHead::decode(&head.encode()).unwrap();
    assert_eq!(decoded.in_file_offset, 0x0000_0000_0000_0001);
}

#[test]
fn trace_entry_head_needs_22_bytes() {
    assert_eq!(TraceEntryHead::decode(&[0u8; 21]), None);
}

#[test]
fn definition_body_carries_extended_record() {
    let body = encode_definition_body("sensors", SourceType::Userspace);
    let name_end = 7;
    assert_eq!(&body[..name_end], b"sensors");
    assert_eq!(body[name_end], 0);
    assert_eq!(
        &body[name_end + 1..name_end + 9],
        &DEFINITION_EXTENDED_MAGIC
    );
    assert_eq!(body[name_end + 9], DEFINITION_EXTENDED_VERSION);
    assert_eq!(body[name_end + 10], SourceType::Userspace as u8);
    // Trailing CRC self-zeroes over the whole body.
    assert_eq!(crc8(&body), 0);
    assert_eq!(body.len(), name_end + 1 + DEFINITION_EXTENDED_SIZE);
}

#[test]
fn source_type_decodes_all_known_values() {
    assert_eq!(SourceType::from_raw(0), SourceType::Unknown);
    assert_eq!(SourceType::from_raw(1), SourceType::Userspace);
    assert_eq!(SourceType::from_raw(2), SourceType::Kernel);
    assert_eq!(SourceType::from_raw(3), SourceType::Tty);
    assert_eq!(SourceType::from_raw(0x42), SourceType::Unknown);
}

#[test]
fn arg_type_codes_round_trip() {
    for code in [
        b'c', b'C', b'w', b'W', b'i', b'I', b'l', b'L', b'q', b'Q', b'f', b'd', b's', b'x', b'p',
        b'?', b'Z',
    ] {
        let ty = ArgType::from_code(code).unwrap();
        assert_eq!(ty.code(), code);
    }
    assert_eq!(ArgType::from_code(b'z'), None);
}

#[test]
fn arg_type_fixed_sizes() {
    assert_eq!(ArgType::U8.fixed_size(), 1);
    assert_eq!(ArgType::I16.fixed_size(), 2);
    assert_eq!(ArgType::F32.fixed_size(), 4);
    assert_eq!(ArgType::Str.fixed_size(), 4); // u32 length prefix
    assert_eq!(ArgType::Dump.fixed_size(), 4); // u32 size prefix
    assert_eq!(ArgType::Pointer.fixed_size(), 8);
    assert_eq!(ArgType::U128.fixed_size(), 16);
}

#[test]
fn round_up_behaviour() {
    assert_eq!(round_up(0, 8), 0);
    assert_eq!(round_up(1, 8), 8);
    assert_eq!(round_up(8, 8), 8);
    assert_eq!(round_up(9, 8), 16);
}
