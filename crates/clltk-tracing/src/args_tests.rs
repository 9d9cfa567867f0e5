use clltk_core::layout::ArgType;

use super::args::{tighten_types, ArgValue};

fn packed(value: &ArgValue<'_>, declared: ArgType) -> Vec<u8> {
    let mut out = Vec::new();
    value.pack_into(declared, &mut out);
    assert_eq!(out.len(), value.packed_size(declared));
    out
}

#[test]
fn scalars_pack_little_endian() {
    assert_eq!(packed(&ArgValue::U8(0xAB), ArgType::U8), vec![0xAB]);
    assert_eq!(
        packed(&ArgValue::U16(0x1234), ArgType::U16),
        vec![0x34, 0x12]
    );
    assert_eq!(
        packed(&ArgValue::I32(-2), ArgType::I32),
        vec![0xFE, 0xFF, 0xFF, 0xFF]
    );
    assert_eq!(
        packed(&ArgValue::U64(0x0102_0304_0506_0708), ArgType::U64),
        vec![0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
    );
    assert_eq!(packed(&ArgValue::F32(1.0), ArgType::F32), 1.0f32.to_le_bytes());
    assert_eq!(packed(&ArgValue::F64(-0.5), ArgType::F64), (-0.5f64).to_le_bytes());
    assert_eq!(packed(&ArgValue::U128(1), ArgType::U128).len(), 16);
}

#[test]
fn strings_carry_their_length_and_nul() {
    let out = packed(&ArgValue::Str("abc"), ArgType::Str);
    assert_eq!(&out[..4], &4u32.to_le_bytes()); // 3 bytes + NUL
    assert_eq!(&out[4..7], b"abc");
    assert_eq!(out[7], 0);
}

#[test]
fn empty_string_is_just_the_nul() {
    let out = packed(&ArgValue::Str(""), ArgType::Str);
    assert_eq!(&out[..4], &1u32.to_le_bytes());
    assert_eq!(out[4], 0);
}

#[test]
fn string_declared_as_pointer_packs_its_address() {
    let s = "stable";
    let out = packed(&ArgValue::Str(s), ArgType::Pointer);
    assert_eq!(out.len(), 8);
    assert_eq!(u64::from_le_bytes(out.try_into().unwrap()), s.as_ptr() as u64);
}

#[test]
fn tightening_rewrites_str_under_percent_p() {
    let declared = [ArgType::Str, ArgType::Str];
    let tightened = tighten_types("ptr=%p str=%s", &declared);
    assert_eq!(tightened, vec![ArgType::Pointer, ArgType::Str]);
}

#[test]
fn tightening_ignores_escaped_percent() {
    let declared = [ArgType::Str];
    let tightened = tighten_types("100%% done: %s", &declared);
    assert_eq!(tightened, vec![ArgType::Str]);
}

#[test]
fn tightening_handles_width_and_precision() {
    let declared = [ArgType::Str, ArgType::U32];
    let tightened = tighten_types("%-20.8s and %08d", &declared);
    assert_eq!(tightened, vec![ArgType::Str, ArgType::U32]);
}
