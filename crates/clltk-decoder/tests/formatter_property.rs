//! Property tests: the formatter agrees with Rust's own rendering on
//! the unambiguous conversions.

use proptest::prelude::*;

use clltk_decoder::formatter::printf;

fn packed_str(s: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(s.len() as u32 + 1).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn unsigned_decimal_matches(value in any::<u64>()) {
        let args = value.to_le_bytes();
        prop_assert_eq!(printf("%u", b"l", &args).unwrap(), value.to_string());
    }

    #[test]
    fn signed_decimal_matches(value in any::<i64>()) {
        let args = value.to_le_bytes();
        prop_assert_eq!(printf("%d", b"L", &args).unwrap(), value.to_string());
    }

    #[test]
    fn hex_matches(value in any::<u32>()) {
        let args = value.to_le_bytes();
        prop_assert_eq!(printf("%x", b"i", &args).unwrap(), format!("{value:x}"));
        prop_assert_eq!(printf("%X", b"i", &args).unwrap(), format!("{value:X}"));
        prop_assert_eq!(printf("%o", b"i", &args).unwrap(), format!("{value:o}"));
    }

    #[test]
    fn strings_round_trip(s in "[ -~]{0,64}") {
        // Printable ASCII only: control characters are scrubbed by
        // design and '%' would be a specifier in the format.
        prop_assume!(!s.contains('%'));
        let args = packed_str(&s);
        prop_assert_eq!(printf("%s", b"s", &args).unwrap(), s);
    }

    #[test]
    fn fixed_float_matches(value in -1.0e12f64..1.0e12) {
        let args = value.to_le_bytes();
        prop_assert_eq!(printf("%.6f", b"d", &args).unwrap(), format!("{value:.6}"));
    }

    #[test]
    fn width_never_truncates(value in any::<u32>(), width in 0usize..24) {
        let args = value.to_le_bytes();
        let format = format!("%{width}u");
        let rendered = printf(&format, b"i", &args).unwrap();
        prop_assert!(rendered.len() >= width);
        prop_assert_eq!(rendered.trim_start(), value.to_string());
    }
}
