//! Typed tracepoint arguments and their packed encoding.
//!
//! Arguments travel through the ring as raw little-endian bytes; the
//! metadata blob's type array tells the decoder how to unpack them.
//! Strings carry a `u32` length (including the NUL) before their bytes
//! so the decoder can skip them without parsing.

use clltk_core::layout::ArgType;

/// One runtime argument value of a tracepoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArgValue<'a> {
    /// `u8`
    U8(u8),
    /// `i8`
    I8(i8),
    /// `u16`
    U16(u16),
    /// `i16`
    I16(i16),
    /// `u32`
    U32(u32),
    /// `i32`
    I32(i32),
    /// `u64`
    U64(u64),
    /// `i64`
    I64(i64),
    /// `u128`
    U128(u128),
    /// `i128`
    I128(i128),
    /// `f32`
    F32(f32),
    /// `f64`
    F64(f64),
    /// string argument
    Str(&'a str),
    /// raw pointer value
    Ptr(u64),
}

impl ArgValue<'_> {
    /// The on-disk type code this value is declared as.
    #[must_use]
    pub fn arg_type(&self) -> ArgType {
        match self {
            Self::U8(_) => ArgType::U8,
            Self::I8(_) => ArgType::I8,
            Self::U16(_) => ArgType::U16,
            Self::I16(_) => ArgType::I16,
            Self::U32(_) => ArgType::U32,
            Self::I32(_) => ArgType::I32,
            Self::U64(_) => ArgType::U64,
            Self::I64(_) => ArgType::I64,
            Self::U128(_) => ArgType::U128,
            Self::I128(_) => ArgType::I128,
            Self::F32(_) => ArgType::F32,
            Self::F64(_) => ArgType::F64,
            Self::Str(_) => ArgType::Str,
            Self::Ptr(_) => ArgType::Pointer,
        }
    }

    /// Bytes this value occupies when packed as `declared`.
    #[must_use]
    pub fn packed_size(&self, declared: ArgType) -> usize {
        match (declared, self) {
            // A string traced through a %p specifier travels as its
            // address, not its bytes.
            (ArgType::Pointer | ArgType::InvalidStr, _) => 8,
            (ArgType::Str, Self::Str(s)) => 4 + s.len() + 1,
            (ArgType::Str, _) => 4 + 1,
            _ => declared.fixed_size(),
        }
    }

    /// Appends the packed form of this value, interpreted as
    /// `declared`, to `out`.
    pub fn pack_into<B: Extend<u8>>(&self, declared: ArgType, out: &mut B) {
        match (declared, self) {
            (ArgType::Pointer | ArgType::InvalidStr, Self::Str(s)) => {
                out.extend((s.as_ptr() as u64).to_le_bytes());
            }
            (ArgType::Str, Self::Str(s)) => {
                let size = s.len() as u32 + 1;
                out.extend(size.to_le_bytes());
                out.extend(s.bytes());
                out.extend([0u8]);
            }
            (ArgType::Str, _) => {
                // Declared as string but a scalar arrived; emit an
                // empty string so the decoder stays in sync.
                out.extend(1u32.to_le_bytes());
                out.extend([0u8]);
            }
            (_, Self::U8(v)) => out.extend([*v]),
            (_, Self::I8(v)) => out.extend(v.to_le_bytes()),
            (_, Self::U16(v)) => out.extend(v.to_le_bytes()),
            (_, Self::I16(v)) => out.extend(v.to_le_bytes()),
            (_, Self::U32(v)) => out.extend(v.to_le_bytes()),
            (_, Self::I32(v)) => out.extend(v.to_le_bytes()),
            (_, Self::U64(v) | Self::Ptr(v)) => out.extend(v.to_le_bytes()),
            (_, Self::I64(v)) => out.extend(v.to_le_bytes()),
            (_, Self::U128(v)) => out.extend(v.to_le_bytes()),
            (_, Self::I128(v)) => out.extend(v.to_le_bytes()),
            (_, Self::F32(v)) => out.extend(v.to_le_bytes()),
            (_, Self::F64(v)) => out.extend(v.to_le_bytes()),
            // A string value against a scalar declaration cannot be
            // represented; keep the stream aligned with zero bytes.
            (_, Self::Str(_)) => out.extend(std::iter::repeat_n(0u8, declared.fixed_size())),
        }
    }
}

/// Tightens declared argument types against the format string, once
/// per call site: a string argument consumed by a `%p` specifier is
/// re-declared as a pointer so only its address is recorded.
#[must_use]
pub fn tighten_types(format: &str, declared: &[ArgType]) -> Vec<ArgType> {
    let mut out = declared.to_vec();
    let mut arg_index = 0usize;
    let mut in_specifier = false;
    for c in format.chars() {
        if !in_specifier {
            if c == '%' {
                in_specifier = true;
            }
            continue;
        }
        if c == '%' {
            in_specifier = false;
            continue;
        }
        if is_conversion(c) {
            if let Some(ty) = out.get_mut(arg_index) {
                if c == 'p' && *ty == ArgType::Str {
                    *ty = ArgType::Pointer;
                }
            }
            arg_index += 1;
            in_specifier = false;
        }
    }
    out
}

/// Final characters of printf conversion specifiers the toolkit
/// understands.
#[must_use]
pub fn is_conversion(c: char) -> bool {
    matches!(
        c,
        'c' | 'd' | 'u' | 'x' | 'X' | 'e' | 'E' | 'f' | 'g' | 'G' | 's' | 'p' | 'o' | 'i'
    )
}
