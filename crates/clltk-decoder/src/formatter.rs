//! Rendering packed argument bytes against a printf format string.
//!
//! The tracepoint's metadata declares one type code per argument; the
//! packed bytes follow those declarations. Rendering walks the format
//! string with a table-driven specifier parser (flags, width,
//! precision, length modifier, conversion) and dispatches on the
//! declared type instead of calling into libc.
//!
//! Declared types and format specifiers can disagree; the rules are
//! deterministic:
//!
//! - `%p` consuming a declared string renders its recorded address;
//! - `%s` consuming a declared pointer substitutes `<invalid arg>`
//!   instead of dereferencing anything;
//! - every other string/non-string disagreement, and any scalar
//!   category mismatch (integer where a float is needed or vice
//!   versa), fails formatting.
//!
//! Rendered output has every control byte replaced with a space and
//! trailing control bytes removed.

use crate::error::{DecodeError, Result};

/// Substitute for a string argument that is really a stale pointer.
const INVALID_ARG: &str = "<invalid arg>";

/// Token separating message and hex bytes in dump rendering.
const DUMP_TOKEN: &str = " =(dump)= ";

/// One unpacked argument, widened to the largest of its category.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Str(String),
    Pointer(u64),
    InvalidStr,
}

/// Final characters of the conversion specifiers the toolkit accepts.
fn is_conversion(c: char) -> bool {
    matches!(
        c,
        'c' | 'd' | 'u' | 'x' | 'X' | 'e' | 'E' | 'f' | 'g' | 'G' | 's' | 'p' | 'o' | 'i'
    )
}

/// Reconciles the declared argument types with the format string's
/// conversions, returning the types to unpack with.
fn reconcile_types(format: &str, declared: &[u8]) -> Result<Vec<u8>> {
    let mut out = declared.to_vec();
    let mut arg = 0usize;
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
        if !is_conversion(c) {
            continue;
        }
        in_specifier = false;
        let Some(ty) = out.get_mut(arg) else {
            return Err(DecodeError::FormattingFailed(
                "more format specifiers than declared arguments".into(),
            ));
        };
        if c == 'p' && *ty == b's' {
            // The writer records the address for these; render it.
            *ty = b'p';
        } else if c == 's' && *ty == b'p' {
            // A pointer where a string is expected must never be
            // dereferenced.
            *ty = b'Z';
        } else if (c == 's') != (*ty == b's') {
            return Err(DecodeError::FormattingFailed(format!(
                "format specifier %{c} does not match declared type '{}'",
                *ty as char
            )));
        }
        arg += 1;
    }
    if arg != declared.len() {
        return Err(DecodeError::FormattingFailed(format!(
            "format names {arg} arguments but {} were declared",
            declared.len()
        )));
    }
    Ok(out)
}

/// Bounds-checked argument byte access.
fn take(raw: &[u8], offset: usize, n: usize) -> Result<&[u8]> {
    raw.get(offset..offset + n)
        .ok_or_else(|| DecodeError::FormattingFailed("argument bytes exhausted".into()))
}

/// Unpacks the raw argument bytes according to the reconciled types.
fn unpack_args(types: &[u8], raw: &[u8]) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(types.len());
    let mut offset = 0usize;
    for &ty in types {
        let remaining = raw.len() - offset;
        match ty {
            b'c' => {
                values.push(Value::Unsigned(u64::from(take(raw, offset, 1)?[0])));
                offset += 1;
            }
            b'C' => {
                #[allow(clippy::cast_possible_wrap)] // i8 reinterpretation
                let v = take(raw, offset, 1)?[0] as i8;
                values.push(Value::Signed(i64::from(v)));
                offset += 1;
            }
            b'w' => {
                values.push(Value::Unsigned(u64::from(u16::from_le_bytes(
                    take(raw, offset, 2)?.try_into().unwrap(),
                ))));
                offset += 2;
            }
            b'W' => {
                values.push(Value::Signed(i64::from(i16::from_le_bytes(
                    take(raw, offset, 2)?.try_into().unwrap(),
                ))));
                offset += 2;
            }
            b'i' => {
                values.push(Value::Unsigned(u64::from(u32::from_le_bytes(
                    take(raw, offset, 4)?.try_into().unwrap(),
                ))));
                offset += 4;
            }
            b'I' => {
                values.push(Value::Signed(i64::from(i32::from_le_bytes(
                    take(raw, offset, 4)?.try_into().unwrap(),
                ))));
                offset += 4;
            }
            b'l' => {
                values.push(Value::Unsigned(u64::from_le_bytes(
                    take(raw, offset, 8)?.try_into().unwrap(),
                )));
                offset += 8;
            }
            b'L' => {
                values.push(Value::Signed(i64::from_le_bytes(
                    take(raw, offset, 8)?.try_into().unwrap(),
                )));
                offset += 8;
            }
            b'f' => {
                values.push(Value::Float(f64::from(f32::from_le_bytes(
                    take(raw, offset, 4)?.try_into().unwrap(),
                ))));
                offset += 4;
            }
            b'd' => {
                values.push(Value::Float(f64::from_le_bytes(
                    take(raw, offset, 8)?.try_into().unwrap(),
                )));
                offset += 8;
            }
            b'p' => {
                values.push(Value::Pointer(u64::from_le_bytes(
                    take(raw, offset, 8)?.try_into().unwrap(),
                )));
                offset += 8;
            }
            b'Z' => {
                // The recorded pointer is consumed but never used.
                let _ = take(raw, offset, 8)?;
                values.push(Value::InvalidStr);
                offset += 8;
            }
            b's' => {
                if remaining < 4 {
                    return Err(DecodeError::FormattingFailed(
                        "no space for string argument size".into(),
                    ));
                }
                let size = u32::from_le_bytes(take(raw, offset, 4)?.try_into().unwrap()) as usize;
                if size == 0 || 4 + size > remaining {
                    return Err(DecodeError::FormattingFailed(
                        "string argument bigger than raw arguments".into(),
                    ));
                }
                let bytes = &raw[offset + 4..offset + 4 + size];
                if bytes[size - 1] != 0 {
                    return Err(DecodeError::FormattingFailed(
                        "missing string argument termination".into(),
                    ));
                }
                values.push(Value::Str(
                    String::from_utf8_lossy(&bytes[..size - 1]).into_owned(),
                ));
                offset += 4 + size;
            }
            other => {
                return Err(DecodeError::FormattingFailed(format!(
                    "unknown argument type '{}'",
                    other as char
                )));
            }
        }
    }
    if offset != raw.len() {
        return Err(DecodeError::FormattingFailed(
            "leftover argument bytes after unpacking".into(),
        ));
    }
    Ok(values)
}

/// One parsed `%` specifier.
#[derive(Debug, Default, Clone, Copy)]
struct Spec {
    minus: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alt: bool,
    width: Option<usize>,
    precision: Option<usize>,
}

/// A conversion result before width padding.
struct Piece {
    prefix: String,
    body: String,
    /// Zero padding (between prefix and body) is permitted.
    zero_pad: bool,
}

impl Piece {
    fn text(body: String) -> Self {
        Self {
            prefix: String::new(),
            body,
            zero_pad: false,
        }
    }
}

fn apply_width(piece: Piece, spec: &Spec) -> String {
    let total = piece.prefix.len() + piece.body.len();
    match spec.width {
        Some(width) if width > total => {
            let fill = width - total;
            if spec.minus {
                format!("{}{}{}", piece.prefix, piece.body, " ".repeat(fill))
            } else if spec.zero && piece.zero_pad {
                format!("{}{}{}", piece.prefix, "0".repeat(fill), piece.body)
            } else {
                format!("{}{}{}", " ".repeat(fill), piece.prefix, piece.body)
            }
        }
        _ => format!("{}{}", piece.prefix, piece.body),
    }
}

fn sign_prefix(negative: bool, spec: &Spec) -> String {
    if negative {
        "-".into()
    } else if spec.plus {
        "+".into()
    } else if spec.space {
        " ".into()
    } else {
        String::new()
    }
}

fn format_unsigned(value: u64, base: u32, upper: bool, spec: &Spec) -> Piece {
    let mut digits = match base {
        16 if upper => format!("{value:X}"),
        16 => format!("{value:x}"),
        8 => format!("{value:o}"),
        _ => value.to_string(),
    };
    let mut prefix = String::new();
    if let Some(precision) = spec.precision {
        if precision == 0 && value == 0 {
            digits.clear();
        } else if digits.len() < precision {
            digits = format!("{}{digits}", "0".repeat(precision - digits.len()));
        }
    }
    if spec.alt && base == 16 && value != 0 {
        prefix.push_str(if upper { "0X" } else { "0x" });
    }
    if spec.alt && base == 8 && !digits.starts_with('0') {
        digits.insert(0, '0');
    }
    Piece {
        prefix,
        body: digits,
        // The 0 flag is ignored for integers carrying a precision.
        zero_pad: spec.precision.is_none(),
    }
}

fn format_signed(value: i64, spec: &Spec) -> Piece {
    let mut digits = value.unsigned_abs().to_string();
    if let Some(precision) = spec.precision {
        if precision == 0 && value == 0 {
            digits.clear();
        } else if digits.len() < precision {
            digits = format!("{}{digits}", "0".repeat(precision - digits.len()));
        }
    }
    Piece {
        prefix: sign_prefix(value < 0, spec),
        body: digits,
        zero_pad: spec.precision.is_none(),
    }
}

fn nonfinite(value: f64, upper: bool) -> String {
    let body = if value.is_nan() {
        "nan"
    } else if value > 0.0 {
        "inf"
    } else {
        "-inf"
    };
    if upper {
        body.to_uppercase()
    } else {
        body.into()
    }
}

fn format_fixed(value: f64, spec: &Spec) -> Piece {
    if !value.is_finite() {
        return Piece::text(nonfinite(value, false));
    }
    let precision = spec.precision.unwrap_or(6);
    let mut body = format!("{:.*}", precision, value.abs());
    if spec.alt && precision == 0 {
        body.push('.');
    }
    Piece {
        prefix: sign_prefix(value.is_sign_negative(), spec),
        body,
        zero_pad: true,
    }
}

/// Splits Rust's `{:e}` rendering into mantissa and exponent.
fn mantissa_exponent(value: f64, precision: usize) -> (String, i32) {
    let formatted = format!("{:.*e}", precision, value.abs());
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            (mantissa.to_owned(), exponent.parse::<i32>().unwrap_or(0))
        }
        None => (formatted, 0),
    }
}

fn format_exponential(value: f64, upper: bool, spec: &Spec) -> Piece {
    if !value.is_finite() {
        return Piece::text(nonfinite(value, upper));
    }
    let precision = spec.precision.unwrap_or(6);
    let (mantissa, exponent) = mantissa_exponent(value, precision);
    let e = if upper { 'E' } else { 'e' };
    let sign = if exponent < 0 { '-' } else { '+' };
    let body = format!("{mantissa}{e}{sign}{:02}", exponent.unsigned_abs());
    Piece {
        prefix: sign_prefix(value.is_sign_negative(), spec),
        body,
        zero_pad: true,
    }
}

/// Strips trailing fractional zeros (and a bare dot) for `%g`.
fn trim_g(mut s: String) -> String {
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    s
}

fn format_general(value: f64, upper: bool, spec: &Spec) -> Piece {
    if !value.is_finite() {
        return Piece::text(nonfinite(value, upper));
    }
    let precision = spec.precision.unwrap_or(6).max(1);
    let (_, exponent) = mantissa_exponent(value, precision - 1);
    #[allow(clippy::cast_possible_wrap)] // precision is tiny
    if value == 0.0 || (exponent >= -4 && exponent < precision as i32) {
        #[allow(clippy::cast_sign_loss)] // clamped non-negative
        let fixed_precision = ((precision as i32) - 1 - exponent).max(0) as usize;
        let fixed_spec = Spec {
            precision: Some(fixed_precision),
            ..*spec
        };
        let mut piece = format_fixed(value, &fixed_spec);
        if !spec.alt {
            piece.body = trim_g(piece.body);
        }
        piece
    } else {
        let exp_spec = Spec {
            precision: Some(precision - 1),
            ..*spec
        };
        let mut piece = format_exponential(value, upper, &exp_spec);
        if !spec.alt {
            if let Some((mantissa, exponent_part)) = piece.body.split_once(['e', 'E']) {
                let e = if upper { 'E' } else { 'e' };
                piece.body = format!("{}{e}{exponent_part}", trim_g(mantissa.to_owned()));
            }
        }
        piece
    }
}

fn render_one(conversion: char, spec: &Spec, value: &Value) -> Result<Piece> {
    let mismatch = |expected: &str| {
        DecodeError::FormattingFailed(format!(
            "%{conversion} needs {expected} argument, got {value:?}"
        ))
    };
    match conversion {
        'd' | 'i' => match value {
            Value::Signed(v) => Ok(format_signed(*v, spec)),
            #[allow(clippy::cast_possible_wrap)] // two's complement reinterpretation
            Value::Unsigned(v) | Value::Pointer(v) => Ok(format_signed(*v as i64, spec)),
            _ => Err(mismatch("an integer")),
        },
        'u' => match value {
            Value::Unsigned(v) | Value::Pointer(v) => Ok(format_unsigned(*v, 10, false, spec)),
            #[allow(clippy::cast_sign_loss)] // two's complement reinterpretation
            Value::Signed(v) => Ok(format_unsigned(*v as u64, 10, false, spec)),
            _ => Err(mismatch("an integer")),
        },
        'x' | 'X' | 'o' => {
            let (base, upper) = match conversion {
                'x' => (16, false),
                'X' => (16, true),
                _ => (8, false),
            };
            match value {
                Value::Unsigned(v) | Value::Pointer(v) => {
                    Ok(format_unsigned(*v, base, upper, spec))
                }
                #[allow(clippy::cast_sign_loss)] // two's complement reinterpretation
                Value::Signed(v) => Ok(format_unsigned(*v as u64, base, upper, spec)),
                _ => Err(mismatch("an integer")),
            }
        }
        'c' => match value {
            Value::Unsigned(v) => Ok(Piece::text(char::from(*v as u8).to_string())),
            #[allow(clippy::cast_sign_loss)] // %c takes the low byte
            Value::Signed(v) => Ok(Piece::text(char::from(*v as u8).to_string())),
            _ => Err(mismatch("a character")),
        },
        'e' | 'E' => match value {
            Value::Float(v) => Ok(format_exponential(*v, conversion == 'E', spec)),
            _ => Err(mismatch("a float")),
        },
        'f' => match value {
            Value::Float(v) => Ok(format_fixed(*v, spec)),
            _ => Err(mismatch("a float")),
        },
        'g' | 'G' => match value {
            Value::Float(v) => Ok(format_general(*v, conversion == 'G', spec)),
            _ => Err(mismatch("a float")),
        },
        's' => match value {
            Value::Str(s) => {
                let truncated = match spec.precision {
                    Some(max) => s.chars().take(max).collect(),
                    None => s.clone(),
                };
                Ok(Piece::text(truncated))
            }
            Value::InvalidStr => Ok(Piece::text(INVALID_ARG.to_owned())),
            _ => Err(mismatch("a string")),
        },
        'p' => match value {
            Value::Pointer(v) | Value::Unsigned(v) => Ok(Piece::text(format!("0x{v:x}"))),
            #[allow(clippy::cast_sign_loss)] // addresses are bit patterns
            Value::Signed(v) => Ok(Piece::text(format!("0x{:x}", *v as u64))),
            _ => Err(mismatch("a pointer")),
        },
        other => Err(DecodeError::FormattingFailed(format!(
            "unsupported conversion %{other}"
        ))),
    }
}

/// Parses and renders the whole format string against the unpacked
/// values.
fn render(format: &str, values: &[Value]) -> Result<String> {
    let mut out = String::with_capacity(format.len() + values.len() * 8);
    let mut chars = format.chars().peekable();
    let mut arg = 0usize;

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }

        let mut spec = Spec::default();
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => spec.minus = true,
                '+' => spec.plus = true,
                ' ' => spec.space = true,
                '0' => spec.zero = true,
                '#' => spec.alt = true,
                _ => break,
            }
            chars.next();
        }
        while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
            spec.width = Some(spec.width.unwrap_or(0) * 10 + d as usize);
            chars.next();
        }
        if chars.peek() == Some(&'.') {
            chars.next();
            spec.precision = Some(0);
            while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
                spec.precision = Some(spec.precision.unwrap_or(0) * 10 + d as usize);
                chars.next();
            }
        }
        while matches!(chars.peek(), Some('h' | 'l' | 'z' | 'j' | 't' | 'L')) {
            // Length modifiers carry no information here; the declared
            // type already fixes the width.
            chars.next();
        }

        let Some(conversion) = chars.next() else {
            return Err(DecodeError::FormattingFailed(
                "truncated format specifier".into(),
            ));
        };
        if !is_conversion(conversion) {
            return Err(DecodeError::FormattingFailed(format!(
                "unsupported conversion %{conversion}"
            )));
        }
        let Some(value) = values.get(arg) else {
            return Err(DecodeError::FormattingFailed(
                "more format specifiers than arguments".into(),
            ));
        };
        arg += 1;
        let piece = render_one(conversion, &spec, value)?;
        out.push_str(&apply_width(piece, &spec));
    }
    Ok(out)
}

/// Replaces control bytes with spaces and drops trailing ones.
fn clean(mut s: String) -> String {
    while s.chars().next_back().is_some_and(|c| (c as u32) < 0x20) {
        s.pop();
    }
    if s.chars().any(|c| (c as u32) < 0x20) {
        s = s
            .chars()
            .map(|c| if (c as u32) < 0x20 { ' ' } else { c })
            .collect();
    }
    s
}

/// Renders a printf-style tracepoint message.
///
/// `declared_types` are the metadata blob's argument type codes;
/// `args_raw` the packed bytes recorded with the event.
pub fn printf(format: &str, declared_types: &[u8], args_raw: &[u8]) -> Result<String> {
    if format.is_empty() {
        return Ok(String::new());
    }
    let types = reconcile_types(format, declared_types)?;
    if args_raw.is_empty() && !types.is_empty() {
        return Err(DecodeError::FormattingFailed(
            "arguments declared but none recorded".into(),
        ));
    }
    let values = unpack_args(&types, args_raw)?;
    let rendered = render(format, &values)?;
    Ok(clean(rendered))
}

/// Renders a dump tracepoint: the message followed by the recorded
/// bytes as uppercase hex.
pub fn dump(message: &str, declared_types: &[u8], args_raw: &[u8]) -> Result<String> {
    if declared_types != [b'x'] {
        return Err(DecodeError::InvalidMeta(
            "wrong metadata for dump tracepoint".into(),
        ));
    }
    if args_raw.len() < 4 {
        return Err(DecodeError::FormattingFailed(
            "dump size field missing".into(),
        ));
    }
    let size = u32::from_le_bytes(args_raw[..4].try_into().unwrap()) as usize;
    let Some(bytes) = args_raw.get(4..4 + size) else {
        return Err(DecodeError::FormattingFailed(
            "dump bigger than recorded bytes".into(),
        ));
    };

    let mut out = String::with_capacity(message.len() + DUMP_TOKEN.len() + size * 3 + 2);
    out.push_str(message);
    out.push_str(DUMP_TOKEN);
    out.push('"');
    for (index, byte) in bytes.iter().enumerate() {
        if index > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out.push('"');
    Ok(clean(out))
}
