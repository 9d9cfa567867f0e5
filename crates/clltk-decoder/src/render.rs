//! Textual and JSON rendering of decoded tracepoints.
//!
//! The default text form is one space-separated line per record:
//!
//! ```text
//!  <timestamp> | <YYYY-MM-DD HH:MM:SS.nnnnnnnnn> | <buffer> | <pid> | <tid> | <msg> | <file> | <line>
//! ```
//!
//! where the timestamp is `sec.nanos` right-aligned to at least 20
//! characters and kernel buffers carry a `*` prefix. JSON output is one
//! self-describing object per line with a stable key set.

use chrono::DateTime;
use serde_json::json;

use crate::tracepoint::Tracepoint;

/// Renders `sec.nanos`, right-aligned to at least 20 characters.
#[must_use]
pub fn timestamp_str(timestamp_ns: u64) -> String {
    let seconds = timestamp_ns / 1_000_000_000;
    let nanos = timestamp_ns % 1_000_000_000;
    format!("{:>20}", format!("{seconds}.{nanos:09}"))
}

/// Renders `YYYY-MM-DD HH:MM:SS.nnnnnnnnn` in UTC.
#[must_use]
pub fn datetime_str(timestamp_ns: u64) -> String {
    #[allow(clippy::cast_possible_wrap)] // fits until year 2262
    let seconds = (timestamp_ns / 1_000_000_000) as i64;
    #[allow(clippy::cast_possible_truncation)] // < 1e9
    let nanos = (timestamp_ns % 1_000_000_000) as u32;
    DateTime::from_timestamp(seconds, nanos).map_or_else(
        || "1970-01-01 00:00:00.000000000".to_owned(),
        |dt| dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string(),
    )
}

/// Renders the column header matching [`text_line`].
#[must_use]
pub fn text_header(name_width: usize) -> String {
    format!(
        " {:<20} | {:<29} | {:<name_width$} | {:<5} | {:<5} | {} | {} | {}",
        "!timestamp", "time", "tracebuffer", "pid", "tid", "formatted", "file", "line"
    )
}

/// Renders one tracepoint as the default text line. `name_width` pads
/// the buffer-name column; kernel buffers are prefixed with `*`.
#[must_use]
pub fn text_line(tp: &Tracepoint, name_width: usize) -> String {
    let name = if tp.is_kernel() {
        format!("*{}", tp.tracebuffer())
    } else {
        tp.tracebuffer().to_owned()
    };
    format!(
        " {} | {} | {:<name_width$} | {:>5} | {:>5} | {} | {} | {}",
        timestamp_str(tp.timestamp_ns),
        datetime_str(tp.timestamp_ns),
        name,
        tp.pid(),
        tp.tid(),
        tp.msg(),
        tp.file(),
        tp.line()
    )
}

/// Renders one tracepoint as a JSON object with the stable key set.
#[must_use]
pub fn json_object(tp: &Tracepoint) -> serde_json::Value {
    json!({
        "timestamp_ns": tp.timestamp_ns,
        "timestamp": timestamp_str(tp.timestamp_ns).trim_start(),
        "datetime": datetime_str(tp.timestamp_ns),
        "tracebuffer": tp.tracebuffer(),
        "pid": tp.pid(),
        "tid": tp.tid(),
        "message": tp.msg(),
        "file": tp.file(),
        "line": tp.line(),
        "is_kernel": tp.is_kernel(),
        "source_type": tp.source_type as u8,
        "tracepoint_nr": tp.nr,
    })
}
