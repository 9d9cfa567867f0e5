use std::sync::Arc;

use super::render::{datetime_str, json_object, text_line, timestamp_str};
use super::tracepoint::Tracepoint;

#[test]
fn timestamp_is_right_aligned_to_twenty_chars() {
    let s = timestamp_str(1_000_000_123);
    assert_eq!(s.len(), 20);
    assert_eq!(s.trim_start(), "1.000000123");

    // Large timestamps keep all digits.
    let s = timestamp_str(1_700_000_000_123_456_789);
    assert_eq!(s, "1700000000.123456789");
}

#[test]
fn timestamp_zero() {
    assert_eq!(timestamp_str(0).trim_start(), "0.000000000");
}

#[test]
fn datetime_renders_utc_with_nanoseconds() {
    // 2021-01-01 00:00:00 UTC plus 5 ns.
    assert_eq!(
        datetime_str(1_609_459_200_000_000_005),
        "2021-01-01 00:00:00.000000005"
    );
    assert_eq!(datetime_str(0), "1970-01-01 00:00:00.000000000");
}

#[test]
fn text_line_contains_all_columns() {
    let tp = Tracepoint::new_virtual(Arc::from("mybuffer"), 1_000_000_123, "hello".to_owned());
    let line = text_line(&tp, 10);
    let columns: Vec<&str> = line.split(" | ").collect();
    assert_eq!(columns.len(), 8);
    assert_eq!(columns[2].trim(), "mybuffer");
    assert_eq!(columns[5], "hello");
}

#[test]
fn json_has_the_stable_key_set() {
    let tp = Tracepoint::new_virtual(Arc::from("b"), 42, "msg".to_owned());
    let value = json_object(&tp);
    let object = value.as_object().unwrap();
    for key in [
        "timestamp_ns",
        "timestamp",
        "datetime",
        "tracebuffer",
        "pid",
        "tid",
        "message",
        "file",
        "line",
        "is_kernel",
        "source_type",
        "tracepoint_nr",
    ] {
        assert!(object.contains_key(key), "missing key {key}");
    }
    assert_eq!(value["timestamp_ns"], 42);
    assert_eq!(value["message"], "msg");
    assert_eq!(value["tracebuffer"], "b");
    assert_eq!(value["is_kernel"], false);
}
