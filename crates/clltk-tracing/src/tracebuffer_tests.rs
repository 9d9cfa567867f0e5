use std::fs;

use serial_test::serial;
use tempfile::TempDir;

use clltk_core::crc8::crc8;
use clltk_core::layout::{FileHeader, FILE_HEADER_SIZE};

use super::config::set_tracing_path;
use super::tracebuffer::{create_tracebuffer, Tracebuffer};
use super::tracepoint::dynamic_tracepoint;

struct TracingDir {
    _dir: TempDir,
}

/// Points the process-wide tracing path at a scratch directory for the
/// duration of one test.
fn tracing_dir() -> TracingDir {
    let dir = TempDir::new().unwrap();
    set_tracing_path(dir.path());
    TracingDir { _dir: dir }
}

#[test]
#[serial]
fn creation_produces_a_valid_file() {
    let env = tracing_dir();
    let buffer = Tracebuffer::open("created", 1024).unwrap();
    assert_eq!(buffer.name(), "created");
    assert!(buffer.path().exists());
    assert!(buffer
        .path()
        .file_name()
        .unwrap()
        .to_str()
        .unwrap()
        .ends_with(".clltk_trace"));

    // No temp file leftovers.
    let leftovers: Vec<_> = fs::read_dir(env._dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().contains('~'))
        .collect();
    assert!(leftovers.is_empty());

    // The header validates byte for byte.
    let raw = fs::read(buffer.path()).unwrap();
    let mut head = [0u8; FILE_HEADER_SIZE];
    head.copy_from_slice(&raw[..FILE_HEADER_SIZE]);
    let header = FileHeader::decode(&head).unwrap();
    assert!(header.definition_offset < header.ringbuffer_offset);
    assert!(header.ringbuffer_offset < header.stack_offset);
    assert_eq!(crc8(&raw[..FILE_HEADER_SIZE]), 0);
}

#[test]
#[serial]
fn reopening_shares_the_ring() {
    let _env = tracing_dir();
    let first = Tracebuffer::open("shared", 2048).unwrap();
    let second = Tracebuffer::open("shared", 4096).unwrap();
    assert_eq!(first.path(), second.path());

    first.push(b"from first handle");
    assert_eq!(second.entries(), 1);
}

#[test]
#[serial]
fn invalid_names_are_rejected() {
    let _env = tracing_dir();
    assert!(Tracebuffer::open("", 1024).is_err());
    assert!(Tracebuffer::open("0day", 1024).is_err());
    assert!(Tracebuffer::open("no spaces", 1024).is_err());
}

#[test]
#[serial]
fn dynamic_creation_touches_the_file_only() {
    let env = tracing_dir();
    create_tracebuffer("touched", 1024).unwrap();
    let path = env._dir.path().join("touched.clltk_trace");
    assert!(path.exists());

    let buffer = Tracebuffer::open("touched", 1024).unwrap();
    assert_eq!(buffer.entries(), 0);
}

#[test]
#[serial]
fn dynamic_tracepoint_records_one_entry() {
    let _env = tracing_dir();
    dynamic_tracepoint("dynbuf", "main.rs", 10, 0, 0, "a dynamic message");
    let buffer = Tracebuffer::open("dynbuf", 1024).unwrap();
    assert_eq!(buffer.entries(), 1);
    assert_eq!(buffer.dropped(), 0);
}

#[test]
#[serial]
fn clear_counts_pending_entries_as_dropped() {
    let _env = tracing_dir();
    let buffer = Tracebuffer::open("cleared", 1024).unwrap();
    buffer.push(b"one");
    buffer.push(b"two");
    buffer.clear();
    assert_eq!(buffer.entries(), 2);
    assert_eq!(buffer.dropped(), 2);
}
