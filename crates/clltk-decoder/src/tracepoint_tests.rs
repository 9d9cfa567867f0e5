use std::sync::Arc;

use smallvec::SmallVec;
use tempfile::TempDir;

use clltk_core::layout::{MetaType, SourceType, TraceEntryHead, TRACE_ENTRY_HEAD_SIZE};
use clltk_core::mmap::MappedFile;

use super::tracepoint::{Tracepoint, TracepointKind};

/// Writes a metadata blob at offset 0 of a scratch file and maps it.
fn mapped_blob(arg_types: &[u8], file: &str, format: &str) -> (TempDir, Arc<MappedFile>, u32) {
    let mut blob = Vec::new();
    blob.push(b'{');
    blob.extend_from_slice(&0u32.to_le_bytes()); // patched below
    blob.push(MetaType::Printf as u8);
    blob.extend_from_slice(&7u32.to_le_bytes()); // line
    blob.push(arg_types.len() as u8);
    blob.extend_from_slice(arg_types);
    blob.push(0);
    blob.extend_from_slice(file.as_bytes());
    blob.push(0);
    blob.extend_from_slice(format.as_bytes());
    blob.push(0);
    let size = blob.len() as u32;
    blob[1..5].copy_from_slice(&size.to_le_bytes());

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("meta.clltk_trace");
    std::fs::write(&path, &blob).unwrap();
    (dir, Arc::new(MappedFile::open(&path).unwrap()), size)
}

fn head(timestamp_ns: u64) -> TraceEntryHead {
    TraceEntryHead {
        in_file_offset: 0x100,
        pid: 10,
        tid: 20,
        timestamp_ns,
    }
}

fn static_tp(
    mapping: Arc<MappedFile>,
    meta_size: u32,
    arg_types: &[u8],
    args: Vec<u8>,
) -> Tracepoint {
    Tracepoint::new_static(
        Arc::from("unit"),
        3,
        head(1_000),
        SourceType::Userspace,
        mapping,
        0,
        meta_size,
        MetaType::Printf,
        7,
        SmallVec::from_slice(arg_types),
        args,
    )
}

#[test]
fn static_message_materialises_lazily_from_the_mapping() {
    let (_dir, mapping, meta_size) = mapped_blob(b"i", "demo.rs", "value %u");
    let tp = static_tp(mapping, meta_size, b"i", 99u32.to_le_bytes().to_vec());
    assert_eq!(tp.kind(), TracepointKind::Static);
    assert_eq!(tp.file(), "demo.rs");
    assert_eq!(tp.line(), 7);
    assert_eq!(tp.msg(), "value 99");
    // Second access reuses the rendered message.
    assert_eq!(tp.msg(), "value 99");
    assert_eq!(tp.kind(), TracepointKind::Static);
}

#[test]
fn formatting_failure_flips_the_kind_to_error() {
    // Declared integer, but the format wants a float.
    let (_dir, mapping, meta_size) = mapped_blob(b"i", "demo.rs", "value %f");
    let tp = static_tp(mapping, meta_size, b"i", 99u32.to_le_bytes().to_vec());
    assert_eq!(tp.kind(), TracepointKind::Static, "before materialisation");
    assert!(tp.msg().contains("formatting failed"));
    assert_eq!(tp.kind(), TracepointKind::Error, "after materialisation");
}

fn dynamic_body(file: &str, line: u64, msg: &str) -> Vec<u8> {
    let mut body = head(42)
        .encode()
        .to_vec();
    body[0] = 0x01; // dynamic marker
    body[1..6].fill(0);
    body.extend_from_slice(file.as_bytes());
    body.push(0);
    body.extend_from_slice(&line.to_le_bytes());
    body.extend_from_slice(msg.as_bytes());
    body.push(0);
    body
}

#[test]
fn dynamic_body_parses() {
    let body = dynamic_body("main.c", 13, "started");
    let tp = Tracepoint::new_dynamic(Arc::from("dyn"), 5, SourceType::Userspace, &body);
    assert_eq!(tp.kind(), TracepointKind::Dynamic);
    assert_eq!(tp.file(), "main.c");
    assert_eq!(tp.line(), 13);
    assert_eq!(tp.msg(), "started");
    assert_eq!(tp.nr, 5);
    assert_eq!(tp.timestamp_ns, 42);
}

#[test]
fn truncated_dynamic_bodies_decode_to_empty_fields() {
    // Too short for even the entry head.
    let tp = Tracepoint::new_dynamic(Arc::from("dyn"), 0, SourceType::Userspace, &[0u8; 10]);
    assert_eq!(tp.kind(), TracepointKind::Dynamic);
    assert_eq!(tp.file(), "");
    assert_eq!(tp.msg(), "");
    assert_eq!(tp.line(), 0);

    // Head plus file, but the line and message are cut off.
    let mut body = dynamic_body("f.c", 1, "m");
    body.truncate(TRACE_ENTRY_HEAD_SIZE + 2);
    let tp = Tracepoint::new_dynamic(Arc::from("dyn"), 0, SourceType::Userspace, &body);
    assert_eq!(tp.line(), 0);
    assert_eq!(tp.msg(), "");
}

#[test]
fn error_tracepoints_carry_their_message() {
    let tp = Tracepoint::new_error(Arc::from("buf"), "something broke");
    assert_eq!(tp.kind(), TracepointKind::Error);
    assert_eq!(tp.msg(), "something broke");
    assert_eq!(tp.nr, 0);
    assert_eq!(tp.timestamp_ns, 0);
    assert_eq!(tp.file(), "");
}

#[test]
fn kernel_detection_covers_tty() {
    let mut tp = Tracepoint::new_virtual(Arc::from("k"), 1, "m".into());
    assert!(!tp.is_kernel());
    tp.source_type = SourceType::Kernel;
    assert!(tp.is_kernel());
    tp.source_type = SourceType::Tty;
    assert!(tp.is_kernel());
}
