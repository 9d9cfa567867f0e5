//! Tracepoint assembly: the writer hot path.
//!
//! Three entry shapes share the 22-byte head (metadata reference, pid,
//! tid, timestamp):
//!
//! - **static** — head plus the packed argument bytes; the format
//!   string lives in the metadata blob.
//! - **dump** — head plus `u32 size` and the raw bytes.
//! - **dynamic** — head plus `file\0`, `u64 line` and the already
//!   rendered `message\0`; no metadata blob involved.
//!
//! Nothing on this path may fail into the traced program: every error
//! is logged and the event dropped. Entries up to a kilobyte are
//! assembled in a stack buffer; only larger ones pay for a heap
//! allocation.

use smallvec::SmallVec;
use tracing::error;

use clltk_core::layout::{
    MetaType, TraceEntryHead, IN_FILE_OFFSET_DYNAMIC, IN_FILE_OFFSET_INVALID,
    IN_FILE_OFFSET_MIN_STATIC, META_MAX_ARGS, TRACE_ENTRY_HEAD_SIZE,
    TRACE_ENTRY_TIMESTAMP_OFFSET,
};

use crate::args::ArgValue;
use crate::info;
use crate::meta::{SiteState, TracepointSite};
use crate::tracebuffer::{Tracebuffer, DEFAULT_RING_SIZE};

/// Entries must fit the ring frame's u16 size field.
const MAX_ENTRY_SIZE: usize = u16::MAX as usize;

/// Longest file name recorded for dynamic tracepoints.
const MAX_FILENAME_LEN: usize = 4096;

/// Stack-buffer capacity for entry assembly.
type EntryBuf = SmallVec<[u8; 1024]>;

fn site_state<'s>(
    buffer: &Tracebuffer,
    site: &'s TracepointSite,
    meta_type: MetaType,
) -> &'s SiteState {
    site.state.get_or_init(|| {
        let blob = site.build_blob(meta_type);
        let in_file_offset = buffer
            .publish_blob(&blob)
            .unwrap_or(IN_FILE_OFFSET_INVALID);
        SiteState {
            in_file_offset,
            packed_types: site.tightened_types(),
        }
    })
}

/// Truncates at a character boundary at or below `max` bytes.
fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Records one printf-style event.
///
/// The site's metadata is published on first use; afterwards each
/// event costs one head, the packed arguments and one ring insert.
/// Events with more than ten arguments, unpublishable metadata or an
/// oversized body are dropped with a diagnostic.
pub fn static_tracepoint(buffer: &Tracebuffer, site: &TracepointSite, args: &[ArgValue<'_>]) {
    // Timestamp at call entry, before any publication or locking.
    let timestamp_ns = info::timestamp_ns();

    if args.len() > META_MAX_ARGS {
        error!(
            buffer = buffer.name(),
            file = site.file,
            line = site.line,
            count = args.len(),
            "too many tracepoint arguments"
        );
        return;
    }
    let state = site_state(buffer, site, MetaType::Printf);
    if state.in_file_offset < IN_FILE_OFFSET_MIN_STATIC {
        error!(
            buffer = buffer.name(),
            file = site.file,
            line = site.line,
            "tracepoint metadata unavailable, event dropped"
        );
        return;
    }
    let head = TraceEntryHead {
        in_file_offset: state.in_file_offset,
        pid: info::process_id(),
        tid: info::thread_id(),
        timestamp_ns,
    };

    let mut body_size = 0usize;
    for (index, value) in args.iter().enumerate() {
        let declared = state
            .packed_types
            .get(index)
            .copied()
            .unwrap_or_else(|| value.arg_type());
        body_size += value.packed_size(declared);
    }

    let total = TRACE_ENTRY_HEAD_SIZE + body_size;
    if total >= MAX_ENTRY_SIZE {
        error!(
            buffer = buffer.name(),
            file = site.file,
            line = site.line,
            size = total,
            "tracepoint entry exceeds maximum size"
        );
        return;
    }

    let mut entry = EntryBuf::with_capacity(total);
    entry.extend_from_slice(&head.encode());
    for (index, value) in args.iter().enumerate() {
        let declared = state
            .packed_types
            .get(index)
            .copied()
            .unwrap_or_else(|| value.arg_type());
        value.pack_into(declared, &mut entry);
    }
    buffer.push(&entry);
}

/// Records one binary dump event: the site's message plus `data`.
pub fn dump_tracepoint(buffer: &Tracebuffer, site: &TracepointSite, data: &[u8]) {
    let timestamp_ns = info::timestamp_ns();

    let state = site_state(buffer, site, MetaType::Dump);
    if state.in_file_offset < IN_FILE_OFFSET_MIN_STATIC {
        error!(
            buffer = buffer.name(),
            file = site.file,
            line = site.line,
            "dump metadata unavailable, event dropped"
        );
        return;
    }
    let head = TraceEntryHead {
        in_file_offset: state.in_file_offset,
        pid: info::process_id(),
        tid: info::thread_id(),
        timestamp_ns,
    };

    let total = TRACE_ENTRY_HEAD_SIZE + 4 + data.len();
    if total >= MAX_ENTRY_SIZE {
        error!(
            buffer = buffer.name(),
            file = site.file,
            line = site.line,
            size = total,
            "dump entry exceeds maximum size"
        );
        return;
    }

    let mut entry = EntryBuf::with_capacity(total);
    entry.extend_from_slice(&head.encode());
    entry.extend_from_slice(&(data.len() as u32).to_le_bytes());
    entry.extend_from_slice(data);
    buffer.push(&entry);
}

/// Records one dynamic event into the tracebuffer `buffer_name`,
/// creating it with the default ring size if needed.
///
/// The message is already rendered; pass zero for `pid`/`tid` to use
/// the calling process and thread. Unlike static tracepoints, the
/// timestamp is taken inside the ring's critical section, so dynamic
/// events from different threads cannot appear timestamp-reordered.
pub fn dynamic_tracepoint(
    buffer_name: &str,
    file: &str,
    line: u64,
    pid: u32,
    tid: u32,
    message: &str,
) {
    // Timestamp stays zero until the ring mutex is held.
    let head = TraceEntryHead {
        in_file_offset: IN_FILE_OFFSET_DYNAMIC,
        pid: if pid != 0 { pid } else { info::process_id() },
        tid: if tid != 0 { tid } else { info::thread_id() },
        timestamp_ns: 0,
    };

    let file = truncate_str(file, MAX_FILENAME_LEN);
    let total = TRACE_ENTRY_HEAD_SIZE + file.len() + 1 + 8 + message.len() + 1;
    if total >= MAX_ENTRY_SIZE {
        error!(
            buffer = buffer_name,
            file,
            line,
            size = total,
            "dynamic entry exceeds maximum size"
        );
        return;
    }

    let buffer = match Tracebuffer::open(buffer_name, DEFAULT_RING_SIZE) {
        Ok(buffer) => buffer,
        Err(e) => {
            error!(buffer = buffer_name, error = %e, "could not open tracebuffer");
            return;
        }
    };

    let mut entry = EntryBuf::with_capacity(total);
    entry.extend_from_slice(&head.encode());
    entry.extend_from_slice(file.as_bytes());
    entry.push(0);
    entry.extend_from_slice(&line.to_le_bytes());
    entry.extend_from_slice(message.as_bytes());
    entry.push(0);
    buffer.push_finalized(&mut entry, |bytes| {
        bytes[TRACE_ENTRY_TIMESTAMP_OFFSET..TRACE_ENTRY_HEAD_SIZE]
            .copy_from_slice(&info::timestamp_ns().to_le_bytes());
    });
}
