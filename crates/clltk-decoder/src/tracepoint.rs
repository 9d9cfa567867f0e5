//! The decoded tracepoint.
//!
//! Static tracepoints keep a strong reference to the mapped file so
//! their message can be materialised lazily: the metadata blob (format
//! string, source location, argument types) is read from the mapping
//! only when someone asks. A formatting failure does not abort the
//! stream; the tracepoint reports itself as an error from then on and
//! its message carries the diagnostic.

use std::sync::{Arc, OnceLock};

use smallvec::SmallVec;

use clltk_core::layout::{
    MetaType, SourceType, META_ARG_TYPES_OFFSET, TRACE_ENTRY_HEAD_SIZE,
};
use clltk_core::mmap::MappedFile;

use crate::formatter;

/// What kind of event a tracepoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracepointKind {
    /// Recorded through a compile-time call site with a metadata blob.
    Static,
    /// Recorded at runtime with a pre-rendered message.
    Dynamic,
    /// Synthesised by the toolkit (e.g. from a snapshot archive).
    Virtual,
    /// A decoding problem surfaced in-stream.
    Error,
}

/// Lazily rendered message of a static tracepoint.
#[derive(Debug)]
enum Rendered {
    Ok(String),
    Failed(String),
}

#[derive(Debug)]
struct StaticDetail {
    /// Keeps the mapping (and with it the metadata bytes) alive for as
    /// long as this tracepoint exists.
    mapping: Arc<MappedFile>,
    meta_offset: usize,
    meta_size: u32,
    meta_type: MetaType,
    line: u32,
    arg_types: SmallVec<[u8; 10]>,
    /// Packed argument bytes copied out of the ring entry.
    args: Vec<u8>,
    file: OnceLock<String>,
    format: OnceLock<String>,
    msg: OnceLock<Rendered>,
}

#[derive(Debug)]
enum Detail {
    Static(StaticDetail),
    Dynamic {
        file: String,
        line: u64,
        msg: String,
    },
    Virtual {
        msg: String,
    },
    Error {
        msg: String,
    },
}

/// One decoded event.
#[derive(Debug)]
pub struct Tracepoint {
    tracebuffer: Arc<str>,
    /// Position in the writer's insert order (0-based); strictly
    /// increasing per reader.
    pub nr: u64,
    /// Realtime clock, nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    /// Where the producing tracebuffer's events come from.
    pub source_type: SourceType,
    pid: u32,
    tid: u32,
    detail: Detail,
}

impl Tracepoint {
    #[allow(clippy::too_many_arguments)] // mirrors the metadata blob fields
    pub(crate) fn new_static(
        tracebuffer: Arc<str>,
        nr: u64,
        head: clltk_core::layout::TraceEntryHead,
        source_type: SourceType,
        mapping: Arc<MappedFile>,
        meta_offset: usize,
        meta_size: u32,
        meta_type: MetaType,
        line: u32,
        arg_types: SmallVec<[u8; 10]>,
        args: Vec<u8>,
    ) -> Self {
        Self {
            tracebuffer,
            nr,
            timestamp_ns: head.timestamp_ns,
            source_type,
            pid: head.pid,
            tid: head.tid,
            detail: Detail::Static(StaticDetail {
                mapping,
                meta_offset,
                meta_size,
                meta_type,
                line,
                arg_types,
                args,
                file: OnceLock::new(),
                format: OnceLock::new(),
                msg: OnceLock::new(),
            }),
        }
    }

    /// Parses a dynamic entry body: head, `file\0`, `u64` line,
    /// `message\0`. Truncated bodies decode to empty fields rather
    /// than failing.
    pub(crate) fn new_dynamic(
        tracebuffer: Arc<str>,
        nr: u64,
        source_type: SourceType,
        body: &[u8],
    ) -> Self {
        let head = clltk_core::layout::TraceEntryHead::decode(body).unwrap_or(
            clltk_core::layout::TraceEntryHead {
                in_file_offset: 0,
                pid: 0,
                tid: 0,
                timestamp_ns: 0,
            },
        );
        let rest = body.get(TRACE_ENTRY_HEAD_SIZE..).unwrap_or(&[]);

        let (file, rest) = take_cstr(rest);
        let (line, rest) = if rest.len() >= 8 {
            (
                u64::from_le_bytes(rest[..8].try_into().unwrap()),
                &rest[8..],
            )
        } else {
            (0, &[][..])
        };
        let (msg, _) = take_cstr(rest);

        Self {
            tracebuffer,
            nr,
            timestamp_ns: head.timestamp_ns,
            source_type,
            pid: head.pid,
            tid: head.tid,
            detail: Detail::Dynamic { file, line, msg },
        }
    }

    /// A synthetic tracepoint that was never inside a ring buffer.
    pub(crate) fn new_virtual(
        tracebuffer: Arc<str>,
        timestamp_ns: u64,
        msg: String,
    ) -> Self {
        Self {
            tracebuffer,
            nr: 0,
            timestamp_ns,
            source_type: SourceType::Unknown,
            pid: 0,
            tid: 0,
            detail: Detail::Virtual { msg },
        }
    }

    /// An in-stream decoding error.
    pub(crate) fn new_error(tracebuffer: Arc<str>, msg: impl Into<String>) -> Self {
        Self {
            tracebuffer,
            nr: 0,
            timestamp_ns: 0,
            source_type: SourceType::Unknown,
            pid: 0,
            tid: 0,
            detail: Detail::Error { msg: msg.into() },
        }
    }

    /// The kind of this tracepoint. A static tracepoint whose message
    /// failed to format reports itself as [`TracepointKind::Error`].
    #[must_use]
    pub fn kind(&self) -> TracepointKind {
        match &self.detail {
            Detail::Static(detail) => match detail.msg.get() {
                Some(Rendered::Failed(_)) => TracepointKind::Error,
                _ => TracepointKind::Static,
            },
            Detail::Dynamic { .. } => TracepointKind::Dynamic,
            Detail::Virtual { .. } => TracepointKind::Virtual,
            Detail::Error { .. } => TracepointKind::Error,
        }
    }

    /// Name of the tracebuffer this event came from.
    #[must_use]
    pub fn tracebuffer(&self) -> &str {
        &self.tracebuffer
    }

    /// Producing process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Producing thread id.
    #[must_use]
    pub fn tid(&self) -> u32 {
        self.tid
    }

    /// Whether the event originates in the kernel (incl. TTY capture).
    #[must_use]
    pub fn is_kernel(&self) -> bool {
        matches!(self.source_type, SourceType::Kernel | SourceType::Tty)
    }

    /// Source file of the recording call site.
    #[must_use]
    pub fn file(&self) -> &str {
        match &self.detail {
            Detail::Static(detail) => detail.file(),
            Detail::Dynamic { file, .. } => file,
            Detail::Virtual { .. } | Detail::Error { .. } => "",
        }
    }

    /// Source line of the recording call site.
    #[must_use]
    pub fn line(&self) -> u64 {
        match &self.detail {
            Detail::Static(detail) => u64::from(detail.line),
            Detail::Dynamic { line, .. } => *line,
            Detail::Virtual { .. } | Detail::Error { .. } => 0,
        }
    }

    /// The rendered message. Materialised on first access for static
    /// tracepoints.
    #[must_use]
    pub fn msg(&self) -> &str {
        match &self.detail {
            Detail::Static(detail) => detail.msg(),
            Detail::Dynamic { msg, .. } | Detail::Virtual { msg } | Detail::Error { msg } => msg,
        }
    }
}

impl StaticDetail {
    /// Reads a NUL-terminated string out of the metadata blob, bounded
    /// by the blob end.
    fn meta_cstr(&self, offset_in_blob: usize) -> String {
        if offset_in_blob >= self.meta_size as usize {
            return String::new();
        }
        self.mapping
            .read_cstr(
                self.meta_offset + offset_in_blob,
                self.meta_size as usize - offset_in_blob,
            )
            .unwrap_or_default()
    }

    fn file(&self) -> &str {
        self.file
            .get_or_init(|| self.meta_cstr(META_ARG_TYPES_OFFSET + self.arg_types.len() + 1))
    }

    fn format(&self) -> &str {
        self.format.get_or_init(|| {
            let file_len = self.file().len();
            self.meta_cstr(META_ARG_TYPES_OFFSET + self.arg_types.len() + 1 + file_len + 1)
        })
    }

    fn msg(&self) -> &str {
        let rendered = self.msg.get_or_init(|| {
            let result = match self.meta_type {
                MetaType::Printf => formatter::printf(self.format(), &self.arg_types, &self.args),
                MetaType::Dump => formatter::dump(self.format(), &self.arg_types, &self.args),
            };
            match result {
                Ok(msg) => Rendered::Ok(msg),
                Err(e) => Rendered::Failed(e.to_string()),
            }
        });
        match rendered {
            Rendered::Ok(msg) | Rendered::Failed(msg) => msg,
        }
    }
}

/// Splits a NUL-terminated string off the front of `bytes`. Without a
/// terminator the whole input is consumed.
fn take_cstr(bytes: &[u8]) -> (String, &[u8]) {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let s = String::from_utf8_lossy(&bytes[..end]).into_owned();
    let rest = bytes.get(end + 1..).unwrap_or(&[]);
    (s, rest)
}
