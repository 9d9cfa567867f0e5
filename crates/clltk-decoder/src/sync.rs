//! Synchronous single-file reader.
//!
//! `SyncTracebuffer` walks one ring buffer forward, turning each framed
//! entry into a [`Tracepoint`]. Decoding problems never abort the
//! stream: they surface as `Error` tracepoints so the consumer sees
//! them in order, and the cursor keeps advancing.

use std::path::Path;
use std::sync::Arc;

use smallvec::SmallVec;

use clltk_core::layout::{
    MetaType, SourceType, TraceEntryHead, IN_FILE_OFFSET_DYNAMIC, IN_FILE_OFFSET_INVALID,
    META_ARG_COUNT_OFFSET, META_ARG_TYPES_OFFSET, META_LINE_OFFSET, META_MAGIC, META_MAX_ARGS,
    META_SIZE_OFFSET, META_TYPE_OFFSET, TRACE_ENTRY_HEAD_SIZE,
};
use clltk_core::ringbuffer::{RingReadError, RingReader};

use crate::error::{DecodeError, Result};
use crate::tracebuffer_file::TracebufferFile;
use crate::tracepoint::Tracepoint;

/// Per-tracepoint acceptance predicate.
pub type TracepointFilter<'f> = &'f dyn Fn(&Tracepoint) -> bool;

/// A live read cursor over one tracebuffer file.
pub struct SyncTracebuffer {
    file: TracebufferFile,
    reader: RingReader,
    name: Arc<str>,
}

impl SyncTracebuffer {
    /// Opens and validates `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = TracebufferFile::open(path)?;
        let reader = file.reader()?;
        let name: Arc<str> = Arc::from(file.definition().name());
        Ok(Self { file, reader, name })
    }

    /// The tracebuffer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where this buffer's events come from.
    #[must_use]
    pub fn source_type(&self) -> SourceType {
        self.file.source_type()
    }

    /// Usable ring capacity in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.reader.size()
    }

    /// Bytes produced by the writer that this reader has not consumed.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.reader.pending_bytes().unwrap_or(0)
    }

    /// The writer's current insert counter; snapshot loops drain until
    /// the decoded `nr` passes this value.
    #[must_use]
    pub fn current_top_entries_nr(&self) -> u64 {
        self.reader.entries().unwrap_or(0)
    }

    /// Skips everything already recorded; only later events will be
    /// decoded.
    pub fn skip_to_end(&mut self) {
        let _ = self.reader.skip_to_end();
    }

    /// Decodes the next tracepoint passing `filter`, or `None` when the
    /// ring holds nothing new.
    pub fn next(&mut self, filter: Option<TracepointFilter<'_>>) -> Option<Tracepoint> {
        loop {
            let entry = match self.reader.next_entry() {
                Ok(Some(entry)) => entry,
                Ok(None) => return None,
                Err(RingReadError::HeadCrc) => {
                    return Some(Tracepoint::new_error(
                        Arc::clone(&self.name),
                        DecodeError::InvalidEntry("entry head crc invalid".into()).to_string(),
                    ));
                }
                Err(e @ RingReadError::SyncLost(_)) => {
                    return Some(Tracepoint::new_error(
                        Arc::clone(&self.name),
                        DecodeError::Synchronisation(e.to_string()).to_string(),
                    ));
                }
                Err(RingReadError::Io(e)) => {
                    return Some(Tracepoint::new_error(Arc::clone(&self.name), e.to_string()));
                }
            };

            let Some(head) = TraceEntryHead::decode(entry.body()) else {
                return Some(Tracepoint::new_error(
                    Arc::clone(&self.name),
                    format!("ring entry too short for a trace entry ({} bytes)", entry.len()),
                ));
            };

            let tp = if head.in_file_offset == IN_FILE_OFFSET_DYNAMIC {
                Tracepoint::new_dynamic(
                    Arc::clone(&self.name),
                    entry.nr,
                    self.source_type(),
                    entry.body(),
                )
            } else if head.in_file_offset < IN_FILE_OFFSET_INVALID {
                return Some(Tracepoint::new_error(
                    Arc::clone(&self.name),
                    DecodeError::InvalidEntry(
                        "file offset below the minimum valid metadata offset".into(),
                    )
                    .to_string(),
                ));
            } else {
                match self.decode_static(&entry, head) {
                    Ok(tp) => tp,
                    Err(e) => {
                        return Some(Tracepoint::new_error(Arc::clone(&self.name), e.to_string()))
                    }
                }
            };

            if filter.is_none_or(|f| f(&tp)) {
                return Some(tp);
            }
        }
    }

    /// Dereferences the metadata blob and builds a static tracepoint.
    /// Any failed check becomes the message of an `Error` tracepoint.
    fn decode_static(
        &self,
        entry: &clltk_core::ringbuffer::RingEntry,
        head: TraceEntryHead,
    ) -> Result<Tracepoint> {
        let mapping = Arc::clone(self.file.mapping());
        let offset = head.in_file_offset as usize;

        let magic = mapping.read_u8(offset).map_err(|_| {
            DecodeError::InvalidEntry("file offset bigger than file".into())
        })?;
        if magic != META_MAGIC {
            return Err(DecodeError::InvalidMeta(format!(
                "bad magic at offset {offset}: expected '{{', found {:?}",
                char::from(magic)
            )));
        }
        let meta_size = mapping.read_u32(offset + META_SIZE_OFFSET).map_err(|_| {
            DecodeError::InvalidEntry("file offset bigger than file".into())
        })?;
        if meta_size == 0 {
            return Err(DecodeError::InvalidMeta("zero blob size".into()));
        }
        if mapping.read_u8(offset + meta_size as usize - 1).is_err() {
            return Err(DecodeError::InvalidMeta(
                "blob extends beyond the file end".into(),
            ));
        }

        let raw_type = mapping.read_u8(offset + META_TYPE_OFFSET)?;
        let Some(meta_type) = MetaType::from_raw(raw_type) else {
            return Err(DecodeError::InvalidMeta(format!(
                "type {raw_type} (expected printf=1 or dump=2)"
            )));
        };
        let line = mapping.read_u32(offset + META_LINE_OFFSET)?;
        let arg_count =
            usize::from(mapping.read_u8(offset + META_ARG_COUNT_OFFSET)?).min(META_MAX_ARGS);
        let mut arg_types: SmallVec<[u8; 10]> = SmallVec::new();
        arg_types.resize(arg_count, 0);
        mapping.read_exact(offset + META_ARG_TYPES_OFFSET, &mut arg_types)?;

        let args = entry.body()[TRACE_ENTRY_HEAD_SIZE..].to_vec();

        Ok(Tracepoint::new_static(
            Arc::clone(&self.name),
            entry.nr,
            head,
            self.source_type(),
            mapping,
            offset,
            meta_size,
            meta_type,
            line,
            arg_types,
            args,
        ))
    }
}

impl std::fmt::Debug for SyncTracebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTracebuffer")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
