//! Opening and validating one tracebuffer file.

use std::path::Path;
use std::sync::Arc;

use clltk_core::layout::{
    FileHeader, SourceType, DEFINITION_EXTENDED_MAGIC, DEFINITION_EXTENDED_SIZE,
    FILE_HEADER_SIZE, FILE_MAGIC, KTRACE_EXTENSION, RING_HEAD_PART_OFFSET, TRACE_EXTENSION,
};
use clltk_core::mmap::MappedFile;
use clltk_core::ringbuffer::RingReader;

use crate::error::{DecodeError, Result};

/// Rings smaller than this cannot hold a single useful entry.
const MIN_RING_SIZE: u64 = 10;

/// The parsed definition section: tracebuffer name plus the optional
/// extended record.
#[derive(Debug, Clone)]
pub struct Definition {
    name: String,
    recorded_source_type: SourceType,
}

impl Definition {
    fn parse(file: &MappedFile, offset: usize) -> Result<Self> {
        let body_size = file.read_u64(offset)? as usize;
        let name = file.read_cstr(offset + 8, body_size)?;
        if name.is_empty() || name.len() >= body_size {
            return Err(DecodeError::InvalidTracebuffer(
                "definition name missing or unterminated".into(),
            ));
        }

        // V2 files follow the name with a CRC-protected extended
        // record; V1 files end after the name.
        let extended_offset = offset + 8 + name.len() + 1;
        let mut recorded_source_type = SourceType::Unknown;
        if body_size >= name.len() + 1 + DEFINITION_EXTENDED_SIZE {
            let record = file.read_vec(extended_offset, DEFINITION_EXTENDED_SIZE)?;
            if record[..8] == DEFINITION_EXTENDED_MAGIC {
                let body = file.read_vec(offset + 8, name.len() + 1 + DEFINITION_EXTENDED_SIZE)?;
                if clltk_core::crc8::crc8(&body) != 0 {
                    return Err(DecodeError::InvalidTracebuffer(
                        "extended definition crc mismatch".into(),
                    ));
                }
                recorded_source_type = SourceType::from_raw(record[9]);
            }
        }

        Ok(Self {
            name,
            recorded_source_type,
        })
    }

    /// The tracebuffer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source type as recorded in the file; `Unknown` for V1 files.
    #[must_use]
    pub fn recorded_source_type(&self) -> SourceType {
        self.recorded_source_type
    }
}

/// Source type with the V1 fallback applied: the file extension picks
/// kernel or userspace, and a kernel buffer named `TTY` is TTY output.
fn resolve_source_type(path: &Path, definition: &Definition) -> SourceType {
    let recorded = definition.recorded_source_type();
    if recorded != SourceType::Unknown {
        return recorded;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some(KTRACE_EXTENSION) => {
            if definition.name() == "TTY" {
                SourceType::Tty
            } else {
                SourceType::Kernel
            }
        }
        Some(TRACE_EXTENSION) => SourceType::Userspace,
        _ => SourceType::Unknown,
    }
}

/// A validated, mapped tracebuffer file.
pub struct TracebufferFile {
    file: Arc<MappedFile>,
    header: FileHeader,
    definition: Definition,
    source_type: SourceType,
}

impl TracebufferFile {
    /// Opens `path`, validating magic, header CRC, section offsets and
    /// the definition.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = Arc::new(MappedFile::open(path)?);

        let mut raw = [0u8; FILE_HEADER_SIZE];
        file.read_exact(0, &mut raw)?;
        let header = FileHeader::decode(&raw)
            .map_err(|e| DecodeError::InvalidTracebuffer(format!("{e} in {}", path.display())))?;

        let definition = Definition::parse(&file, header.definition_offset as usize)?;
        let source_type = resolve_source_type(path, &definition);

        let tb = Self {
            file,
            header,
            definition,
            source_type,
        };
        if tb.ring_size()? <= MIN_RING_SIZE {
            return Err(DecodeError::InvalidTracebuffer(
                "ring buffer too small".into(),
            ));
        }
        Ok(tb)
    }

    /// The shared mapping of this file.
    #[must_use]
    pub fn mapping(&self) -> &Arc<MappedFile> {
        &self.file
    }

    /// The validated file header.
    #[must_use]
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// The parsed definition section.
    #[must_use]
    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    /// Source type with the V1 extension fallback applied.
    #[must_use]
    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    /// Usable ring capacity in bytes.
    pub fn ring_size(&self) -> Result<u64> {
        let body_size = self
            .file
            .read_u64(self.header.ringbuffer_offset as usize + RING_HEAD_PART_OFFSET)?;
        Ok(body_size.saturating_sub(1))
    }

    /// Opens a fresh read cursor over the ring section.
    pub fn reader(&self) -> Result<RingReader> {
        Ok(RingReader::new(
            Arc::clone(&self.file),
            self.header.ringbuffer_offset as usize,
        )?)
    }
}

impl std::fmt::Debug for TracebufferFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracebufferFile")
            .field("path", &self.file.path())
            .field("name", &self.definition.name())
            .field("source_type", &self.source_type)
            .finish_non_exhaustive()
    }
}

/// Whether `path` looks like a tracebuffer: right extension, readable,
/// and carrying the little-endian magic. The byte-swapped magic of a
/// foreign-endian producer is recognised but reported as not readable.
#[must_use]
pub fn is_tracebuffer(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(e) if e == TRACE_EXTENSION || e == KTRACE_EXTENSION => {}
        _ => return false,
    }
    let Ok(mut file) = std::fs::File::open(path) else {
        return false;
    };
    use std::io::Read;
    let mut magic = [0u8; 16];
    if file.read_exact(&mut magic).is_err() {
        return false;
    }
    magic == FILE_MAGIC
}
