//! Byte-level layout of a tracebuffer file.
//!
//! A tracebuffer file is a fixed header followed by three sections whose
//! offsets the header records:
//!
//! ```text
//! [file header: 56B]
//! [definition:  8B body_size | name\0 | extended record (V2)]
//! [ring buffer: 160B header | body[body_size]]
//! [unique stack: 120B header | entries...]
//! ```
//!
//! All integers are little-endian. Multi-byte header fields are naturally
//! aligned; section offsets are rounded up to 8. Each CRC-protected
//! structure stores a CRC-8 (polynomial 0x07) as its last byte, so the
//! checksum over the whole structure is zero when intact.

use crate::crc8::crc8;

/// Magic bytes at offset 0 of every tracebuffer file.
pub const FILE_MAGIC: [u8; 16] = *b"?#$~tracebuffer\0";

/// The magic as written by a big-endian producer (each 8-byte half
/// byte-swapped). Recognised only to produce a precise diagnostic; such
/// files are rejected, not converted.
pub const FILE_MAGIC_BIG_ENDIAN: [u8; 16] = *b"cart~$#?\0reffube";

/// Size of the fixed file header.
pub const FILE_HEADER_SIZE: usize = 56;

/// File extension of userspace tracebuffers.
pub const TRACE_EXTENSION: &str = "clltk_trace";
/// File extension of kernel tracebuffers.
pub const KTRACE_EXTENSION: &str = "clltk_ktrace";

/// Packed `major.minor.patch` format version written into new files.
pub const FORMAT_VERSION: u64 = (0 << 16) | (3 << 8) | 1;

/// Only the major version has to agree between writer and reader.
pub const FORMAT_VERSION_MASK: u64 = 0xFF_0000;

/// The fixed 56-byte file header.
///
/// Layout: magic (16), version (8), definition offset (8), ring-buffer
/// offset (8), unique-stack offset (8), 7 reserved bytes, CRC-8 over the
/// first 55 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Packed format version, see [`FORMAT_VERSION`].
    pub version: u64,
    /// Offset of the definition section.
    pub definition_offset: u64,
    /// Offset of the ring-buffer section.
    pub ringbuffer_offset: u64,
    /// Offset of the unique-stack section.
    pub stack_offset: u64,
}

impl FileHeader {
    /// Serialises the header, computing the trailing CRC.
    #[must_use]
    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut out = [0u8; FILE_HEADER_SIZE];
        out[..16].copy_from_slice(&FILE_MAGIC);
        out[16..24].copy_from_slice(&self.version.to_le_bytes());
        out[24..32].copy_from_slice(&self.definition_offset.to_le_bytes());
        out[32..40].copy_from_slice(&self.ringbuffer_offset.to_le_bytes());
        out[40..48].copy_from_slice(&self.stack_offset.to_le_bytes());
        out[55] = crc8(&out[..55]);
        out
    }

    /// Deserialises and validates a header.
    ///
    /// Checks the magic (diagnosing the byte-swapped big-endian variant
    /// separately), the stored CRC, and that the three section offsets
    /// are strictly increasing and start behind the header.
    pub fn decode(raw: &[u8; FILE_HEADER_SIZE]) -> Result<Self, HeaderError> {
        if raw[..16] == FILE_MAGIC_BIG_ENDIAN {
            return Err(HeaderError::ForeignEndianness);
        }
        if raw[..16] != FILE_MAGIC {
            return Err(HeaderError::BadMagic);
        }
        if crc8(raw) != 0 {
            return Err(HeaderError::BadCrc);
        }
        let header = Self {
            version: u64::from_le_bytes(raw[16..24].try_into().unwrap()),
            definition_offset: u64::from_le_bytes(raw[24..32].try_into().unwrap()),
            ringbuffer_offset: u64::from_le_bytes(raw[32..40].try_into().unwrap()),
            stack_offset: u64::from_le_bytes(raw[40..48].try_into().unwrap()),
        };
        let ordered = FILE_HEADER_SIZE as u64 <= header.definition_offset
            && header.definition_offset < header.ringbuffer_offset
            && header.ringbuffer_offset < header.stack_offset;
        if !ordered {
            return Err(HeaderError::BadSectionOffsets);
        }
        Ok(header)
    }
}

/// Why a file header failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// The first 16 bytes are not the tracebuffer magic.
    #[error("file magic mismatch")]
    BadMagic,
    /// The file was produced on a machine with the opposite endianness.
    #[error("tracebuffer written with foreign endianness")]
    ForeignEndianness,
    /// The stored header CRC does not match.
    #[error("file header crc mismatch")]
    BadCrc,
    /// Section offsets are not strictly increasing behind the header.
    #[error("section offsets not strictly increasing")]
    BadSectionOffsets,
}

// ---------------------------------------------------------------------------
// Definition section
// ---------------------------------------------------------------------------

/// Magic identifying the extended (V2) definition record.
pub const DEFINITION_EXTENDED_MAGIC: [u8; 8] = *b"CLLTK_EX";
/// Version byte of the extended definition record.
pub const DEFINITION_EXTENDED_VERSION: u8 = 2;
/// Size of the extended definition record.
pub const DEFINITION_EXTENDED_SIZE: usize = 16;

/// Where a tracebuffer's events were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SourceType {
    /// Legacy file or unspecified origin.
    #[default]
    Unknown = 0,
    /// Userspace process.
    Userspace = 1,
    /// Kernel module.
    Kernel = 2,
    /// Kernel trace whose buffer name is `"TTY"`.
    Tty = 3,
}

impl SourceType {
    /// Decodes the on-disk source-type byte; unknown values map to
    /// [`SourceType::Unknown`].
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Userspace,
            2 => Self::Kernel,
            3 => Self::Tty,
            _ => Self::Unknown,
        }
    }
}

/// Builds the body of a V2 definition section: `name\0` followed by the
/// extended record. The leading 8-byte `body_size` field is not
/// included.
#[must_use]
pub fn encode_definition_body(name: &str, source_type: SourceType) -> Vec<u8> {
    let mut body = Vec::with_capacity(name.len() + 1 + DEFINITION_EXTENDED_SIZE);
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    body.extend_from_slice(&DEFINITION_EXTENDED_MAGIC);
    body.push(DEFINITION_EXTENDED_VERSION);
    body.push(source_type as u8);
    body.extend_from_slice(&[0u8; 5]);
    body.push(crc8(&body));
    body
}

// ---------------------------------------------------------------------------
// Unique stack
// ---------------------------------------------------------------------------

/// Size of the unique-stack section header: version (8), mutex (64),
/// 40 reserved, `body_size` (8).
pub const STACK_HEADER_SIZE: usize = 120;
/// Offset of the in-file mutex inside the stack header.
pub const STACK_MUTEX_OFFSET: usize = 8;
/// Offset of the `body_size` field inside the stack header.
pub const STACK_BODY_SIZE_OFFSET: usize = 112;

/// Size of a unique-stack entry head: MD5 (16), 8 reserved,
/// `body_size` (4), CRC-8 (1).
pub const STACK_ENTRY_HEAD_SIZE: usize = 29;

// ---------------------------------------------------------------------------
// Ring buffer
// ---------------------------------------------------------------------------

/// Size of the ring-buffer section header: version (8), mutex (64),
/// `body_size` (8), `wrapped` (8), `dropped` (8), `entries` (8),
/// `next_free` (8), `last_valid` (8), 40 reserved.
pub const RING_HEADER_SIZE: usize = 160;
/// Offset of the in-file mutex inside the ring header.
pub const RING_MUTEX_OFFSET: usize = 8;
/// Offset of the atomically snapshotted part of the ring header
/// (`body_size` through `last_valid`, six `u64`s).
pub const RING_HEAD_PART_OFFSET: usize = 72;
/// Size of the snapshotted head part.
pub const RING_HEAD_PART_SIZE: usize = 48;

/// First byte of every framed ring-buffer entry.
pub const RING_ENTRY_MAGIC: u8 = b'~';
/// Size of a ring-buffer entry head: magic (1), `body_size` (2),
/// CRC-8 over the first three bytes (1).
pub const RING_ENTRY_HEAD_SIZE: u64 = 4;
/// Bytes a ring entry occupies beyond its body: head plus trailing
/// body CRC.
pub const RING_ENTRY_OVERHEAD: u64 = RING_ENTRY_HEAD_SIZE + 1;

/// Entries at least this many bytes behind the write head cannot be
/// overwritten while one read call is in flight, so CRC validation may
/// be skipped for them.
pub const SAFE_ZONE_THRESHOLD: u64 = 4096;

// ---------------------------------------------------------------------------
// Trace entries
// ---------------------------------------------------------------------------

/// Size of the fixed head every trace entry starts with: 48-bit
/// in-file offset, pid (4), tid (4), timestamp (8).
pub const TRACE_ENTRY_HEAD_SIZE: usize = 22;

/// Offset of the timestamp field inside the trace-entry head. Dynamic
/// entries are stamped in place once the ring mutex is held.
pub const TRACE_ENTRY_TIMESTAMP_OFFSET: usize = 14;

/// Mask for the 48-bit in-file offset field.
pub const IN_FILE_OFFSET_MASK: u64 = (1 << 48) - 1;
/// In-file offset of an entry whose metadata was never published.
pub const IN_FILE_OFFSET_UNSET: u64 = 0x00;
/// In-file offset marking a dynamic entry (no metadata blob).
pub const IN_FILE_OFFSET_DYNAMIC: u64 = 0x01;
/// In-file offset marking an entry whose metadata publication failed.
pub const IN_FILE_OFFSET_INVALID: u64 = 0xFF;
/// Smallest in-file offset that can point at a real metadata blob.
pub const IN_FILE_OFFSET_MIN_STATIC: u64 = 0x100;

/// The fixed head of every trace entry inside the ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceEntryHead {
    /// Unique-stack offset of the metadata blob, or one of the
    /// `IN_FILE_OFFSET_*` marker values. Only the low 48 bits are
    /// stored.
    pub in_file_offset: u64,
    /// Producing process.
    pub pid: u32,
    /// Producing thread.
    pub tid: u32,
    /// Realtime clock, nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
}

impl TraceEntryHead {
    /// Serialises the head into its 22-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; TRACE_ENTRY_HEAD_SIZE] {
        let mut out = [0u8; TRACE_ENTRY_HEAD_SIZE];
        let offset = (self.in_file_offset & IN_FILE_OFFSET_MASK).to_le_bytes();
        out[..6].copy_from_slice(&offset[..6]);
        out[6..10].copy_from_slice(&self.pid.to_le_bytes());
        out[10..14].copy_from_slice(&self.tid.to_le_bytes());
        out[TRACE_ENTRY_TIMESTAMP_OFFSET..].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        out
    }

    /// Reads a head back from the start of a ring-entry body. Returns
    /// `None` if the body is too short to hold one.
    #[must_use]
    pub fn decode(body: &[u8]) -> Option<Self> {
        if body.len() < TRACE_ENTRY_HEAD_SIZE {
            return None;
        }
        let mut offset = [0u8; 8];
        offset[..6].copy_from_slice(&body[..6]);
        Some(Self {
            in_file_offset: u64::from_le_bytes(offset),
            pid: u32::from_le_bytes(body[6..10].try_into().unwrap()),
            tid: u32::from_le_bytes(body[10..14].try_into().unwrap()),
            timestamp_ns: u64::from_le_bytes(
                body[TRACE_ENTRY_TIMESTAMP_OFFSET..TRACE_ENTRY_HEAD_SIZE]
                    .try_into()
                    .unwrap(),
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Metadata blobs
// ---------------------------------------------------------------------------

/// First byte of every metadata blob in the unique stack.
pub const META_MAGIC: u8 = b'{';
/// Offset of the blob size field.
pub const META_SIZE_OFFSET: usize = 1;
/// Offset of the blob type byte.
pub const META_TYPE_OFFSET: usize = 5;
/// Offset of the source-line field.
pub const META_LINE_OFFSET: usize = 6;
/// Offset of the argument-count byte.
pub const META_ARG_COUNT_OFFSET: usize = 10;
/// Offset of the argument-type array (NUL-terminated).
pub const META_ARG_TYPES_OFFSET: usize = 11;
/// Maximum number of arguments a tracepoint may carry.
pub const META_MAX_ARGS: usize = 10;

/// What kind of event a metadata blob describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetaType {
    /// A printf-style tracepoint with packed arguments.
    Printf = 1,
    /// A binary dump tracepoint.
    Dump = 2,
}

impl MetaType {
    /// Decodes the on-disk type byte.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Printf),
            2 => Some(Self::Dump),
            _ => None,
        }
    }
}

/// Type code of one packed tracepoint argument.
///
/// The codes appear verbatim in the metadata blob's argument-type
/// array; the decoder dispatches on them when unpacking argument bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArgType {
    /// `u8`
    U8 = b'c',
    /// `i8`
    I8 = b'C',
    /// `u16`
    U16 = b'w',
    /// `i16`
    I16 = b'W',
    /// `u32`
    U32 = b'i',
    /// `i32`
    I32 = b'I',
    /// `u64`
    U64 = b'l',
    /// `i64`
    I64 = b'L',
    /// `u128`
    U128 = b'q',
    /// `i128`
    I128 = b'Q',
    /// `f32`
    F32 = b'f',
    /// `f64`
    F64 = b'd',
    /// length-prefixed NUL-terminated string
    Str = b's',
    /// binary dump (u32 size + bytes)
    Dump = b'x',
    /// pointer, rendered as hex
    Pointer = b'p',
    /// unknown; decoded as opaque
    Unknown = b'?',
    /// a pointer that was traced where a string was declared; the
    /// decoder substitutes a placeholder instead of dereferencing
    InvalidStr = b'Z',
}

impl ArgType {
    /// Decodes a type-code byte.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            b'c' => Self::U8,
            b'C' => Self::I8,
            b'w' => Self::U16,
            b'W' => Self::I16,
            b'i' => Self::U32,
            b'I' => Self::I32,
            b'l' => Self::U64,
            b'L' => Self::I64,
            b'q' => Self::U128,
            b'Q' => Self::I128,
            b'f' => Self::F32,
            b'd' => Self::F64,
            b's' => Self::Str,
            b'x' => Self::Dump,
            b'p' => Self::Pointer,
            b'?' => Self::Unknown,
            b'Z' => Self::InvalidStr,
            _ => return None,
        })
    }

    /// The code byte stored in metadata blobs.
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Size of the fixed part of a packed argument of this type.
    /// Strings and dumps additionally carry their payload behind the
    /// 4-byte length.
    #[must_use]
    pub fn fixed_size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 | Self::Str | Self::Dump => 4,
            Self::U64 | Self::I64 | Self::F64 | Self::Pointer | Self::InvalidStr => 8,
            Self::U128 | Self::I128 => 16,
            Self::Unknown => 0,
        }
    }
}

/// Rounds `value` up to the next multiple of `alignment`.
#[inline]
#[must_use]
pub fn round_up(value: u64, alignment: u64) -> u64 {
    match value % alignment {
        0 => value,
        r => value + (alignment - r),
    }
}
