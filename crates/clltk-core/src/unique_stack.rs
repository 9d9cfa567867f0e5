//! Content-addressed append-only metadata store.
//!
//! The unique stack deduplicates tracepoint metadata blobs and dynamic
//! strings: every distinct blob is written once and addressed by the
//! file offset of its body forever after. Deduplication keys on the MD5
//! of `(u32 size || body)`.
//!
//! ```text
//! [stack header: 120B]                      (inside the mapped prefix)
//! [entry: md5 16 | 8 reserved | size u32 | crc8 | body]  (appended)
//! [entry: ...]
//! ```
//!
//! Entries live beyond the initially sized file region and are written
//! with positioned writes; the file grows as blobs are published. The
//! entry CRC covers only the 28 head bytes before it. Bodies are
//! written and synced before their head, so a torn append is seen as a
//! lookup miss, never as a corrupt hit.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use md5::{Digest, Md5};

use crate::crc8::crc8;
use crate::layout::{STACK_BODY_SIZE_OFFSET, STACK_ENTRY_HEAD_SIZE, STACK_HEADER_SIZE};
use crate::sync::SharedMutex;

/// Handle to the unique-stack section of one tracebuffer file.
///
/// The handle carries only the section offset; file and mutex are
/// provided per call so that several handles can share one open file.
#[derive(Debug, Clone, Copy)]
pub struct UniqueStack {
    section_offset: u64,
}

impl UniqueStack {
    /// Initialises an empty stack at `section_offset` and returns its
    /// handle. Writes the header (version 1, empty body); the in-file
    /// mutex is initialised separately by the file creator.
    pub fn init(file: &File, section_offset: u64) -> io::Result<Self> {
        let mut header = [0u8; STACK_HEADER_SIZE];
        header[..8].copy_from_slice(&1u64.to_le_bytes());
        file.write_all_at(&header, section_offset)?;
        Ok(Self { section_offset })
    }

    /// Opens a previously initialised stack.
    #[must_use]
    pub fn open(section_offset: u64) -> Self {
        Self { section_offset }
    }

    /// Offset of the first entry head.
    fn body_offset(self) -> u64 {
        self.section_offset + STACK_HEADER_SIZE as u64
    }

    /// The deduplication key: MD5 over the little-endian body size
    /// followed by the body bytes.
    #[must_use]
    pub fn hash(body: &[u8]) -> [u8; 16] {
        let mut md5 = Md5::new();
        md5.update((body.len() as u32).to_le_bytes());
        md5.update(body);
        md5.finalize().into()
    }

    /// Current total size of all entry heads and bodies.
    pub fn body_size(self, file: &File) -> io::Result<u64> {
        let mut raw = [0u8; 8];
        file.read_exact_at(&mut raw, self.section_offset + STACK_BODY_SIZE_OFFSET as u64)?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Publishes `body`, returning the stable file offset of its bytes.
    ///
    /// If an entry with the same hash already exists its offset is
    /// returned and nothing is written. The scan and the append run
    /// under `mutex` so concurrent publishers cannot race a duplicate
    /// in.
    pub fn add(self, file: &File, mutex: &SharedMutex, body: &[u8]) -> io::Result<u64> {
        if body.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty blobs cannot be published",
            ));
        }
        let hash = Self::hash(body);

        let _guard = mutex
            .lock()
            .map_err(|e| io::Error::other(format!("unique stack lock failed: {e}")))?;

        let body_size = self.body_size(file)?;
        if let Some(offset) = self.find_locked(file, body_size, &hash)? {
            return Ok(offset);
        }

        // Append: body first, then the head that makes it reachable,
        // then the header update that publishes it to scanners.
        let entry_offset = self.body_offset() + body_size;
        let blob_offset = entry_offset + STACK_ENTRY_HEAD_SIZE as u64;
        file.write_all_at(body, blob_offset)?;

        let mut head = [0u8; STACK_ENTRY_HEAD_SIZE];
        head[..16].copy_from_slice(&hash);
        head[24..28].copy_from_slice(&(body.len() as u32).to_le_bytes());
        head[28] = crc8(&head[..28]);
        file.write_all_at(&head, entry_offset)?;

        let new_body_size = body_size + STACK_ENTRY_HEAD_SIZE as u64 + body.len() as u64;
        file.write_all_at(
            &new_body_size.to_le_bytes(),
            self.section_offset + STACK_BODY_SIZE_OFFSET as u64,
        )?;

        Ok(blob_offset)
    }

    /// Scans all entries for `hash`; must run under the stack mutex.
    fn find_locked(
        self,
        file: &File,
        body_size: u64,
        hash: &[u8; 16],
    ) -> io::Result<Option<u64>> {
        let mut offset = 0u64;
        while offset < body_size {
            let mut head = [0u8; STACK_ENTRY_HEAD_SIZE];
            file.read_exact_at(&mut head, self.body_offset() + offset)?;
            let entry_body_size =
                u64::from(u32::from_le_bytes(head[24..28].try_into().unwrap()));
            if head[..16] == hash[..] {
                return Ok(Some(
                    self.body_offset() + offset + STACK_ENTRY_HEAD_SIZE as u64,
                ));
            }
            offset += STACK_ENTRY_HEAD_SIZE as u64 + entry_body_size;
        }
        Ok(None)
    }
}
