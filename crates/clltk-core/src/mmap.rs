//! Growable read-only mapping of a tracebuffer file.
//!
//! The writer may extend the file (unique-stack appends) after a reader
//! has opened it. [`MappedFile`] therefore caches the mapped size and
//! remaps on [`MappedFile::grow`]; every accessor is bounds-checked
//! against the cached size and attempts one growth before failing.
//!
//! All accessors copy data out instead of handing out references into
//! the mapping, so remapping can never invalidate a decoded value.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use memmap2::Mmap;
use parking_lot::RwLock;

use crate::crc8::crc8_continue;

/// A shared, read-only, remap-on-grow view of one tracebuffer file.
pub struct MappedFile {
    file: File,
    path: PathBuf,
    map: RwLock<Mmap>,
    len: AtomicUsize,
}

impl MappedFile {
    /// Opens and maps `path` read-only.
    ///
    /// Fails for files that cannot be opened, stat'ed or mapped; an
    /// empty file is rejected up front since it cannot be mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("empty tracebuffer file {}", path.display()),
            ));
        }
        // SAFETY: the file is open and non-empty. The mapping is
        // read-only; concurrent writers mutate the file through their
        // own MAP_SHARED mapping of the same inode, which the kernel
        // keeps coherent with ours.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self {
            file,
            path,
            map: RwLock::new(map),
            len: AtomicUsize::new(len),
        })
    }

    /// The currently mapped size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the mapping is empty. Always false for an open file.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The path the file was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-checks the file size on disk and remaps if it grew.
    /// Returns the (possibly unchanged) mapped size.
    pub fn grow(&self) -> io::Result<usize> {
        let real = self.file.metadata()?.len() as usize;
        if real == self.len() {
            return Ok(real);
        }
        let mut map = self.map.write();
        // Re-check under the lock; another thread may have remapped.
        if real > self.len() {
            // SAFETY: same file, same read-only mapping constraints as
            // in `open`. The old mapping is dropped on assignment.
            *map = unsafe { Mmap::map(&self.file)? };
            self.len.store(map.len(), Ordering::Release);
        }
        Ok(self.len())
    }

    /// Bounds check for `[offset, offset + size)`, growing once on a
    /// miss.
    fn ensure(&self, offset: usize, size: usize) -> io::Result<()> {
        let end = offset
            .checked_add(size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "offset overflow"))?;
        if end > self.len() {
            self.grow()?;
            if end > self.len() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "out of file access ({end} > {}) in {}",
                        self.len(),
                        self.path.display()
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Copies `out.len()` bytes starting at `offset`.
    pub fn read_exact(&self, offset: usize, out: &mut [u8]) -> io::Result<()> {
        self.ensure(offset, out.len())?;
        let map = self.map.read();
        out.copy_from_slice(&map[offset..offset + out.len()]);
        Ok(())
    }

    /// Reads `len` bytes starting at `offset` into a fresh vector.
    pub fn read_vec(&self, offset: usize, len: usize) -> io::Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read_exact(offset, &mut out)?;
        Ok(out)
    }

    /// Reads one byte.
    pub fn read_u8(&self, offset: usize) -> io::Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(offset, &mut b)?;
        Ok(b[0])
    }

    /// Reads a little-endian `u16`.
    pub fn read_u16(&self, offset: usize) -> io::Result<u16> {
        let mut b = [0u8; 2];
        self.read_exact(offset, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    /// Reads a little-endian `u32`.
    pub fn read_u32(&self, offset: usize) -> io::Result<u32> {
        let mut b = [0u8; 4];
        self.read_exact(offset, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&self, offset: usize) -> io::Result<u64> {
        let mut b = [0u8; 8];
        self.read_exact(offset, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    /// Reads a `u64` with a volatile load.
    ///
    /// Used for ring-buffer header fields that a writer in another
    /// process mutates concurrently: the volatile load keeps the
    /// compiler from caching or tearing the access apart. `offset`
    /// must be 8-byte aligned.
    pub fn read_u64_volatile(&self, offset: usize) -> io::Result<u64> {
        self.ensure(offset, 8)?;
        let map = self.map.read();
        debug_assert_eq!(offset % 8, 0, "volatile u64 reads must be aligned");
        // SAFETY: `ensure` bounds-checked the access, the mapping is
        // held alive by the read lock, and the offset is 8-byte aligned
        // because the mapping is page aligned and all header fields sit
        // at 8-byte offsets.
        Ok(unsafe {
            std::ptr::read_volatile(map.as_ptr().add(offset).cast::<u64>())
        })
    }

    /// Reads a NUL-terminated string of at most `max` bytes starting at
    /// `offset`. The terminator is not included; absent a terminator the
    /// full `max` bytes are returned. Non-UTF-8 bytes are replaced.
    pub fn read_cstr(&self, offset: usize, max: usize) -> io::Result<String> {
        let avail = self.len().saturating_sub(offset).min(max);
        let raw = self.read_vec(offset, avail)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    /// Copies `out.len()` bytes out of the wrap-around region
    /// `[region, region + limit)`, starting at `offset % limit` and
    /// wrapping at the region end.
    pub fn read_wrapped(
        &self,
        out: &mut [u8],
        region: usize,
        offset: u64,
        limit: u64,
    ) -> io::Result<()> {
        self.ensure(region, limit as usize)?;
        let map = self.map.read();
        let offset = (offset % limit) as usize;
        let limit = limit as usize;
        let first = out.len().min(limit - offset);
        out[..first].copy_from_slice(&map[region + offset..region + offset + first]);
        let second = out.len() - first;
        if second > 0 {
            out[first..].copy_from_slice(&map[region..region + second]);
        }
        Ok(())
    }

    /// CRC-8 over a contiguous region.
    pub fn crc8(&self, offset: usize, size: usize) -> io::Result<u8> {
        self.ensure(offset, size)?;
        let map = self.map.read();
        Ok(crc8_continue(0, &map[offset..offset + size]))
    }

    /// CRC-8 over a possibly wrapped region inside
    /// `[region, region + limit)`.
    pub fn crc8_wrapped(
        &self,
        region: usize,
        offset: u64,
        size: u64,
        limit: u64,
    ) -> io::Result<u8> {
        self.ensure(region, limit as usize)?;
        let map = self.map.read();
        let offset = (offset % limit) as usize;
        let limit = limit as usize;
        let size = size as usize;
        let first = size.min(limit - offset);
        let mut crc = crc8_continue(0, &map[region + offset..region + offset + first]);
        let second = size - first;
        if second > 0 {
            crc = crc8_continue(crc, &map[region..region + second]);
        }
        Ok(crc)
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
