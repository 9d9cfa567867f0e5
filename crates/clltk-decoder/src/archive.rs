//! Snapshot archive input.
//!
//! Snapshots travel as POSIX tar archives, optionally gzip-compressed.
//! Both formats are sniffed by magic (gzip `\x1f\x8b` at offset 0,
//! `ustar` at offset 257), not by file name. An opened archive is
//! unpacked into a unique temporary directory that lives exactly as
//! long as the [`Archive`] value.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::GzDecoder;
use tempfile::TempDir;

/// Offset of the `ustar` magic inside a tar header block.
const TAR_MAGIC_OFFSET: u64 = 257;
const TAR_MAGIC: &[u8; 5] = b"ustar";
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// An unpacked snapshot archive.
pub struct Archive {
    dir: TempDir,
}

impl Archive {
    /// Whether `path` carries a tar or gzip magic.
    #[must_use]
    pub fn is_archive(path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }
        let Ok(mut file) = File::open(path) else {
            return false;
        };
        let mut head = [0u8; 2];
        if file.read_exact(&mut head).is_err() {
            return false;
        }
        if head == GZIP_MAGIC {
            return true;
        }
        let mut magic = [0u8; 5];
        file.seek(SeekFrom::Start(TAR_MAGIC_OFFSET))
            .and_then(|_| file.read_exact(&mut magic))
            .map(|()| &magic == TAR_MAGIC)
            .unwrap_or(false)
    }

    /// Unpacks `path` if it is an archive; `Ok(None)` when it is not.
    pub fn open(path: &Path) -> io::Result<Option<Self>> {
        if !Self::is_archive(path) {
            return Ok(None);
        }
        let dir = TempDir::new()?;
        let mut file = File::open(path)?;

        let mut head = [0u8; 2];
        file.read_exact(&mut head)?;
        file.seek(SeekFrom::Start(0))?;

        if head == GZIP_MAGIC {
            tar::Archive::new(GzDecoder::new(file)).unpack(dir.path())?;
        } else {
            tar::Archive::new(file).unpack(dir.path())?;
        }
        Ok(Some(Self { dir }))
    }

    /// The directory holding the unpacked entries; removed when the
    /// archive is dropped.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive").field("dir", &self.dir.path()).finish()
    }
}
