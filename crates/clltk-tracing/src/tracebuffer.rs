//! Writer handle to one tracebuffer.

use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing::error;

use clltk_core::ringbuffer::RingWriter;
use clltk_core::sync::SharedMutex;
use clltk_core::unique_stack::UniqueStack;
use clltk_core::layout::IN_FILE_OFFSET_MIN_STATIC;

use crate::config::valid_name;
use crate::file::{self, TraceFile};

/// Default ring size for tracebuffers created on the side, e.g. by
/// dynamic tracepoints.
pub const DEFAULT_RING_SIZE: u64 = 10 * 1024;

/// A writer's view of one named tracebuffer.
///
/// Handles are cheap to open repeatedly: all handles of the same name
/// in one process share the underlying mapped file, and the file is
/// closed (never deleted) when the last handle drops.
pub struct Tracebuffer {
    file: Arc<TraceFile>,
    ring: RingWriter,
    ring_mutex: SharedMutex,
    stack: UniqueStack,
    stack_mutex: SharedMutex,
}

impl Tracebuffer {
    /// Opens (or crash-safely creates) the tracebuffer `name` with a
    /// ring of `ring_size` usable bytes. An existing file keeps its
    /// ring size.
    pub fn open(name: &str, ring_size: u64) -> io::Result<Self> {
        if !valid_name(name) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid tracebuffer name {name:?}"),
            ));
        }
        let file = file::acquire(name, ring_size)?;
        let ring = file.ring_writer()?;
        let ring_mutex = file.ring_mutex();
        let stack = file.unique_stack();
        let stack_mutex = file.stack_mutex();
        Ok(Self {
            file,
            ring,
            ring_mutex,
            stack,
            stack_mutex,
        })
    }

    /// The tracebuffer name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.file.name()
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Successful inserts so far (saturating).
    #[must_use]
    pub fn entries(&self) -> u64 {
        self.ring.entries()
    }

    /// Entries evicted by overflow so far (saturating).
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.ring.dropped()
    }

    /// Publishes a blob through the unique stack, returning its stable
    /// file offset. Failures are logged and reported as `None`; the
    /// caller degrades the event instead of propagating.
    #[must_use]
    pub(crate) fn publish_blob(&self, blob: &[u8]) -> Option<u64> {
        match self.stack.add(self.file.file(), &self.stack_mutex, blob) {
            Ok(offset) => {
                debug_assert!(offset >= IN_FILE_OFFSET_MIN_STATIC);
                Some(offset)
            }
            Err(e) => {
                error!(buffer = self.name(), error = %e, "metadata publication failed");
                None
            }
        }
    }

    /// Pushes one assembled entry into the ring. Never fails: locking
    /// or insert errors are logged and the event is lost.
    pub(crate) fn push(&self, entry: &[u8]) {
        match self.ring_mutex.lock() {
            Ok(_guard) => {
                if !self.ring.insert(entry) {
                    error!(
                        buffer = self.name(),
                        size = entry.len(),
                        "ring buffer rejected entry"
                    );
                }
            }
            Err(e) => {
                error!(buffer = self.name(), error = %e, "could not lock ring buffer");
            }
        }
    }

    /// Like [`Tracebuffer::push`], but invokes `finalize` on the entry
    /// bytes after the ring mutex is held and immediately before the
    /// copy. Dynamic tracepoints stamp their timestamp this way, so it
    /// is taken inside the critical section and cannot reorder against
    /// other inserts.
    pub(crate) fn push_finalized(&self, entry: &mut [u8], finalize: impl FnOnce(&mut [u8])) {
        match self.ring_mutex.lock() {
            Ok(_guard) => {
                finalize(entry);
                if !self.ring.insert(entry) {
                    error!(
                        buffer = self.name(),
                        size = entry.len(),
                        "ring buffer rejected entry"
                    );
                }
            }
            Err(e) => {
                error!(buffer = self.name(), error = %e, "could not lock ring buffer");
            }
        }
    }

    /// Empties the ring; every pending entry counts as dropped.
    pub fn clear(&self) {
        match self.ring_mutex.lock() {
            Ok(_guard) => self.ring.clear(),
            Err(e) => error!(buffer = self.name(), error = %e, "could not lock ring buffer"),
        }
    }
}

impl std::fmt::Debug for Tracebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracebuffer")
            .field("name", &self.name())
            .field("path", &self.path())
            .finish_non_exhaustive()
    }
}

/// Creates (or touches) a tracebuffer without recording an event.
pub fn create_tracebuffer(name: &str, ring_size: u64) -> io::Result<()> {
    Tracebuffer::open(name, ring_size).map(drop)
}
