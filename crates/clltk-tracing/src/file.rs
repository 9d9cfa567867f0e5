//! Tracebuffer file acquisition.
//!
//! Every process keeps one open handle per tracebuffer name in a
//! process-wide table; concurrent users share it through `Arc`. A
//! missing file is created crash-safely: the sections are fully
//! initialised in a uniquely named temp file which is then hard-linked
//! to the final name. If another process wins the race the temp file is
//! discarded and the winner's file opened instead, so readers never
//! observe a half-initialised tracebuffer.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::debug;

use clltk_core::layout::{
    encode_definition_body, round_up, FileHeader, SourceType, FILE_HEADER_SIZE, FORMAT_VERSION,
    FORMAT_VERSION_MASK, RING_HEADER_SIZE, RING_MUTEX_OFFSET, STACK_HEADER_SIZE,
    STACK_MUTEX_OFFSET, TRACE_EXTENSION,
};
use clltk_core::sync::SharedMutex;
use clltk_core::unique_stack::UniqueStack;
use clltk_core::ringbuffer::RingWriter;

use crate::config::tracing_path;
use crate::info;

static OPEN_FILES: Mutex<Option<HashMap<String, Weak<TraceFile>>>> = Mutex::new(None);

/// One open, mapped tracebuffer file shared by every writer handle of
/// the same name in this process.
pub(crate) struct TraceFile {
    name: String,
    path: PathBuf,
    file: File,
    map: MmapMut,
    header: FileHeader,
}

impl TraceFile {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    pub(crate) fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Base pointer of the writable shared mapping.
    ///
    /// Writers go through raw pointers because the mapped sections are
    /// mutated concurrently by other handles and processes; all such
    /// access is serialised by the in-file mutexes.
    pub(crate) fn map_ptr(&self) -> *mut u8 {
        self.map.as_ptr().cast_mut()
    }

    /// The ring section's in-file mutex.
    pub(crate) fn ring_mutex(&self) -> SharedMutex {
        // SAFETY: the mutex was initialised during file creation and
        // the mapping lives as long as self.
        unsafe {
            SharedMutex::from_raw(
                self.map_ptr()
                    .add(self.header.ringbuffer_offset as usize + RING_MUTEX_OFFSET),
            )
        }
    }

    /// The unique-stack section's in-file mutex.
    pub(crate) fn stack_mutex(&self) -> SharedMutex {
        // SAFETY: as in ring_mutex.
        unsafe {
            SharedMutex::from_raw(
                self.map_ptr()
                    .add(self.header.stack_offset as usize + STACK_MUTEX_OFFSET),
            )
        }
    }

    /// Opens the ring writer over the mapped ring section.
    pub(crate) fn ring_writer(&self) -> io::Result<RingWriter> {
        // SAFETY: the ring was initialised during file creation; the
        // mapping outlives the writer because the Tracebuffer holding
        // it also holds this TraceFile.
        unsafe { RingWriter::open(self.map_ptr().add(self.header.ringbuffer_offset as usize)) }
    }

    /// The unique-stack handle of this file.
    pub(crate) fn unique_stack(&self) -> UniqueStack {
        UniqueStack::open(self.header.stack_offset)
    }
}

impl std::fmt::Debug for TraceFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceFile")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn final_path(name: &str) -> PathBuf {
    tracing_path().join(format!("{name}.{TRACE_EXTENSION}"))
}

/// Returns the shared handle for `name`, creating the file if needed.
/// `ring_size` only matters for creation; an existing file keeps its
/// ring.
pub(crate) fn acquire(name: &str, ring_size: u64) -> io::Result<Arc<TraceFile>> {
    let mut table = OPEN_FILES.lock();
    let table = table.get_or_insert_with(HashMap::new);
    if let Some(existing) = table.get(name).and_then(Weak::upgrade) {
        return Ok(existing);
    }

    let opened = match open_existing(name) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => create(name, ring_size)?,
        Err(e) => return Err(e),
    };
    let arc = Arc::new(opened);
    table.insert(name.to_owned(), Arc::downgrade(&arc));
    Ok(arc)
}

fn open_existing(name: &str) -> io::Result<TraceFile> {
    let path = final_path(name);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_SYNC)
        .open(&path)?;
    let len = file.metadata()?.len();
    if len < (FILE_HEADER_SIZE + RING_HEADER_SIZE + STACK_HEADER_SIZE) as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("tracebuffer file {} too small", path.display()),
        ));
    }
    // SAFETY: open writable file of non-zero length.
    let map = unsafe { MmapMut::map_mut(&file)? };
    let mut raw = [0u8; FILE_HEADER_SIZE];
    raw.copy_from_slice(&map[..FILE_HEADER_SIZE]);
    let header = FileHeader::decode(&raw)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    if header.version & FORMAT_VERSION_MASK != FORMAT_VERSION & FORMAT_VERSION_MASK {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "incompatible tracebuffer version {:#x} in {}",
                header.version,
                path.display()
            ),
        ));
    }
    Ok(TraceFile {
        name: name.to_owned(),
        path,
        file,
        map,
        header,
    })
}

/// Creates `<name>~<unique>.clltk_trace`, initialises every section and
/// links it to the final name. Loses gracefully when another process
/// creates the final file first.
fn create(name: &str, ring_size: u64) -> io::Result<TraceFile> {
    let dir = tracing_path();
    let temp_path = dir.join(format!(
        "{name}~{:X}.{TRACE_EXTENSION}",
        info::timestamp_ns()
    ));

    let definition_body = encode_definition_body(name, SourceType::Userspace);
    let definition_offset = FILE_HEADER_SIZE as u64;
    let definition_size = 8 + definition_body.len() as u64;
    let ringbuffer_offset = round_up(definition_offset + definition_size, 8);
    let ring_section_size = RING_HEADER_SIZE as u64 + ring_size + 1;
    let stack_offset = round_up(ringbuffer_offset + ring_section_size, 8);
    let required = stack_offset + STACK_HEADER_SIZE as u64;

    let header = FileHeader {
        version: FORMAT_VERSION,
        definition_offset,
        ringbuffer_offset,
        stack_offset,
    };

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .custom_flags(libc::O_SYNC)
        .open(&temp_path)?;
    file.set_len(required)?;

    // SAFETY: freshly created file of the computed length.
    let map = unsafe { MmapMut::map_mut(&file)? };

    file.write_all_at(&header.encode(), 0)?;
    file.write_all_at(&(definition_body.len() as u64).to_le_bytes(), definition_offset)?;
    file.write_all_at(&definition_body, definition_offset + 8)?;

    let ring_space = (stack_offset - ringbuffer_offset) as usize;
    // SAFETY: the mapping covers [0, required); the ring section lies
    // inside it and nobody else can see the unlinked temp file yet.
    unsafe {
        RingWriter::init(map.as_ptr().cast_mut().add(ringbuffer_offset as usize), ring_space)?;
        SharedMutex::init_at(
            map.as_ptr()
                .cast_mut()
                .add(ringbuffer_offset as usize + RING_MUTEX_OFFSET),
        )?;
    }

    UniqueStack::init(&file, stack_offset)?;
    // SAFETY: stack header lies inside the mapping.
    unsafe {
        SharedMutex::init_at(
            map.as_ptr()
                .cast_mut()
                .add(stack_offset as usize + STACK_MUTEX_OFFSET),
        )?;
    }
    map.flush()?;
    drop(map);
    drop(file);

    let target = final_path(name);
    match fs::hard_link(&temp_path, &target) {
        Ok(()) => debug!(name, path = %target.display(), "created tracebuffer file"),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            // Another process linked its file first; use the winner's.
            debug!(name, "lost tracebuffer creation race");
        }
        Err(e) => {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
    }
    fs::remove_file(&temp_path)?;

    open_existing(name)
}

/// Removes every tracebuffer file in the configured tracing directory.
pub fn reset_tracing_dir() -> io::Result<()> {
    let dir = tracing_path();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().is_some_and(|e| e == TRACE_EXTENSION) {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
