use std::fs::OpenOptions;

use tempfile::TempDir;

use super::crc8::crc8;
use super::layout::{STACK_ENTRY_HEAD_SIZE, STACK_HEADER_SIZE};
use super::sync::{SharedMutex, SHARED_MUTEX_SIZE};
use super::unique_stack::UniqueStack;

#[repr(align(8))]
struct MutexStorage([u8; SHARED_MUTEX_SIZE]);

struct Fixture {
    _dir: TempDir,
    file: std::fs::File,
    _mutex_storage: Box<MutexStorage>,
    mutex: SharedMutex,
    stack: UniqueStack,
}

/// A stack at section offset 0 of a scratch file. The mutex lives on
/// the heap instead of inside the mapped header; the add path does not
/// care where the storage is.
fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stack.clltk_trace");
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .unwrap();
    let stack = UniqueStack::init(&file, 0).unwrap();

    let mut mutex_storage = Box::new(MutexStorage([0u8; SHARED_MUTEX_SIZE]));
    let ptr = mutex_storage.0.as_mut_ptr();
    // SAFETY: storage outlives the fixture.
    let mutex = unsafe {
        SharedMutex::init_at(ptr).unwrap();
        SharedMutex::from_raw(ptr)
    };

    Fixture {
        _dir: dir,
        file,
        _mutex_storage: mutex_storage,
        mutex,
        stack,
    }
}

#[test]
fn init_writes_an_empty_header() {
    let f = fixture();
    assert_eq!(f.stack.body_size(&f.file).unwrap(), 0);
    assert_eq!(
        f.file.metadata().unwrap().len(),
        STACK_HEADER_SIZE as u64
    );
}

#[test]
fn add_returns_the_body_offset() {
    let f = fixture();
    let blob = b"{ some metadata blob }";
    let offset = f.stack.add(&f.file, &f.mutex, blob).unwrap();
    assert_eq!(
        offset,
        (STACK_HEADER_SIZE + STACK_ENTRY_HEAD_SIZE) as u64
    );

    // Reading size and body back at the returned offset yields the
    // original bytes.
    use std::os::unix::fs::FileExt;
    let mut head = [0u8; STACK_ENTRY_HEAD_SIZE];
    f.file
        .read_exact_at(&mut head, offset - STACK_ENTRY_HEAD_SIZE as u64)
        .unwrap();
    let stored_size = u32::from_le_bytes(head[24..28].try_into().unwrap());
    assert_eq!(stored_size as usize, blob.len());
    assert_eq!(crc8(&head), 0, "head crc self-zeroes");

    let mut body = vec![0u8; blob.len()];
    f.file.read_exact_at(&mut body, offset).unwrap();
    assert_eq!(&body, blob);
}

#[test]
fn duplicate_blobs_deduplicate() {
    let f = fixture();
    let blob_b = vec![0xB0u8; 100];
    let blob_c = vec![0xC0u8; 100];

    let o1 = f.stack.add(&f.file, &f.mutex, &blob_b).unwrap();
    let size_after_first = f.stack.body_size(&f.file).unwrap();
    let o2 = f.stack.add(&f.file, &f.mutex, &blob_c).unwrap();
    let size_after_second = f.stack.body_size(&f.file).unwrap();

    assert_ne!(o1, o2);
    let per_entry = (STACK_ENTRY_HEAD_SIZE + 100) as u64;
    assert_eq!(size_after_first, per_entry);
    assert_eq!(size_after_second, 2 * per_entry);

    // Re-adding the first blob returns the original offset and grows
    // nothing.
    let o3 = f.stack.add(&f.file, &f.mutex, &blob_b).unwrap();
    assert_eq!(o3, o1);
    assert_eq!(f.stack.body_size(&f.file).unwrap(), 2 * per_entry);
}

#[test]
fn same_bytes_different_length_are_distinct() {
    // The hash covers the size prefix, so a prefix blob is not a hit.
    let f = fixture();
    let o1 = f.stack.add(&f.file, &f.mutex, b"abcd").unwrap();
    let o2 = f.stack.add(&f.file, &f.mutex, b"abc").unwrap();
    assert_ne!(o1, o2);
}

#[test]
fn empty_blobs_are_rejected() {
    let f = fixture();
    assert!(f.stack.add(&f.file, &f.mutex, b"").is_err());
}

#[test]
fn offsets_are_stable_across_reopen() {
    let f = fixture();
    let blob = b"persistent blob";
    let o1 = f.stack.add(&f.file, &f.mutex, blob).unwrap();

    let reopened = UniqueStack::open(0);
    let o2 = reopened.add(&f.file, &f.mutex, blob).unwrap();
    assert_eq!(o1, o2);
}
