//! The tracebuffer ring: a bounded FIFO of variable-length framed
//! records inside the mapped file.
//!
//! ```text
//! [ring header: 160B]  version | mutex | body_size wrapped dropped
//!                      entries next_free last_valid | reserved
//! [body: body_size]    ~ | size u16 | head crc | body... | body crc
//! ```
//!
//! `body_size` is the usable byte count plus one; the spare byte keeps
//! head and tail distinguishable, so one body byte is always unused.
//! Occupancy is `(next_free − last_valid) mod body_size`.
//!
//! Writers insert under the in-file mutex and evict oldest entries on
//! overflow. Readers never lock: they snapshot the header, walk the
//! body forward and revalidate, resynchronising on torn writes,
//! wrap-around and writer death. Virtual (absolute) positions are
//! `body_size * wrapped + offset`, tracked as `u128` so they cannot
//! overflow in any realistic lifetime.

use std::io;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::crc8::{crc8, crc8_continue};
use crate::layout::{
    RING_ENTRY_HEAD_SIZE, RING_ENTRY_MAGIC, RING_ENTRY_OVERHEAD, RING_HEADER_SIZE,
    RING_HEAD_PART_OFFSET, SAFE_ZONE_THRESHOLD,
};
use crate::mmap::MappedFile;

// Header field offsets relative to the section start.
const BODY_SIZE_OFFSET: usize = 72;
const WRAPPED_OFFSET: usize = 80;
const DROPPED_OFFSET: usize = 88;
const ENTRIES_OFFSET: usize = 96;
const NEXT_FREE_OFFSET: usize = 104;
const LAST_VALID_OFFSET: usize = 112;

/// Saturating add used for the `wrapped`/`dropped`/`entries` counters;
/// they peg at `u64::MAX` instead of wrapping.
#[inline]
fn add_with_max(base: u64, value: u64) -> u64 {
    base.saturating_add(value)
}

// ---------------------------------------------------------------------------
// Writer side
// ---------------------------------------------------------------------------

/// Producer view of a ring buffer living in a writable `MAP_SHARED`
/// mapping.
///
/// All methods that mutate the ring require the caller to hold the
/// ring's in-file mutex; the writer itself performs no locking.
pub struct RingWriter {
    base: *mut u8,
    body_size: u64,
}

// SAFETY: every access to the pointed-to region is either a volatile
// header word or a byte copy guarded by the in-file mutex held by the
// caller; the pointer itself is immutable.
unsafe impl Send for RingWriter {}
unsafe impl Sync for RingWriter {}

impl RingWriter {
    /// Initialises a fresh ring in `space` bytes at `base` and returns
    /// the writer. The space must hold the header plus at least two
    /// body bytes.
    ///
    /// # Safety
    ///
    /// `base` must point at `space` writable bytes inside a
    /// `MAP_SHARED` mapping that outlives the writer, and no other
    /// process may be using the region yet.
    pub unsafe fn init(base: *mut u8, space: usize) -> io::Result<Self> {
        if space <= RING_HEADER_SIZE + 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ring space too small",
            ));
        }
        // SAFETY: caller guarantees the region; zeroing the header and
        // touching the last body byte stays inside it.
        unsafe {
            std::ptr::write_bytes(base, 0, RING_HEADER_SIZE);
            std::ptr::write_volatile(base.cast::<u64>(), 1); // version
        }
        let body_size = (space - RING_HEADER_SIZE) as u64;
        let writer = Self { base, body_size };
        writer.set_field(BODY_SIZE_OFFSET, body_size);
        // Touch the final body byte so a short mapping faults here, not
        // in the middle of an insert.
        // SAFETY: body_size > 1, so the byte is inside the region.
        unsafe {
            std::ptr::write_volatile(
                base.add(RING_HEADER_SIZE + body_size as usize - 1),
                0,
            );
        }
        Ok(writer)
    }

    /// Opens an already initialised ring at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point at a ring previously set up with
    /// [`RingWriter::init`] inside a writable `MAP_SHARED` mapping that
    /// outlives the writer.
    pub unsafe fn open(base: *mut u8) -> io::Result<Self> {
        // SAFETY: reading the body_size header field of an initialised
        // ring.
        let body_size = unsafe {
            std::ptr::read_volatile(base.add(BODY_SIZE_OFFSET).cast::<u64>())
        };
        if body_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "ring buffer not initialised",
            ));
        }
        Ok(Self { base, body_size })
    }

    #[inline]
    fn field(&self, offset: usize) -> u64 {
        // SAFETY: offset is one of the 8-aligned header field offsets
        // inside the region guaranteed by init/open.
        unsafe { std::ptr::read_volatile(self.base.add(offset).cast::<u64>()) }
    }

    #[inline]
    fn set_field(&self, offset: usize, value: u64) {
        // SAFETY: as in `field`; mutation is serialised by the in-file
        // mutex held by the caller.
        unsafe { std::ptr::write_volatile(self.base.add(offset).cast::<u64>(), value) };
    }

    /// Usable capacity in bytes (one body byte is always spare).
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.body_size - 1
    }

    /// Bytes currently occupied by entries (including torn garbage).
    #[must_use]
    pub fn occupied(&self) -> u64 {
        let next_free = self.field(NEXT_FREE_OFFSET);
        let last_valid = self.field(LAST_VALID_OFFSET);
        if last_valid == next_free {
            0
        } else if next_free > last_valid {
            next_free - last_valid
        } else {
            (self.body_size - last_valid) + next_free
        }
    }

    /// Bytes available for new entries.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.capacity() - self.occupied()
    }

    /// Successful inserts so far (saturating).
    #[must_use]
    pub fn entries(&self) -> u64 {
        self.field(ENTRIES_OFFSET)
    }

    /// Entries evicted by overflow so far (saturating).
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.field(DROPPED_OFFSET)
    }

    /// Head wrap-arounds so far (saturating).
    #[must_use]
    pub fn wrapped(&self) -> u64 {
        self.field(WRAPPED_OFFSET)
    }

    fn move_next_free(&self, n: u64) {
        let mut next_free = self.field(NEXT_FREE_OFFSET) + n;
        if next_free >= self.body_size {
            self.set_field(WRAPPED_OFFSET, add_with_max(self.field(WRAPPED_OFFSET), 1));
        }
        next_free %= self.body_size;
        self.set_field(NEXT_FREE_OFFSET, next_free);
    }

    fn move_last_valid(&self, n: u64) {
        let last_valid = (self.field(LAST_VALID_OFFSET) + n) % self.body_size;
        self.set_field(LAST_VALID_OFFSET, last_valid);
    }

    /// Copies `data` into the body at `next_free`, wrapping at the
    /// region end. Does not advance any cursor.
    fn copy_in(&self, data: &[u8]) {
        let next_free = self.field(NEXT_FREE_OFFSET) as usize;
        let body_size = self.body_size as usize;
        let first = data.len().min(body_size - next_free);
        // SAFETY: both block copies stay inside the body region
        // [base+160, base+160+body_size); the caller holds the ring
        // mutex so no other writer races these bytes.
        unsafe {
            let body = self.base.add(RING_HEADER_SIZE);
            std::ptr::copy_nonoverlapping(data.as_ptr(), body.add(next_free), first);
            if first < data.len() {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(first),
                    body,
                    data.len() - first,
                );
            }
        }
    }

    /// CRC-8 over a wrapped body region starting at `offset`.
    fn inplace_crc(&self, offset: u64, size: u64) -> u8 {
        let offset = (offset % self.body_size) as usize;
        let body_size = self.body_size as usize;
        let size = size as usize;
        let first = size.min(body_size - offset);
        // SAFETY: both slices are inside the body region; concurrent
        // readers only ever read, and writers are serialised by the
        // caller-held mutex.
        unsafe {
            let body = self.base.add(RING_HEADER_SIZE);
            let crc = crc8_continue(0, std::slice::from_raw_parts(body.add(offset), first));
            if size > first {
                crc8_continue(crc, std::slice::from_raw_parts(body, size - first))
            } else {
                crc
            }
        }
    }

    /// Reads `out.len()` bytes from the body at `last_valid`.
    fn copy_out_at_tail(&self, out: &mut [u8]) {
        let last_valid = self.field(LAST_VALID_OFFSET) as usize;
        let body_size = self.body_size as usize;
        let first = out.len().min(body_size - last_valid);
        // SAFETY: bounds as in copy_in.
        unsafe {
            let body = self.base.add(RING_HEADER_SIZE);
            std::ptr::copy_nonoverlapping(body.add(last_valid), out.as_mut_ptr(), first);
            if first < out.len() {
                std::ptr::copy_nonoverlapping(body, out.as_mut_ptr().add(first), out.len() - first);
            }
        }
    }

    /// Drops the oldest entry (or one byte of torn garbage) to make
    /// room. Requires the ring mutex.
    fn drop_oldest(&self) {
        let mut found_invalid = false;
        loop {
            let occupied = self.occupied();
            if occupied == 0 {
                return;
            }
            if occupied <= RING_ENTRY_HEAD_SIZE {
                self.move_last_valid(occupied);
                return;
            }
            let mut first_byte = [0u8; 1];
            self.copy_out_at_tail(&mut first_byte);
            if first_byte[0] != RING_ENTRY_MAGIC {
                self.move_last_valid(1);
                found_invalid = true;
                continue;
            }
            if self.inplace_crc(self.field(LAST_VALID_OFFSET), RING_ENTRY_HEAD_SIZE) != 0 {
                self.move_last_valid(1);
                found_invalid = true;
                continue;
            }
            if found_invalid {
                // Skipped garbage and arrived at a valid head: that is
                // enough progress for this call.
                return;
            }

            // Valid entry head at the tail: consume it.
            let mut head = [0u8; RING_ENTRY_HEAD_SIZE as usize];
            self.copy_out_at_tail(&mut head);
            let entry_body_size = u64::from(u16::from_le_bytes([head[1], head[2]]));
            self.move_last_valid(RING_ENTRY_HEAD_SIZE);
            self.set_field(DROPPED_OFFSET, add_with_max(self.field(DROPPED_OFFSET), 1));

            let occupied = self.occupied();
            if occupied < entry_body_size + 1 {
                // Body truncated by a torn write; leave the garbage for
                // the byte-wise scan.
                return;
            }
            if self.inplace_crc(self.field(LAST_VALID_OFFSET), entry_body_size + 1) != 0 {
                // Claimed size not trustworthy: advance byte-wise on
                // the next call instead of jumping by it.
                return;
            }
            self.move_last_valid(entry_body_size + 1);
            return;
        }
    }

    /// Inserts `data` as one framed entry, evicting oldest entries as
    /// needed. Requires the ring mutex.
    ///
    /// Returns false (and writes nothing) when the entry cannot ever
    /// fit: empty, larger than the ring, or not representable in the
    /// u16 size field.
    pub fn insert(&self, data: &[u8]) -> bool {
        let size = data.len() as u64;
        if data.is_empty()
            || size + RING_ENTRY_OVERHEAD >= self.body_size
            || size + RING_ENTRY_OVERHEAD >= (1 << 16)
        {
            return false;
        }

        #[allow(clippy::cast_possible_truncation)] // size < 2^16 checked above
        let size16 = size as u16;
        let mut head = [RING_ENTRY_MAGIC, size16.to_le_bytes()[0], size16.to_le_bytes()[1], 0];
        head[3] = crc8(&head[..3]);
        let body_crc = crc8(data);

        while self.available() < RING_ENTRY_OVERHEAD + size {
            self.drop_oldest();
        }

        self.copy_in(&head);
        self.move_next_free(RING_ENTRY_HEAD_SIZE);
        self.copy_in(data);
        self.move_next_free(size);
        self.copy_in(&[body_crc]);
        self.move_next_free(1);

        self.set_field(ENTRIES_OFFSET, add_with_max(self.field(ENTRIES_OFFSET), 1));
        true
    }

    /// Empties the ring: every present entry counts as dropped and the
    /// tail catches up with the head. `entries`, `next_free` and
    /// `wrapped` are untouched. Requires the ring mutex.
    pub fn clear(&self) {
        self.set_field(DROPPED_OFFSET, self.field(ENTRIES_OFFSET));
        self.set_field(LAST_VALID_OFFSET, self.field(NEXT_FREE_OFFSET));
    }
}

// ---------------------------------------------------------------------------
// Reader side
// ---------------------------------------------------------------------------

/// One consistent snapshot of the mutable ring header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadPart {
    /// Body size including the spare byte.
    pub size: u64,
    /// Head wrap-arounds (saturating).
    pub wrapped: u64,
    /// Entries evicted by overflow (saturating).
    pub dropped: u64,
    /// Successful inserts (saturating).
    pub entries: u64,
    /// Next byte the writer will fill, `< size`.
    pub next_free: u64,
    /// Oldest potentially valid byte, `< size`.
    pub last_valid: u64,
}

impl HeadPart {
    #[inline]
    fn is_wrapped(&self) -> bool {
        self.next_free < self.last_valid
    }

    /// Absolute position of the write head.
    #[must_use]
    pub fn next_free_abs(&self) -> u128 {
        u128::from(self.size) * u128::from(self.wrapped) + u128::from(self.next_free)
    }

    /// Absolute position of the tail.
    #[must_use]
    pub fn last_valid_abs(&self) -> u128 {
        if self.wrapped > 0 {
            u128::from(self.size) * u128::from(self.wrapped - u64::from(self.is_wrapped()))
                + u128::from(self.last_valid)
        } else {
            u128::from(self.last_valid)
        }
    }

    /// Whether the snapshot is internally consistent. A writer dying
    /// mid-update (or file corruption) can leave impossible values
    /// (`dropped > entries`, a cursor at or past `size`); the reader
    /// then resets instead of trusting them.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.dropped <= self.entries && self.next_free < self.size && self.last_valid < self.size
    }
}

/// The reader's private cursor into one ring.
#[derive(Debug, Clone, Copy)]
struct ReadState {
    position: u128,
    old_position: u128,
    entry_count: u64,
    size: u64,
}

impl ReadState {
    fn new(c: &HeadPart) -> Self {
        let mut state = Self {
            position: 0,
            old_position: 0,
            entry_count: c.dropped,
            size: c.size,
        };
        state.reset(c);
        state
    }

    fn position_rel(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation)] // modulo a u64
        let rel = (self.position % u128::from(self.size)) as u64;
        rel
    }

    fn max_position_abs(&self) -> u128 {
        self.position.max(self.old_position)
    }

    /// Re-anchors the cursor at the writer's tail after a lap or an
    /// invalid snapshot. Never moves backwards.
    fn reset(&mut self, c: &HeadPart) {
        if c.last_valid_abs() < self.position {
            return;
        }
        self.old_position = self.position.max(self.old_position);
        self.position = self.position.max(c.last_valid_abs());
        self.entry_count = self.entry_count.max(c.dropped);
    }

    /// Whether the cursor still points between tail and head.
    fn valid(&self, c: &HeadPart) -> bool {
        c.valid()
            && c.last_valid_abs() <= self.position
            && self.position <= c.next_free_abs()
    }

    fn increment(&mut self, n: u64) {
        self.position += u128::from(n);
    }

    fn next_entry_nr(&mut self) -> u64 {
        let nr = self.entry_count;
        self.entry_count = add_with_max(self.entry_count, 1);
        nr
    }
}

/// One entry copied out of the ring. Small bodies stay on the stack.
#[derive(Debug)]
pub struct RingEntry {
    /// Position of this entry in the writer's insert order, starting
    /// from the number of already evicted entries.
    pub nr: u64,
    data: SmallVec<[u8; 256]>,
}

impl RingEntry {
    /// The entry body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.data
    }

    /// Body length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the body is empty (never true for entries the writer
    /// produced).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Reading a ring can fail recoverably (damaged entry head) or
/// terminally (resynchronisation gave up).
#[derive(Debug, thiserror::Error)]
pub enum RingReadError {
    /// A byte looked like an entry head but its CRC did not match.
    /// The cursor has already moved past it; the next call continues
    /// normally.
    #[error("ring buffer entry head crc invalid")]
    HeadCrc,
    /// The retry budget was exhausted without finding a stable entry.
    #[error("could not resynchronise ring buffer within {0} attempts")]
    SyncLost(u64),
    /// The underlying file access failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Non-blocking consumer view of one ring buffer.
///
/// The reader never takes the in-file mutex; it snapshots the header,
/// validates what it copies and resynchronises when the writer laps it.
pub struct RingReader {
    file: Arc<MappedFile>,
    section: usize,
    body_size: u64,
    state: ReadState,
}

impl RingReader {
    /// Opens the ring at byte `section` of `file`.
    pub fn new(file: Arc<MappedFile>, section: usize) -> io::Result<Self> {
        let body_size = file.read_u64(section + BODY_SIZE_OFFSET)?;
        if body_size < 2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "ring buffer body too small",
            ));
        }
        let mut reader = Self {
            file,
            section,
            body_size,
            state: ReadState {
                position: 0,
                old_position: 0,
                entry_count: 0,
                size: body_size,
            },
        };
        let c = reader.capture()?;
        reader.state = ReadState::new(&c);
        Ok(reader)
    }

    /// Format version of this ring.
    pub fn version(&self) -> io::Result<u64> {
        self.file.read_u64(self.section)
    }

    /// Usable capacity in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.body_size - 1
    }

    /// Snapshots the mutable header fields with volatile loads.
    pub fn capture(&self) -> io::Result<HeadPart> {
        let at = self.section + RING_HEAD_PART_OFFSET;
        debug_assert_eq!(RING_HEAD_PART_OFFSET, BODY_SIZE_OFFSET);
        Ok(HeadPart {
            size: self.file.read_u64_volatile(at)?,
            wrapped: self.file.read_u64_volatile(at + 8)?,
            dropped: self.file.read_u64_volatile(at + 16)?,
            entries: self.file.read_u64_volatile(at + 24)?,
            next_free: self.file.read_u64_volatile(at + 32)?,
            last_valid: self.file.read_u64_volatile(at + 40)?,
        })
    }

    /// The writer's saturating insert counter.
    pub fn entries(&self) -> io::Result<u64> {
        Ok(self.capture()?.entries)
    }

    /// The writer's saturating eviction counter.
    pub fn dropped(&self) -> io::Result<u64> {
        Ok(self.capture()?.dropped)
    }

    /// Bytes the writer has produced that this reader has not consumed,
    /// clamped to the ring capacity.
    pub fn pending_bytes(&self) -> io::Result<u64> {
        let c = self.capture()?;
        Ok(self.pending_with(&c))
    }

    fn pending_with(&self, c: &HeadPart) -> u64 {
        let head = c.next_free_abs();
        let tail = c.last_valid_abs().max(self.state.max_position_abs());
        let diff = head.saturating_sub(tail);
        #[allow(clippy::cast_possible_truncation)] // clamped below u64::MAX
        let pending = diff.min(u128::from(u64::MAX)) as u64;
        pending.min(self.body_size - 1)
    }

    /// Re-anchors the cursor at the writer's tail.
    pub fn reset(&mut self) -> io::Result<()> {
        let c = self.capture()?;
        self.state.reset(&c);
        Ok(())
    }

    /// Jumps the cursor to the write head: only entries inserted after
    /// this call will be returned.
    pub fn skip_to_end(&mut self) -> io::Result<()> {
        let c = self.capture()?;
        self.state.old_position = self.state.position.max(self.state.old_position);
        self.state.position = self.state.position.max(c.next_free_abs());
        self.state.entry_count = self.state.entry_count.max(c.entries);
        Ok(())
    }

    fn body_region(&self) -> usize {
        self.section + RING_HEADER_SIZE
    }

    /// Returns the next stable entry, `None` when the ring holds
    /// nothing new, or an error when resynchronisation gives up.
    ///
    /// Entries far behind the write head (more than the safe-zone
    /// threshold of pending bytes) cannot be overwritten during one
    /// call, so their CRCs are skipped; the header is then re-checked
    /// after the copy to detect a lapping writer.
    pub fn next_entry(&mut self) -> Result<Option<RingEntry>, RingReadError> {
        let max_attempts = self.body_size.max(10 * 1024);
        let mut attempts: u64 = 0;
        loop {
            attempts += 1;
            if attempts > max_attempts {
                return Err(RingReadError::SyncLost(max_attempts));
            }

            let c = self.capture()?;
            if !self.state.valid(&c) {
                self.state.reset(&c);
                continue;
            }
            let pending = self.pending_with(&c);
            if pending == 0 {
                return Ok(None);
            }
            let in_safe_zone = pending > SAFE_ZONE_THRESHOLD;

            let pos_rel = self.state.position_rel();
            let mut first = [0u8; 1];
            self.file
                .read_wrapped(&mut first, self.body_region(), pos_rel, self.body_size)?;
            if first[0] != RING_ENTRY_MAGIC {
                self.state.increment(1);
                continue;
            }

            let mut size_raw = [0u8; 2];
            self.file.read_wrapped(
                &mut size_raw,
                self.body_region(),
                pos_rel + 1,
                self.body_size,
            )?;
            let entry_size = u64::from(u16::from_le_bytes(size_raw));
            if entry_size >= u64::from(u16::MAX) {
                self.state.increment(1);
                continue;
            }

            let head_valid = in_safe_zone
                || self.file.crc8_wrapped(
                    self.body_region(),
                    pos_rel,
                    RING_ENTRY_HEAD_SIZE,
                    self.body_size,
                )? == 0;
            if !head_valid {
                // Surface the damage once, with the cursor already past
                // it so the next call resumes scanning.
                self.state.increment(1);
                return Err(RingReadError::HeadCrc);
            }

            let nr = self.state.next_entry_nr();
            let body_start = pos_rel + RING_ENTRY_HEAD_SIZE;
            let mut data = SmallVec::<[u8; 256]>::new();
            data.resize(entry_size as usize, 0);
            self.file
                .read_wrapped(&mut data, self.body_region(), body_start, self.body_size)?;

            let body_valid = in_safe_zone || {
                let mut stored = [0u8; 1];
                self.file.read_wrapped(
                    &mut stored,
                    self.body_region(),
                    body_start + entry_size,
                    self.body_size,
                )?;
                stored[0] == crc8(&data)
            };
            if !body_valid {
                self.state.increment(1);
                continue;
            }

            if in_safe_zone {
                // The CRCs were skipped; make sure the writer did not
                // lap us while we copied.
                let after = self.capture()?;
                if !self.state.valid(&after) {
                    self.state.reset(&after);
                    continue;
                }
            }

            self.state.increment(RING_ENTRY_HEAD_SIZE + entry_size + 1);
            return Ok(Some(RingEntry { nr, data }));
        }
    }
}

impl std::fmt::Debug for RingReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingReader")
            .field("section", &self.section)
            .field("body_size", &self.body_size)
            .finish_non_exhaustive()
    }
}
