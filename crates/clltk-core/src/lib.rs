//! # CLLTK core
//!
//! On-disk tracebuffer format of the common low-level tracing toolkit.
//!
//! A tracebuffer is one named ring buffer backed by one file. Writers
//! in the traced process append framed binary records; readers in other
//! processes map the same file and decode, live or after the fact. The
//! file also carries a content-addressed "unique stack" that stores
//! each distinct metadata blob exactly once.
//!
//! This crate owns everything both sides agree on:
//!
//! - [`layout`] — magic numbers, header layouts, offsets and type codes
//! - [`crc8`] — the checksum protecting headers and entries
//! - [`mmap`] — the growable shared mapping readers use
//! - [`sync`] — the robust process-shared mutex embedded in the file
//! - [`unique_stack`] — the deduplicating metadata store
//! - [`ringbuffer`] — writer insert and reader resynchronisation
//!
//! The writer API lives in `clltk-tracing`, decoding in
//! `clltk-decoder`.

#![warn(missing_docs)]

pub mod crc8;
#[cfg(test)]
mod crc8_tests;
pub mod layout;
#[cfg(test)]
mod layout_tests;
pub mod mmap;
pub mod ringbuffer;
pub mod sync;
pub mod unique_stack;
#[cfg(test)]
mod unique_stack_tests;

pub use layout::{FileHeader, SourceType};
pub use mmap::MappedFile;
pub use ringbuffer::{RingEntry, RingReader, RingWriter};
pub use sync::{SharedMutex, SharedMutexGuard};
pub use unique_stack::UniqueStack;
