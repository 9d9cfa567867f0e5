//! # CLLTK decoder
//!
//! Offline and live decoding of tracebuffer files written by the
//! common low-level tracing toolkit.
//!
//! ```no_run
//! use clltk_decoder::SnapTracebuffer;
//!
//! for tb in SnapTracebuffer::collect(std::path::Path::new("./traces"), None, None) {
//!     for tp in &tb.tracepoints {
//!         println!("{} {}", tb.name(), tp.msg());
//!     }
//! }
//! ```
//!
//! Three reading modes share the same decoding core:
//!
//! - [`SyncTracebuffer`] — non-blocking forward cursor over one file;
//! - [`SnapTracebuffer`] — drain a file, directory or snapshot archive
//!   into timestamp-sorted collections;
//! - [`LiveDecoder`] — monitor many files and stream a globally
//!   time-ordered merge.
//!
//! Recoverable decoding problems become `Error` tracepoints inside the
//! stream instead of aborting it.

#![warn(missing_docs)]

pub mod archive;
pub mod error;
pub mod formatter;
pub mod live;
pub mod ordered_buffer;
#[cfg(test)]
mod ordered_buffer_tests;
pub mod render;
#[cfg(test)]
mod render_tests;
pub mod snapshot;
pub mod sync;
pub mod tracebuffer_file;
pub mod tracepoint;
#[cfg(test)]
mod tracepoint_tests;

pub use archive::Archive;
pub use error::{DecodeError, Result};
pub use live::{request_stop, reset_stop, stop_requested, LiveConfig, LiveDecoder, LiveStats};
pub use ordered_buffer::OrderedBuffer;
pub use snapshot::SnapTracebuffer;
pub use sync::SyncTracebuffer;
pub use tracebuffer_file::{is_tracebuffer, TracebufferFile};
pub use tracepoint::{Tracepoint, TracepointKind};
