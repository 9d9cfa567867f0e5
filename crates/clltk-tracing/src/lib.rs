//! # CLLTK tracing
//!
//! Writer side of the common low-level tracing toolkit: record events
//! into per-process, memory-mapped tracebuffer files with minimal
//! hot-path overhead.
//!
//! ```no_run
//! use clltk_core::layout::ArgType;
//! use clltk_tracing::{static_tracepoint, ArgValue, Tracebuffer, TracepointSite};
//!
//! static GREETING: TracepointSite =
//!     TracepointSite::new(file!(), line!(), "hello %s", &[ArgType::Str]);
//!
//! fn main() -> std::io::Result<()> {
//!     let buffer = Tracebuffer::open("example", 16 * 1024)?;
//!     static_tracepoint(&buffer, &GREETING, &[ArgValue::Str("world")]);
//!     Ok(())
//! }
//! ```
//!
//! Failures on the recording path never propagate into the traced
//! program: events are dropped with a `tracing` diagnostic instead.
//! Opening a tracebuffer is the only fallible operation.

#![warn(missing_docs)]

pub mod args;
#[cfg(test)]
mod args_tests;
pub mod config;
mod file;
mod info;
pub mod meta;
pub mod tracebuffer;
#[cfg(test)]
mod tracebuffer_tests;
pub mod tracepoint;

pub use args::ArgValue;
pub use config::{set_tracing_path, tracing_path};
pub use file::reset_tracing_dir;
pub use meta::TracepointSite;
pub use tracebuffer::{create_tracebuffer, Tracebuffer, DEFAULT_RING_SIZE};
pub use tracepoint::{dump_tracepoint, dynamic_tracepoint, static_tracepoint};
