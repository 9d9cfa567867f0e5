//! Process, thread and clock queries for the hot path.
//!
//! The thread id is cached per thread; `gettid` is a syscall and the
//! tracing hot path must not pay for it on every event.

use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

/// Realtime clock in nanoseconds since the Unix epoch.
#[must_use]
pub fn timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| {
            #[allow(clippy::cast_possible_truncation)] // fits until year 2554
            let ns = d.as_nanos() as u64;
            ns
        })
}

/// The current process id.
#[must_use]
pub fn process_id() -> u32 {
    std::process::id()
}

thread_local! {
    static CACHED_TID: Cell<u32> = const { Cell::new(0) };
}

/// The current thread id (cached after the first call).
#[must_use]
pub fn thread_id() -> u32 {
    CACHED_TID.with(|cached| {
        let tid = cached.get();
        if tid != 0 {
            return tid;
        }
        // SAFETY: gettid has no preconditions.
        #[allow(clippy::cast_sign_loss)] // thread ids are positive
        let tid = unsafe { libc::gettid() } as u32;
        cached.set(tid);
        tid
    })
}
