//! Process-shared robust mutexes embedded in the mapped file.
//!
//! Both the ring buffer and the unique stack reserve 64 bytes of their
//! section header for a `pthread_mutex_t` that serialises writers across
//! processes. The mutex is configured robust so that a writer dying with
//! the lock held does not wedge the tracebuffer: the next acquirer gets
//! `EOWNERDEAD`, marks the state consistent and proceeds.
//!
//! Acquisition uses an absolute two-second deadline on
//! `CLOCK_MONOTONIC`, so a wall-clock adjustment during the wait can
//! neither stretch nor collapse the timeout. A timeout (or any other
//! locking error) means the caller abandons its operation without
//! touching the protected state; tracing never blocks the traced
//! program for longer than the deadline. The monotonic deadline relies
//! on `pthread_mutex_clocklock` (glibc 2.30).

use std::io;
use std::marker::PhantomData;

use tracing::{error, warn};

// The `libc` crate does not expose a binding for this glibc 2.30+
// function, so it is declared here with the exact signature glibc
// provides.
extern "C" {
    fn pthread_mutex_clocklock(
        mutex: *mut libc::pthread_mutex_t,
        clockid: libc::clockid_t,
        abstime: *const libc::timespec,
    ) -> libc::c_int;
}

/// Bytes reserved for the in-file mutex in each section header.
pub const SHARED_MUTEX_SIZE: usize = 64;

/// Lock acquisition deadline, seconds from now on `CLOCK_MONOTONIC`.
const LOCK_TIMEOUT_SECS: libc::time_t = 2;

const _: () = assert!(
    std::mem::size_of::<libc::pthread_mutex_t>() <= SHARED_MUTEX_SIZE,
    "pthread_mutex_t must fit the reserved header bytes"
);

/// Why a [`SharedMutex::lock`] call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// The two-second deadline expired.
    #[error("shared mutex acquisition timed out")]
    Timeout,
    /// The previous owner died and the state could not be marked
    /// consistent.
    #[error("shared mutex unrecoverable after owner death")]
    Unrecoverable,
    /// Any other `pthread` error, carrying the raw errno.
    #[error("shared mutex acquisition failed (errno {0})")]
    Os(i32),
}

/// A view of a robust process-shared mutex living in mapped memory.
///
/// The mutex storage belongs to the file, not to this struct; dropping
/// a `SharedMutex` leaves the on-disk mutex untouched.
pub struct SharedMutex {
    raw: *mut libc::pthread_mutex_t,
}

// SAFETY: the pointed-to mutex is exactly what pthread designed for
// concurrent access from many threads and processes; the pointer itself
// is never mutated.
unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

impl SharedMutex {
    /// Initialises a robust process-shared error-checking mutex in the
    /// 64 reserved bytes at `storage`.
    ///
    /// # Safety
    ///
    /// `storage` must point at [`SHARED_MUTEX_SIZE`] writable bytes
    /// inside a `MAP_SHARED` mapping, properly aligned for
    /// `pthread_mutex_t`, and no other process may be using the bytes
    /// as a mutex yet.
    pub unsafe fn init_at(storage: *mut u8) -> io::Result<()> {
        let mut attr: libc::pthread_mutexattr_t = unsafe { std::mem::zeroed() };
        // SAFETY: attr is a locally owned, zeroed attribute object.
        let mut rc = unsafe { libc::pthread_mutexattr_init(&mut attr) };
        if rc == 0 {
            // SAFETY: attr was initialised above.
            unsafe {
                rc |= libc::pthread_mutexattr_setprotocol(&mut attr, libc::PTHREAD_PRIO_NONE);
                rc |= libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_ERRORCHECK);
                rc |= libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
                rc |= libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
            }
        }
        if rc != 0 {
            return Err(io::Error::other("mutex attribute setup failed"));
        }
        let mutex = storage.cast::<libc::pthread_mutex_t>();
        // SAFETY: caller guarantees storage validity and alignment;
        // attr is fully configured.
        let rc = unsafe { libc::pthread_mutex_init(mutex, &attr) };
        // SAFETY: attr was initialised and is no longer needed.
        if unsafe { libc::pthread_mutexattr_destroy(&mut attr) } != 0 {
            warn!("pthread_mutexattr_destroy failed");
        }
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }

    /// Wraps an already initialised in-file mutex.
    ///
    /// # Safety
    ///
    /// `storage` must point at a mutex previously set up with
    /// [`SharedMutex::init_at`] (by this or another process), inside a
    /// mapping that outlives the returned value.
    #[must_use]
    pub unsafe fn from_raw(storage: *mut u8) -> Self {
        Self {
            raw: storage.cast::<libc::pthread_mutex_t>(),
        }
    }

    /// Acquires the mutex with a two-second absolute deadline.
    ///
    /// If the previous owner died holding the lock, the state is marked
    /// consistent and the acquisition succeeds with
    /// [`SharedMutexGuard::recovered`] set; the caller decides whether
    /// the protected bytes can be trusted.
    pub fn lock(&self) -> Result<SharedMutexGuard<'_>, LockError> {
        // CLOCK_MONOTONIC: the deadline must not move when the wall
        // clock is adjusted mid-wait.
        let mut deadline = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: deadline is a valid out-pointer.
        if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut deadline) } != 0 {
            return Err(LockError::Os(io::Error::last_os_error().raw_os_error().unwrap_or(0)));
        }
        deadline.tv_sec += LOCK_TIMEOUT_SECS;

        // SAFETY: self.raw points at an initialised shared mutex per
        // the from_raw contract.
        let rc = unsafe { pthread_mutex_clocklock(self.raw, libc::CLOCK_MONOTONIC, &deadline) };
        match rc {
            0 => Ok(SharedMutexGuard {
                mutex: self,
                recovered: false,
                released: false,
                _not_send: PhantomData,
            }),
            libc::EOWNERDEAD => {
                // SAFETY: we own the lock in the EOWNERDEAD state, which
                // is exactly when pthread_mutex_consistent is allowed.
                if unsafe { libc::pthread_mutex_consistent(self.raw) } == 0 {
                    warn!("shared mutex recovered from dead owner");
                    Ok(SharedMutexGuard {
                        mutex: self,
                        recovered: true,
                        released: false,
                        _not_send: PhantomData,
                    })
                } else {
                    Err(LockError::Unrecoverable)
                }
            }
            libc::ETIMEDOUT => Err(LockError::Timeout),
            other => Err(LockError::Os(other)),
        }
    }
}

impl std::fmt::Debug for SharedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMutex").finish_non_exhaustive()
    }
}

/// Holds the in-file mutex; unlocks on drop.
pub struct SharedMutexGuard<'a> {
    mutex: &'a SharedMutex,
    /// True when the lock was taken over from a dead owner.
    pub recovered: bool,
    released: bool,
    // The lock owner is the acquiring thread; the guard must not
    // migrate.
    _not_send: PhantomData<*const ()>,
}

impl SharedMutexGuard<'_> {
    /// Releases the lock explicitly. Releasing a guard twice is a
    /// no-op that logs one recoverable error.
    pub fn release(&mut self) {
        if self.released {
            error!("releasing an already released shared mutex");
            return;
        }
        self.released = true;
        // SAFETY: this thread holds the lock (guard invariant).
        let rc = unsafe { libc::pthread_mutex_unlock(self.mutex.raw) };
        if rc != 0 {
            error!(errno = rc, "shared mutex unlock failed");
        }
    }
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.release();
        }
    }
}
