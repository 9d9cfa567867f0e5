//! Watermark-bounded reordering buffer for live decoding.
//!
//! Tracepoints from several ring buffers arrive roughly, but not
//! exactly, in timestamp order (writers stamp before inserting). The
//! ordered buffer holds them in a min-heap and releases only those
//! older than `watermark − order_delay`, so late arrivals within the
//! delay window still come out sorted. `finish()` flushes everything.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::tracepoint::Tracepoint;

/// Counters exposed by [`OrderedBuffer::stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Tracepoints accepted by `push`.
    pub total_pushed: u64,
    /// Tracepoints handed out.
    pub total_popped: u64,
    /// Tracepoints evicted by the size bound.
    pub total_dropped: u64,
    /// Currently buffered tracepoints.
    pub current_size: u64,
    /// Largest buffered count ever observed.
    pub high_water_mark: u64,
    /// Last published watermark.
    pub watermark_ns: u64,
}

/// Heap entry: ordered by timestamp, with the arrival sequence as a
/// stable tie-break.
struct Item {
    timestamp_ns: u64,
    seq: u64,
    tp: Tracepoint,
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        (self.timestamp_ns, self.seq) == (other.timestamp_ns, other.seq)
    }
}
impl Eq for Item {}
impl PartialOrd for Item {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Item {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.timestamp_ns, self.seq).cmp(&(other.timestamp_ns, other.seq))
    }
}

struct Inner {
    heap: BinaryHeap<Reverse<Item>>,
    watermark_ns: u64,
    next_seq: u64,
    stats: Stats,
}

/// Thread-safe min-heap of tracepoints with watermark-based release.
pub struct OrderedBuffer {
    max_size: usize,
    order_delay_ns: u64,
    inner: Mutex<Inner>,
    ready: Condvar,
    finished: AtomicBool,
}

impl OrderedBuffer {
    /// A buffer bounded to `max_size` tracepoints (0 = unbounded) that
    /// releases entries `order_delay_ns` behind the watermark.
    #[must_use]
    pub fn new(max_size: usize, order_delay_ns: u64) -> Self {
        Self {
            max_size,
            order_delay_ns,
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                watermark_ns: 0,
                next_seq: 0,
                stats: Stats::default(),
            }),
            ready: Condvar::new(),
            finished: AtomicBool::new(false),
        }
    }

    /// The configured ordering delay in nanoseconds.
    #[must_use]
    pub fn order_delay_ns(&self) -> u64 {
        self.order_delay_ns
    }

    /// The configured size bound (0 = unbounded).
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Inserts one tracepoint; on overflow the oldest buffered entry is
    /// dropped to make room.
    pub fn push(&self, tp: Tracepoint) {
        let mut inner = self.inner.lock();
        if self.max_size > 0 && inner.heap.len() >= self.max_size {
            inner.heap.pop();
            inner.stats.total_dropped += 1;
        }
        let item = Item {
            timestamp_ns: tp.timestamp_ns,
            seq: inner.next_seq,
            tp,
        };
        inner.next_seq += 1;
        inner.heap.push(Reverse(item));
        inner.stats.total_pushed += 1;
        inner.stats.current_size = inner.heap.len() as u64;
        inner.stats.high_water_mark = inner.stats.high_water_mark.max(inner.heap.len() as u64);
        // No wake-up here: readiness only changes with the watermark,
        // and notifying per push would just thrash the sink.
    }

    /// Publishes the highest timestamp the poller has observed and
    /// wakes the sink.
    pub fn update_watermark(&self, max_seen_ns: u64) {
        let mut inner = self.inner.lock();
        inner.watermark_ns = max_seen_ns;
        drop(inner);
        self.ready.notify_one();
    }

    /// Marks the input as complete: every buffered tracepoint becomes
    /// ready and all waiters wake. Idempotent.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
        let _guard = self.inner.lock();
        self.ready.notify_all();
    }

    /// Whether `finish` was called and the buffer has drained.
    #[must_use]
    pub fn finished(&self) -> bool {
        if !self.finished.load(Ordering::Acquire) {
            return false;
        }
        self.inner.lock().heap.is_empty()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    /// Buffered tracepoint count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    fn release_threshold(&self, watermark_ns: u64) -> u64 {
        watermark_ns.saturating_sub(self.order_delay_ns)
    }

    fn pop_front_locked(&self, inner: &mut Inner) -> Option<Tracepoint> {
        let item = inner.heap.pop()?;
        inner.stats.total_popped += 1;
        inner.stats.current_size = inner.heap.len() as u64;
        Some(item.0.tp)
    }

    /// Waits up to `timeout` for one ready tracepoint.
    pub fn pop(&self, timeout: Duration) -> Option<Tracepoint> {
        let mut inner = self.inner.lock();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let finished = self.finished.load(Ordering::Acquire);
            let ready = match inner.heap.peek() {
                Some(Reverse(front)) => {
                    finished || front.timestamp_ns <= self.release_threshold(inner.watermark_ns)
                }
                None => false,
            };
            if ready {
                return self.pop_front_locked(&mut inner);
            }
            if finished && inner.heap.is_empty() {
                return None;
            }
            if self.ready.wait_until(&mut inner, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Pops every currently ready tracepoint, oldest first.
    #[must_use]
    pub fn pop_all_ready(&self) -> Vec<Tracepoint> {
        let mut inner = self.inner.lock();
        let finished = self.finished.load(Ordering::Acquire);
        let threshold = self.release_threshold(inner.watermark_ns);
        let mut out = Vec::new();
        loop {
            let front_ts = match inner.heap.peek() {
                Some(Reverse(front)) => front.timestamp_ns,
                None => break,
            };
            if !finished && front_ts > threshold {
                break;
            }
            if let Some(tp) = self.pop_front_locked(&mut inner) {
                out.push(tp);
            }
        }
        out
    }

    /// A snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let inner = self.inner.lock();
        let mut stats = inner.stats;
        stats.current_size = inner.heap.len() as u64;
        stats.watermark_ns = inner.watermark_ns;
        stats
    }
}
