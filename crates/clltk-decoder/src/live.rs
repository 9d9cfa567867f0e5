//! Live streaming decoder.
//!
//! Two cooperating tasks per session: a poller thread drains every
//! monitored ring buffer (busiest first) into the [`OrderedBuffer`],
//! and the sink emits whatever the watermark releases, in timestamp
//! order, batching flushes.
//!
//! The watermark follows the highest timestamp seen across all inputs.
//! While data is pending it stays there, holding recent events back by
//! the ordering delay; once a poll cycle finds nothing pending, no
//! older event can arrive any more and the watermark jumps ahead by
//! the delay so everything buffered drains.
//!
//! Cancellation is cooperative: a process-wide stop flag (typically
//! set from a signal handler installed by the embedding tool) ends the
//! poll loop, the ordered buffer is finished, and the sink flushes the
//! remainder.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{DecodeError, Result};
use crate::ordered_buffer::{OrderedBuffer, Stats};
use crate::render;
use crate::sync::SyncTracebuffer;
use crate::tracebuffer_file::is_tracebuffer;
use crate::tracepoint::Tracepoint;

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Requests cooperative shutdown of every live session in the process.
/// Safe to call from a signal handler.
pub fn request_stop() {
    STOP_REQUESTED.store(true, Ordering::Release);
}

/// Whether shutdown was requested.
#[must_use]
pub fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::Acquire)
}

/// Re-arms the stop flag, e.g. between two sessions in one process.
pub fn reset_stop() {
    STOP_REQUESTED.store(false, Ordering::Release);
}

/// Acceptance predicates for a live session.
type NameFilter = Box<dyn Fn(&str) -> bool + Send + Sync>;
type PointFilter = Box<dyn Fn(&Tracepoint) -> bool + Send + Sync>;

/// Configuration of one live session.
pub struct LiveConfig {
    /// Tracebuffer file or directory to monitor.
    pub input: PathBuf,
    /// Ordered-buffer bound; oldest entries are dropped beyond it
    /// (0 = unbounded).
    pub buffer_size: usize,
    /// Reordering window in milliseconds.
    pub order_delay_ms: u64,
    /// Idle sleep between poll cycles in milliseconds.
    pub poll_interval_ms: u64,
    /// Stop after this long without any event (0 = run until stopped).
    pub timeout_ms: u64,
    /// Emit JSON objects instead of text lines.
    pub json: bool,
    /// Skip events already recorded; only stream new ones.
    pub start_from_now: bool,
    /// Monitor only tracebuffers whose name passes.
    pub name_filter: Option<NameFilter>,
    /// Emit only tracepoints that pass.
    pub tracepoint_filter: Option<PointFilter>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            buffer_size: 100_000,
            order_delay_ms: 25,
            poll_interval_ms: 5,
            timeout_ms: 0,
            json: false,
            start_from_now: false,
            name_filter: None,
            tracepoint_filter: None,
        }
    }
}

impl std::fmt::Debug for LiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConfig")
            .field("input", &self.input)
            .field("buffer_size", &self.buffer_size)
            .field("order_delay_ms", &self.order_delay_ms)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("timeout_ms", &self.timeout_ms)
            .field("json", &self.json)
            .field("start_from_now", &self.start_from_now)
            .finish_non_exhaustive()
    }
}

/// End-of-session statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveStats {
    /// Tracepoints the poller pulled out of ring buffers.
    pub tracepoints_read: u64,
    /// Tracepoints the sink emitted.
    pub tracepoints_output: u64,
    /// Final ordered-buffer counters.
    pub buffer: Stats,
}

/// One live decoding session.
#[derive(Debug)]
pub struct LiveDecoder {
    config: LiveConfig,
}

impl LiveDecoder {
    /// A session over `config`.
    #[must_use]
    pub fn new(config: LiveConfig) -> Self {
        Self { config }
    }

    /// Discovers the monitored tracebuffers.
    fn discover(&self) -> Result<Vec<SyncTracebuffer>> {
        let mut found = Vec::new();
        let accepts = |name: &str| {
            self.config
                .name_filter
                .as_ref()
                .is_none_or(|filter| filter(name))
        };

        if self.config.input.is_dir() {
            for entry in std::fs::read_dir(&self.config.input)?.filter_map(std::result::Result::ok)
            {
                let path = entry.path();
                if !is_tracebuffer(&path) {
                    continue;
                }
                match SyncTracebuffer::open(&path) {
                    Ok(tb) if accepts(tb.name()) => found.push(tb),
                    Ok(_) => {}
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "skipping tracebuffer")
                    }
                }
            }
        } else if is_tracebuffer(&self.config.input) {
            let tb = SyncTracebuffer::open(&self.config.input)?;
            if accepts(tb.name()) {
                found.push(tb);
            }
        }

        if found.is_empty() {
            return Err(DecodeError::InvalidTracebuffer(format!(
                "no tracebuffers found under {}",
                self.config.input.display()
            )));
        }
        Ok(found)
    }

    /// Runs the session until stop, timeout or a sink failure, writing
    /// decoded tracepoints to `out`.
    pub fn run<W: Write>(self, out: &mut W) -> Result<LiveStats> {
        let mut tracebuffers = self.discover()?;
        debug!(count = tracebuffers.len(), "monitoring tracebuffers");

        if self.config.start_from_now {
            for tb in &mut tracebuffers {
                tb.skip_to_end();
            }
        }

        let name_width = tracebuffers
            .iter()
            .map(|tb| tb.name().len())
            .chain(std::iter::once("tracebuffer".len()))
            .max()
            .unwrap_or(11);
        if !self.config.json {
            writeln!(out, "{}", render::text_header(name_width))?;
        }

        let buffer = OrderedBuffer::new(
            self.config.buffer_size,
            self.config.order_delay_ms * 1_000_000,
        );

        // Session-local stop: lets a failing sink end the poller even
        // when the process-wide flag never fires.
        let session_stop = AtomicBool::new(false);
        let (read, output) = std::thread::scope(|scope| {
            let poller = scope.spawn(|| {
                poll_loop(&mut tracebuffers, &buffer, &self.config, &session_stop)
            });
            let output = sink_loop(&buffer, out, self.config.json, name_width);
            if output.is_err() {
                session_stop.store(true, Ordering::Release);
            }
            let read = poller.join().unwrap_or(0);
            (read, output)
        });

        Ok(LiveStats {
            tracepoints_read: read,
            tracepoints_output: output?,
            buffer: buffer.stats(),
        })
    }
}

/// Poller: drain pending buffers busiest-first, publish the watermark,
/// sleep when idle.
fn poll_loop(
    tracebuffers: &mut [SyncTracebuffer],
    buffer: &OrderedBuffer,
    config: &LiveConfig,
    session_stop: &AtomicBool,
) -> u64 {
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let order_delay_ns = config.order_delay_ms * 1_000_000;
    let idle_timeout =
        (config.timeout_ms > 0).then(|| Duration::from_millis(config.timeout_ms));
    let filter = config.tracepoint_filter.as_ref();
    let stopped = || stop_requested() || session_stop.load(Ordering::Acquire);

    let mut last_activity = Instant::now();
    let mut max_seen_ts = 0u64;
    let mut total_read = 0u64;

    while !stopped() {
        let mut pending: Vec<(u64, usize)> = tracebuffers
            .iter()
            .enumerate()
            .filter_map(|(index, tb)| {
                let bytes = tb.pending();
                (bytes > 0).then_some((bytes, index))
            })
            .collect();
        let any_pending = !pending.is_empty();
        // Busiest buffers first, so the fullest rings drain before
        // their writers lap them.
        pending.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        'buffers: for &(_, index) in &pending {
            let tb = &mut tracebuffers[index];
            while let Some(tp) =
                tb.next(filter.map(|f| &**f as &dyn Fn(&Tracepoint) -> bool))
            {
                max_seen_ts = max_seen_ts.max(tp.timestamp_ns);
                buffer.push(tp);
                total_read += 1;
                last_activity = Instant::now();
                if stopped() {
                    break 'buffers;
                }
            }
        }

        if any_pending {
            // Recent events may still be reordered by other buffers;
            // hold them back by the delay window.
            buffer.update_watermark(max_seen_ts);
        } else {
            if max_seen_ts > 0 {
                // Nothing older can arrive: release everything seen.
                buffer.update_watermark(max_seen_ts.saturating_add(order_delay_ns));
            }
            if let Some(timeout) = idle_timeout {
                if last_activity.elapsed() > timeout {
                    debug!(timeout_ms = config.timeout_ms, "live session idle timeout");
                    break;
                }
            }
            std::thread::sleep(poll_interval);
        }
    }

    buffer.finish();
    total_read
}

/// Sink: wait for released tracepoints, emit them, flush per batch.
fn sink_loop<W: Write>(
    buffer: &OrderedBuffer,
    out: &mut W,
    json: bool,
    name_width: usize,
) -> std::io::Result<u64> {
    let mut total = 0u64;
    while !buffer.finished() {
        let Some(first) = buffer.pop(Duration::from_millis(100)) else {
            continue;
        };
        let mut batch = vec![first];
        batch.extend(buffer.pop_all_ready());
        for tp in &batch {
            if json {
                writeln!(out, "{}", render::json_object(tp))?;
            } else {
                writeln!(out, "{}", render::text_line(tp, name_width))?;
            }
        }
        out.flush()?;
        total += batch.len() as u64;
    }
    if let Err(e) = out.flush() {
        warn!(error = %e, "final flush failed");
    }
    Ok(total)
}
