//! Snapshot reading: drain whole tracebuffers into sorted collections.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use clltk_core::layout::SourceType;

use crate::archive::Archive;
use crate::sync::{SyncTracebuffer, TracepointFilter};
use crate::tracebuffer_file::is_tracebuffer;
use crate::tracepoint::Tracepoint;

/// File inside snapshot archives carrying tracepoints that never lived
/// in a ring buffer.
pub const ADDITIONAL_TRACEPOINTS_FILE: &str = "additional_tracepoints.json";

/// Per-tracebuffer acceptance predicate for collection walks.
pub type TracebufferFilter<'f> = &'f dyn Fn(&SnapTracebuffer) -> bool;

/// One fully drained tracebuffer, sorted by timestamp.
#[derive(Debug)]
pub struct SnapTracebuffer {
    name: String,
    path: PathBuf,
    source_type: SourceType,
    size: u64,
    /// Decoded tracepoints in ascending timestamp order (ties keep
    /// their insert order).
    pub tracepoints: Vec<Tracepoint>,
}

impl SnapTracebuffer {
    /// Drains the tracebuffer at `path`: every entry present when the
    /// drain started is decoded, filtered and sorted by timestamp.
    ///
    /// Returns `None` when the file is not a readable tracebuffer.
    #[must_use]
    pub fn make(path: &Path, filter: Option<TracepointFilter<'_>>) -> Option<Self> {
        let mut sync = match SyncTracebuffer::open(path) {
            Ok(sync) => sync,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping unreadable tracebuffer");
                return None;
            }
        };

        let name = sync.name().to_owned();
        let size = sync.size();
        let source_type = sync.source_type();
        let top_nr = sync.current_top_entries_nr();

        let mut tracepoints = Vec::new();
        while let Some(tp) = sync.next(None) {
            if tp.nr > top_nr {
                break;
            }
            if filter.is_none_or(|f| f(&tp)) {
                tracepoints.push(tp);
            }
        }

        // Stable: events with equal timestamps keep ring order.
        tracepoints.sort_by_key(|tp| tp.timestamp_ns);

        Some(Self {
            name,
            path: path.to_owned(),
            source_type,
            size,
            tracepoints,
        })
    }

    /// The tracebuffer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path the tracebuffer was read from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where this buffer's events come from.
    #[must_use]
    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    /// Usable ring capacity in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Collects every tracebuffer reachable from `path`: a single
    /// file, a directory (recursed), or a snapshot archive (unpacked
    /// and recursed). Unreadable candidates are skipped.
    #[must_use]
    pub fn collect(
        path: &Path,
        tracebuffer_filter: Option<TracebufferFilter<'_>>,
        tracepoint_filter: Option<TracepointFilter<'_>>,
    ) -> Vec<Self> {
        let mut out = Vec::new();
        if !path.exists() {
            return out;
        }
        if path.is_dir() {
            collect_dir(path, &mut out, tracebuffer_filter, tracepoint_filter);
        } else {
            match Archive::open(path) {
                Ok(Some(archive)) => {
                    collect_dir(archive.dir(), &mut out, tracebuffer_filter, tracepoint_filter);
                }
                Ok(None) => {
                    if is_tracebuffer(path) {
                        if let Some(tb) = Self::make(path, tracepoint_filter) {
                            if tracebuffer_filter.is_none_or(|f| f(&tb)) {
                                out.push(tb);
                            }
                        }
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "could not unpack archive"),
            }
        }
        out
    }
}

fn collect_dir(
    dir: &Path,
    out: &mut Vec<SnapTracebuffer>,
    tracebuffer_filter: Option<TracebufferFilter<'_>>,
    tracepoint_filter: Option<TracepointFilter<'_>>,
) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if path.is_dir() {
            collect_dir(&path, out, tracebuffer_filter, tracepoint_filter);
        } else if is_tracebuffer(&path) {
            if let Some(tb) = SnapTracebuffer::make(&path, tracepoint_filter) {
                if tracebuffer_filter.is_none_or(|f| f(&tb)) {
                    out.push(tb);
                }
            }
        } else if path.file_name().is_some_and(|n| n == ADDITIONAL_TRACEPOINTS_FILE) {
            if let Some(tb) = load_additional(&path, tracepoint_filter) {
                if tracebuffer_filter.is_none_or(|f| f(&tb)) {
                    out.push(tb);
                }
            }
        }
    }
}

/// Entry shape of `additional_tracepoints.json`.
#[derive(Debug, Deserialize)]
struct AdditionalTracepoint {
    timestamp: u64,
    formatted: String,
}

/// Reads an `additional_tracepoints.json` into a synthetic tracebuffer
/// of virtual tracepoints.
fn load_additional(
    path: &Path,
    filter: Option<TracepointFilter<'_>>,
) -> Option<SnapTracebuffer> {
    let raw = std::fs::read(path).ok()?;
    let parsed: Vec<AdditionalTracepoint> = match serde_json::from_slice(&raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed additional tracepoints");
            return None;
        }
    };

    let name: std::sync::Arc<str> = std::sync::Arc::from("additional_tracepoints");
    let mut tracepoints: Vec<Tracepoint> = parsed
        .into_iter()
        .map(|a| Tracepoint::new_virtual(std::sync::Arc::clone(&name), a.timestamp, a.formatted))
        .filter(|tp| filter.is_none_or(|f| f(tp)))
        .collect();
    tracepoints.sort_by_key(|tp| tp.timestamp_ns);

    Some(SnapTracebuffer {
        name: name.to_string(),
        path: path.to_owned(),
        source_type: SourceType::Unknown,
        size: 0,
        tracepoints,
    })
}
