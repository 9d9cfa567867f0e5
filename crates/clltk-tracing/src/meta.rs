//! Call-site descriptors and metadata blob construction.
//!
//! Every static tracepoint has a [`TracepointSite`]: the source
//! location, format string and declared argument types, fixed for the
//! life of the program. On first use the site's metadata blob is
//! published through the unique stack and the returned offset cached,
//! so later events carry only the 48-bit reference.

use std::sync::OnceLock;

use clltk_core::layout::{ArgType, MetaType, META_MAGIC, META_MAX_ARGS};

use crate::args::tighten_types;

/// One static tracepoint call site.
///
/// Sites are usually `static` so the publication cache lives as long
/// as the program:
///
/// ```
/// use clltk_core::layout::ArgType;
/// use clltk_tracing::TracepointSite;
///
/// static SITE: TracepointSite =
///     TracepointSite::new(file!(), line!(), "hello %s", &[ArgType::Str]);
/// ```
pub struct TracepointSite {
    /// Source file of the call site.
    pub file: &'static str,
    /// Source line of the call site.
    pub line: u32,
    /// printf-style format string (dump message for dump sites).
    pub format: &'static str,
    /// Declared argument types, in order.
    pub arg_types: &'static [ArgType],
    pub(crate) state: OnceLock<SiteState>,
}

/// Cached first-use results of a site.
pub(crate) struct SiteState {
    /// Unique-stack offset of the published blob, or the invalid
    /// marker when publication failed.
    pub in_file_offset: u64,
    /// Declared types after reconciliation with the format string.
    pub packed_types: Vec<ArgType>,
}

impl TracepointSite {
    /// Describes a printf-style call site.
    #[must_use]
    pub const fn new(
        file: &'static str,
        line: u32,
        format: &'static str,
        arg_types: &'static [ArgType],
    ) -> Self {
        Self {
            file,
            line,
            format,
            arg_types,
            state: OnceLock::new(),
        }
    }

    /// Builds this site's metadata blob.
    #[must_use]
    pub(crate) fn build_blob(&self, meta_type: MetaType) -> Vec<u8> {
        build_meta_blob(
            meta_type,
            self.line,
            self.arg_types,
            self.file,
            self.format,
        )
    }

    /// The packing types for this site, tightened against the format
    /// string. Computed lazily together with the publication.
    pub(crate) fn tightened_types(&self) -> Vec<ArgType> {
        tighten_types(self.format, self.arg_types)
    }
}

impl std::fmt::Debug for TracepointSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracepointSite")
            .field("file", &self.file)
            .field("line", &self.line)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

/// Serialises one metadata blob:
///
/// ```text
/// '{' | size u32 | type u8 | line u32 | argc u8 |
/// types[argc]\0 | file\0 | format\0
/// ```
///
/// `size` covers the whole blob. The argument count is clamped to the
/// format's limit of ten.
#[must_use]
pub fn build_meta_blob(
    meta_type: MetaType,
    line: u32,
    arg_types: &[ArgType],
    file: &str,
    format: &str,
) -> Vec<u8> {
    let arg_count = arg_types.len().min(META_MAX_ARGS);
    let total = 1 + 4 + 1 + 4 + 1 + (arg_count + 1) + (file.len() + 1) + (format.len() + 1);

    let mut blob = Vec::with_capacity(total);
    blob.push(META_MAGIC);
    #[allow(clippy::cast_possible_truncation)] // bounded by format limits
    blob.extend_from_slice(&(total as u32).to_le_bytes());
    blob.push(meta_type as u8);
    blob.extend_from_slice(&line.to_le_bytes());
    #[allow(clippy::cast_possible_truncation)] // clamped to 10
    blob.push(arg_count as u8);
    for ty in &arg_types[..arg_count] {
        blob.push(ty.code());
    }
    blob.push(0);
    blob.extend_from_slice(file.as_bytes());
    blob.push(0);
    blob.extend_from_slice(format.as_bytes());
    blob.push(0);
    debug_assert_eq!(blob.len(), total);
    blob
}
