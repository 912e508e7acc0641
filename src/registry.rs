//! Format registry and header dispatch.
//!
//! Every recognizable format is a [`Format`] trait object.  Registration
//! builds one dispatch table per distinct signature offset, each with 256
//! buckets keyed on `window[offset]`, so a probe touches only the
//! recognizers whose trigger byte matches.  A candidate must then match its
//! full literal and pass `header_check` before a recovery is proposed.
//!
//! The registry is an immutable input to a carving session: the enabled set
//! is fixed at build time and recorded in checkpoints.

use std::io::{self, Read, Seek};
use std::sync::Arc;

// ── Descriptors ──────────────────────────────────────────────────────────────

/// Per-format descriptor.
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Default filename extension; also the format's identifier in sessions
    /// and reports.
    pub extension:    &'static str,
    /// Human description for logging.
    pub description:  &'static str,
    /// Largest plausible file, in bytes.  0 = unbounded.
    pub max_filesize: u64,
    /// Materialize recovered payloads on disk; `false` logs and counts only.
    pub recover:      bool,
}

/// A registered magic: `bytes` must appear at `offset` within the window.
/// `bytes[0]` at `offset` is the dispatch trigger.
#[derive(Debug, Clone, Copy)]
pub struct Signature {
    pub offset: usize,
    pub bytes:  &'static [u8],
}

/// Verdict returned by a [`DataCheck`] for each appended block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataVerdict {
    /// Block accepted; keep carving.
    Continue,
    /// Normal end of file reached.
    Stop,
    /// Content is invalid; discard the file.
    Error,
    /// No further content validation; fall back to header scanning.
    Scan,
}

/// Everything the engine sees when validating appended content.
///
/// `window` is the previous block followed by the current block
/// (`2 * blocksize` bytes); `file_size` is the byte count committed before
/// the current block.  `calculated_size` is the format's running estimate of
/// the exact payload length; the generic `file_check` truncates to it.
pub struct DataCheckCtx<'a> {
    pub window:          &'a [u8],
    pub blocksize:       u64,
    pub file_size:       u64,
    pub calculated_size: &'a mut u64,
}

/// Stateful per-file content validator.  A fresh instance is produced by
/// `header_check` for every adopted recovery and lives in the active-file
/// state until finalization.
pub trait DataCheck: Send {
    fn check(&mut self, cx: &mut DataCheckCtx<'_>) -> DataVerdict;
}

/// Successful header validation: the template for a new recovery.
pub struct Candidate {
    pub extension:      &'static str,
    pub data_check:     Option<Box<dyn DataCheck>>,
    /// Run the format's `file_check` at finalization (paranoid mode).
    pub use_file_check: bool,
}

/// `Read + Seek` object handed to `file_check` finalizers.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// A pluggable format recognizer.
pub trait Format: Send + Sync {
    fn stat(&self) -> &FileStat;

    /// Registered magics.  Dispatch consults these before `header_check`.
    fn signatures(&self) -> &[Signature];

    /// Validate a candidate header at the window start.  `window` is at
    /// least 64 KiB (or one block, if larger).
    fn header_check(&self, window: &[u8]) -> Option<Candidate>;

    /// Finalization hook: may shrink the file (return a smaller size) or
    /// reject it outright (return 0).  Only invoked in paranoid mode and
    /// when the adopting [`Candidate`] set `use_file_check`.
    fn file_check(
        &self,
        handle: &mut dyn ReadSeek,
        file_size: u64,
        calculated_size: u64,
    ) -> io::Result<u64> {
        let _ = (handle, calculated_size);
        Ok(file_size)
    }

    /// Streaming bypass: when this format is active and the bytes just
    /// before the cursor re-validate as a continuation of the current file,
    /// header dispatch is skipped for the offset.  TAR uses this to avoid
    /// adopting member headers inside the tarball.
    fn continuation_check(&self, lookbehind: &[u8]) -> bool {
        let _ = lookbehind;
        false
    }

    /// Side-effect hook invoked when a header of this format is adopted;
    /// the FAT-directory pseudo-format logs directory entries here.
    fn log_contents(&self, window: &[u8], sector: u64) {
        let _ = (window, sector);
    }
}

/// Truncate-to-`calculated_size` policy shared by formats whose `data_check`
/// pins the exact payload end.  0 means the end was never seen: reject.
pub(crate) fn truncate_to_calculated(file_size: u64, calculated_size: u64) -> u64 {
    if calculated_size == 0 {
        0
    } else {
        calculated_size.min(file_size)
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

/// Index of a format within its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatId(pub(crate) usize);

struct Probe {
    format: usize,
    sig:    usize,
}

struct DispatchTable {
    offset:  usize,
    buckets: Box<[Vec<Probe>; 256]>,
}

pub struct FormatRegistry {
    formats: Vec<Arc<dyn Format>>,
    tables:  Vec<DispatchTable>,
}

impl FormatRegistry {
    pub fn builder() -> FormatRegistryBuilder {
        FormatRegistryBuilder { formats: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    pub fn get(&self, id: FormatId) -> &dyn Format {
        &*self.formats[id.0]
    }

    pub(crate) fn get_arc(&self, id: FormatId) -> Arc<dyn Format> {
        Arc::clone(&self.formats[id.0])
    }

    pub fn iter(&self) -> impl Iterator<Item = (FormatId, &dyn Format)> {
        self.formats.iter().enumerate().map(|(i, f)| (FormatId(i), &**f))
    }

    /// Enabled format identifiers, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.formats.iter().map(|f| f.stat().extension.to_string()).collect()
    }

    /// Run header dispatch against `window`.  Returns the first candidate in
    /// registration order whose literal matches and whose `header_check`
    /// accepts.
    pub fn probe(&self, window: &[u8]) -> Option<(FormatId, Candidate)> {
        for table in &self.tables {
            if table.offset >= window.len() {
                continue;
            }
            let key = window[table.offset] as usize;
            for probe in &table.buckets[key] {
                let format = &self.formats[probe.format];
                let sig = format.signatures()[probe.sig];
                let end = sig.offset + sig.bytes.len();
                if end <= window.len() && &window[sig.offset..end] == sig.bytes {
                    if let Some(candidate) = format.header_check(window) {
                        return Some((FormatId(probe.format), candidate));
                    }
                }
            }
        }
        None
    }
}

pub struct FormatRegistryBuilder {
    formats: Vec<Arc<dyn Format>>,
}

impl FormatRegistryBuilder {
    pub fn register(mut self, format: Arc<dyn Format>) -> Self {
        debug_assert!(
            format.signatures().iter().all(|s| !s.bytes.is_empty()),
            "signatures need at least a trigger byte"
        );
        self.formats.push(format);
        self
    }

    pub fn build(self) -> FormatRegistry {
        let mut tables: Vec<DispatchTable> = Vec::new();
        for (fi, format) in self.formats.iter().enumerate() {
            for (si, sig) in format.signatures().iter().enumerate() {
                let ti = match tables.iter().position(|t| t.offset == sig.offset) {
                    Some(i) => i,
                    None => {
                        tables.push(DispatchTable {
                            offset:  sig.offset,
                            buckets: Box::new(std::array::from_fn(|_| Vec::new())),
                        });
                        tables.len() - 1
                    }
                };
                tables[ti].buckets[sig.bytes[0] as usize].push(Probe { format: fi, sig: si });
            }
        }
        FormatRegistry { formats: self.formats, tables }
    }
}
