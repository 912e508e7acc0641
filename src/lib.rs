//! # recarve — signature-based file carver
//!
//! Reconstructs files from disks and disk images whose filesystem metadata
//! is damaged or gone: scan sectors for recognizable format headers, follow
//! each format's framing rules to find the file's extent, and stream the
//! payload into an output directory.
//!
//! Engine guarantees:
//! - Blocks are appended to a recovery in strictly increasing disk order;
//!   every appended byte is removed from the search space
//! - A finalization completes before any later header is adopted; truncated
//!   finalizations return their freed blocks and arm backtracking (capped
//!   at 5 consecutive rewinds per file)
//! - Read errors never abort a scan: short reads are logged and zero-padded
//! - Checkpoints are written atomically (write-then-rename) and a resumed
//!   scan recovers the same remaining files as an uninterrupted one
//! - The loop is single-threaded and cooperative; cancellation is one
//!   atomic flag polled at the per-second progress tick

pub mod buffer;
pub mod disk;
pub mod engine;
pub mod ext2;
pub mod formats;
pub mod recovery;
pub mod registry;
pub mod search_space;
pub mod session;

// Flat re-exports for the most common types.
pub use disk::{DiskReader, ImageReader, DEFAULT_SECTOR_SIZE};
pub use engine::{CarveEngine, CheckpointFn, Options, Params, Phase, ProgressFn};
pub use recovery::{FinishStatus, RecoveredFile, ScanStatus};
pub use registry::{
    Candidate, DataCheck, DataCheckCtx, DataVerdict, FileStat, Format, FormatId, FormatRegistry,
    Signature,
};
pub use search_space::{Cursor, Interval, SearchSpace};
pub use session::{Session, SessionError};
