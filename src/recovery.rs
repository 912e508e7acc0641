//! Active-file state and the finalization pipeline.
//!
//! [`FileRecovery`] is the carving context for the one file currently being
//! written: format, start offset, committed size, the list of appended
//! blocks (needed to return freed blocks to the search space when a
//! finalizer truncates or rejects), the write handle and the format's
//! stateful `data_check` continuation.
//!
//! Finalization ([`finish`]) closes, truncates, or discards the file and
//! releases its claim on the search space.  Truncation is what arms
//! backtracking: blocks beyond the final size go back into the space so a
//! header that sat inside the over-claimed region can be carved next.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::registry::{Candidate, DataCheck, DataCheckCtx, DataVerdict, Format, FormatId};
use crate::search_space::SearchSpace;

// ── Status codes ─────────────────────────────────────────────────────────────

/// Scan-level termination status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// Search space exhausted.
    Complete,
    /// Stop flag raised by the embedder or a signal.
    Stopped,
    /// Output file could not be created.
    OutputDenied,
    /// Output filesystem ran out of space.
    OutputFull,
}

/// Per-file finalization result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishStatus {
    /// Nothing recovered; no artifact remains.
    Bad,
    /// File recovered as written.
    Ok,
    /// File recovered but shrunk; freed blocks returned to the search space.
    Truncated,
}

/// Manifest entry for one recovered file.
#[derive(Debug, Clone)]
pub struct RecoveredFile {
    pub path:   PathBuf,
    pub start:  u64,
    pub size:   u64,
    pub format: &'static str,
    /// BLAKE3 of the recovered payload, hex-encoded.
    pub hash:   String,
}

// ── FileRecovery ─────────────────────────────────────────────────────────────

pub struct FileRecovery {
    format:             Option<(FormatId, Arc<dyn Format>)>,
    /// Disk offset where the header was found.  Survives `reset` — the
    /// backtracking policy reads it after finalization.
    pub location_start: u64,
    /// Bytes committed so far; always a multiple of `blocksize` until a
    /// finalizer truncates.
    pub file_size:      u64,
    /// Format-maintained estimate of the exact payload end; 0 = unknown.
    pub calculated_size: u64,
    pub blocksize:      u64,
    handle:             Option<File>,
    filename:           PathBuf,
    extension:          &'static str,
    data_check:         Option<Box<dyn DataCheck>>,
    use_file_check:     bool,
    /// Appended blocks in disk order: `(offset, carries_content)`.
    /// Skipped indirect blocks are recorded with `false`.
    blocks:             Vec<(u64, bool)>,
}

impl FileRecovery {
    pub fn idle(blocksize: u64) -> Self {
        Self {
            format:          None,
            location_start:  0,
            file_size:       0,
            calculated_size: 0,
            blocksize,
            handle:          None,
            filename:        PathBuf::new(),
            extension:       "",
            data_check:      None,
            use_file_check:  false,
            blocks:          Vec::new(),
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.format.is_some()
    }

    pub fn format_id(&self) -> Option<FormatId> {
        self.format.as_ref().map(|(id, _)| *id)
    }

    pub fn extension(&self) -> &'static str {
        self.extension
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// `max_filesize` of the active format; 0 when idle or unbounded.
    pub fn max_filesize(&self) -> u64 {
        self.format.as_ref().map_or(0, |(_, f)| f.stat().max_filesize)
    }

    pub fn wants_output(&self) -> bool {
        self.format.as_ref().is_some_and(|(_, f)| f.stat().recover)
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    pub fn continuation_check(&self, lookbehind: &[u8]) -> bool {
        self.format.as_ref().is_some_and(|(_, f)| f.continuation_check(lookbehind))
    }

    /// Become the active recovery for a freshly matched header.
    pub fn adopt(&mut self, id: FormatId, format: Arc<dyn Format>, candidate: Candidate, start: u64) {
        self.extension = if candidate.extension.is_empty() {
            format.stat().extension
        } else {
            candidate.extension
        };
        self.data_check = candidate.data_check;
        self.use_file_check = candidate.use_file_check;
        self.format = Some((id, format));
        self.location_start = start;
        self.file_size = 0;
        self.calculated_size = 0;
        self.handle = None;
        self.filename = PathBuf::new();
        self.blocks.clear();
    }

    /// Open the output file.  Retried on Windows, where a live antivirus may
    /// briefly hold freshly created files.
    pub fn open_output(&mut self, path: PathBuf) -> io::Result<()> {
        let handle = create_with_retry(&path)?;
        self.handle = Some(handle);
        self.filename = path;
        Ok(())
    }

    /// Write one block through the handle, if any.
    pub fn write_block(&mut self, block: &[u8]) -> io::Result<()> {
        if let Some(handle) = self.handle.as_mut() {
            io::Write::write_all(handle, block)?;
        }
        Ok(())
    }

    pub fn push_block(&mut self, offset: u64, carries_content: bool) {
        self.blocks.push((offset, carries_content));
    }

    /// Run the format's content validator over `window` (previous block +
    /// current block).  Without a validator every block is accepted.
    pub fn run_data_check(&mut self, window: &[u8]) -> DataVerdict {
        let Some(mut check) = self.data_check.take() else {
            return DataVerdict::Continue;
        };
        let mut cx = DataCheckCtx {
            window,
            blocksize:       self.blocksize,
            file_size:       self.file_size,
            calculated_size: &mut self.calculated_size,
        };
        let verdict = check.check(&mut cx);
        self.data_check = Some(check);
        verdict
    }

    /// Back to idle.  `location_start` and `blocksize` survive for the
    /// backtracking policy.
    fn reset(&mut self) {
        self.format = None;
        self.file_size = 0;
        self.calculated_size = 0;
        self.handle = None;
        self.filename = PathBuf::new();
        self.extension = "";
        self.data_check = None;
        self.use_file_check = false;
        self.blocks.clear();
    }
}

// ── Finalization ─────────────────────────────────────────────────────────────

/// Close, shrink, or discard the active file.
///
/// Returns the finalization status and, when something was recovered, its
/// manifest entry.  Idle input returns `Bad` with no side effects.
pub(crate) fn finish(
    rec: &mut FileRecovery,
    paranoid: bool,
    search: &mut SearchSpace,
) -> (FinishStatus, Option<RecoveredFile>) {
    let Some((_, format)) = rec.format.as_ref().map(|(id, f)| (*id, Arc::clone(f))) else {
        return (FinishStatus::Bad, None);
    };

    // Empty or count-only: nothing to keep.
    if rec.file_size == 0 || !format.stat().recover {
        discard_artifact(rec);
        rec.reset();
        return (FinishStatus::Bad, None);
    }

    let mut final_size = rec.file_size;
    let mut status = FinishStatus::Ok;

    if rec.use_file_check && paranoid {
        if let Some(handle) = rec.handle.as_mut() {
            match format.file_check(handle, rec.file_size, rec.calculated_size) {
                Ok(0) => {
                    // Rejected outright: everything goes back to the space.
                    return_blocks(search, &rec.blocks, rec.blocksize, 0);
                    discard_artifact(rec);
                    rec.reset();
                    return (FinishStatus::Bad, None);
                }
                Ok(size) if size < rec.file_size => {
                    final_size = size;
                    status = FinishStatus::Truncated;
                }
                Ok(_) => {}
                Err(e) => {
                    log::warn!("file check failed on {}: {e}", rec.filename.display());
                }
            }
        }
    }

    if status == FinishStatus::Truncated {
        if let Some(handle) = rec.handle.as_ref() {
            if let Err(e) = handle.set_len(final_size) {
                log::warn!("cannot truncate {}: {e}", rec.filename.display());
            }
        }
        return_blocks(search, &rec.blocks, rec.blocksize, final_size);
    }

    let hash = rec
        .handle
        .as_mut()
        .and_then(|h| hash_payload(h, final_size).ok())
        .map(|digest| hex::encode(digest))
        .unwrap_or_default();

    let entry = RecoveredFile {
        path:   rec.filename.clone(),
        start:  rec.location_start,
        size:   final_size,
        format: rec.extension,
        hash,
    };
    log::debug!(
        "recovered {} ({} B) at {:#x}",
        entry.path.display(),
        entry.size,
        entry.start
    );
    rec.reset();
    (status, Some(entry))
}

/// Cancellation: return every appended block, close, and unlink.  The output
/// directory ends up as if the file had never been opened.
pub(crate) fn abort_discard(rec: &mut FileRecovery, search: &mut SearchSpace) {
    if !rec.is_active() {
        return;
    }
    return_blocks(search, &rec.blocks, rec.blocksize, 0);
    discard_artifact(rec);
    rec.reset();
}

/// Out-of-space: keep what was written (the partial file may still be
/// valuable evidence); consumed blocks stay consumed.
pub(crate) fn abort_keep_partial(rec: &mut FileRecovery) {
    if !rec.is_active() {
        return;
    }
    rec.reset();
}

/// Re-insert appended blocks whose payload position is at or beyond
/// `keep_content_bytes`.  Content-free (skipped) blocks follow the content
/// position around them.
fn return_blocks(search: &mut SearchSpace, blocks: &[(u64, bool)], blocksize: u64, keep_content_bytes: u64) {
    let mut content = 0u64;
    for &(offset, carries_content) in blocks {
        if content >= keep_content_bytes {
            search.insert(offset, offset + blocksize - 1);
        }
        if carries_content {
            content += blocksize;
        }
    }
}

fn discard_artifact(rec: &mut FileRecovery) {
    if rec.handle.take().is_some() {
        if let Err(e) = std::fs::remove_file(&rec.filename) {
            log::warn!("cannot unlink {}: {e}", rec.filename.display());
        }
    }
}

fn hash_payload(handle: &mut File, size: u64) -> io::Result<[u8; 32]> {
    handle.seek(SeekFrom::Start(0))?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut handle.take(size), &mut hasher)?;
    Ok(hasher.finalize().into())
}

fn create_with_retry(path: &Path) -> io::Result<File> {
    let open = || OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path);
    #[cfg(windows)]
    {
        use std::time::Duration;
        for delay in [1u64, 2] {
            match open() {
                Ok(f) => return Ok(f),
                Err(_) => std::thread::sleep(Duration::from_secs(delay)),
            }
        }
    }
    open()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{FileStat, Signature};

    struct Fixed {
        stat:     FileStat,
        truncate: u64,
    }

    impl Format for Fixed {
        fn stat(&self) -> &FileStat {
            &self.stat
        }
        fn signatures(&self) -> &[Signature] {
            &[]
        }
        fn header_check(&self, _window: &[u8]) -> Option<Candidate> {
            None
        }
        fn file_check(
            &self,
            _handle: &mut dyn crate::registry::ReadSeek,
            file_size: u64,
            _calculated: u64,
        ) -> io::Result<u64> {
            Ok(self.truncate.min(file_size))
        }
    }

    fn active_recovery(dir: &Path, truncate: u64, blocks: usize) -> (FileRecovery, SearchSpace) {
        let format: Arc<dyn Format> = Arc::new(Fixed {
            stat: FileStat {
                extension:    "fix",
                description:  "fixture",
                max_filesize: 0,
                recover:      true,
            },
            truncate,
        });
        let mut rec = FileRecovery::idle(512);
        rec.adopt(
            FormatId(0),
            format,
            Candidate { extension: "fix", data_check: None, use_file_check: true },
            0x1000,
        );
        rec.open_output(dir.join("f0000008.fix")).unwrap();

        let mut search = SearchSpace::new(0, 0xF_FFFF);
        let mut cursor = search.cursor_at(0x1000).unwrap();
        for i in 0..blocks {
            rec.write_block(&[i as u8; 512]).unwrap();
            rec.push_block(0x1000 + i as u64 * 512, true);
            cursor = search.consume(cursor, 512);
            rec.file_size += 512;
        }
        (rec, search)
    }

    #[test]
    fn truncation_returns_freed_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, mut search) = active_recovery(dir.path(), 1024, 4);
        let before = search.remaining_bytes();

        let (status, entry) = finish(&mut rec, true, &mut search);
        assert_eq!(status, FinishStatus::Truncated);
        let entry = entry.unwrap();
        assert_eq!(entry.size, 1024);
        assert_eq!(std::fs::metadata(&entry.path).unwrap().len(), 1024);
        // Blocks 2 and 3 went back.
        assert_eq!(search.remaining_bytes(), before + 2 * 512);
        assert!(!rec.is_active());
    }

    #[test]
    fn reject_unlinks_and_returns_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, mut search) = active_recovery(dir.path(), 0, 4);
        let before = search.remaining_bytes();
        let path = rec.filename().to_owned();

        let (status, entry) = finish(&mut rec, true, &mut search);
        assert_eq!(status, FinishStatus::Bad);
        assert!(entry.is_none());
        assert!(!path.exists());
        assert_eq!(search.remaining_bytes(), before + 4 * 512);
    }

    #[test]
    fn empty_file_is_bad_and_leaves_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, mut search) = active_recovery(dir.path(), 0, 4);
        rec.file_size = 0;
        let path = rec.filename().to_owned();
        let (status, entry) = finish(&mut rec, true, &mut search);
        assert_eq!(status, FinishStatus::Bad);
        assert!(entry.is_none());
        assert!(!path.exists());
    }

    #[test]
    fn abort_discard_restores_space_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, mut search) = active_recovery(dir.path(), 0, 4);
        let before = search.remaining_bytes();
        let path = rec.filename().to_owned();
        abort_discard(&mut rec, &mut search);
        assert!(!path.exists());
        assert_eq!(search.remaining_bytes(), before + 4 * 512);
        assert!(!rec.is_active());
    }

    #[test]
    fn abort_keep_partial_keeps_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, _search) = active_recovery(dir.path(), 0, 4);
        let path = rec.filename().to_owned();
        abort_keep_partial(&mut rec);
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * 512);
        assert!(!rec.is_active());
    }

    #[test]
    fn manifest_hash_matches_payload() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, mut search) = active_recovery(dir.path(), u64::MAX, 2);
        let (status, entry) = finish(&mut rec, true, &mut search);
        assert_eq!(status, FinishStatus::Ok);
        let entry = entry.unwrap();
        let mut payload = vec![0u8; 512];
        payload.extend_from_slice(&[1u8; 512]);
        assert_eq!(entry.hash, hex::encode(blake3::hash(&payload).as_bytes()));
    }
}
