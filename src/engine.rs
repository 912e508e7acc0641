//! The carving engine — scan, dispatch, append, backtrack, checkpoint.
//!
//! # The loop
//!
//! Each iteration works on one block at the cursor:
//!
//! 1. Probe the dispatcher for a header (unless the active format's
//!    streaming bypass suppresses it).  A hit finalizes the current file and
//!    adopts the new one — except after a truncated finalization, where
//!    adoption is deferred so backtracking can re-walk the freed region.
//! 2. While a file is active, append the block: write it through, consume it
//!    from the search space, and let the format's `data_check` rule on it.
//!    In ext2 phases, blocks that look like indirect blocks are consumed but
//!    not written.
//! 3. On `Stop`/`Error` (or the size caps) finalize.  After a truncation, or
//!    a finalization that left the engine idle, rewind to the most recent
//!    still-in-space candidate header (at most 5 consecutive rewinds), else
//!    jump just past the finalized file's start.
//! 4. Slide the read buffer; on any discontinuity reset and refill it.  Once
//!    a second, update progress, poll the stop flag, and run the checkpoint
//!    when due.
//!
//! Everything runs on the caller's thread; the only shared state is the
//! stop flag.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::SlidingBuffer;
use crate::disk::DiskReader;
use crate::ext2::is_indirect_block;
use crate::recovery::{
    abort_discard, abort_keep_partial, finish, FileRecovery, FinishStatus, RecoveredFile,
    ScanStatus,
};
use crate::registry::{DataVerdict, FormatId, FormatRegistry};
use crate::search_space::{Cursor, SearchSpace};

// ── Tuning ───────────────────────────────────────────────────────────────────

/// Consecutive header rewinds allowed per backtrack run.
const MAX_BACKTRACK: u32 = 5;

/// ext2 keeps this many direct blocks before the first indirect block.
const EXT2_DIRECT_BLOCKS: u64 = 12;

/// FAT cannot hold files of 4 GiB or more.
const FAT_MAX_FILE_SIZE: u64 = 0xFFFF_FFFF;

/// Recovered files per output subdirectory before rotating.
pub const FILES_PER_DIR: u32 = 500;

const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5 * 60);
const CHECKPOINT_INTERVAL_RELAXED: Duration = Duration::from_secs(15 * 60);
const CHECKPOINT_SLOW_SAVE: Duration = Duration::from_secs(30);

// ── Session parameters ───────────────────────────────────────────────────────

/// Which pass is running; ext2 phases arm the indirect-block skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scan,
    Ext2On,
    Ext2OnSaveEverything,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Scan => "scan",
            Phase::Ext2On => "ext2_on",
            Phase::Ext2OnSaveEverything => "ext2_on_save_everything",
        }
    }

    /// Parse a session value; unknown strings fall back to `Scan`.
    pub fn parse(s: &str) -> Phase {
        match s {
            "ext2_on" => Phase::Ext2On,
            "ext2_on_save_everything" => Phase::Ext2OnSaveEverything,
            _ => Phase::Scan,
        }
    }
}

/// Mutable scan parameters, checkpointed and restored across sessions.
#[derive(Debug, Clone)]
pub struct Params {
    pub blocksize:     u64,
    pub output_dir:    PathBuf,
    /// Cursor for resume; updated every progress tick and on abort.
    pub offset:        u64,
    pub pass:          u32,
    pub phase:         Phase,
    /// Destination-filesystem quirk: cap files below 4 GiB.
    pub fat_partition: bool,
    pub(crate) file_count: u32,
    pub(crate) dir_count:  u32,
}

impl Params {
    pub fn new(output_dir: PathBuf, blocksize: u64) -> Self {
        assert!(blocksize > 0, "blocksize must be non-zero");
        Self {
            output_dir,
            blocksize,
            offset: 0,
            pass: 0,
            phase: Phase::Scan,
            fat_partition: false,
            file_count: 0,
            dir_count: 0,
        }
    }
}

/// Engine behavior switches.
#[derive(Debug, Clone)]
pub struct Options {
    /// Run `file_check` finalizers (enables truncation and rejection).
    pub paranoid: bool,
    /// Reclaim search-space metadata behind the cursor.
    pub lowmem:   bool,
    pub verbose:  u8,
}

impl Default for Options {
    fn default() -> Self {
        Self { paranoid: true, lowmem: false, verbose: 0 }
    }
}

/// Progress callback: `(cursor offset, media size)`.
pub type ProgressFn<'a> = dyn FnMut(u64, u64) + 'a;

/// Checkpoint callback: persist the search space, params, and per-format
/// counters.  Invoked at most once per scheduling interval.
pub type CheckpointFn<'a> =
    dyn FnMut(&SearchSpace, &Params, &[(String, u64)]) -> io::Result<()> + 'a;

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct CarveEngine<'a> {
    disk:       &'a mut dyn DiskReader,
    registry:   &'a FormatRegistry,
    pub params: Params,
    pub options: Options,
    stop:       Arc<AtomicBool>,
    progress:   Option<Box<ProgressFn<'a>>>,
    checkpoint: Option<Box<CheckpointFn<'a>>>,
    stats:      Vec<u64>,
    report:     Vec<RecoveredFile>,
}

impl<'a> CarveEngine<'a> {
    pub fn new(
        disk: &'a mut dyn DiskReader,
        registry: &'a FormatRegistry,
        params: Params,
        options: Options,
    ) -> Self {
        let stats = vec![0u64; registry.len()];
        Self {
            disk,
            registry,
            params,
            options,
            stop: Arc::new(AtomicBool::new(false)),
            progress: None,
            checkpoint: None,
            stats,
            report: Vec::new(),
        }
    }

    /// Shared stop flag; raise it from a signal handler or another thread to
    /// end the scan after the current block.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn set_progress(&mut self, f: Box<ProgressFn<'a>>) {
        self.progress = Some(f);
    }

    pub fn set_checkpoint(&mut self, f: Box<CheckpointFn<'a>>) {
        self.checkpoint = Some(f);
    }

    /// Per-format recovered counters, in registry order.
    pub fn stats_named(&self) -> Vec<(String, u64)> {
        self.registry
            .names()
            .into_iter()
            .zip(self.stats.iter().copied())
            .collect()
    }

    /// Manifest of recovered files, in recovery order.
    pub fn report(&self) -> &[RecoveredFile] {
        &self.report
    }

    pub fn into_report(self) -> Vec<RecoveredFile> {
        self.report
    }

    /// Restore per-format counters from a session.
    pub fn restore_stats(&mut self, saved: &[(String, u64)]) {
        for (name, count) in saved {
            if let Some(i) = self.registry.names().iter().position(|n| n == name) {
                self.stats[i] = *count;
            }
        }
    }

    /// Carve every unsearched region of `search`.
    pub fn run(&mut self, search: &mut SearchSpace) -> ScanStatus {
        let bs = self.params.blocksize;
        let sector = u64::from(self.disk.sector_size());
        let media_size = self.disk.size();
        let max_block = (media_size / bs).min(u64::from(u32::MAX)) as u32;

        let mut rec = FileRecovery::idle(bs);
        let mut buffer = SlidingBuffer::new(bs as usize);
        let mut back = 0u32;
        let mut offset_before_back = 0u64;
        let mut last_tick = Instant::now();
        let mut next_checkpoint = Instant::now() + CHECKPOINT_INTERVAL;

        let start = if self.params.offset > 0 {
            search.cursor_at(self.params.offset)
        } else {
            search.start_cursor()
        };
        let mut cursor = match start {
            Some(c) => c,
            None => return ScanStatus::Complete,
        };

        log::info!(
            "scanning {} from {:#x}, {} B unsearched",
            self.disk.description(),
            cursor.offset(),
            search.remaining_bytes()
        );
        fill_read(&mut *self.disk, buffer.reset(true), cursor.offset(), media_size);

        while !search.is_sentinel(cursor) {
            let old_offset = cursor.offset();
            let mut file_recovered = FinishStatus::Bad;
            let mut res = DataVerdict::Scan;
            let mut fail: Option<ScanStatus> = None;

            if !search.cursor_valid(cursor) {
                log::error!("BUG: cursor {:#x} outside the search space", cursor.offset());
                panic!("carve cursor left the search space");
            }

            // ── 1. Header probe ──────────────────────────────────────────
            let bypass = rec.is_active()
                && buffer.lookbehind(0x200).is_some_and(|lb| rec.continuation_check(lb));
            if !bypass {
                if let Some((id, candidate)) = self.registry.probe(buffer.window()) {
                    search.record_header(cursor.offset());
                    if rec.is_active() {
                        let prev = rec.format_id();
                        let (st, entry) = finish(&mut rec, self.options.paranoid, search);
                        self.note_finish(prev, st, entry);
                        file_recovered = st;
                        // Finalization may have re-inserted intervals; the
                        // cursor's interval index must be re-derived.
                        cursor = search.cursor_at(cursor.offset()).unwrap_or(Cursor::SENTINEL);
                    }
                    if file_recovered != FinishStatus::Truncated {
                        let format = self.registry.get_arc(id);
                        if self.options.verbose > 0 {
                            format.log_contents(buffer.window(), cursor.offset() / sector);
                        }
                        rec.adopt(id, format, candidate, cursor.offset());
                        log::trace!(
                            "{} header found at sector {}",
                            rec.extension(),
                            cursor.offset() / sector
                        );
                        if rec.wants_output() {
                            let opened = self
                                .next_filename(cursor.offset() / sector, rec.extension())
                                .and_then(|path| rec.open_output(path));
                            if let Err(e) = opened {
                                log::error!("cannot create output file: {e}");
                                self.params.offset = cursor.offset();
                                fail = Some(ScanStatus::OutputDenied);
                            }
                        }
                    }
                }
            }

            // ── 2. Append ────────────────────────────────────────────────
            if fail.is_none() && rec.is_active() {
                let ext2_active =
                    matches!(self.params.phase, Phase::Ext2On | Phase::Ext2OnSaveEverything);
                if ext2_active
                    && rec.file_size >= EXT2_DIRECT_BLOCKS * bs
                    && is_indirect_block(buffer.current_block(), max_block)
                {
                    // Filesystem metadata, not file content: consume it but
                    // keep it out of the output and the size.
                    rec.push_block(cursor.offset(), false);
                    cursor = search.consume(cursor, bs);
                    res = DataVerdict::Continue;
                    log::trace!("skipping indirect block at sector {}", old_offset / sector);
                    buffer.copy_back();
                } else {
                    if rec.has_handle() {
                        if let Err(e) = rec.write_block(buffer.current_block()) {
                            if write_error_is_eof(&e) {
                                // Destination filesystem cannot hold more;
                                // the file is as big as it can get.
                                res = DataVerdict::Stop;
                            } else {
                                log::error!(
                                    "cannot write to {}: {e}",
                                    rec.filename().display()
                                );
                                self.params.offset = rec.location_start;
                                fail = Some(ScanStatus::OutputFull);
                            }
                        }
                    }
                    if fail.is_none() {
                        rec.push_block(cursor.offset(), true);
                        cursor = search.consume(cursor, bs);
                        if res == DataVerdict::Scan {
                            // Write (if any) succeeded; let the format rule.
                            res = rec.run_data_check(buffer.data_window());
                        }
                        rec.file_size += bs;
                        if res == DataVerdict::Stop {
                            log::trace!("EOF found near {:#x}", old_offset);
                        }
                    }
                }

                // Size caps.
                if fail.is_none() && res != DataVerdict::Stop && res != DataVerdict::Error {
                    let max = rec.max_filesize();
                    if max > 0 && rec.file_size >= max {
                        log::trace!("file reached format cap of {max} B, stopping");
                        res = DataVerdict::Stop;
                    }
                    if self.params.fat_partition && rec.file_size + bs >= FAT_MAX_FILE_SIZE {
                        log::trace!("file reached the FAT 4 GiB cap, stopping");
                        res = DataVerdict::Stop;
                    }
                }

                if fail.is_none() && (res == DataVerdict::Stop || res == DataVerdict::Error) {
                    if res == DataVerdict::Error {
                        // Invalid content: discard everything written.
                        rec.file_size = 0;
                    }
                    let prev = rec.format_id();
                    let (st, entry) = finish(&mut rec, self.options.paranoid, search);
                    self.note_finish(prev, st, entry);
                    file_recovered = st;
                    if !search.is_sentinel(cursor) {
                        // Re-derive the interval index: finalization may have
                        // re-inserted intervals before the cursor.
                        cursor = search.cursor_at(cursor.offset()).unwrap_or(Cursor::SENTINEL);
                    }
                    if self.options.lowmem {
                        cursor = search.forget(cursor);
                    }
                }
            }

            // ── 3. Resource failure ──────────────────────────────────────
            if let Some(status) = fail {
                match status {
                    ScanStatus::OutputFull => abort_keep_partial(&mut rec),
                    _ => abort_discard(&mut rec, search),
                }
                log::info!("carving aborted: {status:?}");
                return status;
            }

            // ── 4. Advance / backtrack ───────────────────────────────────
            if file_recovered == FinishStatus::Bad {
                if res == DataVerdict::Scan {
                    cursor = search.next_sector(cursor, bs);
                    if cursor.offset() > offset_before_back {
                        back = 0;
                    }
                }
            } else if file_recovered == FinishStatus::Truncated
                || (file_recovered == FinishStatus::Ok && !rec.is_active())
            {
                // Try to recover an earlier file freed by the finalization,
                // otherwise continue just past the finalized file's start.
                offset_before_back = cursor.offset();
                let rewound = if back < MAX_BACKTRACK {
                    search
                        .prev_header_before(cursor.offset())
                        .and_then(|mark| search.cursor_at(mark))
                } else {
                    None
                };
                match rewound {
                    Some(c) => {
                        cursor = c;
                        back += 1;
                    }
                    None => {
                        back = 0;
                        cursor = search
                            .first_after(rec.location_start, bs)
                            .unwrap_or(Cursor::SENTINEL);
                    }
                }
            }

            // ── 5. End of media ──────────────────────────────────────────
            if search.is_sentinel(cursor) {
                let prev = rec.format_id();
                let (st, entry) = finish(&mut rec, self.options.paranoid, search);
                self.note_finish(prev, st, entry);
                if st != FinishStatus::Bad {
                    file_recovered = st;
                    if let Some(c) = search.first_after(rec.location_start, bs) {
                        cursor = c;
                    }
                }
                if search.is_sentinel(cursor) {
                    break;
                }
            }

            // ── 6. Buffer slide / refill / tick ──────────────────────────
            buffer.advance();
            if file_recovered != FinishStatus::Bad
                || old_offset + bs != cursor.offset()
                || buffer.needs_reset()
            {
                let slice = buffer.reset(file_recovered != FinishStatus::Bad);
                fill_read(&mut *self.disk, slice, cursor.offset(), media_size);

                if last_tick.elapsed() >= Duration::from_secs(1) {
                    last_tick = Instant::now();
                    self.params.offset = cursor.offset();
                    if let Some(cb) = self.progress.as_mut() {
                        cb(cursor.offset(), media_size);
                    }
                    if Instant::now() >= next_checkpoint {
                        next_checkpoint = self.run_checkpoint(search);
                    }
                    if self.stop.load(Ordering::Relaxed) {
                        log::info!("stop requested, ending scan");
                        abort_discard(&mut rec, search);
                        return ScanStatus::Stopped;
                    }
                }
            }
        }

        log::info!(
            "scan complete: {} file(s) recovered, {} B left unsearched",
            self.report.len(),
            search.remaining_bytes()
        );
        ScanStatus::Complete
    }

    fn next_filename(&mut self, sector: u64, ext: &str) -> io::Result<PathBuf> {
        let dir = self
            .params
            .output_dir
            .join(format!("recup_dir.{}", self.params.dir_count + 1));
        std::fs::create_dir_all(&dir)?;
        let name = if ext.is_empty() {
            format!("f{sector:07}")
        } else {
            format!("f{sector:07}.{ext}")
        };
        Ok(dir.join(name))
    }

    fn note_finish(
        &mut self,
        id: Option<FormatId>,
        status: FinishStatus,
        entry: Option<RecoveredFile>,
    ) {
        if status == FinishStatus::Bad {
            return;
        }
        if let Some(FormatId(i)) = id {
            if let Some(count) = self.stats.get_mut(i) {
                *count += 1;
            }
        }
        if let Some(entry) = entry {
            self.params.file_count += 1;
            if self.params.file_count % FILES_PER_DIR == 0 {
                self.params.dir_count += 1;
            }
            self.report.push(entry);
        }
    }

    fn run_checkpoint(&mut self, search: &SearchSpace) -> Instant {
        let stats = self.stats_named();
        let Some(cb) = self.checkpoint.as_mut() else {
            return Instant::now() + CHECKPOINT_INTERVAL;
        };
        let begin = Instant::now();
        if let Err(e) = cb(search, &self.params, &stats) {
            log::warn!("session save failed: {e}");
        }
        let took = begin.elapsed();
        if took > CHECKPOINT_SLOW_SAVE {
            log::info!("session save took {took:?}, relaxing checkpoint interval");
            Instant::now() + CHECKPOINT_INTERVAL_RELAXED
        } else {
            Instant::now() + CHECKPOINT_INTERVAL
        }
    }
}

/// Fill `slice` from the disk at `offset`; missing bytes become zero.  Reads
/// shorter than the in-media span are logged and never abort the scan.
fn fill_read(disk: &mut dyn DiskReader, slice: &mut [u8], offset: u64, media_size: u64) {
    let expected = media_size.saturating_sub(offset).min(slice.len() as u64) as usize;
    let got = match disk.pread(slice, offset) {
        Ok(n) => n.min(slice.len()),
        Err(e) => {
            log::warn!("read error at {offset:#x}: {e}");
            0
        }
    };
    if got < expected {
        log::warn!("short read at {offset:#x}: {got} of {expected} bytes, zero-padding");
    }
    slice[got..].fill(0);
}

/// Does this write error mean "the destination filesystem cannot hold a
/// bigger file" (normal EOF for the current recovery)?
fn write_error_is_eof(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::FileTooLarge {
        return true;
    }
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EFBIG) {
        return true;
    }
    false
}
