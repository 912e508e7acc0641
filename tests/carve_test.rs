//! End-to-end carving scenarios over synthetic disk images.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use uuid::Uuid;

use recarve::formats;
use recarve::{
    Candidate, CarveEngine, DataCheck, DataCheckCtx, DataVerdict, DiskReader, FileStat, Format,
    ImageReader, Options, Params, Phase, RecoveredFile, ScanStatus, SearchSpace, Session,
    Signature,
};

const BS: u64 = 512;
const MIB: usize = 1024 * 1024;

// ── Synthetic format ─────────────────────────────────────────────────────────

/// Test format: fixed magic, content accepted up to `stop_after` bytes,
/// optional truncation at finalize.
struct Syn {
    stat:        FileStat,
    sigs:        [Signature; 1],
    stop_after:  u64,
    truncate_to: Option<u64>,
}

impl Syn {
    fn new(
        ext: &'static str,
        magic: &'static [u8],
        stop_after: u64,
        truncate_to: Option<u64>,
    ) -> Arc<dyn Format> {
        Arc::new(Syn {
            stat: FileStat { extension: ext, description: ext, max_filesize: 0, recover: true },
            sigs: [Signature { offset: 0, bytes: magic }],
            stop_after,
            truncate_to,
        })
    }
}

struct CountCheck {
    stop_after: u64,
}

impl DataCheck for CountCheck {
    fn check(&mut self, cx: &mut DataCheckCtx<'_>) -> DataVerdict {
        if cx.file_size + cx.blocksize >= self.stop_after {
            *cx.calculated_size = self.stop_after;
            DataVerdict::Stop
        } else {
            DataVerdict::Continue
        }
    }
}

impl Format for Syn {
    fn stat(&self) -> &FileStat {
        &self.stat
    }
    fn signatures(&self) -> &[Signature] {
        &self.sigs
    }
    fn header_check(&self, _window: &[u8]) -> Option<Candidate> {
        Some(Candidate {
            extension:      self.stat.extension,
            data_check:     Some(Box::new(CountCheck { stop_after: self.stop_after })),
            use_file_check: true,
        })
    }
    fn file_check(
        &self,
        _handle: &mut dyn recarve::registry::ReadSeek,
        file_size: u64,
        _calculated: u64,
    ) -> io::Result<u64> {
        Ok(self.truncate_to.map_or(file_size, |t| t.min(file_size)))
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Outcome {
    status:    ScanStatus,
    report:    Vec<RecoveredFile>,
    remaining: u64,
    #[allow(dead_code)]
    dir:       TempDir,
}

fn scan(image: &[u8], registry: &recarve::FormatRegistry, phase: Phase) -> Outcome {
    scan_from(image, registry, phase, None, 0)
}

fn scan_from(
    image: &[u8],
    registry: &recarve::FormatRegistry,
    phase: Phase,
    intervals: Option<Vec<(u64, u64)>>,
    offset: u64,
) -> Outcome {
    let dir = tempfile::tempdir().unwrap();
    let img_path = dir.path().join("disk.img");
    fs::write(&img_path, image).unwrap();
    let mut disk = ImageReader::open(&img_path).unwrap();

    let mut search = match intervals {
        Some(pairs) => SearchSpace::from_intervals(pairs),
        None => SearchSpace::new(0, image.len() as u64 - 1),
    };
    let mut params = Params::new(dir.path().join("out"), BS);
    params.phase = phase;
    params.offset = offset;

    let mut engine = CarveEngine::new(&mut disk, registry, params, Options::default());
    let status = engine.run(&mut search);
    let remaining = search.remaining_bytes();
    Outcome { status, report: engine.into_report(), remaining, dir }
}

/// Fill `image[start..start+len]` with a position-derived byte pattern.
fn pattern(image: &mut [u8], start: usize, len: usize) {
    for i in 0..len {
        image[start + i] = ((start + i) % 251) as u8;
    }
}

fn recovered_bytes(entry: &RecoveredFile) -> Vec<u8> {
    fs::read(&entry.path).unwrap()
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[test]
fn single_stream_is_recovered_exactly() {
    let mut image = vec![0u8; 4 * MIB];
    pattern(&mut image, 0x1000, 5120);
    image[0x1000..0x1004].copy_from_slice(b"SYN1");

    let registry = recarve::FormatRegistry::builder()
        .register(Syn::new("syn1", b"SYN1", 5120, None))
        .build();
    let outcome = scan(&image, &registry, Phase::Scan);

    assert_eq!(outcome.status, ScanStatus::Complete);
    assert_eq!(outcome.report.len(), 1);
    let f = &outcome.report[0];
    assert_eq!(f.start, 0x1000);
    assert_eq!(f.size, 5120);
    assert_eq!(f.format, "syn1");
    assert_eq!(f.path.extension().unwrap(), "syn1");
    assert_eq!(recovered_bytes(f), &image[0x1000..0x1000 + 5120]);
}

#[test]
fn back_to_back_streams_recover_in_order() {
    let mut image = vec![0u8; 4 * MIB];
    for start in [0x1000usize, 0x3000] {
        pattern(&mut image, start, 5120);
        image[start..start + 4].copy_from_slice(b"SYN1");
    }

    let registry = recarve::FormatRegistry::builder()
        .register(Syn::new("syn1", b"SYN1", 5120, None))
        .build();
    let outcome = scan(&image, &registry, Phase::Scan);

    assert_eq!(outcome.status, ScanStatus::Complete);
    let starts: Vec<u64> = outcome.report.iter().map(|f| f.start).collect();
    let sizes: Vec<u64> = outcome.report.iter().map(|f| f.size).collect();
    assert_eq!(starts, vec![0x1000, 0x3000]);
    assert_eq!(sizes, vec![5120, 5120]);
}

/// A finalizer shrinks the first file from 64 KiB to 32 KiB; the header that
/// sat inside the over-claimed region must be carved afterwards.
#[test]
fn truncation_frees_an_embedded_header() {
    let mut image = vec![0u8; 4 * MIB];
    pattern(&mut image, 0x0800, 0x10000);
    pattern(&mut image, 0xC000, 0x10000);
    image[0x0800..0x0804].copy_from_slice(b"TRC1");
    image[0xC000..0xC004].copy_from_slice(b"TRC1");

    let registry = recarve::FormatRegistry::builder()
        .register(Syn::new("trc1", b"TRC1", 0x10000, Some(0x8000)))
        .build();
    let outcome = scan(&image, &registry, Phase::Scan);

    assert_eq!(outcome.status, ScanStatus::Complete);
    assert_eq!(outcome.report.len(), 2);

    let first = &outcome.report[0];
    assert_eq!((first.start, first.size), (0x0800, 0x8000));
    assert_eq!(recovered_bytes(first), &image[0x0800..0x0800 + 0x8000]);

    let second = &outcome.report[1];
    assert_eq!((second.start, second.size), (0xC000, 0x8000));
    assert_eq!(recovered_bytes(second), &image[0xC000..0xC000 + 0x8000]);
}

// ── Short reads ──────────────────────────────────────────────────────────────

/// Image reader that returns short reads once past `flaky_at`.
struct FlakyReader {
    data:     Vec<u8>,
    flaky_at: u64,
}

impl DiskReader for FlakyReader {
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let end = (offset as usize + buf.len()).min(self.data.len());
        if offset as usize >= self.data.len() {
            return Ok(0);
        }
        let mut n = end - offset as usize;
        // Damaged region: reads crossing it come back 2 KiB long.
        if offset <= self.flaky_at && self.flaky_at < offset + buf.len() as u64 {
            n = n.min((self.flaky_at - offset) as usize + 2048);
        }
        buf[..n].copy_from_slice(&self.data[offset as usize..offset as usize + n]);
        Ok(n)
    }
    fn size(&self) -> u64 {
        self.data.len() as u64
    }
    fn sector_size(&self) -> u32 {
        512
    }
    fn description(&self) -> String {
        "flaky test media".into()
    }
}

#[test]
fn short_reads_zero_pad_and_scan_continues() {
    let mut image = vec![0u8; 4 * MIB];
    pattern(&mut image, 0x1000, 5120);
    image[0x1000..0x1004].copy_from_slice(b"SYN1");

    let registry = recarve::FormatRegistry::builder()
        .register(Syn::new("syn1", b"SYN1", 5120, None))
        .build();

    let dir = tempfile::tempdir().unwrap();
    let mut disk = FlakyReader { data: image.clone(), flaky_at: 0x10_0000 };
    let mut search = SearchSpace::new(0, image.len() as u64 - 1);
    let params = Params::new(dir.path().join("out"), BS);
    let mut engine = CarveEngine::new(&mut disk, &registry, params, Options::default());

    let status = engine.run(&mut search);
    assert_eq!(status, ScanStatus::Complete);
    assert_eq!(engine.report().len(), 1);
    assert_eq!(engine.report()[0].start, 0x1000);
}

// ── ext2 indirect blocks ─────────────────────────────────────────────────────

#[test]
fn indirect_block_is_skipped_inside_carved_file() {
    let mut image = vec![0u8; 4 * MIB];
    let start = 0x1000usize;
    pattern(&mut image, start, 21 * BS as usize);
    image[start..start + 4].copy_from_slice(b"SYN1");

    // Synthetic indirect block at 12 blocks into the file.
    let ind_at = start + 12 * BS as usize;
    for (i, e) in (1000u32..1000 + 128).enumerate() {
        image[ind_at + i * 4..ind_at + i * 4 + 4].copy_from_slice(&e.to_le_bytes());
    }

    let registry = recarve::FormatRegistry::builder()
        .register(Syn::new("syn1", b"SYN1", 20 * BS, None))
        .build();
    let outcome = scan(&image, &registry, Phase::Ext2On);

    assert_eq!(outcome.status, ScanStatus::Complete);
    assert_eq!(outcome.report.len(), 1);
    let f = &outcome.report[0];
    assert_eq!(f.size, 20 * BS);

    // The indirect block is not part of the recovered content...
    let mut expected = image[start..ind_at].to_vec();
    expected.extend_from_slice(&image[ind_at + BS as usize..start + 21 * BS as usize]);
    assert_eq!(recovered_bytes(f), expected);

    // ...but its sector was consumed: 21 blocks left the search space.
    assert_eq!(outcome.remaining, 4 * MIB as u64 - 21 * BS);
}

// ── Boundary cases ───────────────────────────────────────────────────────────

#[test]
fn header_in_final_block_finalizes_at_end_of_media() {
    let mut image = vec![0u8; MIB];
    let start = MIB - BS as usize;
    pattern(&mut image, start, BS as usize);
    image[start..start + 4].copy_from_slice(b"SYN1");

    let registry = recarve::FormatRegistry::builder()
        .register(Syn::new("syn1", b"SYN1", 5120, None))
        .build();
    let outcome = scan(&image, &registry, Phase::Scan);

    assert_eq!(outcome.status, ScanStatus::Complete);
    assert_eq!(outcome.report.len(), 1);
    assert_eq!(outcome.report[0].start, start as u64);
    assert_eq!(outcome.report[0].size, BS);
}

/// Build a valid ustar member header (mirrors what `tar(1)` writes).
fn tar_member_header(name: &str, size: u64) -> [u8; 512] {
    let mut h = [0u8; 512];
    h[..name.len()].copy_from_slice(name.as_bytes());
    h[100..107].copy_from_slice(b"0000644");
    h[124..136].copy_from_slice(format!("{size:011o} ").as_bytes());
    h[156] = b'0';
    h[257..262].copy_from_slice(b"ustar");
    h[263..265].copy_from_slice(b"00");
    let sum: u64 = h
        .iter()
        .enumerate()
        .map(|(i, &b)| if (148..156).contains(&i) { 0x20 } else { u64::from(b) })
        .sum();
    h[148..156].copy_from_slice(format!("{sum:06o}\0 ").as_bytes());
    h
}

#[test]
fn jpeg_inside_tar_is_not_adopted() {
    // A tarball holding one JPEG whose payload starts at a block boundary.
    let mut jpeg_payload = vec![0u8; 1024];
    jpeg_payload[..4].copy_from_slice(b"\xff\xd8\xff\xe0");
    jpeg_payload[4..6].copy_from_slice(&16u16.to_be_bytes());
    jpeg_payload[6..10].copy_from_slice(b"JFIF");
    jpeg_payload[1022] = 0xFF;
    jpeg_payload[1023] = 0xD9;

    let mut tar = Vec::new();
    tar.extend_from_slice(&tar_member_header("photo.jpg", 1024));
    tar.extend_from_slice(&jpeg_payload);
    tar.extend_from_slice(&[0u8; 1024]); // end-of-archive

    let mut image = vec![0u8; MIB];
    image[0x2000..0x2000 + tar.len()].copy_from_slice(&tar);

    let registry = formats::builtin_registry();
    let outcome = scan(&image, &registry, Phase::Scan);

    assert_eq!(outcome.status, ScanStatus::Complete);
    let formats_seen: Vec<&str> = outcome.report.iter().map(|f| f.format).collect();
    assert_eq!(formats_seen, vec!["tar"], "only the tarball itself is recovered");
    let f = &outcome.report[0];
    assert_eq!(f.start, 0x2000);
    assert_eq!(f.size, tar.len() as u64);
    assert_eq!(recovered_bytes(f), tar);
}

#[test]
fn fat_directory_is_logged_not_recovered() {
    let mut image = vec![0u8; MIB];
    let at = 0x4000;
    image[at..at + 11].copy_from_slice(b".          ");
    image[at + 11] = 0x10;
    image[at + 32..at + 43].copy_from_slice(b"..         ");
    image[at + 43] = 0x10;

    let registry = formats::builtin_registry();
    let outcome = scan(&image, &registry, Phase::Scan);

    assert_eq!(outcome.status, ScanStatus::Complete);
    assert!(outcome.report.is_empty());
    // The directory cluster was consumed anyway.
    assert_eq!(outcome.remaining, MIB as u64 - BS);
}

// ── Checkpoint / resume / determinism ────────────────────────────────────────

fn identity(report: &[RecoveredFile]) -> BTreeSet<(u64, u64, String)> {
    report.iter().map(|f| (f.start, f.size, f.hash.clone())).collect()
}

#[test]
fn resumed_scan_recovers_the_remaining_files() {
    let mut image = vec![0u8; 4 * MIB];
    for start in [0x1000usize, 0x3000, 0x5000] {
        pattern(&mut image, start, 5120);
        image[start..start + 4].copy_from_slice(b"SYN1");
    }
    let registry = recarve::FormatRegistry::builder()
        .register(Syn::new("syn1", b"SYN1", 5120, None))
        .build();

    let full = scan(&image, &registry, Phase::Scan);
    assert_eq!(full.report.len(), 3);

    // State as checkpointed mid-scan: the first file's blocks are consumed
    // and the cursor sits past them.
    let interrupted = SearchSpace::from_intervals([(0, 0xFFF), (0x2400, 4 * MIB as u64 - 1)]);
    let mut params = Params::new(PathBuf::from("unused"), BS);
    params.offset = 0x2800;
    let session = Session::capture(Uuid::new_v4(), &interrupted, &params, &[], vec!["syn1".into()]);

    let dir = tempfile::tempdir().unwrap();
    let session_path = dir.path().join("scan.rcs");
    session.save_to(&session_path).unwrap();
    let restored = Session::load_from(&session_path).unwrap();

    let resumed = scan_from(
        &image,
        &registry,
        restored.phase(),
        Some(restored.intervals.clone()),
        restored.offset,
    );
    assert_eq!(resumed.status, ScanStatus::Complete);

    let expected: BTreeSet<_> = identity(&full.report)
        .into_iter()
        .filter(|(start, _, _)| *start >= 0x2800)
        .collect();
    assert_eq!(identity(&resumed.report), expected);
}

#[test]
fn carving_twice_is_deterministic() {
    let mut image = vec![0u8; 2 * MIB];
    for start in [0x1000usize, 0x8000] {
        pattern(&mut image, start, 5120);
        image[start..start + 4].copy_from_slice(b"SYN1");
    }
    let registry = recarve::FormatRegistry::builder()
        .register(Syn::new("syn1", b"SYN1", 5120, None))
        .build();

    let a = scan(&image, &registry, Phase::Scan);
    let b = scan(&image, &registry, Phase::Scan);

    let names =
        |o: &Outcome| o.report.iter().map(|f| f.path.file_name().unwrap().to_owned()).collect::<Vec<_>>();
    assert_eq!(identity(&a.report), identity(&b.report));
    assert_eq!(names(&a), names(&b));
}
