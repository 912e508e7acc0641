//! Disk access — positioned reads over raw media.
//!
//! The carving engine consumes media through the [`DiskReader`] capability:
//! a positioned read plus geometry.  Short reads are part of the contract —
//! damaged media return fewer bytes than asked and the engine treats the
//! missing tail as zero.  [`ImageReader`] is the file-backed implementation
//! for `.dd`/`.img` images; raw-device and expert-witness backends plug in
//! behind the same trait.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Sector size assumed when the backend cannot report one.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Positioned-read capability over a disk, partition, or image.
pub trait DiskReader {
    /// Read up to `buf.len()` bytes at absolute byte `offset`.
    ///
    /// Returns the number of bytes actually read.  Short reads are allowed
    /// (end of media, unreadable sectors); the caller zero-fills the tail.
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Total media size in bytes.
    fn size(&self) -> u64;

    /// Sector size in bytes, a power of two (typically 512 or 4096).
    fn sector_size(&self) -> u32;

    /// Human description for logging.
    fn description(&self) -> String;

    /// Device model string, when the backend knows one.
    fn model(&self) -> Option<&str> {
        None
    }
}

// ── ImageReader ──────────────────────────────────────────────────────────────

/// File-backed disk image.
pub struct ImageReader {
    file:        File,
    path:        PathBuf,
    size:        u64,
    sector_size: u32,
}

impl ImageReader {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Self::with_sector_size(path, DEFAULT_SECTOR_SIZE)
    }

    pub fn with_sector_size<P: AsRef<Path>>(path: P, sector_size: u32) -> io::Result<Self> {
        if sector_size == 0 || !sector_size.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("sector size {sector_size} is not a power of two"),
            ));
        }
        let path = path.as_ref().to_owned();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, path, size, sector_size })
    }
}

impl DiskReader for ImageReader {
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn description(&self) -> String {
        format!("image {} ({} B)", self.path.display(), self.size)
    }
}
