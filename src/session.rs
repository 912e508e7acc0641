//! Durable scan sessions — checkpoint files for resumable carving.
//!
//! # On-disk layout
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic        = "RCSN" (4 ASCII bytes)
//!    4      4   version      = 1      (LE u32)
//!    8      8   payload_len  bytes of JSON payload (LE u64)
//!   16      4   payload_crc32 CRC32 of the payload  (LE u32)
//!   20      N   payload      serde_json-encoded [`Session`]
//! ```
//!
//! The payload carries the ordered interval list as `(start, end)` pairs,
//! the phase and cursor, per-format counters, and the enabled-format names.
//! Saves go through a temporary file and an atomic rename, so an interrupted
//! save never corrupts the previous checkpoint.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::Utc;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::engine::{Params, Phase};
use crate::search_space::SearchSpace;

pub const MAGIC: &[u8; 4] = b"RCSN";
pub const SESSION_VERSION: u32 = 1;

/// Refuse to parse payloads beyond this size; a valid session is far
/// smaller and a corrupt length field must not drive allocation.
const MAX_PAYLOAD: u64 = 256 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid magic — not a recarve session file")]
    InvalidMagic,
    #[error("unsupported session version {0} (this build reads v{SESSION_VERSION})")]
    UnsupportedVersion(u32),
    #[error("session payload CRC32 mismatch — file is corrupted")]
    Crc32Mismatch,
    #[error("session payload of {0} B exceeds the {MAX_PAYLOAD} B limit")]
    OversizedPayload(u64),
    #[error("malformed session payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Identifies one logical scan across interruptions and resumes.
    pub session_uuid:    Uuid,
    /// Unix timestamp of the save.
    pub saved_at:        i64,
    pub pass:            u32,
    pub phase:           String,
    /// Cursor to resume from.
    pub offset:          u64,
    pub blocksize:       u64,
    /// Still-unsearched regions, sorted, as inclusive `(start, end)` pairs.
    pub intervals:       Vec<(u64, u64)>,
    pub enabled_formats: Vec<String>,
    /// Per-format recovered counters.
    pub stats:           Vec<(String, u64)>,
}

impl Session {
    /// Snapshot the current scan state.
    pub fn capture(
        uuid: Uuid,
        search: &SearchSpace,
        params: &Params,
        stats: &[(String, u64)],
        enabled_formats: Vec<String>,
    ) -> Self {
        Self {
            session_uuid: uuid,
            saved_at: Utc::now().timestamp(),
            pass: params.pass,
            phase: params.phase.as_str().to_string(),
            offset: params.offset,
            blocksize: params.blocksize,
            intervals: search.intervals().iter().map(|iv| (iv.start, iv.end)).collect(),
            enabled_formats,
            stats: stats.to_vec(),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::parse(&self.phase)
    }

    pub fn search_space(&self) -> SearchSpace {
        SearchSpace::from_intervals(self.intervals.iter().copied())
    }

    pub fn write<W: Write>(&self, mut w: W) -> Result<(), SessionError> {
        let payload = serde_json::to_vec(self)?;
        let mut h = Hasher::new();
        h.update(&payload);

        w.write_all(MAGIC)?;
        w.write_u32::<LittleEndian>(SESSION_VERSION)?;
        w.write_u64::<LittleEndian>(payload.len() as u64)?;
        w.write_u32::<LittleEndian>(h.finalize())?;
        w.write_all(&payload)?;
        Ok(())
    }

    pub fn read<R: Read>(mut r: R) -> Result<Self, SessionError> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(SessionError::InvalidMagic);
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != SESSION_VERSION {
            return Err(SessionError::UnsupportedVersion(version));
        }
        let payload_len = r.read_u64::<LittleEndian>()?;
        if payload_len > MAX_PAYLOAD {
            return Err(SessionError::OversizedPayload(payload_len));
        }
        let stored_crc = r.read_u32::<LittleEndian>()?;

        let mut payload = vec![0u8; payload_len as usize];
        r.read_exact(&mut payload)?;
        let mut h = Hasher::new();
        h.update(&payload);
        if h.finalize() != stored_crc {
            return Err(SessionError::Crc32Mismatch);
        }
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Atomic save: write to `<path>.tmp`, fsync, rename over `path`.
    pub fn save_to(&self, path: &Path) -> Result<(), SessionError> {
        let tmp = path.with_extension("tmp");
        {
            let file = File::create(&tmp)?;
            let mut w = BufWriter::new(file);
            self.write(&mut w)?;
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        log::debug!("session saved to {}", path.display());
        Ok(())
    }

    pub fn load_from(path: &Path) -> Result<Self, SessionError> {
        let file = File::open(path)?;
        Self::read(BufReader::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample() -> Session {
        let search = SearchSpace::from_intervals([(0x0, 0xFFF), (0x2000, 0x2FFF)]);
        let mut params = Params::new(PathBuf::from("/tmp/out"), 512);
        params.offset = 0x2200;
        params.pass = 1;
        params.phase = Phase::Ext2On;
        Session::capture(
            Uuid::new_v4(),
            &search,
            &params,
            &[("jpg".into(), 3), ("tar".into(), 1)],
            vec!["jpg".into(), "tar".into()],
        )
    }

    #[test]
    fn round_trip_preserves_state() {
        let s = sample();
        let mut buf = Vec::new();
        s.write(&mut buf).unwrap();
        let back = Session::read(&buf[..]).unwrap();

        assert_eq!(back.session_uuid, s.session_uuid);
        assert_eq!(back.intervals, vec![(0x0, 0xFFF), (0x2000, 0x2FFF)]);
        assert_eq!(back.offset, 0x2200);
        assert_eq!(back.phase(), Phase::Ext2On);
        assert_eq!(back.stats, s.stats);

        let space = back.search_space();
        assert_eq!(space.remaining_bytes(), 0x1000 + 0x1000);
    }

    #[test]
    fn rejects_bad_magic_and_crc() {
        let s = sample();
        let mut buf = Vec::new();
        s.write(&mut buf).unwrap();

        let mut bad_magic = buf.clone();
        bad_magic[0] = b'X';
        assert!(matches!(Session::read(&bad_magic[..]), Err(SessionError::InvalidMagic)));

        let mut bad_payload = buf.clone();
        let last = bad_payload.len() - 1;
        bad_payload[last] ^= 0xFF;
        assert!(matches!(Session::read(&bad_payload[..]), Err(SessionError::Crc32Mismatch)));

        let mut bad_version = buf;
        bad_version[4] = 9;
        assert!(matches!(
            Session::read(&bad_version[..]),
            Err(SessionError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn save_is_atomic_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.rcs");
        let s = sample();
        s.save_to(&path).unwrap();
        // Second save replaces the first without leaving the tmp file.
        s.save_to(&path).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
        let back = Session::load_from(&path).unwrap();
        assert_eq!(back.session_uuid, s.session_uuid);
    }
}
