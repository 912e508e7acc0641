//! FAT directory pseudo-format.
//!
//! Directory clusters are not recovered — there is no payload to save — but
//! recognizing them mid-scan lets the carver log the names, sizes, and
//! start clusters of files that once lived there, which is often the only
//! trace left of what the disk held.  The first two entries of every FAT
//! directory are `.` and `..`, which makes a reliable signature.

use crate::registry::{Candidate, DataCheck, DataCheckCtx, DataVerdict, FileStat, Format, Signature};

const ENTRY_SIZE: usize = 32;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = 0x0F;
const ENTRY_DELETED: u8 = 0xE5;

const STAT: FileStat = FileStat {
    extension:    "dir",
    description:  "FAT directory",
    max_filesize: 4096,
    recover:      false,
};

// "." then ten space-padded name bytes, directory attribute.
const SIGNATURES: [Signature; 1] =
    [Signature { offset: 0, bytes: b".          \x10" }];

pub struct FatDir;

impl Format for FatDir {
    fn stat(&self) -> &FileStat {
        &STAT
    }

    fn signatures(&self) -> &[Signature] {
        &SIGNATURES
    }

    fn header_check(&self, window: &[u8]) -> Option<Candidate> {
        if window.len() < 2 * ENTRY_SIZE {
            return None;
        }
        // The second entry must be "..".
        if &window[32..43] != b"..         " || window[43] != ATTR_DIRECTORY {
            return None;
        }
        Some(Candidate {
            extension:      "dir",
            data_check:     Some(Box::new(DirDataCheck)),
            use_file_check: false,
        })
    }

    fn log_contents(&self, window: &[u8], sector: u64) {
        log::info!("FAT directory at sector {sector}:");
        for entry in window.chunks_exact(ENTRY_SIZE) {
            match entry[0] {
                0 => break, // end of directory
                ENTRY_DELETED => continue,
                _ => {}
            }
            let attr = entry[11];
            if attr & ATTR_LONG_NAME == ATTR_LONG_NAME {
                continue; // long-name fragment
            }
            let name = short_name(&entry[..11]);
            let cluster = u32::from(u16::from_le_bytes([entry[20], entry[21]])) << 16
                | u32::from(u16::from_le_bytes([entry[26], entry[27]]));
            let size = u32::from_le_bytes([entry[28], entry[29], entry[30], entry[31]]);
            if attr & ATTR_DIRECTORY != 0 {
                log::info!("  {name}/ (cluster {cluster})");
            } else {
                log::info!("  {name} ({size} B, cluster {cluster})");
            }
        }
    }
}

/// One directory cluster is enough for the listing.
struct DirDataCheck;

impl DataCheck for DirDataCheck {
    fn check(&mut self, _cx: &mut DataCheckCtx<'_>) -> DataVerdict {
        DataVerdict::Stop
    }
}

/// Render an 8.3 name: `"README  TXT"` becomes `README.TXT`.
fn short_name(raw: &[u8]) -> String {
    let base: String = raw[..8]
        .iter()
        .map(|&b| char::from(b))
        .collect::<String>()
        .trim_end()
        .to_string();
    let ext: String = raw[8..11]
        .iter()
        .map(|&b| char::from(b))
        .collect::<String>()
        .trim_end()
        .to_string();
    if ext.is_empty() {
        base
    } else {
        format!("{base}.{ext}")
    }
}
