//! JPEG recognizer.
//!
//! Headers are the SOI marker followed by an APP0/APP1/DQT/COM segment.
//! Content validation scans appended blocks for the EOI marker and pins
//! `calculated_size` to it; the finalizer truncates to that point.  Scan
//! data escapes 0xFF as 0xFF 0x00, so a bare EOI inside the entropy stream
//! is rare; embedded thumbnails can still end a recovery early, which costs
//! the tail of the picture but never corrupts the output.

use crate::registry::{
    truncate_to_calculated, Candidate, DataCheck, DataCheckCtx, DataVerdict, FileStat, Format,
    ReadSeek, Signature,
};

const STAT: FileStat = FileStat {
    extension:    "jpg",
    description:  "JPEG picture",
    max_filesize: 50 * 1024 * 1024,
    recover:      true,
};

const SIGNATURES: [Signature; 4] = [
    Signature { offset: 0, bytes: b"\xff\xd8\xff\xe0" }, // JFIF
    Signature { offset: 0, bytes: b"\xff\xd8\xff\xe1" }, // EXIF
    Signature { offset: 0, bytes: b"\xff\xd8\xff\xdb" }, // bare quantization table
    Signature { offset: 0, bytes: b"\xff\xd8\xff\xfe" }, // comment first
];

pub struct Jpeg;

impl Format for Jpeg {
    fn stat(&self) -> &FileStat {
        &STAT
    }

    fn signatures(&self) -> &[Signature] {
        &SIGNATURES
    }

    fn header_check(&self, window: &[u8]) -> Option<Candidate> {
        if window.len() < 6 {
            return None;
        }
        // First segment must declare a plausible length.
        let seg_len = u16::from_be_bytes([window[4], window[5]]);
        if seg_len < 2 {
            return None;
        }
        Some(Candidate {
            extension:      "jpg",
            data_check:     Some(Box::new(JpegDataCheck)),
            use_file_check: true,
        })
    }

    fn file_check(
        &self,
        _handle: &mut dyn ReadSeek,
        file_size: u64,
        calculated_size: u64,
    ) -> std::io::Result<u64> {
        Ok(truncate_to_calculated(file_size, calculated_size))
    }
}

struct JpegDataCheck;

impl DataCheck for JpegDataCheck {
    fn check(&mut self, cx: &mut DataCheckCtx<'_>) -> DataVerdict {
        let bs = cx.blocksize as usize;
        let w = cx.window;
        // Look for EOI starting at the last lookbehind byte, so a marker
        // straddling the block boundary is still seen.
        for p in (bs - 1)..w.len().saturating_sub(1) {
            if w[p] == 0xFF && w[p + 1] == 0xD9 {
                *cx.calculated_size = cx.file_size + p as u64 + 2 - cx.blocksize;
                return DataVerdict::Stop;
            }
        }
        DataVerdict::Continue
    }
}
