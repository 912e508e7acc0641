//! PNG recognizer.
//!
//! PNG is fully framed: after the 8-byte signature the file is a sequence
//! of `length / type / data / crc` chunks ending at IEND.  The content
//! validator walks the chunk chain as blocks arrive, so the recovered size
//! is exact and garbage after a chunk boundary aborts the recovery instead
//! of polluting the output.

use crate::registry::{
    truncate_to_calculated, Candidate, DataCheck, DataCheckCtx, DataVerdict, FileStat, Format,
    ReadSeek, Signature,
};

const STAT: FileStat = FileStat {
    extension:    "png",
    description:  "Portable Network Graphics",
    max_filesize: 100 * 1024 * 1024,
    recover:      true,
};

const SIGNATURES: [Signature; 1] =
    [Signature { offset: 0, bytes: b"\x89PNG\r\n\x1a\n" }];

/// A chunk length beyond this is not a real PNG.
const MAX_CHUNK_LEN: u32 = 0x7FFF_FFFF;

pub struct Png;

impl Format for Png {
    fn stat(&self) -> &FileStat {
        &STAT
    }

    fn signatures(&self) -> &[Signature] {
        &SIGNATURES
    }

    fn header_check(&self, window: &[u8]) -> Option<Candidate> {
        if window.len() < 16 {
            return None;
        }
        // The first chunk must be IHDR with its fixed 13-byte payload.
        let len = u32::from_be_bytes([window[8], window[9], window[10], window[11]]);
        if len != 13 || &window[12..16] != b"IHDR" {
            return None;
        }
        Some(Candidate {
            extension:      "png",
            data_check:     Some(Box::new(PngDataCheck { next_chunk: 8 })),
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

struct PngDataCheck {
    /// File offset of the next chunk header.
    next_chunk: u64,
}

impl DataCheck for PngDataCheck {
    fn check(&mut self, cx: &mut DataCheckCtx<'_>) -> DataVerdict {
        loop {
            let o = self.next_chunk;
            // Wait until the 8-byte chunk header is fully inside the window.
            if o + 8 > cx.file_size + cx.blocksize {
                return DataVerdict::Continue;
            }
            let Some(rel) = (o + cx.blocksize).checked_sub(cx.file_size) else {
                // Chunk header fell behind the window; cannot validate further.
                return DataVerdict::Scan;
            };
            let idx = rel as usize;
            let w = cx.window;
            if idx + 8 > w.len() {
                return DataVerdict::Continue;
            }

            let len = u32::from_be_bytes([w[idx], w[idx + 1], w[idx + 2], w[idx + 3]]);
            let typ = &w[idx + 4..idx + 8];
            if len > MAX_CHUNK_LEN || !typ.iter().all(u8::is_ascii_alphabetic) {
                return DataVerdict::Error;
            }
            let total = 12 + u64::from(len);
            if typ == b"IEND" {
                *cx.calculated_size = o + total;
                return DataVerdict::Stop;
            }
            self.next_chunk = o + total;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(typ: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(typ);
        out.extend_from_slice(payload);
        out.extend_from_slice(&[0u8; 4]); // crc, not verified while carving
        out
    }

    fn tiny_png() -> Vec<u8> {
        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend(chunk(b"IHDR", &[0u8; 13]));
        png.extend(chunk(b"IDAT", &[0x55u8; 64]));
        png.extend(chunk(b"IEND", &[]));
        png
    }

    fn drive(data: &[u8], bs: usize) -> (DataVerdict, u64) {
        let mut padded = data.to_vec();
        padded.resize(padded.len().next_multiple_of(bs).max(2 * bs), 0);
        let mut check = PngDataCheck { next_chunk: 8 };
        let mut calculated = 0u64;
        let mut file_size = 0u64;
        let mut verdict = DataVerdict::Continue;
        while file_size < padded.len() as u64 && verdict == DataVerdict::Continue {
            let lo = file_size.saturating_sub(bs as u64) as usize;
            let mut window = vec![0u8; bs - (file_size as usize - lo)];
            window.extend_from_slice(&padded[lo..(file_size as usize + bs).min(padded.len())]);
            window.resize(2 * bs, 0);
            let mut cx = DataCheckCtx {
                window:          &window,
                blocksize:       bs as u64,
                file_size,
                calculated_size: &mut calculated,
            };
            verdict = check.check(&mut cx);
            file_size += bs as u64;
        }
        (verdict, calculated)
    }

    #[test]
    fn header_requires_ihdr() {
        let mut w = tiny_png();
        w.resize(64 * 1024, 0);
        assert!(Png.header_check(&w).is_some());
        w[12..16].copy_from_slice(b"JUNK");
        assert!(Png.header_check(&w).is_none());
    }

    #[test]
    fn walks_chunks_to_exact_iend() {
        let png = tiny_png();
        let (verdict, calculated) = drive(&png, 512);
        assert_eq!(verdict, DataVerdict::Stop);
        assert_eq!(calculated, png.len() as u64);
    }

    #[test]
    fn garbage_chunk_type_is_an_error() {
        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend(chunk(b"IHDR", &[0u8; 13]));
        png.extend_from_slice(&[0xFFu8; 64]); // not a chunk
        let (verdict, _) = drive(&png, 512);
        assert_eq!(verdict, DataVerdict::Error);
    }
}
