//! Sliding read buffer — one block of lookbehind plus a read-ahead window.
//!
//! # Layout
//!
//! ```text
//! [ blocksize bytes of "old data" | READ_CHUNK bytes read ahead ]
//!                                 ^ window start slides right by blocksize
//! ```
//!
//! Header matchers receive [`window`](SlidingBuffer::window), a view of
//! `max(blocksize, 64 KiB)` bytes at the cursor with `blocksize` bytes of
//! context behind it — TAR continuation inspects the 512 bytes before the
//! cursor via [`lookbehind`](SlidingBuffer::lookbehind).
//!
//! After consuming a block the window slides forward.  When it would run
//! past the read-ahead, or after any discontinuity (file finalized, cursor
//! jumped), the buffer is [`reset`](SlidingBuffer::reset): the last consumed
//! block is copied into the old-data slot (continuous advance) or the slot
//! is zeroed (discontinuity), and the caller issues a fresh read at the new
//! cursor.

/// Bytes fetched per refill.
pub const READ_CHUNK: usize = 512 * 1024;

/// Window length handed to header matchers.
const MATCH_WINDOW: usize = 64 * 1024;

pub struct SlidingBuffer {
    buf:        Vec<u8>,
    blocksize:  usize,
    window_len: usize,
    /// Offset of the cursor block within `buf`; always `>= blocksize`.
    window:     usize,
}

impl SlidingBuffer {
    pub fn new(blocksize: usize) -> Self {
        assert!(blocksize > 0 && blocksize <= READ_CHUNK, "unusable blocksize {blocksize}");
        Self {
            buf:        vec![0u8; blocksize + READ_CHUNK],
            blocksize,
            window_len: blocksize.max(MATCH_WINDOW),
            window:     blocksize,
        }
    }

    /// Matcher view at the cursor.
    #[inline]
    pub fn window(&self) -> &[u8] {
        debug_assert!(!self.needs_reset(), "window read past read-ahead");
        &self.buf[self.window..self.window + self.window_len]
    }

    /// The cursor block itself.
    #[inline]
    pub fn current_block(&self) -> &[u8] {
        &self.buf[self.window..self.window + self.blocksize]
    }

    /// Previous block + current block, the view given to `data_check`.
    #[inline]
    pub fn data_window(&self) -> &[u8] {
        &self.buf[self.window - self.blocksize..self.window + self.blocksize]
    }

    /// `n` bytes immediately before the cursor, when that much context exists.
    pub fn lookbehind(&self, n: usize) -> Option<&[u8]> {
        (self.window >= n).then(|| &self.buf[self.window - n..self.window])
    }

    /// Slide the window one block forward.
    #[inline]
    pub fn advance(&mut self) {
        self.window += self.blocksize;
    }

    /// Overwrite the cursor block with the previous block, so that after the
    /// next [`advance`](Self::advance) the lookbehind still shows the block
    /// preceding a skipped one (indirect-block skip).
    pub fn copy_back(&mut self) {
        let (old, cur) = self.buf.split_at_mut(self.window);
        cur[..self.blocksize].copy_from_slice(&old[self.window - self.blocksize..]);
    }

    /// True when the matcher window would run past the read-ahead.
    #[inline]
    pub fn needs_reset(&self) -> bool {
        self.window + self.window_len > self.buf.len()
    }

    /// Rewind the window to the front and return the read-ahead slice to be
    /// filled at the new cursor.  On a continuous advance the last consumed
    /// block becomes the new old-data; on a discontinuity the old-data slot
    /// is zeroed (there is no valid context at the new position).
    pub fn reset(&mut self, discontinuity: bool) -> &mut [u8] {
        if discontinuity {
            self.buf[..self.blocksize].fill(0);
        } else {
            let (front, rest) = self.buf.split_at_mut(self.window - self.blocksize);
            let bs = self.blocksize;
            if self.window == bs {
                // Window never moved; old data is already in place.
            } else {
                front[..bs].copy_from_slice(&rest[..bs]);
            }
        }
        self.window = self.blocksize;
        &mut self.buf[self.blocksize..]
    }
}
