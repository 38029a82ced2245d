//! Splits an unframed byte stream into application frames.
//!
//! Both framers own their accumulating buffer for exactly one pipeline run.
//! `push` appends the newly arrived bytes and returns a lazy iterator over the
//! complete frames now available. Frames not pulled from the iterator stay
//! buffered and are yielded by the next `push`.

use bytes::{Buf, Bytes, BytesMut};

/// JPEG start-of-image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Fixed-length framing for raw video once the frame size is known.
pub struct FixedFramer {
    frame_size: usize,
    buf: BytesMut,
    /// Bytes still to discard to reach the next frame boundary while skipping.
    skip_pending: usize,
}

impl FixedFramer {
    pub fn new(frame_size: usize) -> Self {
        assert!(frame_size > 0, "frame size must be positive");
        Self {
            frame_size,
            buf: BytesMut::with_capacity(frame_size),
            skip_pending: 0,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn push(&mut self, chunk: &[u8]) -> FixedFrames<'_> {
        let chunk = self.consume_skip(chunk);
        self.buf.extend_from_slice(chunk);
        FixedFrames { framer: self }
    }

    /// Advances over `chunk` without producing frames, keeping frame
    /// alignment so framing can resume on a boundary later. Returns the
    /// number of frames passed over.
    pub fn skip(&mut self, chunk: &[u8]) -> usize {
        let was_skipping = self.skip_pending > 0;
        let mut chunk = self.consume_skip(chunk);
        let mut skipped = usize::from(was_skipping && self.skip_pending == 0);
        // Frames left unpulled by an earlier `push` are passed over too.
        let buffered = self.buf.len() / self.frame_size;
        if buffered > 0 {
            self.buf.advance(buffered * self.frame_size);
            skipped += buffered;
        }
        if chunk.is_empty() {
            return skipped;
        }
        if !self.buf.is_empty() {
            let missing = self.frame_size - self.buf.len();
            if chunk.len() < missing {
                self.buf.extend_from_slice(chunk);
                return skipped;
            }
            self.buf.clear();
            chunk = &chunk[missing..];
            skipped += 1;
        }
        skipped += chunk.len() / self.frame_size;
        let tail = chunk.len() % self.frame_size;
        if tail > 0 {
            self.skip_pending = self.frame_size - tail;
        }
        skipped
    }

    fn consume_skip<'c>(&mut self, chunk: &'c [u8]) -> &'c [u8] {
        let n = self.skip_pending.min(chunk.len());
        self.skip_pending -= n;
        &chunk[n..]
    }

    /// Bytes retained for the next call, including a partially skipped frame.
    pub fn remainder_len(&self) -> usize {
        if self.skip_pending > 0 {
            self.frame_size - self.skip_pending
        } else {
            self.buf.len()
        }
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.skip_pending = 0;
    }
}

pub struct FixedFrames<'a> {
    framer: &'a mut FixedFramer,
}

impl Iterator for FixedFrames<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Self::Item> {
        let size = self.framer.frame_size;
        if self.framer.buf.len() < size {
            return None;
        }
        Some(self.framer.buf.split_to(size).freeze())
    }
}

/// Marker-delimited framing for a concatenated JPEG stream.
pub struct MarkerFramer {
    buf: BytesMut,
    /// Offset from which the end-marker search resumes for the pending frame.
    eoi_scan_from: usize,
}

impl Default for MarkerFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkerFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            eoi_scan_from: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> MarkerFrames<'_> {
        self.buf.extend_from_slice(chunk);
        MarkerFrames { framer: self }
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.eoi_scan_from = 0;
    }

    fn next_frame(&mut self) -> Option<Bytes> {
        let Some(start) = find_marker(&self.buf, SOI, 0) else {
            // Keep a trailing 0xFF: it may be the first half of a split marker.
            let keep = usize::from(self.buf.last() == Some(&SOI[0]));
            let len = self.buf.len();
            self.buf.advance(len - keep);
            self.eoi_scan_from = 0;
            return None;
        };
        if start > 0 {
            self.buf.advance(start);
            self.eoi_scan_from = self.eoi_scan_from.saturating_sub(start);
        }

        let from = self.eoi_scan_from.max(SOI.len());
        match find_marker(&self.buf, EOI, from) {
            Some(end) => {
                self.eoi_scan_from = 0;
                Some(self.buf.split_to(end + EOI.len()).freeze())
            }
            None => {
                self.eoi_scan_from = self.buf.len().saturating_sub(1).max(SOI.len());
                None
            }
        }
    }
}

pub struct MarkerFrames<'a> {
    framer: &'a mut MarkerFramer,
}

impl Iterator for MarkerFrames<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_frame()
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    if haystack.len() < from + 2 {
        return None;
    }
    haystack[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

#[cfg(test)]
#[path = "framer_test.rs"]
mod framer_test;
