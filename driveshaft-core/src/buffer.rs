//! Segmented read buffer.
//!
//! The stream engine reads the network in chunks and queues them here;
//! the framing decoder peeks at frame headers, skips them, and takes
//! frame bodies off the front. Queued segments are never mutated: a
//! head cursor marks how far into the oldest segment consumption has
//! progressed, and a body that lies inside one segment is taken as a
//! refcounted slice of it, not copied.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// A FIFO of byte segments with zero-copy extraction on the fast path.
#[derive(Debug, Default)]
pub struct SegmentedBuffer {
    segs: VecDeque<Bytes>,
    /// Bytes of `segs[0]` already consumed.
    head: usize,
    /// Unconsumed bytes across all segments.
    len: usize,
}

impl SegmentedBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            segs: VecDeque::new(),
            head: 0,
            len: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a segment. Empty segments are dropped.
    #[inline]
    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.segs.push_back(bytes);
    }

    /// Fill `dst` from the front of the queue without consuming
    /// anything. Returns `false` when fewer than `dst.len()` bytes are
    /// queued, in which case `dst` is untouched — the caller is peeking
    /// at a header that has not fully arrived yet.
    pub fn peek(&self, dst: &mut [u8]) -> bool {
        if dst.len() > self.len {
            return false;
        }
        let mut filled = 0;
        let mut skip = self.head;
        for seg in &self.segs {
            if filled == dst.len() {
                break;
            }
            let avail = &seg[skip..];
            skip = 0;
            let take = avail.len().min(dst.len() - filled);
            dst[filled..filled + take].copy_from_slice(&avail[..take]);
            filled += take;
        }
        true
    }

    /// Consume `n` bytes off the front (a header already peeked at).
    ///
    /// # Panics
    ///
    /// Panics if `n > self.len()`.
    pub fn skip(&mut self, n: usize) {
        assert!(n <= self.len, "skipping past the buffered bytes");
        self.len -= n;
        self.head += n;
        while let Some(front) = self.segs.front() {
            if self.head < front.len() {
                break;
            }
            self.head -= front.len();
            self.segs.pop_front();
        }
    }

    /// Take exactly `n` bytes off the front.
    ///
    /// When the oldest segment covers the request the result is a
    /// refcounted slice of it; otherwise the bytes are gathered into
    /// one contiguous buffer. Returns `None` when fewer than `n` bytes
    /// are queued.
    pub fn take(&mut self, n: usize) -> Option<Bytes> {
        if n > self.len {
            return None;
        }
        if n == 0 {
            return Some(Bytes::new());
        }

        let front = self.segs.front()?;
        if front.len() - self.head >= n {
            let out = front.slice(self.head..self.head + n);
            self.skip(n);
            return Some(out);
        }

        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        let mut skip = self.head;
        for seg in &self.segs {
            if remaining == 0 {
                break;
            }
            let avail = &seg[skip..];
            skip = 0;
            let take = avail.len().min(remaining);
            out.extend_from_slice(&avail[..take]);
            remaining -= take;
        }
        self.skip(n);
        Some(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_len() {
        let mut buf = SegmentedBuffer::new();
        assert!(buf.is_empty());
        buf.push(Bytes::from_static(b"abc"));
        buf.push(Bytes::new());
        buf.push(Bytes::from_static(b"de"));
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_take_within_one_segment_shares_storage() {
        let mut buf = SegmentedBuffer::new();
        let seg = Bytes::from_static(b"hello world");
        buf.push(seg.clone());
        let hello = buf.take(5).unwrap();
        assert_eq!(&hello[..], b"hello");
        // A slice of the pushed segment, not a copy.
        assert_eq!(hello.as_ptr(), seg.as_ptr());
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_take_across_segments() {
        let mut buf = SegmentedBuffer::new();
        buf.push(Bytes::from_static(b"ab"));
        buf.push(Bytes::from_static(b"cd"));
        buf.push(Bytes::from_static(b"ef"));
        let out = buf.take(5).unwrap();
        assert_eq!(&out[..], b"abcde");
        assert_eq!(buf.len(), 1);
        assert_eq!(&buf.take(1).unwrap()[..], b"f");
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut buf = SegmentedBuffer::new();
        buf.push(Bytes::from_static(b"ab"));
        buf.push(Bytes::from_static(b"cd"));
        let mut dst = [0u8; 3];
        assert!(buf.peek(&mut dst));
        assert_eq!(&dst, b"abc");
        assert_eq!(buf.len(), 4);
        assert!(!buf.peek(&mut [0u8; 8]));
    }

    #[test]
    fn test_peek_after_partial_consumption() {
        let mut buf = SegmentedBuffer::new();
        buf.push(Bytes::from_static(b"abcd"));
        buf.push(Bytes::from_static(b"ef"));
        buf.skip(3);
        let mut dst = [0u8; 3];
        assert!(buf.peek(&mut dst));
        assert_eq!(&dst, b"def");
    }

    #[test]
    fn test_skip_drops_consumed_segments() {
        let mut buf = SegmentedBuffer::new();
        buf.push(Bytes::from_static(b"abcd"));
        buf.push(Bytes::from_static(b"ef"));
        buf.skip(5);
        assert_eq!(buf.len(), 1);
        assert_eq!(&buf.take(1).unwrap()[..], b"f");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_too_many() {
        let mut buf = SegmentedBuffer::new();
        buf.push(Bytes::from_static(b"ab"));
        assert!(buf.take(3).is_none());
        assert_eq!(buf.len(), 2);
        assert_eq!(&buf.take(2).unwrap()[..], b"ab");
    }

    #[test]
    fn test_zero_length_take() {
        let mut buf = SegmentedBuffer::new();
        assert_eq!(buf.take(0).unwrap().len(), 0);
        buf.push(Bytes::from_static(b"x"));
        assert_eq!(buf.take(0).unwrap().len(), 0);
        assert_eq!(buf.len(), 1);
    }
}
