//! Ordered byte segments treated as one logical window.
//!
//! A `BufferSet` mixes read-only segments (shared `Bytes`, typically encoded
//! frames) with writable segments of fixed capacity. Readers consume from the
//! front; writers fill writable segments behind the last queued data so byte
//! order is preserved.

use std::collections::VecDeque;
use std::io::IoSlice;

use bytes::Bytes;

use crate::error::{PgError, PgResult};

enum Segment {
    ReadOnly { data: Bytes, read: usize },
    Writable { data: Box<[u8]>, read: usize, write: usize },
}

impl Segment {
    fn readable(&self) -> &[u8] {
        match self {
            Segment::ReadOnly { data, read } => &data[*read..],
            Segment::Writable { data, read, write } => &data[*read..*write],
        }
    }

    fn consume(&mut self, n: usize) {
        match self {
            Segment::ReadOnly { read, .. } | Segment::Writable { read, .. } => *read += n,
        }
    }

    fn free(&self) -> usize {
        match self {
            Segment::ReadOnly { .. } => 0,
            Segment::Writable { data, write, .. } => data.len() - *write,
        }
    }

    /// Fully read and unable to take more data.
    fn exhausted(&self) -> bool {
        self.readable().is_empty() && self.free() == 0
    }
}

/// Ordered list of byte segments.
#[derive(Default)]
pub struct BufferSet {
    segments: VecDeque<Segment>,
    /// Index of the first segment `put` may write into.
    write_seg: usize,
}

impl BufferSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set of empty writable segments with the given capacities.
    pub fn with_segments(capacities: &[usize]) -> Self {
        let mut set = Self::new();
        for &cap in capacities {
            set.push_writable(cap);
        }
        set
    }

    /// Queue shared bytes behind everything already queued.
    pub fn push_bytes(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.segments.push_back(Segment::ReadOnly { data, read: 0 });
        self.write_seg = self.segments.len();
    }

    /// Append an empty writable segment.
    pub fn push_writable(&mut self, capacity: usize) {
        self.segments.push_back(Segment::Writable {
            data: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
        });
    }

    /// Bytes available to read.
    pub fn remaining(&self) -> usize {
        self.segments.iter().map(|s| s.readable().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Space left for `put`.
    pub fn writable(&self) -> usize {
        self.segments.iter().skip(self.write_seg).map(Segment::free).sum()
    }

    /// True when nothing can be written into the set.
    pub fn is_read_only(&self) -> bool {
        !self
            .segments
            .iter()
            .skip(self.write_seg)
            .any(|s| matches!(s, Segment::Writable { .. }))
    }

    /// Copy `src` into writable segments, each bounded by its free space.
    /// Returns how many bytes were taken.
    pub fn put(&mut self, src: &[u8]) -> PgResult<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        if self.is_read_only() {
            return Err(PgError::InvalidArgument(
                "buffer set has no writable segment".to_string(),
            ));
        }

        let mut written = 0;
        while written < src.len() && self.write_seg < self.segments.len() {
            let Some(Segment::Writable { data, write, .. }) = self.segments.get_mut(self.write_seg)
            else {
                self.write_seg += 1;
                continue;
            };
            let n = (data.len() - *write).min(src.len() - written);
            data[*write..*write + n].copy_from_slice(&src[written..written + n]);
            *write += n;
            written += n;
            if *write == data.len() {
                self.write_seg += 1;
            }
        }
        Ok(written)
    }

    /// Copy readable bytes into `dst`. Returns how many bytes were copied.
    pub fn get(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for segment in self.segments.iter_mut() {
            if copied == dst.len() {
                break;
            }
            let readable = segment.readable();
            let n = readable.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&readable[..n]);
            segment.consume(n);
            copied += n;
        }
        self.compact();
        copied
    }

    /// Discard `n` readable bytes from the front.
    pub fn advance(&mut self, mut n: usize) {
        for segment in self.segments.iter_mut() {
            if n == 0 {
                break;
            }
            let step = segment.readable().len().min(n);
            segment.consume(step);
            n -= step;
        }
        self.compact();
    }

    /// Readable regions in order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.segments
            .iter()
            .map(Segment::readable)
            .filter(|c| !c.is_empty())
    }

    /// Fill `dst` with slices over the readable regions for a vectored write.
    pub fn io_slices<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        let mut n = 0;
        for (slot, chunk) in dst.iter_mut().zip(self.chunks()) {
            *slot = IoSlice::new(chunk);
            n += 1;
        }
        n
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.write_seg = 0;
    }

    fn compact(&mut self) {
        while self.segments.front().is_some_and(Segment::exhausted) {
            self.segments.pop_front();
            self.write_seg = self.write_seg.saturating_sub(1);
        }
    }
}

impl std::fmt::Debug for BufferSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferSet")
            .field("segments", &self.segments.len())
            .field("remaining", &self.remaining())
            .field("writable", &self.writable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_across_segments() {
        let mut set = BufferSet::with_segments(&[3, 4, 5]);
        assert_eq!(set.writable(), 12);

        let src: Vec<u8> = (0..10).collect();
        assert_eq!(set.put(&src).unwrap(), 10);
        assert_eq!(set.remaining(), 10);
        assert_eq!(set.writable(), 2);

        let mut dst = [0u8; 10];
        assert_eq!(set.get(&mut dst), 10);
        assert_eq!(dst.to_vec(), src);
        assert_eq!(set.remaining(), 0);
    }

    #[test]
    fn test_put_bounded_by_capacity() {
        let mut set = BufferSet::with_segments(&[2, 2]);
        assert_eq!(set.put(b"abcdef").unwrap(), 4);
        assert_eq!(set.writable(), 0);
        assert!(set.is_read_only());
        assert!(set.put(b"x").is_err());

        let mut dst = [0u8; 8];
        assert_eq!(set.get(&mut dst), 4);
        assert_eq!(&dst[..4], b"abcd");
    }

    #[test]
    fn test_read_only_segments() {
        let mut set = BufferSet::new();
        assert!(set.is_read_only());

        set.push_bytes(Bytes::from_static(b"hello "));
        set.push_bytes(Bytes::from_static(b"world"));
        assert!(set.put(b"!").is_err());
        assert_eq!(set.remaining(), 11);

        let joined: Vec<u8> = set.chunks().flatten().copied().collect();
        assert_eq!(joined, b"hello world");
    }

    #[test]
    fn test_writes_land_behind_queued_data() {
        let mut set = BufferSet::with_segments(&[4]);
        set.put(b"ab").unwrap();
        set.push_bytes(Bytes::from_static(b"cd"));
        set.push_writable(4);
        set.put(b"ef").unwrap();

        let mut dst = [0u8; 6];
        assert_eq!(set.get(&mut dst), 6);
        assert_eq!(&dst, b"abcdef");
    }

    #[test]
    fn test_advance_and_io_slices() {
        let mut set = BufferSet::new();
        set.push_bytes(Bytes::from_static(b"abc"));
        set.push_bytes(Bytes::from_static(b"def"));

        let mut slices = [IoSlice::new(&[]); 4];
        assert_eq!(set.io_slices(&mut slices), 2);

        set.advance(4);
        assert_eq!(set.remaining(), 2);
        assert_eq!(set.chunks().next(), Some(&b"ef"[..]));

        set.advance(2);
        assert!(set.is_empty());
    }
}
