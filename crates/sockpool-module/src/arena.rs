//! `BufferArena`: one pre-allocated block carved into fixed-size segments.
//!
//! The whole block is allocated once by `warm()`. Segments are handed out
//! as owned [`Segment`] handles that view disjoint ranges of that block,
//! so no two holders can ever touch the same bytes. A released segment is
//! reused before any fresh one (LIFO), which keeps recently used memory hot.
//!
//! Capacity is sized to match the worker pool exactly. Running out is a
//! configuration error and `acquire()` reports it as `None`.

use bytes::BytesMut;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

use crate::lock;

/// Owned view of one arena segment.
pub struct Segment {
    /// Position of this segment in the arena.
    index: usize,
    /// Byte offset of this segment from the start of the block.
    offset: usize,
    buf: BytesMut,
}

impl Segment {
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Byte offset from the start of the arena block.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Segment size in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Zero the segment's bytes.
    pub fn zero(&mut self) {
        self.buf.fill(0);
    }
}

impl Deref for Segment {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for Segment {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("index", &self.index)
            .field("offset", &self.offset)
            .field("len", &self.buf.len())
            .finish()
    }
}

struct ArenaState {
    /// Unsplit tail of the block. `None` until warmed.
    remaining: Option<BytesMut>,
    /// Offset of the next never-used segment.
    cursor: usize,
    /// LIFO stack of released segments.
    free: Vec<Segment>,
    /// Segments currently held outside the arena.
    in_use: usize,
}

pub struct BufferArena {
    segment_size: usize,
    segments: usize,
    state: Mutex<ArenaState>,
}

impl BufferArena {
    /// Describe an arena of `segments` segments of `segment_size` bytes.
    ///
    /// Nothing is allocated until `warm()`.
    pub fn new(segment_size: usize, segments: usize) -> Self {
        Self {
            segment_size,
            segments,
            state: Mutex::new(ArenaState {
                remaining: None,
                cursor: 0,
                free: Vec::with_capacity(segments),
                in_use: 0,
            }),
        }
    }

    /// Allocate the backing block. Calling it again is a no-op.
    pub fn warm(&self) {
        let mut state = lock(&self.state);
        if state.remaining.is_none() && state.cursor == 0 {
            state.remaining = Some(BytesMut::zeroed(self.segment_size * self.segments));
        }
    }

    /// Take a segment: the most recently released one, else the next fresh one.
    ///
    /// Returns `None` if the arena is not warmed or is exhausted.
    pub fn acquire(&self) -> Option<Segment> {
        let mut state = lock(&self.state);
        if let Some(seg) = state.free.pop() {
            state.in_use += 1;
            return Some(seg);
        }

        let size = self.segment_size;
        let cursor = state.cursor;
        let remaining = state.remaining.as_mut()?;
        if remaining.len() < size || size == 0 {
            return None;
        }
        let buf = remaining.split_to(size);
        state.cursor += size;
        state.in_use += 1;

        Some(Segment {
            index: cursor / size,
            offset: cursor,
            buf,
        })
    }

    /// Return a segment to the free list.
    pub fn release(&self, segment: Segment) {
        let mut state = lock(&self.state);
        state.in_use = state.in_use.saturating_sub(1);
        state.free.push(segment);
    }

    #[inline]
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Total number of segments the block holds.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.segments
    }

    /// Segments currently held outside the arena.
    pub fn in_use(&self) -> usize {
        lock(&self.state).in_use
    }

    /// Released segments waiting for reuse.
    pub fn free_count(&self) -> usize {
        lock(&self.state).free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_sequential_offsets() {
        let arena = BufferArena::new(16, 4);
        arena.warm();

        let a = arena.acquire().unwrap();
        let b = arena.acquire().unwrap();
        let c = arena.acquire().unwrap();

        assert_eq!((a.index(), a.offset()), (0, 0));
        assert_eq!((b.index(), b.offset()), (1, 16));
        assert_eq!((c.index(), c.offset()), (2, 32));
        assert_eq!(a.capacity(), 16);
        assert_eq!(arena.in_use(), 3);
    }

    #[test]
    fn test_unwarmed_arena_hands_out_nothing() {
        let arena = BufferArena::new(16, 4);
        assert!(arena.acquire().is_none());
    }

    #[test]
    fn test_exhaustion() {
        let arena = BufferArena::new(8, 2);
        arena.warm();
        let _a = arena.acquire().unwrap();
        let _b = arena.acquire().unwrap();
        assert!(arena.acquire().is_none());
    }

    #[test]
    fn test_release_reuse_is_lifo() {
        let arena = BufferArena::new(8, 3);
        arena.warm();
        let a = arena.acquire().unwrap();
        let b = arena.acquire().unwrap();

        arena.release(a);
        arena.release(b);
        assert_eq!(arena.free_count(), 2);
        assert_eq!(arena.in_use(), 0);

        // b was released last, so it comes back first.
        let again = arena.acquire().unwrap();
        assert_eq!(again.offset(), 8);
    }

    #[test]
    fn test_segments_do_not_overlap() {
        let arena = BufferArena::new(4, 3);
        arena.warm();
        let mut a = arena.acquire().unwrap();
        let mut b = arena.acquire().unwrap();
        let c = arena.acquire().unwrap();

        a.copy_from_slice(b"aaaa");
        b.copy_from_slice(b"bbbb");

        assert_eq!(&a[..], b"aaaa");
        assert_eq!(&b[..], b"bbbb");
        assert_eq!(&c[..], &[0u8; 4]);
    }

    #[test]
    fn test_warm_twice_keeps_state() {
        let arena = BufferArena::new(4, 2);
        arena.warm();
        let _a = arena.acquire().unwrap();
        arena.warm();
        let _b = arena.acquire().unwrap();
        assert!(arena.acquire().is_none());
    }
}
