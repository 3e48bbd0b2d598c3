use std::{num::NonZeroUsize, ops::Range};

/// The exact partition of a flat parameter vector into contiguous shards.
///
/// Shards are ascending, pairwise disjoint and cover `[0, total)` with no gaps. Sizes are
/// balanced, the first `total % shards` shards hold one parameter more than the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
    total: usize,
    ranges: Box<[Range<usize>]>,
}

impl ShardLayout {
    /// Creates a new `ShardLayout`.
    ///
    /// # Arguments
    /// * `total` - The amount of parameters in the model.
    /// * `shards` - The amount of shards to partition the model in.
    pub fn new(total: usize, shards: NonZeroUsize) -> Self {
        let n = shards.get();
        let base = total / n;
        let extra = total % n;

        let mut start = 0;
        let ranges = (0..n)
            .map(|i| {
                let len = base + usize::from(i < extra);
                let range = start..start + len;
                start += len;
                range
            })
            .collect();

        Self { total, ranges }
    }

    /// The amount of parameters covered by the layout.
    pub fn total(&self) -> usize {
        self.total
    }

    /// The amount of shards.
    pub fn shard_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    /// Splits `buf` into one slice per shard.
    ///
    /// # Panics
    /// If the length of `buf` doesn't match the layout's total.
    pub fn split<'a>(&self, buf: &'a [f32]) -> Vec<&'a [f32]> {
        assert_eq!(buf.len(), self.total, "buffer doesn't match the shard layout");

        self.ranges.iter().map(|range| &buf[range.clone()]).collect()
    }

    /// Splits `buf` into one mutable slice per shard.
    ///
    /// # Panics
    /// If the length of `buf` doesn't match the layout's total.
    pub fn split_mut<'a>(&self, buf: &'a mut [f32]) -> Vec<&'a mut [f32]> {
        assert_eq!(buf.len(), self.total, "buffer doesn't match the shard layout");

        let mut rest = buf;
        let mut chunks = Vec::with_capacity(self.ranges.len());

        for range in self.ranges.iter() {
            let (chunk, tail) = rest.split_at_mut(range.len());
            chunks.push(chunk);
            rest = tail;
        }

        chunks
    }
}
