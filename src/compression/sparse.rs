use std::ops::Range;

/// A capped list of `(index, value)` pairs in strictly ascending index order.
///
/// The capacity is fixed when the delta is allocated, pushing past it is a contract
/// violation of whatever kernel is filling it.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseDelta {
    capacity: usize,
    indices: Vec<usize>,
    values: Vec<f32>,
}

impl SparseDelta {
    /// Creates a new empty `SparseDelta`.
    ///
    /// # Arguments
    /// * `capacity` - The maximum amount of entries it may ever hold.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            indices: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn clear(&mut self) {
        self.indices.clear();
        self.values.clear();
    }

    /// Appends a new entry.
    ///
    /// # Arguments
    /// * `index` - Position in the dense vector, greater than every index already held.
    /// * `value` - The value at that position.
    ///
    /// # Panics
    /// If the delta is full or `index` doesn't keep the indices ascending.
    pub fn push(&mut self, index: usize, value: f32) {
        assert!(
            self.indices.len() < self.capacity,
            "sparse delta capacity of {} exceeded",
            self.capacity
        );
        assert!(
            self.indices.last().is_none_or(|&last| last < index),
            "sparse delta indices must be strictly ascending"
        );

        self.indices.push(index);
        self.values.push(value);
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Iterates over the `(index, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.indices.iter().copied().zip(self.values.iter().copied())
    }

    /// The entries falling inside `range`, rebased so that `range.start` becomes index `0`.
    ///
    /// # Arguments
    /// * `range` - A range of the dense vector, usually a shard.
    pub fn shard_view(&self, range: Range<usize>) -> SparseView<'_> {
        let lo = self.indices.partition_point(|&i| i < range.start);
        let hi = self.indices.partition_point(|&i| i < range.end);

        SparseView {
            offset: range.start,
            len: range.len(),
            indices: &self.indices[lo..hi],
            values: &self.values[lo..hi],
        }
    }

    /// Adds every entry onto `dest`.
    ///
    /// # Panics
    /// If an index falls outside of `dest`.
    pub fn scatter_add(&self, dest: &mut [f32]) {
        self.full_view(dest.len()).scatter_add(dest);
    }

    /// Writes the dense form of the delta into `dest`, zeroing every other entry.
    ///
    /// # Panics
    /// If an index falls outside of `dest`.
    pub fn to_dense(&self, dest: &mut [f32]) {
        self.full_view(dest.len()).to_dense(dest);
    }

    fn full_view(&self, len: usize) -> SparseView<'_> {
        SparseView {
            offset: 0,
            len,
            indices: &self.indices,
            values: &self.values,
        }
    }
}

/// A borrowed sub range of a `SparseDelta`, see `SparseDelta::shard_view`.
#[derive(Debug, Clone, Copy)]
pub struct SparseView<'a> {
    offset: usize,
    len: usize,
    indices: &'a [usize],
    values: &'a [f32],
}

impl SparseView<'_> {
    /// The length of the dense range this view covers.
    pub fn dense_len(&self) -> usize {
        self.len
    }

    /// The amount of entries inside the range.
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    /// Adds every entry onto `dest`, indices rebased to the start of the range.
    ///
    /// # Panics
    /// If the length of `dest` doesn't match the range.
    pub fn scatter_add(&self, dest: &mut [f32]) {
        assert_eq!(dest.len(), self.len, "destination doesn't match the sparse range");

        for (&i, &v) in self.indices.iter().zip(self.values) {
            dest[i - self.offset] += v;
        }
    }

    /// Writes the dense form of the range into `dest`.
    ///
    /// # Panics
    /// If the length of `dest` doesn't match the range.
    pub fn to_dense(&self, dest: &mut [f32]) {
        dest.fill(0.);
        self.scatter_add(dest);
    }
}
