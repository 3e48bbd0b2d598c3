use super::{DropKernel, SparseDelta};

/// Over-allocation applied on top of the expected amount of surviving entries.
const CAPACITY_SLACK: f64 = 1.2;

/// The capacity a sparse buffer needs to hold the compressed form of `len` entries.
///
/// # Arguments
/// * `len` - The length of the dense buffer.
/// * `drop_rate` - The fraction of entries dropped.
pub fn capacity_for(len: usize, drop_rate: f32) -> usize {
    (len as f64 * CAPACITY_SLACK * (1. - f64::from(drop_rate))).ceil() as usize
}

/// Compresses dense buffers into `SparseDelta`s through a `DropKernel`.
///
/// It owns the allocation side of compression, buffers are sized once for the worst
/// case and reused on every call.
pub struct GradientSparsifier {
    drop_rate: f32,
    kernel: Box<dyn DropKernel + Send>,
}

impl GradientSparsifier {
    /// Creates a new `GradientSparsifier`.
    ///
    /// # Arguments
    /// * `drop_rate` - The fraction of entries to drop, in `[0, 1)`.
    /// * `kernel` - The kernel deciding which entries survive.
    pub fn new(drop_rate: f32, kernel: Box<dyn DropKernel + Send>) -> Self {
        Self { drop_rate, kernel }
    }

    /// Allocates a sparse buffer able to hold the compressed form of `len` entries.
    pub fn allocate(&self, len: usize) -> SparseDelta {
        SparseDelta::with_capacity(capacity_for(len, self.drop_rate))
    }

    /// Compresses `dense` into `out`.
    ///
    /// # Panics
    /// If the kernel retains more entries than `out` can hold.
    pub fn sparsify(&mut self, dense: &[f32], out: &mut SparseDelta) {
        self.kernel.select(dense, self.drop_rate, out);
    }
}
