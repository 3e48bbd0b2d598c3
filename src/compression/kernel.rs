use super::SparseDelta;

/// The numeric capability that decides which entries of a dense buffer survive.
///
/// Kernels must keep the output ascending and within `SparseDelta::capacity`, a kernel
/// that retains more entries than `retained(len, drop_rate)` violates its contract.
pub trait DropKernel {
    /// Writes the entries of `dense` that survive `drop_rate` into `out`, clearing it first.
    ///
    /// # Arguments
    /// * `dense` - The dense buffer to compress.
    /// * `drop_rate` - The fraction of entries to drop, in `[0, 1)`.
    /// * `out` - Where the surviving entries are written.
    fn select(&mut self, dense: &[f32], drop_rate: f32, out: &mut SparseDelta);
}

/// The amount of entries a kernel keeps out of `len` for a given drop rate.
pub fn retained(len: usize, drop_rate: f32) -> usize {
    let keep = (len as f64 * (1. - f64::from(drop_rate))).ceil() as usize;
    keep.min(len)
}

/// Keeps the largest entries by magnitude.
///
/// Ties at the threshold are broken by ascending index and zeros are never emitted, so
/// the output is fully determined by the input.
#[derive(Debug, Default)]
pub struct TopKDrop {
    magnitudes: Vec<f32>,
}

impl TopKDrop {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DropKernel for TopKDrop {
    fn select(&mut self, dense: &[f32], drop_rate: f32, out: &mut SparseDelta) {
        out.clear();

        let keep = retained(dense.len(), drop_rate);
        if keep == 0 {
            return;
        }

        self.magnitudes.clear();
        self.magnitudes.extend(dense.iter().map(|v| v.abs()));

        let pivot = dense.len() - keep;
        let (_, &mut threshold, _) = self
            .magnitudes
            .select_nth_unstable_by(pivot, |a, b| a.total_cmp(b));

        let above = dense.iter().filter(|v| v.abs() > threshold).count();
        let mut ties = keep - above;

        for (i, &v) in dense.iter().enumerate() {
            let magnitude = v.abs();

            let survives = if magnitude > threshold {
                true
            } else if magnitude == threshold && ties > 0 {
                ties -= 1;
                true
            } else {
                false
            };

            if survives && v != 0. {
                out.push(i, v);
            }
        }
    }
}

/// A `TopKDrop` with error feedback: the mass it drops is carried over and added to the
/// next buffer it compresses.
#[derive(Debug)]
pub struct ResidualDrop {
    inner: TopKDrop,
    residual: Box<[f32]>,
    corrected: Vec<f32>,
}

impl ResidualDrop {
    /// Creates a new `ResidualDrop` kernel.
    ///
    /// # Arguments
    /// * `len` - The length of the buffers it will compress.
    pub fn new(len: usize) -> Self {
        Self {
            inner: TopKDrop::new(),
            residual: vec![0.; len].into_boxed_slice(),
            corrected: Vec::with_capacity(len),
        }
    }

    pub fn residual(&self) -> &[f32] {
        &self.residual
    }
}

impl DropKernel for ResidualDrop {
    fn select(&mut self, dense: &[f32], drop_rate: f32, out: &mut SparseDelta) {
        assert_eq!(dense.len(), self.residual.len(), "residual doesn't match the buffer");

        self.corrected.clear();
        self.corrected
            .extend(dense.iter().zip(self.residual.iter()).map(|(d, r)| d + r));

        self.inner.select(&self.corrected, drop_rate, out);

        self.residual.copy_from_slice(&self.corrected);
        for &i in out.indices() {
            self.residual[i] = 0.;
        }
    }
}
