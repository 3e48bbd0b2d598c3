use std::mem;

use parking_lot::Mutex;

use super::{DeltaFetch, fetch::ShardFetch};
use crate::{compression::SparseView, optimization::Optimizer};

/// A contiguous range of the model's parameters with a ring of past versions.
///
/// Slot `version % history` holds the latest parameters, the other slots hold the
/// versions right before it. Every access happens under the shard's mutex, which
/// totally orders the pushes on this shard.
#[derive(Debug)]
pub struct VersionedShard<O: Optimizer> {
    len: usize,
    state: Mutex<ShardState<O>>,
}

#[derive(Debug)]
struct ShardState<O: Optimizer> {
    version: usize,
    history: Box<[Box<[f32]>]>,
    scratch: Vec<f32>,
    optimizer: O,
}

impl<O: Optimizer> ShardState<O> {
    fn slot(&self, version: usize) -> usize {
        version % self.history.len()
    }

    fn latest(&self) -> &[f32] {
        &self.history[self.slot(self.version)]
    }

    /// Opens version `version + 1` as a copy of the current one.
    fn advance(&mut self) -> usize {
        let src = self.slot(self.version);
        let dst = self.slot(self.version + 1);

        if src != dst {
            let (lo, hi) = self.history.split_at_mut(src.max(dst));
            let (from, to) = if src < dst {
                (&lo[src], &mut hi[0])
            } else {
                (&hi[0], &mut lo[dst])
            };
            to.copy_from_slice(from);
        }

        self.version += 1;
        dst
    }

    fn apply(&mut self, grad: &[f32], scale: f32) -> usize {
        let slot = self.advance();
        self.optimizer
            .update_params(grad, &mut self.history[slot], scale);
        slot
    }
}

impl<O: Optimizer> VersionedShard<O> {
    /// Creates a new `VersionedShard` at version `0`.
    ///
    /// # Arguments
    /// * `params` - The initial parameters, copied into every slot.
    /// * `history` - The amount of versions kept, at least `1`.
    /// * `optimizer` - The optimization algorithm of this shard.
    pub fn new(params: &[f32], history: usize, optimizer: O) -> Self {
        assert!(history > 0, "a shard needs at least one version");

        let history = (0..history).map(|_| Box::from(params)).collect();

        Self {
            len: params.len(),
            state: Mutex::new(ShardState {
                version: 0,
                history,
                scratch: Vec::new(),
                optimizer,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The amount of pushes applied so far.
    pub fn version(&self) -> usize {
        self.state.lock().version
    }

    /// Copies the latest parameters into `out`.
    ///
    /// # Returns
    /// The version that was copied.
    ///
    /// # Panics
    /// If `out` doesn't have the shard's length.
    pub fn fetch(&self, out: &mut [f32]) -> usize {
        assert_eq!(out.len(), self.len, "buffer doesn't match the shard size");

        let state = self.state.lock();
        out.copy_from_slice(state.latest());
        state.version
    }

    /// Applies `grad` as a new version.
    ///
    /// # Arguments
    /// * `grad` - The dense gradient for this shard.
    /// * `scale` - The learning rate multiplier of this update.
    /// * `after` - Observes the new parameters before the lock is released.
    ///
    /// # Returns
    /// The new version.
    ///
    /// # Panics
    /// If `grad` doesn't have the shard's length.
    pub fn push_with<F>(&self, grad: &[f32], scale: f32, after: F) -> usize
    where
        F: FnOnce(&[f32]),
    {
        assert_eq!(grad.len(), self.len, "gradient doesn't match the shard size");

        let mut state = self.state.lock();
        let slot = state.apply(grad, scale);
        after(&state.history[slot]);
        state.version
    }

    /// Applies a sparse gradient as a new version, expanding it in the shard's scratch.
    ///
    /// # Panics
    /// If the view doesn't cover the shard's length.
    pub fn push_sparse_with<F>(&self, grad: SparseView<'_>, scale: f32, after: F) -> usize
    where
        F: FnOnce(&[f32]),
    {
        assert_eq!(grad.dense_len(), self.len, "gradient doesn't match the shard size");

        let mut state = self.state.lock();
        let mut dense = mem::take(&mut state.scratch);
        dense.resize(self.len, 0.);
        grad.to_dense(&mut dense);

        let slot = state.apply(&dense, scale);
        state.scratch = dense;
        after(&state.history[slot]);
        state.version
    }

    /// Brings `dest` from version `*local` up to the current one with a sparsified delta.
    ///
    /// The delta is taken against slot `*local % history`, or against the oldest version
    /// still retained when the worker is `history` or more versions behind.
    ///
    /// # Arguments
    /// * `dest` - The worker's copy of this shard.
    /// * `local` - The version the worker holds, updated to the current one.
    /// * `fetch` - The worker's compression scratch for this shard.
    ///
    /// # Panics
    /// If `dest` doesn't match the shard or `*local` is ahead of the shard.
    pub(crate) fn fetch_delta(
        &self,
        dest: &mut [f32],
        local: &mut usize,
        fetch: &mut ShardFetch,
    ) -> DeltaFetch {
        assert_eq!(dest.len(), self.len, "buffer doesn't match the shard size");

        let mut state = self.state.lock();
        let current = state.version;
        assert!(*local <= current, "worker version {local} is ahead of {current}");

        if *local == current {
            return DeltaFetch::Current;
        }

        let history = state.history.len();
        let stale = current - *local >= history;
        let base = if stale { current + 1 - history } else { *local };

        let mut delta = mem::take(&mut state.scratch);
        delta.clear();
        delta.extend(
            state
                .latest()
                .iter()
                .zip(state.history[state.slot(base)].iter())
                .map(|(latest, old)| latest - old),
        );
        state.scratch = delta;

        fetch.sparsifier.sparsify(&state.scratch, &mut fetch.delta);
        fetch.delta.scatter_add(dest);
        *local = current;

        if stale {
            DeltaFetch::Clamped {
                version: current,
                base,
            }
        } else {
            DeltaFetch::Refreshed {
                version: current,
                base,
            }
        }
    }

    /// Overwrites every slot with `params`, keeping the version.
    ///
    /// # Panics
    /// If `params` doesn't have the shard's length.
    pub fn load(&self, params: &[f32]) {
        assert_eq!(params.len(), self.len, "buffer doesn't match the shard size");

        let mut state = self.state.lock();
        state
            .history
            .iter_mut()
            .for_each(|slot| slot.copy_from_slice(params));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{GradientSparsifier, SparseDelta, TopKDrop};

    struct AddOptimizer;

    impl Optimizer for AddOptimizer {
        fn update_params(&mut self, grad: &[f32], params: &mut [f32], scale: f32) {
            params
                .iter_mut()
                .zip(grad)
                .for_each(|(w, g)| *w += g * scale);
        }
    }

    fn lossless(len: usize) -> ShardFetch {
        let sparsifier = GradientSparsifier::new(0., Box::new(TopKDrop::new()));
        let delta = sparsifier.allocate(len);
        ShardFetch { sparsifier, delta }
    }

    #[test]
    fn test_push_keeps_previous_versions() {
        let shard = VersionedShard::new(&[0., 0.], 3, AddOptimizer);

        assert_eq!(shard.push_with(&[1., 2.], 1., |_| {}), 1);
        assert_eq!(shard.push_with(&[1., 2.], 0.5, |_| {}), 2);

        let state = shard.state.lock();
        assert_eq!(*state.history[0], [0., 0.]);
        assert_eq!(*state.history[1], [1., 2.]);
        assert_eq!(*state.history[2], [1.5, 3.]);
    }

    #[test]
    fn test_single_slot_history_updates_in_place() {
        let shard = VersionedShard::new(&[1.], 1, AddOptimizer);
        let mut seen = Vec::new();

        shard.push_with(&[2.], 1., |params| seen.extend_from_slice(params));
        shard.push_with(&[2.], 1., |params| seen.extend_from_slice(params));

        let mut out = [0.];
        assert_eq!(shard.fetch(&mut out), 2);
        assert_eq!(out, [5.]);
        assert_eq!(seen, [3., 5.]);
    }

    #[test]
    fn test_push_sparse_expands_gradient() {
        let shard = VersionedShard::new(&[0.; 4], 2, AddOptimizer);

        let mut grad = SparseDelta::with_capacity(2);
        grad.push(5, 1.);
        grad.push(7, -1.);

        shard.push_sparse_with(grad.shard_view(4..8), 1., |_| {});

        let mut out = [0.; 4];
        shard.fetch(&mut out);
        assert_eq!(out, [0., 1., 0., -1.]);
    }

    #[test]
    fn test_fetch_delta_refreshes_and_clamps() {
        let shard = VersionedShard::new(&[0.; 2], 2, AddOptimizer);
        let mut fetch = lossless(2);

        let mut dest = [0.; 2];
        let mut local = 0;
        assert_eq!(
            shard.fetch_delta(&mut dest, &mut local, &mut fetch),
            DeltaFetch::Current
        );

        shard.push_with(&[1., 1.], 1., |_| {});
        assert_eq!(
            shard.fetch_delta(&mut dest, &mut local, &mut fetch),
            DeltaFetch::Refreshed {
                version: 1,
                base: 0
            }
        );
        assert_eq!((dest, local), ([1., 1.], 1));

        for _ in 0..3 {
            shard.push_with(&[1., 1.], 1., |_| {});
        }
        assert_eq!(
            shard.fetch_delta(&mut dest, &mut local, &mut fetch),
            DeltaFetch::Clamped {
                version: 4,
                base: 3
            }
        );
        assert_eq!((dest, local), ([2., 2.], 4));
    }

    #[test]
    fn test_load_overwrites_every_slot() {
        let shard = VersionedShard::new(&[0.; 2], 2, AddOptimizer);
        shard.load(&[3., 4.]);
        shard.push_with(&[1., 1.], 1., |_| {});

        let state = shard.state.lock();
        assert_eq!(*state.history[0], [3., 4.]);
        assert_eq!(*state.history[1], [4., 5.]);
    }

    #[test]
    #[should_panic(expected = "shard size")]
    fn test_push_rejects_wrong_length() {
        VersionedShard::new(&[0.; 2], 1, AddOptimizer).push_with(&[1.], 1., |_| {});
    }
}
