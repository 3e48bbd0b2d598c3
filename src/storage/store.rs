use std::{num::NonZeroUsize, sync::Arc};

use log::{debug, warn};
use rayon::prelude::*;

use super::{FetchReport, FetchState, ShardLayout, VersionTable, VersionedShard};
use crate::{averaging::MovingAverage, compression::SparseDelta, optimization::Optimizer};

/// Partitions the model's parameters in versioned shards, one per device, and
/// leverages parallelization to read and write them as fast as possible.
///
/// Pushes on a shard are totally ordered by its mutex, there is no ordering between
/// shards. Cloning is cheap and every clone shares the same shards.
#[derive(Debug)]
pub struct ParameterStore<O: Optimizer> {
    layout: Arc<ShardLayout>,
    shards: Arc<[VersionedShard<O>]>,
    history: NonZeroUsize,
    average_batch_words: Option<f32>,
    average: Option<Arc<MovingAverage>>,
}

impl<O: Optimizer> Clone for ParameterStore<O> {
    fn clone(&self) -> Self {
        Self {
            layout: Arc::clone(&self.layout),
            shards: Arc::clone(&self.shards),
            history: self.history,
            average_batch_words: self.average_batch_words,
            average: self.average.clone(),
        }
    }
}

impl<O: Optimizer + Send> ParameterStore<O> {
    /// Creates a new `ParameterStore`.
    ///
    /// # Arguments
    /// * `params` - The initial parameters of the model.
    /// * `shards` - The amount of shards, one per device.
    /// * `history` - The amount of versions kept per shard.
    /// * `optimizer_factory` - An `Optimizer` factory closure, given each shard's length.
    ///
    /// # Returns
    /// A new `ParameterStore` instance.
    pub fn new<OF>(
        params: &[f32],
        shards: NonZeroUsize,
        history: NonZeroUsize,
        mut optimizer_factory: OF,
    ) -> Self
    where
        OF: FnMut(usize) -> O,
    {
        let layout = ShardLayout::new(params.len(), shards);

        let shards: Vec<_> = layout
            .split(params)
            .into_iter()
            .map(|chunk| {
                let optimizer = optimizer_factory(chunk.len());
                VersionedShard::new(chunk, history.get(), optimizer)
            })
            .collect();

        Self {
            layout: Arc::new(layout),
            shards: Arc::from(shards),
            history,
            average_batch_words: None,
            average: None,
        }
    }

    /// Scales every update's learning rate by `words / average_batch_words`.
    pub fn with_lr_scaling(mut self, average_batch_words: f32) -> Self {
        self.average_batch_words = Some(average_batch_words);
        self
    }

    /// Maintains shadow parameters updated on every push.
    ///
    /// # Arguments
    /// * `max_decay` - The upper bound for the moving average decay.
    pub fn with_moving_average(mut self, max_decay: f32) -> Self {
        let average = MovingAverage::new(self.layout.shard_count(), max_decay);
        self.average = Some(Arc::new(average));
        self
    }

    pub fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.layout.total()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.total() == 0
    }

    pub fn history(&self) -> NonZeroUsize {
        self.history
    }

    pub fn moving_average(&self) -> Option<&MovingAverage> {
        self.average.as_deref()
    }

    /// The current version of every shard.
    pub fn versions(&self) -> Vec<usize> {
        self.shards.iter().map(VersionedShard::version).collect()
    }

    /// Whether any shard has been updated.
    pub fn started(&self) -> bool {
        self.shards.iter().any(|shard| shard.version() > 0)
    }

    /// Copies the latest parameters of every shard into `dest`.
    ///
    /// # Arguments
    /// * `dest` - The worker's flat parameter buffer.
    /// * `versions` - Receives the version copied from each shard.
    ///
    /// # Panics
    /// If `dest` or `versions` don't match the store.
    pub fn fetch_dense(&self, dest: &mut [f32], versions: &mut VersionTable) {
        assert_eq!(versions.len(), self.shards.len(), "version table doesn't match the store");

        self.shards
            .par_iter()
            .zip(self.layout.split_mut(dest))
            .zip(versions.as_mut_slice().par_iter_mut())
            .for_each(|((shard, out), version)| *version = shard.fetch(out));
    }

    /// Brings `dest` up to the current parameters through sparsified deltas.
    ///
    /// Shards already at the worker's version are left untouched. Shards the worker
    /// holds a version of that is no longer retained are refreshed from the oldest
    /// retained version instead, the difference is lost.
    ///
    /// # Panics
    /// If `dest` or `state` don't match the store.
    pub fn fetch_sparse(&self, dest: &mut [f32], state: &mut FetchState) -> FetchReport {
        let (versions, fetches) = state.parts_mut();
        assert_eq!(fetches.len(), self.shards.len(), "fetch state doesn't match the store");

        let report: FetchReport = self
            .shards
            .par_iter()
            .zip(self.layout.split_mut(dest))
            .zip(versions.par_iter_mut())
            .zip(fetches.par_iter_mut())
            .map(|(((shard, out), local), fetch)| shard.fetch_delta(out, local, fetch))
            .collect::<Vec<_>>()
            .into_iter()
            .collect();

        if report.is_lossy() {
            warn!(
                clamped = report.clamped, history = self.history.get();
                "worker fell behind the retained history, deltas were truncated"
            );
        }

        report
    }

    /// Applies `grad` to `shard` as a new version.
    ///
    /// # Arguments
    /// * `shard` - The shard index.
    /// * `grad` - The dense gradient of the shard.
    /// * `words` - The amount of target words behind the gradient.
    /// * `batches` - The amount of batches processed by the whole group.
    ///
    /// # Returns
    /// The shard's new version.
    ///
    /// # Panics
    /// If `shard` is out of range or `grad` doesn't match it.
    pub fn push_shard(&self, shard: usize, grad: &[f32], words: usize, batches: usize) -> usize {
        let scale = self.scale(words);
        self.shards[shard].push_with(grad, scale, |live| self.track(shard, live, batches))
    }

    /// Applies a gradient of the whole model, one new version per shard.
    ///
    /// # Panics
    /// If `grad` doesn't match the store.
    pub fn push(&self, grad: &[f32], words: usize, batches: usize) {
        let scale = self.scale(words);

        self.shards
            .par_iter()
            .zip(self.layout.split(grad))
            .enumerate()
            .for_each(|(i, (shard, chunk))| {
                shard.push_with(chunk, scale, |live| self.track(i, live, batches));
            });

        debug!(words = words, batches = batches, scale = scale; "pushed dense gradient");
    }

    /// Applies a sparse gradient of the whole model, one new version per shard.
    ///
    /// # Panics
    /// If an index of `grad` falls outside of the store.
    pub fn push_sparse(&self, grad: &SparseDelta, words: usize, batches: usize) {
        assert!(
            grad.indices().last().is_none_or(|&i| i < self.len()),
            "sparse gradient doesn't match the store"
        );

        let scale = self.scale(words);

        self.shards
            .par_iter()
            .zip(self.layout.ranges())
            .enumerate()
            .for_each(|(i, (shard, range))| {
                let view = grad.shard_view(range.clone());
                shard.push_sparse_with(view, scale, |live| self.track(i, live, batches));
            });

        debug!(words = words, nnz = grad.len(), scale = scale; "pushed sparse gradient");
    }

    /// A dense copy of the latest parameters, each shard a complete single version.
    pub fn snapshot(&self) -> Vec<f32> {
        let mut out = vec![0.; self.len()];

        self.shards
            .par_iter()
            .zip(self.layout.split_mut(&mut out))
            .for_each(|(shard, chunk)| {
                shard.fetch(chunk);
            });

        out
    }

    /// Overwrites the parameters of every shard and version.
    ///
    /// # Panics
    /// If `params` doesn't match the store.
    pub fn load(&self, params: &[f32]) {
        self.shards
            .par_iter()
            .zip(self.layout.split(params))
            .for_each(|(shard, chunk)| shard.load(chunk));
    }

    fn scale(&self, words: usize) -> f32 {
        self.average_batch_words
            .map_or(1., |average| words as f32 / average)
    }

    fn track(&self, shard: usize, live: &[f32], batches: usize) {
        if let Some(average) = &self.average {
            average.update(shard, live, batches);
        }
    }
}
