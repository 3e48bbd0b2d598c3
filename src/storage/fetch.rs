use std::ops::AddAssign;

use super::{ShardLayout, VersionTable};
use crate::compression::{GradientSparsifier, ResidualDrop, SparseDelta};

/// The per worker state needed to pull parameters out of a `ParameterStore`.
///
/// A dense state only tracks versions, a sparse one also owns a sparsifier and a delta
/// buffer per shard, sized for that shard. Fetch sparsifiers always carry the dropped
/// mass over to the next fetch, so the worker's copy never drifts away from the store.
pub struct FetchState {
    versions: VersionTable,
    shards: Vec<ShardFetch>,
}

/// The compression scratch a worker owns for a single shard.
pub(crate) struct ShardFetch {
    pub(crate) sparsifier: GradientSparsifier,
    pub(crate) delta: SparseDelta,
}

impl FetchState {
    /// Creates a state for dense fetches only.
    ///
    /// # Arguments
    /// * `shards` - The amount of shards in the store.
    pub fn dense(shards: usize) -> Self {
        Self {
            versions: VersionTable::new(shards),
            shards: Vec::new(),
        }
    }

    /// Creates a state able to fetch sparse deltas.
    ///
    /// # Arguments
    /// * `layout` - The layout of the store it will fetch from.
    /// * `drop_rate` - The fraction of every delta to drop.
    pub fn sparse(layout: &ShardLayout, drop_rate: f32) -> Self {
        let shards = layout
            .ranges()
            .iter()
            .map(|range| {
                let kernel = Box::new(ResidualDrop::new(range.len()));
                let sparsifier = GradientSparsifier::new(drop_rate, kernel);
                let delta = sparsifier.allocate(range.len());
                ShardFetch { sparsifier, delta }
            })
            .collect();

        Self {
            versions: VersionTable::new(layout.shard_count()),
            shards,
        }
    }

    pub fn is_sparse(&self) -> bool {
        !self.shards.is_empty()
    }

    pub fn versions(&self) -> &VersionTable {
        &self.versions
    }

    pub fn versions_mut(&mut self) -> &mut VersionTable {
        &mut self.versions
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut [usize], &mut [ShardFetch]) {
        (self.versions.as_mut_slice(), &mut self.shards)
    }
}

/// What a sparse fetch did on a single shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaFetch {
    /// The worker already held the current version.
    Current,
    /// The delta from `base` up to `version` was applied.
    Refreshed { version: usize, base: usize },
    /// The worker fell out of the history window, the delta was taken from the oldest
    /// version still retained (`base`) instead.
    Clamped { version: usize, base: usize },
}

/// Per shard outcome counts of a sparse fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub current: usize,
    pub refreshed: usize,
    pub clamped: usize,
}

impl FetchReport {
    /// Whether some shard was too stale to be refreshed exactly.
    pub fn is_lossy(&self) -> bool {
        self.clamped > 0
    }
}

impl AddAssign<DeltaFetch> for FetchReport {
    fn add_assign(&mut self, rhs: DeltaFetch) {
        match rhs {
            DeltaFetch::Current => self.current += 1,
            DeltaFetch::Refreshed { .. } => self.refreshed += 1,
            DeltaFetch::Clamped { .. } => self.clamped += 1,
        }
    }
}

impl FromIterator<DeltaFetch> for FetchReport {
    fn from_iter<T: IntoIterator<Item = DeltaFetch>>(iter: T) -> Self {
        let mut report = Self::default();
        iter.into_iter().for_each(|fetch| report += fetch);
        report
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;

    #[test]
    fn test_sparse_state_sizes_buffers_per_shard() {
        let layout = ShardLayout::new(10, NonZeroUsize::new(3).unwrap());
        let mut state = FetchState::sparse(&layout, 0.5);

        assert!(state.is_sparse());
        assert_eq!(state.versions().len(), 3);

        let (_, shards) = state.parts_mut();
        let capacities: Vec<_> = shards.iter().map(|s| s.delta.capacity()).collect();
        assert_eq!(capacities, [3, 2, 2]);
    }

    #[test]
    fn test_report_counts_outcomes() {
        let report: FetchReport = [
            DeltaFetch::Current,
            DeltaFetch::Refreshed { version: 2, base: 1 },
            DeltaFetch::Clamped { version: 9, base: 7 },
            DeltaFetch::Current,
        ]
        .into_iter()
        .collect();

        assert_eq!(
            report,
            FetchReport {
                current: 2,
                refreshed: 1,
                clamped: 1
            }
        );
        assert!(report.is_lossy());
        assert!(!FetchState::dense(2).is_sparse());
    }
}
