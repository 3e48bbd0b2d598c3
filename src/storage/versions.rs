/// The last version of every shard a worker has incorporated into its replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionTable {
    versions: Box<[usize]>,
}

impl VersionTable {
    /// Creates a new `VersionTable` with every shard at version `0`.
    ///
    /// # Arguments
    /// * `shards` - The amount of shards in the store.
    pub fn new(shards: usize) -> Self {
        Self {
            versions: vec![0; shards].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// The version of `shard` last seen by the worker.
    ///
    /// # Panics
    /// If `shard` is out of range.
    pub fn get(&self, shard: usize) -> usize {
        self.versions[shard]
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.versions
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [usize] {
        &mut self.versions
    }
}
