use std::time::Duration;

/// What a single worker did over its lifetime.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WorkerMetrics {
    pub replica: usize,
    pub device: usize,
    pub compute_time: Duration,

    pub steps: u64,
    pub words: u64,
    pub pushes: u64,
    pub dense_fetches: u64,
    pub sparse_fetches: u64,
    pub clamped_shards: u64,
}

impl WorkerMetrics {
    pub fn new(replica: usize, device: usize) -> Self {
        Self {
            replica,
            device,
            ..Default::default()
        }
    }

    #[inline]
    pub fn bump_step(&mut self, words: usize, elapsed: Duration) {
        self.steps += 1;
        self.words += words as u64;
        self.compute_time += elapsed;
    }

    #[inline]
    pub fn bump_push(&mut self) {
        self.pushes += 1;
    }

    #[inline]
    pub fn bump_dense_fetch(&mut self) {
        self.dense_fetches += 1;
    }

    #[inline]
    pub fn bump_sparse_fetch(&mut self, clamped: usize) {
        self.sparse_fetches += 1;
        self.clamped_shards += clamped as u64;
    }
}

/// The metrics of every worker of a finished group.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GroupStats {
    pub batches: usize,
    pub versions: Vec<usize>,
    pub workers: Vec<WorkerMetrics>,
}

impl GroupStats {
    pub fn steps(&self) -> u64 {
        self.workers.iter().map(|w| w.steps).sum()
    }

    pub fn words(&self) -> u64 {
        self.workers.iter().map(|w| w.words).sum()
    }

    pub fn pushes(&self) -> u64 {
        self.workers.iter().map(|w| w.pushes).sum()
    }

    pub fn clamped_shards(&self) -> u64 {
        self.workers.iter().map(|w| w.clamped_shards).sum()
    }
}
