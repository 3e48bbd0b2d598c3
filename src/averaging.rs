use parking_lot::Mutex;

use crate::storage::ShardLayout;

/// Exponential moving average of the parameters, kept per shard.
///
/// A shard's shadow is created as an exact copy of the live parameters on its first
/// update, afterwards every update blends the new live values in. Shadows have their own
/// mutex so they can be read without touching the shard locks.
#[derive(Debug)]
pub struct MovingAverage {
    max_decay: f32,
    shards: Box<[Mutex<Option<Box<[f32]>>>]>,
}

impl MovingAverage {
    /// Creates a new `MovingAverage` with no shadow parameters yet.
    ///
    /// # Arguments
    /// * `shards` - The amount of shards in the store.
    /// * `max_decay` - The upper bound for the decay factor.
    pub fn new(shards: usize, max_decay: f32) -> Self {
        Self {
            max_decay,
            shards: (0..shards).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// The decay used after `steps` batches, warming up towards `max_decay`.
    pub fn decay(&self, steps: usize) -> f32 {
        let warmup = (steps + 1) as f32 / (steps + 10) as f32;
        self.max_decay.min(warmup)
    }

    /// Blends the live parameters of `shard` into its shadow.
    ///
    /// # Arguments
    /// * `shard` - The shard index.
    /// * `live` - The shard's current parameters.
    /// * `steps` - The amount of batches processed so far.
    ///
    /// # Panics
    /// If `shard` is out of range or `live` doesn't match a previous update.
    pub fn update(&self, shard: usize, live: &[f32], steps: usize) {
        let mut slot = self.shards[shard].lock();

        match slot.as_deref_mut() {
            None => *slot = Some(Box::from(live)),
            Some(shadow) => {
                assert_eq!(shadow.len(), live.len(), "live parameters don't match the shadow");

                let decay = self.decay(steps);
                shadow
                    .iter_mut()
                    .zip(live)
                    .for_each(|(s, l)| *s = decay * *s + (1. - decay) * l);
            }
        }
    }

    /// Copies every bootstrapped shadow into its range of `dest`.
    ///
    /// Shards never updated keep whatever `dest` already holds.
    ///
    /// # Returns
    /// The amount of shards copied.
    pub fn pull(&self, layout: &ShardLayout, dest: &mut [f32]) -> usize {
        let mut copied = 0;

        for (shard, out) in self.shards.iter().zip(layout.split_mut(dest)) {
            if let Some(shadow) = shard.lock().as_deref() {
                out.copy_from_slice(shadow);
                copied += 1;
            }
        }

        copied
    }

    /// A copy of the shadow of `shard`, if it was ever updated.
    pub fn shadow(&self, shard: usize) -> Option<Vec<f32>> {
        self.shards[shard].lock().as_deref().map(<[f32]>::to_vec)
    }
}
