mod basic;

pub use basic::{BasicScheduler, SchedulerState};

use std::path::Path;

use crate::{error::Result, model::Replica};

/// Tracks training progress and decides when to save and validate.
///
/// Workers share a single scheduler behind a read/write lock, the `&mut self` methods
/// are only ever called with exclusive access.
pub trait Scheduler<R: Replica> {
    /// Reports the loss of a processed batch.
    fn update(&mut self, loss: f32, batch: &R::Batch);

    /// Whether a checkpoint is due after the last update.
    fn saving(&self) -> bool;

    /// Whether a validation is due after the last update.
    fn validating(&self) -> bool;

    /// Validates the parameters currently held by `replica`.
    fn validate(&mut self, replica: &R);

    /// The amount of batches reported so far.
    fn number_of_batches(&self) -> usize;

    /// Persists the progress next to the `model` checkpoint.
    fn save(&self, model: &Path) -> Result<()>;

    /// Restores the progress saved next to the `model` checkpoint, if any.
    fn load(&mut self, model: &Path) -> Result<()>;
}
