mod linear;

pub use linear::{LinearBatch, LinearReplica, LinearStats};

/// A unit of training data submitted to the group.
pub trait Batch {
    /// The amount of target words (or samples) in the batch, used to normalize updates.
    fn words(&self) -> usize;
}

/// A model replica pinned to a single device.
///
/// Parameters and gradients are exposed as flat buffers with the same layout on every
/// replica of a group.
pub trait Replica {
    type Batch: Batch;
    type Stats;

    /// The device the replica lives on.
    fn device(&self) -> usize;

    /// Prepares the computation for `batch`.
    fn build(&mut self, batch: &Self::Batch);

    /// Runs the forward pass of the last built batch.
    ///
    /// # Returns
    /// The loss of the batch.
    fn forward(&mut self) -> f32;

    /// Computes the gradient of the last forward pass into `grads`.
    fn backward(&mut self);

    fn params(&self) -> &[f32];

    fn params_mut(&mut self) -> &mut [f32];

    fn grads(&self) -> &[f32];

    /// Statistics the driver uses to size its batches.
    fn collect_stats(&self) -> Self::Stats;
}
