/// Defines the strategy for updating model parameters based on calculated gradients.
///
/// The `Optimizer` trait is responsible for the mathematical transition of a shard's
/// parameters from version `t` to `t+1`.
pub trait Optimizer {
    /// Updates the provided slice of parameters in place.
    ///
    /// Callers guarantee `grad` and `params` have the same length.
    ///
    /// # Arguments
    /// * `grad` - The gradient corresponding to the `params` slice.
    /// * `params` - The parameters of a single shard.
    /// * `scale` - Multiplier applied to the learning rate of this update.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32], scale: f32);
}
