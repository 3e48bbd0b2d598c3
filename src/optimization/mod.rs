mod adam;
mod gradient_descent;
mod gradient_descent_with_momentum;
mod optimizer;

pub use adam::Adam;
pub use gradient_descent::GradientDescent;
pub use gradient_descent_with_momentum::GradientDescentWithMomentum;
pub use optimizer::Optimizer;

use crate::config::OptimizerSpec;

/// The per shard optimizer selected once from an `OptimizerSpec`.
#[derive(Debug)]
pub enum ShardOptimizer {
    GradientDescent(GradientDescent),
    GradientDescentWithMomentum(GradientDescentWithMomentum),
    Adam(Adam),
}

impl ShardOptimizer {
    /// Resolves the optimizer for a shard.
    ///
    /// # Arguments
    /// * `spec` - The optimizer's specification.
    /// * `len` - The amount of parameters in the shard.
    pub fn from_spec(spec: &OptimizerSpec, len: usize) -> Self {
        match *spec {
            OptimizerSpec::GradientDescent { learning_rate } => {
                Self::GradientDescent(GradientDescent::new(learning_rate))
            }
            OptimizerSpec::GradientDescentWithMomentum {
                learning_rate,
                momentum,
            } => Self::GradientDescentWithMomentum(GradientDescentWithMomentum::new(
                len,
                learning_rate,
                momentum,
            )),
            OptimizerSpec::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => Self::Adam(Adam::new(len, learning_rate, beta1, beta2, epsilon)),
        }
    }
}

impl Optimizer for ShardOptimizer {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32], scale: f32) {
        match self {
            Self::GradientDescent(opt) => opt.update_params(grad, params, scale),
            Self::GradientDescentWithMomentum(opt) => opt.update_params(grad, params, scale),
            Self::Adam(opt) => opt.update_params(grad, params, scale),
        }
    }
}
