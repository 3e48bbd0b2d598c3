use super::Optimizer;

#[derive(Debug)]
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
    velocity: Box<[f32]>,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - Hyperparameter to the optimization algorithm.
    pub fn new(len: usize, learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32], scale: f32) {
        let lr = self.learning_rate * scale;
        let mu = self.momentum;

        params
            .iter_mut()
            .zip(grad)
            .zip(self.velocity.iter_mut())
            .for_each(|((p, g), v)| {
                *v = (mu * *v) + g;
                *p -= lr * *v;
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_velocity_builds_up() {
        let mut opt = GradientDescentWithMomentum::new(1, 1., 0.5);
        let mut params = [0.];

        opt.update_params(&[1.], &mut params, 1.);
        assert_eq!(params, [-1.]);

        opt.update_params(&[1.], &mut params, 1.);
        assert_eq!(params, [-2.5]);
    }
}
