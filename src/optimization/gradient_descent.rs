use super::Optimizer;

#[derive(Debug)]
pub struct GradientDescent {
    learning_rate: f32,
}

impl GradientDescent {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for GradientDescent {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32], scale: f32) {
        let lr = self.learning_rate * scale;

        for (p, g) in params.iter_mut().zip(grad) {
            *p -= lr * g;
        }
    }
}
