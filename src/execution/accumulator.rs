/// Sums gradients and word counts over the micro-batches of a `tau` window.
#[derive(Debug, Clone)]
pub struct GradientAccumulator {
    grads: Box<[f32]>,
    words: usize,
    steps: usize,
}

impl GradientAccumulator {
    /// Creates a new zeroed `GradientAccumulator`.
    ///
    /// # Arguments
    /// * `len` - The amount of parameters of the model.
    pub fn new(len: usize) -> Self {
        Self {
            grads: vec![0.; len].into_boxed_slice(),
            words: 0,
            steps: 0,
        }
    }

    /// Adds the gradient of a micro-batch.
    ///
    /// # Panics
    /// If `grad` doesn't match the accumulator's length.
    pub fn add(&mut self, grad: &[f32], words: usize) {
        assert_eq!(grad.len(), self.grads.len(), "gradient doesn't match the model");

        self.grads
            .iter_mut()
            .zip(grad)
            .for_each(|(acc, g)| *acc += g);
        self.words += words;
        self.steps += 1;
    }

    pub fn grads(&self) -> &[f32] {
        &self.grads
    }

    pub fn words(&self) -> usize {
        self.words
    }

    /// The amount of micro-batches accumulated since the last reset.
    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn reset(&mut self) {
        self.grads.fill(0.);
        self.words = 0;
        self.steps = 0;
    }
}
