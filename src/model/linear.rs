use rand::Rng;
use rand_distr::{Distribution, Normal};

use super::{Batch, Replica};

/// A batch of rows for a `LinearReplica`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearBatch {
    dim: usize,
    features: Vec<f32>,
    targets: Vec<f32>,
}

impl LinearBatch {
    /// Creates a new `LinearBatch`.
    ///
    /// # Arguments
    /// * `dim` - The amount of features per row.
    /// * `features` - The rows, concatenated.
    /// * `targets` - One target per row.
    ///
    /// # Panics
    /// If `features` doesn't hold exactly one row of `dim` features per target.
    pub fn new(dim: usize, features: Vec<f32>, targets: Vec<f32>) -> Self {
        assert_eq!(features.len(), dim * targets.len(), "features don't match the targets");

        Self {
            dim,
            features,
            targets,
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn rows(&self) -> usize {
        self.targets.len()
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.features[i * self.dim..(i + 1) * self.dim]
    }
}

impl Batch for LinearBatch {
    fn words(&self) -> usize {
        self.rows()
    }
}

/// What a `LinearReplica` reports to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearStats {
    pub dim: usize,
    pub params: usize,
}

/// A least squares linear model, `y = w · x + b`.
///
/// The parameters are laid out as the weights followed by the bias.
#[derive(Debug, Clone)]
pub struct LinearReplica {
    device: usize,
    dim: usize,
    params: Box<[f32]>,
    grads: Box<[f32]>,
    batch: Option<LinearBatch>,
    residuals: Vec<f32>,
}

impl LinearReplica {
    /// Creates a new `LinearReplica` with zeroed parameters.
    ///
    /// # Arguments
    /// * `device` - The device the replica lives on.
    /// * `dim` - The amount of input features.
    pub fn new(device: usize, dim: usize) -> Self {
        Self {
            device,
            dim,
            params: vec![0.; dim + 1].into_boxed_slice(),
            grads: vec![0.; dim + 1].into_boxed_slice(),
            batch: None,
            residuals: Vec::new(),
        }
    }

    /// Creates a new `LinearReplica` with weights drawn from `N(0, std_dev)`.
    ///
    /// # Arguments
    /// * `device` - The device the replica lives on.
    /// * `dim` - The amount of input features.
    /// * `std_dev` - The standard deviation of the initial weights.
    /// * `rng` - A random number generator.
    ///
    /// # Returns
    /// An error if `std_dev` is not finite or negative.
    pub fn normal<R: Rng>(
        device: usize,
        dim: usize,
        std_dev: f32,
        rng: &mut R,
    ) -> Result<Self, rand_distr::NormalError> {
        let distribution = Normal::new(0., std_dev)?;

        let mut replica = Self::new(device, dim);
        replica.params[..dim]
            .iter_mut()
            .for_each(|w| *w = distribution.sample(rng));

        Ok(replica)
    }

    /// Predicts the target of a single row.
    pub fn predict(&self, row: &[f32]) -> f32 {
        let (weights, bias) = self.params.split_at(self.dim);
        weights.iter().zip(row).map(|(w, x)| w * x).sum::<f32>() + bias[0]
    }

    /// The mean squared error over `batch`.
    pub fn loss(&self, batch: &LinearBatch) -> f32 {
        if batch.rows() == 0 {
            return 0.;
        }

        let total: f32 = (0..batch.rows())
            .map(|i| (self.predict(batch.row(i)) - batch.targets[i]).powi(2))
            .sum();

        total / batch.rows() as f32
    }
}

impl Replica for LinearReplica {
    type Batch = LinearBatch;
    type Stats = LinearStats;

    fn device(&self) -> usize {
        self.device
    }

    fn build(&mut self, batch: &LinearBatch) {
        assert_eq!(batch.dim(), self.dim, "batch doesn't match the replica");
        self.batch = Some(batch.clone());
    }

    fn forward(&mut self) -> f32 {
        let Some(batch) = self.batch.as_ref() else {
            return 0.;
        };

        let residuals: Vec<f32> = (0..batch.rows())
            .map(|i| self.predict(batch.row(i)) - batch.targets[i])
            .collect();

        let loss = if residuals.is_empty() {
            0.
        } else {
            residuals.iter().map(|r| r.powi(2)).sum::<f32>() / residuals.len() as f32
        };

        self.residuals = residuals;
        loss
    }

    fn backward(&mut self) {
        self.grads.fill(0.);

        let Some(batch) = self.batch.as_ref() else {
            return;
        };

        if batch.rows() == 0 {
            return;
        }

        let norm = 2. / batch.rows() as f32;
        let (weights, bias) = self.grads.split_at_mut(self.dim);

        for (i, r) in self.residuals.iter().enumerate() {
            weights
                .iter_mut()
                .zip(batch.row(i))
                .for_each(|(g, x)| *g += norm * r * x);
            bias[0] += norm * r;
        }
    }

    fn params(&self) -> &[f32] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    fn grads(&self) -> &[f32] {
        &self.grads
    }

    fn collect_stats(&self) -> LinearStats {
        LinearStats {
            dim: self.dim,
            params: self.params.len(),
        }
    }
}
