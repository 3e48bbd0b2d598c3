use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainErr};

/// The specification for the `Optimizer` trait.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerSpec {
    Adam {
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    },
    GradientDescent {
        learning_rate: f32,
    },
    GradientDescentWithMomentum {
        learning_rate: f32,
        momentum: f32,
    },
}

/// The specification for the `DropKernel` trait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropKernelSpec {
    TopK,
    #[default]
    Residual,
}

/// The specification for the shadow parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MovingAverageSpec {
    #[serde(default = "default_decay")]
    pub decay: f32,
}

/// The specification for the `BasicScheduler`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSpec {
    pub save_freq: Option<NonZeroUsize>,
    pub valid_freq: Option<NonZeroUsize>,
    pub disp_freq: Option<NonZeroUsize>,
}

/// Configuration of an `AsyncGraphGroup`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// One worker thread and one parameter shard per device.
    pub devices: Vec<usize>,
    /// Local micro-batches accumulated before each push.
    #[serde(default = "default_tau")]
    pub tau: NonZeroUsize,
    /// Fraction of entries dropped when sparsifying, `0` disables compression.
    #[serde(default)]
    pub drop_rate: f32,
    #[serde(default)]
    pub drop_kernel: DropKernelSpec,
    /// Versions kept per shard, derived from the device count when absent.
    #[serde(default)]
    pub history: Option<NonZeroUsize>,
    #[serde(default)]
    pub moving_average: Option<MovingAverageSpec>,
    /// Scales the learning rate by `batch_words / average_batch_words`.
    #[serde(default)]
    pub scale_lr: bool,
    #[serde(default = "default_average_batch_words")]
    pub average_batch_words: f32,
    pub optimizer: OptimizerSpec,
    /// The `BasicScheduler` built by `AsyncGraphGroup::from_config`.
    #[serde(default)]
    pub scheduler: Option<SchedulerSpec>,
    #[serde(default = "default_model")]
    pub model: PathBuf,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub no_reload: bool,
    /// Pending batches before `update` blocks, defaults to the device count.
    #[serde(default)]
    pub queue_capacity: Option<NonZeroUsize>,
}

fn default_tau() -> NonZeroUsize {
    NonZeroUsize::MIN
}

fn default_decay() -> f32 {
    0.9999
}

fn default_average_batch_words() -> f32 {
    1920.
}

fn default_model() -> PathBuf {
    PathBuf::from("model.bin")
}

impl GroupConfig {
    /// Creates a configuration with defaults for everything but the devices and optimizer.
    ///
    /// # Arguments
    /// * `devices` - The participating devices.
    /// * `optimizer` - The optimizer used on every shard.
    pub fn new(devices: Vec<usize>, optimizer: OptimizerSpec) -> Self {
        Self {
            devices,
            tau: default_tau(),
            drop_rate: 0.,
            drop_kernel: DropKernelSpec::default(),
            history: None,
            moving_average: None,
            scale_lr: false,
            average_batch_words: default_average_batch_words(),
            optimizer,
            scheduler: None,
            model: default_model(),
            overwrite: false,
            no_reload: false,
            queue_capacity: None,
        }
    }

    /// Parses and validates a JSON configuration.
    ///
    /// # Arguments
    /// * `json` - The raw configuration.
    ///
    /// # Returns
    /// A parse error or the first violated constraint.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    ///
    /// # Arguments
    /// * `path` - Location of the configuration.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Checks the constraints between fields.
    ///
    /// # Returns
    /// An `InvalidConfig` error naming the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let invalid = |detail: String| Err(TrainErr::InvalidConfig(detail));

        if self.devices.is_empty() {
            return invalid("at least one device is required".into());
        }

        if !(0.0..1.0).contains(&self.drop_rate) {
            return invalid(format!("drop_rate must be in [0, 1), got {}", self.drop_rate));
        }

        let history = self.history.map_or(2, NonZeroUsize::get);
        if self.compresses() && history < 2 {
            return invalid("sparse fetch needs a history of at least 2 versions".into());
        }

        if self.average_batch_words.is_nan() || self.average_batch_words <= 0. {
            return invalid(format!(
                "average_batch_words must be positive, got {}",
                self.average_batch_words
            ));
        }

        if let Some(spec) = self.moving_average {
            if !(0.0..=1.0).contains(&spec.decay) {
                return invalid(format!("moving average decay must be in [0, 1], got {}", spec.decay));
            }
        }

        Ok(())
    }

    /// Whether gradients and parameter deltas are sparsified.
    pub fn compresses(&self) -> bool {
        self.drop_rate > 0.
    }

    /// The amount of versions kept per shard.
    ///
    /// Without an explicit value it is one when not compressing, otherwise one and a half
    /// versions per device, never fewer than two.
    pub fn history(&self) -> NonZeroUsize {
        if let Some(history) = self.history {
            return history;
        }

        if !self.compresses() {
            return NonZeroUsize::MIN;
        }

        let derived = (self.devices.len() as f32 * 1.5) as usize;
        NonZeroUsize::new(derived.max(2)).unwrap_or(NonZeroUsize::MIN)
    }

    /// The bound of pending batches in the task queue.
    pub fn queue_capacity(&self) -> NonZeroUsize {
        self.queue_capacity
            .or(NonZeroUsize::new(self.devices.len()))
            .unwrap_or(NonZeroUsize::MIN)
    }
}
