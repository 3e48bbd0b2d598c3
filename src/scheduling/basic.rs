use std::{fs, num::NonZeroUsize, path::Path};

use log::info;
use serde::{Deserialize, Serialize};

use super::Scheduler;
use crate::{
    checkpoint,
    config::SchedulerSpec,
    error::Result,
    model::{Batch, Replica},
};

/// The progress a `BasicScheduler` persists across restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub batches: usize,
    pub words: usize,
    pub validations: usize,
    pub last_validation: Option<f32>,
    pub best_validation: Option<f32>,
}

type Validator<R> = Box<dyn FnMut(&R) -> f32 + Send + Sync>;

/// A scheduler driven by fixed batch frequencies.
///
/// It keeps a running average of the loss that is logged and reset every `disp_freq`
/// batches. Validation scores are lower is better.
pub struct BasicScheduler<R: Replica> {
    spec: SchedulerSpec,
    state: SchedulerState,
    running_loss: f32,
    running_batches: usize,
    validator: Option<Validator<R>>,
}

impl<R: Replica> BasicScheduler<R> {
    /// Creates a new `BasicScheduler` without a validator.
    pub fn new(spec: SchedulerSpec) -> Self {
        Self {
            spec,
            state: SchedulerState::default(),
            running_loss: 0.,
            running_batches: 0,
            validator: None,
        }
    }

    /// Scores the replica's parameters on every validation.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: FnMut(&R) -> f32 + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(validator));
        self
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    /// The average loss since the last display.
    pub fn running_loss(&self) -> Option<f32> {
        (self.running_batches > 0).then(|| self.running_loss / self.running_batches as f32)
    }

    fn due(&self, freq: Option<NonZeroUsize>) -> bool {
        freq.is_some_and(|freq| self.state.batches > 0 && self.state.batches % freq == 0)
    }
}

impl<R: Replica> Scheduler<R> for BasicScheduler<R> {
    fn update(&mut self, loss: f32, batch: &R::Batch) {
        self.state.batches += 1;
        self.state.words += batch.words();
        self.running_loss += loss;
        self.running_batches += 1;

        if self.due(self.spec.disp_freq) {
            let average = self.running_loss / self.running_batches as f32;
            info!(batches = self.state.batches, words = self.state.words, loss = average; "training");

            self.running_loss = 0.;
            self.running_batches = 0;
        }
    }

    fn saving(&self) -> bool {
        self.due(self.spec.save_freq)
    }

    fn validating(&self) -> bool {
        self.due(self.spec.valid_freq)
    }

    fn validate(&mut self, replica: &R) {
        let Some(validator) = self.validator.as_mut() else {
            return;
        };

        let score = validator(replica);
        let improved = self.state.best_validation.is_none_or(|best| score < best);

        self.state.validations += 1;
        self.state.last_validation = Some(score);
        if improved {
            self.state.best_validation = Some(score);
        }

        info!(batches = self.state.batches, score = score, improved = improved; "validation");
    }

    fn number_of_batches(&self) -> usize {
        self.state.batches
    }

    fn save(&self, model: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.state)?;
        fs::write(checkpoint::progress_path(model), json)?;
        Ok(())
    }

    fn load(&mut self, model: &Path) -> Result<()> {
        let path = checkpoint::progress_path(model);
        if !path.exists() {
            return Ok(());
        }

        self.state = serde_json::from_str(&fs::read_to_string(path)?)?;
        info!(batches = self.state.batches; "restored training progress");
        Ok(())
    }
}
