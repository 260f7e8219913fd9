pub mod callbacks;
pub mod trainer;

use crate::evaluate::Metrics;
use serde::{Deserialize, Serialize};

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Number of training epochs
    pub epochs: usize,
    /// Batch size
    pub batch_size: usize,
    /// Learning rate for Adam
    pub learning_rate: f64,
    /// Early stopping patience on validation accuracy (0 = disabled)
    pub early_stopping_patience: usize,
    /// Random seed for batch shuffling
    pub seed: u64,
    /// Checkpoint frequency (epochs, 0 = only the best model)
    pub checkpoint_frequency: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 200,
            batch_size: 64,
            learning_rate: 0.001,
            early_stopping_patience: 0,
            seed: 2020,
            checkpoint_frequency: 0,
        }
    }
}

impl TrainingConfig {
    /// Create configuration for quick testing
    pub fn quick_test() -> Self {
        Self {
            epochs: 5,
            batch_size: 16,
            learning_rate: 0.01,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        use crate::utils::validation::positive;

        positive(self.epochs, "epochs")?;
        positive(self.batch_size, "batch_size")?;
        positive(self.learning_rate, "learning_rate")?;
        Ok(())
    }
}

/// Per-epoch record of training progress
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpochHistory {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub val_precision: f64,
    pub val_recall: f64,
}

/// Training state
///
/// Carried across calls to [`trainer::Trainer::train`], so epoch numbering
/// and history continue where the previous call stopped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingState {
    /// Completed epochs
    pub epoch: usize,
    /// Completed optimizer steps
    pub global_step: usize,
    /// Best validation accuracy
    pub best_metric: f64,
    /// Number of epochs without improvement
    pub epochs_without_improvement: usize,
    pub history: Vec<EpochHistory>,
}

impl TrainingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update after epoch
    pub fn update_epoch(&mut self, train: &Metrics, val: &Metrics) {
        self.epoch += 1;
        self.history.push(EpochHistory {
            epoch: self.epoch,
            train_loss: train.loss,
            train_accuracy: train.accuracy,
            val_loss: val.loss,
            val_accuracy: val.accuracy,
            val_precision: val.precision,
            val_recall: val.recall,
        });

        if val.accuracy > self.best_metric {
            self.best_metric = val.accuracy;
            self.epochs_without_improvement = 0;
        } else {
            self.epochs_without_improvement += 1;
        }
    }

    pub fn last(&self) -> Option<&EpochHistory> {
        self.history.last()
    }
}

/// Training result
#[derive(Debug, Clone)]
pub struct TrainingResult {
    /// Training state after this call
    pub state: TrainingState,
    /// Path to best model checkpoint
    pub best_checkpoint: Option<std::path::PathBuf>,
    /// Validation metrics after the last epoch
    pub final_metrics: Metrics,
    /// Training duration in seconds
    pub duration_secs: f64,
}
