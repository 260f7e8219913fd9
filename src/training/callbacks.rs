use crate::evaluate::Metrics;
use crate::training::TrainingState;
use std::time::Instant;

/// Training callback trait
///
/// Callbacks allow custom actions to be performed at various points during training.
/// `metrics` are always the validation metrics of the epoch just finished.
pub trait TrainingCallback: Send {
    /// Called at the start of training
    fn on_train_begin(&mut self) {}

    /// Called at the end of training
    fn on_train_end(&mut self, _state: &TrainingState) {}

    /// Called at the end of each epoch
    fn on_epoch_end(&mut self, _epoch: usize, _state: &TrainingState, _metrics: &Metrics) {}

    /// Whether this callback asks training to stop
    fn should_stop(&self) -> bool {
        false
    }
}

/// Callback manager that handles multiple callbacks
#[derive(Default)]
pub struct CallbackManager {
    callbacks: Vec<Box<dyn TrainingCallback>>,
}

impl CallbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback
    pub fn add_callback<C: TrainingCallback + 'static>(&mut self, callback: C) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn on_train_begin(&mut self) {
        for callback in &mut self.callbacks {
            callback.on_train_begin();
        }
    }

    pub fn on_train_end(&mut self, state: &TrainingState) {
        for callback in &mut self.callbacks {
            callback.on_train_end(state);
        }
    }

    pub fn on_epoch_end(&mut self, epoch: usize, state: &TrainingState, metrics: &Metrics) {
        for callback in &mut self.callbacks {
            callback.on_epoch_end(epoch, state, metrics);
        }
    }

    /// True once any callback asks to stop
    pub fn should_stop(&self) -> bool {
        self.callbacks.iter().any(|c| c.should_stop())
    }
}

/// Metric watched by [`EarlyStoppingCallback`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Monitor {
    Loss,
    Accuracy,
    Precision,
    Recall,
    F1,
}

impl Monitor {
    fn value(self, metrics: &Metrics) -> f64 {
        match self {
            Monitor::Loss => metrics.loss,
            Monitor::Accuracy => metrics.accuracy,
            Monitor::Precision => metrics.precision,
            Monitor::Recall => metrics.recall,
            Monitor::F1 => metrics.f1,
        }
    }

    /// Loss improves downwards, everything else upwards
    fn improved(self, current: f64, best: f64, min_delta: f64) -> bool {
        match self {
            Monitor::Loss => current < best - min_delta,
            _ => current > best + min_delta,
        }
    }
}

/// Early stopping callback
pub struct EarlyStoppingCallback {
    patience: usize,
    min_delta: f64,
    best_metric: Option<f64>,
    counter: usize,
    monitor: Monitor,
}

impl EarlyStoppingCallback {
    pub fn new(patience: usize, monitor: Monitor) -> Self {
        Self {
            patience,
            min_delta: 1e-4,
            best_metric: None,
            counter: 0,
            monitor,
        }
    }
}

impl TrainingCallback for EarlyStoppingCallback {
    // Every call to train gets the full patience again
    fn on_train_begin(&mut self) {
        self.best_metric = None;
        self.counter = 0;
    }

    fn on_epoch_end(&mut self, epoch: usize, _state: &TrainingState, metrics: &Metrics) {
        let current = self.monitor.value(metrics);

        let improved = match self.best_metric {
            None => true,
            Some(best) => self.monitor.improved(current, best, self.min_delta),
        };

        if improved {
            self.best_metric = Some(current);
            self.counter = 0;
        } else {
            self.counter += 1;
            if self.counter == self.patience {
                tracing::info!(
                    "Early stopping after epoch {}: no {:?} improvement in {} epochs",
                    epoch,
                    self.monitor,
                    self.patience
                );
            }
        }
    }

    fn should_stop(&self) -> bool {
        self.patience > 0 && self.counter >= self.patience
    }
}

/// Progress logging callback
pub struct ProgressLoggerCallback {
    log_frequency: usize,
}

impl ProgressLoggerCallback {
    pub fn new(log_frequency: usize) -> Self {
        Self {
            log_frequency: log_frequency.max(1),
        }
    }
}

impl TrainingCallback for ProgressLoggerCallback {
    fn on_epoch_end(&mut self, epoch: usize, state: &TrainingState, metrics: &Metrics) {
        if epoch % self.log_frequency == 0 {
            let train_loss = state.last().map(|h| h.train_loss).unwrap_or(f64::NAN);
            tracing::info!(
                "Epoch {} - loss: {:.4}, val_loss: {:.4}, val_acc: {:.4}, val_precision: {:.4}, val_recall: {:.4}",
                epoch,
                train_loss,
                metrics.loss,
                metrics.accuracy,
                metrics.precision,
                metrics.recall
            );
        }
    }
}

/// Writes the epoch history to a JSON file after every epoch
pub struct MetricsLoggerCallback {
    log_file: std::path::PathBuf,
}

impl MetricsLoggerCallback {
    pub fn new<P: AsRef<std::path::Path>>(log_file: P) -> Self {
        Self {
            log_file: log_file.as_ref().to_path_buf(),
        }
    }

    fn save_history(&self, state: &TrainingState) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&state.history)?;
        std::fs::write(&self.log_file, json)?;
        Ok(())
    }
}

impl TrainingCallback for MetricsLoggerCallback {
    fn on_epoch_end(&mut self, _epoch: usize, state: &TrainingState, _metrics: &Metrics) {
        if let Err(e) = self.save_history(state) {
            tracing::warn!("Failed to save training history: {}", e);
        }
    }
}

/// Timer callback that tracks training time
#[derive(Default)]
pub struct TimerCallback {
    start_time: Option<Instant>,
}

impl TimerCallback {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrainingCallback for TimerCallback {
    fn on_train_begin(&mut self) {
        self.start_time = Some(Instant::now());
    }

    fn on_train_end(&mut self, state: &TrainingState) {
        if let Some(start) = self.start_time {
            tracing::info!(
                "Training finished in {} ({} epochs total)",
                crate::utils::format_duration(start.elapsed().as_secs_f64()),
                state.epoch
            );
        }
    }
}
