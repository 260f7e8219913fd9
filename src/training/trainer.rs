use crate::data::FlareDataset;
use crate::evaluate::{evaluate_model, tensor_to_vec, ConfusionMatrix, Metrics, DEFAULT_THRESHOLD};
use crate::model::architecture::{init_model, FlareCnn};
use crate::model::batcher::FlareBatcher;
use crate::model::checkpoint::{save_model, CheckpointManager, CheckpointMetadata, TrainingConfigMetadata};
use crate::model::ModelConfig;
use crate::training::callbacks::{
    CallbackManager, EarlyStoppingCallback, MetricsLoggerCallback, Monitor, ProgressLoggerCallback,
    TimerCallback, TrainingCallback,
};
use crate::training::{TrainingConfig, TrainingResult, TrainingState};
use crate::utils::random::seeded_rng;
use anyhow::{bail, Result};
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Trainer for the flare CNN
///
/// Owns the model between calls to [`Trainer::train`], so a second call
/// keeps training the same weights.
pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    model_config: ModelConfig,
    device: B::Device,
    model: FlareCnn<B>,
    state: TrainingState,
    rng: ChaCha8Rng,
    last_metrics: Metrics,
    checkpoint_manager: Option<CheckpointManager>,
    callbacks: CallbackManager,
    show_progress: bool,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Define a freshly initialized model
    pub fn new(config: TrainingConfig, model_config: ModelConfig, device: B::Device) -> Result<Self> {
        config.validate()?;
        model_config.validate()?;

        B::seed(config.seed);
        let model = init_model::<B>(&model_config, &device);

        let mut callbacks = CallbackManager::new();
        callbacks.add_callback(ProgressLoggerCallback::new(1));
        callbacks.add_callback(TimerCallback::new());
        if config.early_stopping_patience > 0 {
            callbacks.add_callback(EarlyStoppingCallback::new(
                config.early_stopping_patience,
                Monitor::Accuracy,
            ));
        }

        Ok(Self {
            rng: seeded_rng(config.seed),
            config,
            model_config,
            device,
            model,
            state: TrainingState::new(),
            last_metrics: Metrics::default(),
            checkpoint_manager: None,
            callbacks,
            show_progress: true,
        })
    }

    /// Save best and periodic checkpoints plus `history.json` under `checkpoint_dir`
    pub fn with_checkpoint_dir<P: AsRef<Path>>(mut self, checkpoint_dir: P) -> Result<Self> {
        let manager = CheckpointManager::new(checkpoint_dir)?;
        self.callbacks
            .add_callback(MetricsLoggerCallback::new(manager.checkpoint_dir().join("history.json")));
        self.checkpoint_manager = Some(manager);
        Ok(self)
    }

    pub fn with_callback<C: TrainingCallback + 'static>(mut self, callback: C) -> Self {
        self.callbacks.add_callback(callback);
        self
    }

    /// Hide the epoch progress bar
    pub fn quiet(mut self) -> Self {
        self.show_progress = false;
        self
    }

    pub fn model(&self) -> &FlareCnn<B> {
        &self.model
    }

    /// Copy of the model without autodiff, for evaluation and prediction
    pub fn inference_model(&self) -> FlareCnn<B::InnerBackend> {
        self.model.valid()
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Train for `epochs` epochs on `dataset.train`, validating on `dataset.val`
    pub fn train(&mut self, dataset: &FlareDataset) -> Result<TrainingResult> {
        if dataset.train.is_empty() {
            bail!("Training split is empty");
        }
        if dataset.val.is_empty() {
            bail!("Validation split is empty");
        }
        if dataset.train.cadences() != self.model_config.cadences {
            bail!(
                "Training windows have {} cadences but the model expects {}",
                dataset.train.cadences(),
                self.model_config.cadences
            );
        }

        info!(
            "Training on {} examples, validating on {} ({} epochs, batch size {})",
            dataset.train.len(),
            dataset.val.len(),
            self.config.epochs,
            self.config.batch_size
        );

        let start_time = Instant::now();
        let batcher = FlareBatcher::<B>::new(self.device.clone());
        let mut optimizer = AdamConfig::new().init();
        let mut model = self.model.clone();
        let mut best_checkpoint = None;

        let progress = self.progress_bar();
        self.callbacks.on_train_begin();

        for _ in 0..self.config.epochs {
            let mut indices: Vec<usize> = (0..dataset.train.len()).collect();
            indices.shuffle(&mut self.rng);

            let mut loss_sum = 0.0;
            let mut probabilities = Vec::with_capacity(indices.len());
            let mut labels = Vec::with_capacity(indices.len());

            for chunk in indices.chunks(self.config.batch_size) {
                let batch = batcher.batch(&dataset.train, chunk);
                let output = model.forward_classification(batch.windows, batch.targets);

                let loss: f64 = output.loss.clone().into_scalar().elem();
                loss_sum += loss * chunk.len() as f64;
                probabilities.extend(tensor_to_vec(sigmoid(output.logits))?);
                labels.extend(chunk.iter().map(|&i| dataset.train.labels[i]));

                let grads = output.loss.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optimizer.step(self.config.learning_rate, model, grads);
                self.state.global_step += 1;
            }

            let train_metrics = ConfusionMatrix::from_predictions(&probabilities, &labels, DEFAULT_THRESHOLD)?
                .metrics(loss_sum / indices.len() as f64);
            let val_metrics = evaluate_model(
                &model.valid(),
                &dataset.val,
                self.config.batch_size,
                &self.device,
            )?;
            let val_metrics = val_metrics.metrics;

            self.state.update_epoch(&train_metrics, &val_metrics);
            let epoch = self.state.epoch;
            self.callbacks.on_epoch_end(epoch, &self.state, &val_metrics);

            if let Some(manager) = self.checkpoint_manager.as_mut() {
                let metadata = CheckpointMetadata::new(
                    epoch,
                    self.state.global_step,
                    val_metrics.clone(),
                    self.model_config.clone(),
                    training_metadata(&self.config),
                );
                let inference = model.valid();
                if let Some(path) = manager.save_best(&inference, &metadata, val_metrics.accuracy, "val_accuracy")? {
                    best_checkpoint = Some(path);
                }
                if self.config.checkpoint_frequency > 0 && epoch % self.config.checkpoint_frequency == 0 {
                    manager.save_checkpoint(&inference, &metadata)?;
                }
            }

            if let Some(pb) = &progress {
                pb.set_message(format!("val_acc {:.3}", val_metrics.accuracy));
                pb.inc(1);
            }
            self.last_metrics = val_metrics;

            if self.callbacks.should_stop() {
                break;
            }
        }

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }
        self.model = model;
        self.callbacks.on_train_end(&self.state);

        let duration = start_time.elapsed().as_secs_f64();
        debug!("Training call took {:.2}s", duration);

        Ok(TrainingResult {
            state: self.state.clone(),
            best_checkpoint: best_checkpoint.or_else(|| {
                self.checkpoint_manager
                    .as_ref()
                    .map(|m| m.best_path())
                    .filter(|p| p.exists())
            }),
            final_metrics: self.last_metrics.clone(),
            duration_secs: duration,
        })
    }

    /// Save the current weights for inference
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf> {
        let metadata = CheckpointMetadata::new(
            self.state.epoch,
            self.state.global_step,
            self.last_metrics.clone(),
            self.model_config.clone(),
            training_metadata(&self.config),
        );
        save_model(&self.inference_model(), path.as_ref(), &metadata)?;
        Ok(path.as_ref().to_path_buf())
    }

    fn progress_bar(&self) -> Option<ProgressBar> {
        if !self.show_progress {
            return None;
        }
        let pb = ProgressBar::new(self.config.epochs as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] epoch {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        Some(pb)
    }
}

fn training_metadata(config: &TrainingConfig) -> TrainingConfigMetadata {
    TrainingConfigMetadata {
        learning_rate: config.learning_rate,
        batch_size: config.batch_size,
        epochs: config.epochs,
        optimizer: "Adam".to_string(),
    }
}

/// Train a fresh model in one call
pub fn train_model<B: AutodiffBackend>(
    dataset: &FlareDataset,
    model_config: ModelConfig,
    training_config: TrainingConfig,
    checkpoint_dir: Option<&Path>,
) -> Result<(Trainer<B>, TrainingResult)> {
    let device = B::Device::default();

    let mut trainer = Trainer::new(training_config, model_config, device)?;

    if let Some(dir) = checkpoint_dir {
        trainer = trainer.with_checkpoint_dir(dir)?;
    }

    let result = trainer.train(dataset)?;
    Ok((trainer, result))
}
