use crate::evaluate::Metrics;
use crate::model::architecture::{init_model, FlareCnn};
use crate::model::ModelConfig;
use anyhow::{Context, Result};
use burn::prelude::*;
use burn::record::{CompactRecorder, Recorder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Checkpoint metadata, stored as JSON next to the weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Crate version that wrote the checkpoint
    pub version: String,
    /// Training epoch
    pub epoch: usize,
    /// Training step
    pub step: usize,
    /// Validation metrics
    pub val_metrics: Metrics,
    /// Model configuration
    pub model_config: ModelConfig,
    /// Training configuration
    pub training_config: TrainingConfigMetadata,
    /// Timestamp
    pub timestamp: String,
}

impl CheckpointMetadata {
    pub fn new(
        epoch: usize,
        step: usize,
        val_metrics: Metrics,
        model_config: ModelConfig,
        training_config: TrainingConfigMetadata,
    ) -> Self {
        Self {
            version: crate::VERSION.to_string(),
            epoch,
            step,
            val_metrics,
            model_config,
            training_config,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Check the model was built for windows of `cadences`
    ///
    /// Scoring windows of another length through this model would not fail
    /// loudly inside the network, so it is rejected here.
    pub fn check_window_length(&self, cadences: usize) -> Result<()> {
        if self.model_config.cadences != cadences {
            anyhow::bail!(
                "Model expects {}-cadence windows but the data has {} cadences",
                self.model_config.cadences,
                cadences
            );
        }
        Ok(())
    }
}

/// Training configuration metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfigMetadata {
    /// Learning rate
    pub learning_rate: f64,
    /// Batch size
    pub batch_size: usize,
    /// Number of epochs
    pub epochs: usize,
    /// Optimizer type
    pub optimizer: String,
}

/// Checkpoint manager for saving and loading model checkpoints
pub struct CheckpointManager {
    /// Directory to save checkpoints
    checkpoint_dir: PathBuf,
    /// Maximum number of checkpoints to keep
    max_checkpoints: usize,
    /// Best model metric
    best_metric: Option<f64>,
}

impl CheckpointManager {
    /// Create new checkpoint manager
    pub fn new<P: AsRef<Path>>(checkpoint_dir: P) -> Result<Self> {
        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        fs::create_dir_all(&checkpoint_dir)
            .context("Failed to create checkpoint directory")?;

        Ok(Self {
            checkpoint_dir,
            max_checkpoints: 5,
            best_metric: None,
        })
    }

    /// Set maximum number of checkpoints to keep
    pub fn with_max_checkpoints(mut self, max: usize) -> Self {
        self.max_checkpoints = max;
        self
    }

    /// Save a periodic checkpoint
    pub fn save_checkpoint<B: Backend>(
        &mut self,
        model: &FlareCnn<B>,
        metadata: &CheckpointMetadata,
    ) -> Result<PathBuf> {
        let checkpoint_path = self
            .checkpoint_dir
            .join(format!("checkpoint_epoch_{}.mpk", metadata.epoch));

        save_model(model, &checkpoint_path, metadata)?;
        self.cleanup_old_checkpoints()?;

        Ok(checkpoint_path)
    }

    /// Save the model if `metric` beats the best seen so far (higher is better)
    pub fn save_best<B: Backend>(
        &mut self,
        model: &FlareCnn<B>,
        metadata: &CheckpointMetadata,
        metric: f64,
        metric_name: &str,
    ) -> Result<Option<PathBuf>> {
        let is_best = match self.best_metric {
            None => true,
            Some(best) => metric > best,
        };

        if is_best {
            info!(
                "New best {}: {:.4} (previous: {:?})",
                metric_name, metric, self.best_metric
            );
            self.best_metric = Some(metric);

            let best_path = self.best_path();
            save_model(model, &best_path, metadata)?;
            Ok(Some(best_path))
        } else {
            debug!(
                "Model did not improve. Current {}: {:.4}, Best: {:?}",
                metric_name, metric, self.best_metric
            );
            Ok(None)
        }
    }

    pub fn best_path(&self) -> PathBuf {
        self.checkpoint_dir.join("best_model.mpk")
    }

    /// Load best model
    pub fn load_best<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<(FlareCnn<B>, CheckpointMetadata)> {
        let best_path = self.best_path();
        if !best_path.exists() {
            anyhow::bail!("No best model found at {:?}", best_path);
        }
        load_model(&best_path, device)
    }

    /// Load latest checkpoint
    pub fn load_latest<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<(FlareCnn<B>, CheckpointMetadata)> {
        let latest = self
            .list_checkpoints()?
            .into_iter()
            .max_by_key(|(epoch, _)| *epoch)
            .map(|(_, path)| path)
            .with_context(|| format!("No checkpoints found in {:?}", self.checkpoint_dir))?;

        load_model(&latest, device)
    }

    /// List all periodic checkpoints as (epoch, path)
    pub fn list_checkpoints(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut checkpoints = Vec::new();

        for entry in fs::read_dir(&self.checkpoint_dir)
            .context("Failed to read checkpoint directory")? {
            let entry = entry.context("Failed to read directory entry")?;
            let path = entry.path();

            if path.extension().map(|e| e == "mpk").unwrap_or(false) {
                let filename = path.file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("");

                if let Some(epoch_str) = filename.strip_prefix("checkpoint_epoch_") {
                    if let Ok(epoch) = epoch_str.parse::<usize>() {
                        checkpoints.push((epoch, path));
                    }
                }
            }
        }

        Ok(checkpoints)
    }

    /// Clean up old checkpoints, keeping only the most recent ones
    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let mut checkpoints = self.list_checkpoints()?;

        if checkpoints.len() > self.max_checkpoints {
            checkpoints.sort_by_key(|(epoch, _)| *epoch);

            let to_remove = checkpoints.len() - self.max_checkpoints;
            for (_, path) in checkpoints.into_iter().take(to_remove) {
                debug!("Removing old checkpoint: {:?}", path);
                fs::remove_file(&path).ok();
                fs::remove_file(path.with_extension("json")).ok();
            }
        }

        Ok(())
    }

    /// Get checkpoint directory path
    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }
}

/// Save model weights and their JSON metadata sidecar
pub fn save_model<B: Backend, P: AsRef<Path>>(
    model: &FlareCnn<B>,
    path: P,
    metadata: &CheckpointMetadata,
) -> Result<()> {
    let path = path.as_ref();

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let record = model.clone().into_record();
    CompactRecorder::new()
        .record(record, path.to_path_buf())
        .context("Failed to save model")?;

    let metadata_path = path.with_extension("json");
    let metadata_json = serde_json::to_string_pretty(metadata)
        .context("Failed to serialize metadata")?;
    fs::write(&metadata_path, metadata_json)
        .context("Failed to write metadata file")?;

    info!("Saved model: {:?}", path);
    Ok(())
}

/// Read the JSON metadata sidecar of a saved model
pub fn load_metadata<P: AsRef<Path>>(path: P) -> Result<CheckpointMetadata> {
    check_checkpoint_format(&path.as_ref().to_string_lossy())?;
    let metadata_path = path.as_ref().with_extension("json");
    let metadata_json = fs::read_to_string(&metadata_path)
        .with_context(|| format!("Failed to read metadata file {:?}", metadata_path))?;
    serde_json::from_str(&metadata_json).context("Failed to parse metadata")
}

/// Reject model files this crate cannot read
///
/// Keras HDF5 models hold no burn record or metadata. They have to be
/// converted to a checkpoint and passed explicitly.
pub fn check_checkpoint_format(name: &str) -> Result<()> {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());
    if let Some("h5" | "hdf5" | "keras") = ext.as_deref() {
        anyhow::bail!(
            "{} is a Keras model; the pretrained model must be converted to a flarecnn \
             checkpoint (.mpk weights with .json metadata) and passed with --model",
            name
        );
    }
    Ok(())
}

/// Load a model saved by [`save_model`]
///
/// The network is rebuilt from the sidecar's model configuration before the
/// weights are applied.
pub fn load_model<B: Backend, P: AsRef<Path>>(
    path: P,
    device: &B::Device,
) -> Result<(FlareCnn<B>, CheckpointMetadata)> {
    let path = path.as_ref();
    info!("Loading model from {:?}", path);

    let metadata = load_metadata(path)?;
    metadata.model_config.validate()?;

    let record = CompactRecorder::new()
        .load(path.to_path_buf(), device)
        .with_context(|| format!("Failed to load model weights from {:?}", path))?;

    let model = init_model::<B>(&metadata.model_config, device).load_record(record);

    info!("Loaded model from epoch {}", metadata.epoch);
    Ok((model, metadata))
}
