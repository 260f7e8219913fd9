use crate::data::preprocessing::DatasetConfig;
use crate::model::ModelConfig;
use crate::remote::RemoteConfig;
use crate::training::TrainingConfig;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// flare-cnn: find stellar flares in TESS light curves with a 1-D CNN
#[derive(Parser, Debug)]
#[command(name = "flare-cnn")]
#[command(about = "Train and apply a convolutional flare classifier to TESS light curves")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// YAML configuration file; command-line flags take precedence
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download and unpack the labelled training set
    Download(DownloadArgs),

    /// Build examples, train a model and plot its confusion matrix
    Train(TrainArgs),

    /// Score a saved or pretrained model on the test split
    Evaluate(EvaluateArgs),

    /// Fetch light curves and mark flares in them
    Predict(PredictArgs),
}

/// Download arguments
#[derive(Parser, Debug)]
pub struct DownloadArgs {
    /// Directory to unpack the training set into
    #[arg(short, long, default_value = "./data")]
    pub output: PathBuf,

    /// Also fetch the pretrained model
    #[arg(long)]
    pub pretrained: bool,
}

/// Training arguments
#[derive(Parser, Debug)]
pub struct TrainArgs {
    /// Extracted training set (downloaded when omitted)
    #[arg(short, long)]
    pub data: Option<PathBuf>,

    /// Output directory for model, checkpoints and figures
    #[arg(short, long, default_value = "./output")]
    pub output: PathBuf,

    /// Number of training epochs
    #[arg(short, long)]
    pub epochs: Option<usize>,

    /// Batch size
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Learning rate
    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Random seed for example sampling and shuffling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Early stopping patience (0 = off)
    #[arg(long)]
    pub patience: Option<usize>,

    /// Quick test mode (fewer epochs)
    #[arg(long)]
    pub quick: bool,
}

/// Evaluation arguments
#[derive(Parser, Debug)]
pub struct EvaluateArgs {
    /// Extracted training set (downloaded when omitted)
    #[arg(short, long)]
    pub data: Option<PathBuf>,

    /// Saved model (the pretrained model is downloaded when omitted)
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Confusion-matrix figure
    #[arg(short, long, default_value = "confusion_matrix.svg")]
    pub plot: PathBuf,

    /// JSON report with metrics and counts
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Batch size for evaluation
    #[arg(short, long, default_value = "256")]
    pub batch_size: usize,
}

/// Prediction arguments
#[derive(Parser, Debug)]
pub struct PredictArgs {
    /// TIC ids to fetch from MAST
    #[arg(short, long = "tic", num_args = 1..)]
    pub tic: Vec<u64>,

    /// Restrict the MAST search to one sector
    #[arg(short, long)]
    pub sector: Option<u32>,

    /// Local light-curve file or directory instead of MAST
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Saved model (the pretrained model is downloaded when omitted)
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Output directory for candidates, cadence scores and JSON
    #[arg(short, long, default_value = "./predictions")]
    pub output: PathBuf,

    /// Probability threshold for flare candidates
    #[arg(long, default_value = "0.5")]
    pub threshold: f32,

    /// Batch size for prediction
    #[arg(short, long, default_value = "256")]
    pub batch_size: usize,
}

/// Settings that may come from a YAML file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub dataset: DatasetConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub remote: RemoteConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            dataset: DatasetConfig::default(),
            model: ModelConfig::flare_default(),
            training: TrainingConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

impl AppConfig {
    /// Read a YAML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse config {:?}", path))?;

        if config.model.cadences != config.dataset.cadences {
            anyhow::bail!(
                "model.cadences ({}) and dataset.cadences ({}) disagree",
                config.model.cadences,
                config.dataset.cadences
            );
        }
        Ok(config)
    }

    /// The file's settings, or defaults when no file is given
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Apply training flags over the file settings
    pub fn apply_train_args(&mut self, args: &TrainArgs) {
        if args.quick {
            self.training.epochs = TrainingConfig::quick_test().epochs;
        }
        if let Some(epochs) = args.epochs {
            self.training.epochs = epochs;
        }
        if let Some(batch_size) = args.batch_size {
            self.training.batch_size = batch_size;
        }
        if let Some(lr) = args.learning_rate {
            self.training.learning_rate = lr;
        }
        if let Some(seed) = args.seed {
            self.training.seed = seed;
            self.dataset.seed = seed;
        }
        if let Some(patience) = args.patience {
            self.training.early_stopping_patience = patience;
        }
    }
}

/// Parse CLI arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Setup logging based on verbosity
pub fn setup_logging(verbose: bool) {
    let filter = if verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_train() {
        let cli = Cli::parse_from(["flare-cnn", "train", "-d", "data", "--epochs", "3"]);

        match cli.command {
            Commands::Train(args) => {
                assert_eq!(args.data, Some(PathBuf::from("data")));
                assert_eq!(args.output, PathBuf::from("./output"));
                assert_eq!(args.epochs, Some(3));
                assert_eq!(args.batch_size, None);
            }
            _ => panic!("Expected Train command"),
        }
    }

    #[test]
    fn test_predict_args() {
        let cli = Cli::parse_from([
            "flare-cnn", "predict",
            "--tic", "62124646", "261136679",
            "-m", "model.mpk",
            "--threshold", "0.7",
        ]);

        match cli.command {
            Commands::Predict(args) => {
                assert_eq!(args.tic, vec![62124646, 261136679]);
                assert_eq!(args.model, Some(PathBuf::from("model.mpk")));
                assert_eq!(args.threshold, 0.7);
                assert_eq!(args.output, PathBuf::from("./predictions"));
            }
            _ => panic!("Expected Predict command"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["flare-cnn", "evaluate", "--config", "run.yaml", "-v"]);
        assert_eq!(cli.config, Some(PathBuf::from("run.yaml")));
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Evaluate(_)));
    }

    #[test]
    fn test_flags_override_config() {
        let mut config = AppConfig::default();
        config.training.batch_size = 128;

        let cli = Cli::parse_from(["flare-cnn", "train", "--epochs", "7", "--seed", "11"]);
        let Commands::Train(args) = cli.command else {
            panic!("Expected Train command");
        };
        config.apply_train_args(&args);

        assert_eq!(config.training.epochs, 7);
        assert_eq!(config.training.batch_size, 128);
        assert_eq!(config.training.seed, 11);
        assert_eq!(config.dataset.seed, 11);
    }

    #[test]
    fn test_load_yaml_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "training:\n  epochs: 12\n  learning_rate: 0.0005\nremote:\n  cache_dir: /tmp/flares\n",
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.training.epochs, 12);
        assert_eq!(config.training.batch_size, 64);
        assert_eq!(config.remote.cache_dir, PathBuf::from("/tmp/flares"));
        assert_eq!(config.model.cadences, 200);

        assert!(AppConfig::resolve(None).is_ok());
        assert!(AppConfig::load(dir.path().join("missing.yaml")).is_err());
    }
}
