//! # flarecnn: stellar flare detection in TESS light curves
//!
//! A one-dimensional convolutional network that labels fixed-length windows
//! of two-minute cadence photometry as flare or no flare.
//!
//! ## Features
//!
//! - Cached download of the labelled training set and a pretrained model
//! - Example windows built from a flare catalog, with NaN filtering
//! - Training with Adam and binary cross entropy, checkpoints and history
//! - Confusion-matrix evaluation with an SVG heatmap
//! - Per-cadence flare probabilities for light curves fetched from MAST
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use flarecnn::data::preprocessing::{load_dataset, DatasetConfig};
//! use flarecnn::evaluate::plot_confusion_matrix;
//! use flarecnn::model::ModelConfig;
//! use flarecnn::remote::{Downloader, RemoteConfig};
//! use flarecnn::training::{trainer::Trainer, TrainingConfig};
//! use flarecnn::TrainBackend;
//! use std::path::Path;
//!
//! let remote = RemoteConfig::default();
//! let root = Downloader::new(&remote)
//!     .unwrap()
//!     .fetch_and_extract(&remote.dataset_url, Path::new("data"))
//!     .unwrap();
//!
//! let dataset = load_dataset(&root, &DatasetConfig::default()).unwrap();
//!
//! let device = burn::backend::ndarray::NdArrayDevice::default();
//! let mut trainer =
//!     Trainer::<TrainBackend>::new(TrainingConfig::default(), ModelConfig::flare_default(), device)
//!         .unwrap();
//! trainer.train(&dataset).unwrap();
//!
//! let model = trainer.inference_model();
//! plot_confusion_matrix(
//!     &model,
//!     &dataset.test.data,
//!     &dataset.test.labels,
//!     Path::new("confusion_matrix.svg"),
//!     &device,
//! )
//! .unwrap();
//! ```

pub mod cli;
pub mod data;
pub mod evaluate;
pub mod model;
pub mod predict;
pub mod remote;
pub mod training;
pub mod utils;

use burn::backend::Autodiff;
use burn_ndarray::NdArray;

/// Default backend type
pub type DefaultBackend = NdArray<f32>;

/// Backend used for training
pub type TrainBackend = Autodiff<DefaultBackend>;

/// Re-export commonly used types
pub use data::{ExampleSet, FlareDataset, LightCurve};
pub use evaluate::{ConfusionMatrix, Metrics};
pub use model::{architecture::FlareCnn, ModelConfig};
pub use predict::{BatchPredictionResult, FlarePredictionTrack, Predictor};
pub use training::{TrainingConfig, TrainingResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get library information
pub fn info() -> String {
    format!(
        "{} v{} - stellar flare detection with a convolutional network",
        NAME, VERSION
    )
}
