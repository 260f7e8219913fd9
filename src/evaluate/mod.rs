//! Model evaluation: confusion matrices and summary metrics

pub mod heatmap;

pub use heatmap::{plot_confusion_matrix, render_confusion_matrix};

use crate::data::{ExampleSet, FLARE};
use crate::model::architecture::FlareCnn;
use crate::model::batcher::{windows_tensor, FlareBatcher};
use anyhow::{anyhow, bail, Result};
use burn::prelude::*;
use burn::tensor::activation::sigmoid;
use burn::tensor::ElementConversion;
use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Probability at or above which a window counts as a flare
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Classification metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    /// Mean binary cross entropy
    pub loss: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// 2x2 confusion matrix, rows are the true class, columns the predicted class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub counts: [[usize; 2]; 2],
}

impl ConfusionMatrix {
    /// Count predictions thresholded at `threshold` against true labels
    pub fn from_predictions(probabilities: &[f32], labels: &[u8], threshold: f32) -> Result<Self> {
        if probabilities.len() != labels.len() {
            bail!(
                "{} predictions for {} labels",
                probabilities.len(),
                labels.len()
            );
        }

        let mut counts = [[0usize; 2]; 2];
        for (&p, &label) in probabilities.iter().zip(labels) {
            let actual = usize::from(label == FLARE);
            let predicted = usize::from(p >= threshold);
            counts[actual][predicted] += 1;
        }
        Ok(Self { counts })
    }

    pub fn true_negatives(&self) -> usize {
        self.counts[0][0]
    }

    pub fn false_positives(&self) -> usize {
        self.counts[0][1]
    }

    pub fn false_negatives(&self) -> usize {
        self.counts[1][0]
    }

    pub fn true_positives(&self) -> usize {
        self.counts[1][1]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    /// Divide each row by its total
    ///
    /// A class with no true examples has an all-zero row.
    pub fn normalized(&self) -> [[f64; 2]; 2] {
        let mut out = [[0.0; 2]; 2];
        for (class, row) in self.counts.iter().enumerate() {
            let total: usize = row.iter().sum();
            if total == 0 {
                warn!("No examples of class {}; its confusion-matrix row is left at zero", class);
                continue;
            }
            for (col, &count) in row.iter().enumerate() {
                out[class][col] = count as f64 / total as f64;
            }
        }
        out
    }

    /// Metrics derived from the counts, with `loss` filled in by the caller
    pub fn metrics(&self, loss: f64) -> Metrics {
        let tp = self.true_positives() as f64;
        let fp = self.false_positives() as f64;
        let fn_ = self.false_negatives() as f64;
        let total = self.total() as f64;

        let ratio = |num: f64, den: f64| if den > 0.0 { num / den } else { 0.0 };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);

        Metrics {
            loss,
            accuracy: ratio(tp + self.true_negatives() as f64, total),
            precision,
            recall,
            f1: ratio(2.0 * precision * recall, precision + recall),
        }
    }
}

/// Result of scoring a model on a labelled set
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub probabilities: Vec<f32>,
    pub matrix: ConfusionMatrix,
    pub metrics: Metrics,
}

/// Score `examples` in batches, computing loss and threshold metrics
pub fn evaluate_model<B: Backend>(
    model: &FlareCnn<B>,
    examples: &ExampleSet,
    batch_size: usize,
    device: &B::Device,
) -> Result<Evaluation> {
    if examples.is_empty() {
        bail!("Cannot evaluate on an empty example set");
    }

    let batcher = FlareBatcher::<B>::new(device.clone());
    let indices: Vec<usize> = (0..examples.len()).collect();
    let mut probabilities = Vec::with_capacity(examples.len());
    let mut loss_sum = 0.0;

    for chunk in indices.chunks(batch_size.max(1)) {
        let batch = batcher.batch(examples, chunk);
        let output = model.forward_classification(batch.windows, batch.targets);

        let loss: f64 = output.loss.into_scalar().elem();
        loss_sum += loss * chunk.len() as f64;
        probabilities.extend(tensor_to_vec(sigmoid(output.logits))?);
    }

    let labels = examples.labels.as_slice().ok_or_else(|| anyhow!("Labels are not contiguous"))?;
    let matrix = ConfusionMatrix::from_predictions(&probabilities, labels, DEFAULT_THRESHOLD)?;
    let metrics = matrix.metrics(loss_sum / examples.len() as f64);
    debug!("Evaluated {} examples: {:?}", examples.len(), metrics);

    Ok(Evaluation {
        probabilities,
        matrix,
        metrics,
    })
}

/// Flare probabilities for unlabelled windows of shape `[n, cadences, 1]`
pub fn predict_windows<B: Backend>(
    model: &FlareCnn<B>,
    data: &Array3<f32>,
    batch_size: usize,
    device: &B::Device,
) -> Result<Vec<f32>> {
    let (n, cadences, _) = data.dim();
    let mut probabilities = Vec::with_capacity(n);

    let indices: Vec<usize> = (0..n).collect();
    for chunk in indices.chunks(batch_size.max(1)) {
        let flux: Vec<f32> = data.select(Axis(0), chunk).iter().copied().collect();
        let input = windows_tensor::<B>(flux, chunk.len(), cadences, device);
        probabilities.extend(tensor_to_vec(model.predict_proba(input))?);
    }
    Ok(probabilities)
}

pub(crate) fn tensor_to_vec<B: Backend>(tensor: Tensor<B, 1>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Failed to read tensor data: {:?}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::architecture::init_model;
    use crate::model::ModelConfig;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_perfect_predictions_give_identity() {
        let labels = [0u8, 1, 0, 1];
        let probabilities = [0.1f32, 0.9, 0.2, 0.8];
        let matrix = ConfusionMatrix::from_predictions(&probabilities, &labels, 0.5).unwrap();

        assert_eq!(matrix.counts, [[2, 0], [0, 2]]);
        assert_eq!(matrix.normalized(), [[1.0, 0.0], [0.0, 1.0]]);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let matrix = ConfusionMatrix::from_predictions(&[0.5], &[1], 0.5).unwrap();
        assert_eq!(matrix.true_positives(), 1);
    }

    #[test]
    fn test_missing_class_row_is_zero() {
        let matrix = ConfusionMatrix::from_predictions(&[0.1, 0.7], &[0, 0], 0.5).unwrap();
        let normalized = matrix.normalized();

        assert_eq!(normalized[0], [0.5, 0.5]);
        assert_eq!(normalized[1], [0.0, 0.0]);
    }

    #[test]
    fn test_length_mismatch() {
        assert!(ConfusionMatrix::from_predictions(&[0.1], &[0, 1], 0.5).is_err());
    }

    #[test]
    fn test_metrics_from_counts() {
        let matrix = ConfusionMatrix {
            counts: [[6, 2], [1, 3]],
        };
        let metrics = matrix.metrics(0.4);

        assert!((metrics.accuracy - 0.75).abs() < 1e-12);
        assert!((metrics.precision - 0.6).abs() < 1e-12);
        assert!((metrics.recall - 0.75).abs() < 1e-12);
        assert!((metrics.f1 - 2.0 * 0.6 * 0.75 / 1.35).abs() < 1e-12);
        assert_eq!(metrics.loss, 0.4);
    }

    #[test]
    fn test_evaluate_model_shapes() {
        let device = <TestBackend as Backend>::Device::default();
        let model = init_model::<TestBackend>(&ModelConfig::flare_default().with_cadences(16), &device);
        let set = ExampleSet::from_windows(
            16,
            vec![vec![1.0; 16]; 5],
            vec![0, 1, 0, 1, 0],
            vec![1; 5],
            vec![0.0; 5],
        )
        .unwrap();

        let evaluation = evaluate_model(&model, &set, 2, &device).unwrap();
        assert_eq!(evaluation.probabilities.len(), 5);
        assert_eq!(evaluation.matrix.total(), 5);
        assert!(evaluation.metrics.loss > 0.0);

        let probabilities = predict_windows(&model, &set.data, 3, &device).unwrap();
        assert_eq!(probabilities.len(), 5);
    }

    #[test]
    fn test_evaluate_empty_set() {
        let device = <TestBackend as Backend>::Device::default();
        let model = init_model::<TestBackend>(&ModelConfig::flare_default().with_cadences(16), &device);
        assert!(evaluate_model(&model, &ExampleSet::empty(16), 4, &device).is_err());
    }
}
