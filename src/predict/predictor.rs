use crate::data::preprocessing::normalize_window;
use crate::data::{ExampleSet, LightCurve};
use crate::evaluate::{predict_windows, DEFAULT_THRESHOLD};
use crate::model::architecture::FlareCnn;
use crate::model::checkpoint::load_model;
use crate::model::ModelConfig;
use crate::predict::{BatchPredictionResult, FlarePredictionTrack};
use anyhow::Result;
use burn::prelude::*;
use ndarray::Array3;
use std::path::Path;
use tracing::{debug, info, warn};

/// Applies a trained flare CNN to light curves
pub struct Predictor<B: Backend> {
    model: FlareCnn<B>,
    model_config: ModelConfig,
    device: B::Device,
    batch_size: usize,
    threshold: f32,
    gap_factor: f64,
}

impl<B: Backend> Predictor<B> {
    pub fn new(model: FlareCnn<B>, model_config: ModelConfig, device: B::Device) -> Self {
        Self {
            model,
            model_config,
            device,
            batch_size: 256,
            threshold: DEFAULT_THRESHOLD,
            gap_factor: 3.0,
        }
    }

    /// Load a model saved with its metadata sidecar
    pub fn from_checkpoint<P: AsRef<Path>>(path: P, device: B::Device) -> Result<Self> {
        let (model, metadata) = load_model::<B, _>(path, &device)?;
        Ok(Self::new(model, metadata.model_config, device))
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Probability at or above which cadences form flare candidates
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Gaps longer than `gap_factor` median cadences split a light curve
    pub fn with_gap_factor(mut self, gap_factor: f64) -> Self {
        self.gap_factor = gap_factor;
        self
    }

    pub fn cadences(&self) -> usize {
        self.model_config.cadences
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Flare probabilities for prepared example windows
    pub fn predict_examples(&self, examples: &ExampleSet) -> Result<Vec<f32>> {
        if examples.cadences() != self.cadences() {
            anyhow::bail!(
                "Model expects {}-cadence windows but the examples have {}",
                self.cadences(),
                examples.cadences()
            );
        }
        predict_windows(&self.model, &examples.data, self.batch_size, &self.device)
    }

    /// Score every cadence of `lc` that has a full window of valid data around it
    pub fn predict_light_curve(&self, lc: &LightCurve) -> Result<FlarePredictionTrack> {
        let cadences = self.cadences();
        let half = cadences / 2;

        let mut centers = Vec::new();
        let mut flux = Vec::new();
        for segment in self.segments(lc) {
            if segment.len() <= 2 * half {
                continue;
            }
            for j in half..segment.len() - half {
                let mut window: Vec<f32> = segment[j - half..j - half + cadences]
                    .iter()
                    .map(|&i| lc.flux[i])
                    .collect();
                normalize_window(&mut window);
                flux.extend(window);
                centers.push(segment[j]);
            }
        }

        let mut probability = vec![None; lc.len()];
        if centers.is_empty() {
            warn!("TIC {}: no cadence has {} valid neighbours", lc.tic, cadences);
        } else {
            let data = Array3::from_shape_vec((centers.len(), cadences, 1), flux)?;
            let scores = predict_windows(&self.model, &data, self.batch_size, &self.device)?;
            for (&i, p) in centers.iter().zip(scores) {
                probability[i] = Some(p).filter(|p| p.is_finite());
            }
        }
        debug!("TIC {}: scored {} of {} cadences", lc.tic, centers.len(), lc.len());

        Ok(FlarePredictionTrack {
            tic: lc.tic,
            sector: lc.sector,
            time: lc.time.clone(),
            flux: lc.flux.clone(),
            flux_err: lc.flux_err.clone(),
            probability,
        })
    }

    /// Score a set of light curves and collect flare candidates
    pub fn predict_many(&self, light_curves: &[LightCurve]) -> Result<BatchPredictionResult> {
        info!("Predicting flares in {} light curves", light_curves.len());
        let tracks = light_curves
            .iter()
            .map(|lc| self.predict_light_curve(lc))
            .collect::<Result<Vec<_>>>()?;
        Ok(BatchPredictionResult::new(tracks, self.threshold))
    }

    /// Indices of valid cadences, split where the time step exceeds the gap limit
    fn segments(&self, lc: &LightCurve) -> Vec<Vec<usize>> {
        let valid = (0..lc.len()).filter(|&i| lc.time[i].is_finite() && lc.flux[i].is_finite());
        let max_gap = lc.median_cadence().map(|dt| dt * self.gap_factor);

        let mut segments: Vec<Vec<usize>> = Vec::new();
        let mut current: Vec<usize> = Vec::new();
        for i in valid {
            if let (Some(&prev), Some(max_gap)) = (current.last(), max_gap) {
                if lc.time[i] - lc.time[prev] > max_gap {
                    segments.push(std::mem::take(&mut current));
                }
            }
            current.push(i);
        }
        if !current.is_empty() {
            segments.push(current);
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::architecture::init_model;
    use crate::model::checkpoint::save_model;
    use crate::model::checkpoint::tests::create_test_metadata;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn predictor(cadences: usize) -> Predictor<TestBackend> {
        let device = <TestBackend as Backend>::Device::default();
        let config = ModelConfig::flare_default().with_cadences(cadences);
        let model = init_model::<TestBackend>(&config, &device);
        Predictor::new(model, config, device)
    }

    /// 40 cadences two minutes apart, a six-hour gap before cadence 20 and a
    /// NaN flux at cadence 30
    fn gappy_light_curve() -> LightCurve {
        let dt = 2.0 / 1440.0;
        let time: Vec<f64> = (0..40)
            .map(|i| if i < 20 { i as f64 * dt } else { 0.25 + i as f64 * dt })
            .collect();
        let mut flux: Vec<f32> = (0..40).map(|i| 100.0 + (i % 3) as f32).collect();
        flux[30] = f32::NAN;
        LightCurve::new(9, time, flux, vec![1.0; 40]).unwrap()
    }

    #[test]
    fn test_segments_split_at_gaps() {
        let segments = predictor(8).segments(&gappy_light_curve());

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], (0..20).collect::<Vec<_>>());
        assert_eq!(segments[1].len(), 19);
        assert!(!segments[1].contains(&30));
    }

    #[test]
    fn test_gap_adjacent_cadences_are_skipped() {
        let track = predictor(8).predict_light_curve(&gappy_light_curve()).unwrap();
        let scored: Vec<usize> = (0..40).filter(|&i| track.probability[i].is_some()).collect();

        let mut expected: Vec<usize> = (4..16).collect();
        expected.extend(24..30);
        expected.extend(31..36);
        assert_eq!(scored, expected);
        assert!(track
            .probability
            .iter()
            .flatten()
            .all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn test_short_light_curve_has_no_scores() {
        let lc = LightCurve::new(1, vec![0.0, 0.1, 0.2], vec![1.0; 3], vec![0.1; 3]).unwrap();
        let track = predictor(8).predict_light_curve(&lc).unwrap();
        assert_eq!(track.scored_cadences(), 0);
    }

    #[test]
    fn test_from_checkpoint_and_predict_many() {
        let dir = tempfile::TempDir::new().unwrap();
        let device = <TestBackend as Backend>::Device::default();
        let config = ModelConfig::flare_default().with_cadences(8);
        let model = init_model::<TestBackend>(&config, &device);
        let path = dir.path().join("model.mpk");
        save_model(&model, &path, &create_test_metadata(config)).unwrap();

        let predictor = Predictor::<TestBackend>::from_checkpoint(&path, device)
            .unwrap()
            .with_batch_size(5)
            .with_threshold(0.0);
        assert_eq!(predictor.cadences(), 8);

        let result = predictor.predict_many(&[gappy_light_curve()]).unwrap();
        assert_eq!(result.summary.scored_cadences, 23);
        assert_eq!(result.candidates.len(), 3);
    }

    #[test]
    fn test_predict_examples_checks_length() {
        let set = ExampleSet::from_windows(4, vec![vec![1.0; 4]], vec![0], vec![1], vec![0.0]).unwrap();
        assert!(predictor(8).predict_examples(&set).is_err());
    }
}
