pub mod catalog;
pub mod filter;
pub mod fits;
pub mod loader;
pub mod plot;
pub mod preprocessing;

use ndarray::{Array1, Array3, Axis};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Number of cadences in one example window
pub const DEFAULT_CADENCES: usize = 200;

/// Label of a window centred on a flare peak
pub const FLARE: u8 = 1;

/// Label of a window centred on a quiet cadence
pub const NO_FLARE: u8 = 0;

/// Brightness time series of a single TESS target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightCurve {
    /// TESS Input Catalog identifier
    pub tic: u64,
    /// Observing sector, when known
    pub sector: Option<u32>,
    /// Timestamps (BTJD)
    pub time: Vec<f64>,
    /// Flux values
    pub flux: Vec<f32>,
    /// Flux uncertainties
    pub flux_err: Vec<f32>,
}

impl LightCurve {
    /// `time`, `flux` and `flux_err` must have one entry per cadence
    pub fn new(tic: u64, time: Vec<f64>, flux: Vec<f32>, flux_err: Vec<f32>) -> anyhow::Result<Self> {
        if flux.len() != time.len() || flux_err.len() != time.len() {
            anyhow::bail!(
                "TIC {}: {} timestamps, {} flux values and {} errors",
                tic,
                time.len(),
                flux.len(),
                flux_err.len()
            );
        }
        Ok(Self {
            tic,
            sector: None,
            time,
            flux,
            flux_err,
        })
    }

    pub fn with_sector(mut self, sector: u32) -> Self {
        self.sector = Some(sector);
        self
    }

    /// Number of cadences
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Index of the cadence closest to `t`, ignoring NaN timestamps
    pub fn nearest_cadence(&self, t: f64) -> Option<usize> {
        self.time
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nan())
            .min_by(|(_, a), (_, b)| (*a - t).abs().total_cmp(&(*b - t).abs()))
            .map(|(i, _)| i)
    }

    /// Median spacing between consecutive valid timestamps
    pub fn median_cadence(&self) -> Option<f64> {
        let mut diffs: Vec<f64> = self
            .time
            .windows(2)
            .map(|w| w[1] - w[0])
            .filter(|d| d.is_finite() && *d > 0.0)
            .collect();
        if diffs.is_empty() {
            return None;
        }
        diffs.sort_by(|a, b| a.total_cmp(b));
        Some(diffs[diffs.len() / 2])
    }
}

/// Collection of labelled example windows
///
/// `data` has shape `[n_examples, cadences, 1]`. Row `i` of every field
/// describes the same example.
#[derive(Debug, Clone)]
pub struct ExampleSet {
    /// Normalized flux windows
    pub data: Array3<f32>,
    /// 1 = flare at the centre cadence, 0 = no flare
    pub labels: Array1<u8>,
    /// Source target of each window
    pub tic: Vec<u64>,
    /// Timestamp of each window's centre cadence
    pub center_time: Vec<f64>,
}

impl ExampleSet {
    /// Create an empty set with the given window length
    pub fn empty(cadences: usize) -> Self {
        Self {
            data: Array3::zeros((0, cadences, 1)),
            labels: Array1::zeros(0),
            tic: Vec::new(),
            center_time: Vec::new(),
        }
    }

    /// Build a set from flat window rows
    pub fn from_windows(
        cadences: usize,
        windows: Vec<Vec<f32>>,
        labels: Vec<u8>,
        tic: Vec<u64>,
        center_time: Vec<f64>,
    ) -> anyhow::Result<Self> {
        let n = windows.len();
        if labels.len() != n || tic.len() != n || center_time.len() != n {
            anyhow::bail!(
                "Example fields disagree in length: {} windows, {} labels, {} tics, {} times",
                n,
                labels.len(),
                tic.len(),
                center_time.len()
            );
        }
        if let Some(bad) = windows.iter().find(|w| w.len() != cadences) {
            anyhow::bail!("Window of length {} does not match {} cadences", bad.len(), cadences);
        }

        let flat: Vec<f32> = windows.into_iter().flatten().collect();
        let data = Array3::from_shape_vec((n, cadences, 1), flat)?;

        Ok(Self {
            data,
            labels: Array1::from_vec(labels),
            tic,
            center_time,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Window length
    pub fn cadences(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn positive_count(&self) -> usize {
        self.labels.iter().filter(|&&l| l == FLARE).count()
    }

    /// Subset every field with the same index list
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            data: self.data.select(Axis(0), indices),
            labels: self.labels.select(Axis(0), indices),
            tic: indices.iter().map(|&i| self.tic[i]).collect(),
            center_time: indices.iter().map(|&i| self.center_time[i]).collect(),
        }
    }

    /// Flux window of example `index`
    pub fn window(&self, index: usize) -> Vec<f32> {
        self.data
            .index_axis(Axis(0), index)
            .iter()
            .copied()
            .collect()
    }
}

/// Train / validation / test splits
#[derive(Debug, Clone)]
pub struct FlareDataset {
    pub train: ExampleSet,
    pub val: ExampleSet,
    pub test: ExampleSet,
}

/// Example counts per split
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SplitSummary {
    pub examples: usize,
    pub flares: usize,
}

impl From<&ExampleSet> for SplitSummary {
    fn from(set: &ExampleSet) -> Self {
        Self {
            examples: set.len(),
            flares: set.positive_count(),
        }
    }
}

/// Example counts for all three splits
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetSummary {
    pub train: SplitSummary,
    pub val: SplitSummary,
    pub test: SplitSummary,
}

impl FlareDataset {
    /// Total number of examples
    pub fn total_examples(&self) -> usize {
        self.train.len() + self.val.len() + self.test.len()
    }

    pub fn summary(&self) -> DatasetSummary {
        DatasetSummary {
            train: (&self.train).into(),
            val: (&self.val).into(),
            test: (&self.test).into(),
        }
    }

    /// Drop every example whose window contains a NaN
    ///
    /// Data and labels of each split are subset with the same index list.
    pub fn drop_nan_examples(&mut self) {
        for (name, split) in [
            ("train", &mut self.train),
            ("val", &mut self.val),
            ("test", &mut self.test),
        ] {
            let keep = filter::nan_free_indices(&split.data);
            let dropped = split.len() - keep.len();
            *split = split.select(&keep);

            info!("{}: dropped {} examples containing NaN, {} remain", name, dropped, split.len());
            if split.is_empty() {
                warn!("{} split is empty after NaN filtering", name);
            }
        }
    }
}

impl DatasetSummary {
    /// Print summary to stdout
    pub fn print(&self) {
        println!("\n=== Dataset Summary ===");
        for (name, split) in [("Train", self.train), ("Validation", self.val), ("Test", self.test)] {
            println!("{:<11} {:>7} examples, {:>6} flares", name, split.examples, split.flares);
        }
        println!("=======================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_set() -> ExampleSet {
        ExampleSet::from_windows(
            3,
            vec![vec![1.0, 2.0, 3.0], vec![f32::NAN, 1.0, 1.0], vec![4.0, 5.0, 6.0]],
            vec![1, 0, 0],
            vec![10, 11, 12],
            vec![100.0, 101.0, 102.0],
        )
        .unwrap()
    }

    #[test]
    fn test_from_windows_shape() {
        let set = tiny_set();
        assert_eq!(set.data.shape(), &[3, 3, 1]);
        assert_eq!(set.cadences(), 3);
        assert_eq!(set.positive_count(), 1);
        assert_eq!(set.window(2), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_from_windows_rejects_mismatch() {
        let result = ExampleSet::from_windows(3, vec![vec![1.0, 2.0, 3.0]], vec![], vec![1], vec![0.0]);
        assert!(result.is_err());

        let result = ExampleSet::from_windows(3, vec![vec![1.0]], vec![1], vec![1], vec![0.0]);
        assert!(result.is_err());
    }

    #[test]
    fn test_select_keeps_alignment() {
        let set = tiny_set();
        let subset = set.select(&[2, 0]);

        assert_eq!(subset.len(), 2);
        assert_eq!(subset.labels.to_vec(), vec![0, 1]);
        assert_eq!(subset.tic, vec![12, 10]);
        assert_eq!(subset.center_time, vec![102.0, 100.0]);
        assert_eq!(subset.window(0), vec![4.0, 5.0, 6.0]);
        assert_eq!(subset.window(1), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_drop_nan_examples() {
        let mut dataset = FlareDataset {
            train: tiny_set(),
            val: tiny_set(),
            test: ExampleSet::empty(3),
        };
        dataset.drop_nan_examples();

        assert_eq!(dataset.train.len(), 2);
        assert_eq!(dataset.train.tic, vec![10, 12]);
        assert_eq!(dataset.train.labels.to_vec(), vec![1, 0]);
        assert!(dataset.test.is_empty());
        assert_eq!(dataset.total_examples(), 4);
    }

    #[test]
    fn test_light_curve_helpers() {
        let lc = LightCurve::new(
            1,
            vec![0.0, 0.1, 0.2, f64::NAN, 0.4],
            vec![1.0; 5],
            vec![0.1; 5],
        )
        .unwrap();
        assert_eq!(lc.nearest_cadence(0.19), Some(2));
        assert_eq!(lc.nearest_cadence(0.33), Some(4));
        assert!((lc.median_cadence().unwrap() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_light_curve_length_mismatch() {
        assert!(LightCurve::new(1, vec![0.0, 0.1, 0.2], vec![1.0; 2], vec![0.1; 3]).is_err());
        assert!(LightCurve::new(1, vec![0.0, 0.1], vec![1.0; 2], vec![0.1; 3]).is_err());
    }
}
