use crate::data::catalog::{CatalogFlare, FlareCatalog};
use crate::data::loader::LightCurveLoader;
use crate::data::{ExampleSet, FlareDataset, LightCurve, DEFAULT_CADENCES, FLARE, NO_FLARE};
use crate::utils::random::seeded_rng;
use anyhow::{bail, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Example construction and split configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Window length in cadences
    pub cadences: usize,
    /// Fraction of negative (no flare) examples in the final set
    pub frac_balance: f64,
    /// Cut point between training and validation examples
    pub training: f64,
    /// Cut point between validation and test examples
    pub validation: f64,
    /// Flare half-width used when the catalog has no start/end times (days)
    pub flare_halfwidth_days: f64,
    /// Random seed for negative sampling and shuffling
    pub seed: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            cadences: DEFAULT_CADENCES,
            frac_balance: 0.73,
            training: 0.80,
            validation: 0.90,
            flare_halfwidth_days: 0.02,
            seed: 2020,
        }
    }
}

impl DatasetConfig {
    fn validate(&self) -> Result<()> {
        crate::utils::validation::positive(self.cadences, "cadences")?;
        crate::utils::validation::in_range(self.frac_balance, 0.0, 0.99, "frac_balance")?;
        if !(0.0 < self.training && self.training <= self.validation && self.validation <= 1.0) {
            bail!(
                "Split cut points must satisfy 0 < training <= validation <= 1, got {} and {}",
                self.training,
                self.validation
            );
        }
        Ok(())
    }
}

/// Median of the non-NaN values, or None when every value is NaN
pub fn nan_median(values: &[f32]) -> Option<f32> {
    let mut finite: Vec<f32> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if finite.is_empty() {
        return None;
    }
    finite.sort_by(|a, b| a.total_cmp(b));
    let mid = finite.len() / 2;
    Some(if finite.len() % 2 == 0 {
        (finite[mid - 1] + finite[mid]) / 2.0
    } else {
        finite[mid]
    })
}

/// Divide a window by its median flux
///
/// A window with no finite median (all NaN, or median zero) becomes all NaN
/// so the NaN filter drops it.
pub fn normalize_window(window: &mut [f32]) {
    match nan_median(window) {
        Some(median) if median != 0.0 => window.iter_mut().for_each(|v| *v /= median),
        _ => window.iter_mut().for_each(|v| *v = f32::NAN),
    }
}

/// Window of `cadences` flux values centred on `center`
///
/// The centre sits at `cadences / 2`. Returns None when the window does not
/// fit inside the light curve.
pub fn centered_window(flux: &[f32], center: usize, cadences: usize) -> Option<Vec<f32>> {
    let half = cadences / 2;
    let start = center.checked_sub(half)?;
    let end = start + cadences;
    if end > flux.len() {
        return None;
    }
    Some(flux[start..end].to_vec())
}

/// Labelled windows before splitting
struct Examples {
    windows: Vec<Vec<f32>>,
    labels: Vec<u8>,
    tic: Vec<u64>,
    center_time: Vec<f64>,
}

impl Examples {
    fn new() -> Self {
        Self {
            windows: Vec::new(),
            labels: Vec::new(),
            tic: Vec::new(),
            center_time: Vec::new(),
        }
    }

    fn push(&mut self, mut window: Vec<f32>, label: u8, tic: u64, time: f64) {
        normalize_window(&mut window);
        self.windows.push(window);
        self.labels.push(label);
        self.tic.push(tic);
        self.center_time.push(time);
    }

    fn len(&self) -> usize {
        self.labels.len()
    }
}

/// Build labelled example windows from a catalog and its light curves
///
/// Positive windows are centred on each catalog flare peak. Negative
/// windows are centred on random cadences outside every catalogued flare,
/// sampled so that they make up `frac_balance` of the result. NaN values are
/// kept; filtering is a separate step.
pub fn build_examples(
    catalog: &FlareCatalog,
    light_curves: &[LightCurve],
    config: &DatasetConfig,
) -> Result<FlareDataset> {
    config.validate()?;
    let mut rng = seeded_rng(config.seed);
    let flares_by_tic = catalog.by_target();

    let mut positives = Examples::new();
    let mut negative_pool: Vec<(usize, usize)> = Vec::new();

    for (lc_idx, lc) in light_curves.iter().enumerate() {
        let no_flares = Vec::new();
        let flares = flares_by_tic.get(&lc.tic).unwrap_or(&no_flares);
        let cadence = lc.median_cadence().unwrap_or(f64::INFINITY);

        for flare in flares {
            let Some(center) = lc.nearest_cadence(flare.tpeak) else {
                continue;
            };
            // Peak lies in a gap or outside this sector
            if (lc.time[center] - flare.tpeak).abs() > cadence {
                continue;
            }
            match centered_window(&lc.flux, center, config.cadences) {
                Some(window) => positives.push(window, FLARE, lc.tic, lc.time[center]),
                None => debug!("Flare at {} on TIC {} is too close to the edge", flare.tpeak, lc.tic),
            }
        }

        negative_pool.extend(
            negative_candidates(lc, flares, config.cadences)
                .into_iter()
                .map(|c| (lc_idx, c)),
        );
    }

    let n_pos = positives.len();
    if n_pos == 0 {
        warn!("No catalog flare matched a light curve");
    }

    let wanted_neg = if config.frac_balance > 0.0 {
        ((n_pos as f64) * config.frac_balance / (1.0 - config.frac_balance)).round() as usize
    } else {
        0
    };
    let n_neg = wanted_neg.min(negative_pool.len());
    if n_neg < wanted_neg {
        warn!("Only {} negative cadences available, wanted {}", n_neg, wanted_neg);
    }

    let mut examples = positives;
    for &(lc_idx, center) in negative_pool.choose_multiple(&mut rng, n_neg) {
        let lc = &light_curves[lc_idx];
        if let Some(window) = centered_window(&lc.flux, center, config.cadences) {
            examples.push(window, NO_FLARE, lc.tic, lc.time[center]);
        }
    }

    info!("Built {} flare and {} non-flare examples", n_pos, examples.len() - n_pos);
    split(examples, config, &mut rng)
}

/// Load an extracted dataset directory into NaN-free splits
///
/// Reads the catalog file and every light curve under `root`, builds the
/// example windows and drops windows containing NaN.
pub fn load_dataset(root: &Path, config: &DatasetConfig) -> Result<FlareDataset> {
    let catalog_path = crate::remote::find_catalog(root)?;
    let catalog = FlareCatalog::load(&catalog_path, config.flare_halfwidth_days)?;
    info!("Catalog lists {} flares", catalog.len());

    let light_curves = LightCurveLoader::new().load_dir(root)?;
    if light_curves.is_empty() {
        bail!("No light curves found under {:?}", root);
    }

    let mut dataset = build_examples(&catalog, &light_curves, config)?;
    dataset.drop_nan_examples();
    Ok(dataset)
}

/// Cadences whose full window fits and that lie outside every flare
fn negative_candidates(lc: &LightCurve, flares: &[CatalogFlare], cadences: usize) -> Vec<usize> {
    let half = cadences / 2;
    if lc.len() < cadences {
        return Vec::new();
    }
    (half..=lc.len() - (cadences - half))
        .filter(|&i| {
            let t = lc.time[i];
            !t.is_nan() && !lc.flux[i].is_nan() && !flares.iter().any(|f| f.contains(t))
        })
        .collect()
}

/// Shuffle and cut into train / validation / test
fn split<R: Rng>(examples: Examples, config: &DatasetConfig, rng: &mut R) -> Result<FlareDataset> {
    let n = examples.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);

    let train_end = (n as f64 * config.training).round() as usize;
    let val_end = ((n as f64 * config.validation).round() as usize).max(train_end);

    let subset = |range: std::ops::Range<usize>| -> Result<ExampleSet> {
        let picked = &order[range];
        ExampleSet::from_windows(
            config.cadences,
            picked.iter().map(|&i| examples.windows[i].clone()).collect(),
            picked.iter().map(|&i| examples.labels[i]).collect(),
            picked.iter().map(|&i| examples.tic[i]).collect(),
            picked.iter().map(|&i| examples.center_time[i]).collect(),
        )
    };

    let dataset = FlareDataset {
        train: subset(0..train_end)?,
        val: subset(train_end..val_end)?,
        test: subset(val_end..n)?,
    };

    info!(
        "Split sizes: train={}, val={}, test={}",
        dataset.train.len(),
        dataset.val.len(),
        dataset.test.len()
    );
    Ok(dataset)
}
