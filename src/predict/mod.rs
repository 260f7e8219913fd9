pub mod predictor;

pub use predictor::Predictor;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Per-cadence flare probabilities for one light curve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlarePredictionTrack {
    pub tic: u64,
    pub sector: Option<u32>,
    pub time: Vec<f64>,
    pub flux: Vec<f32>,
    pub flux_err: Vec<f32>,
    /// None where no full window fits around the cadence
    pub probability: Vec<Option<f32>>,
}

/// Contiguous run of cadences above the flare threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlareCandidate {
    pub tic: u64,
    pub sector: Option<u32>,
    pub start_time: f64,
    pub peak_time: f64,
    pub end_time: f64,
    pub peak_probability: f32,
    pub cadences: usize,
}

impl FlarePredictionTrack {
    /// Number of cadences that received a probability
    pub fn scored_cadences(&self) -> usize {
        self.probability.iter().filter(|p| p.is_some()).count()
    }

    pub fn max_probability(&self) -> Option<f32> {
        self.probability
            .iter()
            .flatten()
            .copied()
            .fold(None, |acc, p| Some(acc.map_or(p, |a: f32| a.max(p))))
    }

    /// Runs of consecutive scored cadences with probability >= `threshold`
    pub fn flare_candidates(&self, threshold: f32) -> Vec<FlareCandidate> {
        let mut candidates = Vec::new();
        let mut run: Option<(usize, usize)> = None;

        for i in 0..=self.probability.len() {
            let above = self
                .probability
                .get(i)
                .copied()
                .flatten()
                .map_or(false, |p| p >= threshold);

            match (above, run) {
                (true, None) => run = Some((i, i)),
                (true, Some((start, _))) => run = Some((start, i)),
                (false, Some((start, end))) => {
                    candidates.push(self.candidate(start, end));
                    run = None;
                }
                (false, None) => {}
            }
        }
        candidates
    }

    fn candidate(&self, start: usize, end: usize) -> FlareCandidate {
        let (peak, peak_probability) = (start..=end)
            .filter_map(|i| self.probability[i].map(|p| (i, p)))
            .fold((start, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        FlareCandidate {
            tic: self.tic,
            sector: self.sector,
            start_time: self.time[start],
            peak_time: self.time[peak],
            end_time: self.time[end],
            peak_probability,
            cadences: end - start + 1,
        }
    }
}

/// Predictions over many light curves
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPredictionResult {
    pub tracks: Vec<FlarePredictionTrack>,
    pub candidates: Vec<FlareCandidate>,
    pub summary: PredictionSummary,
}

/// One row of the per-cadence CSV export
#[derive(Serialize)]
struct CadenceRow {
    tic: u64,
    sector: Option<u32>,
    time: f64,
    flux: f32,
    flux_err: f32,
    probability: Option<f32>,
}

impl BatchPredictionResult {
    pub fn new(tracks: Vec<FlarePredictionTrack>, threshold: f32) -> Self {
        let candidates: Vec<FlareCandidate> = tracks
            .iter()
            .flat_map(|t| t.flare_candidates(threshold))
            .collect();
        let summary = PredictionSummary::from_tracks(&tracks, &candidates, threshold);

        Self {
            tracks,
            candidates,
            summary,
        }
    }

    /// Tracks of one target
    pub fn tracks_for(&self, tic: u64) -> Vec<&FlarePredictionTrack> {
        self.tracks.iter().filter(|t| t.tic == tic).collect()
    }

    /// Flare candidates as CSV
    pub fn candidates_to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for candidate in &self.candidates {
            writer.serialize(candidate)?;
        }
        into_string(writer)
    }

    /// Every cadence of every track as CSV
    pub fn tracks_to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for track in &self.tracks {
            for i in 0..track.time.len() {
                writer.serialize(CadenceRow {
                    tic: track.tic,
                    sector: track.sector,
                    time: track.time[i],
                    flux: track.flux[i],
                    flux_err: track.flux_err.get(i).copied().unwrap_or(f32::NAN),
                    probability: track.probability[i],
                })?;
            }
        }
        into_string(writer)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize predictions")
    }

    /// Write `candidates.csv`, `cadences.csv` and `predictions.json` into `dir`
    pub fn write_to_dir(&self, dir: &Path) -> Result<()> {
        crate::utils::ensure_dir(dir)?;
        let outputs = [
            ("candidates.csv", self.candidates_to_csv()?),
            ("cadences.csv", self.tracks_to_csv()?),
            ("predictions.json", self.to_json()?),
        ];
        for (name, content) in outputs {
            let path = dir.join(name);
            std::fs::write(&path, content).with_context(|| format!("Failed to write {:?}", path))?;
        }
        Ok(())
    }
}

fn into_string(writer: csv::Writer<Vec<u8>>) -> Result<String> {
    let bytes = writer.into_inner().context("Failed to flush CSV writer")?;
    String::from_utf8(bytes).context("CSV output is not UTF-8")
}

/// Prediction summary statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PredictionSummary {
    pub light_curves: usize,
    pub targets: usize,
    pub total_cadences: usize,
    pub scored_cadences: usize,
    pub threshold: f32,
    pub flare_candidates: usize,
    pub targets_with_flares: usize,
    pub max_probability: Option<f32>,
}

impl PredictionSummary {
    pub fn from_tracks(
        tracks: &[FlarePredictionTrack],
        candidates: &[FlareCandidate],
        threshold: f32,
    ) -> Self {
        let targets: HashSet<u64> = tracks.iter().map(|t| t.tic).collect();
        let flaring: HashSet<u64> = candidates.iter().map(|c| c.tic).collect();
        let max_probability = tracks
            .iter()
            .filter_map(|t| t.max_probability())
            .fold(None, |acc: Option<f32>, p| Some(acc.map_or(p, |a| a.max(p))));

        Self {
            light_curves: tracks.len(),
            targets: targets.len(),
            total_cadences: tracks.iter().map(|t| t.time.len()).sum(),
            scored_cadences: tracks.iter().map(|t| t.scored_cadences()).sum(),
            threshold,
            flare_candidates: candidates.len(),
            targets_with_flares: flaring.len(),
            max_probability,
        }
    }

    /// Print summary to stdout
    pub fn print(&self) {
        println!("\n=== Prediction Summary ===");
        println!("Light curves: {} ({} targets)", self.light_curves, self.targets);
        println!(
            "Scored cadences: {} of {}",
            self.scored_cadences, self.total_cadences
        );
        println!(
            "Flare candidates (p >= {:.2}): {}",
            self.threshold, self.flare_candidates
        );
        println!("Targets with flares: {}", self.targets_with_flares);
        if let Some(p) = self.max_probability {
            println!("Highest probability: {:.4}", p);
        }
        println!("==========================\n");
    }
}
