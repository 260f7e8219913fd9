use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info, warn};

/// One flare from the training catalog
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CatalogFlare {
    /// Target the flare was observed on
    pub tic: u64,
    /// Time of peak flux (BTJD)
    pub tpeak: f64,
    /// Flare start (BTJD)
    pub tstart: f64,
    /// Flare end (BTJD)
    pub tend: f64,
}

impl CatalogFlare {
    /// Whether `t` falls inside the flare
    pub fn contains(&self, t: f64) -> bool {
        t >= self.tstart && t <= self.tend
    }
}

/// Flare catalog grouped by target
#[derive(Debug, Clone, Default)]
pub struct FlareCatalog {
    flares: Vec<CatalogFlare>,
}

impl FlareCatalog {
    pub fn new(flares: Vec<CatalogFlare>) -> Self {
        Self { flares }
    }

    /// Load a whitespace-separated catalog file
    ///
    /// The first non-comment line is the header. `TIC` and `tpeak` are
    /// required, `tstart` and `tend` default to `tpeak ± halfwidth_days`.
    pub fn load<P: AsRef<Path>>(path: P, halfwidth_days: f64) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading flare catalog from {:?}", path);

        let file = File::open(path)
            .with_context(|| format!("Failed to open catalog {:?}", path))?;
        Self::parse(BufReader::new(file), halfwidth_days)
    }

    /// Parse catalog text from a reader
    pub fn parse<R: BufRead>(reader: R, halfwidth_days: f64) -> Result<Self> {
        let mut lines = reader
            .lines()
            .enumerate()
            .filter(|(_, line)| match line {
                Ok(l) => !l.trim().is_empty() && !l.trim_start().starts_with('#'),
                Err(_) => true,
            });

        let (_, header) = lines.next().context("Catalog is empty")?;
        let header = header.context("Failed to read catalog header")?;
        let columns: Vec<String> = header
            .split_whitespace()
            .map(|c| c.to_lowercase())
            .collect();

        let column = |name: &str| columns.iter().position(|c| c == name);
        let tic_col = column("tic").context("Catalog is missing the TIC column")?;
        let tpeak_col = column("tpeak").context("Catalog is missing the tpeak column")?;
        let tstart_col = column("tstart");
        let tend_col = column("tend");

        debug!("Catalog columns: {:?}", columns);

        let mut flares = Vec::new();
        for (line_no, line) in lines {
            let line = line.context("Failed to read catalog line")?;
            let fields: Vec<&str> = line.split_whitespace().collect();

            let get_f64 = |idx: Option<usize>| {
                idx.and_then(|i| fields.get(i))
                    .and_then(|s| s.parse::<f64>().ok())
                    .filter(|v| v.is_finite())
            };

            let tic = fields.get(tic_col).and_then(|s| parse_tic(s));
            let tpeak = get_f64(Some(tpeak_col));

            match (tic, tpeak) {
                (Some(tic), Some(tpeak)) => {
                    let tstart = get_f64(tstart_col).unwrap_or(tpeak - halfwidth_days);
                    let tend = get_f64(tend_col).unwrap_or(tpeak + halfwidth_days);
                    flares.push(CatalogFlare { tic, tpeak, tstart, tend });
                }
                _ => warn!("Skipping malformed catalog line {}: {:?}", line_no + 1, line),
            }
        }

        info!("Loaded {} catalog flares", flares.len());
        Ok(Self { flares })
    }

    pub fn len(&self) -> usize {
        self.flares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flares.is_empty()
    }

    pub fn flares(&self) -> &[CatalogFlare] {
        &self.flares
    }

    /// Flares grouped by TIC id
    pub fn by_target(&self) -> HashMap<u64, Vec<CatalogFlare>> {
        let mut map: HashMap<u64, Vec<CatalogFlare>> = HashMap::new();
        for flare in &self.flares {
            map.entry(flare.tic).or_default().push(*flare);
        }
        map
    }
}

/// Parse a TIC id, tolerating a `TIC` prefix and float formatting
pub fn parse_tic(s: &str) -> Option<u64> {
    let s = s.trim();
    let s = s
        .strip_prefix("TIC")
        .or_else(|| s.strip_prefix("tic"))
        .unwrap_or(s)
        .trim_start_matches(['_', ' ', '-']);

    s.parse::<u64>().ok().or_else(|| {
        s.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0 && v.fract() == 0.0)
            .map(|v| v as u64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_with_extent() {
        let text = "# flare catalog\nTIC tpeak tstart tend amp\n\
                    12345 1340.50 1340.48 1340.55 0.02\n\
                    12345 1342.00 1341.99 1342.10 0.05\n\
                    67890 1350.25 1350.20 1350.30 0.01\n";
        let catalog = FlareCatalog::parse(Cursor::new(text), 0.02).unwrap();

        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.flares()[0].tic, 12345);
        assert_eq!(catalog.flares()[1].tend, 1342.10);

        let grouped = catalog.by_target();
        assert_eq!(grouped[&12345].len(), 2);
        assert_eq!(grouped[&67890].len(), 1);
    }

    #[test]
    fn test_parse_default_extent() {
        let text = "TIC tpeak\n1 100.0\n";
        let catalog = FlareCatalog::parse(Cursor::new(text), 0.05).unwrap();
        let flare = catalog.flares()[0];

        assert!((flare.tstart - 99.95).abs() < 1e-9);
        assert!((flare.tend - 100.05).abs() < 1e-9);
        assert!(flare.contains(100.01));
        assert!(!flare.contains(100.2));
    }

    #[test]
    fn test_skips_malformed_lines() {
        let text = "TIC tpeak\n1 100.0\nnot_a_tic 3.0\n2 nan\n3 101.0\n";
        let catalog = FlareCatalog::parse(Cursor::new(text), 0.05).unwrap();
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn test_missing_required_column() {
        let text = "TIC amp\n1 0.1\n";
        assert!(FlareCatalog::parse(Cursor::new(text), 0.05).is_err());
    }

    #[test]
    fn test_parse_tic() {
        assert_eq!(parse_tic("12345"), Some(12345));
        assert_eq!(parse_tic("TIC 12345"), Some(12345));
        assert_eq!(parse_tic("tic_12345"), Some(12345));
        assert_eq!(parse_tic("12345.0"), Some(12345));
        assert_eq!(parse_tic("12345.5"), None);
        assert_eq!(parse_tic("abc"), None);
    }
}
