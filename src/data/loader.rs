use crate::data::catalog::parse_tic;
use crate::data::LightCurve;
use anyhow::{Context, Result};
use csv::ReaderBuilder;
use flate2::read::GzDecoder;
use ndarray::{Array2, Axis};
use ndarray_npy::ReadNpyExt;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Supported light-curve file formats
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileFormat {
    Csv,
    Tsv,
    GzippedCsv,
    GzippedTsv,
    Fits,
    /// NumPy array with `time`, `flux` and `flux_err` rows
    Npy,
}

impl FileFormat {
    /// Detect file format from path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str());
        let stem = path.file_stem().and_then(|s| s.to_str());

        match (ext, stem) {
            (Some("gz"), Some(stem)) => {
                if stem.ends_with(".csv") {
                    Ok(FileFormat::GzippedCsv)
                } else if stem.ends_with(".tsv") || stem.ends_with(".txt") {
                    Ok(FileFormat::GzippedTsv)
                } else {
                    Err(anyhow::anyhow!("Cannot determine format of gzipped file {:?}", path))
                }
            }
            (Some("csv"), _) => Ok(FileFormat::Csv),
            (Some("tsv"), _) | (Some("txt"), _) => Ok(FileFormat::Tsv),
            (Some("fits"), _) | (Some("fit"), _) => Ok(FileFormat::Fits),
            (Some("npy"), _) => Ok(FileFormat::Npy),
            _ => Err(anyhow::anyhow!("Unsupported file format: {:?}", path)),
        }
    }

    /// Get delimiter character
    pub fn delimiter(&self) -> u8 {
        match self {
            FileFormat::Tsv | FileFormat::GzippedTsv => b'\t',
            _ => b',',
        }
    }

    /// Check if format is gzipped
    pub fn is_gzipped(&self) -> bool {
        matches!(self, FileFormat::GzippedCsv | FileFormat::GzippedTsv)
    }
}

/// Loader for light curves stored in an extracted dataset directory
pub struct LightCurveLoader {
    /// Name of the time column
    time_column: String,
    /// Name of the flux column
    flux_column: String,
    /// Name of the flux error column
    flux_err_column: String,
}

impl LightCurveLoader {
    pub fn new() -> Self {
        Self {
            time_column: "time".to_string(),
            flux_column: "flux".to_string(),
            flux_err_column: "flux_err".to_string(),
        }
    }

    /// Load a single light-curve file
    ///
    /// The TIC id comes from the leading digits of the file name, for
    /// example `12345_sector01.csv`.
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<LightCurve> {
        let path = path.as_ref();
        let format = FileFormat::from_path(path)?;
        debug!("Loading {:?} as {:?}", path, format);

        if format == FileFormat::Fits {
            return crate::data::fits::read_light_curve(path);
        }

        let tic = tic_from_file_name(path)
            .with_context(|| format!("Cannot read a TIC id from file name {:?}", path))?;

        let mut lc = if format == FileFormat::Npy {
            read_npy(path, tic)?
        } else {
            let file = File::open(path)
                .with_context(|| format!("Failed to open light curve {:?}", path))?;
            if format.is_gzipped() {
                self.parse(BufReader::new(GzDecoder::new(file)), format, tic)?
            } else {
                self.parse(BufReader::new(file), format, tic)?
            }
        };

        lc.sector = sector_from_file_name(path);
        Ok(lc)
    }

    /// Load every light-curve file under `dir`
    ///
    /// Files that fail to parse are logged and skipped.
    pub fn load_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<LightCurve>> {
        let dir = dir.as_ref();
        info!("Loading light curves from {:?}", dir);

        let mut files = light_curve_files(dir)?;
        files.sort();

        let mut curves = Vec::with_capacity(files.len());
        for path in files {
            match self.load(&path) {
                Ok(lc) => curves.push(lc),
                Err(e) => warn!("Skipping {:?}: {:#}", path, e),
            }
        }

        info!("Loaded {} light curves", curves.len());
        Ok(curves)
    }

    /// Parse `time,flux,flux_err` rows from a reader
    fn parse<R: Read>(&self, reader: R, format: FileFormat, tic: u64) -> Result<LightCurve> {
        let mut csv_reader = ReaderBuilder::new()
            .delimiter(format.delimiter())
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = csv_reader
            .headers()?
            .iter()
            .map(|s| s.to_lowercase())
            .collect();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .with_context(|| format!("Missing column: {}", name))
        };
        let time_idx = column(&self.time_column)?;
        let flux_idx = column(&self.flux_column)?;
        let err_idx = column(&self.flux_err_column).ok();

        let mut time = Vec::new();
        let mut flux = Vec::new();
        let mut flux_err = Vec::new();

        for result in csv_reader.records() {
            let record = result.context("Failed to parse light-curve record")?;
            // Missing or unparsable values become NaN and are dealt with by the NaN filter
            let value = |idx: usize| {
                record
                    .get(idx)
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(f64::NAN)
            };

            time.push(value(time_idx));
            flux.push(value(flux_idx) as f32);
            flux_err.push(err_idx.map(|i| value(i) as f32).unwrap_or(f32::NAN));
        }

        LightCurve::new(tic, time, flux, flux_err)
    }
}

/// Read a `.npy` light curve
///
/// The array holds `[time, flux, flux_err]` as rows (shape `[3, n]`) or as
/// columns (shape `[n, 3]`), stored as `f8` or `f4`.
fn read_npy(path: &Path, tic: u64) -> Result<LightCurve> {
    let open = || File::open(path).with_context(|| format!("Failed to open light curve {:?}", path));
    let array = match Array2::<f64>::read_npy(BufReader::new(open()?)) {
        Ok(array) => array,
        Err(_) => Array2::<f32>::read_npy(BufReader::new(open()?))
            .with_context(|| format!("Failed to read NumPy array {:?}", path))?
            .mapv(f64::from),
    };
    light_curve_from_rows(array, tic)
}

fn light_curve_from_rows(array: Array2<f64>, tic: u64) -> Result<LightCurve> {
    let rows = match array.dim() {
        (3, _) => array,
        (_, 3) => array.reversed_axes(),
        shape => anyhow::bail!("Expected a [3, n] or [n, 3] array, got shape {:?}", shape),
    };
    let row = |i: usize| rows.index_axis(Axis(0), i);

    let time = row(0).to_vec();
    let flux = row(1).iter().map(|&v| v as f32).collect();
    let flux_err = row(2).iter().map(|&v| v as f32).collect();
    LightCurve::new(tic, time, flux, flux_err)
}

impl Default for LightCurveLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursively collect light-curve files under `dir`
pub fn light_curve_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read directory {:?}", dir))? {
        let path = entry.context("Failed to read directory entry")?.path();
        if path.is_dir() {
            files.extend(light_curve_files(&path)?);
        } else {
            // FITS files carry the TIC id in their header
            let wanted = match FileFormat::from_path(&path) {
                Ok(FileFormat::Fits) => true,
                Ok(_) => tic_from_file_name(&path).is_some(),
                Err(_) => false,
            };
            if wanted {
                files.push(path);
            }
        }
    }
    Ok(files)
}

/// TIC id from the leading digits of a file name
pub fn tic_from_file_name(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let name = name.strip_prefix("TIC").unwrap_or(name);
    let digits: String = name
        .trim_start_matches(['_', '-'])
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    parse_tic(&digits)
}

/// Sector number from a `sectorNN` or `sNNNN` token in the file name
pub fn sector_from_file_name(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?.to_lowercase();
    let start = name.find("sector")? + "sector".len();
    name[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()
}
