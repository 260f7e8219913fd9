//! Cached downloads from remote archives.

pub mod mast;

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Prepackaged training set: catalog plus light curves
pub const DEFAULT_DATASET_URL: &str =
    "https://archive.stsci.edu/hlsps/stella/training/hlsp_stella_tess_training-set.tar.gz";

/// Published pretrained flare model (Keras HDF5)
///
/// It is not a flarecnn checkpoint. [`Downloader::fetch_model`] refuses it
/// until it is converted and the config points at the converted file.
pub const DEFAULT_PRETRAINED_MODEL_URL: &str =
    "https://archive.stsci.edu/hlsps/stella/hlsp_stella_tess_ensemblemodel_s004_tess_v0.1.0_cnn.h5";

/// Remote endpoints and cache location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Gzip tarball with the labelled training set
    pub dataset_url: String,
    /// Pretrained model weights
    pub pretrained_model_url: String,
    /// MAST API base URL
    pub mast_url: String,
    /// Directory for cached downloads
    pub cache_dir: PathBuf,
    /// Connect timeout in seconds (0 = none)
    pub connect_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            dataset_url: DEFAULT_DATASET_URL.to_string(),
            pretrained_model_url: DEFAULT_PRETRAINED_MODEL_URL.to_string(),
            mast_url: mast::DEFAULT_MAST_URL.to_string(),
            cache_dir: PathBuf::from(".flarecnn-cache"),
            connect_timeout_secs: 30,
        }
    }
}

/// Blocking HTTP downloader with an on-disk cache
///
/// A cached file is returned without touching the network.
pub struct Downloader {
    client: reqwest::blocking::Client,
    cache_dir: PathBuf,
    show_progress: bool,
}

impl Downloader {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let mut builder = reqwest::blocking::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            // Large tarballs; only the connect phase is bounded
            .timeout(None);
        if config.connect_timeout_secs > 0 {
            builder = builder.connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        }

        Ok(Self {
            client: builder.build().context("Failed to build HTTP client")?,
            cache_dir: config.cache_dir.clone(),
            show_progress: true,
        })
    }

    /// Disable the progress bar
    pub fn quiet(mut self) -> Self {
        self.show_progress = false;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub(crate) fn client(&self) -> &reqwest::blocking::Client {
        &self.client
    }

    /// Fetch `url` into the cache at `<host>/<path>`
    pub fn fetch(&self, url: &str) -> Result<PathBuf> {
        let relative = cache_path_for(url)?;
        self.fetch_as(url, &relative)
    }

    /// Fetch `url` into the cache under an explicit relative path
    pub fn fetch_as(&self, url: &str, relative: &Path) -> Result<PathBuf> {
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("Cache path {:?} must be relative and stay inside the cache", relative);
        }

        let target = self.cache_dir.join(relative);
        if target.is_file() {
            debug!("Using cached {:?} for {}", target, url);
            return Ok(target);
        }

        if let Some(parent) = target.parent() {
            crate::utils::ensure_dir(parent)?;
        }

        info!("Downloading {}", url);
        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("Request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Server rejected request for {}", url))?;

        let partial = target.with_extension(match target.extension() {
            Some(ext) => format!("{}.part", ext.to_string_lossy()),
            None => "part".to_string(),
        });
        let mut file = File::create(&partial)
            .with_context(|| format!("Failed to create {:?}", partial))?;

        let progress = self.progress_bar(response.content_length());
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = response
                .read(&mut buf)
                .with_context(|| format!("Failed while reading {}", url))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .with_context(|| format!("Failed to write {:?}", partial))?;
            progress.inc(n as u64);
        }
        file.flush()?;
        progress.finish_and_clear();

        fs::rename(&partial, &target)
            .with_context(|| format!("Failed to move {:?} into place", partial))?;
        info!("Saved {} to {:?}", url, target);
        Ok(target)
    }

    /// Fetch a gzip tarball and unpack it under `dest`
    pub fn fetch_and_extract(&self, url: &str, dest: &Path) -> Result<PathBuf> {
        let archive = self.fetch(url)?;
        extract_tarball(&archive, dest)?;
        Ok(dest.to_path_buf())
    }

    /// Fetch saved model weights together with their `.json` metadata
    pub fn fetch_model(&self, url: &str) -> Result<PathBuf> {
        crate::model::checkpoint::check_checkpoint_format(url)?;
        let weights = self.fetch(url)?;
        let sidecar_url = sidecar_url(url)?;
        let sidecar = self.fetch(&sidecar_url)?;
        if sidecar != weights.with_extension("json") {
            bail!("Metadata for {} was not cached next to its weights", url);
        }
        Ok(weights)
    }

    fn progress_bar(&self, len: Option<u64>) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        match len {
            Some(len) => {
                let bar = ProgressBar::new(len);
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar
            }
            None => ProgressBar::new_spinner(),
        }
    }
}

/// Cache path `<host>/<segments...>` for a URL
pub fn cache_path_for(url: &str) -> Result<PathBuf> {
    let parsed = reqwest::Url::parse(url).with_context(|| format!("Invalid URL {}", url))?;
    let host = parsed
        .host_str()
        .with_context(|| format!("URL {} has no host", url))?;

    let mut path = PathBuf::from(host);
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    if segments.is_empty() {
        bail!("URL {} has no file name", url);
    }
    for seg in segments {
        if seg == "." || seg == ".." {
            bail!("URL {} has a relative path segment", url);
        }
        path.push(seg);
    }
    Ok(path)
}

/// URL of the `.json` file next to a model URL
fn sidecar_url(url: &str) -> Result<String> {
    let mut parsed = reqwest::Url::parse(url).with_context(|| format!("Invalid URL {}", url))?;
    let path = Path::new(parsed.path()).with_extension("json");
    let path = path
        .to_str()
        .with_context(|| format!("URL {} has a non UTF-8 path", url))?
        .to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

/// Unpack a `.tar.gz` archive into `dest`
pub fn extract_tarball(archive: &Path, dest: &Path) -> Result<()> {
    info!("Extracting {:?} into {:?}", archive, dest);
    crate::utils::ensure_dir(dest)?;

    let file = File::open(archive).with_context(|| format!("Failed to open {:?}", archive))?;
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    tar.unpack(dest)
        .with_context(|| format!("Failed to extract {:?}", archive))?;
    Ok(())
}

/// Find the catalog text file inside an extracted dataset
///
/// Directories are searched breadth first in name order, so the same tree
/// always yields the same catalog.
pub fn find_catalog(root: &Path) -> Result<PathBuf> {
    let mut queue = std::collections::VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = queue.pop_front() {
        let mut entries = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read {:?}", dir))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort();

        for path in entries {
            if path.is_dir() {
                queue.push_back(path);
                continue;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("")
                .to_lowercase();
            if name.contains("catalog") && name.ends_with(".txt") {
                return Ok(path);
            }
        }
    }
    bail!("No catalog .txt file found under {:?}", root)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    /// Write a `.tar.gz` with the given (path, contents) entries
    pub(crate) fn write_tarball(path: &Path, entries: &[(String, String)]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_cache_path_for() {
        let path = cache_path_for("https://example.org/data/models/cnn.mpk").unwrap();
        assert_eq!(path, PathBuf::from("example.org/data/models/cnn.mpk"));

        let sidecar = cache_path_for("https://example.org/data/models/cnn.json").unwrap();
        assert_eq!(sidecar.parent(), path.parent());

        assert!(cache_path_for("https://example.org/").is_err());
        assert!(cache_path_for("not a url").is_err());
    }

    #[test]
    fn test_sidecar_url() {
        assert_eq!(
            sidecar_url("https://example.org/models/cnn_v1.mpk").unwrap(),
            "https://example.org/models/cnn_v1.json"
        );
    }

    #[test]
    fn test_fetch_model_from_cache() {
        let tmp = TempDir::new().unwrap();
        let config = RemoteConfig {
            cache_dir: tmp.path().to_path_buf(),
            ..RemoteConfig::default()
        };
        let downloader = Downloader::new(&config).unwrap().quiet();

        let dir = tmp.path().join("unreachable.invalid/models");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cnn.mpk"), b"weights").unwrap();
        fs::write(dir.join("cnn.json"), b"{}").unwrap();

        let weights = downloader
            .fetch_model("http://unreachable.invalid/models/cnn.mpk")
            .unwrap();
        assert_eq!(weights, dir.join("cnn.mpk"));
    }

    #[test]
    fn test_default_pretrained_model_needs_conversion() {
        let tmp = TempDir::new().unwrap();
        let config = RemoteConfig {
            cache_dir: tmp.path().to_path_buf(),
            ..RemoteConfig::default()
        };
        let downloader = Downloader::new(&config).unwrap().quiet();

        let err = downloader
            .fetch_model(&config.pretrained_model_url)
            .unwrap_err()
            .to_string();
        assert!(err.contains("must be converted"));
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_find_catalog_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("a_lightcurves");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("old_catalog.txt"), "TIC tpeak\n").unwrap();
        for name in ["z_flare_catalog.txt", "b_flare_catalog.txt", "notes.txt"] {
            fs::write(tmp.path().join(name), "TIC tpeak\n").unwrap();
        }

        for _ in 0..3 {
            assert_eq!(find_catalog(tmp.path()).unwrap(), tmp.path().join("b_flare_catalog.txt"));
        }
        assert!(find_catalog(&nested).is_ok());
        fs::remove_file(nested.join("old_catalog.txt")).unwrap();
        assert!(find_catalog(&nested).is_err());
    }

    #[test]
    fn test_cached_file_skips_network() {
        let tmp = TempDir::new().unwrap();
        let config = RemoteConfig {
            cache_dir: tmp.path().to_path_buf(),
            ..RemoteConfig::default()
        };
        let downloader = Downloader::new(&config).unwrap().quiet();

        // Unroutable host: only the cache can satisfy this
        let url = "http://unreachable.invalid/files/data.bin";
        let cached = tmp.path().join("unreachable.invalid/files/data.bin");
        fs::create_dir_all(cached.parent().unwrap()).unwrap();
        fs::write(&cached, b"cached").unwrap();

        assert_eq!(downloader.fetch(url).unwrap(), cached);
    }

    #[test]
    fn test_fetch_as_rejects_escape() {
        let tmp = TempDir::new().unwrap();
        let config = RemoteConfig {
            cache_dir: tmp.path().to_path_buf(),
            ..RemoteConfig::default()
        };
        let downloader = Downloader::new(&config).unwrap().quiet();
        assert!(downloader
            .fetch_as("http://unreachable.invalid/x", Path::new("../x"))
            .is_err());
    }

    #[test]
    fn test_extract_and_find_catalog() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("set.tar.gz");
        write_tarball(
            &archive,
            &[
                ("training/catalog_flares.txt".to_string(), "TIC tpeak\n1 2.0\n".to_string()),
                ("training/lc/1_sector01.csv".to_string(), "time,flux,flux_err\n".to_string()),
            ],
        );

        let dest = tmp.path().join("out");
        extract_tarball(&archive, &dest).unwrap();

        assert!(dest.join("training/lc/1_sector01.csv").is_file());
        let catalog = find_catalog(&dest).unwrap();
        assert!(catalog.ends_with("training/catalog_flares.txt"));
    }

    #[test]
    #[ignore = "requires network access to the dataset archive"]
    fn test_download_dataset() {
        let tmp = TempDir::new().unwrap();
        let config = RemoteConfig {
            cache_dir: tmp.path().join("cache"),
            ..RemoteConfig::default()
        };
        let downloader = Downloader::new(&config).unwrap();
        let root = downloader
            .fetch_and_extract(&config.dataset_url, &tmp.path().join("data"))
            .unwrap();
        assert!(find_catalog(&root).is_ok());

        let dataset = crate::data::preprocessing::load_dataset(&root, &Default::default()).unwrap();
        for split in [&dataset.train, &dataset.val, &dataset.test] {
            assert!(!split.is_empty());
            assert_eq!(split.data.shape()[0], split.labels.len());
        }
    }
}
