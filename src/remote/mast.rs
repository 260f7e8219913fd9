//! TESS light-curve search and retrieval through the MAST portal API.

use crate::data::fits;
use crate::data::LightCurve;
use crate::remote::Downloader;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub const DEFAULT_MAST_URL: &str = "https://mast.stsci.edu/api/v0";

/// Light-curve search parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LightCurveQuery {
    /// TESS Input Catalog identifier
    pub tic: u64,
    /// Mission, `TESS`
    pub mission: String,
    /// Observing sector; all sectors when unset
    pub sector: Option<u32>,
    /// Pipeline author, `SPOC` for two-minute cadence products
    pub author: String,
}

impl LightCurveQuery {
    pub fn new(tic: u64) -> Self {
        Self {
            tic,
            mission: "TESS".to_string(),
            sector: None,
            author: "SPOC".to_string(),
        }
    }

    pub fn with_sector(mut self, sector: u32) -> Self {
        self.sector = Some(sector);
        self
    }

    pub fn with_author(mut self, author: &str) -> Self {
        self.author = author.to_string();
        self
    }

    fn filters(&self) -> Value {
        let mut filters = vec![
            json!({"paramName": "obs_collection", "values": [self.mission]}),
            json!({"paramName": "dataproduct_type", "values": ["timeseries"]}),
            json!({"paramName": "target_name", "values": [self.tic.to_string()]}),
            json!({"paramName": "provenance_name", "values": [self.author]}),
        ];
        if let Some(sector) = self.sector {
            filters.push(json!({"paramName": "sequence_number", "values": [sector]}));
        }
        Value::Array(filters)
    }
}

/// Downloadable light-curve product
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LightCurveProduct {
    pub tic: u64,
    pub sector: Option<u32>,
    /// MAST data URI, `mast:TESS/product/<file>`
    pub data_uri: String,
    pub filename: String,
}

/// Blocking client for the MAST `invoke` endpoint
pub struct MastClient<'a> {
    downloader: &'a Downloader,
    base_url: String,
}

impl<'a> MastClient<'a> {
    pub fn new(downloader: &'a Downloader, base_url: &str) -> Self {
        Self {
            downloader,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn invoke(&self, service: &str, params: Value) -> Result<Vec<Value>> {
        let request = json!({
            "service": service,
            "format": "json",
            "pagesize": 2000,
            "page": 1,
            "params": params,
        });
        debug!("MAST request: {}", request);

        let response: Value = self
            .downloader
            .client()
            .post(format!("{}/invoke", self.base_url))
            .form(&[("request", request.to_string())])
            .send()
            .with_context(|| format!("MAST {} request failed", service))?
            .error_for_status()
            .with_context(|| format!("MAST rejected {} request", service))?
            .json()
            .with_context(|| format!("MAST {} response is not JSON", service))?;

        match response.get("status").and_then(Value::as_str) {
            Some("COMPLETE") | None => {}
            Some(status) => bail!("MAST {} request ended with status {}", service, status),
        }

        Ok(response
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    /// Search for light-curve products matching `query`
    pub fn search(&self, query: &LightCurveQuery) -> Result<Vec<LightCurveProduct>> {
        info!("Searching MAST for TIC {} ({:?})", query.tic, query.sector);

        let observations = self.invoke(
            "Mast.Caom.Filtered",
            json!({"columns": "*", "filters": query.filters()}),
        )?;
        let obsids: Vec<String> = observations
            .iter()
            .filter_map(|obs| obs.get("obsid").map(value_to_string))
            .collect();
        if obsids.is_empty() {
            warn!("No {} observations of TIC {}", query.author, query.tic);
            return Ok(Vec::new());
        }

        let sectors: Vec<(String, Option<u32>)> = observations
            .iter()
            .filter_map(|obs| {
                let id = obs.get("obsid").map(value_to_string)?;
                let sector = obs.get("sequence_number").and_then(Value::as_u64).map(|s| s as u32);
                Some((id, sector))
            })
            .collect();

        let rows = self.invoke("Mast.Caom.Products", json!({"obsid": obsids.join(",")}))?;
        let mut products: Vec<LightCurveProduct> = rows
            .iter()
            .filter(|row| row.get("productSubGroupDescription").and_then(Value::as_str) == Some("LC"))
            .filter_map(|row| {
                let data_uri = row.get("dataURI")?.as_str()?.to_string();
                let filename = row.get("productFilename")?.as_str()?.to_string();
                let obsid = row
                    .get("obsID")
                    .or_else(|| row.get("parent_obsid"))
                    .map(value_to_string);
                let sector = obsid
                    .and_then(|id| sectors.iter().find(|(o, _)| *o == id))
                    .and_then(|(_, s)| *s);
                Some(LightCurveProduct {
                    tic: query.tic,
                    sector,
                    data_uri,
                    filename,
                })
            })
            .collect();

        products.sort_by_key(|p| p.sector);
        products.dedup_by(|a, b| a.data_uri == b.data_uri);
        info!("Found {} light curves for TIC {}", products.len(), query.tic);
        Ok(products)
    }

    /// Download and parse one product
    pub fn download(&self, product: &LightCurveProduct) -> Result<LightCurve> {
        let url = format!("{}/Download/file?uri={}", download_base(&self.base_url), product.data_uri);
        let relative = PathBuf::from("mast").join(&product.filename);
        let path = self.downloader.fetch_as(&url, &relative)?;
        fits::read_light_curve(&path)
    }

    /// Search and download every matching light curve
    pub fn fetch_light_curves(&self, query: &LightCurveQuery) -> Result<Vec<LightCurve>> {
        self.search(query)?
            .iter()
            .map(|product| self.download(product))
            .collect()
    }
}

/// File downloads are served by the v0.1 API
fn download_base(base_url: &str) -> String {
    match base_url.strip_suffix("/v0") {
        Some(root) => format!("{}/v0.1", root),
        None => base_url.to_string(),
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteConfig;

    #[test]
    fn test_query_filters() {
        let query = LightCurveQuery::new(261136679).with_sector(1);
        let filters = query.filters();
        let filters = filters.as_array().unwrap();

        assert_eq!(filters.len(), 5);
        assert_eq!(filters[2]["values"][0], "261136679");
        assert_eq!(filters[3]["values"][0], "SPOC");
        assert_eq!(filters[4]["values"][0], 1);
    }

    #[test]
    fn test_download_base() {
        assert_eq!(download_base(DEFAULT_MAST_URL), "https://mast.stsci.edu/api/v0.1");
        assert_eq!(download_base("http://localhost:9000"), "http://localhost:9000");
    }

    #[test]
    fn test_value_to_string() {
        assert_eq!(value_to_string(&json!("abc")), "abc");
        assert_eq!(value_to_string(&json!(12345)), "12345");
    }

    #[test]
    #[ignore = "requires network access to MAST"]
    fn test_fetch_from_mast() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = RemoteConfig {
            cache_dir: tmp.path().to_path_buf(),
            ..RemoteConfig::default()
        };
        let downloader = Downloader::new(&config).unwrap();
        let client = MastClient::new(&downloader, &config.mast_url);

        let curves = client
            .fetch_light_curves(&LightCurveQuery::new(62124646).with_sector(13))
            .unwrap();
        assert!(!curves.is_empty());
        assert_eq!(curves[0].tic, 62124646);
    }
}
