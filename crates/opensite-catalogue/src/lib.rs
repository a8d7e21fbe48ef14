//! Catalogue metadata client for opensite.
//!
//! The build engine resolves logical dataset slugs (`railway-lines--england`)
//! to authoritative titles, source URLs, and formats by querying a CKAN-style
//! open-data catalogue. This crate provides the client, the model the graph
//! builder consumes, and the format-priority selection used when a dataset
//! publishes several alternative resources.
//!
//! # Example
//!
//! ```ignore
//! use opensite_catalogue::{Catalogue, CatalogueClient};
//!
//! let client = CatalogueClient::new("https://data.opensite.energy");
//! let model = client.query().expect("catalogue query");
//! for (group, data) in &model {
//!     println!("{group}: {} datasets", data.datasets.len());
//! }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default timeout for catalogue requests.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// User agent for catalogue requests.
pub const USER_AGENT: &str = concat!("opensite/", env!("CARGO_PKG_VERSION"));

/// Format label used by the catalogue for osm-export-tool mapping files.
pub const OSM_YML_FORMAT: &str = "osm-export-tool YML";

/// Format label used by the catalogue for site description files.
pub const SITES_YML_FORMAT: &str = "Open Site Energy YML";

/// Resource formats the engine can consume, highest priority first.
pub const FORMAT_PRIORITY: &[&str] = &[
    "GPKG",
    "WFS",
    "ArcGIS GeoServices REST API",
    "GeoJSON",
    "KML",
    OSM_YML_FORMAT,
    SITES_YML_FORMAT,
];

/// One downloadable representation of a dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogueResource {
    pub format: String,
    pub url: String,
}

/// One dataset (CKAN package) within a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogueDataset {
    pub package_name: String,
    pub title: String,
    pub resources: Vec<CatalogueResource>,
}

/// A dataset group and its members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CatalogueGroup {
    pub group_title: String,
    pub datasets: Vec<CatalogueDataset>,
}

/// The full catalogue model: group name -> group.
pub type CatalogueModel = BTreeMap<String, CatalogueGroup>;

/// The query contract the graph builder depends on.
pub trait Catalogue {
    /// Fetch the full catalogue model.
    fn query(&self) -> Result<CatalogueModel>;

    /// Base URL of the catalogue service.
    fn url(&self) -> &str;
}

/// Choose the single best resource from a list based on format priority.
///
/// Returns the resource whose format has the lowest index in `priority`;
/// among resources of equal priority the first encountered wins, and a list
/// with no recognized format falls back to its first entry.
pub fn choose_priority_resource<'a>(
    resources: &'a [CatalogueResource],
    priority: &[&str],
) -> Option<&'a CatalogueResource> {
    let first = resources.first()?;

    let mut best = first;
    let mut best_index = priority.len();

    for resource in resources {
        if let Some(index) = priority.iter().position(|f| *f == resource.format)
            && index < best_index
        {
            best_index = index;
            best = resource;

            if best_index == 0 {
                return Some(best);
            }
        }
    }

    Some(best)
}

/// HTTP catalogue client.
#[derive(Debug, Clone)]
pub struct CatalogueClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

// Shape of the CKAN `current_package_list_with_resources` response.
#[derive(Debug, Deserialize)]
struct CkanEnvelope {
    success: bool,
    #[serde(default)]
    result: Vec<CkanPackage>,
}

#[derive(Debug, Deserialize)]
struct CkanPackage {
    name: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    groups: Vec<CkanGroup>,
    #[serde(default)]
    resources: Vec<CkanResource>,
}

#[derive(Debug, Deserialize)]
struct CkanGroup {
    name: String,
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct CkanResource {
    #[serde(default)]
    format: String,
    #[serde(default)]
    url: String,
}

impl CatalogueClient {
    /// Create a client for the given catalogue base URL.
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Fetch the raw text of a catalogue-hosted resource (e.g. a site YAML).
    pub fn fetch_text(&self, url: &str) -> Result<String> {
        let resp = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("catalogue resource request failed: {url}"))?;

        if !resp.status().is_success() {
            anyhow::bail!("unexpected status {} fetching {url}", resp.status());
        }

        resp.text().context("failed to read catalogue resource body")
    }
}

impl Catalogue for CatalogueClient {
    fn query(&self) -> Result<CatalogueModel> {
        let url = format!(
            "{}/api/3/action/current_package_list_with_resources?limit=1000",
            self.base_url
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("catalogue query failed: {url}"))?;

        if !resp.status().is_success() {
            anyhow::bail!("unexpected status {} from catalogue query", resp.status());
        }

        let envelope: CkanEnvelope = resp.json().context("failed to parse catalogue JSON")?;
        if !envelope.success {
            anyhow::bail!("catalogue query returned success=false");
        }

        let mut model = CatalogueModel::new();

        for package in envelope.result {
            // Packages without a group land in the 'default' catch-all.
            let (group_name, group_title) = package
                .groups
                .first()
                .map(|g| (g.name.clone(), g.title.clone()))
                .unwrap_or_else(|| ("default".to_string(), String::new()));

            let entry = model.entry(group_name).or_default();
            if entry.group_title.is_empty() {
                entry.group_title = group_title;
            }

            entry.datasets.push(CatalogueDataset {
                package_name: package.name,
                title: package.title,
                resources: package
                    .resources
                    .into_iter()
                    .map(|r| CatalogueResource {
                        format: r.format,
                        url: r.url,
                    })
                    .collect(),
            });
        }

        Ok(model)
    }

    fn url(&self) -> &str {
        &self.base_url
    }
}
