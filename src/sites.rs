//! Per-site ecosystem-service snapshots and the name/alias registry.
//!
//! The registry is built from an already-read document; resolving a site is
//! a pure in-memory lookup.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::ScenarioError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub service_type: String,
    /// USD per year
    pub annual_value: f64,
    pub valuation_method: String,
    #[serde(default)]
    pub ci_low: Option<f64>,
    #[serde(default)]
    pub ci_high: Option<f64>,
    #[serde(default)]
    pub source_doi: Option<String>,
}

/// Observed environmental variable that climate projections can carry forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentalBaseline {
    pub parameter: String,
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteData {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Primary habitat
    pub habitat: String,
    #[serde(default)]
    pub secondary_habitats: Vec<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub area_ha: Option<f64>,
    /// Mapped extent per habitat
    #[serde(default)]
    pub habitat_areas_ha: BTreeMap<String, f64>,
    /// Current / pre-protection reef fish biomass
    #[serde(default)]
    pub biomass_recovery_ratio: Option<f64>,
    #[serde(default)]
    pub current_extent_ha: Option<f64>,
    #[serde(default)]
    pub historical_min_extent_ha: Option<f64>,
    #[serde(default)]
    pub blue_carbon_habitat: Option<String>,
    #[serde(default)]
    pub environmental_baseline: Option<EnvironmentalBaseline>,
    #[serde(default)]
    pub services: Vec<ServiceSnapshot>,
}

impl SiteData {
    pub fn new(id: &str, habitat: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            aliases: Vec::new(),
            habitat: habitat.to_string(),
            secondary_habitats: Vec::new(),
            country: None,
            area_ha: None,
            habitat_areas_ha: BTreeMap::new(),
            biomass_recovery_ratio: None,
            current_extent_ha: None,
            historical_min_extent_ha: None,
            blue_carbon_habitat: None,
            environmental_baseline: None,
            services: Vec::new(),
        }
    }

    pub fn with_service(
        mut self,
        service_type: &str,
        annual_value: f64,
        valuation_method: &str,
    ) -> Self {
        self.services.push(ServiceSnapshot {
            service_type: service_type.to_string(),
            annual_value,
            valuation_method: valuation_method.to_string(),
            ci_low: None,
            ci_high: None,
            source_doi: None,
        });
        self
    }

    /// Total annual ecosystem-service value (USD/yr)
    pub fn total_esv(&self) -> f64 {
        self.services.iter().map(|s| s.annual_value).sum()
    }

    pub fn all_habitats(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.habitat.as_str())
            .chain(self.secondary_habitats.iter().map(String::as_str))
    }
}

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    #[serde(rename = "site", default)]
    sites: Vec<SiteData>,
}

fn normalize(key: &str) -> String {
    key.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() || c == '-' { '_' } else { c })
        .collect()
}

/// Name/alias lookup over site snapshots.
#[derive(Debug, Clone, Default)]
pub struct SiteRegistry {
    sites: Vec<SiteData>,
    index: HashMap<String, usize>,
}

impl SiteRegistry {
    pub fn from_sites(sites: Vec<SiteData>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, site) in sites.iter().enumerate() {
            if site.id.trim().is_empty() {
                bail!("site #{} has an empty id", i);
            }
            for s in &site.services {
                if !s.annual_value.is_finite() || s.annual_value < 0.0 {
                    bail!(
                        "site {} service {} must have a finite non-negative annual_value",
                        site.id,
                        s.service_type
                    );
                }
            }
            let keys = std::iter::once(&site.id)
                .chain(std::iter::once(&site.name))
                .chain(site.aliases.iter());
            for key in keys {
                if let Some(prev) = index.insert(normalize(key), i) {
                    if prev != i {
                        bail!(
                            "site key '{}' is claimed by both {} and {}",
                            key,
                            sites[prev].id,
                            site.id
                        );
                    }
                }
            }
        }
        Ok(Self { sites, index })
    }

    /// Parses a `[[site]]` TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let doc: RegistryDocument = toml::from_str(text).context("failed to parse site registry")?;
        Self::from_sites(doc.sites)
    }

    pub fn resolve(&self, name: &str) -> Result<&SiteData, ScenarioError> {
        self.index
            .get(&normalize(name))
            .map(|&i| &self.sites[i])
            .ok_or_else(|| ScenarioError::UnknownSite(name.to_string()))
    }

    pub fn sites(&self) -> &[SiteData] {
        &self.sites
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}
