use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::counterfactual::ReversionModel;
use crate::engine::{
    SimulationSettings, DEFAULT_MAX_SIMULATIONS, DEFAULT_N_SIMULATIONS, DEFAULT_SEED,
};
use crate::reference::{ReferenceTables, SequestrationRate};

pub const PROGRAM_NAME: &str = "ScenarioIntelligence";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Root {
    pub engine: Engine,
    #[serde(default)]
    pub simulation: Simulation,
    #[serde(default)]
    pub cache: Option<Cache>,
    #[serde(default)]
    pub sites: Option<Sites>,
    /// Extra or replacement price scenarios (USD/tCO2e)
    #[serde(default)]
    pub carbon_prices: BTreeMap<String, f64>,
    #[serde(default)]
    pub default_price_scenario: Option<String>,
    /// Site- or habitat-keyed sequestration overrides
    #[serde(default)]
    pub sequestration: BTreeMap<String, Sequestration>,
    /// Site id → reversion model name
    #[serde(default)]
    pub counterfactual_models: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Engine {
    pub program: String,
    pub module: String,
    pub version: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Simulation {
    #[serde(default = "default_n_simulations")]
    pub n_simulations: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_max_simulations")]
    pub max_simulations: usize,
}

fn default_n_simulations() -> usize { DEFAULT_N_SIMULATIONS }
fn default_seed() -> u64 { DEFAULT_SEED }
fn default_max_simulations() -> usize { DEFAULT_MAX_SIMULATIONS }

impl Default for Simulation {
    fn default() -> Self {
        Self {
            n_simulations: DEFAULT_N_SIMULATIONS,
            seed: DEFAULT_SEED,
            max_simulations: DEFAULT_MAX_SIMULATIONS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Cache {
    /// Maximum cached responses
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Entry lifetime in seconds; unbounded when absent
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

fn default_cache_capacity() -> usize { 256 }

impl Cache {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Sites {
    /// Site registry path, relative to the configuration file
    pub registry: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Sequestration {
    /// tCO2e/ha/yr
    pub low: f64,
    pub high: f64,
}

impl Root {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: Root = toml::from_str(text).context("failed to parse configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reads and validates `path`, returning the document text alongside it.
    pub fn load(path: &Path) -> Result<(Self, String)> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let cfg = Self::from_toml_str(&text)?;
        Ok((cfg, text))
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.program != PROGRAM_NAME {
            bail!("engine.program must be {}", PROGRAM_NAME);
        }
        if self.simulation.n_simulations == 0 {
            bail!("simulation.n_simulations must be >= 1");
        }
        if self.simulation.max_simulations == 0 || self.simulation.max_simulations > 1_000_000 {
            bail!("simulation.max_simulations must be in [1, 1000000]");
        }

        if let Some(ref cache) = self.cache {
            if cache.capacity == 0 {
                bail!("cache.capacity must be >= 1");
            }
        }

        for (name, price) in &self.carbon_prices {
            if !price.is_finite() || *price < 0.0 {
                bail!("carbon_prices.{} must be a non-negative number", name);
            }
        }
        if let Some(ref name) = self.default_price_scenario {
            let builtin = ReferenceTables::builtin();
            if !self.carbon_prices.contains_key(name) && !builtin.carbon_prices.contains_key(name) {
                bail!("default_price_scenario '{}' is not a known price scenario", name);
            }
        }

        for (key, s) in &self.sequestration {
            if !(0.0 <= s.low && s.low <= s.high) {
                bail!("sequestration.{} must satisfy 0 <= low <= high", key);
            }
        }

        for (site, model) in &self.counterfactual_models {
            if model.parse::<ReversionModel>().is_err() {
                bail!(
                    "counterfactual_models.{} must be one of biomass_reversion, \
                     habitat_extent_collapse, full_habitat_loss, generic_fallback",
                    site
                );
            }
        }

        Ok(())
    }

    pub fn settings(&self) -> SimulationSettings {
        SimulationSettings {
            n_simulations: self.simulation.n_simulations,
            seed: self.simulation.seed,
            max_simulations: self.simulation.max_simulations,
        }
    }

    /// Layers configuration overrides onto `tables`.
    pub fn apply_to(&self, tables: &mut ReferenceTables) -> Result<()> {
        for (name, price) in &self.carbon_prices {
            tables.carbon_prices.insert(name.clone(), *price);
        }
        if let Some(ref name) = self.default_price_scenario {
            tables.default_price_scenario = name.clone();
        }
        for (key, s) in &self.sequestration {
            tables
                .sequestration
                .insert(key.clone(), SequestrationRate { low: s.low, high: s.high });
        }
        for (site, model) in &self.counterfactual_models {
            let model: ReversionModel = model
                .parse()
                .map_err(|e| anyhow::anyhow!("counterfactual_models.{}: {}", site, e))?;
            tables.counterfactual_models.insert(site.clone(), model);
        }
        tables.validate()
    }

    /// Builtin tables with this configuration applied.
    pub fn tables(&self) -> Result<ReferenceTables> {
        let mut tables = ReferenceTables::builtin();
        self.apply_to(&mut tables)?;
        Ok(tables)
    }

    pub fn registry_path(&self, config_path: &Path) -> Option<PathBuf> {
        let sites = self.sites.as_ref()?;
        let base = config_path.parent().unwrap_or_else(|| Path::new("."));
        Some(base.join(&sites.registry))
    }
}
