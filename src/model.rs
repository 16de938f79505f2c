//! Request/response contract shared by every engine.
//!
//! A `ScenarioRequest` is built once by the caller, consumed by exactly one
//! engine call and embedded unchanged in the `ScenarioResponse` it produces.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ScenarioError;

pub const DEFAULT_TIME_HORIZON_YEARS: u32 = 10;
/// Longest horizon any engine accepts. Horizon-stepped simulations scale
/// linearly with it.
pub const MAX_TIME_HORIZON_YEARS: u32 = 200;
pub const DEFAULT_COMPARE_AGAINST: &str = "baseline";

/// Metric key carried by every baseline/scenario case.
pub const TOTAL_ESV_KEY: &str = "total_esv_usd";

// ============================================================================
// Enumerations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioType {
    Counterfactual,
    Climate,
    Intervention,
    Shock,
    TippingPoint,
    Market,
    Portfolio,
}

impl ScenarioType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counterfactual => "counterfactual",
            Self::Climate => "climate",
            Self::Intervention => "intervention",
            Self::Shock => "shock",
            Self::TippingPoint => "tipping_point",
            Self::Market => "market",
            Self::Portfolio => "portfolio",
        }
    }
}

impl fmt::Display for ScenarioType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScenarioType {
    type Err = ScenarioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "counterfactual" => Ok(Self::Counterfactual),
            "climate" => Ok(Self::Climate),
            "intervention" => Ok(Self::Intervention),
            "shock" => Ok(Self::Shock),
            "tipping_point" => Ok(Self::TippingPoint),
            "market" => Ok(Self::Market),
            "portfolio" => Ok(Self::Portfolio),
            other => Err(ScenarioError::invalid(format!(
                "unsupported scenario type '{}'",
                other
            ))),
        }
    }
}

/// Shared Socioeconomic Pathway, ordered from mildest to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Ssp {
    #[serde(rename = "SSP1-2.6")]
    Ssp126,
    #[serde(rename = "SSP2-4.5")]
    Ssp245,
    #[serde(rename = "SSP5-8.5")]
    Ssp585,
}

impl Ssp {
    pub const ALL: [Ssp; 3] = [Ssp::Ssp126, Ssp::Ssp245, Ssp::Ssp585];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Ssp126 => "SSP1-2.6",
            Self::Ssp245 => "SSP2-4.5",
            Self::Ssp585 => "SSP5-8.5",
        }
    }
}

impl fmt::Display for Ssp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Ssp {
    type Err = ScenarioError;

    /// Accepts the canonical labels plus the compact `ssp245` spelling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match norm.as_str() {
            "ssp126" => Ok(Self::Ssp126),
            "ssp245" => Ok(Self::Ssp245),
            "ssp585" => Ok(Self::Ssp585),
            _ => Err(ScenarioError::invalid(format!(
                "malformed SSP label '{}' (expected SSP1-2.6, SSP2-4.5 or SSP5-8.5)",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioValidity {
    InDomain,
    PartiallyOutOfDomain,
    OutOfDomain,
}

// ============================================================================
// Request
// ============================================================================

fn default_horizon() -> u32 {
    DEFAULT_TIME_HORIZON_YEARS
}

fn default_compare_against() -> String {
    DEFAULT_COMPARE_AGAINST.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRequest {
    pub scenario_type: ScenarioType,
    /// Ordered site identifiers (names or aliases)
    #[serde(default)]
    pub site_scope: Vec<String>,
    #[serde(default = "default_horizon")]
    pub time_horizon_years: u32,
    /// Open assumption map; ordered so the serialized form is normalized
    #[serde(default)]
    pub assumptions: BTreeMap<String, Value>,
    #[serde(default = "default_compare_against")]
    pub compare_against: String,
    /// Raw SSP label, parsed during validation
    #[serde(default)]
    pub ssp_scenario: Option<String>,
    #[serde(default)]
    pub target_year: Option<i32>,
}

impl ScenarioRequest {
    pub fn new(scenario_type: ScenarioType, sites: &[&str]) -> Self {
        Self {
            scenario_type,
            site_scope: sites.iter().map(|s| s.to_string()).collect(),
            time_horizon_years: DEFAULT_TIME_HORIZON_YEARS,
            assumptions: BTreeMap::new(),
            compare_against: default_compare_against(),
            ssp_scenario: None,
            target_year: None,
        }
    }

    pub fn climate(site: &str, ssp: &str, target_year: i32) -> Self {
        let mut req = Self::new(ScenarioType::Climate, &[site]);
        req.ssp_scenario = Some(ssp.to_string());
        req.target_year = Some(target_year);
        req
    }

    pub fn with_horizon(mut self, years: u32) -> Self {
        self.time_horizon_years = years;
        self
    }

    pub fn with_assumption(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.assumptions.insert(key.to_string(), value.into());
        self
    }

    /// Numeric assumption; numeric strings are accepted.
    pub fn assumption_f64(&self, key: &str) -> Option<f64> {
        match self.assumptions.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn assumption_str(&self, key: &str) -> Option<&str> {
        self.assumptions.get(key).and_then(Value::as_str)
    }

    /// Parsed SSP, `Ok(None)` when absent.
    pub fn ssp(&self) -> Result<Option<Ssp>, ScenarioError> {
        self.ssp_scenario.as_deref().map(Ssp::from_str).transpose()
    }

    pub fn primary_site(&self) -> Result<&str, ScenarioError> {
        self.site_scope
            .first()
            .map(String::as_str)
            .ok_or_else(|| ScenarioError::invalid("site_scope is empty"))
    }

    /// Structural checks performed before any computation.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.time_horizon_years == 0 {
            return Err(ScenarioError::invalid("time_horizon_years must be positive"));
        }
        if self.time_horizon_years > MAX_TIME_HORIZON_YEARS {
            return Err(ScenarioError::invalid(format!(
                "time_horizon_years {} exceeds the maximum of {}",
                self.time_horizon_years, MAX_TIME_HORIZON_YEARS
            )));
        }
        if self.site_scope.is_empty() {
            return Err(ScenarioError::invalid("site_scope is empty"));
        }
        let ssp = self.ssp()?;
        if self.scenario_type == ScenarioType::Climate {
            if ssp.is_none() {
                return Err(ScenarioError::invalid("climate scenario requires ssp_scenario"));
            }
            if self.target_year.is_none() {
                return Err(ScenarioError::invalid("climate scenario requires target_year"));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioDelta {
    pub metric: String,
    pub baseline_value: f64,
    pub scenario_value: f64,
    pub absolute_change: f64,
    pub percent_change: f64,
    pub unit: String,
}

impl ScenarioDelta {
    pub fn new(metric: &str, baseline_value: f64, scenario_value: f64, unit: &str) -> Self {
        let absolute_change = scenario_value - baseline_value;
        let percent_change = if baseline_value != 0.0 {
            absolute_change / baseline_value.abs() * 100.0
        } else {
            0.0
        };
        Self {
            metric: metric.to_string(),
            baseline_value,
            scenario_value,
            absolute_change,
            percent_change,
            unit: unit.to_string(),
        }
    }

    pub fn usd(metric: &str, baseline_value: f64, scenario_value: f64) -> Self {
        Self::new(metric, baseline_value, scenario_value, "USD/yr")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationStep {
    pub axiom_id: String,
    pub description: String,
    pub input_parameter: String,
    pub input_value: f64,
    pub output_parameter: String,
    pub output_value: f64,
    pub coefficient: Option<f64>,
    pub source_doi: Option<String>,
}

impl PropagationStep {
    pub fn new(
        axiom_id: impl Into<String>,
        description: impl Into<String>,
        input: (&str, f64),
        output: (&str, f64),
    ) -> Self {
        Self {
            axiom_id: axiom_id.into(),
            description: description.into(),
            input_parameter: input.0.to_string(),
            input_value: input.1,
            output_parameter: output.0.to_string(),
            output_value: output.1,
            coefficient: None,
            source_doi: None,
        }
    }

    /// Step whose output is `input × coefficient`.
    pub fn scaled(
        axiom_id: impl Into<String>,
        description: impl Into<String>,
        input: (&str, f64),
        output_parameter: &str,
        coefficient: f64,
    ) -> Self {
        let mut step = Self::new(
            axiom_id,
            description,
            input,
            (output_parameter, input.1 * coefficient),
        );
        step.coefficient = Some(coefficient);
        step
    }

    pub fn with_doi(mut self, doi: Option<&str>) -> Self {
        self.source_doi = doi.map(str::to_string);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioUncertainty {
    pub p5: f64,
    pub p50: f64,
    pub p95: f64,
    pub dominant_driver: String,
    pub n_simulations: usize,
}

impl ScenarioUncertainty {
    /// Point estimate with no spread.
    pub fn degenerate(value: f64, driver: &str) -> Self {
        Self {
            p5: value,
            p50: value,
            p95: value,
            dominant_driver: driver.to_string(),
            n_simulations: 0,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.p5 == self.p95
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidencePenalty {
    pub reason: String,
    /// Always negative
    pub penalty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioResponse {
    pub request: ScenarioRequest,
    pub baseline_case: BTreeMap<String, f64>,
    pub scenario_case: BTreeMap<String, f64>,
    pub deltas: Vec<ScenarioDelta>,
    pub propagation_trace: Vec<PropagationStep>,
    pub uncertainty: ScenarioUncertainty,
    pub confidence: f64,
    pub confidence_penalties: Vec<ConfidencePenalty>,
    pub scenario_validity: ScenarioValidity,
    pub tipping_point_proximity: Option<String>,
    pub answer: String,
    pub caveats: Vec<String>,
    pub axioms_used: Vec<String>,
}

impl ScenarioResponse {
    /// Well-formed response for a request that could not be evaluated.
    pub fn fail_closed(request: ScenarioRequest, error: &ScenarioError) -> Self {
        let answer = match error {
            ScenarioError::InvalidRequest(msg) => {
                format!("Invalid request: {}. No projection was computed.", msg)
            }
            ScenarioError::UnknownSite(site) => format!(
                "Insufficient evidence: site '{}' has no resolvable ecosystem-service data. \
                 No projection was computed.",
                site
            ),
            ScenarioError::InsufficientEvidence { site, reason } => format!(
                "Insufficient evidence for '{}': {}. No projection was computed.",
                site, reason
            ),
            ScenarioError::Lookup(e) => format!(
                "Insufficient evidence: {}. No projection was computed.",
                e
            ),
        };
        Self {
            request,
            baseline_case: BTreeMap::new(),
            scenario_case: BTreeMap::new(),
            deltas: Vec::new(),
            propagation_trace: Vec::new(),
            uncertainty: ScenarioUncertainty::degenerate(0.0, "none"),
            confidence: 0.0,
            confidence_penalties: Vec::new(),
            scenario_validity: ScenarioValidity::OutOfDomain,
            tipping_point_proximity: None,
            answer,
            caveats: vec![format!("fail-closed ({})", error.kind())],
            axioms_used: Vec::new(),
        }
    }

    pub fn is_fail_closed(&self) -> bool {
        self.confidence == 0.0 && self.deltas.is_empty()
    }

    pub fn baseline_total(&self) -> Option<f64> {
        self.baseline_case.get(TOTAL_ESV_KEY).copied()
    }

    pub fn scenario_total(&self) -> Option<f64> {
        self.scenario_case.get(TOTAL_ESV_KEY).copied()
    }

    pub fn total_delta(&self) -> Option<&ScenarioDelta> {
        self.deltas.iter().find(|d| d.metric == "total_esv")
    }
}

/// Prefix marking trace steps that carry observations rather than axioms.
pub const OBSERVATION_PREFIX: &str = "observation:";

/// Collects the distinct axiom identifiers of a trace in evaluation order.
pub fn axioms_in(trace: &[PropagationStep]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for step in trace {
        if step.axiom_id.starts_with(OBSERVATION_PREFIX) {
            continue;
        }
        if !ids.contains(&step.axiom_id) {
            ids.push(step.axiom_id.clone());
        }
    }
    ids
}

/// Compact USD formatting for narratives ("$29.27M", "$472.5K").
pub fn fmt_usd(value: f64) -> String {
    let sign = if value < 0.0 { "-" } else { "" };
    let v = value.abs();
    if v >= 1e9 {
        format!("{}${:.2}B", sign, v / 1e9)
    } else if v >= 1e6 {
        format!("{}${:.2}M", sign, v / 1e6)
    } else if v >= 1e3 {
        format!("{}${:.1}K", sign, v / 1e3)
    } else {
        format!("{}${:.0}", sign, v)
    }
}
