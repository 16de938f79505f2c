//! Blue-carbon credit revenue for mangrove, seagrass and salt-marsh sites.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

use crate::confidence::{self, Penalty};
use crate::engine::EngineContext;
use crate::error::{LookupError, Result, ScenarioError};
use crate::model::{
    axioms_in, fmt_usd, PropagationStep, ScenarioDelta, ScenarioRequest, ScenarioResponse,
    ScenarioUncertainty, ScenarioValidity, TOTAL_ESV_KEY,
};
use crate::reference::{habitat, ReferenceTables, SequestrationRate, DEFAULT_VERIFIED_FRACTION};
use crate::sites::SiteData;

/// Revenue calculation failures, reported as values rather than panics
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlueCarbonError {
    #[error("site {site} has no blue-carbon eligible habitat")]
    NoEligibleHabitat { site: String },

    #[error("site {site} has no mapped area for {habitat}")]
    NoEligibleArea { site: String, habitat: String },

    #[error("no sequestration rate for {habitat} at {site}")]
    NoSequestrationRate { site: String, habitat: String },

    #[error("verified fraction {0} must lie in (0, 1]")]
    InvalidVerifiedFraction(f64),

    #[error("carbon price {0} must be finite and non-negative")]
    InvalidPrice(f64),

    #[error(transparent)]
    Lookup(#[from] LookupError),
}

impl From<BlueCarbonError> for ScenarioError {
    fn from(e: BlueCarbonError) -> Self {
        match e {
            BlueCarbonError::NoEligibleHabitat { ref site }
            | BlueCarbonError::NoEligibleArea { ref site, .. }
            | BlueCarbonError::NoSequestrationRate { ref site, .. } => {
                ScenarioError::insufficient(site.clone(), e.to_string())
            }
            BlueCarbonError::InvalidVerifiedFraction(_) | BlueCarbonError::InvalidPrice(_) => {
                ScenarioError::invalid(e.to_string())
            }
            BlueCarbonError::Lookup(l) => ScenarioError::Lookup(l),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlueCarbonOptions {
    /// Named price scenario; the table default when absent
    pub price_scenario: Option<String>,
    /// Explicit USD/tCO2e, overriding any scenario
    pub price_usd: Option<f64>,
    pub verified_fraction: Option<f64>,
    pub area_override_ha: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueCarbonRevenue {
    pub site_id: String,
    pub habitat: String,
    pub habitat_source: String,
    pub area_ha: f64,
    pub area_source: String,
    pub rate_low: f64,
    pub rate_high: f64,
    pub verified_fraction: f64,
    /// Scenario name, or "custom" for an explicit price
    pub price_scenario: String,
    pub price_usd_per_tco2e: f64,
    /// Verified tCO2e per year
    pub credits_low: f64,
    pub credits_mid: f64,
    pub credits_high: f64,
    /// USD per year
    pub revenue_low: f64,
    pub revenue_mid: f64,
    pub revenue_high: f64,
}

fn eligible(h: &str) -> bool {
    habitat::BLUE_CARBON_ELIGIBLE.contains(&h)
}

/// Eligible habitat and where it was found: the explicit blue-carbon habitat,
/// then the primary habitat, then secondary habitats, then mapped areas.
pub fn detect_habitat(site: &SiteData) -> Option<(String, &'static str)> {
    if let Some(h) = site.blue_carbon_habitat.as_deref().filter(|h| eligible(h)) {
        return Some((h.to_string(), "blue_carbon_habitat"));
    }
    if let Some((i, h)) = site.all_habitats().enumerate().find(|(_, h)| eligible(h)) {
        let source = if i == 0 { "primary_habitat" } else { "secondary_habitat" };
        return Some((h.to_string(), source));
    }
    habitat::BLUE_CARBON_ELIGIBLE
        .iter()
        .find(|h| site.habitat_areas_ha.contains_key(**h))
        .map(|h| (h.to_string(), "habitat_area_map"))
}

/// Area and source: override, mapped habitat area, then (primary habitat
/// only) current extent and total site area.
pub fn detect_area(
    site: &SiteData,
    habitat: &str,
    override_ha: Option<f64>,
) -> Option<(f64, &'static str)> {
    let positive = |v: f64| v.is_finite() && v > 0.0;
    if let Some(a) = override_ha.filter(|a| positive(*a)) {
        return Some((a, "override"));
    }
    if let Some(a) = site.habitat_areas_ha.get(habitat).copied().filter(|a| positive(*a)) {
        return Some((a, "habitat_area_map"));
    }
    if habitat != site.habitat {
        return None;
    }
    site.current_extent_ha
        .filter(|a| positive(*a))
        .map(|a| (a, "current_extent"))
        .or_else(|| site.area_ha.filter(|a| positive(*a)).map(|a| (a, "site_area")))
}

pub fn calculate(
    tables: &ReferenceTables,
    site: &SiteData,
    options: &BlueCarbonOptions,
) -> std::result::Result<BlueCarbonRevenue, BlueCarbonError> {
    let verified_fraction = options.verified_fraction.unwrap_or(DEFAULT_VERIFIED_FRACTION);
    if !(verified_fraction > 0.0 && verified_fraction <= 1.0) {
        return Err(BlueCarbonError::InvalidVerifiedFraction(verified_fraction));
    }
    let (habitat, habitat_source) = detect_habitat(site)
        .ok_or_else(|| BlueCarbonError::NoEligibleHabitat { site: site.id.clone() })?;
    let (area_ha, area_source) = detect_area(site, &habitat, options.area_override_ha)
        .ok_or_else(|| BlueCarbonError::NoEligibleArea {
            site: site.id.clone(),
            habitat: habitat.clone(),
        })?;
    let SequestrationRate { low, high } =
        tables
            .sequestration_for(&site.id, &habitat)
            .ok_or_else(|| BlueCarbonError::NoSequestrationRate {
                site: site.id.clone(),
                habitat: habitat.clone(),
            })?;

    let (price_scenario, price) = match options.price_usd {
        Some(p) if !p.is_finite() || p < 0.0 => return Err(BlueCarbonError::InvalidPrice(p)),
        Some(p) => ("custom".to_string(), p),
        None => {
            let name = options
                .price_scenario
                .clone()
                .unwrap_or_else(|| tables.default_price_scenario.clone());
            let price = tables.carbon_price(&name)?;
            (name, price)
        }
    };

    let credits = |rate: f64| area_ha * rate * verified_fraction;
    let (credits_low, credits_high) = (credits(low), credits(high));
    let credits_mid = 0.5 * (credits_low + credits_high);
    debug!(site = %site.id, %habitat, area_ha, price, "blue carbon revenue computed");

    Ok(BlueCarbonRevenue {
        site_id: site.id.clone(),
        habitat,
        habitat_source: habitat_source.to_string(),
        area_ha,
        area_source: area_source.to_string(),
        rate_low: low,
        rate_high: high,
        verified_fraction,
        price_scenario,
        price_usd_per_tco2e: price,
        credits_low,
        credits_mid,
        credits_high,
        revenue_low: credits_low * price,
        revenue_mid: credits_mid * price,
        revenue_high: credits_high * price,
    })
}

pub fn options_from_request(request: &ScenarioRequest) -> BlueCarbonOptions {
    BlueCarbonOptions {
        price_scenario: request.assumption_str("carbon_price_scenario").map(str::to_string),
        price_usd: request.assumption_f64("carbon_price_usd"),
        verified_fraction: request.assumption_f64("verified_fraction"),
        area_override_ha: request.assumption_f64("habitat_area_ha"),
    }
}

pub fn run(ctx: &EngineContext<'_>, request: &ScenarioRequest) -> Result<ScenarioResponse> {
    let tables = ctx.tables;
    let site = ctx.sites.resolve(request.primary_site()?)?;
    let r = calculate(tables, site, &options_from_request(request))?;
    let esv = site.total_esv();

    let trace = vec![
        PropagationStep::scaled(
            format!("blue_carbon_sequestration:{}", r.habitat),
            format!(
                "{} sequesters {:.1}-{:.1} tCO2e/ha/yr; midpoint over {:.0} ha ({})",
                r.habitat, r.rate_low, r.rate_high, r.area_ha, r.area_source
            ),
            ("area_ha", r.area_ha),
            "sequestration_tco2e",
            0.5 * (r.rate_low + r.rate_high),
        ),
        PropagationStep::scaled(
            "carbon_verification",
            "Share of sequestration issued as verified credits",
            ("sequestration_tco2e", r.credits_mid / r.verified_fraction),
            "verified_credits_tco2e",
            r.verified_fraction,
        ),
        PropagationStep::scaled(
            "carbon_price",
            format!("Credits sold at the {} price", r.price_scenario),
            ("verified_credits_tco2e", r.credits_mid),
            "carbon_revenue_usd",
            r.price_usd_per_tco2e,
        ),
    ];

    let baseline_case = BTreeMap::from([
        (TOTAL_ESV_KEY.to_string(), esv),
        ("carbon_revenue_usd".to_string(), 0.0),
    ]);
    let scenario_case = BTreeMap::from([
        (TOTAL_ESV_KEY.to_string(), esv),
        ("carbon_revenue_usd".to_string(), r.revenue_mid),
        ("carbon_revenue_low_usd".to_string(), r.revenue_low),
        ("carbon_revenue_high_usd".to_string(), r.revenue_high),
        ("verified_credits_tco2e".to_string(), r.credits_mid),
        ("price_usd_per_tco2e".to_string(), r.price_usd_per_tco2e),
    ]);
    let deltas = vec![
        ScenarioDelta::usd("carbon_credit_revenue", 0.0, r.revenue_mid),
        ScenarioDelta::new("verified_credits", 0.0, r.credits_mid, "tCO2e/yr"),
        ScenarioDelta::usd("total_esv", esv, esv),
    ];

    let penalties: Vec<Penalty> = if r.area_source == "site_area" {
        vec![Penalty::MissingSiteCalibration]
    } else {
        Vec::new()
    };
    let conf = confidence::assess(&tables.confidence, request.scenario_type, &penalties);

    let mut caveats = vec![
        "Revenue range spans the literature sequestration range; no Monte Carlo.".to_string(),
        "Credit issuance, buffer pools and transaction costs are not modeled.".to_string(),
    ];
    if r.area_source == "site_area" {
        caveats.push("Eligible area falls back to the whole protected area.".to_string());
    }

    let answer = format!(
        "{} ({}, {:.0} ha) could issue {:.0}-{:.0} verified tCO2e per year, \
         worth {} to {} annually at {} (${:.0}/tCO2e).",
        site.name,
        r.habitat,
        r.area_ha,
        r.credits_low,
        r.credits_high,
        fmt_usd(r.revenue_low),
        fmt_usd(r.revenue_high),
        r.price_scenario,
        r.price_usd_per_tco2e,
    );

    Ok(ScenarioResponse {
        request: request.clone(),
        baseline_case,
        scenario_case,
        deltas,
        axioms_used: axioms_in(&trace),
        propagation_trace: trace,
        uncertainty: ScenarioUncertainty {
            p5: r.revenue_low,
            p50: r.revenue_mid,
            p95: r.revenue_high,
            dominant_driver: "sequestration_rate_range".to_string(),
            n_simulations: 0,
        },
        confidence: conf.adjusted,
        confidence_penalties: conf.penalties,
        scenario_validity: ScenarioValidity::InDomain,
        tipping_point_proximity: None,
        answer,
        caveats,
    })
}
