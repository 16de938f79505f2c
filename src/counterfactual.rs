//! Counterfactual engine: what a protected site would be worth had
//! protection been removed.
//!
//! Sites are matched to a closed set of reversion models through the
//! site→model table in `ReferenceTables`; anything unlisted falls back to
//! uniform retention.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::confidence::{self, Penalty};
use crate::engine::EngineContext;
use crate::error::{Result, ScenarioError};
use crate::model::{
    axioms_in, fmt_usd, PropagationStep, ScenarioDelta, ScenarioRequest, ScenarioResponse,
    ScenarioUncertainty, ScenarioValidity, TOTAL_ESV_KEY,
};
use crate::reference::{self, service, ReferenceTables};
use crate::sampling::{p5_p50_p95, Sampler};
use crate::sensitivity::retained_service_fraction;
use crate::sites::SiteData;
use crate::tipping::{self, BIOMASS_RECONSTRUCTION_AXIOM, REEF_FUNCTION_AXIOM};

/// Half-width of the triangular band around the computed change, as a share
/// of its magnitude.
const CHANGE_BAND: f64 = 0.20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReversionModel {
    /// Reef fish biomass falls back to its pre-protection level
    BiomassReversion,
    /// Habitat extent shrinks to its historical minimum
    HabitatExtentCollapse,
    /// Habitat is lost outright; services retain differentiated residuals
    FullHabitatLoss,
    /// Uniform retention, no site calibration
    GenericFallback,
}

impl ReversionModel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BiomassReversion => "biomass_reversion",
            Self::HabitatExtentCollapse => "habitat_extent_collapse",
            Self::FullHabitatLoss => "full_habitat_loss",
            Self::GenericFallback => "generic_fallback",
        }
    }

    /// Model registered for `site_id`, or the generic fallback.
    pub fn for_site(tables: &ReferenceTables, site_id: &str) -> Self {
        tables
            .counterfactual_models
            .get(site_id)
            .copied()
            .unwrap_or(Self::GenericFallback)
    }

    pub fn apply(&self, tables: &ReferenceTables, site: &SiteData) -> Result<ModelOutcome> {
        match self {
            Self::BiomassReversion => biomass_reversion(tables, site),
            Self::HabitatExtentCollapse => habitat_extent_collapse(tables, site),
            Self::FullHabitatLoss => Ok(full_habitat_loss(site)),
            Self::GenericFallback => Ok(generic_fallback(site)),
        }
    }
}

impl fmt::Display for ReversionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReversionModel {
    type Err = ScenarioError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "biomass_reversion" => Ok(Self::BiomassReversion),
            "habitat_extent_collapse" => Ok(Self::HabitatExtentCollapse),
            "full_habitat_loss" => Ok(Self::FullHabitatLoss),
            "generic_fallback" => Ok(Self::GenericFallback),
            other => Err(ScenarioError::invalid(format!("unknown reversion model '{}'", other))),
        }
    }
}

/// Built-in site→model assignments.
pub fn default_site_models() -> BTreeMap<String, ReversionModel> {
    BTreeMap::from([
        ("cabo_pulmo".to_string(), ReversionModel::BiomassReversion),
        ("hol_chan".to_string(), ReversionModel::BiomassReversion),
        ("shark_bay".to_string(), ReversionModel::HabitatExtentCollapse),
        ("sundarbans".to_string(), ReversionModel::FullHabitatLoss),
    ])
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceOutcome {
    pub service_type: String,
    pub baseline_value: f64,
    pub scenario_value: f64,
}

/// Result of applying one reversion model to one site.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutcome {
    pub services: Vec<ServiceOutcome>,
    pub steps: Vec<PropagationStep>,
    pub tipping_point: Option<String>,
    pub caveats: Vec<String>,
}

impl ModelOutcome {
    pub fn baseline_total(&self) -> f64 {
        self.services.iter().map(|s| s.baseline_value).sum()
    }

    pub fn scenario_total(&self) -> f64 {
        self.services.iter().map(|s| s.scenario_value).sum()
    }
}

fn retention_outcome(
    site: &SiteData,
    axiom: &str,
    describe: &str,
    retention: impl Fn(&str) -> f64,
) -> (Vec<ServiceOutcome>, Vec<PropagationStep>) {
    let mut services = Vec::with_capacity(site.services.len());
    let mut steps = Vec::with_capacity(site.services.len());
    for s in &site.services {
        let keep = retention(&s.service_type).clamp(0.0, 1.0);
        let step = PropagationStep::scaled(
            format!("{}:{}", axiom, s.service_type),
            format!("{} {}", s.service_type, describe),
            (s.service_type.as_str(), s.annual_value),
            &format!("{}_without_protection", s.service_type),
            keep,
        )
        .with_doi(s.source_doi.as_deref());
        services.push(ServiceOutcome {
            service_type: s.service_type.clone(),
            baseline_value: s.annual_value,
            scenario_value: step.output_value,
        });
        steps.push(step);
    }
    (services, steps)
}

fn biomass_reversion(tables: &ReferenceTables, site: &SiteData) -> Result<ModelOutcome> {
    let ratio = site
        .biomass_recovery_ratio
        .filter(|r| r.is_finite() && *r > 0.0)
        .ok_or_else(|| {
            ScenarioError::insufficient(&site.id, "biomass reversion needs a recovery ratio")
        })?;
    let reverted = tables.historical_reef_biomass_kg_ha;
    let current = ratio * reverted;
    let rf_current = tipping::reef_function(tables, current);
    let rf_reverted = tipping::reef_function(tables, reverted);
    // protection cannot have lowered biomass under this premise
    let function_ratio = (rf_reverted / rf_current).min(1.0);

    let mut steps = vec![
        PropagationStep::scaled(
            BIOMASS_RECONSTRUCTION_AXIOM,
            "Current biomass reconstructed from recovery ratio and pre-protection baseline",
            ("biomass_recovery_ratio", ratio),
            "current_biomass_kg_ha",
            reverted,
        ),
        PropagationStep::new(
            REEF_FUNCTION_AXIOM,
            "Reef function at current biomass",
            ("current_biomass_kg_ha", current),
            ("reef_function_current", rf_current),
        ),
        PropagationStep::new(
            REEF_FUNCTION_AXIOM,
            "Reef function after reversion to pre-protection biomass",
            ("reverted_biomass_kg_ha", reverted),
            ("reef_function_reverted", rf_reverted),
        ),
    ];

    let (services, service_steps) = retention_outcome(
        site,
        "biomass_reversion",
        "retained after fish biomass reverts",
        |svc| match svc {
            service::COASTAL_PROTECTION => reference::BIOMASS_REVERSION_COASTAL_RETENTION,
            service::CARBON_SEQUESTRATION => reference::BIOMASS_REVERSION_CARBON_RETENTION,
            _ => function_ratio,
        },
    );
    steps.extend(service_steps);

    Ok(ModelOutcome {
        services,
        steps,
        tipping_point: Some(tipping::proximity(tables, reverted).narrative),
        caveats: vec![
            format!(
                "Biomass-dependent services scale with reef function ({:.2} → {:.2}).",
                rf_current, rf_reverted
            ),
            "Reef-structure services (coastal protection, carbon) keep fixed fractions."
                .to_string(),
        ],
    })
}

fn habitat_extent_collapse(tables: &ReferenceTables, site: &SiteData) -> Result<ModelOutcome> {
    let current = site
        .current_extent_ha
        .filter(|v| *v > 0.0)
        .ok_or_else(|| {
            ScenarioError::insufficient(&site.id, "extent collapse needs a current extent")
        })?;
    let minimum = site
        .historical_min_extent_ha
        .filter(|v| *v >= 0.0)
        .ok_or_else(|| {
            ScenarioError::insufficient(&site.id, "extent collapse needs a historical minimum")
        })?;
    let retained = (minimum / current).clamp(0.0, 1.0);

    let mut steps = vec![PropagationStep::scaled(
        "habitat_extent_minimum",
        "Habitat extent reverts to its historical minimum",
        ("current_extent_ha", current),
        "historical_min_extent_ha",
        retained,
    )];
    let (services, service_steps) = retention_outcome(
        site,
        "service_sensitivity",
        "retained at historical-minimum extent",
        |svc| retained_service_fraction(tables, svc, retained),
    );
    steps.extend(service_steps);

    Ok(ModelOutcome {
        services,
        steps,
        tipping_point: None,
        caveats: vec![format!(
            "Habitat extent falls to {:.0}% of its current area; \
             services follow their sensitivity curves.",
            retained * 100.0
        )],
    })
}

fn full_habitat_loss(site: &SiteData) -> ModelOutcome {
    let (services, steps) = retention_outcome(
        site,
        "full_habitat_loss",
        "residual after complete habitat loss",
        |svc| match svc {
            service::FISHERIES => reference::FULL_LOSS_FISHERIES_RETENTION,
            service::TOURISM => reference::FULL_LOSS_TOURISM_RETENTION,
            service::RECREATION => reference::FULL_LOSS_RECREATION_RETENTION,
            service::COASTAL_PROTECTION => reference::FULL_LOSS_COASTAL_RETENTION,
            service::CARBON_SEQUESTRATION => reference::FULL_LOSS_CARBON_RETENTION,
            _ => reference::FULL_LOSS_OTHER_RETENTION,
        },
    );
    ModelOutcome {
        services,
        steps,
        tipping_point: None,
        caveats: vec![
            "Habitat is assumed lost; residual values reflect off-site stocks and visitation."
                .to_string(),
        ],
    }
}

fn generic_fallback(site: &SiteData) -> ModelOutcome {
    let (services, steps) = retention_outcome(
        site,
        "generic_retention",
        "retained under uniform fallback",
        |_| reference::GENERIC_FALLBACK_RETENTION,
    );
    ModelOutcome {
        services,
        steps,
        tipping_point: None,
        caveats: vec![format!(
            "No calibrated reversion model for this site; a uniform {:.0}% retention is assumed.",
            reference::GENERIC_FALLBACK_RETENTION * 100.0
        )],
    }
}

/// Triangular band of ±20% of the change's magnitude around the change.
fn change_uncertainty(
    change: f64,
    driver: &str,
    sampler: &mut Sampler,
    n: usize,
) -> ScenarioUncertainty {
    let half = CHANGE_BAND * change.abs();
    if half == 0.0 || n == 0 {
        return ScenarioUncertainty::degenerate(change, driver);
    }
    let mut draws: Vec<f64> = (0..n)
        .map(|_| sampler.triangular(change - half, change, change + half))
        .collect();
    let (p5, p50, p95) = p5_p50_p95(&mut draws);
    ScenarioUncertainty {
        p5,
        p50,
        p95,
        dominant_driver: driver.to_string(),
        n_simulations: n,
    }
}

pub fn run(ctx: &EngineContext<'_>, request: &ScenarioRequest) -> Result<ScenarioResponse> {
    let tables = ctx.tables;
    let site = ctx.sites.resolve(request.primary_site()?)?;
    if site.services.is_empty() {
        return Err(ScenarioError::insufficient(
            &site.id,
            "no ecosystem-service valuations on record",
        ));
    }

    let model = ReversionModel::for_site(tables, &site.id);
    let outcome = model.apply(tables, site)?;
    let baseline_total = outcome.baseline_total();
    let scenario_total = outcome.scenario_total();
    let change = scenario_total - baseline_total;
    debug!(
        site = %site.id,
        model = %model,
        baseline_total,
        scenario_total,
        "counterfactual evaluated"
    );

    let mut baseline_case = BTreeMap::new();
    let mut scenario_case = BTreeMap::new();
    let mut deltas = Vec::with_capacity(outcome.services.len() + 1);
    for s in &outcome.services {
        *baseline_case.entry(s.service_type.clone()).or_insert(0.0) += s.baseline_value;
        *scenario_case.entry(s.service_type.clone()).or_insert(0.0) += s.scenario_value;
        deltas.push(ScenarioDelta::usd(&s.service_type, s.baseline_value, s.scenario_value));
    }
    baseline_case.insert(TOTAL_ESV_KEY.to_string(), baseline_total);
    scenario_case.insert(TOTAL_ESV_KEY.to_string(), scenario_total);
    deltas.push(ScenarioDelta::usd("total_esv", baseline_total, scenario_total));

    let driver = format!("reversion_model:{}", model);
    let mut sampler = Sampler::new(ctx.settings.seed);
    let uncertainty = change_uncertainty(change, &driver, &mut sampler, ctx.settings.draws());

    let penalties: Vec<Penalty> = if model == ReversionModel::GenericFallback {
        vec![Penalty::MissingSiteCalibration]
    } else {
        Vec::new()
    };
    let conf = confidence::assess(&tables.confidence, request.scenario_type, &penalties);
    let validity = if model == ReversionModel::GenericFallback {
        ScenarioValidity::PartiallyOutOfDomain
    } else {
        ScenarioValidity::InDomain
    };

    let pct = if baseline_total > 0.0 { change / baseline_total * 100.0 } else { 0.0 };
    let answer = format!(
        "Removing protection at {} ({} model) is projected to change annual \
         ecosystem-service value from {} to {} ({}, {:.1}%). 90% band on the change: {} to {}.",
        site.name,
        model,
        fmt_usd(baseline_total),
        fmt_usd(scenario_total),
        fmt_usd(change),
        pct,
        fmt_usd(uncertainty.p5),
        fmt_usd(uncertainty.p95),
    );

    let mut caveats = outcome.caveats;
    caveats.push("Reversion is treated as complete within the requested horizon.".to_string());

    Ok(ScenarioResponse {
        request: request.clone(),
        baseline_case,
        scenario_case,
        deltas,
        axioms_used: axioms_in(&outcome.steps),
        propagation_trace: outcome.steps,
        uncertainty,
        confidence: conf.adjusted,
        confidence_penalties: conf.penalties,
        scenario_validity: validity,
        tipping_point_proximity: outcome.tipping_point,
        answer,
        caveats,
    })
}
