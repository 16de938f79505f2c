//! Climate scenario engine: per-site ESV under an SSP pathway in a target year.

use std::collections::BTreeMap;
use tracing::debug;

use crate::confidence::{self, Penalty};
use crate::engine::EngineContext;
use crate::error::{Result, ScenarioError};
use crate::interpolate::{interpolate, warming};
use crate::model::{
    axioms_in, fmt_usd, PropagationStep, ScenarioDelta, ScenarioRequest, ScenarioResponse,
    ScenarioUncertainty, ScenarioValidity, Ssp, OBSERVATION_PREFIX, TOTAL_ESV_KEY,
};
use crate::reference::{DegradationRange, ReferenceTables};
use crate::sampling::{p5_p50_p95, Sampler};
use crate::sensitivity::retained_service_fraction;
use crate::sites::SiteData;

pub const DEGRADATION_AXIOM: &str = "ssp_degradation";
pub const SENSITIVITY_AXIOM: &str = "service_sensitivity";

/// Horizon bands (years past the baseline year) for the validity flag.
const IN_DOMAIN_YEARS: i64 = 50;
const PARTIAL_DOMAIN_YEARS: i64 = 100;

pub fn validity_for(years_ahead: i64) -> ScenarioValidity {
    if years_ahead <= IN_DOMAIN_YEARS {
        ScenarioValidity::InDomain
    } else if years_ahead <= PARTIAL_DOMAIN_YEARS {
        ScenarioValidity::PartiallyOutOfDomain
    } else {
        ScenarioValidity::OutOfDomain
    }
}

/// Total site ESV once `loss` of the habitat is gone.
pub fn degraded_total(tables: &ReferenceTables, site: &SiteData, loss: f64) -> f64 {
    let retained = (1.0 - loss).clamp(0.0, 1.0);
    site.services
        .iter()
        .map(|s| s.annual_value * retained_service_fraction(tables, &s.service_type, retained))
        .sum()
}

/// Triangular Monte Carlo over the degradation range.
fn simulate(
    tables: &ReferenceTables,
    site: &SiteData,
    range: DegradationRange,
    seed: u64,
    n: usize,
) -> ScenarioUncertainty {
    let driver = format!("{}_degradation", site.habitat);
    if range.width() <= 0.0 || n == 0 {
        let point = degraded_total(tables, site, range.midpoint());
        return ScenarioUncertainty::degenerate(point, &driver);
    }
    let mut sampler = Sampler::new(seed);
    let mut totals: Vec<f64> = (0..n)
        .map(|_| {
            let loss = sampler.triangular(range.low, range.midpoint(), range.high);
            degraded_total(tables, site, loss)
        })
        .collect();
    let (p5, p50, p95) = p5_p50_p95(&mut totals);
    ScenarioUncertainty {
        p5,
        p50,
        p95,
        dominant_driver: driver,
        n_simulations: n,
    }
}

/// Carries an observed environmental baseline forward by the pathway's
/// projected warming. Only temperature-like parameters are shifted.
fn project_environment(
    tables: &ReferenceTables,
    site: &SiteData,
    ssp: Ssp,
    year: i32,
) -> Option<PropagationStep> {
    let env = site.environmental_baseline.as_ref()?;
    let unit = env.unit.trim().to_lowercase();
    if !matches!(unit.as_str(), "°c" | "c" | "degc" | "deg_c" | "celsius") {
        return None;
    }
    let delta = warming(tables, ssp, year);
    Some(PropagationStep {
        axiom_id: format!("{}environmental_baseline", OBSERVATION_PREFIX),
        description: format!(
            "Observed {} carried forward by {:+.2} °C of {} warming",
            env.parameter, delta, ssp
        ),
        input_parameter: env.parameter.clone(),
        input_value: env.value,
        output_parameter: format!("{}_{}", env.parameter, year),
        output_value: env.value + delta,
        coefficient: None,
        source_doi: None,
    })
}

pub fn run(ctx: &EngineContext<'_>, request: &ScenarioRequest) -> Result<ScenarioResponse> {
    let tables = ctx.tables;
    let ssp = request
        .ssp()?
        .ok_or_else(|| ScenarioError::invalid("climate scenario requires ssp_scenario"))?;
    let year = request
        .target_year
        .ok_or_else(|| ScenarioError::invalid("climate scenario requires target_year"))?;
    if year < tables.baseline_year {
        return Err(ScenarioError::invalid(format!(
            "target_year {} precedes the baseline year {}",
            year, tables.baseline_year
        )));
    }

    let site = ctx.sites.resolve(request.primary_site()?)?;
    if site.services.is_empty() {
        return Err(ScenarioError::insufficient(
            &site.id,
            "no ecosystem-service valuations on record",
        ));
    }
    let range = interpolate(tables, ssp, &site.habitat, year)?;
    let loss = range.midpoint();
    let retained = 1.0 - loss;
    debug!(
        site = %site.id,
        %ssp,
        year,
        low = range.low,
        high = range.high,
        "degradation interpolated"
    );

    let mut trace = vec![PropagationStep::new(
        format!("{}:{}", DEGRADATION_AXIOM, site.habitat),
        format!(
            "{} loss under {} by {} interpolated to {:.0}-{:.0}%, midpoint used",
            site.habitat,
            ssp,
            year,
            range.low * 100.0,
            range.high * 100.0
        ),
        ("target_year", year as f64),
        ("habitat_loss_fraction", loss),
    )];

    let mut baseline_case = BTreeMap::new();
    let mut scenario_case = BTreeMap::new();
    let mut deltas = Vec::with_capacity(site.services.len() + 1);
    let mut baseline_total = 0.0;
    let mut scenario_total = 0.0;
    for s in &site.services {
        let fraction = retained_service_fraction(tables, &s.service_type, retained);
        let step = PropagationStep::scaled(
            format!("{}:{}", SENSITIVITY_AXIOM, s.service_type),
            format!(
                "{} retains {:.0}% of value at {:.0}% habitat retained",
                s.service_type,
                fraction * 100.0,
                retained * 100.0
            ),
            (s.service_type.as_str(), s.annual_value),
            &format!("{}_{}", s.service_type, year),
            fraction,
        )
        .with_doi(s.source_doi.as_deref());
        let scenario_value = step.output_value;
        trace.push(step);

        *baseline_case.entry(s.service_type.clone()).or_insert(0.0) += s.annual_value;
        *scenario_case.entry(s.service_type.clone()).or_insert(0.0) += scenario_value;
        deltas.push(ScenarioDelta::usd(&s.service_type, s.annual_value, scenario_value));
        baseline_total += s.annual_value;
        scenario_total += scenario_value;
    }
    baseline_case.insert(TOTAL_ESV_KEY.to_string(), baseline_total);
    scenario_case.insert(TOTAL_ESV_KEY.to_string(), scenario_total);
    scenario_case.insert("habitat_loss_low".to_string(), range.low);
    scenario_case.insert("habitat_loss_high".to_string(), range.high);
    deltas.push(ScenarioDelta::usd("total_esv", baseline_total, scenario_total));

    if let Some(step) = project_environment(tables, site, ssp, year) {
        scenario_case.insert(step.output_parameter.clone(), step.output_value);
        trace.push(step);
    }

    let uncertainty = simulate(tables, site, range, ctx.settings.seed, ctx.settings.draws());

    let years_ahead = i64::from(year - tables.baseline_year);
    let penalties = [
        Penalty::TemporalExtrapolation { years: years_ahead as f64 },
        Penalty::SspUncertainty(ssp),
    ];
    let conf = confidence::assess(&tables.confidence, request.scenario_type, &penalties);
    let validity = validity_for(years_ahead);

    let mut caveats = vec![
        format!(
            "Degradation anchors are literature ranges for {}; the midpoint is the point estimate.",
            site.habitat
        ),
        "Services follow generic sensitivity curves, not site-specific dose-response.".to_string(),
    ];
    if validity != ScenarioValidity::InDomain {
        caveats.push(format!(
            "Projection extends {} years past {}; treat as exploratory.",
            years_ahead, tables.baseline_year
        ));
    }

    let answer = format!(
        "Under {}, {} ({}) is projected to lose {:.0}-{:.0}% of habitat by {}. \
         Annual ecosystem-service value changes from {} to {} ({}); 90% interval {} to {}.",
        ssp,
        site.name,
        site.habitat,
        range.low * 100.0,
        range.high * 100.0,
        year,
        fmt_usd(baseline_total),
        fmt_usd(scenario_total),
        fmt_usd(scenario_total - baseline_total),
        fmt_usd(uncertainty.p5),
        fmt_usd(uncertainty.p95),
    );

    Ok(ScenarioResponse {
        request: request.clone(),
        baseline_case,
        scenario_case,
        deltas,
        axioms_used: axioms_in(&trace),
        propagation_trace: trace,
        uncertainty,
        confidence: conf.adjusted,
        confidence_penalties: conf.penalties,
        scenario_validity: validity,
        tipping_point_proximity: None,
        answer,
        caveats,
    })
}
