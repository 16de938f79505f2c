//! Tipping-point analyzer for reef fish biomass.
//!
//! `reef_function` maps biomass (kg/ha) to a 0..1 reef-function index as five
//! linear segments. The interior breakpoints are the collapse, MMSY lower,
//! MMSY upper and warning thresholds. Below collapse the curve falls to a
//! small floor at zero biomass; above the warning threshold it rises along the
//! line through the pristine reference and is clamped at 1.0.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::confidence::{self, Penalty};
use crate::engine::EngineContext;
use crate::error::{Result, ScenarioError};
use crate::model::{
    axioms_in, fmt_usd, PropagationStep, ScenarioDelta, ScenarioRequest, ScenarioResponse,
    ScenarioUncertainty, ScenarioValidity, TOTAL_ESV_KEY,
};
use crate::reference::{habitat, BiomassThreshold, ReferenceTables};
use crate::sites::SiteData;

pub const REEF_FUNCTION_AXIOM: &str = "reef_biomass_function";
pub const BIOMASS_RECONSTRUCTION_AXIOM: &str = "biomass_recovery_reconstruction";

/// The last threshold only fixes the slope of the top segment; it is not a
/// breakpoint.
pub fn reef_function(tables: &ReferenceTables, biomass_kg_ha: f64) -> f64 {
    let th = &tables.biomass_thresholds;
    let Some(first) = th.first() else {
        return tables.reef_function_floor;
    };
    let b = biomass_kg_ha.max(0.0);
    if b < first.kg_ha {
        let floor = tables.reef_function_floor;
        return floor + (first.reef_function - floor) * b / first.kg_ha;
    }
    if th.len() < 2 {
        return first.reef_function;
    }
    let top = th.len() - 2;
    let segment = th.windows(2).position(|w| b < w[1].kg_ha).map_or(top, |i| i.min(top));
    let (lo, hi) = (&th[segment], &th[segment + 1]);
    let t = (b - lo.kg_ha) / (hi.kg_ha - lo.kg_ha);
    (lo.reef_function + (hi.reef_function - lo.reef_function) * t).min(1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdProximity {
    pub biomass_kg_ha: f64,
    /// Name of the nearest threshold at or below current biomass
    pub zone: String,
    pub threshold_kg_ha: Option<f64>,
    /// Percent above the zone threshold
    pub headroom_pct: Option<f64>,
    pub next_lower_zone: Option<String>,
    /// kg/ha above the next-lower threshold
    pub buffer_kg_ha: Option<f64>,
    pub narrative: String,
}

impl ThresholdProximity {
    /// True when headroom above the zone threshold is below `trigger`
    /// (a fraction), or when biomass is already below collapse.
    pub fn is_near(&self, trigger: f64) -> bool {
        match self.headroom_pct {
            Some(h) => h / 100.0 < trigger,
            None => true,
        }
    }
}

pub fn proximity(tables: &ReferenceTables, biomass_kg_ha: f64) -> ThresholdProximity {
    let th = &tables.biomass_thresholds;
    let b = biomass_kg_ha.max(0.0);
    let idx = th.iter().rposition(|t| t.kg_ha <= b);

    let Some(i) = idx else {
        let (zone_kg, label) = th
            .first()
            .map(|t| (t.kg_ha, t.label))
            .unwrap_or((0.0, "collapse threshold"));
        return ThresholdProximity {
            biomass_kg_ha: b,
            zone: "collapsed".to_string(),
            threshold_kg_ha: None,
            headroom_pct: None,
            next_lower_zone: None,
            buffer_kg_ha: None,
            narrative: format!(
                "Biomass {:.0} kg/ha is below the {} ({:.0} kg/ha); \
                 reef function is near its floor ({:.2}).",
                b,
                label,
                zone_kg,
                reef_function(tables, b)
            ),
        };
    };

    let zone: &BiomassThreshold = &th[i];
    let headroom_pct = (b - zone.kg_ha) / zone.kg_ha * 100.0;
    let next_lower = i.checked_sub(1).map(|j| &th[j]);

    let mut narrative = if i + 1 == th.len() {
        format!(
            "Biomass {:.0} kg/ha is at or above the {} ({:.0} kg/ha), {:.1}% headroom",
            b, zone.label, zone.kg_ha, headroom_pct
        )
    } else {
        format!(
            "Biomass {:.0} kg/ha sits {:.1}% above the {} ({:.0} kg/ha)",
            b, headroom_pct, zone.label, zone.kg_ha
        )
    };
    match next_lower {
        Some(n) => narrative.push_str(&format!(
            "; {:.0} kg/ha buffer above the {} ({:.0} kg/ha).",
            b - n.kg_ha,
            n.label,
            n.kg_ha
        )),
        None => narrative.push_str("; no lower threshold remains before functional collapse."),
    }

    ThresholdProximity {
        biomass_kg_ha: b,
        zone: zone.name.to_string(),
        threshold_kg_ha: Some(zone.kg_ha),
        headroom_pct: Some(headroom_pct),
        next_lower_zone: next_lower.map(|n| n.name.to_string()),
        buffer_kg_ha: next_lower.map(|n| b - n.kg_ha),
        narrative,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteTippingAssessment {
    pub site_id: String,
    pub historical_biomass_kg_ha: f64,
    pub recovery_ratio: f64,
    pub current_biomass_kg_ha: f64,
    pub current_reef_function: f64,
    pub proximity: ThresholdProximity,
    pub total_esv_usd: f64,
    pub value_at_collapse_usd: f64,
    /// Nearest threshold strictly below current biomass
    pub next_threshold: Option<String>,
    pub next_threshold_kg_ha: Option<f64>,
    pub next_threshold_reef_function: Option<f64>,
    pub value_at_next_threshold_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TippingPointReport {
    Applicable(SiteTippingAssessment),
    NotApplicable {
        site_id: String,
        habitat: String,
        reason: String,
    },
}

pub fn site_report(tables: &ReferenceTables, site: &SiteData) -> Result<TippingPointReport> {
    if site.habitat != habitat::CORAL_REEF {
        return Ok(TippingPointReport::NotApplicable {
            site_id: site.id.clone(),
            habitat: site.habitat.clone(),
            reason: format!(
                "biomass tipping points are calibrated for {} only, site habitat is {}",
                habitat::CORAL_REEF,
                site.habitat
            ),
        });
    }
    let ratio = site
        .biomass_recovery_ratio
        .filter(|r| r.is_finite() && *r > 0.0)
        .ok_or_else(|| {
            ScenarioError::insufficient(&site.id, "no biomass recovery ratio on record")
        })?;

    let historical = tables.historical_reef_biomass_kg_ha;
    let current_biomass = ratio * historical;
    let current_rf = reef_function(tables, current_biomass);
    let total = site.total_esv();

    let collapse = tables
        .biomass_thresholds
        .first()
        .map(|t| reef_function(tables, t.kg_ha))
        .unwrap_or(tables.reef_function_floor);
    let value_at = |rf: f64| total * rf / current_rf;

    let next = tables
        .biomass_thresholds
        .iter()
        .rev()
        .find(|t| t.kg_ha < current_biomass);

    debug!(site = %site.id, current_biomass, current_rf, "tipping-point site report");

    Ok(TippingPointReport::Applicable(SiteTippingAssessment {
        site_id: site.id.clone(),
        historical_biomass_kg_ha: historical,
        recovery_ratio: ratio,
        current_biomass_kg_ha: current_biomass,
        current_reef_function: current_rf,
        proximity: proximity(tables, current_biomass),
        total_esv_usd: total,
        value_at_collapse_usd: value_at(collapse),
        next_threshold: next.map(|t| t.name.to_string()),
        next_threshold_kg_ha: next.map(|t| t.kg_ha),
        next_threshold_reef_function: next.map(|t| t.reef_function),
        value_at_next_threshold_usd: next.map(|t| value_at(t.reef_function)),
    }))
}

/// Tipping-point scenario: value if biomass declines to the next threshold.
pub fn run(ctx: &EngineContext<'_>, request: &ScenarioRequest) -> Result<ScenarioResponse> {
    let tables = ctx.tables;
    let site = ctx.sites.resolve(request.primary_site()?)?;
    let a = match site_report(tables, site)? {
        TippingPointReport::Applicable(a) => a,
        TippingPointReport::NotApplicable { site_id, reason, .. } => {
            return Err(ScenarioError::insufficient(site_id, reason));
        }
    };
    if a.total_esv_usd <= 0.0 {
        return Err(ScenarioError::insufficient(
            &site.id,
            "no positive ecosystem-service valuation",
        ));
    }

    let (target_name, target_kg, target_rf) = match (&a.next_threshold, a.next_threshold_kg_ha) {
        (Some(n), Some(kg)) => (n.clone(), kg, reef_function(tables, kg)),
        _ => ("floor".to_string(), 0.0, tables.reef_function_floor),
    };
    let ratio = target_rf / a.current_reef_function;

    let mut trace = vec![
        PropagationStep::scaled(
            BIOMASS_RECONSTRUCTION_AXIOM,
            "Current biomass reconstructed from recovery ratio and pre-protection baseline",
            ("biomass_recovery_ratio", a.recovery_ratio),
            "current_biomass_kg_ha",
            a.historical_biomass_kg_ha,
        ),
        PropagationStep::new(
            REEF_FUNCTION_AXIOM,
            "Reef function at current biomass",
            ("current_biomass_kg_ha", a.current_biomass_kg_ha),
            ("reef_function", a.current_reef_function),
        ),
    ];

    let mut baseline_case = BTreeMap::new();
    let mut scenario_case = BTreeMap::new();
    let mut deltas = Vec::new();
    for s in &site.services {
        let scenario_value = s.annual_value * ratio;
        trace.push(
            PropagationStep::scaled(
                REEF_FUNCTION_AXIOM,
                format!(
                    "{} scaled by reef function at the {} threshold",
                    s.service_type, target_name
                ),
                (s.service_type.as_str(), s.annual_value),
                &format!("{}_at_threshold", s.service_type),
                ratio,
            )
            .with_doi(s.source_doi.as_deref()),
        );
        baseline_case.insert(s.service_type.clone(), s.annual_value);
        scenario_case.insert(s.service_type.clone(), scenario_value);
        deltas.push(ScenarioDelta::usd(&s.service_type, s.annual_value, scenario_value));
    }
    let scenario_total = a.total_esv_usd * ratio;
    baseline_case.insert(TOTAL_ESV_KEY.to_string(), a.total_esv_usd);
    baseline_case.insert("biomass_kg_ha".to_string(), a.current_biomass_kg_ha);
    baseline_case.insert("reef_function".to_string(), a.current_reef_function);
    scenario_case.insert(TOTAL_ESV_KEY.to_string(), scenario_total);
    scenario_case.insert("biomass_kg_ha".to_string(), target_kg);
    scenario_case.insert("reef_function".to_string(), target_rf);
    scenario_case.insert("value_at_collapse_usd".to_string(), a.value_at_collapse_usd);
    deltas.push(ScenarioDelta::usd("total_esv", a.total_esv_usd, scenario_total));

    let coeffs = &tables.confidence;
    let mut penalties = Vec::new();
    if a.proximity.is_near(coeffs.threshold_headroom_trigger) {
        penalties.push(Penalty::ThresholdProximity);
    }
    let conf = confidence::assess(coeffs, request.scenario_type, &penalties);

    let answer = format!(
        "{} currently holds an estimated {:.0} kg/ha of reef fish biomass (reef function {:.2}). \
         A decline to the {} ({:.0} kg/ha) would reduce annual ecosystem-service value \
         from {} to {} ({}); at collapse the value falls to about {}.",
        site.name,
        a.current_biomass_kg_ha,
        a.current_reef_function,
        target_name,
        target_kg,
        fmt_usd(a.total_esv_usd),
        fmt_usd(scenario_total),
        fmt_usd(scenario_total - a.total_esv_usd),
        fmt_usd(a.value_at_collapse_usd),
    );

    Ok(ScenarioResponse {
        request: request.clone(),
        baseline_case,
        scenario_case,
        deltas,
        axioms_used: axioms_in(&trace),
        propagation_trace: trace,
        uncertainty: ScenarioUncertainty::degenerate(scenario_total, "threshold_position"),
        confidence: conf.adjusted,
        confidence_penalties: conf.penalties,
        scenario_validity: ScenarioValidity::InDomain,
        tipping_point_proximity: Some(a.proximity.narrative.clone()),
        answer,
        caveats: vec![
            "Service value is assumed proportional to the reef-function index.".to_string(),
            format!(
                "Current biomass is reconstructed from a {:.0} kg/ha pre-protection baseline.",
                a.historical_biomass_kg_ha
            ),
        ],
    })
}
