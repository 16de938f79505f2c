//! Portfolio stress test: correlated habitat degradation across sites.
//!
//! Per-site degradation is drawn from a normal whose mean and spread come
//! from the SSP degradation range at the horizon year, scaled by how directly
//! the stressor hits the habitat. Cross-site dependence follows the habitat
//! correlation table through a Cholesky factor of the site correlation
//! matrix, shrunk toward the identity when the matrix is not positive
//! definite.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::climate::validity_for;
use crate::confidence::{self, Penalty};
use crate::engine::{EngineContext, SimulationSettings};
use crate::error::{Result, ScenarioError};
use crate::interpolate::interpolate;
use crate::model::{
    axioms_in, fmt_usd, PropagationStep, ScenarioDelta, ScenarioRequest, ScenarioResponse,
    ScenarioUncertainty, Ssp, TOTAL_ESV_KEY,
};
use crate::reference::{habitat, ReferenceTables};
use crate::sampling::{mean, percentile_sorted, sort_samples, Sampler};
use crate::sites::SiteData;

/// Maps a 90% range to a standard deviation (range / 2·1.645).
const RANGE_TO_SD: f64 = 3.29;
/// Degradation scale applied to habitats a partial stressor does not target.
const NON_PRIMARY_ATTENUATION: f64 = 0.30;
const MAX_DEGRADATION: f64 = 0.95;
const SHRINKAGE_STEP: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StressType {
    Warming,
    Acidification,
    Storm,
    Compound,
}

impl StressType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warming => "warming",
            Self::Acidification => "acidification",
            Self::Storm => "storm",
            Self::Compound => "compound",
        }
    }

    pub fn primary_habitats(&self) -> &'static [&'static str] {
        match self {
            Self::Warming => &[habitat::CORAL_REEF, habitat::KELP_FOREST],
            Self::Acidification => &[habitat::CORAL_REEF],
            Self::Storm => &[habitat::MANGROVE_FOREST, habitat::SEAGRASS_MEADOW],
            Self::Compound => &[],
        }
    }

    /// Share of the habitat's SSP degradation this stressor delivers.
    pub fn scale_for(&self, habitat: &str) -> f64 {
        if *self == Self::Compound || self.primary_habitats().contains(&habitat) {
            1.0
        } else {
            NON_PRIMARY_ATTENUATION
        }
    }
}

impl fmt::Display for StressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StressType {
    type Err = ScenarioError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warming" => Ok(Self::Warming),
            "acidification" => Ok(Self::Acidification),
            "storm" => Ok(Self::Storm),
            "compound" => Ok(Self::Compound),
            other => Err(ScenarioError::invalid(format!(
                "unknown stress_type '{}' (expected warming, acidification, storm or compound)",
                other
            ))),
        }
    }
}

// ============================================================================
// Linear algebra
// ============================================================================

/// Site correlation matrix from the habitat correlation table; unit diagonal.
pub fn correlation_matrix(tables: &ReferenceTables, habitats: &[&str]) -> DMatrix<f64> {
    let n = habitats.len();
    DMatrix::from_fn(n, n, |i, j| {
        if i == j {
            1.0
        } else {
            tables.correlation(habitats[i], habitats[j])
        }
    })
}

/// Lower Cholesky factor of `(1 - λ)·m + λ·I` for the smallest λ on a 0.05
/// grid that is positive definite. Returns the factor and λ.
pub fn regularized_cholesky(m: &DMatrix<f64>) -> (DMatrix<f64>, f64) {
    let n = m.nrows();
    let identity = DMatrix::<f64>::identity(n, n);
    let steps = (1.0 / SHRINKAGE_STEP).round() as usize;
    for k in 0..=steps {
        let lambda = k as f64 * SHRINKAGE_STEP;
        let shrunk = m * (1.0 - lambda) + &identity * lambda;
        if let Some(chol) = shrunk.cholesky() {
            return (chol.l(), lambda);
        }
    }
    (identity, 1.0)
}

// ============================================================================
// Simulation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteStress {
    pub site_id: String,
    pub habitat: String,
    pub baseline_esv: f64,
    /// Midpoint of the SSP degradation range before stress scaling
    pub ssp_midpoint_loss: f64,
    pub stress_scale: f64,
    pub degradation_mean: f64,
    pub degradation_sd: f64,
    pub stressed_p50: f64,
    pub var_95: f64,
    pub var_99: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StressTestResult {
    pub stress_type: StressType,
    pub ssp: Ssp,
    pub horizon_year: i32,
    pub portfolio_baseline: f64,
    pub p5: f64,
    pub p50: f64,
    pub p95: f64,
    pub expected_loss: f64,
    /// Baseline minus the 5th-percentile portfolio value
    pub var_95: f64,
    /// Baseline minus the 1st-percentile portfolio value
    pub var_99: f64,
    pub sites: Vec<SiteStress>,
    /// Sum of site VaR95 per habitat
    pub habitat_var_95: BTreeMap<String, f64>,
    pub dominant_habitat: String,
    pub regularization: f64,
    pub n_simulations: usize,
}

pub fn simulate(
    tables: &ReferenceTables,
    sites: &[&SiteData],
    stress: StressType,
    ssp: Ssp,
    horizon_year: i32,
    settings: &SimulationSettings,
) -> Result<StressTestResult> {
    if sites.is_empty() {
        return Err(ScenarioError::invalid("stress test needs at least one site"));
    }
    let n = settings.draws();

    let mut means = Vec::with_capacity(sites.len());
    let mut sds = Vec::with_capacity(sites.len());
    let mut scales = Vec::with_capacity(sites.len());
    let mut midpoints = Vec::with_capacity(sites.len());
    for site in sites {
        let range = interpolate(tables, ssp, &site.habitat, horizon_year)?;
        let scale = stress.scale_for(&site.habitat);
        midpoints.push(range.midpoint());
        means.push(range.midpoint() * scale);
        sds.push(range.width() / RANGE_TO_SD * scale);
        scales.push(scale);
    }

    let habitats: Vec<&str> = sites.iter().map(|s| s.habitat.as_str()).collect();
    let (l, lambda) = regularized_cholesky(&correlation_matrix(tables, &habitats));
    if lambda > 0.0 {
        warn!(lambda, "correlation matrix regularized toward identity");
    }

    let k = sites.len();
    let baselines: Vec<f64> = sites.iter().map(|s| s.total_esv()).collect();
    let mut site_values: Vec<Vec<f64>> = vec![Vec::with_capacity(n); k];
    let mut portfolio: Vec<f64> = Vec::with_capacity(n);
    let mut sampler = Sampler::new(settings.seed);
    let mut eps = DVector::<f64>::zeros(k);
    for _ in 0..n {
        for e in eps.iter_mut() {
            *e = sampler.standard_normal();
        }
        let z = &l * &eps;
        let mut total = 0.0;
        for i in 0..k {
            let d = (means[i] + sds[i] * z[i]).clamp(0.0, MAX_DEGRADATION);
            let v = baselines[i] * (1.0 - d);
            site_values[i].push(v);
            total += v;
        }
        portfolio.push(total);
    }

    let portfolio_baseline: f64 = baselines.iter().sum();
    let expected_loss = portfolio_baseline - mean(&portfolio);
    sort_samples(&mut portfolio);

    let mut site_results = Vec::with_capacity(k);
    let mut habitat_var_95: BTreeMap<String, f64> = BTreeMap::new();
    for (i, site) in sites.iter().enumerate() {
        let values = &mut site_values[i];
        sort_samples(values);
        let var_95 = baselines[i] - percentile_sorted(values, 5.0);
        *habitat_var_95.entry(site.habitat.clone()).or_insert(0.0) += var_95;
        site_results.push(SiteStress {
            site_id: site.id.clone(),
            habitat: site.habitat.clone(),
            baseline_esv: baselines[i],
            ssp_midpoint_loss: midpoints[i],
            stress_scale: scales[i],
            degradation_mean: means[i],
            degradation_sd: sds[i],
            stressed_p50: percentile_sorted(values, 50.0),
            var_95,
            var_99: baselines[i] - percentile_sorted(values, 1.0),
        });
    }
    let dominant_habitat = habitat_var_95
        .iter()
        .fold(None::<(&String, f64)>, |best, (h, v)| match best {
            Some((_, bv)) if bv >= *v => best,
            _ => Some((h, *v)),
        })
        .map(|(h, _)| h.clone())
        .unwrap_or_default();

    debug!(sites = k, n, %stress, %ssp, horizon_year, "stress test simulated");

    Ok(StressTestResult {
        stress_type: stress,
        ssp,
        horizon_year,
        portfolio_baseline,
        p5: percentile_sorted(&portfolio, 5.0),
        p50: percentile_sorted(&portfolio, 50.0),
        p95: percentile_sorted(&portfolio, 95.0),
        expected_loss,
        var_95: portfolio_baseline - percentile_sorted(&portfolio, 5.0),
        var_99: portfolio_baseline - percentile_sorted(&portfolio, 1.0),
        sites: site_results,
        habitat_var_95,
        dominant_habitat,
        regularization: lambda,
        n_simulations: n,
    })
}

/// Stress type, SSP and horizon year a request asks for.
fn stress_inputs(
    tables: &ReferenceTables,
    request: &ScenarioRequest,
) -> Result<(StressType, Ssp, i32)> {
    let stress = match request.assumption_str("stress_type") {
        Some(s) => s.parse()?,
        None => StressType::Compound,
    };
    let ssp = match request.assumption_str("ssp_scenario") {
        Some(s) => s.parse()?,
        None => request.ssp()?.unwrap_or(Ssp::Ssp245),
    };
    let horizon_year = match request.target_year {
        Some(year) => year,
        None => i32::try_from(request.time_horizon_years)
            .ok()
            .and_then(|h| tables.baseline_year.checked_add(h))
            .ok_or_else(|| {
                ScenarioError::invalid(format!(
                    "time_horizon_years {} is out of range",
                    request.time_horizon_years
                ))
            })?,
    };
    if horizon_year < tables.baseline_year {
        return Err(ScenarioError::invalid(format!(
            "stress horizon {} precedes the baseline year {}",
            horizon_year, tables.baseline_year
        )));
    }
    Ok((stress, ssp, horizon_year))
}

pub fn run(ctx: &EngineContext<'_>, request: &ScenarioRequest) -> Result<ScenarioResponse> {
    let tables = ctx.tables;
    let (stress, ssp, horizon_year) = stress_inputs(tables, request)?;
    let sites = request
        .site_scope
        .iter()
        .map(|name| ctx.sites.resolve(name))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if let Some(empty) = sites.iter().find(|s| s.services.is_empty()) {
        return Err(ScenarioError::insufficient(
            &empty.id,
            "no ecosystem-service valuations on record",
        ));
    }
    let r = simulate(tables, &sites, stress, ssp, horizon_year, &ctx.settings)?;

    let mut trace = Vec::with_capacity(r.sites.len() * 2 + 1);
    let mut baseline_case = BTreeMap::new();
    let mut scenario_case = BTreeMap::new();
    let mut deltas = Vec::with_capacity(r.sites.len() + 1);
    for s in &r.sites {
        trace.push(PropagationStep::scaled(
            format!("ssp_degradation:{}", s.habitat),
            format!("{} mean loss under {} {} stress by {}", s.site_id, ssp, stress, horizon_year),
            ("ssp_midpoint_loss", s.ssp_midpoint_loss),
            &format!("{}_degradation_mean", s.site_id),
            s.stress_scale,
        ));
        baseline_case.insert(s.site_id.clone(), s.baseline_esv);
        scenario_case.insert(s.site_id.clone(), s.stressed_p50);
        deltas.push(ScenarioDelta::usd(&s.site_id, s.baseline_esv, s.stressed_p50));
    }
    trace.push(PropagationStep::new(
        "habitat_correlation",
        format!(
            "Correlated draws across {} sites, shrinkage λ = {:.2}",
            r.sites.len(),
            r.regularization
        ),
        ("n_sites", r.sites.len() as f64),
        ("regularization", r.regularization),
    ));

    baseline_case.insert(TOTAL_ESV_KEY.to_string(), r.portfolio_baseline);
    scenario_case.insert(TOTAL_ESV_KEY.to_string(), r.p50);
    scenario_case.insert("nature_var_95_usd".to_string(), r.var_95);
    scenario_case.insert("nature_var_99_usd".to_string(), r.var_99);
    scenario_case.insert("expected_loss_usd".to_string(), r.expected_loss);
    deltas.push(ScenarioDelta::usd("total_esv", r.portfolio_baseline, r.p50));

    let years_ahead = i64::from(horizon_year - tables.baseline_year);
    let penalties = [
        Penalty::TemporalExtrapolation { years: years_ahead as f64 },
        Penalty::SspUncertainty(ssp),
    ];
    let conf = confidence::assess(&tables.confidence, request.scenario_type, &penalties);

    let mut caveats = vec![
        "Per-site degradation is normal around the SSP midpoint, clipped to [0, 95%].".to_string(),
        "Cross-site dependence uses habitat-pair correlations, not site-level data.".to_string(),
    ];
    if r.regularization > 0.0 {
        caveats.push(format!(
            "Correlation matrix was shrunk toward independence (λ = {:.2}).",
            r.regularization
        ));
    }

    let answer = format!(
        "Under a {} stress on {} by {}, the {}-site portfolio ({} baseline) has a \
         95% Nature VaR of {} and a 99% Nature VaR of {}; expected loss {}. \
         {} sites carry the largest tail risk.",
        stress,
        ssp,
        horizon_year,
        r.sites.len(),
        fmt_usd(r.portfolio_baseline),
        fmt_usd(r.var_95),
        fmt_usd(r.var_99),
        fmt_usd(r.expected_loss),
        r.dominant_habitat,
    );

    Ok(ScenarioResponse {
        request: request.clone(),
        baseline_case,
        scenario_case,
        deltas,
        axioms_used: axioms_in(&trace),
        propagation_trace: trace,
        uncertainty: ScenarioUncertainty {
            p5: r.p5,
            p50: r.p50,
            p95: r.p95,
            dominant_driver: format!("habitat:{}", r.dominant_habitat),
            n_simulations: r.n_simulations,
        },
        confidence: conf.adjusted,
        confidence_penalties: conf.penalties,
        scenario_validity: validity_for(years_ahead),
        tipping_point_proximity: None,
        answer,
        caveats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ScenarioType;
    use crate::reference::service;

    fn site(id: &str, hab: &str, value: f64) -> SiteData {
        SiteData::new(id, hab).with_service(service::TOURISM, value, "market_price")
    }

    fn settings(n: usize) -> SimulationSettings {
        SimulationSettings { n_simulations: n, ..SimulationSettings::default() }
    }

    #[test]
    fn cholesky_reconstructs_matrix() {
        let m = DMatrix::from_row_slice(3, 3, &[1.0, 0.5, 0.3, 0.5, 1.0, 0.4, 0.3, 0.4, 1.0]);
        let (l, lambda) = regularized_cholesky(&m);
        assert_eq!(lambda, 0.0);
        assert_eq!(l[(0, 2)], 0.0);
        assert!((&l * l.transpose() - &m).amax() < 1e-12);
    }

    #[test]
    fn non_positive_definite_matrix_is_shrunk() {
        let m = DMatrix::from_row_slice(
            3,
            3,
            &[1.0, 0.99, -0.99, 0.99, 1.0, 0.99, -0.99, 0.99, 1.0],
        );
        assert!(m.clone().cholesky().is_none());
        let (l, lambda) = regularized_cholesky(&m);
        assert!(lambda > 0.0 && lambda <= 1.0);
        let shrunk = &m * (1.0 - lambda) + DMatrix::<f64>::identity(3, 3) * lambda;
        assert!((&l * l.transpose() - shrunk).amax() < 1e-12);
    }

    #[test]
    fn correlation_matrix_has_unit_diagonal() {
        let t = ReferenceTables::builtin();
        let habitats = [habitat::CORAL_REEF, habitat::CORAL_REEF, habitat::KELP_FOREST];
        let m = correlation_matrix(&t, &habitats);
        assert_eq!(m.nrows(), 3);
        for i in 0..3 {
            assert_eq!(m[(i, i)], 1.0);
        }
        assert_eq!(m[(0, 2)], m[(2, 0)]);
    }

    #[test]
    fn stress_scaling_targets_primary_habitats() {
        assert_eq!(StressType::Warming.scale_for(habitat::CORAL_REEF), 1.0);
        assert_eq!(StressType::Warming.scale_for(habitat::MANGROVE_FOREST), 0.30);
        assert_eq!(StressType::Storm.scale_for(habitat::SEAGRASS_MEADOW), 1.0);
        assert_eq!(StressType::Compound.scale_for(habitat::KELP_FOREST), 1.0);
        assert!("hail".parse::<StressType>().is_err());
    }

    #[test]
    fn portfolio_var_dominates_every_site() {
        let t = ReferenceTables::builtin();
        let a = site("a", habitat::CORAL_REEF, 10.0e6);
        let b = site("b", habitat::MANGROVE_FOREST, 4.0e6);
        let c = site("c", habitat::SEAGRASS_MEADOW, 2.0e6);
        let sites = [&a, &b, &c];
        let r =
            simulate(&t, &sites, StressType::Compound, Ssp::Ssp245, 2050, &settings(5000)).unwrap();
        for s in &r.sites {
            assert!(r.var_95 + 1e-6 >= s.var_95, "{} {}", r.var_95, s.var_95);
        }
        assert!(r.var_99 + 1e-6 >= r.var_95);
        assert_eq!(r.dominant_habitat, habitat::CORAL_REEF);
    }

    #[test]
    fn simulation_is_reproducible() {
        let t = ReferenceTables::builtin();
        let a = site("a", habitat::CORAL_REEF, 1.0e6);
        let b = site("b", habitat::KELP_FOREST, 1.0e6);
        let s = settings(2000);
        let r1 = simulate(&t, &[&a, &b], StressType::Warming, Ssp::Ssp585, 2060, &s).unwrap();
        let r2 = simulate(&t, &[&a, &b], StressType::Warming, Ssp::Ssp585, 2060, &s).unwrap();
        assert_eq!(r1, r2);
    }

    #[test]
    fn oversized_horizon_is_invalid_not_a_panic() {
        let t = ReferenceTables::builtin();
        for years in [2_147_483_000, u32::MAX] {
            let req = ScenarioRequest::new(ScenarioType::Shock, &["a"]).with_horizon(years);
            assert!(matches!(stress_inputs(&t, &req), Err(ScenarioError::InvalidRequest(_))));
        }
        let req = ScenarioRequest::new(ScenarioType::Shock, &["a"]).with_horizon(30);
        assert_eq!(stress_inputs(&t, &req).unwrap().2, t.baseline_year + 30);
    }

    #[test]
    fn unsupported_habitat_fails_lookup() {
        let t = ReferenceTables::builtin();
        let a = site("a", habitat::SALT_MARSH, 1.0e6);
        assert!(matches!(
            simulate(&t, &[&a], StressType::Compound, Ssp::Ssp245, 2050, &settings(100)),
            Err(ScenarioError::Lookup(_))
        ));
    }
}
