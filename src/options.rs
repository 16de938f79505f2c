//! Real-options valuation of a conservation investment.
//!
//! The protected and counterfactual ESV streams each follow an independent
//! driftless geometric Brownian motion at the site's value-weighted
//! valuation-method volatility. Per path NPV is the discounted premium
//! (protected minus counterfactual) less the up-front investment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::climate::validity_for;
use crate::confidence::{self, Penalty};
use crate::engine::{EngineContext, SimulationSettings};
use crate::error::{Result, ScenarioError};
use crate::model::{
    axioms_in, fmt_usd, PropagationStep, ScenarioDelta, ScenarioRequest, ScenarioResponse,
    ScenarioUncertainty, MAX_TIME_HORIZON_YEARS, TOTAL_ESV_KEY,
};
use crate::reference::{ReferenceTables, REAL_OPTIONS_COUNTERFACTUAL_RETENTION};
use crate::sampling::{mean, percentile_sorted, sort_samples, Sampler};
use crate::sites::SiteData;

pub const DEFAULT_DISCOUNT_RATE: f64 = 0.04;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RealOptionsInput {
    /// Annual ESV with protection (USD/yr)
    pub protected_value: f64,
    /// Annual ESV without protection (USD/yr)
    pub counterfactual_value: f64,
    pub investment: f64,
    pub discount_rate: f64,
    pub horizon_years: u32,
    pub volatility: f64,
}

impl RealOptionsInput {
    pub fn validate(&self) -> Result<()> {
        let finite = [
            self.protected_value,
            self.counterfactual_value,
            self.investment,
            self.discount_rate,
            self.volatility,
        ];
        if finite.iter().any(|v| !v.is_finite()) {
            return Err(ScenarioError::invalid("real-options inputs must be finite"));
        }
        if self.investment < 0.0 {
            return Err(ScenarioError::invalid("investment_usd must be non-negative"));
        }
        if self.discount_rate <= -1.0 {
            return Err(ScenarioError::invalid("discount_rate must exceed -1"));
        }
        if self.horizon_years == 0 {
            return Err(ScenarioError::invalid("horizon must be at least one year"));
        }
        if self.horizon_years > MAX_TIME_HORIZON_YEARS {
            return Err(ScenarioError::invalid(format!(
                "horizon of {} years exceeds the maximum of {}",
                self.horizon_years, MAX_TIME_HORIZON_YEARS
            )));
        }
        if self.volatility < 0.0 {
            return Err(ScenarioError::invalid("volatility must be non-negative"));
        }
        Ok(())
    }

    fn discount(&self, year: u32) -> f64 {
        (1.0 + self.discount_rate).powf(f64::from(year)).recip()
    }

    fn premium(&self) -> f64 {
        self.protected_value - self.counterfactual_value
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealOptionsValuation {
    pub volatility: f64,
    pub static_npv: f64,
    pub expected_npv: f64,
    /// E[max(NPV, 0)] - max(static NPV, 0)
    pub option_value: f64,
    pub expanded_npv: f64,
    /// `None` when the investment is zero
    pub benefit_cost_ratio: Option<f64>,
    /// First year cumulative discounted premium covers the investment;
    /// horizon + 1 when it never does
    pub payback_year: u32,
    pub npv_p5: f64,
    pub npv_p50: f64,
    pub npv_p95: f64,
    pub probability_positive_npv: f64,
    pub n_simulations: usize,
}

/// Value-weighted volatility across a site's valuation methods.
pub fn blended_volatility(tables: &ReferenceTables, site: &SiteData) -> f64 {
    let total = site.total_esv();
    if total <= 0.0 {
        return tables.default_volatility;
    }
    site.services
        .iter()
        .map(|s| s.annual_value / total * tables.volatility_for(&s.valuation_method))
        .sum()
}

/// Deterministic NPV of the premium stream less the investment.
pub fn static_npv(input: &RealOptionsInput) -> f64 {
    let premium = input.premium();
    (1..=input.horizon_years).map(|t| premium * input.discount(t)).sum::<f64>() - input.investment
}

pub fn payback_year(input: &RealOptionsInput) -> u32 {
    if input.investment <= 0.0 {
        return 0;
    }
    let premium = input.premium();
    let mut cumulative = 0.0;
    for t in 1..=input.horizon_years {
        cumulative += premium * input.discount(t);
        if cumulative >= input.investment {
            return t;
        }
    }
    input.horizon_years + 1
}

pub fn value(
    input: &RealOptionsInput,
    settings: &SimulationSettings,
) -> Result<RealOptionsValuation> {
    input.validate()?;
    let n = settings.draws();
    let sigma = input.volatility;
    let drift = -0.5 * sigma * sigma;
    let discounts: Vec<f64> = (1..=input.horizon_years).map(|t| input.discount(t)).collect();

    let mut sampler = Sampler::new(settings.seed);
    let mut npvs = Vec::with_capacity(n);
    for _ in 0..n {
        let mut protected = input.protected_value;
        let mut counterfactual = input.counterfactual_value;
        let mut pv = 0.0;
        for d in &discounts {
            protected *= (drift + sigma * sampler.standard_normal()).exp();
            counterfactual *= (drift + sigma * sampler.standard_normal()).exp();
            pv += (protected - counterfactual) * d;
        }
        npvs.push(pv - input.investment);
    }

    let static_npv = static_npv(input);
    let expected_npv = mean(&npvs);
    let upside = npvs.iter().map(|v| v.max(0.0)).sum::<f64>() / n.max(1) as f64;
    let option_value = upside - static_npv.max(0.0);
    let positive = npvs.iter().filter(|v| **v > 0.0).count() as f64 / n.max(1) as f64;
    sort_samples(&mut npvs);

    let pv_premium = static_npv + input.investment;
    let benefit_cost_ratio = (input.investment > 0.0).then(|| pv_premium / input.investment);

    Ok(RealOptionsValuation {
        volatility: sigma,
        static_npv,
        expected_npv,
        option_value,
        expanded_npv: static_npv + option_value,
        benefit_cost_ratio,
        payback_year: payback_year(input),
        npv_p5: percentile_sorted(&npvs, 5.0),
        npv_p50: percentile_sorted(&npvs, 50.0),
        npv_p95: percentile_sorted(&npvs, 95.0),
        probability_positive_npv: positive,
        n_simulations: n,
    })
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
    let investment = request
        .assumption_f64("investment_usd")
        .ok_or_else(|| {
            ScenarioError::invalid("intervention scenario requires assumptions.investment_usd")
        })?;
    let retention = request
        .assumption_f64("counterfactual_retention")
        .unwrap_or(REAL_OPTIONS_COUNTERFACTUAL_RETENTION);
    if !(0.0..=1.0).contains(&retention) {
        return Err(ScenarioError::invalid("counterfactual_retention must lie in [0, 1]"));
    }

    let protected_value = site.total_esv();
    let input = RealOptionsInput {
        protected_value,
        counterfactual_value: protected_value * retention,
        investment,
        discount_rate: request.assumption_f64("discount_rate").unwrap_or(DEFAULT_DISCOUNT_RATE),
        horizon_years: request.time_horizon_years,
        volatility: blended_volatility(tables, site),
    };
    let v = value(&input, &ctx.settings)?;
    debug!(
        site = %site.id,
        static_npv = v.static_npv,
        option_value = v.option_value,
        "real options valued"
    );

    let mut trace = Vec::with_capacity(site.services.len() + 2);
    let mut baseline_case = BTreeMap::new();
    let mut scenario_case = BTreeMap::new();
    let mut deltas = Vec::with_capacity(site.services.len() + 1);
    for s in &site.services {
        let without = s.annual_value * retention;
        trace.push(
            PropagationStep::scaled(
                "counterfactual_retention",
                format!("{} without the intervention", s.service_type),
                (s.service_type.as_str(), s.annual_value),
                &format!("{}_without_intervention", s.service_type),
                retention,
            )
            .with_doi(s.source_doi.as_deref()),
        );
        *baseline_case.entry(s.service_type.clone()).or_insert(0.0) += without;
        *scenario_case.entry(s.service_type.clone()).or_insert(0.0) += s.annual_value;
        deltas.push(ScenarioDelta::usd(&s.service_type, without, s.annual_value));
    }
    trace.push(PropagationStep::new(
        "valuation_volatility",
        "Value-weighted volatility of the site's valuation methods",
        ("total_esv_usd", protected_value),
        ("volatility", v.volatility),
    ));
    trace.push(PropagationStep::new(
        "discounted_premium",
        format!(
            "Premium discounted at {:.1}% over {} years less investment",
            input.discount_rate * 100.0,
            input.horizon_years
        ),
        ("investment_usd", investment),
        ("static_npv_usd", v.static_npv),
    ));

    baseline_case.insert(TOTAL_ESV_KEY.to_string(), input.counterfactual_value);
    scenario_case.insert(TOTAL_ESV_KEY.to_string(), protected_value);
    scenario_case.insert("static_npv_usd".to_string(), v.static_npv);
    scenario_case.insert("expected_npv_usd".to_string(), v.expected_npv);
    scenario_case.insert("option_value_usd".to_string(), v.option_value);
    scenario_case.insert("expanded_npv_usd".to_string(), v.expanded_npv);
    scenario_case.insert("payback_year".to_string(), f64::from(v.payback_year));
    scenario_case.insert("probability_positive_npv".to_string(), v.probability_positive_npv);
    if let Some(bcr) = v.benefit_cost_ratio {
        scenario_case.insert("benefit_cost_ratio".to_string(), bcr);
    }
    deltas.push(ScenarioDelta::usd("total_esv", input.counterfactual_value, protected_value));

    let conf = confidence::assess(
        &tables.confidence,
        request.scenario_type,
        &[Penalty::TemporalExtrapolation { years: f64::from(input.horizon_years) }],
    );

    let bcr_text = match v.benefit_cost_ratio {
        Some(b) => format!("benefit-cost ratio {:.2}", b),
        None => "no up-front cost".to_string(),
    };
    let payback_text = if v.payback_year > input.horizon_years {
        format!("no payback within {} years", input.horizon_years)
    } else {
        format!("payback in year {}", v.payback_year)
    };
    let answer = format!(
        "Investing {} to protect {} yields a static NPV of {} over {} years ({}, {}). \
         Under valuation volatility of {:.0}%, the option value is {} and P(NPV > 0) is {:.0}%.",
        fmt_usd(investment),
        site.name,
        fmt_usd(v.static_npv),
        input.horizon_years,
        bcr_text,
        payback_text,
        v.volatility * 100.0,
        fmt_usd(v.option_value),
        v.probability_positive_npv * 100.0,
    );

    Ok(ScenarioResponse {
        request: request.clone(),
        baseline_case,
        scenario_case,
        deltas,
        axioms_used: axioms_in(&trace),
        propagation_trace: trace,
        uncertainty: ScenarioUncertainty {
            p5: v.npv_p5,
            p50: v.npv_p50,
            p95: v.npv_p95,
            dominant_driver: "valuation_volatility".to_string(),
            n_simulations: v.n_simulations,
        },
        confidence: conf.adjusted,
        confidence_penalties: conf.penalties,
        scenario_validity: validity_for(i64::from(input.horizon_years)),
        tipping_point_proximity: None,
        answer,
        caveats: vec![
            format!(
                "Without the intervention the site is assumed to retain {:.0}% of its value.",
                retention * 100.0
            ),
            "Protected and counterfactual streams are independent driftless GBMs.".to_string(),
        ],
    })
}
