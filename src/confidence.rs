//! Confidence penalty framework.
//!
//! Each scenario type starts from a base confidence; named penalties are
//! subtracted additively and the result is floored. The adjusted value never
//! exceeds the base.

use crate::model::{ConfidencePenalty, ScenarioType, Ssp};

#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceCoefficients {
    pub base_counterfactual: f64,
    pub base_climate: f64,
    pub base_tipping_point: f64,
    pub base_stress: f64,
    pub base_intervention: f64,
    pub base_market: f64,
    /// Penalty per decade beyond the baseline year
    pub temporal_per_decade: f64,
    pub temporal_cap: f64,
    pub ssp126: f64,
    pub ssp245: f64,
    pub ssp585: f64,
    pub threshold_proximity: f64,
    /// Headroom (fraction above the nearest lower threshold) below which the
    /// threshold-proximity penalty applies
    pub threshold_headroom_trigger: f64,
    pub missing_site_calibration: f64,
    pub floor: f64,
}

impl Default for ConfidenceCoefficients {
    fn default() -> Self {
        Self {
            base_counterfactual: 0.85,
            base_climate: 0.85,
            base_tipping_point: 0.80,
            base_stress: 0.80,
            base_intervention: 0.75,
            base_market: 0.80,
            temporal_per_decade: 0.10,
            temporal_cap: 0.40,
            ssp126: 0.05,
            ssp245: 0.10,
            ssp585: 0.15,
            threshold_proximity: 0.10,
            threshold_headroom_trigger: 0.20,
            missing_site_calibration: 0.15,
            floor: 0.10,
        }
    }
}

impl ConfidenceCoefficients {
    pub fn base_for(&self, scenario_type: ScenarioType) -> f64 {
        match scenario_type {
            ScenarioType::Counterfactual => self.base_counterfactual,
            ScenarioType::Climate => self.base_climate,
            ScenarioType::TippingPoint => self.base_tipping_point,
            ScenarioType::Shock | ScenarioType::Portfolio => self.base_stress,
            ScenarioType::Intervention => self.base_intervention,
            ScenarioType::Market => self.base_market,
        }
    }

    pub fn ssp_penalty(&self, ssp: Ssp) -> f64 {
        match ssp {
            Ssp::Ssp126 => self.ssp126,
            Ssp::Ssp245 => self.ssp245,
            Ssp::Ssp585 => self.ssp585,
        }
    }
}

/// Named penalties understood by the framework.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Penalty {
    /// Years projected beyond the baseline year
    TemporalExtrapolation { years: f64 },
    SspUncertainty(Ssp),
    ThresholdProximity,
    MissingSiteCalibration,
}

impl Penalty {
    pub fn reason(&self) -> String {
        match self {
            Self::TemporalExtrapolation { years } => {
                format!("temporal_extrapolation: {:.0} years beyond baseline", years)
            }
            Self::SspUncertainty(ssp) => format!("ssp_uncertainty: {}", ssp),
            Self::ThresholdProximity => {
                "threshold_proximity: within buffer of an ecological threshold".to_string()
            }
            Self::MissingSiteCalibration => {
                "missing_site_calibration: generic reversion model used".to_string()
            }
        }
    }

    /// Magnitude of the penalty (positive).
    pub fn magnitude(&self, c: &ConfidenceCoefficients) -> f64 {
        match self {
            Self::TemporalExtrapolation { years } => {
                (c.temporal_per_decade * years.max(0.0) / 10.0).min(c.temporal_cap)
            }
            Self::SspUncertainty(ssp) => c.ssp_penalty(*ssp),
            Self::ThresholdProximity => c.threshold_proximity,
            Self::MissingSiteCalibration => c.missing_site_calibration,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceAssessment {
    pub base: f64,
    pub adjusted: f64,
    pub penalties: Vec<ConfidencePenalty>,
}

/// Applies `penalties` to the scenario type's base confidence.
pub fn assess(
    coefficients: &ConfidenceCoefficients,
    scenario_type: ScenarioType,
    penalties: &[Penalty],
) -> ConfidenceAssessment {
    let base = coefficients.base_for(scenario_type);
    let mut applied = Vec::with_capacity(penalties.len());
    let mut total = 0.0;
    for p in penalties {
        let m = p.magnitude(coefficients);
        if m <= 0.0 {
            continue;
        }
        total += m;
        applied.push(ConfidencePenalty {
            reason: p.reason(),
            penalty: -m,
        });
    }
    let floor = coefficients.floor.min(base);
    let adjusted = (base - total).max(floor).min(base);
    ConfidenceAssessment {
        base,
        adjusted,
        penalties: applied,
    }
}
