//! Immutable reference tables.
//!
//! Built once at process start (`ReferenceTables::builtin`, optionally
//! adjusted by `config::Root::apply_to`) and then shared by `&` reference
//! into every engine call. Nothing here is mutated while engines run.

use anyhow::{bail, Result};
use std::collections::BTreeMap;

use crate::confidence::ConfidenceCoefficients;
use crate::counterfactual::{default_site_models, ReversionModel};
use crate::error::LookupError;
use crate::model::Ssp;

/// Year at which every habitat is taken to have lost 0% of its extent.
pub const BASELINE_YEAR: i32 = 2025;

pub mod habitat {
    pub const CORAL_REEF: &str = "coral_reef";
    pub const KELP_FOREST: &str = "kelp_forest";
    pub const SEAGRASS_MEADOW: &str = "seagrass_meadow";
    pub const MANGROVE_FOREST: &str = "mangrove_forest";
    pub const SALT_MARSH: &str = "salt_marsh";

    /// Habitats that can issue blue-carbon credits, in preference order.
    pub const BLUE_CARBON_ELIGIBLE: [&str; 3] = [MANGROVE_FOREST, SEAGRASS_MEADOW, SALT_MARSH];
}

pub mod service {
    pub const TOURISM: &str = "tourism";
    pub const FISHERIES: &str = "fisheries";
    pub const COASTAL_PROTECTION: &str = "coastal_protection";
    pub const CARBON_SEQUESTRATION: &str = "carbon_sequestration";
    pub const RECREATION: &str = "recreation";
    pub const WATER_QUALITY: &str = "water_quality";
}

// ============================================================================
// Empirical retention constants (counterfactual models)
// ============================================================================

/// Uniform retention used when no site-specific reversion model exists.
pub const GENERIC_FALLBACK_RETENTION: f64 = 0.40;

/// Reef-structure services that persist after fish biomass reverts.
pub const BIOMASS_REVERSION_COASTAL_RETENTION: f64 = 0.60;
pub const BIOMASS_REVERSION_CARBON_RETENTION: f64 = 0.80;

/// Per-service retention after complete habitat loss.
pub const FULL_LOSS_FISHERIES_RETENTION: f64 = 0.30;
pub const FULL_LOSS_TOURISM_RETENTION: f64 = 0.10;
pub const FULL_LOSS_RECREATION_RETENTION: f64 = 0.10;
pub const FULL_LOSS_COASTAL_RETENTION: f64 = 0.0;
pub const FULL_LOSS_CARBON_RETENTION: f64 = 0.0;
pub const FULL_LOSS_OTHER_RETENTION: f64 = 0.15;

/// Counterfactual starting level for real-options paths, as a share of ESV.
pub const REAL_OPTIONS_COUNTERFACTUAL_RETENTION: f64 = 0.40;

/// Share of sequestration that verification bodies typically issue as credits.
pub const DEFAULT_VERIFIED_FRACTION: f64 = 0.60;

// ============================================================================
// Table entry types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DegradationRange {
    pub low: f64,
    pub high: f64,
}

impl DegradationRange {
    pub const NONE: DegradationRange = DegradationRange { low: 0.0, high: 0.0 };

    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn midpoint(&self) -> f64 {
        0.5 * (self.low + self.high)
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }
}

/// Degradation range reached by a given year.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DegradationAnchor {
    pub year: i32,
    pub range: DegradationRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BiomassThreshold {
    pub name: &'static str,
    pub label: &'static str,
    pub kg_ha: f64,
    pub reef_function: f64,
}

/// Retained-service fraction at the four interior habitat breakpoints
/// (0.90, 0.65, 0.30 and 0.05 retained habitat).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceSensitivity {
    pub warning: f64,
    pub mmsy_upper: f64,
    pub mmsy_lower: f64,
    pub collapse: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequestrationRate {
    /// tCO2 per hectare per year
    pub low: f64,
    pub high: f64,
}

impl SequestrationRate {
    pub fn mid(&self) -> f64 {
        0.5 * (self.low + self.high)
    }
}

// ============================================================================
// Tables
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReferenceTables {
    pub baseline_year: i32,
    /// habitat → SSP → anchors sorted by year
    pub degradation: BTreeMap<String, BTreeMap<Ssp, Vec<DegradationAnchor>>>,
    /// SSP → (year, °C above the baseline year) anchors
    pub warming: BTreeMap<Ssp, Vec<(i32, f64)>>,
    /// Ascending by biomass
    pub biomass_thresholds: Vec<BiomassThreshold>,
    pub reef_function_floor: f64,
    /// Reef fish biomass before protection (kg/ha)
    pub historical_reef_biomass_kg_ha: f64,
    pub service_sensitivity: BTreeMap<String, ServiceSensitivity>,
    /// USD per tCO2e
    pub carbon_prices: BTreeMap<String, f64>,
    pub default_price_scenario: String,
    /// Keyed by site id (overrides) or habitat
    pub sequestration: BTreeMap<String, SequestrationRate>,
    /// Keyed by the lexicographically ordered habitat pair
    pub habitat_correlation: BTreeMap<(String, String), f64>,
    pub default_correlation: f64,
    /// Annual volatility by valuation method
    pub method_volatility: BTreeMap<String, f64>,
    pub default_volatility: f64,
    /// Site id → counterfactual reversion model
    pub counterfactual_models: BTreeMap<String, ReversionModel>,
    pub confidence: ConfidenceCoefficients,
}

impl Default for ReferenceTables {
    fn default() -> Self {
        Self::builtin()
    }
}

fn anchors(a2050: (f64, f64), a2100: (f64, f64)) -> Vec<DegradationAnchor> {
    vec![
        DegradationAnchor { year: 2050, range: DegradationRange::new(a2050.0, a2050.1) },
        DegradationAnchor { year: 2100, range: DegradationRange::new(a2100.0, a2100.1) },
    ]
}

fn threshold(
    name: &'static str,
    label: &'static str,
    kg_ha: f64,
    reef_function: f64,
) -> BiomassThreshold {
    BiomassThreshold { name, label, kg_ha, reef_function }
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl ReferenceTables {
    pub fn builtin() -> Self {
        use habitat::*;
        use service::*;

        let mut degradation = BTreeMap::new();
        let pathways: [(&str, [((f64, f64), (f64, f64)); 3]); 4] = [
            (
                CORAL_REEF,
                [
                    ((0.40, 0.60), (0.70, 0.90)),
                    ((0.50, 0.70), (0.90, 0.99)),
                    ((0.70, 0.90), (0.99, 1.00)),
                ],
            ),
            (
                KELP_FOREST,
                [
                    ((0.10, 0.20), (0.15, 0.30)),
                    ((0.15, 0.30), (0.30, 0.50)),
                    ((0.25, 0.40), (0.50, 0.80)),
                ],
            ),
            (
                SEAGRASS_MEADOW,
                [
                    ((0.05, 0.15), (0.10, 0.25)),
                    ((0.10, 0.25), (0.20, 0.40)),
                    ((0.15, 0.35), (0.35, 0.60)),
                ],
            ),
            (
                MANGROVE_FOREST,
                [
                    ((0.03, 0.10), (0.05, 0.15)),
                    ((0.05, 0.15), (0.10, 0.30)),
                    ((0.10, 0.25), (0.30, 0.50)),
                ],
            ),
        ];
        for (hab, per_ssp) in pathways {
            let mut by_ssp = BTreeMap::new();
            for (ssp, (a2050, a2100)) in Ssp::ALL.iter().zip(per_ssp) {
                by_ssp.insert(*ssp, anchors(a2050, a2100));
            }
            degradation.insert(hab.to_string(), by_ssp);
        }

        let warming = BTreeMap::from([
            (Ssp::Ssp126, vec![(2050, 0.5), (2100, 0.8)]),
            (Ssp::Ssp245, vec![(2050, 0.8), (2100, 1.6)]),
            (Ssp::Ssp585, vec![(2050, 1.1), (2100, 3.2)]),
        ]);

        let biomass_thresholds = vec![
            threshold("collapse", "collapse threshold", 150.0, 0.05),
            threshold("mmsy_lower", "MMSY lower bound", 300.0, 0.30),
            threshold("mmsy_upper", "MMSY upper bound", 600.0, 0.65),
            threshold("warning", "warning threshold", 1130.0, 0.90),
            threshold("pristine", "pristine reference", 1500.0, 0.99),
        ];

        let sens = |warning, mmsy_upper, mmsy_lower, collapse| ServiceSensitivity {
            warning,
            mmsy_upper,
            mmsy_lower,
            collapse,
        };
        let service_sensitivity = BTreeMap::from([
            (TOURISM.to_string(), sens(0.85, 0.55, 0.20, 0.02)),
            (FISHERIES.to_string(), sens(0.92, 0.70, 0.30, 0.05)),
            (COASTAL_PROTECTION.to_string(), sens(0.97, 0.80, 0.45, 0.10)),
            (CARBON_SEQUESTRATION.to_string(), sens(0.90, 0.65, 0.30, 0.05)),
            (RECREATION.to_string(), sens(0.88, 0.60, 0.25, 0.03)),
            (WATER_QUALITY.to_string(), sens(0.95, 0.75, 0.40, 0.08)),
        ]);

        let carbon_prices = BTreeMap::from([
            ("conservative".to_string(), 15.0),
            ("market".to_string(), 25.0),
            ("premium".to_string(), 45.0),
            ("high_integrity".to_string(), 65.0),
        ]);

        let sequestration = BTreeMap::from([
            (MANGROVE_FOREST.to_string(), SequestrationRate { low: 6.0, high: 8.0 }),
            (SEAGRASS_MEADOW.to_string(), SequestrationRate { low: 1.5, high: 4.4 }),
            (SALT_MARSH.to_string(), SequestrationRate { low: 2.4, high: 8.0 }),
        ]);

        let habitat_correlation = BTreeMap::from([
            (pair_key(CORAL_REEF, CORAL_REEF), 0.70),
            (pair_key(KELP_FOREST, KELP_FOREST), 0.60),
            (pair_key(SEAGRASS_MEADOW, SEAGRASS_MEADOW), 0.60),
            (pair_key(MANGROVE_FOREST, MANGROVE_FOREST), 0.55),
            (pair_key(CORAL_REEF, SEAGRASS_MEADOW), 0.45),
            (pair_key(CORAL_REEF, MANGROVE_FOREST), 0.35),
            (pair_key(SEAGRASS_MEADOW, MANGROVE_FOREST), 0.50),
            (pair_key(KELP_FOREST, SEAGRASS_MEADOW), 0.30),
        ]);

        let method_volatility = BTreeMap::from([
            ("market_price".to_string(), 0.15),
            ("avoided_cost".to_string(), 0.12),
            ("replacement_cost".to_string(), 0.12),
            ("travel_cost".to_string(), 0.20),
            ("benefit_transfer".to_string(), 0.25),
            ("contingent_valuation".to_string(), 0.30),
        ]);

        Self {
            baseline_year: BASELINE_YEAR,
            degradation,
            warming,
            biomass_thresholds,
            reef_function_floor: 0.01,
            historical_reef_biomass_kg_ha: 200.0,
            service_sensitivity,
            carbon_prices,
            default_price_scenario: "conservative".to_string(),
            sequestration,
            habitat_correlation,
            default_correlation: 0.20,
            method_volatility,
            default_volatility: 0.20,
            counterfactual_models: default_site_models(),
            confidence: ConfidenceCoefficients::default(),
        }
    }

    pub fn anchors_for(
        &self,
        ssp: Ssp,
        habitat: &str,
    ) -> Result<&[DegradationAnchor], LookupError> {
        let by_ssp = self
            .degradation
            .get(habitat)
            .ok_or_else(|| LookupError::UnknownHabitat(habitat.to_string()))?;
        by_ssp
            .get(&ssp)
            .map(Vec::as_slice)
            .ok_or_else(|| LookupError::UnknownPathway {
                habitat: habitat.to_string(),
                ssp: ssp.label().to_string(),
            })
    }

    pub fn correlation(&self, a: &str, b: &str) -> f64 {
        self.habitat_correlation
            .get(&pair_key(a, b))
            .copied()
            .unwrap_or(self.default_correlation)
    }

    pub fn carbon_price(&self, scenario: &str) -> Result<f64, LookupError> {
        self.carbon_prices
            .get(scenario)
            .copied()
            .ok_or_else(|| LookupError::UnknownPriceScenario(scenario.to_string()))
    }

    /// Site-specific override first, then the habitat rate.
    pub fn sequestration_for(&self, site_id: &str, habitat: &str) -> Option<SequestrationRate> {
        self.sequestration
            .get(site_id)
            .or_else(|| self.sequestration.get(habitat))
            .copied()
    }

    pub fn volatility_for(&self, valuation_method: &str) -> f64 {
        self.method_volatility
            .get(valuation_method)
            .copied()
            .unwrap_or(self.default_volatility)
    }

    /// Internal-consistency checks run once after loading.
    pub fn validate(&self) -> Result<()> {
        for (hab, by_ssp) in &self.degradation {
            for (ssp, anchors) in by_ssp {
                if anchors.is_empty() {
                    bail!("degradation anchors for {} under {} are empty", hab, ssp);
                }
                let mut prev_year = self.baseline_year;
                for a in anchors {
                    if a.year <= prev_year {
                        bail!(
                            "degradation anchors for {} under {} must ascend after {}",
                            hab,
                            ssp,
                            self.baseline_year
                        );
                    }
                    if !(0.0..=1.0).contains(&a.range.low)
                        || !(0.0..=1.0).contains(&a.range.high)
                        || a.range.low > a.range.high
                    {
                        bail!(
                            "degradation range for {} under {} at {} is not 0 <= low <= high <= 1",
                            hab,
                            ssp,
                            a.year
                        );
                    }
                    prev_year = a.year;
                }
            }
        }

        for w in self.biomass_thresholds.windows(2) {
            if w[1].kg_ha <= w[0].kg_ha || w[1].reef_function <= w[0].reef_function {
                bail!(
                    "biomass thresholds must ascend in biomass and reef function ({} -> {})",
                    w[0].name,
                    w[1].name
                );
            }
        }
        if let Some(first) = self.biomass_thresholds.first() {
            let floor = self.reef_function_floor;
            if !(0.0 < floor && floor <= first.reef_function) {
                bail!("reef_function_floor must be in (0, {}]", first.reef_function);
            }
        } else {
            bail!("at least one biomass threshold is required");
        }

        for (svc, s) in &self.service_sensitivity {
            let pts = [1.0, s.warning, s.mmsy_upper, s.mmsy_lower, s.collapse, 0.0];
            if pts.windows(2).any(|w| w[1] > w[0]) {
                bail!(
                    "service sensitivity for {} must be non-increasing from warning to collapse",
                    svc
                );
            }
        }

        for (name, price) in &self.carbon_prices {
            if *price < 0.0 {
                bail!("carbon price scenario {} must be non-negative", name);
            }
        }
        if !self.carbon_prices.contains_key(&self.default_price_scenario) {
            bail!("default carbon price scenario '{}' is not defined", self.default_price_scenario);
        }
        for (key, rate) in &self.sequestration {
            if rate.low < 0.0 || rate.low > rate.high {
                bail!("sequestration rate for {} must satisfy 0 <= low <= high", key);
            }
        }
        for ((a, b), rho) in &self.habitat_correlation {
            if !(-1.0..=1.0).contains(rho) {
                bail!("correlation {}/{} must be in [-1, 1]", a, b);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tables_are_consistent() {
        ReferenceTables::builtin().validate().unwrap();
    }

    #[test]
    fn correlation_is_symmetric_with_default() {
        let t = ReferenceTables::builtin();
        assert_eq!(
            t.correlation(habitat::CORAL_REEF, habitat::MANGROVE_FOREST),
            t.correlation(habitat::MANGROVE_FOREST, habitat::CORAL_REEF)
        );
        assert_eq!(t.correlation(habitat::KELP_FOREST, habitat::MANGROVE_FOREST), 0.20);
    }

    #[test]
    fn unknown_habitat_is_a_lookup_error() {
        let t = ReferenceTables::builtin();
        assert_eq!(
            t.anchors_for(Ssp::Ssp245, "tundra").unwrap_err(),
            LookupError::UnknownHabitat("tundra".into())
        );
    }

    #[test]
    fn site_sequestration_override_wins() {
        let mut t = ReferenceTables::builtin();
        t.sequestration.insert("sundarbans".into(), SequestrationRate { low: 7.0, high: 9.0 });
        let rate = t.sequestration_for("sundarbans", habitat::MANGROVE_FOREST).unwrap();
        assert_eq!(rate.low, 7.0);
        let rate = t.sequestration_for("elsewhere", habitat::MANGROVE_FOREST).unwrap();
        assert_eq!(rate.low, 6.0);
    }

    #[test]
    fn non_monotone_sensitivity_is_rejected() {
        let mut t = ReferenceTables::builtin();
        t.service_sensitivity.insert(
            "odd".into(),
            ServiceSensitivity { warning: 0.5, mmsy_upper: 0.7, mmsy_lower: 0.2, collapse: 0.1 },
        );
        assert!(t.validate().is_err());
    }
}
