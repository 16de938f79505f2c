//! Crate-level test suite for the scenario engines
//!
//! Includes:
//! - End-to-end dispatch of every scenario type over the bundled registry
//! - Property tests for ordering, bounds and determinism
//! - Regression tests for reference cases
//! - Edge cases that must fail closed

use approx::assert_relative_eq;
use std::time::{Duration, Instant};

use crate::cache::MemoryCache;
use crate::config;
use crate::counterfactual::ReversionModel;
use crate::model::{
    ScenarioRequest, ScenarioResponse, ScenarioType, ScenarioValidity, Ssp, MAX_TIME_HORIZON_YEARS,
};
use crate::reference::{habitat, service, ReferenceTables};
use crate::sites::{SiteData, SiteRegistry};
use crate::stress::{self, StressType};
use crate::{ScenarioEngine, SimulationSettings};

const REGISTRY: &str = include_str!("../data/sites.toml");
const CONFIG: &str = include_str!("../config/engine.toml");

fn registry() -> SiteRegistry {
    SiteRegistry::from_toml_str(REGISTRY).unwrap()
}

/// Fewer draws than production keeps the suite fast.
fn settings() -> SimulationSettings {
    SimulationSettings { n_simulations: 2_000, ..SimulationSettings::default() }
}

fn run(tables: &ReferenceTables, sites: &SiteRegistry, req: &ScenarioRequest) -> ScenarioResponse {
    ScenarioEngine::new(tables, sites, settings()).run(req)
}

fn assert_well_formed(resp: &ScenarioResponse) {
    assert!(!resp.is_fail_closed(), "unexpected fail-closed: {}", resp.answer);
    assert!(resp.total_delta().is_some(), "missing total_esv delta");
    assert!(resp.baseline_total().is_some() && resp.scenario_total().is_some());
    for d in &resp.deltas {
        assert_eq!(d.absolute_change, d.scenario_value - d.baseline_value);
    }
    let u = &resp.uncertainty;
    assert!(u.p5 <= u.p50 && u.p50 <= u.p95, "{:?}", u);
    assert!(resp.confidence >= 0.10 && resp.confidence <= 0.85);
    for step in &resp.propagation_trace {
        if !step.axiom_id.starts_with(crate::model::OBSERVATION_PREFIX) {
            assert!(resp.axioms_used.contains(&step.axiom_id));
        }
    }
    assert!(!resp.answer.is_empty());
}

// =============================================================================
// Basic Functionality Tests
// =============================================================================

#[test]
fn test_bundled_registry_and_config_load() {
    let sites = registry();
    assert_eq!(sites.len(), 9);
    assert!(sites.sites().iter().all(|s| s.total_esv() > 0.0));

    let cfg = config::Root::from_toml_str(CONFIG).unwrap();
    let tables = cfg.tables().unwrap();
    assert_eq!(tables.default_price_scenario, "conservative");
    assert_eq!(cfg.settings(), SimulationSettings::default());
    assert_eq!(cfg.cache.as_ref().map(|c| c.capacity), Some(256));
}

#[test]
fn test_every_scenario_type_dispatches() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    let requests = vec![
        ScenarioRequest::new(ScenarioType::Counterfactual, &["cabo_pulmo"]),
        ScenarioRequest::climate("ningaloo", "SSP1-2.6", 2040),
        ScenarioRequest::new(ScenarioType::TippingPoint, &["Cabo Pulmo"]),
        ScenarioRequest::new(ScenarioType::Shock, &["sundarbans"])
            .with_assumption("stress_type", "storm"),
        ScenarioRequest::new(
            ScenarioType::Portfolio,
            &["cabo_pulmo", "shark_bay", "channel_islands"],
        )
        .with_horizon(25),
        ScenarioRequest::new(ScenarioType::Intervention, &["tubbataha"])
            .with_horizon(15)
            .with_assumption("investment_usd", 5_000_000.0),
        ScenarioRequest::new(ScenarioType::Market, &["sundarbans"]),
    ];
    for req in &requests {
        let resp = run(&tables, &sites, req);
        assert_well_formed(&resp);
        assert_eq!(&resp.request, req);
    }
}

#[test]
fn test_climate_response_carries_observation_step() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    let resp = run(&tables, &sites, &ScenarioRequest::climate("cabo_pulmo", "SSP2-4.5", 2050));
    assert_well_formed(&resp);
    assert_relative_eq!(resp.scenario_case["habitat_loss_low"], 0.50, epsilon = 1e-12);
    assert_relative_eq!(resp.scenario_case["habitat_loss_high"], 0.70, epsilon = 1e-12);
    assert_relative_eq!(resp.scenario_case["sea_surface_temperature_2050"], 27.3, epsilon = 1e-9);
    assert!(!resp.axioms_used.iter().any(|a| a.contains("environmental_baseline")));
    assert_eq!(resp.uncertainty.n_simulations, 2_000);
}

// =============================================================================
// Property-Based Tests
// =============================================================================

#[test]
fn test_counterfactual_always_loses_value() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    for site in sites.sites() {
        let req = ScenarioRequest::new(ScenarioType::Counterfactual, &[site.id.as_str()]);
        let resp = run(&tables, &sites, &req);
        assert_well_formed(&resp);
        let total = resp.total_delta().unwrap();
        assert!(
            total.scenario_value < total.baseline_value,
            "{}: {} !< {}",
            site.id,
            total.scenario_value,
            total.baseline_value
        );
    }
}

#[test]
fn test_ssp_ordering_of_projected_value() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    for site in sites.sites() {
        for year in [2030, 2050, 2075, 2100] {
            let totals: Vec<f64> = Ssp::ALL
                .iter()
                .map(|ssp| {
                    let req = ScenarioRequest::climate(&site.id, ssp.label(), year);
                    let resp = run(&tables, &sites, &req);
                    resp.scenario_total().unwrap()
                })
                .collect();
            assert!(
                totals[0] >= totals[1] && totals[1] >= totals[2],
                "{} {}: {:?}",
                site.id,
                year,
                totals
            );
        }
    }
}

#[test]
fn test_identical_requests_are_bit_identical() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    let scope = ["cabo_pulmo", "raja_ampat", "rufiji_delta"];
    let req = ScenarioRequest::new(ScenarioType::Portfolio, &scope)
        .with_assumption("ssp_scenario", "SSP5-8.5");
    let a = run(&tables, &sites, &req);
    let b = run(&tables, &sites, &req);
    assert_eq!(a.uncertainty.p5.to_bits(), b.uncertainty.p5.to_bits());
    assert_eq!(a.uncertainty.p95.to_bits(), b.uncertainty.p95.to_bits());
    assert_eq!(a, b);
}

#[test]
fn test_cached_response_equals_uncached() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    let cache = MemoryCache::new(16, None);
    let cached = ScenarioEngine::new(&tables, &sites, settings()).with_cache(&cache);
    let req = ScenarioRequest::climate("channel_islands", "SSP5-8.5", 2080);
    let first = cached.run(&req);
    let second = cached.run(&req);
    let uncached = run(&tables, &sites, &req);
    assert_eq!(first, uncached);
    assert_eq!(second, uncached);
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_shared_cache_keeps_engines_apart() {
    let base = ReferenceTables::builtin();
    let mut repriced = ReferenceTables::builtin();
    repriced.carbon_prices.insert("conservative".into(), 65.0);
    let sites = registry();
    let cache = MemoryCache::new(16, None);
    let a = ScenarioEngine::new(&base, &sites, settings()).with_cache(&cache);
    let b = ScenarioEngine::new(&repriced, &sites, settings()).with_cache(&cache);
    let req = ScenarioRequest::new(ScenarioType::Market, &["sundarbans"]);

    let from_a = a.run(&req);
    let from_b = b.run(&req);
    assert_well_formed(&from_a);
    assert_eq!(from_a, run(&base, &sites, &req));
    assert_eq!(from_b, run(&repriced, &sites, &req));
    assert!(
        from_b.scenario_case["carbon_revenue_usd"] > from_a.scenario_case["carbon_revenue_usd"]
    );
    assert_eq!(cache.len(), 2);
    assert_eq!(a.run(&req), from_a);
    assert_eq!(b.run(&req), from_b);
}

#[test]
fn test_nine_site_portfolio_fits_time_budget() {
    let tables = ReferenceTables::builtin();
    let reg = registry();
    let sites: Vec<&SiteData> = reg.sites().iter().collect();
    assert_eq!(sites.len(), 9);
    let defaults = SimulationSettings::default();
    assert_eq!(defaults.draws(), 10_000);

    let start = Instant::now();
    let r = stress::simulate(&tables, &sites, StressType::Compound, Ssp::Ssp585, 2100, &defaults)
        .unwrap();
    let elapsed = start.elapsed();
    assert_eq!(r.n_simulations, 10_000);
    assert_eq!(r.sites.len(), 9);
    assert!(elapsed < Duration::from_secs(5), "9-site portfolio took {:?}", elapsed);
}

#[test]
fn test_portfolio_var_dominates_site_var() {
    let tables = ReferenceTables::builtin();
    let reg = registry();
    let ids = ["cabo_pulmo", "ningaloo", "sundarbans", "shark_bay", "channel_islands"];
    let sites: Vec<&SiteData> = ids.iter().map(|id| reg.resolve(id).unwrap()).collect();
    for stress_type in [StressType::Warming, StressType::Storm, StressType::Compound] {
        let r = stress::simulate(&tables, &sites, stress_type, Ssp::Ssp585, 2060, &settings())
            .unwrap();
        let max_site = r.sites.iter().map(|s| s.var_95).fold(0.0, f64::max);
        assert!(r.var_95 + 1e-6 >= max_site, "{}: {} < {}", stress_type, r.var_95, max_site);
    }
}

#[test]
fn test_validity_degrades_with_horizon() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    let validity = |year| {
        let req = ScenarioRequest::climate("ningaloo", "SSP2-4.5", year);
        run(&tables, &sites, &req).scenario_validity
    };
    assert_eq!(validity(2060), ScenarioValidity::InDomain);
    assert_eq!(validity(2110), ScenarioValidity::PartiallyOutOfDomain);
    assert_eq!(validity(2150), ScenarioValidity::OutOfDomain);
}

// =============================================================================
// Regression Tests
// =============================================================================

#[test]
fn test_regression_cabo_pulmo_counterfactual() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    let req = ScenarioRequest::new(ScenarioType::Counterfactual, &["Cabo Pulmo"]);
    let resp = run(&tables, &sites, &req);
    let total = resp.total_delta().unwrap();
    assert_relative_eq!(total.baseline_value, 29_270_000.0, epsilon = 1e-3);
    assert!((-26e6..=-18e6).contains(&total.absolute_change), "{}", total.absolute_change);
    assert!((3e6..=12e6).contains(&total.scenario_value), "{}", total.scenario_value);
    assert_eq!(resp.scenario_validity, ScenarioValidity::InDomain);
    assert_relative_eq!(resp.confidence, 0.85);
    assert!(resp.tipping_point_proximity.is_some());
    assert!(resp.axioms_used.iter().any(|a| a == "reef_biomass_function"));
}

#[test]
fn test_regression_generic_fallback_penalty() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    assert_eq!(ReversionModel::for_site(&tables, "ningaloo"), ReversionModel::GenericFallback);
    let req = ScenarioRequest::new(ScenarioType::Counterfactual, &["ningaloo"]);
    let resp = run(&tables, &sites, &req);
    let total = resp.total_delta().unwrap();
    assert_relative_eq!(total.scenario_value, 0.40 * total.baseline_value, max_relative = 1e-12);
    assert_relative_eq!(resp.confidence, 0.70, epsilon = 1e-12);
    assert_eq!(resp.scenario_validity, ScenarioValidity::PartiallyOutOfDomain);
    assert!(resp
        .confidence_penalties
        .iter()
        .any(|p| p.reason.starts_with("missing_site_calibration")));
}

#[test]
fn test_regression_climate_confidence() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    let resp = run(&tables, &sites, &ScenarioRequest::climate("cabo_pulmo", "SSP2-4.5", 2050));
    // 0.85 - 0.25 temporal - 0.10 SSP2-4.5
    assert_relative_eq!(resp.confidence, 0.50, epsilon = 1e-12);
    let resp = run(&tables, &sites, &ScenarioRequest::climate("cabo_pulmo", "SSP5-8.5", 2100));
    // temporal capped at 0.40
    assert_relative_eq!(resp.confidence, 0.30, epsilon = 1e-12);
}

#[test]
fn test_regression_mangrove_blue_carbon() {
    let tables = ReferenceTables::builtin();
    let mut site = SiteData::new("mangrove_reserve", habitat::MANGROVE_FOREST)
        .with_service(service::COASTAL_PROTECTION, 1_000_000.0, "avoided_cost");
    site.habitat_areas_ha.insert(habitat::MANGROVE_FOREST.into(), 7_500.0);
    let sites = SiteRegistry::from_sites(vec![site]).unwrap();
    let resp = run(
        &tables,
        &sites,
        &ScenarioRequest::new(ScenarioType::Market, &["mangrove_reserve"])
            .with_assumption("verified_fraction", 0.6),
    );
    assert_well_formed(&resp);
    assert!(resp.uncertainty.p5 >= 405_000.0 - 1e-6);
    assert!(resp.uncertainty.p95 <= 540_000.0 + 1e-6);
    assert_relative_eq!(resp.scenario_case["carbon_revenue_usd"], 472_500.0, epsilon = 1e-6);
}

#[test]
fn test_regression_tipping_point_cabo_pulmo() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    let req = ScenarioRequest::new(ScenarioType::TippingPoint, &["cabo_pulmo"]);
    let resp = run(&tables, &sites, &req);
    assert_well_formed(&resp);
    assert_relative_eq!(resp.baseline_case["biomass_kg_ha"], 926.0, epsilon = 1e-9);
    assert_relative_eq!(resp.scenario_case["biomass_kg_ha"], 600.0);
    assert!(resp.tipping_point_proximity.as_deref().unwrap().contains("MMSY upper bound"));
    assert_relative_eq!(resp.confidence, 0.80);
}

// =============================================================================
// Edge Case Tests
// =============================================================================

#[test]
fn test_unknown_site_fails_closed() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    let types = [ScenarioType::Counterfactual, ScenarioType::TippingPoint, ScenarioType::Market];
    for scenario_type in types {
        let resp = run(&tables, &sites, &ScenarioRequest::new(scenario_type, &["atlantis"]));
        assert_eq!(resp.confidence, 0.0);
        assert_eq!(resp.scenario_validity, ScenarioValidity::OutOfDomain);
        assert!(resp.deltas.is_empty());
        assert!(resp.uncertainty.is_degenerate());
        assert!(resp.answer.to_lowercase().contains("insufficient evidence"));
    }
}

#[test]
fn test_malformed_requests_fail_closed() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    let cases = vec![
        ScenarioRequest::climate("cabo_pulmo", "SSP2-4.5", 2010),
        ScenarioRequest::climate("cabo_pulmo", "SSP3-7.0", 2050),
        ScenarioRequest::new(ScenarioType::Counterfactual, &[]),
        ScenarioRequest::new(ScenarioType::Counterfactual, &["cabo_pulmo"]).with_horizon(0),
        ScenarioRequest::new(ScenarioType::Intervention, &["cabo_pulmo"]),
        ScenarioRequest::new(ScenarioType::Shock, &["cabo_pulmo"])
            .with_assumption("stress_type", "meteor"),
    ];
    for req in &cases {
        let resp = run(&tables, &sites, req);
        assert!(resp.is_fail_closed(), "{:?} did not fail closed", req);
        assert!(resp.caveats.iter().any(|c| c.contains("invalid_request")), "{:?}", resp.caveats);
    }
}

#[test]
fn test_out_of_range_horizons_fail_closed() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    let cases = vec![
        ScenarioRequest::new(ScenarioType::Shock, &["cabo_pulmo"]).with_horizon(2_147_483_000),
        ScenarioRequest::new(ScenarioType::Portfolio, &["cabo_pulmo", "ningaloo"])
            .with_horizon(u32::MAX),
        ScenarioRequest::new(ScenarioType::Intervention, &["tubbataha"])
            .with_horizon(MAX_TIME_HORIZON_YEARS + 1)
            .with_assumption("investment_usd", 1.0e6),
        ScenarioRequest::new(ScenarioType::Counterfactual, &["cabo_pulmo"]).with_horizon(u32::MAX),
    ];
    for req in &cases {
        let resp = run(&tables, &sites, req);
        assert!(resp.is_fail_closed(), "{:?} did not fail closed", req);
        assert!(resp.caveats.iter().any(|c| c.contains("invalid_request")), "{:?}", resp.caveats);
    }

    let longest = ScenarioRequest::new(ScenarioType::Intervention, &["tubbataha"])
        .with_horizon(MAX_TIME_HORIZON_YEARS)
        .with_assumption("investment_usd", 1.0e6);
    assert_well_formed(&run(&tables, &sites, &longest));
}

#[test]
fn test_missing_evidence_fails_closed() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    let cases = vec![
        // tipping points are reef-only
        ScenarioRequest::new(ScenarioType::TippingPoint, &["shark_bay"]),
        // reef with no recovery ratio on record
        ScenarioRequest::new(ScenarioType::TippingPoint, &["ningaloo"]),
        // no blue-carbon habitat
        ScenarioRequest::new(ScenarioType::Market, &["ningaloo"]),
        // eligible secondary habitat with no mapped area
        ScenarioRequest::new(ScenarioType::Market, &["raja_ampat"]),
    ];
    for req in &cases {
        let resp = run(&tables, &sites, req);
        assert!(resp.is_fail_closed(), "{:?} did not fail closed", req);
        assert!(
            resp.caveats.iter().any(|c| c.contains("insufficient_evidence")),
            "{:?}",
            resp.caveats
        );
    }
}

#[test]
fn test_unsupported_habitat_is_lookup_failure() {
    let tables = ReferenceTables::builtin();
    let marsh = SiteData::new("marsh", habitat::SALT_MARSH)
        .with_service(service::FISHERIES, 1.0e6, "market_price");
    let sites = SiteRegistry::from_sites(vec![marsh]).unwrap();
    let resp = run(&tables, &sites, &ScenarioRequest::climate("marsh", "SSP2-4.5", 2050));
    assert!(resp.is_fail_closed());
    assert!(resp.caveats.iter().any(|c| c.contains("reference_lookup")));
}

#[test]
fn test_zero_investment_has_no_bcr() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    let resp = run(
        &tables,
        &sites,
        &ScenarioRequest::new(ScenarioType::Intervention, &["hol_chan"])
            .with_assumption("investment_usd", 0.0),
    );
    assert_well_formed(&resp);
    assert!(!resp.scenario_case.contains_key("benefit_cost_ratio"));
    assert_eq!(resp.scenario_case["payback_year"], 0.0);
}

#[test]
fn test_baseline_year_climate_is_unchanged() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    let resp = run(&tables, &sites, &ScenarioRequest::climate("sundarbans", "SSP5-8.5", 2025));
    assert_well_formed(&resp);
    let total = resp.total_delta().unwrap();
    assert_eq!(total.absolute_change, 0.0);
    assert!(resp.uncertainty.is_degenerate());
}

#[test]
fn test_simulation_cap_adds_caveat() {
    let tables = ReferenceTables::builtin();
    let sites = registry();
    let s = SimulationSettings { n_simulations: 60_000, max_simulations: 1_000, seed: 42 };
    let req = ScenarioRequest::climate("ningaloo", "SSP2-4.5", 2050);
    let resp = ScenarioEngine::new(&tables, &sites, s).run(&req);
    assert_eq!(resp.uncertainty.n_simulations, 1_000);
    assert!(resp.caveats.iter().any(|c| c.contains("capped at 1000")));
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let cfg_dir = dir.path().join("config");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::create_dir_all(&cfg_dir).unwrap();
    std::fs::write(data_dir.join("sites.toml"), REGISTRY).unwrap();
    let cfg_path = cfg_dir.join("engine.toml");
    std::fs::write(&cfg_path, CONFIG).unwrap();

    let (cfg, text) = config::Root::load(&cfg_path).unwrap();
    assert_eq!(text, CONFIG);
    let registry_path = cfg.registry_path(&cfg_path).unwrap();
    let text = std::fs::read_to_string(registry_path).unwrap();
    let sites = SiteRegistry::from_toml_str(&text).unwrap();
    assert_eq!(sites.len(), 9);

    let broken = CONFIG.replace("n_simulations = 10000", "n_simulations = 0");
    std::fs::write(&cfg_path, broken).unwrap();
    assert!(config::Root::load(&cfg_path).is_err());
}
