//! Scenario dispatcher.
//!
//! Routes a validated request to the engine for its scenario type and turns
//! every engine failure into a fail-closed response. Engines never see
//! mutable shared state: reference tables and the site registry are borrowed
//! immutably for the whole call.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{context_digest, CacheKey, NoCache, SimulationCache};
use crate::error::Result;
use crate::model::{ScenarioRequest, ScenarioResponse, ScenarioType};
use crate::reference::ReferenceTables;
use crate::sites::SiteRegistry;
use crate::{blue_carbon, climate, counterfactual, options, stress, tipping};

pub const DEFAULT_N_SIMULATIONS: usize = 10_000;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_MAX_SIMULATIONS: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationSettings {
    pub n_simulations: usize,
    pub seed: u64,
    /// Upper bound applied to `n_simulations`
    pub max_simulations: usize,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            n_simulations: DEFAULT_N_SIMULATIONS,
            seed: DEFAULT_SEED,
            max_simulations: DEFAULT_MAX_SIMULATIONS,
        }
    }
}

impl SimulationSettings {
    /// Number of draws an engine actually performs.
    pub fn draws(&self) -> usize {
        self.n_simulations.min(self.max_simulations).max(1)
    }

    pub fn is_clamped(&self) -> bool {
        self.n_simulations > self.max_simulations
    }
}

/// Read-only inputs shared by every engine call.
#[derive(Debug, Clone, Copy)]
pub struct EngineContext<'a> {
    pub tables: &'a ReferenceTables,
    pub sites: &'a SiteRegistry,
    pub settings: SimulationSettings,
}

static NO_CACHE: NoCache = NoCache;

pub struct ScenarioEngine<'a> {
    ctx: EngineContext<'a>,
    cache: &'a dyn SimulationCache,
    /// Folded into every cache key so engines over different data can share
    /// one cache.
    context_digest: String,
}

impl<'a> ScenarioEngine<'a> {
    pub fn new(
        tables: &'a ReferenceTables,
        sites: &'a SiteRegistry,
        settings: SimulationSettings,
    ) -> Self {
        Self {
            ctx: EngineContext { tables, sites, settings },
            cache: &NO_CACHE,
            context_digest: context_digest(tables, sites),
        }
    }

    pub fn with_cache(mut self, cache: &'a dyn SimulationCache) -> Self {
        self.cache = cache;
        self
    }

    /// Evaluates `request`; failures come back as fail-closed responses.
    pub fn run(&self, request: &ScenarioRequest) -> ScenarioResponse {
        let key = CacheKey::for_request(request, &self.ctx.settings, &self.context_digest);
        if let Some(mut hit) = self.cache.get(&key) {
            debug!(key = key.as_str(), "cache hit");
            hit.request = request.clone();
            return hit;
        }

        match self.evaluate(request) {
            Ok(response) => {
                self.cache.put(key, &response);
                response
            }
            Err(e) => {
                warn!(
                    scenario_type = %request.scenario_type,
                    kind = e.kind(),
                    error = %e,
                    "scenario failed closed"
                );
                ScenarioResponse::fail_closed(request.clone(), &e)
            }
        }
    }

    /// Evaluates `request`, surfacing the typed error instead of failing closed.
    pub fn evaluate(&self, request: &ScenarioRequest) -> Result<ScenarioResponse> {
        request.validate()?;
        info!(
            scenario_type = %request.scenario_type,
            sites = ?request.site_scope,
            horizon = request.time_horizon_years,
            "evaluating scenario"
        );
        let ctx = &self.ctx;
        let mut response = match request.scenario_type {
            ScenarioType::Counterfactual => counterfactual::run(ctx, request)?,
            ScenarioType::Climate => climate::run(ctx, request)?,
            ScenarioType::TippingPoint => tipping::run(ctx, request)?,
            ScenarioType::Shock | ScenarioType::Portfolio => stress::run(ctx, request)?,
            ScenarioType::Intervention => options::run(ctx, request)?,
            ScenarioType::Market => blue_carbon::run(ctx, request)?,
        };
        if ctx.settings.is_clamped() && response.uncertainty.n_simulations > 0 {
            response.caveats.push(format!(
                "Requested {} simulations; capped at {}.",
                ctx.settings.n_simulations, ctx.settings.max_simulations
            ));
        }
        info!(
            confidence = response.confidence,
            validity = ?response.scenario_validity,
            "scenario evaluated"
        );
        Ok(response)
    }
}
