//! Scenario Intelligence Engine
//!
//! Deterministic what-if projections of ecosystem-service value (ESV) for
//! protected sites: counterfactual loss of protection, SSP climate pathways,
//! reef biomass tipping points, correlated portfolio stress, real-options
//! valuation of conservation investment and blue-carbon credit revenue.
//!
//! Every engine takes a [`ScenarioRequest`] and produces a
//! [`ScenarioResponse`] through [`ScenarioEngine`], which fails closed on
//! any error.

pub mod blue_carbon;
pub mod cache;
pub mod climate;
pub mod confidence;
pub mod config;
pub mod counterfactual;
pub mod engine;
pub mod error;
pub mod interpolate;
pub mod io;
pub mod model;
pub mod options;
pub mod reference;
pub mod sampling;
pub mod sensitivity;
pub mod sites;
pub mod stress;
pub mod tipping;

pub use engine::{EngineContext, ScenarioEngine, SimulationSettings};
pub use error::{LookupError, Result, ScenarioError};
pub use model::{
    ScenarioDelta, ScenarioRequest, ScenarioResponse, ScenarioType, ScenarioUncertainty,
    ScenarioValidity, Ssp,
};
pub use reference::ReferenceTables;
pub use sites::{SiteData, SiteRegistry};

#[cfg(test)]
mod tests;
