//! Error types for the scenario engines
//!
//! - **ScenarioError**: request-level failures, translated into a fail-closed
//!   `ScenarioResponse` by the dispatcher
//! - **LookupError**: reference-table misses raised by helpers such as the
//!   degradation interpolator

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, ScenarioError>;

/// Failure modes of a single engine call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScenarioError {
    /// Malformed request detected before any computation
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Site identifier has no resolvable data
    #[error("unknown site: {0}")]
    UnknownSite(String),

    /// Site resolves but lacks a field the engine needs
    #[error("insufficient evidence for {site}: {reason}")]
    InsufficientEvidence { site: String, reason: String },

    /// Reference-table miss inside a helper
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

impl ScenarioError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn insufficient(site: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InsufficientEvidence {
            site: site.into(),
            reason: reason.into(),
        }
    }

    /// Short label used in caveats and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownSite(_) => "unknown_site",
            Self::InsufficientEvidence { .. } => "insufficient_evidence",
            Self::Lookup(_) => "reference_lookup",
        }
    }
}

/// Reference-table lookup failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LookupError {
    #[error("no degradation anchors for habitat '{0}'")]
    UnknownHabitat(String),

    #[error("no degradation anchors for habitat '{habitat}' under {ssp}")]
    UnknownPathway { habitat: String, ssp: String },

    #[error("unknown carbon price scenario '{0}'")]
    UnknownPriceScenario(String),
}
