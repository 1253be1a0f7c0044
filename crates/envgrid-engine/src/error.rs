//! Engine error types.

use std::fmt;

use envgrid_state::{EnvStatus, StateError};
use envgrid_values::ValuesError;
use thiserror::Error;

/// A manifest or values document could not be produced.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Values(#[from] ValuesError),

    #[error("unresolved placeholder `{0}`")]
    Unresolved(String),

    #[error("placeholder pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Why a single service failed to apply.
#[derive(Debug, Error)]
pub enum ServiceApplyError {
    #[error("render failed: {0}")]
    Render(#[from] RenderError),

    #[error("apply failed: {0}")]
    Apply(String),

    #[error("chart fetch failed: {0}")]
    ChartFetch(String),
}

impl ServiceApplyError {
    /// Render failures are deterministic; everything else may be transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Render(_))
    }
}

/// Per-service failures of one call, in the order they were recorded.
#[derive(Debug, Default)]
pub struct ApplyFailures {
    failures: Vec<(String, ServiceApplyError)>,
}

impl ApplyFailures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, service: impl Into<String>, error: ServiceApplyError) {
        self.failures.push((service.into(), error));
    }

    pub fn extend(&mut self, other: ApplyFailures) {
        self.failures.extend(other.failures);
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|(s, _)| s.as_str())
    }

    pub fn get(&self, service: &str) -> Option<&ServiceApplyError> {
        self.failures
            .iter()
            .find(|(s, _)| s == service)
            .map(|(_, e)| e)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServiceApplyError)> {
        self.failures.iter().map(|(s, e)| (s.as_str(), e))
    }
}

impl fmt::Display for ApplyFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} service(s) failed", self.failures.len())?;
        for (i, (service, error)) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{service}: {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ApplyFailures {}

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("environment not found: {0}")]
    NotFound(String),

    #[error("environment already exists: {0}")]
    AlreadyExists(String),

    #[error("global variable {key} is used by services {services:?}")]
    KeyInUse { key: String, services: Vec<String> },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("environment {env} changed: expected revision {expected}, found {actual}")]
    Conflict {
        env: String,
        expected: u64,
        actual: u64,
    },

    #[error("environment {env} cannot move from {from} to {to}")]
    InvalidTransition {
        env: String,
        from: EnvStatus,
        to: EnvStatus,
    },

    #[error("failed to load template for {project}: {source}")]
    TemplateLoad {
        project: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cannot build apply parameters: {0}")]
    Render(#[from] RenderError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    ServicesFailed(#[from] ApplyFailures),

    #[error("background job failed: {0}")]
    Job(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
