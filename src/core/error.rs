//! Error taxonomy.
//!
//! Build-time errors ([`InvalidResourceError`], [`GraphError`]) abort a run
//! before any provider is called. Execution-time errors ([`ProviderError`],
//! surfaced as [`FailureCause`]) stay contained to one resource and its
//! dependents and are collected into a [`RunFailure`].

use super::types::{ResourceType, RunReport};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Name validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("name must not be empty")]
    Empty,

    #[error("name exceeds the max length of {max} characters (got {len})")]
    ExceedsMaxLength { len: usize, max: usize },

    #[error(
        "name '{0}' contains invalid characters, characters must be either a-z, A-Z, 0-9, -, _"
    )]
    ContainsInvalidCharacters(String),
}

/// A declaration that cannot become a resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidResourceError {
    #[error("resource '{resource}': {source}")]
    InvalidName {
        resource: String,
        #[source]
        source: NameError,
    },

    #[error("resource '{name}' has unknown type '{kind}'")]
    UnknownType { name: String, kind: String },

    #[error("resource '{0}' is declared more than once")]
    Duplicate(String),

    #[error("resources '{first}' and '{second}' resolve to the same handle '{handle}'")]
    HandleCollision {
        first: String,
        second: String,
        handle: String,
    },

    #[error("resource '{resource}' has malformed dependency reference '{reference}'")]
    MalformedReference { resource: String, reference: String },

    #[error("resource '{resource}' depends on unknown resource '{dependency}'")]
    UnknownDependency {
        resource: String,
        dependency: String,
    },

    #[error("resource '{0}': client_nodes must be a non-negative integer")]
    InvalidClientNodes(String),
}

/// Graph construction failures. Any of these fails the whole build.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error(transparent)]
    Invalid(#[from] InvalidResourceError),

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("resource '{resource}' has type '{resource_type}' which no registered provider supports")]
    UnsupportedType {
        resource: String,
        resource_type: ResourceType,
    },
}

/// Failure reported by a provider for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The external object already exists; a retried create counts as success.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The external object is already gone; a retried destroy counts as success.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Failed(String),
}

/// Why a resource ended a run in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureCause {
    #[error("provider error: {0}")]
    Provider(ProviderError),

    #[error("skipped: dependency '{dependency}' did not converge")]
    SkippedDueToDependency { dependency: String },
}

/// Persisted state could not be read or written.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid state file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Engine configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml_ng::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A blueprint document could not be loaded.
#[derive(Debug, Error)]
pub enum BlueprintError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("blueprint parse error: {0}")]
    Parse(#[from] serde_yaml_ng::Error),
}

/// A run finished with failed or skipped resources, or was interrupted.
/// Carries the full report so callers can see what did converge.
#[derive(Debug)]
pub struct RunFailure {
    pub report: RunReport,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.report.failed();
        if self.report.interrupted {
            write!(f, "run {} interrupted", self.report.run_id)?;
            if failed > 0 {
                write!(f, " with {} failed resource(s)", failed)?;
            }
        } else {
            write!(f, "{} resource(s) failed", failed)?;
        }
        for outcome in self.report.failures() {
            if let Some(ref cause) = outcome.failure {
                write!(f, "\n  {} ({}): {}", outcome.reference, outcome.operation, cause)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RunFailure {}

/// Top-level error for an engine run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Blueprint(#[from] BlueprintError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Run(#[from] RunFailure),
}
