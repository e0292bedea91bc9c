//! Typed error boundaries for each component.
//!
//! Component constructors and fallible operations return one of these
//! instead of `anyhow::Error` so callers can match on failure class (the
//! transient/validation/programmer-invariant/capacity taxonomy). `main.rs`
//! and the orchestrator glue layer still work in `anyhow::Result` — these
//! types implement `std::error::Error` so `?` composes into `anyhow` freely.

use thiserror::Error;

/// Errors from a log backend (`LogSource`) implementation.
#[derive(Error, Debug)]
pub enum LogSourceError {
    #[error("transient network error querying log source: {0}")]
    Transient(String),

    #[error("log source authentication failed: {0}")]
    Authentication(String),

    #[error("log source returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("malformed log source response: {0}")]
    MalformedResponse(String),

    #[error("log source query failed: {0}")]
    QueryFailed(String),
}

/// Errors from a `ClusterApi` implementation.
#[derive(Error, Debug)]
pub enum ClusterApiError {
    #[error("kubernetes API error: {0}")]
    Kube(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("could not resolve owner chain for pod {pod}: {reason}")]
    OwnerResolution { pod: String, reason: String },

    #[error("cluster API unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the `IncidentStore`.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("incident not found: {0}")]
    IncidentNotFound(String),

    #[error("remediation log not found: {0}")]
    LogNotFound(String),

    #[error("store invariant violated: {0}")]
    InvariantViolation(String),
}

/// Errors from the remediation engine's action dispatcher.
#[derive(Error, Debug)]
pub enum RemediationError {
    #[error("cluster API error: {0}")]
    Cluster(#[from] ClusterApiError),

    #[error("action execution failed: {0}")]
    ActionFailed(String),

    #[error("script execution failed: {0}")]
    ScriptFailed(String),
}

/// Config document validation failures. Fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Rule set validation / compilation failures. Fatal at startup; rejected
/// (previous state preserved) on hot-reload.
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("rule {name:?} is invalid: {reason}")]
    Invalid { name: String, reason: String },

    #[error("pattern compilation failed for rule {name:?}: {source}")]
    PatternCompile {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to read rules file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse rules YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
}
