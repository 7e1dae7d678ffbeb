//! Typed domain error enums.
//!
//! This module has zero imports from `crate::infra`, `crate::commands`,
//! `crate::application`, `tokio`, `std::fs`, `std::process`, or `std::net`.
//! All error types implement `thiserror::Error` and convert to `anyhow::Error`
//! via the `?` operator.

use thiserror::Error;

// ── Step errors ───────────────────────────────────────────────────────────────

/// Failure of a single step. Recorded on the step, never retried.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("unknown step method '{0}'")]
    UnknownMethod(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Command(String),
}

impl StepError {
    /// Wrap an I/O error with the path or operation it concerns.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgs(message.into())
    }
}

// ── Job errors ────────────────────────────────────────────────────────────────

/// A job payload that cannot be executed at all.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("invalid job id '{id}': {reason}")]
    InvalidId { id: String, reason: &'static str },

    #[error("invalid resource id '{id}': {reason}")]
    InvalidResource { id: String, reason: &'static str },

    #[error("job has no steps")]
    NoSteps,

    #[error("step #{index} has an empty {field}")]
    EmptyStepField { index: usize, field: &'static str },
}

// ── Config errors ─────────────────────────────────────────────────────────────

/// Startup configuration rejected before any component runs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown queue: {value}\n\nValid queues: high, default, low")]
    UnknownQueue { value: String },

    #[error("No queues configured for this worker")]
    NoQueues,

    #[error("Invalid value for {key}: {value}\n\n{hint}")]
    InvalidValue {
        key: &'static str,
        value: String,
        hint: &'static str,
    },
}
