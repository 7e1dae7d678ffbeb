//! Application layer — port trait definitions, the step registry, and
//! use-case orchestration.
//!
//! This module depends only on `crate::domain` and `press_common` — never on
//! `crate::infra` or `crate::commands`.

pub mod ports;
pub mod services;
pub mod steps;

pub use ports::{
    ClaimOutcome, CommandRunner, HealthProbe, Heartbeats, HostStateSource, JobQueue, ProxyDriver,
    ReloadChannel, ResourceLocks, SharedStore, StatusStore, Validation,
};
pub use steps::{EffectClass, StepContext, StepMethod, StepRegistry};
