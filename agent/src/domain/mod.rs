//! Domain layer — pure business logic, types, and validation.
//!
//! This module has zero imports from `crate::infra`, `crate::commands`,
//! `crate::application`, `tokio`, `std::fs`, `std::process`, or `std::net`.
//! All functions are synchronous and take data in, returning data out.

pub mod backoff;
pub mod config;
pub mod error;
pub mod job;
pub mod layout;
pub mod proxy_config;
pub mod reload;

pub use backoff::{Backoff, BackoffPolicy, BackoffStep};
pub use config::{AgentConfig, CoordinatorSettings, RunnerSettings, WorkerSettings};
pub use error::{ConfigError, JobError, StepError};
pub use job::JobTracker;
pub use layout::HostLayout;
pub use proxy_config::{HostState, RenderSettings};
pub use reload::{Batch, DebounceSettings, Debouncer, DrainStatus};
