//! Application services — use-case orchestration.
//!
//! Each service composes domain logic with port trait calls. Services import
//! only from `crate::domain` and `crate::application` — never from
//! `crate::infra` or `crate::commands`.

pub mod job_runner;
pub mod jobs;
pub mod reload_coordinator;
pub mod retry;
pub mod sweep;
pub mod worker;
