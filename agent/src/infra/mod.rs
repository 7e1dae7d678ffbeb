//! Infrastructure layer — concrete implementations of application port traits.
//!
//! All I/O lives here: the Valkey store, the nginx driver, host directories,
//! process execution, the HTTP health probe, and environment configuration.
//!
//! Imports from `crate::domain` and `crate::application` are allowed.
//! Imports from `crate::commands` are forbidden.

pub mod command_runner;
pub mod config;
pub mod fs;
pub mod health;
pub mod host_fs;
pub mod nginx;
pub mod steps;
pub mod valkey;
