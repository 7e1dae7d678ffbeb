//! Unit tests for the press agent
//!
//! These tests run the application services against in-memory ports and a
//! paused tokio clock; no Valkey or nginx is needed.

mod architecture;
mod mocks;
mod reload_coordinator_service;
mod sweep_service;
