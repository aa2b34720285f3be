//! Shared plumbing for the agent-pm coordinator.
//!
//! This crate holds everything the coordinator binary needs before it can do
//! real work: configuration loading ([`config`]), home/data directory
//! resolution ([`home`]), and process-level logging setup ([`logging`]).

pub mod config;
pub mod home;
pub mod logging;

pub use config::{ConfigError, CoordinatorConfig};
