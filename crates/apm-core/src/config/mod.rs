//! Coordinator configuration.
//!
//! The coordinator is configured by a single YAML file. [`types`] defines the
//! deserialized shape and defaults; [`resolve`] loads a file, applies
//! environment expansion and platform defaults, and validates the result.

mod resolve;
mod types;

pub use resolve::{default_socket_path, load, ConfigError};
pub use types::{
    AgentCredential, CoordinatorConfig, ErrorProtectionConfig, LogUploadConfig, ProviderSpec,
};
