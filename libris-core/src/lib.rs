//! Shared building blocks for the libris workspace.
//!
//! This crate holds the pieces both the API instances and the
//! orchestrator need: per-environment configuration loading and
//! child-process supervision. Service-specific logic lives in
//! `libris-api` and `libris-proxy`.

pub mod config;
pub mod process;

pub use config::{port_from_env, Config, ConfigError, Environment};
