//! servicerd agent - run registrations and inspect services from the command line
//!
//! - `config`: layered configuration (file, environment, flags)
//! - `backend`: builds the configured registry
//! - `commands`: `register`, `list` and `watch`
//! - `startup`: logging and signal handling

pub mod backend;
pub mod commands;
pub mod config;
pub mod startup;

pub use backend::{RegistryHandle, build_registry};
pub use config::{AgentConfig, Backend, Overrides};
