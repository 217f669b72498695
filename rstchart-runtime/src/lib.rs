//! # rstchart-runtime
//!
//! Hosts a statechart interpreter in a tokio application.
//!
//! This crate provides:
//! - Layered configuration (defaults, YAML file, environment)
//! - A runner that advances the simulated clock in real time
//! - Checkpointing on a policy, with resume on startup

pub mod config;
pub mod error;
pub mod runner;

pub use config::{Config, ConfigError, OutputFormat};
pub use error::RuntimeError;
pub use runner::{load_interpreter, Runner, RunnerHandle};
