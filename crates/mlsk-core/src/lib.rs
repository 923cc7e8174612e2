//! MLSK Core Library
//!
//! Shared functionality for MLSK components:
//! - Configuration resolution (defaults, file, environment)
//! - Common error types
//! - Tracing initialisation

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, EngineConfig, LoggingConfig};
pub use error::{Error, Result};
