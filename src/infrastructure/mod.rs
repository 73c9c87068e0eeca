//! Infrastructure layer
//!
//! Configuration loading and log setup.

mod config;
mod logging;

pub use config::{Config, ConfigError};
pub use logging::{LogFormat, init_logging};
