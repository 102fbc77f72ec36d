//! Configuration system for the prediction engine and its hosts.
//!
//! Provides runtime-configurable settings that persist to disk as RON files.
//! Supports CLI overrides via clap, hot-reload detection, validation, and
//! forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, DebugConfig, LagCompensationConfig, NetworkConfig, NetworkLod, PredictionConfig,
    TickingPolicy, TimeDilationConfig,
};
pub use error::ConfigError;
