//! Configuration crate for unpackr

pub mod config;

pub use config::{normalized_extension, Config, ConfigError, ToolPaths, MAX_RUNTIME_CAP};
