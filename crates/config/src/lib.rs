//! Configuration module for the HandBrake queue daemon
//!
//! Handles loading configuration from TOML files, environment variable overrides
//! and validation of the encoding profile registry.

pub mod config;

pub use config::*;
