//! Startup checks module for the queue daemon
//!
//! Verifies before starting that the encoder can be executed, the folder
//! roots are usable and the completion marker compiles.

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("Root folder {0} is not a readable directory")]
    RootFolder(String),

    #[error("Completion marker is not a valid regex: {0}")]
    CompletionMarker(#[from] regex::Error),
}

/// Check that the encoder runs by invoking `<encoder> --version`
pub fn check_encoder_available(encoder: &str) -> Result<(), StartupError> {
    let output = Command::new(encoder).arg("--version").output().map_err(|e| {
        StartupError::EncoderUnavailable(format!(
            "{} --version failed; is it installed and in PATH? Error: {}",
            encoder, e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnavailable(format!(
            "{} --version exited with {}",
            encoder, output.status
        )));
    }

    Ok(())
}

/// Check that the root folder exists and is a directory
pub fn check_root_folder(root: &Path) -> Result<(), StartupError> {
    if root.is_dir() {
        Ok(())
    } else {
        Err(StartupError::RootFolder(root.display().to_string()))
    }
}

/// Run all startup checks in order: completion marker, root folder, encoder
pub fn run_startup_checks(config: &Config) -> Result<(), StartupError> {
    regex::Regex::new(&config.main.completion_marker)?;
    check_root_folder(&config.main.root_folder)?;
    check_encoder_available(&config.main.encoder)?;
    Ok(())
}
