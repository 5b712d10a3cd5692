//! Job model and job factory.
//!
//! A job is built from a source file under the configured root folder and an
//! encoding profile. Its output path mirrors the source tree under the output
//! folder with the extension stripped; the profile template supplies the
//! container extension.

use crate::config::{Config, INPUT_PLACEHOLDER, OUTPUT_PLACEHOLDER};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Human-readable job statuses shown to the UI layer.
pub mod status {
    pub const CREATED: &str = "created";
    pub const QUEUED: &str = "Queued";
    pub const REQUEUED: &str = "Requeued";
    pub const CANCELED: &str = "Canceled";
    pub const TERMINATED: &str = "Terminated by user";
    pub const STARTING: &str = "Job starting.";
    pub const COMPLETED: &str = "Job completed successfully.";
    pub const CRASHED: &str = "Handbrake crashed.";
    pub const FAILED: &str = "Job Failed";
}

/// Errors raised while validating or building a job.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Path is missing, relative, unresolvable or outside the root folder.
    #[error("{0}")]
    InvalidPath(String),

    /// Profile id is not registered.
    #[error("Not a valid profileID: {0}")]
    UnknownProfile(String),
}

/// A transcoding job, serialized as one record of the persisted queue document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job identifier (UUID).
    pub id: String,
    /// Absolute path of the source media file.
    pub source_path: PathBuf,
    /// Profile id the arguments were built from.
    pub profile: String,
    /// File name of the source.
    pub name: String,
    /// Output path without extension.
    pub output_path: PathBuf,
    /// Encoder argument vector.
    pub args: Vec<String>,
    /// Set once the encoder printed its completion marker.
    #[serde(default)]
    pub complete: bool,
    /// Delete the source after a successful encode.
    #[serde(default)]
    pub delete_source: bool,
    /// Last reported percentage.
    #[serde(default)]
    pub progress: f64,
    /// Human-readable status.
    pub status: String,
}

impl Job {
    /// Reset run-specific fields before a job goes back into the pending queue.
    pub fn reset_for_requeue(&mut self) {
        self.complete = false;
        self.progress = 0.0;
        self.status = status::REQUEUED.to_string();
    }
}

/// Builds jobs from source paths and the profile registry.
#[derive(Debug, Clone)]
pub struct JobFactory {
    root_folder: PathBuf,
    output_folder: PathBuf,
    profiles: BTreeMap<String, String>,
}

impl JobFactory {
    /// Create a factory from explicit folders and profiles.
    pub fn new(
        root_folder: PathBuf,
        output_folder: PathBuf,
        profiles: BTreeMap<String, String>,
    ) -> Self {
        Self {
            root_folder: normalize_path(&root_folder),
            output_folder: normalize_path(&output_folder),
            profiles,
        }
    }

    /// Create a factory from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.main.root_folder.clone(),
            config.main.output_folder.clone(),
            config.profiles.clone(),
        )
    }

    pub fn has_profile(&self, profile_id: &str) -> bool {
        self.profiles.contains_key(profile_id)
    }

    /// Derive the output path for a source under the root folder.
    ///
    /// The root prefix is replaced by the output prefix and the final
    /// extension is stripped.
    pub fn output_path_for(&self, source: &Path) -> Result<PathBuf, JobError> {
        if !source.is_absolute() {
            return Err(JobError::InvalidPath("Not an absolute path".to_string()));
        }
        require_utf8(source)?;
        let source = normalize_path(source);
        let relative = source
            .strip_prefix(&self.root_folder)
            .map_err(|_| JobError::InvalidPath("Path not within root folder".to_string()))?;
        if relative.as_os_str().is_empty() {
            return Err(JobError::InvalidPath("Path is the root folder".to_string()));
        }
        Ok(self.output_folder.join(relative).with_extension(""))
    }

    /// Build a job. Pure: no filesystem access; see [`validate_source_path`].
    pub fn build(
        &self,
        source: &Path,
        profile_id: &str,
        delete_source: bool,
    ) -> Result<Job, JobError> {
        let output_path = self.output_path_for(source)?;
        let template = self
            .profiles
            .get(profile_id)
            .ok_or_else(|| JobError::UnknownProfile(profile_id.to_string()))?;

        let source = normalize_path(source);
        let input = source.to_string_lossy();
        let output = output_path.to_string_lossy();
        let args = template
            .split_whitespace()
            .map(|token| {
                token
                    .replace(INPUT_PLACEHOLDER, &input)
                    .replace(OUTPUT_PLACEHOLDER, &output)
            })
            .collect();

        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(Job {
            id: Uuid::new_v4().to_string(),
            source_path: source,
            profile: profile_id.to_string(),
            name,
            output_path,
            args,
            complete: false,
            delete_source,
            progress: 0.0,
            status: status::CREATED.to_string(),
        })
    }
}

/// Check that a user-supplied path is present, absolute and resolvable.
pub async fn validate_source_path(path: &Path) -> Result<(), JobError> {
    if path.as_os_str().is_empty() {
        return Err(JobError::InvalidPath("Please provide a path".to_string()));
    }
    if !path.is_absolute() {
        return Err(JobError::InvalidPath("Not an absolute path".to_string()));
    }
    require_utf8(path)?;
    tokio::fs::canonicalize(path)
        .await
        .map_err(|_| JobError::InvalidPath("Not a valid path".to_string()))?;
    Ok(())
}

/// The persisted queue document stores paths as JSON strings.
fn require_utf8(path: &Path) -> Result<(), JobError> {
    match path.to_str() {
        Some(_) => Ok(()),
        None => Err(JobError::InvalidPath("Path is not valid UTF-8".to_string())),
    }
}

/// Lexically normalize a path, dropping `.` and resolving `..`.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
