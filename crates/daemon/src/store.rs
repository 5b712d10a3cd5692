//! Persistence adapter for the queue document.
//!
//! The whole [`QueueState`] is written as JSON to a fixed path, overwriting
//! the previous contents. There is no atomic rename or backup, so a crash
//! mid-write can leave a truncated file behind.

use crate::queue::QueueState;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for persistence operations
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Queue document is not valid JSON: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Reads and writes the queue document at a fixed path.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize the full state and overwrite the document.
    pub async fn save(&self, state: &QueueState) -> Result<(), PersistError> {
        let json = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&self.path, json)
            .await
            .map_err(|source| PersistError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Load the document, creating it from the empty state if absent.
    pub async fn load(&self) -> Result<QueueState, PersistError> {
        match tokio::fs::try_exists(&self.path).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(path = %self.path.display(), "Queue document missing, creating it");
                self.save(&QueueState::default()).await?;
            }
            Err(source) => {
                return Err(PersistError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        }

        let content = tokio::fs::read(&self.path)
            .await
            .map_err(|source| PersistError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(serde_json::from_slice(&content)?)
    }
}
