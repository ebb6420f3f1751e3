use crate::error::Result;
use crate::fsutil;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Durable record of the last event position consumed by a named
/// projection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    #[serde(rename = "projectionName")]
    pub projection_name: String,
    #[serde(rename = "lastProcessedPosition")]
    pub last_processed_position: i64,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
    #[serde(rename = "totalEventsProcessed")]
    pub total_events_processed: u64,
}

impl Checkpoint {
    pub fn new(projection_name: impl Into<String>) -> Self {
        Self {
            projection_name: projection_name.into(),
            last_processed_position: 0,
            last_updated: Utc::now(),
            total_events_processed: 0,
        }
    }
}

/// Persists checkpoints at `projections/_checkpoints/{name}.checkpoint`
///, shared across all projections registered in a
/// context.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(context_dir: &Path) -> Self {
        Self {
            dir: context_dir.join("projections").join("_checkpoints"),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.checkpoint", fsutil::safe_segment(name)))
    }

    pub async fn load(&self, name: &str) -> Result<Option<Checkpoint>> {
        match fsutil::read_optional(&self.path(name)).await? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(checkpoint) => Ok(Some(checkpoint)),
                Err(_) => {
                    tracing::warn!(projection = name, "checkpoint file corrupt, treating as missing");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = serde_json::to_vec(checkpoint)?;
        fsutil::atomic_write(&self.path(&checkpoint.projection_name), &bytes, true).await
    }
}
