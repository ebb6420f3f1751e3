use crate::fsutil;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(rename = "lastSequencePosition")]
    last_sequence_position: i64,
    #[serde(rename = "eventCount")]
    event_count: i64,
}

/// Persists the monotonically increasing last-assigned sequence
/// position for a context. A missing or unreadable
/// ledger file is treated as position zero.
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(context_dir: &Path) -> Self {
        Self {
            path: context_dir.join(".ledger"),
        }
    }

    /// Returns 0 when the file is absent or unreadable.
    pub async fn get_last(&self) -> i64 {
        match fsutil::read_optional(&self.path).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<LedgerFile>(&bytes) {
                Ok(ledger) => ledger.last_sequence_position,
                Err(_) => {
                    tracing::warn!(path = %self.path.display(), "ledger file corrupt, treating as zero");
                    0
                }
            },
            Ok(None) => 0,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ledger file unreadable, treating as zero");
                0
            }
        }
    }

    /// Does not persist; the caller commits with [`Ledger::update`]
    /// after writing the corresponding event file(s).
    pub async fn get_next(&self) -> i64 {
        self.get_last().await + 1
    }

    /// Atomically persists the new last-assigned position, fsyncing
    /// first when `flush` is set.
    pub async fn update(&self, position: i64, event_count: i64, flush: bool) -> Result<()> {
        let ledger = LedgerFile {
            last_sequence_position: position,
            event_count,
        };
        let bytes = serde_json::to_vec(&ledger)?;
        fsutil::atomic_write(&self.path, &bytes, flush).await
    }
}
