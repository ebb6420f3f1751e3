use crate::error::Result;
use crate::event_file::EventFileManager;
use crate::fsutil;
use crate::index::IndexManager;
use crate::ledger::Ledger;
use std::path::{Path, PathBuf};

/// A logical partition of the event store: an isolated directory
/// subtree holding one ledger, one event file store, and one set of
/// indices. `Context::open` performs idempotent directory
/// creation and startup reconciliation.
pub struct Context {
    pub name: String,
    pub dir: PathBuf,
    pub(crate) ledger: Ledger,
    pub(crate) events: EventFileManager,
    pub(crate) indices: IndexManager,
}

impl Context {
    /// Opens (creating if necessary) the context's directory tree
    /// under `root/name`, then reconciles the ledger and indices
    /// against the true state of the events directory.
    pub async fn open(root: &Path, name: &str) -> Result<Self> {
        let dir = root.join(name);
        tokio::fs::create_dir_all(&dir).await?;

        let context = Self {
            name: name.to_string(),
            ledger: Ledger::new(&dir),
            events: EventFileManager::new(&dir),
            indices: IndexManager::new(&dir),
            dir,
        };

        context.reconcile().await?;
        Ok(context)
    }

    /// Startup reconciliation: sweep orphaned temp files,
    /// find the true maximum committed event-file position, correct
    /// the ledger if it disagrees, and backfill any index missing an
    /// orphaned position.
    async fn reconcile(&self) -> Result<()> {
        let swept = fsutil::sweep_tmp_files(self.events.dir()).await?;
        if swept > 0 {
            tracing::info!(context = %self.name, count = swept, "swept orphaned temp files");
        }

        let positions = self.events.list_positions().await?;
        let max_committed = positions.iter().copied().max().unwrap_or(0);
        let ledger_last = self.ledger.get_last().await;

        if max_committed != ledger_last {
            tracing::warn!(
                context = %self.name,
                ledger_last,
                max_committed,
                "ledger disagrees with events directory, reconciling"
            );
            self.ledger
                .update(max_committed, positions.len() as i64, true)
                .await?;
        }

        for &position in &positions {
            let event = self.events.read(position).await?;
            let missing = self.indices.verify(std::slice::from_ref(&event)).await;
            for (position, family) in missing {
                tracing::warn!(context = %self.name, position, family, "backfilling missing index entry");
                self.indices
                    .index_event(event.event_type(), event.tags(), event.position)
                    .await?;
            }
        }

        tracing::info!(context = %self.name, events = positions.len(), "context opened");
        Ok(())
    }

    /// Confirms every committed event's position appears in its
    /// expected event-type and tag indices. Not run automatically; callable by an
    /// operator.
    pub async fn verify_indices(&self) -> Result<Vec<(i64, &'static str)>> {
        let positions = self.events.list_positions().await?;
        let events = self.events.read_batch(&positions).await?;
        Ok(self.indices.verify(&events).await)
    }

    /// Read-only snapshot of context size.
    pub async fn stats(&self) -> Result<StoreStats> {
        let last_sequence_position = self.ledger.get_last().await;
        let event_count = self.events.list_positions().await?.len() as i64;
        Ok(StoreStats {
            last_sequence_position,
            event_count,
            distinct_event_types: self.indices.event_type.distinct_count().await,
            distinct_tags: self.indices.tag.distinct_count().await,
        })
    }
}

/// Read-only snapshot of a context's size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub last_sequence_position: i64,
    pub event_count: i64,
    pub distinct_event_types: usize,
    pub distinct_tags: usize,
}
