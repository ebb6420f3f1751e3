//! Materialises read models from the event log.

mod checkpoint;
mod daemon;
mod manager;
mod store;

pub use checkpoint::Checkpoint;
pub use daemon::{DaemonConfig, DaemonHandle, ProjectionDaemon};
pub use manager::{ProjectionManager, ProjectionManagerConfig};
pub use store::ProjectionStore;

use crate::event::{SequencedEvent, Tag};
use std::collections::HashSet;

/// A materialised read model folded incrementally from a subset of
/// the event log.
///
/// `apply` must be deterministic and side-effect free: the manager will not retry a failed or
/// non-deterministic fold differently. Returning `None` from `apply`
/// when the prior state was `Some` deletes the instance.
pub trait Projection: Send + Sync {
    /// Unique identifier; determines the projection's directory name.
    fn name(&self) -> &str;

    /// Event types this projection subscribes to. The manager reads
    /// only events of these types.
    fn event_types(&self) -> HashSet<String>;

    /// Deterministic instance key for an event. Events without a key
    /// are skipped for this projection.
    fn key_for(&self, event: &SequencedEvent) -> Option<String>;

    /// Pure fold. Returning `None` deletes the instance.
    fn apply(
        &self,
        state: Option<serde_json::Value>,
        event: &SequencedEvent,
    ) -> Option<serde_json::Value>;

    /// Tags to index this instance's state under, for
    /// [`ProjectionStore::query_by_tag`]/`query_by_tags`. The default
    /// implementation maintains no tag index.
    fn tags_for(&self, _state: &serde_json::Value) -> Vec<Tag> {
        Vec::new()
    }
}
