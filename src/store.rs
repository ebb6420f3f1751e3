use crate::append_condition::AppendCondition;
use crate::context::{Context, StoreStats};
use crate::error::{OpossumError, Result};
use crate::event::{Event, EventMetadata, SequencedEvent};
use crate::index::{intersection, union};
use crate::query::{Query, QueryItem};
use std::path::Path;

/// Configuration honoured by [`EventStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Forces `fsync` of event files and the ledger before their
    /// renames. Default `true`; with it disabled a crash may lose the
    /// tail of recent events but never corrupts invariants.
    pub flush_events_immediately: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flush_events_immediately: true,
        }
    }
}

/// Options for [`EventStore::read`].
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Reverse the result after ascending resolution.
    pub descending: bool,
    /// Restrict to positions strictly greater than this value, for
    /// incremental catch-up reads.
    pub after_position: Option<i64>,
}

/// Composes the ledger, event file manager, and indices of one
/// context to expose the public append/read contract.
/// All writers are serialised by a process-local mutex; the mutex is
/// `tokio::sync::Mutex` rather than a `std`/`parking_lot` mutex
/// because the critical section spans filesystem awaits.
pub struct EventStore {
    context: Context,
    config: StoreConfig,
    append_mutex: tokio::sync::Mutex<()>,
}

impl EventStore {
    pub async fn open(root: &Path, context_name: &str, config: StoreConfig) -> Result<Self> {
        let context = Context::open(root, context_name).await?;
        Ok(Self {
            context,
            config,
            append_mutex: tokio::sync::Mutex::new(()),
        })
    }

    pub fn context_name(&self) -> &str {
        &self.context.name
    }

    /// The directory subtree owned by this context, for constructing a
    /// [`crate::projection::ProjectionManager`] over the same context.
    pub fn context_dir(&self) -> &Path {
        &self.context.dir
    }

    /// Appends one or more events, optionally guarded by a DCB
    /// [`AppendCondition`].
    pub async fn append(
        &self,
        events: Vec<Event>,
        condition: Option<AppendCondition>,
    ) -> Result<Vec<SequencedEvent>> {
        if events.is_empty() {
            return Err(OpossumError::InvalidArgument(
                "append requires at least one event".to_string(),
            ));
        }
        for event in &events {
            event.validate()?;
        }

        let _guard = self.append_mutex.lock().await;

        let last = self.context.ledger.get_last().await;

        if let Some(condition) = &condition {
            // A universal `fail_if_events_match` pinned to a position is
            // plain optimistic concurrency over the whole ledger:
            // ConcurrencyMismatch. Any other query is a DCB decision
            // boundary and must be resolved against the threshold instead
            // — the ledger can advance past `after` without conflict if
            // the new events don't match the query.
            let is_concurrency_check = condition.fail_if_events_match.is_all()
                && condition.after_sequence_position.is_some();

            if is_concurrency_check {
                let after = condition.after_sequence_position.unwrap();
                if after != last {
                    return Err(OpossumError::ConcurrencyMismatch {
                        expected: Some(after),
                        actual: last,
                    });
                }
            } else {
                let matched = self.resolve(&condition.fail_if_events_match).await?;
                let threshold = condition.after_sequence_position.unwrap_or(0);
                if matched.iter().any(|&position| position > threshold) {
                    return Err(OpossumError::AppendConditionFailed);
                }
            }
        }

        let start = last + 1;
        let sequenced: Vec<SequencedEvent> = events
            .into_iter()
            .enumerate()
            .map(|(offset, event)| SequencedEvent {
                position: start + offset as i64,
                event,
                metadata: EventMetadata::new(),
            })
            .collect();

        for event in &sequenced {
            self.context
                .events
                .write(event, self.config.flush_events_immediately)
                .await?;
        }

        for event in &sequenced {
            self.context
                .indices
                .index_event(event.event_type(), event.tags(), event.position)
                .await?;
        }

        let last_position = sequenced.last().map(|e| e.position).unwrap_or(last);
        self.context
            .ledger
            .update(last_position, last_position, self.config.flush_events_immediately)
            .await?;

        tracing::debug!(
            context = %self.context.name,
            from = start,
            to = last_position,
            "append committed"
        );

        Ok(sequenced)
    }

    /// Resolves and loads events matching `query`.
    pub async fn read(
        &self,
        query: &Query,
        options: Option<ReadOptions>,
    ) -> Result<Vec<SequencedEvent>> {
        let options = options.unwrap_or_default();

        let mut positions = self.resolve(query).await?;
        if let Some(after) = options.after_position {
            positions.retain(|&position| position > after);
        }

        let mut events = self.context.events.read_batch(&positions).await?;
        events.sort_by_key(|e| e.position);
        if options.descending {
            events.reverse();
        }
        Ok(events)
    }

    /// On-disk query resolver, required to agree with
    /// [`Query::matches`] on every event.
    async fn resolve(&self, query: &Query) -> Result<Vec<i64>> {
        if query.is_all() {
            return self.context.events.list_positions().await;
        }

        let mut result: Vec<i64> = Vec::new();
        for item in query.items() {
            let combined = self.resolve_item(item).await;
            result = union(&result, &combined);
        }
        Ok(result)
    }

    async fn resolve_item(&self, item: &QueryItem) -> Vec<i64> {
        let type_set = if item.event_types.is_empty() {
            None
        } else {
            Some(self.context.indices.type_union(&item.event_types).await)
        };
        let tag_set = if item.tags.is_empty() {
            None
        } else {
            Some(self.context.indices.tag_intersection(&item.tags).await)
        };

        match (type_set, tag_set) {
            (Some(types), Some(tags)) => intersection(&types, &tags),
            (Some(types), None) => types,
            (None, Some(tags)) => tags,
            (None, None) => Vec::new(),
        }
    }

    /// Confirms every committed event's position appears in its
    /// expected indices.
    pub async fn verify_indices(&self) -> Result<Vec<(i64, &'static str)>> {
        self.context.verify_indices().await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.context.stats().await
    }
}
