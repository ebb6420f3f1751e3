use super::checkpoint::{Checkpoint, CheckpointStore};
use super::store::ProjectionStore;
use super::Projection;
use crate::error::{OpossumError, Result};
use crate::query::{Query, QueryItem};
use crate::store::{EventStore, ReadOptions};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;

/// Recognised projection-manager options.
#[derive(Debug, Clone)]
pub struct ProjectionManagerConfig {
    /// Upper bound on events consumed per projection per update cycle.
    pub batch_size: usize,
    /// If true and a checkpoint is missing at registration, the
    /// projection is rebuilt from the full event history.
    pub enable_auto_rebuild: bool,
}

impl Default for ProjectionManagerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            enable_auto_rebuild: true,
        }
    }
}

struct RegisteredProjection {
    projection: Arc<dyn Projection>,
    store: ProjectionStore,
}

/// Drives registered projections from their checkpoint to the head of
/// the event log.
pub struct ProjectionManager {
    event_store: Arc<EventStore>,
    context_dir: PathBuf,
    checkpoints: CheckpointStore,
    config: ProjectionManagerConfig,
    registered: Vec<RegisteredProjection>,
}

impl ProjectionManager {
    pub fn new(event_store: Arc<EventStore>, context_dir: PathBuf, config: ProjectionManagerConfig) -> Self {
        let checkpoints = CheckpointStore::new(&context_dir);
        Self {
            event_store,
            context_dir,
            checkpoints,
            config,
            registered: Vec::new(),
        }
    }

    fn find(&self, name: &str) -> Result<&RegisteredProjection> {
        self.registered
            .iter()
            .find(|r| r.projection.name() == name)
            .ok_or_else(|| OpossumError::InvalidArgument(format!("projection '{name}' is not registered")))
    }

    /// Ensures a store exists for `projection` and reads (or
    /// initialises) its checkpoint. A missing checkpoint with
    /// `enable_auto_rebuild` set triggers a full rebuild immediately.
    pub async fn register(&mut self, projection: Arc<dyn Projection>) -> Result<()> {
        let name = projection.name().to_string();
        let store = ProjectionStore::new(&self.context_dir, &name);
        let existing = self.checkpoints.load(&name).await?;

        self.registered.push(RegisteredProjection { projection, store });

        match existing {
            Some(_) => {}
            None if self.config.enable_auto_rebuild => {
                self.rebuild(&name).await?;
            }
            None => {
                self.checkpoints.save(&Checkpoint::new(&name)).await?;
            }
        }

        tracing::info!(projection = %name, "projection registered");
        Ok(())
    }

    pub async fn get_checkpoint(&self, name: &str) -> Result<Option<Checkpoint>> {
        self.checkpoints.load(name).await
    }

    pub async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints.save(checkpoint).await
    }

    /// One incremental update cycle for a single projection. Events are applied in strictly ascending position order.
    pub async fn update(&self, name: &str) -> Result<()> {
        let registered = self.find(name)?;
        let checkpoint = self
            .checkpoints
            .load(name)
            .await?
            .unwrap_or_else(|| Checkpoint::new(name));

        let query = subscription_query(&registered.projection.event_types());
        let events = self
            .event_store
            .read(
                &query,
                Some(ReadOptions {
                    descending: false,
                    after_position: Some(checkpoint.last_processed_position),
                }),
            )
            .await?;

        let mut last_position = checkpoint.last_processed_position;
        let mut processed = checkpoint.total_events_processed;

        for event in events.into_iter().take(self.config.batch_size) {
            if let Some(key) = registered.projection.key_for(&event) {
                let prior = registered.store.get(&key).await?;
                let new_state = registered.projection.apply(prior.clone(), &event);
                match new_state {
                    None if prior.is_some() => registered.store.delete(&key).await?,
                    Some(state) if Some(&state) != prior.as_ref() => {
                        let tags = registered.projection.tags_for(&state);
                        registered.store.save(&key, state, tags).await?;
                    }
                    _ => {}
                }
            }
            last_position = event.position;
            processed += 1;
        }

        let checkpoint = Checkpoint {
            projection_name: name.to_string(),
            last_processed_position: last_position,
            last_updated: Utc::now(),
            total_events_processed: processed,
        };
        self.checkpoints.save(&checkpoint).await?;
        tracing::debug!(projection = name, position = last_position, "projection checkpoint advanced");
        Ok(())
    }

    /// Runs [`update`](Self::update) for every registered projection.
    pub async fn update_all(&self) -> Result<()> {
        for registered in &self.registered {
            self.update(registered.projection.name()).await?;
        }
        Ok(())
    }

    /// Drops all instances and indices, replays the full event history
    /// in order, and sets the checkpoint to the max position consumed.
    pub async fn rebuild(&self, name: &str) -> Result<()> {
        let registered = self.find(name)?;
        registered.store.reset().await?;

        let query = subscription_query(&registered.projection.event_types());
        let events = self.event_store.read(&query, None).await?;

        let mut max_position = 0;
        for event in &events {
            if let Some(key) = registered.projection.key_for(event) {
                let prior = registered.store.get(&key).await?;
                if let Some(state) = registered.projection.apply(prior, event) {
                    let tags = registered.projection.tags_for(&state);
                    registered.store.save(&key, state, tags).await?;
                } else {
                    registered.store.delete(&key).await?;
                }
            }
            max_position = event.position;
        }

        let checkpoint = Checkpoint {
            projection_name: name.to_string(),
            last_processed_position: max_position,
            last_updated: Utc::now(),
            total_events_processed: events.len() as u64,
        };
        self.checkpoints.save(&checkpoint).await?;
        tracing::info!(projection = name, events = events.len(), "projection rebuilt");
        Ok(())
    }
}

fn subscription_query(event_types: &std::collections::HashSet<String>) -> Query {
    Query::from_items(vec![QueryItem::new().with_event_types(event_types.iter().cloned())])
}
