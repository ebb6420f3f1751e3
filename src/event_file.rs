use crate::error::{OpossumError, Result};
use crate::event::SequencedEvent;
use crate::fsutil;
use std::path::{Path, PathBuf};

/// Fan-out batch reads above this many positions; below it, serial is
/// faster than task-spawn overhead.
const PARALLEL_THRESHOLD: usize = 10;

/// Persists and reads individual events. Events are
/// named `events/{position:0000000000}.json`; there is no long-lived
/// file handle.
pub struct EventFileManager {
    dir: PathBuf,
}

impl EventFileManager {
    pub fn new(context_dir: &Path) -> Self {
        Self {
            dir: context_dir.join("events"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, position: i64) -> PathBuf {
        self.dir.join(format!("{:010}.json", position))
    }

    /// Serialize and write an event via the atomic write protocol:
    /// temp file, optional fsync, rename. The rename is the commit
    /// point.
    pub async fn write(&self, event: &SequencedEvent, flush: bool) -> Result<()> {
        let bytes = serde_json::to_vec(event)?;
        let path = self.path_for(event.position);
        fsutil::atomic_write(&path, &bytes, flush).await
    }

    /// Reads a single event. A missing file is a corruption signal —
    /// the caller asked for a position an index claims exists.
    pub async fn read(&self, position: i64) -> Result<SequencedEvent> {
        let path = self.path_for(position);
        let bytes = fsutil::read_optional(&path).await?.ok_or_else(|| {
            OpossumError::StorageCorruption(format!(
                "event file missing for position {}",
                position
            ))
        })?;
        let event: SequencedEvent = serde_json::from_slice(&bytes).map_err(|e| {
            OpossumError::StorageCorruption(format!(
                "event file for position {} is not valid JSON: {}",
                position, e
            ))
        })?;
        if event.position != position {
            return Err(OpossumError::StorageCorruption(format!(
                "event file {} contains position {}",
                position, event.position
            )));
        }
        Ok(event)
    }

    /// Lists every committed position found in the events directory,
    /// sorted ascending. Used to resolve [`crate::query::Query::all`]
    /// and by startup reconciliation; does not assume
    /// the sequence is contiguous.
    pub async fn list_positions(&self) -> Result<Vec<i64>> {
        let mut positions = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(positions),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(ext) = path.extension().and_then(|s| s.to_str()) else {
                continue;
            };
            if ext != "json" {
                continue;
            }
            if let Ok(position) = stem.parse::<i64>() {
                positions.push(position);
            }
        }
        positions.sort_unstable();
        Ok(positions)
    }

    /// Reads events for a sorted sequence of positions, fanning out
    /// above [`PARALLEL_THRESHOLD`], bounded to roughly twice the
    /// available CPU count.
    pub async fn read_batch(&self, positions: &[i64]) -> Result<Vec<SequencedEvent>> {
        if positions.len() < PARALLEL_THRESHOLD {
            let mut events = Vec::with_capacity(positions.len());
            for &position in positions {
                events.push(self.read(position).await?);
            }
            return Ok(events);
        }

        let concurrency = (num_cpus() * 2).max(2);
        let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(concurrency));
        let mut tasks = Vec::with_capacity(positions.len());

        for &position in positions {
            let dir = self.dir.clone();
            let permit = semaphore.clone().acquire_owned();
            tasks.push(tokio::spawn(async move {
                let _permit = permit.await.expect("semaphore closed");
                read_file(&dir, position).await
            }));
        }

        let mut events = Vec::with_capacity(tasks.len());
        for task in tasks {
            let event = task
                .await
                .map_err(|e| OpossumError::StorageCorruption(format!("read task panicked: {e}")))??;
            events.push(event);
        }
        Ok(events)
    }
}

async fn read_file(dir: &Path, position: i64) -> Result<SequencedEvent> {
    let path = dir.join(format!("{:010}.json", position));
    let bytes = fsutil::read_optional(&path).await?.ok_or_else(|| {
        OpossumError::StorageCorruption(format!("event file missing for position {}", position))
    })?;
    let event: SequencedEvent = serde_json::from_slice(&bytes).map_err(|e| {
        OpossumError::StorageCorruption(format!(
            "event file for position {} is not valid JSON: {}",
            position, e
        ))
    })?;
    Ok(event)
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventMetadata, Tag};

    fn make(position: i64) -> SequencedEvent {
        SequencedEvent {
            position,
            event: Event::new(
                "course.created",
                serde_json::json!({"capacity": 2}),
                vec![Tag::new("courseId", "C1")],
            ),
            metadata: EventMetadata::new(),
        }
    }

    #[tokio::test]
    async fn round_trips_a_single_event() {
        let dir = tempfile::tempdir().unwrap();
        let manager = EventFileManager::new(dir.path());
        let event = make(1);
        manager.write(&event, true).await.unwrap();

        let read_back = manager.read(1).await.unwrap();
        assert_eq!(read_back.position, 1);
        assert_eq!(read_back.event.event_type, "course.created");
        assert_eq!(read_back.event.tags, event.event.tags);
    }

    #[tokio::test]
    async fn missing_position_is_storage_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let manager = EventFileManager::new(dir.path());
        let err = manager.read(42).await.unwrap_err();
        assert!(matches!(err, OpossumError::StorageCorruption(_)));
    }

    #[tokio::test]
    async fn list_positions_ignores_tmp_files_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let manager = EventFileManager::new(dir.path());
        manager.write(&make(3), true).await.unwrap();
        manager.write(&make(1), true).await.unwrap();
        tokio::fs::write(manager.dir().join("0000000002.json.tmp.x"), b"{}")
            .await
            .unwrap();

        assert_eq!(manager.list_positions().await.unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn batch_read_above_threshold_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let manager = EventFileManager::new(dir.path());
        let positions: Vec<i64> = (1..=25).collect();
        for &p in &positions {
            manager.write(&make(p), false).await.unwrap();
        }

        let events = manager.read_batch(&positions).await.unwrap();
        let mut seen: Vec<i64> = events.iter().map(|e| e.position).collect();
        seen.sort_unstable();
        assert_eq!(seen, positions);
    }
}
