use crate::error::Result;
use crate::fsutil;
use std::path::{Path, PathBuf};

/// Merge two sorted, deduplicated position lists into their union.
pub fn union(a: &[i64], b: &[i64]) -> Vec<i64> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

/// Intersect two sorted, deduplicated position lists.
pub fn intersection(a: &[i64], b: &[i64]) -> Vec<i64> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

fn insert_sorted_unique(positions: &mut Vec<i64>, position: i64) {
    match positions.binary_search(&position) {
        Ok(_) => {}
        Err(insert_at) => positions.insert(insert_at, position),
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Default)]
struct IndexFile {
    positions: Vec<i64>,
}

/// Append-only sorted set of positions, persisted as one JSON file per
/// key. Shared by the event-type and tag index
/// families. Indices are never fsynced: they are deterministically
/// rebuildable from event files, so a corrupt or stale index degrades
/// to empty rather than failing the read.
struct PositionFile {
    path: PathBuf,
}

impl PositionFile {
    async fn load(&self) -> Vec<i64> {
        match fsutil::read_optional(&self.path).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<IndexFile>(&bytes) {
                Ok(file) => file.positions,
                Err(_) => {
                    tracing::warn!(path = %self.path.display(), "index file corrupt, treating as empty");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(_) => Vec::new(),
        }
    }

    async fn add(&self, position: i64) -> Result<()> {
        let mut positions = self.load().await;
        insert_sorted_unique(&mut positions, position);
        let bytes = serde_json::to_vec(&IndexFile { positions })?;
        fsutil::atomic_write(&self.path, &bytes, false).await
    }
}

/// `indices/eventtype/{safe(eventType)}.json` — one file per event
/// type encountered.
pub struct EventTypeIndex {
    dir: PathBuf,
}

impl EventTypeIndex {
    pub fn new(context_dir: &Path) -> Self {
        Self {
            dir: context_dir.join("indices").join("eventtype"),
        }
    }

    fn file(&self, event_type: &str) -> PositionFile {
        PositionFile {
            path: self.dir.join(format!("{}.json", fsutil::safe_segment(event_type))),
        }
    }

    pub async fn add(&self, event_type: &str, position: i64) -> Result<()> {
        self.file(event_type).add(position).await
    }

    pub async fn positions(&self, event_type: &str) -> Vec<i64> {
        self.file(event_type).load().await
    }

    /// Number of distinct event types with at least one indexed
    /// position. Used for [`crate::store::StoreStats`].
    pub async fn distinct_count(&self) -> usize {
        count_entries(&self.dir).await
    }
}

/// `indices/tag/{safe(key)}_{safe(value)}.json` — one file per
/// distinct `(key, value)` pair encountered.
pub struct TagIndex {
    dir: PathBuf,
}

impl TagIndex {
    pub fn new(context_dir: &Path) -> Self {
        Self {
            dir: context_dir.join("indices").join("tag"),
        }
    }

    fn file(&self, key: &str, value: &str) -> PositionFile {
        PositionFile {
            path: self.dir.join(format!(
                "{}_{}.json",
                fsutil::safe_segment(key),
                fsutil::safe_segment(value)
            )),
        }
    }

    pub async fn add(&self, key: &str, value: &str, position: i64) -> Result<()> {
        self.file(key, value).add(position).await
    }

    pub async fn positions(&self, key: &str, value: &str) -> Vec<i64> {
        self.file(key, value).load().await
    }

    /// Number of distinct `(key, value)` pairs with at least one
    /// indexed position.
    pub async fn distinct_count(&self) -> usize {
        count_entries(&self.dir).await
    }
}

async fn count_entries(dir: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    let mut count = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
            count += 1;
        }
    }
    count
}

/// Composes the event-type and tag index families for a context.
pub struct IndexManager {
    pub event_type: EventTypeIndex,
    pub tag: TagIndex,
}

impl IndexManager {
    pub fn new(context_dir: &Path) -> Self {
        Self {
            event_type: EventTypeIndex::new(context_dir),
            tag: TagIndex::new(context_dir),
        }
    }

    /// Adds `position` to the event-type index and every tag index
    /// declared by `event`.
    pub async fn index_event(
        &self,
        event_type: &str,
        tags: &[crate::event::Tag],
        position: i64,
    ) -> Result<()> {
        self.event_type.add(event_type, position).await?;
        for tag in tags {
            self.tag.add(&tag.key, &tag.value, position).await?;
        }
        Ok(())
    }

    /// Union of positions across a set of event types.
    /// An empty set yields the empty set (the caller combines this
    /// with the tag side per the item's combination rule).
    pub async fn type_union(&self, event_types: &std::collections::HashSet<String>) -> Vec<i64> {
        let mut acc: Option<Vec<i64>> = None;
        for event_type in event_types {
            let positions = self.event_type.positions(event_type).await;
            acc = Some(match acc {
                Some(existing) => union(&existing, &positions),
                None => positions,
            });
        }
        acc.unwrap_or_default()
    }

    /// Intersection of positions across a set of tags.
    pub async fn tag_intersection(
        &self,
        tags: &std::collections::HashSet<(String, String)>,
    ) -> Vec<i64> {
        let mut acc: Option<Vec<i64>> = None;
        for (key, value) in tags {
            let positions = self.tag.positions(key, value).await;
            acc = Some(match acc {
                Some(existing) => intersection(&existing, &positions),
                None => positions,
            });
        }
        acc.unwrap_or_default()
    }

    /// Confirms every position in `all_positions` appears in its
    /// expected event-type index. Returns the positions found missing from their
    /// index, if any.
    pub async fn verify(
        &self,
        events: &[crate::event::SequencedEvent],
    ) -> Vec<(i64, &'static str)> {
        let mut missing = Vec::new();
        for event in events {
            let type_positions = self.event_type.positions(event.event_type()).await;
            if type_positions.binary_search(&event.position).is_err() {
                missing.push((event.position, "eventtype"));
            }
            for tag in event.tags() {
                let tag_positions = self.tag.positions(&tag.key, &tag.value).await;
                if tag_positions.binary_search(&event.position).is_err() {
                    missing.push((event.position, "tag"));
                }
            }
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_merges_and_dedupes() {
        assert_eq!(union(&[1, 3, 5], &[2, 3, 4]), vec![1, 2, 3, 4, 5]);
        assert_eq!(union(&[], &[1, 2]), vec![1, 2]);
    }

    #[test]
    fn intersection_keeps_common_only() {
        assert_eq!(intersection(&[1, 2, 3], &[2, 3, 4]), vec![2, 3]);
        assert_eq!(intersection(&[1, 2], &[3, 4]), Vec::<i64>::new());
    }

    #[tokio::test]
    async fn add_is_sorted_and_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let index = EventTypeIndex::new(dir.path());
        index.add("course.created", 5).await.unwrap();
        index.add("course.created", 1).await.unwrap();
        index.add("course.created", 5).await.unwrap();

        assert_eq!(index.positions("course.created").await, vec![1, 5]);
    }

    #[tokio::test]
    async fn missing_index_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = EventTypeIndex::new(dir.path());
        assert_eq!(index.positions("never.seen").await, Vec::<i64>::new());
    }

    #[tokio::test]
    async fn corrupt_index_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = EventTypeIndex::new(dir.path());
        let path = dir
            .path()
            .join("indices")
            .join("eventtype")
            .join("course.created.json");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"not json").await.unwrap();

        assert_eq!(index.positions("course.created").await, Vec::<i64>::new());
    }

    #[tokio::test]
    async fn tag_index_key_value_escaping_is_injective() {
        let dir = tempfile::tempdir().unwrap();
        let index = TagIndex::new(dir.path());
        index.add("courseId", "C1", 1).await.unwrap();
        index.add("course", "Id_C1", 2).await.unwrap();

        assert_eq!(index.positions("courseId", "C1").await, vec![1]);
        assert_eq!(index.positions("course", "Id_C1").await, vec![2]);
    }

    /// `("a_b", "c")` and `("a", "b_c")` would both resolve to
    /// `a_b_c.json` if the `_` in an escaped key/value weren't itself
    /// escaped. Distinct pairs must never share a position list.
    #[tokio::test]
    async fn tag_index_does_not_collide_across_the_key_value_separator() {
        let dir = tempfile::tempdir().unwrap();
        let index = TagIndex::new(dir.path());
        index.add("a_b", "c", 1).await.unwrap();
        index.add("a", "b_c", 2).await.unwrap();

        assert_eq!(index.positions("a_b", "c").await, vec![1]);
        assert_eq!(index.positions("a", "b_c").await, vec![2]);
    }
}
