use crate::error::Result;
use crate::event::Tag;
use crate::fsutil;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PARALLEL_THRESHOLD: usize = 10;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tags: Vec<Tag>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    data: serde_json::Value,
    #[serde(default)]
    metadata: StateMetadata,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeysFile {
    keys: Vec<String>,
}

/// Persists per-instance projection state and optional tag indices
/// over that state. Reads take no lock; writes hold a
/// per-key mutex across the state-file write and its tag-index diff.
pub struct ProjectionStore {
    name: String,
    dir: PathBuf,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ProjectionStore {
    pub fn new(context_dir: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            dir: context_dir.join("projections").join(name),
            locks: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn instance_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", fsutil::safe_segment(key)))
    }

    fn tag_index_path(&self, tag: &Tag) -> PathBuf {
        self.dir.join("indices").join(format!(
            "{}_{}.json",
            fsutil::safe_segment(&tag.key),
            fsutil::safe_segment(&tag.value)
        ))
    }

    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn load_state_file(&self, key: &str) -> Result<Option<StateFile>> {
        match fsutil::read_optional(&self.instance_path(key)).await? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(state) => Ok(Some(state)),
                Err(_) => {
                    tracing::warn!(projection = %self.name, key, "instance file corrupt, treating as absent");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Returns `None` if no instance exists for `key`.
    pub async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.load_state_file(key).await?.map(|f| f.data))
    }

    /// Reads every instance file, fanning out above
    /// [`PARALLEL_THRESHOLD`] the same way the event file manager does.
    pub async fn get_all(&self) -> Result<Vec<(String, serde_json::Value)>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(fsutil::unsafe_segment(stem));
                }
            }
        }

        if keys.len() < PARALLEL_THRESHOLD {
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(state) = self.get(&key).await? {
                    out.push((key, state));
                }
            }
            return Ok(out);
        }

        let concurrency = (std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4) * 2).max(2);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency));
        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            let dir = self.dir.clone();
            let permit = semaphore.clone().acquire_owned();
            tasks.push(tokio::spawn(async move {
                let _permit = permit.await.expect("semaphore closed");
                let path = dir.join(format!("{}.json", fsutil::safe_segment(&key)));
                let bytes = fsutil::read_optional(&path).await?;
                Ok::<_, crate::error::OpossumError>(match bytes {
                    Some(bytes) => serde_json::from_slice::<StateFile>(&bytes)
                        .ok()
                        .map(|f| (key, f.data)),
                    None => None,
                })
            }));
        }

        let mut out = Vec::with_capacity(tasks.len());
        for task in tasks {
            if let Some(pair) = task
                .await
                .map_err(|e| crate::error::OpossumError::StorageCorruption(format!("read task panicked: {e}")))??
            {
                out.push(pair);
            }
        }
        Ok(out)
    }

    async fn tag_keys(&self, tag: &Tag) -> Vec<String> {
        match fsutil::read_optional(&self.tag_index_path(tag)).await {
            Ok(Some(bytes)) => serde_json::from_slice::<KeysFile>(&bytes)
                .map(|f| f.keys)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Keys whose state carries `tag`.
    pub async fn query_by_tag(&self, tag: &Tag) -> Vec<String> {
        self.tag_keys(tag).await
    }

    /// Keys whose state carries every tag in `tags` (AND). Returns
    /// empty if any required index is missing.
    pub async fn query_by_tags(&self, tags: &[Tag]) -> Vec<String> {
        if tags.is_empty() {
            return Vec::new();
        }
        let mut result: Option<std::collections::HashSet<String>> = None;
        for tag in tags {
            let keys: std::collections::HashSet<String> = self.tag_keys(tag).await.into_iter().collect();
            if keys.is_empty() {
                return Vec::new();
            }
            result = Some(match result {
                Some(existing) => existing.intersection(&keys).cloned().collect(),
                None => keys,
            });
        }
        result.map(|set| set.into_iter().collect()).unwrap_or_default()
    }

    async fn add_to_tag_index(&self, tag: &Tag, key: &str) -> Result<()> {
        let mut keys = self.tag_keys(tag).await;
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
            let bytes = serde_json::to_vec(&KeysFile { keys })?;
            fsutil::atomic_write(&self.tag_index_path(tag), &bytes, false).await?;
        }
        Ok(())
    }

    async fn remove_from_tag_index(&self, tag: &Tag, key: &str) -> Result<()> {
        let mut keys = self.tag_keys(tag).await;
        let before = keys.len();
        keys.retain(|k| k != key);
        if keys.len() != before {
            let bytes = serde_json::to_vec(&KeysFile { keys })?;
            fsutil::atomic_write(&self.tag_index_path(tag), &bytes, false).await?;
        }
        Ok(())
    }

    /// Persists `state` under `key` along with `tags`, diffing against
    /// the prior persisted tags to keep tag indices in sync.
    pub async fn save(&self, key: &str, state: serde_json::Value, tags: Vec<Tag>) -> Result<()> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let prior_tags = self
            .load_state_file(key)
            .await?
            .map(|f| f.metadata.tags)
            .unwrap_or_default();

        let file = StateFile {
            data: state,
            metadata: StateMetadata { tags: tags.clone() },
        };
        let bytes = serde_json::to_vec(&file)?;
        fsutil::atomic_write(&self.instance_path(key), &bytes, false).await?;

        for tag in &prior_tags {
            if !tags.contains(tag) {
                self.remove_from_tag_index(tag, key).await?;
            }
        }
        for tag in &tags {
            if !prior_tags.contains(tag) {
                self.add_to_tag_index(tag, key).await?;
            }
        }
        Ok(())
    }

    /// Removes the instance file and its key from every tag index it
    /// was listed under.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let Some(prior) = self.load_state_file(key).await? else {
            return Ok(());
        };

        let path = self.instance_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        for tag in &prior.metadata.tags {
            self.remove_from_tag_index(tag, key).await?;
        }
        Ok(())
    }

    /// Drops every instance file and tag index, for [`rebuild`].
    ///
    /// [`rebuild`]: crate::projection::ProjectionManager::rebuild
    pub async fn reset(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        self.locks.clear();
        Ok(())
    }
}
