//! Durable memory: topic key -> ordered list of facts.
//!
//! The store is loaded once at startup and persisted on every mutation. Keys
//! and facts keep their insertion order and facts are never deduplicated.
//! Subscribers observe every committed state through a `watch` channel, which
//! is how the session re-injects context after a tool call.

use crate::error::MemoryError;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use std::{path::PathBuf, sync::Arc};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

pub type MemoryMap = IndexMap<String, Vec<String>>;

/// Where the memory record lives between runs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// The stored record, or `None` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<MemoryMap>, MemoryError>;
    async fn save(&self, memory: &MemoryMap) -> Result<(), MemoryError>;
    async fn remove(&self) -> Result<(), MemoryError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredFacts {
    List(Vec<String>),
    Single(String),
}

/// Parses a memory record, accepting the legacy form where a key maps to a
/// single string instead of a list.
pub fn parse_record(text: &str) -> Result<MemoryMap, MemoryError> {
    let raw: IndexMap<String, serde_json::Value> = serde_json::from_str(text)?;
    raw.into_iter()
        .map(|(key, value)| match serde_json::from_value::<StoredFacts>(value) {
            Ok(StoredFacts::List(facts)) => Ok((key, facts)),
            Ok(StoredFacts::Single(fact)) => Ok((key, vec![fact])),
            Err(_) => Err(MemoryError::InvalidRecord(format!(
                "value for '{key}' is neither a string nor a list of strings"
            ))),
        })
        .collect()
}

/// A single JSON document on disk.
#[derive(Debug, Clone)]
pub struct FileMemoryBackend {
    path: PathBuf,
}

impl FileMemoryBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl MemoryBackend for FileMemoryBackend {
    async fn load(&self) -> Result<Option<MemoryMap>, MemoryError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => parse_record(&text).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, memory: &MemoryMap) -> Result<(), MemoryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = serde_json::to_string_pretty(memory)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn remove(&self) -> Result<(), MemoryError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct MemoryStore {
    backend: Arc<dyn MemoryBackend>,
    // Serializes read-modify-write so a mutation and its persistence are atomic.
    write_lock: Mutex<()>,
    state: watch::Sender<MemoryMap>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.state.borrow().len())
            .finish()
    }
}

impl MemoryStore {
    /// Loads the persisted record. Legacy single-string values come back as
    /// one-element lists.
    pub async fn open(backend: Arc<dyn MemoryBackend>) -> Result<Self, MemoryError> {
        let memory = backend.load().await?.unwrap_or_default();
        info!(keys = memory.len(), "Memory loaded");
        let (state, _) = watch::channel(memory);
        Ok(Self {
            backend,
            write_lock: Mutex::new(()),
            state,
        })
    }

    pub fn snapshot(&self) -> MemoryMap {
        self.state.borrow().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().is_empty()
    }

    /// Receives every committed state, starting from the current one.
    pub fn subscribe(&self) -> watch::Receiver<MemoryMap> {
        self.state.subscribe()
    }

    /// Appends `fact` under `key`. The in-memory state only changes once the
    /// new record has been persisted.
    pub async fn append_fact(&self, key: &str, fact: &str) -> Result<(), MemoryError> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.snapshot();
        next.entry(key.to_string()).or_default().push(fact.to_string());
        self.backend.save(&next).await?;
        debug!(key, facts = next[key].len(), "Memory fact stored");
        self.state.send_replace(next);
        Ok(())
    }

    /// Forgets everything and removes the persisted record.
    pub async fn clear(&self) -> Result<(), MemoryError> {
        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.backend.remove().await {
            warn!(error = %e, "Failed to remove persisted memory record");
            return Err(e);
        }
        info!("Memory cleared");
        self.state.send_replace(MemoryMap::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;

    #[test]
    fn test_parse_record_normalizes_legacy_values() {
        let memory = parse_record(r#"{"name": "Alex", "goals": ["run a marathon", "learn Rust"]}"#).unwrap();
        let keys: Vec<&str> = memory.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["name", "goals"]);
        assert_eq!(memory["name"], vec!["Alex"]);
        assert_eq!(memory["goals"], vec!["run a marathon", "learn Rust"]);
    }

    #[test]
    fn test_parse_record_rejects_other_shapes() {
        assert!(matches!(
            parse_record(r#"{"age": 42}"#),
            Err(MemoryError::InvalidRecord(_))
        ));
        assert!(matches!(parse_record("[1, 2]"), Err(MemoryError::Serde(_))));
    }

    #[tokio::test]
    async fn test_append_preserves_order_without_dedup() {
        let mut backend = MockMemoryBackend::new();
        backend.expect_load().returning(|| Ok(None));
        backend.expect_save().times(3).returning(|_| Ok(()));
        let store = MemoryStore::open(Arc::new(backend)).await.unwrap();

        store.append_fact("goals", "run a marathon").await.unwrap();
        store.append_fact("name", "Alex").await.unwrap();
        store.append_fact("goals", "run a marathon").await.unwrap();

        let memory = store.snapshot();
        assert_eq!(memory.keys().collect::<Vec<_>>(), vec!["goals", "name"]);
        assert_eq!(memory["goals"], vec!["run a marathon", "run a marathon"]);
    }

    #[tokio::test]
    async fn test_failed_save_leaves_state_untouched() {
        let mut backend = MockMemoryBackend::new();
        backend.expect_load().returning(|| Ok(None));
        backend
            .expect_save()
            .returning(|_| Err(MemoryError::InvalidRecord("disk full".into())));
        let store = MemoryStore::open(Arc::new(backend)).await.unwrap();
        let mut changes = store.subscribe();

        assert!(store.append_fact("name", "Alex").await.is_err());
        assert!(store.is_empty());
        assert!(!changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_clear_removes_record_and_notifies() {
        let mut backend = MockMemoryBackend::new();
        let mut initial = MemoryMap::new();
        initial.insert("name".into(), vec!["Alex".into()]);
        backend.expect_load().return_once(move || Ok(Some(initial)));
        backend.expect_remove().times(1).returning(|| Ok(()));
        let store = MemoryStore::open(Arc::new(backend)).await.unwrap();
        let mut changes = store.subscribe();

        store.clear().await.unwrap();
        assert!(changes.has_changed().unwrap());
        assert!(changes.borrow_and_update().is_empty());
    }

    #[tokio::test]
    async fn test_save_receives_full_record() {
        let mut backend = MockMemoryBackend::new();
        backend.expect_load().returning(|| Ok(None));
        let mut expected = MemoryMap::new();
        expected.insert("work".into(), vec!["developing an AI application".into()]);
        backend
            .expect_save()
            .with(eq(expected))
            .times(1)
            .returning(|_| Ok(()));
        let store = MemoryStore::open(Arc::new(backend)).await.unwrap();
        store.append_fact("work", "developing an AI application").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_backend_round_trip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("oracle_memory.json");
        let backend = Arc::new(FileMemoryBackend::new(&path));

        let store = MemoryStore::open(backend.clone()).await.unwrap();
        assert!(store.is_empty());
        store.append_fact("name", "Alex").await.unwrap();
        store.append_fact("name", "Al").await.unwrap();

        let reopened = MemoryStore::open(backend.clone()).await.unwrap();
        assert_eq!(reopened.snapshot()["name"], vec!["Alex", "Al"]);

        reopened.clear().await.unwrap();
        assert!(!path.exists());
        reopened.clear().await.unwrap();
        assert!(MemoryStore::open(backend).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_backend_reads_legacy_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oracle_memory.json");
        std::fs::write(&path, r#"{"name": "Alex"}"#).unwrap();

        let store = MemoryStore::open(Arc::new(FileMemoryBackend::new(&path))).await.unwrap();
        store.append_fact("name", "Alexander").await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(parse_record(&written).unwrap()["name"], vec!["Alex", "Alexander"]);
        let raw: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert!(raw["name"].is_array());
    }
}
