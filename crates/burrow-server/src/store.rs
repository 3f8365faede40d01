//! Durable per-session key-value state
//!
//! Each session gets its own store holding plain JSON values plus a single
//! scheduled wake-up time. The session only relies on this trait, so the
//! backing engine can be swapped (in-memory for tests, JSON files on disk for
//! a single-node deployment).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::identity::TunnelIdentity;

/// Errors from state store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Key-value store with one scheduled wake-up, scoped to a single session
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// The pending wake-up, if one is scheduled
    async fn alarm(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Schedule the wake-up, replacing any previous one
    async fn set_alarm(&self, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn clear_alarm(&self) -> Result<(), StoreError>;
}

/// Opens the store belonging to a session identity
pub trait StoreProvider: Send + Sync {
    fn open(&self, identity: &TunnelIdentity) -> Arc<dyn StateStore>;

    /// Release stores of other days and unused empty ones; returns how many
    fn prune(&self, _today: NaiveDate) -> usize {
        0
    }
}

/// In-process store, lost on restart
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: DashMap<String, Value>,
    alarm: RwLock<Option<DateTime<Utc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// No values and no wake-up scheduled
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.alarm.read().is_none()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn alarm(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(*self.alarm.read())
    }

    async fn set_alarm(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        *self.alarm.write() = Some(at);
        Ok(())
    }

    async fn clear_alarm(&self) -> Result<(), StoreError> {
        *self.alarm.write() = None;
        Ok(())
    }
}

/// Hands out one [`MemoryStore`] per identity
///
/// A store lives until its day is over, or until it is both empty and no
/// longer open by any session.
#[derive(Default)]
pub struct MemoryStoreProvider {
    stores: DashMap<TunnelIdentity, Arc<MemoryStore>>,
}

impl MemoryStoreProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

impl StoreProvider for MemoryStoreProvider {
    fn open(&self, identity: &TunnelIdentity) -> Arc<dyn StateStore> {
        self.stores
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone()
    }

    fn prune(&self, today: NaiveDate) -> usize {
        let before = self.stores.len();
        self.stores.retain(|identity, store| {
            identity.day() == today && (Arc::strong_count(store) > 1 || !store.is_empty())
        });
        before.saturating_sub(self.stores.len())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileState {
    #[serde(default)]
    values: BTreeMap<String, Value>,
    #[serde(default)]
    alarm: Option<DateTime<Utc>>,
}

/// Store backed by a single JSON file, rewritten atomically on every change
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn load(&self) -> Result<FileState, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileState::default()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn save(&self, state: &FileState) -> Result<(), StoreError> {
        let raw = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.load().await?.values.remove(key))
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut state = self.load().await?;
        state.values.insert(key.to_string(), value);
        self.save(&state).await
    }

    async fn alarm(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.load().await?.alarm)
    }

    async fn set_alarm(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.load().await?;
        state.alarm = Some(at);
        self.save(&state).await
    }

    async fn clear_alarm(&self) -> Result<(), StoreError> {
        let mut state = self.load().await?;
        if state.alarm.take().is_some() {
            self.save(&state).await?;
        }
        Ok(())
    }
}

/// One JSON file per identity inside a state directory
pub struct FileStoreProvider {
    dir: PathBuf,
}

impl FileStoreProvider {
    /// Create the provider, making sure the directory exists
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Arc<Self>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Arc::new(Self { dir }))
    }
}

impl StoreProvider for FileStoreProvider {
    fn open(&self, identity: &TunnelIdentity) -> Arc<dyn StateStore> {
        let file_name = format!(
            "{}@{}.json",
            identity.label(),
            identity.day().format("%Y-%m-%d")
        );
        Arc::new(FileStore::new(self.dir.join(file_name)))
    }
}
