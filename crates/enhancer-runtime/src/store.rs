use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use enhancer_config::Store as StoreConfig;
use enhancer_contracts::{ChannelId, LabelDocument, OverrideDocument, StoredLabel};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

pub const LABELS_DOCUMENT: &str = "channel_cache";
pub const OVERRIDES_DOCUMENT: &str = "nicknames";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("open store failed: {0}")]
    Open(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("store document encoding failed: {0}")]
    Encode(String),
}

#[derive(Default)]
pub struct MemoryStore {
    documents: HashMap<String, Value>,
}

pub struct SqliteStore {
    conn: Connection,
}

/// Durable documents, each read and rewritten whole. Last writer wins.
pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl StoreBackend {
    pub fn from_config(cfg: &StoreConfig) -> Result<Self, StoreError> {
        if cfg.kind == "sqlite" {
            let path = cfg.sqlite_path.as_deref().ok_or_else(|| {
                StoreError::Open("store.sqlite_path is required for sqlite store".to_string())
            })?;
            Ok(StoreBackend::Sqlite(SqliteStore::new(path)?))
        } else {
            Ok(StoreBackend::Memory(MemoryStore::default()))
        }
    }

    pub fn load_labels(&self) -> Result<LabelDocument, StoreError> {
        self.read_document(LABELS_DOCUMENT)
    }

    pub fn save_label(&mut self, key: &ChannelId, stored: StoredLabel) -> Result<(), StoreError> {
        let mut labels = self.load_labels()?;
        labels.insert(key.clone(), stored);
        self.write_document(LABELS_DOCUMENT, &labels)
    }

    pub fn clear_labels(&mut self) -> Result<(), StoreError> {
        self.remove_document(LABELS_DOCUMENT)
    }

    pub fn load_overrides(&self) -> Result<OverrideDocument, StoreError> {
        self.read_document(OVERRIDES_DOCUMENT)
    }

    /// Blank labels remove the override.
    pub fn set_override(&mut self, key: &ChannelId, label: &str) -> Result<(), StoreError> {
        let mut overrides = self.load_overrides()?;
        let label = label.trim();
        if label.is_empty() {
            overrides.remove(key);
        } else {
            overrides.insert(key.clone(), label.to_string());
        }
        self.write_document(OVERRIDES_DOCUMENT, &overrides)
    }

    pub fn remove_override(&mut self, key: &ChannelId) -> Result<(), StoreError> {
        self.set_override(key, "")
    }

    fn read_document<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T, StoreError> {
        let raw = match self {
            StoreBackend::Memory(store) => store.documents.get(name).cloned(),
            StoreBackend::Sqlite(store) => store.read(name)?,
        };
        match raw {
            Some(v) => serde_json::from_value(v).map_err(|e| StoreError::Encode(e.to_string())),
            None => Ok(T::default()),
        }
    }

    fn write_document<T: Serialize>(&mut self, name: &str, doc: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(doc).map_err(|e| StoreError::Encode(e.to_string()))?;
        match self {
            StoreBackend::Memory(store) => {
                store.documents.insert(name.to_string(), value);
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.write(name, &value),
        }
    }

    fn remove_document(&mut self, name: &str) -> Result<(), StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                store.documents.remove(name);
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.remove(name),
        }
    }
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Open(e.to_string()))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                name TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| StoreError::Open(e.to_string()))?;
        Ok(Self { conn })
    }

    fn read(&self, name: &str) -> Result<Option<Value>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM documents WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Query(e.to_string()))?;
        match body {
            Some(v) => serde_json::from_str(&v)
                .map(Some)
                .map_err(|e| StoreError::Encode(e.to_string())),
            None => Ok(None),
        }
    }

    fn write(&mut self, name: &str, body: &Value) -> Result<(), StoreError> {
        let json = serde_json::to_string(body).map_err(|e| StoreError::Encode(e.to_string()))?;
        self.conn
            .execute(
                "
                INSERT INTO documents(name, body, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(name) DO UPDATE SET
                    body=excluded.body,
                    updated_at=excluded.updated_at
                ",
                params![name, json, Utc::now().to_rfc3339()],
            )
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM documents WHERE name = ?1", params![name])
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn break_for_test(&self) {
        self.conn
            .execute_batch("DROP TABLE documents;")
            .expect("drop documents table");
    }
}

/// Shared store handle for the engine. The first failure on an engine-side
/// operation switches it to degraded mode, after which the engine works from
/// memory only. Collaborator writes always reach the backend and return
/// their error.
#[derive(Clone)]
pub struct Persistence {
    backend: Arc<Mutex<StoreBackend>>,
    degraded: Arc<AtomicBool>,
}

impl Persistence {
    pub fn new(backend: StoreBackend) -> Self {
        Self {
            backend: Arc::new(Mutex::new(backend)),
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub async fn load_labels(&self) -> Option<LabelDocument> {
        self.guarded("load_labels", |store| store.load_labels())
            .await
    }

    pub async fn save_label(&self, key: &ChannelId, stored: StoredLabel) {
        self.guarded("save_label", |store| store.save_label(key, stored))
            .await;
    }

    pub async fn clear_labels(&self) {
        self.guarded("clear_labels", |store| store.clear_labels())
            .await;
    }

    pub async fn load_overrides(&self) -> Option<OverrideDocument> {
        self.guarded("load_overrides", |store| store.load_overrides())
            .await
    }

    pub async fn set_override(&self, key: &ChannelId, label: &str) -> Result<(), StoreError> {
        self.backend.lock().await.set_override(key, label)
    }

    pub async fn remove_override(&self, key: &ChannelId) -> Result<(), StoreError> {
        self.backend.lock().await.remove_override(key)
    }

    async fn guarded<T>(
        &self,
        operation: &'static str,
        op: impl FnOnce(&mut StoreBackend) -> Result<T, StoreError>,
    ) -> Option<T> {
        if self.is_degraded() {
            return None;
        }
        let mut backend = self.backend.lock().await;
        match op(&mut *backend) {
            Ok(v) => Some(v),
            Err(err) => {
                self.degraded.store(true, Ordering::Relaxed);
                warn!(
                    operation,
                    error = %err,
                    "persistent store failed; continuing with in-memory state only"
                );
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn break_for_test(&self) {
        if let StoreBackend::Sqlite(store) = &*self.backend.lock().await {
            store.break_for_test();
        }
    }
}
