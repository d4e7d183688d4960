//! Persistence capability used by the registry and the subscription importer.
//!
//! Only `add/get/list/update/delete` semantics keyed by record id are
//! required; the backing format is up to the implementation. Two backends
//! ship here: an in-memory one and a JSON file per collection.

mod json;
mod memory;

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::model::{Server, Subscription};

pub use json::JsonCollection;
pub use memory::MemoryCollection;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record already exists: {0}")]
    DuplicateKey(String),

    #[error("{collection} not found: {id}")]
    MissingKey { collection: &'static str, id: String },
}

/// A record that can live in a [`Collection`].
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Singular collection name used in errors and file names.
    const COLLECTION: &'static str;

    fn id(&self) -> &str;
}

impl Record for Server {
    const COLLECTION: &'static str = "server";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Subscription {
    const COLLECTION: &'static str = "subscription";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Id-keyed collection. `list` returns records in insertion order.
pub trait Collection<T: Record>: Send + Sync {
    fn add(&self, record: &T) -> Result<(), StoreError>;
    fn get(&self, id: &str) -> Result<Option<T>, StoreError>;
    fn list(&self) -> Result<Vec<T>, StoreError>;
    fn update(&self, record: &T) -> Result<(), StoreError>;
    fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// The two logical collections the client persists.
#[derive(Clone)]
pub struct Store {
    pub servers: Arc<dyn Collection<Server>>,
    pub subscriptions: Arc<dyn Collection<Subscription>>,
}

impl Store {
    pub fn in_memory() -> Self {
        Self {
            servers: Arc::new(MemoryCollection::<Server>::new()),
            subscriptions: Arc::new(MemoryCollection::<Subscription>::new()),
        }
    }

    /// Open (or create) `servers.json` and `subscriptions.json` under `dir`.
    pub fn open_json(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            servers: Arc::new(JsonCollection::<Server>::open(dir.join("servers.json"))?),
            subscriptions: Arc::new(JsonCollection::<Subscription>::open(
                dir.join("subscriptions.json"),
            )?),
        })
    }
}

/// Shared mutation rules for the vector-backed collections.
pub(crate) fn apply_add<T: Record>(records: &mut Vec<T>, record: &T) -> Result<(), StoreError> {
    if records.iter().any(|r| r.id() == record.id()) {
        return Err(StoreError::DuplicateKey(record.id().to_string()));
    }
    records.push(record.clone());
    Ok(())
}

pub(crate) fn apply_update<T: Record>(records: &mut [T], record: &T) -> Result<(), StoreError> {
    let slot = records
        .iter_mut()
        .find(|r| r.id() == record.id())
        .ok_or_else(|| StoreError::MissingKey {
            collection: T::COLLECTION,
            id: record.id().to_string(),
        })?;
    *slot = record.clone();
    Ok(())
}

pub(crate) fn apply_delete<T: Record>(records: &mut Vec<T>, id: &str) -> Result<(), StoreError> {
    let idx = records
        .iter()
        .position(|r| r.id() == id)
        .ok_or_else(|| StoreError::MissingKey {
            collection: T::COLLECTION,
            id: id.to_string(),
        })?;
    records.remove(idx);
    Ok(())
}
