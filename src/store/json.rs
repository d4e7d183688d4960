//! JSON file backend: one file per collection, rewritten atomically on
//! every mutation.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{apply_add, apply_delete, apply_update, Collection, Record, StoreError};

/// Wrapper stored on disk: records + last write timestamp.
#[derive(Debug, Serialize, Deserialize)]
struct CollectionFile<R> {
    /// RFC 3339 timestamp of the last write.
    saved_at: String,
    records: R,
}

/// Collection persisted to a single JSON file.
///
/// The in-memory copy only changes after the file write succeeded, so a
/// failed write leaves both the file and the memory image untouched.
pub struct JsonCollection<T> {
    path: PathBuf,
    records: Mutex<Vec<T>>,
}

impl<T: Record> JsonCollection<T> {
    /// Load `path`, or start empty when it doesn't exist.
    ///
    /// A corrupt file is moved aside to `<path>.corrupt` and logged rather
    /// than overwritten by the next write.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let records = match std::fs::read_to_string(&path) {
            Ok(data) => match serde_json::from_str::<CollectionFile<Vec<T>>>(&data) {
                Ok(file) => file.records,
                Err(e) => {
                    let backup = path.with_extension("json.corrupt");
                    tracing::warn!(
                        "corrupt {} store at {}, moving it to {}: {e}",
                        T::COLLECTION,
                        path.display(),
                        backup.display()
                    );
                    std::fs::rename(&path, &backup)?;
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate(&self, op: impl FnOnce(&mut Vec<T>) -> Result<(), StoreError>) -> Result<(), StoreError> {
        let mut guard = self.records.lock();
        let mut next = guard.clone();
        op(&mut next)?;
        persist(&self.path, &next)?;
        *guard = next;
        Ok(())
    }
}

/// Write to `<path>.tmp`, then rename over `path`.
fn persist<T: Serialize>(path: &Path, records: &[T]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = CollectionFile {
        saved_at: chrono::Utc::now().to_rfc3339(),
        records,
    };
    let json = serde_json::to_string_pretty(&file)?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json.as_bytes())?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

impl<T: Record> Collection<T> for JsonCollection<T> {
    fn add(&self, record: &T) -> Result<(), StoreError> {
        self.mutate(|records| apply_add(records, record))
    }

    fn get(&self, id: &str) -> Result<Option<T>, StoreError> {
        Ok(self.records.lock().iter().find(|r| r.id() == id).cloned())
    }

    fn list(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.records.lock().clone())
    }

    fn update(&self, record: &T) -> Result<(), StoreError> {
        self.mutate(|records| apply_update(records, record))
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|records| apply_delete(records, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Protocol, Server, Subscription};

    fn sample(id: &str, port: u16) -> Server {
        Server::new(format!("node-{id}"), "edge.example.com", port, Protocol::Shadowsocks)
            .with_id(id)
            .with_param("method", "aes-256-gcm")
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");

        let c = JsonCollection::<Server>::open(path.clone()).unwrap();
        c.add(&sample("a", 8388)).unwrap();
        c.add(&sample("b", 8389)).unwrap();
        let mut b = sample("b", 9000);
        b.name = "renamed".into();
        c.update(&b).unwrap();
        drop(c);

        let reopened = JsonCollection::<Server>::open(path).unwrap();
        let all = reopened.list().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "a");
        assert_eq!(all[1].name, "renamed");
        assert_eq!(all[1].port, 9000);
        assert_eq!(all[0].param_str("method").as_deref(), Some("aes-256-gcm"));
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let c = JsonCollection::<Subscription>::open(dir.path().join("nope.json")).unwrap();
        assert!(c.list().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(&path, "not valid json {{{").unwrap();

        let c = JsonCollection::<Server>::open(path.clone()).unwrap();
        assert!(c.list().unwrap().is_empty());
        assert!(dir.path().join("servers.json.corrupt").exists());
        assert!(!path.exists());
    }

    #[test]
    fn failed_mutation_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let c = JsonCollection::<Server>::open(dir.path().join("servers.json")).unwrap();
        c.add(&sample("a", 1)).unwrap();
        assert!(c.add(&sample("a", 2)).is_err());
        let all = c.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].port, 1);
    }
}
