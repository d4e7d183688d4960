use parking_lot::RwLock;

use super::{apply_add, apply_delete, apply_update, Collection, Record, StoreError};

/// Volatile collection, used for tests and ephemeral sessions.
pub struct MemoryCollection<T> {
    records: RwLock<Vec<T>>,
}

impl<T: Record> MemoryCollection<T> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }
}

impl<T: Record> Default for MemoryCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record> Collection<T> for MemoryCollection<T> {
    fn add(&self, record: &T) -> Result<(), StoreError> {
        apply_add(&mut self.records.write(), record)
    }

    fn get(&self, id: &str) -> Result<Option<T>, StoreError> {
        Ok(self.records.read().iter().find(|r| r.id() == id).cloned())
    }

    fn list(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.records.read().clone())
    }

    fn update(&self, record: &T) -> Result<(), StoreError> {
        apply_update(&mut self.records.write(), record)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        apply_delete(&mut self.records.write(), id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Protocol, Server};

    fn server(id: &str) -> Server {
        Server::new(id, "h.example.com", 443, Protocol::Trojan).with_id(id)
    }

    #[test]
    fn list_preserves_insertion_order() {
        let c = MemoryCollection::<Server>::new();
        c.add(&server("b")).unwrap();
        c.add(&server("a")).unwrap();
        c.add(&server("c")).unwrap();
        let ids: Vec<String> = c.list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn duplicate_and_missing_keys_are_reported() {
        let c = MemoryCollection::<Server>::new();
        c.add(&server("a")).unwrap();
        assert!(matches!(
            c.add(&server("a")),
            Err(StoreError::DuplicateKey(id)) if id == "a"
        ));
        assert!(matches!(
            c.update(&server("zz")),
            Err(StoreError::MissingKey { collection: "server", .. })
        ));
        assert!(c.delete("zz").is_err());
        c.delete("a").unwrap();
        assert!(c.get("a").unwrap().is_none());
    }
}
