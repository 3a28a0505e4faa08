//! Per-connection session state.
//!
//! Every accepted connection gets its own [`Session`], cloned from the
//! server's default one. Stage code reaches it through the request event
//! ([`crate::pipeline::SessionRequest::session`]) to read or switch the
//! current database. Storage itself sits behind [`KvAccessor`]; the server
//! ships no engine, only the seam a storage layer plugs into.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::StorageError;

/// Key/value access for the database a session has selected.
pub trait KvAccessor: Send + Sync {
    fn get(&self, db: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Insert or overwrite.
    fn upsert(&self, db: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Insert; fails with [`StorageError::KeyExists`] if the key is present.
    fn insert(&self, db: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Remove; fails with [`StorageError::NotFound`] if the key is absent.
    fn delete(&self, db: &str, key: &[u8]) -> Result<(), StorageError>;
}

/// Selected database plus the store it lives in.
pub struct Session {
    current_db: RwLock<Option<String>>,
    store: Option<Arc<dyn KvAccessor>>,
}

impl Session {
    pub fn new(default_db: Option<String>) -> Self {
        Self {
            current_db: RwLock::new(default_db.filter(|name| !name.is_empty())),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn KvAccessor>) -> Self {
        self.store = Some(store);
        self
    }

    /// Name of the selected database, `None` if there is none.
    pub fn current_db(&self) -> Option<String> {
        self.current_db.read().clone()
    }

    /// Select `name`; an empty name clears the selection.
    pub fn set_current_db(&self, name: &str) {
        let mut current = self.current_db.write();
        *current = (!name.is_empty()).then(|| name.to_string());
    }

    pub fn store(&self) -> Option<&Arc<dyn KvAccessor>> {
        self.store.as_ref()
    }

    /// Run `op` against the store with the selected database.
    pub fn with_db<T>(
        &self,
        op: impl FnOnce(&dyn KvAccessor, &str) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| StorageError::Backend("no store attached".to_string()))?;
        let db = self.current_db().ok_or(StorageError::NoDatabase)?;
        op(store.as_ref(), &db)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(None)
    }
}

/// A copy holds the same store and starts on the same database; selecting a
/// database on one does not affect the other.
impl Clone for Session {
    fn clone(&self) -> Self {
        Self {
            current_db: RwLock::new(self.current_db()),
            store: self.store.clone(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("current_db", &self.current_db())
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

/// In-memory store keyed by database name.
#[derive(Debug, Default)]
pub struct MemoryKv {
    dbs: Mutex<BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvAccessor for MemoryKv {
    fn get(&self, db: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.dbs.lock().get(db).and_then(|t| t.get(key).cloned()))
    }

    fn upsert(&self, db: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.dbs
            .lock()
            .entry(db.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn insert(&self, db: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut dbs = self.dbs.lock();
        let table = dbs.entry(db.to_string()).or_default();
        if table.contains_key(key) {
            return Err(StorageError::KeyExists);
        }
        table.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, db: &str, key: &[u8]) -> Result<(), StorageError> {
        self.dbs
            .lock()
            .get_mut(db)
            .and_then(|t| t.remove(key))
            .map(|_| ())
            .ok_or(StorageError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_db_can_be_read_and_switched() {
        let session = Session::new(Some("sys".to_string()));
        assert_eq!(session.current_db().as_deref(), Some("sys"));
        session.set_current_db("test");
        assert_eq!(session.current_db().as_deref(), Some("test"));
        session.set_current_db("");
        assert_eq!(session.current_db(), None);
        assert_eq!(Session::new(Some(String::new())).current_db(), None);
    }

    #[test]
    fn clones_start_on_the_same_db_and_then_diverge() {
        let prototype = Session::new(Some("sys".to_string()));
        let a = prototype.clone();
        let b = prototype.clone();
        a.set_current_db("a");
        assert_eq!(a.current_db().as_deref(), Some("a"));
        assert_eq!(b.current_db().as_deref(), Some("sys"));
        assert_eq!(prototype.current_db().as_deref(), Some("sys"));
    }

    #[test]
    fn store_operations_use_the_selected_db() {
        let store = Arc::new(MemoryKv::new());
        let session = Session::default().with_store(store.clone());
        assert_eq!(
            session.with_db(|kv, db| kv.get(db, b"k")),
            Err(StorageError::NoDatabase)
        );

        session.set_current_db("one");
        session.with_db(|kv, db| kv.insert(db, b"k", b"v1")).unwrap();
        assert_eq!(
            session.with_db(|kv, db| kv.insert(db, b"k", b"v2")),
            Err(StorageError::KeyExists)
        );
        session.with_db(|kv, db| kv.upsert(db, b"k", b"v2")).unwrap();
        assert_eq!(store.get("one", b"k").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(store.get("two", b"k").unwrap(), None);

        session.with_db(|kv, db| kv.delete(db, b"k")).unwrap();
        assert_eq!(
            session.with_db(|kv, db| kv.delete(db, b"k")),
            Err(StorageError::NotFound)
        );
    }

    #[test]
    fn session_without_store_reports_it() {
        let session = Session::new(Some("sys".to_string()));
        assert!(session.store().is_none());
        assert!(matches!(
            session.with_db(|kv, db| kv.get(db, b"k")),
            Err(StorageError::Backend(_))
        ));
    }
}
