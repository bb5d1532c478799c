use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use super::{assign_ids, ResultStore, UserRegistry};
use crate::error::StorageError;
use crate::record::{PredictionResult, UserId};

const USERS_TREE: &str = "users";
const RESULTS_TREE: &str = "results";

/// Embedded key-value backend. Keys are big-endian user ids so the users
/// tree iterates in numeric order and `last()` is the current maximum.
pub struct SledStorage {
    db: sled::Db,
    users: sled::Tree,
    results: sled::Tree,
    first_user_id: UserId,
    alloc_lock: Mutex<()>,
}

fn key(id: UserId) -> [u8; 8] { id.to_be_bytes() }

fn decode_key(raw: &[u8], tree: &'static str) -> Result<UserId, StorageError> {
    let bytes: [u8; 8] = raw.try_into().map_err(|_| StorageError::MalformedKey { tree })?;
    Ok(UserId::from_be_bytes(bytes))
}

impl SledStorage {
    pub fn open(path: &Path, first_user_id: UserId) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let users = db.open_tree(USERS_TREE)?;
        let results = db.open_tree(RESULTS_TREE)?;
        info!(path = %path.display(), users = users.len(), results = results.len(), "sled storage opened");
        Ok(Self { db, users, results, first_user_id, alloc_lock: Mutex::new(()) })
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl UserRegistry for SledStorage {
    fn allocate_batch(&self, requested: &[Option<UserId>]) -> Result<Vec<UserId>, StorageError> {
        let _guard = self.alloc_lock.lock();
        let current_max = match self.users.last()? {
            Some((k, _)) => Some(decode_key(&k, USERS_TREE)?),
            None => None,
        };
        let a = assign_ids(requested, current_max, self.first_user_id, |id| Ok(self.users.contains_key(key(id))?))?;
        if !a.added.is_empty() {
            let mut batch = sled::Batch::default();
            for id in &a.added {
                batch.insert(key(*id).to_vec(), Vec::<u8>::new());
            }
            self.users.apply_batch(batch)?;
            self.flush()?;
        }
        Ok(a.assigned)
    }

    fn users(&self) -> Result<Vec<UserId>, StorageError> {
        self.users
            .iter()
            .keys()
            .map(|k| decode_key(&k?, USERS_TREE))
            .collect()
    }

    fn remove(&self, id: UserId) -> Result<bool, StorageError> {
        let _guard = self.alloc_lock.lock();
        let existed = self.users.remove(key(id))?.is_some();
        if existed {
            self.flush()?;
        }
        Ok(existed)
    }
}

impl ResultStore for SledStorage {
    fn get(&self, id: UserId) -> Result<Option<PredictionResult>, StorageError> {
        match self.results.get(key(id))? {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|source| StorageError::Corrupt { location: format!("{RESULTS_TREE}/{id}"), source }),
            None => Ok(None),
        }
    }

    fn merge(&self, entries: &BTreeMap<UserId, PredictionResult>) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        for (id, result) in entries {
            let value = serde_json::to_vec(result)
                .map_err(|source| StorageError::Corrupt { location: format!("{RESULTS_TREE}/{id}"), source })?;
            batch.insert(key(*id).to_vec(), value);
        }
        self.results.apply_batch(batch)?;
        self.flush()
    }

    fn remove(&self, id: UserId) -> Result<bool, StorageError> {
        let existed = self.results.remove(key(id))?.is_some();
        if existed {
            self.flush()?;
        }
        Ok(existed)
    }
}
