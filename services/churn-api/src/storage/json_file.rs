use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{assign_ids, ResultStore, UserRegistry};
use crate::error::StorageError;
use crate::record::{PredictionResult, UserId};

/// On-disk shape of `userdata.json`; keys are decimal user ids.
type ResultDoc = BTreeMap<String, PredictionResult>;

/// Registry as a JSON array, results as a JSON object. A missing file reads
/// as empty; every mutation rewrites the whole file via temp-file + rename.
pub struct JsonFileStorage {
    users_path: PathBuf,
    results_path: PathBuf,
    first_user_id: UserId,
    lock: Mutex<()>,
}

impl JsonFileStorage {
    pub fn open(users_path: &Path, results_path: &Path, first_user_id: UserId) -> Result<Self, StorageError> {
        for p in [users_path, results_path] {
            if let Some(dir) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;
            }
        }
        Ok(Self {
            users_path: users_path.to_path_buf(),
            results_path: results_path.to_path_buf(),
            first_user_id,
            lock: Mutex::new(()),
        })
    }

    fn read_users(&self) -> Result<Vec<UserId>, StorageError> { read_json(&self.users_path) }
    fn read_results(&self) -> Result<ResultDoc, StorageError> { read_json(&self.results_path) }
}

fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StorageError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    serde_json::from_slice(&bytes).map_err(|source| StorageError::Corrupt { location: path.display().to_string(), source })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let buf = serde_json::to_vec_pretty(value)
        .map_err(|source| StorageError::Corrupt { location: path.display().to_string(), source })?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, buf).map_err(|e| StorageError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))
}

impl UserRegistry for JsonFileStorage {
    fn allocate_batch(&self, requested: &[Option<UserId>]) -> Result<Vec<UserId>, StorageError> {
        let _guard = self.lock.lock();
        let mut users = self.read_users()?;
        let known: HashSet<UserId> = users.iter().copied().collect();
        let a = assign_ids(requested, users.iter().copied().max(), self.first_user_id, |id| Ok(known.contains(&id)))?;
        if !a.added.is_empty() {
            users.extend_from_slice(&a.added);
            write_json(&self.users_path, &users)?;
            debug!(added = a.added.len(), total = users.len(), "registry updated");
        }
        Ok(a.assigned)
    }

    fn users(&self) -> Result<Vec<UserId>, StorageError> {
        let _guard = self.lock.lock();
        self.read_users()
    }

    fn remove(&self, id: UserId) -> Result<bool, StorageError> {
        let _guard = self.lock.lock();
        let mut users = self.read_users()?;
        let before = users.len();
        users.retain(|u| *u != id);
        if users.len() == before {
            return Ok(false);
        }
        write_json(&self.users_path, &users)?;
        Ok(true)
    }
}

impl ResultStore for JsonFileStorage {
    fn get(&self, id: UserId) -> Result<Option<PredictionResult>, StorageError> {
        let _guard = self.lock.lock();
        Ok(self.read_results()?.remove(&id.to_string()))
    }

    fn merge(&self, entries: &BTreeMap<UserId, PredictionResult>) -> Result<(), StorageError> {
        let _guard = self.lock.lock();
        let mut doc = self.read_results()?;
        doc.extend(entries.iter().map(|(k, v)| (k.to_string(), v.clone())));
        write_json(&self.results_path, &doc)
    }

    fn remove(&self, id: UserId) -> Result<bool, StorageError> {
        let _guard = self.lock.lock();
        let mut doc = self.read_results()?;
        if doc.remove(&id.to_string()).is_none() {
            return Ok(false);
        }
        write_json(&self.results_path, &doc)?;
        Ok(true)
    }
}
