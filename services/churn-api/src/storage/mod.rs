//! Persistence for the user registry and the result store.
//!
//! Two backends share the traits below: flat JSON files (the default, fully
//! rewritten on each mutation) and an embedded sled database. Each backend
//! serialises its own read-modify-write cycles behind an in-process mutex;
//! nothing coordinates separate processes.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::config::{ServiceConfig, StorageBackend};
use crate::error::StorageError;
use crate::record::{PredictionResult, UserId};

mod json_file;
mod sled_store;

pub use json_file::JsonFileStorage;
pub use sled_store::SledStorage;

/// The persisted set of known user ids.
pub trait UserRegistry: Send + Sync {
    /// Resolves each requested id in order, with one persist for the batch.
    /// `None` allocates max(known)+1; `Some(id)` is recorded if new and
    /// returned unchanged.
    fn allocate_batch(&self, requested: &[Option<UserId>]) -> Result<Vec<UserId>, StorageError>;

    fn allocate_or_validate(&self, requested: Option<UserId>) -> Result<UserId, StorageError> {
        self.allocate_batch(&[requested])?
            .pop()
            .ok_or(StorageError::IdSpaceExhausted)
    }

    fn users(&self) -> Result<Vec<UserId>, StorageError>;

    /// Returns false when the id was not registered.
    fn remove(&self, id: UserId) -> Result<bool, StorageError>;
}

/// Last prediction per user.
pub trait ResultStore: Send + Sync {
    fn get(&self, id: UserId) -> Result<Option<PredictionResult>, StorageError>;

    /// Last-write-wins upsert of every entry, written once.
    fn merge(&self, entries: &BTreeMap<UserId, PredictionResult>) -> Result<(), StorageError>;

    /// Returns false when there was nothing stored for `id`.
    fn remove(&self, id: UserId) -> Result<bool, StorageError>;
}

pub struct Storage {
    pub registry: Arc<dyn UserRegistry>,
    pub results: Arc<dyn ResultStore>,
}

impl Storage {
    pub fn open(cfg: &ServiceConfig) -> Result<Self, StorageError> {
        match cfg.storage_backend {
            StorageBackend::Json => {
                let s = Arc::new(JsonFileStorage::open(&cfg.users_path, &cfg.results_path, cfg.first_user_id)?);
                Ok(Self { registry: s.clone(), results: s })
            }
            StorageBackend::Sled => {
                let s = Arc::new(SledStorage::open(&cfg.sled_path, cfg.first_user_id)?);
                Ok(Self { registry: s.clone(), results: s })
            }
        }
    }
}

/// Outcome of resolving a batch against the known ids.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Assignment {
    pub assigned: Vec<UserId>,
    /// Ids not previously known, in first-seen order.
    pub added: Vec<UserId>,
}

pub(crate) fn assign_ids<F>(
    requested: &[Option<UserId>],
    current_max: Option<UserId>,
    first_id: UserId,
    mut is_known: F,
) -> Result<Assignment, StorageError>
where
    F: FnMut(UserId) -> Result<bool, StorageError>,
{
    let mut max = current_max;
    let mut out = Assignment::default();
    let mut fresh = HashSet::new();
    for req in requested {
        let id = match (req, max) {
            (Some(id), _) => *id,
            (None, Some(m)) => m.checked_add(1).ok_or(StorageError::IdSpaceExhausted)?,
            (None, None) => first_id,
        };
        if !fresh.contains(&id) && !is_known(id)? {
            fresh.insert(id);
            out.added.push(id);
        }
        max = Some(max.map_or(id, |m| m.max(id)));
        out.assigned.push(id);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(set: &'static [UserId]) -> impl FnMut(UserId) -> Result<bool, StorageError> {
        move |id| Ok(set.contains(&id))
    }

    #[test]
    fn empty_registry_starts_at_base() {
        let a = assign_ids(&[None, None], None, 1, known(&[])).unwrap();
        assert_eq!(a.assigned, vec![1, 2]);
        assert_eq!(a.added, vec![1, 2]);
    }

    #[test]
    fn supplied_ids_raise_the_next_allocation() {
        let a = assign_ids(&[None, Some(100), None, Some(3)], Some(5), 1, known(&[3, 5])).unwrap();
        assert_eq!(a.assigned, vec![6, 100, 101, 3]);
        assert_eq!(a.added, vec![6, 100, 101]);
    }

    #[test]
    fn repeated_ids_are_added_once() {
        let a = assign_ids(&[Some(7), Some(7)], None, 1, known(&[])).unwrap();
        assert_eq!(a.assigned, vec![7, 7]);
        assert_eq!(a.added, vec![7]);
    }

    #[test]
    fn overflow_is_reported() {
        let err = assign_ids(&[None], Some(UserId::MAX), 1, known(&[])).unwrap_err();
        assert!(matches!(err, StorageError::IdSpaceExhausted));
    }
}
