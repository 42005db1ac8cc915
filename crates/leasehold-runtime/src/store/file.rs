//! File-backed store.
//!
//! Each record is a pretty-printed JSON file named after its UUID:
//!
//! ```text
//! ~/.leasehold/data/
//! ├── slices/550e8400-e29b-41d4-a716-446655440000.json
//! ├── reservations/...
//! └── delegations/...
//! ```

use super::{ActorStore, StoreError, StoredRecord};
use crate::delegation::DelegationRecord;
use crate::reservation::ReservationRecord;
use crate::slice::Slice;
use leasehold_types::{DelegationId, ReservationId, SliceId};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// [`ActorStore`] writing one JSON file per record.
///
/// # Features
///
/// - Atomic writes (write to a dot-prefixed temp file, then rename)
/// - Automatic directory creation
/// - Unreadable files are skipped with a warning on listing
///
/// # Example
///
/// ```no_run
/// use leasehold_runtime::store::{ActorStore, FileStore};
///
/// let store = FileStore::new("~/.leasehold/data")?;
/// println!("{} slices", store.slices()?.len());
/// # Ok::<(), leasehold_runtime::store::StoreError>(())
/// ```
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Opens (and creates if needed) a store rooted at `base_path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DirectoryCreation`] if a directory cannot be created.
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_path = expand_tilde(base_path.as_ref());
        for kind in [
            <Slice as StoredRecord>::KIND,
            <ReservationRecord as StoredRecord>::KIND,
            <DelegationRecord as StoredRecord>::KIND,
        ] {
            let dir = base_path.join(kind);
            if !dir.exists() {
                fs::create_dir_all(&dir).map_err(|source| StoreError::DirectoryCreation {
                    path: dir.clone(),
                    source,
                })?;
            }
        }
        Ok(Self { base_path })
    }

    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn record_path<R: StoredRecord>(&self, id: &R::Id) -> PathBuf {
        self.base_path.join(R::KIND).join(format!("{}.json", bare(id)))
    }

    fn temp_path<R: StoredRecord>(&self, id: &R::Id) -> PathBuf {
        self.base_path
            .join(R::KIND)
            .join(format!(".{}.json.tmp", bare(id)))
    }

    fn write<R: StoredRecord>(&self, record: &R) -> Result<(), StoreError> {
        let id = record.record_id();
        let json = serde_json::to_string_pretty(record)?;
        let temp = self.temp_path::<R>(&id);
        fs::write(&temp, json)?;
        fs::rename(&temp, self.record_path::<R>(&id))?;
        Ok(())
    }

    fn add<R: StoredRecord>(&self, record: &R) -> Result<(), StoreError> {
        let id = record.record_id();
        if self.record_path::<R>(&id).exists() {
            return Err(StoreError::already_exists(R::KIND, id));
        }
        self.write(record)
    }

    fn update<R: StoredRecord>(&self, record: &R) -> Result<(), StoreError> {
        let id = record.record_id();
        if !self.record_path::<R>(&id).exists() {
            return Err(StoreError::not_found(R::KIND, id));
        }
        self.write(record)
    }

    fn remove<R: StoredRecord>(&self, id: &R::Id) -> Result<(), StoreError> {
        let path = self.record_path::<R>(id);
        if !path.exists() {
            return Err(StoreError::not_found(R::KIND, id));
        }
        fs::remove_file(path)?;
        Ok(())
    }

    fn get<R: StoredRecord>(&self, id: &R::Id) -> Result<Option<R>, StoreError> {
        let path = self.record_path::<R>(id);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn all<R: StoredRecord>(&self) -> Result<Vec<R>, StoreError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(self.base_path.join(R::KIND))? {
            let path = entry?.path();

            if path.extension() != Some(std::ffi::OsStr::new("json")) {
                continue;
            }
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with('.'))
            {
                continue;
            }

            match fs::read_to_string(&path)
                .map_err(StoreError::from)
                .and_then(|json| serde_json::from_str::<R>(&json).map_err(StoreError::from))
            {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }
        Ok(records)
    }
}

/// Strips the display prefix (`rid:`, `slice:`...) so file names are bare UUIDs.
fn bare(id: &impl std::fmt::Display) -> String {
    let text = id.to_string();
    match text.split_once(':') {
        Some((_, rest)) => rest.to_string(),
        None => text,
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(rest) = path.to_str().and_then(|s| s.strip_prefix("~/")) {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

impl ActorStore for FileStore {
    fn add_slice(&self, slice: &Slice) -> Result<(), StoreError> {
        self.add(slice)
    }

    fn update_slice(&self, slice: &Slice) -> Result<(), StoreError> {
        self.update(slice)
    }

    fn remove_slice(&self, id: &SliceId) -> Result<(), StoreError> {
        self.remove::<Slice>(id)
    }

    fn slices(&self) -> Result<Vec<Slice>, StoreError> {
        self.all()
    }

    fn add_reservation(&self, record: &ReservationRecord) -> Result<(), StoreError> {
        self.add(record)
    }

    fn update_reservation(&self, record: &ReservationRecord) -> Result<(), StoreError> {
        self.update(record)
    }

    fn remove_reservation(&self, id: &ReservationId) -> Result<(), StoreError> {
        self.remove::<ReservationRecord>(id)
    }

    fn get_reservation(&self, id: &ReservationId) -> Result<Option<ReservationRecord>, StoreError> {
        self.get(id)
    }

    fn reservations(&self) -> Result<Vec<ReservationRecord>, StoreError> {
        self.all()
    }

    fn add_delegation(&self, record: &DelegationRecord) -> Result<(), StoreError> {
        self.add(record)
    }

    fn update_delegation(&self, record: &DelegationRecord) -> Result<(), StoreError> {
        self.update(record)
    }

    fn remove_delegation(&self, id: &DelegationId) -> Result<(), StoreError> {
        self.remove::<DelegationRecord>(id)
    }

    fn delegations(&self) -> Result<Vec<DelegationRecord>, StoreError> {
        self.all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasehold_types::{AuthToken, SliceKind};
    use tempfile::TempDir;

    fn store() -> (FileStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("data")).unwrap();
        (store, dir)
    }

    #[test]
    fn creates_layout() {
        let (store, _dir) = store();
        assert!(store.base_path().join("slices").is_dir());
        assert!(store.base_path().join("reservations").is_dir());
        assert!(store.base_path().join("delegations").is_dir());
    }

    #[test]
    fn slice_add_update_remove() {
        let (store, _dir) = store();
        let mut slice = Slice::new("demo", AuthToken::named("ctl"), SliceKind::Client);
        store.add_slice(&slice).unwrap();
        assert!(store.add_slice(&slice).is_err());

        slice.add_reservation(ReservationId::new());
        store.update_slice(&slice).unwrap();

        let loaded = store.slices().unwrap();
        assert_eq!(loaded, vec![slice.clone()]);

        store.remove_slice(&slice.slice_id()).unwrap();
        assert!(store.slices().unwrap().is_empty());
    }

    #[test]
    fn file_names_are_bare_uuids_and_no_temp_left() {
        let (store, _dir) = store();
        let slice = Slice::new("demo", AuthToken::named("ctl"), SliceKind::Client);
        store.add_slice(&slice).unwrap();

        let names: Vec<String> = fs::read_dir(store.base_path().join("slices"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}.json", slice.slice_id().uuid())]);
    }

    #[test]
    fn corrupt_files_are_skipped() {
        let (store, _dir) = store();
        fs::write(store.base_path().join("slices").join("broken.json"), "{not json").unwrap();
        assert!(store.slices().unwrap().is_empty());
    }

    #[test]
    fn update_missing_is_not_found() {
        let (store, _dir) = store();
        let slice = Slice::new("demo", AuthToken::named("ctl"), SliceKind::Client);
        assert!(matches!(
            store.update_slice(&slice),
            Err(StoreError::NotFound { .. })
        ));
    }
}
