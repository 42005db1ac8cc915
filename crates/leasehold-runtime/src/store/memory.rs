//! In-memory store.

use super::{ActorStore, StoreError, StoredRecord};
use crate::delegation::DelegationRecord;
use crate::reservation::ReservationRecord;
use crate::slice::Slice;
use leasehold_types::{DelegationId, ReservationId, SliceId};
use parking_lot::Mutex;
use std::collections::HashMap;

/// One keyed collection.
struct Table<R: StoredRecord> {
    rows: Mutex<HashMap<R::Id, R>>,
}

impl<R: StoredRecord> Table<R> {
    fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }

    fn add(&self, record: &R) -> Result<(), StoreError> {
        let mut rows = self.rows.lock();
        let id = record.record_id();
        if rows.contains_key(&id) {
            return Err(StoreError::already_exists(R::KIND, id));
        }
        rows.insert(id, record.clone());
        Ok(())
    }

    fn update(&self, record: &R) -> Result<(), StoreError> {
        let mut rows = self.rows.lock();
        let id = record.record_id();
        match rows.get_mut(&id) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(StoreError::not_found(R::KIND, id)),
        }
    }

    fn remove(&self, id: &R::Id) -> Result<(), StoreError> {
        self.rows
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(R::KIND, id))
    }

    fn get(&self, id: &R::Id) -> Option<R> {
        self.rows.lock().get(id).cloned()
    }

    fn all(&self) -> Vec<R> {
        self.rows.lock().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.rows.lock().len()
    }
}

/// Volatile [`ActorStore`] backed by hash maps.
///
/// Sharing one `Arc<MemoryStore>` between two kernels simulates an actor
/// restart in tests.
pub struct MemoryStore {
    slices: Table<Slice>,
    reservations: Table<ReservationRecord>,
    delegations: Table<DelegationRecord>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slices: Table::new(),
            reservations: Table::new(),
            delegations: Table::new(),
        }
    }

    /// Number of stored reservations.
    #[must_use]
    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Number of stored slices.
    #[must_use]
    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorStore for MemoryStore {
    fn add_slice(&self, slice: &Slice) -> Result<(), StoreError> {
        self.slices.add(slice)
    }

    fn update_slice(&self, slice: &Slice) -> Result<(), StoreError> {
        self.slices.update(slice)
    }

    fn remove_slice(&self, id: &SliceId) -> Result<(), StoreError> {
        self.slices.remove(id)
    }

    fn slices(&self) -> Result<Vec<Slice>, StoreError> {
        Ok(self.slices.all())
    }

    fn add_reservation(&self, record: &ReservationRecord) -> Result<(), StoreError> {
        self.reservations.add(record)
    }

    fn update_reservation(&self, record: &ReservationRecord) -> Result<(), StoreError> {
        self.reservations.update(record)
    }

    fn remove_reservation(&self, id: &ReservationId) -> Result<(), StoreError> {
        self.reservations.remove(id)
    }

    fn get_reservation(&self, id: &ReservationId) -> Result<Option<ReservationRecord>, StoreError> {
        Ok(self.reservations.get(id))
    }

    fn reservations(&self) -> Result<Vec<ReservationRecord>, StoreError> {
        Ok(self.reservations.all())
    }

    fn add_delegation(&self, record: &DelegationRecord) -> Result<(), StoreError> {
        self.delegations.add(record)
    }

    fn update_delegation(&self, record: &DelegationRecord) -> Result<(), StoreError> {
        self.delegations.update(record)
    }

    fn remove_delegation(&self, id: &DelegationId) -> Result<(), StoreError> {
        self.delegations.remove(id)
    }

    fn delegations(&self) -> Result<Vec<DelegationRecord>, StoreError> {
        Ok(self.delegations.all())
    }
}
