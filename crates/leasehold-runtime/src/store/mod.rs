//! Actor persistence.
//!
//! The kernel records every slice, reservation and delegation through an
//! [`ActorStore`] before the corresponding mutation is acknowledged to a
//! peer (persist, then send). Two backends ship with the runtime:
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`MemoryStore`] | tests, demos, restart simulation via a shared `Arc` |
//! | [`FileStore`] | one JSON file per record, atomic temp + rename writes |
//!
//! # Directory Layout (FileStore)
//!
//! ```text
//! <data_dir>/
//! ├── slices/{uuid}.json
//! ├── reservations/{uuid}.json
//! └── delegations/{uuid}.json
//! ```

mod error;
mod file;
mod memory;

pub use error::StoreError;
pub use file::FileStore;
pub use memory::MemoryStore;

use crate::delegation::DelegationRecord;
use crate::reservation::ReservationRecord;
use crate::slice::Slice;
use leasehold_types::{DelegationId, ReservationId, SliceId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::hash::Hash;

/// Durable record of one actor's state.
///
/// Implementations must be thread-safe so that a store can be shared
/// between an actor and whoever restarts it.
pub trait ActorStore: Send + Sync {
    /// Adds a new slice.
    ///
    /// # Errors
    ///
    /// [`StoreError::AlreadyExists`] if the slice is already stored.
    fn add_slice(&self, slice: &Slice) -> Result<(), StoreError>;

    /// Replaces a stored slice.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the slice was never added.
    fn update_slice(&self, slice: &Slice) -> Result<(), StoreError>;

    /// Removes a slice.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if absent.
    fn remove_slice(&self, id: &SliceId) -> Result<(), StoreError>;

    /// Loads every stored slice.
    fn slices(&self) -> Result<Vec<Slice>, StoreError>;

    fn add_reservation(&self, record: &ReservationRecord) -> Result<(), StoreError>;
    fn update_reservation(&self, record: &ReservationRecord) -> Result<(), StoreError>;
    fn remove_reservation(&self, id: &ReservationId) -> Result<(), StoreError>;
    fn get_reservation(&self, id: &ReservationId) -> Result<Option<ReservationRecord>, StoreError>;
    fn reservations(&self) -> Result<Vec<ReservationRecord>, StoreError>;

    fn add_delegation(&self, record: &DelegationRecord) -> Result<(), StoreError>;
    fn update_delegation(&self, record: &DelegationRecord) -> Result<(), StoreError>;
    fn remove_delegation(&self, id: &DelegationId) -> Result<(), StoreError>;
    fn delegations(&self) -> Result<Vec<DelegationRecord>, StoreError>;
}

/// A value the stores know how to key and serialize.
pub(crate) trait StoredRecord: Serialize + DeserializeOwned + Clone + Send {
    type Id: Display + Eq + Hash + Copy + Send;

    /// Collection name, also the FileStore subdirectory.
    const KIND: &'static str;

    fn record_id(&self) -> Self::Id;
}

impl StoredRecord for Slice {
    type Id = SliceId;
    const KIND: &'static str = "slices";

    fn record_id(&self) -> SliceId {
        self.slice_id()
    }
}

impl StoredRecord for ReservationRecord {
    type Id = ReservationId;
    const KIND: &'static str = "reservations";

    fn record_id(&self) -> ReservationId {
        self.reservation_id
    }
}

impl StoredRecord for DelegationRecord {
    type Id = DelegationId;
    const KIND: &'static str = "delegations";

    fn record_id(&self) -> DelegationId {
        self.delegation_id
    }
}
