//! Who is present and where.
//!
//! The store is plain owned data with no interior locking: the hub task is its
//! only owner, so every read and write is already serialized.

use std::collections::BTreeMap;

use crate::message::LocationRecord;

/// Identity → last known location.
///
/// Backed by a `BTreeMap` so `current_locations` snapshots serialize in a
/// stable order.
#[derive(Debug, Default)]
pub struct PresenceStore {
    records: BTreeMap<String, LocationRecord>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any previous record for the same identity wholesale.
    pub fn upsert(&mut self, record: LocationRecord) {
        self.records.insert(record.username.clone(), record);
    }

    pub fn remove(&mut self, username: &str) -> Option<LocationRecord> {
        self.records.remove(username)
    }

    pub fn get(&self, username: &str) -> Option<&LocationRecord> {
        self.records.get(username)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Clones the whole map for a `current_locations` envelope.
    pub fn snapshot(&self) -> BTreeMap<String, LocationRecord> {
        self.records.clone()
    }
}
