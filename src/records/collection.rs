//! A single named collection of records.

use crate::types::{Fields, Record, RecordId, Sequence, Timestamp};
use std::collections::HashMap;

/// Records of one collection, kept in insertion order.
///
/// Records are never removed, so positions stay valid for the lifetime of
/// the collection.
#[derive(Clone, Debug, Default)]
pub struct Collection {
    /// Collection name.
    name: String,

    /// Records in insertion order.
    records: Vec<Record>,

    /// Record ID to position in `records`.
    positions: HashMap<RecordId, usize>,
}

impl Collection {
    /// Create an empty collection.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.positions.contains_key(id)
    }

    /// Get a record by ID.
    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.positions.get(id).map(|&pos| &self.records[pos])
    }

    /// Iterate records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    /// Insert a new record or replace an existing one in place.
    ///
    /// Replacing keeps the original insertion position. Returns true if the
    /// record was new.
    pub fn upsert(&mut self, record: Record) -> bool {
        match self.positions.get(&record.id) {
            Some(&pos) => {
                self.records[pos] = record;
                false
            }
            None => {
                self.positions.insert(record.id.clone(), self.records.len());
                self.records.push(record);
                true
            }
        }
    }

    /// Shallow-merge `partial` into an existing record.
    ///
    /// `updated_at` is bumped to `now` but never drops below `created_at`.
    pub fn merge(
        &mut self,
        id: &RecordId,
        partial: Fields,
        now: Timestamp,
        sequence: Sequence,
    ) -> Option<&Record> {
        let pos = *self.positions.get(id)?;
        let record = &mut self.records[pos];

        for (field, value) in partial {
            record.fields.insert(field, value);
        }
        record.updated_at = now.max(record.created_at);
        record.sequence = sequence;

        Some(record)
    }
}
