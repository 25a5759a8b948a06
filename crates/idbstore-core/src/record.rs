//! Records yielded by scans and the identifiers of stored records

use crate::key::Key;
use crate::value::Value;

/// Identifies a stored record by its row number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordIdentifier {
    pub number: i64,
}

impl RecordIdentifier {
    pub fn new(number: i64) -> Self {
        Self { number }
    }
}

/// One step of a scan over an object store or an index.
#[derive(Debug, Clone)]
pub enum Record {
    ObjectStoreKeyOnly {
        key: Key,
    },
    ObjectStore {
        key: Key,
        value: Value,
    },
    IndexKeyOnly {
        key: Key,
        primary_key: Key,
    },
    Index {
        key: Key,
        primary_key: Key,
        value: Value,
    },
}

impl Record {
    /// The scanned key: the primary key for object stores, the index key for indexes.
    pub fn key(&self) -> &Key {
        match self {
            Record::ObjectStoreKeyOnly { key }
            | Record::ObjectStore { key, .. }
            | Record::IndexKeyOnly { key, .. }
            | Record::Index { key, .. } => key,
        }
    }

    pub fn primary_key(&self) -> &Key {
        match self {
            Record::ObjectStoreKeyOnly { key } | Record::ObjectStore { key, .. } => key,
            Record::IndexKeyOnly { primary_key, .. } | Record::Index { primary_key, .. } => {
                primary_key
            }
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Record::ObjectStore { value, .. } | Record::Index { value, .. } => Some(value),
            Record::ObjectStoreKeyOnly { .. } | Record::IndexKeyOnly { .. } => None,
        }
    }

    pub fn into_value(self) -> Option<Value> {
        match self {
            Record::ObjectStore { value, .. } | Record::Index { value, .. } => Some(value),
            Record::ObjectStoreKeyOnly { .. } | Record::IndexKeyOnly { .. } => None,
        }
    }
}
