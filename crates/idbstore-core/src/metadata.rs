//! In-memory schema metadata: databases, object stores and indexes

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::key_path::KeyPath;
use crate::name::IdbName;

/// Version of a database that has never completed a version change.
pub const NO_VERSION: i64 = -1;

/// First number handed out by an object store's key generator.
pub const KEY_GENERATOR_INITIAL_NUMBER: i64 = 1;

/// Smallest id an index may have. Lower ids are reserved.
pub const MINIMUM_INDEX_ID: i64 = 30;

pub fn is_valid_object_store_id(id: i64) -> bool {
    id > 0 && id < i64::MAX
}

pub fn is_valid_index_id(id: i64) -> bool {
    id >= MINIMUM_INDEX_ID && id < i64::from(i32::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub id: i64,
    pub name: IdbName,
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
}

impl IndexMetadata {
    pub fn new(
        id: i64,
        name: impl Into<IdbName>,
        key_path: KeyPath,
        unique: bool,
        multi_entry: bool,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            key_path,
            unique,
            multi_entry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreMetadata {
    pub id: i64,
    pub name: IdbName,
    pub key_path: KeyPath,
    pub auto_increment: bool,
    pub indexes: BTreeMap<i64, IndexMetadata>,
    pub max_index_id: i64,
}

impl ObjectStoreMetadata {
    pub fn new(id: i64, name: IdbName, key_path: KeyPath, auto_increment: bool) -> Self {
        Self {
            id,
            name,
            key_path,
            auto_increment,
            indexes: BTreeMap::new(),
            max_index_id: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    pub name: IdbName,
    pub version: i64,
    pub object_stores: BTreeMap<i64, ObjectStoreMetadata>,
    pub max_object_store_id: i64,
}

impl DatabaseMetadata {
    /// Metadata for a database with no version and no object stores.
    pub fn new(name: IdbName) -> Self {
        Self {
            name,
            version: NO_VERSION,
            object_stores: BTreeMap::new(),
            max_object_store_id: 0,
        }
    }

    pub fn object_store(&self, id: i64) -> Option<&ObjectStoreMetadata> {
        self.object_stores.get(&id)
    }

    pub fn index(&self, object_store_id: i64, index_id: i64) -> Option<&IndexMetadata> {
        self.object_stores.get(&object_store_id)?.indexes.get(&index_id)
    }
}
