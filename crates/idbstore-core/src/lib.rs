//! idbstore core data model
//!
//! This crate holds the storage-independent half of the IndexedDB backing
//! store: keys and their sortable encoding, key ranges, key paths, schema
//! metadata, values with external objects, and the storage traits.
//!
//! # Example
//!
//! ```rust
//! use idbstore_core::{decode_sortable_key, encode_sortable_key, Key};
//!
//! let low = encode_sortable_key(&Key::from(2));
//! let high = encode_sortable_key(&Key::from("a"));
//! // numbers order before strings
//! assert!(low < high);
//! assert_eq!(decode_sortable_key(&high).unwrap(), Key::from("a"));
//! ```

pub mod key;
pub mod key_path;
pub mod key_range;
pub mod metadata;
pub mod name;
pub mod record;
pub mod storage;
pub mod value;

// Re-export main types at crate root
pub use key::{decode_sortable_key, encode_sortable_key, DecodeError, Key};
pub use key_path::KeyPath;
pub use key_range::KeyRange;
pub use metadata::{
    is_valid_index_id, is_valid_object_store_id, DatabaseMetadata, IndexMetadata,
    ObjectStoreMetadata, KEY_GENERATOR_INITIAL_NUMBER, MINIMUM_INDEX_ID, NO_VERSION,
};
pub use name::IdbName;
pub use record::{Record, RecordIdentifier};
pub use storage::{StoreError, StoreResult};
pub use value::{BlobSource, BlobStream, BytesBlobSource, ExternalObject, ExternalObjectKind, Value};
