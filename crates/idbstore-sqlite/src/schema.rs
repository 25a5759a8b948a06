//! Schema creation and metadata loading
//!
//! A fresh connection carries only the `meta` table with the empty schema
//! marker. Creating the IndexedDB tables, inserting the metadata row and
//! bumping the marker to the current version happen in one SQL transaction.

use std::collections::BTreeMap;

use idbstore_core::{
    DatabaseMetadata, IdbName, IndexMetadata, KeyPath, ObjectStoreMetadata, NO_VERSION,
};
use rusqlite::{Connection, OptionalExtension};

use crate::error::{Result, SqliteError};

/// Marker of a database whose tables have not been created.
pub(crate) const EMPTY_SCHEMA_VERSION: i64 = 1;
/// Marker of a database using the tables below.
pub(crate) const CURRENT_SCHEMA_VERSION: i64 = 10;
/// Oldest schema this code can read.
pub(crate) const COMPATIBLE_SCHEMA_VERSION: i64 = CURRENT_SCHEMA_VERSION;

const VERSION_KEY: &str = "version";
const COMPATIBLE_VERSION_KEY: &str = "last_compatible_version";

/// IndexedDB tables and the triggers that keep references consistent.
///
/// Names are stored as BLOBs of UTF-16 code units; key paths as UTF-8 BLOBs.
/// Record rows are never updated in place: a put replaces the row, and the
/// delete triggers drop its index entries and blob references. A blob row
/// disappears once nothing references it.
const SCHEMA: &str = "
CREATE TABLE indexed_db_metadata (
    name BLOB NOT NULL,
    version INTEGER NOT NULL
);

CREATE TABLE object_stores (
    id INTEGER PRIMARY KEY,
    name BLOB NOT NULL UNIQUE,
    key_path BLOB NOT NULL,
    auto_increment INTEGER NOT NULL,
    key_generator_current_number INTEGER NOT NULL
);

CREATE TABLE indexes (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    object_store_id INTEGER NOT NULL,
    id INTEGER NOT NULL,
    name BLOB NOT NULL,
    key_path BLOB NOT NULL,
    is_unique INTEGER NOT NULL,
    multi_entry INTEGER NOT NULL,
    UNIQUE (object_store_id, id),
    UNIQUE (object_store_id, name)
);

CREATE TABLE records (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    object_store_id INTEGER NOT NULL,
    key BLOB NOT NULL,
    value BLOB NOT NULL,
    UNIQUE (object_store_id, key)
);

CREATE TABLE index_references (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    object_store_id INTEGER NOT NULL,
    index_id INTEGER NOT NULL,
    key BLOB NOT NULL,
    record_row_id INTEGER NOT NULL
);

CREATE TRIGGER delete_index_references AFTER DELETE ON records
BEGIN
    DELETE FROM index_references WHERE record_row_id = OLD.row_id;
END;

-- row_id doubles as the blob number handed to clients
CREATE TABLE blobs (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    object_type INTEGER NOT NULL,
    mime_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    bytes BLOB,
    file_name BLOB,
    last_modified INTEGER
);

-- record_row_id is NULL for references held by active blobs
CREATE TABLE blob_references (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    blob_row_id INTEGER NOT NULL,
    record_row_id INTEGER
);

CREATE TRIGGER delete_blob_references AFTER DELETE ON records
BEGIN
    DELETE FROM blob_references WHERE record_row_id = OLD.row_id;
END;

CREATE TRIGGER delete_unreferenced_blobs AFTER DELETE ON blob_references
WHEN NOT EXISTS (SELECT 1 FROM blob_references WHERE blob_row_id = OLD.blob_row_id)
BEGIN
    DELETE FROM blobs WHERE row_id = OLD.blob_row_id;
END;
";

/// Bring `conn` to the current schema, creating it for a new database.
///
/// # Errors
///
/// Returns [`SqliteError::Schema`] if the stored marker is neither the empty
/// nor the current version.
pub(crate) fn prepare(conn: &Connection, name: &IdbName) -> Result<()> {
    init_meta_table(conn)?;

    match schema_version(conn)? {
        EMPTY_SCHEMA_VERSION => initialize_new_database(conn, name),
        CURRENT_SCHEMA_VERSION => Ok(()),
        other => Err(SqliteError::Schema(format!(
            "unknown schema version {}",
            other
        ))),
    }
}

/// Create the `meta` table with the empty marker if it does not exist yet.
fn init_meta_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key LONGVARCHAR NOT NULL UNIQUE PRIMARY KEY,
            value LONGVARCHAR
        )",
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES (?, ?)",
        rusqlite::params![VERSION_KEY, EMPTY_SCHEMA_VERSION],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES (?, ?)",
        rusqlite::params![COMPATIBLE_VERSION_KEY, COMPATIBLE_SCHEMA_VERSION],
    )?;
    Ok(())
}

/// Current schema marker
pub(crate) fn schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row(
            "SELECT CAST(value AS INTEGER) FROM meta WHERE key = ?",
            [VERSION_KEY],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    version.ok_or_else(|| SqliteError::Schema("missing schema version".to_string()))
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "UPDATE meta SET value = ? WHERE key = ?",
        rusqlite::params![version, VERSION_KEY],
    )?;
    Ok(())
}

/// Create the tables, insert the initial metadata row and set the current marker.
fn initialize_new_database(conn: &Connection, name: &IdbName) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(SCHEMA)?;
    tx.execute(
        "INSERT INTO indexed_db_metadata (name, version) VALUES (?, ?)",
        rusqlite::params![name.to_le_bytes(), NO_VERSION],
    )?;
    set_schema_version(&tx, CURRENT_SCHEMA_VERSION)?;

    tx.commit()?;
    Ok(())
}

/// Rebuild the in-memory metadata mirror from the tables.
pub(crate) fn load_metadata(conn: &Connection) -> Result<DatabaseMetadata> {
    let (name, version): (Vec<u8>, i64) = conn.query_row(
        "SELECT name, version FROM indexed_db_metadata",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let mut metadata = DatabaseMetadata::new(decode_name(&name)?);
    metadata.version = version;

    let mut stores = conn.prepare("SELECT id, name, key_path, auto_increment FROM object_stores")?;
    let mut rows = stores.query([])?;
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        let name: Vec<u8> = row.get(1)?;
        let key_path: Vec<u8> = row.get(2)?;
        let store = ObjectStoreMetadata::new(
            id,
            decode_name(&name)?,
            decode_key_path(key_path)?,
            row.get(3)?,
        );
        metadata.max_object_store_id = metadata.max_object_store_id.max(id);
        metadata.object_stores.insert(id, store);
    }

    let mut indexes = conn.prepare(
        "SELECT object_store_id, id, name, key_path, is_unique, multi_entry FROM indexes",
    )?;
    let mut rows = indexes.query([])?;
    let mut by_store: BTreeMap<i64, Vec<IndexMetadata>> = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let name: Vec<u8> = row.get(2)?;
        let key_path: Vec<u8> = row.get(3)?;
        by_store.entry(row.get(0)?).or_default().push(IndexMetadata {
            id: row.get(1)?,
            name: decode_name(&name)?,
            key_path: decode_key_path(key_path)?,
            unique: row.get(4)?,
            multi_entry: row.get(5)?,
        });
    }
    for (object_store_id, store_indexes) in by_store {
        let store = metadata
            .object_stores
            .get_mut(&object_store_id)
            .ok_or_else(|| {
                SqliteError::Corruption(format!(
                    "index row for missing object store {}",
                    object_store_id
                ))
            })?;
        for index in store_indexes {
            store.max_index_id = store.max_index_id.max(index.id);
            store.indexes.insert(index.id, index);
        }
    }

    Ok(metadata)
}

pub(crate) fn decode_name(bytes: &[u8]) -> Result<IdbName> {
    IdbName::from_le_bytes(bytes)
        .ok_or_else(|| SqliteError::Corruption("name has an odd number of bytes".to_string()))
}

fn decode_key_path(bytes: Vec<u8>) -> Result<KeyPath> {
    let stored = String::from_utf8(bytes)
        .map_err(|_| SqliteError::Corruption("key path is not UTF-8".to_string()))?;
    Ok(KeyPath::decode(&stored))
}
