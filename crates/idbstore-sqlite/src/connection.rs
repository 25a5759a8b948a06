//! One IndexedDB database on top of one SQLite connection
//!
//! `DatabaseConnection` owns the SQL connection, the in-memory metadata
//! mirror, the read-write transaction and its two-phase blob commit, the
//! statements behind open cursors, and the blobs currently handed out to
//! clients.
//!
//! The connection lives behind `Arc<Mutex<_>>`. Everything that outlives a
//! single call (transactions, record iterators, blob writers) holds a
//! [`ConnectionRef`]: a weak pointer plus the generation of its scope at the
//! time it was made. Deleting the database bumps the generations, so stale
//! references quietly stop reaching the connection.
//!
//! Lock discipline: the lock is never held across an await, and nothing that
//! may release an active blob ([`BlobHandle`], [`ClientBlob`]) is dropped
//! while it is held.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use idbstore_core::storage::{BlobWriteCompletion, BlobWriteResult, Durability, TransactionMode};
use idbstore_core::{
    encode_sortable_key, is_valid_index_id, is_valid_object_store_id, DatabaseMetadata,
    ExternalObject, ExternalObjectKind, IdbName, IndexMetadata, Key, KeyPath, KeyRange,
    ObjectStoreMetadata, RecordIdentifier, Value, KEY_GENERATOR_INITIAL_NUMBER, NO_VERSION,
};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::active_blob::{ActiveBlobStreamer, ClientBlob};
use crate::blob_registry::BlobRegistry;
use crate::blob_writer::BlobWriter;
use crate::config::StoreConfig;
use crate::error::{is_constraint_violation, Result, SqliteError};
use crate::logging::prefix;
use crate::schema;
use crate::streaming_blob::StreamingBlobHandle;

pub(crate) type SharedConnection = Arc<Mutex<DatabaseConnection>>;

/// Whoever keeps connections open by name.
pub(crate) trait ConnectionOwner: Send + Sync {
    /// Forget `connection`, if it is still the one open under `name`.
    fn destroy_connection(&self, name: &IdbName, connection: &Weak<Mutex<DatabaseConnection>>);
}

/// Groups of back-references invalidated together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RefScope {
    Transaction,
    RecordIterator,
    BlobWriter,
}

#[derive(Debug, Default, Clone, Copy)]
struct Generations {
    transaction: u64,
    record_iterator: u64,
    blob_writer: u64,
}

impl Generations {
    fn get(&self, scope: RefScope) -> u64 {
        match scope {
            RefScope::Transaction => self.transaction,
            RefScope::RecordIterator => self.record_iterator,
            RefScope::BlobWriter => self.blob_writer,
        }
    }

    fn bump(&mut self, scope: RefScope) {
        match scope {
            RefScope::Transaction => self.transaction += 1,
            RefScope::RecordIterator => self.record_iterator += 1,
            RefScope::BlobWriter => self.blob_writer += 1,
        }
    }
}

/// Weak, generation-checked reference to a connection.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionRef {
    connection: Weak<Mutex<DatabaseConnection>>,
    scope: RefScope,
    generation: u64,
}

impl ConnectionRef {
    /// Run `f` on the connection. `None` if it is gone or this reference was invalidated.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut DatabaseConnection) -> R) -> Option<R> {
        let connection = self.connection.upgrade()?;
        let mut guard = connection.lock();
        if guard.generations.get(self.scope) != self.generation {
            return None;
        }
        let result = f(&mut guard);
        drop(guard);
        Some(result)
    }
}

struct ActiveBlob {
    streamer: ActiveBlobStreamer,
    /// `blob_references` row keeping the bytes alive while the blob is active
    reference_row_id: i64,
}

pub(crate) struct DatabaseConnection {
    sql: Connection,
    metadata: DatabaseMetadata,
    metadata_snapshot: Option<DatabaseMetadata>,
    config: StoreConfig,
    owner: Weak<dyn ConnectionOwner>,
    blob_registry: BlobRegistry,
    self_ref: Weak<Mutex<DatabaseConnection>>,
    generations: Generations,

    active_rw_transaction: Option<TransactionMode>,
    /// Blobs reserved by puts in the current transaction, by blob row id
    blobs_to_write: BTreeMap<i64, ExternalObject>,
    blob_writers: HashMap<i64, BlobWriter>,
    blob_write_result: Option<oneshot::Sender<BlobWriteResult>>,

    active_blobs: HashMap<i64, ActiveBlob>,
    /// Reference rows of blobs that went inactive during a read-write transaction
    deferred_reference_cleanup: Vec<i64>,

    statements: HashMap<u64, String>,
    next_statement_id: u64,
}

impl DatabaseConnection {
    /// Open the database `name`, creating its schema if needed.
    pub(crate) fn open(
        name: &IdbName,
        config: StoreConfig,
        owner: Weak<dyn ConnectionOwner>,
        blob_registry: BlobRegistry,
    ) -> Result<SharedConnection> {
        let sql = Connection::open_in_memory()?;
        configure(&sql, &config)?;
        schema::prepare(&sql, name)?;

        let metadata = schema::load_metadata(&sql)?;
        if &metadata.name != name {
            return Err(SqliteError::Corruption(format!(
                "database {} holds metadata for {}",
                name, metadata.name
            )));
        }

        // No blob can be active yet, so references without a record are leftovers
        let stale = sql.execute("DELETE FROM blob_references WHERE record_row_id IS NULL", [])?;
        if stale > 0 {
            debug!("{} Dropped {} stale active-blob references", prefix::DB, stale);
        }

        info!(
            "{} Opened database {} (version {})",
            prefix::PULSE_OPEN,
            name,
            metadata.version
        );

        Ok(Arc::new_cyclic(|self_ref| {
            Mutex::new(DatabaseConnection {
                sql,
                metadata,
                metadata_snapshot: None,
                config,
                owner,
                blob_registry,
                self_ref: self_ref.clone(),
                generations: Generations::default(),
                active_rw_transaction: None,
                blobs_to_write: BTreeMap::new(),
                blob_writers: HashMap::new(),
                blob_write_result: None,
                active_blobs: HashMap::new(),
                deferred_reference_cleanup: Vec::new(),
                statements: HashMap::new(),
                next_statement_id: 0,
            })
        }))
    }

    pub(crate) fn sql(&self) -> &Connection {
        &self.sql
    }

    pub(crate) fn metadata(&self) -> &DatabaseMetadata {
        &self.metadata
    }

    /// No committed version: freshly created, or deleted with blobs still active.
    pub(crate) fn is_zygotic(&self) -> bool {
        self.metadata.version == NO_VERSION
    }

    pub(crate) fn active_blob_count(&self) -> usize {
        self.active_blobs.len()
    }

    pub(crate) fn has_active_version_change_transaction(&self) -> bool {
        self.active_rw_transaction == Some(TransactionMode::VersionChange)
    }

    pub(crate) fn connection_ref(&self, scope: RefScope) -> ConnectionRef {
        ConnectionRef {
            connection: self.self_ref.clone(),
            scope,
            generation: self.generations.get(scope),
        }
    }

    // Transactions

    /// # Panics
    ///
    /// If a version-change transaction is active, or if a second read-write
    /// transaction begins while one is active.
    pub(crate) fn begin_transaction(
        &mut self,
        mode: TransactionMode,
        durability: Durability,
    ) -> Result<()> {
        assert!(
            !self.has_active_version_change_transaction(),
            "no transaction may begin while a version change is running"
        );
        if mode == TransactionMode::ReadOnly {
            return Ok(());
        }
        assert!(
            self.active_rw_transaction.is_none(),
            "only one read-write transaction may be active"
        );

        let synchronous = match durability {
            Durability::Default | Durability::Strict => "FULL",
            Durability::Relaxed => "NORMAL",
        };
        self.sql.pragma_update(None, "synchronous", synchronous)?;
        self.sql.execute_batch("BEGIN TRANSACTION")?;
        self.active_rw_transaction = Some(mode);
        if mode == TransactionMode::VersionChange {
            self.metadata_snapshot = Some(self.metadata.clone());
        }
        debug!("{} Began {:?} transaction", prefix::DB, mode);
        Ok(())
    }

    /// Start writing the transaction's pending blobs.
    pub(crate) fn commit_phase_one(&mut self, mode: TransactionMode) -> BlobWriteCompletion {
        if mode == TransactionMode::ReadOnly || self.blobs_to_write.is_empty() {
            return BlobWriteCompletion::Ready(BlobWriteResult::Success);
        }
        debug_assert!(self.blob_writers.is_empty());

        let (sender, receiver) = oneshot::channel();
        self.blob_write_result = Some(sender);

        let blobs_to_write = std::mem::take(&mut self.blobs_to_write);
        for (blob_row_id, object) in blobs_to_write {
            match self.blob_row_exists(blob_row_id) {
                Ok(true) => {}
                // Replaced or deleted later in the same transaction
                Ok(false) => continue,
                Err(e) => {
                    warn!("{} Looking up blob {} failed: {}", prefix::BLOB, blob_row_id, e);
                    return self.fail_phase_one();
                }
            }

            let target = match StreamingBlobHandle::open(
                &self.sql,
                self.self_ref.clone(),
                blob_row_id,
                false,
            ) {
                Ok(target) => target,
                Err(e) => {
                    warn!("{} Opening blob {} for write failed: {}", prefix::BLOB, blob_row_id, e);
                    return self.fail_phase_one();
                }
            };

            let writer_ref = self.connection_ref(RefScope::BlobWriter);
            let writer = BlobWriter::write_blob_into_database(
                &object,
                target,
                &self.config,
                move |success| {
                    writer_ref.with(|db| db.on_blob_write_complete(blob_row_id, success));
                },
            );
            match writer {
                Some(writer) => {
                    self.blob_writers.insert(blob_row_id, writer);
                }
                None => return self.fail_phase_one(),
            }
        }

        if self.blob_writers.is_empty() {
            self.blob_write_result = None;
            return BlobWriteCompletion::Ready(BlobWriteResult::Success);
        }
        debug!(
            "{} Writing {} blobs before commit",
            prefix::BLOB,
            self.blob_writers.len()
        );
        BlobWriteCompletion::Pending(receiver)
    }

    fn fail_phase_one(&mut self) -> BlobWriteCompletion {
        self.blob_writers.clear();
        self.blob_write_result = None;
        BlobWriteCompletion::Ready(BlobWriteResult::Error)
    }

    fn on_blob_write_complete(&mut self, blob_row_id: i64, success: bool) {
        let Some(writer) = self.blob_writers.remove(&blob_row_id) else {
            return;
        };
        writer.detach();

        if !success {
            warn!("{} Blob {} failed to write", prefix::BLOB, blob_row_id);
            self.generations.bump(RefScope::BlobWriter);
            self.blob_writers.clear();
            if let Some(sender) = self.blob_write_result.take() {
                let _ = sender.send(BlobWriteResult::Error);
            }
            return;
        }

        if self.blob_writers.is_empty() {
            if let Some(sender) = self.blob_write_result.take() {
                let _ = sender.send(BlobWriteResult::Success);
            }
        }
    }

    /// Commit the SQL transaction. On failure the transaction is rolled back.
    pub(crate) fn commit_phase_two(&mut self, mode: TransactionMode) -> Result<()> {
        if mode == TransactionMode::ReadOnly {
            return Ok(());
        }
        debug_assert!(self.blob_writers.is_empty());

        if let Err(e) = self.sql.execute_batch("COMMIT") {
            warn!("{} Commit failed, rolling back: {}", prefix::DB, e);
            self.rollback_transaction(mode);
            return Err(e.into());
        }
        self.active_rw_transaction = None;
        self.blobs_to_write.clear();
        if mode == TransactionMode::VersionChange {
            debug_assert!(self.metadata_snapshot.is_some());
            self.metadata_snapshot = None;
        }
        debug!("{} Committed {:?} transaction", prefix::DB, mode);

        self.run_deferred_reference_cleanup();
        Ok(())
    }

    /// Cancel blob writers, roll back SQL, restore a version change's metadata.
    pub(crate) fn rollback_transaction(&mut self, mode: TransactionMode) {
        if mode == TransactionMode::ReadOnly {
            return;
        }
        self.blob_writers.clear();
        self.blob_write_result = None;
        self.blobs_to_write.clear();

        if self.active_rw_transaction.take().is_some() {
            if let Err(e) = self.sql.execute_batch("ROLLBACK") {
                warn!("{} Rollback failed: {}", prefix::DB, e);
            }
        }
        if mode == TransactionMode::VersionChange {
            if let Some(snapshot) = self.metadata_snapshot.take() {
                self.metadata = snapshot;
            }
        }
        debug!("{} Rolled back {:?} transaction", prefix::DB, mode);

        self.restore_active_blob_references();
        self.run_deferred_reference_cleanup();
    }

    // Schema changes

    fn assert_version_change(&self) {
        assert!(
            self.has_active_version_change_transaction(),
            "schema changes need a version-change transaction"
        );
    }

    pub(crate) fn set_database_version(&mut self, version: i64) -> Result<()> {
        self.assert_version_change();
        self.sql
            .prepare_cached("UPDATE indexed_db_metadata SET version = ?")?
            .execute([version])?;
        self.metadata.version = version;
        Ok(())
    }

    pub(crate) fn create_object_store(
        &mut self,
        object_store_id: i64,
        name: IdbName,
        key_path: KeyPath,
        auto_increment: bool,
    ) -> Result<()> {
        self.assert_version_change();
        if self.metadata.object_stores.contains_key(&object_store_id)
            || !is_valid_object_store_id(object_store_id)
            || object_store_id <= self.metadata.max_object_store_id
        {
            return Err(SqliteError::InvalidArgument(format!(
                "Invalid object_store_id {}",
                object_store_id
            )));
        }

        let inserted = self
            .sql
            .prepare_cached(
                "INSERT INTO object_stores
                 (id, name, key_path, auto_increment, key_generator_current_number)
                 VALUES (?, ?, ?, ?, ?)",
            )?
            .execute(params![
                object_store_id,
                name.to_le_bytes(),
                key_path.encode().into_bytes(),
                auto_increment,
                KEY_GENERATOR_INITIAL_NUMBER,
            ]);
        if let Err(e) = inserted {
            if is_constraint_violation(&e) {
                return Err(SqliteError::InvalidArgument(format!(
                    "Object store name {} already exists",
                    name
                )));
            }
            return Err(e.into());
        }

        self.metadata.object_stores.insert(
            object_store_id,
            ObjectStoreMetadata::new(object_store_id, name, key_path, auto_increment),
        );
        self.metadata.max_object_store_id = object_store_id;
        Ok(())
    }

    pub(crate) fn delete_object_store(&mut self, object_store_id: i64) -> Result<()> {
        self.assert_version_change();
        if !self.metadata.object_stores.contains_key(&object_store_id) {
            return Err(SqliteError::InvalidArgument(format!(
                "Unknown object store {}",
                object_store_id
            )));
        }

        // Records first, so the triggers drop their index and blob references
        self.sql
            .prepare_cached("DELETE FROM records WHERE object_store_id = ?")?
            .execute([object_store_id])?;
        self.sql
            .prepare_cached("DELETE FROM indexes WHERE object_store_id = ?")?
            .execute([object_store_id])?;
        self.sql
            .prepare_cached("DELETE FROM object_stores WHERE id = ?")?
            .execute([object_store_id])?;

        self.metadata.object_stores.remove(&object_store_id);
        Ok(())
    }

    pub(crate) fn create_index(&mut self, object_store_id: i64, index: IndexMetadata) -> Result<()> {
        self.assert_version_change();
        let store = self
            .metadata
            .object_stores
            .get(&object_store_id)
            .ok_or_else(|| {
                SqliteError::InvalidArgument(format!("Unknown object store {}", object_store_id))
            })?;
        if store.indexes.contains_key(&index.id)
            || !is_valid_index_id(index.id)
            || index.id <= store.max_index_id
        {
            return Err(SqliteError::InvalidArgument(format!(
                "Invalid index_id {}",
                index.id
            )));
        }

        let inserted = self
            .sql
            .prepare_cached(
                "INSERT INTO indexes
                 (object_store_id, id, name, key_path, is_unique, multi_entry)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                object_store_id,
                index.id,
                index.name.to_le_bytes(),
                index.key_path.encode().into_bytes(),
                index.unique,
                index.multi_entry,
            ]);
        if let Err(e) = inserted {
            if is_constraint_violation(&e) {
                return Err(SqliteError::InvalidArgument(format!(
                    "Index name {} already exists",
                    index.name
                )));
            }
            return Err(e.into());
        }

        if let Some(store) = self.metadata.object_stores.get_mut(&object_store_id) {
            store.max_index_id = index.id;
            store.indexes.insert(index.id, index);
        }
        Ok(())
    }

    // Records

    pub(crate) fn get_key_generator_current_number(&self, object_store_id: i64) -> Result<i64> {
        self.sql
            .prepare_cached("SELECT key_generator_current_number FROM object_stores WHERE id = ?")?
            .query_row([object_store_id], |row| row.get(0))
            .optional()?
            .ok_or_else(|| {
                SqliteError::InvalidArgument(format!("Unknown object store {}", object_store_id))
            })
    }

    pub(crate) fn maybe_update_key_generator_current_number(
        &self,
        object_store_id: i64,
        new_number: i64,
    ) -> Result<()> {
        self.sql
            .prepare_cached(
                "UPDATE object_stores SET key_generator_current_number = ?
                 WHERE id = ? AND key_generator_current_number < ?",
            )?
            .execute(params![new_number, object_store_id, new_number])?;
        Ok(())
    }

    pub(crate) fn get_record_identifier_if_exists(
        &self,
        object_store_id: i64,
        key: &Key,
    ) -> Result<Option<RecordIdentifier>> {
        let row_id = self
            .sql
            .prepare_cached("SELECT row_id FROM records WHERE object_store_id = ? AND key = ?")?
            .query_row(params![object_store_id, encode_sortable_key(key)], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(row_id.map(RecordIdentifier::new))
    }

    pub(crate) fn get_value(&self, object_store_id: i64, key: &Key) -> Result<Option<Value>> {
        let found: Option<(i64, Vec<u8>)> = self
            .sql
            .prepare_cached("SELECT row_id, value FROM records WHERE object_store_id = ? AND key = ?")?
            .query_row(params![object_store_id, encode_sortable_key(key)], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        match found {
            Some((row_id, bits)) => Ok(Some(
                self.add_external_object_metadata_to_value(Value::new(bits), row_id)?,
            )),
            None => Ok(None),
        }
    }

    /// Attach the external objects referenced by `record_row_id`.
    ///
    /// Blobs written earlier in this transaction come back as the pending
    /// object, source included, so their bytes are readable before commit.
    pub(crate) fn add_external_object_metadata_to_value(
        &self,
        mut value: Value,
        record_row_id: i64,
    ) -> Result<Value> {
        let mut statement = self.sql.prepare_cached(
            "SELECT blobs.row_id, object_type, mime_type, size_bytes, file_name, last_modified
             FROM blobs INNER JOIN blob_references ON blob_references.blob_row_id = blobs.row_id
             WHERE blob_references.record_row_id = ?
             ORDER BY blob_references.row_id",
        )?;
        let mut rows = statement.query([record_row_id])?;
        while let Some(row) = rows.next()? {
            let blob_row_id: i64 = row.get(0)?;
            if let Some(pending) = self.blobs_to_write.get(&blob_row_id) {
                value.external_objects.push(pending.clone());
                continue;
            }

            let object_type: i64 = row.get(1)?;
            let mime_type: String = row.get(2)?;
            let size: i64 = row.get(3)?;
            let kind = match object_type {
                ExternalObjectKind::BLOB_TYPE => ExternalObjectKind::Blob,
                ExternalObjectKind::FILE_TYPE => {
                    let name: Option<Vec<u8>> = row.get(4)?;
                    let last_modified: Option<i64> = row.get(5)?;
                    ExternalObjectKind::File {
                        name: String::from_utf8(name.unwrap_or_default()).map_err(|_| {
                            SqliteError::Corruption(format!(
                                "file name of blob {} is not UTF-8",
                                blob_row_id
                            ))
                        })?,
                        last_modified: chrono::DateTime::from_timestamp_micros(
                            last_modified.unwrap_or_default(),
                        )
                        .unwrap_or_default(),
                    }
                }
                other => {
                    return Err(SqliteError::Corruption(format!(
                        "blob {} has unknown object type {}",
                        blob_row_id, other
                    )))
                }
            };
            let size = u64::try_from(size).map_err(|_| {
                SqliteError::Corruption(format!("blob {} has negative size", blob_row_id))
            })?;
            value
                .external_objects
                .push(ExternalObject::stored(kind, mime_type, size, blob_row_id));
        }
        Ok(value)
    }

    /// Insert or replace a record and reserve rows for its pending blobs.
    pub(crate) fn put_record(
        &mut self,
        object_store_id: i64,
        key: &Key,
        value: Value,
    ) -> Result<RecordIdentifier> {
        ensure_valid_key(key)?;
        let Value {
            bits,
            external_objects,
        } = value;

        self.sql
            .prepare_cached("INSERT OR REPLACE INTO records (object_store_id, key, value) VALUES (?, ?, ?)")?
            .execute(params![object_store_id, encode_sortable_key(key), bits])?;
        let record_row_id = self.sql.last_insert_rowid();

        for mut object in external_objects {
            if !object.is_pending() {
                // Already stored: share the existing row
                let blob_row_id = object.blob_number().ok_or_else(|| {
                    SqliteError::InvalidArgument(
                        "external object has neither bytes nor a blob number".to_string(),
                    )
                })?;
                self.insert_blob_reference(blob_row_id, Some(record_row_id))?;
                continue;
            }

            let size = i64::try_from(object.size()).map_err(|_| {
                SqliteError::InvalidArgument(format!("blob of {} bytes is too large", object.size()))
            })?;
            let (file_name, last_modified) = match object.kind() {
                ExternalObjectKind::Blob => (None, None),
                ExternalObjectKind::File {
                    name,
                    last_modified,
                } => (
                    Some(name.as_bytes().to_vec()),
                    Some(last_modified.timestamp_micros()),
                ),
            };
            self.sql
                .prepare_cached(
                    "INSERT INTO blobs
                     (object_type, mime_type, size_bytes, bytes, file_name, last_modified)
                     VALUES (?, ?, ?, zeroblob(?), ?, ?)",
                )?
                .execute(params![
                    object.kind().object_type(),
                    object.mime_type(),
                    size,
                    size,
                    file_name,
                    last_modified,
                ])?;
            let blob_row_id = self.sql.last_insert_rowid();
            self.insert_blob_reference(blob_row_id, Some(record_row_id))?;

            object.set_blob_number(blob_row_id);
            self.blobs_to_write.insert(blob_row_id, object);
        }

        Ok(RecordIdentifier::new(record_row_id))
    }

    pub(crate) fn delete_range(&self, object_store_id: i64, range: &KeyRange) -> Result<()> {
        let mut query = String::from("DELETE FROM records WHERE object_store_id = ?");
        let mut values = vec![SqlValue::Integer(object_store_id)];
        push_range_filter(&mut query, "key", range, &mut values);
        self.sql
            .prepare_cached(&query)?
            .execute(params_from_iter(values.iter()))?;
        Ok(())
    }

    pub(crate) fn get_object_store_key_count(
        &self,
        object_store_id: i64,
        range: &KeyRange,
    ) -> Result<u32> {
        let mut query = String::from("SELECT COUNT() FROM records WHERE object_store_id = ?");
        let mut values = vec![SqlValue::Integer(object_store_id)];
        push_range_filter(&mut query, "key", range, &mut values);
        self.count(&query, values)
    }

    pub(crate) fn put_index_data_for_record(
        &self,
        object_store_id: i64,
        index_id: i64,
        key: &Key,
        record: &RecordIdentifier,
    ) -> Result<()> {
        ensure_valid_key(key)?;
        self.sql
            .prepare_cached(
                "INSERT INTO index_references (object_store_id, index_id, key, record_row_id)
                 VALUES (?, ?, ?, ?)",
            )?
            .execute(params![
                object_store_id,
                index_id,
                encode_sortable_key(key),
                record.number,
            ])?;
        Ok(())
    }

    pub(crate) fn get_first_primary_key_for_index_key(
        &self,
        object_store_id: i64,
        index_id: i64,
        key: &Key,
    ) -> Result<Option<Key>> {
        let primary_key: Option<Vec<u8>> = self
            .sql
            .prepare_cached(
                "SELECT records.key FROM index_references
                 INNER JOIN records ON index_references.record_row_id = records.row_id
                 WHERE index_references.object_store_id = ?
                   AND index_references.index_id = ?
                   AND index_references.key = ?
                 ORDER BY records.key ASC
                 LIMIT 1",
            )?
            .query_row(
                params![object_store_id, index_id, encode_sortable_key(key)],
                |row| row.get(0),
            )
            .optional()?;
        match primary_key {
            Some(bytes) => Ok(Some(idbstore_core::decode_sortable_key(&bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn get_index_key_count(
        &self,
        object_store_id: i64,
        index_id: i64,
        range: &KeyRange,
    ) -> Result<u32> {
        let mut query = String::from(
            "SELECT COUNT() FROM index_references WHERE object_store_id = ? AND index_id = ?",
        );
        let mut values = vec![SqlValue::Integer(object_store_id), SqlValue::Integer(index_id)];
        push_range_filter(&mut query, "key", range, &mut values);
        self.count(&query, values)
    }

    fn count(&self, query: &str, values: Vec<SqlValue>) -> Result<u32> {
        let count: i64 = self
            .sql
            .prepare_cached(query)?
            .query_row(params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    // Blobs

    fn blob_row_exists(&self, blob_row_id: i64) -> Result<bool> {
        Ok(self
            .sql
            .prepare_cached("SELECT 1 FROM blobs WHERE row_id = ?")?
            .exists([blob_row_id])?)
    }

    fn insert_blob_reference(&self, blob_row_id: i64, record_row_id: Option<i64>) -> Result<i64> {
        self.sql
            .prepare_cached("INSERT INTO blob_references (blob_row_id, record_row_id) VALUES (?, ?)")?
            .execute(params![blob_row_id, record_row_id])?;
        Ok(self.sql.last_insert_rowid())
    }

    fn delete_blob_reference(&self, reference_row_id: i64) -> Result<()> {
        self.sql
            .prepare_cached("DELETE FROM blob_references WHERE row_id = ?")?
            .execute([reference_row_id])?;
        Ok(())
    }

    /// Hand `objects` to a client.
    ///
    /// Pending objects come back as their source. Stored objects are served
    /// by an active blob, created on first use, with one new client connection each.
    pub(crate) fn create_all_external_objects(
        &mut self,
        objects: &[ExternalObject],
    ) -> Result<Vec<ClientBlob>> {
        let mut created = Vec::new();
        for object in objects {
            if object.is_pending() {
                continue;
            }
            let activated = match object.blob_number() {
                Some(blob_number) if self.active_blobs.contains_key(&blob_number) => continue,
                Some(blob_number) => self.activate_blob(blob_number, object.mime_type()),
                None => Err(SqliteError::InvalidArgument(
                    "external object has neither bytes nor a blob number".to_string(),
                )),
            };
            match activated {
                Ok(blob_number) => created.push(blob_number),
                Err(e) => {
                    // Nobody holds these yet, so they can go without notifying anyone
                    for blob_number in created {
                        if let Some(active) = self.active_blobs.remove(&blob_number) {
                            let _ = self.delete_blob_reference(active.reference_row_id);
                        }
                    }
                    return Err(e);
                }
            }
        }

        let mut blobs = Vec::with_capacity(objects.len());
        for object in objects {
            if let Some(source) = object.source() {
                blobs.push(ClientBlob::Pending(Arc::clone(source)));
            } else if let Some(active) = object
                .blob_number()
                .and_then(|blob_number| self.active_blobs.get(&blob_number))
            {
                blobs.push(ClientBlob::Active(active.streamer.add_receiver()));
            }
        }
        Ok(blobs)
    }

    fn activate_blob(&mut self, blob_number: i64, mime_type: &str) -> Result<i64> {
        let handle = StreamingBlobHandle::open(&self.sql, self.self_ref.clone(), blob_number, true)?;
        let connection = self.self_ref.upgrade().ok_or(SqliteError::ConnectionClosed)?;
        let reference_row_id = self.insert_blob_reference(blob_number, None)?;

        let weak = self.self_ref.clone();
        let streamer = ActiveBlobStreamer::new(
            handle,
            mime_type.to_string(),
            self.config.effective_chunk_size(),
            self.blob_registry.clone(),
            connection,
            Box::new(move || {
                if let Some(connection) = weak.upgrade() {
                    let mut guard = connection.lock();
                    guard.on_blob_became_unused(blob_number);
                }
            }),
        );
        self.active_blobs.insert(
            blob_number,
            ActiveBlob {
                streamer,
                reference_row_id,
            },
        );
        Ok(blob_number)
    }

    fn on_blob_became_unused(&mut self, blob_number: i64) {
        // A receiver vended after the count hit zero keeps the blob active
        let retired = self
            .active_blobs
            .get(&blob_number)
            .is_some_and(|active| active.streamer.retire_if_unused());
        if !retired {
            return;
        }
        let Some(active) = self.active_blobs.remove(&blob_number) else {
            return;
        };
        let reference_row_id = active.reference_row_id;
        drop(active);

        if self.active_blobs.is_empty() && self.is_zygotic() {
            self.destroy();
            return;
        }
        if self.active_rw_transaction.is_some() {
            // The reference row may be part of the open transaction
            self.deferred_reference_cleanup.push(reference_row_id);
            return;
        }
        if let Err(e) = self.delete_blob_reference(reference_row_id) {
            warn!("{} Releasing blob {} failed: {}", prefix::BLOB, blob_number, e);
        }
    }

    fn run_deferred_reference_cleanup(&mut self) {
        for reference_row_id in std::mem::take(&mut self.deferred_reference_cleanup) {
            if let Err(e) = self.delete_blob_reference(reference_row_id) {
                warn!(
                    "{} Releasing blob reference {} failed: {}",
                    prefix::BLOB,
                    reference_row_id,
                    e
                );
            }
        }
    }

    /// Re-create reference rows of active blobs that a rollback removed.
    fn restore_active_blob_references(&mut self) {
        for (blob_number, active) in self.active_blobs.iter_mut() {
            let exists = self
                .sql
                .prepare_cached("SELECT 1 FROM blob_references WHERE row_id = ?")
                .and_then(|mut statement| statement.exists([active.reference_row_id]));
            match exists {
                Ok(true) => {}
                Ok(false) => {
                    let restored = self
                        .sql
                        .prepare_cached("INSERT INTO blob_references (blob_row_id) VALUES (?)")
                        .and_then(|mut statement| statement.execute([*blob_number]));
                    match restored {
                        Ok(_) => active.reference_row_id = self.sql.last_insert_rowid(),
                        Err(e) => warn!(
                            "{} Restoring reference of blob {} failed: {}",
                            prefix::BLOB,
                            blob_number,
                            e
                        ),
                    }
                }
                Err(e) => warn!(
                    "{} Checking reference of blob {} failed: {}",
                    prefix::BLOB,
                    blob_number,
                    e
                ),
            }
        }
    }

    // Long-lived statements

    /// Register the query behind an iterator. The text is prepared once here
    /// and stays in the statement cache across steps.
    pub(crate) fn create_long_lived_statement(&mut self, query: String) -> Result<u64> {
        self.sql.prepare_cached(&query)?;
        self.next_statement_id += 1;
        let id = self.next_statement_id;
        self.statements.insert(id, query);
        Ok(id)
    }

    pub(crate) fn long_lived_statement(&self, id: u64) -> Option<&str> {
        self.statements.get(&id).map(String::as_str)
    }

    pub(crate) fn release_long_lived_statement(&mut self, id: u64) {
        self.statements.remove(&id);
    }

    // Deletion

    /// Delete the database's contents.
    ///
    /// Without active blobs the owner drops the connection right away.
    /// Otherwise the data is cleared, the version reset, and the connection
    /// lingers until the last active blob goes inactive.
    pub(crate) fn delete_idb_database(&mut self) -> Result<()> {
        let name = self.metadata.name.clone();
        info!("{} Deleting database {}", prefix::DB, name);

        if let Some(mode) = self.active_rw_transaction {
            warn!(
                "{} Database {} deleted during a {:?} transaction, rolling it back",
                prefix::DB,
                name,
                mode
            );
            self.rollback_transaction(mode);
        }

        self.metadata = DatabaseMetadata::new(name);
        self.metadata_snapshot = None;
        self.generations.bump(RefScope::Transaction);
        self.generations.bump(RefScope::RecordIterator);
        self.generations.bump(RefScope::BlobWriter);
        self.statements.clear();

        if self.active_blobs.is_empty() {
            self.destroy();
            return Ok(());
        }

        self.sql.execute_batch(
            "DELETE FROM blob_references WHERE record_row_id IS NOT NULL;
             DELETE FROM index_references;
             DELETE FROM indexes;
             DELETE FROM records;
             DELETE FROM object_stores;",
        )?;
        self.sql
            .prepare_cached("UPDATE indexed_db_metadata SET version = ?")?
            .execute([NO_VERSION])?;
        debug!(
            "{} Database {} lingers for {} active blobs",
            prefix::DB,
            self.metadata.name,
            self.active_blobs.len()
        );
        Ok(())
    }

    fn destroy(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.destroy_connection(&self.metadata.name, &self.self_ref);
        }
    }
}

impl Drop for DatabaseConnection {
    fn drop(&mut self) {
        debug!(
            "{} Closing database {}",
            prefix::PULSE_CLOSE,
            self.metadata.name
        );
    }
}

fn configure(sql: &Connection, config: &StoreConfig) -> Result<()> {
    if config.exclusive_locking {
        sql.pragma_update_and_check(None, "locking_mode", "EXCLUSIVE", |row| {
            row.get::<_, String>(0)
        })?;
    }
    if config.wal_mode {
        // In-memory databases report "memory" and keep it
        sql.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    }
    // Lets INSERT OR REPLACE fire the delete triggers
    sql.pragma_update(None, "recursive_triggers", true)?;
    sql.set_prepared_statement_cache_capacity(config.statement_cache_capacity);
    Ok(())
}

fn ensure_valid_key(key: &Key) -> Result<()> {
    if key.is_valid() {
        Ok(())
    } else {
        Err(SqliteError::InvalidArgument(format!("invalid key {}", key)))
    }
}

/// Append `AND column >[=] ? AND column <[=] ?` for the bounds `range` has.
pub(crate) fn push_range_filter(
    query: &mut String,
    column: &str,
    range: &KeyRange,
    values: &mut Vec<SqlValue>,
) {
    if let Some(lower) = &range.lower {
        let op = if range.lower_open { ">" } else { ">=" };
        query.push_str(&format!(" AND {} {} ?", column, op));
        values.push(SqlValue::Blob(encode_sortable_key(lower)));
    }
    if let Some(upper) = &range.upper {
        let op = if range.upper_open { "<" } else { "<=" };
        query.push_str(&format!(" AND {} {} ?", column, op));
        values.push(SqlValue::Blob(encode_sortable_key(upper)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idbstore_core::storage::TransactionMode::*;
    use pretty_assertions::assert_eq;

    struct NoOwner;

    impl ConnectionOwner for NoOwner {
        fn destroy_connection(&self, _: &IdbName, _: &Weak<Mutex<DatabaseConnection>>) {}
    }

    fn open(name: &str) -> SharedConnection {
        let owner: Weak<dyn ConnectionOwner> = Weak::<NoOwner>::new();
        DatabaseConnection::open(
            &IdbName::from(name),
            StoreConfig::default(),
            owner,
            BlobRegistry::new(),
        )
        .unwrap()
    }

    fn with_store(db: &mut DatabaseConnection) {
        db.begin_transaction(VersionChange, Durability::Default).unwrap();
        db.set_database_version(1).unwrap();
        db.create_object_store(1, IdbName::from("s"), KeyPath::None, false)
            .unwrap();
        db.commit_phase_two(VersionChange).unwrap();
    }

    #[test]
    fn test_open_is_zygotic() {
        let connection = open("db");
        let db = connection.lock();
        assert!(db.is_zygotic());
        assert_eq!(db.metadata().name, IdbName::from("db"));
    }

    #[test]
    fn test_blob_row_goes_with_its_last_reference() {
        let connection = open("db");
        let db = connection.lock();
        db.sql()
            .execute_batch(
                "INSERT INTO blobs (object_type, mime_type, size_bytes, bytes) VALUES (0, 'x', 1, x'00');",
            )
            .unwrap();
        let first = db.insert_blob_reference(1, None).unwrap();
        let second = db.insert_blob_reference(1, None).unwrap();

        db.delete_blob_reference(first).unwrap();
        assert!(db.blob_row_exists(1).unwrap());
        db.delete_blob_reference(second).unwrap();
        assert!(!db.blob_row_exists(1).unwrap());
    }

    #[test]
    fn test_blob_vended_during_pending_release_stays_active() {
        let connection = open("db");
        let object = ExternalObject::stored(ExternalObjectKind::Blob, "text/plain", 3, 1);
        {
            let mut db = connection.lock();
            with_store(&mut db);
            db.sql()
                .execute_batch(
                    "INSERT INTO blobs (object_type, mime_type, size_bytes, bytes) \
                     VALUES (0, 'text/plain', 3, x'616263');",
                )
                .unwrap();
        }
        let first = connection
            .lock()
            .create_all_external_objects(std::slice::from_ref(&object))
            .unwrap();

        // Drop the only handle while the connection is busy vending
        let mut db = connection.lock();
        let releaser = std::thread::spawn(move || drop(first));
        while db.active_blobs[&1].streamer.receivers() > 0 {
            std::thread::yield_now();
        }
        let second = db
            .create_all_external_objects(std::slice::from_ref(&object))
            .unwrap();
        drop(db);
        releaser.join().unwrap();

        {
            let db = connection.lock();
            assert_eq!(db.active_blob_count(), 1);
            assert!(db.blob_row_exists(1).unwrap());
        }

        drop(second);
        let db = connection.lock();
        assert_eq!(db.active_blob_count(), 0);
        assert!(!db.blob_row_exists(1).unwrap());
    }

    #[test]
    #[should_panic(expected = "only one read-write transaction")]
    fn test_second_read_write_transaction_panics() {
        let connection = open("db");
        let mut db = connection.lock();
        db.begin_transaction(ReadWrite, Durability::Default).unwrap();
        let _ = db.begin_transaction(ReadWrite, Durability::Default);
    }

    #[test]
    #[should_panic(expected = "version-change transaction")]
    fn test_schema_change_outside_version_change_panics() {
        let connection = open("db");
        let mut db = connection.lock();
        db.begin_transaction(ReadWrite, Durability::Default).unwrap();
        let _ = db.set_database_version(3);
    }

    #[test]
    fn test_rollback_restores_metadata_snapshot() {
        let connection = open("db");
        let mut db = connection.lock();
        with_store(&mut db);
        let before = db.metadata().clone();

        db.begin_transaction(VersionChange, Durability::Default).unwrap();
        db.set_database_version(2).unwrap();
        db.create_object_store(2, IdbName::from("t"), KeyPath::from("id"), true)
            .unwrap();
        db.delete_object_store(1).unwrap();
        db.rollback_transaction(VersionChange);

        assert_eq!(db.metadata(), &before);
        assert_eq!(schema::load_metadata(db.sql()).unwrap(), before);
    }

    #[test]
    fn test_key_generator_only_moves_up() {
        let connection = open("db");
        let mut db = connection.lock();
        with_store(&mut db);

        assert_eq!(db.get_key_generator_current_number(1).unwrap(), 1);
        db.maybe_update_key_generator_current_number(1, 10).unwrap();
        db.maybe_update_key_generator_current_number(1, 4).unwrap();
        assert_eq!(db.get_key_generator_current_number(1).unwrap(), 10);
        assert!(matches!(
            db.get_key_generator_current_number(99),
            Err(SqliteError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_range_filter_sql() {
        let mut query = String::from("SELECT 1 WHERE 1");
        let mut values = Vec::new();
        let range = KeyRange::bound(Key::from(1), Key::from(2), true, false);
        push_range_filter(&mut query, "key", &range, &mut values);
        assert_eq!(query, "SELECT 1 WHERE 1 AND key > ? AND key <= ?");
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_long_lived_statements() {
        let connection = open("db");
        let mut db = connection.lock();
        let a = db
            .create_long_lived_statement("SELECT key FROM records".to_string())
            .unwrap();
        let b = db
            .create_long_lived_statement("SELECT value FROM records".to_string())
            .unwrap();
        assert!(b > a);
        assert_eq!(db.long_lived_statement(a), Some("SELECT key FROM records"));
        db.release_long_lived_statement(a);
        assert_eq!(db.long_lived_statement(a), None);
        assert!(db
            .create_long_lived_statement("SELECT nope FROM nowhere".to_string())
            .is_err());
    }
}
