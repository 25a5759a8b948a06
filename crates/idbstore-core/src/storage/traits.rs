//! Storage trait definitions

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::key::Key;
use crate::key_path::KeyPath;
use crate::key_range::KeyRange;
use crate::metadata::IndexMetadata;
use crate::name::IdbName;
use crate::record::RecordIdentifier;
use crate::storage::error::{StoreError, StoreResult};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write, and allowed to change the schema.
    VersionChange,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    #[default]
    Default,
    Strict,
    Relaxed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CursorDirection {
    #[default]
    Next,
    /// Index scans only: one record per distinct index key, the lowest primary key.
    NextNoDuplicate,
    Prev,
    /// Index scans only: one record per distinct index key, the lowest primary key.
    PrevNoDuplicate,
}

impl CursorDirection {
    pub fn is_ascending(self) -> bool {
        matches!(self, CursorDirection::Next | CursorDirection::NextNoDuplicate)
    }

    pub fn is_unique(self) -> bool {
        matches!(
            self,
            CursorDirection::NextNoDuplicate | CursorDirection::PrevNoDuplicate
        )
    }
}

/// Outcome of streaming a transaction's pending blobs into storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobWriteResult {
    Success,
    Error,
}

/// How commit phase one finished.
#[derive(Debug)]
pub enum BlobWriteCompletion {
    /// Nothing to stream, or streaming failed before it started.
    Ready(BlobWriteResult),
    /// Blob writers are running. Resolves once all finish or one fails.
    Pending(oneshot::Receiver<BlobWriteResult>),
}

impl BlobWriteCompletion {
    /// Wait for the result. A completion dropped by the engine reads as a failure.
    pub async fn wait(self) -> BlobWriteResult {
        match self {
            BlobWriteCompletion::Ready(result) => result,
            BlobWriteCompletion::Pending(receiver) => {
                receiver.await.unwrap_or(BlobWriteResult::Error)
            }
        }
    }
}

/// A positioned scan over an object store or index.
pub trait Cursor: Send {
    fn key(&self) -> &Key;

    fn primary_key(&self) -> &Key;

    /// `None` for key-only cursors.
    fn value(&self) -> Option<&Value>;

    /// Skip `count` records. Returns `false` once the scan is exhausted.
    fn advance(&mut self, count: u32) -> StoreResult<bool>;

    /// Move to the next record, or to the first record at or past the target
    /// key (and target primary key, for index scans).
    /// Returns `false` once the scan is exhausted.
    fn continue_to(&mut self, key: Option<&Key>, primary_key: Option<&Key>)
        -> StoreResult<bool>;

    /// Independent copy of the cursor, when the backend supports it.
    fn try_clone(&self) -> Option<Box<dyn Cursor>>;
}

/// A unit of work against one database.
///
/// Read-only transactions never touch the SQL transaction. At most one
/// read-write or version-change transaction is active per database.
pub trait Transaction: Send {
    type Cursor: Cursor;

    fn mode(&self) -> TransactionMode;

    fn begin(&mut self) -> StoreResult<()>;

    /// Start streaming pending blobs.
    fn commit_phase_one(&mut self) -> StoreResult<BlobWriteCompletion>;

    /// Make the transaction durable. Only valid after phase one succeeded.
    fn commit_phase_two(&mut self) -> StoreResult<()>;

    fn rollback(&mut self);

    /// Both commit phases. Rolls back if the blob writes fail.
    fn commit(&mut self) -> impl Future<Output = StoreResult<()>> + Send {
        async move {
            let completion = self.commit_phase_one()?;
            match completion.wait().await {
                BlobWriteResult::Success => self.commit_phase_two(),
                BlobWriteResult::Error => {
                    self.rollback();
                    Err(StoreError::BlobWrite(
                        "pending blob could not be written".to_string(),
                    ))
                }
            }
        }
    }

    // Schema changes, version-change transactions only

    fn set_database_version(&mut self, version: i64) -> StoreResult<()>;

    fn create_object_store(
        &mut self,
        object_store_id: i64,
        name: IdbName,
        key_path: KeyPath,
        auto_increment: bool,
    ) -> StoreResult<()>;

    fn delete_object_store(&mut self, object_store_id: i64) -> StoreResult<()>;

    fn create_index(&mut self, object_store_id: i64, index: IndexMetadata) -> StoreResult<()>;

    // Records

    fn get_key_generator_current_number(&self, object_store_id: i64) -> StoreResult<i64>;

    /// Raise the generator to `new_number` if it is currently lower.
    fn maybe_update_key_generator_current_number(
        &self,
        object_store_id: i64,
        new_number: i64,
    ) -> StoreResult<()>;

    fn get_record_identifier_if_exists(
        &self,
        object_store_id: i64,
        key: &Key,
    ) -> StoreResult<Option<RecordIdentifier>>;

    fn get_value(&self, object_store_id: i64, key: &Key) -> StoreResult<Option<Value>>;

    /// Insert or replace. Replacing drops the old record's index entries and blob references.
    fn put_record(
        &self,
        object_store_id: i64,
        key: &Key,
        value: Value,
    ) -> StoreResult<RecordIdentifier>;

    fn delete_range(&self, object_store_id: i64, range: &KeyRange) -> StoreResult<()>;

    fn get_object_store_key_count(&self, object_store_id: i64, range: &KeyRange)
        -> StoreResult<u32>;

    fn put_index_data_for_record(
        &self,
        object_store_id: i64,
        index_id: i64,
        key: &Key,
        record: &RecordIdentifier,
    ) -> StoreResult<()>;

    fn get_first_primary_key_for_index_key(
        &self,
        object_store_id: i64,
        index_id: i64,
        key: &Key,
    ) -> StoreResult<Option<Key>>;

    fn get_index_key_count(
        &self,
        object_store_id: i64,
        index_id: i64,
        range: &KeyRange,
    ) -> StoreResult<u32>;

    /// `None` when nothing is in range.
    fn open_object_store_cursor(
        &self,
        object_store_id: i64,
        range: &KeyRange,
        direction: CursorDirection,
        key_only: bool,
    ) -> StoreResult<Option<Self::Cursor>>;

    /// `None` when nothing is in range.
    fn open_index_cursor(
        &self,
        object_store_id: i64,
        index_id: i64,
        range: &KeyRange,
        direction: CursorDirection,
        key_only: bool,
    ) -> StoreResult<Option<Self::Cursor>>;
}
