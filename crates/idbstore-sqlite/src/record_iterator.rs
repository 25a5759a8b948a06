//! Resumable range scans over object stores and indexes
//!
//! An iterator keeps the encoded key of the record it last produced and
//! registers one query with the connection. Each step re-runs that query with
//! the stored position bound, so the scan picks up where it left off even
//! when records were written in between. `OFFSET` implements `advance(n)`.

use idbstore_core::storage::CursorDirection;
use idbstore_core::{decode_sortable_key, encode_sortable_key, Key, KeyRange, Record, Value};
use rusqlite::types::{ToSql, Value as SqlValue};
use rusqlite::Row;

use crate::connection::{ConnectionRef, DatabaseConnection, RefScope};
use crate::error::{Result, SqliteError};

type Parameters = Vec<(&'static str, SqlValue)>;

/// A scan positioned on its last produced record.
pub(crate) trait RecordIterator: Send {
    fn connection(&self) -> &ConnectionRef;

    fn statement_id(&self) -> u64;

    /// Parameters that stay the same for every step.
    fn fixed_parameters(&self) -> Parameters;

    /// Parameters locating the next step from the current position.
    fn seek_parameters(&self, target_key: Option<&Key>, target_primary_key: Option<&Key>)
        -> Parameters;

    /// Decode a result row and move the position onto it.
    fn read_row(&mut self, db: &DatabaseConnection, row: &Row<'_>) -> Result<Record>;

    /// Next record, or the first at or past the targets.
    fn iterate(
        &mut self,
        target_key: Option<&Key>,
        target_primary_key: Option<&Key>,
    ) -> Result<Option<Record>> {
        self.step(target_key, target_primary_key, 0)
    }

    /// Skip `count - 1` records and produce the one after.
    fn advance(&mut self, count: u32) -> Result<Option<Record>> {
        if count == 0 {
            return Err(SqliteError::InvalidArgument(
                "advance count must be positive".to_string(),
            ));
        }
        self.step(None, None, count - 1)
    }

    fn step(
        &mut self,
        target_key: Option<&Key>,
        target_primary_key: Option<&Key>,
        offset: u32,
    ) -> Result<Option<Record>> {
        let mut parameters = self.fixed_parameters();
        parameters.extend(self.seek_parameters(target_key, target_primary_key));
        parameters.push(("@offset", SqlValue::Integer(i64::from(offset))));
        let statement_id = self.statement_id();

        let connection = self.connection().clone();
        connection
            .with(|db| {
                let db: &DatabaseConnection = db;
                let query = db
                    .long_lived_statement(statement_id)
                    .ok_or(SqliteError::ConnectionClosed)?;
                let mut statement = db.sql().prepare_cached(query)?;
                let bound: Vec<(&str, &dyn ToSql)> = parameters
                    .iter()
                    .map(|(name, value)| (*name, value as &dyn ToSql))
                    .collect();
                let mut rows = statement.query(bound.as_slice())?;
                match rows.next()? {
                    Some(row) => Ok(Some(self.read_row(db, row)?)),
                    None => Ok(None),
                }
            })
            .unwrap_or(Err(SqliteError::ConnectionClosed))
    }
}

fn range_filter(query: &mut String, column: &str, range: &KeyRange) {
    if range.lower.is_some() {
        let op = if range.lower_open { ">" } else { ">=" };
        query.push_str(&format!(" AND {} {} @lower", column, op));
    }
    if range.upper.is_some() {
        let op = if range.upper_open { "<" } else { "<=" };
        query.push_str(&format!(" AND {} {} @upper", column, op));
    }
}

fn range_parameters(range: &KeyRange, parameters: &mut Parameters) {
    if let Some(lower) = &range.lower {
        parameters.push(("@lower", SqlValue::Blob(encode_sortable_key(lower))));
    }
    if let Some(upper) = &range.upper {
        parameters.push(("@upper", SqlValue::Blob(encode_sortable_key(upper))));
    }
}

fn optional_key(key: Option<&Key>) -> SqlValue {
    key.map_or(SqlValue::Null, |key| SqlValue::Blob(encode_sortable_key(key)))
}

fn optional_blob(bytes: &Option<Vec<u8>>) -> SqlValue {
    bytes.clone().map_or(SqlValue::Null, SqlValue::Blob)
}

/// Scans the records of one object store.
pub(crate) struct ObjectStoreRecordIterator {
    connection: ConnectionRef,
    statement_id: u64,
    object_store_id: i64,
    range: KeyRange,
    key_only: bool,
    /// Encoded key of the last record, `None` before the first step
    position: Option<Vec<u8>>,
}

impl ObjectStoreRecordIterator {
    pub(crate) fn create(
        db: &mut DatabaseConnection,
        object_store_id: i64,
        range: &KeyRange,
        direction: CursorDirection,
        key_only: bool,
    ) -> Result<Self> {
        let mut query = String::from("SELECT ");
        query.push_str(if key_only { "key" } else { "key, value, row_id" });
        query.push_str(" FROM records WHERE object_store_id = @object_store_id");
        range_filter(&mut query, "key", range);
        if direction.is_ascending() {
            query.push_str(
                " AND (@is_first_seek = 1 OR key > @position) \
                 AND (@target_key IS NULL OR key >= @target_key) \
                 ORDER BY key ASC",
            );
        } else {
            query.push_str(
                " AND (@is_first_seek = 1 OR key < @position) \
                 AND (@target_key IS NULL OR key <= @target_key) \
                 ORDER BY key DESC",
            );
        }
        // A negative LIMIT means no limit, and OFFSET needs a LIMIT
        query.push_str(" LIMIT -1 OFFSET @offset");

        let statement_id = db.create_long_lived_statement(query)?;
        Ok(Self {
            connection: db.connection_ref(RefScope::RecordIterator),
            statement_id,
            object_store_id,
            range: range.clone(),
            key_only,
            position: None,
        })
    }
}

impl RecordIterator for ObjectStoreRecordIterator {
    fn connection(&self) -> &ConnectionRef {
        &self.connection
    }

    fn statement_id(&self) -> u64 {
        self.statement_id
    }

    fn fixed_parameters(&self) -> Parameters {
        let mut parameters = vec![("@object_store_id", SqlValue::Integer(self.object_store_id))];
        range_parameters(&self.range, &mut parameters);
        parameters
    }

    fn seek_parameters(&self, target_key: Option<&Key>, _: Option<&Key>) -> Parameters {
        vec![
            ("@is_first_seek", SqlValue::Integer(i64::from(self.position.is_none()))),
            ("@position", optional_blob(&self.position)),
            ("@target_key", optional_key(target_key)),
        ]
    }

    fn read_row(&mut self, db: &DatabaseConnection, row: &Row<'_>) -> Result<Record> {
        let position: Vec<u8> = row.get(0)?;
        let key = decode_sortable_key(&position)?;
        self.position = Some(position);
        if self.key_only {
            return Ok(Record::ObjectStoreKeyOnly { key });
        }
        let bits: Vec<u8> = row.get(1)?;
        let record_row_id: i64 = row.get(2)?;
        let value = db.add_external_object_metadata_to_value(Value::new(bits), record_row_id)?;
        Ok(Record::ObjectStore { key, value })
    }
}

impl Drop for ObjectStoreRecordIterator {
    fn drop(&mut self) {
        let statement_id = self.statement_id;
        self.connection
            .with(|db| db.release_long_lived_statement(statement_id));
    }
}

/// Scans the entries of one index, joined with their records.
///
/// Entries are ordered by index key, then primary key. The no-duplicate
/// directions keep only the smallest primary key per index key.
pub(crate) struct IndexRecordIterator {
    connection: ConnectionRef,
    statement_id: u64,
    object_store_id: i64,
    index_id: i64,
    range: KeyRange,
    key_only: bool,
    position: Option<Vec<u8>>,
    primary_key_position: Option<Vec<u8>>,
}

impl IndexRecordIterator {
    pub(crate) fn create(
        db: &mut DatabaseConnection,
        object_store_id: i64,
        index_id: i64,
        range: &KeyRange,
        direction: CursorDirection,
        key_only: bool,
    ) -> Result<Self> {
        let ascending = direction.is_ascending();
        let first_primary_keys_only = direction.is_unique();

        let mut query = String::from("WITH record_range AS (SELECT index_references.key AS index_key");
        if first_primary_keys_only {
            query.push_str(", MIN(records.key) AS primary_key");
        } else {
            query.push_str(", records.key AS primary_key");
        }
        if !key_only {
            query.push_str(", records.value AS value, records.row_id AS record_row_id");
        }
        query.push_str(
            " FROM index_references INNER JOIN records \
              ON index_references.record_row_id = records.row_id \
             WHERE index_references.object_store_id = @object_store_id \
              AND index_references.index_id = @index_id",
        );
        range_filter(&mut query, "index_references.key", range);
        if first_primary_keys_only {
            query.push_str(" GROUP BY index_references.key");
        }
        if ascending {
            query.push_str(" ORDER BY index_key ASC, primary_key ASC)");
        } else {
            query.push_str(" ORDER BY index_key DESC, primary_key DESC)");
        }

        if key_only {
            query.push_str(" SELECT index_key, primary_key FROM record_range WHERE");
        } else {
            query.push_str(" SELECT index_key, primary_key, value, record_row_id FROM record_range WHERE");
        }
        if ascending {
            query.push_str(
                " (@is_first_seek = 1 \
                  OR (index_key = @position AND primary_key > @primary_key_position) \
                  OR index_key > @position) \
                 AND (@target_key IS NULL \
                  OR index_key > @target_key \
                  OR (index_key = @target_key \
                   AND (@target_primary_key IS NULL OR primary_key >= @target_primary_key)))",
            );
        } else {
            query.push_str(
                " (@is_first_seek = 1 \
                  OR (index_key = @position AND primary_key < @primary_key_position) \
                  OR index_key < @position) \
                 AND (@target_key IS NULL \
                  OR index_key < @target_key \
                  OR (index_key = @target_key \
                   AND (@target_primary_key IS NULL OR primary_key <= @target_primary_key)))",
            );
        }
        query.push_str(" LIMIT -1 OFFSET @offset");

        let statement_id = db.create_long_lived_statement(query)?;
        Ok(Self {
            connection: db.connection_ref(RefScope::RecordIterator),
            statement_id,
            object_store_id,
            index_id,
            range: range.clone(),
            key_only,
            position: None,
            primary_key_position: None,
        })
    }
}

impl RecordIterator for IndexRecordIterator {
    fn connection(&self) -> &ConnectionRef {
        &self.connection
    }

    fn statement_id(&self) -> u64 {
        self.statement_id
    }

    fn fixed_parameters(&self) -> Parameters {
        let mut parameters = vec![
            ("@object_store_id", SqlValue::Integer(self.object_store_id)),
            ("@index_id", SqlValue::Integer(self.index_id)),
        ];
        range_parameters(&self.range, &mut parameters);
        parameters
    }

    fn seek_parameters(
        &self,
        target_key: Option<&Key>,
        target_primary_key: Option<&Key>,
    ) -> Parameters {
        vec![
            ("@is_first_seek", SqlValue::Integer(i64::from(self.position.is_none()))),
            ("@position", optional_blob(&self.position)),
            ("@primary_key_position", optional_blob(&self.primary_key_position)),
            ("@target_key", optional_key(target_key)),
            ("@target_primary_key", optional_key(target_primary_key)),
        ]
    }

    fn read_row(&mut self, db: &DatabaseConnection, row: &Row<'_>) -> Result<Record> {
        let position: Vec<u8> = row.get(0)?;
        let primary_key_position: Vec<u8> = row.get(1)?;
        let key = decode_sortable_key(&position)?;
        let primary_key = decode_sortable_key(&primary_key_position)?;
        self.position = Some(position);
        self.primary_key_position = Some(primary_key_position);
        if self.key_only {
            return Ok(Record::IndexKeyOnly { key, primary_key });
        }
        let bits: Vec<u8> = row.get(2)?;
        let record_row_id: i64 = row.get(3)?;
        let value = db.add_external_object_metadata_to_value(Value::new(bits), record_row_id)?;
        Ok(Record::Index {
            key,
            primary_key,
            value,
        })
    }
}

impl Drop for IndexRecordIterator {
    fn drop(&mut self) {
        let statement_id = self.statement_id;
        self.connection
            .with(|db| db.release_long_lived_statement(statement_id));
    }
}
