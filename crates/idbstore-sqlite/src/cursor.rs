//! Cursor over a record iterator

use idbstore_core::storage::Cursor;
use idbstore_core::{Key, Record, StoreError, StoreResult, Value};

use crate::record_iterator::RecordIterator;

/// A scan positioned on its current record.
///
/// Once a step runs off the end of the range the cursor keeps its last record
/// and every further step returns `false`.
pub struct SqliteCursor {
    iterator: Box<dyn RecordIterator>,
    current: Record,
    exhausted: bool,
}

impl SqliteCursor {
    pub(crate) fn new(iterator: Box<dyn RecordIterator>, first: Record) -> Self {
        Self {
            iterator,
            current: first,
            exhausted: false,
        }
    }

    /// The record the cursor is on.
    pub fn record(&self) -> &Record {
        &self.current
    }

    fn move_to(&mut self, next: Option<Record>) -> bool {
        match next {
            Some(record) => {
                self.current = record;
                true
            }
            None => {
                self.exhausted = true;
                false
            }
        }
    }
}

impl Cursor for SqliteCursor {
    fn key(&self) -> &Key {
        self.current.key()
    }

    fn primary_key(&self) -> &Key {
        self.current.primary_key()
    }

    fn value(&self) -> Option<&Value> {
        self.current.value()
    }

    fn advance(&mut self, count: u32) -> StoreResult<bool> {
        if count == 0 {
            return Err(StoreError::InvalidArgument(
                "advance count must be positive".to_string(),
            ));
        }
        if self.exhausted {
            return Ok(false);
        }
        let next = self.iterator.advance(count)?;
        Ok(self.move_to(next))
    }

    fn continue_to(&mut self, key: Option<&Key>, primary_key: Option<&Key>) -> StoreResult<bool> {
        if self.exhausted {
            return Ok(false);
        }
        let next = self.iterator.iterate(key, primary_key)?;
        Ok(self.move_to(next))
    }

    fn try_clone(&self) -> Option<Box<dyn Cursor>> {
        None
    }
}

impl std::fmt::Debug for SqliteCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCursor")
            .field("current", &self.current)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
