//! Process-wide lookup of active blobs by UUID
//!
//! A blob is registered while at least one client connection is attached to
//! it. Other subsystems use the UUID to obtain a [`BlobReader`], which keeps
//! the blob readable on its own.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::active_blob::{BlobReader, StreamerShared};

/// Shared registry of active blobs. Cloning shares the same registry.
#[derive(Clone, Default)]
pub struct BlobRegistry {
    entries: Arc<Mutex<HashMap<Uuid, Weak<StreamerShared>>>>,
}

impl BlobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, uuid: Uuid, streamer: Weak<StreamerShared>) {
        self.entries.lock().insert(uuid, streamer);
    }

    pub(crate) fn unregister(&self, uuid: &Uuid) {
        self.entries.lock().remove(uuid);
    }

    pub fn is_registered(&self, uuid: &Uuid) -> bool {
        self.entries.lock().contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// A reader for the blob registered under `uuid`, if it is still active.
    pub fn reader(&self, uuid: &Uuid) -> Option<BlobReader> {
        let streamer = self.entries.lock().get(uuid).and_then(Weak::upgrade)?;
        streamer.add_reader()
    }
}

impl fmt::Debug for BlobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobRegistry")
            .field("entries", &self.len())
            .finish()
    }
}
