//! Blobs handed out to clients while their database stays open
//!
//! An active blob serves reads of one stored blob row to any number of client
//! connections and registry readers. Its lifetime is independent of the
//! transaction that produced it: it keeps the database connection alive, and
//! the connection keeps a reference row in `blob_references` so the bytes
//! survive deletion of the record that held them.
//!
//! When the last client connection and the last reader are gone, the
//! streamer notifies the connection. The connection retires it under its own
//! lock, and only if nothing attached in the meantime. A retired streamer
//! never gains users again.

use std::fmt;
use std::sync::Arc;

use idbstore_core::BlobSource;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::blob_pump::{pump_with_client, BlobReaderClient, ReadOutcome};
use crate::blob_registry::BlobRegistry;
use crate::connection::SharedConnection;
use crate::logging::prefix;
use crate::streaming_blob::StreamingBlobHandle;

/// Called each time the use count drops to zero.
pub(crate) type UnusedCallback = Box<dyn Fn() + Send + Sync>;

/// The connection's entry for an active blob.
pub(crate) struct ActiveBlobStreamer {
    shared: Arc<StreamerShared>,
}

pub(crate) struct StreamerShared {
    uuid: Uuid,
    content_type: String,
    handle: StreamingBlobHandle,
    chunk_size: usize,
    registry: BlobRegistry,
    state: Mutex<StreamerState>,
    on_unused: UnusedCallback,
    // Keeps the database open while the blob is readable
    _connection: SharedConnection,
}

struct StreamerState {
    receivers: usize,
    readers: usize,
    registered: bool,
    retired: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseKind {
    Receiver,
    Reader,
}

/// One counted use of a streamer. Dropping it releases the use.
struct Lease {
    shared: Arc<StreamerShared>,
    kind: LeaseKind,
}

impl ActiveBlobStreamer {
    pub(crate) fn new(
        handle: StreamingBlobHandle,
        content_type: String,
        chunk_size: usize,
        registry: BlobRegistry,
        connection: SharedConnection,
        on_unused: UnusedCallback,
    ) -> Self {
        let shared = Arc::new(StreamerShared {
            uuid: Uuid::new_v4(),
            content_type,
            handle,
            chunk_size,
            registry,
            state: Mutex::new(StreamerState {
                receivers: 0,
                readers: 0,
                registered: false,
                retired: false,
            }),
            on_unused,
            _connection: connection,
        });
        debug!(
            "{} Blob {} active as {}",
            prefix::BLOB,
            shared.handle.row_id(),
            shared.uuid
        );
        Self { shared }
    }

    /// Attach a new client connection. Only called by the connection that
    /// owns this streamer, under its lock, so the streamer is not retired.
    pub(crate) fn add_receiver(&self) -> BlobHandle {
        BlobHandle {
            lease: self.shared.add_receiver(),
        }
    }

    /// Mark the streamer retired if nothing uses it. Callers hold the
    /// connection lock and drop the streamer when this returns `true`.
    pub(crate) fn retire_if_unused(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.receivers == 0 && state.readers == 0 && !state.retired {
            state.retired = true;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn receivers(&self) -> usize {
        self.shared.receivers()
    }
}

impl StreamerShared {
    fn add_receiver(self: &Arc<Self>) -> Lease {
        let register = {
            let mut state = self.state.lock();
            debug_assert!(!state.retired);
            state.receivers += 1;
            !std::mem::replace(&mut state.registered, true)
        };
        if register {
            self.registry.register(self.uuid, Arc::downgrade(self));
        }
        Lease {
            shared: Arc::clone(self),
            kind: LeaseKind::Receiver,
        }
    }

    /// Attach a registry reader. `None` once the streamer is retired.
    pub(crate) fn add_reader(self: &Arc<Self>) -> Option<BlobReader> {
        {
            let mut state = self.state.lock();
            if state.retired {
                return None;
            }
            state.readers += 1;
        }
        Some(BlobReader {
            lease: Lease {
                shared: Arc::clone(self),
                kind: LeaseKind::Reader,
            },
        })
    }

    fn release(&self, kind: LeaseKind) {
        let (unregister, unused) = {
            let mut state = self.state.lock();
            match kind {
                LeaseKind::Receiver => state.receivers -= 1,
                LeaseKind::Reader => state.readers -= 1,
            }
            let unregister = state.receivers == 0 && std::mem::take(&mut state.registered);
            (unregister, state.receivers == 0 && state.readers == 0)
        };

        if unregister {
            self.registry.unregister(&self.uuid);
        }
        if unused {
            debug!("{} Blob {} unused", prefix::BLOB, self.handle.row_id());
            (self.on_unused)();
        }
    }

    fn read<W>(
        self: &Arc<Self>,
        keep_alive: Lease,
        offset: u64,
        length: u64,
        dest: W,
        client: Option<Arc<dyn BlobReaderClient>>,
    ) -> JoinHandle<ReadOutcome>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = pump_with_client(
                &shared.handle,
                offset,
                length,
                dest,
                shared.chunk_size,
                client,
            )
            .await;
            drop(keep_alive);
            outcome
        })
    }

    fn receivers(&self) -> usize {
        self.state.lock().receivers
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.shared.release(self.kind);
    }
}

/// A blob as handed to a client.
#[derive(Debug)]
pub enum ClientBlob {
    /// Bytes not yet stored, written earlier in the same transaction.
    Pending(Arc<dyn BlobSource>),
    /// A stored blob, served by its active blob.
    Active(BlobHandle),
}

impl ClientBlob {
    pub fn is_pending(&self) -> bool {
        matches!(self, ClientBlob::Pending(_))
    }

    pub fn as_active(&self) -> Option<&BlobHandle> {
        match self {
            ClientBlob::Active(handle) => Some(handle),
            ClientBlob::Pending(_) => None,
        }
    }

    pub fn into_active(self) -> Option<BlobHandle> {
        match self {
            ClientBlob::Active(handle) => Some(handle),
            ClientBlob::Pending(_) => None,
        }
    }
}

/// A client connection to an active blob.
///
/// Cloning attaches another connection. The blob stays readable until the
/// last connection and every registry reader are dropped.
pub struct BlobHandle {
    lease: Lease,
}

impl BlobHandle {
    pub fn uuid(&self) -> Uuid {
        self.lease.shared.uuid
    }

    pub fn size(&self) -> u64 {
        self.lease.shared.handle.size()
    }

    pub fn content_type(&self) -> &str {
        &self.lease.shared.content_type
    }

    /// Row number of the stored bytes.
    pub fn blob_number(&self) -> i64 {
        self.lease.shared.handle.row_id()
    }

    /// Number of client connections currently attached.
    pub fn connection_count(&self) -> usize {
        self.lease.shared.receivers()
    }

    /// Stream `length` bytes starting at `offset` into `dest`, then close it.
    ///
    /// The range is clamped to the blob. The read keeps the blob alive until
    /// it finishes. Must be called from within a Tokio runtime.
    pub fn read_range<W>(
        &self,
        offset: u64,
        length: u64,
        dest: W,
        client: Option<Arc<dyn BlobReaderClient>>,
    ) -> JoinHandle<ReadOutcome>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let keep_alive = self.lease.shared.add_receiver();
        self.lease
            .shared
            .read(keep_alive, offset, length, dest, client)
    }

    /// Stream the whole blob into `dest`.
    pub fn read_all<W>(&self, dest: W, client: Option<Arc<dyn BlobReaderClient>>) -> JoinHandle<ReadOutcome>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.read_range(0, u64::MAX, dest, client)
    }

    pub fn clone_handle(&self) -> BlobHandle {
        self.clone()
    }

    /// A whole-blob getter, counted as another client connection.
    pub fn data_pipe_getter(&self) -> DataPipeGetter {
        DataPipeGetter {
            handle: self.clone(),
        }
    }
}

impl Clone for BlobHandle {
    fn clone(&self) -> Self {
        Self {
            lease: self.lease.shared.add_receiver(),
        }
    }
}

impl fmt::Debug for BlobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobHandle")
            .field("uuid", &self.uuid())
            .field("blob_number", &self.blob_number())
            .field("size", &self.size())
            .finish()
    }
}

/// Streams a whole active blob on request.
#[derive(Debug, Clone)]
pub struct DataPipeGetter {
    handle: BlobHandle,
}

impl DataPipeGetter {
    pub fn size(&self) -> u64 {
        self.handle.size()
    }

    /// Stream the whole blob into `dest`. The outcome carries the bytes sent.
    pub fn read<W>(&self, dest: W) -> JoinHandle<ReadOutcome>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.handle.read_all(dest, None)
    }
}

/// Ranged reader for subsystems that look blobs up in the [`BlobRegistry`].
///
/// Keeps the blob readable after every client connection is gone.
pub struct BlobReader {
    lease: Lease,
}

impl BlobReader {
    pub fn uuid(&self) -> Uuid {
        self.lease.shared.uuid
    }

    pub fn size(&self) -> u64 {
        self.lease.shared.handle.size()
    }

    pub fn read<W>(
        &self,
        offset: u64,
        length: u64,
        dest: W,
        client: Option<Arc<dyn BlobReaderClient>>,
    ) -> JoinHandle<ReadOutcome>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.lease.shared.state.lock().readers += 1;
        let keep_alive = Lease {
            shared: Arc::clone(&self.lease.shared),
            kind: LeaseKind::Reader,
        };
        self.lease
            .shared
            .read(keep_alive, offset, length, dest, client)
    }
}

impl fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobReader")
            .field("uuid", &self.uuid())
            .finish()
    }
}
