//! Record values and the external objects (blobs and files) they carry

use std::fmt;
use std::io;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWriteExt};

/// A readable byte pipe.
pub type BlobStream = Box<dyn AsyncRead + Send + Unpin>;

/// Client-side bytes of an external object that has not been stored yet.
pub trait BlobSource: fmt::Debug + Send + Sync {
    /// Open a new pipe carrying the full contents.
    ///
    /// `capacity` bounds how many bytes may sit in the pipe unread.
    fn open_stream(&self, capacity: usize) -> io::Result<BlobStream>;
}

/// A [`BlobSource`] over bytes already in memory.
///
/// Each stream is fed by a task on the current Tokio runtime, so opening a
/// stream outside a runtime fails.
#[derive(Clone)]
pub struct BytesBlobSource {
    bytes: Arc<[u8]>,
}

impl BytesBlobSource {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Arc::from(bytes.into()),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for BytesBlobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytesBlobSource")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl BlobSource for BytesBlobSource {
    fn open_stream(&self, capacity: usize) -> io::Result<BlobStream> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let (mut writer, reader) = tokio::io::duplex(capacity.max(1));
        let bytes = Arc::clone(&self.bytes);
        runtime.spawn(async move {
            // A closed reader just means nobody wants the rest
            if writer.write_all(&bytes).await.is_ok() {
                let _ = writer.shutdown().await;
            }
        });
        Ok(Box::new(reader))
    }
}

/// Blob or file, as recorded in the `object_type` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalObjectKind {
    Blob,
    File {
        name: String,
        last_modified: DateTime<Utc>,
    },
}

impl ExternalObjectKind {
    pub const BLOB_TYPE: i64 = 0;
    pub const FILE_TYPE: i64 = 1;

    pub fn object_type(&self) -> i64 {
        match self {
            ExternalObjectKind::Blob => Self::BLOB_TYPE,
            ExternalObjectKind::File { .. } => Self::FILE_TYPE,
        }
    }
}

/// A blob or file attached to a value.
///
/// Objects coming from a client carry a [`BlobSource`]. Objects read back
/// from storage carry the row number of their stored bytes instead.
#[derive(Debug, Clone)]
pub struct ExternalObject {
    kind: ExternalObjectKind,
    mime_type: String,
    size: u64,
    blob_number: Option<i64>,
    source: Option<Arc<dyn BlobSource>>,
}

impl ExternalObject {
    pub fn blob(source: Arc<dyn BlobSource>, mime_type: impl Into<String>, size: u64) -> Self {
        Self {
            kind: ExternalObjectKind::Blob,
            mime_type: mime_type.into(),
            size,
            blob_number: None,
            source: Some(source),
        }
    }

    pub fn file(
        source: Arc<dyn BlobSource>,
        mime_type: impl Into<String>,
        size: u64,
        name: impl Into<String>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: ExternalObjectKind::File {
                name: name.into(),
                last_modified,
            },
            mime_type: mime_type.into(),
            size,
            blob_number: None,
            source: Some(source),
        }
    }

    /// An object whose bytes are already stored under `blob_number`.
    pub fn stored(
        kind: ExternalObjectKind,
        mime_type: impl Into<String>,
        size: u64,
        blob_number: i64,
    ) -> Self {
        Self {
            kind,
            mime_type: mime_type.into(),
            size,
            blob_number: Some(blob_number),
            source: None,
        }
    }

    pub fn kind(&self) -> &ExternalObjectKind {
        &self.kind
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn blob_number(&self) -> Option<i64> {
        self.blob_number
    }

    pub fn set_blob_number(&mut self, blob_number: i64) {
        self.blob_number = Some(blob_number);
    }

    pub fn source(&self) -> Option<&Arc<dyn BlobSource>> {
        self.source.as_ref()
    }

    /// Whether the bytes still live with the client.
    pub fn is_pending(&self) -> bool {
        self.source.is_some()
    }
}

/// An opaque serialized value plus its external objects, in reference order.
#[derive(Debug, Clone, Default)]
pub struct Value {
    pub bits: Vec<u8>,
    pub external_objects: Vec<ExternalObject>,
}

impl Value {
    pub fn new(bits: impl Into<Vec<u8>>) -> Self {
        Self {
            bits: bits.into(),
            external_objects: Vec::new(),
        }
    }

    pub fn with_external_objects(
        bits: impl Into<Vec<u8>>,
        external_objects: Vec<ExternalObject>,
    ) -> Self {
        Self {
            bits: bits.into(),
            external_objects,
        }
    }
}
