//! Drains a pending blob's pipe into its reserved row

use idbstore_core::ExternalObject;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::logging::prefix;
use crate::streaming_blob::StreamingBlobHandle;

/// One in-flight copy of a pending blob into storage.
///
/// Dropping the writer cancels the copy, and its completion callback never runs.
#[derive(Debug)]
pub(crate) struct BlobWriter {
    task: Option<JoinHandle<()>>,
}

impl BlobWriter {
    /// Start copying `object`'s bytes into `target`.
    ///
    /// `on_complete` receives `true` once the pipe ends cleanly, or `false`
    /// after a failed read or write. A failure is reported on a later turn of
    /// the runtime, never from inside a write.
    ///
    /// Returns `None` without ever calling `on_complete` if the object has no
    /// source, its pipe cannot be opened, or there is no runtime to run on.
    pub(crate) fn write_blob_into_database<F>(
        object: &ExternalObject,
        target: StreamingBlobHandle,
        config: &StoreConfig,
        on_complete: F,
    ) -> Option<Self>
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let source = object.source()?;
        let stream = match source.open_stream(config.effective_pipe_capacity()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "{} Could not open pipe for blob {}: {}",
                    prefix::BLOB,
                    target.row_id(),
                    e
                );
                return None;
            }
        };
        let chunk_size = config.effective_chunk_size();

        let task = runtime.spawn(async move {
            let success = drain(stream, target, chunk_size).await;
            if !success {
                tokio::task::yield_now().await;
            }
            on_complete(success);
        });
        Some(Self { task: Some(task) })
    }

    /// Let the task finish on its own. Used once it has reported.
    pub(crate) fn detach(mut self) {
        self.task.take();
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn drain(
    mut stream: idbstore_core::BlobStream,
    mut target: StreamingBlobHandle,
    chunk_size: usize,
) -> bool {
    let mut buf = vec![0u8; chunk_size];
    let mut offset = 0u64;

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(
                    "{} Pipe for blob {} failed after {} bytes: {}",
                    prefix::BLOB,
                    target.row_id(),
                    offset,
                    e
                );
                target.invalidate();
                return false;
            }
        };
        if let Err(e) = target.write(offset, &buf[..n]) {
            warn!(
                "{} Writing blob {} at {} failed: {}",
                prefix::BLOB,
                target.row_id(),
                offset,
                e
            );
            target.invalidate();
            return false;
        }
        offset += n as u64;
    }

    if offset != target.size() {
        debug!(
            "{} Blob {} pipe ended after {} of {} bytes",
            prefix::BLOB,
            target.row_id(),
            offset,
            target.size()
        );
    }
    true
}
