//! Copies a byte range of a stored blob into a client pipe

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::logging::prefix;
use crate::streaming_blob::StreamingBlobHandle;

/// How a blob read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    Success,
    /// The destination pipe was closed by its reader.
    Aborted,
    /// Reading the stored bytes failed.
    IoError,
}

/// Final result of a blob read and how many bytes reached the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub result: ReadResult,
    pub bytes_transferred: u64,
}

/// Observer of a ranged blob read.
pub trait BlobReaderClient: Send + Sync {
    /// Called once before any bytes move. `expected_content_size` is the
    /// requested length after clamping to the blob.
    fn on_calculated_size(&self, total_size: u64, expected_content_size: u64);

    fn on_complete(&self, result: ReadResult, data_length: u64);
}

/// Length actually readable from `offset` in a blob of `size` bytes.
pub(crate) fn clamp_length(size: u64, offset: u64, length: u64) -> u64 {
    size.saturating_sub(offset).min(length)
}

/// Stream `length` bytes from `offset` into `dest`, `chunk_size` bytes at a
/// time, then close `dest`. Waits for the destination to drain when it is full.
pub(crate) async fn pump<W>(
    handle: &StreamingBlobHandle,
    offset: u64,
    length: u64,
    dest: &mut W,
    chunk_size: usize,
) -> ReadOutcome
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut transferred = 0u64;

    while transferred < length {
        let n = (length - transferred).min(buf.len() as u64) as usize;
        let chunk = &mut buf[..n];
        if let Err(e) = handle.read(offset + transferred, chunk) {
            warn!(
                "{} Reading blob {} at {} failed: {}",
                prefix::BLOB,
                handle.row_id(),
                offset + transferred,
                e
            );
            return ReadOutcome {
                result: ReadResult::IoError,
                bytes_transferred: transferred,
            };
        }
        if dest.write_all(chunk).await.is_err() {
            debug!(
                "{} Reader of blob {} went away after {} bytes",
                prefix::BLOB,
                handle.row_id(),
                transferred
            );
            return ReadOutcome {
                result: ReadResult::Aborted,
                bytes_transferred: transferred,
            };
        }
        transferred += n as u64;
    }

    // Nothing is lost if the close fails, the bytes are already in the pipe
    let _ = dest.shutdown().await;
    ReadOutcome {
        result: ReadResult::Success,
        bytes_transferred: transferred,
    }
}

/// [`pump`] with the size and completion notifications.
pub(crate) async fn pump_with_client<W>(
    handle: &StreamingBlobHandle,
    offset: u64,
    length: u64,
    mut dest: W,
    chunk_size: usize,
    client: Option<Arc<dyn BlobReaderClient>>,
) -> ReadOutcome
where
    W: AsyncWrite + Unpin,
{
    let length = clamp_length(handle.size(), offset, length);
    if let Some(client) = &client {
        client.on_calculated_size(handle.size(), length);
    }
    let outcome = pump(handle, offset, length, &mut dest, chunk_size).await;
    drop(dest);
    if let Some(client) = client {
        client.on_complete(outcome.result, outcome.bytes_transferred);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_length() {
        assert_eq!(clamp_length(10, 0, u64::MAX), 10);
        assert_eq!(clamp_length(10, 4, 3), 3);
        assert_eq!(clamp_length(10, 8, 5), 2);
        assert_eq!(clamp_length(10, 10, 5), 0);
        assert_eq!(clamp_length(10, u64::MAX, 5), 0);
    }
}
