//! Byte stream relays between live process streams and `ByteQueue`s.

use std::io::ErrorKind;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::core::errors::{PipeError, Result};
use crate::pipeline::buffer::{ByteCursor, ByteQueue};

/// Default maximum bytes read per relay step
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Read `source` in chunks of at most `chunk_size` bytes and append them to
/// `sink` until EOF. With a `tag`, each chunk is prefixed by `[tag] ` so
/// stages sharing one sink can be told apart. Returns the bytes read.
///
/// Stops early once the sink's reader detaches; `source` is dropped on
/// return, so a process still writing to it gets a broken pipe.
pub async fn drain<R>(
    mut source: R,
    sink: &ByteQueue,
    chunk_size: usize,
    tag: Option<&str>,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let prefix = tag.map(|t| format!("[{}] ", t));
    let mut total = 0u64;

    loop {
        let read = tokio::select! {
            biased;
            _ = sink.reader_detached() => {
                debug!(read = total, "reader detached, closing process stream");
                break;
            }
            read = source.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(PipeError::io("read process stream", e)),
        };
        total += n as u64;

        let chunk = match &prefix {
            Some(prefix) => {
                let mut tagged = BytesMut::with_capacity(prefix.len() + n);
                tagged.extend_from_slice(prefix.as_bytes());
                tagged.extend_from_slice(&buf[..n]);
                tagged.freeze()
            }
            None => Bytes::copy_from_slice(&buf[..n]),
        };
        sink.push(chunk);
    }

    Ok(total)
}

/// Write every chunk from `source` into `sink`, then close `sink`.
///
/// Ends once the source queue is closed and exhausted. A broken pipe means
/// the reading process has exited; the remaining input is discarded.
pub async fn feed<W>(mut sink: W, mut source: ByteCursor) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;

    while let Some(chunk) = source.next().await {
        match sink.write_all(&chunk).await {
            Ok(()) => total += chunk.len() as u64,
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                debug!(written = total, "stdin reader went away, dropping remaining input");
                return Ok(total);
            }
            Err(e) => return Err(PipeError::io("write process stdin", e)),
        }
    }

    match sink.shutdown().await {
        Ok(()) => Ok(total),
        Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(total),
        Err(e) => Err(PipeError::io("close process stdin", e)),
    }
}
