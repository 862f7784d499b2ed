//! Size-capped streaming of upstream bodies
//!
//! The upstream body is read through a `take(max_size + 1)` reader into a
//! pooled 32 KiB buffer and re-emitted as the client response body, cut at
//! the ceiling. Nothing is buffered beyond one chunk, and the extra byte
//! tells a truncated body apart from one that is exactly `max_size` long.

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use axum::body::Body;
use bytes::Bytes;
use futures_util::{stream, TryStreamExt};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::metrics::ProxyMetrics;
use crate::stats::MetricsCollector;

/// Size of each copy buffer
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Idle buffers kept for reuse
const MAX_POOLED: usize = 256;

/// Shared pool of fixed-size copy buffers
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    size: usize,
    max_pooled: usize,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(BUFFER_SIZE, MAX_POOLED)
    }
}

impl BufferPool {
    pub fn new(size: usize, max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            size,
            max_pooled,
        }
    }

    /// Take a buffer, allocating when the pool is empty
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.size]);
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    fn put(&self, mut buf: Vec<u8>) {
        if buf.len() != self.size {
            buf.resize(self.size, 0);
        }
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }

    /// Buffers currently waiting in the pool
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }
}

/// A buffer on loan from a [`BufferPool`], returned on drop
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

/// Per-response accounting for a streamed transfer
#[derive(Clone)]
pub struct TransferContext {
    /// Byte ceiling, 0 for unlimited
    pub max_size: u64,
    /// Shared request deadline
    pub deadline: Instant,
    pub metrics: Arc<ProxyMetrics>,
    pub collector: Option<Arc<dyn MetricsCollector>>,
    /// Target url, for logging
    pub url: String,
}

struct Transfer<R> {
    reader: R,
    buf: PooledBuffer,
    written: u64,
    truncated: bool,
    done: bool,
    ctx: TransferContext,
}

impl<R: AsyncRead + Unpin> Transfer<R> {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if self.truncated {
            return Ok(None);
        }
        let read = tokio::time::timeout_at(self.ctx.deadline, self.reader.read(&mut self.buf));
        let n = match read.await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream body read timed out",
                ))
            }
        };
        if n == 0 {
            return Ok(None);
        }
        let room = self.ctx.max_size.saturating_sub(self.written);
        let n = if self.ctx.max_size > 0 && n as u64 > room {
            self.truncated = true;
            room as usize
        } else {
            n
        };
        if n == 0 {
            return Ok(None);
        }
        self.written += n as u64;
        Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
    }

    fn finish(&mut self) {
        self.done = true;
        if self.truncated {
            debug!(
                "response to client truncated at {} bytes: {}",
                self.written, self.ctx.url
            );
            self.ctx.metrics.response_truncated();
        }
        self.ctx.metrics.bytes_sent(self.written);
        if let Some(collector) = &self.ctx.collector {
            collector.add_bytes(self.written);
        }
    }

    fn fail(&mut self, err: &io::Error) {
        self.done = true;
        if is_quiet_error(err) {
            debug!("error streaming {}: {}", self.ctx.url, err);
        } else {
            warn!("error streaming {}: {}", self.ctx.url, err);
        }
        self.ctx.metrics.response_failed();
    }
}

impl<R> Drop for Transfer<R> {
    fn drop(&mut self) {
        if !self.done {
            debug!(
                "client aborted request (late) after {} bytes: {}",
                self.written, self.ctx.url
            );
        }
    }
}

/// Errors that are routine for a proxy and only worth a debug line
fn is_quiet_error(err: &io::Error) -> bool {
    if let Some(hyper_err) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<hyper::Error>())
    {
        return hyper_err.is_incomplete_message() || hyper_err.is_closed();
    }
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
    )
}

/// Stream `reader` to the client, capped at `ctx.max_size` bytes
pub fn limited_reader_body<R>(reader: R, pool: &Arc<BufferPool>, ctx: TransferContext) -> Body
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let limit = if ctx.max_size == 0 {
        u64::MAX
    } else {
        ctx.max_size.saturating_add(1)
    };
    let transfer = Transfer {
        reader: reader.take(limit),
        buf: pool.get(),
        written: 0,
        truncated: false,
        done: false,
        ctx,
    };

    let chunks = stream::unfold(transfer, |mut t| async move {
        if t.done {
            return None;
        }
        match t.next_chunk().await {
            Ok(Some(chunk)) => Some((Ok(chunk), t)),
            Ok(None) => {
                t.finish();
                None
            }
            Err(e) => {
                t.fail(&e);
                Some((Err(e), t))
            }
        }
    });
    Body::from_stream(chunks)
}

/// Stream an upstream response body to the client
pub fn limited_body(upstream: Incoming, pool: &Arc<BufferPool>, ctx: TransferContext) -> Body {
    let data = upstream.into_data_stream().map_err(io::Error::other);
    let reader = StreamReader::new(Box::pin(data));
    limited_reader_body(reader, pool, ctx)
}
