//! Byte sinks stage output is copied into.
//!
//! ```text
//!   child stdout ──▶ FanOutWriter ─┬─▶ CaptureBuffer   (this stage's own copy)
//!                                  └─▶ pipe write end  (next stage's stdin)
//!                                      or SharedSink   (combined stdout, last stage only)
//! ```

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::task::Context;
use std::task::Poll;

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::DuplexStream;

use crate::error::StageError;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Growable in-memory byte buffer that can be cloned across tasks.
///
/// Appends take a short `std::sync::Mutex` critical section, so the buffer
/// also implements `AsyncWrite` without ever yielding.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, chunk: &[u8]) {
        self.lock().extend_from_slice(chunk);
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AsyncWrite for CaptureBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.append(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A combined output stream written to by several stage tasks.
///
/// Each `write_all` holds the lock for one whole chunk, so chunks from
/// different stages never interleave mid-chunk.
#[derive(Clone)]
pub struct SharedSink {
    stream: &'static str,
    writer: Arc<tokio::sync::Mutex<BoxedWriter>>,
}

impl SharedSink {
    pub fn new(stream: &'static str, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            stream,
            writer: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
        }
    }

    /// Name used in error messages ("stdout", "stderr").
    pub fn stream(&self) -> &'static str {
        self.stream
    }

    pub async fn write_all(&self, chunk: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(chunk).await?;
        writer.flush().await
    }
}

impl fmt::Debug for SharedSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSink")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

/// One destination of a [`FanOutWriter`].
pub(crate) enum FanOutTarget {
    Capture(CaptureBuffer),
    /// Write end of the pipe feeding stage `neighbor`.
    Pipe {
        writer: DuplexStream,
        neighbor: usize,
    },
    Shared(SharedSink),
}

/// Duplicates every chunk to all of its targets, in order.
///
/// Owning a `FanOutWriter` means owning any pipe write end inside it;
/// dropping the writer closes that end and the neighbour reads EOF.
pub(crate) struct FanOutWriter {
    targets: Vec<FanOutTarget>,
}

impl FanOutWriter {
    pub(crate) fn new(targets: Vec<FanOutTarget>) -> Self {
        Self { targets }
    }

    pub(crate) async fn write_all(&mut self, chunk: &[u8]) -> Result<(), StageError> {
        for target in &mut self.targets {
            match target {
                FanOutTarget::Capture(buffer) => buffer.append(chunk),
                FanOutTarget::Pipe { writer, neighbor } => {
                    // A duplex half only fails once its reader is gone.
                    writer
                        .write_all(chunk)
                        .await
                        .map_err(|_| StageError::PipeClosed {
                            neighbor: *neighbor,
                        })?;
                }
                FanOutTarget::Shared(sink) => {
                    sink.write_all(chunk)
                        .await
                        .map_err(|err| StageError::OutputSink {
                            stream: sink.stream(),
                            source: Arc::new(err),
                        })?;
                }
            }
        }
        Ok(())
    }
}
