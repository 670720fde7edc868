// ABOUTME: Push-driven chunked byte input bridging the frame dispatcher to blocking worker tasks
// ABOUTME: Single-producer/single-consumer queue of payload chunks with EOF and error terminators

use bytes::Bytes;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::{Arc, Condvar, Mutex};
use thiserror::Error;
use tracing::trace;

/// Terminal conditions injected into a byte input.
///
/// These surface to the consumer as the error of a blocking read once the
/// queued chunks are drained (EOF is represented separately and reads as
/// end-of-stream).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InputError {
    /// The peer aborted the request this payload belongs to
    #[error("request aborted by peer")]
    Aborted,

    /// The peer abandoned an in-progress exception reply
    #[error("reply exception aborted by peer")]
    ReplyAborted,

    /// The peer terminated the stream with an error
    #[error("stream terminated by peer")]
    StreamFailed,

    /// The connection was torn down with the payload still in flight
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<InputError> for io::Error {
    fn from(err: InputError) -> io::Error {
        let kind = match err {
            InputError::Aborted | InputError::ReplyAborted | InputError::StreamFailed => {
                io::ErrorKind::ConnectionAborted
            }
            InputError::ConnectionClosed => io::ErrorKind::ConnectionReset,
        };
        io::Error::new(kind, err)
    }
}

enum Terminator {
    Eof,
    Failed(InputError),
}

struct Inner {
    queue: VecDeque<Bytes>,
    terminator: Option<Terminator>,
}

/// A push-based lazy byte sequence for one in-flight multi-frame payload.
///
/// The dispatcher pushes decoded payload chunks (and finally EOF or an
/// error); a worker task pulls bytes through a [`ChunkReader`], blocking
/// until data or a terminator arrives. Chunks pushed before the consumer
/// attaches simply queue. When an acknowledgement callback is installed it
/// fires once per fully drained chunk, after the internal lock is released.
pub struct ChunkInput {
    inner: Mutex<Inner>,
    available: Condvar,
    on_chunk_drained: Option<Box<dyn Fn() + Send + Sync>>,
}

impl ChunkInput {
    pub fn new() -> Arc<ChunkInput> {
        Arc::new(ChunkInput {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                terminator: None,
            }),
            available: Condvar::new(),
            on_chunk_drained: None,
        })
    }

    /// Creates an input whose consumer emits one acknowledgement per fully
    /// drained chunk, giving the peer flow-control feedback.
    pub fn with_ack(on_chunk_drained: impl Fn() + Send + Sync + 'static) -> Arc<ChunkInput> {
        Arc::new(ChunkInput {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                terminator: None,
            }),
            available: Condvar::new(),
            on_chunk_drained: Some(Box::new(on_chunk_drained)),
        })
    }

    /// Appends a payload chunk. Empty chunks are ignored (a zero-length read
    /// would look like end-of-stream to the consumer); chunks arriving after
    /// a terminator are dropped.
    pub fn push(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.terminator.is_some() {
            trace!(len = chunk.len(), "dropping chunk pushed after terminator");
            return;
        }
        inner.queue.push_back(chunk);
        drop(inner);
        self.available.notify_one();
    }

    /// Marks the end of the payload. Reads return end-of-stream once the
    /// queue is drained.
    pub fn push_eof(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminator.is_none() {
            inner.terminator = Some(Terminator::Eof);
        }
        drop(inner);
        self.available.notify_all();
    }

    /// Terminates the payload with an error. Chunks already queued are still
    /// delivered; once drained, any pending or future read fails with `error`.
    pub fn push_exception(&self, error: InputError) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminator.is_none() {
            inner.terminator = Some(Terminator::Failed(error));
        }
        drop(inner);
        self.available.notify_all();
    }

    /// Creates the consumer handle. The input is single-consumer; the reader
    /// is handed to exactly one worker task.
    pub fn reader(self: &Arc<Self>) -> ChunkReader {
        ChunkReader {
            input: Arc::clone(self),
        }
    }
}

/// Blocking consumer side of a [`ChunkInput`], usable anywhere an
/// [`std::io::Read`] is expected.
pub struct ChunkReader {
    input: Arc<ChunkInput>,
}

impl Read for ChunkReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut inner = self.input.inner.lock().unwrap();
        loop {
            if !inner.queue.is_empty() {
                let mut copied = 0;
                let mut drained = 0usize;
                while copied < out.len() {
                    let Some(front) = inner.queue.front_mut() else {
                        break;
                    };
                    let n = front.len().min(out.len() - copied);
                    out[copied..copied + n].copy_from_slice(&front[..n]);
                    let _ = front.split_to(n);
                    copied += n;
                    if front.is_empty() {
                        inner.queue.pop_front();
                        drained += 1;
                    }
                }
                drop(inner);
                if let Some(ack) = &self.input.on_chunk_drained {
                    for _ in 0..drained {
                        ack();
                    }
                }
                return Ok(copied);
            }

            match &inner.terminator {
                Some(Terminator::Eof) => return Ok(0),
                Some(Terminator::Failed(err)) => return Err(err.clone().into()),
                None => inner = self.input.available.wait(inner).unwrap(),
            }
        }
    }
}
