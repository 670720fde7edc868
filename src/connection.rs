// ABOUTME: Provides TCP framing and runtime glue binding one socket to one protocol engine
// ABOUTME: Implements frame-based I/O with buffering plus the transport and executor seams over tokio

use crate::codec::{CodecError, LENGTH_PREFIX_SIZE};
use crate::engine::traits::{Executor, ServiceRegistry, Transport};
use crate::engine::Engine;
use crate::frame::Frame;
use crate::marshal::Marshaller;
use crate::pool::VecPool;
use bytes::{Buf, Bytes, BytesMut};
use std::io::{self, Cursor};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Reads length-prefixed frames from the socket's read half.
///
/// The function waits until a complete frame is buffered, strips the 4-byte
/// length prefix, and hands the body to the caller. Data beyond the frame
/// stays buffered for the next call.
pub struct FrameReader {
    stream: OwnedReadHalf,

    // The buffer for reading frames.
    buffer: BytesMut,
}

impl FrameReader {
    pub fn new(stream: OwnedReadHalf) -> FrameReader {
        FrameReader {
            stream,
            // A 4KB read buffer is plenty for control frames; payload-heavy
            // links will want to tune this.
            buffer: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Reads a single frame body from the underlying stream.
    ///
    /// Returns `None` when the peer closed the connection on a frame
    /// boundary. A mid-frame close or an invalid length prefix is an error.
    pub async fn read_frame(&mut self) -> crate::Result<Option<Bytes>> {
        loop {
            if let Some(body) = self.parse_frame()? {
                return Ok(Some(body));
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err("connection reset by peer".into())
                };
            }
        }
    }

    fn parse_frame(&mut self) -> crate::Result<Option<Bytes>> {
        let mut buf = Cursor::new(&self.buffer[..]);

        match Frame::check(&mut buf) {
            Ok(body_len) => {
                self.buffer.advance(LENGTH_PREFIX_SIZE);
                Ok(Some(self.buffer.split_to(body_len).freeze()))
            }
            // Not an error: more socket reads will complete the frame.
            Err(CodecError::Incomplete) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

enum WriterOp {
    Frame { frame: Bytes, flush: bool },
    Shutdown,
}

/// [`Transport`] implementation bridging the synchronous engine to the
/// connection's writer task.
///
/// `send_blocking` back-patches the frame's length placeholder and enqueues
/// the finished frame; the writer task owns the socket's write half.
pub struct FramedTransport {
    ops: mpsc::UnboundedSender<WriterOp>,
}

impl Transport for FramedTransport {
    fn send_blocking(&self, buf: &mut BytesMut, flush: bool) -> io::Result<()> {
        let body_len = buf.len() - LENGTH_PREFIX_SIZE;
        buf[..LENGTH_PREFIX_SIZE].copy_from_slice(&(body_len as u32).to_be_bytes());

        // Copy out of the pooled buffer so the caller can recycle it.
        let frame = Bytes::copy_from_slice(&buf[..]);
        self.ops
            .send(WriterOp::Frame { frame, flush })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer task gone"))
    }

    fn close(&self) {
        let _ = self.ops.send(WriterOp::Shutdown);
    }
}

async fn run_writer(mut ops: mpsc::UnboundedReceiver<WriterOp>, stream: OwnedWriteHalf) {
    let mut stream = BufWriter::new(stream);
    while let Some(op) = ops.recv().await {
        match op {
            WriterOp::Frame { frame, flush } => {
                if stream.write_all(&frame).await.is_err() {
                    break;
                }
                if flush && stream.flush().await.is_err() {
                    break;
                }
            }
            WriterOp::Shutdown => break,
        }
    }
    let _ = stream.shutdown().await;
    debug!("writer task finished");
}

/// [`Executor`] dispatching decoder tasks onto the tokio blocking pool.
/// Worker tasks block on byte-input reads, so they must stay off the async
/// worker threads.
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    /// Captures the current runtime. Panics outside a runtime context, like
    /// any `Handle::current` caller.
    pub fn new() -> TokioExecutor {
        TokioExecutor {
            handle: Handle::current(),
        }
    }
}

impl Default for TokioExecutor {
    fn default() -> TokioExecutor {
        TokioExecutor::new()
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        self.handle.spawn_blocking(task);
    }
}

/// One live connection: an engine wired to a socket.
///
/// `establish` splits the socket, starts the writer task, and builds the
/// engine over a framed transport, a buffer pool, and the tokio executor.
/// `run` is the transport loop: one frame in, one dispatch, repeat; the
/// engine is torn down when the stream ends.
pub struct Session {
    engine: Arc<Engine>,
    reader: FrameReader,
    writer: JoinHandle<()>,
}

impl Session {
    pub fn establish(
        socket: TcpStream,
        services: Arc<dyn ServiceRegistry>,
        marshaller: Arc<dyn Marshaller>,
    ) -> Session {
        let (read_half, write_half) = socket.into_split();
        let (ops, ops_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(ops_rx, write_half));

        let engine = Engine::new(
            Arc::new(FramedTransport { ops }),
            Arc::new(VecPool::default()),
            Arc::new(TokioExecutor::new()),
            services,
            marshaller,
        );

        Session {
            engine,
            reader: FrameReader::new(read_half),
            writer,
        }
    }

    /// The engine, for local actions (opening clients, submitting requests).
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Drives the connection until the peer disconnects or a protocol error
    /// kills the stream, then cancels all in-flight entities.
    pub async fn run(mut self) -> crate::Result<()> {
        let result = loop {
            match self.reader.read_frame().await {
                Ok(Some(body)) => self.engine.dispatch(body),
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        self.engine.shutdown();
        self.engine.close();
        let _ = self.writer.await;
        result
    }
}
