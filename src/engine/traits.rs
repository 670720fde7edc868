// ABOUTME: Collaborator seams of the protocol engine: transport, pool, executor, services, handlers
// ABOUTME: The engine owns routing and state only; every policy decision lives behind one of these traits

use crate::engine::error::ServiceOpenError;
use crate::input::{ChunkInput, ChunkReader, InputError};
use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::Arc;

/// The byte-stream transport below the engine.
///
/// `send_blocking` receives a frame whose first four bytes are a length
/// placeholder; the transport fills them with the body length before
/// transmission. The engine never retries a failed send, the transport owns
/// teardown.
pub trait Transport: Send + Sync {
    fn send_blocking(&self, buf: &mut BytesMut, flush: bool) -> io::Result<()>;

    fn close(&self);
}

/// Pool of reusable send buffers. Every buffer the engine allocates is
/// returned with `free` on all exit paths.
pub trait BufferPool: Send + Sync {
    fn allocate(&self) -> BytesMut;

    fn free(&self, buf: BytesMut);
}

/// Task executor for decoder workers. Tasks may block on byte-input reads,
/// so implementations must not run them on the dispatch thread.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Local service lookup performed for each inbound `SERVICE_REQUEST`.
pub trait ServiceRegistry: Send + Sync {
    /// Returns the handler for a service, or `None` if nothing is registered
    /// under the given type and group.
    fn open_service(&self, service_type: &str, group_name: &str) -> Option<Arc<dyn ClientHandler>>;
}

/// The local half of an inbound client: receives the requests the peer sends
/// through the client it opened.
pub trait ClientHandler: Send + Sync {
    /// Called on a worker task for each inbound request. The payload reader
    /// blocks until the dispatcher pushes more frames; the handler unmarshals
    /// and eventually replies through the engine's reply surface.
    fn handle_request(&self, rid: u32, payload: ChunkReader);

    /// The peer closed the channel, or the connection went down.
    fn close(&self);
}

/// Result listener for a locally opened client (the service-open result slot).
pub trait ClientListener: Send + Sync {
    /// The peer accepted the open; the client is established.
    fn on_opened(&self, id: u32);

    /// The open was rejected or the connection died first.
    fn on_failed(&self, id: u32, error: ServiceOpenError);

    /// An established client was closed, locally or by the peer.
    fn on_closed(&self, id: u32);
}

/// Receiver for the outcome of one outbound request.
pub trait ReplyHandler: Send + Sync {
    /// Called on a worker task with the reply payload once its first frame
    /// arrives. Reading past the decoded object's end blocks until further
    /// frames are pushed.
    fn handle_reply(&self, payload: ChunkReader);

    /// Like `handle_reply`, for an exception reply.
    fn handle_exception(&self, payload: ChunkReader);

    /// The request will never complete: peer abort, local abort, or
    /// connection teardown.
    fn handle_cancelled(&self, reason: InputError);
}

/// Push sink for one inbound stream: chunks in order, then EOF or an error.
pub trait StreamSink: Send + Sync {
    fn push(&self, chunk: Bytes);

    fn push_eof(&self);

    fn push_exception(&self, error: InputError);
}

impl StreamSink for ChunkInput {
    fn push(&self, chunk: Bytes) {
        ChunkInput::push(self, chunk);
    }

    fn push_eof(&self) {
        ChunkInput::push_eof(self);
    }

    fn push_exception(&self, error: InputError) {
        ChunkInput::push_exception(self, error);
    }
}

/// [`Executor`] that runs each task on its own thread.
///
/// Suits tests and low-volume links; busier deployments hand the engine a
/// pooled executor such as the tokio-backed one in the connection layer.
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) {
        std::thread::spawn(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_input_is_a_stream_sink() {
        let input = ChunkInput::new();
        let sink: Arc<dyn StreamSink> = input.clone();

        sink.push(Bytes::from_static(b"AB"));
        sink.push_eof();

        let mut reader = input.reader();
        let mut data = Vec::new();
        std::io::Read::read_to_end(&mut reader, &mut data).unwrap();
        assert_eq!(data, b"AB");
    }

    #[test]
    fn thread_executor_runs_task() {
        let (tx, rx) = std::sync::mpsc::channel();
        ThreadExecutor.execute(Box::new(move || {
            tx.send(42u32).unwrap();
        }));

        assert_eq!(rx.recv().unwrap(), 42);
    }
}
