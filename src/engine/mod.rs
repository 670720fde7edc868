// ABOUTME: The per-connection protocol engine: frame dispatch, entity state, and frame origination
// ABOUTME: One instance per live connection; the transport invokes dispatch once per decoded frame

pub mod entities;
pub mod error;
mod registry;
pub mod traits;

use crate::codec::{encode_cstring, Command, LENGTH_PREFIX_SIZE, MSG_FLAG_FIRST};
use crate::frame::Frame;
use crate::input::{ChunkInput, InputError};
use crate::marshal::{Marshaller, OptionMap};
use bytes::{BufMut, Bytes};
use entities::{
    InboundClient, InboundRequest, InboundStream, OutboundClient, OutboundRequest, OutboundStream,
};
use error::{EngineError, ServiceOpenError};
use registry::Registry;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};
use traits::{BufferPool, ClientListener, Executor, ReplyHandler, ServiceRegistry, StreamSink, Transport};

/// Snapshot of registry sizes, for monitoring and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub outbound_clients: usize,
    pub inbound_clients: usize,
    pub outbound_requests: usize,
    pub inbound_requests: usize,
    pub inbound_streams: usize,
    pub outbound_streams: usize,
}

/// Inbound message demultiplexer and protocol state engine for one
/// connection.
///
/// The transport thread calls [`Engine::dispatch`] once per decoded frame;
/// the call routes the frame to the per-id entity, drives its state machine,
/// and returns. Worker tasks handed to the executor bridge the multi-frame
/// payloads to the registered handlers through blocking byte inputs.
///
/// Lock order is registry before entity, and an entity lock is never held
/// while a registry lock is taken. Byte-input pushes happen outside every
/// entity lock; the inputs are thread-safe on their own.
pub struct Engine {
    transport: Arc<dyn Transport>,
    pool: Arc<dyn BufferPool>,
    executor: Arc<dyn Executor>,
    services: Arc<dyn ServiceRegistry>,
    marshaller: Arc<dyn Marshaller>,
    pub(crate) outbound_clients: Registry<OutboundClient>,
    // Shared with inbound-request decoder tasks, which resolve their target
    // client at run time
    pub(crate) inbound_clients: Arc<Registry<InboundClient>>,
    pub(crate) outbound_requests: Registry<OutboundRequest>,
    pub(crate) inbound_requests: Registry<InboundRequest>,
    pub(crate) inbound_streams: Registry<InboundStream>,
    pub(crate) outbound_streams: Registry<OutboundStream>,
    last_seen: Mutex<Instant>,
}

impl Engine {
    pub fn new(
        transport: Arc<dyn Transport>,
        pool: Arc<dyn BufferPool>,
        executor: Arc<dyn Executor>,
        services: Arc<dyn ServiceRegistry>,
        marshaller: Arc<dyn Marshaller>,
    ) -> Arc<Engine> {
        Arc::new(Engine {
            transport,
            pool,
            executor,
            services,
            marshaller,
            outbound_clients: Registry::new(),
            inbound_clients: Arc::new(Registry::new()),
            outbound_requests: Registry::new(),
            inbound_requests: Registry::new(),
            inbound_streams: Registry::new(),
            outbound_streams: Registry::new(),
            last_seen: Mutex::new(Instant::now()),
        })
    }

    /// Processes one decoded frame body (length prefix already stripped).
    ///
    /// Never returns an error to the caller: recoverable conditions are
    /// logged and dropped, protocol violations close the connection.
    pub fn dispatch(&self, body: Bytes) {
        let frame = match Frame::parse(&body) {
            Ok(frame) => frame,
            Err(err) => {
                error!(%err, "unparseable frame, closing connection");
                self.transport.close();
                return;
            }
        };
        trace!(%frame, "dispatching");

        match frame {
            Frame::Alive => self.on_alive(),
            Frame::ServiceRequest {
                id,
                service_type,
                group_name,
                options,
            } => self.on_service_request(id, &service_type, &group_name, &options),
            Frame::ServiceNotFound { id } => self.on_service_refused(id, ServiceOpenError::NotFound),
            Frame::ServiceError { id } => self.on_service_refused(id, ServiceOpenError::Failed),
            Frame::ServiceClientOpened { id } => self.on_service_client_opened(id),
            Frame::ChannelClose { id } => self.on_channel_close(id),
            Frame::ClientAsyncClose { id } => self.on_client_async_close(id),
            Frame::Request {
                rid,
                client_id,
                payload,
                ..
            } => self.on_request(rid, client_id, payload),
            Frame::RequestAbort { rid } => self.on_request_abort(rid),
            Frame::RequestAckChunk { rid } => self.on_request_ack(rid),
            Frame::Reply { rid, flags, payload } => self.on_reply(rid, flags, payload, false),
            Frame::ReplyException { rid, flags, payload } => {
                self.on_reply(rid, flags, payload, true)
            }
            Frame::ReplyAckChunk { rid } => self.on_reply_ack(rid),
            Frame::ReplyExceptionAbort { rid } => self.on_reply_exception_abort(rid),
            Frame::StreamData { sid, payload } => self.on_stream_data(sid, payload),
            Frame::StreamClose { sid } => self.on_stream_close(sid),
            Frame::StreamException { sid } => self.on_stream_exception(sid),
            Frame::StreamAck { sid } => self.on_stream_ack(sid),
            Frame::StreamAsyncStart { sid } => self.on_stream_async_start(sid),
            Frame::StreamAsyncClose { sid } => self.on_stream_async_close(sid),
            Frame::StreamAsyncException { sid } => self.on_stream_async_exception(sid),
        }
    }

    fn on_alive(&self) {
        trace!("keepalive from peer");
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    /// Service-open negotiation: the one exchange the engine answers itself.
    /// Exactly one reply frame goes out per request, composed into a pooled
    /// buffer that is freed on every path.
    fn on_service_request(&self, id: u32, service_type: &str, group_name: &str, options: &Bytes) {
        let mut cursor = Cursor::new(options.as_ref());
        if let Err(err) = self.marshaller.read_option_map(&mut cursor) {
            warn!(id, %err, "undecodable service-open options");
            self.send(&Frame::ServiceError { id });
            return;
        }

        let Some(handler) = self.services.open_service(service_type, group_name) else {
            debug!(id, service_type, group_name, "service not found");
            self.send(&Frame::ServiceNotFound { id });
            return;
        };

        let client = InboundClient::new(id, handler);
        if !self.inbound_clients.insert(id, client) {
            warn!(id, "service request for an id already in use");
            self.send(&Frame::ServiceError { id });
            return;
        }
        debug!(id, service_type, group_name, "inbound client opened");
        self.send(&Frame::ServiceClientOpened { id });
    }

    fn on_service_refused(&self, id: u32, reason: ServiceOpenError) {
        let Some(client) = self.outbound_clients.remove(id) else {
            trace!(id, "service refusal for unknown client id");
            return;
        };
        debug!(id, %reason, "service open refused by peer");
        client.fail(reason);
    }

    fn on_service_client_opened(&self, id: u32) {
        let Some(client) = self.outbound_clients.get(id) else {
            trace!(id, "service-client-opened for unknown client id");
            return;
        };
        if client.establish() {
            debug!(id, "outbound client established");
        }
    }

    fn on_channel_close(&self, id: u32) {
        let Some(client) = self.inbound_clients.remove(id) else {
            trace!(id, "channel close for unknown client id");
            return;
        };
        debug!(id, "inbound client closed by peer");
        client.handler().close();
    }

    fn on_client_async_close(&self, id: u32) {
        let Some(client) = self.outbound_clients.remove(id) else {
            trace!(id, "async close for unknown client id");
            return;
        };
        debug!(id, "outbound client closed by peer");
        client.close();
    }

    /// A frame bearing `MSG_FLAG_FIRST` (the parser surfaces that as a
    /// present client id) is the sole creation trigger for an inbound
    /// request; everything else routes to an existing entity or is dropped.
    fn on_request(&self, rid: u32, client_id: Option<u32>, payload: Bytes) {
        let request = match client_id {
            Some(cid) => {
                let input = ChunkInput::with_ack(self.chunk_ack(Frame::RequestAckChunk { rid }));
                let request = InboundRequest::new(rid, cid, input);
                if !self.inbound_requests.insert(rid, Arc::clone(&request)) {
                    warn!(rid, "duplicate first request frame, dropping");
                    return;
                }
                request
            }
            None => match self.inbound_requests.get(rid) {
                Some(request) => request,
                None => {
                    trace!(rid, "request frame for unknown request id");
                    return;
                }
            },
        };

        let input = request.input();
        request.submit_task_once(|| {
            let clients = Arc::clone(&self.inbound_clients);
            let request = Arc::clone(&request);
            self.executor.execute(Box::new(move || {
                let reader = request.input().reader();
                match clients.get(request.client_id) {
                    Some(client) => client.handler().handle_request(request.rid, reader),
                    None => {
                        warn!(
                            rid = request.rid,
                            cid = request.client_id,
                            "request for unknown inbound client"
                        );
                    }
                }
            }));
        });

        if !payload.is_empty() {
            input.push(payload);
        }
    }

    fn on_request_abort(&self, rid: u32) {
        let Some(request) = self.inbound_requests.remove(rid) else {
            trace!(rid, "abort for unknown request id");
            return;
        };
        debug!(rid, "request aborted by peer");
        request.cancel();
        request.input().push_exception(InputError::Aborted);
    }

    fn on_request_ack(&self, rid: u32) {
        match self.outbound_requests.get(rid) {
            Some(request) => {
                request.ack();
            }
            None => trace!(rid, "request ack for unknown request id"),
        }
    }

    /// Reply and exception-reply frames share one shape; the first frame
    /// decides which decoder task runs. The decoder task is submitted while
    /// the input slot (the entity lock) is held, so a racing local completion
    /// cannot slip between installation and submission.
    fn on_reply(&self, rid: u32, flags: u8, payload: Bytes, exception: bool) {
        let Some(request) = self.outbound_requests.get(rid) else {
            trace!(rid, "reply frame for unknown request id");
            return;
        };

        let input = {
            let mut slot = request.input_slot();
            if flags & MSG_FLAG_FIRST != 0 {
                if slot.is_some() {
                    warn!(rid, "duplicate first reply frame, dropping");
                    return;
                }
                let input = ChunkInput::with_ack(self.chunk_ack(Frame::ReplyAckChunk { rid }));
                *slot = Some(Arc::clone(&input));

                let handler = request.handler();
                let reader = input.reader();
                if exception {
                    self.executor
                        .execute(Box::new(move || handler.handle_exception(reader)));
                } else {
                    self.executor
                        .execute(Box::new(move || handler.handle_reply(reader)));
                }
                input
            } else {
                match &*slot {
                    Some(input) => Arc::clone(input),
                    None => {
                        trace!(rid, "reply continuation without a first frame");
                        return;
                    }
                }
            }
        };

        if !payload.is_empty() {
            input.push(payload);
        }
    }

    fn on_reply_ack(&self, rid: u32) {
        match self.inbound_requests.get(rid) {
            Some(request) => {
                request.ack();
            }
            None => trace!(rid, "reply ack for unknown request id"),
        }
    }

    fn on_reply_exception_abort(&self, rid: u32) {
        let Some(request) = self.outbound_requests.get(rid) else {
            trace!(rid, "reply-exception abort for unknown request id");
            return;
        };
        debug!(rid, "reply exception aborted by peer");
        if let Some(input) = request.input() {
            input.push_exception(InputError::ReplyAborted);
        }
        request.handler().handle_cancelled(InputError::ReplyAborted);
    }

    fn on_stream_data(&self, sid: u32, payload: Bytes) {
        match self.inbound_streams.get(sid) {
            Some(stream) => stream.sink().push(payload),
            None => trace!(sid, "stream data for unknown stream id"),
        }
    }

    fn on_stream_close(&self, sid: u32) {
        let Some(stream) = self.inbound_streams.remove(sid) else {
            trace!(sid, "stream close for unknown stream id");
            return;
        };
        debug!(sid, "inbound stream closed by peer");
        stream.sink().push_eof();
    }

    fn on_stream_exception(&self, sid: u32) {
        let Some(stream) = self.inbound_streams.remove(sid) else {
            trace!(sid, "stream exception for unknown stream id");
            return;
        };
        debug!(sid, "inbound stream failed by peer");
        stream.sink().push_exception(InputError::StreamFailed);
    }

    fn on_stream_ack(&self, sid: u32) {
        match self.outbound_streams.get(sid) {
            Some(stream) => {
                stream.ack();
            }
            None => trace!(sid, "stream ack for unknown stream id"),
        }
    }

    fn on_stream_async_start(&self, sid: u32) {
        match self.outbound_streams.get(sid) {
            Some(stream) => stream.mark_async_start(),
            None => trace!(sid, "stream async-start for unknown stream id"),
        }
    }

    fn on_stream_async_close(&self, sid: u32) {
        match self.outbound_streams.get(sid) {
            Some(stream) => stream.mark_async_close(),
            None => trace!(sid, "stream async-close for unknown stream id"),
        }
    }

    fn on_stream_async_exception(&self, sid: u32) {
        match self.outbound_streams.get(sid) {
            Some(stream) => stream.mark_async_exception(),
            None => trace!(sid, "stream async-exception for unknown stream id"),
        }
    }

    // ---- local actions and frame origination ----

    /// Registers a WAITING outbound client and sends `SERVICE_REQUEST`. The
    /// listener later receives exactly one of opened/failed.
    pub fn open_service_request(
        &self,
        id: u32,
        service_type: &str,
        group_name: &str,
        options: &OptionMap,
        listener: Arc<dyn ClientListener>,
    ) -> Result<(), EngineError> {
        let client = OutboundClient::new(id, service_type, group_name, listener);
        if !self.outbound_clients.insert(id, client) {
            return Err(EngineError::DuplicateId(id));
        }

        let mut buf = self.pool.allocate();
        buf.put_bytes(0, LENGTH_PREFIX_SIZE);
        buf.put_u8(Command::ServiceRequest as u8);
        buf.put_u32(id);
        encode_cstring(&mut buf, service_type);
        encode_cstring(&mut buf, group_name);
        self.marshaller.write_option_map(options, &mut buf);
        if let Err(err) = self.transport.send_blocking(&mut buf, true) {
            warn!(id, %err, "failed to send service request");
        }
        self.pool.free(buf);
        Ok(())
    }

    /// Locally closes an outbound client. An established client emits
    /// `CLIENT_ASYNC_CLOSE` to the peer.
    pub fn close_client(&self, id: u32) {
        let Some(client) = self.outbound_clients.remove(id) else {
            trace!(id, "local close for unknown client id");
            return;
        };
        if client.close() == Some(entities::ClientState::Established) {
            self.send(&Frame::ClientAsyncClose { id });
        }
    }

    /// Registers a locally submitted request awaiting reply frames.
    pub fn register_outbound_request(
        &self,
        rid: u32,
        handler: Arc<dyn ReplyHandler>,
    ) -> Result<Arc<OutboundRequest>, EngineError> {
        let request = OutboundRequest::new(rid, handler);
        if !self.outbound_requests.insert(rid, Arc::clone(&request)) {
            return Err(EngineError::DuplicateId(rid));
        }
        Ok(request)
    }

    /// Sends one request payload frame. The first frame names the target
    /// client and establishes the responder's byte input.
    pub fn send_request(&self, rid: u32, client_id: u32, first: bool, payload: &[u8]) {
        self.send(&Frame::Request {
            rid,
            flags: if first { MSG_FLAG_FIRST } else { 0 },
            client_id: first.then_some(client_id),
            payload: Bytes::copy_from_slice(payload),
        });
    }

    /// Locally aborts an outbound request: removes it, unblocks any decoder
    /// already reading the reply, and tells the peer.
    pub fn abort_request(&self, rid: u32) {
        let Some(request) = self.outbound_requests.remove(rid) else {
            trace!(rid, "local abort for unknown request id");
            return;
        };
        debug!(rid, "request aborted locally");
        if let Some(input) = request.input() {
            input.push_exception(InputError::Aborted);
        }
        request.handler().handle_cancelled(InputError::Aborted);
        self.send(&Frame::RequestAbort { rid });
    }

    /// The reply decoder finished; the last reply frame has been processed.
    pub fn complete_outbound_request(&self, rid: u32) {
        if self.outbound_requests.remove(rid).is_none() {
            trace!(rid, "completion for unknown request id");
        }
    }

    /// Sends one reply payload frame for an inbound request.
    pub fn send_reply(&self, rid: u32, first: bool, payload: &[u8]) {
        self.send(&Frame::Reply {
            rid,
            flags: if first { MSG_FLAG_FIRST } else { 0 },
            payload: Bytes::copy_from_slice(payload),
        });
    }

    /// Sends one exception-reply payload frame for an inbound request.
    pub fn send_reply_exception(&self, rid: u32, first: bool, payload: &[u8]) {
        self.send(&Frame::ReplyException {
            rid,
            flags: if first { MSG_FLAG_FIRST } else { 0 },
            payload: Bytes::copy_from_slice(payload),
        });
    }

    /// The local reply has been sent in full; retires the inbound request.
    pub fn complete_inbound_request(&self, rid: u32) {
        if self.inbound_requests.remove(rid).is_none() {
            trace!(rid, "completion for unknown request id");
        }
    }

    /// Registers the receiving half of a peer-initiated stream.
    pub fn open_inbound_stream(
        &self,
        sid: u32,
        sink: Arc<dyn StreamSink>,
    ) -> Result<(), EngineError> {
        let stream = InboundStream::new(sid, sink);
        if !self.inbound_streams.insert(sid, stream) {
            return Err(EngineError::DuplicateId(sid));
        }
        Ok(())
    }

    /// Registers the sending half of a locally initiated stream.
    pub fn open_outbound_stream(&self, sid: u32) -> Result<Arc<OutboundStream>, EngineError> {
        let stream = OutboundStream::new(sid);
        if !self.outbound_streams.insert(sid, Arc::clone(&stream)) {
            return Err(EngineError::DuplicateId(sid));
        }
        Ok(stream)
    }

    /// The local stream writer is done with the stream.
    pub fn complete_outbound_stream(&self, sid: u32) {
        if self.outbound_streams.remove(sid).is_none() {
            trace!(sid, "completion for unknown stream id");
        }
    }

    pub fn send_stream_data(&self, sid: u32, payload: &[u8]) {
        self.send(&Frame::StreamData {
            sid,
            payload: Bytes::copy_from_slice(payload),
        });
    }

    pub fn send_stream_close(&self, sid: u32) {
        self.send(&Frame::StreamClose { sid });
    }

    pub fn send_stream_exception(&self, sid: u32) {
        self.send(&Frame::StreamException { sid });
    }

    /// Acknowledges one consumed chunk of an inbound stream.
    pub fn send_stream_ack(&self, sid: u32) {
        self.send(&Frame::StreamAck { sid });
    }

    pub fn send_alive(&self) {
        self.send(&Frame::Alive);
    }

    /// Time since the peer last showed liveness (any `ALIVE` frame).
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().unwrap().elapsed()
    }

    /// Asks the transport to tear the connection down.
    pub fn close(&self) {
        self.transport.close();
    }

    /// Connection teardown: cancels every in-flight entity. Each byte input
    /// is terminated so blocked workers wake, and local handlers are closed.
    pub fn shutdown(&self) {
        debug!("connection teardown, cancelling in-flight entities");

        for client in self.outbound_clients.drain() {
            client.shutdown();
        }
        for client in self.inbound_clients.drain() {
            client.handler().close();
        }
        for request in self.outbound_requests.drain() {
            if let Some(input) = request.input() {
                input.push_exception(InputError::ConnectionClosed);
            }
            request.handler().handle_cancelled(InputError::ConnectionClosed);
        }
        for request in self.inbound_requests.drain() {
            request.cancel();
            request.input().push_exception(InputError::ConnectionClosed);
        }
        for stream in self.inbound_streams.drain() {
            stream.sink().push_exception(InputError::ConnectionClosed);
        }
        self.outbound_streams.drain();
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            outbound_clients: self.outbound_clients.len(),
            inbound_clients: self.inbound_clients.len(),
            outbound_requests: self.outbound_requests.len(),
            inbound_requests: self.inbound_requests.len(),
            inbound_streams: self.inbound_streams.len(),
            outbound_streams: self.outbound_streams.len(),
        }
    }

    /// Composes `frame` into a pooled buffer behind a length placeholder and
    /// sends it blocking. Send failures are logged and discarded; the
    /// transport owns teardown. The buffer is freed on every path.
    fn send(&self, frame: &Frame) {
        send_frame(&*self.transport, &*self.pool, frame);
    }

    /// Builds the per-chunk acknowledgement emitter for a byte input. The
    /// closure captures the transport and pool only, so inputs stored inside
    /// entities never keep the engine itself alive.
    fn chunk_ack(&self, ack_frame: Frame) -> impl Fn() + Send + Sync + use<> {
        let transport = Arc::clone(&self.transport);
        let pool = Arc::clone(&self.pool);
        move || send_frame(&*transport, &*pool, &ack_frame)
    }
}

fn send_frame(transport: &dyn Transport, pool: &dyn BufferPool, frame: &Frame) {
    let mut buf = pool.allocate();
    buf.put_bytes(0, LENGTH_PREFIX_SIZE);
    frame.encode(&mut buf);
    if let Err(err) = transport.send_blocking(&mut buf, true) {
        warn!(%frame, %err, "failed to send frame");
    }
    pool.free(buf);
}
