// ABOUTME: Per-id protocol entities and their state machines: clients, requests, and streams
// ABOUTME: Field mutations happen under each entity's own lock, acquired after any registry lock

use crate::engine::error::ServiceOpenError;
use crate::engine::traits::{ClientHandler, ClientListener, ReplyHandler, StreamSink};
use crate::input::ChunkInput;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Lifecycle of a locally opened client. `Closed` is terminal; no further
/// local or remote event mutates the entity once it is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Service request sent, no answer from the peer yet
    Waiting,
    /// The peer accepted the open
    Established,
    Closed,
}

/// A client opened by local action, keyed by a locally assigned id.
///
/// The result slot of the open negotiation is the [`ClientListener`]: exactly
/// one of `on_opened` / `on_failed` fires, and `on_closed` fires at most once
/// afterwards. Listener callbacks run outside the state lock so they may call
/// back into the engine.
pub struct OutboundClient {
    pub id: u32,
    pub service_type: String,
    pub group_name: String,
    listener: Arc<dyn ClientListener>,
    state: Mutex<ClientState>,
}

impl OutboundClient {
    pub fn new(
        id: u32,
        service_type: impl Into<String>,
        group_name: impl Into<String>,
        listener: Arc<dyn ClientListener>,
    ) -> Arc<OutboundClient> {
        Arc::new(OutboundClient {
            id,
            service_type: service_type.into(),
            group_name: group_name.into(),
            listener,
            state: Mutex::new(ClientState::Waiting),
        })
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap()
    }

    /// WAITING → ESTABLISHED on `SERVICE_CLIENT_OPENED`; publishes the result.
    pub(crate) fn establish(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != ClientState::Waiting {
            return false;
        }
        *state = ClientState::Established;
        drop(state);
        self.listener.on_opened(self.id);
        true
    }

    /// WAITING → CLOSED on a negative open reply; fails the result.
    pub(crate) fn fail(&self, error: ServiceOpenError) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state != ClientState::Waiting {
            return false;
        }
        *state = ClientState::Closed;
        drop(state);
        self.listener.on_failed(self.id, error);
        true
    }

    /// → CLOSED on `CLIENT_ASYNC_CLOSE` or local close; closes the request
    /// handler side. Returns the state the transition left.
    pub(crate) fn close(&self) -> Option<ClientState> {
        let mut state = self.state.lock().unwrap();
        let previous = *state;
        if previous == ClientState::Closed {
            return None;
        }
        *state = ClientState::Closed;
        drop(state);
        self.listener.on_closed(self.id);
        Some(previous)
    }

    /// Connection teardown: a waiting client fails, an established one closes.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        let previous = *state;
        *state = ClientState::Closed;
        drop(state);
        match previous {
            ClientState::Waiting => self
                .listener
                .on_failed(self.id, ServiceOpenError::ConnectionClosed),
            ClientState::Established => self.listener.on_closed(self.id),
            ClientState::Closed => {}
        }
    }
}

/// A client the peer opened against a local service. Single state; removal
/// from the registry is its close.
pub struct InboundClient {
    pub id: u32,
    handler: Arc<dyn ClientHandler>,
}

impl InboundClient {
    pub fn new(id: u32, handler: Arc<dyn ClientHandler>) -> Arc<InboundClient> {
        Arc::new(InboundClient { id, handler })
    }

    pub fn handler(&self) -> Arc<dyn ClientHandler> {
        Arc::clone(&self.handler)
    }
}

/// A request submitted locally, awaiting reply frames from the peer.
///
/// The byte input slot doubles as the entity lock: it is held across decoder
/// task submission so no task can observe the request after a racing local
/// close completed.
pub struct OutboundRequest {
    pub rid: u32,
    handler: Arc<dyn ReplyHandler>,
    acks: AtomicU32,
    input: Mutex<Option<Arc<ChunkInput>>>,
}

impl std::fmt::Debug for OutboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundRequest")
            .field("rid", &self.rid)
            .field("acks", &self.acks)
            .finish()
    }
}

impl OutboundRequest {
    pub fn new(rid: u32, handler: Arc<dyn ReplyHandler>) -> Arc<OutboundRequest> {
        Arc::new(OutboundRequest {
            rid,
            handler,
            acks: AtomicU32::new(0),
            input: Mutex::new(None),
        })
    }

    pub fn handler(&self) -> Arc<dyn ReplyHandler> {
        Arc::clone(&self.handler)
    }

    pub(crate) fn input_slot(&self) -> MutexGuard<'_, Option<Arc<ChunkInput>>> {
        self.input.lock().unwrap()
    }

    pub fn input(&self) -> Option<Arc<ChunkInput>> {
        self.input.lock().unwrap().clone()
    }

    /// One outgoing request chunk was consumed by the peer.
    pub(crate) fn ack(&self) -> u32 {
        self.acks.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn acks(&self) -> u32 {
        self.acks.load(Ordering::SeqCst)
    }
}

/// A request the peer opened against a local client, created by the first
/// `REQUEST` frame and fed by the frames that follow it.
pub struct InboundRequest {
    pub rid: u32,
    pub client_id: u32,
    input: Arc<ChunkInput>,
    acks: AtomicU32,
    state: Mutex<InboundRequestState>,
}

struct InboundRequestState {
    task_submitted: bool,
    cancelled: bool,
}

impl InboundRequest {
    pub fn new(rid: u32, client_id: u32, input: Arc<ChunkInput>) -> Arc<InboundRequest> {
        Arc::new(InboundRequest {
            rid,
            client_id,
            input,
            acks: AtomicU32::new(0),
            state: Mutex::new(InboundRequestState {
                task_submitted: false,
                cancelled: false,
            }),
        })
    }

    pub fn input(&self) -> Arc<ChunkInput> {
        Arc::clone(&self.input)
    }

    /// Runs `submit` under the entity lock the first time only.
    pub(crate) fn submit_task_once(&self, submit: impl FnOnce()) {
        let mut state = self.state.lock().unwrap();
        if state.task_submitted {
            return;
        }
        state.task_submitted = true;
        submit();
    }

    /// Marks the local reply side done; no reply will be sent.
    pub(crate) fn cancel(&self) {
        self.state.lock().unwrap().cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    /// One outgoing reply chunk was consumed by the peer.
    pub(crate) fn ack(&self) -> u32 {
        self.acks.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn acks(&self) -> u32 {
        self.acks.load(Ordering::SeqCst)
    }
}

/// Receiving half of a peer-initiated stream: routing only, the sink owns
/// the data.
pub struct InboundStream {
    pub sid: u32,
    sink: Arc<dyn StreamSink>,
}

impl InboundStream {
    pub fn new(sid: u32, sink: Arc<dyn StreamSink>) -> Arc<InboundStream> {
        Arc::new(InboundStream { sid, sink })
    }

    pub fn sink(&self) -> Arc<dyn StreamSink> {
        Arc::clone(&self.sink)
    }
}

/// Sending half of a locally initiated stream: ack counter plus the
/// receiver-side asynchronous notifications.
pub struct OutboundStream {
    pub sid: u32,
    acks: AtomicU32,
    async_start: AtomicBool,
    async_close: AtomicBool,
    async_exception: AtomicBool,
}

impl std::fmt::Debug for OutboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundStream")
            .field("sid", &self.sid)
            .field("acks", &self.acks)
            .field("async_start", &self.async_start)
            .field("async_close", &self.async_close)
            .field("async_exception", &self.async_exception)
            .finish()
    }
}

impl OutboundStream {
    pub fn new(sid: u32) -> Arc<OutboundStream> {
        Arc::new(OutboundStream {
            sid,
            acks: AtomicU32::new(0),
            async_start: AtomicBool::new(false),
            async_close: AtomicBool::new(false),
            async_exception: AtomicBool::new(false),
        })
    }

    pub(crate) fn ack(&self) -> u32 {
        self.acks.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn acks(&self) -> u32 {
        self.acks.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_async_start(&self) {
        self.async_start.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_async_close(&self) {
        self.async_close.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_async_exception(&self) {
        self.async_exception.store(true, Ordering::SeqCst);
    }

    pub fn is_async_started(&self) -> bool {
        self.async_start.load(Ordering::SeqCst)
    }

    pub fn is_async_closed(&self) -> bool {
        self.async_close.load(Ordering::SeqCst)
    }

    pub fn has_async_exception(&self) -> bool {
        self.async_exception.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingListener {
        events: StdMutex<Vec<String>>,
    }

    impl ClientListener for RecordingListener {
        fn on_opened(&self, id: u32) {
            self.events.lock().unwrap().push(format!("opened {id}"));
        }

        fn on_failed(&self, id: u32, error: ServiceOpenError) {
            self.events
                .lock()
                .unwrap()
                .push(format!("failed {id} {error}"));
        }

        fn on_closed(&self, id: u32) {
            self.events.lock().unwrap().push(format!("closed {id}"));
        }
    }

    fn client_with_listener() -> (Arc<OutboundClient>, Arc<RecordingListener>) {
        let listener = Arc::new(RecordingListener::default());
        let client = OutboundClient::new(3, "svc", "grp", listener.clone());
        (client, listener)
    }

    #[test]
    fn waiting_establishes_once() {
        let (client, listener) = client_with_listener();

        assert!(client.establish());
        assert_eq!(client.state(), ClientState::Established);

        // Second SERVICE_CLIENT_OPENED is a no-op
        assert!(!client.establish());
        assert_eq!(listener.events.lock().unwrap().as_slice(), ["opened 3"]);
    }

    #[test]
    fn waiting_fails_to_terminal_closed() {
        let (client, listener) = client_with_listener();

        assert!(client.fail(ServiceOpenError::NotFound));
        assert_eq!(client.state(), ClientState::Closed);

        // CLOSED is terminal: neither open nor a second failure fires
        assert!(!client.establish());
        assert!(!client.fail(ServiceOpenError::Failed));
        assert_eq!(
            listener.events.lock().unwrap().as_slice(),
            ["failed 3 service not found"]
        );
    }

    #[test]
    fn established_closes_once() {
        let (client, listener) = client_with_listener();
        client.establish();

        assert_eq!(client.close(), Some(ClientState::Established));
        assert_eq!(client.close(), None);
        assert_eq!(
            listener.events.lock().unwrap().as_slice(),
            ["opened 3", "closed 3"]
        );
    }

    #[test]
    fn shutdown_fails_waiting_client() {
        let (client, listener) = client_with_listener();
        client.shutdown();

        assert_eq!(client.state(), ClientState::Closed);
        assert_eq!(
            listener.events.lock().unwrap().as_slice(),
            ["failed 3 connection closed during service open"]
        );
    }

    #[test]
    fn inbound_request_submits_task_once() {
        let input = ChunkInput::new();
        let request = InboundRequest::new(0x10, 7, input);

        let mut submissions = 0;
        request.submit_task_once(|| submissions += 1);
        request.submit_task_once(|| submissions += 1);
        assert_eq!(submissions, 1);
    }

    #[test]
    fn ack_counters_increment() {
        let stream = OutboundStream::new(9);
        assert_eq!(stream.ack(), 1);
        assert_eq!(stream.ack(), 2);
        assert_eq!(stream.acks(), 2);

        assert!(!stream.is_async_started());
        stream.mark_async_start();
        assert!(stream.is_async_started());
    }
}
