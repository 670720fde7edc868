pub mod codec;
pub mod connection;
pub mod engine;
pub mod frame;
pub mod input;
pub mod keepalive;
pub mod marshal;
pub mod pool;


// Re-export the wire-level types for direct access
pub use codec::{CodecError, Command, MAX_FRAME_SIZE, MSG_FLAG_FIRST};
pub use frame::Frame;

// Re-export the engine surface for easy access
pub use engine::error::{EngineError, ServiceOpenError};
pub use engine::traits::{
    BufferPool, ClientHandler, ClientListener, Executor, ReplyHandler, ServiceRegistry,
    StreamSink, Transport,
};
pub use engine::{Engine, EngineStats};
pub use input::{ChunkInput, ChunkReader, InputError};
pub use marshal::{Marshaller, OptionMap, WireMarshaller};

/// Error returned by most functions.
///
/// The engine itself never surfaces errors to the transport loop (spec'd
/// protocol violations close the connection instead), so this boxed error is
/// only used by the fallible plumbing around it: connection setup, frame
/// reading, and local registration. Hot-path decoding uses the dedicated
/// [`CodecError`] enum.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for link operations.
///
/// # Examples
///
/// Serving one connection:
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use wiremux::connection::Session;
/// use wiremux::{ChunkReader, ClientHandler, ServiceRegistry, WireMarshaller};
///
/// struct Echo;
///
/// impl ClientHandler for Echo {
///     fn handle_request(&self, _rid: u32, _payload: ChunkReader) {
///         // pull bytes, unmarshal, reply through the engine
///     }
///
///     fn close(&self) {}
/// }
///
/// struct Services;
///
/// impl ServiceRegistry for Services {
///     fn open_service(&self, service_type: &str, _group_name: &str) -> Option<Arc<dyn ClientHandler>> {
///         (service_type == "echo").then(|| Arc::new(Echo) as Arc<dyn ClientHandler>)
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> wiremux::Result<()> {
///     let listener = tokio::net::TcpListener::bind("0.0.0.0:9595").await?;
///     let (socket, _) = listener.accept().await?;
///
///     let session = Session::establish(socket, Arc::new(Services), Arc::new(WireMarshaller));
///     session.run().await
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;
