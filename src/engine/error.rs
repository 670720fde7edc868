// ABOUTME: Error types surfaced by the protocol engine to local callers and listeners

use thiserror::Error;

/// Errors returned by local engine operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The id is already present in the registry the operation targets
    #[error("id {0} is already registered")]
    DuplicateId(u32),
}

/// Outcome of a failed service-open negotiation, delivered to the
/// [`ClientListener`](super::traits::ClientListener) of a waiting client.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOpenError {
    /// The peer has no service registered under the requested type and group
    #[error("service not found")]
    NotFound,

    /// The peer failed to open the service (lookup or option decoding error)
    #[error("service open failed")]
    Failed,

    /// The connection was torn down before the peer answered
    #[error("connection closed during service open")]
    ConnectionClosed,
}
