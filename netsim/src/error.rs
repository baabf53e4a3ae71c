//! Errors surfaced by the simulator's connectionless and connection-oriented APIs.

/// An error from a `netsim` operation.
///
/// Mirrors the error kinds `raft-core`'s `RaftNetwork` implementations are expected to map onto
/// their own transport errors: a timeout or a missing/faulted link should never be mistaken for
/// a protocol-level failure, since the caller (the Raft replication loop) reacts differently to
/// each.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum NetError {
    /// The operation did not complete within its deadline.
    #[error("operation timed out")]
    Timeout,

    /// No edge exists for the requested direction, or the addressed node is unknown.
    #[error("no route to {0}")]
    NetworkError(String),

    /// The operation was attempted on a connection that has already been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A connection-oriented frame could not be decoded, or arrived out of the expected
    /// handshake sequence.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The simulator itself is shutting down (its background delivery task has stopped).
    #[error("simulator is shutting down")]
    Shutdown,
}
