//! Error types for the BFD session engine.

use thiserror::Error;

use crate::types::SessionKey;

/// Errors surfaced to callers of session creation.
#[derive(Debug, Error)]
pub enum CreateError {
    /// The target is not a direct, single-next-hop destination.
    #[error("target {0} is not a direct single-hop destination")]
    InvalidTarget(SessionKey),
    /// A session for this target already exists.
    #[error("session already exists for {0}")]
    AlreadyMonitored(SessionKey),
    /// The supplied configuration violates an engine invariant.
    #[error("invalid session config: {0}")]
    InvalidConfig(String),
    /// Opening the datagram transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// The engine worker has been shut down.
    #[error("bfd engine is shut down")]
    EngineShutdown,
}

/// Errors from opening a session transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No source port in the BFD range could be bound.
    #[error("failed to bind a source port after {0} attempts")]
    SourcePortExhausted(u8),
    /// Socket-level failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from sending a control packet.
///
/// `Unreachable` is distinguished so the transmit path can treat a down
/// target differently from a local fault.
#[derive(Debug, Error)]
pub enum SendError {
    /// The destination is unreachable.
    #[error("peer unreachable")]
    Unreachable,
    /// Any other socket-level failure.
    #[error("send I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from decoding a control packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    /// Fewer bytes than the fixed 24-byte header.
    #[error("short control packet: {0} bytes, need 24")]
    Truncated(usize),
}
