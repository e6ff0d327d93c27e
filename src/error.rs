//! Error types for telewire.

use thiserror::Error;

use crate::protocol::PacketKind;

/// Main error type for all link operations.
///
/// Every failure of a round trip, a floor acquisition or a subscription
/// operation is reported through this type; nothing in the crate panics on a
/// misbehaving peer.
#[derive(Debug, Error)]
pub enum TelewireError {
    /// I/O error on the physical channel.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (malformed packet, impossible field values).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A request did not receive its reply before the deadline.
    #[error("Request timed out")]
    Timeout,

    /// Gave up waiting for a turn on the subscription floor.
    #[error("Timed out waiting for the subscription floor")]
    FloorTimeout,

    /// The remote answered `success(false)`.
    #[error("Rejected by remote")]
    Rejected,

    /// The remote answered with a packet of the wrong kind.
    #[error("Unexpected reply: {0:?}")]
    UnexpectedReply(PacketKind),

    /// The subscription is no longer live.
    #[error("Subscription cancelled")]
    Cancelled,

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// No handler registered for an incoming packet kind.
    #[error("Handler not found for packet kind: {0:?}")]
    HandlerNotFound(PacketKind),
}

/// Result type alias using TelewireError.
pub type Result<T> = std::result::Result<T, TelewireError>;
