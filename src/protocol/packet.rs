//! Logical packets carried inside frames.
//!
//! A [`Packet`] pairs a request id with a tagged [`Payload`]. Request id 0
//! marks a packet that is neither a request expecting a reply nor a reply.
//! Value updates reuse the variable id as their request id so the receiver
//! can route them like a long-lived stream.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Request id used for fire-and-forget packets.
pub const NO_REQUEST_ID: u32 = 0;

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Request identifier (0 = not a request/reply).
    pub req_id: u32,
    /// Tagged message body.
    pub payload: Payload,
}

/// Message bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// Keep-alive request.
    Ping,
    /// Liveness answer with the number of active subscriptions.
    Pong(u32),
    /// Request a node descriptor by id.
    FetchNode(u32),
    /// Opaque node descriptor answering `FetchNode`.
    Node(Bytes),
    /// Create or re-tune a subscription.
    ChangeSub {
        var_id: u32,
        debounce_ms: u32,
        refresh_ms: u32,
        timeout_ms: u32,
    },
    /// Drop a subscription.
    CancelSub { var_id: u32, timeout_ms: u32 },
    /// Pushed value of a subscribed variable.
    Update { var_id: u32, value: Value },
    /// Outcome of a state-changing request.
    Success(bool),
    /// The sender dropped its subscription to a variable.
    Cancelled(u32),
    /// Invoke an action.
    Call { action_id: u32, argument: Value },
    /// Result of an action call.
    CallCompleted(Value),
}

/// Fieldless mirror of [`Payload`] used for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Ping,
    Pong,
    FetchNode,
    Node,
    ChangeSub,
    CancelSub,
    Update,
    Success,
    Cancelled,
    Call,
    CallCompleted,
}

impl Payload {
    /// Get the kind of this payload.
    pub fn kind(&self) -> PacketKind {
        match self {
            Payload::Ping => PacketKind::Ping,
            Payload::Pong(_) => PacketKind::Pong,
            Payload::FetchNode(_) => PacketKind::FetchNode,
            Payload::Node(_) => PacketKind::Node,
            Payload::ChangeSub { .. } => PacketKind::ChangeSub,
            Payload::CancelSub { .. } => PacketKind::CancelSub,
            Payload::Update { .. } => PacketKind::Update,
            Payload::Success(_) => PacketKind::Success,
            Payload::Cancelled(_) => PacketKind::Cancelled,
            Payload::Call { .. } => PacketKind::Call,
            Payload::CallCompleted(_) => PacketKind::CallCompleted,
        }
    }
}

impl PacketKind {
    /// Check if packets of this kind answer a request.
    ///
    /// Only these may complete a pending request.
    #[inline]
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            PacketKind::Pong | PacketKind::Node | PacketKind::Success | PacketKind::CallCompleted
        )
    }
}

impl Packet {
    /// Create a new packet.
    pub fn new(req_id: u32, payload: Payload) -> Self {
        Self { req_id, payload }
    }

    /// Create a fire-and-forget packet.
    pub fn event(payload: Payload) -> Self {
        Self::new(NO_REQUEST_ID, payload)
    }

    /// Create a value update routed by variable id.
    pub fn update(var_id: u32, value: Value) -> Self {
        Self::new(var_id, Payload::Update { var_id, value })
    }

    /// Get the payload kind.
    #[inline]
    pub fn kind(&self) -> PacketKind {
        self.payload.kind()
    }

    /// Check if this packet can complete a pending request.
    #[inline]
    pub fn is_reply(&self) -> bool {
        self.req_id != NO_REQUEST_ID && self.kind().is_reply()
    }
}
