//! MsgPack codec using `rmp-serde`.
//!
//! Packets are encoded with `to_vec_named`, so structs become maps keyed by
//! field name. This keeps the format self-describing: a peer that adds a
//! field, or a debugging tool that dumps raw frames, does not depend on field
//! order.
//!
//! # Example
//!
//! ```
//! use telewire::codec::MsgPackCodec;
//! use telewire::protocol::{Packet, Payload};
//!
//! let packet = Packet::new(3, Payload::FetchNode(12));
//! let encoded = MsgPackCodec::encode_packet(&packet).unwrap();
//! let decoded = MsgPackCodec::decode_packet(&encoded).unwrap();
//! assert_eq!(decoded, packet);
//! ```

use crate::error::Result;
use crate::protocol::Packet;

/// MessagePack codec for packet payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// Uses `to_vec_named` for struct-as-map format.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Encode a packet into a frame payload.
    #[inline]
    pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>> {
        Self::encode(packet)
    }

    /// Decode a frame payload into a packet.
    #[inline]
    pub fn decode_packet(bytes: &[u8]) -> Result<Packet> {
        Self::decode(bytes)
    }
}
