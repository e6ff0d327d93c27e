//! Codec module - serialization of packets into frame payloads.
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (`to_vec_named`)
//!
//! # Design
//!
//! Codecs are marker structs with static methods rather than trait objects,
//! so the codec is fixed at compile time.
//!
//! # Example
//!
//! ```
//! use telewire::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
