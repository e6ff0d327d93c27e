//! Protocol module - wire format, framing, and packet types.
//!
//! This module implements the byte-level protocol of the link:
//! - escape-delimited frames with a trailing checksum
//! - a resynchronizing frame decoder for partial reads
//! - the logical packet set carried inside frames

mod frame;
mod frame_buffer;
mod packet;
mod wire_format;

pub use frame::{encode_frame, encode_frame_into, encoded_len};
pub use frame_buffer::{DecoderStats, FrameDecoder, Step};
pub use packet::{Packet, PacketKind, Payload, NO_REQUEST_ID};
pub use wire_format::{
    checksum, is_reserved, FrameError, CHECKSUM_SIZE, DEFAULT_MAX_FRAME_LEN, END_BYTE,
    ESCAPE_BYTE, MIN_FRAME_LEN, START_BYTE,
};
