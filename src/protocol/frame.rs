//! Frame encoding.
//!
//! Wraps an opaque payload into a delimited, escaped and checksummed frame
//! ready to be written to the channel.
//!
//! # Example
//!
//! ```
//! use telewire::protocol::{encode_frame, FrameDecoder};
//!
//! let frame = encode_frame(b"hello");
//! assert_eq!(&frame[..2], &[0x53, 0x53]);
//! assert_eq!(frame[frame.len() - 1], 0x45);
//!
//! let mut decoder = FrameDecoder::new();
//! let payloads = decoder.push(&frame);
//! assert_eq!(&payloads[0][..], b"hello");
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{checksum, is_reserved, CHECKSUM_SIZE, END_BYTE, ESCAPE_BYTE, START_BYTE};

/// Encode `payload` into a complete frame.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    // Worst case every byte is escaped.
    let mut buf = BytesMut::with_capacity(2 + 2 * (payload.len() + CHECKSUM_SIZE) + 1);
    encode_frame_into(payload, &mut buf);
    buf.freeze()
}

/// Encode `payload` into a complete frame, appending to `buf`.
pub fn encode_frame_into(payload: &[u8], buf: &mut BytesMut) {
    buf.put_u8(START_BYTE);
    buf.put_u8(START_BYTE);
    put_escaped(buf, payload);
    put_escaped(buf, &checksum(payload).to_le_bytes());
    buf.put_u8(END_BYTE);
}

fn put_escaped(buf: &mut BytesMut, data: &[u8]) {
    for &byte in data {
        if is_reserved(byte) {
            buf.put_u8(ESCAPE_BYTE);
        }
        buf.put_u8(byte);
    }
}

/// Length of the encoded frame for `payload`, without building it.
pub fn encoded_len(payload: &[u8]) -> usize {
    let escaped = |data: &[u8]| data.iter().filter(|&&b| is_reserved(b)).count() + data.len();
    2 + escaped(payload) + escaped(&checksum(payload).to_le_bytes()) + 1
}
