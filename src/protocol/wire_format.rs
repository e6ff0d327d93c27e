//! Wire format constants and checksum.
//!
//! Every frame on the channel has this layout:
//! ```text
//! ┌───────────┬─────────────────────┬──────────────────────┬──────┐
//! │ Start     │ Payload             │ CRC-32C              │ End  │
//! │ 0x53 0x53 │ escaped, N bytes    │ escaped, 4 bytes LE  │ 0x45 │
//! └───────────┴─────────────────────┴──────────────────────┴──────┘
//! ```
//!
//! Any reserved byte (start, end or escape) inside the payload or the
//! checksum is preceded by the escape byte `0x40`. The checksum covers the
//! unescaped payload only.

use thiserror::Error;

/// Start marker byte. A frame opens with two of these.
pub const START_BYTE: u8 = 0x53;

/// End marker byte.
pub const END_BYTE: u8 = 0x45;

/// Escape byte. The byte following it is taken literally.
pub const ESCAPE_BYTE: u8 = 0x40;

/// Size of the trailing checksum in bytes.
pub const CHECKSUM_SIZE: usize = 4;

/// Default cap on buffered (unescaped) frame bytes, checksum included.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4096;

/// Smallest cap accepted by the decoder.
pub const MIN_FRAME_LEN: usize = CHECKSUM_SIZE + 1;

/// Returns true if `byte` must be escaped inside a frame.
#[inline]
pub fn is_reserved(byte: u8) -> bool {
    byte == START_BYTE || byte == END_BYTE || byte == ESCAPE_BYTE
}

/// Compute the frame checksum over an unescaped payload.
#[inline]
pub fn checksum(payload: &[u8]) -> u32 {
    crc32c::crc32c(payload)
}

/// Reasons a terminated frame was discarded.
///
/// These are recoverable: the decoder logs them, counts them and resumes
/// scanning for the next start marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Trailing checksum does not match the payload.
    #[error("checksum mismatch: frame carried {received:#010x}, payload hashes to {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum found in the frame.
        received: u32,
        /// Checksum recomputed over the payload.
        computed: u32,
    },

    /// Fewer bytes than a checksum between the markers.
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    /// No end marker before the buffer cap was reached.
    #[error("frame exceeded {0} bytes without an end marker")]
    Overflow(usize),
}
