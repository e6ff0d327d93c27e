//! Frame decoder for accumulating partial reads.
//!
//! Implements a byte-oriented state machine:
//! - `Scanning`: looking for two consecutive start bytes
//! - `Framed`: collecting unescaped payload bytes until the end byte
//!
//! A stray start byte inside a frame aborts it without being consumed, so it
//! can open the next real frame. Corrupt frames are logged, counted and
//! dropped; the decoder never errors out.
//!
//! # Example
//!
//! ```
//! use telewire::protocol::{encode_frame, FrameDecoder};
//!
//! let mut decoder = FrameDecoder::new();
//! let frame = encode_frame(b"ping");
//!
//! // Data arrives in chunks from the channel
//! assert!(decoder.push(&frame[..3]).is_empty());
//! let payloads = decoder.push(&frame[3..]);
//! assert_eq!(&payloads[0][..], b"ping");
//! ```

use bytes::{Bytes, BytesMut};

use super::wire_format::{
    checksum, FrameError, CHECKSUM_SIZE, DEFAULT_MAX_FRAME_LEN, END_BYTE, ESCAPE_BYTE,
    MIN_FRAME_LEN, START_BYTE,
};

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Looking for the double start marker.
    Scanning { prev_start: bool },
    /// Inside a frame.
    Framed { escaped: bool },
}

/// Outcome of feeding a single byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// More bytes are needed.
    Incomplete,
    /// A frame terminated and its checksum matched. Holds the payload.
    Frame(Bytes),
    /// A frame was discarded.
    Rejected(FrameError),
}

/// Counters describing what the decoder has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Frames delivered.
    pub frames: u64,
    /// Frames dropped for a checksum mismatch.
    pub checksum_errors: u64,
    /// Frames dropped for being shorter than the checksum.
    pub short_frames: u64,
    /// Frames dropped for exceeding the buffer cap.
    pub overflows: u64,
}

/// Decoder for the escape-delimited frame format.
pub struct FrameDecoder {
    /// Unescaped bytes of the frame being collected.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Cap on buffered bytes, checksum included.
    max_frame_len: usize,
    stats: DecoderStats,
}

impl FrameDecoder {
    /// Create a new decoder with the default frame cap.
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// Create a new decoder with a custom cap on buffered frame bytes.
    ///
    /// Values below the checksum size plus one are raised to that minimum.
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        let max_frame_len = max_frame_len.max(MIN_FRAME_LEN);
        Self {
            buffer: BytesMut::with_capacity(max_frame_len.min(DEFAULT_MAX_FRAME_LEN)),
            state: State::Scanning { prev_start: false },
            max_frame_len,
            stats: DecoderStats::default(),
        }
    }

    /// Push data into the decoder and extract the payloads of all complete,
    /// valid frames.
    ///
    /// Discarded frames are logged and counted in [`stats`](Self::stats).
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        let mut payloads = Vec::new();

        for &byte in data {
            match self.feed(byte) {
                Step::Incomplete => {}
                Step::Frame(payload) => payloads.push(payload),
                Step::Rejected(err) => {
                    tracing::warn!("Discarding frame: {}", err);
                }
            }
        }

        payloads
    }

    /// Feed a single byte through the state machine.
    pub fn feed(&mut self, byte: u8) -> Step {
        match self.state {
            State::Scanning { prev_start } => {
                if byte == START_BYTE && prev_start {
                    self.buffer.clear();
                    self.state = State::Framed { escaped: false };
                } else {
                    self.state = State::Scanning {
                        prev_start: byte == START_BYTE,
                    };
                }
                Step::Incomplete
            }

            State::Framed { escaped: true } => {
                self.state = State::Framed { escaped: false };
                self.append(byte)
            }

            State::Framed { escaped: false } => match byte {
                ESCAPE_BYTE => {
                    self.state = State::Framed { escaped: true };
                    Step::Incomplete
                }
                // Abort, but keep the byte: it may open a real frame.
                START_BYTE => {
                    tracing::debug!(
                        "Start marker inside frame after {} bytes, resynchronizing",
                        self.buffer.len()
                    );
                    self.buffer.clear();
                    self.state = State::Scanning { prev_start: true };
                    Step::Incomplete
                }
                END_BYTE => {
                    self.state = State::Scanning { prev_start: false };
                    self.finish()
                }
                _ => self.append(byte),
            },
        }
    }

    fn append(&mut self, byte: u8) -> Step {
        if self.buffer.len() >= self.max_frame_len {
            let len = self.buffer.len();
            self.buffer.clear();
            self.state = State::Scanning { prev_start: false };
            self.stats.overflows += 1;
            return Step::Rejected(FrameError::Overflow(len));
        }
        self.buffer.extend_from_slice(&[byte]);
        Step::Incomplete
    }

    /// Validate the collected bytes once the end marker arrives.
    fn finish(&mut self) -> Step {
        let len = self.buffer.len();
        if len < CHECKSUM_SIZE {
            self.buffer.clear();
            self.stats.short_frames += 1;
            return Step::Rejected(FrameError::TooShort(len));
        }

        let mut payload = self.buffer.split();
        let tail = payload.split_off(len - CHECKSUM_SIZE);
        let received = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let computed = checksum(&payload);

        if received != computed {
            self.stats.checksum_errors += 1;
            return Step::Rejected(FrameError::ChecksumMismatch { received, computed });
        }

        self.stats.frames += 1;
        Step::Frame(payload.freeze())
    }

    /// Get the decoder counters.
    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Check whether the decoder is inside a frame.
    pub fn is_framed(&self) -> bool {
        matches!(self.state, State::Framed { .. })
    }

    /// Get the number of buffered bytes of the current frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if no frame bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop any partial frame and return to scanning.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::Scanning { prev_start: false };
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
