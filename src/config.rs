//! Link and writer configuration.
//!
//! Plain structs with defaults matching common serial deployments. Both the
//! host ([`RemoteDevice`](crate::remote::RemoteDevice)) and device
//! ([`DeviceEndpoint`](crate::endpoint::DeviceEndpoint)) builders expose a
//! setter for each field.

use std::time::Duration;

use crate::protocol::DEFAULT_MAX_FRAME_LEN;

/// Default round-trip timeout for requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default time without traffic before a link is considered down.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default interval between keep-alive pings from the host.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(250);

/// Default size of the read buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Default maximum pending frames before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 256;

/// Default writer channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Configuration of one end of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Timeout for requests issued without an explicit one.
    pub request_timeout: Duration,
    /// Silence after which every subscription is dropped.
    pub liveness_timeout: Duration,
    /// Keep-alive interval (host side only).
    pub ping_interval: Duration,
    /// Cap on buffered bytes of a single incoming frame.
    pub max_frame_len: usize,
    /// Size of the buffer handed to each read.
    pub read_buffer_size: usize,
    /// Writer task settings.
    pub writer: WriterConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            writer: WriterConfig::default(),
        }
    }
}

impl LinkConfig {
    /// Set the default request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the liveness timeout.
    pub fn liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout = timeout;
        self
    }

    /// Set the keep-alive interval.
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the incoming frame cap.
    pub fn max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Set the read buffer size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the maximum pending frames for backpressure.
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.writer.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.writer.backpressure_timeout = timeout;
        self
    }
}
