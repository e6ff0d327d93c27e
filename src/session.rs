//! Transport session: the only owner of the physical channel.
//!
//! [`Session::start`] splits the work across two tasks:
//! - the read loop feeds incoming bytes to a [`FrameDecoder`], decodes each
//!   frame into a [`Packet`] and hands it to [`Correlator::receive`]
//! - the writer task drains the outbound queue one frame at a time
//!
//! When the read side ends (EOF or I/O error) every pending request fails and
//! [`Session::closed`] resolves.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::MsgPackCodec;
use crate::config::LinkConfig;
use crate::correlator::Correlator;
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::protocol::{DecoderStats, FrameDecoder};
use crate::sync::lock;
use crate::writer::{spawn_writer_task, WriterHandle};

/// Instant of the last packet received on a link.
#[derive(Debug, Clone)]
pub struct Activity(Arc<Mutex<Instant>>);

impl Activity {
    /// Create a tracker starting now.
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    /// Record traffic.
    pub fn touch(&self) {
        *lock(&self.0) = Instant::now();
    }

    /// When traffic was last seen.
    pub fn last(&self) -> Instant {
        *lock(&self.0)
    }

    /// Time elapsed since traffic was last seen.
    pub fn idle_for(&self) -> Duration {
        self.last().elapsed()
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// A running link over one duplex byte channel.
pub struct Session {
    correlator: Arc<Correlator>,
    activity: Activity,
    stats: Arc<Mutex<DecoderStats>>,
    closed: watch::Receiver<bool>,
    read_task: JoinHandle<()>,
    _writer_task: JoinHandle<Result<()>>,
}

impl Session {
    /// Start the read loop and writer task.
    ///
    /// `handlers` receives every packet that is neither a reply to one of our
    /// requests nor routed to a stream.
    pub fn start<R, W>(reader: R, writer: W, config: &LinkConfig, handlers: HandlerRegistry) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, writer_task) = spawn_writer_task(writer, config.writer.clone());
        let correlator = Arc::new(Correlator::new(writer, handlers));
        let activity = Activity::new();
        let stats = Arc::new(Mutex::new(DecoderStats::default()));
        let (closed_tx, closed) = watch::channel(false);

        let read_loop = ReadLoop {
            correlator: correlator.clone(),
            activity: activity.clone(),
            stats: stats.clone(),
            decoder: FrameDecoder::with_max_frame_len(config.max_frame_len),
            buf: vec![0u8; config.read_buffer_size.max(1)],
        };

        let read_task = tokio::spawn(async move {
            let correlator = read_loop.correlator.clone();
            match read_loop.run(reader).await {
                Ok(()) => tracing::info!("Link closed by peer"),
                Err(e) => tracing::error!("Read loop error: {}", e),
            }
            correlator.close();
            let _ = closed_tx.send(true);
        });

        Self {
            correlator,
            activity,
            stats,
            closed,
            read_task,
            _writer_task: writer_task,
        }
    }

    /// Get the request correlator.
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Get the writer handle.
    pub fn writer(&self) -> &WriterHandle {
        self.correlator.writer()
    }

    /// Get the traffic tracker.
    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    /// Get the frame decoder counters.
    pub fn stats(&self) -> DecoderStats {
        *lock(&self.stats)
    }

    /// Check whether the read side has ended.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the read side ends.
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.read_task.abort();
        self.correlator.close();
    }
}

struct ReadLoop {
    correlator: Arc<Correlator>,
    activity: Activity,
    stats: Arc<Mutex<DecoderStats>>,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

impl ReadLoop {
    async fn run<R>(mut self, mut reader: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let n = reader.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(());
            }

            let payloads = self.decoder.push(&self.buf[..n]);
            *lock(&self.stats) = self.decoder.stats();

            for payload in payloads {
                let packet = match MsgPackCodec::decode_packet(&payload) {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::warn!("Dropping undecodable packet: {}", e);
                        continue;
                    }
                };

                self.activity.touch();
                tracing::trace!("Received {:?} (req {})", packet.kind(), packet.req_id);
                self.correlator.receive(packet).await;
            }
        }
    }
}
