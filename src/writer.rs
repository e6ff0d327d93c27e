//! Dedicated writer task that owns the write half of the channel.
//!
//! Every outbound packet is serialized, framed and queued on an mpsc channel.
//! A single task drains the queue and writes one frame at a time, so at most
//! one physical write is ever in flight and frames hit the wire in the order
//! they were queued.
//!
//! # Architecture
//!
//! ```text
//! Correlator ─┐
//! Handlers   ─┼─► mpsc::Sender<Bytes> ─► Writer Task ─► channel
//! Publishers ─┘
//! ```

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backpressure::BackpressureController;
use crate::codec::MsgPackCodec;
use crate::config::WriterConfig;
use crate::error::{Result, TelewireError};
use crate::protocol::{encode_frame, Packet};

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable and can be shared across tasks.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
    backpressure: BackpressureController,
}

impl WriterHandle {
    /// Serialize, frame and queue a packet.
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        let payload = MsgPackCodec::encode_packet(packet)?;
        self.send(encode_frame(&payload)).await
    }

    /// Serialize, frame and queue a packet without waiting.
    ///
    /// For callers that cannot await, such as value callbacks. Fails with
    /// `BackpressureTimeout` when the queue is full.
    pub fn try_send_packet(&self, packet: &Packet) -> Result<()> {
        let payload = MsgPackCodec::encode_packet(packet)?;
        self.try_send(encode_frame(&payload))
    }

    /// Queue an already encoded frame.
    ///
    /// Waits while the queue is full, timing out after the configured
    /// duration.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.backpressure.reserve().await?;

        self.tx.send(frame).await.map_err(|_| {
            self.backpressure.release();
            TelewireError::ConnectionClosed
        })
    }

    /// Queue a frame without waiting for backpressure.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if at capacity.
    pub fn try_send(&self, frame: Bytes) -> Result<()> {
        self.backpressure.try_reserve()?;

        self.tx.try_send(frame).map_err(|e| {
            self.backpressure.release();
            match e {
                mpsc::error::TrySendError::Full(_) => TelewireError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => TelewireError::ConnectionClosed,
            }
        })
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.backpressure.is_active()
    }

    /// Get current pending frame count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backpressure.pending_count()
    }

    /// Check whether the writer task is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends cleanly once every handle is dropped, or with an error when
/// a write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let backpressure =
        BackpressureController::with_timeout(config.max_pending_frames, config.backpressure_timeout);

    let handle = WriterHandle {
        tx,
        backpressure: backpressure.clone(),
    };

    let task = tokio::spawn(writer_loop(rx, writer, backpressure));

    (handle, task)
}

/// Receive frames and write them out one by one.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: W,
    backpressure: BackpressureController,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let result = write_frame(&mut writer, &frame).await;
        backpressure.release();

        if let Err(e) = result {
            tracing::error!("Write failed: {}", e);
            rx.close();
            while rx.try_recv().is_ok() {
                backpressure.release();
            }
            return Err(e);
        }
    }

    tracing::debug!("Writer channel closed, shutting down");
    Ok(())
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FrameDecoder, Payload};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_writer_handle_send_packet() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        let packet = Packet::new(9, Payload::FetchNode(3));
        handle.send_packet(&packet).await.unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();

        let mut decoder = FrameDecoder::new();
        let payloads = decoder.push(&buf[..n]);
        assert_eq!(payloads.len(), 1);
        assert_eq!(MsgPackCodec::decode_packet(&payloads[0]).unwrap(), packet);
    }

    #[tokio::test]
    async fn test_frames_keep_queue_order() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for i in 1..=10u32 {
            handle
                .send_packet(&Packet::new(i, Payload::Ping))
                .await
                .unwrap();
        }
        drop(handle);

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();

        let mut decoder = FrameDecoder::new();
        let ids: Vec<u32> = decoder
            .push(&buf)
            .iter()
            .map(|p| MsgPackCodec::decode_packet(p).unwrap().req_id)
            .collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_try_send_at_capacity() {
        let (client, _server) = duplex(16);
        let config = WriterConfig {
            max_pending_frames: 1,
            channel_capacity: 4,
            backpressure_timeout: Duration::from_millis(10),
        };
        let (handle, _task) = spawn_writer_task(client, config);

        // The first frame fills the duplex buffer and stays pending.
        handle.try_send(Bytes::from(vec![0u8; 64])).unwrap();

        let result = handle.try_send(Bytes::from_static(b"x"));
        assert!(matches!(result, Err(TelewireError::BackpressureTimeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_when_peer_stalls() {
        let (client, _server) = duplex(16);
        let config = WriterConfig {
            max_pending_frames: 1,
            channel_capacity: 4,
            backpressure_timeout: Duration::from_millis(50),
        };
        let (handle, _task) = spawn_writer_task(client, config);

        handle.send(Bytes::from(vec![0u8; 64])).await.unwrap();
        let result = handle.send(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(TelewireError::BackpressureTimeout)));
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_send_after_peer_gone() {
        let (client, server) = duplex(64);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());
        drop(server);

        handle.send(Bytes::from_static(b"lost")).await.unwrap();
        assert!(task.await.unwrap().is_err());

        let result = handle.send(Bytes::from_static(b"again")).await;
        assert!(matches!(result, Err(TelewireError::ConnectionClosed)));
        assert_eq!(handle.pending_count(), 0);
    }
}
