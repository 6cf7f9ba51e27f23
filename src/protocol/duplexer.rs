//! Transport duplexer
//!
//! The single writer of the serial link. Every producer (forwarding readers,
//! the correlator, the InitProxy handler) pushes frames into a bounded queue;
//! one task drains the queue and writes frames to the transport in FIFO
//! order. Nothing else may write to the transport, since a second writer
//! would interleave bytes and destroy framing.

use futures::SinkExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::core::codec::PacketCodec;
use crate::core::packet::{OutgoingPacket, Packet, MAX_PAYLOAD_SIZE};
use crate::error::{constants, Result, TunnelError};
use crate::utils::Metrics;

/// Upper bound on flushing queued frames once shutdown is signalled
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Producer side of the outgoing queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<OutgoingPacket>,
}

/// Create the bounded outgoing queue.
pub fn channel(capacity: usize) -> (Outbox, mpsc::Receiver<OutgoingPacket>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Outbox { tx }, rx)
}

impl Outbox {
    /// Queue a frame, waiting while the queue is full.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        if packet.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::OversizedPayload(packet.payload.len()));
        }

        self.tx
            .send(packet)
            .await
            .map_err(|_| TunnelError::EngineClosed(constants::ERR_QUEUE_CLOSED))
    }

    pub async fn send_data(&self, connection_id: u32, bytes: &[u8]) -> Result<()> {
        self.send(Packet::data(connection_id, bytes)).await
    }

    pub async fn send_close(&self, connection_id: u32) -> Result<()> {
        self.send(Packet::close_port(connection_id)).await
    }

}

/// Consumer side: owns the transport's write half.
pub struct Duplexer<W> {
    sink: FramedWrite<W, PacketCodec>,
    rx: mpsc::Receiver<OutgoingPacket>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl<W> Duplexer<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        sink: FramedWrite<W, PacketCodec>,
        rx: mpsc::Receiver<OutgoingPacket>,
        metrics: Arc<Metrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sink,
            rx,
            metrics,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drain the queue until every producer is gone or shutdown is signalled.
    ///
    /// Each frame is written and flushed before the next is taken. A failed
    /// write is logged and the loop moves on; a dead transport is detected by
    /// the read side. On shutdown the queue is closed to new frames and what
    /// is already queued is flushed, bounded by [`DRAIN_TIMEOUT`].
    #[instrument(name = "duplexer", skip_all)]
    pub async fn run(mut self) {
        debug!("Duplexer started");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                next = self.rx.recv() => match next {
                    Some(packet) => Some(packet),
                    None => {
                        info!("Outgoing queue closed, duplexer stopping");
                        return;
                    }
                },
            };

            match next {
                Some(packet) => self.write(packet).await,
                None => {
                    self.drain().await;
                    return;
                }
            }
        }
    }

    async fn drain(&mut self) {
        self.rx.close();
        let flushed = tokio::time::timeout(DRAIN_TIMEOUT, async {
            let mut count = 0usize;
            while let Some(packet) = self.rx.recv().await {
                self.write(packet).await;
                count += 1;
            }
            count
        })
        .await;

        match flushed {
            Ok(count) => debug!(frames = count, "Shutdown signalled, queue flushed"),
            Err(_) => warn!("Shutdown signalled, queue not flushed before deadline"),
        }
    }

    async fn write(&mut self, packet: OutgoingPacket) {
        let packet_type = packet.packet_type;
        let bytes = packet.encoded_len() as u64;
        match self.sink.send(packet).await {
            Ok(()) => {
                self.metrics.frame_sent(bytes);
                trace!(%packet_type, bytes, "Frame written");
            }
            Err(e) => {
                self.metrics.write_failed();
                error!(%packet_type, error = %e, "Error sending packet");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::core::packet::PacketType;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    #[tokio::test]
    async fn frames_arrive_in_queue_order() {
        let (writer, reader) = tokio::io::duplex(1024);
        let (outbox, rx) = channel(4);
        let metrics = Arc::new(Metrics::new());
        let task = Duplexer::new(
            FramedWrite::new(writer, PacketCodec),
            rx,
            metrics.clone(),
            CancellationToken::new(),
        )
        .spawn();

        for i in 0..20u32 {
            outbox.send_data(i % 3, &i.to_be_bytes()).await.unwrap();
        }
        drop(outbox);

        let mut frames = FramedRead::new(reader, PacketCodec);
        for i in 0..20u32 {
            let packet = frames.next().await.unwrap().unwrap();
            assert_eq!(packet, Packet::data(i % 3, &i.to_be_bytes()));
        }

        task.await.unwrap();
        assert_eq!(metrics.snapshot().frames_sent, 20);
    }

    #[tokio::test]
    async fn oversized_frames_are_refused_at_the_producer() {
        let (outbox, mut rx) = channel(1);
        let err = outbox
            .send(Packet::new(PacketType::Data, vec![0u8; MAX_PAYLOAD_SIZE + 1]))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::OversizedPayload(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_fails_once_consumer_is_gone() {
        let (outbox, rx) = channel(1);
        drop(rx);
        assert!(matches!(
            outbox.send_close(1).await,
            Err(TunnelError::EngineClosed(_))
        ));
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let (outbox, mut rx) = channel(1);
        outbox.send_close(1).await.unwrap();

        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            outbox.send_close(2),
        )
        .await;
        assert!(blocked.is_err(), "second send should wait for capacity");

        assert_eq!(rx.recv().await.unwrap(), Packet::close_port(1));
        outbox.send_close(3).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_flushes_queued_frames() {
        let (writer, reader) = tokio::io::duplex(1024);
        let (outbox, rx) = channel(8);
        let shutdown = CancellationToken::new();
        let duplexer = Duplexer::new(
            FramedWrite::new(writer, PacketCodec),
            rx,
            Arc::new(Metrics::new()),
            shutdown.clone(),
        );

        // Queued before the writer runs, so shutdown finds them waiting
        outbox.send_close(1).await.unwrap();
        outbox.send_close(2).await.unwrap();
        shutdown.cancel();
        duplexer.run().await;

        assert!(outbox.send_close(3).await.is_err(), "queue closed after shutdown");
        drop(outbox);

        let frames: Vec<Packet> = FramedRead::new(reader, PacketCodec)
            .map(|frame| frame.unwrap())
            .collect()
            .await;
        assert_eq!(frames, vec![Packet::close_port(1), Packet::close_port(2)]);
    }
}
