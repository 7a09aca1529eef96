use super::{RtpWriter, Sender, SenderCounters, SenderStats, SequenceRewriter};
use crate::error::{Error, Result};
use crate::receiver::Receiver;
use crate::track::QualityLayer;
use crate::types::{SenderId, StreamId, TrackId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;
use webrtc::rtp::packet::Packet;

/// Forwards a single receiver 1:1
pub struct SimpleSender {
    id: SenderId,
    stream_id: StreamId,
    source: Weak<Receiver>,
    writer: Arc<dyn RtpWriter>,
    rewriter: Mutex<SequenceRewriter>,
    closed: AtomicBool,
    stats: SenderCounters,
}

impl SimpleSender {
    /// Create a sender for `source`. The caller subscribes it.
    pub fn new(source: &Arc<Receiver>, writer: Arc<dyn RtpWriter>) -> Arc<Self> {
        Arc::new(Self {
            id: SenderId::new(),
            stream_id: source.info().stream_id.clone(),
            source: Arc::downgrade(source),
            writer,
            rewriter: Mutex::new(SequenceRewriter::new()),
            closed: AtomicBool::new(false),
            stats: SenderCounters::default(),
        })
    }

    async fn send(&self, packet: &Packet) -> Result<()> {
        match self.writer.write_rtp(packet).await {
            Ok(()) => {
                self.stats.record_sent(packet);
                Ok(())
            }
            Err(e) => {
                self.stats.record_drop();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Sender for SimpleSender {
    fn id(&self) -> SenderId {
        self.id
    }

    fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    async fn write(&self, _layer: Option<QualityLayer>, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SenderClosed);
        }

        let mut out = packet.clone();
        self.rewriter.lock().rewrite(&mut out.header);
        self.send(&out).await
    }

    async fn write_retransmission(&self, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SenderClosed);
        }

        let mut out = packet.clone();
        let (seq, ts) = self
            .rewriter
            .lock()
            .map(packet.header.sequence_number, packet.header.timestamp);
        out.header.sequence_number = seq;
        out.header.timestamp = ts;
        self.send(&out).await?;
        self.stats.record_retransmission();
        Ok(())
    }

    fn resolve_nack(&self, sequence_number: u16) -> Option<(Arc<Receiver>, u16)> {
        let source = self.rewriter.lock().source_sequence(sequence_number)?;
        Some((self.source.upgrade()?, source))
    }

    fn keyframe_source(&self) -> Option<Arc<Receiver>> {
        self.source.upgrade()
    }

    async fn source_closed(&self, _track: &TrackId) {
        if let Err(e) = self.close().await {
            debug!(sender_id = %self.id, error = %e, "Failed to close sender");
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(source) = self.source.upgrade() {
            source.unsubscribe(&self.id);
        }
        self.writer.close().await;
        debug!(sender_id = %self.id, stream_id = %self.stream_id, "Sender closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> SenderStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::tests::{receiver, rtp, video_info};
    use crate::sender::testing::MemoryWriter;

    #[tokio::test]
    async fn test_write_forwards_in_order() {
        let (source, _rx) = receiver(video_info("cam"));
        let writer = Arc::new(MemoryWriter::default());
        let sender = SimpleSender::new(&source, writer.clone());

        for seq in [10, 11, 12] {
            sender.write(None, &rtp(seq, 0)).await.unwrap();
        }
        assert_eq!(writer.sequence_numbers(), vec![10, 11, 12]);
        assert_eq!(sender.stats().packets_sent, 3);
    }

    #[tokio::test]
    async fn test_close_unsubscribes_and_releases_writer() {
        let (source, _rx) = receiver(video_info("cam"));
        let writer = Arc::new(MemoryWriter::default());
        let sender = SimpleSender::new(&source, writer.clone());
        source.subscribe(sender.clone()).unwrap();

        sender.close().await.unwrap();
        sender.close().await.unwrap();
        assert_eq!(source.subscriber_count(), 0);
        assert!(writer.closed.load(Ordering::SeqCst));
        assert!(matches!(
            sender.write(None, &rtp(1, 0)).await,
            Err(Error::SenderClosed)
        ));
    }

    #[tokio::test]
    async fn test_closing_one_subscriber_keeps_other_continuous() {
        let (source, _rx) = receiver(video_info("cam"));
        let first = Arc::new(MemoryWriter::default());
        let second = Arc::new(MemoryWriter::default());
        let a = SimpleSender::new(&source, first.clone());
        let b = SimpleSender::new(&source, second.clone());
        source.subscribe(a.clone()).unwrap();
        source.subscribe(b.clone()).unwrap();

        for seq in 1..=3 {
            source.push_rtp(rtp(seq, 0)).await;
        }
        a.close().await.unwrap();
        for seq in 4..=6 {
            source.push_rtp(rtp(seq, 0)).await;
        }

        assert_eq!(first.sequence_numbers(), vec![1, 2, 3]);
        assert_eq!(second.sequence_numbers(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_resolve_nack() {
        let (source, _rx) = receiver(video_info("cam"));
        let sender = SimpleSender::new(&source, Arc::new(MemoryWriter::default()));
        sender.write(None, &rtp(40, 0)).await.unwrap();
        sender.write(None, &rtp(41, 0)).await.unwrap();

        let (receiver, seq) = sender.resolve_nack(41).unwrap();
        assert!(Arc::ptr_eq(&receiver, &source));
        assert_eq!(seq, 41);
        assert!(sender.resolve_nack(90).is_none());
    }
}
