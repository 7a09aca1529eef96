//! Inbound buffering and fan-out for one published track
//!
//! A receiver is Active until [`Receiver::close`]; afterwards every
//! operation is a no-op. While active it:
//! - retains recent packets for NACK retransmission
//! - forwards every packet, in arrival order, to each subscribed sender
//! - asks its publisher for keyframes through the router's feedback queue

use crate::buffer::PacketBuffer;
use crate::config::SfuConfig;
use crate::error::{Error, Result};
use crate::sender::Sender;
use crate::track::TrackInfo;
use crate::types::{SenderId, TrackId};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::util::marshal::MarshalSize;

/// RTCP packets queued toward a publisher
pub type RtcpBatch = Vec<Box<dyn RtcpPacket + Send + Sync>>;

/// Audio level value meaning "no level recorded"
const NO_AUDIO_LEVEL: u8 = u8::MAX;

pub struct Receiver {
    info: TrackInfo,
    buffer: Mutex<PacketBuffer>,
    /// Copy-on-write subscriber list; forwarding iterates a snapshot
    senders: RwLock<Arc<Vec<Arc<dyn Sender>>>>,
    feedback: mpsc::Sender<RtcpBatch>,
    write_timeout: Duration,
    audio_level: AtomicU8,
    closed: AtomicBool,
    stats: ReceiverCounters,
}

#[derive(Default)]
struct ReceiverCounters {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    retransmissions: AtomicU64,
    nacks_missed: AtomicU64,
    writes_timed_out: AtomicU64,
}

impl Receiver {
    /// Create a receiver whose keyframe requests go to `feedback`
    #[must_use]
    pub fn new(info: TrackInfo, config: &SfuConfig, feedback: mpsc::Sender<RtcpBatch>) -> Self {
        info!(
            track_id = %info.id,
            stream_id = %info.stream_id,
            rid = ?info.rid,
            codec = %info.codec.mime_type,
            ssrc = info.ssrc,
            "Creating receiver"
        );

        Self {
            buffer: Mutex::new(PacketBuffer::new(config.buffer_capacity())),
            senders: RwLock::new(Arc::new(Vec::new())),
            feedback,
            write_timeout: config.sender_write_timeout(),
            audio_level: AtomicU8::new(NO_AUDIO_LEVEL),
            closed: AtomicBool::new(false),
            stats: ReceiverCounters::default(),
            info,
        }
    }

    #[must_use]
    pub const fn info(&self) -> &TrackInfo {
        &self.info
    }

    /// Router key of this receiver
    #[must_use]
    pub fn key(&self) -> TrackId {
        self.info.key()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Buffer a packet and forward it to every subscriber.
    ///
    /// Each write is bounded by the configured timeout; a failing or slow
    /// subscriber loses this packet without affecting the others.
    pub async fn push_rtp(&self, packet: Packet) {
        if self.is_closed() {
            return;
        }

        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(packet.marshal_size() as u64, Ordering::Relaxed);
        self.buffer.lock().push(packet.clone());

        let senders = Arc::clone(&self.senders.read());
        for sender in senders.iter() {
            match tokio::time::timeout(self.write_timeout, sender.write(self.info.layer, &packet))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(
                        track_id = %self.info.id,
                        sender_id = %sender.id(),
                        error = %e,
                        "Dropping packet for subscriber"
                    );
                }
                Err(_) => {
                    self.stats.writes_timed_out.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        track_id = %self.info.id,
                        sender_id = %sender.id(),
                        "Subscriber write timed out"
                    );
                }
            }
        }
    }

    /// Stored packet for `sequence_number`, if still retained
    #[must_use]
    pub fn packet(&self, sequence_number: u16) -> Option<Packet> {
        self.buffer.lock().get(sequence_number).cloned()
    }

    /// Re-emit retained packets to `requester`.
    ///
    /// Evicted sequence numbers are skipped: that loss is permanent.
    /// Returns the number of packets re-sent.
    pub async fn retransmit(&self, sequence_numbers: &[u16], requester: &dyn Sender) -> usize {
        if self.is_closed() {
            return 0;
        }

        let packets: Vec<Packet> = {
            let buffer = self.buffer.lock();
            sequence_numbers
                .iter()
                .filter_map(|seq| buffer.get(*seq).cloned())
                .collect()
        };
        let missed = sequence_numbers.len() - packets.len();
        if missed > 0 {
            self.stats
                .nacks_missed
                .fetch_add(missed as u64, Ordering::Relaxed);
        }

        let mut sent = 0;
        for packet in &packets {
            let write = requester.write_retransmission(packet);
            match tokio::time::timeout(self.write_timeout, write).await {
                Ok(Ok(())) => sent += 1,
                Ok(Err(e)) => {
                    debug!(track_id = %self.info.id, error = %e, "Retransmission dropped");
                }
                Err(_) => debug!(track_id = %self.info.id, "Retransmission timed out"),
            }
        }
        self.stats
            .retransmissions
            .fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }

    /// Ask the publisher for a keyframe. No-op for audio.
    pub fn request_keyframe(&self) {
        if !self.info.is_video() || self.is_closed() {
            return;
        }

        let pli: RtcpBatch = vec![Box::new(PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: self.info.ssrc,
        })];
        if self.feedback.try_send(pli).is_err() {
            debug!(track_id = %self.info.id, "Feedback queue full, keyframe request dropped");
        }
    }

    /// Add a subscriber
    pub fn subscribe(&self, sender: Arc<dyn Sender>) -> Result<()> {
        let mut senders = self.senders.write();
        if self.is_closed() {
            return Err(Error::ReceiverClosed);
        }

        debug!(track_id = %self.info.id, sender_id = %sender.id(), "Subscriber added");
        let mut next = Vec::clone(&senders);
        next.push(sender);
        *senders = Arc::new(next);
        Ok(())
    }

    /// Remove a subscriber. Returns whether it was subscribed.
    pub fn unsubscribe(&self, id: &SenderId) -> bool {
        let mut senders = self.senders.write();
        if !senders.iter().any(|s| s.id() == *id) {
            return false;
        }

        let next: Vec<_> = senders.iter().filter(|s| s.id() != *id).cloned().collect();
        *senders = Arc::new(next);
        debug!(track_id = %self.info.id, sender_id = %id, "Subscriber removed");
        true
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.senders.read().len()
    }

    /// Record the audio level carried in header extension `extension_id`
    pub fn record_audio_level(&self, packet: &Packet, extension_id: u8) {
        if let Some(ext) = packet.header.get_extension(extension_id) {
            if let Some(level) = ext.first() {
                self.audio_level.store(level & 0x7F, Ordering::Relaxed);
            }
        }
    }

    /// Last recorded audio level in -dBov (0 is loudest)
    #[must_use]
    pub fn audio_level(&self) -> Option<u8> {
        match self.audio_level.load(Ordering::Relaxed) {
            NO_AUDIO_LEVEL => None,
            level => Some(level),
        }
    }

    /// Close the receiver, releasing the buffer and notifying subscribers
    pub async fn close(&self) {
        let senders = {
            let mut senders = self.senders.write();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *senders)
        };
        self.buffer.lock().clear();

        let key = self.info.key();
        for sender in senders.iter() {
            sender.source_closed(&key).await;
        }
        info!(track_id = %self.info.id, rid = ?self.info.rid, "Receiver closed");
    }

    #[must_use]
    pub fn stats(&self) -> ReceiverStats {
        let (highest_sequence, highest_timestamp) = {
            let buffer = self.buffer.lock();
            (buffer.highest_sequence(), buffer.highest_timestamp())
        };

        ReceiverStats {
            track_id: self.info.key().to_string(),
            packets_received: self.stats.packets_received.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            retransmissions: self.stats.retransmissions.load(Ordering::Relaxed),
            nacks_missed: self.stats.nacks_missed.load(Ordering::Relaxed),
            writes_timed_out: self.stats.writes_timed_out.load(Ordering::Relaxed),
            highest_sequence,
            highest_timestamp,
            subscribers: self.subscriber_count(),
            audio_level: self.audio_level(),
        }
    }
}

/// Receiver statistics
#[derive(Debug, Clone, Serialize)]
pub struct ReceiverStats {
    pub track_id: String,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub retransmissions: u64,
    pub nacks_missed: u64,
    pub writes_timed_out: u64,
    pub highest_sequence: Option<u16>,
    pub highest_timestamp: u32,
    pub subscribers: usize,
    pub audio_level: Option<u8>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sender::testing::MemoryWriter;
    use crate::sender::SimpleSender;
    use crate::track::TrackKind;
    use bytes::Bytes;
    use webrtc::rtp::header::Header;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    pub fn video_info(id: &str) -> TrackInfo {
        TrackInfo::new(
            id,
            "stream",
            TrackKind::Video,
            1234,
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        )
    }

    pub fn rtp(seq: u16, payload: u8) -> Packet {
        Packet {
            header: Header {
                version: 2,
                sequence_number: seq,
                timestamp: u32::from(seq) * 3000,
                ..Default::default()
            },
            payload: Bytes::from(vec![payload]),
        }
    }

    pub fn receiver(info: TrackInfo) -> (Arc<Receiver>, mpsc::Receiver<RtcpBatch>) {
        let (tx, rx) = mpsc::channel(8);
        let config = SfuConfig {
            receiver_buffer_size: 64,
            ..Default::default()
        };
        (Arc::new(Receiver::new(info, &config, tx)), rx)
    }

    #[tokio::test]
    async fn test_nack_served_from_retention_window() {
        let (receiver, _rx) = receiver(video_info("cam"));
        for seq in 100..110 {
            receiver.push_rtp(rtp(seq, seq as u8)).await;
        }

        let writer = Arc::new(MemoryWriter::default());
        let sender = SimpleSender::new(&receiver, writer.clone());

        assert_eq!(receiver.retransmit(&[105], sender.as_ref()).await, 1);
        assert_eq!(writer.sequence_numbers(), vec![105]);

        // evicted: silently ignored
        assert_eq!(receiver.retransmit(&[50], sender.as_ref()).await, 0);
        assert_eq!(writer.sequence_numbers(), vec![105]);

        let stats = receiver.stats();
        assert_eq!(stats.retransmissions, 1);
        assert_eq!(stats.nacks_missed, 1);
        assert_eq!(stats.highest_sequence, Some(109));
    }

    #[tokio::test]
    async fn test_fan_out_to_subscribers() {
        let (receiver, _rx) = receiver(video_info("cam"));
        let a = Arc::new(MemoryWriter::default());
        let b = Arc::new(MemoryWriter::default());
        let sa = SimpleSender::new(&receiver, a.clone());
        let sb = SimpleSender::new(&receiver, b.clone());
        receiver.subscribe(sa).unwrap();
        receiver.subscribe(sb).unwrap();

        for seq in 1..=3 {
            receiver.push_rtp(rtp(seq, 0)).await;
        }
        assert_eq!(a.sequence_numbers(), vec![1, 2, 3]);
        assert_eq!(b.sequence_numbers(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failed_subscriber_does_not_affect_others() {
        let (receiver, _rx) = receiver(video_info("cam"));
        let broken = Arc::new(MemoryWriter::default());
        broken.closed.store(true, Ordering::SeqCst);
        let healthy = Arc::new(MemoryWriter::default());
        receiver
            .subscribe(SimpleSender::new(&receiver, broken))
            .unwrap();
        receiver
            .subscribe(SimpleSender::new(&receiver, healthy.clone()))
            .unwrap();

        receiver.push_rtp(rtp(7, 0)).await;
        assert_eq!(healthy.sequence_numbers(), vec![7]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (receiver, _rx) = receiver(video_info("cam"));
        let writer = Arc::new(MemoryWriter::default());
        let sender = SimpleSender::new(&receiver, writer.clone());
        receiver.subscribe(sender.clone()).unwrap();

        receiver.close().await;
        receiver.close().await;
        assert!(receiver.is_closed());
        assert_eq!(receiver.subscriber_count(), 0);
        // subscriber was told its source went away
        assert!(sender.is_closed());

        receiver.push_rtp(rtp(1, 0)).await;
        assert!(writer.sequence_numbers().is_empty());
        assert!(receiver.packet(1).is_none());
        assert!(matches!(
            receiver.subscribe(SimpleSender::new(&receiver, Arc::new(MemoryWriter::default()))),
            Err(Error::ReceiverClosed)
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let (receiver, _rx) = receiver(video_info("cam"));
        let sender = SimpleSender::new(&receiver, Arc::new(MemoryWriter::default()));
        receiver.subscribe(sender.clone()).unwrap();
        assert!(receiver.unsubscribe(&sender.id()));
        assert!(!receiver.unsubscribe(&sender.id()));
        assert_eq!(receiver.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_keyframe_request_queued() {
        let (receiver, mut rx) = receiver(video_info("cam"));
        receiver.request_keyframe();
        let batch = rx.try_recv().unwrap();
        let pli = batch[0]
            .as_any()
            .downcast_ref::<PictureLossIndication>()
            .unwrap();
        assert_eq!(pli.media_ssrc, 1234);
    }

    #[tokio::test]
    async fn test_audio_level() {
        let mut info = video_info("mic");
        info.kind = TrackKind::Audio;
        let (receiver, mut rx) = receiver(info);
        assert_eq!(receiver.audio_level(), None);

        let mut packet = rtp(1, 0);
        packet
            .header
            .set_extension(1, Bytes::from_static(&[0x80 | 42]))
            .unwrap();
        receiver.record_audio_level(&packet, 1);
        assert_eq!(receiver.audio_level(), Some(42));

        // audio never requests keyframes
        receiver.request_keyframe();
        assert!(rx.try_recv().is_err());
    }
}
