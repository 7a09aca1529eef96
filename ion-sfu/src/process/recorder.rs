use super::{Element, Sample};
use crate::codec::{MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9};
use crate::error::{Error, Result};
use crate::receiver::Receiver;
use crate::sender::{Sender, SenderCounters, SenderStats};
use crate::track::{QualityLayer, TrackKind};
use crate::types::{SenderId, StreamId, TrackId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc::media::io::sample_builder::SampleBuilder;
use webrtc::media::Sample as MediaSample;
use webrtc::rtp::codecs::h264::H264Packet;
use webrtc::rtp::codecs::opus::OpusPacket;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::codecs::vp9::Vp9Packet;
use webrtc::rtp::packet::Packet;

/// Packets a frame may wait for reordering before it is given up
const MAX_LATE: u16 = 64;

/// Samples waiting for the element before new ones are dropped
const SAMPLE_QUEUE_CAPACITY: usize = 256;

enum Builder {
    Vp8(SampleBuilder<Vp8Packet>),
    Vp9(SampleBuilder<Vp9Packet>),
    H264(SampleBuilder<H264Packet>),
    Opus(SampleBuilder<OpusPacket>),
}

impl Builder {
    fn new(mime_type: &str, clock_rate: u32) -> Result<Self> {
        let builder = match mime_type.to_ascii_lowercase().as_str() {
            MIME_TYPE_VP8 => Self::Vp8(SampleBuilder::new(MAX_LATE, Vp8Packet::default(), clock_rate)),
            MIME_TYPE_VP9 => Self::Vp9(SampleBuilder::new(MAX_LATE, Vp9Packet::default(), clock_rate)),
            MIME_TYPE_H264 => {
                Self::H264(SampleBuilder::new(MAX_LATE, H264Packet::default(), clock_rate))
            }
            MIME_TYPE_OPUS => Self::Opus(SampleBuilder::new(MAX_LATE, OpusPacket, clock_rate)),
            other => return Err(Error::UnsupportedCodec(other.to_string())),
        };
        Ok(builder)
    }

    fn push(&mut self, packet: Packet) {
        match self {
            Self::Vp8(b) => b.push(packet),
            Self::Vp9(b) => b.push(packet),
            Self::H264(b) => b.push(packet),
            Self::Opus(b) => b.push(packet),
        }
    }

    fn pop(&mut self) -> Option<MediaSample> {
        match self {
            Self::Vp8(b) => b.pop(),
            Self::Vp9(b) => b.pop(),
            Self::H264(b) => b.pop(),
            Self::Opus(b) => b.pop(),
        }
    }
}

struct Pipeline {
    builder: Builder,
    clock_rate: u32,
    first_timestamp: Option<u32>,
}

impl Pipeline {
    fn timestamp(&mut self, rtp_timestamp: u32) -> Duration {
        let first = *self.first_timestamp.get_or_insert(rtp_timestamp);
        let ticks = u64::from(rtp_timestamp.wrapping_sub(first));
        Duration::from_micros(ticks * 1_000_000 / u64::from(self.clock_rate.max(1)))
    }
}

/// Sender that depacketizes one receiver's packets into samples for an
/// element.
///
/// Samples are handed to a writer task through a bounded queue, so a slow
/// element never stalls the forwarding path. When the queue is full new
/// samples are dropped.
pub struct Recorder {
    id: SenderId,
    stream_id: StreamId,
    kind: TrackKind,
    source: Weak<Receiver>,
    pipeline: Mutex<Pipeline>,
    queue: Mutex<Option<mpsc::Sender<Sample>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    stats: Arc<SenderCounters>,
}

impl Recorder {
    /// Recorder for `source` feeding `element`. The caller subscribes it.
    pub fn new(source: &Arc<Receiver>, element: Arc<dyn Element>) -> Result<Arc<Self>> {
        let info = source.info();
        let clock_rate = info.codec.clock_rate;
        let builder = Builder::new(&info.codec.mime_type, clock_rate)?;

        let id = SenderId::new();
        let stats = Arc::new(SenderCounters::default());
        let (tx, rx) = mpsc::channel(SAMPLE_QUEUE_CAPACITY);
        let writer = tokio::spawn(write_samples(id, element, rx, Arc::clone(&stats)));

        Ok(Arc::new(Self {
            id,
            stream_id: info.stream_id.clone(),
            kind: info.kind,
            source: Arc::downgrade(source),
            pipeline: Mutex::new(Pipeline {
                builder,
                clock_rate,
                first_timestamp: None,
            }),
            queue: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            stats,
        }))
    }
}

/// Feed queued samples to `element` until the queue closes or the element
/// does
async fn write_samples(
    id: SenderId,
    element: Arc<dyn Element>,
    mut samples: mpsc::Receiver<Sample>,
    stats: Arc<SenderCounters>,
) {
    while let Some(sample) = samples.recv().await {
        if let Err(e) = element.write(&sample).await {
            if e.is_closed() {
                debug!(sender_id = %id, "Element closed, stopping recorder");
                break;
            }
            stats.record_drop();
            warn!(sender_id = %id, stream_id = %sample.stream_id, error = %e, "Element write failed");
        }
    }
}

#[async_trait]
impl Sender for Recorder {
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

        let samples: Vec<Sample> = {
            let mut pipeline = self.pipeline.lock();
            pipeline.builder.push(packet.clone());
            let mut samples = Vec::new();
            while let Some(sample) = pipeline.builder.pop() {
                let timestamp = pipeline.timestamp(sample.packet_timestamp);
                samples.push(Sample::new(
                    self.stream_id.clone(),
                    self.kind,
                    timestamp,
                    sample.data,
                ));
            }
            samples
        };
        self.stats.record_sent(packet);

        let Some(queue) = self.queue.lock().clone() else {
            return Err(Error::SenderClosed);
        };
        for sample in samples {
            match queue.try_send(sample) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.stats.record_drop();
                    debug!(sender_id = %self.id, "Sample queue full, dropping sample");
                }
                Err(TrySendError::Closed(_)) => {
                    drop(queue);
                    self.close().await?;
                    return Err(Error::ElementClosed);
                }
            }
        }
        Ok(())
    }

    async fn write_retransmission(&self, _packet: &Packet) -> Result<()> {
        Ok(())
    }

    fn resolve_nack(&self, _sequence_number: u16) -> Option<(Arc<Receiver>, u16)> {
        None
    }

    fn keyframe_source(&self) -> Option<Arc<Receiver>> {
        self.source.upgrade()
    }

    async fn source_closed(&self, _track: &TrackId) {
        if let Err(e) = self.close().await {
            debug!(sender_id = %self.id, error = %e, "Failed to close recorder");
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(source) = self.source.upgrade() {
            source.unsubscribe(&self.id);
        }

        // Dropping the queue lets the writer drain what is left and exit
        self.queue.lock().take();
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                warn!(sender_id = %self.id, error = %e, "Recorder writer task failed");
            }
        }
        debug!(sender_id = %self.id, stream_id = %self.stream_id, "Recorder closed");
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
    use crate::receiver::tests::{receiver, video_info};
    use bytes::Bytes;
    use futures::stream::{self, BoxStream, StreamExt};
    use webrtc::rtp::header::Header;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    #[derive(Default)]
    struct Collect {
        samples: Mutex<Vec<Sample>>,
    }

    #[async_trait]
    impl Element for Collect {
        async fn write(&self, sample: &Sample) -> Result<()> {
            self.samples.lock().push(sample.clone());
            Ok(())
        }

        fn read(&self) -> BoxStream<'static, Sample> {
            stream::empty().boxed()
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn opus(seq: u16, timestamp: u32) -> Packet {
        Packet {
            header: Header {
                version: 2,
                sequence_number: seq,
                timestamp,
                marker: true,
                ..Default::default()
            },
            payload: Bytes::from(vec![0xFC, seq as u8]),
        }
    }

    /// Element that takes longer per sample than a forwarding write may
    struct Slow {
        inner: Collect,
    }

    #[async_trait]
    impl Element for Slow {
        async fn write(&self, sample: &Sample) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.write(sample).await
        }

        fn read(&self) -> BoxStream<'static, Sample> {
            stream::empty().boxed()
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Element that is already closed
    struct Closed;

    #[async_trait]
    impl Element for Closed {
        async fn write(&self, _sample: &Sample) -> Result<()> {
            Err(Error::ElementClosed)
        }

        fn read(&self) -> BoxStream<'static, Sample> {
            stream::empty().boxed()
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn mic() -> (Arc<Receiver>, tokio::sync::mpsc::Receiver<crate::receiver::RtcpBatch>) {
        let mut info = video_info("mic");
        info.kind = TrackKind::Audio;
        info.codec = RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        };
        receiver(info)
    }

    #[tokio::test]
    async fn test_depacketizes_into_samples() {
        let (source, _rx) = mic();
        let element = Arc::new(Collect::default());
        let recorder = Recorder::new(&source, element.clone()).unwrap();

        for (i, seq) in (1..=4u16).enumerate() {
            recorder.write(None, &opus(seq, 960 * i as u32)).await.unwrap();
        }
        recorder.close().await.unwrap();

        let samples = element.samples.lock().clone();
        assert!(samples.len() >= 2);
        assert_eq!(samples[0].timestamp, Duration::ZERO);
        assert_eq!(samples[1].timestamp, Duration::from_millis(20));
        assert_eq!(samples[0].kind, TrackKind::Audio);
        assert_eq!(samples[0].stream_id, StreamId::from("stream"));
        assert_eq!(recorder.stats().packets_sent, 4);
    }

    #[tokio::test]
    async fn test_slow_element_does_not_stall_forwarding() {
        let (source, _rx) = mic();
        let element = Arc::new(Slow {
            inner: Collect::default(),
        });
        let recorder = Recorder::new(&source, element.clone()).unwrap();
        source
            .subscribe(Arc::clone(&recorder) as Arc<dyn Sender>)
            .unwrap();

        for (i, seq) in (1..=6u16).enumerate() {
            source.push_rtp(opus(seq, 960 * i as u32)).await;
        }
        assert_eq!(source.stats().writes_timed_out, 0);
        assert_eq!(recorder.stats().packets_sent, 6);

        // Close waits for queued samples to reach the element
        recorder.close().await.unwrap();
        let samples = element.inner.samples.lock().clone();
        assert!(samples.len() >= 4);
        assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(recorder.stats().packets_dropped, 0);
        assert_eq!(source.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_element_closes_recorder() {
        let (source, _rx) = mic();
        let recorder = Recorder::new(&source, Arc::new(Closed)).unwrap();

        for (i, seq) in (1..=3u16).enumerate() {
            let _ = recorder.write(None, &opus(seq, 960 * i as u32)).await;
        }
        // The writer task stops after the first failed sample
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = recorder.write(None, &opus(4, 960 * 3)).await;
        assert!(matches!(
            result,
            Err(Error::ElementClosed | Error::SenderClosed)
        ));
        assert!(recorder.is_closed());
    }

    #[tokio::test]
    async fn test_unsupported_codec() {
        let mut info = video_info("cam");
        info.codec.mime_type = "video/AV1X".to_string();
        let (source, _rx) = receiver(info);
        assert!(matches!(
            Recorder::new(&source, Arc::new(Collect::default())),
            Err(Error::UnsupportedCodec(_))
        ));
    }
}
