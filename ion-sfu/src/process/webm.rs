//! WebM muxing element
//!
//! Writes an EBML header, an unknown-size Segment with Info and Tracks
//! (VP8 video as track 1, Opus audio as track 2) and unknown-size Clusters
//! of SimpleBlocks. Recording starts on the first VP8 keyframe; the frame
//! dimensions are taken from it.

use super::{Element, Sample};
use crate::error::{Error, Result};
use crate::track::TrackKind;
use crate::types::StreamId;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info};

const EBML: u32 = 0x1A45_DFA3;
const EBML_VERSION: u32 = 0x4286;
const EBML_READ_VERSION: u32 = 0x42F7;
const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
const DOC_TYPE: u32 = 0x4282;
const DOC_TYPE_VERSION: u32 = 0x4287;
const DOC_TYPE_READ_VERSION: u32 = 0x4285;

const SEGMENT: u32 = 0x1853_8067;
const INFO: u32 = 0x1549_A966;
const TIMECODE_SCALE: u32 = 0x2A_D7B1;
const MUXING_APP: u32 = 0x4D80;
const WRITING_APP: u32 = 0x5741;

const TRACKS: u32 = 0x1654_AE6B;
const TRACK_ENTRY: u32 = 0xAE;
const TRACK_NUMBER: u32 = 0xD7;
const TRACK_UID: u32 = 0x73C5;
const TRACK_TYPE: u32 = 0x83;
const CODEC_ID: u32 = 0x86;
const CODEC_PRIVATE: u32 = 0x63A2;
const VIDEO: u32 = 0xE0;
const PIXEL_WIDTH: u32 = 0xB0;
const PIXEL_HEIGHT: u32 = 0xBA;
const AUDIO: u32 = 0xE1;
const SAMPLING_FREQUENCY: u32 = 0xB5;
const CHANNELS: u32 = 0x9F;

const CLUSTER: u32 = 0x1F43_B675;
const TIMECODE: u32 = 0xE7;
const SIMPLE_BLOCK: u32 = 0xA3;

const UNKNOWN_SIZE: [u8; 8] = [0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

const VIDEO_TRACK: u8 = 1;
const AUDIO_TRACK: u8 = 2;
const OPUS_SAMPLE_RATE: u32 = 48_000;
const OPUS_CHANNELS: u8 = 2;
const OPUS_PRE_SKIP: u16 = 312;

const APP_NAME: &str = "ion-sfu";

fn put_id(buf: &mut BytesMut, id: u32) {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(3);
    buf.put_slice(&bytes[skip..]);
}

/// Variable-length size with the shortest encoding
fn put_size(buf: &mut BytesMut, size: u64) {
    let mut len = 1;
    // all-ones values are reserved for "unknown"
    while len < 8 && size >= (1u64 << (7 * len)) - 1 {
        len += 1;
    }
    let marked = size | (1u64 << (7 * len));
    buf.put_slice(&marked.to_be_bytes()[8 - len..]);
}

fn put_element(buf: &mut BytesMut, id: u32, body: &[u8]) {
    put_id(buf, id);
    put_size(buf, body.len() as u64);
    buf.put_slice(body);
}

fn put_uint(buf: &mut BytesMut, id: u32, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    put_element(buf, id, &bytes[skip..]);
}

fn put_float(buf: &mut BytesMut, id: u32, value: f64) {
    put_element(buf, id, &value.to_be_bytes());
}

fn put_str(buf: &mut BytesMut, id: u32, value: &str) {
    put_element(buf, id, value.as_bytes());
}

fn put_master(buf: &mut BytesMut, id: u32, body: impl FnOnce(&mut BytesMut)) {
    let mut inner = BytesMut::new();
    body(&mut inner);
    put_element(buf, id, &inner);
}

/// `OpusHead` identification header used as the Opus CodecPrivate
fn opus_head() -> BytesMut {
    let mut head = BytesMut::with_capacity(19);
    head.put_slice(b"OpusHead");
    head.put_u8(1);
    head.put_u8(OPUS_CHANNELS);
    head.put_u16_le(OPUS_PRE_SKIP);
    head.put_u32_le(OPUS_SAMPLE_RATE);
    head.put_u16_le(0);
    head.put_u8(0);
    head
}

fn header(width: u16, height: u16) -> BytesMut {
    let mut buf = BytesMut::new();
    put_master(&mut buf, EBML, |b| {
        put_uint(b, EBML_VERSION, 1);
        put_uint(b, EBML_READ_VERSION, 1);
        put_uint(b, EBML_MAX_ID_LENGTH, 4);
        put_uint(b, EBML_MAX_SIZE_LENGTH, 8);
        put_str(b, DOC_TYPE, "webm");
        put_uint(b, DOC_TYPE_VERSION, 2);
        put_uint(b, DOC_TYPE_READ_VERSION, 2);
    });

    put_id(&mut buf, SEGMENT);
    buf.put_slice(&UNKNOWN_SIZE);
    put_master(&mut buf, INFO, |b| {
        put_uint(b, TIMECODE_SCALE, 1_000_000);
        put_str(b, MUXING_APP, APP_NAME);
        put_str(b, WRITING_APP, APP_NAME);
    });
    put_master(&mut buf, TRACKS, |b| {
        put_master(b, TRACK_ENTRY, |t| {
            put_uint(t, TRACK_NUMBER, u64::from(VIDEO_TRACK));
            put_uint(t, TRACK_UID, u64::from(VIDEO_TRACK));
            put_str(t, CODEC_ID, "V_VP8");
            put_uint(t, TRACK_TYPE, 1);
            put_master(t, VIDEO, |v| {
                put_uint(v, PIXEL_WIDTH, u64::from(width));
                put_uint(v, PIXEL_HEIGHT, u64::from(height));
            });
        });
        put_master(b, TRACK_ENTRY, |t| {
            put_uint(t, TRACK_NUMBER, u64::from(AUDIO_TRACK));
            put_uint(t, TRACK_UID, u64::from(AUDIO_TRACK));
            put_str(t, CODEC_ID, "A_OPUS");
            put_uint(t, TRACK_TYPE, 2);
            put_element(t, CODEC_PRIVATE, &opus_head());
            put_master(t, AUDIO, |a| {
                put_float(a, SAMPLING_FREQUENCY, f64::from(OPUS_SAMPLE_RATE));
                put_uint(a, CHANNELS, u64::from(OPUS_CHANNELS));
            });
        });
    });
    buf
}

/// Dimensions of a VP8 keyframe, `None` for interframes
fn vp8_keyframe_dimensions(frame: &[u8]) -> Option<(u16, u16)> {
    // frame tag (3 bytes), start code 9d 01 2a, width, height
    if frame.len() < 10 || frame[0] & 0x01 != 0 || frame[3..6] != [0x9d, 0x01, 0x2a] {
        return None;
    }
    let width = u16::from_le_bytes([frame[6], frame[7]]) & 0x3FFF;
    let height = u16::from_le_bytes([frame[8], frame[9]]) & 0x3FFF;
    Some((width, height))
}

/// File name for a stream id; anything outside `[A-Za-z0-9._-]` is replaced
fn file_name(stream_id: &StreamId) -> String {
    let name: String = stream_id
        .as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.webm", name.trim_start_matches('.'))
}

#[derive(Default)]
struct MuxState {
    file: Option<BufWriter<File>>,
    /// Timecode (ms) of the open cluster
    cluster: Option<i64>,
    blocks: u64,
}

pub struct WebmSaver {
    stream_id: StreamId,
    path: PathBuf,
    state: Mutex<MuxState>,
    closed: AtomicBool,
}

impl WebmSaver {
    /// Saver writing `<output_dir>/<stream_id>.webm`
    pub fn new(stream_id: StreamId, output_dir: &Path) -> Self {
        let path = output_dir.join(file_name(&stream_id));
        Self {
            stream_id,
            path,
            state: Mutex::new(MuxState::default()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_block(
        state: &mut MuxState,
        track: u8,
        timecode: i64,
        keyframe: bool,
        frame: &[u8],
    ) -> Result<()> {
        let mut buf = BytesMut::with_capacity(frame.len() + 32);

        let relative = state.cluster.map(|start| timecode - start);
        let fits = relative.is_some_and(|r| i16::try_from(r).is_ok());
        let new_cluster = !fits || (track == VIDEO_TRACK && keyframe);
        let relative = if new_cluster {
            put_id(&mut buf, CLUSTER);
            buf.put_slice(&UNKNOWN_SIZE);
            put_uint(&mut buf, TIMECODE, u64::try_from(timecode).unwrap_or(0));
            0
        } else {
            relative.and_then(|r| i16::try_from(r).ok()).unwrap_or(0)
        };

        put_id(&mut buf, SIMPLE_BLOCK);
        put_size(&mut buf, frame.len() as u64 + 4);
        buf.put_u8(0x80 | track);
        buf.put_i16(relative);
        buf.put_u8(if keyframe { 0x80 } else { 0x00 });
        buf.put_slice(frame);

        let Some(file) = state.file.as_mut() else {
            return Ok(());
        };
        file.write_all(&buf).await?;
        // Only a cluster that reached the file may anchor later blocks
        if new_cluster {
            state.cluster = Some(timecode);
        }
        state.blocks += 1;
        Ok(())
    }
}

#[async_trait]
impl Element for WebmSaver {
    async fn write(&self, sample: &Sample) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ElementClosed);
        }

        let mut state = self.state.lock().await;
        let timecode = i64::try_from(sample.timestamp.as_millis()).unwrap_or(i64::MAX);
        match sample.kind {
            TrackKind::Video => {
                let dimensions = vp8_keyframe_dimensions(&sample.payload);
                if state.file.is_none() {
                    let Some((width, height)) = dimensions else {
                        return Ok(());
                    };
                    let mut file = BufWriter::new(File::create(&self.path).await?);
                    file.write_all(&header(width, height)).await?;
                    state.file = Some(file);
                    info!(
                        stream_id = %self.stream_id,
                        path = %self.path.display(),
                        width,
                        height,
                        "Recording started"
                    );
                }
                let keyframe = dimensions.is_some();
                Self::write_block(&mut state, VIDEO_TRACK, timecode, keyframe, &sample.payload).await
            }
            TrackKind::Audio => {
                if state.file.is_none() {
                    return Ok(());
                }
                Self::write_block(&mut state, AUDIO_TRACK, timecode, true, &sample.payload).await
            }
        }
    }

    fn read(&self) -> BoxStream<'static, Sample> {
        stream::empty().boxed()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if let Some(mut file) = state.file.take() {
            file.flush().await?;
            file.shutdown().await?;
            debug!(stream_id = %self.stream_id, blocks = state.blocks, "Recording closed");
        }
        Ok(())
    }
}
