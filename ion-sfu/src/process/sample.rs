use crate::track::TrackKind;
use crate::types::StreamId;
use bytes::Bytes;
use std::time::Duration;

/// One depacketized media frame handed to elements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub stream_id: StreamId,
    pub kind: TrackKind,
    /// Presentation time relative to the first sample of the track
    pub timestamp: Duration,
    pub payload: Bytes,
}

impl Sample {
    pub fn new(
        stream_id: impl Into<StreamId>,
        kind: TrackKind,
        timestamp: Duration,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            kind,
            timestamp,
            payload: payload.into(),
        }
    }
}
