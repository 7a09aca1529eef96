//! Track metadata shared by receivers and senders
//!
//! - Track kind (audio/video)
//! - Simulcast quality layers and RID mapping
//! - The negotiated description of an inbound track

use crate::types::{StreamId, TrackId};
use serde::{Deserialize, Serialize};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_remote::TrackRemote;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// Simulcast quality layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLayer {
    Low,
    Medium,
    High,
}

impl QualityLayer {
    /// Select quality layer based on available bandwidth (kbps).
    ///
    /// This is the hook where an externally computed estimate picks a layer.
    #[must_use]
    pub const fn from_bandwidth(bandwidth_kbps: u32) -> Self {
        if bandwidth_kbps >= 2000 {
            Self::High
        } else if bandwidth_kbps >= 1000 {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// Parse the restriction identifier a publisher used for this layer
    #[must_use]
    pub fn from_rid(rid: &str) -> Option<Self> {
        match rid {
            "h" | "f" | "high" | "full" => Some(Self::High),
            "m" | "half" | "medium" | "mid" => Some(Self::Medium),
            "l" | "q" | "low" | "quarter" => Some(Self::Low),
            _ => None,
        }
    }

    /// Get the RID (restriction identifier) for this layer
    #[must_use]
    pub const fn rid(&self) -> &'static str {
        match self {
            Self::High => "h",
            Self::Medium => "m",
            Self::Low => "l",
        }
    }
}

/// Everything the SFU needs to know about an inbound track
#[derive(Debug, Clone)]
pub struct TrackInfo {
    /// Track identifier as announced by the publisher
    pub id: TrackId,
    /// Stream the track belongs to
    pub stream_id: StreamId,
    /// Raw RID for simulcast layers
    pub rid: Option<String>,
    /// Quality layer for recognised simulcast RIDs
    pub layer: Option<QualityLayer>,
    pub kind: TrackKind,
    pub ssrc: u32,
    pub codec: RTCRtpCodecCapability,
}

impl TrackInfo {
    /// Describe a plain (non-simulcast) track
    pub fn new(
        id: impl Into<TrackId>,
        stream_id: impl Into<StreamId>,
        kind: TrackKind,
        ssrc: u32,
        codec: RTCRtpCodecCapability,
    ) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            rid: None,
            layer: None,
            kind,
            ssrc,
            codec,
        }
    }

    /// Mark this track as one simulcast layer of `id`
    #[must_use]
    pub fn with_rid(mut self, rid: impl Into<String>) -> Self {
        let rid = rid.into();
        self.layer = QualityLayer::from_rid(&rid);
        self.rid = Some(rid);
        self
    }

    /// Describe a track signalled by the negotiation engine
    #[must_use]
    pub fn from_remote(track: &TrackRemote) -> Self {
        let info = Self::new(
            TrackId::new(track.id()),
            StreamId::new(track.stream_id()),
            TrackKind::from(track.kind()),
            track.ssrc(),
            track.codec().capability,
        );
        let rid = track.rid().to_string();
        if rid.is_empty() {
            info
        } else {
            info.with_rid(rid)
        }
    }

    /// Router key: unique per track and simulcast layer
    #[must_use]
    pub fn key(&self) -> TrackId {
        match &self.rid {
            Some(rid) => TrackId::new(format!("{}:{rid}", self.id)),
            None => self.id.clone(),
        }
    }

    #[must_use]
    pub fn mime_type(&self) -> &str {
        &self.codec.mime_type
    }

    #[must_use]
    pub fn is_video(&self) -> bool {
        self.kind == TrackKind::Video
    }

    #[must_use]
    pub fn is_audio(&self) -> bool {
        self.kind == TrackKind::Audio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_from_bandwidth() {
        assert_eq!(QualityLayer::from_bandwidth(3000), QualityLayer::High);
        assert_eq!(QualityLayer::from_bandwidth(1500), QualityLayer::Medium);
        assert_eq!(QualityLayer::from_bandwidth(200), QualityLayer::Low);
    }

    #[test]
    fn test_layer_rid_mapping() {
        for layer in [QualityLayer::Low, QualityLayer::Medium, QualityLayer::High] {
            assert_eq!(QualityLayer::from_rid(layer.rid()), Some(layer));
        }
        assert_eq!(QualityLayer::from_rid("f"), Some(QualityLayer::High));
        assert_eq!(QualityLayer::from_rid("q"), Some(QualityLayer::Low));
        assert_eq!(QualityLayer::from_rid("x"), None);
        assert!(QualityLayer::High > QualityLayer::Low);
    }

    #[test]
    fn test_track_key() {
        let codec = RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            ..Default::default()
        };
        let plain = TrackInfo::new("cam", "stream", TrackKind::Video, 1, codec.clone());
        assert_eq!(plain.key(), TrackId::from("cam"));
        assert!(plain.layer.is_none());

        let layered = TrackInfo::new("cam", "stream", TrackKind::Video, 2, codec).with_rid("h");
        assert_eq!(layered.key(), TrackId::from("cam:h"));
        assert_eq!(layered.layer, Some(QualityLayer::High));
        assert_eq!(layered.id, TrackId::from("cam"));
    }
}
