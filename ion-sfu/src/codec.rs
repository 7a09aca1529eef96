//! Codec helpers for the forwarding path
//!
//! Only the information needed for layer switching is extracted: whether an
//! RTP payload starts a frame a decoder can resume from.

use bytes::Bytes;
use webrtc::rtp::codecs::vp8::Vp8Packet;
use webrtc::rtp::codecs::vp9::Vp9Packet;
use webrtc::rtp::packetizer::Depacketizer;

pub const MIME_TYPE_VP8: &str = "video/vp8";
pub const MIME_TYPE_VP9: &str = "video/vp9";
pub const MIME_TYPE_H264: &str = "video/h264";
pub const MIME_TYPE_OPUS: &str = "audio/opus";

const H264_NALU_IDR: u8 = 5;
const H264_NALU_SPS: u8 = 7;
const H264_NALU_STAP_A: u8 = 24;
const H264_NALU_FU_A: u8 = 28;

/// Whether `payload` carries the start of a keyframe for `mime_type`.
///
/// Audio payloads are always independently decodable. Unknown video codecs
/// never report a keyframe.
#[must_use]
pub fn is_keyframe(mime_type: &str, payload: &Bytes) -> bool {
    let mime = mime_type.to_ascii_lowercase();
    match mime.as_str() {
        MIME_TYPE_VP8 => is_vp8_keyframe(payload),
        MIME_TYPE_VP9 => is_vp9_keyframe(payload),
        MIME_TYPE_H264 => is_h264_keyframe(payload),
        m => m.starts_with("audio/"),
    }
}

fn is_vp8_keyframe(payload: &Bytes) -> bool {
    let mut vp8 = Vp8Packet::default();
    let Ok(frame) = vp8.depacketize(payload) else {
        return false;
    };
    // first partition of the frame, P bit clear
    vp8.s == 1 && vp8.pid == 0 && frame.first().is_some_and(|b| b & 0x01 == 0)
}

fn is_vp9_keyframe(payload: &Bytes) -> bool {
    let mut vp9 = Vp9Packet::default();
    if vp9.depacketize(payload).is_err() {
        return false;
    }
    vp9.b && !vp9.p
}

fn is_h264_keyframe(payload: &Bytes) -> bool {
    let Some(&header) = payload.first() else {
        return false;
    };
    match header & 0x1F {
        H264_NALU_IDR | H264_NALU_SPS => true,
        H264_NALU_STAP_A => {
            // [hdr][size u16][nalu]...
            let mut offset = 1;
            while offset + 2 < payload.len() {
                let size = usize::from(u16::from_be_bytes([payload[offset], payload[offset + 1]]));
                let nalu_type = payload[offset + 2] & 0x1F;
                if nalu_type == H264_NALU_IDR || nalu_type == H264_NALU_SPS {
                    return true;
                }
                offset += 2 + size;
            }
            false
        }
        H264_NALU_FU_A => payload
            .get(1)
            .is_some_and(|fu| fu & 0x80 != 0 && (fu & 0x1F) == H264_NALU_IDR),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// VP8 payload descriptor (S=1, PID=0) followed by a frame header byte
    fn vp8_payload(key: bool) -> Bytes {
        let frame_tag = if key { 0x10 } else { 0x11 };
        Bytes::from(vec![0x10, frame_tag, 0x02, 0x00, 0x9d, 0x01, 0x2a])
    }

    #[test]
    fn test_vp8_keyframe() {
        assert!(is_keyframe("video/VP8", &vp8_payload(true)));
        assert!(!is_keyframe("video/VP8", &vp8_payload(false)));
        // continuation packet (S=0) of a keyframe
        let cont = Bytes::from(vec![0x00, 0x10, 0x02]);
        assert!(!is_keyframe("video/VP8", &cont));
        assert!(!is_keyframe("video/VP8", &Bytes::new()));
    }

    #[test]
    fn test_h264_keyframe() {
        assert!(is_keyframe("video/H264", &Bytes::from_static(&[0x65, 0x88])));
        assert!(!is_keyframe("video/H264", &Bytes::from_static(&[0x41, 0x9a])));
        // STAP-A carrying SPS
        assert!(is_keyframe(
            "video/H264",
            &Bytes::from_static(&[0x78, 0x00, 0x02, 0x67, 0x42])
        ));
        // FU-A start of an IDR slice
        assert!(is_keyframe("video/H264", &Bytes::from_static(&[0x7c, 0x85, 0x00])));
        // FU-A middle fragment
        assert!(!is_keyframe("video/H264", &Bytes::from_static(&[0x7c, 0x05, 0x00])));
    }

    #[test]
    fn test_audio_always_decodable() {
        assert!(is_keyframe("audio/opus", &Bytes::from_static(&[0xfc])));
        assert!(!is_keyframe("video/AV2", &Bytes::from_static(&[0x00])));
    }
}
