//! Per-transport dispatcher
//!
//! The router owns the receivers of everything its transport publishes,
//! runs their packet-receive loops, and relays RTCP feedback from the
//! transport's subscribers back to the publishing receivers.

use crate::config::SfuConfig;
use crate::receiver::{Receiver, RtcpBatch};
use crate::sender::Sender;
use crate::track::TrackInfo;
use crate::types::{TrackId, TransportId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::sdp::description::session::SessionDescription;
use webrtc::track::track_remote::TrackRemote;

pub const ABS_SEND_TIME_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";
pub const TRANSPORT_CC_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";
pub const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";

/// Negotiated RTP header extension ids the forwarding path cares about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtMap {
    pub abs_send_time: Option<u8>,
    pub transport_cc: Option<u8>,
    pub audio_level: Option<u8>,
}

impl ExtMap {
    /// Collect `a=extmap` ids from session and media sections
    #[must_use]
    pub fn from_description(description: &SessionDescription) -> Self {
        let session = description.attributes.iter();
        let media = description
            .media_descriptions
            .iter()
            .flat_map(|m| m.attributes.iter());

        let mut map = Self::default();
        for attr in session.chain(media).filter(|a| a.key == "extmap") {
            let Some((id, uri)) = attr.value.as_deref().and_then(parse_extmap) else {
                continue;
            };
            match uri {
                ABS_SEND_TIME_URI => map.abs_send_time = Some(id),
                TRANSPORT_CC_URI => map.transport_cc = Some(id),
                AUDIO_LEVEL_URI => map.audio_level = Some(id),
                _ => {}
            }
        }
        map
    }
}

/// `<id>[/<direction>] <uri> [<attributes>]`
fn parse_extmap(value: &str) -> Option<(u8, &str)> {
    let mut parts = value.split_whitespace();
    let id = parts.next()?.split('/').next()?.parse().ok()?;
    let uri = parts.next()?;
    Some((id, uri))
}

pub struct Router {
    id: TransportId,
    config: SfuConfig,
    receivers: Mutex<HashMap<TrackId, Arc<Receiver>>>,
    ext_map: RwLock<ExtMap>,
    feedback_tx: mpsc::Sender<RtcpBatch>,
    feedback_rx: Mutex<Option<mpsc::Receiver<RtcpBatch>>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    closed: AtomicBool,
}

impl Router {
    /// Create a router whose tasks run on `tasks` until `cancel` fires
    pub fn new(
        id: TransportId,
        config: SfuConfig,
        cancel: CancellationToken,
        tasks: TaskTracker,
    ) -> Arc<Self> {
        let (feedback_tx, feedback_rx) = mpsc::channel(config.rtcp_channel_capacity.max(1));
        let router = Arc::new(Self {
            id,
            config,
            receivers: Mutex::new(HashMap::new()),
            ext_map: RwLock::new(ExtMap::default()),
            feedback_tx,
            feedback_rx: Mutex::new(Some(feedback_rx)),
            cancel,
            tasks,
            closed: AtomicBool::new(false),
        });

        if let Some(period) = router.config.keyframe_interval() {
            let weak = Arc::downgrade(&router);
            let cancel = router.cancel.clone();
            router.tasks.spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(router) = weak.upgrade() else { break };
                            router.request_keyframes();
                        }
                    }
                }
            });
        }

        router
    }

    #[must_use]
    pub const fn id(&self) -> &TransportId {
        &self.id
    }

    /// Receiver for `info`, creating it if needed.
    ///
    /// Returns the receiver and whether it was created by this call.
    pub fn add_receiver(&self, info: TrackInfo) -> (Arc<Receiver>, bool) {
        let key = info.key();
        let mut receivers = self.receivers.lock();
        if let Some(existing) = receivers.get(&key) {
            return (Arc::clone(existing), false);
        }

        let receiver = Arc::new(Receiver::new(info, &self.config, self.feedback_tx.clone()));
        receivers.insert(key, Arc::clone(&receiver));
        (receiver, true)
    }

    #[must_use]
    pub fn get_receiver(&self, track_id: &TrackId) -> Option<Arc<Receiver>> {
        self.receivers.lock().get(track_id).cloned()
    }

    /// Snapshot of all receivers
    #[must_use]
    pub fn receivers(&self) -> Vec<Arc<Receiver>> {
        self.receivers.lock().values().cloned().collect()
    }

    fn remove_receiver(&self, receiver: &Arc<Receiver>) {
        let mut receivers = self.receivers.lock();
        let key = receiver.key();
        if receivers.get(&key).is_some_and(|r| Arc::ptr_eq(r, receiver)) {
            receivers.remove(&key);
        }
    }

    /// Replace the extension id map with the one negotiated in `description`
    pub fn set_ext_map(&self, description: &SessionDescription) {
        let map = ExtMap::from_description(description);
        debug!(transport_id = %self.id, ext_map = ?map, "Header extension map updated");
        *self.ext_map.write() = map;
    }

    #[must_use]
    pub fn ext_map(&self) -> ExtMap {
        *self.ext_map.read()
    }

    /// Feedback queue toward the publisher; can be taken once
    pub fn take_feedback(&self) -> Option<mpsc::Receiver<RtcpBatch>> {
        self.feedback_rx.lock().take()
    }

    /// Pump packets from `track` into `receiver` until the track ends or
    /// the router closes. The receiver is closed and dropped afterwards.
    pub fn spawn_forwarding(self: &Arc<Self>, track: Arc<TrackRemote>, receiver: Arc<Receiver>) {
        let router: Weak<Self> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let audio_level = if receiver.info().is_audio() {
            self.ext_map().audio_level
        } else {
            None
        };
        let transport_id = self.id.clone();

        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    result = track.read_rtp() => match result {
                        Ok((packet, _)) => {
                            if let Some(id) = audio_level {
                                receiver.record_audio_level(&packet, id);
                            }
                            receiver.push_rtp(packet).await;
                        }
                        Err(e) => {
                            debug!(
                                transport_id = %transport_id,
                                track_id = %receiver.info().id,
                                error = %e,
                                "Inbound track ended"
                            );
                            break;
                        }
                    }
                }
            }

            receiver.close().await;
            if let Some(router) = router.upgrade() {
                router.remove_receiver(&receiver);
            }
        });
    }

    /// Relay RTCP arriving on an outbound track back to `sender`'s sources
    pub fn spawn_rtcp_reader(&self, rtp_sender: Arc<RTCRtpSender>, sender: Arc<dyn Sender>) {
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    result = rtp_sender.read_rtcp() => match result {
                        Ok((packets, _)) => relay_feedback(sender.as_ref(), &packets).await,
                        Err(e) => {
                            debug!(sender_id = %sender.id(), error = %e, "RTCP reader stopped");
                            break;
                        }
                    }
                }
                if sender.is_closed() {
                    break;
                }
            }
        });
    }

    /// Periodic keyframe request to every subscribed video receiver
    fn request_keyframes(&self) {
        for receiver in self.receivers() {
            if receiver.info().is_video() && receiver.subscriber_count() > 0 {
                receiver.request_keyframe();
            }
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the receive loops and close every receiver. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.cancel.cancel();
        let receivers: Vec<_> = self.receivers.lock().drain().map(|(_, r)| r).collect();
        for receiver in &receivers {
            receiver.close().await;
        }
        info!(
            transport_id = %self.id,
            receivers = receivers.len(),
            "Router closed"
        );
    }
}

/// Act on subscriber feedback for `sender`.
///
/// PLI and FIR become a keyframe request on the active source; NACKs are
/// served from the source's retention buffer. Everything else is ignored.
pub async fn relay_feedback(sender: &dyn Sender, packets: &[Box<dyn RtcpPacket + Send + Sync>]) {
    let mut keyframe = false;
    let mut nacks: HashMap<TrackId, (Arc<Receiver>, Vec<u16>)> = HashMap::new();

    for packet in packets {
        let any = packet.as_any();
        if any.is::<PictureLossIndication>() || any.is::<FullIntraRequest>() {
            keyframe = true;
        } else if let Some(nack) = any.downcast_ref::<TransportLayerNack>() {
            for seq in nack.nacks.iter().flat_map(nack_sequences) {
                if let Some((receiver, source_seq)) = sender.resolve_nack(seq) {
                    nacks
                        .entry(receiver.key())
                        .or_insert_with(|| (receiver, Vec::new()))
                        .1
                        .push(source_seq);
                }
            }
        }
    }

    if keyframe {
        if let Some(source) = sender.keyframe_source() {
            source.request_keyframe();
        }
    }
    for (receiver, seqs) in nacks.into_values() {
        let sent = receiver.retransmit(&seqs, sender).await;
        debug!(
            sender_id = %sender.id(),
            requested = seqs.len(),
            sent,
            "Served NACK"
        );
    }
}

/// Sequence numbers named by one NACK pair
fn nack_sequences(pair: &NackPair) -> impl Iterator<Item = u16> {
    let first = pair.packet_id;
    let lost = pair.lost_packets;
    std::iter::once(first).chain(
        (0..16u16)
            .filter(move |i| lost & (1 << i) != 0)
            .map(move |i| first.wrapping_add(i + 1)),
    )
}
