//! WebRTC transport: one peer's connection inside a session
//!
//! A transport wraps a peer connection and owns:
//! - a [`Router`] with the receivers of everything the peer publishes
//! - the senders forwarding other peers' tracks to it, grouped by stream
//! - the elements attached to its published streams
//!
//! Negotiation is delegated to the peer connection; the transport only
//! adds the bookkeeping the forwarding path needs.

use crate::config::{Config, ElementsConfig, SfuConfig};
use crate::error::{Error, Result};
use crate::process::{get_element, Element, Recorder};
use crate::receiver::Receiver;
use crate::router::Router;
use crate::sender::{RtpWriter, Sender, SimpleSender, SimulcastSender};
use crate::session::Session;
use crate::track::TrackInfo;
use crate::types::{StreamId, TrackId, TransportId};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::sdp::description::session::SessionDescription;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

/// Observer of new inbound tracks
type TrackHandler = Arc<dyn Fn(&Arc<TrackRemote>, &Arc<Receiver>) + Send + Sync>;

pub struct WebRtcTransport {
    id: TransportId,
    pc: Arc<RTCPeerConnection>,
    router: Arc<Router>,
    session: Arc<Session>,
    elements_config: ElementsConfig,
    /// Outbound senders by stream, in insertion order
    senders: Mutex<HashMap<StreamId, Vec<Arc<dyn Sender>>>>,
    /// Simulcast senders by track, so later layers join the same sender
    simulcast: Mutex<HashMap<TrackId, Arc<SimulcastSender>>>,
    elements: Mutex<Vec<Arc<dyn Element>>>,
    /// Receivers this transport is subscribed to, by router key.
    /// The async lock also serializes subscription.
    subscriptions: tokio::sync::Mutex<HashMap<TrackId, Weak<Receiver>>>,
    on_track: RwLock<Option<TrackHandler>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl WebRtcTransport {
    /// Create a transport with a new peer connection and register it with
    /// `session`
    pub async fn new(
        id: TransportId,
        session: Arc<Session>,
        api: &API,
        rtc_config: RTCConfiguration,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let router = Router::new(id.clone(), config.sfu.clone(), cancel.clone(), tasks.clone());

        let transport = Arc::new(Self {
            id,
            pc,
            router,
            session,
            elements_config: config.elements.clone(),
            senders: Mutex::new(HashMap::new()),
            simulcast: Mutex::new(HashMap::new()),
            elements: Mutex::new(Vec::new()),
            subscriptions: tokio::sync::Mutex::new(HashMap::new()),
            on_track: RwLock::new(None),
            closed: AtomicBool::new(false),
            cancel,
            tasks,
        });

        transport.register_handlers();
        transport.spawn_feedback_writer(&config.sfu);
        transport.session.add_transport(&transport);

        info!(
            transport_id = %transport.id,
            session_id = %transport.session.id(),
            "Transport created"
        );
        Ok(transport)
    }

    fn register_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.pc
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(transport) = weak.upgrade() {
                        transport.handle_remote_track(track).await;
                    }
                })
            }));

        let weak = Arc::downgrade(self);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(transport) = weak.upgrade() else {
                        return;
                    };
                    debug!(transport_id = %transport.id, state = %state, "Connection state changed");

                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) && !transport.is_closed()
                    {
                        // Closing the connection from its own callback would wait on itself
                        tokio::spawn(async move {
                            if let Err(e) = transport.close().await {
                                warn!(transport_id = %transport.id, error = %e, "Failed to close transport");
                            }
                        });
                    }
                })
            }));
    }

    /// Drain the router's feedback queue onto the peer connection
    fn spawn_feedback_writer(&self, config: &SfuConfig) {
        let Some(mut feedback) = self.router.take_feedback() else {
            return;
        };
        let pc = Arc::clone(&self.pc);
        let cancel = self.cancel.clone();
        let transport_id = self.id.clone();
        debug!(
            transport_id = %transport_id,
            capacity = config.rtcp_channel_capacity,
            "Starting RTCP feedback writer"
        );

        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    batch = feedback.recv() => {
                        let Some(batch) = batch else { break };
                        if let Err(e) = pc.write_rtcp(&batch).await {
                            debug!(transport_id = %transport_id, error = %e, "Failed to write RTCP feedback");
                        }
                    }
                }
            }
        });
    }

    async fn handle_remote_track(self: &Arc<Self>, track: Arc<TrackRemote>) {
        if self.is_closed() {
            return;
        }

        let info = TrackInfo::from_remote(&track);
        let (receiver, created) = self.router.add_receiver(info);
        if !created {
            debug!(transport_id = %self.id, track_id = %receiver.key(), "Duplicate inbound track ignored");
            return;
        }

        info!(
            transport_id = %self.id,
            track_id = %receiver.key(),
            stream_id = %receiver.info().stream_id,
            kind = ?receiver.info().kind,
            codec = %receiver.info().mime_type(),
            "Inbound track"
        );

        self.router
            .spawn_forwarding(Arc::clone(&track), Arc::clone(&receiver));
        let handler = self.on_track.read().clone();
        if let Some(handler) = handler {
            handler(&track, &receiver);
        }
        self.session.publish(&self.id, &receiver).await;
    }

    /// Register a track published without negotiation and fan it out.
    ///
    /// Packets are fed with [`Receiver::push_rtp`].
    pub async fn publish(&self, info: TrackInfo) -> Result<Arc<Receiver>> {
        self.ensure_open()?;
        let (receiver, created) = self.router.add_receiver(info);
        if created {
            self.session.publish(&self.id, &receiver).await;
        }
        Ok(receiver)
    }

    /// Forward `receiver` to this transport's peer.
    ///
    /// Simulcast layers of one track share a single sender and outbound
    /// track. Subscribing twice to the same receiver is a no-op.
    pub async fn subscribe(&self, receiver: &Arc<Receiver>) -> Result<()> {
        self.ensure_open()?;
        if receiver.is_closed() {
            return Err(Error::ReceiverClosed);
        }

        let mut subscriptions = self.subscriptions.lock().await;
        let key = receiver.key();
        let subscribed = subscriptions
            .get(&key)
            .and_then(Weak::upgrade)
            .is_some_and(|r| Arc::ptr_eq(&r, receiver) && !r.is_closed());
        if subscribed {
            debug!(transport_id = %self.id, track_id = %key, "Already subscribed");
            return Ok(());
        }

        let info = receiver.info();
        let layered = info.is_video() && info.layer.is_some();

        let existing = if layered {
            self.simulcast
                .lock()
                .get(&info.id)
                .filter(|s| !s.is_closed())
                .cloned()
        } else {
            None
        };
        if let Some(sender) = existing {
            sender.add_layer(receiver)?;
            receiver.subscribe(sender)?;
            subscriptions.insert(key, Arc::downgrade(receiver));
            return Ok(());
        }

        let outbound = self.add_outbound_track(info).await?;
        let rtp_sender = Arc::clone(&outbound.rtp_sender);
        let sender: Arc<dyn Sender> = if layered {
            let simulcast = SimulcastSender::new(receiver, outbound)?;
            self.simulcast
                .lock()
                .insert(info.id.clone(), Arc::clone(&simulcast));
            simulcast
        } else {
            SimpleSender::new(receiver, outbound)
        };

        if let Err(e) = receiver.subscribe(Arc::clone(&sender)) {
            if let Err(close_err) = sender.close().await {
                debug!(transport_id = %self.id, error = %close_err, "Failed to close sender");
            }
            return Err(e);
        }

        self.router
            .spawn_rtcp_reader(rtp_sender, Arc::clone(&sender));
        self.add_sender(info.stream_id.clone(), sender);
        subscriptions.insert(key.clone(), Arc::downgrade(receiver));
        receiver.request_keyframe();

        info!(
            transport_id = %self.id,
            track_id = %key,
            stream_id = %info.stream_id,
            simulcast = layered,
            "Subscribed to track"
        );
        Ok(())
    }

    async fn add_outbound_track(&self, info: &TrackInfo) -> Result<Arc<OutboundTrack>> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            info.codec.clone(),
            info.id.to_string(),
            info.stream_id.to_string(),
        ));
        let rtp_sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        Ok(Arc::new(OutboundTrack {
            track,
            rtp_sender,
            pc: Arc::downgrade(&self.pc),
            cancel: self.cancel.clone(),
        }))
    }

    /// Append `sender` to the sender list of `stream_id`
    pub fn add_sender(&self, stream_id: StreamId, sender: Arc<dyn Sender>) {
        let mut senders = self.senders.lock();
        let list = senders.entry(stream_id.clone()).or_default();
        list.push(sender);
        debug!(
            transport_id = %self.id,
            stream_id = %stream_id,
            senders = list.len(),
            "Sender added"
        );
    }

    /// Senders of `stream_id`, in insertion order. Empty if none.
    #[must_use]
    pub fn get_senders(&self, stream_id: &StreamId) -> Vec<Arc<dyn Sender>> {
        self.senders
            .lock()
            .get(stream_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop senders whose source went away
    pub fn prune_closed_senders(&self) {
        let mut senders = self.senders.lock();
        senders.retain(|_, list| {
            list.retain(|s| !s.is_closed());
            !list.is_empty()
        });
        drop(senders);
        self.simulcast.lock().retain(|_, s| !s.is_closed());
    }

    /// Open simulcast senders, e.g. to apply a bandwidth estimate
    #[must_use]
    pub fn simulcast_senders(&self) -> Vec<Arc<SimulcastSender>> {
        self.simulcast
            .lock()
            .values()
            .filter(|s| !s.is_closed())
            .cloned()
            .collect()
    }

    /// Attach an element of `element_type` to a stream this transport
    /// publishes.
    ///
    /// Every track of the stream gets a recorder feeding the element; for
    /// simulcast tracks only the highest layer is recorded. Tracks with a
    /// codec the recorder cannot depacketize are skipped.
    pub fn add_element(&self, element_type: &str, stream_id: &StreamId) -> Result<Arc<dyn Element>> {
        self.ensure_open()?;

        let mut tracks: HashMap<TrackId, Arc<Receiver>> = HashMap::new();
        for receiver in self.router.receivers() {
            let info = receiver.info();
            if &info.stream_id != stream_id || receiver.is_closed() {
                continue;
            }
            match tracks.entry(info.id.clone()) {
                Entry::Occupied(mut e) => {
                    if info.layer > e.get().info().layer {
                        e.insert(receiver);
                    }
                }
                Entry::Vacant(e) => {
                    e.insert(receiver);
                }
            }
        }
        if tracks.is_empty() {
            return Err(Error::StreamNotFound(stream_id.to_string()));
        }

        let element = get_element(element_type, stream_id, &self.elements_config)?;
        for receiver in tracks.into_values() {
            let recorder = match Recorder::new(&receiver, Arc::clone(&element)) {
                Ok(recorder) => recorder,
                Err(e @ Error::UnsupportedCodec(_)) => {
                    warn!(
                        transport_id = %self.id,
                        track_id = %receiver.key(),
                        error = %e,
                        "Track not recorded"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            receiver.subscribe(Arc::clone(&recorder) as Arc<dyn Sender>)?;
            self.add_sender(stream_id.clone(), recorder);
        }

        self.elements.lock().push(Arc::clone(&element));
        info!(transport_id = %self.id, stream_id = %stream_id, element_type, "Element attached");
        Ok(element)
    }

    /// Observe new inbound tracks. Called once per track, after its
    /// receiver is registered and before it is fanned out.
    pub fn on_track<F>(&self, handler: F)
    where
        F: Fn(&Arc<TrackRemote>, &Arc<Receiver>) + Send + Sync + 'static,
    {
        *self.on_track.write() = Some(Arc::new(handler));
    }

    /// Observe local ICE candidates. `None` marks the end of gathering.
    pub fn on_ice_candidate<F>(&self, handler: F)
    where
        F: Fn(Option<RTCIceCandidateInit>) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let transport_id = self.id.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let handler = Arc::clone(&handler);
                let transport_id = transport_id.clone();
                Box::pin(async move {
                    match candidate.map(|c| c.to_json()).transpose() {
                        Ok(init) => handler(init),
                        Err(e) => {
                            warn!(transport_id = %transport_id, error = %e, "Failed to encode ICE candidate");
                        }
                    }
                })
            }));
    }

    /// Observe renegotiation requests (e.g. after a new outbound track)
    pub fn on_negotiation_needed<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.pc.on_negotiation_needed(Box::new(move || {
            let handler = Arc::clone(&handler);
            Box::pin(async move { handler() })
        }));
    }

    pub async fn create_offer(&self) -> Result<RTCSessionDescription> {
        self.ensure_open()?;
        self.pc
            .create_offer(None)
            .await
            .map_err(Error::negotiation)
    }

    pub async fn create_answer(&self) -> Result<RTCSessionDescription> {
        self.ensure_open()?;
        self.pc
            .create_answer(None)
            .await
            .map_err(Error::negotiation)
    }

    pub async fn set_local_description(&self, description: RTCSessionDescription) -> Result<()> {
        self.ensure_open()?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(Error::negotiation)
    }

    /// Apply the peer's description and learn its header extension ids.
    ///
    /// The description is parsed before anything is applied, so a
    /// malformed one leaves both the connection and the router untouched.
    pub async fn set_remote_description(&self, description: RTCSessionDescription) -> Result<()> {
        self.ensure_open()?;
        let parsed = SessionDescription::unmarshal(&mut Cursor::new(description.sdp.as_bytes()))
            .map_err(Error::negotiation)?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(Error::negotiation)?;
        self.router.set_ext_map(&parsed);
        Ok(())
    }

    /// Resolves (the receiver yields `None`) once ICE gathering is
    /// complete. Take it before setting the local description.
    pub async fn gathering_complete_promise(&self) -> mpsc::Receiver<()> {
        self.pc.gathering_complete_promise().await
    }

    pub async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.pc.local_description().await
    }

    pub async fn remote_description(&self) -> Option<RTCSessionDescription> {
        self.pc.remote_description().await
    }

    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.ensure_open()?;
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(Error::negotiation)
    }

    #[must_use]
    pub const fn id(&self) -> &TransportId {
        &self.id
    }

    #[must_use]
    pub const fn router(&self) -> &Arc<Router> {
        &self.router
    }

    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    #[must_use]
    pub fn connection_state(&self) -> RTCPeerConnectionState {
        self.pc.connection_state()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::TransportClosed)
        } else {
            Ok(())
        }
    }

    /// Tear the transport down. Idempotent.
    ///
    /// Returns once every background task of the transport has finished.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.cancel.cancel();

        let senders: Vec<_> = self
            .senders
            .lock()
            .drain()
            .flat_map(|(_, list)| list)
            .collect();
        for sender in &senders {
            if let Err(e) = sender.close().await {
                debug!(transport_id = %self.id, sender_id = %sender.id(), error = %e, "Failed to close sender");
            }
        }
        self.simulcast.lock().clear();

        self.router.close().await;

        let elements = std::mem::take(&mut *self.elements.lock());
        for element in elements {
            if let Err(e) = element.close().await {
                warn!(transport_id = %self.id, error = %e, "Failed to close element");
            }
        }

        if let Err(e) = self.pc.close().await {
            warn!(transport_id = %self.id, error = %e, "Failed to close peer connection");
        }

        self.session.remove_transport(&self.id);

        self.tasks.close();
        self.tasks.wait().await;

        info!(
            transport_id = %self.id,
            session_id = %self.session.id(),
            senders = senders.len(),
            "Transport closed"
        );
        Ok(())
    }
}

/// Outbound track on a subscriber's peer connection
struct OutboundTrack {
    track: Arc<TrackLocalStaticRTP>,
    rtp_sender: Arc<RTCRtpSender>,
    pc: Weak<RTCPeerConnection>,
    cancel: CancellationToken,
}

#[async_trait]
impl RtpWriter for OutboundTrack {
    async fn write_rtp(&self, packet: &Packet) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::TransportClosed);
        }
        match self.track.write_rtp(packet).await {
            Ok(_) => Ok(()),
            Err(webrtc::Error::ErrClosedPipe) => Err(Error::TransportClosed),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) {
        let Some(pc) = self.pc.upgrade() else {
            return;
        };
        if let Err(e) = pc.remove_track(&self.rtp_sender).await {
            debug!(track_id = %self.track.id(), error = %e, "Failed to remove outbound track");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::tests::{rtp, video_info};
    use crate::sender::testing::MemoryWriter;
    use crate::types::SessionId;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::api::APIBuilder;

    fn api() -> API {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        APIBuilder::new().with_media_engine(media_engine).build()
    }

    async fn transport(session: &Arc<Session>, id: &str) -> Arc<WebRtcTransport> {
        WebRtcTransport::new(
            TransportId::from(id),
            Arc::clone(session),
            &api(),
            RTCConfiguration::default(),
            &Config::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_add_sender_keeps_order() {
        let session = Session::new(SessionId::from("room"));
        let t = transport(&session, "a").await;
        let source = t.publish(video_info("cam")).await.unwrap();

        let senders: Vec<Arc<dyn Sender>> = (0..3)
            .map(|_| SimpleSender::new(&source, Arc::new(MemoryWriter::default())) as Arc<dyn Sender>)
            .collect();
        for sender in &senders {
            t.add_sender(StreamId::from("stream"), Arc::clone(sender));
        }

        let ids: Vec<_> = t
            .get_senders(&StreamId::from("stream"))
            .iter()
            .map(|s| s.id())
            .collect();
        let expected: Vec<_> = senders.iter().map(|s| s.id()).collect();
        assert_eq!(ids, expected);
        assert!(senders
            .iter()
            .all(|s| s.stream_id() == &StreamId::from("stream")));
        assert!(t.get_senders(&StreamId::from("missing")).is_empty());

        t.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_add_sender() {
        let session = Session::new(SessionId::from("room"));
        let t = transport(&session, "a").await;
        let source = t.publish(video_info("cam")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let t = Arc::clone(&t);
            let source = Arc::clone(&source);
            handles.push(tokio::spawn(async move {
                for _ in 0..8 {
                    t.add_sender(
                        StreamId::from("stream"),
                        SimpleSender::new(&source, Arc::new(MemoryWriter::default())),
                    );
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(t.get_senders(&StreamId::from("stream")).len(), 128);
        t.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_fans_out_once() {
        let session = Session::new(SessionId::from("room"));
        let a = transport(&session, "a").await;
        let b = transport(&session, "b").await;

        let receiver = a.publish(video_info("cam")).await.unwrap();
        // A repeated subscription is ignored
        b.subscribe(&receiver).await.unwrap();

        assert_eq!(b.get_senders(&StreamId::from("stream")).len(), 1);
        assert!(a.get_senders(&StreamId::from("stream")).is_empty());
        assert_eq!(receiver.subscriber_count(), 1);

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_simulcast_layers_share_sender() {
        let session = Session::new(SessionId::from("room"));
        let a = transport(&session, "a").await;
        let b = transport(&session, "b").await;

        a.publish(video_info("cam").with_rid("q")).await.unwrap();
        a.publish(video_info("cam").with_rid("f")).await.unwrap();

        assert_eq!(b.get_senders(&StreamId::from("stream")).len(), 1);
        let simulcast = b.simulcast_senders();
        assert_eq!(simulcast.len(), 1);
        assert_eq!(simulcast[0].layers().len(), 2);

        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_calls() {
        let session = Session::new(SessionId::from("room"));
        let a = transport(&session, "a").await;
        let b = transport(&session, "b").await;
        let receiver = a.publish(video_info("cam")).await.unwrap();

        b.close().await.unwrap();
        assert!(matches!(b.subscribe(&receiver).await, Err(Error::TransportClosed)));
        assert!(matches!(b.create_offer().await, Err(Error::TransportClosed)));

        // Forwarding to a closed subscriber is silent
        receiver.push_rtp(rtp(1, 1)).await;
        assert_eq!(receiver.subscriber_count(), 0);

        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_element_unknown_stream() {
        let session = Session::new(SessionId::from("room"));
        let a = transport(&session, "a").await;

        assert!(matches!(
            a.add_element("WebmSaver", &StreamId::from("stream")),
            Err(Error::StreamNotFound(_))
        ));

        a.publish(video_info("cam")).await.unwrap();
        assert!(matches!(
            a.add_element("Mixer", &StreamId::from("stream")),
            Err(Error::ElementNotFound(_))
        ));

        a.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_element_registers_recorder() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.elements.output_dir = dir.path().to_path_buf();

        let session = Session::new(SessionId::from("room"));
        let a = WebRtcTransport::new(
            TransportId::from("a"),
            Arc::clone(&session),
            &api(),
            RTCConfiguration::default(),
            &config,
        )
        .await
        .unwrap();
        let receiver = a.publish(video_info("cam")).await.unwrap();

        a.add_element("WebmSaver", &StreamId::from("stream")).unwrap();
        assert_eq!(a.get_senders(&StreamId::from("stream")).len(), 1);
        assert_eq!(receiver.subscriber_count(), 1);

        a.close().await.unwrap();
    }
}
