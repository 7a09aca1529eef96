use super::{RtpWriter, Sender, SenderCounters, SenderStats, SequenceRewriter};
use crate::codec::is_keyframe;
use crate::error::{Error, Result};
use crate::receiver::Receiver;
use crate::track::QualityLayer;
use crate::types::{SenderId, StreamId, TrackId};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use webrtc::rtp::packet::Packet;

/// Forwards one of several simulcast layers of a track.
///
/// Layer changes are deferred: a requested layer becomes active only on
/// a keyframe from that layer, so the subscriber's decoder never sees a
/// delta frame it has no reference for.
pub struct SimulcastSender {
    id: SenderId,
    stream_id: StreamId,
    track_id: TrackId,
    mime_type: String,
    layers: RwLock<BTreeMap<QualityLayer, Weak<Receiver>>>,
    state: Mutex<LayerState>,
    writer: Arc<dyn RtpWriter>,
    closed: AtomicBool,
    stats: SenderCounters,
}

struct LayerState {
    current: Option<QualityLayer>,
    pending: Option<QualityLayer>,
    /// Best layer the subscriber should receive
    target: QualityLayer,
    rewriter: SequenceRewriter,
}

impl SimulcastSender {
    /// Create a sender starting from `source`, which must carry a layer.
    /// The caller subscribes it.
    pub fn new(source: &Arc<Receiver>, writer: Arc<dyn RtpWriter>) -> Result<Arc<Self>> {
        let info = source.info();
        let layer = info.layer.ok_or_else(|| {
            Error::Internal(format!("track {} is not a simulcast layer", info.key()))
        })?;

        let mut layers = BTreeMap::new();
        layers.insert(layer, Arc::downgrade(source));

        Ok(Arc::new(Self {
            id: SenderId::new(),
            stream_id: info.stream_id.clone(),
            track_id: info.id.clone(),
            mime_type: info.codec.mime_type.clone(),
            layers: RwLock::new(layers),
            state: Mutex::new(LayerState {
                current: None,
                pending: Some(layer),
                target: QualityLayer::High,
                rewriter: SequenceRewriter::new(),
            }),
            writer,
            closed: AtomicBool::new(false),
            stats: SenderCounters::default(),
        }))
    }

    /// Track this sender forwards layers of
    #[must_use]
    pub const fn track_id(&self) -> &TrackId {
        &self.track_id
    }

    /// Make another layer of the same track available.
    ///
    /// Switches toward it if it is closer to the target than the current
    /// selection.
    pub fn add_layer(&self, source: &Arc<Receiver>) -> Result<()> {
        let layer = source.info().layer.ok_or_else(|| {
            Error::Internal(format!("track {} is not a simulcast layer", source.key()))
        })?;
        self.layers.write().insert(layer, Arc::downgrade(source));
        debug!(sender_id = %self.id, track_id = %self.track_id, layer = ?layer, "Layer added");

        let target = self.state.lock().target;
        if let Some(desired) = self.select(target) {
            self.request_layer_switch(desired);
        }
        Ok(())
    }

    /// Available layers, lowest first
    #[must_use]
    pub fn layers(&self) -> Vec<QualityLayer> {
        self.layers.read().keys().copied().collect()
    }

    /// Layer currently forwarded
    #[must_use]
    pub fn current_layer(&self) -> Option<QualityLayer> {
        self.state.lock().current
    }

    /// Layer waiting for a keyframe
    #[must_use]
    pub fn pending_layer(&self) -> Option<QualityLayer> {
        self.state.lock().pending
    }

    /// Ask to forward `target` from its next keyframe on.
    ///
    /// Returns false if the layer is not available.
    pub fn request_layer_switch(&self, target: QualityLayer) -> bool {
        let Some(source) = self.layer_receiver(target) else {
            return false;
        };

        {
            let mut state = self.state.lock();
            if state.current == Some(target) {
                state.pending = None;
                return true;
            }
            if state.pending == Some(target) {
                return true;
            }
            debug!(
                sender_id = %self.id,
                track_id = %self.track_id,
                current = ?state.current,
                pending = ?target,
                "Layer switch requested"
            );
            state.pending = Some(target);
        }

        source.request_keyframe();
        true
    }

    /// Pick a layer from an externally estimated bandwidth
    pub fn set_target_bandwidth(&self, bandwidth_kbps: u32) {
        let target = QualityLayer::from_bandwidth(bandwidth_kbps);
        self.state.lock().target = target;
        if let Some(layer) = self.select(target) {
            self.request_layer_switch(layer);
        }
    }

    /// Best available layer not above `target`, else the lowest one
    fn select(&self, target: QualityLayer) -> Option<QualityLayer> {
        let layers = self.layers.read();
        layers
            .range(..=target)
            .next_back()
            .or_else(|| layers.iter().next())
            .map(|(layer, _)| *layer)
    }

    fn layer_receiver(&self, layer: QualityLayer) -> Option<Arc<Receiver>> {
        self.layers.read().get(&layer).and_then(Weak::upgrade)
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
impl Sender for SimulcastSender {
    fn id(&self) -> SenderId {
        self.id
    }

    fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    async fn write(&self, layer: Option<QualityLayer>, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SenderClosed);
        }
        let Some(layer) = layer else {
            return Ok(());
        };

        let mut out = packet.clone();
        {
            let mut state = self.state.lock();
            if state.pending == Some(layer) && is_keyframe(&self.mime_type, &packet.payload) {
                info!(
                    sender_id = %self.id,
                    track_id = %self.track_id,
                    from = ?state.current,
                    to = ?layer,
                    "Switched simulcast layer"
                );
                state.current = Some(layer);
                state.pending = None;
                state.rewriter.resync();
            }
            if state.current != Some(layer) {
                return Ok(());
            }
            state.rewriter.rewrite(&mut out.header);
        }
        self.send(&out).await
    }

    async fn write_retransmission(&self, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SenderClosed);
        }

        let mut out = packet.clone();
        let (seq, ts) = self
            .state
            .lock()
            .rewriter
            .map(packet.header.sequence_number, packet.header.timestamp);
        out.header.sequence_number = seq;
        out.header.timestamp = ts;
        self.send(&out).await?;
        self.stats.record_retransmission();
        Ok(())
    }

    fn resolve_nack(&self, sequence_number: u16) -> Option<(Arc<Receiver>, u16)> {
        let (current, source) = {
            let state = self.state.lock();
            (state.current?, state.rewriter.source_sequence(sequence_number)?)
        };
        Some((self.layer_receiver(current)?, source))
    }

    fn keyframe_source(&self) -> Option<Arc<Receiver>> {
        let layer = {
            let state = self.state.lock();
            state.pending.or(state.current)?
        };
        self.layer_receiver(layer)
    }

    async fn source_closed(&self, track: &TrackId) {
        let removed = {
            let mut layers = self.layers.write();
            let layer = layers.iter().find_map(|(layer, weak)| {
                let gone = weak
                    .upgrade()
                    .map_or(true, |r| r.key() == *track || r.is_closed());
                gone.then_some(*layer)
            });
            layer.map(|l| (l, layers.remove(&l), layers.is_empty()))
        };
        let Some((layer, _, empty)) = removed else {
            return;
        };

        if empty {
            if let Err(e) = self.close().await {
                debug!(sender_id = %self.id, error = %e, "Failed to close sender");
            }
            return;
        }

        let target = {
            let mut state = self.state.lock();
            if state.pending == Some(layer) {
                state.pending = None;
            }
            if state.current == Some(layer) {
                state.current = None;
            }
            state.target
        };
        debug!(sender_id = %self.id, layer = ?layer, "Layer source closed");
        if let Some(next) = self.select(target) {
            self.request_layer_switch(next);
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let sources: Vec<_> = self.layers.read().values().filter_map(Weak::upgrade).collect();
        for source in sources {
            source.unsubscribe(&self.id);
        }
        self.writer.close().await;
        debug!(sender_id = %self.id, track_id = %self.track_id, "Simulcast sender closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> SenderStats {
        self.stats.snapshot()
    }
}
