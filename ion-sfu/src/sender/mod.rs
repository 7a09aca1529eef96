//! Outbound forwarding units
//!
//! A sender is owned by one subscriber transport and subscribed to one or
//! more receivers. Receivers push every packet into [`Sender::write`]; the
//! sender rewrites it onto its own numbering space and hands it to an
//! [`RtpWriter`] (normally the subscriber's outbound track).
//!
//! - [`SimpleSender`]: one receiver, forwarded 1:1
//! - [`SimulcastSender`]: several layer receivers, one forwarded at a time

mod rewrite;
mod simple;
mod simulcast;

pub use rewrite::SequenceRewriter;
pub use simple::SimpleSender;
pub use simulcast::SimulcastSender;

use crate::error::Result;
use crate::receiver::Receiver;
use crate::track::QualityLayer;
use crate::types::{SenderId, StreamId, TrackId};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use webrtc::rtp::packet::Packet;
use webrtc::util::marshal::MarshalSize;

/// Capability shared by every outbound forwarding unit
#[async_trait]
pub trait Sender: Send + Sync {
    fn id(&self) -> SenderId;

    fn stream_id(&self) -> &StreamId;

    /// Forward a live packet from a receiver.
    ///
    /// `layer` is the simulcast layer of the receiver that produced the
    /// packet, if any.
    async fn write(&self, layer: Option<QualityLayer>, packet: &Packet) -> Result<()>;

    /// Re-send a stored packet in response to a NACK. Does not advance the
    /// live numbering.
    async fn write_retransmission(&self, packet: &Packet) -> Result<()>;

    /// Map an outbound sequence number from subscriber feedback back to
    /// the receiver and sequence number it was forwarded from
    fn resolve_nack(&self, sequence_number: u16) -> Option<(Arc<Receiver>, u16)>;

    /// Receiver that should be asked for a keyframe on PLI/FIR
    fn keyframe_source(&self) -> Option<Arc<Receiver>>;

    /// The receiver with router key `track` has closed
    async fn source_closed(&self, track: &TrackId);

    /// Unsubscribe from every receiver and release the outbound track.
    /// Calling it twice is a no-op.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    fn stats(&self) -> SenderStats;
}

/// Destination of rewritten packets
#[async_trait]
pub trait RtpWriter: Send + Sync {
    async fn write_rtp(&self, packet: &Packet) -> Result<()>;

    /// Release the destination
    async fn close(&self) {}
}

/// Sender statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_dropped: u64,
    pub retransmissions_sent: u64,
}

/// Atomic counters behind [`SenderStats`]
#[derive(Default)]
pub(crate) struct SenderCounters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_dropped: AtomicU64,
    retransmissions_sent: AtomicU64,
}

impl SenderCounters {
    pub(crate) fn record_sent(&self, packet: &Packet) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent
            .fetch_add(packet.marshal_size() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_retransmission(&self) {
        self.retransmissions_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drop(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SenderStats {
        SenderStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            retransmissions_sent: self.retransmissions_sent.load(Ordering::Relaxed),
        }
    }
}
