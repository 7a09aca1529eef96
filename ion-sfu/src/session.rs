//! Session: the transports of one call
//!
//! Transports register themselves on creation and unregister on close; the
//! session only keeps weak references. When a transport publishes a track
//! the session subscribes every other transport to it.

use crate::receiver::Receiver;
use crate::transport::WebRtcTransport;
use crate::types::{SessionId, TransportId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub struct Session {
    id: SessionId,
    transports: Mutex<HashMap<TransportId, Weak<WebRtcTransport>>>,
    /// Transports being created; the session is not empty while non-zero
    pending: AtomicUsize,
}

/// Keeps a session alive across transport creation.
///
/// Released on drop.
#[must_use]
pub struct Reservation {
    session: Arc<Session>,
}

impl Reservation {
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.session.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Session {
    #[must_use]
    pub fn new(id: SessionId) -> Arc<Self> {
        Arc::new(Self {
            id,
            transports: Mutex::new(HashMap::new()),
            pending: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    /// Register `transport` under its id, replacing any previous entry
    pub fn add_transport(&self, transport: &Arc<WebRtcTransport>) {
        let mut transports = self.transports.lock();
        if transports
            .insert(transport.id().clone(), Arc::downgrade(transport))
            .is_some()
        {
            warn!(session_id = %self.id, transport_id = %transport.id(), "Transport id reused, replacing");
        }
        info!(
            session_id = %self.id,
            transport_id = %transport.id(),
            transports = transports.len(),
            "Transport joined session"
        );
    }

    /// Unregister a transport. No-op if absent.
    pub fn remove_transport(&self, id: &TransportId) {
        let remaining = {
            let mut transports = self.transports.lock();
            if transports.remove(id).is_none() {
                return;
            }
            transports.len()
        };
        info!(session_id = %self.id, transport_id = %id, remaining, "Transport left session");

        for transport in self.transports() {
            transport.prune_closed_senders();
        }
    }

    /// Live, open transports
    #[must_use]
    pub fn transports(&self) -> Vec<Arc<WebRtcTransport>> {
        self.transports
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|t| !t.is_closed())
            .collect()
    }

    #[must_use]
    pub fn get_transport(&self, id: &TransportId) -> Option<Arc<WebRtcTransport>> {
        self.transports
            .lock()
            .get(id)
            .and_then(Weak::upgrade)
            .filter(|t| !t.is_closed())
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.lock().len()
    }

    /// Mark a transport as being created until the reservation drops
    pub fn reserve(self: &Arc<Self>) -> Reservation {
        self.pending.fetch_add(1, Ordering::AcqRel);
        Reservation {
            session: Arc::clone(self),
        }
    }

    /// True when no transport is open or being created
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
            && self
                .transports
                .lock()
                .values()
                .all(|t| t.upgrade().map_or(true, |t| t.is_closed()))
    }

    /// Subscribe every transport except `publisher` to `receiver`.
    ///
    /// Transports are visited in turn; a failure on one is logged and does
    /// not stop the others.
    pub async fn publish(&self, publisher: &TransportId, receiver: &Arc<Receiver>) {
        let subscribers: Vec<_> = self
            .transports()
            .into_iter()
            .filter(|t| t.id() != publisher)
            .collect();
        debug!(
            session_id = %self.id,
            publisher = %publisher,
            track_id = %receiver.key(),
            subscribers = subscribers.len(),
            "Fanning out track"
        );

        for transport in subscribers {
            if let Err(e) = transport.subscribe(receiver).await {
                warn!(
                    session_id = %self.id,
                    transport_id = %transport.id(),
                    track_id = %receiver.key(),
                    error = %e,
                    "Failed to subscribe transport"
                );
            }
        }
    }

    /// Subscribe `transport` to everything already published by the others
    pub async fn subscribe_existing(&self, transport: &Arc<WebRtcTransport>) {
        let receivers: Vec<_> = self
            .transports()
            .into_iter()
            .filter(|t| t.id() != transport.id())
            .flat_map(|t| t.router().receivers())
            .filter(|r| !r.is_closed())
            .collect();

        for receiver in receivers {
            if let Err(e) = transport.subscribe(&receiver).await {
                warn!(
                    session_id = %self.id,
                    transport_id = %transport.id(),
                    track_id = %receiver.key(),
                    error = %e,
                    "Failed to subscribe late joiner"
                );
            }
        }
    }
}
