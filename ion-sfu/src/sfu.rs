//! SFU - top-level registry of sessions
//!
//! This module provides:
//! - The shared negotiation engine (codecs, interceptors, ICE settings)
//! - Session lookup and creation
//! - Transport creation, including subscription to already published tracks
//! - Periodic removal of empty sessions

use crate::config::{Config, WebRtcConfig};
use crate::error::{Error, Result};
use crate::router::AUDIO_LEVEL_URI;
use crate::session::{Reservation, Session};
use crate::transport::WebRtcTransport;
use crate::types::{SessionId, TransportId};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::configure_rtcp_reports;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpHeaderExtensionCapability, RTPCodecType};

/// Build the negotiation engine shared by every transport.
///
/// Only RTCP report interceptors are installed: NACKs from subscribers are
/// answered from receiver buffers, not by a generic responder.
fn build_api(config: &WebRtcConfig) -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    media_engine.register_header_extension(
        RTCRtpHeaderExtensionCapability {
            uri: AUDIO_LEVEL_URI.to_owned(),
        },
        RTPCodecType::Audio,
        None,
    )?;

    let registry = configure_rtcp_reports(Registry::new());

    let mut setting_engine = SettingEngine::default();
    if config.udp_port_min > 0 && config.udp_port_max > 0 {
        let ephemeral = EphemeralUDP::new(config.udp_port_min, config.udp_port_max)
            .map_err(|e| Error::Internal(format!("invalid UDP port range: {e}")))?;
        setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        info!(
            udp_port_min = config.udp_port_min,
            udp_port_max = config.udp_port_max,
            "Using UDP port range"
        );
    }
    if !config.nat_1to1_ips.is_empty() {
        setting_engine.set_nat_1to1_ips(config.nat_1to1_ips.clone(), RTCIceCandidateType::Host);
    }

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

fn rtc_configuration(config: &WebRtcConfig) -> RTCConfiguration {
    let mut ice_servers = Vec::new();
    if !config.stun_servers.is_empty() {
        ice_servers.push(RTCIceServer {
            urls: config.stun_servers.clone(),
            ..Default::default()
        });
    }
    ice_servers.extend(config.turn_servers.iter().map(|turn| RTCIceServer {
        urls: vec![turn.url.clone()],
        username: turn.username.clone(),
        credential: turn.credential.clone(),
        ..Default::default()
    }));

    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

pub struct Sfu {
    config: Config,
    api: API,
    /// Active sessions (DashMap for lock-free concurrent access)
    sessions: DashMap<SessionId, Arc<Session>>,
    cancel: CancellationToken,
}

impl Sfu {
    /// Create the SFU and start its cleanup task
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let api = build_api(&config.webrtc)?;
        let sfu = Arc::new(Self {
            config,
            api,
            sessions: DashMap::new(),
            cancel: CancellationToken::new(),
        });

        info!(
            receiver_buffer_size = sfu.config.sfu.buffer_capacity(),
            max_transports_per_session = sfu.config.sfu.max_transports_per_session,
            "SFU initialized"
        );

        let weak = Arc::downgrade(&sfu);
        let cancel = sfu.cancel.clone();
        let period = Duration::from_secs(sfu.config.sfu.session_cleanup_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(sfu) = weak.upgrade() else { break };
                        sfu.cleanup_empty_sessions();
                    }
                }
            }
            debug!("Session cleanup task stopped");
        });

        Ok(sfu)
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub fn get_or_create_session(&self, id: SessionId) -> Arc<Session> {
        let session = self.sessions.entry(id.clone()).or_insert_with(|| {
            info!(session_id = %id, "Created session");
            Session::new(id)
        });
        Arc::clone(session.value())
    }

    /// Get or create a session, reserved against cleanup while the shard
    /// is still locked
    fn reserve_session(&self, id: &SessionId) -> Reservation {
        let session = self.sessions.entry(id.clone()).or_insert_with(|| {
            info!(session_id = %id, "Created session");
            Session::new(id.clone())
        });
        session.value().reserve()
    }

    #[must_use]
    pub fn get_session(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Create a transport in `session_id` and subscribe it to every track
    /// already published there
    pub async fn new_transport(&self, session_id: &SessionId) -> Result<Arc<WebRtcTransport>> {
        if self.cancel.is_cancelled() {
            return Err(Error::TransportClosed);
        }

        let reservation = self.reserve_session(session_id);
        let session = Arc::clone(reservation.session());
        let max = self.config.sfu.max_transports_per_session;
        if max > 0 && session.transports().len() >= max {
            warn!(session_id = %session_id, max, "Session transport limit reached");
            return Err(Error::SessionFull(session_id.to_string()));
        }

        let transport = WebRtcTransport::new(
            TransportId::generate(),
            Arc::clone(&session),
            &self.api,
            rtc_configuration(&self.config.webrtc),
            &self.config,
        )
        .await?;
        drop(reservation);
        session.subscribe_existing(&transport).await;
        Ok(transport)
    }

    /// Drop sessions without open transports
    pub fn cleanup_empty_sessions(&self) {
        let before = self.sessions.len();
        self.sessions.retain(|id, session| {
            let keep = !session.is_empty();
            if !keep {
                debug!(session_id = %id, "Removed empty session");
            }
            keep
        });

        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            info!(
                removed,
                remaining = self.sessions.len(),
                "Cleaned up empty sessions"
            );
        }
    }

    /// Stop background work and close every transport
    pub async fn close(&self) {
        self.cancel.cancel();
        let transports: Vec<_> = self
            .sessions
            .iter()
            .flat_map(|s| s.value().transports())
            .collect();
        for transport in transports {
            if let Err(e) = transport.close().await {
                warn!(transport_id = %transport.id(), error = %e, "Failed to close transport");
            }
        }
        self.sessions.clear();
        info!("SFU closed");
    }
}
