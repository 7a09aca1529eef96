//! Error types for the SFU

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The negotiation engine rejected or could not produce a description
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Session is full: {0}")]
    SessionFull(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Receiver closed")]
    ReceiverClosed,

    #[error("Sender closed")]
    SenderClosed,

    #[error("Element closed")]
    ElementClosed,

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn negotiation(err: impl std::fmt::Display) -> Self {
        Self::Negotiation(err.to_string())
    }

    /// Whether the error only means the other side is already gone.
    /// Such errors are dropped silently on the forwarding path.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::TransportClosed | Self::ReceiverClosed | Self::SenderClosed | Self::ElementClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
