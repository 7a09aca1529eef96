//! Ion SFU (Selective Forwarding Unit)
//!
//! Relays encoded RTP between WebRTC peers without transcoding. Every track
//! a peer publishes is forwarded to every other peer of the same session,
//! with per-subscriber numbering, NACK retransmission from a short
//! retention buffer, and keyframe-gated simulcast layer switching.
//!
//! ## Architecture
//!
//! - **[`Sfu`]**: Registry of sessions and the shared negotiation engine
//! - **[`Session`]**: The transports of one call; fans new tracks out
//! - **[`WebRtcTransport`]**: One peer connection, its router and senders
//! - **[`Router`]**: Receivers of one publisher and their RTCP feedback
//! - **[`Receiver`]**: Inbound track buffer and subscriber fan-out
//! - **[`Sender`]**: Outbound forwarding ([`SimpleSender`], [`SimulcastSender`])
//! - **[`process`]**: Elements consuming forwarded media (e.g. [`WebmSaver`])
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ion_sfu::{Config, SessionId, Sfu};
//!
//! let sfu = Sfu::new(Config::load(None)?)?;
//! let transport = sfu.new_transport(&SessionId::from("room")).await?;
//! transport.set_remote_description(offer).await?;
//! let answer = transport.create_answer().await?;
//! transport.set_local_description(answer.clone()).await?;
//! ```

pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod process;
pub mod receiver;
pub mod router;
pub mod sender;
pub mod session;
pub mod sfu;
pub mod track;
pub mod transport;
pub mod types;

pub use config::{Config, ElementsConfig, LoggingConfig, SfuConfig, TurnServer, WebRtcConfig};
pub use error::{Error, Result};
pub use process::{get_element, Element, Recorder, Sample, WebmSaver, TYPE_WEBM_SAVER};
pub use receiver::{Receiver, ReceiverStats};
pub use router::{ExtMap, Router};
pub use sender::{RtpWriter, Sender, SenderStats, SimpleSender, SimulcastSender};
pub use session::Session;
pub use sfu::Sfu;
pub use track::{QualityLayer, TrackInfo, TrackKind};
pub use transport::WebRtcTransport;
pub use types::{SenderId, SessionId, StreamId, TrackId, TransportId};
