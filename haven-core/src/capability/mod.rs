//! Capability traits for everything the engine consumes from the platform.
//!
//! Speech recognition, positioning, the points-of-interest lookup and the
//! notification transport are all injected through these traits, so the
//! engine never depends on a particular browser, OS or vendor SDK. Tests and
//! the headless host use the channel-backed implementations in [`stub`].
//!
//! Streaming capabilities (`TranscriptSource`, `PositionTracker`) hand the
//! engine a `tokio::sync::mpsc::Receiver` on start; request/response
//! capabilities (`PoiService`, `NotificationGateway`) are async traits.

pub mod stub;

#[cfg(feature = "http")]
pub mod overpass;
#[cfg(feature = "http")]
pub mod webhook;

#[cfg(feature = "http")]
pub use overpass::OverpassPoiService;
#[cfg(feature = "http")]
pub use webhook::WebhookGateway;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::directory::geo::Position;
use crate::directory::registry::LocationCategory;
use crate::dispatch::payload::AlertPayload;
use crate::error::Result;
use crate::ipc::events::{Channel, ErrorKind};

/// Failure reported by a streaming capability, either on start or mid-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("capability is not supported on this platform")]
    Unsupported,
    #[error("permission was denied")]
    PermissionDenied,
    #[error("capability is temporarily unavailable")]
    Unavailable,
}

impl CapabilityError {
    pub fn kind(self) -> ErrorKind {
        match self {
            Self::Unsupported => ErrorKind::Unsupported,
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::Unavailable => ErrorKind::LocationUnavailable,
        }
    }

    /// Whether the stream should be torn down after this error.
    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::Unavailable)
    }
}

// ---------------------------------------------------------------------------
// Speech
// ---------------------------------------------------------------------------

/// One recognised speech segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    pub text: String,
    /// `false` for interim hypotheses that may still change.
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEvent {
    pub fn new(text: impl Into<String>, is_final: bool) -> Self {
        Self {
            text: text.into(),
            is_final,
            timestamp: Utc::now(),
        }
    }
}

/// Item delivered on a transcript stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptSignal {
    Segment(TranscriptEvent),
    Error(CapabilityError),
}

/// Live speech-to-text stream.
pub trait TranscriptSource: Send + 'static {
    /// Begin recognition and return the segment stream.
    ///
    /// # Errors
    /// `Unsupported` when no recogniser exists, `PermissionDenied` when the
    /// microphone is refused.
    fn start(&mut self) -> std::result::Result<mpsc::Receiver<TranscriptSignal>, CapabilityError>;

    /// Stop recognition. The stream returned by `start()` closes.
    fn stop(&mut self);
}

// ---------------------------------------------------------------------------
// Positioning
// ---------------------------------------------------------------------------

/// Item delivered on a position stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PositionSignal {
    Sample(Position),
    Error(CapabilityError),
}

/// Continuous position updates (GPS, network location, ...).
pub trait PositionTracker: Send + 'static {
    /// Start watching and return the sample stream.
    ///
    /// # Errors
    /// `Unsupported` / `PermissionDenied` when positioning cannot start at all.
    fn watch(&mut self) -> std::result::Result<mpsc::Receiver<PositionSignal>, CapabilityError>;

    /// Stop watching. The stream returned by `watch()` closes.
    fn stop(&mut self);
}

// ---------------------------------------------------------------------------
// Points of interest
// ---------------------------------------------------------------------------

/// A place returned by the points-of-interest service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoiHit {
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    pub address: String,
}

/// External lookup of nearby police stations, hospitals, etc.
#[async_trait]
pub trait PoiService: Send + Sync + 'static {
    /// Places of `category` within `radius_m` metres of `center`.
    async fn query(
        &self,
        center: Position,
        radius_m: u32,
        category: LocationCategory,
    ) -> Result<Vec<PoiHit>>;
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Gateway acknowledgement of an accepted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub channel: Channel,
    /// Provider message id or similar, if the transport returns one.
    pub reference: Option<String>,
}

/// Transport that actually delivers SMS / email / location shares.
#[async_trait]
pub trait NotificationGateway: Send + Sync + 'static {
    /// Deliver one payload on one channel.
    ///
    /// # Errors
    /// Any error is treated as a transient failure and retried by the
    /// dispatch coordinator.
    async fn send(&self, channel: Channel, payload: &AlertPayload) -> Result<Ack>;
}
