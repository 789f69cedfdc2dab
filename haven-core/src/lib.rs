//! # haven-core
//!
//! Emergency trigger & dispatch engine SDK.
//!
//! ## Architecture
//!
//! ```text
//! TranscriptSource ─► TriggerListener ─┐
//!                                      ├─► SessionMachine (single-writer task)
//! activate / confirm / cancel / reset ─┘        │            │
//!                                      CountdownTimer   DispatchCoordinator
//!                                                             │
//!                                       LocationShare / Sms / Email via NotificationGateway
//!
//! PositionTracker ─► LocationDirectory ◄─ PoiService
//!
//! every transition ─► broadcast::Sender<EngineEvent>
//! ```
//!
//! Platform services (speech, positioning, POI lookup, notification
//! transport) are injected through the traits in [`capability`]. The
//! `http` feature adds Overpass and webhook implementations.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod capability;
pub mod directory;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod session;
pub mod trigger;

// Convenience re-exports for downstream crates
pub use capability::{
    Ack, CapabilityError, NotificationGateway, PoiHit, PoiService, PositionSignal,
    PositionTracker, TranscriptEvent, TranscriptSignal, TranscriptSource,
};
pub use directory::{
    geo::Position,
    registry::{LocationCategory, RankedLocation, SafeLocation},
    DirectoryConfig, LocationDirectory,
};
pub use dispatch::{payload::Contact, DispatchConfig, DispatchCoordinator};
pub use engine::{EmergencyEngine, EngineConfig, Subscription};
pub use error::HavenError;
pub use ipc::events::{
    Channel, ChannelStatus, EngineEvent, EngineSnapshot, ErrorKind, SessionOrigin,
    SessionSnapshot, SessionState,
};
pub use trigger::{TriggerListener, TriggerWordSet};

#[cfg(feature = "http")]
pub use capability::{OverpassPoiService, WebhookGateway};
