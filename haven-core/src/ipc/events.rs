//! Event and snapshot types published on the engine's event bus.
//!
//! Every subscriber receives the same ordered stream of `EngineEvent`s via
//! `EmergencyEngine::subscribe()`. Presentation layers (CLI, desktop shell,
//! mobile bridge) render from these and never touch engine state directly.
//!
//! All types serialise with camelCase fields so hosts can forward them as-is.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::directory::geo::Position;

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// One notification delivery mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Share live coordinates with every contact.
    LocationShare,
    /// SMS-equivalent text to each contact's phone number.
    Sms,
    /// Email-equivalent message to each contact with an address.
    Email,
}

impl Channel {
    /// The fixed fan-out set, in dispatch order.
    pub const ALL: [Channel; 3] = [Channel::LocationShare, Channel::Sms, Channel::Email];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocationShare => "location_share",
            Self::Sms => "sms",
            Self::Email => "email",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of one channel within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Pending,
    Sent,
    Failed,
}

impl ChannelStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

// ---------------------------------------------------------------------------
// Session snapshots
// ---------------------------------------------------------------------------

/// Lifecycle state of the emergency workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No active session.
    Idle,
    /// Countdown running; the user may still cancel or confirm early.
    CountdownPending,
    /// Countdown finished or confirmed; dispatch about to start.
    Confirmed,
    /// Channels are being notified. Cannot be cancelled.
    Dispatching,
    /// Every channel reached Sent or Failed. Waiting for `reset()`.
    Completed,
    /// Countdown was cancelled. Published once, then the engine is Idle.
    Cancelled,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::CountdownPending => "countdown_pending",
            Self::Confirmed => "confirmed",
            Self::Dispatching => "dispatching",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SessionOrigin {
    /// Explicit `activate()` call (panic button).
    Manual,
    /// A trigger word was heard in the transcript stream.
    #[serde(rename_all = "camelCase")]
    Voice { matched_text: String, word: String },
}

/// Read-only copy of the active alert session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub state: SessionState,
    pub countdown_remaining_seconds: u32,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub position: Option<Position>,
    pub channel_status: BTreeMap<Channel, ChannelStatus>,
    pub origin: SessionOrigin,
}

/// What `EmergencyEngine::state()` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub state: SessionState,
    pub session: Option<SessionSnapshot>,
}

impl EngineSnapshot {
    pub fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            session: None,
        }
    }
}

impl Default for EngineSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

// ---------------------------------------------------------------------------
// Errors surfaced to subscribers
// ---------------------------------------------------------------------------

/// Failure classification published through `EngineEvent::CapabilityError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Capability missing entirely (no speech engine, no GPS).
    Unsupported,
    /// User or platform refused access.
    PermissionDenied,
    /// Position temporarily unknown; dispatch proceeds without coordinates.
    LocationUnavailable,
    /// A channel exhausted its retries.
    ChannelDeliveryFailed,
    /// The points-of-interest service failed or timed out.
    PoiQueryFailed,
}

// ---------------------------------------------------------------------------
// Engine events
// ---------------------------------------------------------------------------

/// Everything observable about the engine, in the order it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EngineEvent {
    /// The session state machine moved to a new state.
    StateChanged { snapshot: EngineSnapshot },
    /// One countdown tick elapsed.
    CountdownTick { session_id: Uuid, remaining: u32 },
    /// A transcript segment matched a trigger word.
    TriggerDetected {
        matched_text: String,
        word: String,
        language: String,
    },
    /// A channel reached a terminal status.
    ChannelUpdate {
        session_id: Uuid,
        channel: Channel,
        status: ChannelStatus,
        attempts: u32,
        error: Option<String>,
    },
    /// All channels are terminal; the session is Completed.
    DispatchCompleted {
        session_id: Uuid,
        sent: Vec<Channel>,
        failed: Vec<Channel>,
    },
    /// A capability reported a failure.
    CapabilityError { kind: ErrorKind, detail: String },
    /// The dynamic points-of-interest set was replaced.
    LocationsUpdated { dynamic_count: usize },
    /// A command was dropped by the state guard.
    Ignored { command: String, state: SessionState },
}
