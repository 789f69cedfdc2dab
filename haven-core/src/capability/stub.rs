//! In-process capability implementations.
//!
//! Used by the headless host (stdin drives the transcript and position
//! streams) and by tests. The channel-backed sources hand out a fresh
//! stream on every `start()`/`watch()`, so they can be stopped and started
//! again like a real recogniser.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    Ack, CapabilityError, NotificationGateway, PoiHit, PoiService, PositionSignal,
    PositionTracker, TranscriptEvent, TranscriptSignal, TranscriptSource,
};
use crate::directory::geo::Position;
use crate::directory::registry::LocationCategory;
use crate::dispatch::payload::AlertPayload;
use crate::error::{HavenError, Result};
use crate::ipc::events::Channel;

const STREAM_CAP: usize = 64;

type Slot<T> = Arc<Mutex<Option<mpsc::Sender<T>>>>;

fn push_to<T>(slot: &Slot<T>, item: T) -> bool {
    match slot.lock().as_ref() {
        Some(tx) => tx.try_send(item).is_ok(),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Transcript
// ---------------------------------------------------------------------------

/// Transcript source fed by hand through a [`TranscriptFeed`].
pub struct ChannelTranscriptSource {
    slot: Slot<TranscriptSignal>,
    start_error: Option<CapabilityError>,
}

/// Producer half of a [`ChannelTranscriptSource`].
#[derive(Clone)]
pub struct TranscriptFeed {
    slot: Slot<TranscriptSignal>,
}

impl ChannelTranscriptSource {
    pub fn new() -> (Self, TranscriptFeed) {
        let slot: Slot<TranscriptSignal> = Arc::new(Mutex::new(None));
        (
            Self {
                slot: Arc::clone(&slot),
                start_error: None,
            },
            TranscriptFeed { slot },
        )
    }

    /// Make every `start()` fail with `err` (e.g. no speech engine).
    pub fn failing(err: CapabilityError) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            start_error: Some(err),
        }
    }
}

impl TranscriptSource for ChannelTranscriptSource {
    fn start(&mut self) -> std::result::Result<mpsc::Receiver<TranscriptSignal>, CapabilityError> {
        if let Some(err) = self.start_error {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(STREAM_CAP);
        *self.slot.lock() = Some(tx);
        debug!("channel transcript source started");
        Ok(rx)
    }

    fn stop(&mut self) {
        self.slot.lock().take();
        debug!("channel transcript source stopped");
    }
}

impl TranscriptFeed {
    /// Push a segment. Returns `false` when the source is not started.
    pub fn say(&self, text: impl Into<String>, is_final: bool) -> bool {
        push_to(
            &self.slot,
            TranscriptSignal::Segment(TranscriptEvent::new(text, is_final)),
        )
    }

    /// Push a mid-stream failure.
    pub fn fail(&self, err: CapabilityError) -> bool {
        push_to(&self.slot, TranscriptSignal::Error(err))
    }

    pub fn is_active(&self) -> bool {
        self.slot.lock().is_some()
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// Position tracker fed by hand through a [`PositionFeed`].
pub struct ChannelPositionTracker {
    slot: Slot<PositionSignal>,
    start_error: Option<CapabilityError>,
}

/// Producer half of a [`ChannelPositionTracker`].
#[derive(Clone)]
pub struct PositionFeed {
    slot: Slot<PositionSignal>,
}

impl ChannelPositionTracker {
    pub fn new() -> (Self, PositionFeed) {
        let slot: Slot<PositionSignal> = Arc::new(Mutex::new(None));
        (
            Self {
                slot: Arc::clone(&slot),
                start_error: None,
            },
            PositionFeed { slot },
        )
    }

    pub fn failing(err: CapabilityError) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            start_error: Some(err),
        }
    }
}

impl PositionTracker for ChannelPositionTracker {
    fn watch(&mut self) -> std::result::Result<mpsc::Receiver<PositionSignal>, CapabilityError> {
        if let Some(err) = self.start_error {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(STREAM_CAP);
        *self.slot.lock() = Some(tx);
        Ok(rx)
    }

    fn stop(&mut self) {
        self.slot.lock().take();
    }
}

impl PositionFeed {
    pub fn move_to(&self, position: Position) -> bool {
        push_to(&self.slot, PositionSignal::Sample(position))
    }

    pub fn fail(&self, err: CapabilityError) -> bool {
        push_to(&self.slot, PositionSignal::Error(err))
    }
}

// ---------------------------------------------------------------------------
// Points of interest
// ---------------------------------------------------------------------------

/// POI service answering from a fixed table, or failing on demand.
#[derive(Default)]
pub struct StaticPoiService {
    hits: HashMap<LocationCategory, Vec<PoiHit>>,
    fail: bool,
}

impl StaticPoiService {
    pub fn empty() -> Self {
        Self::default()
    }

    /// A service whose every query errors.
    pub fn unreachable() -> Self {
        Self {
            hits: HashMap::new(),
            fail: true,
        }
    }

    pub fn with_hits(mut self, category: LocationCategory, hits: Vec<PoiHit>) -> Self {
        self.hits.insert(category, hits);
        self
    }
}

#[async_trait]
impl PoiService for StaticPoiService {
    async fn query(
        &self,
        _center: Position,
        _radius_m: u32,
        category: LocationCategory,
    ) -> Result<Vec<PoiHit>> {
        if self.fail {
            return Err(HavenError::PoiQuery("service unreachable".into()));
        }
        Ok(self.hits.get(&category).cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Dry-run gateway: logs and records every payload instead of delivering it.
///
/// Failures can be scripted per channel to exercise the retry path.
#[derive(Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<(Channel, AlertPayload)>>,
    attempts: Mutex<HashMap<Channel, u32>>,
    failures_left: Mutex<HashMap<Channel, u32>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` attempts on `channel` (`u32::MAX` = always).
    pub fn failing(self, channel: Channel, count: u32) -> Self {
        self.failures_left.lock().insert(channel, count);
        self
    }

    /// Payloads accepted so far, in delivery order.
    pub fn delivered(&self) -> Vec<(Channel, AlertPayload)> {
        self.sent.lock().clone()
    }

    /// Number of accepted payloads on `channel`.
    pub fn delivered_on(&self, channel: Channel) -> usize {
        self.sent.lock().iter().filter(|(c, _)| *c == channel).count()
    }

    /// Number of `send` calls on `channel`, successful or not.
    pub fn attempts_on(&self, channel: Channel) -> u32 {
        self.attempts.lock().get(&channel).copied().unwrap_or(0)
    }
}

#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn send(&self, channel: Channel, payload: &AlertPayload) -> Result<Ack> {
        *self.attempts.lock().entry(channel).or_insert(0) += 1;

        {
            let mut failures = self.failures_left.lock();
            if let Some(left) = failures.get_mut(&channel) {
                if *left > 0 {
                    if *left != u32::MAX {
                        *left -= 1;
                    }
                    return Err(HavenError::Gateway(format!("{channel} scripted failure")));
                }
            }
        }

        info!(
            %channel,
            recipients = payload.recipients.len(),
            message = %payload.message,
            "dry-run delivery"
        );
        let mut sent = self.sent.lock();
        sent.push((channel, payload.clone()));
        Ok(Ack {
            channel,
            reference: Some(format!("dry-run-{}", sent.len())),
        })
    }
}
