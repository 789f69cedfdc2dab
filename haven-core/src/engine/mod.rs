//! `EmergencyEngine`: top-level handle over the single-writer engine task.
//!
//! ## Lifecycle
//!
//! ```text
//! EmergencyEngine::new()          → engine task spawned, state = Idle
//!     ├─► start_listening(src)    → transcript segments feed the trigger listener
//!     ├─► start_tracking(trk)     → position samples update sessions + POI refresh
//!     ├─► activate() / trigger    → CountdownPending, countdown timer running
//!     │     ├─► cancel()          → Cancelled → Idle
//!     │     └─► ticks / confirm   → Confirmed → Dispatching → Completed
//!     │                                              └─► reset() → Idle
//!     └─► shutdown()              → streams stopped, task exits
//! ```
//!
//! ## Threading
//!
//! All session state lives in one spawned task (see [`runner`]). Public
//! methods send a command over an mpsc channel and await the reply, so they
//! resolve only after the command has been applied and return the resulting
//! snapshot. Read-only views (`state()`, `query_locations()`) come from
//! shared cells that the task updates after every transition.

pub mod runner;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    capability::{Ack, NotificationGateway, PoiService, PositionTracker, TranscriptSource},
    directory::{
        geo::Position,
        registry::{LocationCategory, RankedLocation},
        DirectoryConfig, LocationDirectory,
    },
    dispatch::{
        payload::Contact,
        DispatchConfig, DispatchCoordinator,
    },
    error::{HavenError, Result},
    ipc::events::{EngineEvent, EngineSnapshot},
    trigger::TriggerWordSet,
};
use runner::{Command, RunnerContext};

/// Broadcast channel capacity: 256 events buffered for slow subscribers.
const BROADCAST_CAP: usize = 256;
/// Pending commands before callers start waiting on the queue.
const COMMAND_CAP: usize = 64;

/// Receiving end of the event bus. Dropping it unsubscribes.
pub type Subscription = broadcast::Receiver<EngineEvent>;

/// Configuration for `EmergencyEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Countdown length in ticks before dispatch. Default: 10.
    pub countdown_ticks: u32,
    /// Duration of one tick. Default: 1 s.
    pub tick_interval: Duration,
    /// Name used in alert messages.
    pub sender_name: String,
    /// Who gets notified.
    pub contacts: Vec<Contact>,
    pub trigger_words: TriggerWordSet,
    pub dispatch: DispatchConfig,
    pub directory: DirectoryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            countdown_ticks: 10,
            tick_interval: Duration::from_secs(1),
            sender_name: "Haven user".into(),
            contacts: Vec::new(),
            trigger_words: TriggerWordSet::builtin(),
            dispatch: DispatchConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

/// The top-level engine handle.
///
/// `EmergencyEngine` is `Send + Sync`; wrap it in an `Arc` to share it
/// between a UI layer and event-forwarding tasks.
pub struct EmergencyEngine {
    commands: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<EngineEvent>,
    /// Last snapshot written by the engine task.
    snapshot: Arc<Mutex<EngineSnapshot>>,
    /// Latest accepted position sample.
    position: Arc<RwLock<Option<Position>>>,
    directory: Arc<LocationDirectory>,
    coordinator: Arc<DispatchCoordinator>,
    sender_name: String,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EmergencyEngine {
    /// Spawn the engine task. Must be called from within a Tokio runtime.
    pub fn new(
        config: EngineConfig,
        gateway: Arc<dyn NotificationGateway>,
        poi: Arc<dyn PoiService>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (commands, command_rx) = mpsc::channel(COMMAND_CAP);
        let snapshot = Arc::new(Mutex::new(EngineSnapshot::idle()));
        let position = Arc::new(RwLock::new(None));
        let directory = Arc::new(LocationDirectory::new(config.directory.clone(), poi));
        let coordinator = Arc::new(DispatchCoordinator::new(gateway, config.dispatch.clone()));
        let sender_name = config.sender_name.clone();

        info!(
            countdown_ticks = config.countdown_ticks,
            contacts = config.contacts.len(),
            trigger_words = config.trigger_words.len(),
            "emergency engine starting"
        );

        let task = tokio::spawn(runner::run(RunnerContext {
            config,
            commands: command_rx,
            events: events_tx.clone(),
            snapshot: Arc::clone(&snapshot),
            position: Arc::clone(&position),
            directory: Arc::clone(&directory),
            coordinator: Arc::clone(&coordinator),
        }));

        Self {
            commands,
            events_tx,
            snapshot,
            position,
            directory,
            coordinator,
            sender_name,
            task: Mutex::new(Some(task)),
        }
    }

    /// Open a session manually (panic button) and start the countdown.
    ///
    /// Ignored unless Idle.
    pub async fn activate(&self) -> Result<EngineSnapshot> {
        self.request(|reply| Command::Activate { reply }).await
    }

    /// Skip the remaining countdown and dispatch now.
    pub async fn confirm_now(&self) -> Result<EngineSnapshot> {
        self.request(|reply| Command::Confirm { reply }).await
    }

    /// Abort the countdown. Ignored once dispatch has begun.
    pub async fn cancel(&self) -> Result<EngineSnapshot> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    /// Return a Completed session to Idle.
    pub async fn reset(&self) -> Result<EngineSnapshot> {
        self.request(|reply| Command::Reset { reply }).await
    }

    /// Current snapshot.
    pub fn state(&self) -> EngineSnapshot {
        self.snapshot.lock().clone()
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> Subscription {
        self.events_tx.subscribe()
    }

    /// Safe locations ranked against the latest position, if any.
    pub fn query_locations(&self, category: Option<LocationCategory>) -> Vec<RankedLocation> {
        let position = *self.position.read();
        self.directory.query(position, category)
    }

    pub fn latest_position(&self) -> Option<Position> {
        *self.position.read()
    }

    /// Attach a transcript source and begin matching trigger words.
    ///
    /// Replaces any source already attached.
    ///
    /// # Errors
    /// - `Unsupported` / `PermissionDenied` when the source refuses to start
    ///   (also published once as `CapabilityError`).
    /// - `EngineStopped` when the engine task is gone.
    pub async fn start_listening(&self, source: Box<dyn TranscriptSource>) -> Result<()> {
        self.request(|reply| Command::StartListening { source, reply })
            .await?
    }

    pub async fn stop_listening(&self) -> Result<()> {
        self.request(|reply| Command::StopListening { reply }).await
    }

    /// Attach a position tracker.
    ///
    /// # Errors
    /// Same as [`start_listening`](Self::start_listening).
    pub async fn start_tracking(&self, tracker: Box<dyn PositionTracker>) -> Result<()> {
        self.request(|reply| Command::StartTracking { tracker, reply })
            .await?
    }

    pub async fn stop_tracking(&self) -> Result<()> {
        self.request(|reply| Command::StopTracking { reply }).await
    }

    /// Feed one position sample, exactly as if the tracker had produced it.
    pub async fn update_position(&self, position: Position) -> Result<()> {
        self.request(|reply| Command::UpdatePosition { position, reply })
            .await
    }

    /// Route `text` through the trigger listener as a final transcript.
    ///
    /// Returns `true` when it opened a session.
    pub async fn simulate_trigger(&self, text: impl Into<String>) -> Result<bool> {
        let text = text.into();
        self.request(|reply| Command::SimulateTrigger { text, reply })
            .await
    }

    /// Send one test SMS to `contact`. Does not touch session state.
    ///
    /// # Errors
    /// `InvalidContact`, or `ChannelDeliveryFailed` after retries.
    pub async fn send_test_alert(&self, contact: &Contact) -> Result<Ack> {
        self.coordinator
            .send_test_alert(&self.sender_name, contact)
            .await
    }

    /// Stop every stream and timer and wait for the engine task to exit.
    ///
    /// Later calls on this handle return `EngineStopped`.
    pub async fn shutdown(&self) -> Result<()> {
        let acked = self.request(|reply| Command::Shutdown { reply }).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("engine task ended abnormally: {e}");
            }
        }
        acked
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| HavenError::EngineStopped)?;
        rx.await.map_err(|_| HavenError::EngineStopped)
    }
}

impl Drop for EmergencyEngine {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
