//! The single-writer engine task.
//!
//! ```text
//!  commands ─────┐
//!  countdown ticks ─┤
//!  channel outcomes ─┼─► select! ─► SessionMachine ─► effects ─► timer / dispatcher / event bus
//!  transcript stream ─┤                  ▲
//!  position stream ──┘             TriggerListener
//! ```
//!
//! Everything that mutates the session happens here, one input at a time.
//! A confirm racing the last countdown tick is decided by whichever reaches
//! the queue first; the loser is dropped by the state guard.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::EngineConfig;
use crate::{
    capability::{
        CapabilityError, PositionSignal, PositionTracker, TranscriptSignal, TranscriptSource,
    },
    directory::{geo::Position, LocationDirectory},
    dispatch::{payload::DispatchRequest, ChannelOutcome, DispatchCoordinator},
    error::{HavenError, Result},
    ipc::events::{EngineEvent, EngineSnapshot, ErrorKind, SessionOrigin, SessionState},
    session::{
        timer::{CountdownTimer, Tick},
        Effect, SessionMachine, Transition,
    },
    trigger::{TriggerDetected, TriggerListener},
};

/// Requests from `EmergencyEngine` handles. Each carries its reply channel.
pub(crate) enum Command {
    Activate {
        reply: oneshot::Sender<EngineSnapshot>,
    },
    Confirm {
        reply: oneshot::Sender<EngineSnapshot>,
    },
    Cancel {
        reply: oneshot::Sender<EngineSnapshot>,
    },
    Reset {
        reply: oneshot::Sender<EngineSnapshot>,
    },
    StartListening {
        source: Box<dyn TranscriptSource>,
        reply: oneshot::Sender<Result<()>>,
    },
    StopListening {
        reply: oneshot::Sender<()>,
    },
    StartTracking {
        tracker: Box<dyn PositionTracker>,
        reply: oneshot::Sender<Result<()>>,
    },
    StopTracking {
        reply: oneshot::Sender<()>,
    },
    UpdatePosition {
        position: Position,
        reply: oneshot::Sender<()>,
    },
    SimulateTrigger {
        text: String,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// All state needed by the engine task.
pub(crate) struct RunnerContext {
    pub config: EngineConfig,
    pub commands: mpsc::Receiver<Command>,
    pub events: broadcast::Sender<EngineEvent>,
    pub snapshot: Arc<Mutex<EngineSnapshot>>,
    pub position: Arc<RwLock<Option<Position>>>,
    pub directory: Arc<LocationDirectory>,
    pub coordinator: Arc<DispatchCoordinator>,
}

/// A started capability together with the stream it handed back.
struct Attached<C: ?Sized, T> {
    handle: Box<C>,
    rx: mpsc::Receiver<T>,
}

type TranscriptStream = Attached<dyn TranscriptSource, TranscriptSignal>;
type PositionStream = Attached<dyn PositionTracker, PositionSignal>;

/// Next item from an attached stream; pends forever when nothing is attached.
async fn next_signal<C: ?Sized, T>(slot: &mut Option<Attached<C, T>>) -> Option<T> {
    match slot {
        Some(attached) => attached.rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Run the engine until `Shutdown` or every handle is dropped.
pub(crate) async fn run(ctx: RunnerContext) {
    let mut runner = Runner::new(ctx);
    runner.run().await;
    info!("emergency engine stopped");
}

struct Runner {
    config: EngineConfig,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<EngineEvent>,
    snapshot: Arc<Mutex<EngineSnapshot>>,
    position: Arc<RwLock<Option<Position>>>,
    directory: Arc<LocationDirectory>,
    coordinator: Arc<DispatchCoordinator>,

    machine: SessionMachine,
    listener: TriggerListener,
    timer: Option<CountdownTimer>,
    tick_tx: mpsc::UnboundedSender<Tick>,
    tick_rx: mpsc::UnboundedReceiver<Tick>,
    outcome_tx: mpsc::UnboundedSender<ChannelOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<ChannelOutcome>,
    transcript: Option<TranscriptStream>,
    tracking: Option<PositionStream>,
    /// Set after a non-fatal position error is published; cleared by the next sample.
    position_error_reported: bool,
    refreshes: JoinSet<()>,
}

impl Runner {
    fn new(ctx: RunnerContext) -> Self {
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            machine: SessionMachine::new(ctx.config.countdown_ticks),
            listener: TriggerListener::new(ctx.config.trigger_words.clone()),
            config: ctx.config,
            commands: ctx.commands,
            events: ctx.events,
            snapshot: ctx.snapshot,
            position: ctx.position,
            directory: ctx.directory,
            coordinator: ctx.coordinator,
            timer: None,
            tick_tx,
            tick_rx,
            outcome_tx,
            outcome_rx,
            transcript: None,
            tracking: None,
            position_error_reported: false,
            refreshes: JoinSet::new(),
        }
    }

    async fn run(&mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        debug!("all engine handles dropped");
                        self.detach_all();
                        break;
                    }
                },
                Some(tick) = self.tick_rx.recv() => {
                    let transition = self.machine.tick(tick.session_id);
                    self.apply(transition);
                }
                Some(outcome) = self.outcome_rx.recv() => {
                    let transition = self.machine.channel_update(&outcome);
                    self.apply(transition);
                }
                signal = next_signal(&mut self.transcript) => match signal {
                    Some(signal) => self.on_transcript(signal),
                    None => {
                        debug!("transcript stream closed");
                        self.transcript = None;
                        self.listener.stop();
                    }
                },
                signal = next_signal(&mut self.tracking) => match signal {
                    Some(signal) => self.on_position_signal(signal),
                    None => {
                        debug!("position stream closed");
                        self.tracking = None;
                    }
                },
                Some(joined) = self.refreshes.join_next(), if !self.refreshes.is_empty() => {
                    if let Err(e) = joined {
                        if !e.is_cancelled() {
                            error!("location refresh task lost: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Returns `false` when the loop should exit.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Activate { reply } => {
                let position = *self.position.read();
                let transition = self.machine.activate(SessionOrigin::Manual, position);
                self.apply(transition);
                let _ = reply.send(self.machine.snapshot());
            }
            Command::Confirm { reply } => {
                let transition = self.machine.confirm();
                self.apply(transition);
                let _ = reply.send(self.machine.snapshot());
            }
            Command::Cancel { reply } => {
                let transition = self.machine.cancel();
                self.apply(transition);
                let _ = reply.send(self.machine.snapshot());
            }
            Command::Reset { reply } => {
                let transition = self.machine.reset();
                self.apply(transition);
                let _ = reply.send(self.machine.snapshot());
            }
            Command::StartListening { source, reply } => {
                let _ = reply.send(self.start_listening(source));
            }
            Command::StopListening { reply } => {
                self.stop_listening();
                let _ = reply.send(());
            }
            Command::StartTracking { tracker, reply } => {
                let _ = reply.send(self.start_tracking(tracker));
            }
            Command::StopTracking { reply } => {
                self.stop_tracking();
                let _ = reply.send(());
            }
            Command::UpdatePosition { position, reply } => {
                self.accept_position(position);
                let _ = reply.send(());
            }
            Command::SimulateTrigger { text, reply } => {
                let opened = self.simulate_trigger(&text);
                let _ = reply.send(opened);
            }
            Command::Shutdown { reply } => {
                info!("engine shutdown requested");
                self.detach_all();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    // ── Effects ──────────────────────────────────────────────────────────────

    fn apply(&mut self, transition: Transition) {
        let before = self.snapshot.lock().state;
        for effect in transition.effects {
            match effect {
                Effect::StartTimer { session_id } => {
                    self.timer = Some(CountdownTimer::start(
                        session_id,
                        self.config.tick_interval,
                        self.tick_tx.clone(),
                    ));
                }
                Effect::StopTimer => {
                    if let Some(timer) = self.timer.take() {
                        timer.stop();
                    }
                }
                Effect::Dispatch {
                    session_id,
                    position,
                } => self.dispatch(session_id, position),
                Effect::ReleaseDispatch { session_id } => self.coordinator.forget(session_id),
                Effect::Publish(event) => self.publish(event),
            }
        }

        let after = self.machine.snapshot();
        let settled = after.state == SessionState::Idle && before != SessionState::Idle;
        *self.snapshot.lock() = after;
        if settled {
            self.listener.session_settled();
        }
    }

    fn dispatch(&mut self, session_id: Uuid, position: Option<Position>) {
        if position.is_none() {
            warn!(%session_id, "no position known; dispatching without coordinates");
            self.publish(EngineEvent::CapabilityError {
                kind: ErrorKind::LocationUnavailable,
                detail: "dispatching without coordinates".into(),
            });
        }
        let request = DispatchRequest {
            session_id,
            sender_name: self.config.sender_name.clone(),
            position,
            contacts: self.config.contacts.clone(),
            created_at: Utc::now(),
        };
        self.coordinator.dispatch(&request, self.outcome_tx.clone());
    }

    fn publish(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ── Trigger words ────────────────────────────────────────────────────────

    fn start_listening(&mut self, mut source: Box<dyn TranscriptSource>) -> Result<()> {
        self.stop_listening();
        self.listener.start(self.config.trigger_words.clone());
        match source.start() {
            Ok(rx) => {
                self.transcript = Some(Attached { handle: source, rx });
                Ok(())
            }
            Err(err) => {
                self.transcript_failed(err);
                Err(capability_error(err, "speech recognition"))
            }
        }
    }

    fn stop_listening(&mut self) {
        if let Some(mut attached) = self.transcript.take() {
            attached.handle.stop();
        }
        self.listener.stop();
    }

    fn on_transcript(&mut self, signal: TranscriptSignal) {
        match signal {
            TranscriptSignal::Segment(event) => {
                if self.machine.state() != SessionState::Idle {
                    debug!(state = %self.machine.state(), "transcript ignored during session");
                    return;
                }
                if let Some(detected) = self.listener.on_event(&event) {
                    self.open_voice_session(detected);
                }
            }
            TranscriptSignal::Error(err) if !err.is_fatal() => {
                warn!("transcript source hiccup: {err}");
            }
            TranscriptSignal::Error(err) => {
                if let Some(mut attached) = self.transcript.take() {
                    attached.handle.stop();
                }
                self.transcript_failed(err);
            }
        }
    }

    fn transcript_failed(&mut self, err: CapabilityError) {
        if let Some(kind) = self.listener.on_failure(err) {
            self.publish(EngineEvent::CapabilityError {
                kind,
                detail: format!("speech recognition: {err}"),
            });
        }
    }

    fn simulate_trigger(&mut self, text: &str) -> bool {
        let state = self.machine.state();
        if state != SessionState::Idle {
            debug!(%state, "simulated trigger ignored during session");
            self.publish(EngineEvent::Ignored {
                command: "trigger".into(),
                state,
            });
            return false;
        }
        match self.listener.on_simulated(text) {
            Some(detected) => self.open_voice_session(detected),
            None => false,
        }
    }

    fn open_voice_session(&mut self, detected: TriggerDetected) -> bool {
        self.publish(EngineEvent::TriggerDetected {
            matched_text: detected.matched_text.clone(),
            word: detected.word.clone(),
            language: detected.language,
        });
        let position = *self.position.read();
        let transition = self.machine.activate(
            SessionOrigin::Voice {
                matched_text: detected.matched_text,
                word: detected.word,
            },
            position,
        );
        let opened = transition.accepted;
        self.apply(transition);
        opened
    }

    // ── Position ─────────────────────────────────────────────────────────────

    fn start_tracking(&mut self, mut tracker: Box<dyn PositionTracker>) -> Result<()> {
        self.stop_tracking();
        match tracker.watch() {
            Ok(rx) => {
                info!("position tracking started");
                self.position_error_reported = false;
                self.tracking = Some(Attached {
                    handle: tracker,
                    rx,
                });
                Ok(())
            }
            Err(err) => {
                self.position_failed(err);
                Err(capability_error(err, "positioning"))
            }
        }
    }

    fn stop_tracking(&mut self) {
        if let Some(mut attached) = self.tracking.take() {
            attached.handle.stop();
            info!("position tracking stopped");
        }
    }

    fn on_position_signal(&mut self, signal: PositionSignal) {
        match signal {
            PositionSignal::Sample(position) => self.accept_position(position),
            PositionSignal::Error(err) if err.is_fatal() => {
                self.stop_tracking();
                self.position_failed(err);
            }
            PositionSignal::Error(err) => {
                if !self.position_error_reported {
                    self.position_error_reported = true;
                    self.position_failed(err);
                }
            }
        }
    }

    fn position_failed(&self, err: CapabilityError) {
        warn!("position tracker failed: {err}");
        self.publish(EngineEvent::CapabilityError {
            kind: err.kind(),
            detail: format!("positioning: {err}"),
        });
    }

    fn accept_position(&mut self, position: Position) {
        debug!(lat = position.lat, lng = position.lng, "position sample");
        *self.position.write() = Some(position);
        self.position_error_reported = false;
        self.machine.update_position(position);
        *self.snapshot.lock() = self.machine.snapshot();
        self.spawn_refresh(position);
    }

    fn spawn_refresh(&mut self, position: Position) {
        let directory = Arc::clone(&self.directory);
        let events = self.events.clone();
        self.refreshes.spawn(async move {
            let report = directory.refresh(position).await;
            if !report.applied {
                return;
            }
            if !report.failures.is_empty() {
                let detail = report
                    .failures
                    .iter()
                    .map(|(category, reason)| format!("{category}: {reason}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                let _ = events.send(EngineEvent::CapabilityError {
                    kind: ErrorKind::PoiQueryFailed,
                    detail,
                });
            }
            let _ = events.send(EngineEvent::LocationsUpdated {
                dynamic_count: report.dynamic_count,
            });
        });
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    fn detach_all(&mut self) {
        self.stop_listening();
        self.stop_tracking();
        if let Some(timer) = self.timer.take() {
            timer.stop();
        }
        self.refreshes.abort_all();
    }
}

fn capability_error(err: CapabilityError, capability: &str) -> HavenError {
    match err {
        CapabilityError::Unsupported => HavenError::Unsupported(capability.to_string()),
        CapabilityError::PermissionDenied => HavenError::PermissionDenied(capability.to_string()),
        CapabilityError::Unavailable => HavenError::LocationUnavailable(capability.to_string()),
    }
}
