//! Emergency session state machine.
//!
//! ## States
//!
//! ```text
//!   Idle ──activate──► CountdownPending ──tick×N / confirm──► Confirmed ──► Dispatching
//!    ▲                        │                                                │
//!    │                     cancel                                   all channels terminal
//!    │                        ▼                                                ▼
//!    └──────────────── Cancelled (published)                              Completed
//!    └─────────────────────────────── reset ─────────────────────────────────┘
//! ```
//!
//! `SessionMachine` is synchronous and does no I/O. Every operation returns
//! a [`Transition`] listing the effects the engine task must carry out
//! (start/stop the countdown timer, hand a request to the dispatcher,
//! publish events). Commands that do not apply in the current state are
//! reported as not accepted and produce a single `Ignored` event.

pub mod timer;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::directory::geo::Position;
use crate::dispatch::ChannelOutcome;
use crate::ipc::events::{
    Channel, ChannelStatus, EngineEvent, EngineSnapshot, SessionOrigin, SessionSnapshot,
    SessionState,
};

/// The single active emergency session.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertSession {
    pub id: Uuid,
    pub state: SessionState,
    pub countdown_remaining_seconds: u32,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub position: Option<Position>,
    pub channel_status: BTreeMap<Channel, ChannelStatus>,
    pub origin: SessionOrigin,
}

impl AlertSession {
    fn new(origin: SessionOrigin, countdown: u32, position: Option<Position>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::CountdownPending,
            countdown_remaining_seconds: countdown,
            created_at: Utc::now(),
            confirmed_at: None,
            position,
            channel_status: BTreeMap::new(),
            origin,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            state: self.state,
            countdown_remaining_seconds: self.countdown_remaining_seconds,
            created_at: self.created_at,
            confirmed_at: self.confirmed_at,
            position: self.position,
            channel_status: self.channel_status.clone(),
            origin: self.origin.clone(),
        }
    }

    fn all_channels_terminal(&self) -> bool {
        !self.channel_status.is_empty() && self.channel_status.values().all(|s| s.is_terminal())
    }
}

/// Side effect requested by a transition, executed by the engine task in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartTimer { session_id: Uuid },
    StopTimer,
    Dispatch {
        session_id: Uuid,
        position: Option<Position>,
    },
    /// The session is closed; its dispatch ledger can be released.
    ReleaseDispatch { session_id: Uuid },
    Publish(EngineEvent),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transition {
    /// `false` when the state guard dropped the command.
    pub accepted: bool,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn accepted() -> Self {
        Self {
            accepted: true,
            effects: Vec::new(),
        }
    }

    /// Dropped silently (stale timer tick, late outcome).
    fn dropped() -> Self {
        Self::default()
    }

    fn push(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    /// Events this transition will publish, in order.
    pub fn events(&self) -> impl Iterator<Item = &EngineEvent> {
        self.effects.iter().filter_map(|e| match e {
            Effect::Publish(event) => Some(event),
            _ => None,
        })
    }

    pub fn dispatches(&self) -> bool {
        self.effects
            .iter()
            .any(|e| matches!(e, Effect::Dispatch { .. }))
    }
}

/// Owns the (at most one) session. Lives inside the engine task.
#[derive(Debug)]
pub struct SessionMachine {
    countdown_ticks: u32,
    session: Option<AlertSession>,
}

impl SessionMachine {
    pub fn new(countdown_ticks: u32) -> Self {
        Self {
            countdown_ticks,
            session: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Idle, |s| s.state)
    }

    pub fn session(&self) -> Option<&AlertSession> {
        self.session.as_ref()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state: self.state(),
            session: self.session.as_ref().map(AlertSession::snapshot),
        }
    }

    /// Open a session and start the countdown. Only valid from Idle.
    pub fn activate(&mut self, origin: SessionOrigin, position: Option<Position>) -> Transition {
        if self.session.is_some() {
            return self.ignored("activate");
        }
        let session = AlertSession::new(origin, self.countdown_ticks, position);
        let session_id = session.id;
        info!(
            %session_id,
            countdown = session.countdown_remaining_seconds,
            origin = ?session.origin,
            "session opened"
        );
        self.session = Some(session);

        if self.countdown_ticks == 0 {
            let mut transition = Transition::accepted();
            transition.push(self.state_changed());
            self.begin_dispatch(&mut transition);
            return transition;
        }

        let mut transition = Transition::accepted();
        transition.push(Effect::StartTimer { session_id });
        transition.push(self.state_changed());
        transition
    }

    /// One countdown tick for `session_id`. Ticks for any other session, or
    /// arriving after the countdown ended, are dropped.
    pub fn tick(&mut self, session_id: Uuid) -> Transition {
        let Some(session) = self.session.as_mut() else {
            debug!(%session_id, "tick without session dropped");
            return Transition::dropped();
        };
        if session.id != session_id || session.state != SessionState::CountdownPending {
            debug!(%session_id, current = %session.id, state = %session.state, "stale tick dropped");
            return Transition::dropped();
        }

        session.countdown_remaining_seconds = session.countdown_remaining_seconds.saturating_sub(1);
        let remaining = session.countdown_remaining_seconds;
        debug!(%session_id, remaining, "countdown tick");

        let mut transition = Transition::accepted();
        transition.push(Effect::Publish(EngineEvent::CountdownTick {
            session_id,
            remaining,
        }));
        if remaining == 0 {
            self.begin_dispatch(&mut transition);
        }
        transition
    }

    /// Skip the rest of the countdown.
    pub fn confirm(&mut self) -> Transition {
        if self.state() != SessionState::CountdownPending {
            return self.ignored("confirm");
        }
        let mut transition = Transition::accepted();
        self.begin_dispatch(&mut transition);
        transition
    }

    /// Abort the countdown. No dispatch happens.
    pub fn cancel(&mut self) -> Transition {
        if self.state() != SessionState::CountdownPending {
            return self.ignored("cancel");
        }
        let Some(mut session) = self.session.take() else {
            return self.ignored("cancel");
        };
        session.state = SessionState::Cancelled;
        info!(session_id = %session.id, remaining = session.countdown_remaining_seconds, "session cancelled");

        let mut transition = Transition::accepted();
        transition.push(Effect::StopTimer);
        transition.push(Effect::Publish(EngineEvent::StateChanged {
            snapshot: EngineSnapshot {
                state: SessionState::Cancelled,
                session: Some(session.snapshot()),
            },
        }));
        transition.push(Effect::ReleaseDispatch {
            session_id: session.id,
        });
        transition.push(self.state_changed());
        transition
    }

    /// Apply one channel result from the dispatcher.
    pub fn channel_update(&mut self, outcome: &ChannelOutcome) -> Transition {
        let Some(session) = self.session.as_mut() else {
            debug!(session_id = %outcome.session_id, channel = %outcome.channel, "outcome without session dropped");
            return Transition::dropped();
        };
        if session.id != outcome.session_id || session.state != SessionState::Dispatching {
            debug!(session_id = %outcome.session_id, state = %session.state, "late outcome dropped");
            return Transition::dropped();
        }
        match session.channel_status.get(&outcome.channel) {
            Some(ChannelStatus::Pending) => {}
            other => {
                debug!(channel = %outcome.channel, status = ?other, "outcome for settled channel dropped");
                return Transition::dropped();
            }
        }
        if !outcome.status.is_terminal() {
            return Transition::dropped();
        }

        session
            .channel_status
            .insert(outcome.channel, outcome.status);
        info!(
            session_id = %session.id,
            channel = %outcome.channel,
            status = ?outcome.status,
            attempts = outcome.attempts,
            "channel settled"
        );

        let mut transition = Transition::accepted();
        transition.push(Effect::Publish(EngineEvent::ChannelUpdate {
            session_id: session.id,
            channel: outcome.channel,
            status: outcome.status,
            attempts: outcome.attempts,
            error: outcome.error.clone(),
        }));

        if session.all_channels_terminal() {
            session.state = SessionState::Completed;
            let (sent, failed): (Vec<_>, Vec<_>) = session
                .channel_status
                .iter()
                .partition(|(_, status)| **status == ChannelStatus::Sent);
            let sent: Vec<Channel> = sent.into_iter().map(|(c, _)| *c).collect();
            let failed: Vec<Channel> = failed.into_iter().map(|(c, _)| *c).collect();
            info!(
                session_id = %session.id,
                sent = sent.len(),
                failed = failed.len(),
                "dispatch completed"
            );
            let session_id = session.id;
            transition.push(Effect::Publish(EngineEvent::DispatchCompleted {
                session_id,
                sent,
                failed,
            }));
            transition.push(self.state_changed());
        }
        transition
    }

    /// Close a completed session and return to Idle.
    pub fn reset(&mut self) -> Transition {
        if self.state() != SessionState::Completed {
            return self.ignored("reset");
        }
        let Some(session) = self.session.take() else {
            return self.ignored("reset");
        };
        info!(session_id = %session.id, "session reset");
        let mut transition = Transition::accepted();
        transition.push(Effect::ReleaseDispatch {
            session_id: session.id,
        });
        transition.push(self.state_changed());
        transition
    }

    /// Record the latest position on a session that has not dispatched yet.
    pub fn update_position(&mut self, position: Position) {
        if let Some(session) = self.session.as_mut() {
            if session.state == SessionState::CountdownPending {
                session.position = Some(position);
            }
        }
    }

    /// CountdownPending → Confirmed → Dispatching.
    fn begin_dispatch(&mut self, transition: &mut Transition) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.state = SessionState::Confirmed;
        session.confirmed_at = Some(Utc::now());
        info!(session_id = %session.id, "session confirmed");
        transition.push(Effect::StopTimer);
        transition.push(self.state_changed());

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.state = SessionState::Dispatching;
        session.channel_status = Channel::ALL
            .iter()
            .map(|c| (*c, ChannelStatus::Pending))
            .collect();
        let session_id = session.id;
        let position = session.position;
        transition.push(self.state_changed());
        transition.push(Effect::Dispatch {
            session_id,
            position,
        });
    }

    fn state_changed(&self) -> Effect {
        Effect::Publish(EngineEvent::StateChanged {
            snapshot: self.snapshot(),
        })
    }

    fn ignored(&self, command: &str) -> Transition {
        let state = self.state();
        debug!(command, %state, "command ignored in current state");
        Transition {
            accepted: false,
            effects: vec![Effect::Publish(EngineEvent::Ignored {
                command: command.to_string(),
                state,
            })],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> SessionMachine {
        SessionMachine::new(10)
    }

    fn session_id(m: &SessionMachine) -> Uuid {
        m.session().expect("active session").id
    }

    fn states(t: &Transition) -> Vec<SessionState> {
        t.events()
            .filter_map(|e| match e {
                EngineEvent::StateChanged { snapshot } => Some(snapshot.state),
                _ => None,
            })
            .collect()
    }

    fn outcome(id: Uuid, channel: Channel, status: ChannelStatus) -> ChannelOutcome {
        ChannelOutcome {
            session_id: id,
            channel,
            status,
            attempts: 1,
            error: None,
        }
    }

    #[test]
    fn activate_starts_countdown_from_idle() {
        let mut m = machine();
        let t = m.activate(SessionOrigin::Manual, None);
        assert!(t.accepted);
        assert_eq!(m.state(), SessionState::CountdownPending);
        assert_eq!(m.session().unwrap().countdown_remaining_seconds, 10);
        assert!(matches!(t.effects[0], Effect::StartTimer { .. }));
        assert_eq!(states(&t), vec![SessionState::CountdownPending]);
    }

    #[test]
    fn second_activation_is_rejected_not_queued() {
        let mut m = machine();
        m.activate(SessionOrigin::Manual, None);
        let first = session_id(&m);
        let t = m.activate(SessionOrigin::Manual, None);
        assert!(!t.accepted);
        assert_eq!(session_id(&m), first);
        assert!(matches!(
            t.events().next(),
            Some(EngineEvent::Ignored { state: SessionState::CountdownPending, .. })
        ));
    }

    #[test]
    fn ten_ticks_confirm_and_dispatch() {
        let mut m = machine();
        m.activate(SessionOrigin::Manual, Some(Position::new(-1.2647, 36.7156)));
        let id = session_id(&m);

        for remaining in (1..10).rev() {
            let t = m.tick(id);
            assert!(!t.dispatches());
            assert_eq!(m.session().unwrap().countdown_remaining_seconds, remaining);
        }
        let t = m.tick(id);
        assert!(t.dispatches());
        assert_eq!(
            states(&t),
            vec![SessionState::Confirmed, SessionState::Dispatching]
        );
        assert_eq!(m.state(), SessionState::Dispatching);
        assert!(m.session().unwrap().confirmed_at.is_some());
        assert!(t.effects.contains(&Effect::StopTimer));
        assert!(t.effects.contains(&Effect::Dispatch {
            session_id: id,
            position: Some(Position::new(-1.2647, 36.7156)),
        }));
    }

    #[test]
    fn cancel_at_tick_three_returns_to_idle_without_dispatch() {
        let mut m = machine();
        m.activate(SessionOrigin::Manual, None);
        let id = session_id(&m);
        for _ in 0..3 {
            assert!(!m.tick(id).dispatches());
        }

        let t = m.cancel();
        assert!(t.accepted);
        assert!(!t.dispatches());
        assert_eq!(states(&t), vec![SessionState::Cancelled, SessionState::Idle]);
        assert_eq!(m.state(), SessionState::Idle);
        assert!(m.session().is_none());

        // The timer may still deliver a tick or two before it is aborted.
        let late = m.tick(id);
        assert!(!late.accepted);
        assert!(late.effects.is_empty());
    }

    #[test]
    fn cancel_twice_is_a_no_op() {
        let mut m = machine();
        m.activate(SessionOrigin::Manual, None);
        assert!(m.cancel().accepted);
        let t = m.cancel();
        assert!(!t.accepted);
        assert_eq!(m.state(), SessionState::Idle);
    }

    #[test]
    fn cancel_is_refused_once_dispatching() {
        let mut m = machine();
        m.activate(SessionOrigin::Manual, None);
        m.confirm();
        let t = m.cancel();
        assert!(!t.accepted);
        assert_eq!(m.state(), SessionState::Dispatching);
    }

    #[test]
    fn outcomes_complete_the_session_and_reset_returns_to_idle() {
        let mut m = machine();
        m.activate(SessionOrigin::Manual, None);
        m.confirm();
        let id = session_id(&m);

        m.channel_update(&outcome(id, Channel::LocationShare, ChannelStatus::Sent));
        m.channel_update(&outcome(id, Channel::Sms, ChannelStatus::Sent));
        assert_eq!(m.state(), SessionState::Dispatching);
        let t = m.channel_update(&outcome(id, Channel::Email, ChannelStatus::Failed));
        assert_eq!(m.state(), SessionState::Completed);
        assert!(t.events().any(|e| matches!(
            e,
            EngineEvent::DispatchCompleted { sent, failed, .. }
                if sent.len() == 2 && failed == &vec![Channel::Email]
        )));

        // Confirm after completion does nothing.
        assert!(!m.confirm().accepted);
        assert_eq!(m.state(), SessionState::Completed);

        let t = m.reset();
        assert!(t.accepted);
        assert!(t.effects.contains(&Effect::ReleaseDispatch { session_id: id }));
        assert_eq!(m.state(), SessionState::Idle);
    }

    #[test]
    fn channel_status_is_set_once() {
        let mut m = machine();
        m.activate(SessionOrigin::Manual, None);
        m.confirm();
        let id = session_id(&m);

        assert!(m.channel_update(&outcome(id, Channel::Sms, ChannelStatus::Failed)).accepted);
        let t = m.channel_update(&outcome(id, Channel::Sms, ChannelStatus::Sent));
        assert!(!t.accepted);
        assert_eq!(
            m.session().unwrap().channel_status[&Channel::Sms],
            ChannelStatus::Failed
        );
    }

    #[test]
    fn outcome_for_another_session_is_dropped() {
        let mut m = machine();
        m.activate(SessionOrigin::Manual, None);
        m.confirm();
        let t = m.channel_update(&outcome(Uuid::new_v4(), Channel::Sms, ChannelStatus::Sent));
        assert!(!t.accepted);
    }

    #[test]
    fn reset_outside_completed_is_ignored() {
        let mut m = machine();
        assert!(!m.reset().accepted);
        m.activate(SessionOrigin::Manual, None);
        assert!(!m.reset().accepted);
        assert_eq!(m.state(), SessionState::CountdownPending);
    }

    #[test]
    fn zero_countdown_dispatches_immediately() {
        let mut m = SessionMachine::new(0);
        let t = m.activate(SessionOrigin::Manual, None);
        assert!(t.dispatches());
        assert!(!t.effects.iter().any(|e| matches!(e, Effect::StartTimer { .. })));
        assert_eq!(m.state(), SessionState::Dispatching);
    }

    #[test]
    fn position_updates_stop_at_confirmation() {
        let mut m = machine();
        m.activate(SessionOrigin::Manual, None);
        m.update_position(Position::new(1.0, 1.0));
        m.confirm();
        m.update_position(Position::new(2.0, 2.0));
        assert_eq!(m.session().unwrap().position, Some(Position::new(1.0, 1.0)));
    }
}
