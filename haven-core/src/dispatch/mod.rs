//! `DispatchCoordinator`: parallel per-channel notification fan-out.
//!
//! ## Delivery
//!
//! ```text
//! dispatch(request)
//!     ├─► LocationShare task ─┐
//!     ├─► Sms task            ├─► gateway.send() with timeout, retry + backoff
//!     └─► Email task         ─┘
//!                 │
//!        ChannelOutcome ──► outcome channel ──► state machine
//! ```
//!
//! The coordinator never touches the session. It receives an immutable
//! `DispatchRequest` and reports one `ChannelOutcome` per channel back over
//! an mpsc channel; the state machine applies them.
//!
//! ## At-most-once
//!
//! A per-session ledger claims a channel before its task is spawned. A
//! second `dispatch()` for the same session skips every claimed channel, so
//! calling it twice never double-sends.

pub mod payload;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::capability::{Ack, NotificationGateway};
use crate::error::{HavenError, Result};
use crate::ipc::events::{Channel, ChannelStatus};
use payload::{AlertPayload, Contact, DispatchRequest};

/// Retry and timeout policy for channel delivery.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Additional attempts after the first one fails. Default: 2.
    pub max_retries: u32,
    /// Upper bound on a single gateway call. Default: 8 s.
    pub attempt_timeout: Duration,
    /// Backoff before retry `n` is `backoff_base * 2^n` plus up to 25 % jitter.
    /// Default: 500 ms.
    pub backoff_base: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            attempt_timeout: Duration::from_secs(8),
            backoff_base: Duration::from_millis(500),
        }
    }
}

/// Final result of one channel within a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOutcome {
    pub session_id: Uuid,
    pub channel: Channel,
    pub status: ChannelStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LedgerEntry {
    InFlight,
    Done(ChannelStatus),
}

type Ledger = HashMap<Uuid, HashMap<Channel, LedgerEntry>>;

pub struct DispatchCoordinator {
    gateway: Arc<dyn NotificationGateway>,
    config: DispatchConfig,
    ledger: Arc<Mutex<Ledger>>,
}

impl DispatchCoordinator {
    pub fn new(gateway: Arc<dyn NotificationGateway>, config: DispatchConfig) -> Self {
        Self {
            gateway,
            config,
            ledger: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fan `request` out to every channel not yet claimed for its session.
    ///
    /// Returns the channels that were actually started. Outcomes arrive on
    /// `outcomes` as each channel finishes; must be called from within a
    /// Tokio runtime.
    pub fn dispatch(
        &self,
        request: &DispatchRequest,
        outcomes: mpsc::UnboundedSender<ChannelOutcome>,
    ) -> Vec<Channel> {
        let mut started = Vec::with_capacity(Channel::ALL.len());
        {
            let mut ledger = self.ledger.lock();
            let claims = ledger.entry(request.session_id).or_default();
            for channel in Channel::ALL {
                if let Some(entry) = claims.get(&channel) {
                    debug!(
                        session_id = %request.session_id,
                        %channel,
                        ?entry,
                        "channel already claimed, skipping"
                    );
                    continue;
                }
                claims.insert(channel, LedgerEntry::InFlight);
                started.push(channel);
            }
        }

        for &channel in &started {
            let payload = AlertPayload::for_request(request, channel);
            let gateway = Arc::clone(&self.gateway);
            let config = self.config.clone();
            let ledger = Arc::clone(&self.ledger);
            let outcomes = outcomes.clone();
            let session_id = request.session_id;
            let span = info_span!("dispatch", %session_id, %channel);

            tokio::spawn(
                async move {
                    let report = deliver_with_retry(gateway.as_ref(), &config, channel, &payload).await;
                    let status = if report.ack.is_some() {
                        ChannelStatus::Sent
                    } else {
                        ChannelStatus::Failed
                    };
                    if let Some(claims) = ledger.lock().get_mut(&session_id) {
                        claims.insert(channel, LedgerEntry::Done(status));
                    }
                    info!(?status, attempts = report.attempts, "channel finished");
                    let _ = outcomes.send(ChannelOutcome {
                        session_id,
                        channel,
                        status,
                        attempts: report.attempts,
                        error: report.last_error,
                    });
                }
                .instrument(span),
            );
        }

        if !started.is_empty() {
            info!(
                session_id = %request.session_id,
                channels = started.len(),
                contacts = request.contacts.len(),
                has_position = request.position.is_some(),
                "dispatch started"
            );
        }
        started
    }

    /// Terminal status recorded for `channel`, if it has finished.
    pub fn status_of(&self, session_id: Uuid, channel: Channel) -> Option<ChannelStatus> {
        match self.ledger.lock().get(&session_id)?.get(&channel)? {
            LedgerEntry::Done(status) => Some(*status),
            LedgerEntry::InFlight => Some(ChannelStatus::Pending),
        }
    }

    /// Drop the ledger for a closed session.
    pub fn forget(&self, session_id: Uuid) {
        self.ledger.lock().remove(&session_id);
    }

    /// Send one test SMS to `contact` outside of any session.
    ///
    /// # Errors
    /// `InvalidContact` for an unusable contact, `ChannelDeliveryFailed`
    /// when every attempt failed.
    pub async fn send_test_alert(&self, sender_name: &str, contact: &Contact) -> Result<Ack> {
        contact.validate()?;
        let payload = AlertPayload::test_message(sender_name, &contact.phone);
        let report =
            deliver_with_retry(self.gateway.as_ref(), &self.config, Channel::Sms, &payload).await;
        match report.ack {
            Some(ack) => {
                info!(contact = %contact.name, "test alert delivered");
                Ok(ack)
            }
            None => Err(HavenError::ChannelDeliveryFailed {
                channel: Channel::Sms,
                attempts: report.attempts,
                reason: report.last_error.unwrap_or_default(),
            }),
        }
    }
}

struct DeliveryReport {
    ack: Option<Ack>,
    attempts: u32,
    last_error: Option<String>,
}

async fn deliver_with_retry(
    gateway: &dyn NotificationGateway,
    config: &DispatchConfig,
    channel: Channel,
    payload: &AlertPayload,
) -> DeliveryReport {
    let max_attempts = config.max_retries.saturating_add(1);
    let mut last_error = None;

    for attempt in 0..max_attempts {
        match tokio::time::timeout(config.attempt_timeout, gateway.send(channel, payload)).await {
            Ok(Ok(ack)) => {
                return DeliveryReport {
                    ack: Some(ack),
                    attempts: attempt + 1,
                    last_error: None,
                }
            }
            Ok(Err(e)) => {
                warn!(%channel, attempt = attempt + 1, "delivery attempt failed: {e}");
                last_error = Some(e.to_string());
            }
            Err(_) => {
                warn!(
                    %channel,
                    attempt = attempt + 1,
                    timeout_ms = config.attempt_timeout.as_millis() as u64,
                    "delivery attempt timed out"
                );
                last_error = Some(HavenError::Timeout.to_string());
            }
        }

        if attempt + 1 < max_attempts {
            tokio::time::sleep(backoff_delay(config.backoff_base, attempt)).await;
        }
    }

    DeliveryReport {
        ack: None,
        attempts: max_attempts,
        last_error,
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let jitter_cap = (exp.as_millis() / 4) as u64;
    let jitter = if jitter_cap == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_cap)
    };
    exp + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::stub::RecordingGateway;
    use crate::directory::geo::Position;
    use async_trait::async_trait;
    use chrono::Utc;

    fn request() -> DispatchRequest {
        DispatchRequest {
            session_id: Uuid::new_v4(),
            sender_name: "Amina".into(),
            position: Some(Position::new(-1.2647, 36.7156)),
            contacts: vec![Contact {
                id: "c1".into(),
                name: "Wanjiru".into(),
                phone: "+254711111111".into(),
                email: Some("wanjiru@example.com".into()),
                relationship: "Sister".into(),
            }],
            created_at: Utc::now(),
        }
    }

    fn fast_config() -> DispatchConfig {
        DispatchConfig {
            max_retries: 2,
            attempt_timeout: Duration::from_secs(1),
            backoff_base: Duration::from_millis(10),
        }
    }

    async fn collect(
        rx: &mut mpsc::UnboundedReceiver<ChannelOutcome>,
        n: usize,
    ) -> HashMap<Channel, ChannelOutcome> {
        let mut out = HashMap::new();
        while out.len() < n {
            let outcome = rx.recv().await.expect("outcome");
            out.insert(outcome.channel, outcome);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn every_channel_is_sent_once() {
        let gateway = Arc::new(RecordingGateway::new());
        let coordinator = DispatchCoordinator::new(gateway.clone(), fast_config());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let req = request();
        assert_eq!(coordinator.dispatch(&req, tx).len(), 3);
        let outcomes = collect(&mut rx, 3).await;

        for channel in Channel::ALL {
            assert_eq!(outcomes[&channel].status, ChannelStatus::Sent);
            assert_eq!(outcomes[&channel].attempts, 1);
            assert_eq!(gateway.delivered_on(channel), 1);
            assert_eq!(
                coordinator.status_of(req.session_id, channel),
                Some(ChannelStatus::Sent)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_dispatch_for_same_session_sends_nothing() {
        let gateway = Arc::new(RecordingGateway::new());
        let coordinator = DispatchCoordinator::new(gateway.clone(), fast_config());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let req = request();
        coordinator.dispatch(&req, tx.clone());
        // In flight: every channel is already claimed.
        assert!(coordinator.dispatch(&req, tx.clone()).is_empty());
        collect(&mut rx, 3).await;
        // Terminal: still claimed.
        assert!(coordinator.dispatch(&req, tx).is_empty());

        assert_eq!(gateway.delivered().len(), 3);
        for channel in Channel::ALL {
            assert_eq!(gateway.attempts_on(channel), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_then_sent() {
        let gateway = Arc::new(RecordingGateway::new().failing(Channel::Sms, 2));
        let coordinator = DispatchCoordinator::new(gateway.clone(), fast_config());
        let (tx, mut rx) = mpsc::unbounded_channel();

        coordinator.dispatch(&request(), tx);
        let outcomes = collect(&mut rx, 3).await;

        assert_eq!(outcomes[&Channel::Sms].status, ChannelStatus::Sent);
        assert_eq!(outcomes[&Channel::Sms].attempts, 3);
        assert_eq!(gateway.attempts_on(Channel::Sms), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_mark_channel_failed_without_blocking_others() {
        let gateway = Arc::new(RecordingGateway::new().failing(Channel::Email, u32::MAX));
        let coordinator = DispatchCoordinator::new(gateway.clone(), fast_config());
        let (tx, mut rx) = mpsc::unbounded_channel();

        coordinator.dispatch(&request(), tx);
        let outcomes = collect(&mut rx, 3).await;

        let email = &outcomes[&Channel::Email];
        assert_eq!(email.status, ChannelStatus::Failed);
        assert_eq!(email.attempts, 3);
        assert!(email.error.as_deref().unwrap_or("").contains("scripted failure"));
        assert_eq!(outcomes[&Channel::Sms].status, ChannelStatus::Sent);
        assert_eq!(outcomes[&Channel::LocationShare].status, ChannelStatus::Sent);
    }

    struct HangingGateway;

    #[async_trait]
    impl NotificationGateway for HangingGateway {
        async fn send(&self, _channel: Channel, _payload: &AlertPayload) -> Result<Ack> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_gateway_times_out_as_failed() {
        let coordinator = DispatchCoordinator::new(Arc::new(HangingGateway), fast_config());
        let (tx, mut rx) = mpsc::unbounded_channel();

        coordinator.dispatch(&request(), tx);
        let outcomes = collect(&mut rx, 3).await;

        for outcome in outcomes.values() {
            assert_eq!(outcome.status, ChannelStatus::Failed);
            assert_eq!(outcome.attempts, 3);
            assert_eq!(outcome.error.as_deref(), Some("operation timed out"));
        }
    }

    #[tokio::test]
    async fn test_alert_rejects_invalid_contact() {
        let coordinator = DispatchCoordinator::new(Arc::new(RecordingGateway::new()), fast_config());
        let mut contact = request().contacts.remove(0);
        contact.phone = "   ".into();
        let result = coordinator.send_test_alert("Amina", &contact).await;
        assert!(matches!(result, Err(HavenError::InvalidContact(_))));
    }

    #[tokio::test]
    async fn test_alert_goes_to_contact_phone() {
        let gateway = Arc::new(RecordingGateway::new());
        let coordinator = DispatchCoordinator::new(gateway.clone(), fast_config());
        let contact = request().contacts.remove(0);

        let ack = coordinator
            .send_test_alert("Amina", &contact)
            .await
            .expect("test alert");
        assert_eq!(ack.channel, Channel::Sms);

        let delivered = gateway.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1.recipients, vec!["+254711111111".to_string()]);
        assert!(delivered[0].1.message.starts_with("TEST: Amina"));
    }

    #[test]
    fn backoff_grows_exponentially_with_bounded_jitter() {
        let base = Duration::from_millis(100);
        for attempt in 0..3 {
            let d = backoff_delay(base, attempt);
            let floor = base * (1 << attempt);
            assert!(d >= floor);
            assert!(d <= floor + floor / 4);
        }
    }
}
