//! Countdown timer task.
//!
//! One `CountdownTimer` per session. It sends a [`Tick`] tagged with the
//! session id every period until stopped; the task is aborted when the
//! handle is stopped or dropped. Ticks that arrive after the session moved
//! on are discarded by the state machine, not here.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub session_id: Uuid,
}

pub struct CountdownTimer {
    session_id: Uuid,
    handle: JoinHandle<()>,
}

impl CountdownTimer {
    /// Spawn the timer. The first tick fires one `period` from now.
    pub fn start(session_id: Uuid, period: Duration, ticks: mpsc::UnboundedSender<Tick>) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if ticks.send(Tick { session_id }).is_err() {
                    break;
                }
            }
        });
        debug!(%session_id, ?period, "countdown timer started");
        Self { session_id, handle }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for CountdownTimer {
    fn drop(&mut self) {
        self.handle.abort();
        debug!(session_id = %self.session_id, "countdown timer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_once_per_period_with_session_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let started = Instant::now();
        let _timer = CountdownTimer::start(id, Duration::from_secs(1), tx);

        for n in 1..=3u64 {
            let tick = rx.recv().await.expect("tick");
            assert_eq!(tick.session_id, id);
            assert_eq!(started.elapsed(), Duration::from_secs(n));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_closes_the_tick_stream() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = CountdownTimer::start(Uuid::new_v4(), Duration::from_secs(1), tx);
        assert!(rx.recv().await.is_some());

        timer.stop();
        assert!(rx.recv().await.is_none());
    }
}
