//! Connection state tracking and reconnection backoff shared by every
//! transport (broker socket pool, control push channel, control REST).

use crate::domain::events::ExecutorEvent;
use crate::infrastructure::event_bus::EventBus;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

/// Exponential backoff schedule. The i-th delay (1-based) is
/// `min(initial * multiplier^(i-1), max)`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl BackoffPolicy {
    /// Per-transport default: 1s doubling up to 30s.
    pub fn transport() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }

    /// Executor-wide manager: wider 60s ceiling.
    pub fn manager() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(attempt as i32 - 1);
        let millis = (self.initial.as_millis() as f64 * factor).round();
        Duration::from_millis(millis as u64).min(self.max)
    }
}

/// Consecutive failures before a `reconnection-struggling` event.
const STRUGGLING_THRESHOLD: u32 = 3;

/// Per-transport connection bookkeeping.
///
/// Transports own their I/O loops; this tracks state transitions, counts
/// attempts, computes the next delay, and emits the struggling /
/// attempts-exhausted events. The broker socket passes `max_attempts:
/// None` (live trading never gives up); other transports cap at 10.
pub struct ConnectionTracker {
    name: String,
    state: RwLock<ConnectionState>,
    attempts: AtomicU32,
    max_attempts: Option<u32>,
    policy: BackoffPolicy,
    events: EventBus,
}

impl ConnectionTracker {
    pub fn new(
        name: impl Into<String>,
        policy: BackoffPolicy,
        max_attempts: Option<u32>,
        events: EventBus,
    ) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(ConnectionState::Disconnected),
            attempts: AtomicU32::new(0),
            max_attempts,
            policy,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn on_connecting(&self) {
        let mut state = self.state.write().await;
        *state = if self.attempts() == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        };
    }

    /// Successful connect: reset the attempt counter.
    pub async fn on_connected(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Connected;
        info!("Connection [{}]: connected", self.name);
    }

    pub async fn on_disconnected(&self) {
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Failed connect or lost connection. Returns the delay to sleep before
    /// the next attempt, or `None` when the attempt cap is exhausted.
    pub async fn on_failure(&self) -> Option<Duration> {
        *self.state.write().await = ConnectionState::Error;
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if attempt == STRUGGLING_THRESHOLD {
            warn!(
                "Connection [{}]: {} consecutive failures",
                self.name, attempt
            );
            self.events
                .publish(ExecutorEvent::ReconnectionStruggling {
                    transport: self.name.clone(),
                    attempts: attempt,
                })
                .await;
        }

        if let Some(max) = self.max_attempts {
            if attempt > max {
                warn!(
                    "Connection [{}]: giving up after {} attempts",
                    self.name, max
                );
                self.events
                    .publish(ExecutorEvent::MaxReconnectAttemptsReached {
                        transport: self.name.clone(),
                    })
                    .await;
                return None;
            }
        }

        let delay = self.policy.delay(attempt);
        info!(
            "Connection [{}]: attempt {} failed, retrying in {:?}",
            self.name, attempt, delay
        );
        Some(delay)
    }

    /// Force-reconnect support: zero the counters so the owning loop starts
    /// a fresh cycle immediately.
    pub async fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_doubles_to_cap() {
        let policy = BackoffPolicy::transport();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(6), Duration::from_secs(30));
        assert_eq!(policy.delay(20), Duration::from_secs(30));
    }

    #[test]
    fn test_manager_backoff_caps_at_sixty() {
        let policy = BackoffPolicy::manager();
        assert_eq!(policy.delay(7), Duration::from_secs(60));
        assert_eq!(policy.delay(30), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_connected_resets_attempts() {
        let tracker = ConnectionTracker::new(
            "test",
            BackoffPolicy::transport(),
            None,
            EventBus::new(),
        );
        tracker.on_failure().await;
        tracker.on_failure().await;
        assert_eq!(tracker.attempts(), 2);

        tracker.on_connected().await;
        assert_eq!(tracker.attempts(), 0);
        assert_eq!(tracker.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_attempt_cap_exhausts() {
        let tracker = ConnectionTracker::new(
            "capped",
            BackoffPolicy::transport(),
            Some(2),
            EventBus::new(),
        );
        assert!(tracker.on_failure().await.is_some());
        assert!(tracker.on_failure().await.is_some());
        assert!(tracker.on_failure().await.is_none());
    }

    #[tokio::test]
    async fn test_struggling_event_fires_at_three() {
        use crate::domain::events::{EventListener, ExecutorEvent};
        use std::sync::Arc;
        use std::sync::atomic::{AtomicU32, Ordering};

        struct StruggleCounter(Arc<AtomicU32>);
        impl EventListener for StruggleCounter {
            fn on_event(&self, event: &ExecutorEvent) {
                if matches!(event, ExecutorEvent::ReconnectionStruggling { .. }) {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let bus = EventBus::new();
        let count = Arc::new(AtomicU32::new(0));
        bus.subscribe(Arc::new(StruggleCounter(Arc::clone(&count))))
            .await;

        let tracker =
            ConnectionTracker::new("broker", BackoffPolicy::transport(), None, bus);
        for _ in 0..5 {
            tracker.on_failure().await;
        }
        // Fires exactly once, at the third consecutive failure.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
