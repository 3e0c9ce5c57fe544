//! The heartbeat loop.
//!
//! Every interval: sample telemetry, POST the heartbeat, hand any piggybacked
//! pending commands to the dispatcher. REST failures fall back to the push
//! channel; the third consecutive failure triggers the recovery routine.

use crate::application::positions::PositionRegistry;
use crate::application::risk::RiskGatekeeper;
use crate::application::state::ExecutorState;
use crate::application::telemetry::alerts::{AlertEngine, AlertInputs};
use crate::application::telemetry::metrics::MetricsCollector;
use crate::domain::events::ExecutorEvent;
use crate::infrastructure::connection::ConnectionTracker;
use crate::infrastructure::control_plane::{ControlPlaneClient, PendingCommand};
use crate::infrastructure::event_bus::EventBus;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

const RECOVERY_THRESHOLD: u32 = 3;

/// What the executor does when heartbeats keep failing: reconnect the push
/// channel, force a broker reconnect, and drop the caches (the original's
/// "trigger garbage collection").
#[async_trait]
pub trait RecoveryRoutine: Send + Sync {
    async fn recover(&self);
}

pub struct HeartbeatService {
    control: Arc<ControlPlaneClient>,
    push_outbound: Option<mpsc::Sender<Value>>,
    push_tracker: Option<Arc<ConnectionTracker>>,
    broker_tracker: Option<Arc<ConnectionTracker>>,
    state: Arc<ExecutorState>,
    collector: Arc<MetricsCollector>,
    registry: Arc<PositionRegistry>,
    alerts: Arc<AlertEngine>,
    /// For the daily-loss alert rule; the gate owns the limits.
    gate: Option<Arc<RiskGatekeeper>>,
    recovery: Arc<dyn RecoveryRoutine>,
    commands_tx: mpsc::Sender<PendingCommand>,
    events: EventBus,
    interval: Duration,
    /// Strategy counters sampled each beat.
    strategy_stats: Arc<dyn StrategyStats>,
}

/// Scheduler-side counters the heartbeat embeds.
#[async_trait]
pub trait StrategyStats: Send + Sync {
    async fn active_strategies(&self) -> usize;
    async fn skipped_ticks(&self) -> u64;
}

impl HeartbeatService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        control: Arc<ControlPlaneClient>,
        push_outbound: Option<mpsc::Sender<Value>>,
        push_tracker: Option<Arc<ConnectionTracker>>,
        broker_tracker: Option<Arc<ConnectionTracker>>,
        state: Arc<ExecutorState>,
        collector: Arc<MetricsCollector>,
        registry: Arc<PositionRegistry>,
        alerts: Arc<AlertEngine>,
        gate: Option<Arc<RiskGatekeeper>>,
        recovery: Arc<dyn RecoveryRoutine>,
        commands_tx: mpsc::Sender<PendingCommand>,
        events: EventBus,
        interval: Duration,
        strategy_stats: Arc<dyn StrategyStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            control,
            push_outbound,
            push_tracker,
            broker_tracker,
            state,
            collector,
            registry,
            alerts,
            gate,
            recovery,
            commands_tx,
            events,
            interval,
            strategy_stats,
        })
    }

    async fn build_metadata(&self) -> Value {
        let latency_ms = match self.control.ping().await {
            Ok(latency) => Some(latency.as_secs_f64() * 1000.0),
            Err(_) => None,
        };
        let active = self.strategy_stats.active_strategies().await;
        let skipped = self.strategy_stats.skipped_ticks().await;
        let open = self.registry.open_count().await;
        let sample = self.collector.sample(latency_ms, active, open, skipped);

        // Feed the alert rules from the same sample.
        let queue = &sample.queue;
        let total_commands = queue.completed + queue.failed;
        let error_rate_pct = if total_commands > 0 {
            queue.failed as f64 / total_commands as f64 * 100.0
        } else {
            0.0
        };
        let daily_loss_breached = match &self.gate {
            Some(gate) => {
                let limits = gate.limits();
                let loss = (-self.state.daily_pnl()).max(rust_decimal::Decimal::ZERO);
                loss >= limits.max_daily_loss
            }
            None => false,
        };
        let inputs = AlertInputs {
            daily_loss_breached,
            error_rate_pct,
        };
        self.alerts.evaluate(&sample, &inputs).await;

        let summary = self.registry.summary().await;
        let push_state = match &self.push_tracker {
            Some(tracker) => tracker.state().await.as_str(),
            None => "disabled",
        };
        let broker_state = match &self.broker_tracker {
            Some(tracker) => tracker.state().await.as_str(),
            None => "disabled",
        };
        let connections = json!({ "push": push_state, "broker": broker_state });

        json!({
            "telemetry": sample,
            "connections": connections,
            "positions": {
                "open": summary.open_count,
                "managed": summary.managed_count,
                "totalProfit": summary.total_profit.to_string(),
            },
            "dailyPnl": self.state.daily_pnl().to_string(),
            "missedHeartbeats": self.state.missed_heartbeats(),
            "timestamp": Utc::now(),
        })
    }

    /// One beat. Returns true when the report got through on either path.
    pub async fn beat(&self) -> bool {
        let metadata = self.build_metadata().await;
        match self.control.heartbeat(metadata.clone()).await {
            Ok(reply) => {
                self.state.record_heartbeat_success();
                self.collector
                    .metrics
                    .heartbeats_total
                    .with_label_values(&["ok"])
                    .inc();
                for command in reply.pending_commands {
                    if self.commands_tx.send(command).await.is_err() {
                        warn!("Heartbeat: command dispatcher gone");
                        break;
                    }
                }
                true
            }
            Err(e) => {
                warn!("Heartbeat REST failed: {}", e);
                self.collector
                    .metrics
                    .heartbeats_total
                    .with_label_values(&["failed"])
                    .inc();

                // Fallback: push the record over the websocket if it is up.
                let pushed = match (&self.push_outbound, &self.push_tracker) {
                    (Some(outbound), Some(tracker)) if tracker.is_connected().await => outbound
                        .send(json!({
                            "event": "client-heartbeat",
                            "data": metadata,
                        }))
                        .await
                        .is_ok(),
                    _ => false,
                };
                if pushed {
                    info!("Heartbeat delivered over push fallback");
                    self.state.record_heartbeat_success();
                    return true;
                }

                let missed = self.state.record_heartbeat_failure();
                self.events
                    .publish(ExecutorEvent::HeartbeatMissed {
                        consecutive: missed,
                    })
                    .await;
                if missed >= RECOVERY_THRESHOLD && missed % RECOVERY_THRESHOLD == 0 {
                    warn!("Heartbeat: {} consecutive misses, running recovery", missed);
                    self.recovery.recover().await;
                }
                false
            }
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.beat().await;
                }
                _ = shutdown_rx.changed() => {
                    info!("Heartbeat loop stopped");
                    return;
                }
            }
        }
    }
}
