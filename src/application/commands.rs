//! Control-plane command handling.
//!
//! Commands arrive from the push channel or piggybacked on heartbeat
//! replies, are validated into typed values, executed in arrival order, and
//! answered with a PATCHed result. Unknown kinds are NAKed and reported
//! through the error endpoint.

use crate::application::evaluation::EvaluationScheduler;
use crate::application::positions::{OrderDispatcher, PositionRegistry};
use crate::application::state::ExecutorState;
use crate::application::telemetry::metrics::CommandQueueStats;
use crate::domain::errors::ExecutorError;
use crate::domain::events::ExecutorEvent;
use crate::domain::strategy::{Strategy, load_strategy};
use crate::infrastructure::control_plane::{CommandOutcome, ControlPlaneClient, PendingCommand};
use crate::infrastructure::event_bus::EventBus;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{error, info, warn};

/// A validated command ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorCommand {
    StartStrategy(Box<Strategy>),
    StopStrategy { id: String, close_positions: bool },
    PauseStrategy { id: String },
    ResumeStrategy { id: String },
    UpdateStrategy(Box<Strategy>),
    EmergencyStop {
        reason: String,
        initiator: String,
        close_all: bool,
    },
    ClosePosition {
        ticket: u64,
        volume: Option<Decimal>,
    },
    CloseAllPositions,
    GetStatus,
}

/// Validate and type a wire command. `id` and `command` are required; the
/// control plane fills priority and timestamp when absent, so their absence
/// here is fine.
pub fn parse_command(command: &PendingCommand) -> Result<ExecutorCommand, ExecutorError> {
    if command.id.is_empty() {
        return Err(ExecutorError::InvalidCommand("missing command id".to_string()));
    }
    if command.command.is_empty() {
        return Err(ExecutorError::InvalidCommand("missing command kind".to_string()));
    }
    let params = command.parameters.clone().unwrap_or_else(|| json!({}));

    let strategy_from = |params: &Value| -> Result<Box<Strategy>, ExecutorError> {
        let value = params
            .get("strategy")
            .cloned()
            .ok_or_else(|| ExecutorError::InvalidCommand("missing strategy payload".to_string()))?;
        load_strategy(value)
            .map(Box::new)
            .map_err(|e| ExecutorError::InvalidCommand(e.to_string()))
    };
    let id_from = |params: &Value| -> Result<String, ExecutorError> {
        params
            .get("id")
            .or_else(|| params.get("strategyId"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ExecutorError::InvalidCommand("missing strategy id".to_string()))
    };

    match command.command.as_str() {
        "START_STRATEGY" => Ok(ExecutorCommand::StartStrategy(strategy_from(&params)?)),
        "STOP_STRATEGY" => Ok(ExecutorCommand::StopStrategy {
            id: id_from(&params)?,
            close_positions: params
                .get("close_positions")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        "PAUSE_STRATEGY" => Ok(ExecutorCommand::PauseStrategy {
            id: id_from(&params)?,
        }),
        "RESUME_STRATEGY" => Ok(ExecutorCommand::ResumeStrategy {
            id: id_from(&params)?,
        }),
        "UPDATE_STRATEGY" => Ok(ExecutorCommand::UpdateStrategy(strategy_from(&params)?)),
        "EMERGENCY_STOP" => Ok(ExecutorCommand::EmergencyStop {
            reason: params
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unspecified")
                .to_string(),
            initiator: params
                .get("initiator")
                .and_then(Value::as_str)
                .unwrap_or("control-plane")
                .to_string(),
            close_all: params
                .get("close_all")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
        "CLOSE_POSITION" => {
            let ticket = params
                .get("ticket")
                .and_then(Value::as_u64)
                .ok_or_else(|| ExecutorError::InvalidCommand("missing ticket".to_string()))?;
            let volume = params
                .get("volume")
                .and_then(Value::as_f64)
                .and_then(Decimal::from_f64);
            Ok(ExecutorCommand::ClosePosition { ticket, volume })
        }
        "CLOSE_ALL_POSITIONS" => Ok(ExecutorCommand::CloseAllPositions),
        "GET_STATUS" => Ok(ExecutorCommand::GetStatus),
        other => Err(ExecutorError::UnknownCommand(other.to_string())),
    }
}

pub struct CommandDispatcher {
    scheduler: Arc<EvaluationScheduler>,
    orders: Arc<OrderDispatcher>,
    registry: Arc<PositionRegistry>,
    state: Arc<ExecutorState>,
    control: Option<Arc<ControlPlaneClient>>,
    events: EventBus,
    queue: Arc<CommandQueueStats>,
    cancelled: Mutex<HashSet<String>>,
}

impl CommandDispatcher {
    pub fn new(
        scheduler: Arc<EvaluationScheduler>,
        orders: Arc<OrderDispatcher>,
        registry: Arc<PositionRegistry>,
        state: Arc<ExecutorState>,
        control: Option<Arc<ControlPlaneClient>>,
        events: EventBus,
        queue: Arc<CommandQueueStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            orders,
            registry,
            state,
            control,
            events,
            queue,
            cancelled: Mutex::new(HashSet::new()),
        })
    }

    /// command-cancel from the push channel: drop the command if it has not
    /// executed yet.
    pub async fn cancel(&self, command_id: &str) {
        info!("Command {} cancelled", command_id);
        self.cancelled.lock().await.insert(command_id.to_string());
    }

    /// Drain commands in arrival order.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<PendingCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(command) => self.process(command).await,
                        None => return,
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("Command dispatcher stopped");
                    return;
                }
            }
        }
    }

    pub async fn process(&self, command: PendingCommand) {
        if self.cancelled.lock().await.remove(&command.id) {
            info!("Skipping cancelled command {}", command.id);
            return;
        }
        self.queue.processing.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let command_id = command.id.clone();

        let (outcome, result) = match parse_command(&command) {
            Ok(typed) => self.execute(typed).await,
            Err(e @ ExecutorError::UnknownCommand(_)) => {
                warn!("Unknown command {}: {}", command.id, e);
                if let Some(control) = &self.control {
                    let _ = control
                        .report_error(
                            "protocol",
                            &e.to_string(),
                            json!({ "commandId": command.id, "command": command.command }),
                        )
                        .await;
                }
                (CommandOutcome::Rejected, json!({ "error": e.to_string() }))
            }
            Err(e) => {
                warn!("Invalid command {}: {}", command.id, e);
                (CommandOutcome::Rejected, json!({ "error": e.to_string() }))
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.queue.processing.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            CommandOutcome::Completed => self.queue.record_completed(elapsed_ms),
            _ => self.queue.record_failed(),
        }

        self.events
            .publish(ExecutorEvent::CommandCompleted {
                command_id: command_id.clone(),
                success: outcome == CommandOutcome::Completed,
            })
            .await;
        if let Some(control) = &self.control {
            if let Err(e) = control
                .report_command_result(&command_id, outcome, result)
                .await
            {
                error!("Command result report failed: {}", e);
            }
        }
    }

    async fn execute(&self, command: ExecutorCommand) -> (CommandOutcome, Value) {
        match command {
            ExecutorCommand::StartStrategy(strategy) => {
                let id = strategy.id.clone();
                match Arc::clone(&self.scheduler).start(*strategy).await {
                    Ok(()) => (CommandOutcome::Completed, json!({ "started": id })),
                    Err(e) => (CommandOutcome::Failed, json!({ "error": e.to_string() })),
                }
            }
            ExecutorCommand::StopStrategy {
                id,
                close_positions,
            } => match self.scheduler.stop(&id, close_positions).await {
                Ok(()) => (CommandOutcome::Completed, json!({ "stopped": id })),
                Err(e) => (CommandOutcome::Failed, json!({ "error": e.to_string() })),
            },
            ExecutorCommand::PauseStrategy { id } => match self.scheduler.pause(&id).await {
                Ok(()) => (CommandOutcome::Completed, json!({ "paused": id })),
                Err(e) => (CommandOutcome::Failed, json!({ "error": e.to_string() })),
            },
            ExecutorCommand::ResumeStrategy { id } => match self.scheduler.resume(&id).await {
                Ok(()) => (CommandOutcome::Completed, json!({ "resumed": id })),
                Err(e) => (CommandOutcome::Failed, json!({ "error": e.to_string() })),
            },
            ExecutorCommand::UpdateStrategy(strategy) => {
                let id = strategy.id.clone();
                match self.scheduler.update(*strategy).await {
                    Ok(()) => (CommandOutcome::Completed, json!({ "updated": id })),
                    Err(e) => (CommandOutcome::Failed, json!({ "error": e.to_string() })),
                }
            }
            ExecutorCommand::EmergencyStop {
                reason,
                initiator,
                close_all,
            } => {
                self.emergency_stop(&reason, &initiator, close_all).await;
                (CommandOutcome::Completed, json!({ "emergencyStop": true }))
            }
            ExecutorCommand::ClosePosition { ticket, volume } => {
                self.orders
                    .apply_exit(crate::application::positions::ExitAction::Close {
                        ticket,
                        volume,
                        reason: "control plane request".to_string(),
                    })
                    .await;
                (CommandOutcome::Completed, json!({ "closed": ticket }))
            }
            ExecutorCommand::CloseAllPositions => match self.orders.close_all().await {
                Ok(()) => (CommandOutcome::Completed, json!({ "closedAll": true })),
                Err(e) => (CommandOutcome::Failed, json!({ "error": e.to_string() })),
            },
            ExecutorCommand::GetStatus => {
                let summary = self.registry.summary().await;
                (
                    CommandOutcome::Completed,
                    json!({
                        "strategies": self.scheduler.active_ids().await,
                        "openPositions": summary.open_count,
                        "dailyPnl": self.state.daily_pnl().to_string(),
                        "emergency": self.state.is_emergency(),
                    }),
                )
            }
        }
    }

    /// Broadcast emergency stop: block the order dispatcher, cancel every
    /// strategy task, optionally flatten. Safe to repeat.
    pub async fn emergency_stop(&self, reason: &str, initiator: &str, close_all: bool) {
        let first = self.state.set_emergency();
        if first {
            warn!("EMERGENCY STOP by {}: {}", initiator, reason);
        } else {
            info!("Emergency stop repeated by {}; already active", initiator);
        }
        self.scheduler.stop_all().await;
        self.events
            .publish(ExecutorEvent::EmergencyStop {
                reason: reason.to_string(),
                initiator: initiator.to_string(),
            })
            .await;
        if close_all {
            if let Err(e) = self.orders.close_all().await {
                error!("Emergency close-all failed: {}", e);
            }
        }
    }
}
