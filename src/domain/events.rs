use crate::domain::types::{OrderSide, TradeAction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Structured events emitted by executor components.
///
/// Everything that crosses a component boundary without being a typed return
/// value travels through here: the event bus fans these out to the order
/// dispatcher, the alert engine and the control-plane reporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ExecutorEvent {
    SignalGenerated {
        strategy_id: String,
        symbol: String,
        action: TradeAction,
        confidence: u8,
    },
    PositionOpened {
        ticket: u64,
        symbol: String,
        side: OrderSide,
        volume: Decimal,
        price: f64,
    },
    PositionClosed {
        ticket: u64,
        symbol: String,
        profit: Decimal,
    },
    ModifyPosition {
        ticket: u64,
        new_sl: f64,
        reason: String,
    },
    ClosePosition {
        ticket: u64,
        /// Partial close when set, full close when absent.
        volume: Option<Decimal>,
        reason: String,
    },
    SafetyAlert {
        reason: String,
        strategy_id: Option<String>,
        symbol: Option<String>,
    },
    ReconnectionStruggling {
        transport: String,
        attempts: u32,
    },
    MaxReconnectAttemptsReached {
        transport: String,
    },
    EmergencyStop {
        reason: String,
        initiator: String,
    },
    CommandCompleted {
        command_id: String,
        success: bool,
    },
    HeartbeatMissed {
        consecutive: u32,
    },
}

impl ExecutorEvent {
    /// Short tag for logs and dedup keys.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorEvent::SignalGenerated { .. } => "signal-generated",
            ExecutorEvent::PositionOpened { .. } => "position-opened",
            ExecutorEvent::PositionClosed { .. } => "position-closed",
            ExecutorEvent::ModifyPosition { .. } => "modify-position",
            ExecutorEvent::ClosePosition { .. } => "close-position",
            ExecutorEvent::SafetyAlert { .. } => "safety-alert",
            ExecutorEvent::ReconnectionStruggling { .. } => "reconnection-struggling",
            ExecutorEvent::MaxReconnectAttemptsReached { .. } => "max-reconnect-attempts-reached",
            ExecutorEvent::EmergencyStop { .. } => "emergency-stop",
            ExecutorEvent::CommandCompleted { .. } => "command-completed",
            ExecutorEvent::HeartbeatMissed { .. } => "heartbeat-missed",
        }
    }
}

/// Listener interface for the event bus.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ExecutorEvent);
}

/// Listener that logs every event at info level.
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn on_event(&self, event: &ExecutorEvent) {
        tracing::info!(kind = event.kind(), "event: {:?}", event);
    }
}
