use thiserror::Error;

/// Errors crossing component boundaries inside the executor.
///
/// Components catch at their boundary and either return one of these or emit
/// a structured event; the scheduler itself never unwinds.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Transient network failure on {transport}: {reason}")]
    Transient { transport: String, reason: String },

    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout { request_id: u64, timeout_ms: u64 },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Broker rejected {command}: {message}")]
    Broker { command: String, message: String },

    #[error("Command validation failed: {0}")]
    InvalidCommand(String),

    #[error("Unknown command kind: {0}")]
    UnknownCommand(String),

    #[error("Strategy {0} not found")]
    StrategyNotFound(String),

    #[error("Evaluation of {symbol} timed out after {timeout_secs}s")]
    EvaluationTimeout { symbol: String, timeout_secs: u64 },

    #[error("Not enough bars for {symbol}: have {have}, need {need}")]
    InsufficientBars {
        symbol: String,
        have: usize,
        need: usize,
    },

    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Emergency stop active, order dispatch blocked")]
    EmergencyStop,
}

/// Risk-gate rejections. A first-class outcome rather than a failure: the
/// signal is dropped, a safety alert is emitted, and nothing retries.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RiskRejection {
    #[error("Daily loss limit reached: {loss:.2} >= {limit:.2}")]
    DailyLoss { loss: f64, limit: f64 },

    #[error("Daily loss percentage limit reached: {pct:.2}% >= {limit_pct:.2}%")]
    DailyLossPct { pct: f64, limit_pct: f64 },

    #[error("Maximum open positions reached: {open} >= {max}")]
    MaxPositions { open: usize, max: usize },

    #[error("Drawdown limit exceeded: {drawdown:.2} >= {limit:.2}")]
    Drawdown { drawdown: f64, limit: f64 },

    #[error("Lot size {volume} exceeds maximum {max}")]
    LotSize { volume: f64, max: f64 },

    #[error("Insufficient free margin: {free:.2} < {required:.2}")]
    Margin { free: f64, required: f64 },

    #[error("Market closed for {symbol}")]
    MarketClosed { symbol: String },

    #[error("Correlation too high between {symbol} and {other}: |{rho:.2}| > {max:.2}")]
    Correlation {
        symbol: String,
        other: String,
        rho: f64,
        max: f64,
    },

    #[error("Total exposure limit: {current:.2} + {added:.2} > {max:.2}")]
    Exposure { current: f64, added: f64, max: f64 },

    #[error("High-impact news within {window_minutes}min window for {symbol}")]
    NewsWindow { symbol: String, window_minutes: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_reason_mentions_daily_loss() {
        let r = RiskRejection::DailyLoss {
            loss: 200.0,
            limit: 200.0,
        };
        assert!(r.to_string().contains("Daily loss"));
    }

    #[test]
    fn test_executor_error_formatting() {
        let e = ExecutorError::RequestTimeout {
            request_id: 42,
            timeout_ms: 5000,
        };
        let msg = e.to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("5000"));
    }
}
