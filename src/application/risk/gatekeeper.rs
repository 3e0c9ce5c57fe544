//! The pre-trade gatekeeper.
//!
//! Runs the full check chain for every outgoing signal. A rejection is
//! local and final: the signal is dropped, a safety alert goes out, and
//! nothing downstream retries.

use crate::application::evaluation::filters::NewsCalendar;
use crate::application::risk::checks::{CheckOutcome, RiskCheck, RiskContext, default_chain};
use crate::application::risk::correlation::CorrelationCache;
use crate::domain::events::ExecutorEvent;
use crate::domain::risk_limits::RiskLimits;
use crate::domain::types::{AccountInfo, Position, SymbolInfo, TradeSignal};
use crate::infrastructure::event_bus::EventBus;
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug)]
pub struct GateReport {
    pub approved: bool,
    pub results: Vec<(&'static str, CheckOutcome)>,
}

impl GateReport {
    pub fn failures(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter_map(|(_, outcome)| match outcome {
                CheckOutcome::Fail(reason) => Some(reason.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn warnings(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter_map(|(_, outcome)| match outcome {
                CheckOutcome::Warn(reason) => Some(reason.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Balance snapshot the executor threads through every validation.
#[derive(Debug, Clone, Copy)]
pub struct AccountState {
    pub daily_pnl: Decimal,
    pub starting_balance: Decimal,
    pub peak_balance: Decimal,
}

pub struct RiskGatekeeper {
    checks: Vec<Box<dyn RiskCheck>>,
    limits: Mutex<RiskLimits>,
    correlation: Arc<CorrelationCache>,
    news: Option<Arc<dyn NewsCalendar>>,
    events: EventBus,
}

impl RiskGatekeeper {
    pub fn new(
        limits: RiskLimits,
        correlation: Arc<CorrelationCache>,
        news: Option<Arc<dyn NewsCalendar>>,
        events: EventBus,
    ) -> Self {
        Self {
            checks: default_chain(),
            limits: Mutex::new(limits),
            correlation,
            news,
            events,
        }
    }

    pub fn limits(&self) -> RiskLimits {
        self.limits.lock().expect("risk limits poisoned").clone()
    }

    /// Infrequent; called on executor-config-update.
    pub fn update_limits(&self, limits: RiskLimits) {
        info!("Risk limits updated");
        *self.limits.lock().expect("risk limits poisoned") = limits;
    }

    pub fn correlation_cache(&self) -> Arc<CorrelationCache> {
        Arc::clone(&self.correlation)
    }

    /// Run the whole chain. Emits `safety-alert` and logs on rejection.
    pub async fn validate(
        &self,
        signal: &TradeSignal,
        account: &AccountInfo,
        open_positions: &[Position],
        state: AccountState,
        symbol_info: Option<&SymbolInfo>,
    ) -> GateReport {
        let limits = self.limits();
        let correlations = self
            .correlation
            .against_positions(&signal.symbol, open_positions);

        let news_blocked = if limits.check_news {
            match &self.news {
                Some(calendar) => calendar
                    .high_impact_within(&signal.symbol, Duration::from_secs(30 * 60))
                    .await
                    .unwrap_or(false),
                None => false,
            }
        } else {
            false
        };

        let ctx = RiskContext {
            signal,
            account,
            limits: &limits,
            open_positions,
            daily_pnl: state.daily_pnl,
            starting_balance: state.starting_balance,
            peak_balance: state.peak_balance,
            symbol_info,
            correlations: &correlations,
            news_blocked,
        };

        let mut results = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            results.push((check.name(), check.check(&ctx)));
        }
        let approved = results.iter().all(|(_, outcome)| outcome.passed());
        let report = GateReport { approved, results };

        if !approved {
            let reason = report.failures().join("; ");
            warn!(
                "Risk gate rejected {} {} {}: {}",
                signal.action, signal.symbol, signal.volume, reason
            );
            self.events
                .publish(ExecutorEvent::SafetyAlert {
                    reason,
                    strategy_id: Some(signal.strategy_id.clone()),
                    symbol: Some(signal.symbol.clone()),
                })
                .await;
        } else {
            for warning in report.warnings() {
                warn!("Risk gate warning for {}: {}", signal.symbol, warning);
            }
        }
        report
    }
}
