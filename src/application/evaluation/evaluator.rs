//! Per-symbol strategy evaluation.
//!
//! One call covers the whole §"tick" for a (strategy, symbol) pair: bars,
//! filters, exit conditions against the open position, entry conditions,
//! direction, SL/TP and sizing. The result is at most one actionable
//! signal.

use crate::application::evaluation::conditions::{self, ConditionVerdict};
use crate::application::evaluation::filters::{self, FilterContext, NewsCalendar};
use crate::application::evaluation::sizing::{self, SizingInputs};
use crate::application::evaluation::sltp;
use crate::application::market_data::{DEFAULT_BAR_COUNT, MarketDataClient, REGIME_BAR_COUNT};
use crate::application::positions::PositionRegistry;
use crate::application::risk::{CorrelationCache, correlation_adjustment};
use crate::domain::regime::{RegimeAssessment, RegimeDetector};
use crate::domain::risk_limits::AccountKind;
use crate::domain::strategy::{DirectionRule, Filter, Strategy};
use crate::domain::types::{
    AccountInfo, Bar, OrderSide, SymbolInfo, TradeAction, TradeSignal,
};
use crate::indicators::cache::IndicatorCache;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

/// Everything one tick produced for a symbol.
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub strategy_id: String,
    pub symbol: String,
    pub action: TradeAction,
    pub confidence: u8,
    pub reasons: Vec<String>,
    /// Present for BUY / SELL / CLOSE actions only.
    pub signal: Option<TradeSignal>,
    pub regime: Option<RegimeAssessment>,
}

impl EvaluationOutcome {
    fn wait(strategy: &Strategy, symbol: &str, reason: String) -> Self {
        Self {
            strategy_id: strategy.id.clone(),
            symbol: symbol.to_string(),
            action: TradeAction::Wait,
            confidence: 0,
            reasons: vec![reason],
            signal: None,
            regime: None,
        }
    }
}

pub struct StrategyEvaluator {
    market: Arc<MarketDataClient>,
    cache: Arc<IndicatorCache>,
    registry: Arc<PositionRegistry>,
    correlation: Arc<CorrelationCache>,
    news: Option<Arc<dyn NewsCalendar>>,
    account_kind: AccountKind,
}

impl StrategyEvaluator {
    pub fn new(
        market: Arc<MarketDataClient>,
        cache: Arc<IndicatorCache>,
        registry: Arc<PositionRegistry>,
        correlation: Arc<CorrelationCache>,
        news: Option<Arc<dyn NewsCalendar>>,
        account_kind: AccountKind,
    ) -> Self {
        Self {
            market,
            cache,
            registry,
            correlation,
            news,
            account_kind,
        }
    }

    pub fn indicator_cache(&self) -> Arc<IndicatorCache> {
        Arc::clone(&self.cache)
    }

    /// Quote lookup for callers that need pricing outside a tick.
    pub async fn market_symbol_info(&self, symbol: &str) -> Option<SymbolInfo> {
        self.market.symbol_info(symbol).await.ok()
    }

    fn required_bars(strategy: &Strategy) -> usize {
        if strategy.regime.as_ref().map(|r| r.enabled).unwrap_or(false) {
            REGIME_BAR_COUNT
        } else {
            DEFAULT_BAR_COUNT
        }
    }

    /// Evaluate one symbol for one strategy.
    pub async fn evaluate_symbol(
        &self,
        strategy: &Strategy,
        symbol: &str,
        account: &AccountInfo,
    ) -> Result<EvaluationOutcome> {
        let bars = match self
            .market
            .bars(symbol, strategy.timeframe, Self::required_bars(strategy))
            .await
        {
            Ok(bars) => bars,
            Err(e) => {
                return Ok(EvaluationOutcome::wait(
                    strategy,
                    symbol,
                    format!("market data unavailable: {}", e),
                ));
            }
        };
        let symbol_info = self.market.symbol_info(symbol).await.ok();

        // Filters first; one failure ends the tick as WAIT.
        let mut filter_list = strategy.filters.clone();
        if let Some(sessions) = &strategy.sessions {
            filter_list.push(Filter::Session {
                allowed: sessions.clone(),
            });
        }
        let ctx = FilterContext {
            now: Utc::now(),
            symbol,
            symbol_info: symbol_info.as_ref(),
            bars: &bars,
            news: self.news.as_deref(),
        };
        let (filters_passed, filter_verdicts) =
            filters::evaluate_filters(&filter_list, &ctx).await;
        if !filters_passed {
            let reason = filter_verdicts
                .last()
                .map(|v| v.reason.clone())
                .unwrap_or_else(|| "filter failed".to_string());
            return Ok(EvaluationOutcome::wait(strategy, symbol, reason));
        }

        // Positions and orders live in the broker's symbol namespace.
        let broker_symbol = self.market.mapper().map(symbol).to_string();
        let magic = strategy.magic_number();
        let has_open = self.registry.has_open(magic, &broker_symbol).await;

        // Open position with exit conditions: exits take precedence.
        if has_open && !strategy.exit_conditions.is_empty() {
            let (exit_met, verdicts) =
                self.run_conditions(strategy, symbol, &strategy.exit_conditions, &bars, true)?;
            if exit_met {
                let confidence = Self::confidence(&verdicts);
                let reasons = Self::reasons(&verdicts);
                return Ok(EvaluationOutcome {
                    strategy_id: strategy.id.clone(),
                    symbol: symbol.to_string(),
                    action: TradeAction::Close,
                    confidence,
                    reasons: reasons.clone(),
                    signal: Some(TradeSignal {
                        strategy_id: strategy.id.clone(),
                        symbol: broker_symbol,
                        action: TradeAction::Close,
                        confidence,
                        reasons,
                        volume: rust_decimal::Decimal::ZERO,
                        stop_loss: None,
                        take_profit: None,
                        magic,
                        generated_at: Utc::now(),
                    }),
                    regime: None,
                });
            }
        }

        // Entry conditions.
        let (entry_met, verdicts) =
            self.run_conditions(strategy, symbol, &strategy.entry_conditions, &bars, false)?;
        let confidence = Self::confidence(&verdicts);
        let reasons = Self::reasons(&verdicts);

        if !entry_met || has_open {
            return Ok(EvaluationOutcome {
                strategy_id: strategy.id.clone(),
                symbol: symbol.to_string(),
                action: TradeAction::Hold,
                confidence,
                reasons,
                signal: None,
                regime: None,
            });
        }

        // Direction, SL/TP, sizing.
        let side = match strategy.direction {
            DirectionRule::Long => OrderSide::Buy,
            DirectionRule::Short => OrderSide::Sell,
            DirectionRule::Auto => conditions::auto_side(&strategy.entry_conditions[0]),
        };
        let action = match side {
            OrderSide::Buy => TradeAction::Buy,
            OrderSide::Sell => TradeAction::Sell,
        };

        let (entry_price, point, pip_value) = Self::pricing(&symbol_info, &bars, side);

        let stop_loss = strategy
            .stop_loss
            .as_ref()
            .and_then(|spec| sltp::stop_loss_price(spec, side, entry_price, point, &bars));
        let take_profit = strategy.take_profit.as_ref().and_then(|spec| {
            sltp::take_profit_price(spec, side, entry_price, stop_loss, point, &bars)
        });

        let regime = if strategy.regime.as_ref().map(|r| r.enabled).unwrap_or(false) {
            RegimeDetector::detect(&bars)
        } else {
            None
        };
        let regime_multiplier = match (&strategy.regime, &regime) {
            (Some(spec), Some(assessment)) if spec.adapt_size => {
                assessment.regime.size_multiplier()
            }
            _ => 1.0,
        };

        let open_positions = self.registry.all().await;
        let adjustment =
            correlation_adjustment(&self.correlation, &broker_symbol, &open_positions);

        let sl_pips = stop_loss
            .map(|sl| (entry_price - sl).abs() / (point * 10.0))
            .unwrap_or(0.0);
        let volume = sizing::calculate_lots(
            &strategy.sizing,
            &SizingInputs {
                balance: account.balance,
                sl_pips,
                pip_value,
                point,
                bars: &bars,
                account: self.account_kind,
                regime_multiplier,
                size_factor: adjustment.size_factor,
            },
        );

        let confidence = confidence.min(adjustment.confidence);
        let mut reasons = reasons;
        if adjustment.is_hedge {
            reasons.push(format!(
                "hedges open book (weighted rho {:.2})",
                adjustment.weighted_rho
            ));
        } else if adjustment.size_factor < 1.0 {
            reasons.push(format!(
                "size reduced to {:.0}% by correlation {:.2}",
                adjustment.size_factor * 100.0,
                adjustment.weighted_rho
            ));
        }
        if let Some(assessment) = &regime {
            reasons.push(format!(
                "regime {} (x{:.1} size)",
                assessment.regime,
                assessment.regime.size_multiplier()
            ));
        }

        debug!(
            "Evaluated {} {}: {} confidence {}",
            strategy.id, symbol, action, confidence
        );
        Ok(EvaluationOutcome {
            strategy_id: strategy.id.clone(),
            symbol: symbol.to_string(),
            action,
            confidence,
            reasons: reasons.clone(),
            signal: Some(TradeSignal {
                strategy_id: strategy.id.clone(),
                symbol: broker_symbol,
                action,
                confidence,
                reasons,
                volume,
                stop_loss,
                take_profit,
                magic,
                generated_at: Utc::now(),
            }),
            regime,
        })
    }

    fn run_conditions(
        &self,
        strategy: &Strategy,
        symbol: &str,
        set: &[crate::domain::strategy::Condition],
        bars: &[Bar],
        is_exit: bool,
    ) -> Result<(bool, Vec<ConditionVerdict>)> {
        let mut verdicts = Vec::with_capacity(set.len());
        for condition in set {
            verdicts.push(conditions::evaluate_condition(
                &self.cache,
                symbol,
                strategy.timeframe,
                condition,
                bars,
            )?);
        }
        let logic = if is_exit {
            strategy.exit_logic
        } else {
            strategy.entry_logic
        };
        Ok((conditions::combine(&verdicts, logic), verdicts))
    }

    /// met conditions / total, as a rounded percentage.
    fn confidence(verdicts: &[ConditionVerdict]) -> u8 {
        if verdicts.is_empty() {
            return 0;
        }
        let met = verdicts.iter().filter(|v| v.met).count();
        ((met as f64 / verdicts.len() as f64) * 100.0).round() as u8
    }

    fn reasons(verdicts: &[ConditionVerdict]) -> Vec<String> {
        verdicts.iter().map(|v| v.reason.clone()).collect()
    }

    fn pricing(
        symbol_info: &Option<SymbolInfo>,
        bars: &[Bar],
        side: OrderSide,
    ) -> (f64, f64, f64) {
        match symbol_info {
            Some(info) => {
                let entry = match side {
                    OrderSide::Buy => info.ask,
                    OrderSide::Sell => info.bid,
                };
                (entry, info.point, info.pip_value)
            }
            None => {
                let entry = bars.last().map(|b| b.close).unwrap_or(0.0);
                (entry, 0.00001, 10.0)
            }
        }
    }
}
