//! The pre-trade check chain.
//!
//! Each check is small and self-contained, returning pass / warn / fail
//! with a reason. The gatekeeper runs all of them so the report shows every
//! concern, not just the first.

use crate::domain::errors::RiskRejection;
use crate::domain::risk_limits::RiskLimits;
use crate::domain::types::{AccountInfo, Position, SymbolInfo, TradeSignal};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;

pub const CONTRACT_SIZE: f64 = 100_000.0;

#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Pass,
    Warn(String),
    Fail(String),
}

impl CheckOutcome {
    pub fn passed(&self) -> bool {
        !matches!(self, CheckOutcome::Fail(_))
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            CheckOutcome::Pass => None,
            CheckOutcome::Warn(r) | CheckOutcome::Fail(r) => Some(r),
        }
    }
}

pub struct RiskContext<'a> {
    pub signal: &'a TradeSignal,
    pub account: &'a AccountInfo,
    pub limits: &'a RiskLimits,
    pub open_positions: &'a [Position],
    pub daily_pnl: Decimal,
    pub starting_balance: Decimal,
    pub peak_balance: Decimal,
    pub symbol_info: Option<&'a SymbolInfo>,
    /// Correlations of the signal symbol against each open-position symbol,
    /// resolved from the cache before the chain runs.
    pub correlations: &'a HashMap<String, f64>,
    /// Resolved from the news calendar before the chain runs.
    pub news_blocked: bool,
}

/// One named pre-trade check.
pub trait RiskCheck: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, ctx: &RiskContext<'_>) -> CheckOutcome;
}

/// Margin consumed by `lots` of `symbol` at `price`.
pub fn margin_exposure(lots: f64, price: f64, leverage: u32) -> f64 {
    if leverage == 0 {
        return 0.0;
    }
    lots * CONTRACT_SIZE * price / f64::from(leverage)
}

/// 1. Daily loss: reaching either the absolute or the percentage ceiling is
/// a violation (equality fails).
pub struct DailyLossCheck;

impl RiskCheck for DailyLossCheck {
    fn name(&self) -> &'static str {
        "daily-loss"
    }

    fn check(&self, ctx: &RiskContext<'_>) -> CheckOutcome {
        let loss = (-ctx.daily_pnl).max(Decimal::ZERO);
        if loss >= ctx.limits.max_daily_loss {
            return CheckOutcome::Fail(
                RiskRejection::DailyLoss {
                    loss: loss.to_f64().unwrap_or(0.0),
                    limit: ctx.limits.max_daily_loss.to_f64().unwrap_or(0.0),
                }
                .to_string(),
            );
        }
        if ctx.starting_balance > Decimal::ZERO {
            let pct = (loss / ctx.starting_balance).to_f64().unwrap_or(0.0) * 100.0;
            if pct >= ctx.limits.max_daily_loss_pct {
                return CheckOutcome::Fail(
                    RiskRejection::DailyLossPct {
                        pct,
                        limit_pct: ctx.limits.max_daily_loss_pct,
                    }
                    .to_string(),
                );
            }
        }
        CheckOutcome::Pass
    }
}

/// 2. Open position count must stay strictly below the cap.
pub struct MaxPositionsCheck;

impl RiskCheck for MaxPositionsCheck {
    fn name(&self) -> &'static str {
        "max-positions"
    }

    fn check(&self, ctx: &RiskContext<'_>) -> CheckOutcome {
        let open = ctx.open_positions.len();
        if open >= ctx.limits.max_positions {
            CheckOutcome::Fail(
                RiskRejection::MaxPositions {
                    open,
                    max: ctx.limits.max_positions,
                }
                .to_string(),
            )
        } else {
            CheckOutcome::Pass
        }
    }
}

/// 3. Peak-to-equity drawdown within absolute and percentage bounds.
pub struct DrawdownCheck;

impl RiskCheck for DrawdownCheck {
    fn name(&self) -> &'static str {
        "drawdown"
    }

    fn check(&self, ctx: &RiskContext<'_>) -> CheckOutcome {
        let drawdown = (ctx.peak_balance - ctx.account.equity).max(Decimal::ZERO);
        if drawdown >= ctx.limits.max_drawdown {
            return CheckOutcome::Fail(
                RiskRejection::Drawdown {
                    drawdown: drawdown.to_f64().unwrap_or(0.0),
                    limit: ctx.limits.max_drawdown.to_f64().unwrap_or(0.0),
                }
                .to_string(),
            );
        }
        if ctx.peak_balance > Decimal::ZERO {
            let pct = (drawdown / ctx.peak_balance).to_f64().unwrap_or(0.0) * 100.0;
            if pct >= ctx.limits.max_drawdown_pct {
                return CheckOutcome::Fail(format!(
                    "Drawdown {:.2}% reached limit {:.2}%",
                    pct, ctx.limits.max_drawdown_pct
                ));
            }
        }
        CheckOutcome::Pass
    }
}

/// 4. Requested volume may not exceed the lot ceiling.
pub struct LotSizeCheck;

impl RiskCheck for LotSizeCheck {
    fn name(&self) -> &'static str {
        "lot-size"
    }

    fn check(&self, ctx: &RiskContext<'_>) -> CheckOutcome {
        if ctx.signal.volume > ctx.limits.max_lot_size {
            CheckOutcome::Fail(
                RiskRejection::LotSize {
                    volume: ctx.signal.volume.to_f64().unwrap_or(0.0),
                    max: ctx.limits.max_lot_size.to_f64().unwrap_or(0.0),
                }
                .to_string(),
            )
        } else {
            CheckOutcome::Pass
        }
    }
}

/// 5. Free margin must cover 1.5x the required margin; between 1.0x and
/// 1.5x the trade proceeds with a warning.
pub struct MarginCheck;

impl RiskCheck for MarginCheck {
    fn name(&self) -> &'static str {
        "margin"
    }

    fn check(&self, ctx: &RiskContext<'_>) -> CheckOutcome {
        if !ctx.limits.require_margin_check {
            return CheckOutcome::Pass;
        }
        let Some(info) = ctx.symbol_info else {
            return CheckOutcome::Warn("No quote available for margin estimate".to_string());
        };
        let required = margin_exposure(
            ctx.signal.volume.to_f64().unwrap_or(0.0),
            info.ask,
            ctx.account.leverage,
        );
        let free = ctx.account.free_margin.to_f64().unwrap_or(0.0);
        if free >= required * 1.5 {
            CheckOutcome::Pass
        } else if free >= required {
            CheckOutcome::Warn(format!(
                "Free margin {:.2} under 1.5x of required {:.2}",
                free, required
            ))
        } else {
            CheckOutcome::Fail(RiskRejection::Margin { free, required }.to_string())
        }
    }
}

/// 6. Symbol must currently be open for trading.
pub struct TradingHoursCheck;

impl RiskCheck for TradingHoursCheck {
    fn name(&self) -> &'static str {
        "trading-hours"
    }

    fn check(&self, ctx: &RiskContext<'_>) -> CheckOutcome {
        if !ctx.limits.check_trading_hours {
            return CheckOutcome::Pass;
        }
        match ctx.symbol_info {
            Some(info) if !info.trade_allowed => CheckOutcome::Fail(
                RiskRejection::MarketClosed {
                    symbol: ctx.signal.symbol.clone(),
                }
                .to_string(),
            ),
            _ => CheckOutcome::Pass,
        }
    }
}

/// 7. Absolute correlation against every open position within the limit
/// (equality passes; the operator is <=).
pub struct CorrelationCheck;

impl RiskCheck for CorrelationCheck {
    fn name(&self) -> &'static str {
        "correlation"
    }

    fn check(&self, ctx: &RiskContext<'_>) -> CheckOutcome {
        for (other, rho) in ctx.correlations {
            if rho.abs() > ctx.limits.max_correlation {
                return CheckOutcome::Fail(
                    RiskRejection::Correlation {
                        symbol: ctx.signal.symbol.clone(),
                        other: other.clone(),
                        rho: *rho,
                        max: ctx.limits.max_correlation,
                    }
                    .to_string(),
                );
            }
        }
        CheckOutcome::Pass
    }
}

/// 8. Current plus estimated new exposure within the total cap.
pub struct ExposureCheck;

impl RiskCheck for ExposureCheck {
    fn name(&self) -> &'static str {
        "total-exposure"
    }

    fn check(&self, ctx: &RiskContext<'_>) -> CheckOutcome {
        let leverage = ctx.account.leverage;
        let current: f64 = ctx
            .open_positions
            .iter()
            .map(|p| {
                margin_exposure(p.volume.to_f64().unwrap_or(0.0), p.current_price, leverage)
            })
            .sum();
        let price = ctx.symbol_info.map(|i| i.ask).unwrap_or(1.0);
        let added = margin_exposure(
            ctx.signal.volume.to_f64().unwrap_or(0.0),
            price,
            leverage,
        );
        let max = ctx.limits.max_total_exposure.to_f64().unwrap_or(f64::MAX);
        if current + added > max {
            CheckOutcome::Fail(
                RiskRejection::Exposure {
                    current,
                    added,
                    max,
                }
                .to_string(),
            )
        } else {
            CheckOutcome::Pass
        }
    }
}

/// 9. No high-impact news inside the configured window.
pub struct NewsCheck;

impl RiskCheck for NewsCheck {
    fn name(&self) -> &'static str {
        "news"
    }

    fn check(&self, ctx: &RiskContext<'_>) -> CheckOutcome {
        if ctx.limits.check_news && ctx.news_blocked {
            CheckOutcome::Fail(
                RiskRejection::NewsWindow {
                    symbol: ctx.signal.symbol.clone(),
                    window_minutes: 30,
                }
                .to_string(),
            )
        } else {
            CheckOutcome::Pass
        }
    }
}

/// The standard chain in execution order.
pub fn default_chain() -> Vec<Box<dyn RiskCheck>> {
    vec![
        Box::new(DailyLossCheck),
        Box::new(MaxPositionsCheck),
        Box::new(DrawdownCheck),
        Box::new(LotSizeCheck),
        Box::new(MarginCheck),
        Box::new(TradingHoursCheck),
        Box::new(CorrelationCheck),
        Box::new(ExposureCheck),
        Box::new(NewsCheck),
    ]
}
