//! Smart exits: partial take-downs, breakeven, trailing, time and swing
//! stops.
//!
//! Planning is a pure function over one position record so the rules are
//! testable without a broker. The manager walks managed positions each
//! tick, persists fired-level state back to the registry, and hands the
//! resulting actions to the order dispatcher.

use crate::application::positions::registry::{PositionRecord, PositionRegistry};
use crate::domain::strategy::{ExitTrigger, SmartExitSpec};
use crate::domain::types::{Bar, OrderSide};
use crate::indicators;
use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Partial exits of at least this share move the stop to breakeven.
const BREAKEVEN_PARTIAL_THRESHOLD: f64 = 25.0;

/// Action emitted toward the order dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitAction {
    Modify {
        ticket: u64,
        new_sl: f64,
        reason: String,
    },
    Close {
        ticket: u64,
        /// Partial volume; `None` closes the whole position.
        volume: Option<Decimal>,
        reason: String,
    },
}

/// Plan for one position on one tick, including the registry state updates
/// that must be persisted if the actions are dispatched.
#[derive(Debug, Default, Clone)]
pub struct ExitPlan {
    pub actions: Vec<ExitAction>,
    pub fired_levels: Vec<(usize, f64)>,
    pub breakeven_applied: bool,
    pub new_stop_loss: Option<f64>,
}

fn pip(point: f64) -> f64 {
    point * 10.0
}

fn sl_improves(side: OrderSide, current_sl: f64, candidate: f64) -> bool {
    if current_sl == 0.0 {
        return true;
    }
    match side {
        OrderSide::Buy => candidate > current_sl,
        OrderSide::Sell => candidate < current_sl,
    }
}

fn round_lots(volume: f64) -> Decimal {
    Decimal::from_f64(volume)
        .unwrap_or(Decimal::ZERO)
        .round_dp(2)
        .max(dec!(0.01))
}

/// Whether a partial-exit trigger has fired for this position.
fn trigger_fired(
    trigger: &ExitTrigger,
    record: &PositionRecord,
    point: f64,
    bars: &[Bar],
    now: DateTime<Utc>,
) -> bool {
    let position = &record.position;
    let profit_pips = position.profit_pips(point);
    match trigger {
        ExitTrigger::Pips(value) => profit_pips >= *value,
        ExitTrigger::Rr(value) => {
            if record.initial_stop_loss == 0.0 {
                return false;
            }
            let risk_pips =
                (position.open_price - record.initial_stop_loss).abs() / pip(point);
            risk_pips > 0.0 && profit_pips >= value * risk_pips
        }
        ExitTrigger::Atr(multiplier) => {
            let series = indicators::atr(bars, 14);
            match indicators::latest(&series, 0) {
                Some(atr) => {
                    let distance = match position.side {
                        OrderSide::Buy => position.current_price - position.open_price,
                        OrderSide::Sell => position.open_price - position.current_price,
                    };
                    distance >= atr * multiplier
                }
                None => false,
            }
        }
        ExitTrigger::Swing { lookback } => {
            if bars.len() < *lookback || *lookback == 0 {
                return false;
            }
            let window = &bars[bars.len() - lookback..];
            match position.side {
                OrderSide::Buy => {
                    let high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
                    position.current_price >= high
                }
                OrderSide::Sell => {
                    let low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
                    position.current_price <= low
                }
            }
        }
        ExitTrigger::Price(value) => match position.side {
            OrderSide::Buy => position.current_price >= *value,
            OrderSide::Sell => position.current_price <= *value,
        },
        ExitTrigger::Time { minutes } => {
            let held = now.signed_duration_since(record.first_seen);
            held.num_minutes() >= i64::from(*minutes)
        }
    }
}

/// Evaluate every smart-exit rule for one position.
pub fn plan_exits(
    record: &PositionRecord,
    spec: &SmartExitSpec,
    point: f64,
    bars: &[Bar],
    now: DateTime<Utc>,
) -> ExitPlan {
    let mut plan = ExitPlan::default();
    let position = &record.position;
    let profit_pips = position.profit_pips(point);
    let entry = position.open_price;

    // Time-based exit closes everything; nothing else matters then.
    if let Some(time_exit) = &spec.time_exit {
        let held = now.signed_duration_since(record.first_seen);
        let over_minutes = time_exit
            .max_holding_minutes
            .map(|m| held.num_minutes() >= i64::from(m))
            .unwrap_or(false);
        let over_hours = time_exit
            .max_holding_hours
            .map(|h| held.num_hours() >= i64::from(h))
            .unwrap_or(false);
        let past_wall_clock = time_exit
            .close_at
            .as_deref()
            .and_then(|s| NaiveTime::parse_from_str(s, "%H:%M").ok())
            .map(|t| now.time() >= t && record.first_seen.time() < t)
            .unwrap_or(false);
        if over_minutes || over_hours || past_wall_clock {
            plan.actions.push(ExitAction::Close {
                ticket: position.ticket,
                volume: None,
                reason: format!("held {}m, time exit", held.num_minutes()),
            });
            return plan;
        }
    }

    // Partial exits: fire-once levels against the remaining volume, capped
    // by max_total_exit and floored by max_remaining.
    let mut exited_pct = record.exited_pct;
    let mut remaining = position.volume.to_f64().unwrap_or(0.0);
    let initial = record.initial_volume.to_f64().unwrap_or(0.0);
    let mut partial_fired_pct = 0.0;

    for (index, level) in spec.partial_exits.iter().enumerate() {
        if record.fired_levels.contains(&index)
            || plan.fired_levels.iter().any(|(i, _)| *i == index)
        {
            continue;
        }
        if !trigger_fired(&level.trigger, record, point, bars, now) {
            continue;
        }

        let mut pct = level.percentage;
        if exited_pct + pct > spec.max_total_exit {
            // Trim the excess instead of skipping the level outright.
            pct = (spec.max_total_exit - exited_pct).max(0.0);
        }
        if pct <= 0.0 {
            continue;
        }

        let mut close_volume = remaining * pct / 100.0;
        if spec.max_remaining > 0.0 && initial > 0.0 {
            let floor = initial * spec.max_remaining / 100.0;
            if remaining - close_volume < floor {
                close_volume = (remaining - floor).max(0.0);
            }
        }
        if close_volume < 0.01 {
            continue;
        }

        plan.actions.push(ExitAction::Close {
            ticket: position.ticket,
            volume: Some(round_lots(close_volume)),
            reason: format!("partial exit level {} ({}%)", index + 1, level.percentage),
        });
        plan.fired_levels.push((index, pct));
        remaining -= close_volume;
        exited_pct += pct;
        partial_fired_pct += pct;
    }

    // Stop management: gather candidates and keep only the tightest.
    let mut sl_candidates: Vec<(f64, String)> = Vec::new();
    let pip_size = pip(point);

    if partial_fired_pct >= BREAKEVEN_PARTIAL_THRESHOLD
        && spec.breakeven_after_partial
        && !record.breakeven_applied
    {
        sl_candidates.push((entry, "breakeven after partial exit".to_string()));
        plan.breakeven_applied = true;
    }

    if let Some(breakeven) = &spec.breakeven {
        if !record.breakeven_applied && profit_pips >= breakeven.activation_profit {
            let lock = breakeven.lock_profit * pip_size;
            let candidate = match position.side {
                OrderSide::Buy => entry + lock,
                OrderSide::Sell => entry - lock,
            };
            sl_candidates.push((candidate, "breakeven activation".to_string()));
            plan.breakeven_applied = true;
        }
    }

    if let Some(trailing) = &spec.trailing {
        if profit_pips >= trailing.activation_profit {
            let distance = trailing.distance * pip_size;
            let candidate = match position.side {
                OrderSide::Buy => position.current_price - distance,
                OrderSide::Sell => position.current_price + distance,
            };
            sl_candidates.push((candidate, "trailing stop".to_string()));
        }
    }

    if let Some(swing) = &spec.swing_stop {
        if swing.lookback > 0 && bars.len() >= swing.lookback {
            let window = &bars[bars.len() - swing.lookback..];
            let candidate = match position.side {
                OrderSide::Buy => window.iter().map(|b| b.low).fold(f64::MAX, f64::min),
                OrderSide::Sell => window.iter().map(|b| b.high).fold(f64::MIN, f64::max),
            };
            sl_candidates.push((candidate, "swing-point stop".to_string()));
        }
    }

    // Tighten-only: drop candidates that would loosen the current stop,
    // then keep the most protective of the rest.
    let best = sl_candidates
        .into_iter()
        .filter(|(candidate, _)| sl_improves(position.side, position.stop_loss, *candidate))
        .reduce(|a, b| match position.side {
            OrderSide::Buy => if b.0 > a.0 { b } else { a },
            OrderSide::Sell => if b.0 < a.0 { b } else { a },
        });

    if let Some((new_sl, reason)) = best {
        plan.new_stop_loss = Some(new_sl);
        plan.actions.push(ExitAction::Modify {
            ticket: position.ticket,
            new_sl,
            reason,
        });
    }

    plan
}

/// Resolves specs by magic, plans per position, persists state, forwards
/// actions.
pub struct SmartExitManager {
    registry: Arc<PositionRegistry>,
    actions_tx: mpsc::Sender<ExitAction>,
}

impl SmartExitManager {
    pub fn new(registry: Arc<PositionRegistry>, actions_tx: mpsc::Sender<ExitAction>) -> Self {
        Self {
            registry,
            actions_tx,
        }
    }

    /// One pass over the managed book. `specs` maps each strategy magic to
    /// its smart-exit spec and timeframe, as snapshotted by the executor.
    pub async fn tick(
        &self,
        specs: &std::collections::HashMap<i64, (SmartExitSpec, crate::domain::types::Timeframe)>,
        market: &crate::application::market_data::MarketDataClient,
    ) {
        let now = Utc::now();
        for record in self.registry.managed().await {
            let magic = record.position.magic;
            let Some((spec, timeframe)) = specs.get(&magic) else {
                continue;
            };
            let symbol = record.position.symbol.clone();
            let point = market
                .symbol_info(&symbol)
                .await
                .map(|i| i.point)
                .unwrap_or(0.00001);
            let bars = market.bars(&symbol, *timeframe, 100).await.unwrap_or_default();
            let plan = plan_exits(&record, spec, point, &bars, now);
            if plan.actions.is_empty() {
                continue;
            }
            debug!(
                "Smart exit: {} actions for ticket {}",
                plan.actions.len(),
                record.position.ticket
            );

            for (index, pct) in &plan.fired_levels {
                self.registry
                    .mark_level_fired(record.position.ticket, *index, *pct)
                    .await;
            }
            if plan.breakeven_applied {
                self.registry
                    .mark_breakeven_applied(record.position.ticket)
                    .await;
            }
            if let Some(new_sl) = plan.new_stop_loss {
                self.registry
                    .record_stop_loss(record.position.ticket, new_sl)
                    .await;
            }
            for action in plan.actions {
                if self.actions_tx.send(action).await.is_err() {
                    info!("Smart exit: dispatcher gone, dropping actions");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::strategy::{
        BreakevenSpec, PartialExitLevel, SwingStopSpec, TimeExitSpec, TrailingSpec,
    };
    use crate::domain::types::Position;
    use chrono::TimeZone;
    use std::collections::HashSet;

    const POINT: f64 = 0.00001;

    fn record(side: OrderSide, open: f64, current: f64, sl: f64) -> PositionRecord {
        let position = Position {
            ticket: 11,
            symbol: "EURUSD".to_string(),
            side,
            volume: dec!(1.00),
            open_price: open,
            current_price: current,
            stop_loss: sl,
            take_profit: 0.0,
            profit: dec!(0),
            open_time: Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).unwrap(),
            magic: 1001,
            comment: String::new(),
        };
        PositionRecord {
            first_seen: position.open_time,
            initial_volume: position.volume,
            initial_stop_loss: position.stop_loss,
            best_price: position.current_price,
            fired_levels: HashSet::new(),
            exited_pct: 0.0,
            breakeven_applied: false,
            position,
        }
    }

    fn bare_spec() -> SmartExitSpec {
        SmartExitSpec {
            partial_exits: Vec::new(),
            max_total_exit: 100.0,
            max_remaining: 0.0,
            breakeven_after_partial: true,
            breakeven: None,
            trailing: None,
            time_exit: None,
            swing_stop: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_partial_exit_scenario_with_breakeven() {
        // BUY at 1.1000, current 1.1050 (50 pips), level {pips:40, 50%}.
        let record = record(OrderSide::Buy, 1.1000, 1.1050, 0.0);
        let mut spec = bare_spec();
        spec.partial_exits = vec![PartialExitLevel {
            trigger: ExitTrigger::Pips(40.0),
            percentage: 50.0,
        }];

        let plan = plan_exits(&record, &spec, POINT, &[], now());
        assert_eq!(plan.fired_levels, vec![(0, 50.0)]);
        assert_eq!(plan.actions.len(), 2);
        assert_eq!(
            plan.actions[0],
            ExitAction::Close {
                ticket: 11,
                volume: Some(dec!(0.50)),
                reason: "partial exit level 1 (50%)".to_string(),
            }
        );
        // SL moved to breakeven at entry.
        match &plan.actions[1] {
            ExitAction::Modify { new_sl, .. } => assert!((new_sl - 1.1000).abs() < 1e-9),
            other => panic!("expected modify, got {:?}", other),
        }
        assert!(plan.breakeven_applied);
    }

    #[test]
    fn test_fired_level_does_not_refire() {
        let mut rec = record(OrderSide::Buy, 1.1000, 1.1050, 0.0);
        rec.fired_levels.insert(0);
        rec.exited_pct = 50.0;
        let mut spec = bare_spec();
        spec.partial_exits = vec![PartialExitLevel {
            trigger: ExitTrigger::Pips(40.0),
            percentage: 50.0,
        }];
        let plan = plan_exits(&rec, &spec, POINT, &[], now());
        assert!(plan.fired_levels.is_empty());
    }

    #[test]
    fn test_max_total_exit_trims_excess() {
        let rec = record(OrderSide::Buy, 1.1000, 1.1100, 0.0);
        let mut spec = bare_spec();
        spec.max_total_exit = 70.0;
        spec.partial_exits = vec![
            PartialExitLevel {
                trigger: ExitTrigger::Pips(40.0),
                percentage: 50.0,
            },
            PartialExitLevel {
                trigger: ExitTrigger::Pips(80.0),
                percentage: 50.0,
            },
        ];
        let plan = plan_exits(&rec, &spec, POINT, &[], now());
        // Second level trimmed from 50 to the remaining 20.
        assert_eq!(plan.fired_levels, vec![(0, 50.0), (1, 20.0)]);
    }

    #[test]
    fn test_max_remaining_floor() {
        let rec = record(OrderSide::Buy, 1.1000, 1.1050, 0.0);
        let mut spec = bare_spec();
        spec.max_remaining = 60.0; // keep at least 0.6 of the 1.0 lot
        spec.partial_exits = vec![PartialExitLevel {
            trigger: ExitTrigger::Pips(40.0),
            percentage: 50.0,
        }];
        let plan = plan_exits(&rec, &spec, POINT, &[], now());
        match &plan.actions[0] {
            ExitAction::Close { volume, .. } => assert_eq!(*volume, Some(dec!(0.40))),
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[test]
    fn test_rr_trigger_uses_initial_risk() {
        // Risk 25 pips, profit 50 pips -> 2R reached.
        let rec = record(OrderSide::Buy, 1.1000, 1.1050, 1.09750);
        let mut spec = bare_spec();
        spec.partial_exits = vec![PartialExitLevel {
            trigger: ExitTrigger::Rr(2.0),
            percentage: 30.0,
        }];
        let plan = plan_exits(&rec, &spec, POINT, &[], now());
        assert_eq!(plan.fired_levels.len(), 1);
    }

    #[test]
    fn test_breakeven_activation_with_lock() {
        let rec = record(OrderSide::Buy, 1.1000, 1.1030, 1.0950);
        let mut spec = bare_spec();
        spec.breakeven = Some(BreakevenSpec {
            activation_profit: 25.0,
            lock_profit: 5.0,
        });
        let plan = plan_exits(&rec, &spec, POINT, &[], now());
        match &plan.actions[0] {
            ExitAction::Modify { new_sl, .. } => assert!((new_sl - 1.10050).abs() < 1e-9),
            other => panic!("expected modify, got {:?}", other),
        }
    }

    #[test]
    fn test_trailing_only_tightens() {
        // SL already at 1.1040; a 15-pip trail from 1.1050 (1.1035) loosens.
        let rec = record(OrderSide::Buy, 1.1000, 1.1050, 1.1040);
        let mut spec = bare_spec();
        spec.trailing = Some(TrailingSpec {
            activation_profit: 20.0,
            distance: 15.0,
        });
        let plan = plan_exits(&rec, &spec, POINT, &[], now());
        assert!(plan.actions.is_empty());

        // From 1.1070 the trail (1.1055) tightens past 1.1040.
        let rec = record(OrderSide::Buy, 1.1000, 1.1070, 1.1040);
        let plan = plan_exits(&rec, &spec, POINT, &[], now());
        match &plan.actions[0] {
            ExitAction::Modify { new_sl, .. } => assert!((new_sl - 1.1055).abs() < 1e-9),
            other => panic!("expected modify, got {:?}", other),
        }
    }

    #[test]
    fn test_sell_trailing_direction() {
        let rec = record(OrderSide::Sell, 1.1000, 1.0940, 1.1000);
        let mut spec = bare_spec();
        spec.trailing = Some(TrailingSpec {
            activation_profit: 20.0,
            distance: 15.0,
        });
        let plan = plan_exits(&rec, &spec, POINT, &[], now());
        match &plan.actions[0] {
            ExitAction::Modify { new_sl, .. } => assert!((new_sl - 1.0955).abs() < 1e-9),
            other => panic!("expected modify, got {:?}", other),
        }
    }

    #[test]
    fn test_time_exit_full_close() {
        let rec = record(OrderSide::Buy, 1.1000, 1.1010, 0.0);
        let mut spec = bare_spec();
        spec.time_exit = Some(TimeExitSpec {
            max_holding_minutes: Some(30),
            max_holding_hours: None,
            close_at: None,
        });
        // Held a full hour.
        let plan = plan_exits(&rec, &spec, POINT, &[], now());
        assert_eq!(plan.actions.len(), 1);
        match &plan.actions[0] {
            ExitAction::Close { volume, .. } => assert!(volume.is_none()),
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[test]
    fn test_swing_stop_uses_recent_low() {
        let bars: Vec<Bar> = [1.1020, 1.1030, 1.1025]
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                open_time: Utc.timestamp_opt(i as i64 * 60, 0).unwrap(),
                open: c,
                high: c + 0.0005,
                low: c - 0.0005,
                close: c,
                volume: 1.0,
                spread: 0.0,
            })
            .collect();
        let rec = record(OrderSide::Buy, 1.1000, 1.1050, 1.0990);
        let mut spec = bare_spec();
        spec.swing_stop = Some(SwingStopSpec { lookback: 3 });
        let plan = plan_exits(&rec, &spec, POINT, &bars, now());
        match &plan.actions[0] {
            // Lowest low of the window: 1.1020 - 0.0005.
            ExitAction::Modify { new_sl, .. } => assert!((new_sl - 1.1015).abs() < 1e-9),
            other => panic!("expected modify, got {:?}", other),
        }
    }
}
