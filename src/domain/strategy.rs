//! Strategy schema as received from the control plane.
//!
//! The wire format is untyped JSON; everything here deserializes strictly.
//! Unknown fields, filter kinds, sizing methods or exit triggers are hard
//! deserialization errors rather than silently ignored.

use crate::domain::types::Timeframe;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state driven by control-plane commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyStatus {
    Active,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConditionLogic {
    And,
    Or,
}

impl Default for ConditionLogic {
    fn default() -> Self {
        ConditionLogic::And
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "==")]
    Eq,
    CrossesAbove,
    CrossesBelow,
    Between,
}

/// Right-hand side of a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Operand {
    Value(f64),
    Indicator {
        indicator: String,
        #[serde(default)]
        params: BTreeMap<String, f64>,
    },
    /// Bounds for the `between` operator.
    Range { low: f64, high: f64 },
}

/// One entry or exit condition evaluated against the bar series.
///
/// Params use a `BTreeMap` so their JSON rendering is canonical; the
/// indicator cache keys on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    pub indicator: String,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
    pub operator: ConditionOperator,
    pub operand: Operand,
    /// Bars back from the latest closed bar; 0 = latest.
    #[serde(default)]
    pub shift: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradingSession {
    Asian,
    London,
    NewYork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingDay {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

/// Pre-entry filters. Any failing filter turns the tick into WAIT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Filter {
    /// HH:MM window in UTC; supports overnight wrap (start > end).
    Time { start: String, end: String },
    Session { allowed: Vec<TradingSession> },
    Spread { max_pips: f64 },
    Volatility {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    DayOfWeek { allowed: Vec<TradingDay> },
    /// Consults the external calendar collaborator; passes when absent.
    News {
        #[serde(default)]
        window_minutes: Option<u32>,
    },
}

/// Stop-loss placement method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum StopMethod {
    FixedPips(f64),
    Atr {
        multiplier: f64,
        #[serde(default = "default_atr_period")]
        period: usize,
    },
    Percent(f64),
    Price(f64),
}

fn default_atr_period() -> usize {
    14
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StopLossSpec {
    pub method: StopMethod,
    #[serde(default)]
    pub min_pips: Option<f64>,
    #[serde(default)]
    pub max_pips: Option<f64>,
}

/// Take-profit placement method; `ratio` is relative to the SL distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum TakeProfitMethod {
    FixedPips(f64),
    Atr {
        multiplier: f64,
        #[serde(default = "default_atr_period")]
        period: usize,
    },
    Percent(f64),
    Price(f64),
    Ratio(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TakeProfitSpec {
    pub method: TakeProfitMethod,
    #[serde(default)]
    pub min_pips: Option<f64>,
    #[serde(default)]
    pub max_pips: Option<f64>,
}

/// Position-sizing method applied to account balance and SL distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum SizingMethod {
    FixedLot { size: f64 },
    PercentageRisk { pct: f64 },
    AtrBased {
        multiplier: f64,
        risk_pct: f64,
        #[serde(default)]
        min_atr: Option<f64>,
        #[serde(default)]
        max_atr: Option<f64>,
        #[serde(default)]
        volatility_adjust: bool,
    },
    VolatilityBased {
        base: f64,
        factor: f64,
        lookback: usize,
    },
    Kelly {
        win_rate: f64,
        avg_win: f64,
        avg_loss: f64,
        #[serde(default = "default_kelly_fraction")]
        kelly_fraction: f64,
    },
    AccountEquity { pct: f64 },
}

fn default_kelly_fraction() -> f64 {
    0.25
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SizingSpec {
    pub method: SizingMethod,
    #[serde(default = "default_min_lot")]
    pub min_lot: f64,
    #[serde(default = "default_max_lot")]
    pub max_lot: f64,
}

fn default_min_lot() -> f64 {
    0.01
}

fn default_max_lot() -> f64 {
    10.0
}

/// Explicit direction rule. `auto` derives the side from the first entry
/// condition's operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionRule {
    Long,
    Short,
    Auto,
}

impl Default for DirectionRule {
    fn default() -> Self {
        DirectionRule::Auto
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorrelationSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub max_correlation: f64,
    #[serde(default = "default_corr_lookback")]
    pub lookback_bars: usize,
}

fn default_corr_lookback() -> usize {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegimeSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Scale position size by the regime multiplier.
    #[serde(default = "default_true")]
    pub adapt_size: bool,
}

fn default_true() -> bool {
    true
}

/// What fires a partial-exit level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum ExitTrigger {
    /// Unrealized profit in pips.
    Pips(f64),
    /// Multiple of the initial risk (reward:risk).
    Rr(f64),
    /// Multiple of ATR(14) in profit.
    Atr(f64),
    /// Price reaches the recent N-bar swing level.
    Swing { lookback: usize },
    /// Absolute price level.
    Price(f64),
    /// Minutes since the position opened.
    Time { minutes: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialExitLevel {
    pub trigger: ExitTrigger,
    /// Percentage of the remaining volume to close, 0..=100.
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakevenSpec {
    /// Unrealized pips required before the SL moves to entry.
    pub activation_profit: f64,
    /// Pips beyond entry locked in, 0 = exact breakeven.
    #[serde(default)]
    pub lock_profit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrailingSpec {
    pub activation_profit: f64,
    /// Pips kept between current price and the stop.
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeExitSpec {
    #[serde(default)]
    pub max_holding_minutes: Option<u32>,
    #[serde(default)]
    pub max_holding_hours: Option<u32>,
    /// "HH:MM" UTC wall-clock close.
    #[serde(default)]
    pub close_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwingStopSpec {
    pub lookback: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmartExitSpec {
    #[serde(default)]
    pub partial_exits: Vec<PartialExitLevel>,
    /// Cap on the summed partial percentages; excess is scaled down
    /// proportionally.
    #[serde(default = "default_max_total_exit")]
    pub max_total_exit: f64,
    /// Floor on the residual volume as a percentage of the original.
    #[serde(default)]
    pub max_remaining: f64,
    /// Move SL to breakeven after a partial exit of 25% or more.
    #[serde(default = "default_true")]
    pub breakeven_after_partial: bool,
    #[serde(default)]
    pub breakeven: Option<BreakevenSpec>,
    #[serde(default)]
    pub trailing: Option<TrailingSpec>,
    #[serde(default)]
    pub time_exit: Option<TimeExitSpec>,
    #[serde(default)]
    pub swing_stop: Option<SwingStopSpec>,
}

fn default_max_total_exit() -> f64 {
    100.0
}

/// A complete strategy definition. Immutable once loaded; UPDATE_STRATEGY
/// swaps the whole value atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub entry_conditions: Vec<Condition>,
    #[serde(default)]
    pub entry_logic: ConditionLogic,
    #[serde(default)]
    pub exit_conditions: Vec<Condition>,
    #[serde(default)]
    pub exit_logic: ConditionLogic,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub stop_loss: Option<StopLossSpec>,
    #[serde(default)]
    pub take_profit: Option<TakeProfitSpec>,
    pub sizing: SizingSpec,
    #[serde(default)]
    pub direction: DirectionRule,
    #[serde(default)]
    pub correlation: Option<CorrelationSpec>,
    #[serde(default)]
    pub regime: Option<RegimeSpec>,
    #[serde(default)]
    pub smart_exit: Option<SmartExitSpec>,
    #[serde(default)]
    pub sessions: Option<Vec<TradingSession>>,
    /// Broker-order tag identifying this strategy; derived from the id when
    /// the control plane does not assign one.
    #[serde(default)]
    pub magic: Option<i64>,
    #[serde(default = "default_status")]
    pub status: StrategyStatus,
}

fn default_status() -> StrategyStatus {
    StrategyStatus::Active
}

impl Strategy {
    /// Stable magic for broker orders. FNV-1a over the id, folded positive.
    pub fn magic_number(&self) -> i64 {
        if let Some(m) = self.magic {
            return m;
        }
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in self.id.as_bytes() {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        (hash & 0x7fff_ffff) as i64
    }

    /// Structural checks beyond what serde enforces.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("strategy id must not be empty".to_string());
        }
        if self.symbols.is_empty() {
            return Err(format!("strategy {} has no symbols", self.id));
        }
        if self.entry_conditions.is_empty() {
            return Err(format!("strategy {} has no entry conditions", self.id));
        }
        for cond in self
            .entry_conditions
            .iter()
            .chain(self.exit_conditions.iter())
        {
            match (cond.operator, &cond.operand) {
                (ConditionOperator::Between, Operand::Range { low, high }) => {
                    if low >= high {
                        return Err(format!(
                            "strategy {}: between bounds inverted ({} >= {})",
                            self.id, low, high
                        ));
                    }
                }
                (ConditionOperator::Between, _) => {
                    return Err(format!(
                        "strategy {}: between operator requires a range operand",
                        self.id
                    ));
                }
                (_, Operand::Range { .. }) => {
                    return Err(format!(
                        "strategy {}: range operand only valid with between",
                        self.id
                    ));
                }
                _ => {}
            }
        }
        if self.sizing.min_lot <= 0.0 || self.sizing.max_lot < self.sizing.min_lot {
            return Err(format!(
                "strategy {}: invalid lot bounds [{}, {}]",
                self.id, self.sizing.min_lot, self.sizing.max_lot
            ));
        }
        if let Some(se) = &self.smart_exit {
            for level in &se.partial_exits {
                if !(0.0..=100.0).contains(&level.percentage) {
                    return Err(format!(
                        "strategy {}: partial exit percentage {} out of range",
                        self.id, level.percentage
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Parse and validate a strategy from untyped wire JSON.
pub fn load_strategy(value: serde_json::Value) -> anyhow::Result<Strategy> {
    let strategy: Strategy = serde_json::from_value(value)?;
    strategy
        .validate()
        .map_err(|e| anyhow::anyhow!("strategy rejected: {}", e))?;
    Ok(strategy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_json() -> serde_json::Value {
        json!({
            "id": "rsi-revert",
            "name": "RSI reversion",
            "symbols": ["EURUSD"],
            "timeframe": "M15",
            "entry_conditions": [{
                "indicator": "rsi",
                "params": {"period": 14.0},
                "operator": "<",
                "operand": {"value": 30.0}
            }],
            "sizing": {"method": {"percentage_risk": {"pct": 1.0}}}
        })
    }

    #[test]
    fn test_minimal_strategy_loads() {
        let s = load_strategy(minimal_json()).unwrap();
        assert_eq!(s.id, "rsi-revert");
        assert_eq!(s.timeframe, Timeframe::M15);
        assert_eq!(s.direction, DirectionRule::Auto);
        assert_eq!(s.status, StrategyStatus::Active);
        assert_eq!(s.sizing.min_lot, 0.01);
        assert_eq!(s.sizing.max_lot, 10.0);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let mut v = minimal_json();
        v["surprise"] = json!(true);
        assert!(load_strategy(v).is_err());
    }

    #[test]
    fn test_unknown_sizing_method_is_rejected() {
        let mut v = minimal_json();
        v["sizing"] = json!({"method": {"martingale": {"factor": 2.0}}});
        assert!(load_strategy(v).is_err());
    }

    #[test]
    fn test_unknown_filter_kind_is_rejected() {
        let mut v = minimal_json();
        v["filters"] = json!([{"moon_phase": {"full": true}}]);
        assert!(load_strategy(v).is_err());
    }

    #[test]
    fn test_between_requires_range() {
        let mut v = minimal_json();
        v["entry_conditions"][0]["operator"] = json!("between");
        assert!(load_strategy(v.clone()).is_err());

        v["entry_conditions"][0]["operand"] = json!({"range": {"low": 40.0, "high": 60.0}});
        assert!(load_strategy(v).is_ok());
    }

    #[test]
    fn test_operator_symbols_parse() {
        for op in [">", ">=", "<", "<=", "==", "crosses_above", "crosses_below"] {
            let mut v = minimal_json();
            v["entry_conditions"][0]["operator"] = json!(op);
            assert!(load_strategy(v).is_ok(), "operator {} should parse", op);
        }
    }

    #[test]
    fn test_magic_is_stable_and_positive() {
        let a = load_strategy(minimal_json()).unwrap();
        let b = load_strategy(minimal_json()).unwrap();
        assert_eq!(a.magic_number(), b.magic_number());
        assert!(a.magic_number() > 0);
    }

    #[test]
    fn test_explicit_magic_wins() {
        let mut v = minimal_json();
        v["magic"] = json!(777);
        let s = load_strategy(v).unwrap();
        assert_eq!(s.magic_number(), 777);
    }

    #[test]
    fn test_smart_exit_round_trips() {
        let mut v = minimal_json();
        v["smart_exit"] = json!({
            "partial_exits": [
                {"trigger": {"pips": 40.0}, "percentage": 50.0},
                {"trigger": {"rr": 2.0}, "percentage": 25.0}
            ],
            "trailing": {"activation_profit": 30.0, "distance": 15.0}
        });
        let s = load_strategy(v).unwrap();
        let se = s.smart_exit.unwrap();
        assert_eq!(se.partial_exits.len(), 2);
        assert_eq!(se.max_total_exit, 100.0);
        assert!(se.breakeven_after_partial);
    }
}
