//! Condition evaluation against a bar series.

use crate::domain::strategy::{Condition, ConditionLogic, ConditionOperator, Operand};
use crate::domain::types::{Bar, OrderSide, Timeframe};
use crate::indicators;
use crate::indicators::cache::IndicatorCache;
use anyhow::Result;

/// Outcome of a single condition with its human-readable reason.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionVerdict {
    pub met: bool,
    pub reason: String,
}

/// Tolerance for `==` on indicator values.
const EQ_EPSILON: f64 = 1e-6;

/// Evaluate one condition. The left side is always an indicator series; the
/// right side is a literal, a range, or another indicator resolved through
/// the same cache.
pub fn evaluate_condition(
    cache: &IndicatorCache,
    symbol: &str,
    timeframe: Timeframe,
    condition: &Condition,
    bars: &[Bar],
) -> Result<ConditionVerdict> {
    let lhs_series = cache.fetch(symbol, timeframe, &condition.indicator, &condition.params, bars)?;
    let shift = condition.shift;

    let lhs = match indicators::latest(&lhs_series, shift) {
        Some(v) => v,
        None => {
            return Ok(ConditionVerdict {
                met: false,
                reason: format!("{}: not enough data", condition.indicator),
            });
        }
    };

    // Previous values are only needed for crossing operators.
    let lhs_prev = indicators::latest(&lhs_series, shift + 1);

    let (rhs, rhs_prev, rhs_label) = match &condition.operand {
        Operand::Value(v) => (*v, Some(*v), format!("{}", v)),
        Operand::Range { low, high } => {
            let met = lhs >= *low && lhs <= *high;
            return Ok(ConditionVerdict {
                met,
                reason: format!(
                    "{}={:.5} {} [{}, {}]",
                    condition.indicator,
                    lhs,
                    if met { "within" } else { "outside" },
                    low,
                    high
                ),
            });
        }
        Operand::Indicator { indicator, params } => {
            let series = cache.fetch(symbol, timeframe, indicator, params, bars)?;
            let value = match indicators::latest(&series, shift) {
                Some(v) => v,
                None => {
                    return Ok(ConditionVerdict {
                        met: false,
                        reason: format!("{}: not enough data", indicator),
                    });
                }
            };
            (value, indicators::latest(&series, shift + 1), indicator.clone())
        }
    };

    let met = match condition.operator {
        ConditionOperator::Gt => lhs > rhs,
        ConditionOperator::Gte => lhs >= rhs,
        ConditionOperator::Lt => lhs < rhs,
        ConditionOperator::Lte => lhs <= rhs,
        ConditionOperator::Eq => (lhs - rhs).abs() <= EQ_EPSILON,
        ConditionOperator::CrossesAbove => match (lhs_prev, rhs_prev) {
            (Some(lp), Some(rp)) => lp <= rp && lhs > rhs,
            _ => false,
        },
        ConditionOperator::CrossesBelow => match (lhs_prev, rhs_prev) {
            (Some(lp), Some(rp)) => lp >= rp && lhs < rhs,
            _ => false,
        },
        // Range form handled above; a literal with `between` never
        // deserializes (schema validation rejects it).
        ConditionOperator::Between => false,
    };

    let op = match condition.operator {
        ConditionOperator::Gt => ">",
        ConditionOperator::Gte => ">=",
        ConditionOperator::Lt => "<",
        ConditionOperator::Lte => "<=",
        ConditionOperator::Eq => "==",
        ConditionOperator::CrossesAbove => "crossed above",
        ConditionOperator::CrossesBelow => "crossed below",
        ConditionOperator::Between => "between",
    };

    let rhs_text = match &condition.operand {
        Operand::Value(_) => format!("{:.5}", rhs),
        _ => format!("{}={:.5}", rhs_label, rhs),
    };
    Ok(ConditionVerdict {
        met,
        reason: format!(
            "{}={:.5} {} {} ({})",
            condition.indicator,
            lhs,
            op,
            rhs_text,
            if met { "met" } else { "unmet" }
        ),
    })
}

/// Combine individual verdicts with the strategy's combinator.
pub fn combine(verdicts: &[ConditionVerdict], logic: ConditionLogic) -> bool {
    if verdicts.is_empty() {
        return false;
    }
    match logic {
        ConditionLogic::And => verdicts.iter().all(|v| v.met),
        ConditionLogic::Or => verdicts.iter().any(|v| v.met),
    }
}

/// Side derivation for `direction: auto`: upward operators read as momentum
/// long, downward as short, the rest defaults long.
pub fn auto_side(first_entry: &Condition) -> OrderSide {
    match first_entry.operator {
        ConditionOperator::Gt
        | ConditionOperator::Gte
        | ConditionOperator::CrossesAbove => OrderSide::Buy,
        ConditionOperator::Lt
        | ConditionOperator::Lte
        | ConditionOperator::CrossesBelow => OrderSide::Sell,
        ConditionOperator::Eq | ConditionOperator::Between => OrderSide::Buy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                open_time: Utc.timestamp_opt(i as i64 * 60, 0).unwrap(),
                open: c,
                high: c + 0.5,
                low: c - 0.5,
                close: c,
                volume: 100.0,
                spread: 1.0,
            })
            .collect()
    }

    fn sma_condition(period: f64, operator: ConditionOperator, operand: Operand) -> Condition {
        let mut params = BTreeMap::new();
        params.insert("period".to_string(), period);
        Condition {
            indicator: "sma".to_string(),
            params,
            operator,
            operand,
            shift: 0,
        }
    }

    #[test]
    fn test_literal_comparison() {
        let cache = IndicatorCache::default();
        let bars = bars_from_closes(&(1..=30).map(|i| i as f64).collect::<Vec<_>>());
        // SMA(3) of 28,29,30 = 29
        let cond = sma_condition(3.0, ConditionOperator::Gt, Operand::Value(25.0));
        let verdict =
            evaluate_condition(&cache, "EURUSD", Timeframe::M5, &cond, &bars).unwrap();
        assert!(verdict.met);

        let cond = sma_condition(3.0, ConditionOperator::Lt, Operand::Value(25.0));
        let verdict =
            evaluate_condition(&cache, "EURUSD", Timeframe::M5, &cond, &bars).unwrap();
        assert!(!verdict.met);
        assert!(verdict.reason.contains("unmet"));
    }

    #[test]
    fn test_indicator_vs_indicator() {
        let cache = IndicatorCache::default();
        // Rising series: fast SMA above slow SMA.
        let bars = bars_from_closes(&(1..=60).map(|i| i as f64).collect::<Vec<_>>());
        let mut slow_params = BTreeMap::new();
        slow_params.insert("period".to_string(), 20.0);
        let cond = sma_condition(
            5.0,
            ConditionOperator::Gt,
            Operand::Indicator {
                indicator: "sma".to_string(),
                params: slow_params,
            },
        );
        let verdict =
            evaluate_condition(&cache, "EURUSD", Timeframe::M5, &cond, &bars).unwrap();
        assert!(verdict.met);
    }

    #[test]
    fn test_crosses_above() {
        let cache = IndicatorCache::default();
        // Close sits below 10 until the final bar jumps through it.
        let mut closes = vec![9.0; 20];
        closes.push(11.0);
        let bars = bars_from_closes(&closes);
        let cond = Condition {
            indicator: "close".to_string(),
            params: BTreeMap::new(),
            operator: ConditionOperator::CrossesAbove,
            operand: Operand::Value(10.0),
            shift: 0,
        };
        let verdict =
            evaluate_condition(&cache, "EURUSD", Timeframe::M5, &cond, &bars).unwrap();
        assert!(verdict.met);

        // One bar later (no new crossing) it is no longer fresh.
        let mut closes = vec![9.0; 20];
        closes.extend([11.0, 11.5]);
        let bars = bars_from_closes(&closes);
        let verdict =
            evaluate_condition(&cache, "EURUSD", Timeframe::M5, &cond, &bars).unwrap();
        assert!(!verdict.met);
    }

    #[test]
    fn test_between_range() {
        let cache = IndicatorCache::default();
        let bars = bars_from_closes(&vec![50.0; 30]);
        let cond = Condition {
            indicator: "close".to_string(),
            params: BTreeMap::new(),
            operator: ConditionOperator::Between,
            operand: Operand::Range {
                low: 40.0,
                high: 60.0,
            },
            shift: 0,
        };
        let verdict =
            evaluate_condition(&cache, "EURUSD", Timeframe::M5, &cond, &bars).unwrap();
        assert!(verdict.met);
        assert!(verdict.reason.contains("within"));
    }

    #[test]
    fn test_warmup_returns_unmet_with_reason() {
        let cache = IndicatorCache::default();
        let bars = bars_from_closes(&[1.0, 2.0]);
        let cond = sma_condition(14.0, ConditionOperator::Gt, Operand::Value(0.0));
        let verdict =
            evaluate_condition(&cache, "EURUSD", Timeframe::M5, &cond, &bars).unwrap();
        assert!(!verdict.met);
        assert!(verdict.reason.contains("not enough data"));
    }

    #[test]
    fn test_combine_logic() {
        let met = ConditionVerdict {
            met: true,
            reason: String::new(),
        };
        let unmet = ConditionVerdict {
            met: false,
            reason: String::new(),
        };
        assert!(combine(&[met.clone(), met.clone()], ConditionLogic::And));
        assert!(!combine(&[met.clone(), unmet.clone()], ConditionLogic::And));
        assert!(combine(&[met, unmet.clone()], ConditionLogic::Or));
        assert!(!combine(&[unmet.clone(), unmet], ConditionLogic::Or));
        assert!(!combine(&[], ConditionLogic::And));
    }

    #[test]
    fn test_auto_side_by_operator() {
        let cond = sma_condition(3.0, ConditionOperator::Gt, Operand::Value(0.0));
        assert_eq!(auto_side(&cond), OrderSide::Buy);
        let cond = sma_condition(3.0, ConditionOperator::Lt, Operand::Value(0.0));
        assert_eq!(auto_side(&cond), OrderSide::Sell);
        let cond = sma_condition(3.0, ConditionOperator::CrossesBelow, Operand::Value(0.0));
        assert_eq!(auto_side(&cond), OrderSide::Sell);
    }
}
