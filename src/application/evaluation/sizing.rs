//! Position sizing.
//!
//! Every variant resolves to lots from the account balance and the SL
//! distance, then passes the same tail: regime multiplier, correlation
//! factor, [min_lot, max_lot] clamp, 0.01 rounding, and the live-account
//! halving. The tail order matters: the scenario numbers in the test suite
//! pin it down.

use crate::domain::risk_limits::AccountKind;
use crate::domain::strategy::{SizingMethod, SizingSpec};
use crate::domain::types::Bar;
use crate::indicators;
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal_macros::dec;
use statrs::statistics::Statistics;
use tracing::debug;

pub struct SizingInputs<'a> {
    pub balance: Decimal,
    /// Stop distance in pips; zero when no SL is set.
    pub sl_pips: f64,
    /// Account-currency value of one pip for one lot.
    pub pip_value: f64,
    pub point: f64,
    pub bars: &'a [Bar],
    pub account: AccountKind,
    /// From regime detection; 1.0 when adaptation is off.
    pub regime_multiplier: f64,
    /// From the correlation executor; 1.0 when uncorrelated.
    pub size_factor: f64,
}

/// Mean of the trailing ATR window used for volatility adjustment.
fn atr_ratio(bars: &[Bar], lookback: usize) -> Option<f64> {
    let series = indicators::atr(bars, 14);
    let current = indicators::latest(&series, 0)?;
    let valid: Vec<f64> = series.iter().copied().filter(|v| !v.is_nan()).collect();
    if valid.is_empty() {
        return None;
    }
    let tail = &valid[valid.len().saturating_sub(lookback.max(1))..];
    let mean = tail.iter().copied().mean();
    if mean > 0.0 { Some(current / mean) } else { None }
}

fn risk_based_lots(balance: f64, risk_pct: f64, sl_pips: f64, pip_value: f64) -> f64 {
    if sl_pips <= 0.0 || pip_value <= 0.0 {
        return 0.0;
    }
    let risk_amount = balance * risk_pct / 100.0;
    risk_amount / (sl_pips * pip_value)
}

fn raw_lots(method: &SizingMethod, inputs: &SizingInputs<'_>) -> f64 {
    let balance = inputs.balance.to_f64().unwrap_or(0.0);
    match method {
        SizingMethod::FixedLot { size } => *size,
        SizingMethod::PercentageRisk { pct } => {
            risk_based_lots(balance, *pct, inputs.sl_pips, inputs.pip_value)
        }
        SizingMethod::AtrBased {
            multiplier,
            risk_pct,
            min_atr,
            max_atr,
            volatility_adjust,
        } => {
            let series = indicators::atr(inputs.bars, 14);
            let Some(mut atr) = indicators::latest(&series, 0) else {
                return 0.0;
            };
            if let Some(min) = min_atr {
                atr = atr.max(*min);
            }
            if let Some(max) = max_atr {
                atr = atr.min(*max);
            }
            let pip = inputs.point * 10.0;
            if pip <= 0.0 {
                return 0.0;
            }
            let sl_pips = atr * multiplier / pip;
            let mut lots = risk_based_lots(balance, *risk_pct, sl_pips, inputs.pip_value);
            if *volatility_adjust {
                if let Some(ratio) = atr_ratio(inputs.bars, 20) {
                    if ratio > 1.5 {
                        lots *= 0.7;
                    } else if ratio < 0.7 {
                        lots *= 1.2;
                    }
                }
            }
            lots
        }
        SizingMethod::VolatilityBased {
            base,
            factor,
            lookback,
        } => {
            // Scale the base stake down as volatility expands past its
            // trailing mean, up (bounded by the clamp) as it contracts.
            match atr_ratio(inputs.bars, *lookback) {
                Some(ratio) => base / (1.0 + factor * (ratio - 1.0)).max(0.1),
                None => *base,
            }
        }
        SizingMethod::Kelly {
            win_rate,
            avg_win,
            avg_loss,
            kelly_fraction,
        } => {
            if *avg_loss <= 0.0 || *avg_win <= 0.0 {
                return 0.0;
            }
            let p = *win_rate;
            let q = 1.0 - p;
            let b = avg_win / avg_loss;
            let f = (p * b - q) / b;
            if f <= 0.0 {
                return 0.0;
            }
            // Full Kelly is capped at 0.25 before the safety fraction.
            let f = f.min(0.25) * kelly_fraction;
            let risk_amount = balance * f;
            if inputs.sl_pips <= 0.0 || inputs.pip_value <= 0.0 {
                return 0.0;
            }
            risk_amount / (inputs.sl_pips * inputs.pip_value)
        }
        SizingMethod::AccountEquity { pct } => {
            // Notional allocation at standard-lot margin (1:100 on 100k).
            balance * pct / 100.0 / 1_000.0
        }
    }
}

/// Final lot size: variant result, regime and correlation factors, clamp to
/// [min_lot, max_lot], round to 0.01, then the live-account halving.
pub fn calculate_lots(spec: &SizingSpec, inputs: &SizingInputs<'_>) -> Decimal {
    let mut lots = raw_lots(&spec.method, inputs);
    lots *= inputs.regime_multiplier;
    lots *= inputs.size_factor;

    let clamped = lots.clamp(spec.min_lot, spec.max_lot);
    let mut volume = Decimal::from_f64(clamped).unwrap_or(Decimal::ZERO).round_dp(2);

    if inputs.account == AccountKind::Live {
        volume = (volume * dec!(0.5)).round_dp(2);
        let min = Decimal::from_f64(spec.min_lot).unwrap_or(dec!(0.01));
        if volume < min {
            volume = min;
        }
    }
    debug!("Sizing: raw {:.4} -> final {} lots", lots, volume);
    volume
}
