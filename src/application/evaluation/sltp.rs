//! Stop-loss / take-profit placement from the strategy specs.

use crate::domain::strategy::{StopLossSpec, StopMethod, TakeProfitMethod, TakeProfitSpec};
use crate::domain::types::{Bar, OrderSide};
use crate::indicators;

fn pip(point: f64) -> f64 {
    point * 10.0
}

fn clamp_distance(distance: f64, point: f64, min_pips: Option<f64>, max_pips: Option<f64>) -> f64 {
    let pip = pip(point);
    if pip <= 0.0 {
        return distance;
    }
    let mut pips = distance / pip;
    if let Some(min) = min_pips {
        pips = pips.max(min);
    }
    if let Some(max) = max_pips {
        pips = pips.min(max);
    }
    pips * pip
}

/// Price distance for a stop method, before clamping. `None` while the ATR
/// has not warmed up. Pip-denominated methods resolve in the public
/// functions where the broker point is known.
fn stop_distance(method: &StopMethod, entry: f64, point: f64, bars: &[Bar]) -> Option<f64> {
    match method {
        StopMethod::FixedPips(pips) => Some(pips * pip(point)),
        StopMethod::Atr { multiplier, period } => {
            let series = indicators::atr(bars, *period);
            indicators::latest(&series, 0).map(|atr| atr * multiplier)
        }
        StopMethod::Percent(pct) => Some(entry * pct / 100.0),
        StopMethod::Price(price) => Some((entry - price).abs()),
    }
}

fn tp_distance(
    method: &TakeProfitMethod,
    entry: f64,
    stop_loss: Option<f64>,
    point: f64,
    bars: &[Bar],
) -> Option<f64> {
    match method {
        TakeProfitMethod::FixedPips(pips) => Some(pips * pip(point)),
        TakeProfitMethod::Atr { multiplier, period } => {
            let series = indicators::atr(bars, *period);
            indicators::latest(&series, 0).map(|atr| atr * multiplier)
        }
        TakeProfitMethod::Percent(pct) => Some(entry * pct / 100.0),
        TakeProfitMethod::Price(price) => Some((entry - price).abs()),
        TakeProfitMethod::Ratio(ratio) => stop_loss.map(|sl| ratio * (entry - sl).abs()),
    }
}

/// SL price for the side: below entry for BUY, above for SELL.
pub fn stop_loss_price(
    spec: &StopLossSpec,
    side: OrderSide,
    entry: f64,
    point: f64,
    bars: &[Bar],
) -> Option<f64> {
    let raw = stop_distance(&spec.method, entry, point, bars)?;
    let distance = clamp_distance(raw, point, spec.min_pips, spec.max_pips);
    Some(match side {
        OrderSide::Buy => entry - distance,
        OrderSide::Sell => entry + distance,
    })
}

/// TP price for the side: above entry for BUY, below for SELL. `ratio`
/// scales the SL distance and therefore needs the resolved SL.
pub fn take_profit_price(
    spec: &TakeProfitSpec,
    side: OrderSide,
    entry: f64,
    stop_loss: Option<f64>,
    point: f64,
    bars: &[Bar],
) -> Option<f64> {
    let raw = tp_distance(&spec.method, entry, stop_loss, point, bars)?;
    let distance = clamp_distance(raw, point, spec.min_pips, spec.max_pips);
    Some(match side {
        OrderSide::Buy => entry + distance,
        OrderSide::Sell => entry - distance,
    })
}
