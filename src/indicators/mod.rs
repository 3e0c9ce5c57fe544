//! Technical indicator library.
//!
//! Pure functions over bar series. Every series function returns a vector
//! aligned with the input bars, padded with `f64::NAN` during the warmup
//! window, so callers can index by bar or take the latest value. Formulas
//! are the standard ones; no innovation here.

pub mod cache;

use crate::domain::types::Bar;
use anyhow::{Result, bail};
use std::collections::BTreeMap;

pub fn closes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

/// Simple moving average.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let mut sum: f64 = values[..period].iter().sum();
    out[period - 1] = sum / period as f64;
    for i in period..values.len() {
        sum += values[i] - values[i - period];
        out[i] = sum / period as f64;
    }
    out
}

/// Exponential moving average seeded with the SMA of the first window.
/// Leading NANs in the input are skipped, keeping alignment.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 {
        return out;
    }
    let start = match values.iter().position(|v| !v.is_nan()) {
        Some(s) => s,
        None => return out,
    };
    let valid = &values[start..];
    if valid.len() < period {
        return out;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed: f64 = valid[..period].iter().sum::<f64>() / period as f64;
    out[start + period - 1] = seed;
    let mut prev = seed;
    for i in period..valid.len() {
        prev = alpha * valid[i] + (1.0 - alpha) * prev;
        out[start + i] = prev;
    }
    out
}

/// RSI with Wilder smoothing.
pub fn rsi(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    if period == 0 || values.len() <= period {
        return out;
    }
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let delta = values[i] - values[i - 1];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss -= delta;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = rsi_from(avg_gain, avg_loss);
    for i in (period + 1)..values.len() {
        let delta = values[i] - values[i - 1];
        let (gain, loss) = if delta > 0.0 {
            (delta, 0.0)
        } else {
            (0.0, -delta)
        };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = rsi_from(avg_gain, avg_loss);
    }
    out
}

fn rsi_from(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

/// MACD line, signal line and histogram.
pub struct MacdOutput {
    pub macd: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

pub fn macd(values: &[f64], fast: usize, slow: usize, signal_period: usize) -> MacdOutput {
    let fast_ema = ema(values, fast);
    let slow_ema = ema(values, slow);
    let macd_line: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(f, s)| f - s)
        .collect();
    let signal = ema(&macd_line, signal_period);
    let histogram: Vec<f64> = macd_line
        .iter()
        .zip(signal.iter())
        .map(|(m, s)| m - s)
        .collect();
    MacdOutput {
        macd: macd_line,
        signal,
        histogram,
    }
}

fn true_ranges(bars: &[Bar]) -> Vec<f64> {
    let mut tr = vec![f64::NAN; bars.len()];
    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;
        tr[i] = (high - low)
            .max((high - prev_close).abs())
            .max((low - prev_close).abs());
    }
    tr
}

/// Average True Range with Wilder smoothing.
pub fn atr(bars: &[Bar], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; bars.len()];
    if period == 0 || bars.len() <= period {
        return out;
    }
    let tr = true_ranges(bars);
    let mut value: f64 = tr[1..=period].iter().sum::<f64>() / period as f64;
    out[period] = value;
    for i in (period + 1)..bars.len() {
        value = (value * (period as f64 - 1.0) + tr[i]) / period as f64;
        out[i] = value;
    }
    out
}

pub struct BollingerOutput {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

pub fn bollinger(values: &[f64], period: usize, std_mult: f64) -> BollingerOutput {
    let middle = sma(values, period);
    let mut upper = vec![f64::NAN; values.len()];
    let mut lower = vec![f64::NAN; values.len()];
    if period > 0 {
        for i in (period - 1)..values.len() {
            let window = &values[i + 1 - period..=i];
            let mean = middle[i];
            let var =
                window.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / period as f64;
            let std = var.sqrt();
            upper[i] = mean + std_mult * std;
            lower[i] = mean - std_mult * std;
        }
    }
    BollingerOutput {
        upper,
        middle,
        lower,
    }
}

pub struct StochasticOutput {
    pub k: Vec<f64>,
    pub d: Vec<f64>,
}

/// Stochastic oscillator with slowing applied to %K and an SMA %D.
pub fn stochastic(
    bars: &[Bar],
    k_period: usize,
    d_period: usize,
    slowing: usize,
) -> StochasticOutput {
    let mut raw_k = vec![f64::NAN; bars.len()];
    if k_period == 0 || bars.len() < k_period {
        return StochasticOutput {
            k: raw_k.clone(),
            d: raw_k,
        };
    }
    for i in (k_period - 1)..bars.len() {
        let window = &bars[i + 1 - k_period..=i];
        let hh = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let ll = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        raw_k[i] = if hh > ll {
            100.0 * (bars[i].close - ll) / (hh - ll)
        } else {
            50.0
        };
    }
    let k = sma_skip_nan(&raw_k, slowing.max(1));
    let d = sma_skip_nan(&k, d_period.max(1));
    StochasticOutput { k, d }
}

/// SMA over a series with leading NANs, preserving alignment.
fn sma_skip_nan(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; values.len()];
    let start = match values.iter().position(|v| !v.is_nan()) {
        Some(s) => s,
        None => return out,
    };
    let smoothed = sma(&values[start..], period);
    for (i, v) in smoothed.into_iter().enumerate() {
        out[start + i] = v;
    }
    out
}

pub struct AdxOutput {
    pub adx: Vec<f64>,
    pub plus_di: Vec<f64>,
    pub minus_di: Vec<f64>,
}

/// ADX with +DI/-DI, all Wilder-smoothed.
pub fn adx(bars: &[Bar], period: usize) -> AdxOutput {
    let n = bars.len();
    let nan = vec![f64::NAN; n];
    if period == 0 || n <= 2 * period {
        return AdxOutput {
            adx: nan.clone(),
            plus_di: nan.clone(),
            minus_di: nan,
        };
    }
    let tr = true_ranges(bars);
    let mut plus_dm = vec![0.0; n];
    let mut minus_dm = vec![0.0; n];
    for i in 1..n {
        let up = bars[i].high - bars[i - 1].high;
        let down = bars[i - 1].low - bars[i].low;
        if up > down && up > 0.0 {
            plus_dm[i] = up;
        }
        if down > up && down > 0.0 {
            minus_dm[i] = down;
        }
    }

    let mut smooth_tr: f64 = tr[1..=period].iter().sum();
    let mut smooth_plus: f64 = plus_dm[1..=period].iter().sum();
    let mut smooth_minus: f64 = minus_dm[1..=period].iter().sum();

    let mut plus_di = vec![f64::NAN; n];
    let mut minus_di = vec![f64::NAN; n];
    let mut dx = vec![f64::NAN; n];

    let mut write_di = |i: usize,
                        smooth_tr: f64,
                        smooth_plus: f64,
                        smooth_minus: f64,
                        plus_di: &mut Vec<f64>,
                        minus_di: &mut Vec<f64>,
                        dx: &mut Vec<f64>| {
        if smooth_tr > 0.0 {
            let p = 100.0 * smooth_plus / smooth_tr;
            let m = 100.0 * smooth_minus / smooth_tr;
            plus_di[i] = p;
            minus_di[i] = m;
            dx[i] = if p + m > 0.0 {
                100.0 * (p - m).abs() / (p + m)
            } else {
                0.0
            };
        }
    };

    write_di(
        period,
        smooth_tr,
        smooth_plus,
        smooth_minus,
        &mut plus_di,
        &mut minus_di,
        &mut dx,
    );
    for i in (period + 1)..n {
        smooth_tr = smooth_tr - smooth_tr / period as f64 + tr[i];
        smooth_plus = smooth_plus - smooth_plus / period as f64 + plus_dm[i];
        smooth_minus = smooth_minus - smooth_minus / period as f64 + minus_dm[i];
        write_di(
            i,
            smooth_tr,
            smooth_plus,
            smooth_minus,
            &mut plus_di,
            &mut minus_di,
            &mut dx,
        );
    }

    let mut adx = vec![f64::NAN; n];
    let first_adx_idx = 2 * period;
    let mut value = dx[period..=first_adx_idx]
        .iter()
        .filter(|v| !v.is_nan())
        .sum::<f64>()
        / (period as f64 + 1.0);
    adx[first_adx_idx] = value;
    for i in (first_adx_idx + 1)..n {
        if !dx[i].is_nan() {
            value = (value * (period as f64 - 1.0) + dx[i]) / period as f64;
            adx[i] = value;
        }
    }

    AdxOutput {
        adx,
        plus_di,
        minus_di,
    }
}

/// Commodity Channel Index with the standard 0.015 constant.
pub fn cci(bars: &[Bar], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; bars.len()];
    if period == 0 || bars.len() < period {
        return out;
    }
    let tp: Vec<f64> = bars
        .iter()
        .map(|b| (b.high + b.low + b.close) / 3.0)
        .collect();
    for i in (period - 1)..bars.len() {
        let window = &tp[i + 1 - period..=i];
        let mean = window.iter().sum::<f64>() / period as f64;
        let mean_dev = window.iter().map(|v| (v - mean).abs()).sum::<f64>() / period as f64;
        out[i] = if mean_dev > 0.0 {
            (tp[i] - mean) / (0.015 * mean_dev)
        } else {
            0.0
        };
    }
    out
}

/// Williams %R, bounded [-100, 0].
pub fn williams_r(bars: &[Bar], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; bars.len()];
    if period == 0 || bars.len() < period {
        return out;
    }
    for i in (period - 1)..bars.len() {
        let window = &bars[i + 1 - period..=i];
        let hh = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let ll = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        out[i] = if hh > ll {
            -100.0 * (hh - bars[i].close) / (hh - ll)
        } else {
            -50.0
        };
    }
    out
}

/// Cumulative VWAP over the whole series.
pub fn vwap(bars: &[Bar]) -> Vec<f64> {
    let mut out = vec![f64::NAN; bars.len()];
    let mut pv = 0.0;
    let mut vol = 0.0;
    for (i, b) in bars.iter().enumerate() {
        let tp = (b.high + b.low + b.close) / 3.0;
        pv += tp * b.volume;
        vol += b.volume;
        out[i] = if vol > 0.0 { pv / vol } else { f64::NAN };
    }
    out
}

/// On-balance volume, anchored at zero.
pub fn obv(bars: &[Bar]) -> Vec<f64> {
    let mut out = vec![f64::NAN; bars.len()];
    if bars.is_empty() {
        return out;
    }
    out[0] = 0.0;
    for i in 1..bars.len() {
        let delta = if bars[i].close > bars[i - 1].close {
            bars[i].volume
        } else if bars[i].close < bars[i - 1].close {
            -bars[i].volume
        } else {
            0.0
        };
        out[i] = out[i - 1] + delta;
    }
    out
}

pub fn volume_sma(bars: &[Bar], period: usize) -> Vec<f64> {
    let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
    sma(&volumes, period)
}

pub struct IchimokuOutput {
    pub tenkan: Vec<f64>,
    pub kijun: Vec<f64>,
    /// Displaced forward by the kijun period (cloud at bar i uses data from
    /// i - 26 with default settings).
    pub senkou_a: Vec<f64>,
    pub senkou_b: Vec<f64>,
    /// Close plotted back; NAN for the displaced tail.
    pub chikou: Vec<f64>,
}

fn midline(bars: &[Bar], period: usize) -> Vec<f64> {
    let mut out = vec![f64::NAN; bars.len()];
    if period == 0 || bars.len() < period {
        return out;
    }
    for i in (period - 1)..bars.len() {
        let window = &bars[i + 1 - period..=i];
        let hh = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let ll = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        out[i] = (hh + ll) / 2.0;
    }
    out
}

pub fn ichimoku(bars: &[Bar], tenkan_p: usize, kijun_p: usize, senkou_p: usize) -> IchimokuOutput {
    let n = bars.len();
    let tenkan = midline(bars, tenkan_p);
    let kijun = midline(bars, kijun_p);
    let senkou_b_raw = midline(bars, senkou_p);

    let mut senkou_a = vec![f64::NAN; n];
    let mut senkou_b = vec![f64::NAN; n];
    for i in kijun_p..n {
        let src = i - kijun_p;
        if !tenkan[src].is_nan() && !kijun[src].is_nan() {
            senkou_a[i] = (tenkan[src] + kijun[src]) / 2.0;
        }
        senkou_b[i] = senkou_b_raw[src];
    }

    let mut chikou = vec![f64::NAN; n];
    for i in 0..n.saturating_sub(kijun_p) {
        chikou[i] = bars[i + kijun_p].close;
    }

    IchimokuOutput {
        tenkan,
        kijun,
        senkou_a,
        senkou_b,
        chikou,
    }
}

fn param(params: &BTreeMap<String, f64>, key: &str, default: f64) -> f64 {
    params.get(key).copied().unwrap_or(default)
}

fn period_param(params: &BTreeMap<String, f64>, key: &str, default: usize) -> usize {
    param(params, key, default as f64).max(1.0) as usize
}

/// Compute a named indicator series over the bars.
///
/// This is the single dispatch point behind the indicator cache; names and
/// defaults match what strategies reference on the wire. Unknown names are
/// an error, not a silent zero.
pub fn compute(name: &str, params: &BTreeMap<String, f64>, bars: &[Bar]) -> Result<Vec<f64>> {
    let c = closes(bars);
    let series = match name.to_lowercase().as_str() {
        "close" | "price" => c,
        "open" => bars.iter().map(|b| b.open).collect(),
        "high" => bars.iter().map(|b| b.high).collect(),
        "low" => bars.iter().map(|b| b.low).collect(),
        "volume" => bars.iter().map(|b| b.volume).collect(),
        "sma" | "ma" => sma(&c, period_param(params, "period", 20)),
        "ema" => ema(&c, period_param(params, "period", 20)),
        "rsi" => rsi(&c, period_param(params, "period", 14)),
        "macd" => {
            macd(
                &c,
                period_param(params, "fast", 12),
                period_param(params, "slow", 26),
                period_param(params, "signal", 9),
            )
            .macd
        }
        "macd_signal" => {
            macd(
                &c,
                period_param(params, "fast", 12),
                period_param(params, "slow", 26),
                period_param(params, "signal", 9),
            )
            .signal
        }
        "macd_histogram" => {
            macd(
                &c,
                period_param(params, "fast", 12),
                period_param(params, "slow", 26),
                period_param(params, "signal", 9),
            )
            .histogram
        }
        "atr" => atr(bars, period_param(params, "period", 14)),
        "bollinger_upper" => {
            bollinger(
                &c,
                period_param(params, "period", 20),
                param(params, "std_dev", 2.0),
            )
            .upper
        }
        "bollinger_middle" => {
            bollinger(
                &c,
                period_param(params, "period", 20),
                param(params, "std_dev", 2.0),
            )
            .middle
        }
        "bollinger_lower" => {
            bollinger(
                &c,
                period_param(params, "period", 20),
                param(params, "std_dev", 2.0),
            )
            .lower
        }
        "stochastic_k" => {
            stochastic(
                bars,
                period_param(params, "k_period", 14),
                period_param(params, "d_period", 3),
                period_param(params, "slowing", 3),
            )
            .k
        }
        "stochastic_d" => {
            stochastic(
                bars,
                period_param(params, "k_period", 14),
                period_param(params, "d_period", 3),
                period_param(params, "slowing", 3),
            )
            .d
        }
        "adx" => adx(bars, period_param(params, "period", 14)).adx,
        "plus_di" => adx(bars, period_param(params, "period", 14)).plus_di,
        "minus_di" => adx(bars, period_param(params, "period", 14)).minus_di,
        "cci" => cci(bars, period_param(params, "period", 20)),
        "williams_r" => williams_r(bars, period_param(params, "period", 14)),
        "vwap" => vwap(bars),
        "obv" => obv(bars),
        "volume_sma" => volume_sma(bars, period_param(params, "period", 20)),
        "ichimoku_tenkan" => {
            ichimoku(bars, 9, 26, 52).tenkan
        }
        "ichimoku_kijun" => ichimoku(bars, 9, 26, 52).kijun,
        "ichimoku_senkou_a" => ichimoku(bars, 9, 26, 52).senkou_a,
        "ichimoku_senkou_b" => ichimoku(bars, 9, 26, 52).senkou_b,
        other => bail!("unknown indicator: {}", other),
    };
    Ok(series)
}

/// Latest non-NAN value of a series, optionally shifted back.
pub fn latest(series: &[f64], shift: usize) -> Option<f64> {
    if series.len() <= shift {
        return None;
    }
    let v = series[series.len() - 1 - shift];
    if v.is_nan() { None } else { Some(v) }
}
