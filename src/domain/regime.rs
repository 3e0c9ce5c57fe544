use crate::domain::types::Bar;
use crate::indicators;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::fmt;

/// Market condition classification used to scale risk and targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketRegime {
    HighVolatility,
    LowVolatility,
    BullishTrending,
    BearishTrending,
    Breakout,
    Ranging,
}

impl MarketRegime {
    /// Position-size multiplier applied before the final clamp.
    pub fn size_multiplier(&self) -> f64 {
        match self {
            MarketRegime::BullishTrending | MarketRegime::BearishTrending => 1.5,
            MarketRegime::HighVolatility => 0.5,
            MarketRegime::LowVolatility => 0.8,
            MarketRegime::Ranging => 0.7,
            MarketRegime::Breakout => 1.0,
        }
    }
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarketRegime::HighVolatility => "HIGH_VOLATILITY",
            MarketRegime::LowVolatility => "LOW_VOLATILITY",
            MarketRegime::BullishTrending => "BULLISH_TRENDING",
            MarketRegime::BearishTrending => "BEARISH_TRENDING",
            MarketRegime::Breakout => "BREAKOUT",
            MarketRegime::Ranging => "RANGING",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeAssessment {
    pub regime: MarketRegime,
    /// 0.0 to 1.0.
    pub confidence: f64,
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
    /// (close - EMA200) / EMA200 * 100.
    pub price_position: f64,
    /// Current ATR over the mean of the last 20 ATR values.
    pub volatility_ratio: f64,
    pub recommendations: Vec<String>,
}

/// Minimum closed bars for a meaningful assessment (EMA200 warmup).
pub const MIN_REGIME_BARS: usize = 200;

pub struct RegimeDetector;

impl RegimeDetector {
    /// Classify the current market regime. Returns `None` when the series
    /// is too short for EMA200 or the inputs have not warmed up yet.
    pub fn detect(bars: &[Bar]) -> Option<RegimeAssessment> {
        if bars.len() < MIN_REGIME_BARS {
            return None;
        }

        let closes = indicators::closes(bars);
        let adx_out = indicators::adx(bars, 14);
        let atr_series = indicators::atr(bars, 14);
        let ema200 = indicators::ema(&closes, 200);

        let adx = indicators::latest(&adx_out.adx, 0)?;
        let plus_di = indicators::latest(&adx_out.plus_di, 0)?;
        let minus_di = indicators::latest(&adx_out.minus_di, 0)?;
        let atr = indicators::latest(&atr_series, 0)?;
        let ema = indicators::latest(&ema200, 0)?;
        let close = *closes.last()?;

        if ema == 0.0 {
            return None;
        }
        let price_position = (close - ema) / ema * 100.0;

        let recent_atr: Vec<f64> = atr_series
            .iter()
            .copied()
            .filter(|v| !v.is_nan())
            .collect();
        let tail = &recent_atr[recent_atr.len().saturating_sub(20)..];
        let mean_atr = tail.iter().copied().mean();
        let volatility_ratio = if mean_atr > 0.0 { atr / mean_atr } else { 1.0 };

        let (regime, confidence) = Self::classify(
            adx,
            plus_di,
            minus_di,
            price_position,
            volatility_ratio,
        );

        Some(RegimeAssessment {
            regime,
            confidence,
            adx,
            plus_di,
            minus_di,
            price_position,
            volatility_ratio,
            recommendations: Self::recommendations(regime),
        })
    }

    /// Boundary rules: volatility 1.5 is inclusive toward HIGH_VOLATILITY,
    /// ADX 25 inclusive toward trending.
    fn classify(
        adx: f64,
        plus_di: f64,
        minus_di: f64,
        price_position: f64,
        volatility_ratio: f64,
    ) -> (MarketRegime, f64) {
        if volatility_ratio >= 1.5 {
            let confidence = (0.5 + (volatility_ratio - 1.5) / 2.0).min(1.0);
            return (MarketRegime::HighVolatility, confidence);
        }
        if volatility_ratio < 0.7 {
            let confidence = (0.5 + (0.7 - volatility_ratio)).min(1.0);
            return (MarketRegime::LowVolatility, confidence);
        }
        if adx >= 25.0 && plus_di > minus_di && price_position > 0.0 {
            let confidence = (0.5 + (adx - 25.0) / 50.0).min(1.0);
            return (MarketRegime::BullishTrending, confidence);
        }
        if adx >= 25.0 && minus_di > plus_di && price_position < 0.0 {
            let confidence = (0.5 + (adx - 25.0) / 50.0).min(1.0);
            return (MarketRegime::BearishTrending, confidence);
        }
        if adx > 15.0 && adx < 25.0 && volatility_ratio < 0.8 {
            return (MarketRegime::Breakout, 0.6);
        }
        (MarketRegime::Ranging, 0.5)
    }

    fn recommendations(regime: MarketRegime) -> Vec<String> {
        match regime {
            MarketRegime::BullishTrending => vec![
                "Favor trend-following entries in the trend direction".to_string(),
                "Widen take-profit targets".to_string(),
            ],
            MarketRegime::BearishTrending => vec![
                "Favor short entries with the trend".to_string(),
                "Widen take-profit targets".to_string(),
            ],
            MarketRegime::HighVolatility => vec![
                "Reduce position size".to_string(),
                "Widen stops or stand aside".to_string(),
            ],
            MarketRegime::LowVolatility => vec![
                "Expect small ranges; tighten targets".to_string(),
            ],
            MarketRegime::Breakout => vec![
                "Watch range boundaries for expansion".to_string(),
            ],
            MarketRegime::Ranging => vec![
                "Favor mean-reversion entries at range extremes".to_string(),
            ],
        }
    }
}
