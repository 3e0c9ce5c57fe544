//! Symbol correlation cache and the correlation-aware sizing path.
//!
//! Seeded with the well-known currency-pair table so the gate has answers
//! before any bars arrive; refreshed with a Pearson coefficient over log
//! returns when history is available. Entries expire after an hour.

use crate::domain::types::{Bar, Position};
use rust_decimal::prelude::ToPrimitive;
use statrs::statistics::Statistics;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

const ENTRY_TTL: Duration = Duration::from_secs(3600);

/// Long-run correlations of the majors, used until refreshed.
const STATIC_PAIRS: &[(&str, &str, f64)] = &[
    ("EURUSD", "GBPUSD", 0.85),
    ("EURUSD", "USDCHF", -0.95),
    ("EURUSD", "USDJPY", -0.30),
    ("EURUSD", "AUDUSD", 0.65),
    ("GBPUSD", "USDCHF", -0.80),
    ("GBPUSD", "USDJPY", -0.25),
    ("AUDUSD", "NZDUSD", 0.90),
    ("AUDUSD", "USDCAD", -0.70),
    ("USDCHF", "USDJPY", 0.45),
    ("NZDUSD", "USDCAD", -0.65),
];

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

struct Entry {
    rho: f64,
    computed_at: Option<Instant>,
}

pub struct CorrelationCache {
    entries: Mutex<HashMap<(String, String), Entry>>,
}

impl CorrelationCache {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        for (a, b, rho) in STATIC_PAIRS {
            entries.insert(
                pair_key(a, b),
                Entry {
                    rho: *rho,
                    // Static seeds never expire; a refresh overwrites them.
                    computed_at: None,
                },
            );
        }
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Correlation between two symbols, if known and fresh.
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        if a == b {
            return Some(1.0);
        }
        let entries = self.entries.lock().expect("correlation cache poisoned");
        let entry = entries.get(&pair_key(a, b))?;
        match entry.computed_at {
            Some(at) if at.elapsed() >= ENTRY_TTL => None,
            _ => Some(entry.rho),
        }
    }

    /// Recompute one pair from bar history and store it.
    pub fn refresh(&self, a: &str, b: &str, bars_a: &[Bar], bars_b: &[Bar]) -> Option<f64> {
        let rho = pearson_log_returns(bars_a, bars_b)?;
        debug!("Correlation {}/{} refreshed to {:.3}", a, b, rho);
        self.entries.lock().expect("correlation cache poisoned").insert(
            pair_key(a, b),
            Entry {
                rho,
                computed_at: Some(Instant::now()),
            },
        );
        Some(rho)
    }

    /// Correlations of `symbol` against every open-position symbol.
    pub fn against_positions(
        &self,
        symbol: &str,
        positions: &[Position],
    ) -> HashMap<String, f64> {
        let mut out = HashMap::new();
        for p in positions {
            if p.symbol == symbol {
                continue;
            }
            if let Some(rho) = self.get(symbol, &p.symbol) {
                out.insert(p.symbol.clone(), rho);
            }
        }
        out
    }
}

impl Default for CorrelationCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Pearson coefficient over log returns of the two close series.
pub fn pearson_log_returns(bars_a: &[Bar], bars_b: &[Bar]) -> Option<f64> {
    let returns_a = log_returns(bars_a);
    let returns_b = log_returns(bars_b);
    let n = returns_a.len().min(returns_b.len());
    if n < 2 {
        return None;
    }
    let a = &returns_a[returns_a.len() - n..];
    let b = &returns_b[returns_b.len() - n..];

    let mean_a = a.iter().copied().mean();
    let mean_b = b.iter().copied().mean();
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

fn log_returns(bars: &[Bar]) -> Vec<f64> {
    let mut out = Vec::with_capacity(bars.len().saturating_sub(1));
    for w in bars.windows(2) {
        if w[0].close > 0.0 && w[1].close > 0.0 {
            out.push((w[1].close / w[0].close).ln());
        }
    }
    out
}

/// Outcome of the correlation executor: a size factor and a confidence
/// applied before the order goes out.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationAdjustment {
    pub size_factor: f64,
    pub confidence: u8,
    pub is_hedge: bool,
    /// Volume-weighted correlation against the open book.
    pub weighted_rho: f64,
}

impl CorrelationAdjustment {
    pub fn neutral() -> Self {
        Self {
            size_factor: 1.0,
            confidence: 100,
            is_hedge: false,
            weighted_rho: 0.0,
        }
    }
}

/// Weighted correlation score against open positions, volume-weighted, and
/// the resulting size reduction tier.
pub fn correlation_adjustment(
    cache: &CorrelationCache,
    symbol: &str,
    positions: &[Position],
) -> CorrelationAdjustment {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for p in positions {
        if p.symbol == symbol {
            continue;
        }
        if let Some(rho) = cache.get(symbol, &p.symbol) {
            let weight = p.volume.to_f64().unwrap_or(0.0).abs();
            weighted += rho * weight;
            total_weight += weight;
        }
    }
    if total_weight <= 0.0 {
        return CorrelationAdjustment::neutral();
    }
    let rho = weighted / total_weight;

    if rho < -0.7 {
        // Negative correlation hedges the book; full size.
        return CorrelationAdjustment {
            size_factor: 1.0,
            confidence: 100,
            is_hedge: true,
            weighted_rho: rho,
        };
    }
    let abs = rho.abs();
    let (size_factor, confidence) = if abs > 0.9 {
        (0.3, 60)
    } else if abs > 0.8 {
        (0.5, 75)
    } else if abs > 0.7 {
        (0.7, 85)
    } else {
        (1.0, 100)
    };
    CorrelationAdjustment {
        size_factor,
        confidence,
        is_hedge: false,
        weighted_rho: rho,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::OrderSide;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn bars_from_closes(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                open_time: Utc.timestamp_opt(i as i64 * 60, 0).unwrap(),
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 1.0,
                spread: 0.0,
            })
            .collect()
    }

    fn position(symbol: &str, volume: rust_decimal::Decimal) -> Position {
        Position {
            ticket: 1,
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            volume,
            open_price: 1.0,
            current_price: 1.0,
            stop_loss: 0.0,
            take_profit: 0.0,
            profit: dec!(0),
            open_time: Utc::now(),
            magic: 1,
            comment: String::new(),
        }
    }

    #[test]
    fn test_static_seed_is_symmetric() {
        let cache = CorrelationCache::new();
        assert_eq!(cache.get("EURUSD", "GBPUSD"), Some(0.85));
        assert_eq!(cache.get("GBPUSD", "EURUSD"), Some(0.85));
        assert_eq!(cache.get("EURUSD", "EURUSD"), Some(1.0));
        assert_eq!(cache.get("EURUSD", "XAGUSD"), None);
    }

    #[test]
    fn test_pearson_perfectly_correlated() {
        let a = bars_from_closes(&[1.0, 1.01, 1.02, 1.015, 1.03, 1.04]);
        let b = bars_from_closes(&[2.0, 2.02, 2.04, 2.03, 2.06, 2.08]);
        let rho = pearson_log_returns(&a, &b).unwrap();
        assert!(rho > 0.99, "rho was {}", rho);
    }

    #[test]
    fn test_pearson_inverse() {
        let a = bars_from_closes(&[1.0, 1.01, 1.02, 1.015, 1.03]);
        let b = bars_from_closes(&[2.0, 1.98, 1.96, 1.97, 1.94]);
        let rho = pearson_log_returns(&a, &b).unwrap();
        assert!(rho < -0.9, "rho was {}", rho);
    }

    #[test]
    fn test_refresh_overwrites_seed() {
        let cache = CorrelationCache::new();
        let a = bars_from_closes(&[1.0, 1.01, 1.02, 1.015, 1.03]);
        let b = bars_from_closes(&[2.0, 1.98, 1.96, 1.97, 1.94]);
        cache.refresh("EURUSD", "GBPUSD", &a, &b);
        let rho = cache.get("EURUSD", "GBPUSD").unwrap();
        assert!(rho < 0.0);
    }

    #[test]
    fn test_adjustment_tiers() {
        let cache = CorrelationCache::new();
        // EURUSD vs open USDCHF: -0.95 -> hedge at full size.
        let hedge = correlation_adjustment(
            &cache,
            "EURUSD",
            &[position("USDCHF", dec!(1))],
        );
        assert!(hedge.is_hedge);
        assert_eq!(hedge.size_factor, 1.0);

        // AUDUSD vs NZDUSD: 0.90; tier |rho| > 0.8 -> 50% size.
        let tight = correlation_adjustment(
            &cache,
            "AUDUSD",
            &[position("NZDUSD", dec!(1))],
        );
        assert_eq!(tight.size_factor, 0.5);
        assert_eq!(tight.confidence, 75);

        // No open positions -> neutral.
        let neutral = correlation_adjustment(&cache, "EURUSD", &[]);
        assert_eq!(neutral, CorrelationAdjustment::neutral());
    }

    #[test]
    fn test_adjustment_weights_by_volume() {
        let cache = CorrelationCache::new();
        // Heavy GBPUSD (0.85) against light USDJPY (-0.30):
        // (0.85*3 - 0.30*1)/4 = 0.5625 -> under 0.7 tier, full size.
        let adj = correlation_adjustment(
            &cache,
            "EURUSD",
            &[position("GBPUSD", dec!(3)), position("USDJPY", dec!(1))],
        );
        assert!((adj.weighted_rho - 0.5625).abs() < 1e-9);
        assert_eq!(adj.size_factor, 1.0);
    }
}
