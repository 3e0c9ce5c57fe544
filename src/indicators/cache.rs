//! LRU + TTL cache in front of indicator computation.
//!
//! Keyed by (symbol, timeframe, indicator, canonical params JSON, bar
//! count). A changed bar count never matches a stale entry, and inserting a
//! fresh count drops the superseded ones for the same series.

use crate::domain::types::{Bar, Timeframe};
use crate::indicators;
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub indicator: String,
    pub params_json: String,
    pub bar_count: usize,
}

impl CacheKey {
    pub fn new(
        symbol: &str,
        timeframe: Timeframe,
        indicator: &str,
        params: &BTreeMap<String, f64>,
        bar_count: usize,
    ) -> Self {
        // BTreeMap keeps key order stable, so the JSON is canonical.
        let params_json = serde_json::to_string(params).unwrap_or_default();
        Self {
            symbol: symbol.to_string(),
            timeframe,
            indicator: indicator.to_lowercase(),
            params_json,
            bar_count,
        }
    }
}

struct Entry {
    series: Vec<f64>,
    inserted_at: Instant,
    last_access: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

struct Inner {
    map: HashMap<CacheKey, Entry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

pub struct IndicatorCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl Default for IndicatorCache {
    fn default() -> Self {
        Self::new(1000, Duration::from_secs(300))
    }
}

impl IndicatorCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            capacity,
            ttl,
        }
    }

    /// Cached series for the key, if present and younger than the TTL.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<f64>> {
        let mut inner = self.inner.lock().expect("indicator cache poisoned");
        let ttl = self.ttl;
        let mut expired = false;
        let hit = match inner.map.get_mut(key) {
            Some(entry) => {
                if entry.inserted_at.elapsed() < ttl {
                    entry.last_access = Instant::now();
                    Some(entry.series.clone())
                } else {
                    expired = true;
                    None
                }
            }
            None => None,
        };
        if expired {
            inner.map.remove(key);
        }
        if hit.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        hit
    }

    pub fn insert(&self, key: CacheKey, series: Vec<f64>) {
        let mut inner = self.inner.lock().expect("indicator cache poisoned");

        // A new bar count supersedes older entries for the same series.
        inner.map.retain(|k, _| {
            !(k.symbol == key.symbol
                && k.timeframe == key.timeframe
                && k.indicator == key.indicator
                && k.params_json == key.params_json
                && k.bar_count != key.bar_count)
        });

        if inner.map.len() >= self.capacity && !inner.map.contains_key(&key) {
            // Evict the entry with the oldest last-access timestamp.
            if let Some(oldest) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            {
                inner.map.remove(&oldest);
                inner.evictions += 1;
            }
        }

        let now = Instant::now();
        inner.map.insert(
            key,
            Entry {
                series,
                inserted_at: now,
                last_access: now,
            },
        );
    }

    /// Compute-through accessor used by the evaluation pipeline.
    pub fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        indicator: &str,
        params: &BTreeMap<String, f64>,
        bars: &[Bar],
    ) -> Result<Vec<f64>> {
        let key = CacheKey::new(symbol, timeframe, indicator, params, bars.len());
        if let Some(series) = self.get(&key) {
            return Ok(series);
        }
        let series = indicators::compute(indicator, params, bars)?;
        self.insert(key, series.clone());
        Ok(series)
    }

    /// Drop every entry whose symbol or timeframe contains the fragment.
    pub fn invalidate_matching(&self, fragment: &str) {
        let mut inner = self.inner.lock().expect("indicator cache poisoned");
        let before = inner.map.len();
        inner
            .map
            .retain(|k, _| !k.symbol.contains(fragment) && !k.timeframe.as_str().contains(fragment));
        let dropped = before - inner.map.len();
        if dropped > 0 {
            debug!("IndicatorCache: invalidated {} entries matching '{}'", dropped, fragment);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("indicator cache poisoned");
        inner.map.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("indicator cache poisoned");
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            entries: inner.map.len(),
        }
    }
}
