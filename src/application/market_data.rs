//! Bar and quote access with a short-lived cache in front of the broker.

use crate::application::symbol_map::SymbolMapper;
use crate::domain::errors::ExecutorError;
use crate::domain::types::{Bar, SymbolInfo, Timeframe};
use crate::infrastructure::broker::BrokerApi;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Bars needed before regime detection and MA200 become meaningful.
pub const REGIME_BAR_COUNT: usize = 200;
/// Enough for every other indicator in the library.
pub const DEFAULT_BAR_COUNT: usize = 100;

struct CachedBars {
    bars: Vec<Bar>,
    fetched_at: Instant,
}

/// Fetches bars through the broker socket, serving repeat requests within a
/// tick from memory. Freshness is half the timeframe, clamped to [10s, 5m].
pub struct MarketDataClient {
    broker: Arc<dyn BrokerApi>,
    mapper: SymbolMapper,
    bars: RwLock<HashMap<(String, Timeframe), CachedBars>>,
}

impl MarketDataClient {
    pub fn new(broker: Arc<dyn BrokerApi>, mapper: SymbolMapper) -> Self {
        Self {
            broker,
            mapper,
            bars: RwLock::new(HashMap::new()),
        }
    }

    pub fn mapper(&self) -> &SymbolMapper {
        &self.mapper
    }

    fn freshness(timeframe: Timeframe) -> Duration {
        Duration::from_secs((timeframe.seconds() / 2).clamp(10, 300))
    }

    /// At least `count` closed bars for the symbol, oldest first.
    pub async fn bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>> {
        let broker_symbol = self.mapper.map(symbol).to_string();
        let key = (broker_symbol.clone(), timeframe);

        {
            let cache = self.bars.read().await;
            if let Some(cached) = cache.get(&key) {
                if cached.fetched_at.elapsed() < Self::freshness(timeframe)
                    && cached.bars.len() >= count
                {
                    debug!("Bar cache hit for {} {}", broker_symbol, timeframe);
                    return Ok(cached.bars.clone());
                }
            }
        }

        let bars = self
            .broker
            .market_data(&broker_symbol, timeframe, count.max(DEFAULT_BAR_COUNT))
            .await?;
        if bars.len() < count {
            return Err(ExecutorError::InsufficientBars {
                symbol: broker_symbol,
                have: bars.len(),
                need: count,
            }
            .into());
        }

        self.bars.write().await.insert(
            key,
            CachedBars {
                bars: bars.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(bars)
    }

    pub async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        self.broker.symbol_info(self.mapper.map(symbol)).await
    }

    /// Drop all cached bars; part of the heartbeat recovery routine.
    pub async fn clear_cache(&self) {
        self.bars.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{AccountInfo, OrderSide, Position};
    use crate::infrastructure::broker::protocol::OpenResult;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBroker {
        calls: AtomicUsize,
    }

    fn make_bars(n: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| Bar {
                open_time: Utc.timestamp_opt(i as i64 * 300, 0).unwrap(),
                open: 1.1,
                high: 1.11,
                low: 1.09,
                close: 1.1,
                volume: 100.0,
                spread: 1.0,
            })
            .collect()
    }

    #[async_trait]
    impl BrokerApi for CountingBroker {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn open_position(
            &self,
            _symbol: &str,
            _side: OrderSide,
            _lot_size: Decimal,
            _sl: Option<f64>,
            _tp: Option<f64>,
            _comment: Option<String>,
            _magic: Option<i64>,
        ) -> Result<OpenResult> {
            unimplemented!()
        }
        async fn close_position(&self, _ticket: u64, _volume: Option<Decimal>) -> Result<()> {
            unimplemented!()
        }
        async fn close_all_positions(&self) -> Result<()> {
            unimplemented!()
        }
        async fn modify_position(
            &self,
            _ticket: u64,
            _sl: Option<f64>,
            _tp: Option<f64>,
        ) -> Result<()> {
            unimplemented!()
        }
        async fn positions(&self) -> Result<Vec<Position>> {
            Ok(Vec::new())
        }
        async fn account_info(&self) -> Result<AccountInfo> {
            unimplemented!()
        }
        async fn symbol_info(&self, _symbol: &str) -> Result<SymbolInfo> {
            unimplemented!()
        }
        async fn market_data(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            count: usize,
        ) -> Result<Vec<Bar>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(make_bars(count))
        }
    }

    #[tokio::test]
    async fn test_repeat_request_served_from_cache() {
        let broker = Arc::new(CountingBroker {
            calls: AtomicUsize::new(0),
        });
        let client = MarketDataClient::new(broker.clone(), SymbolMapper::new());

        let a = client.bars("EURUSD", Timeframe::M5, 100).await.unwrap();
        let b = client.bars("EURUSD", Timeframe::M5, 100).await.unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_larger_request_refetches() {
        let broker = Arc::new(CountingBroker {
            calls: AtomicUsize::new(0),
        });
        let client = MarketDataClient::new(broker.clone(), SymbolMapper::new());

        client.bars("EURUSD", Timeframe::M5, 100).await.unwrap();
        client.bars("EURUSD", Timeframe::M5, 200).await.unwrap();
        assert_eq!(broker.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mapped_symbol_reaches_broker() {
        let broker = Arc::new(CountingBroker {
            calls: AtomicUsize::new(0),
        });
        let mut mapper = SymbolMapper::new();
        mapper.insert("EURUSD", "EURUSD.m");
        let client = MarketDataClient::new(broker, mapper);
        // Mapping is covered by SymbolMapper tests; here we just confirm the
        // call path works with a mapped name.
        assert!(client.bars("EURUSD", Timeframe::M5, 50).await.is_ok());
    }
}
