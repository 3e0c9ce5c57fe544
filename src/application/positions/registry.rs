//! Central registry of open positions, reconciled with the broker.
//!
//! The registry is the single owner of position state; the smart-exit
//! manager holds tickets and looks records up here. Sync runs every five
//! seconds; three consecutive failures clear the registry and pause
//! evaluation until the broker answers again.

use crate::domain::events::ExecutorEvent;
use crate::domain::types::Position;
use crate::infrastructure::broker::BrokerApi;
use crate::infrastructure::event_bus::EventBus;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info, warn};

pub const SYNC_INTERVAL: Duration = Duration::from_secs(5);
const MAX_SYNC_FAILURES: u32 = 3;

/// Per-position record: the broker snapshot plus exit-manager state that
/// must survive between ticks.
#[derive(Debug, Clone)]
pub struct PositionRecord {
    pub position: Position,
    pub first_seen: DateTime<Utc>,
    /// Indices of partial-exit levels that already fired.
    pub fired_levels: HashSet<usize>,
    /// Percentage of the original volume already closed by partials.
    pub exited_pct: f64,
    pub breakeven_applied: bool,
    /// Most favorable price seen, for trailing stops.
    pub best_price: f64,
    /// Volume at first sighting, the base for partial percentages.
    pub initial_volume: Decimal,
    /// SL at first sighting; reward:risk triggers measure against this even
    /// after the stop has been moved.
    pub initial_stop_loss: f64,
}

impl PositionRecord {
    fn new(position: Position) -> Self {
        let best_price = position.current_price;
        let initial_volume = position.volume;
        let initial_stop_loss = position.stop_loss;
        Self {
            first_seen: position.open_time,
            position,
            fired_levels: HashSet::new(),
            exited_pct: 0.0,
            breakeven_applied: false,
            best_price,
            initial_volume,
            initial_stop_loss,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegistrySummary {
    pub open_count: usize,
    pub managed_count: usize,
    pub total_profit: Decimal,
    pub profit_by_magic: HashMap<i64, Decimal>,
    pub profit_by_symbol: HashMap<String, Decimal>,
}

pub struct PositionRegistry {
    records: RwLock<HashMap<u64, PositionRecord>>,
    /// Magic numbers of currently loaded strategies; anything else is an
    /// external position and is never managed.
    known_magics: RwLock<HashSet<i64>>,
    consecutive_failures: AtomicU32,
    evaluation_paused: AtomicBool,
    events: EventBus,
}

impl PositionRegistry {
    pub fn new(events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            known_magics: RwLock::new(HashSet::new()),
            consecutive_failures: AtomicU32::new(0),
            evaluation_paused: AtomicBool::new(false),
            events,
        })
    }

    pub async fn register_magic(&self, magic: i64) {
        self.known_magics.write().await.insert(magic);
    }

    pub async fn unregister_magic(&self, magic: i64) {
        self.known_magics.write().await.remove(&magic);
    }

    /// True while sync failures have cleared the registry; evaluation holds
    /// off until the broker answers again.
    pub fn is_evaluation_paused(&self) -> bool {
        self.evaluation_paused.load(Ordering::SeqCst)
    }

    /// One reconciliation pass against the broker snapshot.
    pub async fn sync(&self, broker: &dyn BrokerApi) {
        match broker.positions().await {
            Ok(snapshot) => {
                self.apply_snapshot(snapshot).await;
                let was_paused = self.evaluation_paused.swap(false, Ordering::SeqCst);
                self.consecutive_failures.store(0, Ordering::SeqCst);
                if was_paused {
                    info!("Registry sync recovered, evaluation resumed");
                }
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                error!("Registry sync failed ({} consecutive): {}", failures, e);
                if failures >= MAX_SYNC_FAILURES {
                    // Safety measure: stale position data is worse than none.
                    let cleared = {
                        let mut records = self.records.write().await;
                        let n = records.len();
                        records.clear();
                        n
                    };
                    if cleared > 0 || !self.evaluation_paused.load(Ordering::SeqCst) {
                        warn!(
                            "Registry cleared ({} records) after {} sync failures; evaluation paused",
                            cleared, failures
                        );
                    }
                    self.evaluation_paused.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    async fn apply_snapshot(&self, snapshot: Vec<Position>) {
        let mut closed = Vec::new();
        {
            let mut records = self.records.write().await;
            let live: HashSet<u64> = snapshot.iter().map(|p| p.ticket).collect();

            // Tickets gone from the snapshot closed on the broker side.
            records.retain(|ticket, record| {
                if live.contains(ticket) {
                    true
                } else {
                    closed.push((*ticket, record.position.clone()));
                    false
                }
            });

            for position in snapshot {
                match records.get_mut(&position.ticket) {
                    Some(record) => {
                        // Keep the open time from first sighting and the
                        // running best price.
                        let favorable = match record.position.side {
                            crate::domain::types::OrderSide::Buy => {
                                position.current_price > record.best_price
                            }
                            crate::domain::types::OrderSide::Sell => {
                                position.current_price < record.best_price
                            }
                        };
                        if favorable {
                            record.best_price = position.current_price;
                        }
                        let first_seen = record.first_seen;
                        record.position = position;
                        record.first_seen = first_seen;
                    }
                    None => {
                        debug!(
                            "Registry: new position {} {} {}",
                            position.ticket, position.symbol, position.volume
                        );
                        records.insert(position.ticket, PositionRecord::new(position));
                    }
                }
            }
        }

        for (ticket, position) in closed {
            info!(
                "Registry: position {} closed (profit {})",
                ticket, position.profit
            );
            self.events
                .publish(ExecutorEvent::PositionClosed {
                    ticket,
                    symbol: position.symbol,
                    profit: position.profit,
                })
                .await;
        }
    }

    /// Periodic sync driver; stops when the shutdown flag flips.
    pub async fn run_sync_loop(
        self: Arc<Self>,
        broker: Arc<dyn BrokerApi>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(SYNC_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.sync(broker.as_ref()).await,
                _ = shutdown_rx.changed() => {
                    info!("Registry sync loop stopped");
                    return;
                }
            }
        }
    }

    // --- queries ---

    pub async fn get(&self, ticket: u64) -> Option<PositionRecord> {
        self.records.read().await.get(&ticket).cloned()
    }

    pub async fn all(&self) -> Vec<Position> {
        self.records
            .read()
            .await
            .values()
            .map(|r| r.position.clone())
            .collect()
    }

    /// Records whose magic belongs to a loaded strategy.
    pub async fn managed(&self) -> Vec<PositionRecord> {
        let magics = self.known_magics.read().await;
        self.records
            .read()
            .await
            .values()
            .filter(|r| magics.contains(&r.position.magic))
            .cloned()
            .collect()
    }

    pub async fn by_magic(&self, magic: i64) -> Vec<Position> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.position.magic == magic)
            .map(|r| r.position.clone())
            .collect()
    }

    pub async fn by_symbol(&self, symbol: &str) -> Vec<Position> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.position.symbol == symbol)
            .map(|r| r.position.clone())
            .collect()
    }

    pub async fn has_open(&self, magic: i64, symbol: &str) -> bool {
        self.records
            .read()
            .await
            .values()
            .any(|r| r.position.magic == magic && r.position.symbol == symbol)
    }

    pub async fn open_count(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn profitable(&self) -> Vec<Position> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.position.profit > Decimal::ZERO)
            .map(|r| r.position.clone())
            .collect()
    }

    pub async fn losing(&self) -> Vec<Position> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.position.profit < Decimal::ZERO)
            .map(|r| r.position.clone())
            .collect()
    }

    pub async fn oldest(&self) -> Option<Position> {
        self.records
            .read()
            .await
            .values()
            .min_by_key(|r| r.first_seen)
            .map(|r| r.position.clone())
    }

    pub async fn newest(&self) -> Option<Position> {
        self.records
            .read()
            .await
            .values()
            .max_by_key(|r| r.first_seen)
            .map(|r| r.position.clone())
    }

    /// Margin-based exposure of the whole book.
    pub async fn total_exposure(&self, leverage: u32) -> f64 {
        self.records
            .read()
            .await
            .values()
            .map(|r| {
                crate::application::risk::checks::margin_exposure(
                    r.position.volume.to_f64().unwrap_or(0.0),
                    r.position.current_price,
                    leverage,
                )
            })
            .sum()
    }

    pub async fn summary(&self) -> RegistrySummary {
        let records = self.records.read().await;
        let magics = self.known_magics.read().await;
        let mut summary = RegistrySummary {
            open_count: records.len(),
            ..Default::default()
        };
        for record in records.values() {
            let p = &record.position;
            if magics.contains(&p.magic) {
                summary.managed_count += 1;
            }
            summary.total_profit += p.profit;
            *summary.profit_by_magic.entry(p.magic).or_default() += p.profit;
            *summary
                .profit_by_symbol
                .entry(p.symbol.clone())
                .or_default() += p.profit;
        }
        summary
    }

    // --- exit-manager state updates ---

    pub async fn mark_level_fired(&self, ticket: u64, level: usize, pct: f64) {
        if let Some(record) = self.records.write().await.get_mut(&ticket) {
            record.fired_levels.insert(level);
            record.exited_pct += pct;
        }
    }

    pub async fn mark_breakeven_applied(&self, ticket: u64) {
        if let Some(record) = self.records.write().await.get_mut(&ticket) {
            record.breakeven_applied = true;
        }
    }

    pub async fn record_stop_loss(&self, ticket: u64, new_sl: f64) {
        if let Some(record) = self.records.write().await.get_mut(&ticket) {
            record.position.stop_loss = new_sl;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{AccountInfo, Bar, OrderSide, SymbolInfo, Timeframe};
    use crate::infrastructure::broker::protocol::OpenResult;
    use anyhow::Result;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;

    /// Broker stub with a scriptable positions snapshot.
    struct ScriptedBroker {
        snapshots: StdMutex<Vec<Result<Vec<Position>, String>>>,
    }

    impl ScriptedBroker {
        fn new(snapshots: Vec<Result<Vec<Position>, String>>) -> Self {
            Self {
                snapshots: StdMutex::new(snapshots),
            }
        }
    }

    #[async_trait]
    impl BrokerApi for ScriptedBroker {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn open_position(
            &self,
            _: &str,
            _: OrderSide,
            _: Decimal,
            _: Option<f64>,
            _: Option<f64>,
            _: Option<String>,
            _: Option<i64>,
        ) -> Result<OpenResult> {
            unimplemented!()
        }
        async fn close_position(&self, _: u64, _: Option<Decimal>) -> Result<()> {
            unimplemented!()
        }
        async fn close_all_positions(&self) -> Result<()> {
            unimplemented!()
        }
        async fn modify_position(&self, _: u64, _: Option<f64>, _: Option<f64>) -> Result<()> {
            unimplemented!()
        }
        async fn positions(&self) -> Result<Vec<Position>> {
            let mut snapshots = self.snapshots.lock().unwrap();
            if snapshots.is_empty() {
                return Ok(Vec::new());
            }
            snapshots.remove(0).map_err(|e| anyhow::anyhow!(e))
        }
        async fn account_info(&self) -> Result<AccountInfo> {
            unimplemented!()
        }
        async fn symbol_info(&self, _: &str) -> Result<SymbolInfo> {
            unimplemented!()
        }
        async fn market_data(&self, _: &str, _: Timeframe, _: usize) -> Result<Vec<Bar>> {
            unimplemented!()
        }
    }

    fn position(ticket: u64, symbol: &str, profit: Decimal) -> Position {
        Position {
            ticket,
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            volume: dec!(0.10),
            open_price: 1.1,
            current_price: 1.1,
            stop_loss: 0.0,
            take_profit: 0.0,
            profit,
            open_time: Utc::now(),
            magic: 1001,
            comment: String::new(),
        }
    }

    #[tokio::test]
    async fn test_registry_converges_with_snapshot() {
        let broker = ScriptedBroker::new(vec![
            Ok(vec![position(1, "EURUSD", dec!(5)), position(2, "GBPUSD", dec!(-3))]),
            Ok(vec![position(1, "EURUSD", dec!(6)), position(2, "GBPUSD", dec!(-2))]),
        ]);
        let registry = PositionRegistry::new(EventBus::new());

        registry.sync(&broker).await;
        assert_eq!(registry.open_count().await, 2);
        registry.sync(&broker).await;
        assert_eq!(registry.open_count().await, 2);
        // Updated in place.
        assert_eq!(registry.get(1).await.unwrap().position.profit, dec!(6));
    }

    #[tokio::test]
    async fn test_absent_ticket_emits_closed() {
        use crate::domain::events::EventListener;
        use std::sync::atomic::AtomicUsize;

        struct ClosedCounter(Arc<AtomicUsize>);
        impl EventListener for ClosedCounter {
            fn on_event(&self, event: &ExecutorEvent) {
                if matches!(event, ExecutorEvent::PositionClosed { .. }) {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Arc::new(ClosedCounter(Arc::clone(&count)))).await;

        let broker = ScriptedBroker::new(vec![
            Ok(vec![position(1, "EURUSD", dec!(5)), position(2, "GBPUSD", dec!(1))]),
            Ok(vec![position(1, "EURUSD", dec!(5))]),
        ]);
        let registry = PositionRegistry::new(bus);
        registry.sync(&broker).await;
        registry.sync(&broker).await;

        assert_eq!(registry.open_count().await, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_three_failures_clear_and_pause() {
        let broker = ScriptedBroker::new(vec![
            Ok(vec![position(1, "EURUSD", dec!(5))]),
            Err("timeout".to_string()),
            Err("timeout".to_string()),
            Err("timeout".to_string()),
            Ok(vec![position(1, "EURUSD", dec!(5))]),
        ]);
        let registry = PositionRegistry::new(EventBus::new());

        registry.sync(&broker).await;
        assert_eq!(registry.open_count().await, 1);

        registry.sync(&broker).await;
        registry.sync(&broker).await;
        assert!(!registry.is_evaluation_paused());
        registry.sync(&broker).await;
        assert!(registry.is_evaluation_paused());
        assert_eq!(registry.open_count().await, 0);

        // Recovery resumes evaluation and repopulates.
        registry.sync(&broker).await;
        assert!(!registry.is_evaluation_paused());
        assert_eq!(registry.open_count().await, 1);
    }

    #[tokio::test]
    async fn test_first_seen_survives_updates() {
        let mut early = position(1, "EURUSD", dec!(0));
        early.open_time = Utc::now() - chrono::Duration::hours(2);
        let mut late = early.clone();
        late.profit = dec!(10);

        let broker = ScriptedBroker::new(vec![Ok(vec![early.clone()]), Ok(vec![late])]);
        let registry = PositionRegistry::new(EventBus::new());
        registry.sync(&broker).await;
        let first_seen = registry.get(1).await.unwrap().first_seen;
        registry.sync(&broker).await;
        assert_eq!(registry.get(1).await.unwrap().first_seen, first_seen);
    }

    #[tokio::test]
    async fn test_external_positions_not_managed() {
        let mut external = position(9, "USDJPY", dec!(0));
        external.magic = 4242;
        let broker = ScriptedBroker::new(vec![Ok(vec![position(1, "EURUSD", dec!(0)), external])]);
        let registry = PositionRegistry::new(EventBus::new());
        registry.register_magic(1001).await;
        registry.sync(&broker).await;

        assert_eq!(registry.open_count().await, 2);
        let managed = registry.managed().await;
        assert_eq!(managed.len(), 1);
        assert_eq!(managed[0].position.ticket, 1);
    }

    #[tokio::test]
    async fn test_queries_and_summary() {
        let broker = ScriptedBroker::new(vec![Ok(vec![
            position(1, "EURUSD", dec!(5)),
            position(2, "EURUSD", dec!(-3)),
            position(3, "GBPUSD", dec!(2)),
        ])]);
        let registry = PositionRegistry::new(EventBus::new());
        registry.register_magic(1001).await;
        registry.sync(&broker).await;

        assert!(registry.has_open(1001, "EURUSD").await);
        assert!(!registry.has_open(1001, "USDJPY").await);
        assert_eq!(registry.by_symbol("EURUSD").await.len(), 2);
        assert_eq!(registry.profitable().await.len(), 2);
        assert_eq!(registry.losing().await.len(), 1);

        let summary = registry.summary().await;
        assert_eq!(summary.open_count, 3);
        assert_eq!(summary.managed_count, 3);
        assert_eq!(summary.total_profit, dec!(4));
        assert_eq!(summary.profit_by_symbol["EURUSD"], dec!(2));
    }
}
