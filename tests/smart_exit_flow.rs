//! Smart-exit manager against the registry and an in-memory broker.

mod common;

use common::{MockBroker, open_position};
use fx_executor::application::market_data::MarketDataClient;
use fx_executor::application::positions::{ExitAction, PositionRegistry, SmartExitManager};
use fx_executor::application::symbol_map::SymbolMapper;
use fx_executor::domain::strategy::{ExitTrigger, PartialExitLevel, SmartExitSpec};
use fx_executor::domain::types::Timeframe;
use fx_executor::infrastructure::broker::BrokerApi;
use fx_executor::infrastructure::event_bus::EventBus;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

fn pips_spec() -> SmartExitSpec {
    SmartExitSpec {
        partial_exits: vec![PartialExitLevel {
            trigger: ExitTrigger::Pips(40.0),
            percentage: 50.0,
        }],
        max_total_exit: 100.0,
        max_remaining: 0.0,
        breakeven_after_partial: true,
        breakeven: None,
        trailing: None,
        time_exit: None,
        swing_stop: None,
    }
}

#[tokio::test]
async fn test_partial_exit_fires_once_and_moves_stop() {
    let broker = Arc::new(MockBroker::default());
    // BUY EURUSD at 1.1000, now 1.1050: 50 pips in profit.
    broker
        .positions
        .lock()
        .unwrap()
        .push(open_position(700, "EURUSD", 1001));

    let registry = PositionRegistry::new(EventBus::new());
    registry.register_magic(1001).await;
    registry.sync(broker.as_ref() as &dyn BrokerApi).await;

    let market = MarketDataClient::new(broker.clone() as Arc<dyn BrokerApi>, SymbolMapper::new());
    let (tx, mut rx) = mpsc::channel(16);
    let manager = SmartExitManager::new(Arc::clone(&registry), tx);

    let mut specs = HashMap::new();
    specs.insert(1001_i64, (pips_spec(), Timeframe::M5));

    manager.tick(&specs, &market).await;

    // Close half, then lock the stop at breakeven.
    let first = rx.try_recv().unwrap();
    assert_eq!(
        first,
        ExitAction::Close {
            ticket: 700,
            volume: Some(dec!(0.50)),
            reason: "partial exit level 1 (50%)".to_string(),
        }
    );
    match rx.try_recv().unwrap() {
        ExitAction::Modify { ticket, new_sl, .. } => {
            assert_eq!(ticket, 700);
            assert!((new_sl - 1.1000).abs() < 1e-9);
        }
        other => panic!("expected modify, got {:?}", other),
    }

    // State persisted: the level cannot fire again.
    let record = registry.get(700).await.unwrap();
    assert!(record.fired_levels.contains(&0));
    assert!(record.breakeven_applied);

    manager.tick(&specs, &market).await;
    assert!(rx.try_recv().is_err(), "level fired twice");
}

#[tokio::test]
async fn test_unmanaged_position_is_left_alone() {
    let broker = Arc::new(MockBroker::default());
    // Magic 4242 belongs to no loaded strategy.
    broker
        .positions
        .lock()
        .unwrap()
        .push(open_position(701, "EURUSD", 4242));

    let registry = PositionRegistry::new(EventBus::new());
    registry.register_magic(1001).await;
    registry.sync(broker.as_ref() as &dyn BrokerApi).await;

    let market = MarketDataClient::new(broker.clone() as Arc<dyn BrokerApi>, SymbolMapper::new());
    let (tx, mut rx) = mpsc::channel(16);
    let manager = SmartExitManager::new(registry, tx);

    let mut specs = HashMap::new();
    specs.insert(1001_i64, (pips_spec(), Timeframe::M5));
    manager.tick(&specs, &market).await;

    assert!(rx.try_recv().is_err());
}
