//! End-to-end evaluation flow: scheduler tick -> evaluator -> risk gate ->
//! order dispatcher, against an in-memory broker.

mod common;

use common::{MockBroker, always_long_strategy, open_position};
use fx_executor::application::evaluation::{EvaluationScheduler, StrategyEvaluator};
use fx_executor::application::market_data::MarketDataClient;
use fx_executor::application::positions::{OrderDispatcher, PositionRegistry};
use fx_executor::application::risk::{CorrelationCache, RiskGatekeeper};
use fx_executor::application::state::ExecutorState;
use fx_executor::application::symbol_map::SymbolMapper;
use fx_executor::domain::events::{EventListener, ExecutorEvent};
use fx_executor::domain::risk_limits::{AccountKind, RiskLimits};
use fx_executor::domain::types::OrderSide;
use fx_executor::indicators::cache::IndicatorCache;
use fx_executor::infrastructure::broker::BrokerApi;
use fx_executor::infrastructure::event_bus::EventBus;
use rust_decimal_macros::dec;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct AlertRecorder(Arc<Mutex<Vec<String>>>);

impl EventListener for AlertRecorder {
    fn on_event(&self, event: &ExecutorEvent) {
        if let ExecutorEvent::SafetyAlert { reason, .. } = event {
            self.0.lock().unwrap().push(reason.clone());
        }
    }
}

struct Graph {
    scheduler: Arc<EvaluationScheduler>,
    state: Arc<ExecutorState>,
    registry: Arc<PositionRegistry>,
    events: EventBus,
}

fn build_graph(broker: Arc<MockBroker>, limits: RiskLimits) -> Graph {
    let events = EventBus::new();
    let registry = PositionRegistry::new(events.clone());
    let market = Arc::new(MarketDataClient::new(
        broker.clone() as Arc<dyn BrokerApi>,
        SymbolMapper::new(),
    ));
    let cache = Arc::new(IndicatorCache::default());
    let correlation = Arc::new(CorrelationCache::new());
    let gate = Arc::new(RiskGatekeeper::new(
        limits,
        Arc::clone(&correlation),
        None,
        events.clone(),
    ));
    let evaluator = Arc::new(StrategyEvaluator::new(
        market,
        cache,
        Arc::clone(&registry),
        correlation,
        None,
        AccountKind::Demo,
    ));
    let state = ExecutorState::new(dec!(10000));
    let orders = OrderDispatcher::new(
        broker.clone() as Arc<dyn BrokerApi>,
        None,
        events.clone(),
        state.emergency_flag(),
    );
    let scheduler = EvaluationScheduler::new(
        evaluator,
        gate,
        orders,
        Arc::clone(&registry),
        broker as Arc<dyn BrokerApi>,
        Arc::clone(&state),
        8,
        Duration::from_secs(30),
        events.clone(),
    );
    Graph {
        scheduler,
        state,
        registry,
        events,
    }
}

async fn settle(ticks: usize) {
    for _ in 0..ticks {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_approved_signal_reaches_broker() {
    let broker = Arc::new(MockBroker::default());
    let graph = build_graph(broker.clone(), RiskLimits::demo());

    graph
        .scheduler
        .clone()
        .start(always_long_strategy("trend"))
        .await
        .unwrap();
    settle(40).await;

    let opens = broker.opens.lock().unwrap();
    assert!(!opens.is_empty(), "expected at least one OPEN_POSITION");
    let open = &opens[0];
    assert_eq!(open.symbol, "EURUSD");
    assert_eq!(open.side, OrderSide::Buy);
    assert_eq!(open.lot_size, dec!(0.10));
    assert_eq!(open.magic, Some(1001));
    // SL 50 pips under the 1.10010 ask, TP at 2R above.
    assert!((open.sl.unwrap() - 1.09510).abs() < 1e-6);
    assert!((open.tp.unwrap() - 1.11010).abs() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn test_daily_loss_blocks_order_and_alerts() {
    let broker = Arc::new(MockBroker::default());
    let mut limits = RiskLimits::demo();
    limits.max_daily_loss = dec!(200);
    let graph = build_graph(broker.clone(), limits);

    let alerts = Arc::new(Mutex::new(Vec::new()));
    graph
        .events
        .subscribe(Arc::new(AlertRecorder(Arc::clone(&alerts))))
        .await;

    // Account balance 10000, daily pnl -200, limit 200.
    graph.state.add_realized_pnl(dec!(-200));

    graph
        .scheduler
        .clone()
        .start(always_long_strategy("trend"))
        .await
        .unwrap();
    settle(40).await;

    // No OPEN_POSITION went out in the same run.
    assert!(broker.opens.lock().unwrap().is_empty());
    let alerts = alerts.lock().unwrap();
    assert!(!alerts.is_empty());
    assert!(alerts[0].contains("Daily loss"), "got: {}", alerts[0]);
}

#[tokio::test(start_paused = true)]
async fn test_no_second_entry_while_position_open() {
    let broker = Arc::new(MockBroker::default());
    broker
        .positions
        .lock()
        .unwrap()
        .push(open_position(500, "EURUSD", 1001));
    let graph = build_graph(broker.clone(), RiskLimits::demo());

    // Registry knows about the open position before the first tick.
    graph.registry.sync(broker.as_ref() as &dyn BrokerApi).await;
    assert!(graph.registry.has_open(1001, "EURUSD").await);

    graph
        .scheduler
        .clone()
        .start(always_long_strategy("trend"))
        .await
        .unwrap();
    settle(40).await;

    // Entry conditions are met, but the (strategy, symbol) pair already
    // holds a position: no new order.
    assert!(broker.opens.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_emergency_flag_blocks_dispatch() {
    let broker = Arc::new(MockBroker::default());
    let graph = build_graph(broker.clone(), RiskLimits::demo());
    graph.state.set_emergency();

    graph
        .scheduler
        .clone()
        .start(always_long_strategy("trend"))
        .await
        .unwrap();
    settle(40).await;

    assert!(broker.opens.lock().unwrap().is_empty());
}
