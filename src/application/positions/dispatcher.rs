//! The only path to the broker for orders.
//!
//! Approved entry signals and smart-exit actions all funnel through here.
//! The emergency flag blocks new entries; exits and closes keep working so
//! the book can still be flattened.

use crate::application::positions::smart_exit::ExitAction;
use crate::domain::errors::ExecutorError;
use crate::domain::events::ExecutorEvent;
use crate::domain::types::{Position, TradeSignal};
use crate::infrastructure::broker::{BrokerApi, OpenResult};
use crate::infrastructure::control_plane::{ControlPlaneClient, TradeCloseReport, TradeOpenReport};
use crate::infrastructure::event_bus::EventBus;
use anyhow::Result;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub struct OrderDispatcher {
    broker: Arc<dyn BrokerApi>,
    control: Option<Arc<ControlPlaneClient>>,
    events: EventBus,
    emergency: Arc<AtomicBool>,
}

impl OrderDispatcher {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        control: Option<Arc<ControlPlaneClient>>,
        events: EventBus,
        emergency: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            control,
            events,
            emergency,
        })
    }

    pub fn is_blocked(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }

    /// Open a position for a gate-approved signal. The emergency flag makes
    /// this a hard error so callers cannot forget to check.
    pub async fn open(&self, signal: &TradeSignal) -> Result<OpenResult> {
        if self.is_blocked() {
            return Err(ExecutorError::EmergencyStop.into());
        }
        let side = signal
            .action
            .side()
            .ok_or_else(|| ExecutorError::InvalidCommand(format!(
                "signal action {} cannot open a position",
                signal.action
            )))?;

        let result = self
            .broker
            .open_position(
                &signal.symbol,
                side,
                signal.volume,
                signal.stop_loss,
                signal.take_profit,
                Some(signal.strategy_id.clone()),
                Some(signal.magic),
            )
            .await;

        match result {
            Ok(open) => {
                info!(
                    "Opened {} {} {} lots, ticket {}",
                    side, signal.symbol, signal.volume, open.ticket
                );
                self.events
                    .publish(ExecutorEvent::PositionOpened {
                        ticket: open.ticket,
                        symbol: signal.symbol.clone(),
                        side,
                        volume: signal.volume,
                        price: open.open_price,
                    })
                    .await;
                if let Some(control) = &self.control {
                    let report = TradeOpenReport {
                        ticket: open.ticket,
                        symbol: signal.symbol.clone(),
                        action: side.to_string(),
                        volume: signal.volume.to_f64().unwrap_or(0.0),
                        open_price: open.open_price,
                        stop_loss: signal.stop_loss,
                        take_profit: signal.take_profit,
                        strategy_id: signal.strategy_id.clone(),
                        timestamp: Utc::now(),
                    };
                    if let Err(e) = control.report_trade_open(&report).await {
                        warn!("Trade open report failed: {}", e);
                    }
                }
                Ok(open)
            }
            Err(e) => {
                error!("OPEN_POSITION failed for {}: {}", signal.symbol, e);
                if let Some(control) = &self.control {
                    let _ = control
                        .report_error(
                            "broker",
                            &format!("open failed: {}", e),
                            serde_json::json!({
                                "symbol": signal.symbol,
                                "strategyId": signal.strategy_id,
                            }),
                        )
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Close one or more positions (exit-condition CLOSE signals).
    pub async fn close_positions(&self, positions: &[Position], reason: &str) {
        for position in positions {
            self.apply_exit(ExitAction::Close {
                ticket: position.ticket,
                volume: None,
                reason: reason.to_string(),
            })
            .await;
        }
    }

    pub async fn close_all(&self) -> Result<()> {
        warn!("Dispatcher: closing all positions");
        self.broker.close_all_positions().await
    }

    /// Apply one smart-exit action. Broker rejections are recorded and
    /// reported; nothing retries.
    pub async fn apply_exit(&self, action: ExitAction) {
        match action {
            ExitAction::Modify {
                ticket,
                new_sl,
                reason,
            } => {
                info!("Modify ticket {}: SL -> {:.5} ({})", ticket, new_sl, reason);
                if let Err(e) = self.broker.modify_position(ticket, Some(new_sl), None).await {
                    error!("MODIFY_POSITION {} failed: {}", ticket, e);
                } else {
                    self.events
                        .publish(ExecutorEvent::ModifyPosition {
                            ticket,
                            new_sl,
                            reason,
                        })
                        .await;
                }
            }
            ExitAction::Close {
                ticket,
                volume,
                reason,
            } => {
                info!(
                    "Close ticket {} ({}): {}",
                    ticket,
                    volume
                        .map(|v| format!("{} lots", v))
                        .unwrap_or_else(|| "full".to_string()),
                    reason
                );
                let result = self.broker.close_position(ticket, volume).await;
                let success = result.is_ok();
                if let Err(e) = &result {
                    error!("CLOSE_POSITION {} failed: {}", ticket, e);
                }
                self.events
                    .publish(ExecutorEvent::ClosePosition {
                        ticket,
                        volume,
                        reason,
                    })
                    .await;
                // The close record goes out either way so the control plane
                // sees failed attempts too.
                if let Some(control) = &self.control {
                    let report = TradeCloseReport {
                        profit: 0.0,
                        close_price: None,
                        success,
                        error: result.err().map(|e| e.to_string()),
                        timestamp: Utc::now(),
                    };
                    if let Err(e) = control.report_trade_close(ticket, &report).await {
                        warn!("Trade close report failed: {}", e);
                    }
                }
            }
        }
    }

    /// Drain smart-exit actions until the channel closes.
    pub async fn run_exit_consumer(self: Arc<Self>, mut rx: mpsc::Receiver<ExitAction>) {
        while let Some(action) = rx.recv().await {
            self.apply_exit(action).await;
        }
        info!("Exit action consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{
        AccountInfo, Bar, OrderSide, SymbolInfo, Timeframe, TradeAction,
    };
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingBroker {
        opens: StdMutex<Vec<(String, OrderSide, Decimal)>>,
        closes: StdMutex<Vec<(u64, Option<Decimal>)>>,
        modifies: StdMutex<Vec<(u64, Option<f64>)>>,
    }

    #[async_trait]
    impl BrokerApi for RecordingBroker {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn open_position(
            &self,
            symbol: &str,
            side: OrderSide,
            lot_size: Decimal,
            _sl: Option<f64>,
            _tp: Option<f64>,
            _comment: Option<String>,
            _magic: Option<i64>,
        ) -> Result<OpenResult> {
            self.opens
                .lock()
                .unwrap()
                .push((symbol.to_string(), side, lot_size));
            Ok(OpenResult {
                ticket: 99,
                open_price: 1.1,
            })
        }
        async fn close_position(&self, ticket: u64, volume: Option<Decimal>) -> Result<()> {
            self.closes.lock().unwrap().push((ticket, volume));
            Ok(())
        }
        async fn close_all_positions(&self) -> Result<()> {
            Ok(())
        }
        async fn modify_position(
            &self,
            ticket: u64,
            sl: Option<f64>,
            _tp: Option<f64>,
        ) -> Result<()> {
            self.modifies.lock().unwrap().push((ticket, sl));
            Ok(())
        }
        async fn positions(&self) -> Result<Vec<Position>> {
            Ok(Vec::new())
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

    fn signal() -> TradeSignal {
        TradeSignal {
            strategy_id: "s1".to_string(),
            symbol: "EURUSD".to_string(),
            action: TradeAction::Buy,
            confidence: 80,
            reasons: Vec::new(),
            volume: dec!(0.10),
            stop_loss: Some(1.0950),
            take_profit: Some(1.1100),
            magic: 1001,
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_open_reaches_broker() {
        let broker = Arc::new(RecordingBroker::default());
        let dispatcher = OrderDispatcher::new(
            broker.clone(),
            None,
            EventBus::new(),
            Arc::new(AtomicBool::new(false)),
        );
        let open = dispatcher.open(&signal()).await.unwrap();
        assert_eq!(open.ticket, 99);
        assert_eq!(broker.opens.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_emergency_blocks_open_but_not_close() {
        let broker = Arc::new(RecordingBroker::default());
        let emergency = Arc::new(AtomicBool::new(true));
        let dispatcher =
            OrderDispatcher::new(broker.clone(), None, EventBus::new(), emergency);

        assert!(dispatcher.open(&signal()).await.is_err());
        assert!(broker.opens.lock().unwrap().is_empty());

        dispatcher
            .apply_exit(ExitAction::Close {
                ticket: 5,
                volume: None,
                reason: "flatten".to_string(),
            })
            .await;
        assert_eq!(broker.closes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hold_signal_cannot_open() {
        let broker = Arc::new(RecordingBroker::default());
        let dispatcher = OrderDispatcher::new(
            broker,
            None,
            EventBus::new(),
            Arc::new(AtomicBool::new(false)),
        );
        let mut s = signal();
        s.action = TradeAction::Hold;
        assert!(dispatcher.open(&s).await.is_err());
    }

    #[tokio::test]
    async fn test_exit_consumer_applies_modify() {
        let broker = Arc::new(RecordingBroker::default());
        let dispatcher = OrderDispatcher::new(
            broker.clone(),
            None,
            EventBus::new(),
            Arc::new(AtomicBool::new(false)),
        );
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(dispatcher.clone().run_exit_consumer(rx));
        tx.send(ExitAction::Modify {
            ticket: 7,
            new_sl: 1.1,
            reason: "trail".to_string(),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();
        assert_eq!(broker.modifies.lock().unwrap().len(), 1);
    }
}
