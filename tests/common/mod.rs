//! Shared test doubles: a scriptable broker and strategy builders.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use fx_executor::domain::strategy::{
    Condition, ConditionOperator, Operand, SizingMethod, SizingSpec, StopLossSpec, StopMethod,
    Strategy, StrategyStatus, TakeProfitMethod, TakeProfitSpec,
};
use fx_executor::domain::types::{
    AccountInfo, Bar, OrderSide, Position, SymbolInfo, Timeframe,
};
use fx_executor::infrastructure::broker::protocol::OpenResult;
use fx_executor::infrastructure::broker::socket_pool::BrokerApi;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone)]
pub struct OpenRecord {
    pub symbol: String,
    pub side: OrderSide,
    pub lot_size: Decimal,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub magic: Option<i64>,
}

/// In-memory broker. Positions, account and bars are scriptable; every
/// order call is recorded.
pub struct MockBroker {
    pub opens: Mutex<Vec<OpenRecord>>,
    pub closes: Mutex<Vec<(u64, Option<Decimal>)>>,
    pub modifies: Mutex<Vec<(u64, Option<f64>, Option<f64>)>>,
    pub positions: Mutex<Vec<Position>>,
    pub account: Mutex<AccountInfo>,
    pub bars: Mutex<Vec<Bar>>,
    pub fail_positions: AtomicBool,
    next_ticket: Mutex<u64>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self {
            opens: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            modifies: Mutex::new(Vec::new()),
            positions: Mutex::new(Vec::new()),
            account: Mutex::new(AccountInfo {
                balance: dec!(10000),
                equity: dec!(10000),
                margin: dec!(0),
                free_margin: dec!(10000),
                margin_level: 0.0,
                profit: dec!(0),
                currency: "USD".to_string(),
                leverage: 100,
            }),
            bars: Mutex::new(rising_bars(250, 1.0950, 0.0001)),
            fail_positions: AtomicBool::new(false),
            next_ticket: Mutex::new(100),
        }
    }
}

#[async_trait]
impl BrokerApi for MockBroker {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn open_position(
        &self,
        symbol: &str,
        side: OrderSide,
        lot_size: Decimal,
        sl: Option<f64>,
        tp: Option<f64>,
        _comment: Option<String>,
        magic: Option<i64>,
    ) -> Result<OpenResult> {
        self.opens.lock().unwrap().push(OpenRecord {
            symbol: symbol.to_string(),
            side,
            lot_size,
            sl,
            tp,
            magic,
        });
        let mut ticket = self.next_ticket.lock().unwrap();
        *ticket += 1;
        Ok(OpenResult {
            ticket: *ticket,
            open_price: 1.1,
        })
    }

    async fn close_position(&self, ticket: u64, volume: Option<Decimal>) -> Result<()> {
        self.closes.lock().unwrap().push((ticket, volume));
        Ok(())
    }

    async fn close_all_positions(&self) -> Result<()> {
        self.positions.lock().unwrap().clear();
        Ok(())
    }

    async fn modify_position(&self, ticket: u64, sl: Option<f64>, tp: Option<f64>) -> Result<()> {
        self.modifies.lock().unwrap().push((ticket, sl, tp));
        Ok(())
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        if self.fail_positions.load(Ordering::SeqCst) {
            anyhow::bail!("positions unavailable");
        }
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn account_info(&self) -> Result<AccountInfo> {
        Ok(self.account.lock().unwrap().clone())
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        Ok(SymbolInfo {
            symbol: symbol.to_string(),
            bid: 1.10000,
            ask: 1.10010,
            point: 0.00001,
            digits: 5,
            trade_allowed: true,
            volume_min: 0.01,
            volume_max: 100.0,
            pip_value: 10.0,
        })
    }

    async fn market_data(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>> {
        let bars = self.bars.lock().unwrap().clone();
        let start = bars.len().saturating_sub(count);
        Ok(bars[start..].to_vec())
    }
}

pub fn rising_bars(n: usize, start: f64, step: f64) -> Vec<Bar> {
    (0..n)
        .map(|i| {
            let close = start + i as f64 * step;
            Bar {
                open_time: Utc.timestamp_opt(i as i64 * 300, 0).unwrap(),
                open: close - step,
                high: close + step,
                low: close - 2.0 * step,
                close,
                volume: 100.0,
                spread: 1.0,
            }
        })
        .collect()
}

pub fn open_position(ticket: u64, symbol: &str, magic: i64) -> Position {
    Position {
        ticket,
        symbol: symbol.to_string(),
        side: OrderSide::Buy,
        volume: dec!(1.00),
        open_price: 1.1000,
        current_price: 1.1050,
        stop_loss: 0.0,
        take_profit: 0.0,
        profit: dec!(50),
        open_time: Utc::now() - chrono::Duration::hours(1),
        magic,
        comment: String::new(),
    }
}

/// A strategy whose entry is always met on a rising series.
pub fn always_long_strategy(id: &str) -> Strategy {
    let mut params = BTreeMap::new();
    params.insert("period".to_string(), 5.0);
    Strategy {
        id: id.to_string(),
        name: format!("{} test", id),
        symbols: vec!["EURUSD".to_string()],
        timeframe: Timeframe::M5,
        entry_conditions: vec![Condition {
            indicator: "sma".to_string(),
            params,
            operator: ConditionOperator::Gt,
            operand: Operand::Value(0.0),
            shift: 0,
        }],
        entry_logic: Default::default(),
        exit_conditions: Vec::new(),
        exit_logic: Default::default(),
        filters: Vec::new(),
        stop_loss: Some(StopLossSpec {
            method: StopMethod::FixedPips(50.0),
            min_pips: None,
            max_pips: None,
        }),
        take_profit: Some(TakeProfitSpec {
            method: TakeProfitMethod::Ratio(2.0),
            min_pips: None,
            max_pips: None,
        }),
        sizing: SizingSpec {
            method: SizingMethod::FixedLot { size: 0.10 },
            min_lot: 0.01,
            max_lot: 10.0,
        },
        direction: Default::default(),
        correlation: None,
        regime: None,
        smart_exit: None,
        sessions: None,
        magic: Some(1001),
        status: StrategyStatus::Active,
    }
}
