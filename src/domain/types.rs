use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bar duration supported by the broker terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Seconds covered by one bar; also the evaluation tick interval.
    pub fn seconds(&self) -> u64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M5 => 300,
            Timeframe::M15 => 900,
            Timeframe::M30 => 1_800,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "M1" => Ok(Timeframe::M1),
            "M5" => Ok(Timeframe::M5),
            "M15" => Ok(Timeframe::M15),
            "M30" => Ok(Timeframe::M30),
            "H1" => Ok(Timeframe::H1),
            "H4" => Ok(Timeframe::H4),
            "D1" => Ok(Timeframe::D1),
            _ => anyhow::bail!("Invalid timeframe: {}", s),
        }
    }
}

/// One OHLCV candle as delivered by the broker terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub spread: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Outcome of one (strategy, symbol) evaluation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
    Hold,
    Close,
    Wait,
}

impl TradeAction {
    pub fn side(&self) -> Option<OrderSide> {
        match self {
            TradeAction::Buy => Some(OrderSide::Buy),
            TradeAction::Sell => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
            TradeAction::Hold => "HOLD",
            TradeAction::Close => "CLOSE",
            TradeAction::Wait => "WAIT",
        };
        write!(f, "{}", s)
    }
}

/// An open position as reconciled from the broker terminal.
///
/// `magic` tags the owning strategy; positions whose magic maps to no known
/// strategy are treated as external and never managed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: u64,
    pub symbol: String,
    pub side: OrderSide,
    /// Volume in lots.
    pub volume: Decimal,
    pub open_price: f64,
    pub current_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Unrealized profit in account currency.
    pub profit: Decimal,
    pub open_time: DateTime<Utc>,
    pub magic: i64,
    #[serde(default)]
    pub comment: String,
}

impl Position {
    /// Unrealized move in pips (signed by side).
    pub fn profit_pips(&self, point: f64) -> f64 {
        if point <= 0.0 {
            return 0.0;
        }
        let pip = point * 10.0;
        match self.side {
            OrderSide::Buy => (self.current_price - self.open_price) / pip,
            OrderSide::Sell => (self.open_price - self.current_price) / pip,
        }
    }
}

/// Broker account snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: Decimal,
    pub equity: Decimal,
    pub margin: Decimal,
    pub free_margin: Decimal,
    /// Margin level in percent; 0.0 when no margin is in use.
    pub margin_level: f64,
    pub profit: Decimal,
    pub currency: String,
    pub leverage: u32,
}

/// Per-symbol trading parameters from the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    /// Minimum price increment. One pip is 10 points for 5-digit quotes.
    pub point: f64,
    pub digits: u32,
    pub trade_allowed: bool,
    pub volume_min: f64,
    pub volume_max: f64,
    /// Account-currency value of one pip for one lot.
    pub pip_value: f64,
}

impl SymbolInfo {
    pub fn spread_pips(&self) -> f64 {
        if self.point <= 0.0 {
            return 0.0;
        }
        (self.ask - self.bid) / self.point / 10.0
    }
}

/// A fully sized trading signal ready for the risk gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub strategy_id: String,
    pub symbol: String,
    pub action: TradeAction,
    /// Share of entry conditions met, 0..=100.
    pub confidence: u8,
    pub reasons: Vec<String>,
    pub volume: Decimal,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub magic: i64,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_timeframe_tick_seconds() {
        assert_eq!(Timeframe::M1.seconds(), 60);
        assert_eq!(Timeframe::M5.seconds(), 300);
        assert_eq!(Timeframe::D1.seconds(), 86_400);
    }

    #[test]
    fn test_timeframe_parse_roundtrip() {
        for tf in ["M1", "M5", "M15", "M30", "H1", "H4", "D1"] {
            let parsed: Timeframe = tf.parse().unwrap();
            assert_eq!(parsed.as_str(), tf);
        }
        assert!("M2".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_profit_pips_by_side() {
        let mut pos = Position {
            ticket: 1,
            symbol: "EURUSD".to_string(),
            side: OrderSide::Buy,
            volume: dec!(0.10),
            open_price: 1.1000,
            current_price: 1.1050,
            stop_loss: 0.0,
            take_profit: 0.0,
            profit: dec!(50),
            open_time: Utc::now(),
            magic: 1001,
            comment: String::new(),
        };
        assert!((pos.profit_pips(0.00001) - 50.0).abs() < 1e-6);

        pos.side = OrderSide::Sell;
        assert!((pos.profit_pips(0.00001) + 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_spread_pips() {
        let info = SymbolInfo {
            symbol: "EURUSD".to_string(),
            bid: 1.10000,
            ask: 1.10012,
            point: 0.00001,
            digits: 5,
            trade_allowed: true,
            volume_min: 0.01,
            volume_max: 100.0,
            pip_value: 10.0,
        };
        assert!((info.spread_pips() - 1.2).abs() < 1e-9);
    }
}
