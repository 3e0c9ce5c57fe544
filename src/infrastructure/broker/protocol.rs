//! JSON framing for the broker terminal request/reply socket.
//!
//! One JSON object per newline-terminated frame. Requests carry a monotonic
//! `requestId`; responses correlate by it.

use crate::domain::errors::ExecutorError;
use crate::domain::types::{AccountInfo, Bar, OrderSide, Position, SymbolInfo, Timeframe};
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Outbound broker command, rendered into `{command, parameters}`.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCommand {
    Ping,
    OpenPosition {
        symbol: String,
        side: OrderSide,
        lot_size: Decimal,
        sl: Option<f64>,
        tp: Option<f64>,
        comment: Option<String>,
        magic: Option<i64>,
    },
    ClosePosition {
        ticket: u64,
        volume: Option<Decimal>,
    },
    CloseAllPositions,
    ModifyPosition {
        ticket: u64,
        sl: Option<f64>,
        tp: Option<f64>,
    },
    GetPositions,
    GetAccountInfo,
    GetSymbolInfo {
        symbol: String,
    },
    GetMarketData {
        symbol: String,
        timeframe: Timeframe,
        count: usize,
    },
}

impl BrokerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            BrokerCommand::Ping => "PING",
            BrokerCommand::OpenPosition { .. } => "OPEN_POSITION",
            BrokerCommand::ClosePosition { .. } => "CLOSE_POSITION",
            BrokerCommand::CloseAllPositions => "CLOSE_ALL_POSITIONS",
            BrokerCommand::ModifyPosition { .. } => "MODIFY_POSITION",
            BrokerCommand::GetPositions => "GET_POSITIONS",
            BrokerCommand::GetAccountInfo => "GET_ACCOUNT_INFO",
            BrokerCommand::GetSymbolInfo { .. } => "GET_SYMBOL_INFO",
            BrokerCommand::GetMarketData { .. } => "GET_MARKET_DATA",
        }
    }

    pub fn parameters(&self) -> Option<Value> {
        match self {
            BrokerCommand::Ping
            | BrokerCommand::CloseAllPositions
            | BrokerCommand::GetPositions
            | BrokerCommand::GetAccountInfo => None,
            BrokerCommand::OpenPosition {
                symbol,
                side,
                lot_size,
                sl,
                tp,
                comment,
                magic,
            } => {
                let mut params = json!({
                    "symbol": symbol,
                    "action": side.to_string(),
                    "lotSize": lot_size.to_f64().unwrap_or(0.0),
                });
                if let Some(sl) = sl {
                    params["sl"] = json!(sl);
                }
                if let Some(tp) = tp {
                    params["tp"] = json!(tp);
                }
                if let Some(comment) = comment {
                    params["comment"] = json!(comment);
                }
                if let Some(magic) = magic {
                    params["magic"] = json!(magic);
                }
                Some(params)
            }
            BrokerCommand::ClosePosition { ticket, volume } => {
                let mut params = json!({ "ticket": ticket });
                if let Some(volume) = volume {
                    params["volume"] = json!(volume.to_f64().unwrap_or(0.0));
                }
                Some(params)
            }
            BrokerCommand::ModifyPosition { ticket, sl, tp } => {
                let mut params = json!({ "ticket": ticket });
                if let Some(sl) = sl {
                    params["sl"] = json!(sl);
                }
                if let Some(tp) = tp {
                    params["tp"] = json!(tp);
                }
                Some(params)
            }
            BrokerCommand::GetSymbolInfo { symbol } => Some(json!({ "symbol": symbol })),
            BrokerCommand::GetMarketData {
                symbol,
                timeframe,
                count,
            } => Some(json!({
                "symbol": symbol,
                "timeframe": timeframe.as_str(),
                "count": count,
            })),
        }
    }

    /// Full request frame.
    pub fn to_frame(&self, request_id: u64) -> Value {
        let mut frame = json!({
            "command": self.name(),
            "requestId": request_id,
            "timestamp": Utc::now().timestamp_millis(),
        });
        if let Some(params) = self.parameters() {
            frame["parameters"] = params;
        }
        frame
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerResponse {
    pub status: BrokerStatus,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(rename = "requestId")]
    pub request_id: u64,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(rename = "executionTime", default)]
    pub execution_time: Option<f64>,
}

impl BrokerResponse {
    pub fn is_ok(&self) -> bool {
        self.status == BrokerStatus::Ok
    }

    /// Deserialize the `data` payload, erroring on ERROR status or a
    /// missing body.
    pub fn data_as<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        if !self.is_ok() {
            return Err(ExecutorError::Broker {
                command: format!("request {}", self.request_id),
                message: self.error.unwrap_or_else(|| "no detail".to_string()),
            }
            .into());
        }
        let data = self
            .data
            .ok_or_else(|| ExecutorError::Protocol("response has no data payload".to_string()))?;
        serde_json::from_value(data)
            .map_err(|e| ExecutorError::Protocol(format!("malformed data payload: {}", e)).into())
    }
}

fn decimal(v: f64) -> Decimal {
    Decimal::from_f64(v).unwrap_or(Decimal::ZERO)
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Position record as the terminal serializes it.
#[derive(Debug, Clone, Deserialize)]
pub struct WirePosition {
    pub ticket: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub volume: f64,
    #[serde(rename = "openPrice")]
    pub open_price: f64,
    #[serde(rename = "currentPrice")]
    pub current_price: f64,
    #[serde(rename = "stopLoss", default)]
    pub stop_loss: f64,
    #[serde(rename = "takeProfit", default)]
    pub take_profit: f64,
    pub profit: f64,
    #[serde(rename = "openTime")]
    pub open_time: i64,
    #[serde(default)]
    pub magic: i64,
    #[serde(default)]
    pub comment: String,
}

impl From<WirePosition> for Position {
    fn from(w: WirePosition) -> Self {
        Position {
            ticket: w.ticket,
            symbol: w.symbol,
            side: w.side,
            volume: decimal(w.volume),
            open_price: w.open_price,
            current_price: w.current_price,
            stop_loss: w.stop_loss,
            take_profit: w.take_profit,
            profit: decimal(w.profit),
            open_time: timestamp(w.open_time),
            magic: w.magic,
            comment: w.comment,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireAccountInfo {
    pub balance: f64,
    pub equity: f64,
    pub margin: f64,
    #[serde(rename = "freeMargin")]
    pub free_margin: f64,
    #[serde(rename = "marginLevel", default)]
    pub margin_level: f64,
    #[serde(default)]
    pub profit: f64,
    pub currency: String,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
}

fn default_leverage() -> u32 {
    100
}

impl From<WireAccountInfo> for AccountInfo {
    fn from(w: WireAccountInfo) -> Self {
        AccountInfo {
            balance: decimal(w.balance),
            equity: decimal(w.equity),
            margin: decimal(w.margin),
            free_margin: decimal(w.free_margin),
            margin_level: w.margin_level,
            profit: decimal(w.profit),
            currency: w.currency,
            leverage: w.leverage,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireSymbolInfo {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub point: f64,
    pub digits: u32,
    #[serde(rename = "tradeAllowed", default = "default_trade_allowed")]
    pub trade_allowed: bool,
    #[serde(rename = "volumeMin", default = "default_volume_min")]
    pub volume_min: f64,
    #[serde(rename = "volumeMax", default = "default_volume_max")]
    pub volume_max: f64,
    #[serde(rename = "pipValue", default = "default_pip_value")]
    pub pip_value: f64,
}

fn default_trade_allowed() -> bool {
    true
}
fn default_volume_min() -> f64 {
    0.01
}
fn default_volume_max() -> f64 {
    100.0
}
fn default_pip_value() -> f64 {
    10.0
}

impl From<WireSymbolInfo> for SymbolInfo {
    fn from(w: WireSymbolInfo) -> Self {
        SymbolInfo {
            symbol: w.symbol,
            bid: w.bid,
            ask: w.ask,
            point: w.point,
            digits: w.digits,
            trade_allowed: w.trade_allowed,
            volume_min: w.volume_min,
            volume_max: w.volume_max,
            pip_value: w.pip_value,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireBar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub spread: f64,
}

impl From<WireBar> for Bar {
    fn from(w: WireBar) -> Self {
        Bar {
            open_time: timestamp(w.time),
            open: w.open,
            high: w.high,
            low: w.low,
            close: w.close,
            volume: w.volume,
            spread: w.spread,
        }
    }
}

/// Ticket payload returned by OPEN_POSITION.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenResult {
    pub ticket: u64,
    #[serde(rename = "openPrice", default)]
    pub open_price: f64,
}

/// Unsolicited frame arriving on the push server socket.
#[derive(Debug, Clone, Deserialize)]
pub struct PushFrame {
    pub action: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Echo sent back for every push frame.
pub fn push_ack(success: bool, error: Option<&str>) -> Value {
    match error {
        Some(e) => json!({ "success": success, "error": e }),
        None => json!({ "success": success }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_open_position_frame_shape() {
        let cmd = BrokerCommand::OpenPosition {
            symbol: "EURUSD".to_string(),
            side: OrderSide::Buy,
            lot_size: dec!(0.10),
            sl: Some(1.0950),
            tp: Some(1.1100),
            comment: Some("rsi-revert".to_string()),
            magic: Some(1001),
        };
        let frame = cmd.to_frame(7);
        assert_eq!(frame["command"], "OPEN_POSITION");
        assert_eq!(frame["requestId"], 7);
        assert_eq!(frame["parameters"]["symbol"], "EURUSD");
        assert_eq!(frame["parameters"]["action"], "BUY");
        assert!((frame["parameters"]["lotSize"].as_f64().unwrap() - 0.10).abs() < 1e-9);
        assert_eq!(frame["parameters"]["magic"], 1001);
    }

    #[test]
    fn test_ping_frame_has_no_parameters() {
        let frame = BrokerCommand::Ping.to_frame(1);
        assert_eq!(frame["command"], "PING");
        assert!(frame.get("parameters").is_none());
    }

    #[test]
    fn test_response_data_as_rejects_error_status() {
        let resp: BrokerResponse = serde_json::from_value(json!({
            "status": "ERROR",
            "error": "trade disabled",
            "requestId": 3,
            "timestamp": 0
        }))
        .unwrap();
        assert!(!resp.is_ok());
        assert!(resp.data_as::<Vec<WirePosition>>().is_err());
    }

    #[test]
    fn test_wire_position_converts() {
        let resp: BrokerResponse = serde_json::from_value(json!({
            "status": "OK",
            "requestId": 4,
            "timestamp": 0,
            "data": [{
                "ticket": 42,
                "symbol": "EURUSD",
                "side": "BUY",
                "volume": 0.2,
                "openPrice": 1.1,
                "currentPrice": 1.105,
                "profit": 10.0,
                "openTime": 1700000000,
                "magic": 9
            }]
        }))
        .unwrap();
        let positions: Vec<WirePosition> = resp.data_as().unwrap();
        let p: Position = positions.into_iter().next().unwrap().into();
        assert_eq!(p.ticket, 42);
        assert_eq!(p.volume, dec!(0.2));
        assert_eq!(p.magic, 9);
    }

    #[test]
    fn test_push_ack_shapes() {
        assert_eq!(push_ack(true, None), json!({"success": true}));
        assert_eq!(
            push_ack(false, Some("Unknown action")),
            json!({"success": false, "error": "Unknown action"})
        );
    }
}
