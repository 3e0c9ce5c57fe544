//! Listener for unsolicited broker messages.
//!
//! The terminal connects to `broker_port + 1` and streams account, quote
//! and heartbeat frames. Every frame is echoed with `{success:true}`;
//! unknown actions get `{success:false, error:"Unknown action"}`.

use crate::domain::types::AccountInfo;
use crate::infrastructure::broker::protocol::{PushFrame, WireAccountInfo, push_ack};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

/// Quote carried by a `market_data` push frame.
#[derive(Debug, Clone, Deserialize)]
pub struct PushQuote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    #[serde(default)]
    pub spread: f64,
}

#[derive(Default)]
struct PushState {
    account: Option<AccountInfo>,
    quotes: HashMap<String, PushQuote>,
    last_heartbeat: Option<DateTime<Utc>>,
}

/// Accepts broker-initiated connections and keeps the latest pushed state.
pub struct BrokerPushServer {
    state: Arc<RwLock<PushState>>,
    shutdown_tx: watch::Sender<bool>,
}

impl BrokerPushServer {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(RwLock::new(PushState::default())),
            shutdown_tx,
        }
    }

    /// Bind and start accepting. Returns the bound port (useful when 0 was
    /// requested by tests).
    pub async fn start(&self, host: &str, port: u16) -> Result<u16> {
        let listener = TcpListener::bind((host, port))
            .await
            .with_context(|| format!("push server bind failed on {}:{}", host, port))?;
        let bound = listener.local_addr()?.port();
        info!("Broker push server listening on {}:{}", host, bound);

        let state = Arc::clone(&self.state);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                debug!("Broker push connection from {}", peer);
                                let state = Arc::clone(&state);
                                let shutdown_rx = shutdown_rx.clone();
                                tokio::spawn(Self::serve(stream, state, shutdown_rx));
                            }
                            Err(e) => warn!("Push server accept failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => return,
                }
            }
        });
        Ok(bound)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn serve(
        stream: tokio::net::TcpStream,
        state: Arc<RwLock<PushState>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) if !line.trim().is_empty() => line,
                        Ok(Some(_)) => continue,
                        _ => return,
                    };
                    let ack = Self::handle_frame(&state, &line).await;
                    let mut out = ack.to_string();
                    out.push('\n');
                    if write_half.write_all(out.as_bytes()).await.is_err() {
                        return;
                    }
                }
                _ = shutdown_rx.changed() => return,
            }
        }
    }

    async fn handle_frame(state: &Arc<RwLock<PushState>>, line: &str) -> serde_json::Value {
        let frame: PushFrame = match serde_json::from_str(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Malformed push frame dropped: {}", e);
                return push_ack(false, Some("Malformed frame"));
            }
        };

        match frame.action.as_str() {
            "account_info" => {
                if let Some(data) = frame.data {
                    match serde_json::from_value::<WireAccountInfo>(data) {
                        Ok(wire) => {
                            state.write().await.account = Some(wire.into());
                        }
                        Err(e) => warn!("Bad account_info payload: {}", e),
                    }
                }
                push_ack(true, None)
            }
            "market_data" => {
                if let Some(data) = frame.data {
                    match serde_json::from_value::<PushQuote>(data) {
                        Ok(quote) => {
                            state
                                .write()
                                .await
                                .quotes
                                .insert(quote.symbol.clone(), quote);
                        }
                        Err(e) => warn!("Bad market_data payload: {}", e),
                    }
                }
                push_ack(true, None)
            }
            "heartbeat" => {
                state.write().await.last_heartbeat = Some(Utc::now());
                push_ack(true, None)
            }
            other => {
                warn!("Unknown push action: {}", other);
                push_ack(false, Some("Unknown action"))
            }
        }
    }

    pub async fn latest_account(&self) -> Option<AccountInfo> {
        self.state.read().await.account.clone()
    }

    pub async fn latest_quote(&self, symbol: &str) -> Option<PushQuote> {
        self.state.read().await.quotes.get(symbol).cloned()
    }

    pub async fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_heartbeat
    }
}

impl Default for BrokerPushServer {
    fn default() -> Self {
        Self::new()
    }
}
