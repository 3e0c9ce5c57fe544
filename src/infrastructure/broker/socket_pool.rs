//! Pooled request/reply client for the broker terminal.
//!
//! The executor is the TCP client. A fixed number of sockets share one
//! pending-request table; responses correlate by `requestId`, so ordering
//! across sockets does not matter. Sockets reconnect forever — the broker
//! link is the one transport that never gives up while the process lives.

use crate::domain::errors::ExecutorError;
use crate::domain::types::{AccountInfo, Bar, OrderSide, Position, SymbolInfo, Timeframe};
use crate::infrastructure::broker::protocol::{
    BrokerCommand, BrokerResponse, OpenResult, WireAccountInfo, WireBar, WirePosition,
    WireSymbolInfo,
};
use crate::infrastructure::connection::{BackoffPolicy, ConnectionTracker};
use crate::infrastructure::event_bus::EventBus;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

pub const DEFAULT_POOL_SIZE: usize = 3;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Cadence of the PING retry task while the terminal is unreachable.
const PING_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Typed access to the broker terminal. The pool implements this; tests
/// substitute mocks.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    async fn ping(&self) -> Result<()>;
    async fn open_position(
        &self,
        symbol: &str,
        side: OrderSide,
        lot_size: Decimal,
        sl: Option<f64>,
        tp: Option<f64>,
        comment: Option<String>,
        magic: Option<i64>,
    ) -> Result<OpenResult>;
    async fn close_position(&self, ticket: u64, volume: Option<Decimal>) -> Result<()>;
    async fn close_all_positions(&self) -> Result<()>;
    async fn modify_position(&self, ticket: u64, sl: Option<f64>, tp: Option<f64>) -> Result<()>;
    async fn positions(&self) -> Result<Vec<Position>>;
    async fn account_info(&self) -> Result<AccountInfo>;
    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo>;
    async fn market_data(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>>;
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<BrokerResponse>>>>;

pub struct BrokerSocketPool {
    host: String,
    port: u16,
    request_timeout: Duration,
    next_request_id: AtomicU64,
    next_socket: AtomicUsize,
    writers: Vec<mpsc::Sender<String>>,
    pending: PendingMap,
    tracker: Arc<ConnectionTracker>,
    is_retrying: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    generation_tx: watch::Sender<u64>,
}

impl BrokerSocketPool {
    pub fn new(host: &str, port: u16, pool_size: usize, events: EventBus) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let (generation_tx, _) = watch::channel(0u64);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let tracker = Arc::new(ConnectionTracker::new(
            "broker-socket",
            BackoffPolicy::transport(),
            None, // live-trading requirement: reconnect forever
            events,
        ));

        let mut writers = Vec::with_capacity(pool_size);
        let pool_size = pool_size.max(1);
        for index in 0..pool_size {
            let (tx, rx) = mpsc::channel::<String>(64);
            writers.push(tx);
            tokio::spawn(Self::run_socket(
                index,
                host.to_string(),
                port,
                rx,
                Arc::clone(&pending),
                Arc::clone(&tracker),
                shutdown_tx.subscribe(),
                generation_tx.subscribe(),
            ));
        }

        Arc::new(Self {
            host: host.to_string(),
            port,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            next_request_id: AtomicU64::new(1),
            next_socket: AtomicUsize::new(0),
            writers,
            pending,
            tracker,
            is_retrying: AtomicBool::new(false),
            shutdown_tx,
            generation_tx,
        })
    }

    pub fn tracker(&self) -> Arc<ConnectionTracker> {
        Arc::clone(&self.tracker)
    }

    pub async fn is_connected(&self) -> bool {
        self.tracker.is_connected().await
    }

    /// Establish the transport: PING once, and only on an OK reply mark
    /// Connected. On failure a dedicated retry task re-PINGs every 10s
    /// until the terminal answers; the `is_retrying` flag prevents
    /// duplicate retry tasks.
    pub async fn establish(self: Arc<Self>) {
        match self.ping().await {
            Ok(()) => {
                self.tracker.on_connected().await;
                info!("Broker pool: PING OK on {}:{}", self.host, self.port);
            }
            Err(e) => {
                warn!("Broker pool: initial PING failed: {}", e);
                Self::spawn_ping_retry(&self);
            }
        }
    }

    fn spawn_ping_retry(pool: &Arc<Self>) {
        if pool.is_retrying.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = Arc::clone(pool);
        tokio::spawn(async move {
            let mut attempt = 0u64;
            loop {
                tokio::time::sleep(PING_RETRY_INTERVAL).await;
                if *pool.shutdown_tx.borrow() {
                    break;
                }
                attempt += 1;
                match pool.ping().await {
                    Ok(()) => {
                        pool.tracker.on_connected().await;
                        info!("Broker pool: PING recovered after {} retries", attempt);
                        break;
                    }
                    Err(e) => {
                        info!("Broker pool: PING retry {} failed: {}", attempt, e);
                    }
                }
            }
            pool.is_retrying.store(false, Ordering::SeqCst);
        });
    }

    /// Close every socket and restart the state machine immediately.
    pub async fn force_reconnect(self: Arc<Self>) {
        info!("Broker pool: force reconnect");
        self.tracker.reset().await;
        let generation = *self.generation_tx.borrow() + 1;
        let _ = self.generation_tx.send(generation);
        self.establish().await;
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Issue one request on the next socket (round-robin) and await its
    /// correlated response with an independent timeout.
    pub async fn request(&self, command: BrokerCommand) -> Result<BrokerResponse> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let frame = command.to_frame(request_id);
        let mut line = frame.to_string();
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        let index = self.next_socket.fetch_add(1, Ordering::SeqCst) % self.writers.len();
        if self.writers[index].send(line).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(ExecutorError::NotConnected("broker-socket".to_string()).into());
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&request_id);
                Err(ExecutorError::NotConnected("broker-socket".to_string()).into())
            }
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                Err(ExecutorError::RequestTimeout {
                    request_id,
                    timeout_ms: self.request_timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_socket(
        index: usize,
        host: String,
        port: u16,
        mut write_rx: mpsc::Receiver<String>,
        pending: PendingMap,
        tracker: Arc<ConnectionTracker>,
        mut shutdown_rx: watch::Receiver<bool>,
        mut generation_rx: watch::Receiver<u64>,
    ) {
        loop {
            if *shutdown_rx.borrow() {
                return;
            }
            tracker.on_connecting().await;
            let stream = tokio::select! {
                result = TcpStream::connect((host.as_str(), port)) => result,
                _ = shutdown_rx.changed() => return,
            };
            match stream {
                Ok(stream) => {
                    debug!("Broker socket #{}: TCP connected", index);
                    let forced = Self::serve_stream(
                        index,
                        stream,
                        &mut write_rx,
                        &pending,
                        &mut shutdown_rx,
                        &mut generation_rx,
                    )
                    .await;
                    if *shutdown_rx.borrow() {
                        return;
                    }
                    if forced {
                        // Force reconnect skips the backoff entirely.
                        continue;
                    }
                    warn!("Broker socket #{}: connection lost", index);
                }
                Err(e) => {
                    debug!("Broker socket #{}: connect failed: {}", index, e);
                }
            }
            // The delay is always Some for the broker transport.
            if let Some(delay) = tracker.on_failure().await {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => return,
                }
            }
        }
    }

    /// Serve one connection until it drops. Returns true when the exit was
    /// a force-reconnect request rather than a failure.
    async fn serve_stream(
        index: usize,
        stream: TcpStream,
        write_rx: &mut mpsc::Receiver<String>,
        pending: &PendingMap,
        shutdown_rx: &mut watch::Receiver<bool>,
        generation_rx: &mut watch::Receiver<u64>,
    ) -> bool {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        loop {
            tokio::select! {
                maybe_frame = write_rx.recv() => {
                    match maybe_frame {
                        Some(frame) => {
                            if let Err(e) = write_half.write_all(frame.as_bytes()).await {
                                error!("Broker socket #{}: write failed: {}", index, e);
                                return false;
                            }
                        }
                        None => return false, // pool dropped
                    }
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => Self::dispatch_response(pending, &line).await,
                        Ok(None) => return false, // EOF
                        Err(e) => {
                            error!("Broker socket #{}: read failed: {}", index, e);
                            return false;
                        }
                    }
                }
                _ = shutdown_rx.changed() => return false,
                _ = generation_rx.changed() => {
                    info!("Broker socket #{}: force reconnect requested", index);
                    return true;
                }
            }
        }
    }

    async fn dispatch_response(pending: &PendingMap, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<BrokerResponse>(line) {
            Ok(response) => {
                let waiter = pending.lock().await.remove(&response.request_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        // Late reply after timeout; the requester already gave up.
                        debug!("Broker response for unknown request {}", response.request_id);
                    }
                }
            }
            Err(e) => warn!("Malformed broker frame dropped: {} ({})", line, e),
        }
    }
}

#[async_trait]
impl BrokerApi for BrokerSocketPool {
    async fn ping(&self) -> Result<()> {
        let response = self.request(BrokerCommand::Ping).await?;
        if response.is_ok() {
            Ok(())
        } else {
            anyhow::bail!(
                "PING rejected: {}",
                response.error.unwrap_or_else(|| "no detail".to_string())
            )
        }
    }

    async fn open_position(
        &self,
        symbol: &str,
        side: OrderSide,
        lot_size: Decimal,
        sl: Option<f64>,
        tp: Option<f64>,
        comment: Option<String>,
        magic: Option<i64>,
    ) -> Result<OpenResult> {
        self.request(BrokerCommand::OpenPosition {
            symbol: symbol.to_string(),
            side,
            lot_size,
            sl,
            tp,
            comment,
            magic,
        })
        .await?
        .data_as()
        .context("OPEN_POSITION failed")
    }

    async fn close_position(&self, ticket: u64, volume: Option<Decimal>) -> Result<()> {
        let response = self
            .request(BrokerCommand::ClosePosition { ticket, volume })
            .await?;
        if response.is_ok() {
            Ok(())
        } else {
            anyhow::bail!(
                "CLOSE_POSITION {} rejected: {}",
                ticket,
                response.error.unwrap_or_default()
            )
        }
    }

    async fn close_all_positions(&self) -> Result<()> {
        let response = self.request(BrokerCommand::CloseAllPositions).await?;
        if response.is_ok() {
            Ok(())
        } else {
            anyhow::bail!(
                "CLOSE_ALL_POSITIONS rejected: {}",
                response.error.unwrap_or_default()
            )
        }
    }

    async fn modify_position(&self, ticket: u64, sl: Option<f64>, tp: Option<f64>) -> Result<()> {
        let response = self
            .request(BrokerCommand::ModifyPosition { ticket, sl, tp })
            .await?;
        if response.is_ok() {
            Ok(())
        } else {
            anyhow::bail!(
                "MODIFY_POSITION {} rejected: {}",
                ticket,
                response.error.unwrap_or_default()
            )
        }
    }

    async fn positions(&self) -> Result<Vec<Position>> {
        let wire: Vec<WirePosition> = self
            .request(BrokerCommand::GetPositions)
            .await?
            .data_as()
            .context("GET_POSITIONS failed")?;
        Ok(wire.into_iter().map(Position::from).collect())
    }

    async fn account_info(&self) -> Result<AccountInfo> {
        let wire: WireAccountInfo = self
            .request(BrokerCommand::GetAccountInfo)
            .await?
            .data_as()
            .context("GET_ACCOUNT_INFO failed")?;
        Ok(wire.into())
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        let wire: WireSymbolInfo = self
            .request(BrokerCommand::GetSymbolInfo {
                symbol: symbol.to_string(),
            })
            .await?
            .data_as()
            .context("GET_SYMBOL_INFO failed")?;
        Ok(wire.into())
    }

    async fn market_data(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>> {
        let wire: Vec<WireBar> = self
            .request(BrokerCommand::GetMarketData {
                symbol: symbol.to_string(),
                timeframe,
                count,
            })
            .await?
            .data_as()
            .context("GET_MARKET_DATA failed")?;
        Ok(wire.into_iter().map(Bar::from).collect())
    }
}
