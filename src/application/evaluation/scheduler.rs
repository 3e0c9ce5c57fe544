//! Per-strategy evaluation scheduling.
//!
//! One task per active strategy ticks at the timeframe interval. Ticks
//! never overlap: a tick that arrives while the previous one still runs is
//! dropped and counted. Symbols inside a tick run concurrently under the
//! global semaphore, each with its own timeout.

use crate::application::evaluation::evaluator::{EvaluationOutcome, StrategyEvaluator};
use crate::application::positions::{OrderDispatcher, PositionRegistry};
use crate::application::risk::{AccountState, RiskGatekeeper};
use crate::application::state::ExecutorState;
use crate::domain::errors::ExecutorError;
use crate::domain::events::ExecutorEvent;
use crate::domain::strategy::{Strategy, StrategyStatus};
use crate::domain::types::TradeAction;
use crate::infrastructure::broker::BrokerApi;
use crate::infrastructure::event_bus::EventBus;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Global cap on concurrently evaluated symbols: twice the CPU count,
/// clamped to 1..50.
pub fn default_concurrency() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (cpus * 2).clamp(1, 50)
}

struct StrategyHandle {
    strategy: Arc<RwLock<Arc<Strategy>>>,
    cancel_tx: watch::Sender<bool>,
    paused: Arc<AtomicBool>,
    skipped_ticks: Arc<AtomicU64>,
    task: JoinHandle<()>,
    magic: i64,
}

pub struct EvaluationScheduler {
    evaluator: Arc<StrategyEvaluator>,
    gate: Arc<RiskGatekeeper>,
    dispatcher: Arc<OrderDispatcher>,
    registry: Arc<PositionRegistry>,
    broker: Arc<dyn BrokerApi>,
    state: Arc<ExecutorState>,
    semaphore: Arc<Semaphore>,
    evaluation_timeout: Duration,
    events: EventBus,
    strategies: RwLock<HashMap<String, StrategyHandle>>,
}

impl EvaluationScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        evaluator: Arc<StrategyEvaluator>,
        gate: Arc<RiskGatekeeper>,
        dispatcher: Arc<OrderDispatcher>,
        registry: Arc<PositionRegistry>,
        broker: Arc<dyn BrokerApi>,
        state: Arc<ExecutorState>,
        concurrency: usize,
        evaluation_timeout: Duration,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            evaluator,
            gate,
            dispatcher,
            registry,
            broker,
            state,
            semaphore: Arc::new(Semaphore::new(concurrency.clamp(1, 50))),
            evaluation_timeout,
            events,
            strategies: RwLock::new(HashMap::new()),
        })
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.strategies.read().await.keys().cloned().collect()
    }

    pub async fn strategy_count(&self) -> usize {
        self.strategies.read().await.len()
    }

    pub async fn total_skipped_ticks(&self) -> u64 {
        self.strategies
            .read()
            .await
            .values()
            .map(|h| h.skipped_ticks.load(Ordering::SeqCst))
            .sum()
    }

    /// Smart-exit specs by magic, snapshotted for the exit manager's tick.
    pub async fn smart_exit_specs(
        &self,
    ) -> HashMap<i64, (crate::domain::strategy::SmartExitSpec, crate::domain::types::Timeframe)>
    {
        let mut out = HashMap::new();
        for handle in self.strategies.read().await.values() {
            let strategy = handle.strategy.read().await;
            if let Some(spec) = &strategy.smart_exit {
                out.insert(handle.magic, (spec.clone(), strategy.timeframe));
            }
        }
        out
    }

    /// START_STRATEGY: validate, register the magic, begin the tick task.
    pub async fn start(self: Arc<Self>, strategy: Strategy) -> Result<()> {
        strategy
            .validate()
            .map_err(|e| anyhow::anyhow!("strategy rejected: {}", e))?;
        let id = strategy.id.clone();
        if self.strategies.read().await.contains_key(&id) {
            anyhow::bail!("strategy {} already running", id);
        }

        let magic = strategy.magic_number();
        self.registry.register_magic(magic).await;

        let shared = Arc::new(RwLock::new(Arc::new(strategy)));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let paused = Arc::new(AtomicBool::new(false));
        let skipped = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(Self::run_strategy(
            Arc::clone(&self),
            Arc::clone(&shared),
            cancel_rx,
            Arc::clone(&paused),
            Arc::clone(&skipped),
        ));

        info!("Strategy {} started (magic {})", id, magic);
        self.strategies.write().await.insert(
            id,
            StrategyHandle {
                strategy: shared,
                cancel_tx,
                paused,
                skipped_ticks: skipped,
                task,
                magic,
            },
        );
        Ok(())
    }

    /// STOP_STRATEGY: cancel the timer. Positions stay open unless the
    /// command says otherwise.
    pub async fn stop(&self, id: &str, close_positions: bool) -> Result<()> {
        let handle = self
            .strategies
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ExecutorError::StrategyNotFound(id.to_string()))?;
        let _ = handle.cancel_tx.send(true);
        handle.task.abort();
        self.registry.unregister_magic(handle.magic).await;

        if close_positions {
            let positions = self.registry.by_magic(handle.magic).await;
            if !positions.is_empty() {
                info!(
                    "Stopping {}: closing {} positions",
                    id,
                    positions.len()
                );
                self.dispatcher
                    .close_positions(&positions, "strategy stopped")
                    .await;
            }
        }
        info!("Strategy {} stopped", id);
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        let strategies = self.strategies.read().await;
        let handle = strategies
            .get(id)
            .ok_or_else(|| ExecutorError::StrategyNotFound(id.to_string()))?;
        handle.paused.store(true, Ordering::SeqCst);
        info!("Strategy {} paused", id);
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        let strategies = self.strategies.read().await;
        let handle = strategies
            .get(id)
            .ok_or_else(|| ExecutorError::StrategyNotFound(id.to_string()))?;
        handle.paused.store(false, Ordering::SeqCst);
        info!("Strategy {} resumed", id);
        Ok(())
    }

    /// UPDATE_STRATEGY: swap the config atomically; the next tick reads the
    /// new value.
    pub async fn update(&self, strategy: Strategy) -> Result<()> {
        strategy
            .validate()
            .map_err(|e| anyhow::anyhow!("strategy rejected: {}", e))?;
        let id = strategy.id.clone();
        let mut strategies = self.strategies.write().await;
        let handle = strategies
            .get_mut(&id)
            .ok_or_else(|| ExecutorError::StrategyNotFound(id.to_string()))?;

        let new_magic = strategy.magic_number();
        if new_magic != handle.magic {
            self.registry.unregister_magic(handle.magic).await;
            self.registry.register_magic(new_magic).await;
            handle.magic = new_magic;
        }
        *handle.strategy.write().await = Arc::new(strategy);
        info!("Strategy {} updated in place", id);
        Ok(())
    }

    /// Emergency stop: every strategy task is cancelled; the dispatcher is
    /// already blocked by the shared flag.
    pub async fn stop_all(&self) {
        let mut strategies = self.strategies.write().await;
        for (id, handle) in strategies.drain() {
            let _ = handle.cancel_tx.send(true);
            handle.task.abort();
            self.registry.unregister_magic(handle.magic).await;
            info!("Strategy {} cancelled", id);
        }
    }

    async fn run_strategy(
        scheduler: Arc<Self>,
        shared: Arc<RwLock<Arc<Strategy>>>,
        mut cancel_rx: watch::Receiver<bool>,
        paused: Arc<AtomicBool>,
        skipped: Arc<AtomicU64>,
    ) {
        let tick_seconds = shared.read().await.timeframe.seconds();
        let mut interval = tokio::time::interval(Duration::from_secs(tick_seconds));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let running = Arc::new(AtomicBool::new(false));

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = cancel_rx.changed() => return,
            }
            let strategy = Arc::clone(&*shared.read().await);
            if paused.load(Ordering::SeqCst)
                || strategy.status != StrategyStatus::Active
                || scheduler.state.is_emergency()
                || scheduler.registry.is_evaluation_paused()
            {
                continue;
            }
            if running.swap(true, Ordering::SeqCst) {
                // Previous tick still in flight; drop this one.
                let total = skipped.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "Strategy {}: tick dropped, previous still running ({} total)",
                    strategy.id, total
                );
                continue;
            }
            let scheduler = Arc::clone(&scheduler);
            let running = Arc::clone(&running);
            let cancel_rx = cancel_rx.clone();
            tokio::spawn(async move {
                scheduler.tick_once(strategy, cancel_rx).await;
                running.store(false, Ordering::SeqCst);
            });
        }
    }

    /// One full tick: evaluate every symbol, then act on the outcomes.
    async fn tick_once(self: Arc<Self>, strategy: Arc<Strategy>, cancel_rx: watch::Receiver<bool>) {
        let account = match self.broker.account_info().await {
            Ok(account) => account,
            Err(e) => {
                warn!("Tick skipped for {}: no account info ({})", strategy.id, e);
                return;
            }
        };
        self.state.observe_equity(account.equity);

        let mut joins = Vec::with_capacity(strategy.symbols.len());
        for symbol in &strategy.symbols {
            let scheduler = Arc::clone(&self);
            let strategy = Arc::clone(&strategy);
            let symbol = symbol.clone();
            let account = account.clone();
            joins.push(tokio::spawn(async move {
                let _permit = scheduler.semaphore.acquire().await.ok()?;
                let evaluation = scheduler.evaluator.evaluate_symbol(
                    &strategy,
                    &symbol,
                    &account,
                );
                match tokio::time::timeout(scheduler.evaluation_timeout, evaluation).await {
                    Ok(Ok(outcome)) => Some(outcome),
                    Ok(Err(e)) => {
                        error!("Evaluation error for {} {}: {}", strategy.id, symbol, e);
                        None
                    }
                    Err(_) => {
                        warn!(
                            "Evaluation of {} timed out after {:?}",
                            symbol, scheduler.evaluation_timeout
                        );
                        None
                    }
                }
            }));
        }

        let mut outcomes = Vec::new();
        for join in joins {
            if let Ok(Some(outcome)) = join.await {
                outcomes.push(outcome);
            }
        }

        // A cancel while evaluating discards the tick's signals.
        if *cancel_rx.borrow() {
            debug!("Strategy {} cancelled mid-tick, discarding signals", strategy.id);
            return;
        }

        for outcome in outcomes {
            self.act_on(&strategy, outcome, &account).await;
        }
    }

    async fn act_on(
        &self,
        strategy: &Strategy,
        outcome: EvaluationOutcome,
        account: &crate::domain::types::AccountInfo,
    ) {
        let Some(signal) = outcome.signal else {
            return;
        };
        self.events
            .publish(ExecutorEvent::SignalGenerated {
                strategy_id: outcome.strategy_id.clone(),
                symbol: outcome.symbol.clone(),
                action: outcome.action,
                confidence: outcome.confidence,
            })
            .await;

        match signal.action {
            TradeAction::Close => {
                let positions = self
                    .registry
                    .by_magic(signal.magic)
                    .await
                    .into_iter()
                    .filter(|p| p.symbol == signal.symbol)
                    .collect::<Vec<_>>();
                if !positions.is_empty() {
                    self.dispatcher
                        .close_positions(&positions, "exit conditions met")
                        .await;
                }
            }
            TradeAction::Buy | TradeAction::Sell => {
                if self.state.is_emergency() {
                    return;
                }
                let open_positions = self.registry.all().await;
                let symbol_info = self
                    .evaluator
                    .market_symbol_info(&signal.symbol)
                    .await;
                let report = self
                    .gate
                    .validate(
                        &signal,
                        account,
                        &open_positions,
                        AccountState {
                            daily_pnl: self.state.daily_pnl(),
                            starting_balance: self.state.starting_balance(),
                            peak_balance: self.state.peak_balance(),
                        },
                        symbol_info.as_ref(),
                    )
                    .await;
                if !report.approved {
                    debug!(
                        "Signal for {} {} rejected by risk gate",
                        strategy.id, signal.symbol
                    );
                    return;
                }
                if let Err(e) = self.dispatcher.open(&signal).await {
                    error!("Dispatch failed for {} {}: {}", strategy.id, signal.symbol, e);
                }
            }
            _ => {}
        }
    }
}
