//! The executor aggregate.
//!
//! Owns every component and all process-scoped state, spawns the long-lived
//! tasks (registry sync, heartbeat, command dispatch, smart exits, daily
//! reset), and routes push events. The binary builds one of these and calls
//! `start`.

use crate::application::commands::CommandDispatcher;
use crate::application::evaluation::{
    EvaluationScheduler, StrategyEvaluator, default_concurrency,
};
use crate::application::market_data::MarketDataClient;
use crate::application::positions::{
    OrderDispatcher, PositionRegistry, SYNC_INTERVAL, SmartExitManager,
};
use crate::application::risk::{CorrelationCache, RiskGatekeeper};
use crate::application::state::ExecutorState;
use crate::application::symbol_map::SymbolMapper;
use crate::application::telemetry::{
    AlertEngine, HeartbeatService, MetricsCollector, RecoveryRoutine, StrategyStats,
};
use crate::config::ExecutorConfig;
use crate::domain::events::{EventListener, ExecutorEvent, LoggingListener};
use crate::domain::risk_limits::{AccountKind, RiskLimits};
use crate::indicators::cache::IndicatorCache;
use crate::infrastructure::broker::{BrokerApi, BrokerPushServer, BrokerSocketPool};
use crate::infrastructure::control_plane::{
    ControlPlaneClient, PendingCommand, PushChannel, PushEvent,
};
use crate::infrastructure::event_bus::EventBus;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::TimeZone;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{info, warn};

/// Realized PnL feeds the daily counter as positions close.
struct PnlTracker {
    state: Arc<ExecutorState>,
}

impl EventListener for PnlTracker {
    fn on_event(&self, event: &ExecutorEvent) {
        if let ExecutorEvent::PositionClosed { profit, .. } = event {
            self.state.add_realized_pnl(*profit);
        }
    }
}

#[async_trait]
impl StrategyStats for EvaluationScheduler {
    async fn active_strategies(&self) -> usize {
        self.strategy_count().await
    }

    async fn skipped_ticks(&self) -> u64 {
        self.total_skipped_ticks().await
    }
}

struct ExecutorRecovery {
    pool: Arc<BrokerSocketPool>,
    market: Arc<MarketDataClient>,
    cache: Arc<IndicatorCache>,
    push_restart: Option<Arc<Notify>>,
    auto_reconnect: bool,
}

#[async_trait]
impl RecoveryRoutine for ExecutorRecovery {
    async fn recover(&self) {
        warn!("Recovery routine: dropping caches");
        self.market.clear_cache().await;
        self.cache.clear();
        if !self.auto_reconnect {
            warn!("auto_reconnect disabled; transports left for the operator");
            return;
        }
        if let Some(restart) = &self.push_restart {
            restart.notify_one();
        }
        Arc::clone(&self.pool).force_reconnect().await;
    }
}

pub struct Executor {
    config: ExecutorConfig,
    state: Arc<ExecutorState>,
    events: EventBus,
    pool: Arc<BrokerSocketPool>,
    push_server: Arc<BrokerPushServer>,
    control: Arc<ControlPlaneClient>,
    push_channel: tokio::sync::Mutex<Option<PushChannel>>,
    registry: Arc<PositionRegistry>,
    market: Arc<MarketDataClient>,
    gate: Arc<RiskGatekeeper>,
    scheduler: Arc<EvaluationScheduler>,
    orders: Arc<OrderDispatcher>,
    commands: Arc<CommandDispatcher>,
    heartbeat: Arc<HeartbeatService>,
    exit_manager: Arc<SmartExitManager>,
    exit_actions_rx:
        tokio::sync::Mutex<Option<mpsc::Receiver<crate::application::positions::ExitAction>>>,
    commands_rx: tokio::sync::Mutex<Option<mpsc::Receiver<PendingCommand>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Executor {
    pub fn build(config: ExecutorConfig) -> Result<Arc<Self>> {
        let events = EventBus::new();
        let state = ExecutorState::new(Decimal::ZERO);

        let pool = BrokerSocketPool::new(
            &config.broker_host,
            config.broker_port,
            config.broker_pool_size,
            events.clone(),
        );
        let push_server = Arc::new(BrokerPushServer::new());
        let control = Arc::new(ControlPlaneClient::new(
            &config.platform_url,
            &config.executor_id,
            &config.api_key,
            &config.api_secret,
        ));

        let registry = PositionRegistry::new(events.clone());
        let market = Arc::new(MarketDataClient::new(
            Arc::clone(&pool) as Arc<dyn BrokerApi>,
            SymbolMapper::new(),
        ));
        let cache = Arc::new(IndicatorCache::default());
        let correlation = Arc::new(CorrelationCache::new());

        let gate = Arc::new(RiskGatekeeper::new(
            RiskLimits::preset(config.account_kind),
            Arc::clone(&correlation),
            None,
            events.clone(),
        ));
        let evaluator = Arc::new(StrategyEvaluator::new(
            Arc::clone(&market),
            Arc::clone(&cache),
            Arc::clone(&registry),
            correlation,
            None,
            config.account_kind,
        ));
        let orders = OrderDispatcher::new(
            Arc::clone(&pool) as Arc<dyn BrokerApi>,
            Some(Arc::clone(&control)),
            events.clone(),
            state.emergency_flag(),
        );
        let concurrency = config
            .max_concurrent_evaluations
            .unwrap_or_else(default_concurrency);
        let scheduler = EvaluationScheduler::new(
            Arc::clone(&evaluator),
            Arc::clone(&gate),
            Arc::clone(&orders),
            Arc::clone(&registry),
            Arc::clone(&pool) as Arc<dyn BrokerApi>,
            Arc::clone(&state),
            concurrency,
            config.evaluation_timeout,
            events.clone(),
        );

        let collector = Arc::new(MetricsCollector::new()?);
        let alerts = Arc::new(AlertEngine::new(None, Some(Arc::clone(&control))));

        let (exit_tx, exit_rx) = mpsc::channel(256);
        let exit_manager = Arc::new(SmartExitManager::new(Arc::clone(&registry), exit_tx));

        let (commands_tx, commands_rx) = mpsc::channel(256);
        let commands = CommandDispatcher::new(
            Arc::clone(&scheduler),
            Arc::clone(&orders),
            Arc::clone(&registry),
            Arc::clone(&state),
            Some(Arc::clone(&control)),
            events.clone(),
            Arc::clone(&collector.queue),
        );

        // Push channel is optional; without a key the heartbeat poll is the
        // only command path.
        let push_channel = if config.push_key.is_empty() {
            None
        } else {
            let url = PushChannel::gateway_url(&config.platform_url, &config.push_cluster)?;
            Some(PushChannel::new(
                url,
                &config.executor_id,
                &config.push_key,
                events.clone(),
            ))
        };
        let push_restart = push_channel.as_ref().map(|c| c.restart_handle());
        let push_tracker = push_channel.as_ref().map(|c| c.tracker());
        let push_outbound = push_channel.as_ref().map(|c| c.outbound());

        let recovery = Arc::new(ExecutorRecovery {
            pool: Arc::clone(&pool),
            market: Arc::clone(&market),
            cache,
            push_restart,
            auto_reconnect: config.auto_reconnect,
        });
        let heartbeat = HeartbeatService::new(
            Arc::clone(&control),
            push_outbound,
            push_tracker,
            Some(pool.tracker()),
            Arc::clone(&state),
            collector,
            Arc::clone(&registry),
            alerts,
            Some(Arc::clone(&gate)),
            recovery,
            commands_tx,
            events.clone(),
            config.heartbeat_interval,
            Arc::clone(&scheduler) as Arc<dyn StrategyStats>,
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            state,
            events,
            pool,
            push_server,
            control,
            push_channel: tokio::sync::Mutex::new(push_channel),
            registry,
            market,
            gate,
            scheduler,
            orders,
            commands,
            heartbeat,
            exit_manager,
            exit_actions_rx: tokio::sync::Mutex::new(Some(exit_rx)),
            commands_rx: tokio::sync::Mutex::new(Some(commands_rx)),
            shutdown_tx,
        }))
    }

    pub fn state(&self) -> Arc<ExecutorState> {
        Arc::clone(&self.state)
    }

    /// Bring every transport up and spawn the long-lived loops.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        self.events.subscribe(Arc::new(LoggingListener)).await;
        self.events
            .subscribe(Arc::new(PnlTracker {
                state: Arc::clone(&self.state),
            }))
            .await;

        if let Err(e) = self
            .control
            .register(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
            .await
        {
            warn!("Executor registration failed (continuing): {}", e);
        }
        let _ = self.control.update_status("online").await;

        // Broker transports.
        Arc::clone(&self.pool).establish().await;
        self.push_server
            .start("127.0.0.1", self.config.broker_push_port())
            .await
            .context("broker push server failed to start")?;

        // Seed balances from the first account snapshot.
        match self.pool.account_info().await {
            Ok(account) => {
                self.state.daily_reset(account.balance);
                self.state.observe_equity(account.equity);
                info!(
                    "Account snapshot: balance {} {}",
                    account.balance, account.currency
                );
            }
            Err(e) => warn!("No account snapshot yet: {}", e),
        }

        // Push channel and event routing.
        if let Some(channel) = self.push_channel.lock().await.as_mut() {
            let (push_events_tx, mut push_events_rx) = mpsc::channel(64);
            channel.start(push_events_tx);
            let executor = Arc::clone(&self);
            tokio::spawn(async move {
                while let Some(event) = push_events_rx.recv().await {
                    executor.route_push_event(event).await;
                }
            });
        }

        // Long-lived loops.
        let commands_rx = self
            .commands_rx
            .lock()
            .await
            .take()
            .context("executor started twice")?;
        tokio::spawn(Arc::clone(&self.commands).run(commands_rx, self.shutdown_tx.subscribe()));

        let exit_rx = self
            .exit_actions_rx
            .lock()
            .await
            .take()
            .context("executor started twice")?;
        tokio::spawn(Arc::clone(&self.orders).run_exit_consumer(exit_rx));

        tokio::spawn(Arc::clone(&self.registry).run_sync_loop(
            Arc::clone(&self.pool) as Arc<dyn BrokerApi>,
            self.shutdown_tx.subscribe(),
        ));
        tokio::spawn(Arc::clone(&self.heartbeat).run(self.shutdown_tx.subscribe()));

        // Smart exits ride the registry cadence.
        {
            let executor = Arc::clone(&self);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SYNC_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let specs = executor.scheduler.smart_exit_specs().await;
                            if !specs.is_empty() {
                                executor.exit_manager.tick(&specs, &executor.market).await;
                            }
                        }
                        _ = shutdown_rx.changed() => return,
                    }
                }
            });
        }

        // Daily reset at local midnight.
        {
            let executor = Arc::clone(&self);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    let wait = until_next_local_midnight();
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {
                            let balance = executor
                                .pool
                                .account_info()
                                .await
                                .map(|a| a.balance)
                                .unwrap_or_else(|_| executor.state.starting_balance());
                            executor.state.daily_reset(balance);
                            info!("Daily reset: counters zeroed, starting balance {}", balance);
                        }
                        _ = shutdown_rx.changed() => return,
                    }
                }
            });
        }

        info!(
            "Executor {} started ({:?} account)",
            self.config.executor_id, self.config.account_kind
        );
        Ok(())
    }

    async fn route_push_event(&self, event: PushEvent) {
        match event {
            PushEvent::CommandReceived(command) => {
                self.commands.process(command).await;
            }
            PushEvent::CommandCancel { command_id } => {
                self.commands.cancel(&command_id).await;
            }
            PushEvent::EmergencyStop { reason, initiator } => {
                self.commands
                    .emergency_stop(&reason, &initiator, false)
                    .await;
            }
            PushEvent::ConfigUpdate(config) => {
                info!("Executor config update received");
                if let Some(profile) = config.get("riskProfile").and_then(|v| v.as_str()) {
                    match profile {
                        "demo" => self.update_risk_profile(AccountKind::Demo),
                        "live" => self.update_risk_profile(AccountKind::Live),
                        other => warn!("Unknown risk profile '{}' ignored", other),
                    }
                }
            }
        }
    }

    fn update_risk_profile(&self, kind: AccountKind) {
        info!("Switching risk limits to {:?} preset", kind);
        self.gate.update_limits(RiskLimits::preset(kind));
    }

    /// Graceful shutdown: stop timers, close sockets, report offline.
    pub async fn shutdown(&self) {
        info!("Executor shutting down");
        let _ = self.shutdown_tx.send(true);
        self.scheduler.stop_all().await;
        if let Some(channel) = self.push_channel.lock().await.as_ref() {
            channel.shutdown();
        }
        self.push_server.shutdown();
        self.pool.shutdown();
        let _ = self.control.update_status("offline").await;
    }
}

/// Time until the next local midnight, DST-safe.
fn until_next_local_midnight() -> Duration {
    let now = chrono::Local::now();
    let tomorrow = (now + chrono::Duration::days(1)).date_naive();
    let midnight = tomorrow.and_hms_opt(0, 0, 0).expect("valid midnight");
    match chrono::Local.from_local_datetime(&midnight).earliest() {
        Some(next) => (next - now).to_std().unwrap_or(Duration::from_secs(3600)),
        None => Duration::from_secs(3600),
    }
}
