//! System and executor metrics.
//!
//! All gauges use the `fx_executor_` prefix. Metrics feed two consumers:
//! the heartbeat metadata sent to the control plane, and the push-based
//! Prometheus text dump in the logs — no HTTP server, no open ports.

use prometheus::{
    CounterVec, Gauge, Opts, Registry, TextEncoder,
    core::{AtomicF64, GenericGauge},
};
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::{Disks, System};
use tracing::warn;

/// Command-queue counters shared with the command dispatcher.
#[derive(Default)]
pub struct CommandQueueStats {
    pub pending: AtomicU64,
    pub processing: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    total_execution_ms: AtomicU64,
}

impl CommandQueueStats {
    pub fn record_completed(&self, execution_ms: u64) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.total_execution_ms
            .fetch_add(execution_ms, Ordering::SeqCst);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn avg_execution_ms(&self) -> f64 {
        let completed = self.completed.load(Ordering::SeqCst);
        if completed == 0 {
            return 0.0;
        }
        self.total_execution_ms.load(Ordering::SeqCst) as f64 / completed as f64
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            pending: self.pending.load(Ordering::SeqCst),
            processing: self.processing.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            avg_execution_ms: self.avg_execution_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct QueueSnapshot {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub avg_execution_ms: f64,
}

/// One telemetry sample, embedded in the heartbeat metadata.
#[derive(Debug, Clone, Serialize, Default)]
pub struct TelemetrySample {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub disk_pct: f64,
    pub latency_ms: Option<f64>,
    pub queue: QueueSnapshot,
    pub active_strategies: usize,
    pub open_positions: usize,
    pub skipped_ticks: u64,
}

/// Prometheus registry with executor gauges.
pub struct Metrics {
    registry: Registry,
    pub cpu_pct: GenericGauge<AtomicF64>,
    pub memory_pct: GenericGauge<AtomicF64>,
    pub disk_pct: GenericGauge<AtomicF64>,
    pub latency_ms: GenericGauge<AtomicF64>,
    pub open_positions: GenericGauge<AtomicF64>,
    pub active_strategies: GenericGauge<AtomicF64>,
    pub commands_total: CounterVec,
    pub heartbeats_total: CounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let cpu_pct = Gauge::with_opts(Opts::new("fx_executor_cpu_pct", "Host CPU usage"))?;
        registry.register(Box::new(cpu_pct.clone()))?;

        let memory_pct =
            Gauge::with_opts(Opts::new("fx_executor_memory_pct", "Host memory usage"))?;
        registry.register(Box::new(memory_pct.clone()))?;

        let disk_pct = Gauge::with_opts(Opts::new("fx_executor_disk_pct", "Host disk usage"))?;
        registry.register(Box::new(disk_pct.clone()))?;

        let latency_ms = Gauge::with_opts(Opts::new(
            "fx_executor_latency_ms",
            "Control plane round trip",
        ))?;
        registry.register(Box::new(latency_ms.clone()))?;

        let open_positions = Gauge::with_opts(Opts::new(
            "fx_executor_open_positions",
            "Open positions in the registry",
        ))?;
        registry.register(Box::new(open_positions.clone()))?;

        let active_strategies = Gauge::with_opts(Opts::new(
            "fx_executor_active_strategies",
            "Loaded strategy count",
        ))?;
        registry.register(Box::new(active_strategies.clone()))?;

        let commands_total = CounterVec::new(
            Opts::new("fx_executor_commands_total", "Commands by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(commands_total.clone()))?;

        let heartbeats_total = CounterVec::new(
            Opts::new("fx_executor_heartbeats_total", "Heartbeats by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(heartbeats_total.clone()))?;

        Ok(Self {
            registry,
            cpu_pct,
            memory_pct,
            disk_pct,
            latency_ms,
            open_positions,
            active_strategies,
            commands_total,
            heartbeats_total,
        })
    }

    /// Prometheus text format, pushed into the logs.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

/// Samples the host through sysinfo and mirrors into the gauges.
pub struct MetricsCollector {
    system: Mutex<System>,
    pub metrics: Metrics,
    /// Shared with the command dispatcher, which owns the updates.
    pub queue: std::sync::Arc<CommandQueueStats>,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            system: Mutex::new(System::new_all()),
            metrics: Metrics::new()?,
            queue: std::sync::Arc::new(CommandQueueStats::default()),
        })
    }

    /// One sample; cheap enough for the 60s heartbeat cadence.
    pub fn sample(
        &self,
        latency_ms: Option<f64>,
        active_strategies: usize,
        open_positions: usize,
        skipped_ticks: u64,
    ) -> TelemetrySample {
        let (cpu_pct, memory_pct) = {
            let mut system = self.system.lock().expect("metrics poisoned");
            system.refresh_cpu();
            system.refresh_memory();
            let cpu = f64::from(system.global_cpu_info().cpu_usage());
            let memory = if system.total_memory() > 0 {
                system.used_memory() as f64 / system.total_memory() as f64 * 100.0
            } else {
                0.0
            };
            (cpu, memory)
        };

        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks
            .iter()
            .fold((0u64, 0u64), |(t, a), d| {
                (t + d.total_space(), a + d.available_space())
            });
        let disk_pct = if total > 0 {
            (total - available) as f64 / total as f64 * 100.0
        } else {
            warn!("No disks visible to sysinfo");
            0.0
        };

        self.metrics.cpu_pct.set(cpu_pct);
        self.metrics.memory_pct.set(memory_pct);
        self.metrics.disk_pct.set(disk_pct);
        if let Some(latency) = latency_ms {
            self.metrics.latency_ms.set(latency);
        }
        self.metrics.open_positions.set(open_positions as f64);
        self.metrics.active_strategies.set(active_strategies as f64);

        TelemetrySample {
            cpu_pct,
            memory_pct,
            disk_pct,
            latency_ms,
            queue: self.queue.snapshot(),
            active_strategies,
            open_positions,
            skipped_ticks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_stats_average() {
        let stats = CommandQueueStats::default();
        assert_eq!(stats.avg_execution_ms(), 0.0);
        stats.record_completed(100);
        stats.record_completed(300);
        assert!((stats.avg_execution_ms() - 200.0).abs() < 1e-9);
        stats.record_failed();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.completed, 2);
        assert_eq!(snapshot.failed, 1);
    }

    #[test]
    fn test_metrics_encode_contains_prefix() {
        let metrics = Metrics::new().unwrap();
        metrics.cpu_pct.set(42.0);
        let text = metrics.encode();
        assert!(text.contains("fx_executor_cpu_pct"));
    }

    #[test]
    fn test_collector_sample_is_bounded() {
        let collector = MetricsCollector::new().unwrap();
        let sample = collector.sample(Some(12.0), 2, 3, 1);
        assert!(sample.memory_pct >= 0.0 && sample.memory_pct <= 100.0);
        assert!(sample.disk_pct >= 0.0 && sample.disk_pct <= 100.0);
        assert_eq!(sample.active_strategies, 2);
        assert_eq!(sample.open_positions, 3);
    }
}
