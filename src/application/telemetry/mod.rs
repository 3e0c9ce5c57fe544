pub mod alerts;
pub mod heartbeat;
pub mod metrics;

pub use alerts::{Alert, AlertEngine, AlertInputs, AlertStore};
pub use heartbeat::{HeartbeatService, RecoveryRoutine, StrategyStats};
pub use metrics::{CommandQueueStats, Metrics, MetricsCollector, TelemetrySample};
