//! Alert rules over telemetry samples.
//!
//! Rules fire once per condition episode (deduplicated by rule key while
//! active), can be acknowledged, and are persisted through the storage
//! collaborator and pushed to the control plane.

use crate::application::telemetry::metrics::TelemetrySample;
use crate::infrastructure::control_plane::{AlertCategory, ControlPlaneClient};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub rule: String,
    pub message: String,
    pub category: String,
    pub raised_at: DateTime<Utc>,
    pub acknowledged: bool,
}

/// Storage collaborator; the executor only holds alerts in memory.
#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn persist(&self, alert: &Alert) -> Result<()>;
}

/// Extra inputs the sample alone cannot carry.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlertInputs {
    pub daily_loss_breached: bool,
    /// Failed / total commands over the last window, in percent.
    pub error_rate_pct: f64,
}

const MEMORY_LIMIT_PCT: f64 = 85.0;
const DISK_LIMIT_PCT: f64 = 80.0;
const CPU_LIMIT_PCT: f64 = 90.0;
const LATENCY_LIMIT_MS: f64 = 1000.0;
const ERROR_RATE_LIMIT_PCT: f64 = 5.0;

pub struct AlertEngine {
    active: Mutex<HashMap<String, Alert>>,
    store: Option<Arc<dyn AlertStore>>,
    control: Option<Arc<ControlPlaneClient>>,
}

impl AlertEngine {
    pub fn new(
        store: Option<Arc<dyn AlertStore>>,
        control: Option<Arc<ControlPlaneClient>>,
    ) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            store,
            control,
        }
    }

    fn rule_states(sample: &TelemetrySample, inputs: &AlertInputs) -> Vec<(&'static str, bool, String)> {
        vec![
            (
                "daily-loss",
                inputs.daily_loss_breached,
                "Daily loss limit breached".to_string(),
            ),
            (
                "memory",
                sample.memory_pct > MEMORY_LIMIT_PCT,
                format!("Memory at {:.1}%", sample.memory_pct),
            ),
            (
                "disk",
                sample.disk_pct > DISK_LIMIT_PCT,
                format!("Disk at {:.1}%", sample.disk_pct),
            ),
            (
                "cpu",
                sample.cpu_pct > CPU_LIMIT_PCT,
                format!("CPU at {:.1}%", sample.cpu_pct),
            ),
            (
                "latency",
                sample.latency_ms.map(|l| l > LATENCY_LIMIT_MS).unwrap_or(false),
                format!("Latency {:.0}ms", sample.latency_ms.unwrap_or(0.0)),
            ),
            (
                "error-rate",
                inputs.error_rate_pct > ERROR_RATE_LIMIT_PCT,
                format!("Command error rate {:.1}%", inputs.error_rate_pct),
            ),
        ]
    }

    /// Evaluate every rule; newly tripped rules produce alerts, cleared
    /// rules leave the active set so they can fire again later.
    pub async fn evaluate(&self, sample: &TelemetrySample, inputs: &AlertInputs) -> Vec<Alert> {
        let mut raised = Vec::new();
        {
            let mut active = self.active.lock().expect("alerts poisoned");
            for (rule, tripped, message) in Self::rule_states(sample, inputs) {
                if tripped {
                    if !active.contains_key(rule) {
                        let alert = Alert {
                            id: Uuid::new_v4(),
                            rule: rule.to_string(),
                            message,
                            category: "safety".to_string(),
                            raised_at: Utc::now(),
                            acknowledged: false,
                        };
                        active.insert(rule.to_string(), alert.clone());
                        raised.push(alert);
                    }
                } else {
                    active.remove(rule);
                }
            }
        }

        for alert in &raised {
            warn!("Alert [{}]: {}", alert.rule, alert.message);
            if let Some(store) = &self.store {
                if let Err(e) = store.persist(alert).await {
                    warn!("Alert persistence failed: {}", e);
                }
            }
            if let Some(control) = &self.control {
                let detail = serde_json::to_value(alert).unwrap_or_default();
                if let Err(e) = control
                    .report_alert(AlertCategory::Safety, &alert.message, detail)
                    .await
                {
                    warn!("Alert report failed: {}", e);
                }
            }
        }
        raised
    }

    pub fn acknowledge(&self, id: Uuid) -> bool {
        let mut active = self.active.lock().expect("alerts poisoned");
        for alert in active.values_mut() {
            if alert.id == id {
                alert.acknowledged = true;
                info!("Alert {} acknowledged", id);
                return true;
            }
        }
        false
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        self.active
            .lock()
            .expect("alerts poisoned")
            .values()
            .cloned()
            .collect()
    }
}
