//! REST client for the control plane.
//!
//! Carries heartbeats, command results, trade reports, alerts and error
//! reports. Every request is authenticated with the API key/secret and
//! executor-id headers. Transient failures ride the retry middleware; the
//! caller only sees errors once retries are exhausted.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::debug;

/// Builds the shared HTTP client with retry middleware.
fn build_http_client() -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
    let client = Client::builder()
        .pool_max_idle_per_host(5)
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| Client::new());
    ClientBuilder::new(client)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build()
}

/// A command queued for this executor, as returned by the heartbeat or the
/// pending-commands poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingCommand {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatReply {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "pendingCommands", default)]
    pub pending_commands: Vec<PendingCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOutcome {
    Completed,
    Failed,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCategory {
    Safety,
    Security,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeOpenReport {
    pub ticket: u64,
    pub symbol: String,
    pub action: String,
    pub volume: f64,
    #[serde(rename = "openPrice")]
    pub open_price: f64,
    #[serde(rename = "stopLoss", skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(rename = "takeProfit", skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(rename = "strategyId")]
    pub strategy_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeCloseReport {
    pub profit: f64,
    #[serde(rename = "closePrice", skip_serializing_if = "Option::is_none")]
    pub close_price: Option<f64>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmConsultRequest {
    #[serde(rename = "strategyId")]
    pub strategy_id: String,
    pub query: String,
    pub context: Value,
    #[serde(rename = "taskType")]
    pub task_type: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConsultReply {
    pub id: String,
    pub response: String,
    /// proceed | skip | modify | hedge
    pub decision: String,
}

pub struct ControlPlaneClient {
    http: ClientWithMiddleware,
    base_url: String,
    executor_id: String,
    api_key: String,
    api_secret: String,
}

impl ControlPlaneClient {
    pub fn new(base_url: &str, executor_id: &str, api_key: &str, api_secret: &str) -> Self {
        Self {
            http: build_http_client(),
            base_url: base_url.trim_end_matches('/').to_string(),
            executor_id: executor_id.to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(
        &self,
        req: reqwest_middleware::RequestBuilder,
    ) -> reqwest_middleware::RequestBuilder {
        req.header("X-API-Key", &self.api_key)
            .header("X-API-Secret", &self.api_secret)
            .header("X-Executor-Id", &self.executor_id)
    }

    /// POST /api/executor/{id}/heartbeat. The reply may carry queued
    /// commands, which doubles as the pending-command poll.
    pub async fn heartbeat(&self, metadata: Value) -> Result<HeartbeatReply> {
        let url = self.url(&format!("/api/executor/{}/heartbeat", self.executor_id));
        let body = json!({ "status": "online", "metadata": metadata });
        let response = self
            .authed(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .context("heartbeat request failed")?
            .error_for_status()
            .context("heartbeat rejected")?;
        response.json().await.context("malformed heartbeat reply")
    }

    /// PATCH /api/executor/{id}/command.
    pub async fn report_command_result(
        &self,
        command_id: &str,
        outcome: CommandOutcome,
        result: Value,
    ) -> Result<()> {
        let url = self.url(&format!("/api/executor/{}/command", self.executor_id));
        let body = json!({
            "commandId": command_id,
            "status": outcome,
            "result": result,
            "timestamp": Utc::now(),
        });
        self.authed(self.http.patch(&url))
            .json(&body)
            .send()
            .await
            .context("command result request failed")?
            .error_for_status()
            .context("command result rejected")?;
        Ok(())
    }

    /// GET /api/executor/{id}/commands/pending.
    pub async fn pending_commands(&self) -> Result<Vec<PendingCommand>> {
        let url = self.url(&format!("/api/executor/{}/commands/pending", self.executor_id));
        let response = self
            .authed(self.http.get(&url))
            .send()
            .await
            .context("pending commands request failed")?
            .error_for_status()?;
        response
            .json()
            .await
            .context("malformed pending commands reply")
    }

    /// POST /api/trades.
    pub async fn report_trade_open(&self, report: &TradeOpenReport) -> Result<()> {
        let url = self.url("/api/trades");
        self.authed(self.http.post(&url))
            .json(report)
            .send()
            .await
            .context("trade open report failed")?
            .error_for_status()?;
        Ok(())
    }

    /// PATCH /api/trades/{ticket}. Sent even when the close failed so the
    /// control plane records the attempt.
    pub async fn report_trade_close(&self, ticket: u64, report: &TradeCloseReport) -> Result<()> {
        let url = self.url(&format!("/api/trades/{}", ticket));
        self.authed(self.http.patch(&url))
            .json(report)
            .send()
            .await
            .context("trade close report failed")?
            .error_for_status()?;
        Ok(())
    }

    /// POST /api/alerts.
    pub async fn report_alert(
        &self,
        category: AlertCategory,
        title: &str,
        detail: Value,
    ) -> Result<()> {
        let url = self.url("/api/alerts");
        let body = json!({
            "category": category,
            "title": title,
            "detail": detail,
            "executorId": self.executor_id,
            "timestamp": Utc::now(),
        });
        self.authed(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .context("alert report failed")?
            .error_for_status()?;
        Ok(())
    }

    /// POST /api/errors/report.
    pub async fn report_error(&self, kind: &str, message: &str, context_data: Value) -> Result<()> {
        let url = self.url("/api/errors/report");
        let body = json!({
            "executorId": self.executor_id,
            "kind": kind,
            "message": message,
            "context": context_data,
            "timestamp": Utc::now(),
        });
        self.authed(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .context("error report failed")?
            .error_for_status()?;
        Ok(())
    }

    /// PATCH /api/executor/{id}: status update.
    pub async fn update_status(&self, status: &str) -> Result<()> {
        let url = self.url(&format!("/api/executor/{}", self.executor_id));
        self.authed(self.http.patch(&url))
            .json(&json!({ "status": status }))
            .send()
            .await
            .context("status update failed")?
            .error_for_status()?;
        Ok(())
    }

    /// GET /api/executor/{id}/ping, returning the round-trip latency.
    pub async fn ping(&self) -> Result<Duration> {
        let url = self.url(&format!("/api/executor/{}/ping", self.executor_id));
        let started = Instant::now();
        self.authed(self.http.get(&url))
            .send()
            .await
            .context("control plane ping failed")?
            .error_for_status()?;
        let latency = started.elapsed();
        debug!("Control plane ping: {:?}", latency);
        Ok(latency)
    }

    /// POST /api/executor/register.
    pub async fn register(&self, metadata: Value) -> Result<()> {
        let url = self.url("/api/executor/register");
        let body = json!({
            "executorId": self.executor_id,
            "metadata": metadata,
            "timestamp": Utc::now(),
        });
        self.authed(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .context("register failed")?
            .error_for_status()?;
        Ok(())
    }

    /// POST /api/executor/llm/consult. Collaborator contract only; nothing
    /// in the evaluation pipeline depends on it.
    pub async fn llm_consult(&self, request: &LlmConsultRequest) -> Result<LlmConsultReply> {
        let url = self.url("/api/executor/llm/consult");
        let response = self
            .authed(self.http.post(&url))
            .json(request)
            .send()
            .await
            .context("llm consult failed")?
            .error_for_status()?;
        response.json().await.context("malformed llm consult reply")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_strips_trailing_slash() {
        let client = ControlPlaneClient::new("https://cp.example.com/", "exec-1", "k", "s");
        assert_eq!(
            client.url("/api/trades"),
            "https://cp.example.com/api/trades"
        );
    }

    #[test]
    fn test_heartbeat_reply_parses_pending_commands() {
        let reply: HeartbeatReply = serde_json::from_value(json!({
            "status": "online",
            "pendingCommands": [
                {"id": "c1", "command": "START_STRATEGY", "parameters": {"strategy": {}}}
            ]
        }))
        .unwrap();
        assert_eq!(reply.pending_commands.len(), 1);
        assert_eq!(reply.pending_commands[0].command, "START_STRATEGY");
    }

    #[test]
    fn test_heartbeat_reply_defaults_empty() {
        let reply: HeartbeatReply = serde_json::from_value(json!({})).unwrap();
        assert!(reply.pending_commands.is_empty());
    }

    #[test]
    fn test_command_outcome_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(CommandOutcome::Completed).unwrap(),
            json!("completed")
        );
        assert_eq!(
            serde_json::to_value(AlertCategory::Safety).unwrap(),
            json!("safety")
        );
    }
}
