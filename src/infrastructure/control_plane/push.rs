//! Push channel from the control plane.
//!
//! A TLS WebSocket carrying command and emergency events toward the
//! executor, plus optional client events back. Reconnects with the shared
//! backoff policy, capped at ten attempts; the REST heartbeat keeps working
//! without it, so exhaustion is survivable.

use crate::infrastructure::connection::{BackoffPolicy, ConnectionTracker};
use crate::infrastructure::control_plane::rest::PendingCommand;
use crate::infrastructure::event_bus::EventBus;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::{Notify, mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Inbound events the control plane can push.
#[derive(Debug, Clone)]
pub enum PushEvent {
    CommandReceived(PendingCommand),
    CommandCancel { command_id: String },
    EmergencyStop { reason: String, initiator: String },
    ConfigUpdate(Value),
}

const MAX_PUSH_RECONNECTS: u32 = 10;

pub struct PushChannel {
    url: Url,
    executor_id: String,
    push_key: String,
    tracker: Arc<ConnectionTracker>,
    outbound_tx: mpsc::Sender<Value>,
    outbound_rx: Option<mpsc::Receiver<Value>>,
    shutdown_tx: watch::Sender<bool>,
    restart_notify: Arc<Notify>,
}

impl PushChannel {
    /// `wss://push-{cluster}.{host}/executor` — the control plane's push
    /// gateway address derived from the configured cluster.
    pub fn gateway_url(platform_url: &str, cluster: &str) -> Result<Url> {
        let platform = Url::parse(platform_url).context("invalid platform url")?;
        let host = platform.host_str().context("platform url has no host")?;
        Url::parse(&format!("wss://push-{}.{}/executor", cluster, host))
            .context("invalid push gateway url")
    }

    pub fn new(url: Url, executor_id: &str, push_key: &str, events: EventBus) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            url,
            executor_id: executor_id.to_string(),
            push_key: push_key.to_string(),
            tracker: Arc::new(ConnectionTracker::new(
                "control-push",
                BackoffPolicy::transport(),
                Some(MAX_PUSH_RECONNECTS),
                events,
            )),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            shutdown_tx,
            restart_notify: Arc::new(Notify::new()),
        }
    }

    /// Handle the heartbeat recovery routine uses to restart the channel
    /// after the reconnect cap was exhausted.
    pub fn restart_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.restart_notify)
    }

    pub fn tracker(&self) -> Arc<ConnectionTracker> {
        Arc::clone(&self.tracker)
    }

    /// Sender for optional client events (e.g. `client-command-result`),
    /// also used as the heartbeat fallback path.
    pub fn outbound(&self) -> mpsc::Sender<Value> {
        self.outbound_tx.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Spawn the channel task, delivering inbound events to `events_tx`.
    pub fn start(&mut self, events_tx: mpsc::Sender<PushEvent>) {
        let url = self.url.clone();
        let executor_id = self.executor_id.clone();
        let push_key = self.push_key.clone();
        let tracker = Arc::clone(&self.tracker);
        let mut outbound_rx = self
            .outbound_rx
            .take()
            .expect("push channel started twice");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let restart_notify = Arc::clone(&self.restart_notify);

        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    return;
                }
                tracker.on_connecting().await;
                match connect_async(url.as_str()).await {
                    Ok((mut ws, _)) => {
                        let subscribe = json!({
                            "event": "subscribe",
                            "channel": format!("executor-{}", executor_id),
                            "key": push_key,
                        });
                        if ws
                            .send(Message::Text(subscribe.to_string().into()))
                            .await
                            .is_err()
                        {
                            warn!("Push channel: subscribe failed");
                        } else {
                            tracker.on_connected().await;
                            Self::serve(
                                &mut ws,
                                &events_tx,
                                &mut outbound_rx,
                                &mut shutdown_rx,
                            )
                            .await;
                            if *shutdown_rx.borrow() {
                                let _ = ws.close(None).await;
                                return;
                            }
                            warn!("Push channel: connection lost");
                        }
                    }
                    Err(e) => debug!("Push channel: connect failed: {}", e),
                }
                match tracker.on_failure().await {
                    Some(delay) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown_rx.changed() => return,
                        }
                    }
                    None => {
                        // Cap reached. Park until the recovery routine asks
                        // for a restart, then begin a fresh cycle.
                        tracker.on_disconnected().await;
                        tokio::select! {
                            _ = restart_notify.notified() => {
                                info!("Push channel: restart requested");
                                tracker.reset().await;
                            }
                            _ = shutdown_rx.changed() => return,
                        }
                    }
                }
            }
        });
    }

    async fn serve<S>(
        ws: &mut tokio_tungstenite::WebSocketStream<S>,
        events_tx: &mpsc::Sender<PushEvent>,
        outbound_rx: &mut mpsc::Receiver<Value>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                inbound = ws.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            match Self::parse_event(&text) {
                                Ok(Some(event)) => {
                                    if events_tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => warn!("Push channel: bad frame: {}", e),
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => return,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Push channel: read error: {}", e);
                            return;
                        }
                    }
                }
                client_event = outbound_rx.recv() => {
                    match client_event {
                        Some(value) => {
                            if ws.send(Message::Text(value.to_string().into())).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }
                _ = shutdown_rx.changed() => return,
            }
        }
    }

    /// Decode one inbound frame. Unknown events are ignored with a log so a
    /// newer control plane cannot wedge an older executor.
    fn parse_event(text: &str) -> Result<Option<PushEvent>> {
        let frame: Value = serde_json::from_str(text).context("frame is not JSON")?;
        let event = frame["event"].as_str().unwrap_or_default();
        let data = frame.get("data").cloned().unwrap_or(Value::Null);
        let parsed = match event {
            "command-received" => {
                let command: PendingCommand =
                    serde_json::from_value(data).context("bad command-received payload")?;
                Some(PushEvent::CommandReceived(command))
            }
            "command-cancel" => {
                let command_id = data["commandId"]
                    .as_str()
                    .context("command-cancel without commandId")?
                    .to_string();
                Some(PushEvent::CommandCancel { command_id })
            }
            "emergency-stop" => Some(PushEvent::EmergencyStop {
                reason: data["reason"].as_str().unwrap_or("unspecified").to_string(),
                initiator: data["initiator"].as_str().unwrap_or("unknown").to_string(),
            }),
            "executor-config-update" => Some(PushEvent::ConfigUpdate(data)),
            "" => None,
            other => {
                info!("Push channel: ignoring unknown event '{}'", other);
                None
            }
        };
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_url_from_cluster() {
        let url = PushChannel::gateway_url("https://platform.example.com/api", "eu1").unwrap();
        assert_eq!(url.as_str(), "wss://push-eu1.platform.example.com/executor");
    }

    #[test]
    fn test_parse_command_received() {
        let text = json!({
            "event": "command-received",
            "data": {"id": "c9", "command": "PAUSE_STRATEGY", "parameters": {"id": "s1"}}
        })
        .to_string();
        match PushChannel::parse_event(&text).unwrap() {
            Some(PushEvent::CommandReceived(cmd)) => {
                assert_eq!(cmd.id, "c9");
                assert_eq!(cmd.command, "PAUSE_STRATEGY");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_emergency_stop_defaults() {
        let text = json!({"event": "emergency-stop", "data": {}}).to_string();
        match PushChannel::parse_event(&text).unwrap() {
            Some(PushEvent::EmergencyStop { reason, initiator }) => {
                assert_eq!(reason, "unspecified");
                assert_eq!(initiator, "unknown");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_is_ignored() {
        let text = json!({"event": "confetti", "data": {}}).to_string();
        assert!(PushChannel::parse_event(&text).unwrap().is_none());
    }

    #[test]
    fn test_cancel_requires_command_id() {
        let text = json!({"event": "command-cancel", "data": {}}).to_string();
        assert!(PushChannel::parse_event(&text).is_err());
    }
}
