//! Executor configuration.
//!
//! Loaded from environment variables (with `.env` support through dotenvy
//! in the binary). The API secret arrives already decrypted — encrypting it
//! at rest is the job of the host shell's key-material service, not ours.

use crate::domain::risk_limits::AccountKind;
use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

impl FromStr for AccountKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "demo" => Ok(AccountKind::Demo),
            "live" => Ok(AccountKind::Live),
            _ => anyhow::bail!("Invalid ACCOUNT_KIND: {}. Must be 'demo' or 'live'", s),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub executor_id: String,
    pub api_key: String,
    pub api_secret: String,
    pub platform_url: String,
    pub push_key: String,
    pub push_cluster: String,
    pub broker_host: String,
    pub broker_port: u16,
    pub broker_pool_size: usize,
    pub heartbeat_interval: Duration,
    pub auto_reconnect: bool,
    pub account_kind: AccountKind,
    /// Cap on concurrently evaluated symbols; derived from CPU count when
    /// unset.
    pub max_concurrent_evaluations: Option<usize>,
    pub evaluation_timeout: Duration,
}

fn var(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("{} must be set", key))
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl ExecutorConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            executor_id: var("EXECUTOR_ID")?,
            api_key: var("EXECUTOR_API_KEY")?,
            api_secret: var("EXECUTOR_API_SECRET")?,
            platform_url: var("PLATFORM_URL")?,
            push_key: var_or("PUSH_KEY", ""),
            push_cluster: var_or("PUSH_CLUSTER", "eu1"),
            broker_host: var_or("BROKER_HOST", "127.0.0.1"),
            broker_port: var_or("BROKER_PORT", "9090")
                .parse()
                .context("BROKER_PORT must be a port number")?,
            broker_pool_size: var_or("BROKER_POOL_SIZE", "3")
                .parse()
                .context("BROKER_POOL_SIZE must be a number")?,
            heartbeat_interval: Duration::from_secs(
                var_or("HEARTBEAT_INTERVAL", "60")
                    .parse()
                    .context("HEARTBEAT_INTERVAL must be seconds")?,
            ),
            auto_reconnect: var_or("AUTO_RECONNECT", "true")
                .parse()
                .context("AUTO_RECONNECT must be true or false")?,
            account_kind: var_or("ACCOUNT_KIND", "demo").parse()?,
            max_concurrent_evaluations: env::var("MAX_CONCURRENT_EVALUATIONS")
                .ok()
                .map(|v| v.parse().context("MAX_CONCURRENT_EVALUATIONS must be a number"))
                .transpose()?,
            evaluation_timeout: Duration::from_secs(
                var_or("EVALUATION_TIMEOUT", "30")
                    .parse()
                    .context("EVALUATION_TIMEOUT must be seconds")?,
            ),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor_id.is_empty() {
            anyhow::bail!("EXECUTOR_ID must not be empty");
        }
        if self.broker_pool_size == 0 {
            anyhow::bail!("BROKER_POOL_SIZE must be at least 1");
        }
        if self.heartbeat_interval < Duration::from_secs(5) {
            anyhow::bail!("HEARTBEAT_INTERVAL below 5s would flood the control plane");
        }
        Ok(())
    }

    /// Port the broker's unsolicited push connects to.
    pub fn broker_push_port(&self) -> u16 {
        self.broker_port + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ExecutorConfig {
        ExecutorConfig {
            executor_id: "exec-1".to_string(),
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            platform_url: "https://platform.example.com".to_string(),
            push_key: "pk".to_string(),
            push_cluster: "eu1".to_string(),
            broker_host: "127.0.0.1".to_string(),
            broker_port: 9090,
            broker_pool_size: 3,
            heartbeat_interval: Duration::from_secs(60),
            auto_reconnect: true,
            account_kind: AccountKind::Demo,
            max_concurrent_evaluations: None,
            evaluation_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let mut config = base_config();
        config.broker_pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_hot_heartbeat() {
        let mut config = base_config();
        config.heartbeat_interval = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_push_port_is_adjacent() {
        assert_eq!(base_config().broker_push_port(), 9091);
    }

    #[test]
    fn test_account_kind_parses() {
        assert_eq!("demo".parse::<AccountKind>().unwrap(), AccountKind::Demo);
        assert_eq!("LIVE".parse::<AccountKind>().unwrap(), AccountKind::Live);
        assert!("paper".parse::<AccountKind>().is_err());
    }
}
