//! Gateway configuration from environment variables.

use crate::error::{GatewayError, Result};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_INSTANCE: &str = "ws_gateway";
pub const DEFAULT_NATS_URL: &str = "nats://localhost:4222";
pub const DEFAULT_PAYMENT_PROCESSOR_URL: &str = "https://blockchain.info/api/receive";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Name used in audit records.
    pub instance: String,
    /// Engine request/reply subject prefix.
    pub backend_request_subject: String,
    /// Engine publish subject prefix (market data, session pushes).
    pub backend_publish_subject: String,
    pub audit_log_path: String,
    /// Base of the deposit callback URL; the secret is appended.
    pub callback_url: String,
    pub http_port: u16,
    /// `redis://...` or `memory://`.
    pub storage_url: String,
    pub nats_url: String,
    pub payment_processor_url: String,
    pub payment_timeout: Duration,
    pub backend_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub metrics_port: Option<u16>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup, e.g. a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| GatewayError::Config(format!("{} must be set", key)))
        };
        let optional = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let seconds = |key: &str, default: u64| -> Result<Duration> {
            match lookup(key) {
                Some(v) => parse::<u64>(key, &v).map(Duration::from_secs),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let http_port = parse("HTTP_PORT", &required("HTTP_PORT")?)?;
        let metrics_port = lookup("METRICS_PORT")
            .map(|v| parse("METRICS_PORT", &v))
            .transpose()?;

        let heartbeat_interval = seconds("HEARTBEAT_INTERVAL_SECS", 30)?;
        if heartbeat_interval.is_zero() {
            return Err(GatewayError::Config(
                "HEARTBEAT_INTERVAL_SECS must be positive".to_string(),
            ));
        }

        Ok(Self {
            instance: optional("GATEWAY_INSTANCE", DEFAULT_INSTANCE),
            backend_request_subject: required("BACKEND_REQUEST_SUBJECT")?,
            backend_publish_subject: required("BACKEND_PUBLISH_SUBJECT")?,
            audit_log_path: required("AUDIT_LOG_PATH")?,
            callback_url: required("CALLBACK_URL")?,
            http_port,
            storage_url: required("STORAGE_URL")?,
            nats_url: optional("NATS_URL", DEFAULT_NATS_URL),
            payment_processor_url: optional("PAYMENT_PROCESSOR_URL", DEFAULT_PAYMENT_PROCESSOR_URL),
            payment_timeout: seconds("PAYMENT_TIMEOUT_SECS", 10)?,
            backend_timeout: seconds("BACKEND_TIMEOUT_SECS", 30)?,
            heartbeat_interval,
            metrics_port,
        })
    }

    /// Every parameter as (name, value), for the startup audit records.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("instance", self.instance.clone()),
            ("backend_request_subject", self.backend_request_subject.clone()),
            ("backend_publish_subject", self.backend_publish_subject.clone()),
            ("audit_log_path", self.audit_log_path.clone()),
            ("callback_url", self.callback_url.clone()),
            ("http_port", self.http_port.to_string()),
            ("storage_url", self.storage_url.clone()),
            ("nats_url", self.nats_url.clone()),
            ("payment_processor_url", self.payment_processor_url.clone()),
            ("payment_timeout", format!("{:?}", self.payment_timeout)),
            ("backend_timeout", format!("{:?}", self.backend_timeout)),
            ("heartbeat_interval", format!("{:?}", self.heartbeat_interval)),
            (
                "metrics_port",
                self.metrics_port.map(|p| p.to_string()).unwrap_or_default(),
            ),
        ]
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GatewayError::Config(format!("{} has an invalid value: {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(overrides: &[(&str, &str)]) -> HashMap<String, String> {
        let mut map: HashMap<String, String> = [
            ("BACKEND_REQUEST_SUBJECT", "trade.req"),
            ("BACKEND_PUBLISH_SUBJECT", "trade.pub"),
            ("AUDIT_LOG_PATH", "/tmp/ws_gateway.log"),
            ("CALLBACK_URL", "https://example.com/cb/"),
            ("HTTP_PORT", "8445"),
            ("STORAGE_URL", "memory://"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in overrides {
            map.insert(k.to_string(), v.to_string());
        }
        map
    }

    #[test]
    fn test_defaults() {
        let map = vars(&[]);
        let config = GatewayConfig::from_lookup(|k| map.get(k).cloned()).unwrap();
        assert_eq!(config.http_port, 8445);
        assert_eq!(config.instance, DEFAULT_INSTANCE);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.params().len(), 13);
    }

    #[test]
    fn test_missing_required_variable() {
        let mut map = vars(&[]);
        map.remove("CALLBACK_URL");
        let err = GatewayConfig::from_lookup(|k| map.get(k).cloned()).unwrap_err();
        assert!(matches!(err, GatewayError::Config(ref m) if m.contains("CALLBACK_URL")));
    }

    #[test]
    fn test_invalid_numbers() {
        let map = vars(&[("HTTP_PORT", "eighty")]);
        assert!(GatewayConfig::from_lookup(|k| map.get(k).cloned()).is_err());

        let map = vars(&[("HEARTBEAT_INTERVAL_SECS", "-1")]);
        assert!(GatewayConfig::from_lookup(|k| map.get(k).cloned()).is_err());

        let map = vars(&[("HEARTBEAT_INTERVAL_SECS", "0")]);
        assert!(GatewayConfig::from_lookup(|k| map.get(k).cloned()).is_err());

        let map = vars(&[("METRICS_PORT", "9093"), ("HEARTBEAT_INTERVAL_SECS", "5")]);
        let config = GatewayConfig::from_lookup(|k| map.get(k).cloned()).unwrap();
        assert_eq!(config.metrics_port, Some(9093));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
    }
}
