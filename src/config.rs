use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use thiserror::Error;

use crate::worker::retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// PostgreSQL connection URL; `DATABASE_URL` wins when set
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub email: EmailConfig,
}

fn default_max_connections() -> u32 {
    10
}

/// One named queue and its scheduling weight
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    pub weight: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkerConfig {
    pub queues: Vec<QueueConfig>,
    /// Handlers running at once
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    /// Deadline for one handler invocation
    pub handler_timeout_secs: u64,
    /// How long shutdown waits for in-flight handlers
    pub shutdown_grace_secs: u64,
    /// Processing rows older than this are returned to the queue
    pub stale_after_secs: u64,
    pub recovery_interval_secs: u64,
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec![
                QueueConfig {
                    name: crate::worker::QUEUE_CRITICAL.to_string(),
                    weight: 10,
                },
                QueueConfig {
                    name: crate::worker::QUEUE_DEFAULT.to_string(),
                    weight: 5,
                },
            ],
            concurrency: 10,
            poll_interval_ms: 200,
            handler_timeout_secs: 30,
            shutdown_grace_secs: 10,
            stale_after_secs: 300,
            recovery_interval_secs: 60,
            retry: RetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::Invalid("worker.queues must not be empty".into()));
        }
        if self.queues.iter().any(|q| q.weight == 0) {
            return Err(ConfigError::Invalid(
                "worker.queues weights must be positive".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "worker.concurrency must be positive".into(),
            ));
        }
        if self.handler_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "worker.handler_timeout_secs must be positive".into(),
            ));
        }
        if self.recovery_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "worker.recovery_interval_secs must be positive".into(),
            ));
        }
        // A running handler must never look stale to the recovery scan
        if self.stale_after_secs <= self.handler_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "worker.stale_after_secs ({}) must exceed worker.handler_timeout_secs ({})",
                self.stale_after_secs, self.handler_timeout_secs
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 10 * 60 * 1_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.jitter,
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EmailConfig {
    /// Base URL embedded in verification links
    pub verify_host: String,
    pub sender_name: String,
    pub sender_address: String,
    /// HTTP relay endpoint; messages are only logged when unset
    #[serde(default)]
    pub relay_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_mail_timeout")]
    pub timeout_secs: u64,
}

fn default_mail_timeout() -> u64 {
    30
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            verify_host: "http://localhost:8080".to_string(),
            sender_name: "Ledger".to_string(),
            sender_address: "noreply@localhost".to_string(),
            relay_url: None,
            api_key: None,
            timeout_secs: default_mail_timeout(),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        let mut config = Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: config_path,
            source,
        })?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.postgres_url = Some(url);
        }
        config.worker.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    pub fn postgres_url(&self) -> Result<&str, ConfigError> {
        self.postgres_url
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("postgres_url is not set".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
log_level: info
log_dir: ./logs
log_file: ledgerd.log
use_json: false
rotation: daily
"#;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.worker.queues.len(), 2);
        assert_eq!(config.worker.queues[0].name, "critical");
        assert_eq!(config.worker.queues[0].weight, 10);
        assert_eq!(config.worker.queues[1].weight, 5);
        assert!(config.email.relay_url.is_none());
        assert!(config.postgres_url().is_err());
    }

    #[test]
    fn test_worker_overrides() {
        let yaml = format!(
            "{}worker:\n  queues:\n    - {{ name: default, weight: 1 }}\n  concurrency: 2\n  poll_interval_ms: 50\n  handler_timeout_secs: 5\n  shutdown_grace_secs: 1\n  stale_after_secs: 30\n  recovery_interval_secs: 10\n  retry: {{ base_delay_ms: 10, max_delay_ms: 100, jitter: false }}\n",
            MINIMAL
        );
        let config = AppConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.worker.poll_interval(), Duration::from_millis(50));
        assert!(!config.worker.retry.jitter);
        assert!(config.worker.validate().is_ok());
    }

    #[test]
    fn test_zero_weight_rejected() {
        let mut worker = WorkerConfig::default();
        worker.queues[1].weight = 0;
        assert!(matches!(worker.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_recovery_interval_rejected() {
        let worker = WorkerConfig {
            recovery_interval_secs: 0,
            ..WorkerConfig::default()
        };
        let err = worker.validate().unwrap_err();
        assert!(err.to_string().contains("recovery_interval_secs"));
    }

    #[test]
    fn test_zero_handler_timeout_rejected() {
        let worker = WorkerConfig {
            handler_timeout_secs: 0,
            ..WorkerConfig::default()
        };
        let err = worker.validate().unwrap_err();
        assert!(err.to_string().contains("handler_timeout_secs"));
    }

    #[test]
    fn test_stale_after_must_exceed_handler_timeout() {
        let worker = WorkerConfig {
            handler_timeout_secs: 30,
            stale_after_secs: 30,
            ..WorkerConfig::default()
        };
        let err = worker.validate().unwrap_err();
        assert!(err.to_string().contains("stale_after_secs"));

        let worker = WorkerConfig {
            handler_timeout_secs: 30,
            stale_after_secs: 31,
            ..WorkerConfig::default()
        };
        assert!(worker.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(matches!(
            AppConfig::load("no-such-env"),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_shipped_configs_parse() {
        for env in ["dev", "prod"] {
            let content = fs::read_to_string(format!("config/{}.yaml", env)).unwrap();
            let config = AppConfig::from_yaml(&content).unwrap();
            assert!(config.worker.validate().is_ok(), "{env}");
            assert!(config.postgres_url.is_some(), "{env}");
        }
    }
}
