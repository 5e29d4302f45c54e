//! Service configuration.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use z_metering_core::ClassifierRules;
use z_metering_queue::ConsumeOptions;

use crate::error::ConfigError;
use crate::supervisor::SupervisorConfig;

/// Which queue carries tasks and results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    /// Embedded `RocksDB` queue.
    Rocks,
    /// Shared PostgreSQL queue.
    Postgres,
}

impl FromStr for QueueBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rocks" | "rocksdb" => Ok(Self::Rocks),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            _ => Err(ConfigError::Invalid {
                key: "QUEUE_BACKEND",
                value: s.to_string(),
            }),
        }
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Path to the `RocksDB` ledger directory (default: "/data/z-metering").
    pub data_dir: String,

    /// Queue backend (default: rocks).
    pub queue_backend: QueueBackend,

    /// Path to the `RocksDB` queue directory (default: "<data_dir>/queue").
    pub queue_dir: String,

    /// PostgreSQL URL for the postgres queue backend.
    pub queue_database_url: Option<String>,

    /// Lease duration for the postgres queue.
    pub queue_visibility_timeout_seconds: u64,

    /// Topic tasks are published to (default: "`ml_tasks`").
    pub task_topic: String,

    /// Topic results are consumed from (default: "`ml_results`").
    pub result_topic: String,

    /// Input keys every task must carry (default: "transaction").
    pub required_input_fields: Vec<String>,

    /// How long one receive waits before the consumer polls again.
    pub consumer_poll_interval_ms: u64,

    /// Consumer silence tolerated before it is considered hung.
    pub consumer_hang_timeout_seconds: u64,

    /// Interval between supervisor liveness checks.
    pub supervisor_check_interval_seconds: u64,

    /// First restart delay.
    pub supervisor_restart_backoff_ms: u64,

    /// Largest restart delay.
    pub supervisor_max_backoff_ms: u64,

    /// Age after which a pending job is expired. `None` disables reconciliation.
    pub reconcile_deadline_seconds: Option<u64>,

    /// Interval between reconciliation sweeps.
    pub reconcile_interval_seconds: u64,

    /// Worker result contract.
    pub classifier: ClassifierRules,
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is present but malformed, or the
    /// classifier rules file cannot be loaded.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let data_dir = std::env::var("DATA_DIR").unwrap_or(defaults.data_dir);

        let classifier = match std::env::var("CLASSIFIER_RULES_PATH") {
            Ok(path) => {
                let rules = load_rules_file(&path)?;
                tracing::info!(path = %path, "Loaded classifier rules from file");
                rules
            }
            Err(_) => ClassifierRules::default(),
        };

        Ok(Self {
            queue_backend: std::env::var("QUEUE_BACKEND")
                .ok()
                .map(|s| s.parse())
                .transpose()?
                .unwrap_or(defaults.queue_backend),
            queue_dir: std::env::var("QUEUE_DIR").unwrap_or_else(|_| format!("{data_dir}/queue")),
            data_dir,
            queue_database_url: std::env::var("QUEUE_DATABASE_URL").ok(),
            queue_visibility_timeout_seconds: env_parse(
                "QUEUE_VISIBILITY_TIMEOUT_SECONDS",
                defaults.queue_visibility_timeout_seconds,
            )?,
            task_topic: std::env::var("TASK_TOPIC").unwrap_or(defaults.task_topic),
            result_topic: std::env::var("RESULT_TOPIC").unwrap_or(defaults.result_topic),
            required_input_fields: std::env::var("REQUIRED_INPUT_FIELDS").map_or(
                defaults.required_input_fields,
                |s| {
                    s.split(',')
                        .map(|f| f.trim().to_string())
                        .filter(|f| !f.is_empty())
                        .collect()
                },
            ),
            consumer_poll_interval_ms: env_parse(
                "CONSUMER_POLL_INTERVAL_MS",
                defaults.consumer_poll_interval_ms,
            )?,
            consumer_hang_timeout_seconds: env_parse(
                "CONSUMER_HANG_TIMEOUT_SECONDS",
                defaults.consumer_hang_timeout_seconds,
            )?,
            supervisor_check_interval_seconds: env_parse(
                "SUPERVISOR_CHECK_INTERVAL_SECONDS",
                defaults.supervisor_check_interval_seconds,
            )?,
            supervisor_restart_backoff_ms: env_parse(
                "SUPERVISOR_RESTART_BACKOFF_MS",
                defaults.supervisor_restart_backoff_ms,
            )?,
            supervisor_max_backoff_ms: env_parse(
                "SUPERVISOR_MAX_BACKOFF_MS",
                defaults.supervisor_max_backoff_ms,
            )?,
            reconcile_deadline_seconds: env_parse_opt("RECONCILE_DEADLINE_SECONDS")?,
            reconcile_interval_seconds: env_parse(
                "RECONCILE_INTERVAL_SECONDS",
                defaults.reconcile_interval_seconds,
            )?,
            classifier,
        })
    }

    /// Supervisor settings for the result consumer.
    #[must_use]
    pub fn consumer_supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            check_interval: Duration::from_secs(self.supervisor_check_interval_seconds.max(1)),
            initial_backoff: Duration::from_millis(self.supervisor_restart_backoff_ms),
            max_backoff: Duration::from_millis(
                self.supervisor_max_backoff_ms
                    .max(self.supervisor_restart_backoff_ms),
            ),
            hang_timeout: match self.consumer_hang_timeout_seconds {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            ..SupervisorConfig::default()
        }
    }

    /// Supervisor settings for the reconciler, which beats once per sweep.
    #[must_use]
    pub fn reconciler_supervisor(&self) -> SupervisorConfig {
        let consumer = self.consumer_supervisor();
        SupervisorConfig {
            hang_timeout: consumer
                .hang_timeout
                .map(|t| t.max(self.reconcile_interval() * 2)),
            ..consumer
        }
    }

    /// Receive options for the result consumer.
    #[must_use]
    pub fn consume_options(&self) -> ConsumeOptions {
        ConsumeOptions {
            poll_interval: Duration::from_millis(self.consumer_poll_interval_ms.max(1)),
        }
    }

    /// Reconciliation deadline, if enabled.
    #[must_use]
    pub fn reconcile_deadline(&self) -> Option<Duration> {
        self.reconcile_deadline_seconds.map(Duration::from_secs)
    }

    /// Interval between reconciliation sweeps.
    #[must_use]
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds.max(1))
    }

    /// Postgres queue lease duration.
    #[must_use]
    pub fn queue_visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_visibility_timeout_seconds)
    }
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    Ok(env_parse_opt(key)?.unwrap_or(default))
}

fn env_parse_opt<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    std::env::var(key)
        .ok()
        .map(|raw| parse_value(key, &raw))
        .transpose()
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

/// Load classifier rules from a JSON file.
fn load_rules_file(path: &str) -> Result<ClassifierRules, ConfigError> {
    let contents = std::fs::read_to_string(Path::new(path)).map_err(|source| {
        ConfigError::RulesFile {
            path: path.to_string(),
            source,
        }
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::RulesFormat {
        path: path.to_string(),
        source,
    })
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: "/data/z-metering".into(),
            queue_backend: QueueBackend::Rocks,
            queue_dir: "/data/z-metering/queue".into(),
            queue_database_url: None,
            queue_visibility_timeout_seconds: 300,
            task_topic: "ml_tasks".into(),
            result_topic: "ml_results".into(),
            required_input_fields: vec!["transaction".into()],
            consumer_poll_interval_ms: 500,
            consumer_hang_timeout_seconds: 120,
            supervisor_check_interval_seconds: 30,
            supervisor_restart_backoff_ms: 1000,
            supervisor_max_backoff_ms: 30_000,
            reconcile_deadline_seconds: None,
            reconcile_interval_seconds: 60,
            classifier: ClassifierRules::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_parse() {
        assert_eq!("rocks".parse::<QueueBackend>().unwrap(), QueueBackend::Rocks);
        assert_eq!("Postgres".parse::<QueueBackend>().unwrap(), QueueBackend::Postgres);
        assert!(matches!(
            "amqp".parse::<QueueBackend>(),
            Err(ConfigError::Invalid {
                key: "QUEUE_BACKEND",
                ..
            })
        ));
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = parse_value::<u64>("RECONCILE_DEADLINE_SECONDS", "soon").unwrap_err();
        assert!(matches!(
            &err,
            ConfigError::Invalid { key: "RECONCILE_DEADLINE_SECONDS", value } if value == "soon"
        ));
        assert_eq!(parse_value::<u64>("RECONCILE_DEADLINE_SECONDS", " 30 ").unwrap(), 30);
    }

    #[test]
    fn rules_file_errors_are_typed() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(
            load_rules_file(&missing.to_string_lossy()),
            Err(ConfigError::RulesFile { .. })
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(matches!(
            load_rules_file(&bad.to_string_lossy()),
            Err(ConfigError::RulesFormat { .. })
        ));

        let good = dir.path().join("rules.json");
        std::fs::write(&good, r#"{"count_field": "objects"}"#).unwrap();
        let rules = load_rules_file(&good.to_string_lossy()).unwrap();
        assert_eq!(rules.count_field.as_deref(), Some("objects"));
        assert_eq!(rules.status_field, "status");
    }

    #[test]
    fn defaults_match_legacy_worker() {
        let config = ServiceConfig::default();
        assert_eq!(config.task_topic, "ml_tasks");
        assert_eq!(config.result_topic, "ml_results");
        assert_eq!(config.required_input_fields, vec!["transaction".to_string()]);
        assert!(config.reconcile_deadline().is_none());
    }

    #[test]
    fn supervisor_settings_derive_from_config() {
        let config = ServiceConfig {
            consumer_hang_timeout_seconds: 0,
            supervisor_restart_backoff_ms: 5000,
            supervisor_max_backoff_ms: 100,
            ..ServiceConfig::default()
        };
        let supervisor = config.consumer_supervisor();
        assert!(supervisor.hang_timeout.is_none());
        assert_eq!(supervisor.max_backoff, Duration::from_millis(5000));
        assert_eq!(supervisor.check_interval, Duration::from_secs(30));
    }

    #[test]
    fn reconciler_hang_timeout_covers_sweep_interval() {
        let config = ServiceConfig {
            reconcile_interval_seconds: 600,
            ..ServiceConfig::default()
        };
        assert_eq!(
            config.reconciler_supervisor().hang_timeout,
            Some(Duration::from_secs(1200))
        );
    }
}
