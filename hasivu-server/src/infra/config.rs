//! Server configuration.
//!
//! Precedence, highest first: CLI flags, `HASIVU_*` environment variables
//! (optionally read from a `.env` file), a TOML file, built-in defaults.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, anyhow};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use hasivu_core::{OrchestratorConfig, pipeline::PipelineDefinition, queue::QueueName};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("hasivu.toml"),
        PathBuf::from("config/hasivu.toml"),
    ]
});

/// Fully resolved server configuration. The same shape is read from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    /// Directory for pipeline checkpoints; checkpoints stay in memory when unset.
    pub checkpoint_dir: Option<PathBuf>,
    pub orchestrator: OrchestratorConfig,
    #[serde(rename = "worker")]
    pub workers: Vec<WorkerSpec>,
    #[serde(rename = "integration")]
    pub integrations: Vec<HttpIntegrationSpec>,
    #[serde(rename = "pipeline")]
    pub pipelines: Vec<PipelineDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound for draining workers and runs on shutdown.
    #[serde(with = "humantime_duration")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Workers consuming one queue by forwarding each payload to a webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub queue: QueueName,
    pub webhook: String,
    #[serde(default)]
    pub parallelism: Option<usize>,
    #[serde(default = "default_webhook_timeout", with = "humantime_duration")]
    pub timeout: Duration,
}

fn default_webhook_timeout() -> Duration {
    Duration::from_secs(10)
}

/// External HTTP service supervised by the integration orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpIntegrationSpec {
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub health_path: Option<String>,
    #[serde(default)]
    pub sync_path: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, with = "humantime_duration::option")]
    pub slow_threshold: Option<Duration>,
}

/// Where the effective configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub metadata: ConfigMetadata,
    /// Non-fatal problems to log once tracing is up.
    pub warnings: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to load env file")]
    EnvFile(#[from] dotenvy::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        let env = EnvConfig::gather();
        let mut warnings = env.warnings.clone();

        let (file_config, config_path) = self.load_file_config(&env)?;
        if config_path.is_none() {
            warnings.push(
                "no hasivu.toml found; using defaults and environment variables".to_string(),
            );
        }

        let mut config = file_config.unwrap_or_default();
        env.apply(&mut config);
        config.validate()?;

        Ok(ConfigLoad {
            config,
            metadata: ConfigMetadata {
                config_path,
                env_file_loaded,
            },
            warnings,
        })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<Config>, Option<PathBuf>), ConfigLoadError> {
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigLoadError::MissingConfig { path });
                }
                path
            }
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
            {
                Some(path) => path.clone(),
                None => return Ok((None, None)),
            },
        };

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let config = Config::from_toml(&contents).map_err(|source| ConfigLoadError::Parse {
            path: path.clone(),
            source,
        })?;
        Ok((Some(config), Some(path)))
    }
}

impl Config {
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let mut names = HashSet::new();
        for integration in &self.integrations {
            if integration.name.trim().is_empty() {
                return Err(ConfigLoadError::Invalid(
                    "integration name must not be empty".into(),
                ));
            }
            if matches!(integration.name.as_str(), "queue" | "pipelines") {
                return Err(ConfigLoadError::Invalid(format!(
                    "integration name '{}' is reserved",
                    integration.name
                )));
            }
            if !names.insert(integration.name.as_str()) {
                return Err(ConfigLoadError::Invalid(format!(
                    "duplicate integration '{}'",
                    integration.name
                )));
            }
            if !is_http_url(&integration.base_url) {
                return Err(ConfigLoadError::Invalid(format!(
                    "integration '{}' base_url must be an http(s) URL",
                    integration.name
                )));
            }
        }

        let mut queues = HashSet::new();
        for worker in &self.workers {
            QueueName::new(worker.queue.as_str())
                .map_err(|err| ConfigLoadError::Invalid(err.to_string()))?;
            if !queues.insert(worker.queue.clone()) {
                return Err(ConfigLoadError::Invalid(format!(
                    "queue '{}' has more than one worker entry",
                    worker.queue
                )));
            }
            if !is_http_url(&worker.webhook) {
                return Err(ConfigLoadError::Invalid(format!(
                    "worker webhook for '{}' must be an http(s) URL",
                    worker.queue
                )));
            }
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn is_http_url(raw: &str) -> bool {
    raw.starts_with("http://") || raw.starts_with("https://")
}

/// `HASIVU_*` overrides read from the process environment.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub checkpoint_dir: Option<PathBuf>,
    pub shutdown_timeout: Option<Duration>,
    pub health_check_interval: Option<Duration>,
    pub default_workers: Option<usize>,
    pub max_concurrent_runs: Option<usize>,
    pub auto_reconnect: Option<bool>,
    pub warnings: Vec<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        let mut warnings = Vec::new();
        let mut duration = |name: &str| {
            let raw = std::env::var(name).ok()?;
            match humantime::parse_duration(raw.trim()) {
                Ok(value) => Some(value),
                Err(err) => {
                    warnings.push(format!("ignoring {name}={raw}: {err}"));
                    None
                }
            }
        };
        let shutdown_timeout = duration("HASIVU_SHUTDOWN_TIMEOUT");
        let health_check_interval = duration("HASIVU_HEALTH_CHECK_INTERVAL");

        Self {
            config_path: std::env::var("HASIVU_CONFIG").ok().map(PathBuf::from),
            host: std::env::var("HASIVU_HOST").ok(),
            port: std::env::var("HASIVU_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            checkpoint_dir: std::env::var("HASIVU_CHECKPOINT_DIR")
                .ok()
                .map(PathBuf::from),
            shutdown_timeout,
            health_check_interval,
            default_workers: std::env::var("HASIVU_DEFAULT_WORKERS")
                .ok()
                .and_then(|s| s.parse().ok()),
            max_concurrent_runs: std::env::var("HASIVU_MAX_CONCURRENT_RUNS")
                .ok()
                .and_then(|s| s.parse().ok()),
            auto_reconnect: parse_bool_var("HASIVU_AUTO_RECONNECT"),
            warnings,
        }
    }

    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(dir) = &self.checkpoint_dir {
            config.checkpoint_dir = Some(dir.clone());
        }
        if let Some(timeout) = self.shutdown_timeout {
            config.server.shutdown_timeout = timeout;
        }
        if let Some(interval) = self.health_check_interval {
            config.orchestrator.integration.health_check_interval_ms =
                u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        }
        if let Some(workers) = self.default_workers {
            config.orchestrator.queue.default_workers = workers;
        }
        if let Some(runs) = self.max_concurrent_runs {
            config.orchestrator.pipeline.max_concurrent_runs = runs;
        }
        if let Some(auto_reconnect) = self.auto_reconnect {
            config.orchestrator.integration.auto_reconnect = auto_reconnect;
        }
    }
}

fn parse_bool_var(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .and_then(|raw| match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

/// Reads a pipeline definition for a one-off run. `.json` and `.toml` are
/// parsed by extension; anything else tries TOML then JSON.
pub fn load_pipeline_definition(path: &Path) -> anyhow::Result<PipelineDefinition> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read pipeline definition {}", path.display()))?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&contents)
            .with_context(|| format!("invalid pipeline definition {}", path.display())),
        Some("toml") => toml::from_str(&contents)
            .map_err(|err| anyhow!("invalid pipeline definition {}: {}", path.display(), err)),
        _ => toml::from_str(&contents).or_else(|toml_err| {
            serde_json::from_str(&contents).map_err(|json_err| {
                anyhow!(
                    "failed to parse pipeline definition {}: toml error: {}; json error: {}",
                    path.display(),
                    toml_err,
                    json_err
                )
            })
        }),
    }
}

/// Durations written as `"30s"`, `"5m"` or `"1h 30m"`.
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(D::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| humantime::parse_duration(raw.trim()).map_err(D::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use hasivu_core::pipeline::{FilterOp, TransformStep};

    use super::*;

    const SAMPLE: &str = r#"
checkpoint_dir = "/var/lib/hasivu/checkpoints"

[server]
port = 9090
shutdown_timeout = "45s"

[orchestrator.queue]
default_workers = 2

[orchestrator.integration]
health_check_interval_ms = 5000

[[worker]]
queue = "kitchen_orders"
webhook = "http://kitchen.local/tickets"
parallelism = 3
timeout = "5s"

[[integration]]
name = "payments"
base_url = "http://payments.local"
sync_path = "/sync"
slow_threshold = "1s"

[[pipeline]]
id = "menu-import"
name = "Menu import"
schedule = "@daily"
source = { type = "json_lines", path = "/data/menu.jsonl" }
sink = { type = "memory", dataset = "menu" }
transforms = [
  { step = "filter", field = "calories", op = "lt", value = 800 },
  { step = "rename", from = "qty", to = "quantity" },
]
"#;

    #[test]
    fn parses_full_toml_document() {
        let config = Config::from_toml(SAMPLE).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(45));
        assert_eq!(config.orchestrator.queue.default_workers, 2);
        assert_eq!(config.orchestrator.integration.health_check_interval_ms, 5_000);
        assert_eq!(config.workers.len(), 1);
        assert_eq!(config.workers[0].timeout, Duration::from_secs(5));
        assert_eq!(config.integrations[0].slow_threshold, Some(Duration::from_secs(1)));
        assert_eq!(config.pipelines[0].id.as_str(), "menu-import");
        assert_eq!(
            config.pipelines[0].transforms[0],
            TransformStep::Filter {
                field: "calories".into(),
                op: FilterOp::Lt,
                value: serde_json::json!(800),
            }
        );
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        let env = EnvConfig {
            port: Some(7000),
            health_check_interval: Some(Duration::from_secs(2)),
            max_concurrent_runs: Some(9),
            auto_reconnect: Some(false),
            ..EnvConfig::default()
        };
        env.apply(&mut config);
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.orchestrator.integration.health_check_interval_ms, 2_000);
        assert_eq!(config.orchestrator.pipeline.max_concurrent_runs, 9);
        assert!(!config.orchestrator.integration.auto_reconnect);
    }

    #[test]
    fn rejects_duplicate_and_reserved_integrations() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        config.integrations.push(config.integrations[0].clone());
        assert!(matches!(config.validate(), Err(ConfigLoadError::Invalid(_))));

        config.integrations.truncate(1);
        config.integrations[0].name = "queue".into();
        assert!(matches!(config.validate(), Err(ConfigLoadError::Invalid(_))));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let loader = ConfigLoader::new()
            .with_config_path("/definitely/not/here/hasivu.toml")
            .with_env_file("/definitely/not/here/.env");
        assert!(matches!(
            loader.load(),
            Err(ConfigLoadError::MissingConfig { .. })
        ));
    }

    #[test]
    fn explicit_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hasivu.toml");
        fs::write(&path, SAMPLE).unwrap();

        let load = ConfigLoader::new()
            .with_config_path(&path)
            .with_env_file(dir.path().join(".env"))
            .load()
            .unwrap();
        assert_eq!(load.metadata.config_path.as_deref(), Some(path.as_path()));
        assert!(!load.metadata.env_file_loaded);
        assert_eq!(load.config.workers[0].queue.as_str(), "kitchen_orders");
    }

    #[test]
    fn pipeline_definition_loads_from_json_and_toml() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("run.json");
        fs::write(
            &json_path,
            r#"{"id":"p1","name":"P1","source":{"type":"memory","dataset":"a"},"sink":{"type":"memory","dataset":"b"}}"#,
        )
        .unwrap();
        let toml_path = dir.path().join("run.toml");
        fs::write(
            &toml_path,
            "id = \"p2\"\nname = \"P2\"\nsource = { type = \"memory\", dataset = \"a\" }\nsink = { type = \"memory\", dataset = \"b\" }\n",
        )
        .unwrap();

        assert_eq!(load_pipeline_definition(&json_path).unwrap().id.as_str(), "p1");
        assert_eq!(load_pipeline_definition(&toml_path).unwrap().id.as_str(), "p2");
    }
}
