//! Configuration loader and validator for the traceability service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub server: Server,
    pub worker: Worker,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default)]
    pub database_url: Option<String>,
}

/// HTTP surface settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub bind: String,
    /// Shared secret expected as `Authorization: Bearer <token>` on the worker trigger.
    pub worker_token: String,
}

/// Reverse job worker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worker {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub poll_interval_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    #[serde(default = "default_chunk_attempts")]
    pub chunk_attempts: u32,
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    100
}

fn default_chunk_delay_ms() -> u64 {
    100
}

fn default_chunk_attempts() -> u32 {
    3
}

/// Knobs the worker needs at run time, detached from the YAML layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    pub chunk_attempts: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_delay: Duration::from_millis(default_chunk_delay_ms()),
            chunk_attempts: default_chunk_attempts(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Database URL: `DATABASE_URL` env, then `app.database_url`, then a file in `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.app.database_url.clone())
            .unwrap_or_else(|| {
                format!(
                    "sqlite://{}/qrtrace.db",
                    self.app.data_dir.trim_end_matches('/')
                )
            })
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            chunk_size: self.worker.chunk_size,
            chunk_delay: Duration::from_millis(self.worker.chunk_delay_ms),
            chunk_attempts: self.worker.chunk_attempts,
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if let Some(url) = &cfg.app.database_url {
        if url.trim().is_empty() {
            return Err(ConfigError::Invalid("app.database_url must be non-empty when set"));
        }
    }

    if cfg.server.bind.trim().is_empty() {
        return Err(ConfigError::Invalid("server.bind must be non-empty"));
    }
    if cfg.server.bind.parse::<std::net::SocketAddr>().is_err() {
        return Err(ConfigError::Invalid("server.bind must be a socket address"));
    }
    if cfg.server.worker_token.trim().is_empty() {
        return Err(ConfigError::Invalid("server.worker_token must be non-empty"));
    }

    if cfg.worker.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("worker.poll_interval_ms must be > 0"));
    }
    if cfg.worker.chunk_size == 0 {
        return Err(ConfigError::Invalid("worker.chunk_size must be > 0"));
    }
    if cfg.worker.chunk_attempts == 0 {
        return Err(ConfigError::Invalid("worker.chunk_attempts must be > 0"));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

server:
  bind: "0.0.0.0:8080"
  worker_token: "CHANGE_ME_WORKER_SECRET"

worker:
  enabled: true
  poll_interval_ms: 2000
  chunk_size: 100
  chunk_delay_ms: 100
  chunk_attempts: 3
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.worker_settings().chunk_size, 100);
        assert_eq!(cfg.worker_settings().chunk_delay, Duration::from_millis(100));
    }

    #[test]
    fn worker_defaults_apply() {
        let yaml = r#"app:
  data_dir: "./data"
server:
  bind: "127.0.0.1:9000"
  worker_token: "t"
worker:
  poll_interval_ms: 10
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert!(cfg.worker.enabled);
        assert_eq!(cfg.worker_settings(), WorkerSettings::default());
    }

    #[test]
    fn invalid_worker_token() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.server.worker_token = " ".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("worker_token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_bind_and_worker_knobs() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.server.bind = "not-an-address".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.worker.poll_interval_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.worker.chunk_size = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("chunk_size")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.worker.chunk_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
    }
}
