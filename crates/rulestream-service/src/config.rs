//! Service configuration

use rulestream_engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Directory of rule documents
    #[serde(default = "default_rules_dir")]
    pub rules_dir: PathBuf,

    /// JSON-lines trigger instances; stdin when unset or `-`
    #[serde(default)]
    pub events_file: Option<PathBuf>,

    /// Deliveries per trigger instance before it is dead-lettered
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    /// How often the rules directory is checked for edits
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,

    /// Serve Prometheus metrics on this address
    #[serde(default)]
    pub metrics_listen: Option<String>,

    #[serde(default)]
    pub engine: EngineConfig,
}

impl ServiceConfig {
    /// Load configuration from file and CLI overrides
    pub fn load(config_path: &str, cli: &crate::Cli) -> anyhow::Result<Self> {
        // Try to load from file, or use defaults
        let mut config = if Path::new(config_path).exists() {
            let content = std::fs::read_to_string(config_path)?;
            serde_yaml::from_str(&content)?
        } else {
            Self::default()
        };

        // Apply CLI overrides
        if let Some(rules_dir) = &cli.rules_dir {
            config.rules_dir = rules_dir.clone();
        }

        if let Some(events) = &cli.events {
            config.events_file = Some(events.clone());
        }

        if let Some(workers) = cli.workers {
            config.engine.workers = workers;
        }

        if let Some(max_deliveries) = cli.max_deliveries {
            config.max_deliveries = max_deliveries;
        }

        if let Some(listen) = &cli.metrics_listen {
            config.metrics_listen = Some(listen.clone());
        }

        if cli.json {
            config.log_json = true;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_deliveries == 0 {
            anyhow::bail!("max_deliveries must be at least 1");
        }
        if self.watch_interval_ms == 0 {
            anyhow::bail!("watch_interval_ms must be positive");
        }
        self.engine.validate()?;
        Ok(())
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    /// Events file, or `None` for stdin
    pub fn events_path(&self) -> Option<&Path> {
        self.events_file
            .as_deref()
            .filter(|path| *path != Path::new("-"))
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            rules_dir: default_rules_dir(),
            events_file: None,
            max_deliveries: default_max_deliveries(),
            watch_interval_ms: default_watch_interval_ms(),
            log_json: false,
            metrics_listen: None,
            engine: EngineConfig::default(),
        }
    }
}

fn default_rules_dir() -> PathBuf {
    PathBuf::from("./rules")
}

fn default_max_deliveries() -> u32 {
    5
}

fn default_watch_interval_ms() -> u64 {
    2_000
}
