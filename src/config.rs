use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub log_types: BTreeMap<String, LogTypeConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

/// How queued operations are assigned to persistence workers.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueRouting {
    /// One global FIFO shared by every worker. No cross-worker ordering.
    #[default]
    Shared,
    /// One FIFO lane per worker; a log file's operations always land on the
    /// same lane, so they persist in line order.
    ByFile,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_max_parse_channels")]
    pub max_parse_channels: usize,
    #[serde(default = "default_persistence_workers")]
    pub persistence_workers: usize,
    #[serde(default = "default_true")]
    pub write_behind: bool,
    #[serde(default)]
    pub queue_routing: QueueRouting,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    #[serde(default = "default_flush_poll_ms")]
    pub flush_poll_ms: u64,
    #[serde(default = "default_quiesce_ms")]
    pub quiesce_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parse_channels: default_max_parse_channels(),
            persistence_workers: default_persistence_workers(),
            write_behind: true,
            queue_routing: QueueRouting::Shared,
            idle_poll_ms: default_idle_poll_ms(),
            flush_poll_ms: default_flush_poll_ms(),
            quiesce_ms: default_quiesce_ms(),
        }
    }
}

impl EngineConfig {
    /// Facts go through the queue only when write-behind is on and there is
    /// at least one worker to drain it.
    pub fn write_behind_active(&self) -> bool {
        self.write_behind && self.persistence_workers > 0
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms.max(1))
    }

    pub fn flush_poll(&self) -> Duration {
        Duration::from_millis(self.flush_poll_ms.max(1))
    }

    pub fn quiesce(&self) -> Duration {
        Duration::from_millis(self.quiesce_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parse_channels == 0 {
            bail!("engine.max_parse_channels must be >= 1");
        }
        Ok(())
    }
}

fn default_max_parse_channels() -> usize {
    4
}
fn default_persistence_workers() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_idle_poll_ms() -> u64 {
    25
}
fn default_flush_poll_ms() -> u64 {
    50
}
fn default_quiesce_ms() -> u64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct PluginsConfig {
    #[serde(default = "default_plugin_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_plugin_pattern")]
    pub pattern: String,
    #[serde(default = "default_plugin_timeout")]
    pub timeout_secs: u64,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            dir: default_plugin_dir(),
            pattern: default_plugin_pattern(),
            timeout_secs: default_plugin_timeout(),
        }
    }
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("plugins")
}
fn default_plugin_pattern() -> String {
    "*.plugin.lua".to_string()
}
fn default_plugin_timeout() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LogTypeConfig {
    /// Fact table for this log type. Defaults to `facts_<name>`.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub file_globs: Vec<String>,
    /// Count lines that match no rule as parse errors instead of skipping them.
    #[serde(default)]
    pub unmatched_is_error: bool,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuleConfig {
    pub name: String,
    pub pattern: String,
}

impl Config {
    /// A config with no log types and an in-directory database, for
    /// commands that can run without a config file.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("data/logfacts.sqlite"),
                busy_timeout_ms: default_busy_timeout_ms(),
            },
            engine: EngineConfig::default(),
            plugins: PluginsConfig::default(),
            logging: LoggingConfig::default(),
            log_types: BTreeMap::new(),
        }
    }

    /// Resolved fact table name for a log type.
    pub fn table_for(&self, log_type: &str) -> Option<String> {
        self.log_types
            .get(log_type)
            .map(|lt| resolve_table(log_type, lt))
    }

    /// Every fact table the schema must contain.
    pub fn fact_tables(&self) -> Vec<String> {
        self.log_types
            .iter()
            .map(|(name, lt)| resolve_table(name, lt))
            .collect()
    }
}

pub(crate) fn resolve_table(log_type: &str, lt: &LogTypeConfig) -> String {
    lt.table
        .clone()
        .unwrap_or_else(|| format!("facts_{}", log_type))
}

/// Plain SQL identifier: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_sql_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    config.engine.validate()?;

    for (name, lt) in &config.log_types {
        let table = resolve_table(name, lt);
        if !is_sql_identifier(&table) {
            bail!(
                "log_types.{}.table '{}' is not a valid SQL identifier",
                name,
                table
            );
        }
        for rule in &lt.rules {
            regex::Regex::new(&rule.pattern).with_context(|| {
                format!("log_types.{}: rule '{}' has an invalid pattern", name, rule.name)
            })?;
        }
        for glob in &lt.file_globs {
            globset::Glob::new(glob)
                .with_context(|| format!("log_types.{}: invalid file glob '{}'", name, glob))?;
        }
    }

    Ok(())
}
