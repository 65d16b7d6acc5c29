//! Analysis plugins.
//!
//! A plugin exposes a narrow capability contract: [`Plugin::info`],
//! [`Plugin::params`], and [`Plugin::activate`]. Plugins reach the registry
//! two ways:
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             PluginRegistry               │
//! │  ┌──────────────────┐ ┌───────────────┐  │
//! │  │ Compiled-in      │ │ Lua scripts   │  │
//! │  │ register(plugin) │ │ discover(dir) │  │
//! │  └──────────────────┘ └───────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!       PluginDescriptor (Ready)
//! ```
//!
//! Both paths run the same validation at load time. A candidate that fails
//! any step is recorded as a [`PluginRejection`] and never enters the
//! registry; it cannot affect other candidates. Accepted descriptors are
//! immutable and live until process exit.

use anyhow::Result;
use async_trait::async_trait;
use globset::Glob;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::EngineError;
use crate::lua_plugin::LuaPlugin;
use crate::storage::Storage;

/// Required `info()` key: plugin name.
pub const INFO_NAME: &str = "Name";
/// Required `info()` key: log type the plugin analyses.
pub const INFO_LOG_TYPE: &str = "LogType";
/// Optional `info()` key: `PerFile` (default) or `PerProject`.
pub const INFO_MODE: &str = "Mode";

/// Whether a plugin runs once per log file or once per project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationMode {
    PerFile,
    PerProject,
}

impl ActivationMode {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "perfile" | "per_file" | "file" => Some(ActivationMode::PerFile),
            "perproject" | "per_project" | "project" => Some(ActivationMode::PerProject),
            _ => None,
        }
    }
}

impl fmt::Display for ActivationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationMode::PerFile => f.write_str("per-file"),
            ActivationMode::PerProject => f.write_str("per-project"),
        }
    }
}

/// Everything a plugin may touch during activation. Nothing else is shared.
#[derive(Clone)]
pub struct ActivationContext {
    /// Connection factory; plugins open their own connection.
    pub storage: Arc<dyn Storage>,
    /// Fact table of the plugin's log type.
    pub table: String,
    pub log_type: String,
    pub project_id: i64,
    /// Set for per-file activations.
    pub log_id: Option<i64>,
}

/// An analysis extension.
///
/// # Example
///
/// ```rust
/// use anyhow::Result;
/// use async_trait::async_trait;
/// use serde_json::Value;
/// use std::collections::HashMap;
/// use logfacts::plugin::{ActivationContext, Plugin};
///
/// struct ErrorRate;
///
/// #[async_trait]
/// impl Plugin for ErrorRate {
///     fn info(&self) -> Result<HashMap<String, String>> {
///         Ok(HashMap::from([
///             ("Name".to_string(), "error-rate".to_string()),
///             ("LogType".to_string(), "app".to_string()),
///         ]))
///     }
///
///     fn params(&self) -> Result<HashMap<String, Value>> {
///         Ok(HashMap::new())
///     }
///
///     async fn activate(&self, _ctx: &ActivationContext) -> Result<()> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Capability map. Must contain non-empty `Name` and `LogType`.
    fn info(&self) -> Result<HashMap<String, String>>;

    /// Custom parameters shown to users.
    fn params(&self) -> Result<HashMap<String, Value>>;

    /// Run the analysis.
    async fn activate(&self, ctx: &ActivationContext) -> Result<()>;
}

/// A validated, ready plugin.
#[derive(Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub log_type: String,
    pub mode: ActivationMode,
    pub info: HashMap<String, String>,
    pub params: HashMap<String, Value>,
    /// Script path, or `builtin` for compiled-in plugins.
    pub source: String,
    entry: Arc<dyn Plugin>,
}

impl PluginDescriptor {
    /// Validate a plugin instance and build its descriptor.
    pub fn validate(source: &str, plugin: Arc<dyn Plugin>) -> Result<Self, PluginRejection> {
        let reject = |reason: String| PluginRejection {
            source: source.to_string(),
            reason,
        };

        let info = plugin
            .info()
            .map_err(|e| reject(format!("info() failed: {:#}", e)))?;
        let params = plugin
            .params()
            .map_err(|e| reject(format!("params() failed: {:#}", e)))?;

        let required = |key: &str| -> Result<String, PluginRejection> {
            match info.get(key).map(|v| v.trim()) {
                Some(v) if !v.is_empty() => Ok(v.to_string()),
                _ => Err(reject(format!("info() is missing a non-empty '{}'", key))),
            }
        };
        let name = required(INFO_NAME)?;
        let log_type = required(INFO_LOG_TYPE)?;

        let mode = match info.get(INFO_MODE) {
            None => ActivationMode::PerFile,
            Some(m) => ActivationMode::parse(m)
                .ok_or_else(|| reject(format!("unknown activation mode '{}'", m)))?,
        };

        Ok(Self {
            name,
            log_type,
            mode,
            info,
            params,
            source: source.to_string(),
            entry: plugin,
        })
    }

    pub(crate) fn entry(&self) -> Arc<dyn Plugin> {
        self.entry.clone()
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("log_type", &self.log_type)
            .field("mode", &self.mode)
            .field("source", &self.source)
            .finish()
    }
}

/// A candidate that did not make it into the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRejection {
    pub source: String,
    pub reason: String,
}

impl fmt::Display for PluginRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.source, self.reason)
    }
}

impl From<PluginRejection> for EngineError {
    fn from(r: PluginRejection) -> Self {
        EngineError::PluginRejected {
            source_name: r.source,
            reason: r.reason,
        }
    }
}

/// Ready plugins plus the record of rejected candidates.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<PluginDescriptor>,
    rejections: Vec<PluginRejection>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a compiled-in plugin.
    pub fn register(
        &mut self,
        source: &str,
        plugin: Arc<dyn Plugin>,
    ) -> Result<PluginDescriptor, PluginRejection> {
        let result = PluginDescriptor::validate(source, plugin).and_then(|d| {
            if self.find(&d.name).is_some() {
                Err(PluginRejection {
                    source: source.to_string(),
                    reason: format!("a plugin named '{}' is already registered", d.name),
                })
            } else {
                Ok(d)
            }
        });

        match result {
            Ok(descriptor) => {
                tracing::info!(
                    plugin = %descriptor.name,
                    log_type = %descriptor.log_type,
                    mode = %descriptor.mode,
                    source,
                    "plugin ready"
                );
                self.plugins.push(descriptor.clone());
                Ok(descriptor)
            }
            Err(rejection) => {
                tracing::warn!(source, reason = %rejection.reason, "plugin rejected");
                self.rejections.push(rejection.clone());
                Err(rejection)
            }
        }
    }

    /// Load every file in `dir` whose name matches `pattern` as a Lua
    /// plugin. Returns the descriptors that became ready in this call.
    ///
    /// Never fails as a whole: an unreadable directory is recorded as a
    /// rejection, and each bad candidate is rejected on its own.
    pub fn discover(&mut self, dir: &Path, pattern: &str, timeout_secs: u64) -> Vec<PluginDescriptor> {
        let matcher = match Glob::new(pattern) {
            Ok(g) => g.compile_matcher(),
            Err(e) => {
                self.reject(dir, format!("invalid plugin pattern '{}': {}", pattern, e));
                return Vec::new();
            }
        };

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                self.reject(dir, format!("cannot read plugin directory: {}", e));
                return Vec::new();
            }
        };

        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .filter(|path| {
                path.file_name()
                    .map(|n| matcher.is_match(Path::new(n)))
                    .unwrap_or(false)
            })
            .collect();
        candidates.sort();

        tracing::debug!(dir = %dir.display(), candidates = candidates.len(), "discovering plugins");

        let mut ready = Vec::new();
        for path in candidates {
            let source = path.display().to_string();
            match LuaPlugin::load(&path, timeout_secs) {
                Ok(plugin) => {
                    if let Ok(descriptor) = self.register(&source, Arc::new(plugin)) {
                        ready.push(descriptor);
                    }
                }
                Err(e) => self.reject(&path, format!("{:#}", e)),
            }
        }
        ready
    }

    fn reject(&mut self, source: &Path, reason: String) {
        let source = source.display().to_string();
        tracing::warn!(source = %source, reason = %reason, "plugin rejected");
        self.rejections.push(PluginRejection { source, reason });
    }

    pub fn plugins(&self) -> &[PluginDescriptor] {
        &self.plugins
    }

    pub fn rejections(&self) -> &[PluginRejection] {
        &self.rejections
    }

    pub fn find(&self, name: &str) -> Option<&PluginDescriptor> {
        self.plugins.iter().find(|p| p.name == name)
    }

    /// Ready plugins for a log type and activation mode.
    pub fn matching(&self, log_type: &str, mode: ActivationMode) -> Vec<PluginDescriptor> {
        self.plugins
            .iter()
            .filter(|p| p.log_type == log_type && p.mode == mode)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticPlugin {
        info: Option<HashMap<String, String>>,
    }

    #[async_trait]
    impl Plugin for StaticPlugin {
        fn info(&self) -> Result<HashMap<String, String>> {
            self.info
                .clone()
                .ok_or_else(|| anyhow::anyhow!("info() returned nil"))
        }

        fn params(&self) -> Result<HashMap<String, Value>> {
            Ok(HashMap::from([("threshold".to_string(), Value::from(5))]))
        }

        async fn activate(&self, _ctx: &ActivationContext) -> Result<()> {
            Ok(())
        }
    }

    fn plugin(pairs: &[(&str, &str)]) -> Arc<dyn Plugin> {
        Arc::new(StaticPlugin {
            info: Some(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
        })
    }

    #[test]
    fn valid_plugin_becomes_ready() {
        let mut reg = PluginRegistry::new();
        let d = reg
            .register(
                "builtin",
                plugin(&[("Name", "slow-requests"), ("LogType", "access"), ("Mode", "PerProject")]),
            )
            .unwrap();
        assert_eq!(d.name, "slow-requests");
        assert_eq!(d.mode, ActivationMode::PerProject);
        assert_eq!(d.params["threshold"], Value::from(5));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.matching("access", ActivationMode::PerProject).len(), 1);
        assert!(reg.matching("access", ActivationMode::PerFile).is_empty());
    }

    #[test]
    fn missing_fields_are_rejected() {
        let mut reg = PluginRegistry::new();
        assert!(reg.register("a", plugin(&[("Name", "x")])).is_err());
        assert!(reg.register("b", plugin(&[("Name", " "), ("LogType", "app")])).is_err());
        assert!(reg
            .register("c", Arc::new(StaticPlugin { info: None }))
            .is_err());
        assert!(reg
            .register("d", plugin(&[("Name", "x"), ("LogType", "app"), ("Mode", "weekly")]))
            .is_err());
        assert!(reg.is_empty());
        assert_eq!(reg.rejections().len(), 4);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut reg = PluginRegistry::new();
        reg.register("a", plugin(&[("Name", "x"), ("LogType", "app")]))
            .unwrap();
        let err = reg
            .register("b", plugin(&[("Name", "x"), ("LogType", "app")]))
            .unwrap_err();
        assert!(err.reason.contains("already registered"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn missing_directory_is_recorded_not_raised() {
        let mut reg = PluginRegistry::new();
        let ready = reg.discover(Path::new("/definitely/not/here"), "*.plugin.lua", 5);
        assert!(ready.is_empty());
        assert_eq!(reg.rejections().len(), 1);
    }
}
