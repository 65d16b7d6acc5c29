//! Lua scripted plugins.
//!
//! A plugin script defines a global `plugin` table:
//!
//! ```lua
//! plugin = {}
//!
//! function plugin.info()
//!     return { Name = "error-burst", LogType = "app", Mode = "PerFile" }
//! end
//!
//! function plugin.params()
//!     return { window_secs = 60 }
//! end
//!
//! function plugin.activate(self, ctx)
//!     db.execute("DELETE FROM " .. ctx.table .. " WHERE log_file_id = ? AND rule = 'noise'", { ctx.log_id })
//! end
//! ```
//!
//! If `plugin.new()` exists it is called once at load time and its return
//! value becomes the instance the other entry points are called on (as the
//! first argument). The script, its entry points, and `info`/`params` are
//! all checked when the file is loaded, not when it is activated.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use mlua::prelude::*;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::lua_runtime::{
    lua_value_to_json, lua_value_to_string, register_db_api, register_host_apis, set_deadline,
    PluginConnection,
};
use crate::plugin::{ActivationContext, Plugin};

const INSTANCE_KEY: &str = "logfacts.plugin.instance";
const ENTRY_POINTS: [&str; 3] = ["info", "params", "activate"];

/// A plugin backed by one Lua VM.
pub struct LuaPlugin {
    path: PathBuf,
    timeout_secs: u64,
    lua: Arc<Mutex<Lua>>,
}

impl LuaPlugin {
    /// Load and validate a plugin script.
    pub fn load(path: &Path, timeout_secs: u64) -> Result<Self> {
        let script_src = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plugin script: {}", path.display()))?;

        let log_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "plugin".to_string());

        let lua = Lua::new();
        register_host_apis(&lua, &log_name)?;
        set_deadline(&lua, timeout_secs);

        lua.load(&script_src)
            .set_name(path.to_string_lossy())
            .exec()
            .map_err(|e| anyhow!("Failed to execute plugin script: {}", e))?;

        let table: LuaTable = lua
            .globals()
            .get::<LuaTable>("plugin")
            .map_err(|e| anyhow!("Script must define a global 'plugin' table: {}", e))?;

        let (instance, owner) = match table.get::<LuaValue>("new")? {
            LuaValue::Nil => (table, "plugin"),
            LuaValue::Function(ctor) => match ctor.call::<LuaValue>(())? {
                LuaValue::Table(t) => (t, "plugin.new() instance"),
                other => bail!("plugin.new() must return a table, got {}", other.type_name()),
            },
            other => bail!("plugin.new must be a function, got {}", other.type_name()),
        };

        // Calls go to the instance, so that is what must carry the entry points.
        for name in ENTRY_POINTS {
            let value: LuaValue = instance.get(name)?;
            if !value.is_function() {
                bail!("{}: {} must be a function", owner, name);
            }
        }
        lua.set_named_registry_value(INSTANCE_KEY, instance)?;
        lua.remove_hook();

        Ok(Self {
            path: path.to_path_buf(),
            timeout_secs,
            lua: Arc::new(Mutex::new(lua)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Call `instance.<method>(instance, arg)` and return its result.
    fn call_entry(lua: &Lua, method: &str, arg: Option<LuaTable>) -> LuaResult<LuaValue> {
        let instance: LuaTable = lua.named_registry_value(INSTANCE_KEY)?;
        let f: LuaFunction = instance.get(method)?;
        f.call::<LuaValue>((instance, arg))
    }

    /// Call a table-returning entry point and convert the table while the
    /// VM lock is held.
    fn with_table<T>(&self, method: &str, convert: impl FnOnce(LuaTable) -> Result<T>) -> Result<T> {
        let lua = self.lua.lock();
        set_deadline(&lua, self.timeout_secs);
        let result = Self::call_entry(&lua, method, None);
        lua.remove_hook();
        match result.map_err(|e| anyhow!("plugin.{}() failed: {}", method, e))? {
            LuaValue::Table(t) => convert(t),
            LuaValue::Nil => bail!("plugin.{}() returned nil", method),
            other => bail!("plugin.{}() must return a table, got {}", method, other.type_name()),
        }
    }
}

#[async_trait]
impl Plugin for LuaPlugin {
    fn info(&self) -> Result<HashMap<String, String>> {
        self.with_table("info", |table| {
            let mut info = HashMap::new();
            for pair in table.pairs::<String, LuaValue>() {
                let (k, v) = pair?;
                if let Some(s) = lua_value_to_string(v)? {
                    info.insert(k, s);
                }
            }
            Ok(info)
        })
    }

    fn params(&self) -> Result<HashMap<String, Value>> {
        self.with_table("params", |table| {
            let mut params = HashMap::new();
            for pair in table.pairs::<String, LuaValue>() {
                let (k, v) = pair?;
                params.insert(k, lua_value_to_json(v)?);
            }
            Ok(params)
        })
    }

    async fn activate(&self, ctx: &ActivationContext) -> Result<()> {
        let lua = self.lua.clone();
        let ctx = ctx.clone();
        let timeout_secs = self.timeout_secs;
        let handle = tokio::runtime::Handle::current();

        tokio::task::spawn_blocking(move || run_activation(&lua, &ctx, timeout_secs, handle))
            .await
            .context("Lua plugin task panicked")?
    }
}

fn run_activation(
    lua: &Mutex<Lua>,
    ctx: &ActivationContext,
    timeout_secs: u64,
    handle: tokio::runtime::Handle,
) -> Result<()> {
    let lua = lua.lock();
    let conn: PluginConnection = Arc::new(Mutex::new(None));
    register_db_api(&lua, ctx.storage.clone(), handle.clone(), conn.clone())?;

    let ctx_table = lua.create_table()?;
    ctx_table.set("table", ctx.table.as_str())?;
    ctx_table.set("log_type", ctx.log_type.as_str())?;
    ctx_table.set("project_id", ctx.project_id)?;
    ctx_table.set("log_id", ctx.log_id)?;

    set_deadline(&lua, timeout_secs);
    let result = LuaPlugin::call_entry(&lua, "activate", Some(ctx_table));
    lua.remove_hook();
    lua.globals().set("db", LuaValue::Nil)?;

    if let Some(connection) = conn.lock().take() {
        if let Err(e) = handle.block_on(connection.close()) {
            tracing::warn!(error = %e, "failed to close plugin connection");
        }
    }

    result.map(|_| ()).map_err(|e| anyhow!("plugin.activate() failed: {}", e))
}

/// Write a commented template plugin to `<dir>/<name>.plugin.lua`.
pub fn scaffold_plugin(dir: &Path, name: &str, log_type: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create plugin directory: {}", dir.display()))?;

    let path = dir.join(format!("{}.plugin.lua", name));
    if path.exists() {
        bail!("Plugin script already exists: {}", path.display());
    }

    let template = format!(
        r#"--[[
  logfacts plugin: {name}

  Discovered from the [plugins] dir (default "plugins/") by the
  "*.plugin.lua" naming pattern.

  Run:
    logfacts plugins run {name} --project 1 --log 42
]]

plugin = {{}}

--- Identity and activation contract. Name, LogType and Mode are required.
--- Mode is "PerFile" (ctx.log_id is set) or "PerProject".
function plugin.info(self)
    return {{
        Name = "{name}",
        LogType = "{log_type}",
        Mode = "PerFile",
        Version = "0.1.0",
    }}
end

--- Custom parameters, shown by `logfacts plugins list`.
function plugin.params(self)
    return {{}}
end

--- Called once per activation.
--- ctx.table      fact table for the log type
--- ctx.log_type   log type name
--- ctx.project_id project id
--- ctx.log_id     log file id (PerFile only)
function plugin.activate(self, ctx)
    log.info("activating on " .. ctx.table)

    -- Example: drop facts produced by a noisy rule
    --
    -- db.execute(
    --     "DELETE FROM " .. ctx.table .. " WHERE log_file_id = ? AND rule = ?",
    --     {{ ctx.log_id, "heartbeat" }}
    -- )
end
"#,
        name = name,
        log_type = log_type,
    );

    std::fs::write(&path, template)
        .with_context(|| format!("Failed to write plugin script: {}", path.display()))?;
    Ok(path)
}
