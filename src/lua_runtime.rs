//! Shared Lua 5.4 VM runtime for script plugins.
//!
//! Provides a sandboxed Lua environment with the host APIs that
//! [`crate::lua_plugin`] scripts can call. The VM runs on a blocking thread
//! (via [`tokio::task::spawn_blocking`]), so host functions are synchronous;
//! `db.execute` bridges to the async storage layer with a runtime handle.
//!
//! # Host APIs
//!
//! | Module | Functions |
//! |--------|-----------|
//! | `log` | `info`, `warn`, `error`, `debug` |
//! | `json` | `parse`, `encode` |
//! | `env` | `get` |
//! | `db` | `execute(sql, params?)` (activation only) |
//! | `sleep` | `sleep(seconds)` |
//!
//! # Sandboxing
//!
//! Dangerous Lua standard libraries (`os`, `io`, `debug`, `loadfile`, `dofile`)
//! are removed.

use mlua::prelude::*;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::{SqlValue, Statement};
use crate::storage::{ConnectionRole, Storage, StorageConnection};

/// Register the load-time host APIs on a fresh VM.
pub(crate) fn register_host_apis(lua: &Lua, plugin_name: &str) -> LuaResult<()> {
    sandbox_globals(lua)?;
    register_json_api(lua)?;
    register_env_api(lua)?;
    register_log_api(lua, plugin_name)?;
    register_sleep(lua)?;
    Ok(())
}

/// Abort the running script once `timeout_secs` have passed.
pub(crate) fn set_deadline(lua: &Lua, timeout_secs: u64) {
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    lua.set_hook(
        mlua::HookTriggers::new().every_nth_instruction(10_000),
        move |_lua, _debug| {
            if Instant::now() > deadline {
                Err(mlua::Error::RuntimeError(format!(
                    "script timed out after {} seconds",
                    timeout_secs
                )))
            } else {
                Ok(mlua::VmState::Continue)
            }
        },
    );
}

fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    globals.set("os", LuaValue::Nil)?;
    globals.set("io", LuaValue::Nil)?;
    globals.set("loadfile", LuaValue::Nil)?;
    globals.set("dofile", LuaValue::Nil)?;
    globals.set("debug", LuaValue::Nil)?;
    Ok(())
}

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json_table = lua.create_table()?;

    json_table.set(
        "parse",
        lua.create_function(|lua, s: String| {
            let value: serde_json::Value = serde_json::from_str(&s)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.parse: {}", e)))?;
            json_value_to_lua(lua, &value)
        })?,
    )?;

    json_table.set(
        "encode",
        lua.create_function(|_lua, value: LuaValue| {
            let json = lua_value_to_json(value)?;
            serde_json::to_string(&json)
                .map_err(|e| mlua::Error::external(anyhow::anyhow!("json.encode: {}", e)))
        })?,
    )?;

    lua.globals().set("json", json_table)?;
    Ok(())
}

fn register_env_api(lua: &Lua) -> LuaResult<()> {
    let env = lua.create_table()?;
    env.set(
        "get",
        lua.create_function(|_lua, name: String| Ok(std::env::var(&name).ok()))?,
    )?;
    lua.globals().set("env", env)?;
    Ok(())
}

fn register_log_api(lua: &Lua, plugin_name: &str) -> LuaResult<()> {
    let log = lua.create_table()?;

    let n = plugin_name.to_string();
    log.set(
        "info",
        lua.create_function(move |_lua, msg: String| {
            tracing::info!(plugin = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = plugin_name.to_string();
    log.set(
        "warn",
        lua.create_function(move |_lua, msg: String| {
            tracing::warn!(plugin = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = plugin_name.to_string();
    log.set(
        "error",
        lua.create_function(move |_lua, msg: String| {
            tracing::error!(plugin = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    let n = plugin_name.to_string();
    log.set(
        "debug",
        lua.create_function(move |_lua, msg: String| {
            tracing::debug!(plugin = %n, "{}", msg);
            Ok(())
        })?,
    )?;

    lua.globals().set("log", log)?;
    Ok(())
}

fn register_sleep(lua: &Lua) -> LuaResult<()> {
    lua.globals().set(
        "sleep",
        lua.create_function(|_lua, seconds: f64| {
            std::thread::sleep(Duration::from_secs_f64(seconds.max(0.0)));
            Ok(())
        })?,
    )?;
    Ok(())
}

/// Lazily-opened plugin connection shared by the `db` functions of one
/// activation.
pub(crate) type PluginConnection = Arc<Mutex<Option<Box<dyn StorageConnection>>>>;

/// Install `db.execute` for one activation. Must be called from a blocking
/// thread: the function blocks on `handle` to reach async storage.
pub(crate) fn register_db_api(
    lua: &Lua,
    storage: Arc<dyn Storage>,
    handle: tokio::runtime::Handle,
    conn: PluginConnection,
) -> LuaResult<()> {
    let db = lua.create_table()?;

    db.set(
        "execute",
        lua.create_function(move |_lua, (sql, params): (String, Option<LuaTable>)| {
            let mut statement = Statement::new(sql);
            if let Some(params) = params {
                for value in params.sequence_values::<LuaValue>() {
                    statement.params.push(lua_value_to_sql(value?)?);
                }
            }

            let mut guard = conn.lock();
            if guard.is_none() {
                let opened = handle
                    .block_on(storage.connect(ConnectionRole::Plugin))
                    .map_err(mlua::Error::external)?;
                *guard = Some(opened);
            }
            let Some(connection) = guard.as_mut() else {
                return Err(mlua::Error::RuntimeError(
                    "db connection unavailable".to_string(),
                ));
            };
            handle
                .block_on(connection.execute(&statement))
                .map_err(mlua::Error::external)
        })?,
    )?;

    lua.globals().set("db", db)?;
    Ok(())
}

/// Convert a Lua scalar to a SQL bind value.
pub(crate) fn lua_value_to_sql(value: LuaValue) -> LuaResult<SqlValue> {
    match value {
        LuaValue::Nil => Ok(SqlValue::Null),
        LuaValue::Boolean(b) => Ok(SqlValue::from(b)),
        LuaValue::Integer(i) => Ok(SqlValue::Integer(i)),
        LuaValue::Number(n) => Ok(SqlValue::Real(n)),
        LuaValue::String(s) => Ok(SqlValue::Text(s.to_str()?.to_string())),
        other => Err(mlua::Error::RuntimeError(format!(
            "db.execute: cannot bind a {}",
            other.type_name()
        ))),
    }
}

/// Convert a Lua value to a plain string for `info()` maps.
pub(crate) fn lua_value_to_string(value: LuaValue) -> LuaResult<Option<String>> {
    match value {
        LuaValue::Nil => Ok(None),
        LuaValue::Boolean(b) => Ok(Some(b.to_string())),
        LuaValue::Integer(i) => Ok(Some(i.to_string())),
        LuaValue::Number(n) => Ok(Some(n.to_string())),
        LuaValue::String(s) => Ok(Some(s.to_str()?.to_string())),
        other => Err(mlua::Error::RuntimeError(format!(
            "expected a scalar, got {}",
            other.type_name()
        ))),
    }
}

/// Convert a JSON value to a Lua value.
pub(crate) fn json_value_to_lua(lua: &Lua, value: &serde_json::Value) -> LuaResult<LuaValue> {
    match value {
        serde_json::Value::Null => Ok(LuaValue::Nil),
        serde_json::Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(LuaValue::Integer(i))
            } else {
                Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0)))
            }
        }
        serde_json::Value::String(s) => lua.create_string(s).map(LuaValue::String),
        serde_json::Value::Array(arr) => {
            let table = lua.create_table()?;
            for (i, v) in arr.iter().enumerate() {
                table.set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        serde_json::Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

/// Convert a Lua value to a JSON value. Tables with a sequence part become
/// arrays; other tables become objects.
pub(crate) fn lua_value_to_json(value: LuaValue) -> LuaResult<serde_json::Value> {
    match value {
        LuaValue::Nil => Ok(serde_json::Value::Null),
        LuaValue::Boolean(b) => Ok(serde_json::Value::Bool(b)),
        LuaValue::Integer(i) => Ok(serde_json::Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)),
        LuaValue::String(s) => Ok(serde_json::Value::String(s.to_str()?.to_string())),
        LuaValue::Table(t) => {
            let len = t.raw_len();
            if len > 0 {
                let mut arr = Vec::with_capacity(len);
                for i in 1..=len {
                    let v: LuaValue = t.raw_get(i)?;
                    arr.push(lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Array(arr))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<String, LuaValue>() {
                    let (k, v) = pair?;
                    map.insert(k, lua_value_to_json(v)?);
                }
                Ok(serde_json::Value::Object(map))
            }
        }
        _ => Ok(serde_json::Value::Null),
    }
}
