//! # logfacts
//!
//! A concurrent log-fact extraction engine. Log files are parsed line by
//! line into structured facts; facts are written to SQLite through a
//! write-behind queue drained by a pool of persistence workers; analysis
//! plugins run over the stored facts.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ permit ┌─────────────┐ enqueue ┌───────────┐ execute ┌──────────┐
//! │ submit_parse│──────▶│ Parser task │───────▶│ FactQueue │───────▶│ Workers  │──▶ SQLite
//! └─────────────┘       └──────┬──────┘        └───────────┘        └──────────┘
//!                              │ progress events
//!                              ▼
//!                       ┌─────────────┐          ┌──────────────┐
//!                       │  Observer   │          │   Plugins    │──▶ db.execute
//!                       └─────────────┘          └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! logfacts init                         # create database
//! logfacts scan 1 /var/log/myapp        # register log files for project 1
//! logfacts parse --project 1            # extract facts
//! logfacts plugins run error-burst --project 1
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Engine error taxonomy |
//! | [`logging`] | tracing subscriber setup |
//! | [`models`] | Log files, facts, statements |
//! | [`semaphore`] | Parse channel semaphore |
//! | [`queue`] | Write-behind fact queue |
//! | [`workers`] | Persistence worker pool |
//! | [`storage`] | Storage trait, SQLite and in-memory backends |
//! | [`rules`] | Log-type matching and line parsing |
//! | [`parse`] | Parser tasks |
//! | [`progress`] | Progress events and observers |
//! | [`plugin`] | Plugin trait, descriptors, registry |
//! | [`lua_plugin`] | Lua script plugins |
//! | [`catalog`] | Log file discovery and registration |
//! | [`engine`] | Engine facade |

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod lua_plugin;
mod lua_runtime;
pub mod models;
pub mod parse;
pub mod plugin;
pub mod progress;
pub mod queue;
pub mod rules;
pub mod semaphore;
pub mod storage;
pub mod workers;
