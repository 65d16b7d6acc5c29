//! # logfacts CLI
//!
//! ## Usage
//!
//! ```bash
//! logfacts --config ./config/logfacts.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `logfacts init` | Create the SQLite database and fact tables |
//! | `logfacts scan <project> <root>` | Register log files found under a directory |
//! | `logfacts parse` | Parse registered files into facts |
//! | `logfacts files` | List registered files and their last-run counters |
//! | `logfacts plugins list` | Discover plugins and show ready and rejected ones |
//! | `logfacts plugins run <name>` | Activate one plugin |
//! | `logfacts plugins init <name>` | Scaffold a plugin script |

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use logfacts::catalog;
use logfacts::config::{self, Config};
use logfacts::engine::Engine;
use logfacts::logging;
use logfacts::lua_plugin::scaffold_plugin;
use logfacts::plugin::{ActivationMode, PluginRegistry};
use logfacts::progress::{spawn_observer, ProgressMode};
use logfacts::rules::PatternRules;
use logfacts::storage::SqliteStorage;

/// logfacts: extract structured facts from log files into SQLite.
#[derive(Parser)]
#[command(
    name = "logfacts",
    about = "logfacts: concurrent log-fact extraction",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/logfacts.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run more than once.
    Init,

    /// Walk a directory and register every file a log type claims.
    Scan {
        /// Project the files belong to.
        project: i64,
        /// Directory to walk.
        root: PathBuf,
    },

    /// Parse registered log files into facts.
    ///
    /// Files of the selected project (or all projects) are parsed
    /// concurrently, facts are flushed, then PerFile and PerProject plugins
    /// for each log type are activated.
    Parse {
        #[arg(long)]
        project: Option<i64>,

        /// Progress output on stderr. Defaults to human on a TTY, off otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,

        /// Skip plugin activation after parsing.
        #[arg(long)]
        no_plugins: bool,
    },

    /// List registered log files.
    Files {
        #[arg(long)]
        project: Option<i64>,
    },

    /// Plugin management.
    Plugins {
        #[command(subcommand)]
        action: PluginAction,
    },
}

#[derive(Subcommand)]
enum PluginAction {
    /// Discover plugins and list ready and rejected candidates.
    List,
    /// Activate one plugin.
    Run {
        name: String,
        #[arg(long)]
        project: i64,
        /// Log file id, for PerFile plugins.
        #[arg(long)]
        log: Option<i64>,
    },
    /// Scaffold `<plugins dir>/<name>.plugin.lua` from a template.
    Init {
        name: String,
        /// Log type the plugin works on.
        #[arg(long, default_value = "app")]
        log_type: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Plugins {
        action: PluginAction::Init { name, log_type },
    } = &cli.command
    {
        let cfg = config::load_config(&cli.config).unwrap_or_else(|_| Config::minimal());
        let path = scaffold_plugin(&cfg.plugins.dir, name, log_type)?;
        println!("Created plugin: {}", path.display());
        println!();
        println!("Next steps:");
        println!("  1. Edit {} to implement activate()", path.display());
        println!("  2. Check it loads: logfacts plugins list");
        println!("  3. Run it: logfacts plugins run {} --project <id>", name);
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            SqliteStorage::from_config(&cfg).ensure_schema().await?;
            println!("Database initialized successfully.");
        }
        Commands::Scan { project, root } => run_scan(&cfg, project, &root).await?,
        Commands::Parse {
            project,
            progress,
            no_plugins,
        } => {
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            run_parse(&cfg, project, mode, !no_plugins).await?;
        }
        Commands::Files { project } => run_files(&cfg, project).await?,
        Commands::Plugins { action } => match action {
            PluginAction::List => run_plugins_list(&cfg),
            PluginAction::Run { name, project, log } => {
                run_plugin(&cfg, &name, project, log).await?;
            }
            PluginAction::Init { .. } => {
                // Handled above (before config loading)
                unreachable!()
            }
        },
    }

    Ok(())
}

async fn run_scan(cfg: &Config, project: i64, root: &std::path::Path) -> Result<()> {
    let rules = PatternRules::from_config(cfg)?;
    let found = catalog::scan_directory(root, project, &rules)?;
    let storage = SqliteStorage::from_config(cfg);
    let stored = catalog::register(&storage, &found).await?;

    println!("scan {}", root.display());
    println!("  project:    {}", project);
    println!("  found:      {}", found.len());
    println!("  registered: {}", stored.len());
    println!("ok");
    Ok(())
}

async fn run_parse(cfg: &Config, project: Option<i64>, mode: ProgressMode, plugins: bool) -> Result<()> {
    let storage = Arc::new(SqliteStorage::from_config(cfg));
    let files = catalog::load(&storage, project).await?;
    if files.is_empty() {
        println!("No log files registered.");
        return Ok(());
    }

    let rules = Arc::new(PatternRules::from_config(cfg)?);
    let engine = Engine::from_config(cfg, storage.clone(), rules).await?;
    let observer = spawn_observer(engine.subscribe(), mode.observer());

    let mut reports = Vec::with_capacity(files.len());
    for handle in engine.submit_all(files)? {
        match handle.join().await {
            Ok(report) => reports.push(report),
            Err(e) => eprintln!("Warning: {}", e),
        }
    }
    engine.flush_and_wait("parse").await?;

    if plugins && cfg.plugins.dir.is_dir() {
        engine.discover_plugins(&cfg.plugins.dir);
        activate_after_parse(&engine, &reports).await;
    }

    let shutdown = engine.shutdown().await?;
    drop(engine);
    if let Err(e) = observer.await {
        tracing::warn!(error = %e, "progress observer did not finish cleanly");
    }

    let facts: u64 = reports.iter().map(|r| r.file.facts_count).sum();
    let errors: u64 = reports.iter().map(|r| r.file.errors_count).sum();
    for r in &reports {
        match &r.aborted {
            None => println!(
                "  {}  {} facts, {} errors",
                r.file.path.display(),
                r.file.facts_count,
                r.file.errors_count
            ),
            Some(reason) => println!("  {}  aborted: {}", r.file.path.display(), reason),
        }
    }
    println!("parse");
    println!("  files:     {}", reports.len());
    println!("  facts:     {}", facts);
    println!("  errors:    {}", errors);
    println!("  persisted: {}", shutdown.executed);
    if shutdown.failed > 0 {
        println!("  dropped:   {}", shutdown.failed);
    }
    println!("ok");
    Ok(())
}

async fn activate_after_parse(engine: &Engine, reports: &[logfacts::parse::ParseReport]) {
    let mut projects = BTreeSet::new();

    for report in reports.iter().filter(|r| r.is_ok()) {
        let file = &report.file;
        projects.insert((file.project_id, file.log_type.clone()));
        for plugin in engine.plugins_for(&file.log_type, ActivationMode::PerFile) {
            let result = match engine.activation_context(&plugin, file.project_id, Some(file.id)) {
                Ok(ctx) => engine.activate(&plugin, &ctx).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                eprintln!("Warning: {}", e);
            }
        }
    }

    for (project_id, log_type) in projects {
        for plugin in engine.plugins_for(&log_type, ActivationMode::PerProject) {
            let result = match engine.activation_context(&plugin, project_id, None) {
                Ok(ctx) => engine.activate(&plugin, &ctx).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                eprintln!("Warning: {}", e);
            }
        }
    }
}

async fn run_files(cfg: &Config, project: Option<i64>) -> Result<()> {
    let storage = SqliteStorage::from_config(cfg);
    let files = catalog::load(&storage, project).await?;
    if files.is_empty() {
        println!("No log files registered.");
        return Ok(());
    }

    println!(
        "{:<6} {:<8} {:<10} {:>8} {:>7}  {:<20} PATH",
        "ID", "PROJECT", "TYPE", "FACTS", "ERRORS", "LAST PARSED"
    );
    for f in &files {
        let parsed = f
            .last_parsed_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<6} {:<8} {:<10} {:>8} {:>7}  {:<20} {}",
            f.id,
            f.project_id,
            f.log_type,
            f.facts_count,
            f.errors_count,
            parsed,
            f.path.display()
        );
        if let Some(err) = &f.last_error {
            println!("       last error: {}", err);
        }
    }
    Ok(())
}

fn run_plugins_list(cfg: &Config) {
    let mut registry = PluginRegistry::new();
    registry.discover(&cfg.plugins.dir, &cfg.plugins.pattern, cfg.plugins.timeout_secs);

    if registry.is_empty() && registry.rejections().is_empty() {
        println!("No plugins found in {}", cfg.plugins.dir.display());
        return;
    }

    for p in registry.plugins() {
        println!("{:<24} {:<10} {:<10} {}", p.name, p.log_type, p.mode, p.source);
        let mut params: Vec<_> = p.params.iter().collect();
        params.sort_by(|a, b| a.0.cmp(b.0));
        for (key, value) in params {
            println!("    {} = {}", key, value);
        }
    }
    for r in registry.rejections() {
        println!("rejected  {}", r);
    }
}

async fn run_plugin(cfg: &Config, name: &str, project: i64, log: Option<i64>) -> Result<()> {
    let storage = Arc::new(SqliteStorage::from_config(cfg));
    let rules = Arc::new(PatternRules::from_config(cfg)?);
    let engine = Engine::from_config(cfg, storage, rules).await?;
    engine.discover_plugins(&cfg.plugins.dir);

    let Some(plugin) = engine.plugin(name) else {
        bail!("Unknown plugin: {}", name);
    };
    if plugin.mode == ActivationMode::PerFile && log.is_none() {
        bail!("Plugin '{}' runs per file; pass --log <id>", name);
    }

    let ctx = engine.activation_context(&plugin, project, log)?;
    let result = engine
        .activate(&plugin, &ctx)
        .await
        .with_context(|| format!("plugin run {}", name));
    engine.shutdown().await?;
    result?;

    println!("plugin {} ok", name);
    Ok(())
}
