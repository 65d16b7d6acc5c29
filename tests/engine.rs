use async_trait::async_trait;
use logfacts::config::{Config, EngineConfig, QueueRouting};
use logfacts::engine::Engine;
use logfacts::error::EngineError;
use logfacts::models::{FactDraft, LogFile, SqlValue, Statement};
use logfacts::progress::ProgressEvent;
use logfacts::rules::{LineError, LogRules, PatternRules};
use logfacts::storage::{ConnectionRole, MemoryStorage, Storage, StorageConnection};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const RULES: &str = r#"
[db]
path = "unused.sqlite"

[log_types.app]
file_globs = ["*.log"]
unmatched_is_error = true
[[log_types.app.rules]]
name = "level"
pattern = '^(?P<level>INFO|WARN|ERROR) (?P<msg>.*)$'

[log_types.poison]
table = "poison_facts"
file_globs = ["*.poison"]
[[log_types.poison.rules]]
name = "any"
pattern = '^(?P<msg>.+)$'
"#;

fn rules() -> Arc<PatternRules> {
    let cfg: Config = toml::from_str(RULES).unwrap();
    Arc::new(PatternRules::from_config(&cfg).unwrap())
}

fn settings(channels: usize, workers: usize) -> EngineConfig {
    EngineConfig {
        max_parse_channels: channels,
        persistence_workers: workers,
        idle_poll_ms: 5,
        flush_poll_ms: 5,
        quiesce_ms: 5,
        ..EngineConfig::default()
    }
}

fn write_log(dir: &TempDir, name: &str, lines: &[String]) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, lines.join("\n") + "\n").unwrap();
    path
}

fn info_lines(n: usize, tag: &str) -> Vec<String> {
    (1..=n).map(|i| format!("INFO {} message {}", tag, i)).collect()
}

fn inserts(storage: &MemoryStorage, table: &str) -> Vec<logfacts::storage::memory::ExecutedStatement> {
    storage.executed_matching(&format!("INSERT INTO {} ", table))
}

fn int(v: &SqlValue) -> i64 {
    match v {
        SqlValue::Integer(i) => *i,
        other => panic!("expected integer, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn five_files_two_channels_one_worker() {
    let dir = TempDir::new().unwrap();
    let storage = MemoryStorage::new();
    let engine = Engine::start(settings(2, 1), Arc::new(storage.clone()), rules())
        .await
        .unwrap();

    let files: Vec<LogFile> = (1..=5)
        .map(|i| {
            let path = write_log(&dir, &format!("f{}.log", i), &info_lines(4, "x"));
            LogFile::new(i, 1, path, "app")
        })
        .collect();

    for handle in engine.submit_all(files).unwrap() {
        let report = handle.join().await.unwrap();
        assert!(report.is_ok());
        assert_eq!(report.file.facts_count, 4);
    }
    engine.flush_and_wait("test").await.unwrap();
    let report = engine.shutdown().await.unwrap();

    let executed = inserts(&storage, "facts_app");
    assert_eq!(executed.len(), 20);
    let unique: HashSet<(i64, i64)> = executed
        .iter()
        .map(|e| (int(&e.statement.params[0]), int(&e.statement.params[1])))
        .collect();
    assert_eq!(unique.len(), 20, "an operation was executed twice");
    assert!(executed.iter().all(|e| e.role == ConnectionRole::Worker(0)));

    assert_eq!(report.executed, 20);
    assert_eq!(report.abandoned, 0);
    assert!(storage.closed().contains(&ConnectionRole::Worker(0)));
}

/// Counts how many synchronous connections are open at once. Each parser
/// task holds one for the length of its run.
struct CountingStorage {
    inner: MemoryStorage,
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct CountingConnection {
    inner: Box<dyn StorageConnection>,
    current: Option<Arc<AtomicUsize>>,
}

#[async_trait]
impl Storage for CountingStorage {
    async fn connect(&self, role: ConnectionRole) -> anyhow::Result<Box<dyn StorageConnection>> {
        let inner = self.inner.connect(role).await?;
        let current = if role == ConnectionRole::Synchronous {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            Some(self.current.clone())
        } else {
            None
        };
        Ok(Box::new(CountingConnection { inner, current }))
    }
}

#[async_trait]
impl StorageConnection for CountingConnection {
    async fn execute(&mut self, statement: &Statement) -> anyhow::Result<u64> {
        self.inner.execute(statement).await
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        if let Some(current) = &self.current {
            current.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.close().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parse_channels_bound_concurrency() {
    let dir = TempDir::new().unwrap();
    let peak = Arc::new(AtomicUsize::new(0));
    let storage = CountingStorage {
        inner: MemoryStorage::new().with_latency(Duration::from_millis(2)),
        current: Arc::new(AtomicUsize::new(0)),
        peak: peak.clone(),
    };
    let engine = Engine::start(
        EngineConfig {
            write_behind: false,
            ..settings(3, 1)
        },
        Arc::new(storage),
        rules(),
    )
    .await
    .unwrap();

    let files: Vec<LogFile> = (1..=12)
        .map(|i| LogFile::new(i, 1, write_log(&dir, &format!("c{}.log", i), &info_lines(3, "c")), "app"))
        .collect();
    for handle in engine.submit_all(files).unwrap() {
        handle.join().await.unwrap();
    }

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 3, "peak concurrency {}", peak);
    assert_eq!(engine.channels().available(), 3);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn single_worker_persists_in_line_order() {
    let dir = TempDir::new().unwrap();
    let storage = MemoryStorage::new();
    let engine = Engine::start(settings(1, 1), Arc::new(storage.clone()), rules())
        .await
        .unwrap();

    let path = write_log(&dir, "ordered.log", &info_lines(25, "o"));
    engine
        .submit_parse(LogFile::new(9, 1, path, "app"))
        .unwrap()
        .join()
        .await
        .unwrap();
    engine.flush_and_wait("ordered").await.unwrap();

    let lines: Vec<i64> = inserts(&storage, "facts_app")
        .iter()
        .map(|e| int(&e.statement.params[2]))
        .collect();
    assert_eq!(lines, (1..=25).collect::<Vec<i64>>());
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn by_file_routing_keeps_each_file_on_one_worker() {
    let dir = TempDir::new().unwrap();
    let storage = MemoryStorage::new().with_latency(Duration::from_millis(1));
    let engine = Engine::start(
        EngineConfig {
            queue_routing: QueueRouting::ByFile,
            ..settings(3, 3)
        },
        Arc::new(storage.clone()),
        rules(),
    )
    .await
    .unwrap();

    let files: Vec<LogFile> = (1..=3)
        .map(|i| LogFile::new(i, 1, write_log(&dir, &format!("s{}.log", i), &info_lines(15, "s")), "app"))
        .collect();
    for handle in engine.submit_all(files).unwrap() {
        handle.join().await.unwrap();
    }
    engine.flush_and_wait("sharded").await.unwrap();
    engine.shutdown().await.unwrap();

    let executed = inserts(&storage, "facts_app");
    assert_eq!(executed.len(), 45);
    for file_id in 1..=3i64 {
        let of_file: Vec<_> = executed
            .iter()
            .filter(|e| int(&e.statement.params[0]) == file_id)
            .collect();
        let roles: HashSet<_> = of_file.iter().map(|e| e.role).collect();
        assert_eq!(roles.len(), 1, "file {} spread over workers", file_id);
        let lines: Vec<i64> = of_file.iter().map(|e| int(&e.statement.params[2])).collect();
        assert_eq!(lines, (1..=15).collect::<Vec<i64>>());
    }
}

#[tokio::test]
async fn bad_lines_are_counted_not_fatal() {
    let dir = TempDir::new().unwrap();
    let storage = MemoryStorage::new();
    let engine = Engine::start(settings(2, 1), Arc::new(storage.clone()), rules())
        .await
        .unwrap();

    let mut lines = info_lines(10, "ok");
    lines.insert(2, "garbage one".into());
    lines.insert(5, "garbage two".into());
    lines.push("garbage three".into());
    let path = write_log(&dir, "mixed.log", &lines);

    let report = engine
        .submit_parse(LogFile::new(3, 1, path, "app"))
        .unwrap()
        .join()
        .await
        .unwrap();
    assert!(report.is_ok());
    assert_eq!(report.file.facts_count, 10);
    assert_eq!(report.file.errors_count, 3);
    assert!(report.file.last_error.as_deref().unwrap().contains("line 13"));
    assert!(report.file.last_parsed_at.is_some());
    assert!(report.file.size_bytes > 0);

    // The run cleared old facts and upserted its row inline.
    let deletes = storage.executed_matching("DELETE FROM facts_app");
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].role, ConnectionRole::Synchronous);
    let upserts = storage.executed_matching("INSERT INTO log_files");
    assert_eq!(upserts.len(), 1);
    assert_eq!(upserts[0].statement.params[6], SqlValue::Integer(3));
    engine.shutdown().await.unwrap();
}

/// Rules that panic on the `boom` log type.
struct PanickyRules;

impl LogRules for PanickyRules {
    fn match_file(&self, _path: &Path) -> Option<String> {
        None
    }

    fn parse_line(&self, log_type: &str, _: u64, line: &str) -> Result<Vec<FactDraft>, LineError> {
        if log_type == "boom" {
            panic!("rule exploded");
        }
        Ok(vec![FactDraft {
            rule: "line".into(),
            fields: [("text".to_string(), line.to_string())].into_iter().collect(),
        }])
    }

    fn table_for(&self, _log_type: &str) -> Option<String> {
        Some("facts".into())
    }
}

#[tokio::test]
async fn panicking_task_returns_its_channel() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::start(settings(1, 1), Arc::new(MemoryStorage::new()), Arc::new(PanickyRules))
        .await
        .unwrap();

    let boom = engine
        .submit_parse(LogFile::new(1, 1, write_log(&dir, "a.log", &info_lines(2, "a")), "boom"))
        .unwrap();
    let good = engine
        .submit_parse(LogFile::new(2, 1, write_log(&dir, "b.log", &info_lines(2, "b")), "fine"))
        .unwrap();

    assert!(matches!(
        boom.join().await,
        Err(EngineError::TaskPanicked { log_file_id: 1 })
    ));
    let report = good.join().await.unwrap();
    assert_eq!(report.file.facts_count, 2);
    assert_eq!(engine.channels().available(), 1);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn panicking_task_still_reports_progress() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::start(settings(1, 1), Arc::new(MemoryStorage::new()), Arc::new(PanickyRules))
        .await
        .unwrap();
    let mut events = engine.subscribe();

    let handles = engine
        .submit_all(vec![LogFile::new(1, 1, write_log(&dir, "a.log", &info_lines(2, "a")), "boom")])
        .unwrap();
    for handle in handles {
        assert!(handle.join().await.is_err());
    }

    assert_eq!(events.recv().await, Some(ProgressEvent::Setup { total: 1 }));
    let mut errors = Vec::new();
    let mut steps = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ProgressEvent::Error { subject, message } => errors.push((subject, message)),
            ProgressEvent::Step { delta, .. } => steps += delta,
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(errors.len(), 1);
    assert!(errors[0].0.ends_with("a.log"));
    assert!(errors[0].1.contains("panicked"));
    assert_eq!(steps, 1);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_file_reports_error_and_frees_channel() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::start(settings(1, 1), Arc::new(MemoryStorage::new()), rules())
        .await
        .unwrap();
    let mut events = engine.subscribe();

    let missing = dir.path().join("nope.log");
    let report = engine
        .submit_parse(LogFile::new(4, 1, &missing, "app"))
        .unwrap()
        .join()
        .await
        .unwrap();
    assert!(!report.is_ok());
    assert_eq!(report.file.errors_count, 1);
    assert_eq!(engine.channels().available(), 1);

    match events.recv().await {
        Some(ProgressEvent::Error { subject, .. }) => {
            assert_eq!(subject, missing.display().to_string())
        }
        other => panic!("expected an Error event, got {:?}", other),
    }
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_log_type_aborts_only_that_file() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::start(settings(2, 1), Arc::new(MemoryStorage::new()), rules())
        .await
        .unwrap();
    let report = engine
        .submit_parse(LogFile::new(5, 1, write_log(&dir, "x.log", &info_lines(1, "x")), "nginx"))
        .unwrap()
        .join()
        .await
        .unwrap();
    assert!(report.aborted.unwrap().contains("nginx"));
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn without_write_behind_facts_are_written_inline() {
    let dir = TempDir::new().unwrap();
    let storage = MemoryStorage::new();
    let engine = Engine::start(
        EngineConfig {
            write_behind: false,
            ..settings(2, 2)
        },
        Arc::new(storage.clone()),
        rules(),
    )
    .await
    .unwrap();

    let path = write_log(&dir, "inline.log", &info_lines(6, "i"));
    engine
        .submit_parse(LogFile::new(6, 1, path, "app"))
        .unwrap()
        .join()
        .await
        .unwrap();

    // Written before join returned; nothing went through the queue.
    let executed = inserts(&storage, "facts_app");
    assert_eq!(executed.len(), 6);
    assert!(executed.iter().all(|e| e.role == ConnectionRole::Synchronous));
    assert_eq!(engine.outstanding(), 0);
    assert!(!storage.opened().iter().any(|r| matches!(r, ConnectionRole::Worker(_))));
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn zero_workers_falls_back_to_inline_writes() {
    let dir = TempDir::new().unwrap();
    let storage = MemoryStorage::new();
    let engine = Engine::start(settings(1, 0), Arc::new(storage.clone()), rules())
        .await
        .unwrap();
    let path = write_log(&dir, "zero.log", &info_lines(2, "z"));
    engine
        .submit_parse(LogFile::new(7, 1, path, "app"))
        .unwrap()
        .join()
        .await
        .unwrap();
    assert_eq!(inserts(&storage, "facts_app").len(), 2);
    engine.flush_and_wait("nothing queued").await.unwrap();
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_operations_are_dropped_and_workers_continue() {
    let dir = TempDir::new().unwrap();
    let storage = MemoryStorage::new().failing_on("poison_facts");
    let engine = Engine::start(settings(2, 1), Arc::new(storage.clone()), rules())
        .await
        .unwrap();

    let bad = engine
        .submit_parse(LogFile::new(1, 1, write_log(&dir, "a.poison", &info_lines(3, "p")), "poison"))
        .unwrap();
    let good = engine
        .submit_parse(LogFile::new(2, 1, write_log(&dir, "b.log", &info_lines(4, "g")), "app"))
        .unwrap();

    let bad = bad.join().await.unwrap();
    // Only the inline clear fails on the file itself; queued inserts fail later.
    assert_eq!(bad.file.errors_count, 1);
    good.join().await.unwrap();

    engine.flush_and_wait("poison").await.unwrap();
    let report = engine.shutdown().await.unwrap();
    assert_eq!(report.failed, 3);
    assert_eq!(report.executed, 4);
    assert_eq!(inserts(&storage, "facts_app").len(), 4);
}

#[tokio::test]
async fn flush_reports_progress_until_drained() {
    let storage = MemoryStorage::new().with_latency(Duration::from_millis(3));
    let engine = Engine::start(settings(1, 1), Arc::new(storage.clone()), rules())
        .await
        .unwrap();
    let mut events = engine.subscribe();

    for i in 0..10i64 {
        let id = engine
            .enqueue(Statement::new("INSERT INTO t VALUES (?)").bind(i), format!("row {}", i))
            .unwrap();
        assert_eq!(id.0, i as u64 + 1);
    }
    engine.flush_and_wait("bulk").await.unwrap();
    assert_eq!(engine.outstanding(), 0);
    assert_eq!(storage.executed_matching("INSERT INTO t").len(), 10);

    let mut saw_step = false;
    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        match event {
            ProgressEvent::Step { .. } => saw_step = true,
            ProgressEvent::Completed { subject, .. } => completed = Some(subject),
            _ => {}
        }
    }
    assert!(saw_step);
    assert_eq!(completed.as_deref(), Some("bulk"));
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn batch_submit_reports_setup_then_steps() {
    let dir = TempDir::new().unwrap();
    let engine = Engine::start(settings(2, 1), Arc::new(MemoryStorage::new()), rules())
        .await
        .unwrap();
    let mut events = engine.subscribe();

    let files: Vec<LogFile> = (1..=3)
        .map(|i| LogFile::new(i, 1, write_log(&dir, &format!("b{}.log", i), &info_lines(1, "b")), "app"))
        .collect();
    for handle in engine.submit_all(files).unwrap() {
        handle.join().await.unwrap();
    }

    assert_eq!(events.recv().await, Some(ProgressEvent::Setup { total: 3 }));
    let mut steps = 0;
    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            ProgressEvent::Step { delta, .. } => steps += delta,
            ProgressEvent::Completed { .. } => completed += 1,
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!((steps, completed), (3, 3));
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn reconfigure_carries_queued_operations_over() {
    let storage = MemoryStorage::new().with_latency(Duration::from_millis(2));
    let engine = Engine::start(settings(1, 1), Arc::new(storage.clone()), rules())
        .await
        .unwrap();

    for i in 0..20i64 {
        engine
            .enqueue(Statement::new("INSERT INTO t VALUES (?)").bind(i), "carry")
            .unwrap();
    }
    engine
        .reconfigure(EngineConfig {
            queue_routing: QueueRouting::ByFile,
            ..settings(4, 2)
        })
        .await
        .unwrap();

    assert_eq!(engine.channels().capacity(), 4);
    assert_eq!(engine.channels().available(), 4);
    assert_eq!(engine.settings().persistence_workers, 2);

    engine.flush_and_wait("carry").await.unwrap();
    assert_eq!(storage.executed_matching("INSERT INTO t").len(), 20);
    engine.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shrinking_channels_holds_waiting_tasks_to_new_capacity() {
    let dir = TempDir::new().unwrap();
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let storage = CountingStorage {
        inner: MemoryStorage::new().with_latency(Duration::from_millis(3)),
        current: current.clone(),
        peak: peak.clone(),
    };
    let engine = Engine::start(
        EngineConfig {
            write_behind: false,
            ..settings(3, 1)
        },
        Arc::new(storage),
        rules(),
    )
    .await
    .unwrap();
    let before = engine.channels();

    let files: Vec<LogFile> = (1..=9)
        .map(|i| LogFile::new(i, 1, write_log(&dir, &format!("r{}.log", i), &info_lines(4, "r")), "app"))
        .collect();
    let handles = engine.submit_all(files).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    engine
        .reconfigure(EngineConfig {
            write_behind: false,
            ..settings(1, 1)
        })
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&before, &engine.channels()));

    // Tasks that were already running finish; after that only one at a time.
    while engine.channels().in_use() > 1 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    peak.store(current.load(Ordering::SeqCst), Ordering::SeqCst);

    for handle in handles {
        handle.join().await.unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 1, "peak {}", peak.load(Ordering::SeqCst));
    assert_eq!(engine.channels().capacity(), 1);
    assert_eq!(engine.channels().available(), 1);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn reconfigure_rejects_invalid_settings() {
    let engine = Engine::start(settings(2, 1), Arc::new(MemoryStorage::new()), rules())
        .await
        .unwrap();
    let result = engine.reconfigure(settings(0, 1)).await;
    assert!(matches!(result, Err(EngineError::Config(_))));
    assert_eq!(engine.channels().capacity(), 2);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn execute_now_surfaces_storage_errors() {
    let engine = Engine::start(
        settings(1, 1),
        Arc::new(MemoryStorage::new().failing_on("boom")),
        rules(),
    )
    .await
    .unwrap();
    assert_eq!(engine.execute_now(&Statement::new("UPDATE ok")).await.unwrap(), 1);
    match engine.execute_now(&Statement::new("UPDATE boom")).await {
        Err(EngineError::Storage { caption, .. }) => assert_eq!(caption, "execute_now"),
        other => panic!("expected storage error, got {:?}", other),
    }
    engine.shutdown().await.unwrap();
}
