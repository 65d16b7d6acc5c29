//! Parse and flush progress reporting.
//!
//! Producers (parser tasks, `flush_and_wait`, batch submission) call
//! [`ProgressReporter::report`] from any thread. Events go through a
//! single-consumer channel to whoever last called
//! [`subscribe`](ProgressReporter::subscribe); the subscriber chooses where
//! to consume them. Events from one producer arrive in emission order.
//!
//! Human-readable output goes to **stderr** so stdout stays parseable.

use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// A single progress event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Reset the counter to `0` of `total`.
    Setup { total: u64 },
    /// Advance the counter by `delta`.
    Step { delta: u64, message: String },
    /// A subject (log file, flush label) finished.
    Completed { subject: String, message: String },
    /// A subject failed.
    Error { subject: String, message: String },
}

/// Sending half, cloned into every producer.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    tx: Arc<Mutex<Option<UnboundedSender<ProgressEvent>>>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the single observer. A previous subscriber stops receiving.
    pub fn subscribe(&self) -> UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock() = Some(tx);
        rx
    }

    pub fn report(&self, event: ProgressEvent) {
        let mut guard = self.tx.lock();
        if let Some(tx) = guard.as_ref() {
            if tx.send(event).is_err() {
                tracing::trace!("progress observer went away");
                *guard = None;
            }
        }
    }

    pub fn setup(&self, total: u64) {
        self.report(ProgressEvent::Setup { total });
    }

    pub fn step(&self, delta: u64, message: impl Into<String>) {
        self.report(ProgressEvent::Step {
            delta,
            message: message.into(),
        });
    }

    pub fn completed(&self, subject: impl Into<String>, message: impl Into<String>) {
        self.report(ProgressEvent::Completed {
            subject: subject.into(),
            message: message.into(),
        });
    }

    pub fn error(&self, subject: impl Into<String>, message: impl Into<String>) {
        self.report(ProgressEvent::Error {
            subject: subject.into(),
            message: message.into(),
        });
    }
}

/// Bounded `[0, total]` counter driven by `Setup`/`Step`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgressCounter {
    pub value: u64,
    pub total: u64,
}

impl ProgressCounter {
    pub fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Setup { total } => {
                self.total = *total;
                self.value = 0;
            }
            ProgressEvent::Step { delta, .. } => {
                self.value = self.value.saturating_add(*delta).min(self.total);
            }
            _ => {}
        }
    }
}

/// Consumes progress events on the observer's side.
pub trait ProgressObserver: Send {
    fn observe(&mut self, event: &ProgressEvent);
}

/// Human-friendly progress on stderr: "parse  12 / 40  app.log: 1,234 facts".
#[derive(Default)]
pub struct StderrProgress {
    counter: ProgressCounter,
}

impl ProgressObserver for StderrProgress {
    fn observe(&mut self, event: &ProgressEvent) {
        self.counter.apply(event);
        let line = match event {
            ProgressEvent::Setup { total } => {
                format!("parse  0 / {} files\n", format_number(*total))
            }
            ProgressEvent::Step { message, .. } => format!(
                "parse  {} / {}  {}\n",
                format_number(self.counter.value),
                format_number(self.counter.total),
                message
            ),
            ProgressEvent::Completed { subject, message } => {
                format!("done   {}  {}\n", subject, message)
            }
            ProgressEvent::Error { subject, message } => {
                format!("error  {}  {}\n", subject, message)
            }
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
#[derive(Default)]
pub struct JsonProgress {
    counter: ProgressCounter,
}

impl ProgressObserver for JsonProgress {
    fn observe(&mut self, event: &ProgressEvent) {
        self.counter.apply(event);
        let obj = match event {
            ProgressEvent::Setup { total } => serde_json::json!({
                "event": "setup",
                "total": total
            }),
            ProgressEvent::Step { delta, message } => serde_json::json!({
                "event": "step",
                "delta": delta,
                "n": self.counter.value,
                "total": self.counter.total,
                "message": message
            }),
            ProgressEvent::Completed { subject, message } => serde_json::json!({
                "event": "completed",
                "subject": subject,
                "message": message
            }),
            ProgressEvent::Error { subject, message } => serde_json::json!({
                "event": "error",
                "subject": subject,
                "message": message
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op observer when progress is disabled.
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn observe(&mut self, _event: &ProgressEvent) {}
}

/// Drive `observer` on its own task until every reporter handle is gone or
/// a new subscriber replaces this one.
pub fn spawn_observer(
    mut rx: UnboundedReceiver<ProgressEvent>,
    mut observer: Box<dyn ProgressObserver>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            observer.observe(&event);
        }
    })
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn observer(&self) -> Box<dyn ProgressObserver> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress::default()),
            ProgressMode::Json => Box::new(JsonProgress::default()),
        }
    }
}
