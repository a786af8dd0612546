//! Domain events emitted by the supervisor.
//!
//! Slots never talk to a renderer directly. They publish
//! [`SupervisorEvent`]s to an injected [`EventSink`], and the host decides
//! how to consume them (a channel into its event loop, plain logging, or an
//! in-memory history).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::classify::{LogRun, RunningCounters};

/// Recent messages kept by [`HistorySink`].
pub const MESSAGE_HISTORY: usize = 1000;

/// Why a slot let go of its process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DetachReason {
    ProcessExited,
    /// Log discovery or opening failed in a way retrying cannot fix.
    Fatal(String),
    Shutdown,
}

impl std::fmt::Display for DetachReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProcessExited => f.write_str("process exited"),
            Self::Fatal(reason) => write!(f, "{reason}"),
            Self::Shutdown => f.write_str("supervisor shutting down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    Attached {
        slot: String,
        pid: u32,
        command_line: String,
    },
    Detached {
        slot: String,
        pid: u32,
        reason: DetachReason,
    },
    LogFileOpened {
        slot: String,
        path: PathBuf,
        new_session: bool,
    },
    /// The slot's view was emptied.
    Cleared { slot: String },
    Lines { slot: String, runs: Vec<LogRun> },
    /// Rendering is suppressed; `rate` is chars/s over the traffic window.
    Advisory { slot: String, rate: f64, text: String },
    Counters {
        slot: String,
        counters: RunningCounters,
    },
    /// Informational text such as the "waiting for log file" placeholder.
    Notice { slot: String, text: String },
    EnvironmentChanged { name: String },
    VisibilityChanged { slot: String, visible: bool },
    /// Non-fatal failure. `slot` is empty for supervisor-level errors.
    Error { slot: String, message: String },
}

impl SupervisorEvent {
    /// Slot the event belongs to, if any.
    #[must_use]
    pub fn slot(&self) -> Option<&str> {
        match self {
            Self::Attached { slot, .. }
            | Self::Detached { slot, .. }
            | Self::LogFileOpened { slot, .. }
            | Self::Cleared { slot }
            | Self::Lines { slot, .. }
            | Self::Advisory { slot, .. }
            | Self::Counters { slot, .. }
            | Self::Notice { slot, .. }
            | Self::VisibilityChanged { slot, .. } => Some(slot),
            Self::Error { slot, .. } => (!slot.is_empty()).then_some(slot.as_str()),
            Self::EnvironmentChanged { .. } => None,
        }
    }

    /// One-line operator message, for events worth one.
    #[must_use]
    pub fn message(&self) -> Option<String> {
        match self {
            Self::Attached { slot, pid, .. } => Some(format!("{slot}: attached to process {pid}")),
            Self::Detached { slot, pid, reason } => {
                Some(format!("{slot}: released process {pid} ({reason})"))
            }
            Self::LogFileOpened { slot, path, .. } => {
                Some(format!("{slot}: tailing {}", path.display()))
            }
            Self::Notice { slot, text } => Some(format!("{slot}: {text}")),
            Self::EnvironmentChanged { name } => Some(format!("environment set to {name}")),
            Self::Error { slot, message } if slot.is_empty() => Some(message.clone()),
            Self::Error { slot, message } => Some(format!("{slot}: {message}")),
            _ => None,
        }
    }
}

/// Receives supervisor events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SupervisorEvent);
}

pub type EventHandle = Arc<dyn EventSink>;

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: SupervisorEvent) {
        // A closed channel means the host stopped listening.
        let _ = self.tx.send(event);
    }
}

/// Logs events through `tracing` and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: SupervisorEvent) {
        match &event {
            SupervisorEvent::Error { slot, message } => {
                tracing::warn!(slot = %slot, "{message}");
            }
            SupervisorEvent::Lines { slot, runs } => {
                let lines: usize = runs.iter().map(|r| r.lines.len()).sum();
                tracing::trace!(slot = %slot, lines, "lines");
            }
            SupervisorEvent::Advisory { slot, rate, .. } => {
                tracing::debug!(slot = %slot, rate, "rendering suppressed");
            }
            other => {
                if let Some(message) = other.message() {
                    tracing::info!("{message}");
                }
            }
        }
    }
}

/// A timestamped operator message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub is_error: bool,
    pub text: String,
}

/// Keeps the most recent operator messages and forwards every event.
pub struct HistorySink {
    inner: EventHandle,
    capacity: usize,
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl HistorySink {
    #[must_use]
    pub fn new(inner: EventHandle) -> Self {
        Self::with_capacity(inner, MESSAGE_HISTORY)
    }

    #[must_use]
    pub fn with_capacity(inner: EventHandle, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .expect("history lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

impl EventSink for HistorySink {
    fn emit(&self, event: SupervisorEvent) {
        if let Some(text) = event.message() {
            let mut entries = self.entries.lock().expect("history lock poisoned");
            entries.push_back(HistoryEntry {
                at: Utc::now(),
                is_error: matches!(event, SupervisorEvent::Error { .. }),
                text,
            });
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }
        self.inner.emit(event);
    }
}
