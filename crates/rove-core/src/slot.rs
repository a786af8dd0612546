//! One configured process definition and its attachment state machine.
//!
//! A slot moves through `Unattached -> Attached -> Tailing` and back. The
//! supervisor drives it with [`ProcessSlot::tick`]; tail readers deliver
//! batches through a channel pumped into the same per-slot lock, so a tick
//! and a delivery never interleave.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::classify::{LogPipeline, LogRun, RunningCounters, advisory_text};
use crate::config::{Color, SlotConfig};
use crate::control::{ControlSettings, ProcessControlHandle};
use crate::environment::CurrentEnvironment;
use crate::error::{Result, ScriptError};
use crate::events::{DetachReason, EventHandle, EventSink, SupervisorEvent};
use crate::polling::BoundedExponentialPollingInterval;
use crate::process::{InspectorHandle, ProcessInfo, ProcessTable};
use crate::script::{ScriptRef, ScriptRunnerHandle};
use crate::tail::{LogBatch, TailSession};
use crate::window::WindowHandle;

/// Batches buffered between a tail reader and its slot.
pub const BATCH_CHANNEL_CAPACITY: usize = 64;

/// Placeholder shown while discovery finds no log file.
pub const WAITING_FOR_LOG: &str = "Waiting for log file";

/// Collaborators shared by every slot.
pub struct SlotContext {
    pub inspector: InspectorHandle,
    pub windows: WindowHandle,
    pub scripts: ScriptRunnerHandle,
    pub environment: Arc<CurrentEnvironment>,
    pub events: EventHandle,
    pub control: ControlSettings,
    /// Characters per second before rendering is suppressed. 0 disables.
    pub update_limit: u64,
    pub tail_tick: Duration,
}

impl std::fmt::Debug for SlotContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotContext")
            .field("windows", &self.windows.name())
            .field("environment", &self.environment.selection())
            .field("update_limit", &self.update_limit)
            .field("tail_tick", &self.tail_tick)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Unattached,
    /// Attached, log file not found yet.
    Attached,
    Tailing,
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unattached => "unattached",
            Self::Attached => "attached",
            Self::Tailing => "tailing",
        })
    }
}

/// Point-in-time view of a slot for hosts and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub name: String,
    pub color: Color,
    pub auto_scroll: bool,
    pub status: SlotStatus,
    pub pid: Option<u32>,
    pub command_line: Option<String>,
    pub log_path: Option<PathBuf>,
    pub counters: RunningCounters,
    pub hidden: bool,
    pub rendering: bool,
    pub suppressed: bool,
    pub advisory: Option<String>,
    pub placeholder: Option<String>,
    pub total_lines: u64,
    pub runs: Vec<LogRun>,
}

struct Attachment {
    handle: ProcessControlHandle,
    /// Resolved once at attach time.
    command_line: String,
    tail: Option<TailSession>,
    /// Whether a session was opened during this attachment. Only the first
    /// one is a new session.
    opened_session: bool,
    discovery: BoundedExponentialPollingInterval,
}

struct SlotState {
    attached: Option<Attachment>,
    pipeline: LogPipeline,
    auto_scroll: bool,
    /// Bumped on every attach and detach. Batches from an older
    /// attachment are dropped.
    generation: u64,
}

impl SlotState {
    fn status(&self) -> SlotStatus {
        match &self.attached {
            None => SlotStatus::Unattached,
            Some(a) if a.tail.is_some() => SlotStatus::Tailing,
            Some(_) => SlotStatus::Attached,
        }
    }

    fn deliver(&mut self, slot: &str, events: &dyn EventSink, batch: LogBatch) {
        let was_suppressed = self.pipeline.is_suppressed();
        let effects = self.pipeline.apply(batch);

        if effects.cleared {
            events.emit(SupervisorEvent::Cleared {
                slot: slot.to_string(),
            });
        }
        if let Some(rate) = effects.advisory_rate {
            if !was_suppressed || effects.cleared {
                events.emit(SupervisorEvent::Advisory {
                    slot: slot.to_string(),
                    rate,
                    text: advisory_text(rate),
                });
            }
        }
        if !effects.runs.is_empty() {
            events.emit(SupervisorEvent::Lines {
                slot: slot.to_string(),
                runs: effects.runs,
            });
        }
        if effects.counters_changed {
            events.emit(SupervisorEvent::Counters {
                slot: slot.to_string(),
                counters: self.pipeline.counters().clone(),
            });
        }
    }
}

pub struct ProcessSlot {
    config: SlotConfig,
    ctx: Arc<SlotContext>,
    state: Arc<Mutex<SlotState>>,
}

impl std::fmt::Debug for ProcessSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSlot")
            .field("name", &self.config.name)
            .field("identity", &self.config.identity.as_str())
            .finish_non_exhaustive()
    }
}

impl ProcessSlot {
    #[must_use]
    pub fn new(config: SlotConfig, ctx: Arc<SlotContext>) -> Self {
        let pipeline = LogPipeline::new(
            config.classifier.clone(),
            ctx.update_limit,
            config.log_history,
        );
        let state = SlotState {
            attached: None,
            pipeline,
            auto_scroll: config.auto_scroll,
            generation: 0,
        };
        Self {
            config,
            ctx,
            state: Arc::new(Mutex::new(state)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn config(&self) -> &SlotConfig {
        &self.config
    }

    /// Whether `process`'s command line matches this slot.
    #[must_use]
    pub fn matches(&self, process: &ProcessInfo) -> bool {
        self.config.identity.is_match(&process.command_line())
    }

    pub async fn status(&self) -> SlotStatus {
        self.state.lock().await.status()
    }

    /// Advance the state machine by one step.
    ///
    /// `new_processes` are processes first seen in this scan; `table` is the
    /// full snapshot used for window-owner resolution.
    pub async fn tick(&self, new_processes: &[ProcessInfo], table: &ProcessTable) {
        let mut state = self.state.lock().await;

        if state.attached.is_none() {
            let Some(worker) = new_processes.iter().find(|p| self.matches(p)) else {
                return;
            };
            self.attach(&mut state, worker, table).await;
        }

        let Some(attachment) = state.attached.as_ref() else {
            return;
        };
        if attachment.handle.is_disposed() {
            self.detach(&mut state, DetachReason::ProcessExited).await;
            return;
        }
        attachment.handle.update(table).await;

        let discover = match &attachment.tail {
            None => attachment.discovery.is_time_for_polling(),
            Some(tail) => {
                let idle = tail.is_idle(self.config.idle_recheck);
                if idle {
                    debug!(slot = %self.config.name, path = %tail.path().display(), "log idle, rechecking location");
                    tail.reset_idle_timer();
                }
                idle
            }
        };
        if discover {
            self.discover(&mut state).await;
        }
    }

    async fn attach(&self, state: &mut SlotState, worker: &ProcessInfo, table: &ProcessTable) {
        let Some(handle) = ProcessControlHandle::acquire(
            worker,
            table,
            Arc::clone(&self.ctx.inspector),
            Arc::clone(&self.ctx.windows),
            self.ctx.control.clone(),
        )
        .await
        else {
            debug!(slot = %self.config.name, pid = worker.pid, "process vanished before attach");
            return;
        };

        let command_line = worker.command_line();
        info!(slot = %self.config.name, pid = worker.pid, "attached to process");
        self.emit(SupervisorEvent::Attached {
            slot: self.config.name.clone(),
            pid: worker.pid,
            command_line: command_line.clone(),
        });
        if handle.is_hidden() {
            self.emit(SupervisorEvent::VisibilityChanged {
                slot: self.config.name.clone(),
                visible: false,
            });
        }

        if let Some(script) = &self.config.set_environment {
            match self.run_script(script, &command_line).await {
                Ok(lines) => self.apply_environment(&lines),
                Err(e) => self.report(format!("set_environment failed: {e}")),
            }
        }
        let lifecycle = [
            ("on_new_process", &self.config.on_new_process),
            ("on_process_started", &self.config.on_process_started),
        ];
        for (label, script) in lifecycle {
            if let Some(script) = script {
                if let Err(e) = self.run_script(script, &command_line).await {
                    self.report(format!("{label} failed: {e}"));
                }
            }
        }

        state.generation += 1;
        state.attached = Some(Attachment {
            handle,
            command_line,
            tail: None,
            opened_session: false,
            discovery: BoundedExponentialPollingInterval::new(),
        });
    }

    fn apply_environment(&self, lines: &[String]) {
        match lines {
            [] => {}
            [name] => {
                let before = self.ctx.environment.selection();
                if !self.ctx.environment.select(name) {
                    self.report(format!("set_environment printed unknown environment '{name}'"));
                } else if before.as_deref() != Some(name.as_str()) {
                    info!(slot = %self.config.name, environment = %name, "environment selected");
                    self.emit(SupervisorEvent::EnvironmentChanged { name: name.clone() });
                }
            }
            more => {
                warn!(
                    slot = %self.config.name,
                    lines = more.len(),
                    "set_environment printed more than one line, selection unchanged"
                );
            }
        }
    }

    /// Run the find-log-file script and act on its answer.
    async fn discover(&self, state: &mut SlotState) {
        let Some(attachment) = state.attached.as_ref() else {
            return;
        };
        let command_line = attachment.command_line.clone();
        let current = attachment.tail.as_ref().map(|t| t.path().to_path_buf());

        let lines = match self.run_script(&self.config.find_log_file, &command_line).await {
            Ok(lines) => lines,
            Err(e) => {
                self.report(format!("log file discovery failed: {e}"));
                return;
            }
        };

        let candidate = match lines.as_slice() {
            [] => {
                if current.is_none() {
                    self.show_waiting(state, WAITING_FOR_LOG.to_string());
                }
                return;
            }
            [line] => PathBuf::from(line),
            more => {
                let reason = format!(
                    "log file discovery printed {} lines, expected exactly one",
                    more.len()
                );
                self.detach(state, DetachReason::Fatal(reason)).await;
                return;
            }
        };

        if current.as_deref() == Some(candidate.as_path()) {
            return;
        }
        if !candidate.is_file() {
            if current.is_none() {
                self.show_waiting(state, format!("{WAITING_FOR_LOG} {}", candidate.display()));
            } else {
                debug!(slot = %self.config.name, path = %candidate.display(), "rediscovered log does not exist, keeping current");
            }
            return;
        }
        self.open_tail(state, candidate).await;
    }

    fn show_waiting(&self, state: &mut SlotState, text: String) {
        let view = state.pipeline.view_mut();
        if view.placeholder() == Some(text.as_str()) {
            return;
        }
        view.set_placeholder(Some(text.clone()));
        self.emit(SupervisorEvent::Notice {
            slot: self.config.name.clone(),
            text,
        });
    }

    async fn open_tail(&self, state: &mut SlotState, path: PathBuf) {
        let Some(attachment) = state.attached.as_mut() else {
            return;
        };
        if let Some(old) = attachment.tail.take() {
            old.dispose().await;
        }
        let is_new_session = !attachment.opened_session;
        let (tx, rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);

        match TailSession::open(&path, is_new_session, self.ctx.tail_tick, tx).await {
            Ok(session) => {
                attachment.opened_session = true;
                attachment.tail = Some(session);
                let generation = state.generation;
                self.spawn_pump(rx, generation);

                info!(slot = %self.config.name, path = %path.display(), is_new_session, "tailing log file");
                if is_new_session {
                    state.pipeline.reset();
                    self.emit(SupervisorEvent::Cleared {
                        slot: self.config.name.clone(),
                    });
                    self.emit(SupervisorEvent::Counters {
                        slot: self.config.name.clone(),
                        counters: RunningCounters::default(),
                    });
                }
                state.pipeline.view_mut().set_placeholder(None);
                self.emit(SupervisorEvent::LogFileOpened {
                    slot: self.config.name.clone(),
                    path,
                    new_session: is_new_session,
                });
            }
            Err(e) => {
                self.detach(state, DetachReason::Fatal(e.to_string())).await;
            }
        }
    }

    /// Forward batches from one tail session into the slot under its lock.
    /// Ends when the session's reader exits.
    fn spawn_pump(&self, mut rx: mpsc::Receiver<LogBatch>, generation: u64) {
        let state = Arc::clone(&self.state);
        let events = Arc::clone(&self.ctx.events);
        let name = self.config.name.clone();
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let mut state = state.lock().await;
                if state.generation != generation || state.attached.is_none() {
                    continue;
                }
                state.deliver(&name, events.as_ref(), batch);
            }
        });
    }

    async fn detach(&self, state: &mut SlotState, reason: DetachReason) {
        let Some(attachment) = state.attached.take() else {
            return;
        };
        state.generation += 1;
        if let Some(tail) = attachment.tail {
            tail.dispose().await;
        }
        let pid = attachment.handle.pid();
        let was_hidden = attachment.handle.is_hidden();
        attachment.handle.release().await;
        state.pipeline.view_mut().set_placeholder(None);

        match &reason {
            DetachReason::Fatal(why) => {
                warn!(slot = %self.config.name, pid, reason = %why, "detached after fatal error");
            }
            _ => info!(slot = %self.config.name, pid, reason = %reason, "detached"),
        }
        if was_hidden {
            self.emit(SupervisorEvent::VisibilityChanged {
                slot: self.config.name.clone(),
                visible: true,
            });
        }
        self.emit(SupervisorEvent::Detached {
            slot: self.config.name.clone(),
            pid,
            reason,
        });
    }

    /// Resolve, run and check a script, passing the target's command line.
    async fn run_script(
        &self,
        script: &ScriptRef,
        command_line: &str,
    ) -> std::result::Result<Vec<String>, ScriptError> {
        let invocation = script
            .resolve(&self.ctx.environment)?
            .with_arg(command_line);
        let output = self.ctx.scripts.run(&invocation).await?;
        output.check()?;
        Ok(output.stdout)
    }

    fn emit(&self, event: SupervisorEvent) {
        self.ctx.events.emit(event);
    }

    fn report(&self, message: String) {
        warn!(slot = %self.config.name, "{message}");
        self.emit(SupervisorEvent::Error {
            slot: self.config.name.clone(),
            message,
        });
    }

    // ─── operator actions ───

    /// Kill the attached process. Returns false when unattached.
    pub async fn kill(&self) -> Result<bool> {
        let state = self.state.lock().await;
        let Some(attachment) = state.attached.as_ref() else {
            return Ok(false);
        };
        attachment.handle.kill()?;
        Ok(true)
    }

    pub async fn show(&self) -> bool {
        let state = self.state.lock().await;
        self.set_visible(&state, true).await
    }

    pub async fn hide(&self) -> bool {
        let state = self.state.lock().await;
        self.set_visible(&state, false).await
    }

    pub async fn toggle_visibility(&self) -> bool {
        let state = self.state.lock().await;
        let Some(hidden) = state.attached.as_ref().map(|a| a.handle.is_hidden()) else {
            return false;
        };
        self.set_visible(&state, hidden).await
    }

    async fn set_visible(&self, state: &SlotState, visible: bool) -> bool {
        let Some(attachment) = state.attached.as_ref() else {
            return false;
        };
        let changed = if visible {
            attachment.handle.show().await
        } else {
            attachment.handle.hide().await
        };
        if changed {
            self.emit(SupervisorEvent::VisibilityChanged {
                slot: self.config.name.clone(),
                visible,
            });
        }
        changed
    }

    /// Launch the configured start script. Returns false when none is
    /// configured or the slot is already attached.
    pub async fn start_process(&self) -> Result<bool> {
        let Some(script) = &self.config.start_process else {
            return Ok(false);
        };
        if self.state.lock().await.attached.is_some() {
            return Ok(false);
        }
        let invocation = script.resolve(&self.ctx.environment)?;
        self.ctx.scripts.spawn_detached(&invocation)?;
        info!(slot = %self.config.name, program = %invocation.name(), "start script launched");
        Ok(true)
    }

    /// Pause or resume rendering. Resuming emits the buffered backlog.
    pub async fn set_rendering(&self, enabled: bool) {
        let mut state = self.state.lock().await;
        let flushed = state.pipeline.view_mut().set_rendering(enabled);
        if !flushed.is_empty() {
            self.emit(SupervisorEvent::Lines {
                slot: self.config.name.clone(),
                runs: flushed,
            });
        }
    }

    pub async fn set_auto_scroll(&self, enabled: bool) {
        self.state.lock().await.auto_scroll = enabled;
    }

    pub async fn snapshot(&self) -> SlotSnapshot {
        let state = self.state.lock().await;
        let attachment = state.attached.as_ref();
        let view = state.pipeline.view();
        SlotSnapshot {
            name: self.config.name.clone(),
            color: self.config.color,
            auto_scroll: state.auto_scroll,
            status: state.status(),
            pid: attachment.map(|a| a.handle.pid()),
            command_line: attachment.map(|a| a.command_line.clone()),
            log_path: attachment
                .and_then(|a| a.tail.as_ref())
                .map(|t| t.path().to_path_buf()),
            counters: state.pipeline.counters().clone(),
            hidden: attachment.is_some_and(|a| a.handle.is_hidden()),
            rendering: view.is_rendering(),
            suppressed: state.pipeline.is_suppressed(),
            advisory: view.advisory().map(str::to_string),
            placeholder: view.placeholder().map(str::to_string),
            total_lines: state.pipeline.total_lines(),
            runs: view.runs(),
        }
    }

    /// Release the process and stop tailing.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        self.detach(&mut state, DetachReason::Shutdown).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::classify::{Classifier, LineClass};
    use crate::environment::{EnvironmentEntry, EnvironmentMapping};
    use crate::events::ChannelSink;
    use crate::process::tests::proc;
    use crate::process::{ProcessIdentity, ProcessInspector};
    use crate::script::{ScriptFuture, ScriptInvocation, ScriptOutput, ScriptRunner};
    use crate::window::HeadlessWindows;
    use regex::Regex;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::io::{self, Write};
    use std::path::Path;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(5);

    // ─── fakes ───

    #[derive(Default)]
    pub(crate) struct FakeInspector {
        pub(crate) processes: std::sync::Mutex<Vec<ProcessInfo>>,
        pub(crate) killed: std::sync::Mutex<Vec<u32>>,
        pub(crate) failing: std::sync::atomic::AtomicBool,
    }

    impl FakeInspector {
        pub(crate) fn set(&self, processes: Vec<ProcessInfo>) {
            *self.processes.lock().unwrap() = processes;
        }

        pub(crate) fn fail_scans(&self, failing: bool) {
            self.failing.store(failing, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl ProcessInspector for FakeInspector {
        fn processes(&self) -> io::Result<Vec<ProcessInfo>> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(io::Error::other("process list unavailable"));
            }
            Ok(self.processes.lock().unwrap().clone())
        }

        fn is_alive(&self, identity: &ProcessIdentity) -> io::Result<bool> {
            let alive: HashSet<ProcessIdentity> = self
                .processes
                .lock()
                .unwrap()
                .iter()
                .filter_map(ProcessInfo::identity)
                .collect();
            Ok(alive.contains(identity))
        }

        fn kill(&self, pid: u32) -> io::Result<()> {
            self.killed.lock().unwrap().push(pid);
            self.processes.lock().unwrap().retain(|p| p.pid != pid);
            Ok(())
        }
    }

    /// Answers scripts by file name from queued outputs. An empty queue
    /// answers with a clean, silent exit.
    #[derive(Default)]
    pub(crate) struct FakeRunner {
        pub(crate) answers: std::sync::Mutex<HashMap<String, VecDeque<ScriptOutput>>>,
        pub(crate) calls: std::sync::Mutex<Vec<(String, Vec<String>)>>,
        pub(crate) detached: std::sync::Mutex<Vec<String>>,
    }

    impl FakeRunner {
        pub(crate) fn answer(&self, name: &str, stdout: &[&str]) {
            self.push(name, Some(0), stdout, &[]);
        }

        pub(crate) fn push(&self, name: &str, exit_code: Option<i32>, stdout: &[&str], stderr: &[&str]) {
            self.answers
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default()
                .push_back(ScriptOutput {
                    program: name.to_string(),
                    exit_code,
                    stdout: stdout.iter().map(|s| (*s).to_string()).collect(),
                    stderr: stderr.iter().map(|s| (*s).to_string()).collect(),
                });
        }

        pub(crate) fn calls_to(&self, name: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|(n, _)| n == name).count()
        }
    }

    impl ScriptRunner for FakeRunner {
        fn run<'a>(&'a self, invocation: &'a ScriptInvocation) -> ScriptFuture<'a, ScriptOutput> {
            Box::pin(async move {
                let name = invocation.name();
                self.calls
                    .lock()
                    .unwrap()
                    .push((name.clone(), invocation.args.clone()));
                let queued = self
                    .answers
                    .lock()
                    .unwrap()
                    .get_mut(&name)
                    .and_then(VecDeque::pop_front);
                Ok(queued.unwrap_or(ScriptOutput {
                    program: name,
                    exit_code: Some(0),
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                }))
            })
        }

        fn spawn_detached(&self, invocation: &ScriptInvocation) -> std::result::Result<(), ScriptError> {
            self.detached.lock().unwrap().push(invocation.name());
            Ok(())
        }
    }

    pub(crate) struct Harness {
        pub(crate) dir: TempDir,
        pub(crate) inspector: Arc<FakeInspector>,
        pub(crate) runner: Arc<FakeRunner>,
        pub(crate) ctx: Arc<SlotContext>,
        pub(crate) events: mpsc::UnboundedReceiver<SupervisorEvent>,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let dev = dir.path().join("dev");
            let prod = dir.path().join("prod");
            std::fs::create_dir_all(&dev).unwrap();
            std::fs::create_dir_all(&prod).unwrap();
            let mapping = EnvironmentMapping::new([
                EnvironmentEntry::new("Dev", dev.display().to_string()),
                EnvironmentEntry::new("Prod", prod.display().to_string()),
            ]);
            let inspector = Arc::new(FakeInspector::default());
            let runner = Arc::new(FakeRunner::default());
            let (sink, events) = ChannelSink::new();
            let ctx = Arc::new(SlotContext {
                inspector: inspector.clone(),
                windows: Arc::new(HeadlessWindows),
                scripts: runner.clone(),
                environment: Arc::new(CurrentEnvironment::new(mapping, Some("Dev"))),
                events: Arc::new(sink),
                control: ControlSettings {
                    window_search: Duration::ZERO,
                    ..ControlSettings::default()
                },
                update_limit: 0,
                tail_tick: Duration::from_millis(10),
            });
            Self {
                dir,
                inspector,
                runner,
                ctx,
                events,
            }
        }

        /// Create an empty script file and return its reference.
        pub(crate) fn script(&self, name: &str) -> ScriptRef {
            let path = self.dir.path().join(name);
            std::fs::write(&path, "").unwrap();
            ScriptRef::new(path.display().to_string())
        }

        pub(crate) fn slot_config(&self, name: &str, pattern: &str) -> SlotConfig {
            let mut config = SlotConfig::new(
                name,
                Regex::new(pattern).unwrap(),
                self.script("find.sh"),
            );
            config.classifier = Classifier::new(
                Some(Regex::new("ERROR").unwrap()),
                Some(Regex::new("WARN").unwrap()),
                None,
            );
            config
        }

        pub(crate) fn log(&self, name: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, "").unwrap();
            path
        }

        pub(crate) fn drain(&mut self) -> Vec<SupervisorEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        /// Wait for the first event accepted by `pick`.
        pub(crate) async fn wait_for<T>(&mut self, mut pick: impl FnMut(&SupervisorEvent) -> Option<T>) -> T {
            tokio::time::timeout(WAIT, async {
                loop {
                    let event = self.events.recv().await.expect("event channel open");
                    if let Some(found) = pick(&event) {
                        return found;
                    }
                }
            })
            .await
            .expect("expected event in time")
        }
    }

    pub(crate) fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn java(pid: u32) -> ProcessInfo {
        proc(pid, Some(1), "java", &["java", "-jar", "shop.jar"])
    }

    async fn tick_with(slot: &ProcessSlot, h: &Harness, new: &[ProcessInfo]) {
        let table = ProcessTable::new(h.inspector.processes().unwrap());
        slot.tick(new, &table).await;
    }

    // ─── attachment ───

    #[tokio::test]
    async fn attaches_and_tails_in_one_tick() {
        let mut h = Harness::new();
        let log = h.log("shop.log");
        h.runner.answer("find.sh", &[&log.display().to_string()]);
        let slot = ProcessSlot::new(h.slot_config("Shop", "java.*shop"), h.ctx.clone());

        let other = proc(20, Some(1), "python", &["python", "web.py"]);
        h.inspector.set(vec![other.clone(), java(21)]);
        tick_with(&slot, &h, &[other, java(21)]).await;

        assert_eq!(slot.status().await, SlotStatus::Tailing);
        let calls = h.runner.calls.lock().unwrap().clone();
        assert_eq!(calls[0].1, vec!["java -jar shop.jar".to_string()]);

        let events = h.drain();
        assert!(matches!(events[0], SupervisorEvent::Attached { pid: 21, .. }));
        assert!(events.iter().any(|e| matches!(
            e,
            SupervisorEvent::LogFileOpened { new_session: true, .. }
        )));

        append(&log, "hello\nERROR boom\n");
        let runs = h
            .wait_for(|e| match e {
                SupervisorEvent::Lines { runs, .. } => Some(runs.clone()),
                _ => None,
            })
            .await;
        assert_eq!(
            runs,
            vec![
                LogRun::single(LineClass::Info, "hello"),
                LogRun::single(LineClass::Error, "ERROR boom"),
            ]
        );
        let snapshot = slot.snapshot().await;
        assert_eq!(snapshot.counters.error_count, 1);
        assert_eq!(snapshot.pid, Some(21));
        assert_eq!(snapshot.log_path.as_deref(), Some(log.as_path()));

        slot.shutdown().await;
        assert_eq!(slot.status().await, SlotStatus::Unattached);
    }

    #[tokio::test]
    async fn attached_slot_ignores_further_matches() {
        let h = Harness::new();
        let slot = ProcessSlot::new(h.slot_config("Shop", "java.*shop"), h.ctx.clone());
        h.inspector.set(vec![java(21), java(22)]);

        tick_with(&slot, &h, &[java(21)]).await;
        tick_with(&slot, &h, &[java(22)]).await;
        assert_eq!(slot.snapshot().await.pid, Some(21));
    }

    #[tokio::test]
    async fn two_discovery_lines_detach_within_one_tick() {
        let mut h = Harness::new();
        h.runner.answer("find.sh", &["/a.log", "/b.log"]);
        let slot = ProcessSlot::new(h.slot_config("Shop", "shop"), h.ctx.clone());
        h.inspector.set(vec![java(21)]);

        tick_with(&slot, &h, &[java(21)]).await;

        assert_eq!(slot.status().await, SlotStatus::Unattached);
        let detached = h.drain().into_iter().find_map(|e| match e {
            SupervisorEvent::Detached { reason, .. } => Some(reason),
            _ => None,
        });
        assert!(matches!(detached, Some(DetachReason::Fatal(_))));
    }

    #[tokio::test]
    async fn empty_discovery_shows_waiting_and_retries() {
        let mut h = Harness::new();
        let slot = ProcessSlot::new(h.slot_config("Shop", "shop"), h.ctx.clone());
        h.inspector.set(vec![java(21)]);

        tick_with(&slot, &h, &[java(21)]).await;
        assert_eq!(slot.status().await, SlotStatus::Attached);
        assert_eq!(slot.snapshot().await.placeholder.as_deref(), Some(WAITING_FOR_LOG));

        // The first backoff entries are immediate.
        let log = h.log("late.log");
        h.runner.answer("find.sh", &[&log.display().to_string()]);
        tick_with(&slot, &h, &[]).await;
        assert_eq!(slot.status().await, SlotStatus::Tailing);
        assert_eq!(h.runner.calls_to("find.sh"), 2);

        let notices = h
            .drain()
            .into_iter()
            .filter(|e| matches!(e, SupervisorEvent::Notice { .. }))
            .count();
        assert_eq!(notices, 1);
        assert!(slot.snapshot().await.placeholder.is_none());
    }

    #[tokio::test]
    async fn discovery_errors_are_reported_and_not_fatal() {
        let mut h = Harness::new();
        h.runner.push("find.sh", Some(0), &["/x.log"], &["permission denied"]);
        let slot = ProcessSlot::new(h.slot_config("Shop", "shop"), h.ctx.clone());
        h.inspector.set(vec![java(21)]);

        tick_with(&slot, &h, &[java(21)]).await;
        assert_eq!(slot.status().await, SlotStatus::Attached);
        assert!(h
            .drain()
            .iter()
            .any(|e| matches!(e, SupervisorEvent::Error { message, .. } if message.contains("discovery"))));
    }

    #[tokio::test]
    async fn process_exit_detaches() {
        let mut h = Harness::new();
        let log = h.log("shop.log");
        h.runner.answer("find.sh", &[&log.display().to_string()]);
        let slot = ProcessSlot::new(h.slot_config("Shop", "shop"), h.ctx.clone());
        h.inspector.set(vec![java(21)]);
        tick_with(&slot, &h, &[java(21)]).await;
        assert_eq!(slot.status().await, SlotStatus::Tailing);

        h.inspector.set(Vec::new());
        tick_with(&slot, &h, &[]).await;
        assert_eq!(slot.status().await, SlotStatus::Unattached);
        assert!(h.drain().iter().any(|e| matches!(
            e,
            SupervisorEvent::Detached {
                reason: DetachReason::ProcessExited,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn vanished_log_file_is_fatal_for_attachment() {
        let h = Harness::new();
        let log = h.log("shop.log");
        h.runner.answer("find.sh", &[&log.display().to_string()]);
        let slot = ProcessSlot::new(h.slot_config("Shop", "shop"), h.ctx.clone());
        h.inspector.set(vec![java(21)]);

        let mut state = slot.state.lock().await;
        let table = ProcessTable::new(h.inspector.processes().unwrap());
        slot.attach(&mut state, &java(21), &table).await;
        std::fs::remove_file(&log).unwrap();
        slot.open_tail(&mut state, log).await;
        assert!(state.attached.is_none());
    }

    #[tokio::test]
    async fn set_environment_selects_printed_name() {
        let mut h = Harness::new();
        let mut config = h.slot_config("Shop", "shop");
        config.set_environment = Some(h.script("set-env.sh"));
        config.on_process_started = Some(h.script("started.sh"));
        h.runner.answer("set-env.sh", &["Prod"]);
        let slot = ProcessSlot::new(config, h.ctx.clone());
        h.inspector.set(vec![java(21)]);

        tick_with(&slot, &h, &[java(21)]).await;
        assert_eq!(h.ctx.environment.selection().as_deref(), Some("Prod"));
        assert_eq!(h.runner.calls_to("started.sh"), 1);
        assert!(h
            .drain()
            .iter()
            .any(|e| matches!(e, SupervisorEvent::EnvironmentChanged { name } if name == "Prod")));
    }

    #[tokio::test]
    async fn idle_recheck_switches_to_rotated_log() {
        let mut h = Harness::new();
        let first = h.log("a.log");
        let second = h.log("b.log");
        h.runner.answer("find.sh", &[&first.display().to_string()]);
        h.runner.answer("find.sh", &[&second.display().to_string()]);
        let mut config = h.slot_config("Shop", "shop");
        config.idle_recheck = Duration::from_millis(30);
        let slot = ProcessSlot::new(config, h.ctx.clone());
        h.inspector.set(vec![java(21)]);

        tick_with(&slot, &h, &[java(21)]).await;
        append(&first, "ERROR early\n");
        h.wait_for(|e| matches!(e, SupervisorEvent::Lines { .. }).then_some(()))
            .await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        tick_with(&slot, &h, &[]).await;

        let snapshot = slot.snapshot().await;
        assert_eq!(snapshot.log_path.as_deref(), Some(second.as_path()));
        // Path continuation keeps the counters.
        assert_eq!(snapshot.counters.error_count, 1);
        assert!(h.drain().iter().any(|e| matches!(
            e,
            SupervisorEvent::LogFileOpened { new_session: false, .. }
        )));
    }

    #[tokio::test]
    async fn reattachment_starts_a_new_session() {
        let mut h = Harness::new();
        let log = h.log("shop.log");
        let path = log.display().to_string();
        h.runner.answer("find.sh", &[&path]);
        h.runner.answer("find.sh", &[&path]);
        let slot = ProcessSlot::new(h.slot_config("Shop", "shop"), h.ctx.clone());

        h.inspector.set(vec![java(21)]);
        tick_with(&slot, &h, &[java(21)]).await;
        append(&log, "ERROR first\n");
        h.wait_for(|e| matches!(e, SupervisorEvent::Lines { .. }).then_some(()))
            .await;

        h.inspector.set(vec![java(30)]);
        tick_with(&slot, &h, &[]).await;
        tick_with(&slot, &h, &[java(30)]).await;
        let snapshot = slot.snapshot().await;
        assert_eq!(snapshot.pid, Some(30));
        assert_eq!(snapshot.counters.error_count, 0);
        assert!(snapshot.runs.is_empty());
    }

    // ─── operator actions ───

    #[tokio::test]
    async fn kill_targets_attached_process() {
        let h = Harness::new();
        let slot = ProcessSlot::new(h.slot_config("Shop", "shop"), h.ctx.clone());
        assert!(!slot.kill().await.unwrap());

        h.inspector.set(vec![java(21)]);
        tick_with(&slot, &h, &[java(21)]).await;
        assert!(slot.kill().await.unwrap());
        assert_eq!(*h.inspector.killed.lock().unwrap(), vec![21]);
    }

    #[tokio::test]
    async fn headless_visibility_changes_nothing() {
        let h = Harness::new();
        let slot = ProcessSlot::new(h.slot_config("Shop", "shop"), h.ctx.clone());
        h.inspector.set(vec![java(21)]);
        tick_with(&slot, &h, &[java(21)]).await;
        assert!(!slot.show().await);
        assert!(!slot.toggle_visibility().await);
        assert!(!slot.snapshot().await.hidden);
    }

    #[tokio::test]
    async fn start_process_only_when_unattached() {
        let h = Harness::new();
        let mut config = h.slot_config("Shop", "shop");
        config.start_process = Some(h.script("start.sh"));
        let slot = ProcessSlot::new(config, h.ctx.clone());
        assert!(slot.start_process().await.unwrap());
        assert_eq!(*h.runner.detached.lock().unwrap(), vec!["start.sh".to_string()]);

        h.inspector.set(vec![java(21)]);
        tick_with(&slot, &h, &[java(21)]).await;
        assert!(!slot.start_process().await.unwrap());

        let plain = ProcessSlot::new(h.slot_config("Other", "other"), h.ctx.clone());
        assert!(!plain.start_process().await.unwrap());
    }

    #[tokio::test]
    async fn paused_rendering_flushes_backlog() {
        let mut h = Harness::new();
        let log = h.log("shop.log");
        h.runner.answer("find.sh", &[&log.display().to_string()]);
        let slot = ProcessSlot::new(h.slot_config("Shop", "shop"), h.ctx.clone());
        h.inspector.set(vec![java(21)]);
        tick_with(&slot, &h, &[java(21)]).await;

        slot.set_rendering(false).await;
        slot.set_auto_scroll(false).await;
        append(&log, "a\nb\n");
        tokio::time::timeout(WAIT, async {
            while slot.snapshot().await.total_lines < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!h.drain().iter().any(|e| matches!(e, SupervisorEvent::Lines { .. })));

        slot.set_rendering(true).await;
        let flushed = h.drain().into_iter().find_map(|e| match e {
            SupervisorEvent::Lines { runs, .. } => Some(runs),
            _ => None,
        });
        assert_eq!(
            flushed,
            Some(vec![LogRun::new(LineClass::Info, vec!["a".into(), "b".into()])])
        );
        assert!(!slot.snapshot().await.auto_scroll);
    }
}
