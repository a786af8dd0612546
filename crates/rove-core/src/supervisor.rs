//! The periodic scan loop that drives every slot.
//!
//! Each tick enumerates processes once, filters them through the
//! [`SeenProcessRegistry`] and ticks all slots concurrently with the new
//! processes. [`Supervisor::start`] runs the loop on a background task; the
//! returned [`SupervisorHandle`] stops it and releases every process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{SlotConfig, ValidatedConfig};
use crate::environment::CurrentEnvironment;
use crate::error::{Error, Result};
use crate::events::{EventHandle, SupervisorEvent};
use crate::process::{ProcessInfo, ProcessTable, SysinfoInspector};
use crate::script::CommandScriptRunner;
use crate::seen::SeenProcessRegistry;
use crate::slot::{ProcessSlot, SlotContext};

/// Granularity at which the loop notices a shutdown request.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

pub struct Supervisor {
    slots: Vec<Arc<ProcessSlot>>,
    ctx: Arc<SlotContext>,
    seen: SeenProcessRegistry,
    /// Snapshot from the last successful scan.
    table: Arc<ProcessTable>,
    /// Executable names worth matching. Empty means all.
    process_names: Vec<String>,
    scan_interval: Duration,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("slots", &self.slots.len())
            .field("scan_interval", &self.scan_interval)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Build with the operating system collaborators: `sysinfo` processes,
    /// the configured window backend and real script execution.
    #[must_use]
    pub fn new(config: ValidatedConfig, events: EventHandle) -> Self {
        let environment = Arc::new(CurrentEnvironment::new(
            config.environments,
            config.default_environment.as_deref(),
        ));
        let ctx = Arc::new(SlotContext {
            inspector: Arc::new(SysinfoInspector::new()),
            windows: config.window_backend.build(),
            scripts: Arc::new(CommandScriptRunner::new(config.script_timeout)),
            environment,
            events,
            control: config.control,
            update_limit: config.update_limit,
            tail_tick: config.tail_interval,
        });
        Self::with_context(config.slots, ctx, config.process_names, config.scan_interval)
    }

    #[must_use]
    pub fn with_context(
        slots: Vec<SlotConfig>,
        ctx: Arc<SlotContext>,
        process_names: Vec<String>,
        scan_interval: Duration,
    ) -> Self {
        let slots = slots
            .into_iter()
            .map(|config| Arc::new(ProcessSlot::new(config, Arc::clone(&ctx))))
            .collect();
        Self {
            slots,
            ctx,
            seen: SeenProcessRegistry::new(),
            table: Arc::new(ProcessTable::default()),
            process_names,
            scan_interval,
        }
    }

    #[must_use]
    pub fn slots(&self) -> &[Arc<ProcessSlot>] {
        &self.slots
    }

    #[must_use]
    pub fn slot(&self, name: &str) -> Option<&Arc<ProcessSlot>> {
        self.slots.iter().find(|s| s.name() == name)
    }

    #[must_use]
    pub fn environment(&self) -> &Arc<CurrentEnvironment> {
        &self.ctx.environment
    }

    /// Select an environment by name, as an operator would.
    pub fn select_environment(&self, name: &str) -> bool {
        select_environment(&self.ctx, name)
    }

    /// Enumerate processes off the async runtime.
    pub async fn scan(&self) -> Result<Vec<ProcessInfo>> {
        let inspector = Arc::clone(&self.ctx.inspector);
        let processes = tokio::task::spawn_blocking(move || inspector.processes())
            .await
            .map_err(|e| Error::Task(e.to_string()))??;
        Ok(processes)
    }

    /// Running processes matched by each slot, in slot order.
    pub async fn matching_processes(&self) -> Result<Vec<(String, Vec<ProcessInfo>)>> {
        let processes = self.scan().await?;
        Ok(self
            .slots
            .iter()
            .map(|slot| {
                let matched = processes
                    .iter()
                    .filter(|p| self.is_candidate(p) && slot.matches(p))
                    .cloned()
                    .collect();
                (slot.name().to_string(), matched)
            })
            .collect())
    }

    fn is_candidate(&self, process: &ProcessInfo) -> bool {
        process.pid != std::process::id()
            && (self.process_names.is_empty() || process.name_is_one_of(&self.process_names))
    }

    /// One scan plus one step of every slot.
    ///
    /// A failed scan offers no new processes and leaves the seen registry
    /// untouched, so nothing is reported as new twice. Slots still step
    /// against the previous snapshot to notice exits.
    pub async fn tick(&mut self) {
        let fresh = match self.scan().await {
            Ok(processes) => {
                let candidates: Vec<ProcessInfo> = processes
                    .iter()
                    .filter(|p| self.is_candidate(p))
                    .cloned()
                    .collect();
                let fresh = self.seen.filter_new(candidates);
                self.table = Arc::new(ProcessTable::new(processes));
                debug!(processes = self.table.len(), new = fresh.len(), "scan complete");
                fresh
            }
            Err(e) => {
                warn!(error = %e, "process scan failed");
                self.ctx.events.emit(SupervisorEvent::Error {
                    slot: String::new(),
                    message: format!("process scan failed: {e}"),
                });
                Vec::new()
            }
        };
        let fresh = Arc::new(fresh);
        let table = &self.table;

        let mut join_set = JoinSet::new();
        for slot in &self.slots {
            let slot = Arc::clone(slot);
            let fresh = Arc::clone(&fresh);
            let table = Arc::clone(table);
            join_set.spawn(async move {
                slot.tick(&fresh, &table).await;
            });
        }
        while let Some(result) = join_set.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "slot tick failed");
                self.ctx.events.emit(SupervisorEvent::Error {
                    slot: String::new(),
                    message: format!("slot tick failed: {e}"),
                });
            }
        }
    }

    /// Release every slot's process and stop all tail readers.
    pub async fn shutdown(&self) {
        for slot in &self.slots {
            slot.shutdown().await;
        }
    }

    /// Run the scan loop on a background task.
    #[must_use]
    pub fn start(mut self) -> SupervisorHandle {
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let slots = self.slots.clone();
        let ctx = Arc::clone(&self.ctx);
        let flag = Arc::clone(&shutdown_flag);

        let task = tokio::spawn(async move {
            info!(slots = self.slots.len(), interval = ?self.scan_interval, "supervisor started");
            while !flag.load(Ordering::SeqCst) {
                let started = Instant::now();
                self.tick().await;
                while !flag.load(Ordering::SeqCst) {
                    let elapsed = started.elapsed();
                    if elapsed >= self.scan_interval {
                        break;
                    }
                    tokio::time::sleep((self.scan_interval - elapsed).min(SHUTDOWN_POLL)).await;
                }
            }
            self.shutdown().await;
            info!("supervisor stopped");
        });

        SupervisorHandle {
            shutdown_flag,
            task,
            slots,
            ctx,
        }
    }
}

fn select_environment(ctx: &SlotContext, name: &str) -> bool {
    let changed = ctx.environment.selection().as_deref() != Some(name);
    if !ctx.environment.select(name) {
        return false;
    }
    if changed {
        ctx.events.emit(SupervisorEvent::EnvironmentChanged {
            name: name.to_string(),
        });
    }
    true
}

/// Handle to a running supervisor loop.
pub struct SupervisorHandle {
    shutdown_flag: Arc<AtomicBool>,
    task: JoinHandle<()>,
    slots: Vec<Arc<ProcessSlot>>,
    ctx: Arc<SlotContext>,
}

impl std::fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("slots", &self.slots.len())
            .field("stopping", &self.shutdown_flag.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SupervisorHandle {
    #[must_use]
    pub fn slots(&self) -> &[Arc<ProcessSlot>] {
        &self.slots
    }

    #[must_use]
    pub fn slot(&self, name: &str) -> Option<&Arc<ProcessSlot>> {
        self.slots.iter().find(|s| s.name() == name)
    }

    #[must_use]
    pub fn environment(&self) -> &Arc<CurrentEnvironment> {
        &self.ctx.environment
    }

    pub fn select_environment(&self, name: &str) -> bool {
        select_environment(&self.ctx, name)
    }

    /// Signal shutdown without waiting.
    pub fn signal_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
    }

    /// Stop the loop and wait until every slot is released.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.task.await.map_err(|e| Error::Task(e.to_string()))
    }
}
