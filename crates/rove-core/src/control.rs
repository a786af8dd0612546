//! Exclusive control over one attached process.
//!
//! Launchers often wrap the real worker in a shell or console host, and the
//! visible window belongs to the wrapper. [`resolve_gui_owner`] walks the
//! parent/child/sibling relationships to find the process whose window
//! should be hidden and shown.

use std::io;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::process::{InspectorHandle, ProcessIdentity, ProcessInfo, ProcessTable};
use crate::window::{WindowHandle, WindowId, run_blocking};

/// How handles find and treat windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    /// Executables that host console windows.
    pub console_hosts: Vec<String>,
    /// Executables treated as launcher shells.
    pub shells: Vec<String>,
    /// Hide the owner window on attach and restore it on release.
    pub hide_on_attach: bool,
    /// How long to wait for a main window to appear.
    #[serde(rename = "window_search_ms", with = "millis")]
    pub window_search: Duration,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            console_hosts: [
                "conhost.exe",
                "xterm",
                "gnome-terminal-server",
                "konsole",
                "alacritty",
                "wezterm-gui",
            ]
            .map(String::from)
            .to_vec(),
            shells: [
                "cmd.exe",
                "powershell.exe",
                "pwsh.exe",
                "sh",
                "bash",
                "zsh",
                "dash",
                "fish",
            ]
            .map(String::from)
            .to_vec(),
            hide_on_attach: true,
            window_search: Duration::from_millis(200),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

const WINDOW_POLL_STEP: Duration = Duration::from_millis(20);

/// Pick the process whose window represents `worker`.
///
/// In priority order: the worker if one of its children is a console host,
/// the parent if a sibling is a console host, the parent if it is a shell,
/// otherwise the worker itself.
#[must_use]
pub fn resolve_gui_owner<'a>(
    table: &'a ProcessTable,
    worker: &'a ProcessInfo,
    settings: &ControlSettings,
) -> &'a ProcessInfo {
    let is_host = |p: &ProcessInfo| p.name_is_one_of(&settings.console_hosts);

    if table.children_of(worker.pid).any(is_host) {
        return worker;
    }
    let Some(parent) = table.parent_of(worker.pid) else {
        return worker;
    };
    if table
        .children_of(parent.pid)
        .any(|sibling| sibling.pid != worker.pid && is_host(sibling))
    {
        return parent;
    }
    if parent.name_is_one_of(&settings.shells) {
        return parent;
    }
    worker
}

/// Main window of `pid`, polled for up to `timeout`, then the single
/// top-level window of `pid` if there is exactly one.
pub async fn discover_window(
    windows: &WindowHandle,
    pid: u32,
    timeout: Duration,
) -> Option<WindowId> {
    let deadline = Instant::now() + timeout;
    loop {
        match run_blocking(windows, move |w| w.main_window(pid)).await {
            Ok(Some(window)) => return Some(window),
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(pid, error = %e, "window lookup failed");
                return None;
            }
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(WINDOW_POLL_STEP).await;
    }
    match run_blocking(windows, move |w| w.top_level_windows(pid)).await {
        Ok(all) => match all.as_slice() {
            [only] => Some(*only),
            _ => None,
        },
        Err(e) => {
            tracing::debug!(pid, error = %e, "window lookup failed");
            None
        }
    }
}

#[derive(Debug)]
struct HandleState {
    owner: ProcessIdentity,
    window: Option<WindowId>,
    hidden: bool,
    disposed: bool,
}

/// Held by a slot for as long as it is attached to a process.
///
/// [`release`](Self::release) gives the process back and restores its
/// window. Dropping an unreleased handle does the same synchronously.
pub struct ProcessControlHandle {
    worker: ProcessIdentity,
    inspector: InspectorHandle,
    windows: WindowHandle,
    settings: ControlSettings,
    state: Mutex<HandleState>,
}

impl std::fmt::Debug for ProcessControlHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessControlHandle")
            .field("worker", &self.worker)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ProcessControlHandle {
    /// Take control of `worker`, hiding its window when configured to.
    ///
    /// Returns `None` when the worker's identity is unreadable.
    pub async fn acquire(
        worker: &ProcessInfo,
        table: &ProcessTable,
        inspector: InspectorHandle,
        windows: WindowHandle,
        settings: ControlSettings,
    ) -> Option<Self> {
        let worker_id = worker.identity()?;
        let owner = resolve_gui_owner(table, worker, &settings);
        let owner_id = owner.identity().unwrap_or(worker_id);
        let window = discover_window(&windows, owner_id.pid, settings.window_search).await;

        tracing::debug!(
            pid = worker_id.pid,
            owner = owner_id.pid,
            window = ?window,
            backend = windows.name(),
            "acquired process"
        );

        let handle = Self {
            worker: worker_id,
            inspector,
            windows,
            state: Mutex::new(HandleState {
                owner: owner_id,
                window,
                hidden: false,
                disposed: false,
            }),
            settings,
        };
        if handle.settings.hide_on_attach {
            handle.hide().await;
        }
        Some(handle)
    }

    #[must_use]
    pub const fn identity(&self) -> ProcessIdentity {
        self.worker
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.worker.pid
    }

    /// Pid of the process whose window is managed.
    #[must_use]
    pub fn owner_pid(&self) -> u32 {
        self.state.lock().expect("handle lock poisoned").owner.pid
    }

    #[must_use]
    pub fn window(&self) -> Option<WindowId> {
        self.state.lock().expect("handle lock poisoned").window
    }

    #[must_use]
    pub fn is_hidden(&self) -> bool {
        self.state.lock().expect("handle lock poisoned").hidden
    }

    /// Released, or the worker has exited. A failing liveness query counts
    /// as exited.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        if self.state.lock().expect("handle lock poisoned").disposed {
            return true;
        }
        match self.inspector.is_alive(&self.worker) {
            Ok(alive) => !alive,
            Err(e) => {
                tracing::debug!(pid = self.worker.pid, error = %e, "liveness query failed");
                true
            }
        }
    }

    /// Kill the worker. No-op once disposed.
    pub fn kill(&self) -> io::Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        tracing::info!(pid = self.worker.pid, "killing process");
        self.inspector.kill(self.worker.pid)
    }

    /// Returns whether a window was actually shown.
    pub async fn show(&self) -> bool {
        self.apply_visibility(true).await
    }

    /// Returns whether a window was actually hidden.
    pub async fn hide(&self) -> bool {
        self.apply_visibility(false).await
    }

    async fn apply_visibility(&self, visible: bool) -> bool {
        let window = {
            let state = self.state.lock().expect("handle lock poisoned");
            if state.disposed {
                return false;
            }
            state.window
        };
        let Some(window) = window else {
            tracing::debug!(
                pid = self.worker.pid,
                visible,
                "no window found for process, visibility unchanged"
            );
            return false;
        };
        let result = run_blocking(&self.windows, move |w| w.set_visible(window, visible))
            .await
            .and_then(|r| r);
        match result {
            Ok(()) => {
                let mut state = self.state.lock().expect("handle lock poisoned");
                // Released meanwhile; release restored the window itself.
                if state.disposed || state.window != Some(window) {
                    return false;
                }
                state.hidden = !visible;
                true
            }
            Err(e) => {
                tracing::warn!(pid = self.worker.pid, %window, error = %e, "failed to change window visibility");
                false
            }
        }
    }

    /// Re-resolve the owner window when the owner exited but the worker
    /// lives on. The new window inherits the hidden state.
    pub async fn update(&self, table: &ProcessTable) {
        let owner = {
            let state = self.state.lock().expect("handle lock poisoned");
            if state.disposed || state.owner == self.worker {
                return;
            }
            state.owner
        };
        let owner_alive = table
            .get(owner.pid)
            .is_some_and(|p| p.identity() == Some(owner));
        if owner_alive {
            return;
        }
        let Some(worker) = table.get(self.worker.pid).filter(|p| p.identity() == Some(self.worker))
        else {
            return;
        };

        let new_owner = resolve_gui_owner(table, worker, &self.settings);
        let new_owner_id = new_owner.identity().unwrap_or(self.worker);
        let window = discover_window(
            &self.windows,
            new_owner_id.pid,
            self.settings.window_search,
        )
        .await;

        let hidden = {
            let mut state = self.state.lock().expect("handle lock poisoned");
            if state.disposed {
                return;
            }
            state.owner = new_owner_id;
            state.window = window;
            state.hidden
        };
        tracing::debug!(
            pid = self.worker.pid,
            old_owner = owner.pid,
            owner = new_owner_id.pid,
            window = ?window,
            "owner window re-resolved"
        );
        if hidden {
            self.hide().await;
        }
    }

    /// Release control, restoring a hidden window off the runtime.
    /// Idempotent.
    pub async fn release(&self) {
        let restore = {
            let mut state = self.state.lock().expect("handle lock poisoned");
            if state.disposed {
                return;
            }
            state.disposed = true;
            let restore = state.window.filter(|_| state.hidden);
            state.hidden = false;
            restore
        };
        if let Some(window) = restore {
            let result = run_blocking(&self.windows, move |w| w.set_visible(window, true))
                .await
                .and_then(|r| r);
            if let Err(e) = result {
                tracing::debug!(pid = self.worker.pid, error = %e, "could not restore window");
            }
        }
        tracing::debug!(pid = self.worker.pid, "released process");
    }

    /// Synchronous [`release`](Self::release), used on drop. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.state.lock().expect("handle lock poisoned");
        if state.disposed {
            return;
        }
        if state.hidden {
            if let Some(window) = state.window {
                if let Err(e) = self.windows.set_visible(window, true) {
                    tracing::debug!(pid = self.worker.pid, error = %e, "could not restore window");
                }
            }
            state.hidden = false;
        }
        state.disposed = true;
        tracing::debug!(pid = self.worker.pid, "released process");
    }
}

impl PartialEq for ProcessControlHandle {
    fn eq(&self, other: &Self) -> bool {
        self.worker.pid == other.worker.pid
    }
}

impl Eq for ProcessControlHandle {}

impl Drop for ProcessControlHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}
