//! Desktop window access for attached processes.
//!
//! Only three capabilities are needed: find the main window of a pid, list
//! every top-level window of a pid, and map/unmap a window. Headless hosts
//! use [`HeadlessWindows`], where every process simply has no window.
//!
//! Backends may block on external commands. Async code goes through
//! [`run_blocking`] so those calls never occupy a runtime worker.

use std::io;
use std::process::{Command, Stdio};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Opaque window id as reported by the window system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowId(pub u64);

impl std::fmt::Display for WindowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

pub trait WindowSystem: Send + Sync {
    /// Main (visible) window of `pid`, if the window system knows one.
    fn main_window(&self, pid: u32) -> Option<WindowId>;

    /// All top-level windows owned by `pid`, visible or not.
    fn top_level_windows(&self, pid: u32) -> Vec<WindowId>;

    fn set_visible(&self, window: WindowId, visible: bool) -> io::Result<()>;

    /// Backend name for diagnostics.
    fn name(&self) -> &'static str;
}

pub type WindowHandle = Arc<dyn WindowSystem>;

/// Run one window-system call on the blocking pool.
pub async fn run_blocking<T, F>(windows: &WindowHandle, call: F) -> io::Result<T>
where
    F: FnOnce(&dyn WindowSystem) -> T + Send + 'static,
    T: Send + 'static,
{
    let windows = Arc::clone(windows);
    tokio::task::spawn_blocking(move || call(windows.as_ref()))
        .await
        .map_err(|e| io::Error::other(format!("window task failed: {e}")))
}

/// Which [`WindowSystem`] to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowBackend {
    /// xdotool when an X display answers, headless otherwise.
    #[default]
    Auto,
    Headless,
    Xdotool,
}

impl WindowBackend {
    #[must_use]
    pub fn build(self) -> WindowHandle {
        match self {
            Self::Headless => Arc::new(HeadlessWindows),
            Self::Xdotool => Arc::new(XdotoolWindows::new()),
            Self::Auto => {
                if XdotoolWindows::available() {
                    Arc::new(XdotoolWindows::new())
                } else {
                    tracing::debug!("no X display with xdotool, windows are not managed");
                    Arc::new(HeadlessWindows)
                }
            }
        }
    }
}

/// No windows anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessWindows;

impl WindowSystem for HeadlessWindows {
    fn main_window(&self, _pid: u32) -> Option<WindowId> {
        None
    }

    fn top_level_windows(&self, _pid: u32) -> Vec<WindowId> {
        Vec::new()
    }

    fn set_visible(&self, window: WindowId, _visible: bool) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("window {window} cannot be changed without a window system"),
        ))
    }

    fn name(&self) -> &'static str {
        "headless"
    }
}

/// X11 windows through the `xdotool` command.
#[derive(Debug, Clone)]
pub struct XdotoolWindows {
    program: String,
}

impl XdotoolWindows {
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: "xdotool".to_string(),
        }
    }

    /// `DISPLAY` is set and `xdotool` runs.
    #[must_use]
    pub fn available() -> bool {
        if std::env::var_os("DISPLAY").is_none_or(|d| d.is_empty()) {
            return false;
        }
        Command::new("xdotool")
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    fn search(&self, pid: u32, only_visible: bool) -> Vec<WindowId> {
        let mut command = Command::new(&self.program);
        command.arg("search");
        if only_visible {
            command.arg("--onlyvisible");
        }
        command.arg("--pid").arg(pid.to_string());

        match command.stderr(Stdio::null()).output() {
            // xdotool exits 1 when nothing matched.
            Ok(output) => parse_window_ids(&output.stdout),
            Err(e) => {
                tracing::debug!(pid, error = %e, "xdotool search failed");
                Vec::new()
            }
        }
    }
}

impl Default for XdotoolWindows {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_window_ids(stdout: &[u8]) -> Vec<WindowId> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter_map(|line| line.trim().parse::<u64>().ok())
        .map(WindowId)
        .collect()
}

impl WindowSystem for XdotoolWindows {
    fn main_window(&self, pid: u32) -> Option<WindowId> {
        self.search(pid, true).into_iter().next()
    }

    fn top_level_windows(&self, pid: u32) -> Vec<WindowId> {
        self.search(pid, false)
    }

    fn set_visible(&self, window: WindowId, visible: bool) -> io::Result<()> {
        let action = if visible { "windowmap" } else { "windowunmap" };
        let status = Command::new(&self.program)
            .arg(action)
            .arg(window.0.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("xdotool {action} {window} failed: {status}")))
        }
    }

    fn name(&self) -> &'static str {
        "xdotool"
    }
}
