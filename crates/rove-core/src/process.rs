//! Operating-system process inspection.
//!
//! The supervisor only needs three things from the OS: a snapshot of running
//! processes (with parent links and command lines), an "is this exact process
//! still alive" query, and a way to kill a process. These sit behind
//! [`ProcessInspector`] so the state machine can run against a fake table in
//! tests.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// Identity of an OS process: pid plus start time.
///
/// Pids are reused by the OS, so two identities are equal only when both
/// fields match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    /// Start time in seconds since the Unix epoch.
    pub start_time: u64,
}

impl ProcessIdentity {
    #[must_use]
    pub const fn new(pid: u32, start_time: u64) -> Self {
        Self { pid, start_time }
    }
}

impl std::fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pid, self.start_time)
    }
}

/// One entry of a process snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    /// `None` when the start time could not be read (process vanished or
    /// access denied mid-enumeration).
    pub start_time: Option<u64>,
    pub parent: Option<u32>,
    /// Executable name, e.g. `java` or `conhost.exe`.
    pub name: String,
    /// Raw argument vector.
    pub cmd: Vec<String>,
}

impl ProcessInfo {
    /// Identity if the start time is known.
    #[must_use]
    pub fn identity(&self) -> Option<ProcessIdentity> {
        self.start_time
            .map(|start_time| ProcessIdentity::new(self.pid, start_time))
    }

    /// Full command line, arguments joined by single spaces.
    #[must_use]
    pub fn command_line(&self) -> String {
        if self.cmd.is_empty() {
            return self.name.clone();
        }
        self.cmd.join(" ")
    }

    /// Case-insensitive match of the executable name against `names`.
    ///
    /// A trailing `.exe` is ignored on both sides so one list covers every
    /// platform.
    #[must_use]
    pub fn name_is_one_of(&self, names: &[String]) -> bool {
        let own = normalize_name(&self.name);
        names.iter().any(|n| normalize_name(n) == own)
    }
}

fn normalize_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    lower
        .strip_suffix(".exe")
        .map_or_else(|| lower.clone(), str::to_string)
}

/// A snapshot indexed by pid and by parent pid.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    by_pid: HashMap<u32, ProcessInfo>,
    children: HashMap<u32, Vec<u32>>,
}

impl ProcessTable {
    #[must_use]
    pub fn new(processes: Vec<ProcessInfo>) -> Self {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for process in &processes {
            if let Some(parent) = process.parent {
                children.entry(parent).or_default().push(process.pid);
            }
        }
        for kids in children.values_mut() {
            kids.sort_unstable();
        }
        let by_pid = processes.into_iter().map(|p| (p.pid, p)).collect();
        Self { by_pid, children }
    }

    #[must_use]
    pub fn get(&self, pid: u32) -> Option<&ProcessInfo> {
        self.by_pid.get(&pid)
    }

    #[must_use]
    pub fn parent_of(&self, pid: u32) -> Option<&ProcessInfo> {
        self.get(pid)
            .and_then(|p| p.parent)
            .and_then(|parent| self.get(parent))
    }

    /// Direct children of `pid`, ordered by pid.
    pub fn children_of(&self, pid: u32) -> impl Iterator<Item = &ProcessInfo> + '_ {
        self.children
            .get(&pid)
            .into_iter()
            .flatten()
            .filter_map(|child| self.by_pid.get(child))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_pid.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_pid.is_empty()
    }
}

/// Access to the operating system's process list.
pub trait ProcessInspector: Send + Sync {
    /// Enumerate every running process.
    fn processes(&self) -> io::Result<Vec<ProcessInfo>>;

    /// Whether the process with exactly this identity is still running.
    fn is_alive(&self, identity: &ProcessIdentity) -> io::Result<bool>;

    /// Forcefully terminate `pid`.
    fn kill(&self, pid: u32) -> io::Result<()>;
}

/// Shared handle to a process inspector.
pub type InspectorHandle = Arc<dyn ProcessInspector>;

/// [`ProcessInspector`] backed by the `sysinfo` crate.
pub struct SysinfoInspector {
    system: Mutex<System>,
}

impl SysinfoInspector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::OnlyIfNotSet)
    }
}

impl Default for SysinfoInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInspector for SysinfoInspector {
    fn processes(&self) -> io::Result<Vec<ProcessInfo>> {
        let mut system = self.system.lock().expect("sysinfo lock poisoned");
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, Self::refresh_kind());

        let processes = system
            .processes()
            .values()
            .map(|process| {
                let start_time = process.start_time();
                ProcessInfo {
                    pid: process.pid().as_u32(),
                    start_time: (start_time != 0).then_some(start_time),
                    parent: process.parent().map(|p| p.as_u32()),
                    name: process.name().to_string_lossy().into_owned(),
                    cmd: process
                        .cmd()
                        .iter()
                        .map(|arg| arg.to_string_lossy().into_owned())
                        .collect(),
                }
            })
            .collect();
        Ok(processes)
    }

    fn is_alive(&self, identity: &ProcessIdentity) -> io::Result<bool> {
        let pid = Pid::from_u32(identity.pid);
        let mut system = self.system.lock().expect("sysinfo lock poisoned");
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing(),
        );
        Ok(system
            .process(pid)
            .is_some_and(|p| p.start_time() == identity.start_time))
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        let sys_pid = Pid::from_u32(pid);
        let mut system = self.system.lock().expect("sysinfo lock poisoned");
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::nothing(),
        );
        match system.process(sys_pid) {
            Some(process) if process.kill() => Ok(()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("failed to kill process {pid}"),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("process {pid} is not running"),
            )),
        }
    }
}
