//! End-to-end supervision with real scripts and log files.
//!
//! Processes come from a scripted inspector so the tests do not depend on
//! what happens to be running on the machine.

#![cfg(unix)]

use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rove_core::control::ControlSettings;
use rove_core::events::ChannelSink;
use rove_core::process::ProcessTable;
use rove_core::script::CommandScriptRunner;
use rove_core::slot::SlotContext;
use rove_core::window::HeadlessWindows;
use rove_core::{
    Config, CurrentEnvironment, DetachReason, LineClass, ProcessIdentity, ProcessInfo,
    ProcessInspector, SlotStatus, Supervisor, SupervisorEvent, ValidatedConfig,
};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct ScriptedInspector {
    processes: Mutex<Vec<ProcessInfo>>,
}

impl ScriptedInspector {
    fn set(&self, processes: Vec<ProcessInfo>) {
        *self.processes.lock().unwrap() = processes;
    }
}

impl ProcessInspector for ScriptedInspector {
    fn processes(&self) -> io::Result<Vec<ProcessInfo>> {
        Ok(self.processes.lock().unwrap().clone())
    }

    fn is_alive(&self, identity: &ProcessIdentity) -> io::Result<bool> {
        Ok(self
            .processes
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.identity() == Some(*identity)))
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        self.processes.lock().unwrap().retain(|p| p.pid != pid);
        Ok(())
    }
}

fn server(pid: u32) -> ProcessInfo {
    ProcessInfo {
        pid,
        start_time: Some(5_000 + u64::from(pid)),
        parent: Some(1),
        name: "java".to_string(),
        cmd: vec!["java".into(), "-jar".into(), "shop server.jar".into()],
    }
}

fn write_script(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn append(path: &Path, text: &str) {
    let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(text.as_bytes()).unwrap();
}

struct Fixture {
    dir: TempDir,
    dev_log: PathBuf,
    prod_log: PathBuf,
    config: ValidatedConfig,
}

/// Two environments whose find scripts point at different logs, and a
/// set-environment script choosing Prod.
fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let dev_log = root.join("dev.log");
    let prod_log = root.join("prod.log");
    std::fs::write(&dev_log, "").unwrap();
    std::fs::write(&prod_log, "").unwrap();

    for (env, log) in [("dev", &dev_log), ("prod", &prod_log)] {
        write_script(
            &root.join(env).join("find.sh"),
            &format!(
                "printf '%s\\n' \"$1\" > '{args}'\nprintf '%s\\n' '{log}'",
                args = root.join("args.txt").display(),
                log = log.display()
            ),
        );
    }
    write_script(&root.join("set-env.sh"), "echo Prod");

    let toml = format!(
        r#"
scan_interval_ms = 20
tail_interval_ms = 10
default_environment = "Dev"
set_environment = {{ path = "$cwd/set-env.sh" }}

[[environment]]
name = "Dev"
value = "{dev}"

[[environment]]
name = "Prod"
value = "{prod}"

[[process]]
name = "Shop"
matches = ".*java.*shop.*"
error = ".*ERROR.*"
warning = ".*WARN.*"
startup = ".*started.*"
find_log_file = {{ path = "$RoveEnv/find.sh" }}
"#,
        dev = root.join("dev").display(),
        prod = root.join("prod").display(),
    );
    let config_path = root.join("rove.toml");
    std::fs::write(&config_path, toml).unwrap();
    let config = Config::load(&config_path).unwrap().validate(root).unwrap();

    Fixture {
        dir,
        dev_log,
        prod_log,
        config,
    }
}

fn supervisor(
    config: ValidatedConfig,
    inspector: Arc<ScriptedInspector>,
) -> (Supervisor, UnboundedReceiver<SupervisorEvent>) {
    let (sink, rx) = ChannelSink::new();
    let ctx = Arc::new(SlotContext {
        inspector,
        windows: Arc::new(HeadlessWindows),
        scripts: Arc::new(CommandScriptRunner::new(Duration::from_secs(10))),
        environment: Arc::new(CurrentEnvironment::new(
            config.environments.clone(),
            config.default_environment.as_deref(),
        )),
        events: Arc::new(sink),
        control: ControlSettings {
            window_search: Duration::ZERO,
            ..ControlSettings::default()
        },
        update_limit: config.update_limit,
        tail_tick: config.tail_interval,
    });
    let sup = Supervisor::with_context(
        config.slots,
        ctx,
        config.process_names,
        config.scan_interval,
    );
    (sup, rx)
}

async fn wait_for<T>(
    rx: &mut UnboundedReceiver<SupervisorEvent>,
    mut pick: impl FnMut(&SupervisorEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel open");
            if let Some(found) = pick(&event) {
                return found;
            }
        }
    })
    .await
    .expect("expected event in time")
}

#[tokio::test]
async fn selected_environment_drives_discovery() {
    let fx = fixture();
    let inspector = Arc::new(ScriptedInspector::default());
    inspector.set(vec![server(40)]);
    let (mut sup, mut rx) = supervisor(fx.config, Arc::clone(&inspector));

    sup.tick().await;

    assert_eq!(sup.environment().selection().as_deref(), Some("Prod"));
    let opened = wait_for(&mut rx, |e| match e {
        SupervisorEvent::LogFileOpened { path, .. } => Some(path.clone()),
        _ => None,
    })
    .await;
    assert_eq!(opened, fx.prod_log);

    // The command line arrives as one argument.
    let args = std::fs::read_to_string(fx.dir.path().join("args.txt")).unwrap();
    assert_eq!(args.trim_end(), "java -jar shop server.jar");

    append(&fx.dev_log, "ignored\n");
    append(&fx.prod_log, "app started\nWARN slow\nERROR broken\n");
    let runs = wait_for(&mut rx, |e| match e {
        SupervisorEvent::Lines { runs, .. } => Some(runs.clone()),
        _ => None,
    })
    .await;
    let classes: Vec<LineClass> = runs.iter().map(|r| r.class).collect();
    assert_eq!(
        classes,
        vec![LineClass::Startup, LineClass::Warning, LineClass::Error]
    );

    sup.shutdown().await;
}

#[tokio::test]
async fn exit_and_restart_reattach_with_fresh_counters() {
    let fx = fixture();
    let inspector = Arc::new(ScriptedInspector::default());
    inspector.set(vec![server(40)]);
    let (mut sup, mut rx) = supervisor(fx.config, Arc::clone(&inspector));

    sup.tick().await;
    wait_for(&mut rx, |e| {
        matches!(e, SupervisorEvent::LogFileOpened { .. }).then_some(())
    })
    .await;
    append(&fx.prod_log, "ERROR first run\n");
    wait_for(&mut rx, |e| matches!(e, SupervisorEvent::Lines { .. }).then_some(())).await;

    inspector.set(Vec::new());
    sup.tick().await;
    let reason = wait_for(&mut rx, |e| match e {
        SupervisorEvent::Detached { reason, .. } => Some(reason.clone()),
        _ => None,
    })
    .await;
    assert_eq!(reason, DetachReason::ProcessExited);
    let shop = Arc::clone(sup.slot("Shop").unwrap());
    assert_eq!(shop.status().await, SlotStatus::Unattached);
    // Output of the finished run stays visible until the next session.
    assert_eq!(shop.snapshot().await.counters.error_count, 1);

    inspector.set(vec![server(41)]);
    sup.tick().await;
    let snapshot = shop.snapshot().await;
    assert_eq!(snapshot.status, SlotStatus::Tailing);
    assert_eq!(snapshot.pid, Some(41));
    assert_eq!(snapshot.counters.error_count, 0);

    sup.shutdown().await;
    assert_eq!(shop.status().await, SlotStatus::Unattached);
}

#[tokio::test]
async fn kill_releases_on_next_tick() {
    let fx = fixture();
    let inspector = Arc::new(ScriptedInspector::default());
    inspector.set(vec![server(40)]);
    let (mut sup, _rx) = supervisor(fx.config, Arc::clone(&inspector));

    sup.tick().await;
    let shop = Arc::clone(sup.slot("Shop").unwrap());
    assert!(shop.kill().await.unwrap());
    sup.tick().await;
    assert_eq!(shop.status().await, SlotStatus::Unattached);

    let table = ProcessTable::new(inspector.processes().unwrap());
    assert!(table.is_empty());
}
