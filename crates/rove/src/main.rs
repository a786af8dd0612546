//! Rove CLI.
//!
//! ```bash
//! # Print a starting configuration
//! rove default-config > rove.toml
//!
//! # Validate it and show how scripts resolve per environment
//! rove check
//!
//! # Supervise until Ctrl-C
//! rove run --env Dev
//! ```

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use console::{Style, style};
use rove_core::config::Color;
use rove_core::events::HistorySink;
use rove_core::{
    ChannelSink, Config, CurrentEnvironment, LineClass, LogFormat, ScriptRef, Supervisor,
    SupervisorEvent, SupervisorLock, TracingSink, ValidatedConfig, init_logging,
    resolve_config_path,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "rove")]
#[command(about = "Attach to background services and tail their logs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ./rove.toml, then the user config dir)
    #[arg(short, long, global = true, env = "ROVE_CONFIG")]
    config: Option<PathBuf>,

    /// Diagnostic log level, overridden by RUST_LOG
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Diagnostic log format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormatArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => Self::Text,
            LogFormatArg::Json => Self::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise configured processes until Ctrl-C
    Run {
        /// Environment to select at startup
        #[arg(long)]
        env: Option<String>,

        /// Print events as JSON lines instead of coloured text
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration and show script resolution
    Check,

    /// List known environments
    Envs,

    /// List running processes matched by each configured process
    Ps,

    /// Print an example configuration
    DefaultConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format.into());

    match cli.command {
        Commands::DefaultConfig => {
            print!("{}", Config::example().to_toml()?);
            Ok(())
        }
        Commands::Check => {
            let (path, config) = load(cli.config.as_deref())?;
            check(&path, &config)
        }
        Commands::Envs => {
            let (_, config) = load(cli.config.as_deref())?;
            envs(&config);
            Ok(())
        }
        Commands::Ps => {
            let (_, config) = load(cli.config.as_deref())?;
            ps(config).await
        }
        Commands::Run { env, json } => {
            let (path, config) = load(cli.config.as_deref())?;
            run(&path, config, env.as_deref(), json).await
        }
    }
}

/// Locate, parse and validate the configuration.
fn load(explicit: Option<&Path>) -> Result<(PathBuf, ValidatedConfig)> {
    let Some(path) = resolve_config_path(explicit) else {
        bail!("no configuration found; create one with `rove default-config > rove.toml`");
    };
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let config = Config::load(&path)?
        .validate(&base_dir)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    Ok((path, config))
}

fn check(path: &Path, config: &ValidatedConfig) -> Result<()> {
    println!("{} {}", style("✓").green(), style(path.display()).bold());
    println!(
        "  update limit {} chars/s, scan every {:?}",
        config.update_limit, config.scan_interval
    );

    let mapping = &config.environments;
    if mapping.is_empty() {
        println!("  environments: none");
    } else {
        let names: Vec<&str> = mapping.names().collect();
        println!("  environments: {}", names.join(", "));
    }

    for slot in &config.slots {
        println!();
        println!(
            "{} {}  matches /{}/",
            style("process").cyan(),
            style(&slot.name).bold(),
            slot.identity.as_str()
        );
        let scripts: [(&str, Option<&ScriptRef>); 5] = [
            ("find_log_file", Some(&slot.find_log_file)),
            ("on_new_process", slot.on_new_process.as_ref()),
            ("on_process_started", slot.on_process_started.as_ref()),
            ("set_environment", slot.set_environment.as_ref()),
            ("start_process", slot.start_process.as_ref()),
        ];
        for (label, script) in scripts {
            let Some(script) = script else {
                continue;
            };
            println!("  {label}: {}", script.path);
            if mapping.is_empty() || !script.path.contains(rove_core::ENV_MARKER) {
                continue;
            }
            for name in mapping.names() {
                let resolved = mapping.resolve_for_selection(&script.path, Some(name));
                let mark = if Path::new(&resolved).is_file() {
                    style("✓").green()
                } else {
                    style("✗").red()
                };
                println!("    {mark} {name}: {resolved}");
            }
        }
    }
    Ok(())
}

fn envs(config: &ValidatedConfig) {
    let current = CurrentEnvironment::new(
        config.environments.clone(),
        config.default_environment.as_deref(),
    );
    let selected = current.selection();
    if config.environments.is_empty() {
        println!("no environments configured");
        return;
    }
    for entry in config.environments.entries() {
        let marker = if selected.as_deref() == Some(entry.name.as_str()) {
            "*"
        } else {
            " "
        };
        println!("{marker} {}\t{}", entry.name, entry.value);
    }
}

async fn ps(config: ValidatedConfig) -> Result<()> {
    let supervisor = Supervisor::new(config, Arc::new(TracingSink));
    for (slot, processes) in supervisor.matching_processes().await? {
        if processes.is_empty() {
            println!("{}: {}", style(&slot).bold(), style("not running").dim());
            continue;
        }
        for process in processes {
            println!(
                "{}: {} {}",
                style(&slot).bold(),
                process.pid,
                process.command_line()
            );
        }
    }
    Ok(())
}

async fn run(path: &Path, config: ValidatedConfig, env: Option<&str>, json: bool) -> Result<()> {
    let _lock = SupervisorLock::acquire(path)?;

    let printer = Printer::new(&config, json);
    let (sink, mut rx) = ChannelSink::new();
    let history = Arc::new(HistorySink::new(Arc::new(sink)));
    let supervisor = Supervisor::new(config, history.clone());
    if let Some(name) = env {
        if !supervisor.select_environment(name) {
            bail!("unknown environment '{name}'");
        }
    }

    let handle = supervisor.start();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = rx.recv() => match event {
                Some(event) => printer.print(&event)?,
                None => break,
            },
        }
    }

    handle.shutdown().await?;
    while let Ok(event) = rx.try_recv() {
        printer.print(&event)?;
    }
    let entries = history.entries();
    info!(
        messages = entries.len(),
        errors = entries.iter().filter(|e| e.is_error).count(),
        "supervisor session ended"
    );
    Ok(())
}

/// Renders events to the terminal.
struct Printer {
    json: bool,
    slot_styles: HashMap<String, Style>,
}

impl Printer {
    fn new(config: &ValidatedConfig, json: bool) -> Self {
        let slot_styles = config
            .slots
            .iter()
            .map(|slot| (slot.name.clone(), Style::new().color256(ansi256(slot.color)).bold()))
            .collect();
        Self { json, slot_styles }
    }

    fn prefix(&self, slot: &str) -> String {
        self.slot_styles
            .get(slot)
            .map_or_else(|| slot.to_string(), |s| s.apply_to(slot).to_string())
    }

    fn print(&self, event: &SupervisorEvent) -> Result<()> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        if self.json {
            writeln!(out, "{}", serde_json::to_string(event)?)?;
            return Ok(());
        }

        match event {
            SupervisorEvent::Lines { slot, runs } => {
                let prefix = self.prefix(slot);
                for run in runs {
                    let line_style = class_style(run.class);
                    for line in &run.lines {
                        writeln!(out, "{prefix} {}", line_style.apply_to(line))?;
                    }
                }
            }
            SupervisorEvent::Advisory { slot, text, .. } => {
                writeln!(out, "{} {}", self.prefix(slot), style(text).yellow().italic())?;
            }
            SupervisorEvent::Error { slot, message } => {
                let who = if slot.is_empty() {
                    "rove".to_string()
                } else {
                    self.prefix(slot)
                };
                eprintln!("{who} {}", style(message).red());
            }
            SupervisorEvent::Counters { .. }
            | SupervisorEvent::Cleared { .. }
            | SupervisorEvent::VisibilityChanged { .. } => {}
            other => {
                if let Some(message) = other.message() {
                    writeln!(out, "{}", style(message).dim())?;
                }
            }
        }
        Ok(())
    }
}

fn class_style(class: LineClass) -> Style {
    match class {
        LineClass::Error => Style::new().red(),
        LineClass::Warning => Style::new().yellow(),
        LineClass::Startup => Style::new().green(),
        LineClass::Info => Style::new(),
        LineClass::Notice => Style::new().cyan().dim(),
    }
}

/// Nearest entry of the 6x6x6 colour cube.
fn ansi256(color: Color) -> u8 {
    let level = |c: u8| (u16::from(c) * 5 / 255) as u8;
    16 + 36 * level(color.r) + 6 * level(color.g) + level(color.b)
}
