//! Configuration loading and validation.
//!
//! The TOML file deserializes into [`Config`], where every field has a
//! default. [`Config::validate`] turns it into a [`ValidatedConfig`]: regexes
//! compiled, script paths normalized and checked, environments scanned.
//! Every problem found there aborts startup.
//!
//! ```toml
//! log_history = 10000
//! update_limit = 50000
//!
//! [[environment]]
//! name = "Dev"
//! value = "/home/me/dev"
//!
//! [[process]]
//! name = "Shop"
//! matches = "java .*shop"
//! error = "ERROR"
//! find_log_file = { path = "$RoveEnv/scripts/find-log.sh" }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::classify::Classifier;
use crate::control::ControlSettings;
use crate::environment::{ENV_MARKER, EnvironmentEntry, EnvironmentMapping, EnvironmentScan};
use crate::error::ConfigError;
use crate::script::ScriptRef;
use crate::window::WindowBackend;

/// Config file name looked up in the working and user config directories.
pub const CONFIG_FILE_NAME: &str = "rove.toml";

/// Section name used in errors for top-level keys.
const GLOBAL_SECTION: &str = "global";

// ─── Raw configuration ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Lines kept per slot. 0 keeps everything.
    pub log_history: usize,
    /// Characters per second before rendering is suppressed. 0 disables.
    pub update_limit: u64,
    pub scan_interval_ms: u64,
    pub tail_interval_ms: u64,
    /// 0 waits forever.
    pub script_timeout_secs: u64,
    /// Only consider processes with these executable names. Empty means all.
    pub process_names: Vec<String>,
    pub default_environment: Option<String>,
    /// Runs for every attached process, unless a process overrides it.
    pub on_new_process: Option<ScriptRef>,
    /// Prints the environment to select, unless a process overrides it.
    pub set_environment: Option<ScriptRef>,
    #[serde(rename = "environment")]
    pub environments: Vec<EnvironmentEntry>,
    pub environment_scan: Option<EnvironmentScanConfig>,
    pub windows: WindowsConfig,
    #[serde(rename = "process")]
    pub processes: Vec<ProcessConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_history: 10_000,
            update_limit: 50_000,
            scan_interval_ms: 500,
            tail_interval_ms: 100,
            script_timeout_secs: 30,
            process_names: Vec::new(),
            default_environment: None,
            on_new_process: None,
            set_environment: None,
            environments: Vec::new(),
            environment_scan: None,
            windows: WindowsConfig::default(),
            processes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentScanConfig {
    pub base_dir: String,
    /// Regex matched against each checkout's `.git/config`.
    pub repository: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowsConfig {
    pub backend: WindowBackend,
    #[serde(flatten)]
    pub control: ControlSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub name: String,
    /// Matched against the full command line.
    pub matches: String,
    pub error: String,
    pub warning: String,
    pub startup: String,
    pub color: String,
    pub auto_scroll: bool,
    /// Overrides the global `log_history`.
    pub log_history: Option<usize>,
    /// Rediscover the log file after this long without output. 0 disables.
    pub idle_recheck_secs: u64,
    pub find_log_file: Option<ScriptRef>,
    pub on_process_started: Option<ScriptRef>,
    pub on_new_process: Option<ScriptRef>,
    pub set_environment: Option<ScriptRef>,
    pub start_process: Option<ScriptRef>,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            matches: String::new(),
            error: String::new(),
            warning: String::new(),
            startup: String::new(),
            color: String::new(),
            auto_scroll: true,
            log_history: None,
            idle_recheck_secs: 60,
            find_log_file: None,
            on_process_started: None,
            on_new_process: None,
            set_environment: None,
            start_process: None,
        }
    }
}

// ─── Validated configuration ─────────────────────────────────────────

/// Display colour of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const WHITE: Self = Self::rgb(0xff, 0xff, 0xff);

    #[must_use]
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// `#rrggbb`, `#rgb` or a basic colour name.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Some(hex) = text.strip_prefix('#') {
            return parse_hex(hex);
        }
        let named = match text.to_ascii_lowercase().as_str() {
            "black" => Self::rgb(0, 0, 0),
            "white" => Self::WHITE,
            "red" => Self::rgb(0xff, 0, 0),
            "green" => Self::rgb(0, 0x80, 0),
            "lime" => Self::rgb(0, 0xff, 0),
            "blue" => Self::rgb(0, 0, 0xff),
            "yellow" => Self::rgb(0xff, 0xff, 0),
            "cyan" | "aqua" => Self::rgb(0, 0xff, 0xff),
            "magenta" | "fuchsia" => Self::rgb(0xff, 0, 0xff),
            "orange" => Self::rgb(0xff, 0xa5, 0),
            "purple" => Self::rgb(0x80, 0, 0x80),
            "gray" | "grey" => Self::rgb(0x80, 0x80, 0x80),
            "silver" => Self::rgb(0xc0, 0xc0, 0xc0),
            "navy" => Self::rgb(0, 0, 0x80),
            "teal" => Self::rgb(0, 0x80, 0x80),
            "maroon" => Self::rgb(0x80, 0, 0),
            "olive" => Self::rgb(0x80, 0x80, 0),
            _ => return None,
        };
        Some(named)
    }
}

fn parse_hex(hex: &str) -> Option<Color> {
    let channel = |s: &str| u8::from_str_radix(s, 16).ok();
    match hex.len() {
        6 => Some(Color::rgb(
            channel(hex.get(0..2)?)?,
            channel(hex.get(2..4)?)?,
            channel(hex.get(4..6)?)?,
        )),
        3 => {
            let mut out = [0u8; 3];
            for (i, c) in hex.chars().enumerate() {
                let v = c.to_digit(16)? as u8;
                out[i] = v * 17;
            }
            Some(Color::rgb(out[0], out[1], out[2]))
        }
        _ => None,
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl Serialize for Color {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// One process definition, ready for a slot.
#[derive(Debug, Clone)]
pub struct SlotConfig {
    pub name: String,
    pub identity: Regex,
    pub classifier: Classifier,
    pub color: Color,
    pub auto_scroll: bool,
    pub log_history: usize,
    pub idle_recheck: Duration,
    pub find_log_file: ScriptRef,
    pub on_new_process: Option<ScriptRef>,
    pub on_process_started: Option<ScriptRef>,
    pub set_environment: Option<ScriptRef>,
    pub start_process: Option<ScriptRef>,
}

impl SlotConfig {
    /// Minimal definition, mainly for tests and embedding.
    #[must_use]
    pub fn new(name: impl Into<String>, identity: Regex, find_log_file: ScriptRef) -> Self {
        Self {
            name: name.into(),
            identity,
            classifier: Classifier::default(),
            color: Color::WHITE,
            auto_scroll: true,
            log_history: 10_000,
            idle_recheck: Duration::ZERO,
            find_log_file,
            on_new_process: None,
            on_process_started: None,
            set_environment: None,
            start_process: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub update_limit: u64,
    pub scan_interval: Duration,
    pub tail_interval: Duration,
    pub script_timeout: Duration,
    pub process_names: Vec<String>,
    pub environments: EnvironmentMapping,
    pub default_environment: Option<String>,
    pub window_backend: WindowBackend,
    pub control: ControlSettings,
    pub slots: Vec<SlotConfig>,
}

// ─── Loading ─────────────────────────────────────────────────────────

/// Explicit path, then `./rove.toml`, then the user config directory.
#[must_use]
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.is_file() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("rove").join(CONFIG_FILE_NAME))
        .filter(|path| path.is_file())
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    /// Documented starting configuration.
    #[must_use]
    pub fn example() -> Self {
        Self {
            default_environment: Some("Dev".to_string()),
            on_new_process: Some(ScriptRef::new("$cwd/on-new-process.sh")),
            set_environment: Some(ScriptRef::new("$cwd/set-environment.sh")),
            environments: vec![EnvironmentEntry::new("Dev", "/home/me/dev")],
            processes: vec![ProcessConfig {
                name: "Server".to_string(),
                matches: ".*java.*catalina.*".to_string(),
                error: ".*ERROR.*".to_string(),
                warning: ".*WARN.*".to_string(),
                startup: ".*Server startup in.*".to_string(),
                color: "#4fc1ff".to_string(),
                find_log_file: Some(
                    ScriptRef::new("$RoveEnv/scripts/find-log-file.sh").with_working_dir("$RoveEnv"),
                ),
                on_process_started: Some(ScriptRef::new("$RoveEnv/scripts/on-started.sh")),
                start_process: Some(ScriptRef::new("$RoveEnv/scripts/start-server.sh")),
                ..ProcessConfig::default()
            }],
            ..Self::default()
        }
    }

    /// Validate against the filesystem. `base_dir` is what `$cwd` expands
    /// to, normally the directory holding the config file.
    pub fn validate(&self, base_dir: &Path) -> Result<ValidatedConfig, ConfigError> {
        let mut environments = EnvironmentMapping::new(self.environments.iter().cloned());
        if let Some(scan) = &self.environment_scan {
            if !scan.base_dir.trim().is_empty() {
                let rule = EnvironmentScan {
                    base_dir: PathBuf::from(scan.base_dir.trim()),
                    repository: compile_regex("environment_scan", "repository", &scan.repository)?
                        .unwrap_or_else(match_all),
                };
                environments.extend(rule.scan()?);
            }
        }

        let global_on_new =
            optional_script(GLOBAL_SECTION, "on_new_process", self.on_new_process.as_ref(), base_dir, &environments)?;
        let global_set_env = optional_script(
            GLOBAL_SECTION,
            "set_environment",
            self.set_environment.as_ref(),
            base_dir,
            &environments,
        )?;

        let mut names = HashSet::new();
        let mut slots = Vec::with_capacity(self.processes.len());
        for process in &self.processes {
            let slot = process.validate(self, base_dir, &environments, &global_on_new, &global_set_env)?;
            if !names.insert(slot.name.clone()) {
                return Err(ConfigError::InvalidValue {
                    section: slot.name,
                    field: "name".to_string(),
                    reason: "duplicate process name".to_string(),
                });
            }
            slots.push(slot);
        }

        Ok(ValidatedConfig {
            update_limit: self.update_limit,
            scan_interval: Duration::from_millis(self.scan_interval_ms.max(1)),
            tail_interval: Duration::from_millis(self.tail_interval_ms.max(1)),
            script_timeout: Duration::from_secs(self.script_timeout_secs),
            process_names: self.process_names.clone(),
            environments,
            default_environment: self.default_environment.clone().filter(|n| !n.is_empty()),
            window_backend: self.windows.backend,
            control: self.windows.control.clone(),
            slots,
        })
    }
}

impl ProcessConfig {
    fn validate(
        &self,
        global: &Config,
        base_dir: &Path,
        environments: &EnvironmentMapping,
        global_on_new: &Option<ScriptRef>,
        global_set_env: &Option<ScriptRef>,
    ) -> Result<SlotConfig, ConfigError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigError::InvalidValue {
                section: "process".to_string(),
                field: "name".to_string(),
                reason: "every process needs a name".to_string(),
            });
        }
        if self.matches.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                section: name,
                field: "matches".to_string(),
                reason: "a command-line pattern is required".to_string(),
            });
        }

        let identity = compile_regex(&name, "matches", &self.matches)?.unwrap_or_else(match_all);
        let classifier = Classifier::new(
            compile_regex(&name, "error", &self.error)?,
            compile_regex(&name, "warning", &self.warning)?,
            compile_regex(&name, "startup", &self.startup)?,
        );
        let color = if self.color.trim().is_empty() {
            Color::WHITE
        } else {
            Color::parse(&self.color).ok_or_else(|| ConfigError::InvalidValue {
                section: name.clone(),
                field: "color".to_string(),
                reason: format!("unknown colour {:?}", self.color),
            })?
        };

        let find_log_file =
            optional_script(&name, "find_log_file", self.find_log_file.as_ref(), base_dir, environments)?
                .ok_or_else(|| ConfigError::MissingScript {
                    section: name.clone(),
                    field: "find_log_file".to_string(),
                })?;
        let on_process_started = optional_script(
            &name,
            "on_process_started",
            self.on_process_started.as_ref(),
            base_dir,
            environments,
        )?;
        let on_new_process =
            optional_script(&name, "on_new_process", self.on_new_process.as_ref(), base_dir, environments)?
                .or_else(|| global_on_new.clone());
        let set_environment =
            optional_script(&name, "set_environment", self.set_environment.as_ref(), base_dir, environments)?
                .or_else(|| global_set_env.clone());
        let start_process =
            optional_script(&name, "start_process", self.start_process.as_ref(), base_dir, environments)?;

        Ok(SlotConfig {
            identity,
            classifier,
            color,
            auto_scroll: self.auto_scroll,
            log_history: self.log_history.unwrap_or(global.log_history),
            idle_recheck: Duration::from_secs(self.idle_recheck_secs),
            find_log_file,
            on_new_process,
            on_process_started,
            set_environment,
            start_process,
            name,
        })
    }
}

fn match_all() -> Regex {
    Regex::new("").expect("empty regex compiles")
}

/// Compile a configured pattern. Leading and trailing `.*` are dropped since
/// matching is unanchored. An empty pattern yields `None`.
pub fn compile_regex(section: &str, field: &str, pattern: &str) -> Result<Option<Regex>, ConfigError> {
    let trimmed = pattern.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let body = strip_wildcard_suffix(strip_wildcard_prefix(trimmed));
    Regex::new(body)
        .map(Some)
        .map_err(|e| ConfigError::InvalidRegex {
            section: section.to_string(),
            field: field.to_string(),
            message: e.to_string(),
        })
}

/// `.*x` -> `x`, unless the `*` carries a lazy or possessive modifier.
fn strip_wildcard_prefix(pattern: &str) -> &str {
    match pattern.strip_prefix(".*") {
        Some(rest) if !rest.starts_with(['?', '+', '*', '{']) => rest,
        _ => pattern,
    }
}

/// `x.*` -> `x`, unless the `.` is escaped.
fn strip_wildcard_suffix(pattern: &str) -> &str {
    let Some(rest) = pattern.strip_suffix(".*") else {
        return pattern;
    };
    let backslashes = rest.chars().rev().take_while(|c| *c == '\\').count();
    if backslashes % 2 == 0 { rest } else { pattern }
}

/// Normalize a configured script and check it exists under some
/// environment. Empty paths mean "not configured".
fn optional_script(
    section: &str,
    field: &str,
    script: Option<&ScriptRef>,
    base_dir: &Path,
    environments: &EnvironmentMapping,
) -> Result<Option<ScriptRef>, ConfigError> {
    let Some(script) = script else {
        return Ok(None);
    };
    let mut script = script.normalized(base_dir);
    if script.is_empty() {
        return Ok(None);
    }
    if !script.path.contains(ENV_MARKER) && Path::new(&script.path).is_relative() {
        script.path = base_dir.join(&script.path).display().to_string();
    }
    if !script.exists_in_any(environments) {
        return Err(ConfigError::ScriptNotFound {
            section: section.to_string(),
            field: field.to_string(),
            path: script.path,
        });
    }
    Ok(Some(script))
}
