//! Rove core: attach to background services and tail their logs.
//!
//! A [`Supervisor`] scans the operating system's processes, hands newly
//! started ones to its [`ProcessSlot`]s and lets each matching slot take
//! control of its process, discover the log file through an operator script
//! and tail it. Tailed lines are classified, merged into runs and published
//! as [`SupervisorEvent`]s to an injected [`EventSink`].
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use rove_core::{Config, Supervisor, TracingSink};
//!
//! # async fn run() -> rove_core::Result<()> {
//! let config = Config::load(Path::new("rove.toml"))?.validate(Path::new("."))?;
//! let handle = Supervisor::new(config, Arc::new(TracingSink)).start();
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod config;
pub mod control;
pub mod environment;
pub mod error;
pub mod events;
pub mod lock;
pub mod logging;
pub mod polling;
pub mod process;
pub mod script;
pub mod seen;
pub mod slot;
pub mod supervisor;
pub mod tail;
pub mod traffic;
pub mod window;

pub use classify::{Classifier, LineClass, LogRun, RunningCounters};
pub use config::{Color, Config, SlotConfig, ValidatedConfig, resolve_config_path};
pub use environment::{CurrentEnvironment, EnvironmentEntry, EnvironmentMapping, ENV_MARKER};
pub use error::{ConfigError, Error, Result, ScriptError, TailError};
pub use events::{
    ChannelSink, DetachReason, EventHandle, EventSink, HistorySink, SupervisorEvent, TracingSink,
};
pub use lock::SupervisorLock;
pub use logging::{LogFormat, init_logging};
pub use process::{ProcessIdentity, ProcessInfo, ProcessInspector, SysinfoInspector};
pub use script::{ScriptRef, ScriptRunner};
pub use slot::{ProcessSlot, SlotSnapshot, SlotStatus};
pub use supervisor::{Supervisor, SupervisorHandle};

/// Crate version, recorded in lock metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
