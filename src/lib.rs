//! CLI Scheduler - timed execution of AI coding CLIs
//!
//! Launches Claude Code, Codex or Gemini CLI at a wall-clock time and:
//! - Watches the streamed terminal output for rate-limit messages
//! - Computes a retry time from the vendor's free-text message
//! - Re-arms the launch without operator intervention, per tool

pub mod backend;
pub mod clock;
pub mod countdown;
pub mod execution;
pub mod orchestrator;
pub mod protocol;
pub mod rules;
pub mod scheduler;
pub mod settings;
pub mod tool;

pub use backend::{EventBus, ProcessBackend, TerminalBackend, TerminalStatus};
pub use clock::{Clock, ClockTime, ManualClock, SystemClock};
pub use execution::{ExecutionPhase, RunState, StatusKind, StatusLine};
pub use orchestrator::{Orchestrator, Subscription, ToolView};
pub use rules::{LaunchOptionsError, RateLimitEvent};
pub use settings::{ExecutionSettings, PreflightError, SettingsStore};
pub use tool::ToolIdentity;

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Directory holding settings, schedules and history
    pub config_dir: PathBuf,

    /// Last-used settings per tool
    pub settings_file: PathBuf,

    /// Registered recurring schedules
    pub schedules_file: PathBuf,

    /// Append-only schedule history (JSONL)
    pub history_file: PathBuf,

    /// How often running countdowns are re-projected
    pub tick_interval: Duration,

    /// Number of trailing output lines kept per terminal snapshot
    pub output_tail_lines: usize,

    /// Whether to log at debug level
    pub verbose: bool,
}

/// Optional overrides read from `config.toml`
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    tick_interval_ms: Option<u64>,
    output_tail_lines: Option<usize>,
    settings_file: Option<PathBuf>,
    schedules_file: Option<PathBuf>,
    history_file: Option<PathBuf>,
}

impl SchedulerConfig {
    pub fn new(config_dir: PathBuf) -> Self {
        Self {
            settings_file: config_dir.join("settings.json"),
            schedules_file: config_dir.join("schedules.json"),
            history_file: config_dir.join("schedule-history.jsonl"),
            config_dir,
            tick_interval: Duration::from_secs(1),
            output_tail_lines: 40,
            verbose: false,
        }
    }

    /// Resolve the default config directory.
    ///
    /// `CLI_SCHEDULER_HOME` wins; otherwise the platform config dir is used.
    pub fn default_dir() -> Result<PathBuf> {
        if let Ok(home) = std::env::var("CLI_SCHEDULER_HOME") {
            return Ok(PathBuf::from(home));
        }
        dirs::config_dir()
            .map(|dir| dir.join("cli-scheduler"))
            .ok_or_else(|| SchedulerError::Config("Could not determine config directory".into()))
    }

    /// Build a config from `config_dir`, applying `config.toml` if present.
    pub fn load(config_dir: PathBuf) -> Result<Self> {
        let path = config_dir.join("config.toml");
        let mut config = Self::new(config_dir);
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            config = config.apply_file(&text, &path)?;
        }
        Ok(config)
    }

    fn apply_file(mut self, text: &str, path: &Path) -> Result<Self> {
        let file: ConfigFile = toml::from_str(text)?;
        if let Some(ms) = file.tick_interval_ms {
            if ms == 0 {
                return Err(SchedulerError::Config(format!(
                    "{}: tick_interval_ms must be positive",
                    path.display()
                )));
            }
            self.tick_interval = Duration::from_millis(ms);
        }
        if let Some(lines) = file.output_tail_lines {
            self.output_tail_lines = lines.max(1);
        }
        if let Some(p) = file.settings_file {
            self.settings_file = self.config_dir.join(p);
        }
        if let Some(p) = file.schedules_file {
            self.schedules_file = self.config_dir.join(p);
        }
        if let Some(p) = file.history_file {
            self.history_file = self.config_dir.join(p);
        }
        Ok(self)
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_output_tail_lines(mut self, lines: usize) -> Self {
        self.output_tail_lines = lines.max(1);
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors that can occur in the scheduler
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("{0}")]
    Preflight(#[from] PreflightError),

    #[error("{0} is already running")]
    AlreadyRunning(ToolIdentity),

    #[error("Terminal backend error: {0}")]
    Backend(String),

    #[error("Invalid tool: {0}")]
    InvalidTool(String),

    #[error("Invalid time: {0}")]
    InvalidTime(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}
