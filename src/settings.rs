//! Per-tool execution settings
//!
//! `ExecutionSettings` is the immutable snapshot handed to a launch call.
//! `SettingsStore` keeps the last-used settings of every tool on disk, keyed
//! by tool name, so the CLI can pick them up again next time.

use crate::clock::ClockTime;
use crate::rules::{validate_launch_options, LaunchOptionsError};
use crate::tool::ToolIdentity;
use crate::Result;
use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub const DEFAULT_CLAUDE_MODEL: &str = "claude-opus-4-5-20251101";
pub const DEFAULT_CODEX_MODEL: &str = "gpt-5.2-codex";

/// Codex approval modes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CodexApprovalMode {
    #[default]
    Suggest,
    Auto,
    FullAuto,
}

impl CodexApprovalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suggest => "suggest",
            Self::Auto => "auto",
            Self::FullAuto => "full-auto",
        }
    }
}

/// Gemini approval modes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeminiApprovalMode {
    #[default]
    Default,
    AutoEdit,
    Yolo,
}

impl GeminiApprovalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AutoEdit => "auto_edit",
            Self::Yolo => "yolo",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaudeOptions {
    pub model: String,
    #[serde(default)]
    pub dangerously_skip_permissions: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodexOptions {
    pub model: String,
    #[serde(default)]
    pub approval_mode: CodexApprovalMode,
    #[serde(default)]
    pub enable_search: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiOptions {
    /// Empty lets Gemini CLI pick the model
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub approval_mode: GeminiApprovalMode,
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Comma-separated extra workspace directories
    #[serde(default)]
    pub include_directories: String,
}

/// Settings that only make sense for one tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "lowercase")]
pub enum ToolOptions {
    Claude(ClaudeOptions),
    Codex(CodexOptions),
    Gemini(GeminiOptions),
}

impl ToolOptions {
    pub fn defaults_for(tool: ToolIdentity) -> Self {
        match tool {
            ToolIdentity::Claude => ToolOptions::Claude(ClaudeOptions {
                model: DEFAULT_CLAUDE_MODEL.to_string(),
                dangerously_skip_permissions: false,
            }),
            ToolIdentity::Codex => ToolOptions::Codex(CodexOptions {
                model: DEFAULT_CODEX_MODEL.to_string(),
                approval_mode: CodexApprovalMode::Suggest,
                enable_search: false,
            }),
            ToolIdentity::Gemini => ToolOptions::Gemini(GeminiOptions::default()),
        }
    }

    pub fn tool(&self) -> ToolIdentity {
        match self {
            ToolOptions::Claude(_) => ToolIdentity::Claude,
            ToolOptions::Codex(_) => ToolIdentity::Codex,
            ToolOptions::Gemini(_) => ToolIdentity::Gemini,
        }
    }

    /// Flags generated from the structured settings
    fn flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        match self {
            ToolOptions::Claude(o) => {
                flags.push(format!("--model {}", shell_quote(&o.model)));
                if o.dangerously_skip_permissions {
                    flags.push("--dangerously-skip-permissions".to_string());
                }
            }
            ToolOptions::Codex(o) => {
                flags.push(format!("--model {}", shell_quote(&o.model)));
                flags.push(format!("--approval-mode {}", o.approval_mode.as_str()));
                if o.enable_search {
                    flags.push("--search".to_string());
                }
            }
            ToolOptions::Gemini(o) => {
                if !o.model.trim().is_empty() {
                    flags.push(format!("--model {}", shell_quote(o.model.trim())));
                }
                flags.push(format!("--approval-mode {}", o.approval_mode.as_str()));
                flags.push(format!("--output-format {}", o.output_format.as_str()));
                if !o.include_directories.trim().is_empty() {
                    flags.push(format!(
                        "--include-directories {}",
                        shell_quote(o.include_directories.trim())
                    ));
                }
            }
        }
        flags
    }
}

/// Settings snapshot for one launch of one tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSettings {
    pub execution_time: ClockTime,
    #[serde(default)]
    pub target_directory: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub auto_retry_on_rate_limit: bool,
    #[serde(default = "default_use_new_window")]
    pub use_new_window: bool,
    /// Free-text flags appended after the generated ones
    #[serde(default)]
    pub launch_options: String,
    pub tool_options: ToolOptions,
    /// Launch as soon as the run starts instead of at `execution_time`
    #[serde(skip)]
    pub run_immediately: bool,
}

fn default_use_new_window() -> bool {
    true
}

/// Problems that block a launch before anything is started.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreflightError {
    #[error("{}で実行する命令を入力してください", .0.display_name())]
    EmptyCommand(ToolIdentity),

    #[error("実行対象ディレクトリを選択してください")]
    EmptyDirectory,

    #[error(transparent)]
    LaunchOptions(#[from] LaunchOptionsError),

    #[error("ターミナルが利用できません")]
    TerminalUnavailable,
}

impl ExecutionSettings {
    /// Defaults for `tool`, scheduled one minute after `now`.
    pub fn defaults_for(tool: ToolIdentity, now: NaiveDateTime) -> Self {
        Self {
            execution_time: ClockTime::of(now + Duration::minutes(1)),
            target_directory: String::new(),
            command: String::new(),
            auto_retry_on_rate_limit: false,
            use_new_window: true,
            launch_options: String::new(),
            tool_options: ToolOptions::defaults_for(tool),
            run_immediately: false,
        }
    }

    pub fn tool(&self) -> ToolIdentity {
        self.tool_options.tool()
    }

    /// Checks that must pass before a launch is attempted.
    pub fn preflight(&self) -> std::result::Result<(), PreflightError> {
        if self.command.trim().is_empty() {
            return Err(PreflightError::EmptyCommand(self.tool()));
        }
        if self.use_new_window && self.target_directory.trim().is_empty() {
            return Err(PreflightError::EmptyDirectory);
        }
        validate_launch_options(self.tool(), &self.launch_options)?;
        Ok(())
    }

    /// Shell command line that runs the tool with this instruction.
    pub fn command_line(&self) -> String {
        self.command_line_with(self.tool().executable())
    }

    /// Same as `command_line`, with an explicit executable path.
    pub fn command_line_with(&self, executable: &str) -> String {
        let tool = self.tool();
        let mut parts = vec![executable.to_string()];
        parts.extend(self.tool_options.flags());
        if !self.launch_options.trim().is_empty() {
            parts.push(self.launch_options.trim().to_string());
        }
        if tool == ToolIdentity::Gemini {
            parts.push("--prompt".to_string());
        }
        parts.push(shell_quote(&self.command));
        parts.join(" ")
    }
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Last-used settings of every tool plus the selected tab.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    pub active_tab: ToolIdentity,
    tools: BTreeMap<ToolIdentity, ExecutionSettings>,
    file_path: Option<PathBuf>,
}

impl SettingsStore {
    /// Load from `file_path`, filling in defaults for anything missing.
    ///
    /// Entries that fail to parse are replaced with defaults rather than
    /// failing the whole load.
    pub async fn load(file_path: PathBuf, now: NaiveDateTime) -> Result<Self> {
        let mut store = Self::in_memory(now);
        store.file_path = Some(file_path.clone());

        if !file_path.exists() {
            return Ok(store);
        }

        let content = fs::read_to_string(&file_path).await?;
        let value: Value = serde_json::from_str(&content)?;

        if let Some(tab) = value
            .get("activeTab")
            .and_then(|v| serde_json::from_value::<ToolIdentity>(v.clone()).ok())
        {
            store.active_tab = tab;
        }

        for tool in ToolIdentity::all() {
            let Some(entry) = value.get(tool.name()) else {
                continue;
            };
            match serde_json::from_value::<ExecutionSettings>(entry.clone()) {
                Ok(settings) if settings.tool() == *tool => {
                    store.tools.insert(*tool, settings);
                }
                Ok(_) => warn!("Settings for {} carry options of another tool, using defaults", tool),
                Err(e) => warn!("Failed to parse settings for {}: {}", tool, e),
            }
        }

        debug!("Loaded settings from {:?}", file_path);
        Ok(store)
    }

    /// Defaults for every tool, no persistence
    pub fn in_memory(now: NaiveDateTime) -> Self {
        let tools = ToolIdentity::all()
            .iter()
            .map(|tool| (*tool, ExecutionSettings::defaults_for(*tool, now)))
            .collect();
        Self {
            active_tab: ToolIdentity::Claude,
            tools,
            file_path: None,
        }
    }

    pub fn get(&self, tool: ToolIdentity) -> Option<&ExecutionSettings> {
        self.tools.get(&tool)
    }

    /// Replace the stored settings of `settings.tool()`.
    pub fn set(&mut self, settings: ExecutionSettings) {
        self.tools.insert(settings.tool(), settings);
    }

    /// Write to disk (no-op for in-memory stores)
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };

        let mut root = Map::new();
        root.insert("activeTab".to_string(), serde_json::to_value(self.active_tab)?);
        for (tool, settings) in &self.tools {
            root.insert(tool.name().to_string(), serde_json::to_value(settings)?);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(&Value::Object(root))?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;

        debug!("Saved settings to {:?}", path);
        Ok(())
    }
}
