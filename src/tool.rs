//! Supported backend tools

use crate::SchedulerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the AI coding CLIs this scheduler can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolIdentity {
    Claude,
    Codex,
    Gemini,
}

impl ToolIdentity {
    /// All tools, in tab order
    pub fn all() -> &'static [ToolIdentity] {
        &[ToolIdentity::Claude, ToolIdentity::Codex, ToolIdentity::Gemini]
    }

    /// Wire name used in events, settings keys and schedule records
    pub fn name(&self) -> &'static str {
        match self {
            ToolIdentity::Claude => "claude",
            ToolIdentity::Codex => "codex",
            ToolIdentity::Gemini => "gemini",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ToolIdentity::Claude => "Claude Code",
            ToolIdentity::Codex => "Codex",
            ToolIdentity::Gemini => "Gemini CLI",
        }
    }

    /// Executable invoked in the terminal
    pub fn executable(&self) -> &'static str {
        match self {
            ToolIdentity::Claude => "claude",
            ToolIdentity::Codex => "codex",
            ToolIdentity::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ToolIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ToolIdentity {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(ToolIdentity::Claude),
            "codex" => Ok(ToolIdentity::Codex),
            "gemini" => Ok(ToolIdentity::Gemini),
            other => Err(SchedulerError::InvalidTool(other.to_string())),
        }
    }
}
