//! Wire types exchanged with the terminal backend
//!
//! Event names and payload shapes match what the terminal automation layer
//! emits, so a backend living in another process can publish them as JSON.

use crate::clock::ClockTime;
use crate::tool::ToolIdentity;
use serde::{Deserialize, Serialize};

/// Event names
pub mod events {
    pub const EXECUTION_STARTED: &str = "execution-started";
    pub const TERMINAL_OUTPUT: &str = "terminal-output";
    pub const RETRY_SCHEDULED: &str = "rate-limit-retry-scheduled";
}

/// Launch status values with a fixed meaning
pub mod status {
    pub const CANCELLED: &str = "cancelled";
    pub const RATE_LIMIT_DETECTED: &str = "rate_limit_detected";
    pub const COMPLETED_PREFIX: &str = "completed_in_";
}

/// An event pushed by the terminal backend while a launch is in flight.
///
/// `tool` is optional for compatibility with backends that do not tag their
/// events; untagged events belong to the currently selected tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum BackendEvent {
    /// The tool was launched in the terminal
    #[serde(rename = "execution-started")]
    Started {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<ToolIdentity>,
    },

    /// Latest snapshot of the terminal text (not a delta)
    #[serde(rename = "terminal-output")]
    Output {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<ToolIdentity>,
        text: String,
    },

    /// The backend has scheduled a retry after a rate limit
    #[serde(rename = "rate-limit-retry-scheduled")]
    Rescheduled {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<ToolIdentity>,
        time: ClockTime,
    },
}

impl BackendEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BackendEvent::Started { .. } => events::EXECUTION_STARTED,
            BackendEvent::Output { .. } => events::TERMINAL_OUTPUT,
            BackendEvent::Rescheduled { .. } => events::RETRY_SCHEDULED,
        }
    }

    pub fn tool(&self) -> Option<ToolIdentity> {
        match self {
            BackendEvent::Started { tool }
            | BackendEvent::Output { tool, .. }
            | BackendEvent::Rescheduled { tool, .. } => *tool,
        }
    }
}

/// Result of a launch call; resolves exactly once per call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchOutcome {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_retry: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_time: Option<String>,
}

/// Interpreted form of `LaunchOutcome::status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchStatus {
    Cancelled,
    /// `completed_in_<m>m<s>s`; `None` when the duration did not parse
    Completed(Option<(u64, u64)>),
    RateLimitDetected,
    Other(String),
}

impl LaunchOutcome {
    pub fn cancelled() -> Self {
        Self {
            status: status::CANCELLED.to_string(),
            ..Default::default()
        }
    }

    pub fn completed(elapsed_secs: u64, terminal_output: Option<String>) -> Self {
        Self {
            status: format!(
                "{}{}m{}s",
                status::COMPLETED_PREFIX,
                elapsed_secs / 60,
                elapsed_secs % 60
            ),
            terminal_output,
            needs_retry: Some(false),
            retry_time: None,
        }
    }

    pub fn rate_limited(terminal_output: Option<String>) -> Self {
        Self {
            status: status::RATE_LIMIT_DETECTED.to_string(),
            terminal_output,
            needs_retry: Some(false),
            retry_time: None,
        }
    }

    pub fn kind(&self) -> LaunchStatus {
        let s = self.status.as_str();
        if s == status::CANCELLED {
            return LaunchStatus::Cancelled;
        }
        if s == status::RATE_LIMIT_DETECTED {
            return LaunchStatus::RateLimitDetected;
        }
        if let Some(rest) = s.strip_prefix(status::COMPLETED_PREFIX) {
            return LaunchStatus::Completed(parse_elapsed(rest));
        }
        LaunchStatus::Other(s.to_string())
    }
}

/// Availability of the terminal application
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalStatus {
    pub installed: bool,
    pub running: bool,
}

/// `3m07s` -> (3, 7)
fn parse_elapsed(s: &str) -> Option<(u64, u64)> {
    let (minutes, rest) = s.split_once('m')?;
    let seconds = rest.strip_suffix('s')?;
    Some((minutes.parse().ok()?, seconds.parse().ok()?))
}
