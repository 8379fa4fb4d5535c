//! Per-tool execution phase state machine
//!
//! `Idle -> Waiting -> Checking -> Idle`. The phase only moves forward on
//! external signals: the start command, the backend's `execution-started`
//! event, and the launch call settling. Local timers never change it.

mod status;

pub use status::{StatusKind, StatusLine};

use crate::clock::ClockTime;
use crate::protocol::{LaunchOutcome, LaunchStatus};
use crate::rules::RateLimitEvent;
use crate::tool::ToolIdentity;
use crate::SchedulerError;
use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPhase {
    #[default]
    Idle,
    Waiting,
    Checking,
}

/// Transient state of one tool's run. Reset to defaults on every terminal
/// transition; only the final status line and the launch's final terminal
/// output survive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunState {
    pub phase: ExecutionPhase,
    pub is_running: bool,
    /// When the start command was accepted
    pub waiting_since: Option<NaiveDateTime>,
    /// When the latest `execution-started` event arrived
    pub checking_started_at: Option<NaiveDateTime>,
    /// When the local countdown first reached the execution time
    pub execution_started_at: Option<NaiveDateTime>,
    /// Latest terminal snapshot, replaced on every output event
    pub last_raw_output: String,
    /// Parse of `last_raw_output`
    pub rate_limit: RateLimitEvent,
    /// Retry time announced by the backend
    pub rescheduled_target: Option<ClockTime>,
    pub status: StatusLine,
    pub countdown: String,
}

impl RunState {
    pub fn is_idle(&self) -> bool {
        self.phase == ExecutionPhase::Idle
    }

    /// `Idle -> Waiting` after preflight has passed.
    pub fn begin(&mut self, now: NaiveDateTime) {
        *self = RunState {
            phase: ExecutionPhase::Waiting,
            is_running: true,
            waiting_since: Some(now),
            status: StatusLine::new(StatusKind::Waiting, status::WAITING),
            ..Default::default()
        };
    }

    /// `Waiting -> Checking` on `execution-started`.
    ///
    /// A second start while already checking is the backend relaunching
    /// after a rate limit; the previous run's output and retry target no
    /// longer apply. Returns false when the event was ignored.
    pub fn on_started(&mut self, now: NaiveDateTime, tool: ToolIdentity, auto_retry: bool) -> bool {
        if self.is_idle() {
            return false;
        }
        if self.phase == ExecutionPhase::Checking {
            debug!("{} relaunched, clearing previous output", tool);
            self.last_raw_output.clear();
            self.rate_limit = RateLimitEvent::NotLimited;
            self.rescheduled_target = None;
        }
        self.phase = ExecutionPhase::Checking;
        self.checking_started_at = Some(now);
        self.status = if auto_retry {
            StatusLine::new(
                StatusKind::Monitoring,
                format!("{} 実行中 - Rate limit監視中...", tool.display_name()),
            )
        } else {
            StatusLine::new(
                StatusKind::Monitoring,
                format!("{} 動作ステータス取得待機中", tool.display_name()),
            )
        };
        true
    }

    /// Replace the terminal snapshot and re-run the rate-limit parser.
    pub fn on_output(&mut self, text: String) -> bool {
        if self.is_idle() {
            return false;
        }
        self.rate_limit = RateLimitEvent::parse(&text);
        self.last_raw_output = text;
        if let Some(status) = self.rate_limit.status_text() {
            self.status = StatusLine::new(StatusKind::RateLimited, status);
        }
        true
    }

    pub fn on_rescheduled(&mut self, time: ClockTime) -> bool {
        if self.is_idle() {
            return false;
        }
        self.rescheduled_target = Some(time);
        true
    }

    /// Record that the local countdown reached the execution time.
    pub fn mark_execution_due(&mut self, now: NaiveDateTime) {
        if self.phase == ExecutionPhase::Waiting && self.execution_started_at.is_none() {
            self.execution_started_at = Some(now);
        }
    }

    /// `* -> Idle` once the launch call has returned.
    pub fn settle(&mut self, result: &crate::Result<LaunchOutcome>, auto_retry: bool) {
        match result {
            Ok(outcome) => {
                self.reset(outcome_status(outcome, auto_retry));
                if let Some(output) = &outcome.terminal_output {
                    self.last_raw_output = output.clone();
                }
            }
            Err(e) => self.reset(error_status(e)),
        }
    }

    /// `* -> Idle` on an explicit stop.
    pub fn stop(&mut self) {
        self.reset(StatusLine::new(StatusKind::Cancelled, status::CANCELLED));
    }

    /// Stay idle and show why a start was refused.
    pub fn reject(&mut self, error: &SchedulerError) {
        if self.is_idle() {
            self.status = error_status(error);
        }
    }

    fn reset(&mut self, status: StatusLine) {
        *self = RunState {
            status,
            ..Default::default()
        };
    }
}

fn outcome_status(outcome: &LaunchOutcome, auto_retry: bool) -> StatusLine {
    match outcome.kind() {
        LaunchStatus::Cancelled => StatusLine::new(StatusKind::Cancelled, status::CANCELLED),
        LaunchStatus::Completed(Some((minutes, seconds))) => StatusLine::new(
            StatusKind::Completed,
            format!("{} (処理時間: {}分{}秒)", status::COMPLETED, minutes, seconds),
        ),
        LaunchStatus::Completed(None) => StatusLine::new(StatusKind::Completed, status::COMPLETED),
        LaunchStatus::RateLimitDetected => {
            StatusLine::new(StatusKind::RateLimited, status::RATE_LIMIT_STOPPED)
        }
        LaunchStatus::Other(_) if auto_retry => {
            StatusLine::new(StatusKind::Completed, status::MONITORING_ENDED)
        }
        LaunchStatus::Other(_) => match (outcome.needs_retry, outcome.retry_time.as_deref()) {
            (Some(true), Some(time)) => StatusLine::new(
                StatusKind::Completed,
                format!("{} - {}に再実行予定", status::RUN_FINISHED, time),
            ),
            _ => StatusLine::new(StatusKind::Completed, status::RUN_FINISHED),
        },
    }
}

fn error_status(error: &SchedulerError) -> StatusLine {
    StatusLine::error(format!("エラー: {}", error))
}
