//! Countdown text for a running tool
//!
//! `project` is recomputed on every tick. It never mutates state; when the
//! waiting countdown reaches the execution time it returns a transition
//! request that the orchestrator applies.

use crate::clock::ClockTime;
use crate::execution::{ExecutionPhase, RunState};
use crate::rules::{RateLimitEvent, RemainingTime};
use crate::settings::ExecutionSettings;
use chrono::{Duration, NaiveDateTime};

/// Length of the cosmetic settling window shown after launch without auto-retry
pub const SETTLING_WINDOW_SECS: i64 = 120;

/// Period of the cosmetic "next check" cycle shown while monitoring
pub const CHECK_CYCLE_SECS: i64 = 60;

pub const EXECUTING: &str = "実行中...";
pub const WAIT_COMPLETE: &str = "待機完了";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionRequest {
    /// The local countdown reached the execution time
    ExecutionDue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    pub text: String,
    pub transition: Option<TransitionRequest>,
}

impl Projection {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            transition: None,
        }
    }
}

pub fn project(now: NaiveDateTime, state: &RunState, settings: &ExecutionSettings) -> Projection {
    match state.phase {
        ExecutionPhase::Idle => Projection::default(),
        ExecutionPhase::Waiting => project_waiting(now, state, settings),
        ExecutionPhase::Checking if settings.auto_retry_on_rate_limit => {
            project_monitoring(now, state)
        }
        ExecutionPhase::Checking => {
            let remaining = settling_remaining(elapsed_checking(now, state));
            if remaining == 0 {
                Projection::text(WAIT_COMPLETE)
            } else {
                Projection::text(format!("{}分 {}秒", remaining / 60, remaining % 60))
            }
        }
    }
}

/// Seconds left in the settling window after `elapsed` seconds, never negative.
pub fn settling_remaining(elapsed: i64) -> i64 {
    (SETTLING_WINDOW_SECS - elapsed).max(0)
}

/// Target of the waiting countdown.
///
/// Anchored on the moment waiting began, so the target does not roll over
/// to tomorrow once it has been reached.
pub fn waiting_target(now: NaiveDateTime, state: &RunState, time: ClockTime) -> NaiveDateTime {
    if let Some(since) = state.waiting_since {
        return time.next_occurrence_after(since);
    }
    let today = time.on_day_of(now);
    if today <= now && state.execution_started_at.is_none() {
        today + Duration::days(1)
    } else {
        today
    }
}

fn project_waiting(now: NaiveDateTime, state: &RunState, settings: &ExecutionSettings) -> Projection {
    let target = waiting_target(now, state, settings.execution_time);
    if settings.run_immediately || now >= target {
        return Projection {
            text: EXECUTING.to_string(),
            transition: Some(TransitionRequest::ExecutionDue),
        };
    }
    Projection::text(format_duration(target - now))
}

fn project_monitoring(now: NaiveDateTime, state: &RunState) -> Projection {
    if let (Some(target), true) = (state.rescheduled_target, state.rate_limit.is_limited()) {
        let target = target.next_occurrence_after(now);
        return Projection::text(format_duration(target - now));
    }

    match &state.rate_limit {
        RateLimitEvent::RemainingMinutes(minutes)
        | RateLimitEvent::ScheduledReset {
            remaining_minutes: minutes,
            ..
        } => {
            let remaining = RemainingTime::from_minutes(*minutes);
            Projection::text(format!("{}時間 {}分 0秒", remaining.hours, remaining.minutes))
        }
        RateLimitEvent::NamedResetPoint(_) => {
            Projection::text(format!("{}まで待機中...", state.rate_limit.reset_label()))
        }
        RateLimitEvent::NotLimited => {
            let elapsed = elapsed_checking(now, state);
            Projection::text(format!(
                "次の確認まで: {}秒",
                CHECK_CYCLE_SECS - elapsed % CHECK_CYCLE_SECS
            ))
        }
    }
}

fn elapsed_checking(now: NaiveDateTime, state: &RunState) -> i64 {
    state
        .checking_started_at
        .map(|started| (now - started).num_seconds().max(0))
        .unwrap_or(0)
}

/// `1日 2時間 3分 4秒`, with the day part only when non-zero.
fn format_duration(d: Duration) -> String {
    let total = d.num_seconds().max(0);
    let days = total / 86_400;
    let hours = total % 86_400 / 3_600;
    let minutes = total % 3_600 / 60;
    let seconds = total % 60;
    let hms = format!("{}時間 {}分 {}秒", hours, minutes, seconds);
    if days > 0 {
        format!("{}日 {}", days, hms)
    } else {
        hms
    }
}
