//! Rate-limit signature detection
//!
//! Backend tools report usage caps as unstructured human-readable text. The
//! matchers below are tried in a fixed priority order and the first hit wins.
//! Each matcher lists the literal messages it is meant to recognise; those
//! strings double as the regression fixtures in the tests.
//!
//! Detection is conservative: anything ambiguous is `NotLimited`.

use crate::clock::ClockTime;
use chrono::{Duration, NaiveDateTime};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Literal prefix the terminal backend uses when it has already scheduled a retry.
pub const RATE_LIMIT_DETECTED: &str = "Rate limit detected";

/// Shown when a message says "blocked" but carries no usable reset time.
pub const UNSPECIFIED_RESET_LABEL: &str = "指定時刻";

/// Shortest wait before retrying on a relative ETA
const MIN_RETRY_MINUTES: u32 = 1;

/// Substrings (lowercase) that signal an exhausted quota.
const USAGE_LIMIT_PHRASES: &[&str] = &[
    "usage limit reached",
    "rate limit",
    "resource_exhausted",
    "quota",
];

static SCHEDULED_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\D)(\d{2}):01(?:\D|$)").expect("valid regex"));
static REMAINING_MINUTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"残り約\s*(\d+)\s*分").expect("valid regex"));
static RESET_AT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)reset at (\d{1,2}(?:am|pm))").expect("valid regex"));

/// Structured rate-limit condition extracted from terminal text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RateLimitEvent {
    /// A retry was scheduled for `at` (always an `HH:01` slot);
    /// `remaining_minutes` is for display only.
    ScheduledReset {
        at: ClockTime,
        remaining_minutes: u32,
    },

    /// Limited, with roughly this many minutes until reset
    RemainingMinutes(u32),

    /// Limited until a named point such as `3pm`; `None` means no ETA at all
    NamedResetPoint(Option<String>),

    /// Ordinary output
    #[default]
    NotLimited,
}

/// A minute count split into whole hours and leftover minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemainingTime {
    pub hours: u32,
    pub minutes: u32,
}

impl RemainingTime {
    pub fn from_minutes(total: u32) -> Self {
        Self {
            hours: total / 60,
            minutes: total % 60,
        }
    }

    pub fn total_minutes(&self) -> u32 {
        self.hours * 60 + self.minutes
    }
}

impl fmt::Display for RemainingTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hours > 0 {
            write!(f, "{}時間{}分", self.hours, self.minutes)
        } else {
            write!(f, "{}分", self.minutes)
        }
    }
}

type Matcher = fn(&str) -> Option<RateLimitEvent>;

/// Matchers in priority order.
const MATCHERS: &[(&str, Matcher)] = &[
    ("scheduled-reset", match_scheduled_reset),
    ("usage-limit", match_usage_limit),
];

impl RateLimitEvent {
    /// Scan raw terminal text for a rate-limit signature.
    pub fn parse(text: &str) -> Self {
        MATCHERS
            .iter()
            .find_map(|(_, matcher)| matcher(text))
            .unwrap_or(RateLimitEvent::NotLimited)
    }

    pub fn is_limited(&self) -> bool {
        !matches!(self, RateLimitEvent::NotLimited)
    }

    /// Remaining time until reset, when the message carried one.
    pub fn remaining(&self) -> Option<RemainingTime> {
        match self {
            RateLimitEvent::ScheduledReset {
                remaining_minutes, ..
            }
            | RateLimitEvent::RemainingMinutes(remaining_minutes) => {
                Some(RemainingTime::from_minutes(*remaining_minutes))
            }
            _ => None,
        }
    }

    /// Label for the point the tool is waiting for.
    pub fn reset_label(&self) -> String {
        match self {
            RateLimitEvent::ScheduledReset { at, .. } => at.to_string(),
            RateLimitEvent::NamedResetPoint(Some(label)) => label.clone(),
            _ => UNSPECIFIED_RESET_LABEL.to_string(),
        }
    }

    /// Status line describing the condition, `None` for ordinary output.
    pub fn status_text(&self) -> Option<String> {
        match self {
            RateLimitEvent::ScheduledReset {
                at,
                remaining_minutes,
            } => Some(format!(
                "Rate limit検出 - {}に再実行予定 (残り約{})",
                at,
                RemainingTime::from_minutes(*remaining_minutes)
            )),
            RateLimitEvent::RemainingMinutes(minutes) => Some(format!(
                "Rate limit検出 - {}まで待機中 (残り約{})",
                self.reset_label(),
                RemainingTime::from_minutes(*minutes)
            )),
            RateLimitEvent::NamedResetPoint(_) => Some(format!(
                "Rate limit検出 - {}まで待機中...",
                self.reset_label()
            )),
            RateLimitEvent::NotLimited => None,
        }
    }

    /// When a retry should be attempted, or `None` when there is no ETA.
    pub fn retry_at(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            RateLimitEvent::ScheduledReset { at, .. } => Some(at.next_occurrence_after(now)),
            RateLimitEvent::RemainingMinutes(minutes) => {
                Some(now + Duration::minutes(i64::from((*minutes).max(MIN_RETRY_MINUTES))))
            }
            RateLimitEvent::NamedResetPoint(Some(label)) => {
                let hour = parse_twelve_hour(label)?;
                ClockTime::new(hour, 1).map(|t| t.next_occurrence_after(now))
            }
            RateLimitEvent::NamedResetPoint(None) | RateLimitEvent::NotLimited => None,
        }
    }
}

/// Text the terminal backend writes once it has scheduled a retry.
///
/// Parses back as `ScheduledReset` when `at` is an `HH:01` slot.
pub fn retry_notice(at: ClockTime, remaining_minutes: u32) -> String {
    format!(
        "{} - {}に再実行予定 (残り約{}分)",
        RATE_LIMIT_DETECTED, at, remaining_minutes
    )
}

/// `Rate limit detected - 15:01に再実行予定 (残り約90分)`
fn match_scheduled_reset(text: &str) -> Option<RateLimitEvent> {
    if !text.contains(RATE_LIMIT_DETECTED) {
        return None;
    }
    let hour: u32 = SCHEDULED_TIME.captures(text)?.get(1)?.as_str().parse().ok()?;
    let at = ClockTime::new(hour, 1)?;
    let remaining_minutes = remaining_minutes(text)?;
    Some(RateLimitEvent::ScheduledReset {
        at,
        remaining_minutes,
    })
}

/// `Claude usage limit reached. Your limit will reset at 3pm`
/// `Rate limit: 残り約45分`
/// `429 RESOURCE_EXHAUSTED`
/// `You exceeded your current quota`
fn match_usage_limit(text: &str) -> Option<RateLimitEvent> {
    let lower = text.to_lowercase();
    if !USAGE_LIMIT_PHRASES.iter().any(|p| lower.contains(p)) {
        return None;
    }

    if let Some(reset) = RESET_AT.captures(text).and_then(|c| c.get(1)) {
        return Some(RateLimitEvent::NamedResetPoint(Some(
            reset.as_str().to_lowercase(),
        )));
    }
    if let Some(minutes) = remaining_minutes(text) {
        return Some(RateLimitEvent::RemainingMinutes(minutes));
    }
    Some(RateLimitEvent::NamedResetPoint(None))
}

fn remaining_minutes(text: &str) -> Option<u32> {
    REMAINING_MINUTES.captures(text)?.get(1)?.as_str().parse().ok()
}

/// `3pm` -> 15, `12am` -> 0
fn parse_twelve_hour(label: &str) -> Option<u32> {
    let label = label.trim().to_ascii_lowercase();
    let (digits, pm) = if let Some(d) = label.strip_suffix("pm") {
        (d, true)
    } else {
        (label.strip_suffix("am")?, false)
    };
    let hour: u32 = digits.trim().parse().ok()?;
    if !(1..=12).contains(&hour) {
        return None;
    }
    Some(match (hour, pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, true) => h + 12,
        (h, false) => h,
    })
}
