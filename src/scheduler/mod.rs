//! Recurring schedules
//!
//! A schedule registers a tool to be run at a fixed time on a recurrence.
//! The live execution state machine never reads these; they are consumed
//! through `ScheduleService` by the CLI. Slots that passed without a run are
//! caught up through `CatchUp`, which launches them via the orchestrator.

pub mod catchup;
mod store;

pub use catchup::{CatchUp, CatchUpOutcome, CatchUpReport};
pub use store::FileScheduleStore;

use crate::clock::ClockTime;
use crate::tool::ToolIdentity;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_HISTORY_ENTRIES: usize = 10;
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Recurrence {
    Once,
    Daily,
    /// Same weekday as the start date
    Weekly,
    /// Every `days` days counted from the start date
    Interval { days: u32 },
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recurrence::Once => f.write_str("once"),
            Recurrence::Daily => f.write_str("daily"),
            Recurrence::Weekly => f.write_str("weekly"),
            Recurrence::Interval { days } => write!(f, "every {} days", days),
        }
    }
}

/// Raw registration input, validated by the service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub tool: String,
    pub execution_time: String,
    pub target_directory: String,
    pub command_args: String,
    pub title: String,
    /// `once`, `daily`, `weekly` or `interval`; daily when absent
    pub schedule_type: Option<String>,
    pub interval_value: Option<u32>,
    /// `YYYY-MM-DD`
    pub start_date: Option<String>,
}

/// A request that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidRequest {
    pub tool: ToolIdentity,
    pub execution_time: ClockTime,
    pub recurrence: Recurrence,
    pub start_date: Option<NaiveDate>,
}

impl ScheduleRequest {
    /// Check the request. The error is the user-facing message.
    pub fn validate(&self) -> std::result::Result<ValidRequest, String> {
        let Some((hour, minute)) = self.execution_time.split_once(':') else {
            return Err("時刻の形式が正しくありません（HH:MM形式で指定してください）".to_string());
        };
        let hour = match hour.trim().parse::<u32>() {
            Ok(h) if h <= 23 => h,
            _ => return Err("時間は0-23の範囲で指定してください".to_string()),
        };
        let minute = match minute.trim().parse::<u32>() {
            Ok(m) if m <= 59 => m,
            _ => return Err("分は0-59の範囲で指定してください".to_string()),
        };
        let execution_time = ClockTime::new(hour, minute)
            .ok_or_else(|| "時刻の形式が正しくありません（HH:MM形式で指定してください）".to_string())?;

        let tool = self
            .tool
            .parse::<ToolIdentity>()
            .map_err(|_| "無効なツール指定です".to_string())?;

        if self.command_args.trim().is_empty() {
            return Err("スケジュール命令を入力してください".to_string());
        }

        let start_date = match self.start_date.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|_| {
                "開始日の形式が正しくありません（YYYY-MM-DD形式で指定してください）".to_string()
            })?),
        };

        let recurrence = match self.schedule_type.as_deref().unwrap_or("daily") {
            "once" => Recurrence::Once,
            "daily" => Recurrence::Daily,
            "weekly" => {
                if start_date.is_none() {
                    return Err(
                        "毎週実行の場合は開始日を指定してください（曜日決定のため）".to_string()
                    );
                }
                Recurrence::Weekly
            }
            "interval" => match (self.interval_value, start_date) {
                (Some(days), Some(_)) if days > 0 => Recurrence::Interval { days },
                _ => {
                    return Err(
                        "間隔実行の場合は間隔（日）と開始日を指定してください".to_string()
                    )
                }
            },
            other => return Err(format!("無効な実行タイプです: {}", other)),
        };

        Ok(ValidRequest {
            tool,
            execution_time,
            recurrence,
            start_date,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredSchedule {
    pub schedule_id: String,
    pub tool: ToolIdentity,
    #[serde(default)]
    pub title: String,
    pub execution_time: ClockTime,
    pub recurrence: Recurrence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub target_directory: String,
    pub command_args: String,
    pub created_at: DateTime<Utc>,
}

impl RegisteredSchedule {
    /// Most recent slot at or before `now`, if there has been one.
    pub fn last_scheduled_time(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        let time = self.execution_time.as_naive();
        let today = now.date();

        match self.recurrence {
            Recurrence::Once => {
                let at = self.start_date?.and_time(time);
                (at <= now).then_some(at)
            }
            Recurrence::Daily => {
                let candidate = today.and_time(time);
                if candidate > now {
                    Some(today.pred_opt()?.and_time(time))
                } else {
                    Some(candidate)
                }
            }
            Recurrence::Weekly => {
                let start = self.start_date?;
                let days_back = (7 + i64::from(today.weekday().num_days_from_monday())
                    - i64::from(start.weekday().num_days_from_monday()))
                    % 7;
                let candidate = (today - Duration::days(days_back)).and_time(time);
                if candidate > now {
                    Some(candidate - Duration::days(7))
                } else {
                    Some(candidate)
                }
            }
            Recurrence::Interval { days } => {
                let start = self.start_date?;
                let interval = i64::from(days);
                if interval == 0 || today < start {
                    return None;
                }
                let since = (today - start).num_days();
                let offset = since - since % interval;
                let candidate = (start + Duration::days(offset)).and_time(time);
                if candidate <= now {
                    return Some(candidate);
                }
                if offset < interval {
                    return None;
                }
                Some((start + Duration::days(offset - interval)).and_time(time))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self.recurrence {
            Recurrence::Once => format!("{}", self.execution_time),
            Recurrence::Daily => format!("毎日 {}", self.execution_time),
            Recurrence::Weekly => format!("毎週 {}", self.execution_time),
            Recurrence::Interval { days } => format!("{}日ごと {}", days, self.execution_time),
        }
    }
}

/// Outcome of a register, update or unregister call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_tool: Option<ToolIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_id: Option<String>,
}

impl ScheduleResult {
    pub fn succeeded(message: impl Into<String>, tool: ToolIdentity, schedule_id: String) -> Self {
        Self {
            success: true,
            message: message.into(),
            registered_tool: Some(tool),
            schedule_id: Some(schedule_id),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            registered_tool: None,
            schedule_id: None,
        }
    }
}

/// One line of the schedule history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// RFC 3339, UTC
    pub timestamp: String,
    pub schedule_id: String,
    pub tool: String,
    pub status: String,
}

impl HistoryEntry {
    pub fn at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Registration of recurring runs with some external scheduler.
#[async_trait]
pub trait ScheduleService: Send + Sync {
    async fn register(&self, request: ScheduleRequest) -> Result<ScheduleResult>;

    async fn update(&self, schedule_id: &str, request: ScheduleRequest) -> Result<ScheduleResult>;

    async fn unregister(&self, tool: &str, schedule_id: &str) -> Result<ScheduleResult>;

    async fn list(&self) -> Result<Vec<RegisteredSchedule>>;

    /// Newest first, at most `MAX_HISTORY_ENTRIES`
    async fn history(&self, schedule_id: &str) -> Result<Vec<HistoryEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request(time: &str) -> ScheduleRequest {
        ScheduleRequest {
            tool: "claude".to_string(),
            execution_time: time.to_string(),
            command_args: "refactor".to_string(),
            ..Default::default()
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap()
    }

    fn schedule(time: &str, recurrence: Recurrence, start: Option<&str>) -> RegisteredSchedule {
        RegisteredSchedule {
            schedule_id: "20250101000000000".to_string(),
            tool: ToolIdentity::Claude,
            title: String::new(),
            execution_time: time.parse().unwrap(),
            recurrence,
            start_date: start.map(|s| NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()),
            target_directory: "/tmp".to_string(),
            command_args: "refactor".to_string(),
            created_at: DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
        }
    }

    #[test]
    fn validation_messages() {
        let cases = [
            (request("0930"), "時刻の形式が正しくありません（HH:MM形式で指定してください）"),
            (request("24:00"), "時間は0-23の範囲で指定してください"),
            (request("12:60"), "分は0-59の範囲で指定してください"),
            (
                ScheduleRequest {
                    tool: "cursor".to_string(),
                    ..request("09:30")
                },
                "無効なツール指定です",
            ),
            (
                ScheduleRequest {
                    command_args: "  ".to_string(),
                    ..request("09:30")
                },
                "スケジュール命令を入力してください",
            ),
            (
                ScheduleRequest {
                    schedule_type: Some("weekly".to_string()),
                    ..request("09:30")
                },
                "毎週実行の場合は開始日を指定してください（曜日決定のため）",
            ),
            (
                ScheduleRequest {
                    schedule_type: Some("interval".to_string()),
                    start_date: Some("2025-01-01".to_string()),
                    ..request("09:30")
                },
                "間隔実行の場合は間隔（日）と開始日を指定してください",
            ),
        ];

        for (request, message) in cases {
            assert_eq!(request.validate(), Err(message.to_string()));
        }
    }

    #[test]
    fn valid_request_defaults_to_daily() {
        let valid = request("7:05").validate().unwrap();
        assert_eq!(valid.tool, ToolIdentity::Claude);
        assert_eq!(valid.execution_time.to_string(), "07:05");
        assert_eq!(valid.recurrence, Recurrence::Daily);
    }

    #[test]
    fn daily_last_slot() {
        let s = schedule("09:00", Recurrence::Daily, None);
        assert_eq!(
            s.last_scheduled_time(at(2025, 3, 10, 10, 0)),
            Some(at(2025, 3, 10, 9, 0))
        );
        assert_eq!(
            s.last_scheduled_time(at(2025, 3, 10, 8, 0)),
            Some(at(2025, 3, 9, 9, 0))
        );
    }

    #[test]
    fn weekly_last_slot_follows_start_weekday() {
        // 2025-03-03 is a Monday
        let s = schedule("09:00", Recurrence::Weekly, Some("2025-03-03"));
        assert_eq!(
            s.last_scheduled_time(at(2025, 3, 12, 12, 0)),
            Some(at(2025, 3, 10, 9, 0))
        );
        assert_eq!(
            s.last_scheduled_time(at(2025, 3, 10, 8, 0)),
            Some(at(2025, 3, 3, 9, 0))
        );
    }

    #[test]
    fn interval_last_slot() {
        let s = schedule("09:00", Recurrence::Interval { days: 3 }, Some("2025-03-01"));
        assert_eq!(
            s.last_scheduled_time(at(2025, 3, 5, 12, 0)),
            Some(at(2025, 3, 4, 9, 0))
        );
        assert_eq!(
            s.last_scheduled_time(at(2025, 3, 7, 8, 0)),
            Some(at(2025, 3, 4, 9, 0))
        );
        assert_eq!(s.last_scheduled_time(at(2025, 3, 1, 8, 0)), None);
        assert_eq!(s.last_scheduled_time(at(2025, 2, 28, 12, 0)), None);
    }

    #[test]
    fn once_slot_only_after_it_passed() {
        let s = schedule("09:00", Recurrence::Once, Some("2025-03-10"));
        assert_eq!(s.last_scheduled_time(at(2025, 3, 10, 8, 59)), None);
        assert_eq!(
            s.last_scheduled_time(at(2025, 3, 11, 0, 0)),
            Some(at(2025, 3, 10, 9, 0))
        );
    }

    #[test]
    fn recurrence_serializes_with_type_tag() {
        let json = serde_json::to_value(Recurrence::Interval { days: 2 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "interval", "days": 2}));
    }
}
