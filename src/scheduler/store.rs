//! File-backed schedule registry
//!
//! Schedules live in one JSON array; run history is an append-only JSONL
//! file shared by all schedules.

use super::{
    HistoryEntry, RegisteredSchedule, Recurrence, ScheduleRequest, ScheduleResult,
    ScheduleService, MAX_HISTORY_ENTRIES,
};
use crate::clock::Clock;
use crate::tool::ToolIdentity;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Timelike, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct FileScheduleStore {
    schedules_file: PathBuf,
    history_file: PathBuf,
    clock: Arc<dyn Clock>,
    /// Serializes read-modify-write of the schedules file
    lock: Mutex<()>,
}

impl FileScheduleStore {
    pub fn new(schedules_file: PathBuf, history_file: PathBuf, clock: Arc<dyn Clock>) -> Self {
        Self {
            schedules_file,
            history_file,
            clock,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<RegisteredSchedule>> {
        if !self.schedules_file.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.schedules_file).await?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, schedules: &[RegisteredSchedule]) -> Result<()> {
        if let Some(parent) = self.schedules_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(schedules)?;
        fs::write(&self.schedules_file, content).await?;
        debug!("Saved {} schedules to {:?}", schedules.len(), self.schedules_file);
        Ok(())
    }

    /// `%Y%m%d%H%M%S` plus milliseconds, bumped until unused.
    fn new_schedule_id(&self, existing: &[RegisteredSchedule]) -> String {
        let mut at = self.clock.now();
        loop {
            let id = format!(
                "{}{:03}",
                at.format("%Y%m%d%H%M%S"),
                at.nanosecond() / 1_000_000 % 1_000
            );
            if !existing.iter().any(|s| s.schedule_id == id) {
                return id;
            }
            at += Duration::milliseconds(1);
        }
    }

    /// Append one line to the history file.
    pub async fn record_history(
        &self,
        schedule_id: &str,
        tool: ToolIdentity,
        status: &str,
    ) -> Result<()> {
        if let Some(parent) = self.history_file.parent() {
            fs::create_dir_all(parent).await?;
        }
        let entry = HistoryEntry {
            timestamp: to_utc(self.clock.now())
                .format("%Y-%m-%dT%H:%M:%SZ")
                .to_string(),
            schedule_id: schedule_id.to_string(),
            tool: tool.name().to_string(),
            status: status.to_string(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_file)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Every readable history line, oldest first.
    async fn read_history(&self) -> Result<Vec<HistoryEntry>> {
        if !self.history_file.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.history_file).await?;
        let entries = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<HistoryEntry>(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable history line: {}", e);
                    None
                }
            })
            .collect();
        Ok(entries)
    }

    /// Schedules whose latest slot has passed without a later history entry.
    ///
    /// Slots from before the schedule was registered do not count.
    pub async fn missed_runs(&self) -> Result<Vec<RegisteredSchedule>> {
        let now = self.clock.now();
        let schedules = self.load().await?;

        let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
        for entry in self.read_history().await? {
            let Some(at) = entry.at() else {
                continue;
            };
            latest
                .entry(entry.schedule_id)
                .and_modify(|t| *t = (*t).max(at))
                .or_insert(at);
        }

        let missed = schedules
            .into_iter()
            .filter(|schedule| {
                let Some(slot) = schedule.last_scheduled_time(now) else {
                    return false;
                };
                let slot = to_utc(slot);
                if slot < schedule.created_at {
                    return false;
                }
                latest
                    .get(&schedule.schedule_id)
                    .is_none_or(|last_run| *last_run < slot)
            })
            .collect();
        Ok(missed)
    }

    fn build(
        &self,
        schedule_id: String,
        request: &ScheduleRequest,
        created_at: DateTime<Utc>,
    ) -> std::result::Result<RegisteredSchedule, String> {
        let valid = request.validate()?;
        Ok(RegisteredSchedule {
            schedule_id,
            tool: valid.tool,
            title: request.title.trim().to_string(),
            execution_time: valid.execution_time,
            recurrence: valid.recurrence,
            start_date: valid.start_date,
            target_directory: request.target_directory.trim().to_string(),
            command_args: request.command_args.clone(),
            created_at,
        })
    }
}

#[async_trait]
impl ScheduleService for FileScheduleStore {
    async fn register(&self, request: ScheduleRequest) -> Result<ScheduleResult> {
        let _guard = self.lock.lock().await;
        let mut schedules = self.load().await?;
        let schedule_id = self.new_schedule_id(&schedules);
        let created_at = to_utc(self.clock.now());

        let schedule = match self.build(schedule_id.clone(), &request, created_at) {
            Ok(schedule) => schedule,
            Err(message) => return Ok(ScheduleResult::failed(message)),
        };

        let time = schedule.execution_time;
        let message = match schedule.recurrence {
            Recurrence::Daily => format!("スケジュール登録成功: 毎日 {}:{:02}", time.hour(), time.minute()),
            Recurrence::Weekly => format!("スケジュール登録成功: 毎週 {}:{:02}", time.hour(), time.minute()),
            Recurrence::Interval { days } => format!(
                "スケジュール登録成功: {}日ごと {}:{:02}",
                days,
                time.hour(),
                time.minute()
            ),
            Recurrence::Once => format!("スケジュール登録成功: {}:{:02}", time.hour(), time.minute()),
        };
        let tool = schedule.tool;

        schedules.push(schedule);
        self.save(&schedules).await?;
        info!("Registered schedule {} for {}", schedule_id, tool);

        Ok(ScheduleResult::succeeded(message, tool, schedule_id))
    }

    async fn update(&self, schedule_id: &str, request: ScheduleRequest) -> Result<ScheduleResult> {
        let _guard = self.lock.lock().await;
        let mut schedules = self.load().await?;
        let Some(index) = schedules.iter().position(|s| s.schedule_id == schedule_id) else {
            return Ok(ScheduleResult::failed(format!(
                "スケジュール更新エラー: {} が見つかりません",
                schedule_id
            )));
        };

        let created_at = schedules[index].created_at;
        let schedule = match self.build(schedule_id.to_string(), &request, created_at) {
            Ok(schedule) => schedule,
            Err(message) => return Ok(ScheduleResult::failed(message)),
        };
        let tool = schedule.tool;

        schedules[index] = schedule;
        self.save(&schedules).await?;
        info!("Updated schedule {}", schedule_id);

        Ok(ScheduleResult::succeeded(
            "スケジュール更新成功",
            tool,
            schedule_id.to_string(),
        ))
    }

    async fn unregister(&self, tool: &str, schedule_id: &str) -> Result<ScheduleResult> {
        let Ok(tool) = tool.parse::<ToolIdentity>() else {
            return Ok(ScheduleResult::failed("無効なツール指定です"));
        };

        let _guard = self.lock.lock().await;
        let mut schedules = self.load().await?;
        let before = schedules.len();
        schedules.retain(|s| !(s.schedule_id == schedule_id && s.tool == tool));
        if schedules.len() == before {
            return Ok(ScheduleResult::failed(format!(
                "スケジュール削除エラー: {} が見つかりません",
                schedule_id
            )));
        }

        self.save(&schedules).await?;
        info!("Unregistered schedule {} for {}", schedule_id, tool);

        Ok(ScheduleResult::succeeded(
            "スケジュール削除成功",
            tool,
            schedule_id.to_string(),
        ))
    }

    async fn list(&self) -> Result<Vec<RegisteredSchedule>> {
        self.load().await
    }

    async fn history(&self, schedule_id: &str) -> Result<Vec<HistoryEntry>> {
        if schedule_id.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut entries: Vec<HistoryEntry> = self
            .read_history()
            .await?
            .into_iter()
            .filter(|entry| entry.schedule_id == schedule_id)
            .collect();
        if entries.len() > MAX_HISTORY_ENTRIES {
            entries = entries.split_off(entries.len() - MAX_HISTORY_ENTRIES);
        }
        entries.reverse();
        Ok(entries)
    }
}

fn to_utc(local: NaiveDateTime) -> DateTime<Utc> {
    match Local.from_local_datetime(&local).earliest() {
        Some(dt) => dt.with_timezone(&Utc),
        None => Utc.from_utc_datetime(&local),
    }
}
