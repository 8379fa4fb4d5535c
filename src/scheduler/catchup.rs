//! Catch-up runs for schedules whose slot passed unattended
//!
//! Each missed schedule is marked `wake-missed` and then launched right away
//! through the orchestrator. The outcome is appended to the schedule's
//! history, which also clears it from the missed list.

use super::{FileScheduleStore, RegisteredSchedule};
use crate::clock::{Clock, ClockTime};
use crate::execution::StatusKind;
use crate::orchestrator::{Orchestrator, ToolView};
use crate::settings::ExecutionSettings;
use crate::tool::ToolIdentity;
use crate::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// History statuses written by catch-up
pub mod history {
    pub const WAKE_MISSED: &str = "wake-missed";
    pub const STARTED: &str = "catchup-started";
    pub const SUCCESS: &str = "catchup-success";
    pub const FAILURE: &str = "catchup-failure";
    pub const SKIPPED_RUNNING: &str = "catchup-skipped-running";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchUpOutcome {
    /// The tool was busy with another run
    Skipped,
    /// The launch settled; holds the final view
    Ran(ToolView),
    Failed(String),
}

impl CatchUpOutcome {
    fn history_status(&self) -> &'static str {
        match self {
            CatchUpOutcome::Skipped => history::SKIPPED_RUNNING,
            CatchUpOutcome::Ran(_) => history::SUCCESS,
            CatchUpOutcome::Failed(_) => history::FAILURE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpReport {
    pub schedule_id: String,
    pub tool: ToolIdentity,
    pub outcome: CatchUpOutcome,
}

/// Runs missed schedules through an `Orchestrator`.
pub struct CatchUp {
    store: Arc<FileScheduleStore>,
    orchestrator: Orchestrator,
    clock: Arc<dyn Clock>,
    /// Tool options and launch options to run with, per tool
    base: HashMap<ToolIdentity, ExecutionSettings>,
}

impl CatchUp {
    pub fn new(store: Arc<FileScheduleStore>, orchestrator: Orchestrator, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            orchestrator,
            clock,
            base: HashMap::new(),
        }
    }

    /// Use the tool options of `settings` instead of the tool defaults.
    pub fn with_base_settings(mut self, settings: ExecutionSettings) -> Self {
        self.base.insert(settings.tool(), settings);
        self
    }

    /// Settings that launch `schedule` now.
    pub fn settings_for(&self, schedule: &RegisteredSchedule) -> ExecutionSettings {
        let now = self.clock.now();
        let mut settings = self
            .base
            .get(&schedule.tool)
            .cloned()
            .unwrap_or_else(|| ExecutionSettings::defaults_for(schedule.tool, now));
        settings.execution_time = ClockTime::of(now);
        settings.target_directory = schedule.target_directory.clone();
        settings.command = schedule.command_args.clone();
        settings.use_new_window = true;
        settings.run_immediately = true;
        settings
    }

    /// Mark and run every missed schedule, one after another.
    pub async fn run_missed(&self) -> Result<Vec<CatchUpReport>> {
        let missed = self.store.missed_runs().await?;
        if !missed.is_empty() {
            info!("{} missed schedules to catch up", missed.len());
        }

        let mut reports = Vec::with_capacity(missed.len());
        for schedule in missed {
            self.store
                .record_history(&schedule.schedule_id, schedule.tool, history::WAKE_MISSED)
                .await?;
            let outcome = self.execute(&schedule).await?;
            reports.push(CatchUpReport {
                schedule_id: schedule.schedule_id,
                tool: schedule.tool,
                outcome,
            });
        }
        Ok(reports)
    }

    /// Launch one schedule now and record how it went.
    pub async fn execute(&self, schedule: &RegisteredSchedule) -> Result<CatchUpOutcome> {
        let outcome = self.launch(schedule).await?;
        match &outcome {
            CatchUpOutcome::Skipped => info!(
                "{} is running, skipped catch-up of {}",
                schedule.tool, schedule.schedule_id
            ),
            CatchUpOutcome::Ran(view) => {
                info!("Catch-up of {} finished: {}", schedule.schedule_id, view.status)
            }
            CatchUpOutcome::Failed(reason) => {
                warn!("Catch-up of {} failed: {}", schedule.schedule_id, reason)
            }
        }
        self.store
            .record_history(&schedule.schedule_id, schedule.tool, outcome.history_status())
            .await?;
        Ok(outcome)
    }

    async fn launch(&self, schedule: &RegisteredSchedule) -> Result<CatchUpOutcome> {
        if self.orchestrator.is_running(schedule.tool).await {
            return Ok(CatchUpOutcome::Skipped);
        }
        let dir = schedule.target_directory.trim();
        if !Path::new(dir).is_dir() {
            return Ok(CatchUpOutcome::Failed(format!(
                "ディレクトリが存在しません: {}",
                schedule.target_directory
            )));
        }

        self.store
            .record_history(&schedule.schedule_id, schedule.tool, history::STARTED)
            .await?;
        let outcome = match self
            .orchestrator
            .start(schedule.tool, self.settings_for(schedule))
            .await
        {
            Ok(view) if matches!(view.status.kind, StatusKind::Error | StatusKind::Cancelled) => {
                CatchUpOutcome::Failed(view.status.text)
            }
            Ok(view) => CatchUpOutcome::Ran(view),
            Err(e) => CatchUpOutcome::Failed(e.to_string()),
        };
        Ok(outcome)
    }
}
