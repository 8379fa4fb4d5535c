//! Execution orchestrator
//!
//! Owns the `RunState` of every tool. All mutations go through here: the
//! start and stop commands, backend events, and the shared ticker that
//! re-projects countdowns while any tool is running.

use crate::backend::{BackendEvent, EventBus, TerminalBackend};
use crate::clock::Clock;
use crate::countdown::{self, TransitionRequest};
use crate::execution::{ExecutionPhase, RunState, StatusLine};
use crate::settings::{ExecutionSettings, PreflightError};
use crate::tool::ToolIdentity;
use crate::{Result, SchedulerError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const VIEW_CAPACITY: usize = 64;

/// Observable state of one tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolView {
    pub tool: ToolIdentity,
    pub phase: ExecutionPhase,
    pub is_running: bool,
    pub status: StatusLine,
    pub countdown: String,
    pub tool_output: String,
}

#[derive(Debug, Default)]
struct ToolRun {
    state: RunState,
    /// Snapshot handed to the in-flight launch
    settings: Option<ExecutionSettings>,
    /// Id of the launch allowed to settle this run
    active_run: Option<u64>,
    cancel: Option<CancellationToken>,
}

impl ToolRun {
    fn view(&self, tool: ToolIdentity) -> ToolView {
        ToolView {
            tool,
            phase: self.state.phase,
            is_running: self.state.is_running,
            status: self.state.status.clone(),
            countdown: self.state.countdown.clone(),
            tool_output: self.state.last_raw_output.clone(),
        }
    }

    fn auto_retry(&self) -> bool {
        self.settings
            .as_ref()
            .is_some_and(|s| s.auto_retry_on_rate_limit)
    }

    fn reproject(&mut self, now: chrono::NaiveDateTime) {
        let Some(settings) = &self.settings else {
            return;
        };
        let projection = countdown::project(now, &self.state, settings);
        if projection.transition == Some(TransitionRequest::ExecutionDue) {
            self.state.mark_execution_due(now);
        }
        self.state.countdown = projection.text;
    }

    fn clear(&mut self) {
        self.settings = None;
        self.active_run = None;
        self.cancel = None;
    }
}

struct Inner {
    backend: Arc<dyn TerminalBackend>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    runs: RwLock<HashMap<ToolIdentity, ToolRun>>,
    /// Tool that untagged backend events belong to
    selected: RwLock<ToolIdentity>,
    next_run_id: AtomicU64,
    ticker: Mutex<Option<JoinHandle<()>>>,
    updates: broadcast::Sender<ToolView>,
}

/// Drives launches and keeps per-tool state. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn TerminalBackend>,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
    ) -> Self {
        let (updates, _) = broadcast::channel(VIEW_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                backend,
                clock,
                tick_interval,
                runs: RwLock::new(HashMap::new()),
                selected: RwLock::new(ToolIdentity::Claude),
                next_run_id: AtomicU64::new(1),
                ticker: Mutex::new(None),
                updates,
            }),
        }
    }

    /// Receive a `ToolView` after every change.
    pub fn subscribe_views(&self) -> broadcast::Receiver<ToolView> {
        self.inner.updates.subscribe()
    }

    pub async fn select_tool(&self, tool: ToolIdentity) {
        *self.inner.selected.write().await = tool;
    }

    pub async fn selected_tool(&self) -> ToolIdentity {
        *self.inner.selected.read().await
    }

    pub async fn snapshot(&self, tool: ToolIdentity) -> ToolView {
        let runs = self.inner.runs.read().await;
        match runs.get(&tool) {
            Some(run) => run.view(tool),
            None => ToolRun::default().view(tool),
        }
    }

    pub async fn views(&self) -> Vec<ToolView> {
        let mut views = Vec::new();
        for tool in ToolIdentity::all() {
            views.push(self.snapshot(*tool).await);
        }
        views
    }

    pub async fn is_running(&self, tool: ToolIdentity) -> bool {
        self.inner
            .runs
            .read()
            .await
            .get(&tool)
            .is_some_and(|run| run.state.is_running)
    }

    /// Launch `tool` with a snapshot of `settings` and wait for it to settle.
    ///
    /// Refusals (preflight failures, unavailable terminal, a run already in
    /// flight) return `Err` and leave the tool idle. A launch that fails or is
    /// stopped still returns `Ok` with the final view.
    pub async fn start(&self, tool: ToolIdentity, settings: ExecutionSettings) -> Result<ToolView> {
        if let Err(e) = self.preflight(tool, &settings).await {
            warn!("Not starting {}: {}", tool, e);
            self.update(tool, |run| run.state.reject(&e)).await;
            return Err(e);
        }

        let run_id = self.inner.next_run_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let auto_retry = settings.auto_retry_on_rate_limit;
        {
            let now = self.inner.clock.now();
            let mut runs = self.inner.runs.write().await;
            let run = runs.entry(tool).or_default();
            if run.state.is_running {
                return Err(SchedulerError::AlreadyRunning(tool));
            }
            run.state.begin(now);
            run.settings = Some(settings.clone());
            run.active_run = Some(run_id);
            run.cancel = Some(token.clone());
            run.reproject(now);
        }
        self.publish(tool).await;
        self.ensure_ticker().await;

        info!("Launching {} at {}", tool, settings.execution_time);
        let result = tokio::select! {
            result = self.inner.backend.launch(tool, settings) => result,
            _ = token.cancelled() => {
                debug!("Launch of {} abandoned after stop", tool);
                return Ok(self.snapshot(tool).await);
            }
        };

        match &result {
            Ok(outcome) => info!("{} settled: {}", tool, outcome.status),
            Err(e) => warn!("{} launch failed: {}", tool, e),
        }

        let settled = {
            let mut runs = self.inner.runs.write().await;
            match runs.get_mut(&tool) {
                Some(run) if run.active_run == Some(run_id) => {
                    run.state.settle(&result, auto_retry);
                    run.clear();
                    true
                }
                _ => false,
            }
        };
        if settled {
            self.publish(tool).await;
        } else {
            debug!("Stale settle for {} ignored", tool);
        }

        Ok(self.snapshot(tool).await)
    }

    /// Cancel the tool's launch and reset its state.
    ///
    /// Local state is reset even when the backend fails to cancel; the
    /// terminal process may outlive this call briefly.
    pub async fn stop(&self, tool: ToolIdentity) {
        if let Err(e) = self.inner.backend.cancel(tool).await {
            warn!("Backend failed to cancel {}: {}", tool, e);
        }

        let token = {
            let mut runs = self.inner.runs.write().await;
            let run = runs.entry(tool).or_default();
            let token = run.cancel.take();
            run.state.stop();
            run.clear();
            token
        };
        info!("Stopped {}", tool);
        self.publish(tool).await;

        // Abandon the launch call only after the reset, so it reports the
        // stopped state.
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Stop every running tool and the ticker.
    pub async fn shutdown(&self) {
        let running: Vec<ToolIdentity> = {
            let runs = self.inner.runs.read().await;
            runs.iter()
                .filter(|(_, run)| run.state.is_running)
                .map(|(tool, _)| *tool)
                .collect()
        };
        for tool in running {
            self.stop(tool).await;
        }
        if let Some(handle) = self.inner.ticker.lock().await.take() {
            handle.abort();
        }
    }

    /// Apply one backend event. Untagged events go to the selected tool.
    pub async fn handle_event(&self, event: BackendEvent) {
        let tool = match event.tool() {
            Some(tool) => tool,
            None => self.selected_tool().await,
        };
        let name = event.name();
        let now = self.inner.clock.now();

        let applied = {
            let mut runs = self.inner.runs.write().await;
            match runs.get_mut(&tool) {
                Some(run) => {
                    let auto_retry = run.auto_retry();
                    let applied = match event {
                        BackendEvent::Started { .. } => run.state.on_started(now, tool, auto_retry),
                        BackendEvent::Output { text, .. } => run.state.on_output(text),
                        BackendEvent::Rescheduled { time, .. } => run.state.on_rescheduled(time),
                    };
                    if applied {
                        run.reproject(now);
                    }
                    applied
                }
                None => false,
            }
        };

        if applied {
            self.publish(tool).await;
        } else {
            debug!("Dropped {} event for idle {}", name, tool);
        }
    }

    /// Feed events from `bus` into this orchestrator, in arrival order,
    /// until the returned guard is dropped.
    pub fn attach(&self, bus: &EventBus) -> Subscription {
        let mut stream = BroadcastStream::new(bus.subscribe());
        let this = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(event) => this.handle_event(event).await,
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        warn!("Missed {} backend events", n)
                    }
                }
            }
        });
        Subscription {
            handle: Some(handle),
        }
    }

    /// Re-project the countdown of every running tool.
    ///
    /// Returns whether any tool is running.
    pub async fn tick(&self) -> bool {
        let now = self.inner.clock.now();
        let mut changed = Vec::new();
        let mut any_running = false;
        {
            let mut runs = self.inner.runs.write().await;
            for (tool, run) in runs.iter_mut() {
                if !run.state.is_running {
                    continue;
                }
                any_running = true;
                let before = run.state.countdown.clone();
                run.reproject(now);
                if run.state.countdown != before {
                    changed.push(*tool);
                }
            }
        }
        for tool in changed {
            self.publish(tool).await;
        }
        any_running
    }

    async fn any_running(&self) -> bool {
        self.inner
            .runs
            .read()
            .await
            .values()
            .any(|run| run.state.is_running)
    }

    /// Start the shared ticker unless it is already running.
    async fn ensure_ticker(&self) {
        let mut ticker = self.inner.ticker.lock().await;
        if ticker.is_some() {
            return;
        }
        debug!("Starting ticker");
        let weak = Arc::downgrade(&self.inner);
        *ticker = Some(tokio::spawn(run_ticker(weak, self.inner.tick_interval)));
    }

    #[cfg(test)]
    async fn has_ticker(&self) -> bool {
        self.inner.ticker.lock().await.is_some()
    }

    async fn preflight(&self, tool: ToolIdentity, settings: &ExecutionSettings) -> Result<()> {
        if settings.tool() != tool {
            return Err(SchedulerError::InvalidTool(format!(
                "settings for {} passed to {}",
                settings.tool(),
                tool
            )));
        }
        if self.is_running(tool).await {
            return Err(SchedulerError::AlreadyRunning(tool));
        }
        settings.preflight()?;
        let status = self.inner.backend.check_status().await?;
        if !status.installed {
            return Err(PreflightError::TerminalUnavailable.into());
        }
        Ok(())
    }

    async fn update(&self, tool: ToolIdentity, f: impl FnOnce(&mut ToolRun)) {
        {
            let mut runs = self.inner.runs.write().await;
            f(runs.entry(tool).or_default());
        }
        self.publish(tool).await;
    }

    async fn publish(&self, tool: ToolIdentity) {
        let view = self.snapshot(tool).await;
        let _ = self.inner.updates.send(view);
    }
}

async fn run_ticker(inner: Weak<Inner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let orchestrator = Orchestrator { inner };
        if orchestrator.tick().await {
            continue;
        }

        // Re-check under the ticker lock so a concurrent start either sees
        // the slot cleared or is seen here as running.
        let mut ticker = orchestrator.inner.ticker.lock().await;
        if !orchestrator.any_running().await {
            debug!("No tool running, stopping ticker");
            *ticker = None;
            break;
        }
    }
}

/// Guard for an event subscription; unsubscribes when dropped.
pub struct Subscription {
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::protocol::{LaunchOutcome, TerminalStatus};
    use crate::execution::StatusKind;
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime};

    /// Backend whose launch never returns on its own
    struct PendingBackend;

    #[async_trait]
    impl TerminalBackend for PendingBackend {
        async fn check_status(&self) -> Result<TerminalStatus> {
            Ok(TerminalStatus {
                installed: true,
                running: true,
            })
        }

        async fn launch(&self, _: ToolIdentity, _: ExecutionSettings) -> Result<LaunchOutcome> {
            std::future::pending().await
        }

        async fn cancel(&self, _: ToolIdentity) -> Result<()> {
            Err(SchedulerError::Backend("cancel not supported".to_string()))
        }
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 15)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn settings(tool: ToolIdentity) -> ExecutionSettings {
        let mut s = ExecutionSettings::defaults_for(tool, now());
        s.command = "refactor".to_string();
        s.target_directory = "/tmp/x".to_string();
        s
    }

    fn orchestrator() -> (Orchestrator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now()));
        let orchestrator =
            Orchestrator::new(Arc::new(PendingBackend), clock.clone(), Duration::from_secs(3600));
        (orchestrator, clock)
    }

    async fn wait_until_running(orchestrator: &Orchestrator, tool: ToolIdentity) {
        while !orchestrator.is_running(tool).await {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn mismatched_settings_are_rejected() {
        let (orchestrator, _) = orchestrator();
        let result = orchestrator
            .start(ToolIdentity::Codex, settings(ToolIdentity::Claude))
            .await;
        assert!(matches!(result, Err(SchedulerError::InvalidTool(_))));
        assert!(!orchestrator.is_running(ToolIdentity::Codex).await);
    }

    #[tokio::test]
    async fn stop_resets_even_when_backend_cancel_fails() {
        let (orchestrator, _) = orchestrator();
        let runner = orchestrator.clone();
        let handle = tokio::spawn(async move {
            runner.start(ToolIdentity::Claude, settings(ToolIdentity::Claude)).await
        });
        wait_until_running(&orchestrator, ToolIdentity::Claude).await;

        orchestrator.stop(ToolIdentity::Claude).await;
        let view = handle.await.unwrap().unwrap();
        assert_eq!(view.phase, ExecutionPhase::Idle);
        assert!(!view.is_running);
        assert_eq!(view.status.kind, StatusKind::Cancelled);
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let (orchestrator, _) = orchestrator();
        let runner = orchestrator.clone();
        let handle = tokio::spawn(async move {
            runner.start(ToolIdentity::Gemini, settings(ToolIdentity::Gemini)).await
        });
        wait_until_running(&orchestrator, ToolIdentity::Gemini).await;

        let second = orchestrator
            .start(ToolIdentity::Gemini, settings(ToolIdentity::Gemini))
            .await;
        assert!(matches!(second, Err(SchedulerError::AlreadyRunning(ToolIdentity::Gemini))));
        assert_eq!(
            orchestrator.snapshot(ToolIdentity::Gemini).await.phase,
            ExecutionPhase::Waiting
        );

        orchestrator.stop(ToolIdentity::Gemini).await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn untagged_events_follow_selected_tool() {
        let (orchestrator, _) = orchestrator();
        let runner = orchestrator.clone();
        let handle = tokio::spawn(async move {
            runner.start(ToolIdentity::Codex, settings(ToolIdentity::Codex)).await
        });
        wait_until_running(&orchestrator, ToolIdentity::Codex).await;

        orchestrator
            .handle_event(BackendEvent::Started { tool: None })
            .await;
        assert_eq!(
            orchestrator.snapshot(ToolIdentity::Codex).await.phase,
            ExecutionPhase::Waiting
        );

        orchestrator.select_tool(ToolIdentity::Codex).await;
        orchestrator
            .handle_event(BackendEvent::Started { tool: None })
            .await;
        assert_eq!(
            orchestrator.snapshot(ToolIdentity::Codex).await.phase,
            ExecutionPhase::Checking
        );

        orchestrator.stop(ToolIdentity::Codex).await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn tick_reports_running_tools_and_updates_countdown() {
        let (orchestrator, clock) = orchestrator();
        assert!(!orchestrator.tick().await);

        let runner = orchestrator.clone();
        let handle = tokio::spawn(async move {
            runner.start(ToolIdentity::Claude, settings(ToolIdentity::Claude)).await
        });
        wait_until_running(&orchestrator, ToolIdentity::Claude).await;
        assert_eq!(
            orchestrator.snapshot(ToolIdentity::Claude).await.countdown,
            "0時間 1分 0秒"
        );

        clock.advance(chrono::Duration::seconds(15));
        assert!(orchestrator.tick().await);
        assert_eq!(
            orchestrator.snapshot(ToolIdentity::Claude).await.countdown,
            "0時間 0分 45秒"
        );

        orchestrator.stop(ToolIdentity::Claude).await;
        handle.await.unwrap().unwrap();
        assert!(!orchestrator.tick().await);
    }

    async fn wait_for_ticker(orchestrator: &Orchestrator, present: bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while orchestrator.has_ticker().await != present {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn ticker_follows_the_running_set() {
        let clock = Arc::new(ManualClock::new(now()));
        let orchestrator = Orchestrator::new(
            Arc::new(PendingBackend),
            clock.clone(),
            Duration::from_millis(10),
        );
        assert!(!orchestrator.has_ticker().await);

        let runner = orchestrator.clone();
        let first = tokio::spawn(async move {
            runner.start(ToolIdentity::Claude, settings(ToolIdentity::Claude)).await
        });
        wait_until_running(&orchestrator, ToolIdentity::Claude).await;
        wait_for_ticker(&orchestrator, true).await;

        clock.advance(chrono::Duration::seconds(15));
        tokio::time::timeout(Duration::from_secs(5), async {
            while orchestrator.snapshot(ToolIdentity::Claude).await.countdown != "0時間 0分 45秒" {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        orchestrator.stop(ToolIdentity::Claude).await;
        first.await.unwrap().unwrap();
        wait_for_ticker(&orchestrator, false).await;

        let runner = orchestrator.clone();
        let second = tokio::spawn(async move {
            runner.start(ToolIdentity::Codex, settings(ToolIdentity::Codex)).await
        });
        wait_until_running(&orchestrator, ToolIdentity::Codex).await;
        wait_for_ticker(&orchestrator, true).await;

        orchestrator.stop(ToolIdentity::Codex).await;
        second.await.unwrap().unwrap();
        wait_for_ticker(&orchestrator, false).await;
    }

    #[tokio::test]
    async fn subscription_stops_on_unsubscribe() {
        let (orchestrator, _) = orchestrator();
        let bus = EventBus::new();
        let subscription = orchestrator.attach(&bus);
        assert_eq!(bus.listener_count(), 1);
        assert!(subscription.is_active());

        subscription.unsubscribe();
        tokio::task::yield_now().await;
        bus.emit(BackendEvent::Started { tool: None });
        while bus.listener_count() > 0 {
            tokio::task::yield_now().await;
        }
    }
}
