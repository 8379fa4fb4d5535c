//! Integration tests for the CLI scheduler

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use cli_scheduler::protocol::{BackendEvent, LaunchOutcome};
use cli_scheduler::scheduler::{FileScheduleStore, Recurrence, ScheduleRequest, ScheduleService};
use cli_scheduler::{
    ClockTime, EventBus, ExecutionPhase, ExecutionSettings, ManualClock, Orchestrator,
    PreflightError, ProcessBackend, SchedulerConfig, SchedulerError, StatusKind, TerminalBackend,
    TerminalStatus, ToolIdentity, ToolView,
};
use pretty_assertions::assert_eq;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_test::{assert_err, assert_ok};

type LaunchReply = cli_scheduler::Result<LaunchOutcome>;

/// Backend whose launches stay pending until the test resolves them
#[derive(Default)]
struct FakeBackend {
    unavailable: bool,
    pending: Mutex<HashMap<ToolIdentity, oneshot::Sender<LaunchReply>>>,
    launches: AtomicUsize,
    cancels: AtomicUsize,
}

impl FakeBackend {
    fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Default::default()
        }
    }

    fn is_pending(&self, tool: ToolIdentity) -> bool {
        self.pending.lock().unwrap().contains_key(&tool)
    }

    fn finish(&self, tool: ToolIdentity, reply: LaunchReply) {
        let sender = self.pending.lock().unwrap().remove(&tool).unwrap();
        let _ = sender.send(reply);
    }
}

#[async_trait]
impl TerminalBackend for FakeBackend {
    async fn check_status(&self) -> cli_scheduler::Result<TerminalStatus> {
        Ok(TerminalStatus {
            installed: !self.unavailable,
            running: !self.unavailable,
        })
    }

    async fn launch(&self, tool: ToolIdentity, _: ExecutionSettings) -> LaunchReply {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(tool, tx);
        rx.await
            .unwrap_or_else(|_| Err(SchedulerError::Backend("dropped".to_string())))
    }

    async fn cancel(&self, tool: ToolIdentity) -> cli_scheduler::Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if let Some(sender) = self.pending.lock().unwrap().remove(&tool) {
            let _ = sender.send(Ok(LaunchOutcome::cancelled()));
        }
        Ok(())
    }
}

struct Harness {
    backend: Arc<FakeBackend>,
    clock: Arc<ManualClock>,
    bus: EventBus,
    orchestrator: Orchestrator,
}

fn nine_am() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 1, 15)
        .unwrap()
        .and_hms_opt(9, 0, 0)
        .unwrap()
}

fn harness(backend: FakeBackend) -> Harness {
    let backend = Arc::new(backend);
    let clock = Arc::new(ManualClock::new(nine_am()));
    let orchestrator = Orchestrator::new(
        backend.clone(),
        clock.clone(),
        std::time::Duration::from_secs(3600),
    );
    Harness {
        backend,
        clock,
        bus: EventBus::new(),
        orchestrator,
    }
}

fn settings(tool: ToolIdentity, auto_retry: bool) -> ExecutionSettings {
    let mut s = ExecutionSettings::defaults_for(tool, nine_am());
    s.command = "refactor".to_string();
    s.target_directory = "/tmp/x".to_string();
    s.use_new_window = true;
    s.auto_retry_on_rate_limit = auto_retry;
    s
}

impl Harness {
    /// Start `tool` in the background and wait until the backend sees it.
    async fn launch(&self, tool: ToolIdentity, settings: ExecutionSettings) -> JoinHandle<ToolView> {
        let orchestrator = self.orchestrator.clone();
        let handle = tokio::spawn(async move { orchestrator.start(tool, settings).await.unwrap() });
        while !self.backend.is_pending(tool) {
            tokio::task::yield_now().await;
        }
        handle
    }

    /// Wait until the view of `tool` satisfies `f`.
    async fn wait_for(&self, tool: ToolIdentity, f: impl Fn(&ToolView) -> bool) -> ToolView {
        for _ in 0..10_000 {
            let view = self.orchestrator.snapshot(tool).await;
            if f(&view) {
                return view;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached for {}", tool);
    }
}

/// Test the full claude flow from start to a rate-limit stop
#[tokio::test]
async fn test_end_to_end_rate_limit_stop() {
    let h = harness(FakeBackend::default());
    let _subscription = h.orchestrator.attach(&h.bus);
    let tool = ToolIdentity::Claude;

    let handle = h.launch(tool, settings(tool, false)).await;
    let view = h.orchestrator.snapshot(tool).await;
    assert_eq!(view.phase, ExecutionPhase::Waiting);
    assert!(view.is_running);
    assert_eq!(view.countdown, "0時間 1分 0秒");

    h.clock.advance(Duration::seconds(60));
    h.orchestrator.tick().await;
    h.bus.emit(BackendEvent::Started { tool: Some(tool) });
    let view = h
        .wait_for(tool, |v| v.phase == ExecutionPhase::Checking)
        .await;
    assert_eq!(view.status.text, "Claude Code 動作ステータス取得待機中");
    assert_eq!(view.countdown, "2分 0秒");

    h.bus.emit(BackendEvent::Output {
        tool: Some(tool),
        text: "Claude usage limit reached. Your limit will reset at 3pm".to_string(),
    });
    let view = h
        .wait_for(tool, |v| v.status.kind == StatusKind::RateLimited)
        .await;
    assert!(view.status.text.contains("3pmまで待機中"));

    let final_output = "Claude usage limit reached. Your limit will reset at 3pm\n$ ";
    h.backend.finish(tool, Ok(LaunchOutcome::rate_limited(Some(final_output.to_string()))));
    let view = handle.await.unwrap();
    assert_eq!(view.phase, ExecutionPhase::Idle);
    assert!(!view.is_running);
    assert_eq!(view.status.text, "Rate limitを検出したため終了しました");
    assert_eq!(view.status.kind, StatusKind::RateLimited);
    assert_eq!(view.tool_output, final_output);
}

/// Test that a completed launch keeps its final terminal output in the view
#[tokio::test]
async fn test_completed_launch_shows_final_output() {
    let h = harness(FakeBackend::default());
    let tool = ToolIdentity::Gemini;

    let handle = h.launch(tool, settings(tool, false)).await;
    h.backend.finish(
        tool,
        Ok(LaunchOutcome::completed(61, Some("final terminal text".to_string()))),
    );

    let view = handle.await.unwrap();
    assert_eq!(view.status.text, "処理完了 (処理時間: 1分1秒)");
    assert_eq!(view.status.kind, StatusKind::Completed);
    assert_eq!(view.tool_output, "final terminal text");
    assert_eq!(h.orchestrator.snapshot(tool).await, view);
}

/// Test that the local countdown alone never enters checking
#[tokio::test]
async fn test_countdown_reaching_target_stays_waiting() {
    let h = harness(FakeBackend::default());
    let tool = ToolIdentity::Codex;
    let handle = h.launch(tool, settings(tool, true)).await;

    for _ in 0..5 {
        h.clock.advance(Duration::minutes(1));
        assert!(h.orchestrator.tick().await);
        let view = h.orchestrator.snapshot(tool).await;
        assert_eq!(view.phase, ExecutionPhase::Waiting);
        assert_eq!(view.countdown, "実行中...");
    }

    h.orchestrator.stop(tool).await;
    assert_eq!(handle.await.unwrap().phase, ExecutionPhase::Idle);
}

/// Test that events for one tool never touch another
#[tokio::test]
async fn test_per_tool_isolation() {
    let h = harness(FakeBackend::default());
    let _subscription = h.orchestrator.attach(&h.bus);

    let claude = h.launch(ToolIdentity::Claude, settings(ToolIdentity::Claude, false)).await;
    let codex = h.launch(ToolIdentity::Codex, settings(ToolIdentity::Codex, true)).await;

    h.bus.emit(BackendEvent::Started {
        tool: Some(ToolIdentity::Claude),
    });
    h.bus.emit(BackendEvent::Started {
        tool: Some(ToolIdentity::Codex),
    });
    h.bus.emit(BackendEvent::Output {
        tool: Some(ToolIdentity::Codex),
        text: "429 RESOURCE_EXHAUSTED 残り約75分".to_string(),
    });

    let codex_view = h
        .wait_for(ToolIdentity::Codex, |v| v.status.kind == StatusKind::RateLimited)
        .await;
    assert_eq!(codex_view.countdown, "1時間 15分 0秒");

    let claude_view = h.orchestrator.snapshot(ToolIdentity::Claude).await;
    assert_eq!(claude_view.phase, ExecutionPhase::Checking);
    assert_eq!(claude_view.status.kind, StatusKind::Monitoring);
    assert!(claude_view.tool_output.is_empty());
    assert_eq!(claude_view.countdown, "2分 0秒");

    h.backend
        .finish(ToolIdentity::Codex, Ok(LaunchOutcome::completed(61, None)));
    let codex_view = codex.await.unwrap();
    assert_eq!(codex_view.status.text, "処理完了 (処理時間: 1分1秒)");
    assert!(h.orchestrator.is_running(ToolIdentity::Claude).await);

    h.orchestrator.stop(ToolIdentity::Claude).await;
    claude.await.unwrap();
}

/// Test that stop works before the started event and ignores late events
#[tokio::test]
async fn test_stop_before_started() {
    let h = harness(FakeBackend::default());
    let tool = ToolIdentity::Gemini;
    let handle = h.launch(tool, settings(tool, false)).await;

    h.orchestrator.stop(tool).await;
    let view = handle.await.unwrap();
    assert_eq!(view.phase, ExecutionPhase::Idle);
    assert_eq!(view.status.text, "実行を中止しました");
    assert_eq!(h.backend.cancels.load(Ordering::SeqCst), 1);

    h.orchestrator
        .handle_event(BackendEvent::Started { tool: Some(tool) })
        .await;
    h.orchestrator
        .handle_event(BackendEvent::Output {
            tool: Some(tool),
            text: "rate limit".to_string(),
        })
        .await;
    let view = h.orchestrator.snapshot(tool).await;
    assert_eq!(view.phase, ExecutionPhase::Idle);
    assert!(view.tool_output.is_empty());
}

/// Test that preflight failures never reach the backend
#[tokio::test]
async fn test_preflight_failures_block_launch() {
    let h = harness(FakeBackend::default());
    let tool = ToolIdentity::Claude;

    let mut empty = settings(tool, false);
    empty.command = " ".to_string();
    let err = h.orchestrator.start(tool, empty).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::Preflight(PreflightError::EmptyCommand(ToolIdentity::Claude))
    ));
    let view = h.orchestrator.snapshot(tool).await;
    assert_eq!(view.phase, ExecutionPhase::Idle);
    assert_eq!(view.status.kind, StatusKind::Error);
    assert_eq!(
        view.status.text,
        "エラー: Claude Codeで実行する命令を入力してください"
    );

    let mut reserved = settings(tool, false);
    reserved.launch_options = "--permission-mode plan".to_string();
    let err = h.orchestrator.start(tool, reserved).await.unwrap_err();
    assert!(err.to_string().contains("--permission-mode"));

    let mut no_dir = settings(tool, false);
    no_dir.target_directory.clear();
    assert_err!(h.orchestrator.start(tool, no_dir).await);

    assert_eq!(h.backend.launches.load(Ordering::SeqCst), 0);

    let h = harness(FakeBackend::unavailable());
    let err = h.orchestrator.start(tool, settings(tool, false)).await.unwrap_err();
    assert!(matches!(
        err,
        SchedulerError::Preflight(PreflightError::TerminalUnavailable)
    ));
    assert_eq!(h.backend.launches.load(Ordering::SeqCst), 0);
}

/// Test that a failing launch settles with an error status
#[tokio::test]
async fn test_launch_error_settles_idle() {
    let h = harness(FakeBackend::default());
    let tool = ToolIdentity::Codex;
    let handle = h.launch(tool, settings(tool, true)).await;

    h.backend.finish(
        tool,
        Err(SchedulerError::Backend("terminal crashed".to_string())),
    );
    let view = handle.await.unwrap();
    assert_eq!(view.phase, ExecutionPhase::Idle);
    assert_eq!(view.status.kind, StatusKind::Error);
    assert!(view.status.text.contains("terminal crashed"));
    assert!(!h.orchestrator.tick().await);
}

/// Test that a relaunch after a reschedule starts a fresh check
#[tokio::test]
async fn test_reschedule_then_relaunch() {
    let h = harness(FakeBackend::default());
    let _subscription = h.orchestrator.attach(&h.bus);
    let tool = ToolIdentity::Claude;
    let handle = h.launch(tool, settings(tool, true)).await;

    h.bus.emit(BackendEvent::Started { tool: Some(tool) });
    h.bus.emit(BackendEvent::Output {
        tool: Some(tool),
        text: "Rate limit detected - 10:01に再実行予定 (残り約61分)".to_string(),
    });
    h.bus.emit(BackendEvent::Rescheduled {
        tool: Some(tool),
        time: ClockTime::new(10, 1).unwrap(),
    });
    let view = h
        .wait_for(tool, |v| v.countdown == "1時間 1分 0秒" && v.status.kind == StatusKind::RateLimited)
        .await;
    assert_eq!(view.status.text, "Rate limit検出 - 10:01に再実行予定 (残り約1時間1分)");

    h.clock.set(nine_am() + Duration::minutes(61));
    h.bus.emit(BackendEvent::Started { tool: Some(tool) });
    let view = h
        .wait_for(tool, |v| v.status.kind == StatusKind::Monitoring)
        .await;
    assert!(view.tool_output.is_empty());
    assert_eq!(view.countdown, "次の確認まで: 60秒");

    h.orchestrator.stop(tool).await;
    handle.await.unwrap();
}

/// Test that a dropped subscription no longer applies events
#[tokio::test]
async fn test_dropped_subscription_stops_events() {
    let h = harness(FakeBackend::default());
    let tool = ToolIdentity::Claude;
    let handle = h.launch(tool, settings(tool, false)).await;

    let subscription = h.orchestrator.attach(&h.bus);
    drop(subscription);
    h.bus.emit(BackendEvent::Started { tool: Some(tool) });
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        h.orchestrator.snapshot(tool).await.phase,
        ExecutionPhase::Waiting
    );

    h.orchestrator.stop(tool).await;
    handle.await.unwrap();
}

/// Test the real process backend driven by the orchestrator
#[cfg(unix)]
#[tokio::test]
async fn test_process_backend_stops_on_rate_limit() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let script = dir.path().join("fake-claude");
    std::fs::write(
        &script,
        "#!/bin/sh\necho 'starting'\necho 'Claude usage limit reached|1760000000'\n",
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let clock = Arc::new(ManualClock::new(
        NaiveDate::from_ymd_opt(2025, 1, 15)
            .unwrap()
            .and_hms_milli_opt(8, 59, 59, 900)
            .unwrap(),
    ));
    let bus = EventBus::new();
    let backend = ProcessBackend::new(bus.clone(), clock.clone())
        .with_executable(ToolIdentity::Claude, &script);
    let orchestrator = Orchestrator::new(
        Arc::new(backend),
        clock,
        std::time::Duration::from_secs(3600),
    );
    let _subscription = orchestrator.attach(&bus);

    let mut s = settings(ToolIdentity::Claude, false);
    s.execution_time = ClockTime::new(9, 0).unwrap();
    s.target_directory = dir.path().to_string_lossy().into_owned();

    let view = assert_ok!(orchestrator.start(ToolIdentity::Claude, s).await);
    assert_eq!(view.phase, ExecutionPhase::Idle);
    assert_eq!(view.status.text, "Rate limitを検出したため終了しました");
}

/// Test schedule registration through the service trait
#[tokio::test]
async fn test_schedule_service_round_trip() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(nine_am()));
    let store = Arc::new(FileScheduleStore::new(
        dir.path().join("schedules.json"),
        dir.path().join("history.jsonl"),
        clock.clone(),
    ));
    let service: Arc<dyn ScheduleService> = store.clone();

    let result = assert_ok!(
        service
            .register(ScheduleRequest {
                tool: "gemini".to_string(),
                execution_time: "06:30".to_string(),
                target_directory: dir.path().to_string_lossy().into_owned(),
                command_args: "summarize yesterday's commits".to_string(),
                title: "morning summary".to_string(),
                schedule_type: Some("weekly".to_string()),
                start_date: Some("2025-01-13".to_string()),
                ..Default::default()
            })
            .await
    );
    assert!(result.success);
    assert_eq!(result.message, "スケジュール登録成功: 毎週 6:30");
    let id = result.schedule_id.unwrap();

    let schedules = assert_ok!(service.list().await);
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].recurrence, Recurrence::Weekly);
    assert_eq!(schedules[0].tool, ToolIdentity::Gemini);

    assert_ok!(store.record_history(&id, ToolIdentity::Gemini, "success").await);
    let history = assert_ok!(service.history(&id).await);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, "success");

    let removed = assert_ok!(service.unregister("gemini", &id).await);
    assert!(removed.success);
    assert!(assert_ok!(service.list().await).is_empty());
}

/// Test config loading from the config directory
#[test]
fn test_scheduler_config() {
    let dir = TempDir::new().unwrap();
    let config = assert_ok!(SchedulerConfig::load(dir.path().to_path_buf()));
    assert_eq!(config.settings_file, dir.path().join("settings.json"));
    assert_eq!(config.tick_interval, std::time::Duration::from_secs(1));
    assert_eq!(config.output_tail_lines, 40);

    std::fs::write(dir.path().join("config.toml"), "output_tail_lines = \"many\"").unwrap();
    assert_err!(SchedulerConfig::load(dir.path().to_path_buf()));
}
