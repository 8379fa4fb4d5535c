//! Backend that runs tools as child processes of a POSIX shell

use super::{BackendEvent, EventBus, LaunchOutcome, TerminalBackend, TerminalStatus};
use crate::clock::{Clock, ClockTime};
use crate::rules::{retry_notice, RateLimitEvent};
use crate::settings::{shell_quote, ExecutionSettings};
use crate::tool::ToolIdentity;
use crate::{Result, SchedulerError};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_SHELL: &str = "sh";
const DEFAULT_TAIL_LINES: usize = 40;
const DEFAULT_LIMIT_GRACE: Duration = Duration::from_secs(3);

/// Runs `sh -c <command line>` in the target directory at the execution time.
///
/// Output from stdout and stderr is merged into a rolling tail that is
/// published as a terminal snapshot after every line. When the tail shows a
/// rate limit and auto-retry is enabled, the child is killed and launched
/// again at the computed retry time. A limit message without a retry time
/// keeps the child alive for a short grace period, since the reset time often
/// follows on the next line.
pub struct ProcessBackend {
    events: EventBus,
    clock: Arc<dyn Clock>,
    shell: String,
    tail_lines: usize,
    limit_grace: Duration,
    executables: HashMap<ToolIdentity, PathBuf>,
    running: Mutex<HashMap<ToolIdentity, CancellationToken>>,
}

/// How a single child process ended
enum RunEnd {
    Exited { tail: String },
    Limited { event: RateLimitEvent, tail: String },
    Cancelled,
}

impl ProcessBackend {
    pub fn new(events: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self {
            events,
            clock,
            shell: DEFAULT_SHELL.to_string(),
            tail_lines: DEFAULT_TAIL_LINES,
            limit_grace: DEFAULT_LIMIT_GRACE,
            executables: HashMap::new(),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_tail_lines(mut self, lines: usize) -> Self {
        self.tail_lines = lines.max(1);
        self
    }

    /// How long to keep reading after a limit message that has no retry time.
    pub fn with_limit_grace(mut self, grace: Duration) -> Self {
        self.limit_grace = grace;
        self
    }

    /// Use `path` instead of looking the tool up on `PATH`.
    pub fn with_executable(mut self, tool: ToolIdentity, path: impl Into<PathBuf>) -> Self {
        self.executables.insert(tool, path.into());
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn register(&self, tool: ToolIdentity) -> Result<CancellationToken> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.contains_key(&tool) {
            return Err(SchedulerError::AlreadyRunning(tool));
        }
        let token = CancellationToken::new();
        running.insert(tool, token.clone());
        Ok(token)
    }

    fn unregister(&self, tool: ToolIdentity) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&tool);
    }

    fn command_line(&self, settings: &ExecutionSettings) -> String {
        match self.executables.get(&settings.tool()) {
            Some(path) => settings.command_line_with(&shell_quote(&path.to_string_lossy())),
            None => settings.command_line(),
        }
    }

    /// Sleep until `due` on the wall clock. Returns false when cancelled first.
    async fn wait_until(&self, due: NaiveDateTime, token: &CancellationToken) -> bool {
        let delay = (due - self.clock.now()).to_std().unwrap_or_default();
        debug!("Waiting {:?} until {}", delay, due);
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn run(
        &self,
        tool: ToolIdentity,
        settings: &ExecutionSettings,
        token: &CancellationToken,
    ) -> Result<LaunchOutcome> {
        let now = self.clock.now();
        let mut due = if settings.run_immediately {
            now
        } else {
            settings.execution_time.next_occurrence_after(now)
        };
        let mut first_start: Option<Instant> = None;

        loop {
            if !self.wait_until(due, token).await {
                return Ok(LaunchOutcome::cancelled());
            }

            let started = *first_start.get_or_insert_with(Instant::now);
            self.events.emit(BackendEvent::Started { tool: Some(tool) });

            match self.run_once(tool, settings, token).await? {
                RunEnd::Cancelled => return Ok(LaunchOutcome::cancelled()),
                RunEnd::Exited { tail } => {
                    let elapsed = started.elapsed().as_secs();
                    info!("{} finished after {}s", tool, elapsed);
                    return Ok(LaunchOutcome::completed(elapsed, Some(tail)));
                }
                RunEnd::Limited { event, tail } => {
                    let now = self.clock.now();
                    let retry = event
                        .retry_at(now)
                        .filter(|_| settings.auto_retry_on_rate_limit);
                    let Some(at) = retry else {
                        info!("{} hit a rate limit, not retrying", tool);
                        return Ok(LaunchOutcome::rate_limited(Some(tail)));
                    };

                    let time = ClockTime::of(at);
                    let remaining = u32::try_from((at - now).num_minutes().max(0)).unwrap_or(u32::MAX);
                    info!("{} hit a rate limit, retrying at {}", tool, time);
                    self.events.emit(BackendEvent::Output {
                        tool: Some(tool),
                        text: retry_notice(time, remaining),
                    });
                    self.events.emit(BackendEvent::Rescheduled {
                        tool: Some(tool),
                        time,
                    });
                    due = at;
                }
            }
        }
    }

    async fn run_once(
        &self,
        tool: ToolIdentity,
        settings: &ExecutionSettings,
        token: &CancellationToken,
    ) -> Result<RunEnd> {
        let command_line = self.command_line(settings);
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&command_line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let dir = settings.target_directory.trim();
        if !dir.is_empty() {
            if !Path::new(dir).is_dir() {
                return Err(SchedulerError::Backend(format!(
                    "Target directory does not exist: {}",
                    dir
                )));
            }
            cmd.current_dir(dir);
        }

        info!("Starting {}: {}", tool, command_line);
        let mut child = cmd
            .spawn()
            .map_err(|e| SchedulerError::Backend(format!("Failed to start {}: {}", tool, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SchedulerError::Backend("Failed to get stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SchedulerError::Backend("Failed to get stderr".to_string()))?;

        let mut stdout = LossyLines::new(stdout);
        let mut stderr = LossyLines::new(stderr);
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut tail = OutputTail::new(self.tail_lines);
        let mut limit: Option<RateLimitEvent> = None;
        let mut grace_until: Option<tokio::time::Instant> = None;

        while stdout_open || stderr_open {
            let line = tokio::select! {
                _ = token.cancelled() => {
                    let _ = child.kill().await;
                    return Ok(RunEnd::Cancelled);
                }
                _ = tokio::time::sleep_until(grace_until.unwrap_or_else(tokio::time::Instant::now)),
                    if grace_until.is_some() => break,
                line = stdout.next_line(), if stdout_open => match line? {
                    Some(line) => line,
                    None => {
                        stdout_open = false;
                        continue;
                    }
                },
                line = stderr.next_line(), if stderr_open => match line? {
                    Some(line) => line,
                    None => {
                        stderr_open = false;
                        continue;
                    }
                },
            };

            tail.push(line);
            let text = tail.text();
            self.events.emit(BackendEvent::Output {
                tool: Some(tool),
                text: text.clone(),
            });

            let event = RateLimitEvent::parse(&text);
            if !event.is_limited() {
                continue;
            }
            let has_retry_time = event.retry_at(self.clock.now()).is_some();
            limit = Some(event);
            if has_retry_time || !settings.auto_retry_on_rate_limit {
                break;
            }
            if grace_until.is_none() {
                debug!("{} reported a limit without a retry time, reading on", tool);
                grace_until = Some(tokio::time::Instant::now() + self.limit_grace);
            }
        }

        if let Some(event) = limit {
            debug!("Rate limit in {} output: {:?}", tool, event);
            let _ = child.kill().await;
            return Ok(RunEnd::Limited {
                event,
                tail: tail.text(),
            });
        }

        let status = tokio::select! {
            _ = token.cancelled() => {
                let _ = child.kill().await;
                return Ok(RunEnd::Cancelled);
            }
            status = child.wait() => status?,
        };
        if !status.success() {
            warn!("{} exited with {}", tool, status);
        }

        Ok(RunEnd::Exited { tail: tail.text() })
    }
}

#[async_trait]
impl TerminalBackend for ProcessBackend {
    async fn check_status(&self) -> Result<TerminalStatus> {
        let running = !self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty();
        Ok(TerminalStatus {
            installed: find_program(&self.shell).is_some(),
            running,
        })
    }

    async fn launch(&self, tool: ToolIdentity, settings: ExecutionSettings) -> Result<LaunchOutcome> {
        let token = self.register(tool)?;
        let _registration = Registration { backend: self, tool };
        self.run(tool, &settings, &token).await
    }

    async fn cancel(&self, tool: ToolIdentity) -> Result<()> {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = running.get(&tool) {
            debug!("Cancelling {}", tool);
            token.cancel();
        }
        Ok(())
    }
}

/// Removes the tool from the running map when the launch ends or is dropped
struct Registration<'a> {
    backend: &'a ProcessBackend,
    tool: ToolIdentity,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.backend.unregister(self.tool);
    }
}

/// Line reader that tolerates output which is not valid UTF-8.
///
/// Partial lines stay buffered across cancelled reads, so `next_line` can be
/// raced in `select!`.
struct LossyLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LossyLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        self.buf.clear();
        Ok(Some(line))
    }
}

/// Last `capacity` lines of merged output
struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn text(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

fn find_program(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
