//! CLI Scheduler
//!
//! Runs an AI coding CLI at a set time and keeps retrying through rate limits.

use anyhow::bail;
use clap::{Args, Parser, Subcommand};
use cli_scheduler::rules::validate_launch_options;
use cli_scheduler::scheduler::{
    CatchUp, CatchUpOutcome, FileScheduleStore, ScheduleRequest, ScheduleResult, ScheduleService,
};
use cli_scheduler::settings::ToolOptions;
use cli_scheduler::{
    Clock, ClockTime, EventBus, ExecutionSettings, Orchestrator, ProcessBackend, RateLimitEvent,
    SchedulerConfig, SettingsStore, StatusKind, SystemClock, TerminalBackend, ToolIdentity, ToolView,
};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CLI Scheduler - timed runs of Claude Code, Codex and Gemini CLI
#[derive(Parser, Debug)]
#[command(name = "cli-scheduler")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding settings, schedules and history
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Wait for the execution time, run the tool and watch for rate limits
    Run(RunArgs),

    /// Check extra launch options for a tool
    Validate {
        tool: ToolIdentity,
        #[arg(allow_hyphen_values = true)]
        options: String,
    },

    /// Look for a rate-limit message in text (stdin when omitted)
    Parse { text: Option<String> },

    /// Show terminal availability and stored settings
    Status,

    /// Print the stored settings of one tool, or all of them
    Settings { tool: Option<ToolIdentity> },

    /// Manage recurring schedules
    #[command(subcommand)]
    Schedule(ScheduleCommand),
}

#[derive(Args, Debug)]
struct RunArgs {
    tool: ToolIdentity,

    /// Execution time (HH:MM); stored value when omitted
    #[arg(short, long)]
    time: Option<ClockTime>,

    /// Directory to run in
    #[arg(short = 'C', long)]
    dir: Option<PathBuf>,

    /// Model override
    #[arg(short, long)]
    model: Option<String>,

    /// Extra launch options appended after the generated flags
    #[arg(long, allow_hyphen_values = true)]
    options: Option<String>,

    /// Re-run automatically after a rate limit
    #[arg(long)]
    auto_retry: bool,

    /// Run in the current directory instead of a target directory
    #[arg(long)]
    no_new_window: bool,

    /// Print each terminal line as it arrives
    #[arg(long)]
    show_output: bool,

    /// Instruction for the tool; stored value when omitted
    #[arg(trailing_var_arg = true)]
    instruction: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum ScheduleCommand {
    /// Register a new schedule
    Add(ScheduleArgs),

    /// Replace an existing schedule
    Update {
        schedule_id: String,
        #[command(flatten)]
        args: ScheduleArgs,
    },

    /// Remove a schedule
    Remove { tool: String, schedule_id: String },

    /// List registered schedules
    List,

    /// Show recent runs of a schedule
    History { schedule_id: String },

    /// List schedules whose last slot passed without a run
    Missed,

    /// Run every missed schedule now and record the outcome
    Catchup {
        /// Print each terminal line as it arrives
        #[arg(long)]
        show_output: bool,
    },
}

#[derive(Args, Debug)]
struct ScheduleArgs {
    #[arg(long)]
    tool: String,

    /// HH:MM
    #[arg(long)]
    time: String,

    #[arg(short = 'C', long, default_value = "")]
    dir: String,

    #[arg(long, default_value = "")]
    title: String,

    /// once, daily, weekly or interval
    #[arg(long = "type")]
    schedule_type: Option<String>,

    /// Days between runs for interval schedules
    #[arg(long)]
    interval: Option<u32>,

    /// YYYY-MM-DD
    #[arg(long)]
    start_date: Option<String>,

    /// Instruction for the tool
    #[arg(trailing_var_arg = true, required = true)]
    instruction: Vec<String>,
}

impl ScheduleArgs {
    fn into_request(self) -> ScheduleRequest {
        ScheduleRequest {
            tool: self.tool,
            execution_time: self.time,
            target_directory: self.dir,
            command_args: self.instruction.join(" "),
            title: self.title,
            schedule_type: self.schedule_type,
            interval_value: self.interval,
            start_date: self.start_date,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => SchedulerConfig::default_dir()?,
    };
    let config = SchedulerConfig::load(config_dir)?.with_verbose(cli.verbose);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Command::Run(args) => run_tool(&config, clock, args).await,
        Command::Validate { tool, options } => match validate_launch_options(tool, &options) {
            Ok(()) => {
                println!("OK");
                Ok(())
            }
            Err(e) => bail!("{}", e),
        },
        Command::Parse { text } => parse_text(text, clock),
        Command::Status => show_status(&config, clock).await,
        Command::Settings { tool } => show_settings(&config, clock, tool).await,
        Command::Schedule(command) => run_schedule_command(&config, clock, command).await,
    }
}

async fn run_tool(config: &SchedulerConfig, clock: Arc<dyn Clock>, args: RunArgs) -> anyhow::Result<()> {
    let tool = args.tool;
    let mut store = SettingsStore::load(config.settings_file.clone(), clock.now()).await?;
    let mut settings = store
        .get(tool)
        .cloned()
        .unwrap_or_else(|| ExecutionSettings::defaults_for(tool, clock.now()));

    if let Some(time) = args.time {
        settings.execution_time = time;
    }
    if let Some(dir) = args.dir {
        settings.target_directory = std::fs::canonicalize(&dir)
            .unwrap_or(dir)
            .to_string_lossy()
            .into_owned();
    }
    if let Some(model) = args.model {
        set_model(&mut settings.tool_options, model);
    }
    if let Some(options) = args.options {
        settings.launch_options = options;
    }
    if !args.instruction.is_empty() {
        settings.command = args.instruction.join(" ");
    }
    settings.auto_retry_on_rate_limit |= args.auto_retry;
    if args.no_new_window {
        settings.use_new_window = false;
    }

    store.active_tab = tool;
    store.set(settings.clone());
    store.save().await?;

    let bus = EventBus::new();
    let backend = ProcessBackend::new(bus.clone(), clock.clone())
        .with_tail_lines(config.output_tail_lines);
    let orchestrator = Orchestrator::new(Arc::new(backend), clock, config.tick_interval);
    orchestrator.select_tool(tool).await;
    let _subscription = orchestrator.attach(&bus);

    let printer = tokio::spawn(print_views(orchestrator.subscribe_views(), args.show_output));

    info!("{} scheduled at {}", tool.display_name(), settings.execution_time);
    let run = orchestrator.start(tool, settings);
    tokio::pin!(run);
    let view = tokio::select! {
        result = &mut run => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping {}", tool);
            orchestrator.stop(tool).await;
            run.await?
        }
    };
    printer.abort();

    println!("{}", view.status);
    if view.status.kind == StatusKind::Error {
        bail!("{} did not complete", tool.display_name());
    }
    Ok(())
}

fn set_model(options: &mut ToolOptions, model: String) {
    match options {
        ToolOptions::Claude(o) => o.model = model,
        ToolOptions::Codex(o) => o.model = model,
        ToolOptions::Gemini(o) => o.model = model,
    }
}

/// Print status changes, and terminal lines when asked.
async fn print_views(mut views: tokio::sync::broadcast::Receiver<ToolView>, show_output: bool) {
    let mut last_status = String::new();
    let mut last_line = String::new();
    loop {
        let view = match views.recv().await {
            Ok(view) => view,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };

        if show_output {
            if let Some(line) = view.tool_output.lines().last() {
                if line != last_line {
                    println!("{}", line);
                    last_line = line.to_string();
                }
            }
        }
        if view.status.text != last_status {
            println!("[{}] {}", view.tool, view.status);
            last_status = view.status.text.clone();
        }
        if view.is_running && !view.countdown.is_empty() {
            eprint!("\r{}    ", view.countdown);
            let _ = io::stderr().flush();
        }
    }
}

fn parse_text(text: Option<String>, clock: Arc<dyn Clock>) -> anyhow::Result<()> {
    let text = match text {
        Some(text) => text,
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };

    let event = RateLimitEvent::parse(&text);
    match event.status_text() {
        Some(status) => {
            println!("{}", status);
            if let Some(at) = event.retry_at(clock.now()) {
                println!("retry at {}", at.format("%Y-%m-%d %H:%M"));
            }
        }
        None => println!("no rate limit"),
    }
    Ok(())
}

async fn show_status(config: &SchedulerConfig, clock: Arc<dyn Clock>) -> anyhow::Result<()> {
    let backend = ProcessBackend::new(EventBus::new(), clock.clone());
    let status = backend.check_status().await?;
    println!(
        "terminal: {}",
        if status.installed { "available" } else { "not found" }
    );

    let store = SettingsStore::load(config.settings_file.clone(), clock.now()).await?;
    println!("selected: {}", store.active_tab.display_name());
    for tool in ToolIdentity::all() {
        let Some(settings) = store.get(*tool) else {
            continue;
        };
        let readiness = match settings.preflight() {
            Ok(()) => "ready".to_string(),
            Err(e) => e.to_string(),
        };
        println!(
            "{:<12} {}  {}",
            tool.display_name(),
            settings.execution_time,
            readiness
        );
    }
    Ok(())
}

async fn show_settings(
    config: &SchedulerConfig,
    clock: Arc<dyn Clock>,
    tool: Option<ToolIdentity>,
) -> anyhow::Result<()> {
    let store = SettingsStore::load(config.settings_file.clone(), clock.now()).await?;
    let tools: Vec<ToolIdentity> = match tool {
        Some(tool) => vec![tool],
        None => ToolIdentity::all().to_vec(),
    };
    for tool in tools {
        if let Some(settings) = store.get(tool) {
            println!("{}", serde_json::to_string_pretty(settings)?);
        }
    }
    Ok(())
}

async fn run_schedule_command(
    config: &SchedulerConfig,
    clock: Arc<dyn Clock>,
    command: ScheduleCommand,
) -> anyhow::Result<()> {
    let store = Arc::new(FileScheduleStore::new(
        config.schedules_file.clone(),
        config.history_file.clone(),
        clock.clone(),
    ));

    match command {
        ScheduleCommand::Add(args) => report(store.register(args.into_request()).await?),
        ScheduleCommand::Update { schedule_id, args } => {
            report(store.update(&schedule_id, args.into_request()).await?)
        }
        ScheduleCommand::Remove { tool, schedule_id } => {
            report(store.unregister(&tool, &schedule_id).await?)
        }
        ScheduleCommand::List => {
            for schedule in store.list().await? {
                println!(
                    "{}  {:<12} {:<16} {}",
                    schedule.schedule_id,
                    schedule.tool.display_name(),
                    schedule.describe(),
                    schedule.title
                );
            }
            Ok(())
        }
        ScheduleCommand::History { schedule_id } => {
            for entry in store.history(&schedule_id).await? {
                println!("{}  {}", entry.timestamp, entry.status);
            }
            Ok(())
        }
        ScheduleCommand::Missed => {
            for schedule in store.missed_runs().await? {
                println!(
                    "{}  {:<12} {}",
                    schedule.schedule_id,
                    schedule.tool.display_name(),
                    schedule.describe()
                );
            }
            Ok(())
        }
        ScheduleCommand::Catchup { show_output } => {
            catch_up(config, clock, store, show_output).await
        }
    }
}

async fn catch_up(
    config: &SchedulerConfig,
    clock: Arc<dyn Clock>,
    store: Arc<FileScheduleStore>,
    show_output: bool,
) -> anyhow::Result<()> {
    let settings = SettingsStore::load(config.settings_file.clone(), clock.now()).await?;
    let bus = EventBus::new();
    let backend = ProcessBackend::new(bus.clone(), clock.clone())
        .with_tail_lines(config.output_tail_lines);
    let orchestrator = Orchestrator::new(Arc::new(backend), clock.clone(), config.tick_interval);
    let _subscription = orchestrator.attach(&bus);
    let printer = tokio::spawn(print_views(orchestrator.subscribe_views(), show_output));

    let mut runner = CatchUp::new(store, orchestrator.clone(), clock);
    for tool in ToolIdentity::all() {
        if let Some(base) = settings.get(*tool) {
            runner = runner.with_base_settings(base.clone());
        }
    }

    let run = runner.run_missed();
    tokio::pin!(run);
    let reports = tokio::select! {
        result = &mut run => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping catch-up");
            orchestrator.shutdown().await;
            bail!("catch-up interrupted");
        }
    };
    printer.abort();

    if reports.is_empty() {
        println!("no missed schedules");
    }
    for report in reports {
        let result = match report.outcome {
            CatchUpOutcome::Skipped => "skipped: tool already running".to_string(),
            CatchUpOutcome::Ran(view) => view.status.text,
            CatchUpOutcome::Failed(reason) => format!("failed: {}", reason),
        };
        println!(
            "{}  {:<12} {}",
            report.schedule_id,
            report.tool.display_name(),
            result
        );
    }
    Ok(())
}

fn report(result: ScheduleResult) -> anyhow::Result<()> {
    if !result.success {
        bail!("{}", result.message);
    }
    match result.schedule_id {
        Some(id) => println!("{} ({})", result.message, id),
        None => println!("{}", result.message),
    }
    Ok(())
}
