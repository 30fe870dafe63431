//! rerun: rebuild and restart a program whenever its sources change.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, merges them with the optional `rerun.toml`, resolves the target
//! through the toolchain, and then hands control to the coordinator, which
//! runs until rerun is interrupted.

mod config;
mod coordinator;
mod error;
mod events;
mod output;
mod pipeline;
mod process;
mod runner;
mod toolchain;
mod watch;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{CommandFactory, Parser};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::SetupError;
use crate::events::{restart_channel, RestartSignal, SupervisorEvent};
use crate::output::{OutputStyle, Reporter};
use crate::pipeline::{CommandExecutor, PipelineConfig, PipelineRunner};
use crate::process::{LaunchSpec, ShutdownConfig};
use crate::runner::ProcessSupervisor;
use crate::toolchain::{Toolchain, DEFAULT_TOOLCHAIN};
use crate::watch::{
    spawn_scanner, ChangeScanner, IgnorePolicy, SystemClock, WatchTarget, DEFAULT_POLL_INTERVAL,
};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "rerun",
    version,
    about = "Rebuild, reinstall and restart a program when its sources change",
    styles = help_styles(),
    color = clap::ColorChoice::Always
)]
struct Cli {
    /// Run tests before building.
    #[arg(long)]
    test: bool,
    /// Run the build stage before installing.
    #[arg(long)]
    build: bool,
    /// Never start the program; only run the pipeline.
    #[arg(long)]
    no_run: bool,
    /// Run every stage with the race detector.
    #[arg(long)]
    race: bool,
    /// Glob matched against file and directory names to ignore (repeatable).
    #[arg(long, value_name = "GLOB")]
    ignore: Vec<String>,
    /// Also watch version-control directories such as .git.
    #[arg(long)]
    watch_vcs: bool,
    /// Directory to watch instead of the target's source directory.
    #[arg(long, value_name = "DIR")]
    watch: Option<PathBuf>,
    /// Alternate toolchain installation root.
    #[arg(long, value_name = "DIR")]
    toolchain_root: Option<PathBuf>,
    /// Kill the program if it has not exited this long after the interrupt (ms).
    #[arg(long, value_name = "MS")]
    kill_after_ms: Option<u64>,
    /// Prepend elapsed time to rerun's own messages.
    #[arg(long)]
    timestamp: bool,
    /// Path to rerun.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Ignore any rerun.toml in the current directory.
    #[arg(long)]
    no_config: bool,
    /// Target to build, install and run, then the arguments passed to the
    /// program on every start.
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "TARGET [ARGS]"
    )]
    command: Vec<String>,
}

impl Cli {
    fn target(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }

    fn program_args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let Some(target) = cli.target().map(str::to_string) else {
        let _ = Cli::command().print_help();
        eprintln!("\n[rerun] error: {}", SetupError::MissingTarget);
        return ExitCode::from(1);
    };
    match rerun(&cli, target).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[rerun] error: {:#}", err);
            ExitCode::from(1)
        }
    }
}

async fn rerun(cli: &Cli, target: String) -> Result<()> {
    let file_config = load_file_config(cli)?;
    let settings = Settings::from_cli(cli, target, file_config);
    let reporter = Reporter::stdout(settings.output);
    reporter.info(format!("setting up {} {:?}", settings.target, settings.args));

    let toolchain = Toolchain::locate(&settings.toolchain, settings.toolchain_root.as_deref())?;
    if settings.toolchain_root.is_some() {
        reporter.info(format!("using toolchain {}", toolchain.program().display()));
    }
    let resolved = toolchain.resolve(&settings.target).await?;

    let pipeline = PipelineRunner::new(
        settings.pipeline(),
        toolchain.clone(),
        CommandExecutor,
        reporter.clone(),
    );
    let (restarts, signals) = restart_channel();
    let stop = restarts.clone();
    let restarts = (!settings.no_run).then_some(restarts);
    let coordinator = Coordinator::new(&resolved, pipeline, restarts, reporter.clone())?;

    let policy = IgnorePolicy::new(&settings.ignore, settings.skip_vcs)?;
    let watch_root = settings.watch.clone().unwrap_or_else(|| resolved.dir.clone());
    let watch_target = WatchTarget::new(&watch_root, policy)?;

    let supervisor = if settings.no_run {
        None
    } else {
        let program = toolchain
            .binary_path(&resolved)
            .await
            .context("failed to locate the installed binary")?;
        let spec = LaunchSpec {
            name: resolved.binary_name(),
            program,
            args: settings.args.clone(),
        };
        let (events_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(report_exits(events, reporter.clone()));
        let supervisor = ProcessSupervisor::new(spec, settings.shutdown(), reporter.clone())
            .with_events(events_tx)
            .spawn(signals);
        Some((supervisor, stop))
    };

    reporter.info(format!("watching {}", watch_target.root().display()));
    if !watch_target.policy().patterns().is_empty() {
        reporter.info(format!(
            "ignoring {}",
            watch_target.policy().patterns().join(", ")
        ));
    }
    if !watch_target.policy().skips_vcs() {
        reporter.info("watching version-control directories");
    }

    let (changes_tx, changes) = mpsc::channel(1);
    let scanner = ChangeScanner::new(watch_target, settings.poll_interval, SystemClock);
    spawn_scanner(scanner, changes_tx);

    tokio::select! {
        _ = coordinator.run(changes) => {}
        signal = shutdown_signal() => {
            reporter.info(format!("received {}, shutting down", signal));
        }
    }

    if let Some((supervisor, stop)) = supervisor {
        let abort = supervisor.abort_handle();
        let stopped = async move {
            let _ = stop.send(RestartSignal::StopOnly).await;
            drop(stop);
            let _ = supervisor.await;
        };
        tokio::select! {
            _ = stopped => {}
            signal = shutdown_signal() => {
                reporter.info(format!("received {} again, killing the program", signal));
                abort.abort();
            }
        }
    }
    Ok(())
}

async fn report_exits(mut events: mpsc::UnboundedReceiver<SupervisorEvent>, reporter: Reporter) {
    while let Some(event) = events.recv().await {
        if let SupervisorEvent::Exited { pid, code } = event {
            match code {
                Some(code) => reporter.info(format!("process {} exited with code {}", pid, code)),
                None => reporter.info(format!("process {} stopped", pid)),
            }
        }
    }
}

fn load_file_config(cli: &Cli) -> Result<Config> {
    if cli.no_config {
        return Ok(Config::default());
    }
    match cli.config.clone().or_else(config::default_config_path) {
        Some(path) => config::load_config(&path),
        None => Ok(Config::default()),
    }
}

/// Waits for the first SIGINT or SIGTERM (ctrl-c elsewhere).
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return "SIGINT";
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "ctrl-c"
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

/// Runtime configuration derived from CLI arguments and the config file.
#[derive(Debug, Clone)]
struct Settings {
    target: String,
    args: Vec<String>,
    run_tests: bool,
    build: bool,
    no_run: bool,
    race: bool,
    ignore: Vec<String>,
    skip_vcs: bool,
    watch: Option<PathBuf>,
    toolchain: String,
    toolchain_root: Option<PathBuf>,
    poll_interval: Duration,
    kill_after: Option<Duration>,
    output: OutputStyle,
}

impl Settings {
    fn from_cli(cli: &Cli, target: String, config: Config) -> Self {
        let mut ignore = config.ignore.unwrap_or_default();
        ignore.extend(cli.ignore.iter().cloned());
        let poll_interval = config
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL)
            .max(MIN_POLL_INTERVAL);
        Self {
            target,
            args: cli.program_args().to_vec(),
            run_tests: cli.test || config.test.unwrap_or(false),
            build: cli.build || config.build.unwrap_or(false),
            no_run: cli.no_run || config.no_run.unwrap_or(false),
            race: cli.race || config.race.unwrap_or(false),
            ignore,
            skip_vcs: !(cli.watch_vcs || config.watch_vcs.unwrap_or(false)),
            watch: cli.watch.clone().or(config.watch),
            toolchain: config
                .toolchain
                .unwrap_or_else(|| DEFAULT_TOOLCHAIN.to_string()),
            toolchain_root: cli.toolchain_root.clone().or(config.toolchain_root),
            poll_interval,
            kill_after: cli
                .kill_after_ms
                .or(config.kill_after_ms)
                .map(Duration::from_millis),
            output: OutputStyle {
                use_symbols: config.symbols.unwrap_or(false),
                timestamp: cli.timestamp || config.timestamp.unwrap_or(false),
            },
        }
    }

    fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            target: self.target.clone(),
            run_tests: self.run_tests,
            build: self.build,
            race: self.race,
        }
    }

    fn shutdown(&self) -> ShutdownConfig {
        match self.kill_after {
            Some(grace) => ShutdownConfig::kill_after(grace),
            None => ShutdownConfig::wait_forever(),
        }
    }
}
