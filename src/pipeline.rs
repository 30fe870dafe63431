//! The test -> build -> install pipeline.
//!
//! Stages run one at a time through a `StageExecutor`, stopping at the first
//! failure. A clean install is expected to be silent, so any output from the
//! install stage counts as a failure even when the command exits zero.

use std::future::Future;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use crate::output::Reporter;
use crate::toolchain::{Invocation, Stage, Toolchain};

/// Which stages run and with which flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Target identifier passed to every stage.
    pub target: String,
    pub run_tests: bool,
    pub build: bool,
    /// Race detector flag, applied to every stage.
    pub race: bool,
}

impl PipelineConfig {
    /// The stages that run, in order.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = Vec::with_capacity(3);
        if self.run_tests {
            stages.push(Stage::Test);
        }
        if self.build {
            stages.push(Stage::Build);
        }
        stages.push(Stage::Install);
        stages
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineResult {
    Passed,
    Failed { stage: Stage, output: String },
}

impl PipelineResult {
    pub fn passed(&self) -> bool {
        matches!(self, PipelineResult::Passed)
    }
}

/// What a finished stage command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutput {
    /// Whether the command exited with status zero.
    pub success: bool,
    /// Stdout and stderr, merged in arrival order.
    pub output: String,
}

/// Runs a stage command to completion.
pub trait StageExecutor {
    fn execute(&self, invocation: &Invocation) -> impl Future<Output = Result<StageOutput>> + Send;
}

/// Executes stage commands as child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

impl StageExecutor for CommandExecutor {
    async fn execute(&self, invocation: &Invocation) -> Result<StageOutput> {
        let mut command = invocation.command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to run {}", invocation.display()))?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_stream(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_stream(stderr, tx.clone()));
        }
        drop(tx);

        let mut merged = Vec::new();
        while let Some(chunk) = rx.recv().await {
            merged.extend_from_slice(&chunk);
        }
        let status = child
            .wait()
            .await
            .with_context(|| format!("failed to wait for {}", invocation.display()))?;
        Ok(StageOutput {
            success: status.success(),
            output: String::from_utf8_lossy(&merged).into_owned(),
        })
    }
}

/// Forwards raw chunks from one pipe; output is kept byte for byte.
async fn read_stream<R>(mut reader: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// Runs the configured stages and reports their outcome.
pub struct PipelineRunner<E = CommandExecutor> {
    config: PipelineConfig,
    toolchain: Toolchain,
    executor: E,
    reporter: Reporter,
    last_failure: Option<String>,
}

impl<E: StageExecutor> PipelineRunner<E> {
    pub fn new(config: PipelineConfig, toolchain: Toolchain, executor: E, reporter: Reporter) -> Self {
        Self {
            config,
            toolchain,
            executor,
            reporter,
            last_failure: None,
        }
    }

    /// Runs every enabled stage, stopping at the first failure.
    pub async fn run(&mut self) -> PipelineResult {
        for stage in self.config.stages() {
            let invocation = self
                .toolchain
                .stage_invocation(stage, self.config.race, &self.config.target);
            let (success, output) = match self.executor.execute(&invocation).await {
                Ok(result) => (result.success, result.output),
                Err(err) => (false, format!("{:#}\n", err)),
            };
            if stage_failed(stage, success, &output) {
                self.report_failure(stage, &output);
                return PipelineResult::Failed { stage, output };
            }
            self.reporter.info(success_message(stage));
        }
        self.last_failure = None;
        PipelineResult::Passed
    }

    fn report_failure(&mut self, stage: Stage, output: &str) {
        let repeated = self.last_failure.as_deref() == Some(output);
        if repeated {
            self.reporter.info(format!("{} failed (output unchanged)", stage));
        } else {
            self.reporter.info(format!("{} failed", stage));
            self.reporter.raw(output);
        }
        self.last_failure = Some(output.to_string());
    }
}

fn stage_failed(stage: Stage, success: bool, output: &str) -> bool {
    !success || (stage == Stage::Install && !output.is_empty())
}

fn success_message(stage: Stage) -> &'static str {
    match stage {
        Stage::Test => "tests passed",
        Stage::Build => "build successful",
        Stage::Install => "install successful",
    }
}
