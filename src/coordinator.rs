//! Ties change detection, the pipeline and the supervisor together.

use tokio::sync::mpsc;

use crate::error::SetupError;
use crate::events::{ChangeEvent, RestartSignal};
use crate::output::Reporter;
use crate::pipeline::{PipelineResult, PipelineRunner, StageExecutor};
use crate::toolchain::{PackageKind, ResolvedTarget};

/// Runs the pipeline once at startup and again on every change.
pub struct Coordinator<E> {
    pipeline: PipelineRunner<E>,
    restarts: Option<mpsc::Sender<RestartSignal>>,
    reporter: Reporter,
}

impl<E: StageExecutor> Coordinator<E> {
    /// Creates a coordinator for an executable target.
    ///
    /// `restarts` is `None` in never-run mode: the pipeline still runs but no
    /// instance is ever started.
    pub fn new(
        target: &ResolvedTarget,
        pipeline: PipelineRunner<E>,
        restarts: Option<mpsc::Sender<RestartSignal>>,
        reporter: Reporter,
    ) -> Result<Self, SetupError> {
        if let PackageKind::Library(name) = &target.kind {
            return Err(SetupError::NotExecutable { name: name.clone() });
        }
        Ok(Self {
            pipeline,
            restarts,
            reporter,
        })
    }

    /// Runs the initial cycle, then one cycle per change until `changes` closes.
    pub async fn run(mut self, mut changes: mpsc::Receiver<ChangeEvent>) {
        self.cycle().await;
        while let Some(change) = changes.recv().await {
            if change.skipped > 0 {
                self.reporter
                    .info(format!("change detected ({} unreadable entries skipped)", change.skipped));
            }
            self.cycle().await;
        }
    }

    /// One pipeline run, followed by a restart when it passed.
    pub async fn cycle(&mut self) -> PipelineResult {
        let result = self.pipeline.run().await;
        if result.passed() {
            if let Some(restarts) = &self.restarts {
                if restarts.send(RestartSignal::Restart).await.is_err() {
                    self.reporter.info("process supervisor has stopped");
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::SystemTime;

    use super::*;
    use crate::events::restart_channel;
    use crate::output::Captured;
    use crate::pipeline::testing::{config, ScriptedExecutor};
    use crate::toolchain::{Stage, Toolchain};

    fn target(kind: PackageKind) -> ResolvedTarget {
        ResolvedTarget {
            target: "example.com/app".to_string(),
            dir: PathBuf::from("/src/app"),
            kind,
            installed: None,
        }
    }

    fn change() -> ChangeEvent {
        ChangeEvent {
            detected_at: SystemTime::now(),
            modified: 1,
            skipped: 0,
        }
    }

    fn coordinator(
        run_tests: bool,
        executor: &ScriptedExecutor,
        restarts: Option<mpsc::Sender<RestartSignal>>,
    ) -> Coordinator<ScriptedExecutor> {
        let captured = Captured::default();
        let toolchain = Toolchain::locate("go", None).unwrap();
        let pipeline = PipelineRunner::new(
            config(run_tests, false),
            toolchain,
            executor.clone(),
            captured.reporter(),
        );
        Coordinator::new(&target(PackageKind::Command), pipeline, restarts, captured.reporter()).unwrap()
    }

    #[test]
    fn rejects_library_targets() {
        let executor = ScriptedExecutor::default();
        let captured = Captured::default();
        let toolchain = Toolchain::locate("go", None).unwrap();
        let pipeline = PipelineRunner::new(config(false, false), toolchain, executor.clone(), captured.reporter());
        let err = Coordinator::new(
            &target(PackageKind::Library("util".to_string())),
            pipeline,
            None,
            captured.reporter(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, SetupError::NotExecutable { name } if name == "util"));
        assert!(executor.verbs().is_empty());
    }

    #[tokio::test]
    async fn restarts_after_every_passing_cycle() {
        let executor = ScriptedExecutor::default();
        let (restarts, mut signals) = restart_channel();
        let (changes_tx, changes) = mpsc::channel(1);
        let coordinator = coordinator(false, &executor, Some(restarts));

        let run = tokio::spawn(coordinator.run(changes));
        assert_eq!(signals.recv().await, Some(RestartSignal::Restart));
        changes_tx.send(change()).await.unwrap();
        assert_eq!(signals.recv().await, Some(RestartSignal::Restart));
        drop(changes_tx);
        run.await.unwrap();

        assert_eq!(signals.recv().await, None);
        assert_eq!(executor.verbs(), vec!["install", "install"]);
    }

    #[tokio::test]
    async fn failing_tests_send_no_signal() {
        let executor = ScriptedExecutor::default();
        executor.push(false, "--- FAIL: TestX\n");
        let (restarts, mut signals) = restart_channel();
        let mut coordinator = coordinator(true, &executor, Some(restarts));

        let result = coordinator.cycle().await;
        assert!(matches!(result, PipelineResult::Failed { stage: Stage::Test, .. }));
        assert_eq!(executor.verbs(), vec!["test"]);
        assert!(signals.try_recv().is_err());

        assert!(coordinator.cycle().await.passed());
        assert_eq!(signals.try_recv().ok(), Some(RestartSignal::Restart));
    }

    #[tokio::test]
    async fn never_run_still_runs_every_stage() {
        let executor = ScriptedExecutor::default();
        executor.push(true, "").push(true, "").push(false, "--- FAIL\n");
        let (changes_tx, changes) = mpsc::channel(2);
        let coordinator = coordinator(true, &executor, None);

        changes_tx.send(change()).await.unwrap();
        drop(changes_tx);
        coordinator.run(changes).await;

        assert_eq!(executor.verbs(), vec!["test", "install", "test"]);
    }
}
