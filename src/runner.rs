//! Supervision of the single running program instance.
//!
//! The `ProcessSupervisor` owns the child process handle and is driven by a
//! control loop reading `RestartSignal`s from one channel. Each signal is
//! handled to completion, including waiting for the old instance to exit,
//! before the next one is read, so two instances never overlap.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::{RestartSignal, SupervisorEvent};
use crate::output::Reporter;
use crate::process::{LaunchSpec, ShutdownConfig, SupervisedProcess};

/// Owner of the supervised program's lifecycle.
pub struct ProcessSupervisor {
    spec: LaunchSpec,
    shutdown: ShutdownConfig,
    reporter: Reporter,
    events: Option<mpsc::UnboundedSender<SupervisorEvent>>,
    current: Option<SupervisedProcess>,
    interrupt: fn(u32) -> bool,
}

impl ProcessSupervisor {
    pub fn new(spec: LaunchSpec, shutdown: ShutdownConfig, reporter: Reporter) -> Self {
        Self {
            spec,
            shutdown,
            reporter,
            events: None,
            current: None,
            interrupt: send_interrupt,
        }
    }

    /// Replaces how the interrupt is delivered.
    #[cfg(test)]
    fn with_interrupt(mut self, interrupt: fn(u32) -> bool) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Also publishes lifecycle events on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Starts the control loop on the runtime.
    ///
    /// The loop ends once every sender of `signals` is dropped, after
    /// terminating whatever instance is still running.
    pub fn spawn(self, signals: mpsc::Receiver<RestartSignal>) -> JoinHandle<()> {
        tokio::spawn(self.control_loop(signals))
    }

    async fn control_loop(mut self, mut signals: mpsc::Receiver<RestartSignal>) {
        while let Some(signal) = signals.recv().await {
            self.handle(signal).await;
        }
        self.terminate_current().await;
    }

    async fn handle(&mut self, signal: RestartSignal) {
        self.terminate_current().await;
        if signal.relaunches() {
            self.launch();
        }
    }

    fn launch(&mut self) {
        self.reporter.info(format!("running {}", self.spec.display()));
        let child = match self.spec.command().spawn() {
            Ok(child) => child,
            Err(err) => {
                let error = format!("error on starting process: '{}'", err);
                self.reporter.info(&error);
                self.emit(SupervisorEvent::LaunchFailed { error });
                return;
            }
        };
        let pid = child.id().unwrap_or(0);
        self.current = Some(SupervisedProcess { child, pid });
        self.emit(SupervisorEvent::Launched { pid });
    }

    async fn terminate_current(&mut self) {
        let Some(SupervisedProcess { mut child, pid }) = self.current.take() else {
            return;
        };

        let already_exited = matches!(child.try_wait(), Ok(Some(_)));
        if !already_exited && !(self.interrupt)(pid) {
            self.reporter.info(format!(
                "error on sending signal to process {}, will now hard-kill the process",
                pid
            ));
            self.emit(SupervisorEvent::Escalated { pid });
            force_kill(&mut child, pid);
        }

        let status = match self.shutdown.grace_period() {
            Some(grace) if !already_exited => match wait_for_exit(&mut child, grace).await {
                Ok(Some(status)) => Ok(status),
                Ok(None) => {
                    self.reporter.info(format!(
                        "process {} still running after {}ms, killing it",
                        pid,
                        grace.as_millis()
                    ));
                    self.emit(SupervisorEvent::Escalated { pid });
                    force_kill(&mut child, pid);
                    child.wait().await
                }
                Err(err) => Err(err),
            },
            _ => child.wait().await,
        };

        match status {
            Ok(status) => self.emit(SupervisorEvent::Exited {
                pid,
                code: status.code(),
            }),
            Err(err) => {
                // The handle is gone either way; nothing is tracked any more.
                self.reporter
                    .info(format!("error waiting for process {}: {}", pid, err));
                self.emit(SupervisorEvent::Exited { pid, code: None });
            }
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

async fn wait_for_exit(
    child: &mut tokio::process::Child,
    timeout: Duration,
) -> std::io::Result<Option<std::process::ExitStatus>> {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(None),
    }
}

/// Asks the instance (and its process group) to shut down.
///
/// Returns `false` when the interrupt could not be delivered.
#[cfg(unix)]
fn send_interrupt(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    unsafe {
        if libc::kill(-pid, libc::SIGINT) == 0 {
            return true;
        }
        libc::kill(pid, libc::SIGINT) == 0
    }
}

#[cfg(windows)]
fn send_interrupt(pid: u32) -> bool {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Windows has no SIGINT for other processes; CTRL_BREAK is the closest console signal.
    unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) != 0 }
}

#[cfg(not(any(unix, windows)))]
fn send_interrupt(_pid: u32) -> bool {
    false
}

fn force_kill(child: &mut tokio::process::Child, pid: u32) {
    #[cfg(unix)]
    {
        if let Ok(pid) = libc::pid_t::try_from(pid) {
            if pid > 0 {
                unsafe {
                    let _ = libc::kill(-pid, libc::SIGKILL);
                }
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    let _ = child.start_kill();
}
