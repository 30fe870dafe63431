//! Data structures describing the supervised program.
//!
//! `LaunchSpec` says what to start; `SupervisedProcess` is the running
//! instance. Only the supervisor's control loop ever holds the latter.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

/// What the supervisor launches on every restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Name shown in log lines (the binary's base name).
    pub name: String,
    /// Path of the installed binary.
    pub program: PathBuf,
    /// Pass-through arguments, preserved across restarts.
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// Builds the command for a new instance.
    ///
    /// Output goes straight to rerun's own stdout/stderr. The instance runs in
    /// its own process group so the interrupt reaches everything it spawned.
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        command
    }

    /// Renders `name args...` for display.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(self.name.clone());
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }
}

/// How long a terminating instance may take before it is killed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownConfig {
    kill_after: Option<Duration>,
}

impl ShutdownConfig {
    /// Waits for the instance indefinitely after the interrupt.
    pub fn wait_forever() -> Self {
        Self { kill_after: None }
    }

    /// Kills the instance if it is still alive `kill_after` after the interrupt.
    pub fn kill_after(kill_after: Duration) -> Self {
        Self {
            kill_after: Some(kill_after),
        }
    }

    pub fn grace_period(&self) -> Option<Duration> {
        self.kill_after
    }
}

/// A running instance of the supervised program.
#[derive(Debug)]
pub struct SupervisedProcess {
    pub child: Child,
    pub pid: u32,
}
