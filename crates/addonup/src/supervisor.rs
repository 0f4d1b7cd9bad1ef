//! Child process supervision: launch several children, wait for the first
//! exit, kill the rest.
//!
//! There is no restart policy, no backoff and no ordering guarantee beyond
//! "first exit wins". An add-on whose children cannot all stay up has
//! nothing useful left to do, so the whole container stops and the Home
//! Assistant watchdog decides what happens next.

use std::process::ExitStatus;

use thiserror::Error;
use tokio::process::Child;
use tokio::process::Command;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Report of the first child to exit
#[derive(Debug)]
pub struct Exited {
    pub name: String,
    pub pid: Option<u32>,
    pub status: ExitStatus,
}

impl Exited {
    /// Exit code for the supervising process. Any first exit is a failure,
    /// even a zero one.
    pub fn exit_code(&self) -> i32 {
        match self.status.code() {
            Some(0) | None => 1,
            Some(code) => code,
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for children: {0}")]
    Wait(#[from] std::io::Error),

    #[error("no children to supervise")]
    Empty,

    #[error("{name} exited with {status}")]
    CommandFailed { name: String, status: ExitStatus },

    #[error("{} crashed, remaining children killed", exited.name)]
    ChildExited { exited: Exited },
}

impl SupervisorError {
    /// The exit code this error should terminate the launcher with, when it
    /// corresponds to a child failure.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SupervisorError::CommandFailed { status, .. } => {
                Some(status.code().filter(|c| *c != 0).unwrap_or(1))
            }
            SupervisorError::ChildExited { exited } => Some(exited.exit_code()),
            _ => None,
        }
    }
}

/// Render a command for logging, program plus args space-joined.
pub fn command_line(command: &Command) -> String {
    let std_command = command.as_std();
    std::iter::once(std_command.get_program())
        .chain(std_command.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a single command to completion, failing on non-zero exit.
pub async fn check_call(name: &str, command: &mut Command) -> Result<(), SupervisorError> {
    info!("Running {}: {}", name, command_line(command));
    let status = command
        .status()
        .await
        .map_err(|source| SupervisorError::Spawn {
            name: name.to_string(),
            source,
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(SupervisorError::CommandFailed {
            name: name.to_string(),
            status,
        })
    }
}

/// Run a single command to completion and capture its stdout, failing on
/// non-zero exit.
pub async fn check_output(name: &str, command: &mut Command) -> Result<String, SupervisorError> {
    let output = command
        .output()
        .await
        .map_err(|source| SupervisorError::Spawn {
            name: name.to_string(),
            source,
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(SupervisorError::CommandFailed {
            name: name.to_string(),
            status: output.status,
        })
    }
}

struct Entry {
    name: String,
    child: Child,
}

/// A set of named running children supervised fail-fast.
#[derive(Default)]
pub struct Supervisor {
    children: Vec<Entry>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a child and track it.
    pub fn spawn(
        &mut self,
        name: impl Into<String>,
        command: &mut Command,
    ) -> Result<(), SupervisorError> {
        let name = name.into();
        info!("Starting {} with command: {}", name, command_line(command));

        let child = command.spawn().map_err(|source| SupervisorError::Spawn {
            name: name.clone(),
            source,
        })?;

        if let Some(pid) = child.id() {
            info!("{} started (pid {})", name, pid);
        }
        self.children.push(Entry { name, child });
        Ok(())
    }

    /// Block until the first child exits, then kill and reap the rest.
    pub async fn wait_any(mut self) -> Result<Exited, SupervisorError> {
        if self.children.is_empty() {
            return Err(SupervisorError::Empty);
        }

        let (status, index) = {
            let waits: Vec<_> = self
                .children
                .iter_mut()
                .map(|entry| Box::pin(entry.child.wait()))
                .collect();
            let (status, index, _remaining) = futures::future::select_all(waits).await;
            (status, index)
        };
        let status = status?;

        let crashed = self.children.remove(index);
        error!(
            "{} (pid {}) exited with {}, killing others and exiting.",
            crashed.name,
            crashed.child.id().map_or(-1, |p| p as i64),
            status
        );

        for entry in &mut self.children {
            warn!("Killing {}", entry.name);
            if let Err(e) = entry.child.start_kill() {
                warn!("Failed to kill {}: {}", entry.name, e);
            }
        }
        for entry in &mut self.children {
            entry.child.wait().await.ok();
        }

        Ok(Exited {
            pid: crashed.child.id(),
            name: crashed.name,
            status,
        })
    }

    /// Supervise until the first exit and convert it into the error the
    /// launcher terminates with.
    pub async fn run_to_exit(self) -> Result<std::convert::Infallible, SupervisorError> {
        let exited = self.wait_any().await?;
        Err(SupervisorError::ChildExited { exited })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use std::time::Instant;

    use super::*;

    #[tokio::test]
    async fn test_first_exit_kills_remaining() {
        let mut supervisor = Supervisor::new();

        let mut slow = Command::new("sleep");
        slow.arg("30");
        supervisor.spawn("slow", &mut slow).unwrap();

        let mut fast = Command::new("sh");
        fast.args(["-c", "exit 7"]);
        supervisor.spawn("fast", &mut fast).unwrap();

        let start = Instant::now();
        let exited = supervisor.wait_any().await.unwrap();

        assert_eq!(exited.name, "fast");
        assert_eq!(exited.status.code(), Some(7));
        assert_eq!(exited.exit_code(), 7);
        // The sleeper must have been killed, not waited out
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_zero_exit_still_fails() {
        let mut supervisor = Supervisor::new();

        let mut ok = Command::new("true");
        supervisor.spawn("ok", &mut ok).unwrap();

        let exited = supervisor.wait_any().await.unwrap();
        assert_eq!(exited.status.code(), Some(0));
        assert_eq!(exited.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_empty_supervisor_errors() {
        let supervisor = Supervisor::new();
        assert!(matches!(
            supervisor.wait_any().await,
            Err(SupervisorError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_check_call() {
        check_call("true", &mut Command::new("true")).await.unwrap();

        let mut failing = Command::new("sh");
        failing.args(["-c", "exit 3"]);
        let err = check_call("failing", &mut failing).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
    }

    #[tokio::test]
    async fn test_check_output() {
        let mut echo = Command::new("echo");
        echo.arg("hello");
        let out = check_output("echo", &mut echo).await.unwrap();
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn test_command_line_rendering() {
        let mut command = Command::new("heisenbridge");
        command.args(["--listen-address", "0.0.0.0"]);
        assert_eq!(command_line(&command), "heisenbridge --listen-address 0.0.0.0");
    }
}
