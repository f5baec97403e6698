use std::io::Read;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::command::CommandInvocation;
use crate::error::{ExecutionError, SinkError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_POLLS_PER_CALLBACK: u32 = 10;

/// Captured streams of a finished child process.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionResult {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Runs one invocation at a time as a child process, polling it on a fixed interval.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionSupervisor {
    poll_interval: Duration,
    polls_per_callback: u32,
}

impl Default for ExecutionSupervisor {
    fn default() -> Self {
        ExecutionSupervisor::new(DEFAULT_POLL_INTERVAL, DEFAULT_POLLS_PER_CALLBACK)
    }
}

impl ExecutionSupervisor {
    pub fn new(poll_interval: Duration, polls_per_callback: u32) -> Self {
        ExecutionSupervisor {
            poll_interval,
            polls_per_callback: polls_per_callback.max(1),
        }
    }

    /// Runs `invocation` and fails on spawn errors or a non-zero exit status.
    pub fn execute<F>(
        &self,
        invocation: &CommandInvocation,
        on_progress: F,
    ) -> Result<ExecutionResult, ExecutionError>
    where
        F: FnMut(&str) -> Result<(), SinkError>,
    {
        let result = self.run(invocation, on_progress)?;
        if !result.status.success() {
            let err = ExecutionError::Failed {
                tool: invocation.role,
                command: invocation.to_string(),
                code: result.exit_code(),
                diagnostics: result.stderr,
            };
            error!("{}", err);
            return Err(err);
        }
        Ok(result)
    }

    /// Runs without progress reporting.
    pub fn execute_quiet(
        &self,
        invocation: &CommandInvocation,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.execute(invocation, |_| Ok(()))
    }

    /// Runs `invocation` to completion and returns whatever it produced, whatever the exit status.
    ///
    /// Every `polls_per_callback` polls the accumulated diagnostic text is handed to
    /// `on_progress`. If that callback fails the child is killed and the failure is returned.
    pub fn run<F>(
        &self,
        invocation: &CommandInvocation,
        mut on_progress: F,
    ) -> Result<ExecutionResult, ExecutionError>
    where
        F: FnMut(&str) -> Result<(), SinkError>,
    {
        let command_line = invocation.to_string();
        trace!("Executing {}: {:?}", invocation.role, invocation.line);

        let mut cmd = invocation.to_command();
        cmd.stdin(Stdio::null()).stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so a kill also reaches whatever a shell line started.
            cmd.process_group(0);
        }
        if invocation.capture_stdout {
            cmd.stdout(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null());
        }

        let mut child = cmd.spawn().map_err(|source| {
            let err = ExecutionError::Spawn {
                tool: invocation.role,
                command: command_line.clone(),
                source,
            };
            error!("{}", err);
            err
        })?;
        debug!("{} started with pid {}", invocation.role, child.id());

        let diagnostics = Arc::new(Mutex::new(String::new()));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| drain_into(pipe, Arc::clone(&diagnostics)));
        let stdout_task = child.stdout.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut bytes = Vec::new();
                if let Err(e) = pipe.read_to_end(&mut bytes) {
                    warn!("Failed reading child stdout: {}", e);
                }
                String::from_utf8_lossy(&bytes).into_owned()
            })
        });

        let mut polls: u32 = 0;
        let status = loop {
            thread::sleep(self.poll_interval);
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(source) => {
                    let _ = terminate(&mut child);
                    let _ = child.wait();
                    return Err(ExecutionError::Supervise {
                        tool: invocation.role,
                        command: command_line,
                        source,
                    });
                }
            }

            polls = polls.wrapping_add(1);
            if polls % self.polls_per_callback != 0 {
                continue;
            }
            let snapshot = snapshot(&diagnostics);
            if let Err(source) = on_progress(&snapshot) {
                warn!(
                    "Progress callback failed ({}), terminating {} (pid {})",
                    source,
                    invocation.role,
                    child.id()
                );
                if let Err(e) = terminate(&mut child) {
                    warn!("Failed to kill {}: {}", invocation.role, e);
                }
                let _ = child.wait();
                // The pipe readers are left to finish on their own; a grandchild may still hold the pipes.
                return Err(ExecutionError::Interrupted {
                    tool: invocation.role,
                    command: command_line,
                    diagnostics: snapshot,
                    source,
                });
            }
        };

        if let Some(task) = stderr_task {
            let _ = task.join();
        }
        let stdout = stdout_task
            .map(|task| task.join().unwrap_or_default())
            .unwrap_or_default();
        let stderr = snapshot(&diagnostics);

        info!("{} finished with {}", invocation.role, status);
        Ok(ExecutionResult {
            status,
            stdout,
            stderr,
        })
    }
}

fn drain_into<R: Read + Send + 'static>(mut pipe: R, sink: Arc<Mutex<String>>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_str(&String::from_utf8_lossy(&chunk[..n])),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Failed reading child diagnostics: {}", e);
                    break;
                }
            }
        }
    })
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: kill(2) takes plain integers; a negative pid addresses the child's process group.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}

fn snapshot(buffer: &Mutex<String>) -> String {
    buffer.lock().unwrap_or_else(PoisonError::into_inner).clone()
}
