use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;

use crate::frame::FrameGeometry;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("{program} not found")]
    NotFound { program: String },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{name}: {pipe} is not piped")]
    MissingPipe { name: String, pipe: &'static str },
    #[error("{name}: write failed: {source}")]
    Write {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{name}: read failed: {source}")]
    Read {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{name}: failed to signal process: {source}")]
    Signal {
        name: String,
        #[source]
        source: Errno,
    },
    #[error("{name}: failed to reap process: {source}")]
    Wait {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Which end of the child the pipeline talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Produces raw frames on stdout.
    Decoder,
    /// Consumes raw frames on stdin.
    Encoder,
}

#[derive(Debug, Clone)]
pub struct ProcessDescriptor {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub role: ProcessRole,
    pub fps: u32,
    pub geometry: FrameGeometry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited on its own or after the terminate request.
    Exited(ExitStatus),
    /// Still alive when the grace period ran out.
    Killed(ExitStatus),
}

/// A supervised child process with its stderr drained in the background.
pub struct ProcessHandle {
    name: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    last_error: watch::Receiver<Option<String>>,
    stopped: Option<StopOutcome>,
}

impl ProcessHandle {
    /// Must be called from within a tokio runtime.
    pub fn start(descriptor: &ProcessDescriptor) -> Result<Self, ProcessError> {
        let mut command = Command::new(&descriptor.program);
        command
            .args(&descriptor.args)
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match descriptor.role {
            ProcessRole::Decoder => command.stdin(Stdio::null()).stdout(Stdio::piped()),
            ProcessRole::Encoder => command.stdin(Stdio::piped()).stdout(Stdio::null()),
        };

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::NotFound {
                    program: descriptor.program.clone(),
                }
            } else {
                ProcessError::Spawn {
                    program: descriptor.program.clone(),
                    source: e,
                }
            }
        })?;

        let stderr = child.stderr.take().ok_or_else(|| ProcessError::MissingPipe {
            name: descriptor.name.clone(),
            pipe: "stderr",
        })?;

        let (error_tx, error_rx) = watch::channel(None);
        tokio::spawn(drain_diagnostics(descriptor.name.clone(), stderr, error_tx));

        tracing::info!(
            process = %descriptor.name,
            pid = child.id(),
            geometry = %descriptor.geometry,
            fps = descriptor.fps,
            "process started"
        );

        Ok(Self {
            name: descriptor.name.clone(),
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            child,
            last_error: error_rx,
            stopped: None,
        })
    }

    /// Fills `buf` from stdout. Returns fewer bytes than requested only at end of stream.
    pub async fn read_stdout(&mut self, buf: &mut [u8]) -> Result<usize, ProcessError> {
        let stdout = self.stdout.as_mut().ok_or_else(|| ProcessError::MissingPipe {
            name: self.name.clone(),
            pipe: "stdout",
        })?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = stdout
                .read(&mut buf[filled..])
                .await
                .map_err(|source| ProcessError::Read {
                    name: self.name.clone(),
                    source,
                })?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        Ok(filled)
    }

    pub async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ProcessError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| ProcessError::MissingPipe {
            name: self.name.clone(),
            pipe: "stdin",
        })?;

        let result = match stdin.write_all(data).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };

        result.map_err(|source| ProcessError::Write {
            name: self.name.clone(),
            source,
        })
    }

    /// Latest non-empty line the process wrote to stderr.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    pub fn is_running(&mut self) -> bool {
        self.stopped.is_none() && matches!(self.child.try_wait(), Ok(None))
    }

    /// Sends SIGTERM, waits up to `grace`, then kills. Safe to call repeatedly.
    pub async fn stop(&mut self, grace: Duration) -> Result<StopOutcome, ProcessError> {
        if let Some(outcome) = self.stopped {
            return Ok(outcome);
        }

        // Closing our pipe ends lets ffmpeg notice EOF/EPIPE on its own.
        self.stdin.take();
        self.stdout.take();

        if let Some(pid) = self.child.id() {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(source) => {
                    return Err(ProcessError::Signal {
                        name: self.name.clone(),
                        source,
                    })
                }
            }
        }

        let outcome = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => StopOutcome::Exited(status.map_err(|source| ProcessError::Wait {
                name: self.name.clone(),
                source,
            })?),
            Err(_) => {
                tracing::warn!(
                    process = %self.name,
                    grace_ms = grace.as_millis() as u64,
                    "process ignored terminate request, killing"
                );
                self.child
                    .kill()
                    .await
                    .map_err(|source| ProcessError::Wait {
                        name: self.name.clone(),
                        source,
                    })?;
                let status = self
                    .child
                    .wait()
                    .await
                    .map_err(|source| ProcessError::Wait {
                        name: self.name.clone(),
                        source,
                    })?;
                StopOutcome::Killed(status)
            }
        };

        tracing::info!(process = %self.name, outcome = ?outcome, "process stopped");
        self.stopped = Some(outcome);
        Ok(outcome)
    }
}

/// Reads stderr until EOF. Lines are decoded lossily so a non-UTF-8 byte never
/// closes the pipe under a running process.
async fn drain_diagnostics(
    name: String,
    stderr: ChildStderr,
    last_error: watch::Sender<Option<String>>,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                tracing::debug!(process = %name, "{}", line);
                last_error.send_replace(Some(line.to_string()));
            }
            Err(e) => {
                tracing::trace!(process = %name, error = %e, "diagnostic stream closed");
                break;
            }
        }
    }
}
