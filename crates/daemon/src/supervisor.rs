//! Process supervisor for the external encoder.
//!
//! Spawns the encoder for one job, forwards its stdout and stderr to the
//! daemon loop as [`ProcessEvent::Output`] one line segment at a time, and
//! reports the exit code as [`ProcessEvent::Exited`] once both streams are
//! drained. Termination sends
//! SIGINT and escalates to a hard kill after a grace period.

use crate::jobs::{status, Job};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

/// Longest output segment forwarded without a line break.
const MAX_SEGMENT_BYTES: usize = 64 * 1024;

/// Errors raised while starting the encoder.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Events reported by a running encoder.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// A chunk of stdout or stderr output.
    Output { job_id: String, chunk: String },
    /// The process exited. `code` is `None` when killed by a signal.
    Exited { job_id: String, code: Option<i32> },
}

/// Handle to a live encoder process.
#[derive(Debug)]
pub struct ProcessHandle {
    job_id: String,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the encoder to stop, force-killing it if it is still running
    /// after `grace`. Cleanup happens when the exit event arrives.
    pub fn terminate(&mut self, grace: Duration) {
        let interrupted = match self.pid {
            Some(pid) => match send_interrupt(pid) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(job_id = %self.job_id, pid, error = %e, "Failed to interrupt encoder");
                    false
                }
            },
            None => false,
        };

        let Some(kill_tx) = self.kill_tx.take() else {
            return;
        };
        if !interrupted {
            let _ = kill_tx.send(());
            return;
        }
        let job_id = self.job_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if kill_tx.send(()).is_ok() {
                tracing::warn!(%job_id, "Encoder ignored interrupt, killing it");
            }
        });
    }
}

#[cfg(unix)]
fn send_interrupt(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    let ret = unsafe { libc::kill(pid, libc::SIGINT) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_interrupt(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interrupt signals are not supported on this platform",
    ))
}

/// Create the directory that will hold the job's output.
///
/// Existing directories are fine; any other failure is returned.
pub async fn ensure_output_dir(output_path: &Path) -> Result<(), SupervisorError> {
    let Some(dir) = output_path.parent() else {
        return Ok(());
    };
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| SupervisorError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })
}

/// Start the encoder for `job`, reporting output and exit on `events`.
pub async fn start(
    encoder: &str,
    job: &Job,
    events: mpsc::Sender<ProcessEvent>,
) -> Result<ProcessHandle, SupervisorError> {
    ensure_output_dir(&job.output_path).await?;

    let mut child = Command::new(encoder)
        .args(&job.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            program: encoder.to_string(),
            source,
        })?;

    let pid = child.id();
    tracing::info!(job_id = %job.id, ?pid, encoder, "Encoder started");

    let stdout_task = tokio::spawn(forward_output(
        child.stdout.take(),
        job.id.clone(),
        events.clone(),
    ));
    let stderr_task = tokio::spawn(forward_output(
        child.stderr.take(),
        job.id.clone(),
        events.clone(),
    ));

    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    let job_id = job.id.clone();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            Ok(()) = &mut kill_rx => {
                let _ = child.start_kill();
                child.wait().await
            }
        };

        // All output must reach the loop before the exit event.
        let _ = tokio::join!(stdout_task, stderr_task);

        let code = match status {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::error!(%job_id, error = %e, "Failed to wait for encoder");
                None
            }
        };
        let _ = events.send(ProcessEvent::Exited { job_id, code }).await;
    });

    Ok(ProcessHandle {
        job_id: job.id.clone(),
        pid,
        kill_tx: Some(kill_tx),
    })
}

/// Read up to and including the next `\r` or `\n`.
///
/// Segments without a break are cut at [`MAX_SEGMENT_BYTES`]. Returns the
/// segment length, 0 at end of stream.
async fn read_segment<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    segment: &mut Vec<u8>,
) -> io::Result<usize> {
    segment.clear();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(segment.len());
        }
        let window = &buf[..buf.len().min(MAX_SEGMENT_BYTES - segment.len())];
        let (taken, line_end) = match window.iter().position(|&b| b == b'\r' || b == b'\n') {
            Some(i) => (i + 1, true),
            None => (window.len(), false),
        };
        segment.extend_from_slice(&buf[..taken]);
        reader.consume(taken);
        if line_end || segment.len() >= MAX_SEGMENT_BYTES {
            return Ok(segment.len());
        }
    }
}

async fn forward_output<R: AsyncRead + Unpin>(
    reader: Option<R>,
    job_id: String,
    events: mpsc::Sender<ProcessEvent>,
) {
    let Some(reader) = reader else {
        return;
    };
    let mut reader = BufReader::new(reader);
    let mut segment = Vec::new();
    loop {
        match read_segment(&mut reader, &mut segment).await {
            Ok(0) => break,
            Ok(_) => {
                // Bare line breaks between \r-terminated progress lines.
                if segment.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let chunk = String::from_utf8_lossy(&segment).into_owned();
                let event = ProcessEvent::Output {
                    job_id: job_id.clone(),
                    chunk,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(%job_id, error = %e, "Encoder output stream closed");
                break;
            }
        }
    }
}

/// How a finished job was judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Stopped on user request.
    Terminated,
    /// Exit code 1.
    Crashed,
    /// Completion marker seen. `delete_source` asks for source removal.
    Completed { delete_source: bool },
    /// Exited without ever printing the completion marker.
    Failed,
}

/// Apply the exit rules to the finished job and set its final status.
///
/// A user termination keeps "Terminated by user" whatever the exit code.
/// Exit code 1 is always a crash, even after the completion marker. A
/// completed job keeps the last status reported by the progress parser.
pub fn settle_exit(job: &mut Job, code: Option<i32>, terminated_by_user: bool) -> ExitOutcome {
    if terminated_by_user {
        job.status = status::TERMINATED.to_string();
        return ExitOutcome::Terminated;
    }
    if code == Some(1) {
        job.status = status::CRASHED.to_string();
        return ExitOutcome::Crashed;
    }
    if job.complete {
        return ExitOutcome::Completed {
            delete_source: job.delete_source,
        };
    }
    job.status = status::FAILED.to_string();
    ExitOutcome::Failed
}

/// Best-effort source removal after a successful encode.
pub async fn remove_source(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::info!(path = %path.display(), "File deleted"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to delete source"),
    }
}
