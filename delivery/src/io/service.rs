//! Long-running service processes.
//!
//! [`spawn_service`] returns as soon as the outcome of startup is known: a
//! success pattern matched, the process exited, or the startup deadline
//! passed. [`spawn_service_until`] can also be cancelled while it waits.
//!
//! A started service keeps streaming output to its progress log from a
//! background task until it is terminated. The log therefore grows for as
//! long as the service lives; give long-lived services a log that bounds its
//! in-memory copy, such as [`EphemeralProgressLog::bounded`].
//!
//! [`EphemeralProgressLog::bounded`]: crate::io::progress_log::EphemeralProgressLog::bounded

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::core::watch::{ServiceWatch, WatchEvent, WatchState};
use crate::io::process::{
    Chunk, OutputSplitter, SpawnCommand, exit_parts, forward_output, spawn_child,
};
use crate::io::progress_log::ProgressLog;

#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// The first output line matching any of these marks the service started.
    pub success_patterns: Vec<Regex>,
    /// `None` waits for a match or an exit, however long that takes.
    pub startup_timeout: Option<Duration>,
    pub strip_ansi: bool,
}

#[derive(Debug)]
pub enum ServiceOutcome {
    Started(RunningService),
    /// The process exited before printing a success line.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
        log: String,
    },
    /// No success line before the startup deadline; the process was killed.
    TimedOut { log: String },
    /// The start was abandoned on request; the process was killed.
    Cancelled { log: String },
}

/// A started service and the task forwarding its output.
pub struct RunningService {
    child: Child,
    pid: Option<u32>,
    started_line: String,
    pump: JoinHandle<()>,
}

impl fmt::Debug for RunningService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningService")
            .field("pid", &self.pid)
            .field("started_line", &self.started_line)
            .finish_non_exhaustive()
    }
}

impl RunningService {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The output line that matched a success pattern.
    pub fn started_line(&self) -> &str {
        &self.started_line
    }

    /// False once the process has exited.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the process to stop, then kill it if it is still alive after
    /// `grace`. Returns once the process has exited.
    #[instrument(skip_all, fields(pid = ?self.pid))]
    pub async fn terminate(mut self, grace: Duration) -> Result<()> {
        if self.is_running() {
            if send_sigterm(self.pid) {
                match tokio::time::timeout(grace, self.child.wait()).await {
                    Ok(status) => {
                        let status = status.context("wait for service")?;
                        debug!(code = ?status.code(), "service stopped");
                    }
                    Err(_) => {
                        warn!(grace_ms = grace.as_millis() as u64, "service ignored SIGTERM, killing");
                        self.child.kill().await.context("kill service")?;
                    }
                }
            } else {
                self.child.kill().await.context("kill service")?;
            }
        }
        if tokio::time::timeout(grace, &mut self.pump).await.is_err() {
            // A grandchild may still hold the pipes open.
            debug!("output pump still running, aborting");
            self.pump.abort();
        }
        Ok(())
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn send_sigterm(pid: Option<u32>) -> bool {
    let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return false;
    };
    // SAFETY: kill(2) takes plain integers; the pid is our own unreaped child.
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: Option<u32>) -> bool {
    false
}

/// Spawn a service and wait for it to report that it started.
pub async fn spawn_service(
    command: &SpawnCommand,
    options: &ServiceOptions,
    log: Arc<dyn ProgressLog>,
) -> Result<ServiceOutcome> {
    spawn_service_until(command, options, log, std::future::pending()).await
}

/// Like [`spawn_service`], but gives up and kills the process when `cancel`
/// completes before startup has resolved.
#[instrument(skip_all, fields(command = %command))]
pub async fn spawn_service_until(
    command: &SpawnCommand,
    options: &ServiceOptions,
    log: Arc<dyn ProgressLog>,
    cancel: impl Future<Output = ()>,
) -> Result<ServiceOutcome> {
    let mut child = spawn_child(command, options.cwd.as_deref(), &options.env)?;
    let pid = child.id();
    let mut chunks = forward_output(&mut child)?;
    let mut splitter = OutputSplitter::new(options.strip_ansi);
    let mut watch = ServiceWatch::new(options.success_patterns.clone());
    watch.apply(WatchEvent::Spawned);

    let startup_timeout = options.startup_timeout;
    let deadline = async move {
        match startup_timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    tokio::pin!(cancel);

    while !watch.state().is_terminal() {
        tokio::select! {
            biased;
            chunk = chunks.recv() => match chunk {
                Some((stream, bytes)) => {
                    for line in splitter.push(stream, &bytes, &*log) {
                        watch.apply(WatchEvent::Line(line));
                    }
                }
                None => {
                    // Both streams are closed: every line is in, so the exit
                    // can be judged.
                    for line in splitter.finish(&*log) {
                        watch.apply(WatchEvent::Line(line));
                    }
                    if !watch.state().is_terminal() {
                        let status = child.wait().await.context("wait for service")?;
                        let (code, signal) = exit_parts(status);
                        watch.apply(WatchEvent::Exited { code, signal });
                    }
                }
            },
            () = &mut deadline => {
                watch.apply(WatchEvent::Deadline);
            }
            () = &mut cancel => {
                watch.apply(WatchEvent::Cancelled);
            }
        }
    }

    match watch.state().clone() {
        WatchState::Succeeded { line } => {
            info!(?pid, line = %line, "service started");
            splitter.stop_capturing();
            let pump = tokio::spawn(async move {
                while let Some((stream, bytes)) = chunks.recv().await {
                    splitter.push(stream, &bytes, &*log);
                }
                splitter.finish(&*log);
            });
            Ok(ServiceOutcome::Started(RunningService {
                child,
                pid,
                started_line: line,
                pump,
            }))
        }
        WatchState::Failed { code, signal } => {
            warn!(?code, ?signal, "service exited before it started");
            Ok(ServiceOutcome::Exited {
                code,
                signal,
                log: splitter.take_captured(),
            })
        }
        WatchState::TimedOut => {
            warn!(
                timeout_ms = startup_timeout.map(|t| t.as_millis() as u64),
                "service did not start in time, killing"
            );
            child.kill().await.context("kill service")?;
            drain_after_kill(&mut chunks, &mut splitter, &*log);
            Ok(ServiceOutcome::TimedOut {
                log: splitter.take_captured(),
            })
        }
        WatchState::Cancelled => {
            info!(?pid, "service start cancelled, killing");
            child.kill().await.context("kill service")?;
            drain_after_kill(&mut chunks, &mut splitter, &*log);
            Ok(ServiceOutcome::Cancelled {
                log: splitter.take_captured(),
            })
        }
        other => Err(anyhow!("service watch stopped in state {other:?}")),
    }
}

fn drain_after_kill(
    chunks: &mut mpsc::Receiver<Chunk>,
    splitter: &mut OutputSplitter,
    log: &dyn ProgressLog,
) {
    while let Ok((stream, bytes)) = chunks.try_recv() {
        splitter.push(stream, &bytes, log);
    }
    splitter.finish(log);
}
