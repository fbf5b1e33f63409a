//! Spawning child processes and streaming their output into a progress log.
//!
//! Output is read concurrently from stdout and stderr while the child runs.
//! Both readers feed one channel so the consumer sees chunks in the order
//! they were read; each stream keeps its own [`LineBuffer`] so partial lines
//! from one stream never interleave with the other.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, warn};

use crate::error::DeliveryError;
use crate::io::config::DEFAULT_GOAL_TIMEOUT_MS;
use crate::io::progress_log::{LineBuffer, ProgressLog};

/// A program and its arguments. No shell is involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCommand {
    pub command: String,
    pub args: Vec<String>,
}

impl SpawnCommand {
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split on whitespace: `"npm run build"` runs `npm` with two arguments.
    /// Quoting is not interpreted.
    pub fn from_shell_words(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let command = words
            .next()
            .ok_or_else(|| DeliveryError::InvalidConfig(format!("empty command line {line:?}")))?;
        Ok(Self::new(command, words))
    }
}

impl fmt::Display for SpawnCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Decides from `(code, signal, captured output)` whether a run failed.
pub type ErrorFinder = Arc<dyn Fn(Option<i32>, Option<i32>, &str) -> bool + Send + Sync>;

/// Failed when the exit code is not zero or a signal ended the process.
pub fn default_error_finder(code: Option<i32>, signal: Option<i32>, _log: &str) -> bool {
    code != Some(0) || signal.is_some()
}

#[derive(Clone)]
pub struct SpawnOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// The child is killed when it runs longer than this.
    pub timeout: Duration,
    /// Consulted even when the process exits with code zero.
    pub error_finder: ErrorFinder,
    /// Remove ANSI escape sequences from every captured line.
    pub strip_ansi: bool,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: Vec::new(),
            timeout: Duration::from_millis(DEFAULT_GOAL_TIMEOUT_MS),
            error_finder: Arc::new(default_error_finder),
            strip_ansi: false,
        }
    }
}

impl fmt::Debug for SpawnOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnOptions")
            .field("cwd", &self.cwd)
            .field("env", &self.env)
            .field("timeout", &self.timeout)
            .field("strip_ansi", &self.strip_ansi)
            .finish_non_exhaustive()
    }
}

/// Outcome of one finished process.
///
/// Non-zero exits, timeouts and error-finder hits are all reported here with
/// `error = true`; only a failure to spawn is an `Err`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub error: bool,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Output captured from this process only, one line per record.
    pub log: String,
    pub timed_out: bool,
}

/// How long output may keep arriving after the command has exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Run `command` to completion, streaming its output into `log`.
///
/// Returns once the command exits. Output still arriving afterwards is
/// collected for at most a short grace period.
#[instrument(skip_all, fields(command = %command, timeout_ms = options.timeout.as_millis() as u64))]
pub async fn spawn_and_watch(
    command: &SpawnCommand,
    options: &SpawnOptions,
    log: &dyn ProgressLog,
) -> Result<ProcessResult> {
    let mut child = spawn_child(command, options.cwd.as_deref(), &options.env)?;
    let mut chunks = forward_output(&mut child)?;
    let mut splitter = OutputSplitter::new(options.strip_ansi);

    // The timeout bounds the exit, not the pipes: a background grandchild
    // may keep them open long after the command itself is done.
    let deadline = tokio::time::sleep(options.timeout);
    tokio::pin!(deadline);
    let mut streams_open = true;
    let exited = loop {
        tokio::select! {
            chunk = chunks.recv(), if streams_open => match chunk {
                Some((stream, chunk)) => {
                    splitter.push(stream, &chunk, log);
                }
                None => streams_open = false,
            },
            status = child.wait() => break Some(status.context("wait for command")?),
            () = &mut deadline => break None,
        }
    };

    let (status, timed_out) = match exited {
        Some(status) => (status, false),
        None => {
            warn!(
                timeout_ms = options.timeout.as_millis() as u64,
                "command timed out, killing"
            );
            child.kill().await.context("kill command")?;
            let status = child.wait().await.context("wait command after kill")?;
            (status, true)
        }
    };
    if streams_open {
        let drain = async {
            while let Some((stream, chunk)) = chunks.recv().await {
                splitter.push(stream, &chunk, log);
            }
        };
        if tokio::time::timeout(OUTPUT_DRAIN_GRACE, drain).await.is_err() {
            debug!("output still open after exit, leaving it behind");
        }
        // Whatever the readers already forwarded still belongs in the log.
        while let Ok((stream, chunk)) = chunks.try_recv() {
            splitter.push(stream, &chunk, log);
        }
    }
    splitter.finish(log);

    let (code, signal) = exit_parts(status);
    let captured = splitter.take_captured();
    let error = timed_out || !status.success() || (options.error_finder)(code, signal, &captured);
    debug!(?code, ?signal, timed_out, error, "command finished");
    Ok(ProcessResult {
        error,
        code,
        signal,
        log: captured,
        timed_out,
    })
}

/// Spawn with piped output, null stdin, and kill-on-drop.
pub(crate) fn spawn_child(
    command: &SpawnCommand,
    cwd: Option<&Path>,
    env: &[(String, String)],
) -> Result<Child> {
    let mut cmd = Command::new(&command.command);
    cmd.args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    debug!(command = %command, cwd = ?cwd, "spawning child process");
    cmd.spawn().map_err(|source| {
        error!(err = %source, command = %command, "failed to spawn command");
        DeliveryError::Spawn {
            command: command.to_string(),
            source,
        }
        .into()
    })
}

pub(crate) fn exit_parts(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;
    (status.code(), signal)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

pub(crate) type Chunk = (Stream, Vec<u8>);

/// Start one reader task per output stream. The receiver closes once both
/// streams have reached end of file.
pub(crate) fn forward_output(child: &mut Child) -> Result<mpsc::Receiver<Chunk>> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(read_chunks(stdout, Stream::Stdout, tx.clone()));
    tokio::spawn(read_chunks(stderr, Stream::Stderr, tx));
    Ok(rx)
}

async fn read_chunks<R>(mut reader: R, stream: Stream, tx: mpsc::Sender<Chunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send((stream, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(err = %e, ?stream, "failed to read child output");
                break;
            }
        }
    }
}

/// Turns raw chunks into log lines, one buffer per stream.
#[derive(Debug)]
pub(crate) struct OutputSplitter {
    stdout: LineBuffer,
    stderr: LineBuffer,
    strip_ansi: bool,
    capture: bool,
    captured: String,
}

impl OutputSplitter {
    pub(crate) fn new(strip_ansi: bool) -> Self {
        Self {
            stdout: LineBuffer::new(),
            stderr: LineBuffer::new(),
            strip_ansi,
            capture: true,
            captured: String::new(),
        }
    }

    /// Keep streaming to the log but stop accumulating a private copy.
    pub(crate) fn stop_capturing(&mut self) {
        self.capture = false;
        self.captured = String::new();
    }

    /// Write every line completed by `chunk` to `log` and return them.
    pub(crate) fn push(&mut self, stream: Stream, chunk: &[u8], log: &dyn ProgressLog) -> Vec<String> {
        let lines = match stream {
            Stream::Stdout => self.stdout.push(chunk),
            Stream::Stderr => self.stderr.push(chunk),
        };
        lines.into_iter().map(|line| self.emit(line, log)).collect()
    }

    /// Flush partial lines left in either buffer.
    pub(crate) fn finish(&mut self, log: &dyn ProgressLog) -> Vec<String> {
        let rest: Vec<String> = [self.stdout.finish(), self.stderr.finish()]
            .into_iter()
            .flatten()
            .collect();
        rest.into_iter().map(|line| self.emit(line, log)).collect()
    }

    pub(crate) fn take_captured(&mut self) -> String {
        std::mem::take(&mut self.captured)
    }

    fn emit(&mut self, line: String, log: &dyn ProgressLog) -> String {
        let line = if self.strip_ansi {
            strip_ansi(&line).into_owned()
        } else {
            line
        };
        let record = format!("{line}\n");
        log.write(&record);
        if self.capture {
            self.captured.push_str(&record);
        }
        line
    }
}

/// Remove ANSI colour and cursor escape sequences.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    use std::sync::LazyLock;
    static ANSI_RE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap());
    ANSI_RE.replace_all(text, "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_words_split_on_whitespace() {
        let cmd = SpawnCommand::from_shell_words("  npm   run build ").expect("parse");
        assert_eq!(cmd.command, "npm");
        assert_eq!(cmd.args, vec!["run", "build"]);
        assert_eq!(cmd.to_string(), "npm run build");
    }

    #[test]
    fn empty_command_line_is_rejected() {
        let err = SpawnCommand::from_shell_words("   ").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeliveryError>(),
            Some(DeliveryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn default_timeout_is_ten_minutes() {
        assert_eq!(SpawnOptions::default().timeout, Duration::from_millis(600_000));
    }

    #[test]
    fn default_error_finder_flags_nonzero_and_signals() {
        assert!(!default_error_finder(Some(0), None, ""));
        assert!(default_error_finder(Some(2), None, ""));
        assert!(default_error_finder(None, Some(9), ""));
    }

    #[test]
    fn strip_ansi_removes_colour_codes() {
        assert_eq!(strip_ansi("\x1b[31mERROR\x1b[0m in build"), "ERROR in build");
        assert!(matches!(strip_ansi("plain"), Cow::Borrowed("plain")));
    }

    #[test]
    fn splitter_keeps_streams_apart() {
        let log = crate::io::progress_log::EphemeralProgressLog::new("t");
        let mut splitter = OutputSplitter::new(false);

        assert!(splitter.push(Stream::Stdout, b"out-", &log).is_empty());
        assert_eq!(splitter.push(Stream::Stderr, b"err\n", &log), vec!["err"]);
        assert_eq!(splitter.push(Stream::Stdout, b"line\n", &log), vec!["out-line"]);
        assert_eq!(log.log(), "err\nout-line\n");
        assert_eq!(splitter.take_captured(), "err\nout-line\n");
    }
}
