//! Progress logs that capture build and deploy output.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::warn;

/// Sink for process output and executor messages.
///
/// Writers send complete lines; implementations must tolerate concurrent
/// writers.
pub trait ProgressLog: Send + Sync {
    fn name(&self) -> &str;

    fn write(&self, what: &str);

    /// Everything written so far.
    fn log(&self) -> String;

    /// Where a human can read this log, if anywhere.
    fn url(&self) -> Option<String> {
        None
    }
}

/// Default cap on the in-memory copy kept by goal logs.
pub const DEFAULT_MEMORY_LIMIT: usize = 1024 * 1024;

/// Append `what`, then drop whole lines from the front until `buf` fits in
/// `limit` bytes. The newest output is what interpreters need.
fn push_bounded(buf: &mut String, what: &str, limit: Option<usize>) {
    buf.push_str(what);
    let Some(limit) = limit else {
        return;
    };
    if buf.len() <= limit {
        return;
    }
    let excess = buf.len() - limit;
    let start = (excess..=buf.len())
        .find(|i| buf.is_char_boundary(*i))
        .unwrap_or(buf.len());
    let cut = match buf[start..].find('\n') {
        Some(pos) => start + pos + 1,
        None => start,
    };
    buf.drain(..cut);
}

/// In-memory log that disappears with the goal invocation.
#[derive(Debug, Default)]
pub struct EphemeralProgressLog {
    name: String,
    buf: Mutex<String>,
    limit: Option<usize>,
}

impl EphemeralProgressLog {
    /// Keeps everything written to it.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buf: Mutex::new(String::new()),
            limit: None,
        }
    }

    /// Keeps only the newest `limit` bytes, cut at a line boundary.
    ///
    /// Use this for logs that outlive their goal, such as the log a started
    /// service keeps streaming into.
    pub fn bounded(name: impl Into<String>, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new(name)
        }
    }
}

impl ProgressLog for EphemeralProgressLog {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, what: &str) {
        if let Ok(mut buf) = self.buf.lock() {
            push_bounded(&mut buf, what, self.limit);
        }
    }

    fn log(&self) -> String {
        self.buf.lock().map(|buf| buf.clone()).unwrap_or_default()
    }
}

/// Log that appends to a file and keeps an in-memory copy for interpretation.
///
/// The file receives everything; the in-memory copy keeps the newest
/// [`DEFAULT_MEMORY_LIMIT`] bytes.
#[derive(Debug)]
pub struct FileProgressLog {
    name: String,
    path: PathBuf,
    file: Mutex<File>,
    buf: Mutex<String>,
}

impl FileProgressLog {
    pub fn create(name: impl Into<String>, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open progress log {}", path.display()))?;
        Ok(Self {
            name: name.into(),
            path: path.to_path_buf(),
            file: Mutex::new(file),
            buf: Mutex::new(String::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProgressLog for FileProgressLog {
    fn name(&self) -> &str {
        &self.name
    }

    fn write(&self, what: &str) {
        if let Ok(mut file) = self.file.lock() {
            // Flush per write so the file can be tailed while a build runs.
            if let Err(e) = file.write_all(what.as_bytes()) {
                warn!(err = %e, path = %self.path.display(), "failed to write progress log");
            } else if let Err(e) = file.flush() {
                warn!(err = %e, path = %self.path.display(), "failed to flush progress log");
            }
        }
        if let Ok(mut buf) = self.buf.lock() {
            push_bounded(&mut buf, what, Some(DEFAULT_MEMORY_LIMIT));
        }
    }

    fn log(&self) -> String {
        self.buf.lock().map(|buf| buf.clone()).unwrap_or_default()
    }

    fn url(&self) -> Option<String> {
        Some(format!("file://{}", self.path.display()))
    }
}

/// Reassembles newline-delimited records from arbitrary byte chunks.
///
/// One buffer per stream: bytes are held until a `\n` arrives, so a record
/// split across reads is emitted once, whole. A trailing `\r` is dropped.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Emit whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_holds_partial_lines_until_newline() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"Starting ap").is_empty());
        assert_eq!(buf.push(b"p\nsecond"), vec!["Starting app".to_string()]);
        assert_eq!(buf.push(b" line\r\nthird\n"), vec![
            "second line".to_string(),
            "third".to_string()
        ]);
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn line_buffer_flushes_remainder_at_end_of_stream() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"no newline").is_empty());
        assert_eq!(buf.finish(), Some("no newline".to_string()));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn line_buffer_does_not_split_multibyte_characters() {
        let mut buf = LineBuffer::new();
        let bytes = "héllo\n".as_bytes();
        assert!(buf.push(&bytes[..2]).is_empty());
        assert_eq!(buf.push(&bytes[2..]), vec!["héllo".to_string()]);
    }

    #[test]
    fn ephemeral_log_accumulates_writes() {
        let log = EphemeralProgressLog::new("build");
        log.write("one\n");
        log.write("two\n");
        assert_eq!(log.log(), "one\ntwo\n");
        assert_eq!(log.name(), "build");
        assert_eq!(log.url(), None);
    }

    #[test]
    fn bounded_log_keeps_newest_whole_lines() {
        let log = EphemeralProgressLog::bounded("deploy", 12);
        log.write("first line\n");
        log.write("second\n");
        log.write("third\n");
        assert_eq!(log.log(), "third\n");

        log.write("0123456789abcdef");
        assert_eq!(log.log(), "456789abcdef");
        assert!(log.log().len() <= 12);
    }

    #[test]
    fn bounded_log_cuts_on_character_boundaries() {
        let log = EphemeralProgressLog::bounded("deploy", 5);
        log.write("ééééé");
        let kept = log.log();
        assert!(kept.len() <= 5);
        assert!(kept.chars().all(|c| c == 'é'));
    }

    #[test]
    fn file_log_appends_and_keeps_copy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("logs").join("deploy.log");
        let log = FileProgressLog::create("deploy", &path).expect("create");
        log.write("Started App\n");

        assert_eq!(log.log(), "Started App\n");
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "Started App\n"
        );
        assert!(log.url().expect("url").starts_with("file://"));
    }
}
