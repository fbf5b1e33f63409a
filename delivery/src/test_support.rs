//! Test-only helpers: push builders, counting push tests, scripted executors.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::core::push::{Credentials, GoalInvocation, InvocationContext, PushInvocation};
use crate::core::push_test::{PushTest, PushTestRef};
use crate::core::types::{ExecuteGoalResult, GoalRecord, RepoRef};
use crate::io::channels::{AddressChannels, Destination};
use crate::io::project::LocalProject;
use crate::mapper::{FulfillmentCallback, GoalExecutor};

/// `acme/shop` at a fixed sha on `branch`.
pub fn repo_ref(branch: &str) -> RepoRef {
    RepoRef::new("acme", "shop", "0123abcd").with_branch(branch)
}

/// A push of `branch` whose project is the directory `dir`.
pub fn push_invocation(dir: &Path, branch: &str) -> PushInvocation {
    push_invocation_with_channels(dir, branch, Arc::new(RecordingChannels::default()))
}

pub fn push_invocation_with_channels(
    dir: &Path,
    branch: &str,
    channels: Arc<dyn AddressChannels>,
) -> PushInvocation {
    PushInvocation {
        id: repo_ref(branch),
        project: Arc::new(LocalProject::new(dir)),
        credentials: Credentials::default(),
        context: InvocationContext {
            correlation_id: "test-correlation".to_string(),
            team_id: "T-TEST".to_string(),
        },
        channels,
    }
}

/// Push test with a fixed answer that counts how often it was asked.
#[derive(Clone)]
pub struct CountingPushTest {
    inner: Arc<Counting>,
}

struct Counting {
    name: String,
    value: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl PushTest for Counting {
    fn name(&self) -> &str {
        &self.name
    }

    async fn test(&self, _push: &PushInvocation) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.value)
    }
}

impl CountingPushTest {
    pub fn new(name: &str, value: bool) -> Self {
        Self {
            inner: Arc::new(Counting {
                name: name.to_string(),
                value,
                calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn as_push_test(&self) -> PushTestRef {
        self.inner.clone()
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }
}

/// Channels that keep every message for later assertions.
#[derive(Debug, Default)]
pub struct RecordingChannels {
    sent: Mutex<Vec<(String, Destination)>>,
}

impl RecordingChannels {
    pub fn messages(&self) -> Vec<String> {
        self.sent
            .lock()
            .map(|sent| sent.iter().map(|(message, _)| message.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AddressChannels for RecordingChannels {
    async fn send(&self, message: &str, destination: &Destination) -> Result<()> {
        self.sent
            .lock()
            .map_err(|_| anyhow!("recording channels poisoned"))?
            .push((message.to_string(), destination.clone()));
        Ok(())
    }
}

enum Script {
    Result(ExecuteGoalResult),
    Error(String),
}

/// Executor that returns a fixed result and records which goals it ran.
pub struct ScriptedExecutor {
    script: Script,
    ran: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn with_script(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            ran: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::with_script(Script::Result(ExecuteGoalResult::success()))
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Self::with_script(Script::Result(ExecuteGoalResult::failure(message)))
    }

    /// Returns `Err` instead of a result.
    pub fn erroring(message: &str) -> Arc<Self> {
        Self::with_script(Script::Error(message.to_string()))
    }

    /// Unique names of the goals executed, in order.
    pub fn ran(&self) -> Vec<String> {
        self.ran.lock().map(|ran| ran.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl GoalExecutor for ScriptedExecutor {
    async fn execute(&self, invocation: &GoalInvocation<'_>) -> Result<ExecuteGoalResult> {
        if let Ok(mut ran) = self.ran.lock() {
            ran.push(invocation.goal.unique_name.clone());
        }
        invocation
            .progress_log
            .write(&format!("executing {}\n", invocation.goal.unique_name));
        match &self.script {
            Script::Result(result) => Ok(result.clone()),
            Script::Error(message) => Err(anyhow!(message.clone())),
        }
    }
}

/// Callback that does nothing.
pub struct NoopCallback;

#[async_trait]
impl FulfillmentCallback for NoopCallback {
    async fn on_fulfilled(&self, _record: &GoalRecord, _invocation: &GoalInvocation<'_>) -> Result<()> {
        Ok(())
    }
}

/// Callback that records the external key of every record it sees.
#[derive(Default)]
pub struct RecordingCallback {
    seen: Mutex<Vec<String>>,
}

impl RecordingCallback {
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl FulfillmentCallback for RecordingCallback {
    async fn on_fulfilled(&self, record: &GoalRecord, _invocation: &GoalInvocation<'_>) -> Result<()> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(record.external_key.clone());
        }
        Ok(())
    }
}

/// A temporary checkout holding `files` (project-relative path, content).
pub fn checkout(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    for (path, content) in files {
        let full = dir.path().join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(&full, content).expect("write checkout file");
    }
    dir
}
