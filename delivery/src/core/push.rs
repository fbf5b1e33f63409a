//! Per-push evaluation context.

use std::fmt;
use std::sync::Arc;

use crate::core::goal::GoalIdentity;
use crate::core::types::RepoRef;
use crate::io::channels::AddressChannels;
use crate::io::progress_log::ProgressLog;
use crate::io::project::Project;

/// Credentials forwarded to collaborators. Never logged.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Metadata about the event that triggered this evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationContext {
    pub correlation_id: String,
    pub team_id: String,
}

/// Everything a push test or executor may consult about one push.
///
/// Built by whoever receives the push event, used for a single evaluation,
/// then dropped. It is never persisted.
pub struct PushInvocation {
    pub id: RepoRef,
    pub project: Arc<dyn Project>,
    pub credentials: Credentials,
    pub context: InvocationContext,
    pub channels: Arc<dyn AddressChannels>,
}

impl PushInvocation {
    pub fn branch(&self) -> Option<&str> {
        self.id.branch.as_deref()
    }
}

impl fmt::Debug for PushInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushInvocation")
            .field("id", &self.id)
            .field("base_dir", &self.project.base_dir())
            .field("credentials", &self.credentials)
            .field("context", &self.context)
            .finish()
    }
}

/// What an executor receives when asked to fulfill a goal for a push.
pub struct GoalInvocation<'a> {
    pub push: &'a PushInvocation,
    pub goal: &'a GoalIdentity,
    pub progress_log: Arc<dyn ProgressLog>,
}
