//! Shared value types for goal resolution and local delivery.
//!
//! These types are plain data. They never perform I/O and are safe to clone
//! across tasks.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Goals that do not depend on where code runs (build, test, inspection).
pub const INDEPENDENT_OF_ENVIRONMENT: &str = "0-code/";
pub const STAGING_ENVIRONMENT: &str = "1-staging/";
pub const PRODUCTION_ENVIRONMENT: &str = "2-prod/";

/// Compare a registered environment against one read from a goal record.
///
/// Registered environments carry a trailing `/` (see the constants above)
/// while stored goal records may not, so `"env/"` is treated as equal to
/// `"env"`. Only the registered side is normalized.
pub fn environments_equivalent(registered: &str, observed: &str) -> bool {
    registered == observed || registered.strip_suffix('/') == Some(observed)
}

/// Repository coordinates of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
    pub branch: Option<String>,
    pub sha: String,
    pub default_branch: Option<String>,
    pub url: Option<String>,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            branch: None,
            sha: sha.into(),
            default_branch: None,
            url: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = Some(branch.into());
        self
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)?;
        if let Some(branch) = &self.branch {
            write!(f, "#{branch}")?;
        }
        Ok(())
    }
}

/// How a goal record expects to be fulfilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FulfillmentMethod {
    Sdm,
    SideEffect,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentRef {
    pub name: String,
    pub method: FulfillmentMethod,
}

/// Goal execution record as exchanged with the goal store.
///
/// Only the fields needed to match implementations and callbacks are modeled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalRecord {
    pub name: String,
    pub environment: String,
    pub external_key: String,
    pub fulfillment: FulfillmentRef,
}

/// Outcome reported by a goal executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteGoalResult {
    pub code: i32,
    pub message: Option<String>,
    pub target_url: Option<String>,
}

impl ExecuteGoalResult {
    pub fn success() -> Self {
        Self {
            code: 0,
            message: None,
            target_url: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            message: Some(message.into()),
            target_url: None,
        }
    }

    pub fn with_target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Identifies one local deployment slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagedDeploymentKey {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

impl ManagedDeploymentKey {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            branch: branch.into(),
        }
    }

    /// Context root a locally deployed service is mounted at.
    pub fn context_root(&self) -> String {
        format!("/{}/{}/{}", self.owner, self.repo, self.branch)
    }
}

impl fmt::Display for ManagedDeploymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.branch)
    }
}

/// Which dimensions of a key identify a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupStrategy {
    /// One deployment per owner/repo/branch.
    Branch,
    /// One deployment per owner/repo, whatever the branch.
    Repo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_separator_on_registered_environment_is_equivalent() {
        assert!(environments_equivalent("0-code/", "0-code"));
        assert!(environments_equivalent("0-code/", "0-code/"));
        assert!(environments_equivalent("prod", "prod"));
    }

    #[test]
    fn environment_equivalence_is_not_symmetric() {
        assert!(!environments_equivalent("0-code", "0-code/"));
        assert!(!environments_equivalent("1-staging/", "0-code"));
    }

    #[test]
    fn goal_record_uses_camel_case_json() {
        let record = GoalRecord {
            name: "build".to_string(),
            environment: "0-code/".to_string(),
            external_key: "sdm/0-code/build".to_string(),
            fulfillment: FulfillmentRef {
                name: "npm-build".to_string(),
                method: FulfillmentMethod::SideEffect,
            },
        };
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["externalKey"], "sdm/0-code/build");
        assert_eq!(json["fulfillment"]["method"], "side-effect");
    }

    #[test]
    fn key_context_root_includes_branch() {
        let key = ManagedDeploymentKey::new("o", "r", "feature/x");
        assert_eq!(key.context_root(), "/o/r/feature/x");
        assert_eq!(key.to_string(), "o/r#feature/x");
    }
}
