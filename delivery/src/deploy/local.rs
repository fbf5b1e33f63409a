//! Deploy a service from source on this machine.
//!
//! The deployer reserves a port for the branch, stops whatever ran there
//! before, starts the service from the checkout, and waits for a success
//! line in its output. The wait happens outside the slot lock, so a start
//! that hangs can still be cancelled with
//! [`ManagedDeployments::terminate_if_running`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::core::log_interpreter::{InterpretedLog, deploy_log_interpreter};
use crate::core::push::GoalInvocation;
use crate::core::types::{ExecuteGoalResult, LookupStrategy, ManagedDeploymentKey, RepoRef};
use crate::deploy::managed::{Deployment, ManagedDeployment, ManagedDeployments};
use crate::error::DeliveryError;
use crate::io::channels::Destination;
use crate::io::config::DeliveryConfig;
use crate::io::process::SpawnCommand;
use crate::io::progress_log::ProgressLog;
use crate::io::project::Project;
use crate::io::service::{ServiceOptions, ServiceOutcome, spawn_service_until};
use crate::mapper::GoalExecutor;

/// Command line with placeholders filled in per deployment.
///
/// Recognised placeholders: `{port}`, `{owner}`, `{repo}`, `{branch}`,
/// `{context_root}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    pub args: Vec<String>,
}

impl CommandSpec {
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

    /// `mvn spring-boot:run` bound to the reserved port and the branch's
    /// context root.
    pub fn maven_spring_boot() -> Self {
        Self::new(
            "mvn",
            [
                "spring-boot:run",
                "-Dserver.port={port}",
                "-Dserver.contextPath={context_root}",
            ],
        )
    }

    pub fn render(&self, key: &ManagedDeploymentKey, port: u16) -> SpawnCommand {
        let port = port.to_string();
        let context_root = key.context_root();
        let fill = |template: &str| {
            template
                .replace("{port}", &port)
                .replace("{owner}", &key.owner)
                .replace("{repo}", &key.repo)
                .replace("{branch}", &key.branch)
                .replace("{context_root}", &context_root)
        };
        SpawnCommand {
            command: fill(&self.command),
            args: self.args.iter().map(|arg| fill(arg)).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalDeployerOptions {
    pub base_url: String,
    pub success_patterns: Vec<Regex>,
    pub command: CommandSpec,
    /// `None` waits for a success line or an exit, however long it takes.
    pub startup_timeout: Option<Duration>,
    pub env: Vec<(String, String)>,
    pub lookup_strategy: LookupStrategy,
}

impl LocalDeployerOptions {
    /// Options from configuration. Without a configured startup timeout the
    /// goal timeout bounds the wait for a success line.
    pub fn from_config(config: &DeliveryConfig, command: CommandSpec) -> Result<Self> {
        let deploy = &config.deploy;
        Ok(Self {
            base_url: deploy.base_url.trim_end_matches('/').to_string(),
            success_patterns: deploy.compiled_success_patterns()?,
            command,
            startup_timeout: Some(
                deploy
                    .startup_timeout()
                    .unwrap_or_else(|| config.goal_timeout()),
            ),
            env: Vec::new(),
            lookup_strategy: LookupStrategy::Branch,
        })
    }
}

/// Result of one deploy attempt that got as far as spawning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    Deployed(Deployment),
    Failed {
        message: String,
        code: Option<i32>,
        signal: Option<i32>,
        timed_out: bool,
        interpreted: Option<InterpretedLog>,
    },
    /// The start was cancelled by a terminate or a newer deploy of the slot.
    Cancelled,
}

/// Derive the deployment key for a push. The branch is required.
pub fn deployment_key(id: &RepoRef) -> Result<ManagedDeploymentKey> {
    match id.branch.as_deref() {
        Some(branch) if !branch.is_empty() => {
            Ok(ManagedDeploymentKey::new(&id.owner, &id.repo, branch))
        }
        _ => Err(DeliveryError::MissingBranch {
            key: format!("{}/{}", id.owner, id.repo),
        }
        .into()),
    }
}

pub struct LocalDeployer {
    deployments: Arc<ManagedDeployments>,
    options: LocalDeployerOptions,
}

impl LocalDeployer {
    pub fn new(deployments: Arc<ManagedDeployments>, options: LocalDeployerOptions) -> Self {
        Self {
            deployments,
            options,
        }
    }

    pub fn options(&self) -> &LocalDeployerOptions {
        &self.options
    }

    fn endpoint(&self, key: &ManagedDeploymentKey, port: u16) -> String {
        format!("{}:{}{}", self.options.base_url, port, key.context_root())
    }

    /// Deploy `project` for `key`, replacing any deployment in the same slot.
    ///
    /// Spawn failures are errors; a service that exits or never reports
    /// readiness is a [`DeployOutcome::Failed`] and leaves no record. When
    /// two deploys of one slot overlap, the later one wins and the earlier
    /// one ends as [`DeployOutcome::Cancelled`] unless it had already been
    /// recorded.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn deploy(
        &self,
        project: &dyn Project,
        key: &ManagedDeploymentKey,
        log: Arc<dyn ProgressLog>,
    ) -> Result<DeployOutcome> {
        if key.branch.is_empty() {
            return Err(DeliveryError::MissingBranch {
                key: key.to_string(),
            }
            .into());
        }
        let strategy = self.options.lookup_strategy;
        let (port, mut ticket) = {
            let slot = self.deployments.slot(key, strategy).await;
            let port = slot.find_port().await?;
            slot.terminate_if_running().await?;
            (port, slot.begin_start().await)
        };

        let command = self.options.command.render(key, port);
        info!(port, command = %command, "starting service");
        let service_options = ServiceOptions {
            cwd: Some(project.base_dir().to_path_buf()),
            env: self.options.env.clone(),
            success_patterns: self.options.success_patterns.clone(),
            startup_timeout: self.options.startup_timeout,
            strip_ansi: false,
        };

        let cancelled = ticket.cancelled();
        let outcome = match spawn_service_until(&command, &service_options, log, cancelled).await {
            Ok(outcome) => outcome,
            Err(e) => {
                ticket.abandon().await;
                return Err(e);
            }
        };
        let ServiceOutcome::Started(service) = outcome else {
            ticket.abandon().await;
            return Ok(self.not_started(&command, outcome));
        };
        let deployment = Deployment {
            endpoint: self.endpoint(key, port),
            port,
            pid: service.pid(),
        };
        let managed = ManagedDeployment::new(key.clone(), strategy, deployment.clone(), service);
        match ticket.commit(managed).await? {
            Some(_) => Ok(DeployOutcome::Deployed(deployment)),
            None => Ok(DeployOutcome::Cancelled),
        }
    }

    fn not_started(&self, command: &SpawnCommand, outcome: ServiceOutcome) -> DeployOutcome {
        match outcome {
            ServiceOutcome::Started(_) | ServiceOutcome::Cancelled { .. } => {
                DeployOutcome::Cancelled
            }
            ServiceOutcome::Exited { code, signal, log } => DeployOutcome::Failed {
                message: format!(
                    "{command} exited before startup completed (code {code:?}, signal {signal:?})"
                ),
                code,
                signal,
                timed_out: false,
                interpreted: self.log_interpreter(&log),
            },
            ServiceOutcome::TimedOut { log } => DeployOutcome::Failed {
                message: format!("{command} did not report startup in time"),
                code: None,
                signal: None,
                timed_out: true,
                interpreted: self.log_interpreter(&log),
            },
        }
    }

    /// Deployment in the slot for `key`, if one is live.
    pub async fn find_deployment(&self, key: &ManagedDeploymentKey) -> Option<Deployment> {
        self.deployments
            .find_deployment(key, self.options.lookup_strategy)
            .await
            .map(|d| d.deployment().clone())
    }

    /// Every live deployment of the key's repository, whatever the branch.
    pub async fn find_deployments(&self, key: &ManagedDeploymentKey) -> Vec<Deployment> {
        self.deployments
            .list()
            .await
            .into_iter()
            .filter(|d| d.key().owner == key.owner && d.key().repo == key.repo)
            .map(|d| d.deployment().clone())
            .collect()
    }

    pub async fn undeploy(&self, key: &ManagedDeploymentKey) -> Result<bool> {
        self.deployments
            .undeploy(key, self.options.lookup_strategy)
            .await
    }

    pub fn log_interpreter(&self, log: &str) -> Option<InterpretedLog> {
        deploy_log_interpreter(log)
    }
}

#[async_trait]
impl GoalExecutor for LocalDeployer {
    async fn execute(&self, invocation: &GoalInvocation<'_>) -> Result<ExecuteGoalResult> {
        let push = invocation.push;
        let key = deployment_key(&push.id)?;
        let outcome = self
            .deploy(&*push.project, &key, invocation.progress_log.clone())
            .await?;
        match outcome {
            DeployOutcome::Deployed(deployment) => {
                Ok(ExecuteGoalResult::success().with_target_url(deployment.endpoint))
            }
            DeployOutcome::Cancelled => {
                info!(key = %key, "deploy cancelled");
                Ok(ExecuteGoalResult::failure(format!("Deploy of {key} was cancelled")))
            }
            DeployOutcome::Failed {
                message,
                interpreted,
                ..
            } => {
                let mut notice = format!("Deploy of {key} failed: {message}");
                if let Some(interpreted) = &interpreted {
                    notice.push_str(&format!(
                        "\n{}\n{}",
                        interpreted.message, interpreted.relevant_part
                    ));
                }
                if let Err(e) = push.channels.send(&notice, &Destination::RepoChannels).await {
                    warn!(err = %e, "failed to send deploy failure notice");
                }
                let mut result = ExecuteGoalResult::failure(message);
                result.target_url = invocation.progress_log.url();
                Ok(result)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maven_command_fills_port_and_context_root() {
        let key = ManagedDeploymentKey::new("acme", "shop", "main");
        let command = CommandSpec::maven_spring_boot().render(&key, 8081);
        assert_eq!(
            command.to_string(),
            "mvn spring-boot:run -Dserver.port=8081 -Dserver.contextPath=/acme/shop/main"
        );
    }

    #[test]
    fn key_requires_a_branch() {
        let id = RepoRef::new("acme", "shop", "abc123");
        let err = deployment_key(&id).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeliveryError>(),
            Some(DeliveryError::MissingBranch { key }) if key == "acme/shop"
        ));

        let key = deployment_key(&id.with_branch("main")).expect("key");
        assert_eq!(key.branch, "main");
    }

    #[test]
    fn options_from_config_trim_trailing_slash() {
        let mut config = DeliveryConfig::default();
        config.deploy.base_url = "http://localhost/".to_string();
        let options =
            LocalDeployerOptions::from_config(&config, CommandSpec::maven_spring_boot())
                .expect("options");
        assert_eq!(options.base_url, "http://localhost");
        assert_eq!(options.success_patterns.len(), 1);
    }

    #[test]
    fn startup_wait_defaults_to_goal_timeout() {
        let mut config = DeliveryConfig::default();
        let options =
            LocalDeployerOptions::from_config(&config, CommandSpec::maven_spring_boot())
                .expect("options");
        assert_eq!(options.startup_timeout, Some(Duration::from_millis(600_000)));

        config.deploy.startup_timeout_ms = Some(45_000);
        let options =
            LocalDeployerOptions::from_config(&config, CommandSpec::maven_spring_boot())
                .expect("options");
        assert_eq!(options.startup_timeout, Some(Duration::from_secs(45)));
    }
}
