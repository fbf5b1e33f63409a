//! Build a project in place by running a fixed sequence of commands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::core::log_interpreter::{
    InterpretedLog, LogInterpreter, build_log_interpreter, short_log_interpreter,
};
use crate::core::push::GoalInvocation;
use crate::core::types::ExecuteGoalResult;
use crate::io::channels::Destination;
use crate::io::process::{
    ErrorFinder, ProcessResult, SpawnCommand, SpawnOptions, default_error_finder, spawn_and_watch,
};
use crate::io::progress_log::ProgressLog;
use crate::io::project::Project;
use crate::mapper::GoalExecutor;

/// Name and version of the artifact a build produces.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
}

/// npm prints `ERR!` on failure but some scripts still exit with zero.
pub fn npm_error_finder(code: Option<i32>, signal: Option<i32>, log: &str) -> bool {
    default_error_finder(code, signal, log) || log.starts_with("[error]") || log.contains("ERR!")
}

/// Read `name` and `version` from `package.json`, when present.
pub async fn read_package_json(project: &dyn Project) -> Result<Option<AppInfo>> {
    let Some(file) = project.find_file("package.json").await? else {
        return Ok(None);
    };
    let content = file.get_content().await?;
    let info = serde_json::from_str(&content).context("parse package.json")?;
    Ok(Some(info))
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// Result of the last command that ran.
    pub result: ProcessResult,
    /// The command that failed, if one did.
    pub failed_command: Option<SpawnCommand>,
    pub app_info: Option<AppInfo>,
    pub interpreted: Option<InterpretedLog>,
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        self.failed_command.is_none()
    }
}

/// Runs build commands one after another in the project directory,
/// stopping at the first one that fails.
pub struct LocalBuilder {
    name: String,
    commands: Vec<SpawnCommand>,
    options: SpawnOptions,
    interpreter: LogInterpreter,
}

impl LocalBuilder {
    pub fn new(name: impl Into<String>, commands: Vec<SpawnCommand>) -> Self {
        Self {
            name: name.into(),
            commands,
            options: SpawnOptions::default(),
            interpreter: short_log_interpreter,
        }
    }

    /// `npm install` followed by `npm run build`.
    pub fn npm() -> Self {
        let mut builder = Self::new(
            "npm",
            vec![
                SpawnCommand::new("npm", ["install"]),
                SpawnCommand::new("npm", ["run", "build"]),
            ],
        );
        builder.options.error_finder = Arc::new(npm_error_finder);
        builder.options.strip_ansi = true;
        builder.interpreter = build_log_interpreter;
        builder
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn with_error_finder(mut self, error_finder: ErrorFinder) -> Self {
        self.options.error_finder = error_finder;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env.push((key.into(), value.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn commands(&self) -> &[SpawnCommand] {
        &self.commands
    }

    /// Run every command, stopping at the first error. A command that
    /// cannot be spawned is an `Err`.
    #[instrument(skip_all, fields(builder = %self.name, dir = %project.base_dir().display()))]
    pub async fn build(&self, project: &dyn Project, log: &dyn ProgressLog) -> Result<BuildOutcome> {
        let app_info = match read_package_json(project).await {
            Ok(info) => info,
            Err(e) => {
                warn!(err = %e, "could not read app info");
                None
            }
        };
        let mut options = self.options.clone();
        options.cwd = Some(project.base_dir().to_path_buf());

        let mut last = ProcessResult {
            error: false,
            code: Some(0),
            signal: None,
            log: String::new(),
            timed_out: false,
        };
        for command in &self.commands {
            info!(command = %command, "running build command");
            last = spawn_and_watch(command, &options, log).await?;
            if last.error {
                info!(command = %command, code = ?last.code, timed_out = last.timed_out, "stopping build after failed command");
                let interpreted = (self.interpreter)(&last.log);
                return Ok(BuildOutcome {
                    result: last,
                    failed_command: Some(command.clone()),
                    app_info,
                    interpreted,
                });
            }
        }
        Ok(BuildOutcome {
            result: last,
            failed_command: None,
            app_info,
            interpreted: None,
        })
    }
}

#[async_trait]
impl GoalExecutor for LocalBuilder {
    async fn execute(&self, invocation: &GoalInvocation<'_>) -> Result<ExecuteGoalResult> {
        let push = invocation.push;
        let outcome = self
            .build(&*push.project, &*invocation.progress_log)
            .await?;
        let Some(failed) = &outcome.failed_command else {
            let mut result = ExecuteGoalResult::success();
            result.target_url = invocation.progress_log.url();
            return Ok(result);
        };

        let message = if outcome.result.timed_out {
            format!("Build command `{failed}` timed out")
        } else {
            format!("Build command `{failed}` failed")
        };
        let mut notice = format!("{message} for {}", push.id);
        if let Some(interpreted) = &outcome.interpreted {
            notice.push_str(&format!(
                "\n{}\n{}",
                interpreted.message, interpreted.relevant_part
            ));
        }
        if let Err(e) = push.channels.send(&notice, &Destination::RepoChannels).await {
            warn!(err = %e, "failed to send build failure notice");
        }
        let mut result = ExecuteGoalResult::failure(message);
        result.target_url = invocation.progress_log.url();
        Ok(result)
    }
}
