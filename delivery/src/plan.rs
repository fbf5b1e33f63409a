//! From a push to executed goals.
//!
//! [`plan_goals`] picks the goal set for a push and resolves a fulfillment
//! for each goal. [`execute_plan`] runs the planned implementations in goal
//! order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::context::DeliveryContext;
use crate::core::decision_tree::PushMapping;
use crate::core::goal::{Goal, GoalIdentity};
use crate::core::push::{GoalInvocation, PushInvocation};
use crate::core::types::{ExecuteGoalResult, FulfillmentMethod, FulfillmentRef, GoalRecord};
use crate::io::channels::Destination;
use crate::io::progress_log::{
    DEFAULT_MEMORY_LIMIT, EphemeralProgressLog, FileProgressLog, ProgressLog,
};
use crate::mapper::Fulfillment;

#[derive(Debug, Clone)]
pub struct PlannedGoal {
    pub goal: Goal,
    /// `None` when no implementation or side effect applies to this push.
    pub fulfillment: Option<Fulfillment>,
}

#[derive(Debug, Clone)]
pub struct PushPlan {
    /// Name of the goal set the rules chose.
    pub goals_name: String,
    pub goals: Vec<PlannedGoal>,
}

/// Choose goals for `push` and resolve how each will be fulfilled.
///
/// `Ok(None)` when no goal rule matches the push.
#[instrument(skip_all, fields(repo = %push.id))]
pub async fn plan_goals(ctx: &DeliveryContext, push: &PushInvocation) -> Result<Option<PushPlan>> {
    let Some(goals) = ctx.goal_rules().value_for_push(push).await? else {
        info!("no goal rule matched");
        return Ok(None);
    };
    let mut planned = Vec::with_capacity(goals.goals.len());
    for goal in goals.goals {
        let fulfillment = ctx
            .mapper()
            .find_fulfillment_by_push(goal.identity(), push)
            .await?;
        debug!(
            goal = %goal.identity(),
            fulfillment = fulfillment.as_ref().map(Fulfillment::name),
            "planned goal"
        );
        planned.push(PlannedGoal { goal, fulfillment });
    }
    Ok(Some(PushPlan {
        goals_name: goals.name,
        goals: planned,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalStatus {
    Success,
    Failure,
    /// Not run: no fulfillment applied, or a dependency did not succeed.
    Skipped,
    /// Fulfilled by a side effect outside this process.
    External,
}

#[derive(Debug, Clone)]
pub struct GoalOutcome {
    pub goal: GoalIdentity,
    pub status: GoalStatus,
    pub result: Option<ExecuteGoalResult>,
    pub reason: Option<String>,
    pub log: String,
}

/// Creates the progress log for one goal.
pub type LogFactory = dyn Fn(&GoalIdentity) -> Result<Arc<dyn ProgressLog>> + Send + Sync;

/// In-memory logs capped at [`DEFAULT_MEMORY_LIMIT`]. A deployed service
/// keeps writing to its goal's log after the goal has finished.
pub fn ephemeral_logs(goal: &GoalIdentity) -> Result<Arc<dyn ProgressLog>> {
    Ok(Arc::new(EphemeralProgressLog::bounded(
        goal.context(),
        DEFAULT_MEMORY_LIMIT,
    )))
}

/// One log file per goal under `dir`, named after the goal's unique name.
pub fn file_logs(
    dir: impl Into<PathBuf>,
) -> impl Fn(&GoalIdentity) -> Result<Arc<dyn ProgressLog>> + Send + Sync {
    let dir = dir.into();
    move |goal: &GoalIdentity| {
        let file_name = format!("{}.log", goal.unique_name.replace('/', "_"));
        let log = FileProgressLog::create(goal.context(), &dir.join(file_name))?;
        Ok(Arc::new(log) as Arc<dyn ProgressLog>)
    }
}

/// Run every planned goal in order.
///
/// A failing goal does not stop the plan; goals depending on it are
/// skipped. An executor that returns `Err` is recorded as a failure of its
/// goal and reported to the repository's channels. Only a failure to create
/// a progress log aborts the run.
#[instrument(skip_all, fields(repo = %push.id, goals = %plan.goals_name))]
pub async fn execute_plan(
    ctx: &DeliveryContext,
    push: &PushInvocation,
    plan: &PushPlan,
    logs: &LogFactory,
) -> Result<Vec<GoalOutcome>> {
    let mut statuses: HashMap<GoalIdentity, GoalStatus> = HashMap::new();
    let mut outcomes = Vec::with_capacity(plan.goals.len());

    for planned in &plan.goals {
        let identity = planned.goal.identity();
        let blocked = planned.goal.dependencies().iter().find(|dep| {
            matches!(
                statuses.get(*dep),
                Some(GoalStatus::Failure | GoalStatus::Skipped)
            )
        });
        let outcome = if let Some(dep) = blocked {
            skipped(identity, format!("dependency {dep} did not succeed"))
        } else {
            match &planned.fulfillment {
                None => skipped(identity, "no fulfillment applies".to_string()),
                Some(Fulfillment::SideEffect(side_effect)) => GoalOutcome {
                    goal: identity.clone(),
                    status: GoalStatus::External,
                    result: None,
                    reason: Some(format!("fulfilled by {}", side_effect.side_effect_name)),
                    log: String::new(),
                },
                Some(Fulfillment::Implementation(implementation)) => {
                    let log = logs(identity)?;
                    let invocation = GoalInvocation {
                        push,
                        goal: identity,
                        progress_log: log.clone(),
                    };
                    info!(goal = %identity, implementation = %implementation.implementation_name, "executing goal");
                    match implementation.executor.execute(&invocation).await {
                        Ok(result) if result.is_success() => {
                            run_callbacks(ctx, &implementation.implementation_name, &invocation).await;
                            finished(identity, GoalStatus::Success, result, log.log())
                        }
                        Ok(result) => {
                            warn!(goal = %identity, message = ?result.message, "goal failed");
                            finished(identity, GoalStatus::Failure, result, log.log())
                        }
                        Err(e) => {
                            warn!(goal = %identity, err = %e, "goal executor errored");
                            let notice = format!("Goal {} errored: {e:#}", identity.display_name);
                            if let Err(send_err) =
                                push.channels.send(&notice, &Destination::RepoChannels).await
                            {
                                warn!(err = %send_err, "failed to send goal error notice");
                            }
                            let result = ExecuteGoalResult::failure(format!("{e:#}"));
                            finished(identity, GoalStatus::Failure, result, log.log())
                        }
                    }
                }
            }
        };
        statuses.insert(identity.clone(), outcome.status);
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

fn skipped(goal: &GoalIdentity, reason: String) -> GoalOutcome {
    debug!(goal = %goal, reason = %reason, "goal skipped");
    GoalOutcome {
        goal: goal.clone(),
        status: GoalStatus::Skipped,
        result: None,
        reason: Some(reason),
        log: String::new(),
    }
}

fn finished(
    goal: &GoalIdentity,
    status: GoalStatus,
    result: ExecuteGoalResult,
    log: String,
) -> GoalOutcome {
    GoalOutcome {
        goal: goal.clone(),
        status,
        reason: result.message.clone(),
        result: Some(result),
        log,
    }
}

async fn run_callbacks(ctx: &DeliveryContext, implementation: &str, invocation: &GoalInvocation<'_>) {
    let goal = invocation.goal;
    let record = GoalRecord {
        name: goal.name.clone(),
        environment: goal.environment.clone(),
        external_key: goal.context(),
        fulfillment: FulfillmentRef {
            name: implementation.to_string(),
            method: FulfillmentMethod::Sdm,
        },
    };
    for registration in ctx.mapper().find_fulfillment_callbacks_for_goal(&record) {
        if let Err(e) = registration.callback.on_fulfilled(&record, invocation).await {
            warn!(goal = %goal, err = %e, "fulfillment callback failed");
        }
    }
}
