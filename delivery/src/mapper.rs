//! Goal implementation registry.
//!
//! Bindings are appended during setup and consulted per push. Lookup by goal
//! record must find exactly one implementation; lookup by push returns the
//! first binding, in registration order, whose push test passes.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::core::goal::{FulfillmentRecord, Goal, GoalIdentity};
use crate::core::push::{GoalInvocation, PushInvocation};
use crate::core::push_test::PushTestRef;
use crate::core::types::{ExecuteGoalResult, GoalRecord, environments_equivalent};
use crate::error::DeliveryError;

/// Does the work of a goal for one push.
#[async_trait]
pub trait GoalExecutor: Send + Sync {
    async fn execute(&self, invocation: &GoalInvocation<'_>) -> Result<ExecuteGoalResult>;
}

/// Hook run after a goal has been fulfilled.
#[async_trait]
pub trait FulfillmentCallback: Send + Sync {
    async fn on_fulfilled(&self, record: &GoalRecord, invocation: &GoalInvocation<'_>)
    -> Result<()>;
}

#[derive(Clone)]
pub struct GoalImplementation {
    pub goal: GoalIdentity,
    /// Unique per goal and environment; matched against goal records.
    pub implementation_name: String,
    pub push_test: PushTestRef,
    pub executor: Arc<dyn GoalExecutor>,
}

/// A goal fulfilled outside this process.
#[derive(Clone)]
pub struct GoalSideEffect {
    pub goal: GoalIdentity,
    pub side_effect_name: String,
    pub push_test: PushTestRef,
}

#[derive(Clone)]
pub struct GoalFulfillmentCallback {
    pub goal: GoalIdentity,
    pub callback: Arc<dyn FulfillmentCallback>,
}

/// How a goal will be fulfilled for a particular push.
#[derive(Clone)]
pub enum Fulfillment {
    Implementation(GoalImplementation),
    SideEffect(GoalSideEffect),
}

impl Fulfillment {
    pub fn name(&self) -> &str {
        match self {
            Fulfillment::Implementation(implementation) => &implementation.implementation_name,
            Fulfillment::SideEffect(side_effect) => &side_effect.side_effect_name,
        }
    }
}

impl fmt::Debug for GoalImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoalImplementation")
            .field("goal", &self.goal)
            .field("implementation_name", &self.implementation_name)
            .field("push_test", &self.push_test.name())
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for GoalSideEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoalSideEffect")
            .field("goal", &self.goal)
            .field("side_effect_name", &self.side_effect_name)
            .field("push_test", &self.push_test.name())
            .finish()
    }
}

impl fmt::Debug for GoalFulfillmentCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoalFulfillmentCallback")
            .field("goal", &self.goal)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for Fulfillment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fulfillment::Implementation(implementation) => fmt::Debug::fmt(implementation, f),
            Fulfillment::SideEffect(side_effect) => fmt::Debug::fmt(side_effect, f),
        }
    }
}

#[derive(Debug, Default)]
pub struct GoalImplementationMapper {
    implementations: Vec<GoalImplementation>,
    side_effects: Vec<GoalSideEffect>,
    callbacks: Vec<GoalFulfillmentCallback>,
}

impl GoalImplementationMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// No uniqueness check here; duplicates surface on lookup.
    pub fn add_implementation(&mut self, implementation: GoalImplementation) -> &mut Self {
        self.implementations.push(implementation);
        self
    }

    pub fn add_side_effect(&mut self, side_effect: GoalSideEffect) -> &mut Self {
        self.side_effects.push(side_effect);
        self
    }

    pub fn add_fulfillment_callback(&mut self, callback: GoalFulfillmentCallback) -> &mut Self {
        self.callbacks.push(callback);
        self
    }

    /// Register every fulfillment a goal carries.
    pub fn add_goal(&mut self, goal: &Goal) -> &mut Self {
        for record in goal.fulfillments() {
            match record {
                FulfillmentRecord::Implementation {
                    name,
                    push_test,
                    executor,
                } => {
                    self.add_implementation(GoalImplementation {
                        goal: goal.identity().clone(),
                        implementation_name: name.clone(),
                        push_test: push_test.clone(),
                        executor: executor.clone(),
                    });
                }
                FulfillmentRecord::SideEffect { name, push_test } => {
                    self.add_side_effect(GoalSideEffect {
                        goal: goal.identity().clone(),
                        side_effect_name: name.clone(),
                        push_test: push_test.clone(),
                    });
                }
                FulfillmentRecord::Callback { callback } => {
                    self.add_fulfillment_callback(GoalFulfillmentCallback {
                        goal: goal.identity().clone(),
                        callback: callback.clone(),
                    });
                }
            }
        }
        self
    }

    pub fn implementations(&self) -> &[GoalImplementation] {
        &self.implementations
    }

    pub fn side_effects(&self) -> &[GoalSideEffect] {
        &self.side_effects
    }

    /// Find the one implementation a stored goal record refers to.
    ///
    /// Zero or several matches mean the machine was wired up wrongly; both
    /// are [`DeliveryError`] configuration errors.
    pub fn find_implementation_by_goal_record(
        &self,
        record: &GoalRecord,
    ) -> Result<&GoalImplementation> {
        let matches: Vec<&GoalImplementation> = self
            .implementations
            .iter()
            .filter(|i| {
                i.implementation_name == record.fulfillment.name
                    && i.goal.context() == record.external_key
            })
            .collect();
        match matches.as_slice() {
            [only] => Ok(*only),
            [] => Err(DeliveryError::NoImplementation {
                name: record.fulfillment.name.clone(),
                context: record.external_key.clone(),
            }
            .into()),
            many => Err(DeliveryError::MultipleImplementations {
                name: record.fulfillment.name.clone(),
                context: record.external_key.clone(),
                count: many.len(),
            }
            .into()),
        }
    }

    /// First implementation whose push test passes, else the first such
    /// side effect, else `None`.
    #[instrument(skip_all, fields(goal = %goal, repo = %push.id))]
    pub async fn find_fulfillment_by_push(
        &self,
        goal: &GoalIdentity,
        push: &PushInvocation,
    ) -> Result<Option<Fulfillment>> {
        let same_goal = |candidate: &GoalIdentity| {
            candidate.name == goal.name && candidate.environment == goal.environment
        };

        for implementation in self.implementations.iter().filter(|i| same_goal(&i.goal)) {
            if implementation.push_test.test(push).await? {
                debug!(
                    implementation = %implementation.implementation_name,
                    "implementation selected"
                );
                return Ok(Some(Fulfillment::Implementation(implementation.clone())));
            }
        }
        for side_effect in self.side_effects.iter().filter(|s| same_goal(&s.goal)) {
            if side_effect.push_test.test(push).await? {
                debug!(side_effect = %side_effect.side_effect_name, "side effect selected");
                return Ok(Some(Fulfillment::SideEffect(side_effect.clone())));
            }
        }
        debug!("no fulfillment applies");
        Ok(None)
    }

    /// Callbacks registered for the record's goal. A callback registered
    /// under `"env/"` also matches records stored with `"env"`.
    pub fn find_fulfillment_callbacks_for_goal(
        &self,
        record: &GoalRecord,
    ) -> Vec<&GoalFulfillmentCallback> {
        self.callbacks
            .iter()
            .filter(|c| {
                c.goal.name == record.name
                    && environments_equivalent(&c.goal.environment, &record.environment)
            })
            .collect()
    }
}
