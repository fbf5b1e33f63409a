//! Goals and the fulfillments bound to them.
//!
//! A [`Goal`] is one value type for every kind of delivery work. What makes
//! a build goal different from a deploy goal is the list of
//! [`FulfillmentRecord`]s it carries, not its type.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::push_test::{PushTestRef, on_any_push};
use crate::mapper::{FulfillmentCallback, GoalExecutor};

/// Identity of a goal. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalIdentity {
    pub name: String,
    pub environment: String,
    pub unique_name: String,
    pub display_name: String,
}

impl GoalIdentity {
    /// External key used by goal records, e.g. `sdm/0-code/build`.
    pub fn context(&self) -> String {
        format!("sdm/{}{}", self.environment, self.unique_name)
    }
}

impl fmt::Display for GoalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.environment, self.unique_name)
    }
}

/// One way a goal can be fulfilled.
#[derive(Clone)]
pub enum FulfillmentRecord {
    Implementation {
        name: String,
        push_test: PushTestRef,
        executor: Arc<dyn GoalExecutor>,
    },
    /// Fulfilled by something outside this process.
    SideEffect { name: String, push_test: PushTestRef },
    Callback {
        callback: Arc<dyn FulfillmentCallback>,
    },
}

impl fmt::Debug for FulfillmentRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FulfillmentRecord::Implementation {
                name, push_test, ..
            } => f
                .debug_struct("Implementation")
                .field("name", name)
                .field("push_test", &push_test.name())
                .finish(),
            FulfillmentRecord::SideEffect { name, push_test } => f
                .debug_struct("SideEffect")
                .field("name", name)
                .field("push_test", &push_test.name())
                .finish(),
            FulfillmentRecord::Callback { .. } => f.debug_struct("Callback").finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Goal {
    identity: GoalIdentity,
    depends_on: Vec<GoalIdentity>,
    fulfillments: Vec<FulfillmentRecord>,
}

impl Goal {
    /// Create a goal whose name and display name default to `unique_name`.
    pub fn new(unique_name: impl Into<String>, environment: impl Into<String>) -> Self {
        let unique_name = unique_name.into();
        Self {
            identity: GoalIdentity {
                name: unique_name.clone(),
                environment: environment.into(),
                display_name: unique_name.clone(),
                unique_name,
            },
            depends_on: Vec::new(),
            fulfillments: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.identity.name = name.into();
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.identity.display_name = display_name.into();
        self
    }

    pub fn depends_on(mut self, goals: &[&Goal]) -> Self {
        self.depends_on
            .extend(goals.iter().map(|goal| goal.identity.clone()));
        self
    }

    /// Bind an executor that applies to every push.
    pub fn with_implementation(
        self,
        name: impl Into<String>,
        executor: Arc<dyn GoalExecutor>,
    ) -> Self {
        self.with_implementation_when(name, on_any_push(), executor)
    }

    pub fn with_implementation_when(
        mut self,
        name: impl Into<String>,
        push_test: PushTestRef,
        executor: Arc<dyn GoalExecutor>,
    ) -> Self {
        self.fulfillments.push(FulfillmentRecord::Implementation {
            name: name.into(),
            push_test,
            executor,
        });
        self
    }

    pub fn with_side_effect(mut self, name: impl Into<String>, push_test: PushTestRef) -> Self {
        self.fulfillments.push(FulfillmentRecord::SideEffect {
            name: name.into(),
            push_test,
        });
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn FulfillmentCallback>) -> Self {
        self.fulfillments
            .push(FulfillmentRecord::Callback { callback });
        self
    }

    pub fn identity(&self) -> &GoalIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn environment(&self) -> &str {
        &self.identity.environment
    }

    pub fn unique_name(&self) -> &str {
        &self.identity.unique_name
    }

    pub fn display_name(&self) -> &str {
        &self.identity.display_name
    }

    pub fn context(&self) -> String {
        self.identity.context()
    }

    pub fn dependencies(&self) -> &[GoalIdentity] {
        &self.depends_on
    }

    pub fn fulfillments(&self) -> &[FulfillmentRecord] {
        &self.fulfillments
    }
}

/// Named, ordered set of goals chosen for a push.
#[derive(Debug, Clone)]
pub struct Goals {
    pub name: String,
    pub goals: Vec<Goal>,
}

impl Goals {
    pub fn new(name: impl Into<String>, goals: Vec<Goal>) -> Self {
        Self {
            name: name.into(),
            goals,
        }
    }

    /// Explicitly nothing to do for this push.
    pub fn none() -> Self {
        Self::new("No goals", Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::push_test::always;
    use crate::core::types::INDEPENDENT_OF_ENVIRONMENT;

    #[test]
    fn context_joins_environment_and_unique_name() {
        let goal = Goal::new("build", INDEPENDENT_OF_ENVIRONMENT);
        assert_eq!(goal.context(), "sdm/0-code/build");
        assert_eq!(goal.name(), "build");
        assert_eq!(goal.display_name(), "build");
    }

    #[test]
    fn dependencies_keep_declaration_order() {
        let build = Goal::new("build", INDEPENDENT_OF_ENVIRONMENT);
        let test = Goal::new("test", INDEPENDENT_OF_ENVIRONMENT);
        let deploy = Goal::new("deploy", "1-staging/").depends_on(&[&build, &test]);

        let names: Vec<&str> = deploy
            .dependencies()
            .iter()
            .map(|g| g.unique_name.as_str())
            .collect();
        assert_eq!(names, vec!["build", "test"]);
    }

    #[test]
    fn fulfillments_are_tagged_by_kind() {
        let goal = Goal::new("lint", INDEPENDENT_OF_ENVIRONMENT)
            .with_side_effect("external-lint", always(true));
        assert!(matches!(
            goal.fulfillments(),
            [FulfillmentRecord::SideEffect { name, .. }] if name == "external-lint"
        ));
    }
}
