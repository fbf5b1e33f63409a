//! The delivery machine's wiring, built once and passed by reference.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::build::LocalBuilder;
use crate::core::decision_tree::{PushMappingRef, PushRules};
use crate::core::goal::{Goal, Goals};
use crate::deploy::{CommandSpec, LocalDeployer, LocalDeployerOptions, ManagedDeployments};
use crate::io::config::DeliveryConfig;
use crate::mapper::GoalImplementationMapper;

/// Something that knows how to add itself to a [`DeliveryContext`]:
/// a bundle of goals, rules and implementations registered together.
pub trait Registrable {
    fn name(&self) -> &str;

    fn register(&self, ctx: &mut DeliveryContext) -> Result<()>;
}

pub struct DeliveryContext {
    config: DeliveryConfig,
    mapper: GoalImplementationMapper,
    goal_rules: PushRules<Goals>,
    deployments: Arc<ManagedDeployments>,
}

impl fmt::Debug for DeliveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryContext")
            .field("config", &self.config)
            .field("mapper", &self.mapper)
            .field("goal_rules", &self.goal_rules.len())
            .finish_non_exhaustive()
    }
}

fn empty_rules() -> PushRules<Goals> {
    PushRules::new("goal rules", Vec::new())
}

impl DeliveryContext {
    pub fn create(config: DeliveryConfig) -> Result<Self> {
        config.validate().context("validate delivery config")?;
        let deployments = Arc::new(ManagedDeployments::new(
            config.deploy.lower_port,
            config.deploy.terminate_grace(),
        ));
        Ok(Self {
            config,
            mapper: GoalImplementationMapper::new(),
            goal_rules: empty_rules(),
            deployments,
        })
    }

    /// Stop every local deployment and drop all registrations.
    ///
    /// Deployers created earlier keep working against the emptied registry.
    pub async fn reset(&mut self) -> Result<()> {
        self.deployments.reset().await?;
        self.mapper = GoalImplementationMapper::new();
        self.goal_rules = empty_rules();
        info!("delivery context reset");
        Ok(())
    }

    pub fn register(&mut self, registrable: &dyn Registrable) -> Result<&mut Self> {
        debug!(name = registrable.name(), "registering");
        registrable
            .register(self)
            .with_context(|| format!("register {}", registrable.name()))?;
        Ok(self)
    }

    /// Append a rule choosing the goal set for a push. Earlier rules win.
    pub fn add_goal_rule(&mut self, rule: PushMappingRef<Goals>) -> &mut Self {
        self.goal_rules.add(rule);
        self
    }

    /// Register the fulfillments carried by `goal`.
    pub fn add_goal(&mut self, goal: &Goal) -> &mut Self {
        self.mapper.add_goal(goal);
        self
    }

    pub fn add_goals(&mut self, goals: &Goals) -> &mut Self {
        for goal in &goals.goals {
            self.mapper.add_goal(goal);
        }
        self
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn mapper(&self) -> &GoalImplementationMapper {
        &self.mapper
    }

    pub fn mapper_mut(&mut self) -> &mut GoalImplementationMapper {
        &mut self.mapper
    }

    pub fn goal_rules(&self) -> &PushRules<Goals> {
        &self.goal_rules
    }

    pub fn deployments(&self) -> &Arc<ManagedDeployments> {
        &self.deployments
    }

    /// A deployer sharing this context's deployment registry.
    pub fn local_deployer(&self, command: CommandSpec) -> Result<LocalDeployer> {
        let options = LocalDeployerOptions::from_config(&self.config, command)?;
        Ok(LocalDeployer::new(self.deployments.clone(), options))
    }

    /// The npm builder with this context's command timeout.
    pub fn npm_builder(&self) -> LocalBuilder {
        LocalBuilder::npm().with_timeout(self.config.goal_timeout())
    }
}
