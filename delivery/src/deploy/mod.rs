//! Local deployments: the registry of running services and the deployer
//! that starts them.

pub mod local;
pub mod managed;

pub use local::{CommandSpec, DeployOutcome, LocalDeployer, LocalDeployerOptions, deployment_key};
pub use managed::{DeploymentSlot, Deployment, ManagedDeployment, ManagedDeployments};
