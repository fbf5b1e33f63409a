//! Typed failures that cross component boundaries.
//!
//! Everything else (non-zero exits, timeouts, deploys that never became
//! ready) is reported as a value. Callers receive these wrapped in
//! `anyhow::Error` and can recover the variant with `downcast_ref`.

use std::io;

use thiserror::Error;

use crate::core::types::ManagedDeploymentKey;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no implementation found with name '{name}' for context '{context}'")]
    NoImplementation { name: String, context: String },

    #[error("multiple mappings ({count}) for name '{name}' in context '{context}'")]
    MultipleImplementations {
        name: String,
        context: String,
        count: usize,
    },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot deploy {key} locally: branch must be set")]
    MissingBranch { key: String },

    #[error("no free port at or above {lower_port} for {key}")]
    PortsExhausted {
        lower_port: u16,
        key: ManagedDeploymentKey,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DeliveryError {
    /// True for errors caused by how the delivery machine was wired up rather
    /// than by the environment it runs in.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, DeliveryError::Spawn { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_name_the_implementation_and_context() {
        let err = DeliveryError::MultipleImplementations {
            name: "foo".to_string(),
            context: "ctx".to_string(),
            count: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("'foo'"));
        assert!(msg.contains("'ctx'"));
        assert!(err.is_configuration());
    }

    #[test]
    fn spawn_error_is_not_configuration() {
        let err = DeliveryError::Spawn {
            command: "mvn spring-boot:run".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "not found"),
        };
        assert!(!err.is_configuration());
        assert!(err.to_string().contains("mvn spring-boot:run"));
    }
}
