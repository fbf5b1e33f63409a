//! Outbound notification boundary.
//!
//! Message formatting and delivery belong to the surrounding orchestrator;
//! executors only hand a message and a destination to an [`AddressChannels`].

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

/// Where a message should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Channels linked to the pushed repository.
    RepoChannels,
    Channel(String),
    User(String),
}

#[async_trait]
pub trait AddressChannels: Send + Sync {
    async fn send(&self, message: &str, destination: &Destination) -> Result<()>;
}

/// Writes messages to the tracing log. Used when no chat integration is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingChannels;

#[async_trait]
impl AddressChannels for TracingChannels {
    async fn send(&self, message: &str, destination: &Destination) -> Result<()> {
        info!(?destination, message, "notification");
        Ok(())
    }
}
