//! Registry of locally running deployments.
//!
//! At most one deployment is live per slot. A slot is identified by the
//! deployment key as seen through a [`LookupStrategy`]: with
//! [`LookupStrategy::Repo`] every branch of a repository shares one slot.
//!
//! Work on one slot is serialized by a per-slot async lock handed out as a
//! [`DeploymentSlot`]. Different slots never wait on each other except for
//! the brief bookkeeping lock around the shared maps.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard, oneshot};
use tracing::{debug, info, instrument};

use crate::core::ports::PortPool;
use crate::core::types::{LookupStrategy, ManagedDeploymentKey};
use crate::error::DeliveryError;
use crate::io::service::RunningService;

/// Where a deployed service can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub endpoint: String,
    pub port: u16,
    pub pid: Option<u32>,
}

/// A live deployment and the process behind it.
#[derive(Debug)]
pub struct ManagedDeployment {
    key: ManagedDeploymentKey,
    lookup_strategy: LookupStrategy,
    deployment: Deployment,
    process: Mutex<Option<RunningService>>,
}

impl ManagedDeployment {
    pub fn new(
        key: ManagedDeploymentKey,
        lookup_strategy: LookupStrategy,
        deployment: Deployment,
        process: RunningService,
    ) -> Self {
        Self {
            key,
            lookup_strategy,
            deployment,
            process: Mutex::new(Some(process)),
        }
    }

    pub fn key(&self) -> &ManagedDeploymentKey {
        &self.key
    }

    pub fn lookup_strategy(&self) -> LookupStrategy {
        self.lookup_strategy
    }

    pub fn port(&self) -> u16 {
        self.deployment.port
    }

    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    /// False once the process has been terminated or exited on its own.
    pub async fn is_running(&self) -> bool {
        let mut process = self.process.lock().await;
        process.as_mut().is_some_and(RunningService::is_running)
    }

    /// Stop the process and wait for it to exit. Idempotent.
    async fn terminate(&self, grace: Duration) -> Result<()> {
        let process = self.process.lock().await.take();
        if let Some(process) = process {
            info!(key = %self.key, port = self.deployment.port, pid = ?process.pid(), "terminating deployment");
            process.terminate(grace).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SlotKey {
    owner: String,
    repo: String,
    branch: Option<String>,
}

impl SlotKey {
    fn new(key: &ManagedDeploymentKey, strategy: LookupStrategy) -> Self {
        Self {
            owner: key.owner.clone(),
            repo: key.repo.clone(),
            branch: match strategy {
                LookupStrategy::Branch => Some(key.branch.clone()),
                LookupStrategy::Repo => None,
            },
        }
    }
}

#[derive(Debug)]
struct Registry {
    pool: PortPool,
    ports: HashMap<SlotKey, u16>,
    deployments: HashMap<SlotKey, Arc<ManagedDeployment>>,
    starting: HashMap<SlotKey, PendingStart>,
    next_start: u64,
    locks: HashMap<SlotKey, Arc<Mutex<()>>>,
}

/// A service spawned for a slot that has not finished starting.
#[derive(Debug)]
struct PendingStart {
    id: u64,
    key: ManagedDeploymentKey,
    strategy: LookupStrategy,
    cancel: oneshot::Sender<()>,
    /// Resolves once the starting deploy has let go of its process.
    finished: oneshot::Receiver<()>,
}

/// Live local deployments, their ports, and the locks that serialize work
/// on each slot.
#[derive(Debug)]
pub struct ManagedDeployments {
    registry: Mutex<Registry>,
    terminate_grace: Duration,
}

impl ManagedDeployments {
    pub fn new(lower_port: u16, terminate_grace: Duration) -> Self {
        Self {
            registry: Mutex::new(Registry {
                pool: PortPool::new(lower_port),
                ports: HashMap::new(),
                deployments: HashMap::new(),
                starting: HashMap::new(),
                next_start: 0,
                locks: HashMap::new(),
            }),
            terminate_grace,
        }
    }

    /// Lock the slot for `key`. Held until the returned guard is dropped.
    pub async fn slot(
        &self,
        key: &ManagedDeploymentKey,
        strategy: LookupStrategy,
    ) -> DeploymentSlot<'_> {
        let slot_key = SlotKey::new(key, strategy);
        let lock = {
            let mut registry = self.registry.lock().await;
            registry.locks.entry(slot_key.clone()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        DeploymentSlot {
            owner: self,
            key: key.clone(),
            slot_key,
            _guard: guard,
        }
    }

    /// The live record for `key`. Does not wait for work on the slot.
    pub async fn find_deployment(
        &self,
        key: &ManagedDeploymentKey,
        strategy: LookupStrategy,
    ) -> Option<Arc<ManagedDeployment>> {
        let registry = self.registry.lock().await;
        registry
            .deployments
            .get(&SlotKey::new(key, strategy))
            .cloned()
    }

    pub async fn find_port(
        &self,
        key: &ManagedDeploymentKey,
        strategy: LookupStrategy,
    ) -> Result<u16> {
        self.slot(key, strategy).await.find_port().await
    }

    /// Stop the slot's deployment, or abandon a start still in progress.
    pub async fn terminate_if_running(
        &self,
        key: &ManagedDeploymentKey,
        strategy: LookupStrategy,
    ) -> Result<bool> {
        self.slot(key, strategy).await.terminate_if_running().await
    }

    /// Record a deployment, terminating whatever still occupies its slot.
    pub async fn record_deployment(
        &self,
        deployment: ManagedDeployment,
    ) -> Result<Arc<ManagedDeployment>> {
        let key = deployment.key.clone();
        self.slot(&key, deployment.lookup_strategy)
            .await
            .record(deployment)
            .await
    }

    /// Terminate the deployment and give its port back.
    pub async fn undeploy(
        &self,
        key: &ManagedDeploymentKey,
        strategy: LookupStrategy,
    ) -> Result<bool> {
        let terminated = {
            let slot = self.slot(key, strategy).await;
            let terminated = slot.terminate_if_running().await?;
            slot.release_port().await;
            terminated
        };
        self.prune_lock(&SlotKey::new(key, strategy)).await;
        Ok(terminated)
    }

    /// Every recorded deployment.
    pub async fn list(&self) -> Vec<Arc<ManagedDeployment>> {
        let registry = self.registry.lock().await;
        registry.deployments.values().cloned().collect()
    }

    /// Stop every deployment and every start in progress, and release every
    /// port.
    pub async fn terminate_all(&self) -> Result<()> {
        let targets: Vec<(ManagedDeploymentKey, LookupStrategy)> = {
            let registry = self.registry.lock().await;
            registry
                .deployments
                .values()
                .map(|d| (d.key.clone(), d.lookup_strategy))
                .chain(
                    registry
                        .starting
                        .values()
                        .map(|p| (p.key.clone(), p.strategy)),
                )
                .collect()
        };
        for (key, strategy) in targets {
            self.undeploy(&key, strategy).await?;
        }
        Ok(())
    }

    /// Terminate everything and forget all reservations.
    pub async fn reset(&self) -> Result<()> {
        self.terminate_all().await?;
        let mut registry = self.registry.lock().await;
        registry.ports.clear();
        registry.deployments.clear();
        registry.starting.clear();
        registry.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        registry.pool.reset();
        Ok(())
    }

    /// Drop the slot's lock once nobody holds or waits for it.
    async fn prune_lock(&self, slot_key: &SlotKey) {
        let mut registry = self.registry.lock().await;
        if registry
            .locks
            .get(slot_key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            registry.locks.remove(slot_key);
        }
    }

    /// Cancel the slot's start in progress, if any, and wait until the
    /// starting deploy has given up its process.
    async fn cancel_start(&self, slot_key: &SlotKey) -> bool {
        let pending = self.registry.lock().await.starting.remove(slot_key);
        let Some(pending) = pending else {
            return false;
        };
        info!(key = %pending.key, "cancelling service start");
        // The deploy may have finished on its own already; either way the
        // finished channel closes once it lets go.
        let _ = pending.cancel.send(());
        let _ = pending.finished.await;
        true
    }
}

/// Exclusive access to one deployment slot.
pub struct DeploymentSlot<'a> {
    owner: &'a ManagedDeployments,
    key: ManagedDeploymentKey,
    slot_key: SlotKey,
    _guard: OwnedMutexGuard<()>,
}

impl<'a> DeploymentSlot<'a> {
    pub fn key(&self) -> &ManagedDeploymentKey {
        &self.key
    }

    pub async fn find_deployment(&self) -> Option<Arc<ManagedDeployment>> {
        let registry = self.owner.registry.lock().await;
        registry.deployments.get(&self.slot_key).cloned()
    }

    /// The port reserved for this slot, reserving one if needed.
    #[instrument(skip_all, fields(key = %self.key))]
    pub async fn find_port(&self) -> Result<u16> {
        let mut registry = self.owner.registry.lock().await;
        if let Some(port) = registry.ports.get(&self.slot_key) {
            return Ok(*port);
        }
        let in_use: HashSet<u16> = registry.ports.values().copied().collect();
        let port = registry.pool.allocate(&in_use).ok_or_else(|| {
            DeliveryError::PortsExhausted {
                lower_port: registry.pool.lower_bound(),
                key: self.key.clone(),
            }
        })?;
        registry.ports.insert(self.slot_key.clone(), port);
        info!(port, "reserved port");
        Ok(port)
    }

    /// Stop the slot's deployment, if any, and wait for it to exit. A start
    /// still in progress is cancelled first.
    ///
    /// The record is dropped only after the process is gone. The port stays
    /// reserved for the slot.
    #[instrument(skip_all, fields(key = %self.key))]
    pub async fn terminate_if_running(&self) -> Result<bool> {
        let cancelled = self.owner.cancel_start(&self.slot_key).await;
        let Some(current) = self.find_deployment().await else {
            if !cancelled {
                debug!("nothing to terminate");
            }
            return Ok(cancelled);
        };
        current.terminate(self.owner.terminate_grace).await?;
        let mut registry = self.owner.registry.lock().await;
        if registry
            .deployments
            .get(&self.slot_key)
            .is_some_and(|d| Arc::ptr_eq(d, &current))
        {
            registry.deployments.remove(&self.slot_key);
        }
        Ok(true)
    }

    /// Make `deployment` the slot's live record.
    ///
    /// A prior occupant is terminated first, so the new record is never
    /// visible alongside a live predecessor.
    #[instrument(skip_all, fields(key = %self.key, port = deployment.port()))]
    pub async fn record(&self, deployment: ManagedDeployment) -> Result<Arc<ManagedDeployment>> {
        self.terminate_if_running().await?;
        let deployment = Arc::new(deployment);
        let mut registry = self.owner.registry.lock().await;
        registry
            .ports
            .insert(self.slot_key.clone(), deployment.port());
        registry
            .deployments
            .insert(self.slot_key.clone(), deployment.clone());
        info!(endpoint = %deployment.deployment().endpoint, "recorded deployment");
        Ok(deployment)
    }

    /// Announce a service start for this slot, cancelling any earlier one.
    ///
    /// The start runs without the slot lock: drop the slot, wait on
    /// [`StartTicket::cancelled`] alongside the service, then
    /// [`StartTicket::commit`] or [`StartTicket::abandon`].
    pub async fn begin_start(&self) -> StartTicket<'a> {
        self.owner.cancel_start(&self.slot_key).await;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = oneshot::channel();
        let mut registry = self.owner.registry.lock().await;
        registry.next_start += 1;
        let id = registry.next_start;
        registry.starting.insert(
            self.slot_key.clone(),
            PendingStart {
                id,
                key: self.key.clone(),
                strategy: strategy_of(&self.slot_key),
                cancel: cancel_tx,
                finished: finished_rx,
            },
        );
        debug!(id, "service start registered");
        StartTicket {
            owner: self.owner,
            key: self.key.clone(),
            slot_key: self.slot_key.clone(),
            id,
            cancel: Some(cancel_rx),
            _finished: finished_tx,
        }
    }

    async fn release_port(&self) {
        let mut registry = self.owner.registry.lock().await;
        if let Some(port) = registry.ports.remove(&self.slot_key) {
            debug!(port, "released port");
        }
    }
}

fn strategy_of(slot_key: &SlotKey) -> LookupStrategy {
    if slot_key.branch.is_some() {
        LookupStrategy::Branch
    } else {
        LookupStrategy::Repo
    }
}

/// A service start registered with its slot.
///
/// While the ticket lives, [`DeploymentSlot::terminate_if_running`] on the
/// same slot cancels the start and waits for the ticket to be dropped.
pub struct StartTicket<'a> {
    owner: &'a ManagedDeployments,
    key: ManagedDeploymentKey,
    slot_key: SlotKey,
    id: u64,
    cancel: Option<oneshot::Receiver<()>>,
    _finished: oneshot::Sender<()>,
}

impl StartTicket<'_> {
    /// Completes when the start should be abandoned. Call once.
    pub fn cancelled(&mut self) -> impl Future<Output = ()> + Send + 'static {
        let cancel = self.cancel.take();
        async move {
            match cancel {
                // A dropped sender (registry reset) cancels too.
                Some(cancel) => {
                    let _ = cancel.await;
                }
                None => std::future::pending().await,
            }
        }
    }

    /// Make the started service the slot's live record.
    ///
    /// `Ok(None)` when the start was cancelled meanwhile; the service has
    /// then been terminated.
    #[instrument(skip_all, fields(key = %self.key, port = deployment.port()))]
    pub async fn commit(
        self,
        deployment: ManagedDeployment,
    ) -> Result<Option<Arc<ManagedDeployment>>> {
        let deployment = Arc::new(deployment);
        {
            let mut registry = self.owner.registry.lock().await;
            if registry
                .starting
                .get(&self.slot_key)
                .is_some_and(|pending| pending.id == self.id)
            {
                registry.starting.remove(&self.slot_key);
                registry
                    .ports
                    .insert(self.slot_key.clone(), deployment.port());
                registry
                    .deployments
                    .insert(self.slot_key.clone(), deployment.clone());
                info!(endpoint = %deployment.deployment().endpoint, "recorded deployment");
                return Ok(Some(deployment));
            }
        }
        info!("start was cancelled, stopping the service");
        deployment.terminate(self.owner.terminate_grace).await?;
        Ok(None)
    }

    /// Withdraw the start after the service failed to come up.
    pub async fn abandon(self) {
        let mut registry = self.owner.registry.lock().await;
        if registry
            .starting
            .get(&self.slot_key)
            .is_some_and(|pending| pending.id == self.id)
        {
            registry.starting.remove(&self.slot_key);
        }
    }
}
