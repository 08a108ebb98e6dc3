//! Fleet controller loop

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::config::{FleetConfig, FleetConfigError};
use super::provisioner::Provisioner;
use crate::persistence::{StoreError, TaskStore};
use crate::registry::{Node, NodeRegistry};

/// Inputs to one scaling decision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FleetSnapshot {
    /// Queued tasks of decomposed jobs
    pub pending: u64,
    /// Fleet nodes currently in the registry (local workers excluded)
    pub live_nodes: usize,
    /// Requested nodes that have not heartbeated yet
    pub provisioning: usize,
    /// Live nodes already asked to terminate
    pub terminating: usize,
}

impl FleetSnapshot {
    /// Nodes the fleet will have once in-flight commands settle
    pub fn fleet_size(&self) -> usize {
        (self.live_nodes + self.provisioning).saturating_sub(self.terminating)
    }
}

/// What the policy asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    ScaleUp,
    ScaleDown,
    Hold,
}

/// Scaling policy: one step at a time, nothing inside the hysteresis band
pub fn decide(config: &FleetConfig, snapshot: &FleetSnapshot) -> ScaleDecision {
    let fleet = snapshot.fleet_size();
    if snapshot.pending > config.scale_up_threshold && fleet < config.max_instances {
        ScaleDecision::ScaleUp
    } else if snapshot.pending < config.scale_down_threshold && fleet > config.min_instances {
        ScaleDecision::ScaleDown
    } else {
        ScaleDecision::Hold
    }
}

/// What a tick actually did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleAction {
    None,
    Provisioned { node_id: String },
    Terminated { node_id: String },
    ProvisionFailed { error: String },
    TerminateFailed { node_id: String, error: String },
}

/// Result of one controller tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub snapshot: FleetSnapshot,
    pub pruned: Vec<String>,
    pub action: ScaleAction,
}

/// Sizes the worker fleet to the backlog
///
/// Requested nodes count toward the fleet until they heartbeat or
/// `provision_grace` passes, so consecutive ticks never overshoot
/// `max_instances`. Nodes asked to terminate stop counting immediately.
/// Local workers ([`Node::is_local`]) are invisible to the controller.
pub struct FleetController {
    config: FleetConfig,
    store: Arc<dyn TaskStore>,
    registry: Arc<dyn NodeRegistry>,
    provisioner: Arc<dyn Provisioner>,
    provisioning: Mutex<HashMap<String, Instant>>,
    terminating: Mutex<HashMap<String, Instant>>,
}

impl FleetController {
    pub fn new(
        config: FleetConfig,
        store: Arc<dyn TaskStore>,
        registry: Arc<dyn NodeRegistry>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Result<Self, FleetConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            registry,
            provisioner,
            provisioning: Mutex::new(HashMap::new()),
            terminating: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Prune, measure, and issue at most one scaling command
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickReport, StoreError> {
        let pruned = self.registry.prune(self.config.node_timeout).await;
        let nodes = self.registry.list_nodes().await;
        let pending = self.store.count_pending().await?;
        let nodes: Vec<Node> = nodes.into_iter().filter(|n| !n.is_local()).collect();

        let snapshot = self.reconcile(&nodes, pending);
        let action = match decide(&self.config, &snapshot) {
            ScaleDecision::Hold => ScaleAction::None,
            ScaleDecision::ScaleUp => self.scale_up().await,
            ScaleDecision::ScaleDown => match self.pick_victim(&nodes) {
                Some(node_id) => self.scale_down(node_id).await,
                None => ScaleAction::None,
            },
        };

        debug!(
            pending = snapshot.pending,
            live = snapshot.live_nodes,
            provisioning = snapshot.provisioning,
            terminating = snapshot.terminating,
            ?action,
            "fleet tick"
        );
        Ok(TickReport {
            snapshot,
            pruned,
            action,
        })
    }

    /// Run `tick` every `tick_interval` until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            min = self.config.min_instances,
            max = self.config.max_instances,
            up = self.config.scale_up_threshold,
            down = self.config.scale_down_threshold,
            "Starting fleet controller"
        );
        let mut ticker = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Fleet tick failed: {}", e);
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("Fleet controller: shutdown requested");
                    break;
                }
            }
        }
    }

    /// Settle outstanding commands against what the registry shows
    fn reconcile(&self, nodes: &[Node], pending: u64) -> FleetSnapshot {
        let live: HashSet<&str> = nodes.iter().map(|n| n.node_id.as_str()).collect();
        let grace = self.config.provision_grace;

        let mut provisioning = self.provisioning.lock();
        provisioning.retain(|node_id, requested| {
            if live.contains(node_id.as_str()) {
                info!(%node_id, "provisioned node is live");
                false
            } else if requested.elapsed() > grace {
                warn!(%node_id, "provisioned node never heartbeated");
                false
            } else {
                true
            }
        });

        let mut terminating = self.terminating.lock();
        terminating.retain(|node_id, requested| {
            if !live.contains(node_id.as_str()) {
                false
            } else if requested.elapsed() > grace {
                warn!(%node_id, "terminated node is still heartbeating");
                false
            } else {
                true
            }
        });

        FleetSnapshot {
            pending,
            live_nodes: nodes.len(),
            provisioning: provisioning.len(),
            terminating: terminating.len(),
        }
    }

    /// Least-loaded live node not already terminating, ties by id
    fn pick_victim(&self, nodes: &[Node]) -> Option<String> {
        let terminating = self.terminating.lock();
        nodes
            .iter()
            .filter(|n| !terminating.contains_key(&n.node_id))
            .min_by(|a, b| {
                a.load()
                    .total_cmp(&b.load())
                    .then_with(|| a.node_id.cmp(&b.node_id))
            })
            .map(|n| n.node_id.clone())
    }

    async fn scale_up(&self) -> ScaleAction {
        match self.provisioner.provision().await {
            Ok(node_id) => {
                info!(%node_id, "requested new node");
                self.provisioning
                    .lock()
                    .insert(node_id.clone(), Instant::now());
                ScaleAction::Provisioned { node_id }
            }
            Err(e) => {
                error!("Failed to provision node: {}", e);
                ScaleAction::ProvisionFailed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn scale_down(&self, node_id: String) -> ScaleAction {
        match self.provisioner.terminate(&node_id).await {
            Ok(()) => {
                info!(%node_id, "requested node termination");
                self.terminating
                    .lock()
                    .insert(node_id.clone(), Instant::now());
                ScaleAction::Terminated { node_id }
            }
            Err(e) => {
                error!(%node_id, "Failed to terminate node: {}", e);
                ScaleAction::TerminateFailed {
                    node_id,
                    error: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decide_thresholds_are_strict() {
        let config = FleetConfig::default();
        let at = |pending, live| FleetSnapshot {
            pending,
            live_nodes: live,
            ..Default::default()
        };

        assert_eq!(decide(&config, &at(51, 0)), ScaleDecision::ScaleUp);
        assert_eq!(decide(&config, &at(50, 0)), ScaleDecision::Hold);
        assert_eq!(decide(&config, &at(10, 3)), ScaleDecision::Hold);
        assert_eq!(decide(&config, &at(9, 3)), ScaleDecision::ScaleDown);
        assert_eq!(decide(&config, &at(9, 0)), ScaleDecision::Hold);
        assert_eq!(decide(&config, &at(1000, 6)), ScaleDecision::Hold);
    }

    #[test]
    fn test_fleet_size_counts_outstanding_commands() {
        let snapshot = FleetSnapshot {
            pending: 0,
            live_nodes: 3,
            provisioning: 2,
            terminating: 1,
        };
        assert_eq!(snapshot.fleet_size(), 4);
    }
}
