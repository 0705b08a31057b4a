//! Kubernetes-side collaborators.
//!
//! The core reads cluster objects through [`ClusterSource`] and issues the
//! few writes it needs (taint, untaint, evict) through [`KubeClient`].
//! [`InMemoryCluster`] implements both for tests and the simulator, including
//! PDB accounting and a minimal scheduler that binds pending pods.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::cloudprovider::{CloudProvider, InMemoryCloudProvider};
use crate::error::{AutoscalerError, Result};
use crate::scheduler::Scheduler;
use crate::snapshot::{BasicSnapshot, ClusterSnapshot};
use crate::types::{Node, OwnerKind, Pod, PodDisruptionBudget, PodPhase, Taint, TaintEffect, Workload};

/// Taint placed on nodes selected for deletion.
pub const TO_BE_DELETED_TAINT: &str = "ToBeDeletedByClusterAutoscaler";

/// Builds the deletion taint, valued with the time it was placed.
#[must_use]
pub fn to_be_deleted_taint(now: DateTime<Utc>) -> Taint {
    Taint::new(TO_BE_DELETED_TAINT, now.timestamp().to_string(), TaintEffect::NoSchedule)
}

/// Read-only listers.
pub trait ClusterSource: Send + Sync + fmt::Debug {
    /// Every node.
    ///
    /// # Errors
    ///
    /// Returns an error if the lister cannot be read.
    fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Every pod, scheduled or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the lister cannot be read.
    fn list_pods(&self) -> Result<Vec<Pod>>;

    /// Every pod disruption budget.
    ///
    /// # Errors
    ///
    /// Returns an error if the lister cannot be read.
    fn list_pdbs(&self) -> Result<Vec<PodDisruptionBudget>>;

    /// Every replicated workload controller.
    ///
    /// # Errors
    ///
    /// Returns an error if the lister cannot be read.
    fn list_workloads(&self) -> Result<Vec<Workload>>;
}

/// Writes issued by the autoscaler.
pub trait KubeClient: Send + Sync + 'static {
    /// Adds a taint to a node, replacing one with the same key.
    fn taint_node(&self, node: &str, taint: Taint) -> impl Future<Output = Result<()>> + Send;

    /// Removes every taint with the given key from a node.
    fn untaint_node(&self, node: &str, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Evicts a pod, honouring disruption budgets.
    ///
    /// A budget violation is reported as a transient error so the caller
    /// may retry.
    fn evict_pod(
        &self,
        pod: &Pod,
        grace_period: Duration,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Default)]
struct ClusterState {
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<String, Pod>,
    pdbs: BTreeMap<String, PodDisruptionBudget>,
    pdb_min_available: HashMap<String, u32>,
    workloads: Vec<Workload>,
    evictions: Vec<String>,
    failing_evictions: HashSet<String>,
    replacements: u64,
}

impl ClusterState {
    fn recompute_pdbs(&mut self) {
        for (key, min_available) in &self.pdb_min_available {
            let Some(pdb) = self.pdbs.get_mut(key) else {
                continue;
            };
            let healthy = self
                .pods
                .values()
                .filter(|p| {
                    pdb.matches(p)
                        && p.node_name.is_some()
                        && p.phase == PodPhase::Running
                        && p.deletion_timestamp.is_none()
                })
                .count();
            let healthy = u32::try_from(healthy).unwrap_or(u32::MAX);
            pdb.disruptions_allowed = healthy.saturating_sub(*min_available);
        }
    }
}

/// A cluster kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: RwLock<ClusterState>,
}

impl InMemoryCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a node.
    pub fn add_node(&self, node: Node) {
        self.state.write().nodes.insert(node.name.clone(), node);
    }

    /// Removes a node and the pods bound to it.
    pub fn remove_node(&self, name: &str) -> Option<Node> {
        let mut state = self.state.write();
        state
            .pods
            .retain(|_, p| p.node_name.as_deref() != Some(name));
        let node = state.nodes.remove(name);
        state.recompute_pdbs();
        node
    }

    /// Returns a node.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<Node> {
        self.state.read().nodes.get(name).cloned()
    }

    /// Updates a node in place.
    pub fn update_node(&self, name: &str, f: impl FnOnce(&mut Node)) {
        if let Some(node) = self.state.write().nodes.get_mut(name) {
            f(node);
        }
    }

    /// Adds or replaces a pod.
    pub fn add_pod(&self, pod: Pod) {
        let mut state = self.state.write();
        state.pods.insert(pod.key(), pod);
        state.recompute_pdbs();
    }

    /// Returns a pod.
    #[must_use]
    pub fn pod(&self, key: &str) -> Option<Pod> {
        self.state.read().pods.get(key).cloned()
    }

    /// Adds a budget with a fixed number of allowed disruptions.
    pub fn add_pdb(&self, pdb: PodDisruptionBudget) {
        self.state.write().pdbs.insert(pdb.key(), pdb);
    }

    /// Adds a budget whose allowed disruptions follow the number of healthy pods.
    pub fn add_pdb_min_available(&self, mut pdb: PodDisruptionBudget, min_available: u32) {
        let mut state = self.state.write();
        let key = pdb.key();
        pdb.disruptions_allowed = 0;
        state.pdbs.insert(key.clone(), pdb);
        state.pdb_min_available.insert(key, min_available);
        state.recompute_pdbs();
    }

    /// Returns a budget.
    #[must_use]
    pub fn pdb(&self, key: &str) -> Option<PodDisruptionBudget> {
        self.state.read().pdbs.get(key).cloned()
    }

    /// Adds a workload controller.
    pub fn add_workload(&self, workload: Workload) {
        self.state.write().workloads.push(workload);
    }

    /// Makes evictions of a pod fail.
    pub fn fail_evictions_of(&self, pod_key: impl Into<String>) {
        self.state.write().failing_evictions.insert(pod_key.into());
    }

    /// Keys of evicted pods, in eviction order.
    #[must_use]
    pub fn evictions(&self) -> Vec<String> {
        self.state.read().evictions.clone()
    }

    /// Pods that are not bound to a node.
    #[must_use]
    pub fn pending_pods(&self) -> Vec<Pod> {
        self.state
            .read()
            .pods
            .values()
            .filter(|p| p.node_name.is_none())
            .cloned()
            .collect()
    }

    /// Pods bound to a node.
    #[must_use]
    pub fn pods_on(&self, node: &str) -> Vec<Pod> {
        self.state
            .read()
            .pods
            .values()
            .filter(|p| p.node_name.as_deref() == Some(node))
            .cloned()
            .collect()
    }

    /// Binds pending pods to ready, untainted-for-deletion nodes.
    ///
    /// Pods are placed by descending priority, then key; pods that fit nowhere
    /// are marked unschedulable. Returns `(pod key, node)` for every binding.
    pub fn bind_pending_pods(&self, scheduler: &dyn Scheduler) -> Vec<(String, String)> {
        let mut state = self.state.write();
        let nodes: Vec<Node> = state.nodes.values().cloned().collect();
        let bound: Vec<Pod> = state
            .pods
            .values()
            .filter(|p| p.node_name.is_some())
            .cloned()
            .collect();
        let mut snapshot = BasicSnapshot::new();
        if snapshot.set_cluster_state(nodes, bound).is_err() {
            return Vec::new();
        }

        let mut pending: Vec<Pod> = state
            .pods
            .values()
            .filter(|p| p.node_name.is_none() && !p.is_terminal())
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.key().cmp(&b.key())));

        let accept = |info: &crate::types::NodeInfo| {
            info.node.ready && !info.node.has_taint(TO_BE_DELETED_TAINT)
        };
        let mut bindings = Vec::new();
        for pod in pending {
            let key = pod.key();
            let target = scheduler.fits_any_node(&snapshot, &pod, &accept);
            let Some(stored) = state.pods.get_mut(&key) else {
                continue;
            };
            match target {
                Some(node) => {
                    *stored = stored.clone().on_node(node.clone());
                    if snapshot.add_pod(stored.clone(), &node).is_ok() {
                        bindings.push((key, node));
                    }
                }
                None => {
                    stored.unschedulable = true;
                }
            }
        }
        state.recompute_pdbs();
        for (pod, node) in &bindings {
            debug!(pod = %pod, node = %node, "bound pod");
        }
        bindings
    }

    /// Applies provider-side changes to the cluster.
    ///
    /// Provisioned instances register as ready nodes with their template pods.
    /// Nodes tainted for deletion that no node group owns any more are removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider cannot be queried.
    pub fn reconcile_with_provider(
        &self,
        provider: &InMemoryCloudProvider,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for (node, pods) in provider.provision_pending(now) {
            self.add_node(node);
            for pod in pods {
                self.add_pod(pod);
            }
        }
        let tainted: Vec<Node> = self
            .state
            .read()
            .nodes
            .values()
            .filter(|n| n.has_taint(TO_BE_DELETED_TAINT))
            .cloned()
            .collect();
        for node in tainted {
            if provider.node_group_for_node(&node)?.is_none() {
                info!(node = %node.name, "node removed by cloud provider");
                self.remove_node(&node.name);
            }
        }
        Ok(())
    }

    fn evict_now(&self, pod: &Pod) -> Result<()> {
        let mut state = self.state.write();
        let key = pod.key();
        if state.failing_evictions.contains(&key) {
            return Err(AutoscalerError::internal(format!("eviction of {key} rejected")));
        }
        if !state.pods.contains_key(&key) {
            return Err(AutoscalerError::cluster_state(format!("pod {key} not found")));
        }
        if state
            .pdbs
            .values()
            .any(|b| b.matches(pod) && b.disruptions_allowed == 0)
        {
            return Err(AutoscalerError::transient(format!(
                "cannot evict pod {key} as it would violate the pod's disruption budget"
            )));
        }
        for pdb in state.pdbs.values_mut() {
            if pdb.matches(pod) {
                pdb.disruptions_allowed = pdb.disruptions_allowed.saturating_sub(1);
            }
        }
        let Some(evicted) = state.pods.remove(&key) else {
            return Ok(());
        };
        state.evictions.push(key.clone());

        // the controller replaces evicted replicas with pending pods
        let replaced = evicted
            .owner
            .as_ref()
            .is_some_and(|o| o.kind != OwnerKind::DaemonSet);
        if replaced {
            state.replacements += 1;
            let mut replacement = evicted.clone();
            replacement.name = format!("{}-r{}", evicted.name, state.replacements);
            replacement.node_name = None;
            replacement.phase = PodPhase::Pending;
            replacement.unschedulable = true;
            state.pods.insert(replacement.key(), replacement);
        }
        state.recompute_pdbs();
        info!(pod = %key, "evicted pod");
        Ok(())
    }
}

impl ClusterSource for InMemoryCluster {
    fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.read().nodes.values().cloned().collect())
    }

    fn list_pods(&self) -> Result<Vec<Pod>> {
        Ok(self.state.read().pods.values().cloned().collect())
    }

    fn list_pdbs(&self) -> Result<Vec<PodDisruptionBudget>> {
        Ok(self.state.read().pdbs.values().cloned().collect())
    }

    fn list_workloads(&self) -> Result<Vec<Workload>> {
        Ok(self.state.read().workloads.clone())
    }
}

impl KubeClient for InMemoryCluster {
    async fn taint_node(&self, node: &str, taint: Taint) -> Result<()> {
        let mut state = self.state.write();
        let entry = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| AutoscalerError::NodeNotFound {
                name: node.to_string(),
            })?;
        entry.taints.retain(|t| t.key != taint.key);
        entry.taints.push(taint);
        Ok(())
    }

    async fn untaint_node(&self, node: &str, key: &str) -> Result<()> {
        let mut state = self.state.write();
        let entry = state
            .nodes
            .get_mut(node)
            .ok_or_else(|| AutoscalerError::NodeNotFound {
                name: node.to_string(),
            })?;
        entry.taints.retain(|t| t.key != key);
        Ok(())
    }

    async fn evict_pod(&self, pod: &Pod, _grace_period: Duration) -> Result<()> {
        self.evict_now(pod)
    }
}

impl<T: ClusterSource + ?Sized> ClusterSource for std::sync::Arc<T> {
    fn list_nodes(&self) -> Result<Vec<Node>> {
        (**self).list_nodes()
    }

    fn list_pods(&self) -> Result<Vec<Pod>> {
        (**self).list_pods()
    }

    fn list_pdbs(&self) -> Result<Vec<PodDisruptionBudget>> {
        (**self).list_pdbs()
    }

    fn list_workloads(&self) -> Result<Vec<Workload>> {
        (**self).list_workloads()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::NodeGroupSpec;
    use crate::scheduler::PredicateChecker;
    use crate::types::{NodeGroupId, Resources, GIB};

    fn web_pod(name: &str, node: &str) -> Pod {
        Pod::new("default", name, Resources::new(100, 0))
            .with_label("app", "web")
            .with_owner(OwnerKind::ReplicaSet, "web")
            .on_node(node)
    }

    fn web_pdb() -> PodDisruptionBudget {
        let mut selector = BTreeMap::new();
        selector.insert("app".to_string(), "web".to_string());
        PodDisruptionBudget {
            namespace: "default".into(),
            name: "web".into(),
            selector,
            disruptions_allowed: 0,
        }
    }

    #[tokio::test]
    async fn taint_and_untaint() {
        let cluster = InMemoryCluster::new();
        cluster.add_node(Node::new("n1", Resources::new(1000, GIB)));
        cluster
            .taint_node("n1", to_be_deleted_taint(Utc::now()))
            .await
            .expect("taint");
        assert!(cluster.node("n1").expect("n1").has_taint(TO_BE_DELETED_TAINT));
        cluster
            .untaint_node("n1", TO_BE_DELETED_TAINT)
            .await
            .expect("untaint");
        assert!(!cluster.node("n1").expect("n1").has_taint(TO_BE_DELETED_TAINT));
        assert!(cluster.taint_node("ghost", to_be_deleted_taint(Utc::now())).await.is_err());
    }

    #[tokio::test]
    async fn eviction_respects_min_available() {
        let cluster = InMemoryCluster::new();
        cluster.add_node(Node::new("n1", Resources::new(1000, GIB)));
        cluster.add_pod(web_pod("a", "n1"));
        cluster.add_pod(web_pod("b", "n1"));
        cluster.add_pod(web_pod("c", "n1"));
        cluster.add_pdb_min_available(web_pdb(), 2);
        assert_eq!(cluster.pdb("default/web").expect("pdb").disruptions_allowed, 1);

        let a = cluster.pod("default/a").expect("a");
        cluster.evict_pod(&a, Duration::from_secs(30)).await.expect("evict a");
        let b = cluster.pod("default/b").expect("b");
        let err = cluster.evict_pod(&b, Duration::from_secs(30)).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(cluster.evictions(), vec!["default/a".to_string()]);

        // the replacement is pending until bound
        assert_eq!(cluster.pending_pods().len(), 1);
        let bound = cluster.bind_pending_pods(&PredicateChecker);
        assert_eq!(bound.len(), 1);
        assert_eq!(cluster.pdb("default/web").expect("pdb").disruptions_allowed, 1);
    }

    #[test]
    fn bind_marks_unfit_pods_unschedulable() {
        let cluster = InMemoryCluster::new();
        cluster.add_node(Node::new("n1", Resources::new(1000, GIB)));
        cluster.add_pod(Pod::new("default", "huge", Resources::new(5000, 0)));
        assert!(cluster.bind_pending_pods(&PredicateChecker).is_empty());
        assert!(cluster.pod("default/huge").expect("pod").is_pending_unschedulable());
    }

    #[test]
    fn reconcile_adds_provisioned_and_drops_deleted() {
        let provider = InMemoryCloudProvider::new();
        let id = NodeGroupId::new("ng1");
        provider
            .add_node_group(NodeGroupSpec::new(
                "ng1",
                0,
                5,
                Node::new("tpl", Resources::new(1000, GIB)),
            ))
            .expect("group");
        provider.node_groups()[0].increase_size(1).expect("increase");

        let cluster = InMemoryCluster::new();
        let gone = Node::new("gone", Resources::new(1000, GIB))
            .with_taint(to_be_deleted_taint(Utc::now()));
        cluster.add_node(gone);
        cluster.reconcile_with_provider(&provider, Utc::now()).expect("reconcile");

        let nodes = cluster.list_nodes().expect("nodes");
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].name.starts_with(id.as_str()));
    }
}
