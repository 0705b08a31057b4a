//! Template node infos per node group, and upcoming-node placeholders.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::cloudprovider::CloudProvider;
use crate::clusterstate::ClusterStateRegistry;
use crate::error::Result;
use crate::expander::NodeInfos;
use crate::kube::TO_BE_DELETED_TAINT;
use crate::snapshot::ClusterSnapshot;
use crate::types::{Node, NodeGroupId, NodeInfo, LABEL_HOSTNAME};

/// Copies a node info under a new name.
///
/// Only DaemonSet and mirror pods are carried over, renamed so the copy can
/// coexist with the original in one snapshot. The deletion taint and any
/// cordon are dropped.
#[must_use]
pub fn sanitize_node_info(info: &NodeInfo, name: &str) -> NodeInfo {
    let mut node: Node = info.node.clone();
    node.name = name.to_string();
    node.provider_id = name.to_string();
    node.labels.insert(LABEL_HOSTNAME.to_string(), name.to_string());
    node.taints.retain(|t| t.key != TO_BE_DELETED_TAINT);
    node.unschedulable = false;
    node.ready = true;
    let pods = info
        .pods()
        .iter()
        .filter(|p| p.is_daemonset() || p.is_mirror())
        .map(|p| {
            let mut pod = p.clone();
            pod.name = format!("{}-{name}", p.name);
            pod.node_name = None;
            pod
        });
    NodeInfo::with_pods(node, pods)
}

/// Builds one template per node group.
///
/// A ready, schedulable node of the group is preferred, since it reflects
/// what the group really produces. Groups without such a node fall back to
/// the provider's template. Groups with neither are left out.
#[must_use]
pub fn template_node_infos(
    provider: &dyn CloudProvider,
    snapshot: &dyn ClusterSnapshot,
    cluster_state: &ClusterStateRegistry,
    nodes: &[Node],
) -> NodeInfos {
    let mut templates = NodeInfos::new();
    let mut sorted: Vec<&Node> = nodes.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    for node in sorted {
        if !node.ready || node.unschedulable || node.has_taint(TO_BE_DELETED_TAINT) {
            continue;
        }
        let Some(group) = cluster_state.node_group_of(&node.name) else {
            continue;
        };
        if templates.contains_key(group) {
            continue;
        }
        if let Ok(info) = snapshot.get_node_info(&node.name) {
            trace!(node_group = %group, node = %node.name, "template from live node");
            let name = format!("template-node-for-{group}");
            templates.insert(group.clone(), sanitize_node_info(info, &name));
        }
    }
    for group in provider.node_groups() {
        if !group.exist() || templates.contains_key(group.id()) {
            continue;
        }
        match group.template_node_info() {
            Ok(info) => {
                templates.insert(group.id().clone(), info);
            }
            Err(e) => debug!(node_group = %group.id(), error = %e, "no template for node group"),
        }
    }
    templates
}

/// Adds placeholder nodes for requested but unregistered capacity.
///
/// Placeholders are named `upcoming-{group}-{i}`; their names are returned.
///
/// # Errors
///
/// Returns an error if a placeholder cannot be added to the snapshot.
pub fn inject_upcoming_nodes(
    snapshot: &mut dyn ClusterSnapshot,
    upcoming: &BTreeMap<NodeGroupId, usize>,
    templates: &NodeInfos,
) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for (group, count) in upcoming {
        let Some(template) = templates.get(group) else {
            debug!(node_group = %group, "no template, upcoming nodes not injected");
            continue;
        };
        for i in 0..*count {
            let name = format!("upcoming-{group}-{i}");
            snapshot.add_node_info(sanitize_node_info(template, &name))?;
            names.push(name);
        }
    }
    if !names.is_empty() {
        debug!(count = names.len(), "injected upcoming nodes");
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudprovider::{InMemoryCloudProvider, NodeGroupSpec};
    use crate::config::AutoscalingOptions;
    use crate::events::InMemoryEventRecorder;
    use crate::kube::to_be_deleted_taint;
    use crate::metrics::AutoscalerMetrics;
    use crate::snapshot::BasicSnapshot;
    use crate::types::{OwnerKind, Pod, Resources, MIB};
    use chrono::Utc;
    use std::sync::Arc;

    fn template() -> Node {
        Node::new("tpl", Resources::new(1000, 1000 * MIB).with_pods(110))
    }

    #[test]
    fn sanitize_keeps_daemonsets_and_drops_taint() {
        let node = Node::new("n1", Resources::new(1000, 1000 * MIB))
            .with_taint(to_be_deleted_taint(Utc::now()))
            .cordoned();
        let ds = Pod::new("kube-system", "ds-a", Resources::new(100, 0))
            .with_owner(OwnerKind::DaemonSet, "ds")
            .on_node("n1");
        let app = Pod::new("default", "app", Resources::new(100, 0)).on_node("n1");
        let info = NodeInfo::with_pods(node, [ds, app]);

        let copy = sanitize_node_info(&info, "copy");
        assert_eq!(copy.name(), "copy");
        assert!(!copy.node.has_taint(TO_BE_DELETED_TAINT));
        assert!(!copy.node.unschedulable);
        assert_eq!(copy.pods().len(), 1);
        assert_eq!(copy.pods()[0].name, "ds-a-copy");
        assert_eq!(copy.requested().cpu_millis, 100);
    }

    #[test]
    fn prefers_live_node_over_provider_template() {
        let provider = Arc::new(InMemoryCloudProvider::new());
        provider
            .add_node_group(NodeGroupSpec::new("ng1", 0, 10, template()))
            .expect("group");
        provider
            .add_node_group(NodeGroupSpec::new("ng2", 0, 10, template()))
            .expect("group");
        let live = Node::new("ng1-live", Resources::new(2000, 2000 * MIB).with_pods(110));
        provider.add_node(&NodeGroupId::new("ng1"), &live).expect("node");

        let mut registry = ClusterStateRegistry::new(
            provider.clone(),
            &AutoscalingOptions::default(),
            Arc::new(InMemoryEventRecorder::new()),
            AutoscalerMetrics::new(),
        );
        registry.update(&[live.clone()], Utc::now()).expect("update");
        let mut snapshot = BasicSnapshot::new();
        snapshot.add_node(live.clone()).expect("node");

        let templates = template_node_infos(&*provider, &snapshot, &registry, &[live]);
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[&NodeGroupId::new("ng1")].node.allocatable.cpu_millis, 2000);
        assert_eq!(templates[&NodeGroupId::new("ng2")].node.allocatable.cpu_millis, 1000);
    }

    #[test]
    fn upcoming_nodes_added_to_snapshot() {
        let mut snapshot = BasicSnapshot::new();
        let mut templates = NodeInfos::new();
        templates.insert(NodeGroupId::new("ng1"), NodeInfo::new(template()));
        let mut upcoming = BTreeMap::new();
        upcoming.insert(NodeGroupId::new("ng1"), 2);
        upcoming.insert(NodeGroupId::new("ghost"), 1);

        let names = inject_upcoming_nodes(&mut snapshot, &upcoming, &templates).expect("inject");
        assert_eq!(names, vec!["upcoming-ng1-0", "upcoming-ng1-1"]);
        assert_eq!(snapshot.node_count(), 2);
    }
}
