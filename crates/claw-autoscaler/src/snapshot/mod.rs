//! Cluster snapshot.
//!
//! A snapshot maps node names to [`NodeInfo`] and supports cheap
//! hypothetical mutation through a stack of forks:
//!
//! ```text
//! fork()   -> push a layer; later mutations land in it
//! commit() -> fold the top layer into the one below
//! revert() -> drop the top layer
//! ```
//!
//! Two implementations share the [`ClusterSnapshot`] contract:
//! - [`BasicSnapshot`]: copies the node map on every fork
//! - [`DeltaSnapshot`]: shares an immutable base and records per-fork deltas

mod basic;
mod delta;

pub use basic::BasicSnapshot;
pub use delta::DeltaSnapshot;

use std::fmt;

use crate::error::SnapshotError;
use crate::types::{Node, NodeInfo, Pod};

/// Result type for snapshot mutations.
pub type SnapshotResult<T> = std::result::Result<T, SnapshotError>;

/// A layered, forkable view of nodes and the pods placed on them.
pub trait ClusterSnapshot: Send + Sync + fmt::Debug {
    /// Adds a node together with its pods.
    ///
    /// # Errors
    ///
    /// Fails if the node already exists or one of its pods is placed elsewhere.
    fn add_node_info(&mut self, info: NodeInfo) -> SnapshotResult<()>;

    /// Adds a node without pods.
    ///
    /// # Errors
    ///
    /// Fails if the node already exists.
    fn add_node(&mut self, node: Node) -> SnapshotResult<()> {
        self.add_node_info(NodeInfo::new(node))
    }

    /// Removes a node and every pod on it.
    ///
    /// # Errors
    ///
    /// Fails if the node does not exist.
    fn remove_node(&mut self, name: &str) -> SnapshotResult<()>;

    /// Places a pod on a node.
    ///
    /// # Errors
    ///
    /// Fails if the node does not exist or the pod already resides on a node.
    fn add_pod(&mut self, pod: Pod, node_name: &str) -> SnapshotResult<()>;

    /// Removes a pod from whichever node it resides on.
    ///
    /// # Errors
    ///
    /// Fails if the pod is not placed anywhere.
    fn remove_pod(&mut self, namespace: &str, name: &str) -> SnapshotResult<Pod>;

    /// Returns the node info for a node.
    ///
    /// # Errors
    ///
    /// Fails if the node does not exist.
    fn get_node_info(&self, name: &str) -> SnapshotResult<&NodeInfo>;

    /// Returns every node info, ordered by node name.
    fn list_node_infos(&self) -> Vec<&NodeInfo>;

    /// Returns the node a pod resides on.
    fn pod_location(&self, pod_key: &str) -> Option<&str>;

    /// Pushes a mutation layer.
    fn fork(&mut self);

    /// Folds the top layer into the layer below. No-op without a fork.
    fn commit(&mut self);

    /// Drops the top layer. No-op without a fork.
    fn revert(&mut self);

    /// Number of open forks.
    fn fork_depth(&self) -> usize;

    /// Drops every node and every fork.
    fn clear(&mut self);

    /// Returns an independent copy sharing immutable data where possible.
    fn boxed_clone(&self) -> Box<dyn ClusterSnapshot>;

    /// Number of nodes in the current view.
    fn node_count(&self) -> usize {
        self.list_node_infos().len()
    }

    /// Rebuilds the snapshot from lister output.
    ///
    /// Pods bound to nodes that are not part of `nodes` are ignored.
    ///
    /// # Errors
    ///
    /// Fails on duplicate nodes or pods.
    fn set_cluster_state(&mut self, nodes: Vec<Node>, scheduled_pods: Vec<Pod>) -> SnapshotResult<()> {
        self.clear();
        for node in nodes {
            self.add_node(node)?;
        }
        for pod in scheduled_pods {
            let Some(node_name) = pod.node_name.clone() else {
                continue;
            };
            if self.get_node_info(&node_name).is_ok() {
                self.add_pod(pod, &node_name)?;
            }
        }
        Ok(())
    }
}

impl Clone for Box<dyn ClusterSnapshot> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// Snapshot implementation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// Copy-on-fork.
    Basic,
    /// Shared base with per-fork deltas.
    #[default]
    Delta,
}

impl SnapshotKind {
    /// Creates an empty snapshot of this kind.
    #[must_use]
    pub fn create(self) -> Box<dyn ClusterSnapshot> {
        match self {
            Self::Basic => Box::new(BasicSnapshot::new()),
            Self::Delta => Box::new(DeltaSnapshot::new()),
        }
    }
}

/// Runs `f` inside a fork and always reverts it afterwards.
pub fn with_fork<T>(
    snapshot: &mut dyn ClusterSnapshot,
    f: impl FnOnce(&mut dyn ClusterSnapshot) -> T,
) -> T {
    snapshot.fork();
    let out = f(snapshot);
    snapshot.revert();
    out
}


#[cfg(test)]
mod tests {
    use super::test_util::dump;
    use super::*;
    use crate::types::{Resources, GIB};
    use proptest::prelude::*;
    use test_case::test_case;

    fn node(name: &str) -> Node {
        Node::new(name, Resources::new(1000, GIB).with_pods(110))
    }

    fn pod(name: &str) -> Pod {
        Pod::new("default", name, Resources::new(100, 0))
    }

    #[test_case(SnapshotKind::Basic; "basic")]
    #[test_case(SnapshotKind::Delta; "delta")]
    fn add_pod_rules(kind: SnapshotKind) {
        let mut s = kind.create();
        s.add_node(node("n1")).expect("add n1");
        s.add_node(node("n2")).expect("add n2");

        assert_eq!(
            s.add_pod(pod("p"), "missing"),
            Err(SnapshotError::NodeNotFound {
                name: "missing".into()
            })
        );
        s.add_pod(pod("p"), "n1").expect("place");
        assert_eq!(
            s.add_pod(pod("p"), "n2"),
            Err(SnapshotError::PodAlreadyExists {
                key: "default/p".into(),
                node: "n1".into()
            })
        );
        assert_eq!(s.pod_location("default/p"), Some("n1"));
        assert_eq!(s.get_node_info("n1").expect("n1").requested().cpu_millis, 100);
    }

    #[test_case(SnapshotKind::Basic; "basic")]
    #[test_case(SnapshotKind::Delta; "delta")]
    fn duplicate_node_rejected(kind: SnapshotKind) {
        let mut s = kind.create();
        s.add_node(node("n1")).expect("add");
        assert!(matches!(
            s.add_node(node("n1")),
            Err(SnapshotError::NodeAlreadyExists { .. })
        ));
    }

    #[test_case(SnapshotKind::Basic; "basic")]
    #[test_case(SnapshotKind::Delta; "delta")]
    fn fork_hides_nothing_and_revert_restores(kind: SnapshotKind) {
        let mut s = kind.create();
        s.add_node(node("n1")).expect("add");
        s.add_pod(pod("a"), "n1").expect("a");
        let before = dump(s.as_ref());

        s.fork();
        s.add_node(node("n2")).expect("n2");
        s.remove_pod("default", "a").expect("remove a");
        s.add_pod(pod("a"), "n2").expect("move a");
        s.remove_node("n1").expect("remove n1");
        assert_eq!(s.node_count(), 1);
        assert_eq!(s.pod_location("default/a"), Some("n2"));
        s.revert();

        assert_eq!(dump(s.as_ref()), before);
        assert_eq!(s.pod_location("default/a"), Some("n1"));
        assert_eq!(s.fork_depth(), 0);
    }

    #[test_case(SnapshotKind::Basic; "basic")]
    #[test_case(SnapshotKind::Delta; "delta")]
    fn nested_commit_keeps_changes(kind: SnapshotKind) {
        let mut s = kind.create();
        s.add_node(node("n1")).expect("add");
        s.fork();
        s.fork();
        s.add_pod(pod("a"), "n1").expect("a");
        s.commit();
        assert_eq!(s.fork_depth(), 1);
        s.commit();
        assert_eq!(s.fork_depth(), 0);
        assert_eq!(s.pod_location("default/a"), Some("n1"));
        // commit and revert without a fork are no-ops
        s.commit();
        s.revert();
        assert_eq!(s.node_count(), 1);
    }

    #[test_case(SnapshotKind::Basic; "basic")]
    #[test_case(SnapshotKind::Delta; "delta")]
    fn set_cluster_state_ignores_unknown_nodes(kind: SnapshotKind) {
        let mut s = kind.create();
        s.add_node(node("stale")).expect("stale");
        s.set_cluster_state(
            vec![node("n1")],
            vec![pod("a").on_node("n1"), pod("b").on_node("gone")],
        )
        .expect("set");
        assert_eq!(s.node_count(), 1);
        assert_eq!(s.pod_location("default/a"), Some("n1"));
        assert_eq!(s.pod_location("default/b"), None);
    }

    #[test_case(SnapshotKind::Basic; "basic")]
    #[test_case(SnapshotKind::Delta; "delta")]
    fn boxed_clone_is_independent(kind: SnapshotKind) {
        let mut s = kind.create();
        s.add_node(node("n1")).expect("add");
        let mut copy = s.clone();
        copy.add_pod(pod("a"), "n1").expect("a");
        assert!(s.get_node_info("n1").expect("n1").pods().is_empty());
        assert_eq!(copy.get_node_info("n1").expect("n1").pods().len(), 1);
    }

    #[test]
    fn with_fork_reverts() {
        let mut s = SnapshotKind::Delta.create();
        s.add_node(node("n1")).expect("add");
        let count = with_fork(s.as_mut(), |s| {
            s.add_node(node("n2")).expect("n2");
            s.node_count()
        });
        assert_eq!(count, 2);
        assert_eq!(s.node_count(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        AddNode(u8),
        RemoveNode(u8),
        AddPod(u8, u8),
        RemovePod(u8),
        Fork,
        Commit,
        Revert,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6).prop_map(Op::AddNode),
            (0u8..6).prop_map(Op::RemoveNode),
            ((0u8..10), (0u8..6)).prop_map(|(p, n)| Op::AddPod(p, n)),
            (0u8..10).prop_map(Op::RemovePod),
            Just(Op::Fork),
            Just(Op::Commit),
            Just(Op::Revert),
        ]
    }

    fn apply(s: &mut dyn ClusterSnapshot, op: &Op) -> bool {
        match op {
            Op::AddNode(n) => s.add_node(node(&format!("n{n}"))).is_ok(),
            Op::RemoveNode(n) => s.remove_node(&format!("n{n}")).is_ok(),
            Op::AddPod(p, n) => s.add_pod(pod(&format!("p{p}")), &format!("n{n}")).is_ok(),
            Op::RemovePod(p) => s.remove_pod("default", &format!("p{p}")).is_ok(),
            Op::Fork => {
                s.fork();
                true
            }
            Op::Commit => {
                s.commit();
                true
            }
            Op::Revert => {
                s.revert();
                true
            }
        }
    }

    proptest! {
        #[test]
        fn basic_and_delta_agree(ops in proptest::collection::vec(op_strategy(), 0..60)) {
            let mut basic = SnapshotKind::Basic.create();
            let mut delta = SnapshotKind::Delta.create();
            for op in &ops {
                let a = apply(basic.as_mut(), op);
                let b = apply(delta.as_mut(), op);
                prop_assert_eq!(a, b, "diverged on {:?}", op);
                prop_assert_eq!(basic.fork_depth(), delta.fork_depth());
            }
            prop_assert_eq!(dump(basic.as_ref()), dump(delta.as_ref()));
            for p in 0..10u8 {
                let key = format!("default/p{p}");
                prop_assert_eq!(basic.pod_location(&key), delta.pod_location(&key));
            }
        }

        #[test]
        fn revert_of_fork_is_identity(
            setup in proptest::collection::vec(op_strategy(), 0..30),
            inner in proptest::collection::vec(op_strategy(), 0..30),
        ) {
            for kind in [SnapshotKind::Basic, SnapshotKind::Delta] {
                let mut s = kind.create();
                for op in setup.iter().filter(|op| !matches!(op, Op::Fork | Op::Commit | Op::Revert)) {
                    apply(s.as_mut(), op);
                }
                let before = dump(s.as_ref());
                s.fork();
                for op in inner.iter().filter(|op| !matches!(op, Op::Fork | Op::Commit | Op::Revert)) {
                    apply(s.as_mut(), op);
                }
                s.revert();
                prop_assert_eq!(dump(s.as_ref()), before);
            }
        }
    }
}
