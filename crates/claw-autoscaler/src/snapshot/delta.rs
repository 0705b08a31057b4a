//! Delta snapshot.
//!
//! The base layer lives behind an `Arc` and is shared by clones. Each fork
//! records only the node infos it touched, the nodes it deleted and the pod
//! placements it changed. Reads walk the forks from the top down to the base.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use super::{ClusterSnapshot, SnapshotResult};
use crate::error::SnapshotError;
use crate::types::{NodeInfo, Pod};

#[derive(Debug, Clone, Default)]
struct BaseData {
    nodes: BTreeMap<String, Arc<NodeInfo>>,
    pod_locations: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
struct DeltaLayer {
    /// Added or modified node infos.
    modified: HashMap<String, Arc<NodeInfo>>,
    /// Nodes deleted in this layer and not re-added.
    deleted: HashSet<String>,
    /// Pod placement changes; `None` records a removal.
    pod_locations: HashMap<String, Option<String>>,
}

/// A snapshot with a shared immutable base and per-fork deltas.
#[derive(Debug, Clone, Default)]
pub struct DeltaSnapshot {
    base: Arc<BaseData>,
    layers: Vec<DeltaLayer>,
}

impl DeltaSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, name: &str) -> Option<&Arc<NodeInfo>> {
        for layer in self.layers.iter().rev() {
            if let Some(info) = layer.modified.get(name) {
                return Some(info);
            }
            if layer.deleted.contains(name) {
                return None;
            }
        }
        self.base.nodes.get(name)
    }

    fn locate(&self, key: &str) -> Option<&str> {
        for layer in self.layers.iter().rev() {
            if let Some(location) = layer.pod_locations.get(key) {
                return location.as_deref();
            }
        }
        self.base.pod_locations.get(key).map(String::as_str)
    }

    /// Writes a node info into the top layer (or the base).
    fn put_node(&mut self, info: Arc<NodeInfo>) {
        let name = info.name().to_string();
        match self.layers.last_mut() {
            Some(layer) => {
                layer.deleted.remove(&name);
                layer.modified.insert(name, info);
            }
            None => {
                Arc::make_mut(&mut self.base).nodes.insert(name, info);
            }
        }
    }

    fn set_location(&mut self, key: String, node: Option<String>) {
        match self.layers.last_mut() {
            Some(layer) => {
                layer.pod_locations.insert(key, node);
            }
            None => {
                let base = Arc::make_mut(&mut self.base);
                match node {
                    Some(node) => base.pod_locations.insert(key, node),
                    None => base.pod_locations.remove(&key),
                };
            }
        }
    }

    /// Applies `f` to a writable copy of the node info visible under `name`.
    fn modify_node<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut NodeInfo) -> T,
    ) -> SnapshotResult<T> {
        let current = self
            .lookup(name)
            .cloned()
            .ok_or_else(|| SnapshotError::NodeNotFound {
                name: name.to_string(),
            })?;
        let mut info = current;
        let out = f(Arc::make_mut(&mut info));
        self.put_node(info);
        Ok(out)
    }
}

impl ClusterSnapshot for DeltaSnapshot {
    fn add_node_info(&mut self, info: NodeInfo) -> SnapshotResult<()> {
        if self.lookup(info.name()).is_some() {
            return Err(SnapshotError::NodeAlreadyExists {
                name: info.name().to_string(),
            });
        }
        for pod in info.pods() {
            if let Some(node) = self.locate(&pod.key()) {
                return Err(SnapshotError::PodAlreadyExists {
                    key: pod.key(),
                    node: node.to_string(),
                });
            }
        }
        let name = info.name().to_string();
        let keys: Vec<String> = info.pods().iter().map(Pod::key).collect();
        self.put_node(Arc::new(info));
        for key in keys {
            self.set_location(key, Some(name.clone()));
        }
        Ok(())
    }

    fn remove_node(&mut self, name: &str) -> SnapshotResult<()> {
        let info = self
            .lookup(name)
            .cloned()
            .ok_or_else(|| SnapshotError::NodeNotFound {
                name: name.to_string(),
            })?;
        match self.layers.last_mut() {
            Some(layer) => {
                layer.modified.remove(name);
                layer.deleted.insert(name.to_string());
            }
            None => {
                Arc::make_mut(&mut self.base).nodes.remove(name);
            }
        }
        for pod in info.pods() {
            self.set_location(pod.key(), None);
        }
        Ok(())
    }

    fn add_pod(&mut self, pod: Pod, node_name: &str) -> SnapshotResult<()> {
        let key = pod.key();
        if let Some(node) = self.locate(&key) {
            return Err(SnapshotError::PodAlreadyExists {
                key,
                node: node.to_string(),
            });
        }
        self.modify_node(node_name, |info| info.add_pod(pod))?;
        self.set_location(key, Some(node_name.to_string()));
        Ok(())
    }

    fn remove_pod(&mut self, namespace: &str, name: &str) -> SnapshotResult<Pod> {
        let key = format!("{namespace}/{name}");
        let not_found = || SnapshotError::PodNotFound { key: key.clone() };
        let node_name = self.locate(&key).ok_or_else(not_found)?.to_string();
        let pod = self
            .modify_node(&node_name, |info| info.remove_pod(namespace, name))
            .map_err(|_| not_found())?
            .ok_or_else(not_found)?;
        self.set_location(key.clone(), None);
        Ok(pod)
    }

    fn get_node_info(&self, name: &str) -> SnapshotResult<&NodeInfo> {
        self.lookup(name)
            .map(AsRef::as_ref)
            .ok_or_else(|| SnapshotError::NodeNotFound {
                name: name.to_string(),
            })
    }

    fn list_node_infos(&self) -> Vec<&NodeInfo> {
        let mut view: BTreeMap<&str, &NodeInfo> = self
            .base
            .nodes
            .iter()
            .map(|(name, info)| (name.as_str(), info.as_ref()))
            .collect();
        for layer in &self.layers {
            for name in &layer.deleted {
                view.remove(name.as_str());
            }
            for (name, info) in &layer.modified {
                view.insert(name.as_str(), info.as_ref());
            }
        }
        view.into_values().collect()
    }

    fn pod_location(&self, pod_key: &str) -> Option<&str> {
        self.locate(pod_key)
    }

    fn fork(&mut self) {
        self.layers.push(DeltaLayer::default());
    }

    fn commit(&mut self) {
        let Some(top) = self.layers.pop() else {
            return;
        };
        match self.layers.last_mut() {
            Some(below) => {
                for name in top.deleted {
                    below.modified.remove(&name);
                    below.deleted.insert(name);
                }
                for (name, info) in top.modified {
                    below.deleted.remove(&name);
                    below.modified.insert(name, info);
                }
                below.pod_locations.extend(top.pod_locations);
            }
            None => {
                let base = Arc::make_mut(&mut self.base);
                for name in &top.deleted {
                    base.nodes.remove(name);
                }
                base.nodes.extend(top.modified);
                for (key, location) in top.pod_locations {
                    match location {
                        Some(node) => base.pod_locations.insert(key, node),
                        None => base.pod_locations.remove(&key),
                    };
                }
            }
        }
    }

    fn revert(&mut self) {
        self.layers.pop();
    }

    fn fork_depth(&self) -> usize {
        self.layers.len()
    }

    fn clear(&mut self) {
        self.base = Arc::default();
        self.layers.clear();
    }

    fn boxed_clone(&self) -> Box<dyn ClusterSnapshot> {
        Box::new(self.clone())
    }
}
