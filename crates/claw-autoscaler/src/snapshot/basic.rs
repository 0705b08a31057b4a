//! Copy-on-fork snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{ClusterSnapshot, SnapshotResult};
use crate::error::SnapshotError;
use crate::types::{NodeInfo, Pod};

#[derive(Debug, Clone, Default)]
struct Layer {
    nodes: BTreeMap<String, Arc<NodeInfo>>,
    pod_locations: HashMap<String, String>,
}

/// A snapshot that clones its whole node map on every fork.
///
/// Node infos are reference counted, so a fork copies pointers and a
/// mutation only clones the node info it touches.
#[derive(Debug, Clone)]
pub struct BasicSnapshot {
    layers: Vec<Layer>,
}

impl Default for BasicSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl BasicSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            layers: vec![Layer::default()],
        }
    }

    fn top(&self) -> &Layer {
        // the base layer is never popped
        &self.layers[self.layers.len() - 1]
    }

    fn top_mut(&mut self) -> &mut Layer {
        let idx = self.layers.len() - 1;
        &mut self.layers[idx]
    }
}

impl ClusterSnapshot for BasicSnapshot {
    fn add_node_info(&mut self, info: NodeInfo) -> SnapshotResult<()> {
        let layer = self.top_mut();
        if layer.nodes.contains_key(info.name()) {
            return Err(SnapshotError::NodeAlreadyExists {
                name: info.name().to_string(),
            });
        }
        for pod in info.pods() {
            if let Some(node) = layer.pod_locations.get(&pod.key()) {
                return Err(SnapshotError::PodAlreadyExists {
                    key: pod.key(),
                    node: node.clone(),
                });
            }
        }
        for pod in info.pods() {
            layer.pod_locations.insert(pod.key(), info.name().to_string());
        }
        layer.nodes.insert(info.name().to_string(), Arc::new(info));
        Ok(())
    }

    fn remove_node(&mut self, name: &str) -> SnapshotResult<()> {
        let layer = self.top_mut();
        let info = layer
            .nodes
            .remove(name)
            .ok_or_else(|| SnapshotError::NodeNotFound {
                name: name.to_string(),
            })?;
        for pod in info.pods() {
            layer.pod_locations.remove(&pod.key());
        }
        Ok(())
    }

    fn add_pod(&mut self, pod: Pod, node_name: &str) -> SnapshotResult<()> {
        let layer = self.top_mut();
        let key = pod.key();
        if let Some(node) = layer.pod_locations.get(&key) {
            return Err(SnapshotError::PodAlreadyExists {
                key,
                node: node.clone(),
            });
        }
        let info = layer
            .nodes
            .get_mut(node_name)
            .ok_or_else(|| SnapshotError::NodeNotFound {
                name: node_name.to_string(),
            })?;
        Arc::make_mut(info).add_pod(pod);
        layer.pod_locations.insert(key, node_name.to_string());
        Ok(())
    }

    fn remove_pod(&mut self, namespace: &str, name: &str) -> SnapshotResult<Pod> {
        let layer = self.top_mut();
        let key = format!("{namespace}/{name}");
        let not_found = || SnapshotError::PodNotFound { key: key.clone() };
        let node_name = layer.pod_locations.get(&key).ok_or_else(not_found)?.clone();
        let info = layer.nodes.get_mut(&node_name).ok_or_else(not_found)?;
        let pod = Arc::make_mut(info)
            .remove_pod(namespace, name)
            .ok_or_else(not_found)?;
        layer.pod_locations.remove(&key);
        Ok(pod)
    }

    fn get_node_info(&self, name: &str) -> SnapshotResult<&NodeInfo> {
        self.top()
            .nodes
            .get(name)
            .map(AsRef::as_ref)
            .ok_or_else(|| SnapshotError::NodeNotFound {
                name: name.to_string(),
            })
    }

    fn list_node_infos(&self) -> Vec<&NodeInfo> {
        self.top().nodes.values().map(AsRef::as_ref).collect()
    }

    fn pod_location(&self, pod_key: &str) -> Option<&str> {
        self.top().pod_locations.get(pod_key).map(String::as_str)
    }

    fn fork(&mut self) {
        let copy = self.top().clone();
        self.layers.push(copy);
    }

    fn commit(&mut self) {
        if self.layers.len() > 1 {
            if let Some(top) = self.layers.pop() {
                *self.top_mut() = top;
            }
        }
    }

    fn revert(&mut self) {
        if self.layers.len() > 1 {
            self.layers.pop();
        }
    }

    fn fork_depth(&self) -> usize {
        self.layers.len() - 1
    }

    fn clear(&mut self) {
        self.layers = vec![Layer::default()];
    }

    fn boxed_clone(&self) -> Box<dyn ClusterSnapshot> {
        Box::new(self.clone())
    }

    fn node_count(&self) -> usize {
        self.top().nodes.len()
    }
}
