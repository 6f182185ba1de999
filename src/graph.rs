//! Shared node/edge graph behind a mediated mutation API.
//!
//! Nodes and edges live in flat id-indexed maps inside a single
//! [`GraphStore`]; no node holds a reference to another, so graph topology
//! never creates ownership cycles. Plugins read defensive copies and
//! mutate only through the store's methods, each of which applies its
//! change under one write-lock acquisition and then emits the matching
//! `graph:*` hook.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::hooks::HookBus;

/// A node in the shared graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Generated, unique, opaque id.
    pub id: String,
    /// Node type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Free-form payload.
    #[serde(default)]
    pub data: Value,
}

/// An edge in the shared graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
    #[serde(default)]
    pub data: Value,
}

/// A node as submitted by a caller; the store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewNode {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// An edge as submitted by a caller; the store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEdge {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Default)]
struct GraphState {
    nodes: HashMap<String, GraphNode>,
    edges: HashMap<String, GraphEdge>,
}

impl GraphState {
    fn fresh_id(&self) -> String {
        loop {
            let id = Uuid::new_v4().to_string();
            if !self.nodes.contains_key(&id) && !self.edges.contains_key(&id) {
                return id;
            }
        }
    }
}

/// The process-wide shared graph. All mutation goes through this API.
pub struct GraphStore {
    state: RwLock<GraphState>,
    bus: Arc<HookBus>,
}

impl GraphStore {
    pub fn new(bus: Arc<HookBus>) -> Self {
        Self { state: RwLock::new(GraphState::default()), bus }
    }

    /// Replace the graph contents wholesale. Host-facing injection; emits
    /// no per-item hooks.
    pub fn set_data(&self, nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) {
        let mut state = self.state.write();
        state.nodes = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
        state.edges = edges.into_iter().map(|e| (e.id.clone(), e)).collect();
    }

    /// Defensive copy of all nodes.
    pub fn get_nodes(&self) -> Vec<GraphNode> {
        self.state.read().nodes.values().cloned().collect()
    }

    /// Defensive copy of all edges.
    pub fn get_edges(&self) -> Vec<GraphEdge> {
        self.state.read().edges.values().cloned().collect()
    }

    pub fn get_node(&self, id: &str) -> Option<GraphNode> {
        self.state.read().nodes.get(id).cloned()
    }

    pub fn get_edge(&self, id: &str) -> Option<GraphEdge> {
        self.state.read().edges.get(id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.state.read().edges.len()
    }

    /// Insert a node under a fresh id, then emit `graph:node:added`.
    pub async fn add_node(&self, new: NewNode) -> String {
        let node = {
            let mut state = self.state.write();
            let id = state.fresh_id();
            let node = GraphNode { id: id.clone(), kind: new.kind, data: new.data };
            state.nodes.insert(id, node.clone());
            node
        };

        let id = node.id.clone();
        self.bus.emit("graph:node:added", &[to_value(&node)]).await;
        id
    }

    /// Merge a partial update into a node's payload, then emit
    /// `graph:node:updated`. Returns false if the id is unknown.
    pub async fn update_node(&self, id: &str, patch: Value) -> bool {
        let updated = {
            let mut state = self.state.write();
            match state.nodes.get_mut(id) {
                Some(node) => {
                    merge_data(&mut node.data, patch);
                    Some(node.clone())
                }
                None => None,
            }
        };

        match updated {
            Some(node) => {
                self.bus.emit("graph:node:updated", &[to_value(&node)]).await;
                true
            }
            None => false,
        }
    }

    /// Remove a node and every edge whose source or target is that node.
    ///
    /// Emits `graph:edge:removed` for each cascaded edge, then
    /// `graph:node:removed` for the node itself.
    pub async fn remove_node(&self, id: &str) -> bool {
        let (node, removed_edges) = {
            let mut state = self.state.write();
            let Some(node) = state.nodes.remove(id) else {
                return false;
            };
            let mut removed = Vec::new();
            state.edges.retain(|_, edge| {
                if edge.source == id || edge.target == id {
                    removed.push(edge.clone());
                    false
                } else {
                    true
                }
            });
            (node, removed)
        };

        for edge in removed_edges {
            self.bus.emit("graph:edge:removed", &[to_value(&edge)]).await;
        }
        self.bus.emit("graph:node:removed", &[to_value(&node)]).await;
        true
    }

    /// Insert an edge under a fresh id, then emit `graph:edge:added`.
    pub async fn add_edge(&self, new: NewEdge) -> String {
        let edge = {
            let mut state = self.state.write();
            let id = state.fresh_id();
            let edge = GraphEdge {
                id: id.clone(),
                kind: new.kind,
                source: new.source,
                target: new.target,
                data: new.data,
            };
            state.edges.insert(id, edge.clone());
            edge
        };

        let id = edge.id.clone();
        self.bus.emit("graph:edge:added", &[to_value(&edge)]).await;
        id
    }

    /// Merge a partial update into an edge's payload, then emit
    /// `graph:edge:updated`. Returns false if the id is unknown.
    pub async fn update_edge(&self, id: &str, patch: Value) -> bool {
        let updated = {
            let mut state = self.state.write();
            match state.edges.get_mut(id) {
                Some(edge) => {
                    merge_data(&mut edge.data, patch);
                    Some(edge.clone())
                }
                None => None,
            }
        };

        match updated {
            Some(edge) => {
                self.bus.emit("graph:edge:updated", &[to_value(&edge)]).await;
                true
            }
            None => false,
        }
    }

    /// Remove an edge, then emit `graph:edge:removed`.
    pub async fn remove_edge(&self, id: &str) -> bool {
        let removed = self.state.write().edges.remove(id);
        match removed {
            Some(edge) => {
                self.bus.emit("graph:edge:removed", &[to_value(&edge)]).await;
                true
            }
            None => false,
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Shallow-merge `patch` into `data` when both are objects; otherwise a
/// non-null patch replaces the payload.
fn merge_data(data: &mut Value, patch: Value) {
    match (data, patch) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                existing.insert(key, value);
            }
        }
        (_, Value::Null) => {}
        (data, patch) => *data = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> GraphStore {
        GraphStore::new(Arc::new(HookBus::new()))
    }

    #[tokio::test]
    async fn test_add_node_generates_fresh_id() {
        let graph = store();
        let before: Vec<String> = graph.get_nodes().into_iter().map(|n| n.id).collect();

        let id = graph.add_node(NewNode { kind: "x".to_string(), data: Value::Null }).await;

        assert!(!before.contains(&id));
        assert!(graph.get_node(&id).is_some());
    }

    #[tokio::test]
    async fn test_defensive_copies() {
        let graph = store();
        graph.add_node(NewNode { kind: "x".to_string(), data: Value::Null }).await;

        let mut nodes = graph.get_nodes();
        nodes.clear();

        assert_eq!(graph.node_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_node_cascades_edges() {
        let graph = store();
        let a = graph.add_node(NewNode { kind: "a".to_string(), data: Value::Null }).await;
        let b = graph.add_node(NewNode { kind: "b".to_string(), data: Value::Null }).await;
        let c = graph.add_node(NewNode { kind: "c".to_string(), data: Value::Null }).await;

        graph
            .add_edge(NewEdge {
                kind: "link".to_string(),
                source: a.clone(),
                target: b.clone(),
                data: Value::Null,
            })
            .await;
        graph
            .add_edge(NewEdge {
                kind: "link".to_string(),
                source: b.clone(),
                target: c.clone(),
                data: Value::Null,
            })
            .await;
        let unrelated = graph
            .add_edge(NewEdge {
                kind: "link".to_string(),
                source: a.clone(),
                target: c.clone(),
                data: Value::Null,
            })
            .await;

        assert!(graph.remove_node(&b).await);

        let edges = graph.get_edges();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].id, unrelated);
        assert!(!edges.iter().any(|e| e.source == b || e.target == b));
    }

    #[tokio::test]
    async fn test_cascade_emits_edge_removed_events() {
        let bus = Arc::new(HookBus::new());
        let graph = GraphStore::new(Arc::clone(&bus));

        let a = graph.add_node(NewNode { kind: "a".to_string(), data: Value::Null }).await;
        let b = graph.add_node(NewNode { kind: "b".to_string(), data: Value::Null }).await;
        graph
            .add_edge(NewEdge {
                kind: "link".to_string(),
                source: a.clone(),
                target: b.clone(),
                data: Value::Null,
            })
            .await;

        let seen = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&seen);
        bus.register(
            "graph:edge:removed",
            "observer",
            crate::hooks::handler_fn(move |args| {
                if let Some(id) = args.first().and_then(|v| v["id"].as_str()) {
                    sink.lock().push(id.to_string());
                }
                Ok(Value::Null)
            }),
            0,
        );

        graph.remove_node(&a).await;
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_update_node_merges_payload() {
        let graph = store();
        let id = graph
            .add_node(NewNode { kind: "x".to_string(), data: json!({"a": 1, "b": 2}) })
            .await;

        assert!(graph.update_node(&id, json!({"b": 3, "c": 4})).await);

        let node = graph.get_node(&id).unwrap();
        assert_eq!(node.data, json!({"a": 1, "b": 3, "c": 4}));
    }

    #[tokio::test]
    async fn test_update_unknown_id_returns_false() {
        let graph = store();
        assert!(!graph.update_node("missing", json!({})).await);
        assert!(!graph.update_edge("missing", json!({})).await);
        assert!(!graph.remove_node("missing").await);
        assert!(!graph.remove_edge("missing").await);
    }

    #[tokio::test]
    async fn test_set_data_replaces_contents() {
        let graph = store();
        graph.add_node(NewNode { kind: "old".to_string(), data: Value::Null }).await;

        graph.set_data(
            vec![GraphNode { id: "n1".to_string(), kind: "file".to_string(), data: Value::Null }],
            vec![GraphEdge {
                id: "e1".to_string(),
                kind: "imports".to_string(),
                source: "n1".to_string(),
                target: "n1".to_string(),
                data: Value::Null,
            }],
        );

        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.get_node("n1").is_some());
    }
}
