//! Plan graph: component-instance nodes and data-flow edges
//!
//! The plan is an arena of nodes with stable opaque handles. A resolution
//! run mutates a working copy of the plan and swaps it in atomically on
//! commit, so a failed run never touches the committed graph.

use armature_model::ModelId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Stable handle to a node in the plan
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Buffering/queueing semantics of a connection, opaque to the engine
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ConnectionPolicy(pub BTreeMap<String, String>);

impl ConnectionPolicy {
    pub fn is_default(&self) -> bool {
        self.0.is_empty()
    }
}

/// Directed data-flow edge from one node's output port to another node's
/// input port
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Connection {
    pub source: NodeId,
    pub source_port: String,
    pub target: NodeId,
    pub target_port: String,
    pub policy: ConnectionPolicy,
}

/// A component instance inside the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Node handle
    pub id: NodeId,
    /// Diagnostic label (device name, request name, or derived role path)
    pub label: String,
    /// Component model this node instantiates
    pub model: ModelId,
    /// Argument bindings
    pub arguments: BTreeMap<String, String>,
    /// Permanent roots are never garbage-collected by downstream deployment
    pub permanent: bool,
}

/// The mutable graph of component instances and data-flow edges
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// All nodes, indexed by handle
    nodes: BTreeMap<NodeId, PlanNode>,
    /// Dependency edges, parent to children
    children: BTreeMap<NodeId, BTreeSet<NodeId>>,
    /// Data-flow edges
    connections: BTreeSet<Connection>,
    next_id: u32,
}

impl Plan {
    /// Create a new empty plan
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node and return its handle
    pub fn add_node(
        &mut self,
        label: &str,
        model: ModelId,
        arguments: BTreeMap<String, String>,
    ) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            PlanNode {
                id,
                label: label.to_string(),
                model,
                arguments,
                permanent: false,
            },
        );
        id
    }

    /// Mark a node as a permanent root
    pub fn add_permanent(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.permanent = true;
        }
    }

    /// Add a dependency edge from parent to child
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
        self.children.entry(parent).or_default().insert(child);
    }

    /// Add a data-flow edge
    pub fn connect(
        &mut self,
        source: NodeId,
        source_port: &str,
        target: NodeId,
        target_port: &str,
        policy: ConnectionPolicy,
    ) {
        self.connections.insert(Connection {
            source,
            source_port: source_port.to_string(),
            target,
            target_port: target_port.to_string(),
            policy,
        });
    }

    /// Get a node by handle
    pub fn node(&self, id: NodeId) -> Option<&PlanNode> {
        self.nodes.get(&id)
    }

    /// Get a node mutably
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut PlanNode> {
        self.nodes.get_mut(&id)
    }

    /// Iterate over all nodes in handle order
    pub fn nodes(&self) -> impl Iterator<Item = &PlanNode> {
        self.nodes.values()
    }

    /// All node handles
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Permanent roots in handle order
    pub fn roots(&self) -> impl Iterator<Item = &PlanNode> {
        self.nodes.values().filter(|n| n.permanent)
    }

    /// Dependency children of a node
    pub fn children_of(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.children.get(&id).cloned().unwrap_or_default()
    }

    /// Whether `parent` directly depends on `child`
    pub fn depends_on(&self, parent: NodeId, child: NodeId) -> bool {
        self.children
            .get(&parent)
            .is_some_and(|c| c.contains(&child))
    }

    /// Nodes feeding data into `id`
    pub fn input_nodes(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.connections
            .iter()
            .filter(|c| c.target == id)
            .map(|c| c.source)
            .collect()
    }

    /// Iterate over all data-flow edges
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    /// Replace `target` by `survivor` everywhere and remove it
    ///
    /// All dependency edges and data-flow edges are rewired onto the
    /// survivor; permanence is inherited.
    pub fn replace_node(&mut self, target: NodeId, survivor: NodeId) {
        // Dependency edges pointing at the target
        for set in self.children.values_mut() {
            if set.remove(&target) {
                set.insert(survivor);
            }
        }
        // Dependency edges out of the target
        if let Some(target_children) = self.children.remove(&target) {
            let survivor_children = self.children.entry(survivor).or_default();
            for child in target_children {
                if child != survivor {
                    survivor_children.insert(child);
                }
            }
        }
        // Drop any self-dependency produced by the rewiring
        if let Some(set) = self.children.get_mut(&survivor) {
            set.remove(&survivor);
        }
        // Data-flow edges
        let rewired: BTreeSet<Connection> = std::mem::take(&mut self.connections)
            .into_iter()
            .map(|mut c| {
                if c.source == target {
                    c.source = survivor;
                }
                if c.target == target {
                    c.target = survivor;
                }
                c
            })
            .collect();
        self.connections = rewired;
        // Permanence
        let was_permanent = self.nodes.get(&target).is_some_and(|n| n.permanent);
        if was_permanent {
            self.add_permanent(survivor);
        }
        self.nodes.remove(&target);
    }

    /// Serializable snapshot of the whole graph
    pub fn to_graph(&self) -> PlanGraph {
        PlanGraph {
            nodes: self.nodes.values().cloned().collect(),
            dependencies: self
                .children
                .iter()
                .flat_map(|(parent, children)| {
                    children.iter().map(|child| (*parent, *child))
                })
                .collect(),
            connections: self.connections.iter().cloned().collect(),
            roots: self.roots().map(|n| n.id).collect(),
        }
    }
}

/// Serializable plan snapshot for downstream deployment consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanGraph {
    pub nodes: Vec<PlanNode>,
    pub dependencies: Vec<(NodeId, NodeId)>,
    pub connections: Vec<Connection>,
    pub roots: Vec<NodeId>,
}
