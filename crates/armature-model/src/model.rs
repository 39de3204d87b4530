//! Component model types: ports, data sources, and merge policies

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Unique identifier for a component model
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelId(pub String);

impl ModelId {
    /// Create a new ModelId from a model name
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ModelId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A named port on a component model, typed by a message type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Port name, unique per direction within one model
    pub name: String,
    /// Message type carried by the port (opaque type name)
    pub message_type: String,
}

impl Port {
    pub fn new(name: &str, message_type: &str) -> Self {
        Self {
            name: name.to_string(),
            message_type: message_type.to_string(),
        }
    }
}

/// A logical sub-role of a component model (e.g. a sub-sensor)
///
/// Root data sources drive device-name bindings: a device declared against
/// this model gets the argument `"<source>_name"` and each child source is
/// registered under the derived name `"<device>.<child>"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    /// Source name (used for port matching during bus linking)
    pub name: String,
    /// Capability this source provides
    pub capability: ModelId,
    /// Child sources, registered under derived device names
    #[serde(default)]
    pub children: Vec<DataSource>,
}

impl DataSource {
    pub fn new(name: &str, capability: &str) -> Self {
        Self {
            name: name.to_string(),
            capability: ModelId::new(capability),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: DataSource) -> Self {
        self.children.push(child);
        self
    }
}

/// Model-level merge compatibility for two instances of the same model
///
/// Replaces a per-model predicate hook with a fixed set of variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Instances merge only when their argument maps are equal
    SameArguments,
    /// Instances of this model always merge
    Always,
    /// Instances of this model never merge
    Never,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self::SameArguments
    }
}

impl MergePolicy {
    /// Whether two instances with the given argument maps may merge
    pub fn allows(
        &self,
        a: &BTreeMap<String, String>,
        b: &BTreeMap<String, String>,
    ) -> bool {
        match self {
            Self::SameArguments => a == b,
            Self::Always => true,
            Self::Never => false,
        }
    }
}

/// A child role inside a composition model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositionChild {
    /// Role name, unique within the composition
    pub role: String,
    /// Model (possibly abstract) filling the role by default
    pub model: ModelId,
}

/// A model-level connection between two child roles of a composition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConnection {
    pub source_role: String,
    pub source_port: String,
    pub target_role: String,
    pub target_port: String,
}

/// What kind of component a model describes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// A capability: never instantiable, only fulfilled by concrete models
    Abstract,
    /// A concrete leaf component
    Task,
    /// A composite of child roles with model-level connections
    Composition {
        children: Vec<CompositionChild>,
        #[serde(default)]
        connections: Vec<ModelConnection>,
        /// Recompute type-based auto-connections on every resolution run
        #[serde(default)]
        auto_connect: bool,
    },
}

/// Description of a component type, abstract or concrete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentModel {
    /// Model identity
    pub id: ModelId,
    /// Abstract capability, concrete task, or composition
    pub kind: ModelKind,
    /// Capabilities this model directly fulfills
    #[serde(default)]
    pub fulfills: BTreeSet<ModelId>,
    /// Input ports
    #[serde(default)]
    pub inputs: Vec<Port>,
    /// Output ports
    #[serde(default)]
    pub outputs: Vec<Port>,
    /// Root data sources
    #[serde(default)]
    pub data_sources: Vec<DataSource>,
    /// Merge compatibility between instances of this model
    #[serde(default)]
    pub merge_policy: MergePolicy,
    /// Message type multiplexed by this model, when it drives a bus
    #[serde(default)]
    pub message_type: Option<String>,
}

impl ComponentModel {
    /// Create an abstract capability model
    pub fn capability(name: &str) -> Self {
        Self {
            id: ModelId::new(name),
            kind: ModelKind::Abstract,
            fulfills: BTreeSet::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            data_sources: Vec::new(),
            merge_policy: MergePolicy::default(),
            message_type: None,
        }
    }

    /// Create a concrete task model
    pub fn task(name: &str) -> Self {
        Self {
            kind: ModelKind::Task,
            ..Self::capability(name)
        }
    }

    /// Create a composition model from its child roles
    pub fn composition(name: &str, children: Vec<CompositionChild>) -> Self {
        Self {
            kind: ModelKind::Composition {
                children,
                connections: Vec::new(),
                auto_connect: false,
            },
            ..Self::capability(name)
        }
    }

    /// Declare that this model fulfills a capability
    pub fn fulfilling(mut self, capability: &str) -> Self {
        self.fulfills.insert(ModelId::new(capability));
        self
    }

    pub fn with_input(mut self, name: &str, message_type: &str) -> Self {
        self.inputs.push(Port::new(name, message_type));
        self
    }

    pub fn with_output(mut self, name: &str, message_type: &str) -> Self {
        self.outputs.push(Port::new(name, message_type));
        self
    }

    pub fn with_data_source(mut self, source: DataSource) -> Self {
        self.data_sources.push(source);
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    /// Mark this model as a bus driver multiplexing the given message type
    pub fn with_message_type(mut self, message_type: &str) -> Self {
        self.message_type = Some(message_type.to_string());
        self
    }

    /// Add a model-level connection to a composition
    ///
    /// No effect on non-composition models.
    pub fn with_connection(mut self, connection: ModelConnection) -> Self {
        if let ModelKind::Composition { connections, .. } = &mut self.kind {
            connections.push(connection);
        }
        self
    }

    /// Enable type-based auto-connection on a composition
    pub fn auto_connected(mut self) -> Self {
        if let ModelKind::Composition { auto_connect, .. } = &mut self.kind {
            *auto_connect = true;
        }
        self
    }

    /// Whether this model is an abstract capability
    pub fn is_abstract(&self) -> bool {
        matches!(self.kind, ModelKind::Abstract)
    }

    /// Iterate over input ports
    pub fn each_input(&self) -> impl Iterator<Item = &Port> {
        self.inputs.iter()
    }

    /// Iterate over output ports
    pub fn each_output(&self) -> impl Iterator<Item = &Port> {
        self.outputs.iter()
    }

    /// Iterate over root data sources
    pub fn each_root_data_source(&self) -> impl Iterator<Item = &DataSource> {
        self.data_sources.iter()
    }
}
