//! Explicit component instantiation requests

use armature_model::ModelId;
use std::collections::BTreeMap;

/// A user-requested component instantiation, not tied to a device
///
/// Carries the model to instantiate, constructor arguments, and a selection
/// map resolving the request's sub-dependencies by name.
#[derive(Debug, Clone)]
pub struct InstanceRequest {
    /// Optional name the resulting node is registered under
    pub name: Option<String>,
    /// Model to instantiate
    pub model: ModelId,
    /// Constructor arguments
    pub arguments: BTreeMap<String, String>,
    /// Sub-dependency name to chosen model or instance name
    pub selections: BTreeMap<String, String>,
}

impl InstanceRequest {
    /// Request an anonymous instance of a model
    pub fn new(model: &str) -> Self {
        Self {
            name: None,
            model: ModelId::new(model),
            arguments: BTreeMap::new(),
            selections: BTreeMap::new(),
        }
    }

    /// Request a named instance of a model
    pub fn named(name: &str, model: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::new(model)
        }
    }

    pub fn with_argument(mut self, key: &str, value: &str) -> Self {
        self.arguments.insert(key.to_string(), value.to_string());
        self
    }

    /// Select what fills a sub-dependency: a model name, a built subsystem
    /// or device name, or an abstract capability name
    pub fn use_selection(mut self, dependency: &str, selection: &str) -> Self {
        self.selections
            .insert(dependency.to_string(), selection.to_string());
        self
    }
}
