//! Component model registry: capability fulfillment and implementation lookup

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::model::{ComponentModel, DataSource, ModelId};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown component model '{0}'")]
    UnknownModel(String),
    #[error("component model '{0}' is already registered")]
    DuplicateModel(String),
    #[error("device type '{0}' refers to unknown capability '{1}'")]
    UnknownCapability(String, String),
}

/// Registry of component models and named device types
///
/// Answers the two questions resolution needs: does model A fulfill
/// capability B, and which concrete models implement capability C.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    /// All models, keyed by name
    models: BTreeMap<String, ComponentModel>,
    /// Device type name to capability model
    device_types: BTreeMap<String, ModelId>,
}

impl ModelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component model
    pub fn register(&mut self, model: ComponentModel) -> Result<(), RegistryError> {
        if self.models.contains_key(model.id.as_str()) {
            return Err(RegistryError::DuplicateModel(model.id.to_string()));
        }
        self.models.insert(model.id.to_string(), model);
        Ok(())
    }

    /// Register a device type name resolving to a capability model
    pub fn register_device_type(
        &mut self,
        type_name: &str,
        capability: &str,
    ) -> Result<(), RegistryError> {
        if !self.models.contains_key(capability) {
            return Err(RegistryError::UnknownCapability(
                type_name.to_string(),
                capability.to_string(),
            ));
        }
        self.device_types
            .insert(type_name.to_string(), ModelId::new(capability));
        Ok(())
    }

    /// Get a model by id
    pub fn get(&self, id: &ModelId) -> Option<&ComponentModel> {
        self.models.get(id.as_str())
    }

    /// Get a model by name
    pub fn get_by_name(&self, name: &str) -> Option<&ComponentModel> {
        self.models.get(name)
    }

    /// Get a model by id, or fail
    pub fn lookup(&self, id: &ModelId) -> Result<&ComponentModel, RegistryError> {
        self.get(id)
            .ok_or_else(|| RegistryError::UnknownModel(id.to_string()))
    }

    /// Capability model registered for a device type name
    pub fn device_type(&self, type_name: &str) -> Option<&ModelId> {
        self.device_types.get(type_name)
    }

    /// Iterate over all registered models in name order
    pub fn models(&self) -> impl Iterator<Item = &ComponentModel> {
        self.models.values()
    }

    /// Whether `model` fulfills `capability`
    ///
    /// Reflexive and transitive over the declared fulfillment edges.
    pub fn fulfills(&self, model: &ModelId, capability: &ModelId) -> bool {
        if model == capability {
            return true;
        }
        let mut visited = BTreeSet::new();
        let mut queue = vec![model.clone()];
        while let Some(current) = queue.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            if &current == capability {
                return true;
            }
            if let Some(m) = self.get(&current) {
                queue.extend(m.fulfills.iter().cloned());
            }
        }
        false
    }

    /// All concrete models fulfilling a capability, in name order
    pub fn models_fulfilling(&self, capability: &ModelId) -> Vec<&ComponentModel> {
        self.models
            .values()
            .filter(|m| !m.is_abstract() && self.fulfills(&m.id, capability))
            .collect()
    }

    /// Keep only the maximally-concrete candidates
    ///
    /// A candidate is discarded when another candidate fulfills it, i.e. is
    /// strictly more concrete.
    pub fn most_concrete<'a>(
        &self,
        candidates: Vec<&'a ComponentModel>,
    ) -> Vec<&'a ComponentModel> {
        candidates
            .iter()
            .filter(|m| {
                !candidates
                    .iter()
                    .any(|other| other.id != m.id && self.fulfills(&other.id, &m.id))
            })
            .copied()
            .collect()
    }

    /// Root data source of `model` providing `capability`, if any
    pub fn data_source_for<'a>(
        &self,
        model: &'a ComponentModel,
        capability: &ModelId,
    ) -> Option<&'a DataSource> {
        model
            .data_sources
            .iter()
            .find(|ds| self.fulfills(&ds.capability, capability))
    }
}
