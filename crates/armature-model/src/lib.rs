//! Armature Model - Component models and the capability registry
//!
//! This crate provides the model layer of the Armature system:
//! - Component model descriptions (abstract capabilities, concrete tasks,
//!   compositions) with ports and data sources
//! - Merge policies governing when two instances of a model may collapse
//! - The model registry answering capability fulfillment and implementation
//!   lookup queries

pub mod model;
pub mod registry;

pub use model::{
    ComponentModel, CompositionChild, DataSource, MergePolicy, ModelConnection, ModelId,
    ModelKind, Port,
};
pub use registry::{ModelRegistry, RegistryError};
