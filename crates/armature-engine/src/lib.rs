//! Armature Engine - Resolution of robot component networks
//!
//! This crate turns a declarative robot description into a concrete,
//! connected component graph:
//! - Device and communication-bus declaration store
//! - Explicit instance requests with selection maps
//! - The plan graph with transactional commit
//! - Instantiation, merge, and bus-linking engines behind a single
//!   `Engine::resolve()` entry point

pub mod engine;
pub mod error;
pub mod instance;
mod link;
mod merge;
pub mod plan;
pub mod robot;

pub use engine::Engine;
pub use error::ResolutionError;
pub use instance::InstanceRequest;
pub use plan::{Connection, ConnectionPolicy, NodeId, Plan, PlanGraph, PlanNode};
pub use robot::{BusScope, CommunicationBus, DeviceConfig, ResolvedDevice, Robot, DEVICE_DRIVER};
