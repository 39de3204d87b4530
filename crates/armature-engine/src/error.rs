//! Resolution error taxonomy

use armature_model::{ModelId, RegistryError};
use thiserror::Error;

/// Any inconsistency detected during a resolution run
///
/// Every variant aborts the current run immediately; there is no recovery
/// or retry inside the engine. A failed run leaves the committed plan
/// untouched.
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("device '{0}' is already defined")]
    DuplicateDevice(String),

    #[error("unknown device type '{0}'")]
    UnknownDeviceType(String),

    #[error("device type '{device_type}' resolves to '{capability}', which is not a {expected}")]
    IncompatibleCapability {
        device_type: String,
        capability: ModelId,
        expected: ModelId,
    },

    #[error("{candidates:?} are all valid for {subject}, select one explicitly")]
    AmbiguousResolution {
        subject: String,
        candidates: Vec<String>,
    },

    #[error("no concrete component model can handle devices of type '{0}'")]
    NoImplementationFound(String),

    #[error("ambiguities left in the plan, still-abstract nodes: {nodes:?}")]
    UnresolvedAbstractNode { nodes: Vec<String> },

    #[error("communication bus '{0}' does not exist")]
    UnknownBus(String),

    #[error("model '{model}' declared as bus '{name}' carries no message type")]
    NotABus { name: String, model: ModelId },

    #[error("cannot use an explicit com_bus for '{device}' inside a through block")]
    ComBusInThroughScope { device: String },

    #[error("unknown model or subsystem '{0}' in selection")]
    UnknownSelection(String),

    #[error("no plan node is registered under '{0}', cannot link it to its bus")]
    MissingPlanNode(String),

    #[error("'{task}' has a generic port on bus '{bus}' but no declared bus role")]
    MissingBusRole { task: String, bus: String },

    #[error(
        "'{task}' is connected to bus '{bus}' but has no ports of type \
         '{message_type}' that would allow to connect to it"
    )]
    NoBusConnectionPossible {
        task: String,
        bus: String,
        message_type: String,
    },

    #[error("merging cyclic component graphs is not supported, remaining nodes: {nodes:?}")]
    UnsupportedCyclicMerge { nodes: Vec<String> },

    #[error("model registry error: {0}")]
    Registry(#[from] RegistryError),
}
