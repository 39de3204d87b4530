//! Device and communication-bus declaration store
//!
//! A robot description is a set of named devices, some of which are
//! communication busses multiplexing I/O for other devices. Each
//! declaration is resolved to exactly one concrete component instantiation
//! request at declaration time; an unresolvable declaration fails
//! immediately with a descriptive error.

use armature_model::{ModelId, ModelRegistry};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::ResolutionError;

/// Capability every declared device is expected to fulfill by default
pub const DEVICE_DRIVER: &str = "device-driver";

/// Optional settings of a device declaration
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    /// Explicit capability model, overriding the device-type lookup
    pub model: Option<ModelId>,
    /// Expected capability, defaults to [`DEVICE_DRIVER`]
    pub expected_capability: Option<ModelId>,
    /// Communication bus carrying this device's I/O
    pub com_bus: Option<String>,
    /// Role name used when wiring a generic bus port
    pub bus_role: Option<String>,
    /// Additional constructor arguments
    pub arguments: BTreeMap<String, String>,
}

impl DeviceConfig {
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = Some(ModelId::new(model));
        self
    }

    pub fn with_expected_capability(mut self, capability: &str) -> Self {
        self.expected_capability = Some(ModelId::new(capability));
        self
    }

    pub fn on_bus(mut self, bus: &str) -> Self {
        self.com_bus = Some(bus.to_string());
        self
    }

    pub fn with_bus_role(mut self, role: &str) -> Self {
        self.bus_role = Some(role.to_string());
        self
    }

    pub fn with_argument(mut self, key: &str, value: &str) -> Self {
        self.arguments.insert(key.to_string(), value.to_string());
        self
    }
}

/// A device declaration resolved to a concrete instantiation request
#[derive(Debug, Clone)]
pub struct ResolvedDevice {
    /// Device name, unique within the robot
    pub name: String,
    /// Declared device type
    pub device_type: String,
    /// Capability the declaration resolved to
    pub capability: ModelId,
    /// Concrete component model chosen for the capability
    pub model: ModelId,
    /// Argument bindings, including the `"<source>_name"` binding
    pub arguments: BTreeMap<String, String>,
    /// Communication bus carrying this device's I/O
    pub com_bus: Option<String>,
    /// Role name used when wiring a generic bus port
    pub bus_role: Option<String>,
}

/// A communication bus: a device that multiplexes a message type for the
/// devices declared through it
#[derive(Debug, Clone)]
pub struct CommunicationBus {
    /// Bus name (also a device name)
    pub name: String,
    /// Message type multiplexed on the bus
    pub message_type: String,
    /// Names of devices declared through this bus
    pub members: Vec<String>,
}

impl CommunicationBus {
    /// Name of the bus output port toward a client role
    pub fn output_name_for(&self, role: &str) -> String {
        role.to_string()
    }

    /// Name of the bus input port written by a client role
    pub fn input_name_for(&self, role: &str) -> String {
        format!("w{role}")
    }
}

/// Per-robot registry of declared devices and communication busses
#[derive(Debug, Clone, Default)]
pub struct Robot {
    /// Devices in declaration order
    devices: Vec<ResolvedDevice>,
    /// Device name to index in `devices`
    index: BTreeMap<String, usize>,
    /// Derived `"<device>.<child>"` names to the owning device
    aliases: BTreeMap<String, String>,
    /// Declared communication busses
    com_busses: BTreeMap<String, CommunicationBus>,
}

impl Robot {
    /// Create an empty robot description
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a communication bus
    ///
    /// The bus is registered both as a bus and as an ordinary device of the
    /// same name, so other devices may depend on it like on any device.
    pub fn declare_bus(
        &mut self,
        registry: &ModelRegistry,
        type_name: &str,
        name: &str,
        config: DeviceConfig,
    ) -> Result<(), ResolutionError> {
        let device = self.resolve_device(registry, type_name, name, config)?;
        let model = registry.lookup(&device.model)?;
        let message_type = model.message_type.clone().ok_or_else(|| {
            ResolutionError::NotABus {
                name: name.to_string(),
                model: device.model.clone(),
            }
        })?;
        self.com_busses.insert(
            name.to_string(),
            CommunicationBus {
                name: name.to_string(),
                message_type,
                members: Vec::new(),
            },
        );
        self.insert_device(registry, device)
    }

    /// Declare a device
    ///
    /// Resolves the declaration to exactly one concrete component model:
    /// explicit override or device-type lookup, expected-capability check,
    /// then the unique maximally-concrete implementation of the capability.
    pub fn declare_device(
        &mut self,
        registry: &ModelRegistry,
        type_name: &str,
        name: &str,
        config: DeviceConfig,
    ) -> Result<(), ResolutionError> {
        let device = self.resolve_device(registry, type_name, name, config)?;
        self.insert_device(registry, device)
    }

    /// Declare devices in a scope where `com_bus` is set automatically
    pub fn through<F>(
        &mut self,
        registry: &ModelRegistry,
        bus_name: &str,
        f: F,
    ) -> Result<(), ResolutionError>
    where
        F: FnOnce(&mut BusScope<'_>) -> Result<(), ResolutionError>,
    {
        if !self.com_busses.contains_key(bus_name) {
            return Err(ResolutionError::UnknownBus(bus_name.to_string()));
        }
        let mut scope = BusScope {
            robot: self,
            registry,
            bus: bus_name.to_string(),
        };
        f(&mut scope)
    }

    /// Devices in declaration order
    pub fn devices(&self) -> impl Iterator<Item = &ResolvedDevice> {
        self.devices.iter()
    }

    /// Get a device by name, following derived child names
    pub fn device(&self, name: &str) -> Option<&ResolvedDevice> {
        let name = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        self.index.get(name).map(|&i| &self.devices[i])
    }

    /// Get a communication bus by name
    pub fn com_bus(&self, name: &str) -> Option<&CommunicationBus> {
        self.com_busses.get(name)
    }

    /// Derived child names and the devices that own them
    pub fn aliases(&self) -> impl Iterator<Item = (&String, &String)> {
        self.aliases.iter()
    }

    fn resolve_device(
        &self,
        registry: &ModelRegistry,
        type_name: &str,
        name: &str,
        config: DeviceConfig,
    ) -> Result<ResolvedDevice, ResolutionError> {
        if self.index.contains_key(name) || self.aliases.contains_key(name) {
            return Err(ResolutionError::DuplicateDevice(name.to_string()));
        }

        let capability = match config.model {
            Some(model) => model,
            None => registry
                .device_type(type_name)
                .cloned()
                .ok_or_else(|| ResolutionError::UnknownDeviceType(type_name.to_string()))?,
        };
        registry.lookup(&capability)?;

        let expected = config
            .expected_capability
            .unwrap_or_else(|| ModelId::new(DEVICE_DRIVER));
        if !registry.fulfills(&capability, &expected) {
            return Err(ResolutionError::IncompatibleCapability {
                device_type: type_name.to_string(),
                capability,
                expected,
            });
        }

        // We want to drive one particular device, so we need a concrete
        // task model: enumerate the implementations and keep the
        // maximally-concrete ones.
        let candidates = registry.most_concrete(registry.models_fulfilling(&capability));
        let model = match candidates.as_slice() {
            [] => {
                return Err(ResolutionError::NoImplementationFound(
                    type_name.to_string(),
                ))
            }
            [only] => *only,
            many => {
                return Err(ResolutionError::AmbiguousResolution {
                    subject: format!("device '{name}'"),
                    candidates: many.iter().map(|m| m.id.to_string()).collect(),
                })
            }
        };

        if let Some(bus) = &config.com_bus {
            if !self.com_busses.contains_key(bus) {
                return Err(ResolutionError::UnknownBus(bus.clone()));
            }
        }

        let source_name = registry
            .data_source_for(model, &capability)
            .map(|ds| ds.name.clone())
            .unwrap_or_else(|| type_name.to_string());
        let mut arguments = config.arguments;
        arguments.insert(format!("{source_name}_name"), name.to_string());

        debug!(
            device = %name,
            device_type = %type_name,
            model = %model.id,
            "resolved device declaration"
        );

        Ok(ResolvedDevice {
            name: name.to_string(),
            device_type: type_name.to_string(),
            capability,
            model: model.id.clone(),
            arguments,
            com_bus: config.com_bus,
            bus_role: config.bus_role,
        })
    }

    fn insert_device(
        &mut self,
        registry: &ModelRegistry,
        device: ResolvedDevice,
    ) -> Result<(), ResolutionError> {
        let model = registry.lookup(&device.model)?;
        if let Some(source) = registry.data_source_for(model, &device.capability) {
            for child in &source.children {
                self.aliases
                    .insert(format!("{}.{}", device.name, child.name), device.name.clone());
            }
        }
        if let Some(bus) = &device.com_bus {
            if let Some(bus) = self.com_busses.get_mut(bus) {
                bus.members.push(device.name.clone());
            }
        }
        self.index.insert(device.name.clone(), self.devices.len());
        self.devices.push(device);
        Ok(())
    }
}

/// Declaration scope opened by [`Robot::through`]
pub struct BusScope<'a> {
    robot: &'a mut Robot,
    registry: &'a ModelRegistry,
    bus: String,
}

impl BusScope<'_> {
    /// Declare a device passing through the scope's bus
    pub fn declare_device(
        &mut self,
        type_name: &str,
        name: &str,
        mut config: DeviceConfig,
    ) -> Result<(), ResolutionError> {
        if config.com_bus.is_some() {
            return Err(ResolutionError::ComBusInThroughScope {
                device: name.to_string(),
            });
        }
        config.com_bus = Some(self.bus.clone());
        self.robot
            .declare_device(self.registry, type_name, name, config)
    }
}
