//! Bus-linking engine: wire device drivers to their communication busses
//!
//! Runs after merging. Every device driver declared with a communication
//! bus must end up connected to it port-for-port; a device that declares a
//! bus dependency but cannot be wired is an error, never a silent skip.

use armature_model::{ModelRegistry, Port};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::ResolutionError;
use crate::plan::{ConnectionPolicy, NodeId, Plan};
use crate::robot::Robot;

/// Wire each device driver's message ports to its declared bus
pub(crate) fn link_to_busses(
    registry: &ModelRegistry,
    robot: &Robot,
    plan: &mut Plan,
    tasks: &BTreeMap<String, NodeId>,
) -> Result<(), ResolutionError> {
    for device in robot.devices() {
        let Some(bus_name) = &device.com_bus else {
            continue;
        };
        let bus = robot
            .com_bus(bus_name)
            .ok_or_else(|| ResolutionError::UnknownBus(bus_name.clone()))?;
        let &driver = tasks
            .get(&device.name)
            .ok_or_else(|| ResolutionError::MissingPlanNode(device.name.clone()))?;
        let &bus_node = tasks
            .get(bus_name)
            .ok_or_else(|| ResolutionError::MissingPlanNode(bus_name.clone()))?;

        // Already depending on the bus means already linked
        if plan.depends_on(driver, bus_node) {
            continue;
        }

        let model = registry.lookup(&device.model)?;
        let mut in_candidates: Vec<&Port> = model
            .each_input()
            .filter(|p| p.message_type == bus.message_type)
            .collect();
        let mut out_candidates: Vec<&Port> = model
            .each_output()
            .filter(|p| p.message_type == bus.message_type)
            .collect();
        if in_candidates.is_empty() && out_candidates.is_empty() {
            return Err(ResolutionError::NoBusConnectionPossible {
                task: device.name.clone(),
                bus: bus_name.clone(),
                message_type: bus.message_type.clone(),
            });
        }

        plan.add_child(driver, bus_node);

        // Source-specific ports first: candidates whose name contains the
        // data source name
        let mut used_ports: BTreeSet<String> = BTreeSet::new();
        for source in model.each_root_data_source() {
            let ins: Vec<&Port> = in_candidates
                .iter()
                .filter(|p| p.name.contains(&source.name))
                .copied()
                .collect();
            let outs: Vec<&Port> = out_candidates
                .iter()
                .filter(|p| p.name.contains(&source.name))
                .copied()
                .collect();
            if ins.len() > 1 {
                return Err(ResolutionError::AmbiguousResolution {
                    subject: format!(
                        "connecting '{bus_name}' to '{}' in '{}'",
                        source.name, device.name
                    ),
                    candidates: ins.iter().map(|p| p.name.clone()).collect(),
                });
            }
            if outs.len() > 1 {
                return Err(ResolutionError::AmbiguousResolution {
                    subject: format!(
                        "connecting '{}' in '{}' to '{bus_name}'",
                        source.name, device.name
                    ),
                    candidates: outs.iter().map(|p| p.name.clone()).collect(),
                });
            }
            if let [port] = ins.as_slice() {
                used_ports.insert(port.name.clone());
                plan.connect(
                    bus_node,
                    &bus.output_name_for(&source.name),
                    driver,
                    &port.name,
                    ConnectionPolicy::default(),
                );
            }
            if let [port] = outs.as_slice() {
                used_ports.insert(port.name.clone());
                plan.connect(
                    driver,
                    &port.name,
                    bus_node,
                    &bus.input_name_for(&source.name),
                    ConnectionPolicy::default(),
                );
            }
        }

        // A single leftover candidate per side is the driver's generic bus
        // port, keyed by its declared bus role
        in_candidates.retain(|p| !used_ports.contains(&p.name));
        out_candidates.retain(|p| !used_ports.contains(&p.name));

        if in_candidates.len() > 1 {
            return Err(ResolutionError::AmbiguousResolution {
                subject: format!("unused input ports while connecting '{}' to '{bus_name}'", device.name),
                candidates: in_candidates.iter().map(|p| p.name.clone()).collect(),
            });
        }
        if let [port] = in_candidates.as_slice() {
            let role = device.bus_role.as_ref().ok_or_else(|| {
                ResolutionError::MissingBusRole {
                    task: device.name.clone(),
                    bus: bus_name.clone(),
                }
            })?;
            plan.connect(
                bus_node,
                &bus.output_name_for(role),
                driver,
                &port.name,
                ConnectionPolicy::default(),
            );
        }

        if out_candidates.len() > 1 {
            return Err(ResolutionError::AmbiguousResolution {
                subject: format!("unused output ports while connecting '{}' to '{bus_name}'", device.name),
                candidates: out_candidates.iter().map(|p| p.name.clone()).collect(),
            });
        }
        if let [port] = out_candidates.as_slice() {
            let role = device.bus_role.as_ref().ok_or_else(|| {
                ResolutionError::MissingBusRole {
                    task: device.name.clone(),
                    bus: bus_name.clone(),
                }
            })?;
            plan.connect(
                driver,
                &port.name,
                bus_node,
                &bus.input_name_for(role),
                ConnectionPolicy::default(),
            );
        }

        debug!(device = %device.name, bus = %bus_name, "linked device to bus");
    }
    Ok(())
}
