//! The resolution engine
//!
//! Owns the model registry, the robot description, and the explicit
//! instance requests for the duration of a resolution run. `resolve()`
//! instantiates everything into a working plan, validates that no abstract
//! node is left, merges structurally-equivalent instances, links device
//! drivers to their busses, and commits the working plan atomically.

use armature_model::{ModelConnection, ModelId, ModelKind, ModelRegistry};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::error::ResolutionError;
use crate::instance::InstanceRequest;
use crate::link;
use crate::merge;
use crate::plan::{ConnectionPolicy, NodeId, Plan, PlanNode};
use crate::robot::{DeviceConfig, Robot};

/// Resolution context and committed plan
///
/// All state lives here explicitly; nothing survives between runs outside
/// this value.
#[derive(Debug, Default)]
pub struct Engine {
    registry: ModelRegistry,
    robot: Robot,
    requests: Vec<InstanceRequest>,
    plan: Plan,
    tasks: BTreeMap<String, NodeId>,
}

impl Engine {
    /// Create an engine over a model registry
    pub fn new(registry: ModelRegistry) -> Self {
        Self {
            registry,
            ..Self::default()
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn robot(&self) -> &Robot {
        &self.robot
    }

    /// The committed plan
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Declare a communication bus on the robot
    pub fn declare_bus(
        &mut self,
        type_name: &str,
        name: &str,
        config: DeviceConfig,
    ) -> Result<(), ResolutionError> {
        self.robot.declare_bus(&self.registry, type_name, name, config)
    }

    /// Declare a device on the robot
    pub fn declare_device(
        &mut self,
        type_name: &str,
        name: &str,
        config: DeviceConfig,
    ) -> Result<(), ResolutionError> {
        self.robot
            .declare_device(&self.registry, type_name, name, config)
    }

    /// Declare devices through a bus
    pub fn through<F>(&mut self, bus_name: &str, f: F) -> Result<(), ResolutionError>
    where
        F: FnOnce(&mut crate::robot::BusScope<'_>) -> Result<(), ResolutionError>,
    {
        self.robot.through(&self.registry, bus_name, f)
    }

    /// Queue an explicit instantiation request
    pub fn add(&mut self, request: InstanceRequest) {
        self.requests.push(request);
    }

    /// Node currently registered under a device or subsystem name
    pub fn subsystem(&self, name: &str) -> Option<&PlanNode> {
        self.tasks.get(name).and_then(|id| self.plan.node(*id))
    }

    /// Resolve the declarative input into a committed plan
    ///
    /// Runs instantiate, validate, merge, and bus linking on a transient
    /// working plan; the committed plan is replaced only when every step
    /// succeeds, and left untouched otherwise.
    pub fn resolve(&mut self) -> Result<(), ResolutionError> {
        let mut resolution = Resolution {
            registry: &self.registry,
            robot: &self.robot,
            plan: Plan::new(),
            tasks: BTreeMap::new(),
            auto_connections: compute_auto_connections(&self.registry),
        };

        resolution.instantiate(&self.requests)?;
        resolution.validate()?;
        merge::merge_plan(&self.registry, &mut resolution.plan, &mut resolution.tasks)?;
        link::link_to_busses(
            &self.registry,
            &self.robot,
            &mut resolution.plan,
            &resolution.tasks,
        )?;

        info!(
            nodes = resolution.plan.len(),
            connections = resolution.plan.connections().count(),
            "resolution committed"
        );

        let Resolution { plan, tasks, .. } = resolution;
        self.plan = plan;
        self.tasks = tasks;
        Ok(())
    }
}

/// What a selection key resolved to
enum Selection {
    Model(ModelId),
    Node(NodeId),
}

/// Working state of one resolution run
struct Resolution<'a> {
    registry: &'a ModelRegistry,
    robot: &'a Robot,
    plan: Plan,
    tasks: BTreeMap<String, NodeId>,
    auto_connections: BTreeMap<ModelId, Vec<ModelConnection>>,
}

impl Resolution<'_> {
    fn instantiate(&mut self, requests: &[InstanceRequest]) -> Result<(), ResolutionError> {
        // Devices first, in declaration order
        for device in self.robot.devices() {
            let node = self.instantiate_model(
                &device.model,
                &device.name,
                device.arguments.clone(),
                &BTreeMap::new(),
            )?;
            self.tasks.insert(device.name.clone(), node);
            self.plan.add_permanent(node);
            debug!(device = %device.name, node = %node, "instantiated device");
        }
        for (alias, owner) in self.robot.aliases() {
            if let Some(&node) = self.tasks.get(owner) {
                self.tasks.insert(alias.clone(), node);
            }
        }

        // Then the explicit requests
        for request in requests {
            let mut selections = BTreeMap::new();
            for (dependency, key) in &request.selections {
                selections.insert(dependency.clone(), self.apply_selection(key)?);
            }
            let label = request
                .name
                .clone()
                .unwrap_or_else(|| request.model.to_string());
            let node = self.instantiate_model(
                &request.model,
                &label,
                request.arguments.clone(),
                &selections,
            )?;
            if let Some(name) = &request.name {
                self.tasks.insert(name.clone(), node);
            }
            self.plan.add_permanent(node);
            debug!(request = %label, node = %node, "instantiated request");
        }
        Ok(())
    }

    /// Create the plan node(s) for one model instance
    fn instantiate_model(
        &mut self,
        model_id: &ModelId,
        label: &str,
        arguments: BTreeMap<String, String>,
        selections: &BTreeMap<String, Selection>,
    ) -> Result<NodeId, ResolutionError> {
        let model = self.registry.lookup(model_id)?.clone();
        let node = self.plan.add_node(label, model_id.clone(), arguments);

        if let ModelKind::Composition {
            children,
            connections,
            ..
        } = &model.kind
        {
            let mut role_nodes: BTreeMap<String, NodeId> = BTreeMap::new();
            for child in children {
                let selected = selections
                    .get(&child.role)
                    .or_else(|| selections.get(child.model.as_str()));
                let child_node = match selected {
                    Some(Selection::Node(existing)) => *existing,
                    Some(Selection::Model(model)) => self.instantiate_model(
                        &model.clone(),
                        &format!("{label}.{}", child.role),
                        BTreeMap::new(),
                        selections,
                    )?,
                    None => {
                        let concrete = self.concrete_child_model(&child.model);
                        self.instantiate_model(
                            &concrete,
                            &format!("{label}.{}", child.role),
                            BTreeMap::new(),
                            selections,
                        )?
                    }
                };
                self.plan.add_child(node, child_node);
                role_nodes.insert(child.role.clone(), child_node);
            }

            let auto = self.auto_connections.get(model_id).cloned().unwrap_or_default();
            for connection in connections.iter().chain(auto.iter()) {
                let (Some(&source), Some(&target)) = (
                    role_nodes.get(&connection.source_role),
                    role_nodes.get(&connection.target_role),
                ) else {
                    warn!(
                        model = %model_id,
                        source = %connection.source_role,
                        target = %connection.target_role,
                        "connection references unknown composition role"
                    );
                    continue;
                };
                self.plan.connect(
                    source,
                    &connection.source_port,
                    target,
                    &connection.target_port,
                    ConnectionPolicy::default(),
                );
            }
        }
        Ok(node)
    }

    /// Resolve an unselected composition child to a concrete model
    ///
    /// A unique maximally-concrete implementation is used; anything else
    /// leaves the child abstract so validation can report it.
    fn concrete_child_model(&self, model: &ModelId) -> ModelId {
        let Some(child_model) = self.registry.get(model) else {
            return model.clone();
        };
        if !child_model.is_abstract() {
            return model.clone();
        }
        let candidates = self
            .registry
            .most_concrete(self.registry.models_fulfilling(model));
        match candidates.as_slice() {
            [only] => only.id.clone(),
            _ => model.clone(),
        }
    }

    /// Resolve a selection key, in order: concrete model, built subsystem
    /// or device, device type, abstract capability
    fn apply_selection(&self, key: &str) -> Result<Selection, ResolutionError> {
        if let Some(model) = self.registry.get_by_name(key) {
            if !model.is_abstract() {
                return Ok(Selection::Model(model.id.clone()));
            }
        }
        if let Some(&node) = self.tasks.get(key) {
            return Ok(Selection::Node(node));
        }

        let capability = match self.registry.get_by_name(key) {
            Some(model) => Some(model.id.clone()),
            None => self.registry.device_type(key).cloned(),
        };
        let Some(capability) = capability else {
            return Err(ResolutionError::UnknownSelection(key.to_string()));
        };
        let candidates = self
            .registry
            .most_concrete(self.registry.models_fulfilling(&capability));
        match candidates.as_slice() {
            [] => Err(ResolutionError::NoImplementationFound(key.to_string())),
            [only] => Ok(Selection::Model(only.id.clone())),
            many => Err(ResolutionError::AmbiguousResolution {
                subject: format!("selection '{key}'"),
                candidates: many.iter().map(|m| m.id.to_string()).collect(),
            }),
        }
    }

    /// Fail if any node's model is still abstract
    fn validate(&self) -> Result<(), ResolutionError> {
        let still_abstract: Vec<String> = self
            .plan
            .nodes()
            .filter(|n| {
                self.registry
                    .get(&n.model)
                    .map_or(true, |m| m.is_abstract())
            })
            .map(|n| n.label.clone())
            .collect();
        if still_abstract.is_empty() {
            Ok(())
        } else {
            Err(ResolutionError::UnresolvedAbstractNode {
                nodes: still_abstract,
            })
        }
    }
}

/// Recompute type-based auto-connections for every composition that
/// supports them, before any instance creation
fn compute_auto_connections(
    registry: &ModelRegistry,
) -> BTreeMap<ModelId, Vec<ModelConnection>> {
    let mut result = BTreeMap::new();
    for model in registry.models() {
        let ModelKind::Composition {
            children,
            connections,
            auto_connect: true,
        } = &model.kind
        else {
            continue;
        };

        // All type-compatible (output, input) pairings between roles
        let mut candidates: Vec<ModelConnection> = Vec::new();
        for source in children {
            let Some(source_model) = registry.get(&source.model) else {
                continue;
            };
            for out in source_model.each_output() {
                for target in children {
                    if target.role == source.role {
                        continue;
                    }
                    let Some(target_model) = registry.get(&target.model) else {
                        continue;
                    };
                    for inp in target_model.each_input() {
                        if inp.message_type != out.message_type {
                            continue;
                        }
                        let explicit = connections.iter().any(|c| {
                            c.target_role == target.role && c.target_port == inp.name
                        });
                        if explicit {
                            continue;
                        }
                        candidates.push(ModelConnection {
                            source_role: source.role.clone(),
                            source_port: out.name.clone(),
                            target_role: target.role.clone(),
                            target_port: inp.name.clone(),
                        });
                    }
                }
            }
        }

        // Keep only pairings unambiguous on both sides
        let unambiguous: Vec<ModelConnection> = candidates
            .iter()
            .filter(|c| {
                let from_source = candidates
                    .iter()
                    .filter(|o| {
                        o.source_role == c.source_role && o.source_port == c.source_port
                    })
                    .count();
                let into_target = candidates
                    .iter()
                    .filter(|o| {
                        o.target_role == c.target_role && o.target_port == c.target_port
                    })
                    .count();
                from_source == 1 && into_target == 1
            })
            .cloned()
            .collect();
        if !unambiguous.is_empty() {
            debug!(model = %model.id, connections = unambiguous.len(), "auto-connected composition");
            result.insert(model.id.clone(), unambiguous);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use armature_model::{
        ComponentModel, CompositionChild, DataSource, MergePolicy, ModelConnection,
    };
    use crate::robot::DEVICE_DRIVER;

    fn base_registry() -> ModelRegistry {
        let mut registry = ModelRegistry::new();
        registry
            .register(ComponentModel::capability(DEVICE_DRIVER))
            .unwrap();
        registry
            .register(ComponentModel::capability("com-bus").fulfilling(DEVICE_DRIVER))
            .unwrap();
        registry
            .register(
                ComponentModel::task("can_task")
                    .fulfilling("com-bus")
                    .with_message_type("can/Message"),
            )
            .unwrap();
        registry
            .register(ComponentModel::capability("motor").fulfilling(DEVICE_DRIVER))
            .unwrap();
        registry
            .register(
                ComponentModel::task("motor_task")
                    .fulfilling("motor")
                    .with_input("can_in", "can/Message")
                    .with_output("can_out", "can/Message"),
            )
            .unwrap();
        registry.register_device_type("can", "com-bus").unwrap();
        registry.register_device_type("motor", "motor").unwrap();
        registry
    }

    #[test]
    fn test_bus_and_driver_are_wired() {
        let mut engine = Engine::new(base_registry());
        engine
            .declare_bus("can", "can0", DeviceConfig::default())
            .unwrap();
        engine
            .declare_device(
                "motor",
                "driver1",
                DeviceConfig::default().on_bus("can0").with_bus_role("driver1"),
            )
            .unwrap();
        engine.resolve().unwrap();

        let plan = engine.plan();
        assert_eq!(plan.roots().count(), 2);
        assert_eq!(plan.connections().count(), 2);

        let bus = engine.subsystem("can0").unwrap().id;
        let driver = engine.subsystem("driver1").unwrap().id;
        assert!(plan.depends_on(driver, bus));
        assert!(plan.connections().any(|c| {
            c.source == bus
                && c.source_port == "driver1"
                && c.target == driver
                && c.target_port == "can_in"
        }));
        assert!(plan.connections().any(|c| {
            c.source == driver
                && c.source_port == "can_out"
                && c.target == bus
                && c.target_port == "wdriver1"
        }));
    }

    #[test]
    fn test_equivalent_devices_collapse_to_one_node() {
        let mut registry = base_registry();
        registry
            .register(ComponentModel::capability("range-finder").fulfilling(DEVICE_DRIVER))
            .unwrap();
        registry
            .register(
                ComponentModel::task("range_task")
                    .fulfilling("range-finder")
                    .with_merge_policy(MergePolicy::Always),
            )
            .unwrap();
        registry
            .register_device_type("range-finder", "range-finder")
            .unwrap();

        let mut engine = Engine::new(registry);
        engine
            .declare_device("range-finder", "front", DeviceConfig::default())
            .unwrap();
        engine
            .declare_device("range-finder", "rear", DeviceConfig::default())
            .unwrap();
        engine.resolve().unwrap();

        assert_eq!(engine.plan().len(), 1);
        assert_eq!(
            engine.subsystem("front").unwrap().id,
            engine.subsystem("rear").unwrap().id
        );
    }

    #[test]
    fn test_unimplemented_device_type_leaves_plan_untouched() {
        let mut registry = base_registry();
        registry
            .register(ComponentModel::capability("lidar").fulfilling(DEVICE_DRIVER))
            .unwrap();
        registry.register_device_type("lidar", "lidar").unwrap();

        let mut engine = Engine::new(registry);
        let err = engine
            .declare_device("lidar", "front", DeviceConfig::default())
            .unwrap_err();
        assert!(matches!(err, ResolutionError::NoImplementationFound(_)));

        engine.resolve().unwrap();
        assert!(engine.plan().is_empty());
    }

    #[test]
    fn test_cyclic_graph_is_rejected() {
        let mut registry = base_registry();
        registry
            .register(
                ComponentModel::task("filter_task")
                    .with_input("in", "f/T")
                    .with_output("out", "f/T"),
            )
            .unwrap();
        registry
            .register(
                ComponentModel::composition(
                    "loop_comp",
                    vec![
                        CompositionChild {
                            role: "a".to_string(),
                            model: "filter_task".into(),
                        },
                        CompositionChild {
                            role: "b".to_string(),
                            model: "filter_task".into(),
                        },
                    ],
                )
                .with_connection(ModelConnection {
                    source_role: "a".to_string(),
                    source_port: "out".to_string(),
                    target_role: "b".to_string(),
                    target_port: "in".to_string(),
                })
                .with_connection(ModelConnection {
                    source_role: "b".to_string(),
                    source_port: "out".to_string(),
                    target_role: "a".to_string(),
                    target_port: "in".to_string(),
                }),
            )
            .unwrap();

        let mut engine = Engine::new(registry);
        engine.add(InstanceRequest::new("loop_comp"));
        let err = engine.resolve().unwrap_err();
        assert!(matches!(err, ResolutionError::UnsupportedCyclicMerge { .. }));
        assert!(engine.plan().is_empty());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let mut engine = Engine::new(base_registry());
        engine
            .declare_bus("can", "can0", DeviceConfig::default())
            .unwrap();
        engine
            .declare_device(
                "motor",
                "m0",
                DeviceConfig::default().on_bus("can0").with_bus_role("m0"),
            )
            .unwrap();

        engine.resolve().unwrap();
        let first = serde_json::to_string(&engine.plan().to_graph()).unwrap();
        engine.resolve().unwrap();
        let second = serde_json::to_string(&engine.plan().to_graph()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_failed_run_preserves_committed_plan() {
        let mut engine = Engine::new(base_registry());
        engine
            .declare_device("motor", "m0", DeviceConfig::default())
            .unwrap();
        engine.resolve().unwrap();
        let committed = serde_json::to_string(&engine.plan().to_graph()).unwrap();

        engine.add(InstanceRequest::new("no_such_model"));
        let err = engine.resolve().unwrap_err();
        assert!(matches!(err, ResolutionError::Registry(_)));
        let after = serde_json::to_string(&engine.plan().to_graph()).unwrap();
        assert_eq!(committed, after);
    }

    #[test]
    fn test_abstract_leftover_is_reported() {
        let mut registry = base_registry();
        registry
            .register(ComponentModel::capability("pose-estimate"))
            .unwrap();
        registry
            .register(ComponentModel::composition(
                "nav_comp",
                vec![CompositionChild {
                    role: "pose".to_string(),
                    model: "pose-estimate".into(),
                }],
            ))
            .unwrap();

        let mut engine = Engine::new(registry);
        engine.add(InstanceRequest::named("nav", "nav_comp"));
        let err = engine.resolve().unwrap_err();
        match err {
            ResolutionError::UnresolvedAbstractNode { nodes } => {
                assert_eq!(nodes, vec!["nav.pose"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_selection_picks_a_concrete_model() {
        let mut registry = base_registry();
        registry
            .register(ComponentModel::capability("pose-estimate"))
            .unwrap();
        registry
            .register(ComponentModel::task("kf_task").fulfilling("pose-estimate"))
            .unwrap();
        registry
            .register(ComponentModel::task("ukf_task").fulfilling("pose-estimate"))
            .unwrap();
        registry
            .register(ComponentModel::composition(
                "nav_comp",
                vec![CompositionChild {
                    role: "pose".to_string(),
                    model: "pose-estimate".into(),
                }],
            ))
            .unwrap();

        // Two equally-concrete candidates: without a selection the child
        // stays abstract and validation reports it
        let mut engine = Engine::new(registry.clone());
        engine.add(InstanceRequest::named("nav", "nav_comp"));
        assert!(matches!(
            engine.resolve().unwrap_err(),
            ResolutionError::UnresolvedAbstractNode { .. }
        ));

        let mut engine = Engine::new(registry);
        engine.add(InstanceRequest::named("nav", "nav_comp").use_selection("pose", "kf_task"));
        engine.resolve().unwrap();
        let pose = engine
            .plan()
            .nodes()
            .find(|n| n.label == "nav.pose")
            .unwrap();
        assert_eq!(pose.model.as_str(), "kf_task");
    }

    #[test]
    fn test_selection_reuses_a_built_device() {
        let mut registry = base_registry();
        registry
            .register(ComponentModel::composition(
                "drive_comp",
                vec![CompositionChild {
                    role: "actuator".to_string(),
                    model: "motor".into(),
                }],
            ))
            .unwrap();

        let mut engine = Engine::new(registry);
        engine
            .declare_device("motor", "m0", DeviceConfig::default())
            .unwrap();
        engine.add(InstanceRequest::named("drive", "drive_comp").use_selection("actuator", "m0"));
        engine.resolve().unwrap();

        let plan = engine.plan();
        assert_eq!(plan.len(), 2);
        let drive = engine.subsystem("drive").unwrap().id;
        let device = engine.subsystem("m0").unwrap().id;
        assert!(plan.depends_on(drive, device));
    }

    #[test]
    fn test_unknown_selection_fails() {
        let mut engine = Engine::new(base_registry());
        engine.add(InstanceRequest::new("motor_task").use_selection("dep", "nowhere"));
        let err = engine.resolve().unwrap_err();
        assert!(matches!(err, ResolutionError::UnknownSelection(_)));
    }

    #[test]
    fn test_auto_connection_wires_compatible_ports() {
        let mut registry = base_registry();
        registry
            .register(ComponentModel::task("camera_task").with_output("frames", "img/Frame"))
            .unwrap();
        registry
            .register(ComponentModel::task("tracker_task").with_input("frames_in", "img/Frame"))
            .unwrap();
        registry
            .register(
                ComponentModel::composition(
                    "vision_comp",
                    vec![
                        CompositionChild {
                            role: "camera".to_string(),
                            model: "camera_task".into(),
                        },
                        CompositionChild {
                            role: "tracker".to_string(),
                            model: "tracker_task".into(),
                        },
                    ],
                )
                .auto_connected(),
            )
            .unwrap();

        let mut engine = Engine::new(registry);
        engine.add(InstanceRequest::named("vision", "vision_comp"));
        engine.resolve().unwrap();

        let plan = engine.plan();
        let camera = plan.nodes().find(|n| n.label == "vision.camera").unwrap().id;
        let tracker = plan.nodes().find(|n| n.label == "vision.tracker").unwrap().id;
        assert!(plan.connections().any(|c| {
            c.source == camera
                && c.source_port == "frames"
                && c.target == tracker
                && c.target_port == "frames_in"
        }));
    }

    #[test]
    fn test_ambiguous_auto_connection_is_left_unconnected() {
        let mut registry = base_registry();
        registry
            .register(ComponentModel::task("camera_task").with_output("frames", "img/Frame"))
            .unwrap();
        registry
            .register(
                ComponentModel::task("stereo_task")
                    .with_input("left", "img/Frame")
                    .with_input("right", "img/Frame"),
            )
            .unwrap();
        registry
            .register(
                ComponentModel::composition(
                    "vision_comp",
                    vec![
                        CompositionChild {
                            role: "camera".to_string(),
                            model: "camera_task".into(),
                        },
                        CompositionChild {
                            role: "stereo".to_string(),
                            model: "stereo_task".into(),
                        },
                    ],
                )
                .auto_connected(),
            )
            .unwrap();

        let mut engine = Engine::new(registry);
        engine.add(InstanceRequest::named("vision", "vision_comp"));
        engine.resolve().unwrap();

        // Two candidate inputs for one output: neither pairing is wired
        assert_eq!(engine.plan().connections().count(), 0);
    }

    #[test]
    fn test_device_argument_binding() {
        let mut engine = Engine::new(base_registry());
        engine
            .declare_device(
                "motor",
                "m0",
                DeviceConfig::default().with_argument("rate", "100"),
            )
            .unwrap();
        engine.resolve().unwrap();

        let node = engine.subsystem("m0").unwrap();
        assert_eq!(node.arguments.get("motor_name").unwrap(), "m0");
        assert_eq!(node.arguments.get("rate").unwrap(), "100");
        assert!(node.permanent);
    }

    #[test]
    fn test_device_alias_names_resolve_to_the_same_node() {
        let mut registry = base_registry();
        registry
            .register(ComponentModel::capability("imu").fulfilling(DEVICE_DRIVER))
            .unwrap();
        registry
            .register(
                ComponentModel::task("imu_task").fulfilling("imu").with_data_source(
                    DataSource::new("imu", "imu").with_child(DataSource::new("gyro", "imu")),
                ),
            )
            .unwrap();
        registry.register_device_type("imu", "imu").unwrap();

        let mut engine = Engine::new(registry);
        engine
            .declare_device("imu", "imu0", DeviceConfig::default())
            .unwrap();
        engine.resolve().unwrap();

        assert_eq!(
            engine.subsystem("imu0").unwrap().id,
            engine.subsystem("imu0.gyro").unwrap().id
        );
    }
}
