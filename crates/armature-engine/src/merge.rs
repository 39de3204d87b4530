//! Merge engine: collapse structurally-equivalent component instances
//!
//! Component graphs frequently contain several instances performing the
//! same role (two requests for the same sensor-driver configuration, say).
//! Merging replaces them by a single instance, preserving every edge.

use armature_model::ModelRegistry;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::ResolutionError;
use crate::plan::{NodeId, Plan};

/// Merge equivalent nodes until no further merge is possible
///
/// Works in rounds over the set of not-yet-considered nodes: each round
/// picks the "roots" (nodes whose data-flow inputs and dependency children
/// contain no pending node, so their mergeability is already decidable),
/// builds the can-replace relation among them, and resolves it greedily.
/// Name-map entries pointing at replaced nodes are rewritten onto the
/// survivor. Leftover nodes after the loop stalls form dependency cycles,
/// which have no defined merge policy.
pub(crate) fn merge_plan(
    registry: &ModelRegistry,
    plan: &mut Plan,
    tasks: &mut BTreeMap<String, NodeId>,
) -> Result<(), ResolutionError> {
    let mut remaining: BTreeSet<NodeId> = plan.node_ids().collect();
    let mut old_size = None;

    while !remaining.is_empty() && old_size != Some(remaining.len()) {
        old_size = Some(remaining.len());

        // Nodes whose mergeability does not wait on other pending nodes
        let roots: Vec<(NodeId, BTreeSet<NodeId>, BTreeSet<NodeId>)> = remaining
            .iter()
            .filter_map(|&id| {
                let inputs = plan.input_nodes(id);
                if inputs.intersection(&remaining).next().is_some() {
                    return None;
                }
                let children = plan.children_of(id);
                if children.intersection(&remaining).next().is_some() {
                    return None;
                }
                Some((id, inputs, children))
            })
            .collect();
        for (id, _, _) in &roots {
            remaining.remove(id);
        }
        debug!(roots = roots.len(), pending = remaining.len(), "merge round");

        // The can-replace relation: task -> every target it subsumes
        let mut merges: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        for (task, task_inputs, task_children) in &roots {
            for (target, target_inputs, target_children) in &roots {
                if task == target {
                    continue;
                }
                if !target_children.is_subset(task_children) {
                    continue;
                }
                if task_inputs != target_inputs {
                    continue;
                }
                if can_merge(registry, plan, *task, *target) {
                    debug!(task = %task, target = %target, "merge candidate");
                    merges.entry(*task).or_default().insert(*target);
                }
            }
        }

        // Greedy resolution: largest replacement set first, ties broken
        // toward the smallest node handle so merging is deterministic
        loop {
            let best = merges
                .iter()
                .max_by(|(a_id, a), (b_id, b)| {
                    a.len().cmp(&b.len()).then_with(|| b_id.cmp(a_id))
                })
                .map(|(&id, _)| id);
            let Some(task) = best else {
                break;
            };
            let Some(targets) = merges.remove(&task) else {
                break;
            };
            for &target in &targets {
                inherit_arguments(plan, task, target);
                plan.replace_node(target, task);
                for node in tasks.values_mut() {
                    if *node == target {
                        *node = task;
                    }
                }
                debug!(target = %target, survivor = %task, "merged");
            }
            merges.retain(|other, _| !targets.contains(other));
            for pending in merges.values_mut() {
                pending.retain(|t| !targets.contains(t));
            }
            merges.retain(|_, pending| !pending.is_empty());
        }
    }

    if remaining.is_empty() {
        Ok(())
    } else {
        // The leftovers form one or more dependency cycles; there is no
        // defined merge policy for those.
        let nodes = remaining
            .iter()
            .filter_map(|id| plan.node(*id))
            .map(|n| n.label.clone())
            .collect();
        Err(ResolutionError::UnsupportedCyclicMerge { nodes })
    }
}

/// Model-level merge compatibility of two nodes
fn can_merge(registry: &ModelRegistry, plan: &Plan, task: NodeId, target: NodeId) -> bool {
    let (Some(a), Some(b)) = (plan.node(task), plan.node(target)) else {
        return false;
    };
    if a.model != b.model {
        return false;
    }
    registry
        .get(&a.model)
        .is_some_and(|m| m.merge_policy.allows(&a.arguments, &b.arguments))
}

/// The survivor adopts argument keys it lacks from the replaced node
fn inherit_arguments(plan: &mut Plan, survivor: NodeId, target: NodeId) {
    let Some(extra) = plan.node(target).map(|n| n.arguments.clone()) else {
        return;
    };
    if let Some(node) = plan.node_mut(survivor) {
        for (key, value) in extra {
            node.arguments.entry(key).or_insert(value);
        }
    }
}
