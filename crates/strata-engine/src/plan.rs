use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use strata_domain::{
    PlanAction, PlanReport, PlannedOperation, Properties, PropertyDiff, ResourceName,
    ResourceSpec, ResourceState, StateSnapshot,
};
use tracing::debug;

use crate::error::PlanningError;
use crate::graph::{ResourceGraph, dependency_order};
use crate::providers::ProviderRegistry;

#[derive(Debug, Clone)]
struct Decision {
    action: PlanAction,
    diff: Vec<PropertyDiff>,
    reason: Option<String>,
}

/// Diff the desired graph against the last-applied snapshot.
///
/// Creates, updates, replacements and no-ops come first in dependency order;
/// deletes follow, dependents before the resources they used. A replaced
/// resource drags every surviving resource that used its old instance into
/// replacement too, so no old instance is deleted while something still
/// points at it.
///
/// # Errors
///
/// Returns an error when no provider handles a desired or previously
/// applied resource type.
pub fn build_plan(
    graph: &ResourceGraph,
    prior: &StateSnapshot,
    providers: &ProviderRegistry,
) -> Result<PlanReport, PlanningError> {
    ensure_providers(graph, prior, providers)?;

    let mut decisions: HashMap<&ResourceName, Decision> = graph
        .topological_order()
        .map(|spec| (&spec.name, decide(spec, prior.get(&spec.name), providers)))
        .collect();
    cascade_replacements(graph, prior, &mut decisions);

    let mut operations = Vec::with_capacity(graph.len() + prior.resources.len());
    let mut op_ids: HashMap<ResourceName, usize> = HashMap::new();
    let mut warnings = Vec::new();

    for spec in graph.topological_order() {
        let Some(decision) = decisions.get(&spec.name) else {
            continue;
        };

        if decision.action == PlanAction::Replace {
            warnings.push(format!(
                "{} ({}) will be deleted and recreated: {}",
                spec.name,
                spec.type_tag,
                decision.reason.as_deref().unwrap_or("replacement required")
            ));
        }

        let id = operations.len() + 1;
        let depends_on = graph
            .dependencies_of(&spec.name)
            .into_iter()
            .filter_map(|dependency| op_ids.get(dependency).copied())
            .collect();

        operations.push(PlannedOperation {
            id,
            resource: spec.name.clone(),
            type_tag: spec.type_tag.clone(),
            action: decision.action,
            diff: decision.diff.clone(),
            depends_on,
            teardown_after: Vec::new(),
            spec: Some(spec.clone()),
            summary: summarize(spec.type_tag.as_str(), &spec.name, decision),
        });
        op_ids.insert(spec.name.clone(), id);
    }

    let removed = removed_in_delete_order(graph, prior);
    for name in &removed {
        let Some(state) = prior.get(name) else {
            continue;
        };
        let id = operations.len() + 1;
        let depends_on = prior_dependents(prior, name)
            .into_iter()
            .filter_map(|dependent| op_ids.get(dependent).copied())
            .collect();
        let decision = Decision {
            action: PlanAction::Delete,
            diff: diff_properties(&state.spec.properties, &Properties::new()),
            reason: None,
        };
        operations.push(PlannedOperation {
            id,
            resource: name.clone(),
            type_tag: state.spec.type_tag.clone(),
            action: PlanAction::Delete,
            diff: decision.diff.clone(),
            depends_on,
            teardown_after: Vec::new(),
            spec: None,
            summary: summarize(state.spec.type_tag.as_str(), name, &decision),
        });
        op_ids.insert(name.clone(), id);
    }

    for operation in &mut operations {
        if operation.action != PlanAction::Replace {
            continue;
        }
        let mut teardown_after: Vec<usize> = prior_dependents(prior, &operation.resource)
            .into_iter()
            .filter_map(|dependent| op_ids.get(dependent).copied())
            .collect();
        teardown_after.sort_unstable();
        operation.teardown_after = teardown_after;
    }

    debug!(
        operations = operations.len(),
        deletes = removed.len(),
        "built plan"
    );

    Ok(PlanReport {
        stack: prior.stack.clone(),
        operations,
        warnings,
    })
}

fn ensure_providers(
    graph: &ResourceGraph,
    prior: &StateSnapshot,
    providers: &ProviderRegistry,
) -> Result<(), PlanningError> {
    let desired = graph.specs().iter();
    let previous = prior.resources.values().map(|state| &state.spec);
    for spec in desired.chain(previous) {
        if providers.select(&spec.type_tag).is_none() {
            return Err(PlanningError::UnknownResourceType {
                resource: spec.name.clone(),
                type_tag: spec.type_tag.clone(),
            });
        }
    }
    Ok(())
}

fn decide(
    spec: &ResourceSpec,
    prior: Option<&ResourceState>,
    providers: &ProviderRegistry,
) -> Decision {
    let Some(prior) = prior else {
        return Decision {
            action: PlanAction::Create,
            diff: diff_properties(&Properties::new(), &spec.properties),
            reason: None,
        };
    };

    let diff = diff_properties(&prior.spec.properties, &spec.properties);

    if prior.spec.type_tag != spec.type_tag {
        return Decision {
            action: PlanAction::Replace,
            diff,
            reason: Some(format!("type changes from {}", prior.spec.type_tag)),
        };
    }

    if diff.is_empty() {
        return Decision {
            action: PlanAction::NoOp,
            diff,
            reason: None,
        };
    }

    let changed: Vec<&str> = diff.iter().map(|entry| entry.property.as_str()).collect();
    let forces_replacement = providers
        .select(&spec.type_tag)
        .is_some_and(|provider| provider.requires_replacement(&spec.type_tag, &changed));

    if forces_replacement {
        let reason = format!("{} cannot be changed in place", changed.join(", "));
        Decision {
            action: PlanAction::Replace,
            diff,
            reason: Some(reason),
        }
    } else {
        Decision {
            action: PlanAction::Update,
            diff,
            reason: None,
        }
    }
}

/// Mark every surviving resource that depended, directly or through other
/// prior resources, on a replaced resource's old instance as replaced too.
///
/// Walks prior edges, so teardowns only ever wait on other teardowns and the
/// removal order stays acyclic.
fn cascade_replacements<'a>(
    graph: &'a ResourceGraph,
    prior: &StateSnapshot,
    decisions: &mut HashMap<&'a ResourceName, Decision>,
) {
    let mut queue: VecDeque<&ResourceName> = graph
        .topological_order()
        .map(|spec| &spec.name)
        .filter(|name| {
            decisions
                .get(name)
                .is_some_and(|decision| decision.action == PlanAction::Replace)
        })
        .collect();
    let mut visited: BTreeSet<&ResourceName> = queue.iter().copied().collect();

    while let Some(upstream) = queue.pop_front() {
        for dependent in prior_dependents(prior, upstream) {
            if !visited.insert(dependent) {
                continue;
            }
            queue.push_back(dependent);
            let Some(decision) = graph
                .get(dependent)
                .and_then(|spec| decisions.get_mut(&spec.name))
            else {
                continue;
            };
            if decision.action != PlanAction::Replace {
                decision.action = PlanAction::Replace;
                decision.reason = Some(format!("upstream {upstream} is replaced"));
            }
        }
    }
}

fn diff_properties(before: &Properties, after: &Properties) -> Vec<PropertyDiff> {
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let old = before.get(key);
            let new = after.get(key);
            (old != new).then(|| PropertyDiff {
                property: key.clone(),
                before: old.cloned(),
                after: new.cloned(),
            })
        })
        .collect()
}

/// Names of prior resources that previously depended on `name`.
fn prior_dependents<'a>(prior: &'a StateSnapshot, name: &ResourceName) -> Vec<&'a ResourceName> {
    prior
        .resources
        .iter()
        .filter(|(candidate, state)| {
            *candidate != name && prior_dependencies(&state.spec).contains(name)
        })
        .map(|(candidate, _)| candidate)
        .collect()
}

fn prior_dependencies(spec: &ResourceSpec) -> BTreeSet<&ResourceName> {
    spec.depends_on
        .iter()
        .chain(spec.references().into_iter().map(|reference| &reference.resource))
        .collect()
}

/// Prior resources missing from the desired graph, dependents first.
fn removed_in_delete_order(graph: &ResourceGraph, prior: &StateSnapshot) -> Vec<ResourceName> {
    let names: Vec<&ResourceName> = prior.resources.keys().collect();
    let positions: BTreeMap<&ResourceName, usize> = names
        .iter()
        .enumerate()
        .map(|(position, name)| (*name, position))
        .collect();

    let dependencies: Vec<BTreeSet<usize>> = prior
        .resources
        .values()
        .map(|state| {
            prior_dependencies(&state.spec)
                .into_iter()
                .filter_map(|dependency| positions.get(dependency).copied())
                .collect()
        })
        .collect();

    let mut order = dependency_order(&dependencies);
    order.reverse();
    order
        .into_iter()
        .map(|position| names[position])
        .filter(|name| !graph.contains(name))
        .cloned()
        .collect()
}

fn summarize(type_tag: &str, name: &ResourceName, decision: &Decision) -> String {
    let base = format!("{} {type_tag} {name}", decision.action);
    match (&decision.reason, decision.action) {
        (Some(reason), _) => format!("{base} ({reason})"),
        (None, PlanAction::Update) => {
            let properties: Vec<&str> = decision
                .diff
                .iter()
                .map(|entry| entry.property.as_str())
                .collect();
            format!("{base} ({})", properties.join(", "))
        }
        (None, _) => base,
    }
}
