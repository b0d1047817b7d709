use std::collections::{BTreeSet, HashMap};

use strata_domain::{ResourceName, ResourceSpec};
use tracing::debug;

use crate::error::GraphError;

/// Accumulates declared resources; [`GraphBuilder::build`] validates them into
/// a [`ResourceGraph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    specs: Vec<ResourceSpec>,
    index: HashMap<ResourceName, usize>,
}

impl GraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource in declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateName`] when a resource with the same
    /// logical name was already added.
    pub fn add_resource(&mut self, spec: ResourceSpec) -> Result<(), GraphError> {
        if self.index.contains_key(&spec.name) {
            return Err(GraphError::DuplicateName { name: spec.name });
        }
        self.index.insert(spec.name.clone(), self.specs.len());
        self.specs.push(spec);
        Ok(())
    }

    /// Build the dependency graph from explicit `depends_on` edges and the
    /// implicit edges of every output reference.
    ///
    /// # Errors
    ///
    /// Returns an error when a dependency or reference points to an
    /// undeclared resource, or when the edges form a cycle.
    pub fn build(self) -> Result<ResourceGraph, GraphError> {
        let Self { specs, index } = self;
        let mut dependencies = vec![BTreeSet::new(); specs.len()];
        let mut missing = Vec::new();

        for (position, spec) in specs.iter().enumerate() {
            for dependency in &spec.depends_on {
                match index.get(dependency) {
                    Some(target) => {
                        dependencies[position].insert(*target);
                    }
                    None => missing.push(format!(
                        "{} depends on missing resource {dependency}",
                        spec.name
                    )),
                }
            }
            for reference in spec.references() {
                match index.get(&reference.resource) {
                    Some(target) => {
                        dependencies[position].insert(*target);
                    }
                    None => missing.push(format!(
                        "{} references output of missing resource {reference}",
                        spec.name
                    )),
                }
            }
        }

        if !missing.is_empty() {
            let details = missing.join("\n  - ");
            return Err(GraphError::MissingDependency { details });
        }

        if let Some(cycle) = find_cycle(&dependencies) {
            let cycle = cycle
                .into_iter()
                .map(|position| specs[position].name.to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(GraphError::CycleDetected { cycle });
        }

        let mut dependents = vec![BTreeSet::new(); specs.len()];
        for (position, deps) in dependencies.iter().enumerate() {
            for dependency in deps {
                dependents[*dependency].insert(position);
            }
        }

        let order = dependency_order(&dependencies);
        debug!(resources = specs.len(), "built resource graph");

        Ok(ResourceGraph {
            specs,
            index,
            dependencies,
            dependents,
            order,
        })
    }
}

/// A validated, acyclic resource graph.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    specs: Vec<ResourceSpec>,
    index: HashMap<ResourceName, usize>,
    dependencies: Vec<BTreeSet<usize>>,
    dependents: Vec<BTreeSet<usize>>,
    order: Vec<usize>,
}

impl ResourceGraph {
    /// Convenience for building a graph from specs in declaration order.
    ///
    /// # Errors
    ///
    /// Same as [`GraphBuilder::add_resource`] and [`GraphBuilder::build`].
    pub fn from_specs(specs: impl IntoIterator<Item = ResourceSpec>) -> Result<Self, GraphError> {
        let mut builder = GraphBuilder::new();
        for spec in specs {
            builder.add_resource(spec)?;
        }
        builder.build()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Specs in declaration order.
    #[must_use]
    pub fn specs(&self) -> &[ResourceSpec] {
        &self.specs
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceSpec> {
        self.index.get(name).map(|position| &self.specs[*position])
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Direct dependencies of `name` in declaration order.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Vec<&ResourceName> {
        self.index.get(name).map_or_else(Vec::new, |position| {
            self.dependencies[*position]
                .iter()
                .map(|dep| &self.specs[*dep].name)
                .collect()
        })
    }

    /// Resources that directly depend on `name`, in declaration order.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<&ResourceName> {
        self.index.get(name).map_or_else(Vec::new, |position| {
            self.dependents[*position]
                .iter()
                .map(|dep| &self.specs[*dep].name)
                .collect()
        })
    }

    /// Specs with dependencies first; independent resources keep declaration
    /// order.
    pub fn topological_order(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.order.iter().map(|position| &self.specs[*position])
    }
}

/// Depth-first search with an explicit recursion stack. Returns the first
/// cycle found as a closed path (`a -> b -> a`).
fn find_cycle(dependencies: &[BTreeSet<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; dependencies.len()];
    let mut stack: Vec<usize> = Vec::new();

    for start in 0..dependencies.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }

        // (node, pending neighbors)
        let mut frames: Vec<(usize, Vec<usize>)> = Vec::new();
        marks[start] = Mark::OnStack;
        stack.push(start);
        frames.push((start, dependencies[start].iter().rev().copied().collect()));

        while let Some((node, pending)) = frames.last_mut() {
            let node = *node;
            let Some(next) = pending.pop() else {
                marks[node] = Mark::Done;
                stack.pop();
                frames.pop();
                continue;
            };

            match marks[next] {
                Mark::Done => {}
                Mark::OnStack => {
                    let begin = stack.iter().position(|entry| *entry == next).unwrap_or(0);
                    let mut cycle = stack[begin..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    marks[next] = Mark::OnStack;
                    stack.push(next);
                    frames.push((next, dependencies[next].iter().rev().copied().collect()));
                }
            }
        }
    }

    None
}

/// Kahn's algorithm over node positions. Ready nodes are taken lowest
/// position first so ties follow declaration order. Nodes left over by a
/// cycle are appended in position order.
pub(crate) fn dependency_order(dependencies: &[BTreeSet<usize>]) -> Vec<usize> {
    let count = dependencies.len();
    let mut indegree = vec![0usize; count];
    let mut dependents = vec![Vec::new(); count];

    for (position, deps) in dependencies.iter().enumerate() {
        for dependency in deps {
            if *dependency < count && *dependency != position {
                indegree[position] += 1;
                dependents[*dependency].push(position);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..count).filter(|p| indegree[*p] == 0).collect();
    let mut order = Vec::with_capacity(count);
    let mut placed = vec![false; count];

    while let Some(next) = ready.pop_first() {
        order.push(next);
        placed[next] = true;
        for dependent in &dependents[next] {
            let entry = &mut indegree[*dependent];
            if *entry == 0 {
                continue;
            }
            *entry -= 1;
            if *entry == 0 {
                ready.insert(*dependent);
            }
        }
    }

    if order.len() != count {
        order.extend((0..count).filter(|position| !placed[*position]));
    }

    order
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]

    use strata_domain::{OutputRef, PropertyValue, ResourceName, ResourceSpec, TypeTag};

    use super::{GraphBuilder, ResourceGraph};
    use crate::error::GraphError;

    fn name(raw: &str) -> ResourceName {
        ResourceName::try_from(raw).expect("name")
    }

    fn spec(raw: &str) -> ResourceSpec {
        ResourceSpec::new(name(raw), TypeTag::try_from("aws:test/thing").expect("tag"))
    }

    fn output(resource: &str, property: &str) -> PropertyValue {
        PropertyValue::from(OutputRef::new(name(resource), property.to_string()).expect("ref"))
    }

    fn order(graph: &ResourceGraph) -> Vec<String> {
        graph
            .topological_order()
            .map(|spec| spec.name.to_string())
            .collect()
    }

    #[test]
    fn orders_by_dependency_edges() {
        let graph = ResourceGraph::from_specs([
            spec("service")
                .with_dependency(name("cluster"))
                .with_property("cluster", output("cluster", "arn")),
            spec("cluster").with_dependency(name("vpc")),
            spec("vpc"),
        ])
        .expect("graph");

        assert_eq!(order(&graph), vec!["vpc", "cluster", "service"]);
        assert_eq!(graph.dependents_of("vpc"), vec![&name("cluster")]);
    }

    #[test]
    fn references_create_implicit_edges() {
        let graph = ResourceGraph::from_specs([
            spec("web-image").with_property("repository_url", output("web-repo", "url")),
            spec("web-repo"),
        ])
        .expect("graph");

        assert_eq!(graph.dependencies_of("web-image"), vec![&name("web-repo")]);
        assert_eq!(order(&graph), vec!["web-repo", "web-image"]);
    }

    #[test]
    fn independent_resources_keep_declaration_order() {
        let graph =
            ResourceGraph::from_specs([spec("b"), spec("c"), spec("a")]).expect("graph");
        assert_eq!(order(&graph), vec!["b", "c", "a"]);
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut builder = GraphBuilder::new();
        builder.add_resource(spec("vpc")).expect("first add");
        let error = builder.add_resource(spec("vpc")).expect_err("must fail");
        assert!(matches!(error, GraphError::DuplicateName { .. }));
    }

    #[test]
    fn detects_reference_cycle_with_path() {
        let error = ResourceGraph::from_specs([
            spec("a").with_property("x", output("b", "id")),
            spec("b").with_property("y", output("c", "id")),
            spec("c").with_dependency(name("a")),
        ])
        .expect_err("must fail");

        match error {
            GraphError::CycleDetected { cycle } => assert_eq!(cycle, "a -> b -> c -> a"),
            other => unreachable!("unexpected error: {other}"),
        }
    }

    #[test]
    fn detects_self_reference() {
        let error = ResourceGraph::from_specs([spec("a").with_property("x", output("a", "id"))])
            .expect_err("must fail");
        assert!(error.to_string().contains("cycle"));
    }

    #[test]
    fn reports_missing_references() {
        let error = ResourceGraph::from_specs([
            spec("service").with_property("cluster", output("cluster", "arn"))
        ])
        .expect_err("must fail");
        assert!(matches!(error, GraphError::MissingDependency { .. }));
        assert!(error.to_string().contains("cluster.arn"));
    }
}
