//! Module dependency resolution
//!
//! Builds the connection graph from module specs, rejects missing connector
//! targets and cycles, and determines activation order (dependencies first).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::module::graph::spec::ModuleSpec;

/// Graph construction errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Module '{module}' connector '{connector}' targets unknown module '{target}'")]
    MissingDependency {
        module: String,
        connector: String,
        target: String,
    },

    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Module '{0}' is defined more than once")]
    DuplicateModule(String),
}

/// Directed module graph; an edge A -> B means A needs B Active first
#[derive(Debug, Clone, Default)]
pub struct ConnectionGraph {
    specs: BTreeMap<String, Arc<ModuleSpec>>,
    /// Module -> modules it depends on
    dependencies: BTreeMap<String, BTreeSet<String>>,
    /// Module -> modules depending on it (secondary index)
    dependents: BTreeMap<String, BTreeSet<String>>,
    /// Topological order, dependencies before dependents
    order: Vec<String>,
    position: HashMap<String, usize>,
}

/// Dependency resolver
pub struct ConnectorResolver;

impl ConnectorResolver {
    /// Build a connection graph from a set of module specs
    ///
    /// Pure and deterministic: ties in the topological order are broken
    /// lexicographically by module name.
    pub fn build<I>(specs: I) -> Result<ConnectionGraph, GraphError>
    where
        I: IntoIterator<Item = ModuleSpec>,
    {
        let mut spec_map: BTreeMap<String, Arc<ModuleSpec>> = BTreeMap::new();
        for spec in specs {
            if spec_map.contains_key(&spec.name) {
                return Err(GraphError::DuplicateModule(spec.name));
            }
            spec_map.insert(spec.name.clone(), Arc::new(spec));
        }

        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = spec_map
            .keys()
            .map(|name| (name.clone(), BTreeSet::new()))
            .collect();

        for (name, spec) in &spec_map {
            let mut deps = BTreeSet::new();
            for (connector, target) in &spec.connectors {
                if !spec_map.contains_key(target) {
                    return Err(GraphError::MissingDependency {
                        module: name.clone(),
                        connector: connector.clone(),
                        target: target.clone(),
                    });
                }
                deps.insert(target.clone());
                if let Some(set) = dependents.get_mut(target) {
                    set.insert(name.clone());
                }
            }
            dependencies.insert(name.clone(), deps);
        }

        if let Some(cycle) = Self::find_cycle(&dependencies) {
            return Err(GraphError::CyclicDependency(cycle));
        }

        let order = Self::topological_sort(&dependencies, &dependents);
        let position = order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        debug!("Dependency resolution complete: {:?}", order);

        Ok(ConnectionGraph {
            specs: spec_map,
            dependencies,
            dependents,
            order,
            position,
        })
    }

    /// Depth-first search with a recursion stack; returns the first back-edge
    /// found as a closed path (first element repeated at the end)
    fn find_cycle(dependencies: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        fn visit<'a>(
            node: &'a str,
            dependencies: &'a BTreeMap<String, BTreeSet<String>>,
            marks: &mut HashMap<&'a str, Mark>,
            stack: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            marks.insert(node, Mark::OnStack);
            stack.push(node);

            if let Some(deps) = dependencies.get(node) {
                for dep in deps {
                    match marks.get(dep.as_str()).copied().unwrap_or(Mark::Unvisited) {
                        Mark::OnStack => {
                            let start = stack.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                stack[start..].iter().map(|n| n.to_string()).collect();
                            cycle.push(dep.clone());
                            return Some(cycle);
                        }
                        Mark::Unvisited => {
                            if let Some(cycle) = visit(dep, dependencies, marks, stack) {
                                return Some(cycle);
                            }
                        }
                        Mark::Done => {}
                    }
                }
            }

            stack.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut stack = Vec::new();
        for name in dependencies.keys() {
            if marks.get(name.as_str()).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited {
                if let Some(cycle) = visit(name, dependencies, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Kahn's algorithm with an ordered ready set; the graph is known acyclic
    fn topological_sort(
        dependencies: &BTreeMap<String, BTreeSet<String>>,
        dependents: &BTreeMap<String, BTreeSet<String>>,
    ) -> Vec<String> {
        let mut in_degree: BTreeMap<&str, usize> = dependencies
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();

        let mut ready: BTreeSet<&str> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut result = Vec::with_capacity(dependencies.len());
        while let Some(module) = ready.pop_first() {
            result.push(module.to_string());
            if let Some(users) = dependents.get(module) {
                for user in users {
                    if let Some(degree) = in_degree.get_mut(user.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.insert(user.as_str());
                        }
                    }
                }
            }
        }
        result
    }
}

impl ConnectionGraph {
    /// Number of modules in the graph
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    pub fn spec(&self, name: &str) -> Option<&Arc<ModuleSpec>> {
        self.specs.get(name)
    }

    /// All specs, sorted by name
    pub fn specs(&self) -> impl Iterator<Item = &Arc<ModuleSpec>> {
        self.specs.values()
    }

    /// Activation order: every module after all modules it depends on
    pub fn activation_order(&self) -> &[String] {
        &self.order
    }

    /// Deactivation order: every module before all modules it depends on
    pub fn deactivation_order(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }

    /// Direct dependents of a module
    pub fn dependents_of(&self, name: &str) -> impl Iterator<Item = &String> {
        self.dependents.get(name).into_iter().flatten()
    }

    /// Transitive dependencies of `name` plus `name` itself, in activation order
    pub fn dependency_closure(&self, name: &str) -> Vec<String> {
        self.closure(name, &self.dependencies, false)
    }

    /// Transitive dependents of `name` plus `name` itself, in deactivation order
    pub fn dependent_closure(&self, name: &str) -> Vec<String> {
        self.closure(name, &self.dependents, true)
    }

    /// Transitive dependents of every module in `roots`, plus the roots, in
    /// deactivation order
    pub fn dependent_closure_of_all<'a, I>(&self, roots: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = BTreeSet::new();
        for root in roots {
            for name in self.closure(root, &self.dependents, true) {
                seen.insert(name);
            }
        }
        self.sorted(seen, true)
    }

    fn closure(
        &self,
        name: &str,
        edges: &BTreeMap<String, BTreeSet<String>>,
        reverse: bool,
    ) -> Vec<String> {
        if !self.contains(name) {
            return Vec::new();
        }
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut pending = vec![name.to_string()];
        while let Some(current) = pending.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(next) = edges.get(&current) {
                pending.extend(next.iter().filter(|n| !seen.contains(*n)).cloned());
            }
        }
        self.sorted(seen, reverse)
    }

    fn sorted(&self, names: BTreeSet<String>, reverse: bool) -> Vec<String> {
        let mut names: Vec<String> = names.into_iter().collect();
        names.sort_by_key(|n| self.position.get(n).copied().unwrap_or(usize::MAX));
        if reverse {
            names.reverse();
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::graph::spec::Tier;

    fn spec(name: &str, deps: &[(&str, &str)]) -> ModuleSpec {
        deps.iter().fold(
            ModuleSpec::new(name, Tier::Logic, "test.module"),
            |s, (connector, target)| s.connect(*connector, *target),
        )
    }

    #[test]
    fn test_chain_order() {
        let graph = ConnectorResolver::build(vec![
            spec("m", &[("d", "d1")]),
            spec("d1", &[("d", "d2")]),
            spec("d2", &[]),
        ])
        .unwrap();

        assert_eq!(graph.activation_order(), &["d2", "d1", "m"]);
        assert_eq!(graph.deactivation_order(), vec!["m", "d1", "d2"]);
        assert_eq!(graph.dependency_closure("m"), vec!["d2", "d1", "m"]);
        assert_eq!(graph.dependent_closure("d2"), vec!["m", "d1", "d2"]);
    }

    #[test]
    fn test_lexicographic_tie_break() {
        let graph = ConnectorResolver::build(vec![
            spec("zeta", &[]),
            spec("alpha", &[]),
            spec("mid", &[("a", "zeta"), ("b", "alpha")]),
        ])
        .unwrap();
        assert_eq!(graph.activation_order(), &["alpha", "zeta", "mid"]);
    }

    #[test]
    fn test_missing_dependency_names_module_and_connector() {
        let err = ConnectorResolver::build(vec![spec("gui", &[("logic", "nowhere")])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::MissingDependency {
                module: "gui".to_string(),
                connector: "logic".to_string(),
                target: "nowhere".to_string(),
            }
        );
    }

    #[test]
    fn test_two_node_cycle_rejected() {
        let err = ConnectorResolver::build(vec![spec("a", &[("x", "b")]), spec("b", &[("y", "a")])])
            .unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency(vec!["a".into(), "b".into(), "a".into()])
        );
    }

    #[test]
    fn test_self_loop_rejected() {
        let err = ConnectorResolver::build(vec![spec("a", &[("me", "a")])]).unwrap_err();
        assert!(matches!(err, GraphError::CyclicDependency(ref path) if path == &["a", "a"]));
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = ConnectorResolver::build(vec![spec("a", &[]), spec("a", &[])]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateModule("a".into()));
    }

    #[test]
    fn test_dependents_index() {
        let graph = ConnectorResolver::build(vec![
            spec("hw", &[]),
            spec("l1", &[("hw", "hw")]),
            spec("l2", &[("hw", "hw")]),
            spec("gui", &[("l", "l1")]),
        ])
        .unwrap();
        let dependents: Vec<&String> = graph.dependents_of("hw").collect();
        assert_eq!(dependents, vec!["l1", "l2"]);
        assert_eq!(
            graph.dependent_closure_of_all(["l1", "l2"]),
            vec!["l2", "gui", "l1"]
        );
        assert!(graph.dependency_closure("missing").is_empty());
    }
}
