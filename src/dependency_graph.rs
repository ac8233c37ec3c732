//! Directed graph over module ids with Kahn topological sort and DFS cycle
//! detection (spec §4.5), plus the resolver that builds the graph from a
//! [`ModuleRegistry`] and turns it into start/stop orders.

use std::collections::{BTreeSet, HashMap};

use tracing::warn;

use crate::error::ModuleException;
use crate::registry::ModuleRegistry;

#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub id: u64,
    pub symbolic_name: String,
}

/// Directed edges point `depender -> dependency`. Optional dependencies
/// never create an edge (spec §3 invariant).
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<u64, DependencyNode>,
    /// depender -> set of dependency ids
    edges: HashMap<u64, BTreeSet<u64>>,
    /// dependency -> set of depender ids (for reverse lookups)
    reverse_edges: HashMap<u64, BTreeSet<u64>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: u64, symbolic_name: impl Into<String>) {
        self.nodes.entry(id).or_insert_with(|| DependencyNode { id, symbolic_name: symbolic_name.into() });
        self.edges.entry(id).or_default();
        self.reverse_edges.entry(id).or_default();
    }

    pub fn add_edge(&mut self, depender: u64, dependency: u64) {
        self.edges.entry(depender).or_default().insert(dependency);
        self.reverse_edges.entry(dependency).or_default().insert(depender);
    }

    pub fn remove_node(&mut self, id: u64) {
        self.nodes.remove(&id);
        if let Some(deps) = self.edges.remove(&id) {
            for dep in deps {
                if let Some(rev) = self.reverse_edges.get_mut(&dep) {
                    rev.remove(&id);
                }
            }
        }
        if let Some(dependents) = self.reverse_edges.remove(&id) {
            for dependent in dependents {
                if let Some(fwd) = self.edges.get_mut(&dependent) {
                    fwd.remove(&id);
                }
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn dependencies_of(&self, id: u64) -> Vec<u64> {
        self.edges.get(&id).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    pub fn dependents_of(&self, id: u64) -> Vec<u64> {
        self.reverse_edges.get(&id).map(|s| s.iter().copied().collect()).unwrap_or_default()
    }

    /// Kahn's algorithm. Ties in the ready queue are broken by ascending
    /// module id for determinism (spec §4.5).
    pub fn topological_sort(&self) -> Option<Vec<u64>> {
        // An edge depender->dependency means `dependency` must come before
        // `depender`; in-degree counts each depender's unresolved prerequisites.
        let mut in_degree: HashMap<u64, usize> = self.nodes.keys().map(|&id| (id, 0)).collect();
        for (&depender, deps) in &self.edges {
            *in_degree.entry(depender).or_insert(0) += deps.len();
        }

        let mut ready: BTreeSet<u64> =
            in_degree.iter().filter(|(_, &deg)| deg == 0).map(|(&id, _)| id).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut remaining_in_degree = in_degree;

        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            order.push(next);
            // `next`'s dependents had `next` as a prerequisite.
            for &dependent in self.reverse_edges.get(&next).unwrap_or(&BTreeSet::new()) {
                if let Some(deg) = remaining_in_degree.get_mut(&dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            Some(order)
        } else {
            None
        }
    }

    pub fn has_cycle(&self) -> bool {
        !self.detect_cycles().is_empty()
    }

    /// Iterative DFS with an explicit recursion stack; every back-edge
    /// found reports the cycle as an ordered list of symbolic names.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InStack,
            Done,
        }

        let mut marks: HashMap<u64, Mark> = self.nodes.keys().map(|&id| (id, Mark::Unvisited)).collect();
        let mut cycles = Vec::new();
        let mut sorted_ids: Vec<u64> = self.nodes.keys().copied().collect();
        sorted_ids.sort_unstable();

        for &start in &sorted_ids {
            if marks[&start] != Mark::Unvisited {
                continue;
            }
            let mut stack: Vec<(u64, std::collections::btree_set::Iter<u64>)> = Vec::new();
            let empty: BTreeSet<u64> = BTreeSet::new();
            let deps = self.edges.get(&start).unwrap_or(&empty);
            marks.insert(start, Mark::InStack);
            let mut path = vec![start];
            stack.push((start, deps.iter()));

            'dfs: while let Some((node, iter)) = stack.last_mut() {
                let node = *node;
                let mut advanced = false;
                for &next in iter.by_ref() {
                    match marks.get(&next).copied().unwrap_or(Mark::Done) {
                        Mark::Unvisited => {
                            marks.insert(next, Mark::InStack);
                            path.push(next);
                            let next_deps = self.edges.get(&next).unwrap_or(&empty);
                            stack.push((next, next_deps.iter()));
                            advanced = true;
                            continue 'dfs;
                        }
                        Mark::InStack => {
                            let cycle_start = path.iter().position(|&n| n == next).unwrap_or(0);
                            let cycle: Vec<String> = path[cycle_start..]
                                .iter()
                                .map(|id| self.nodes.get(id).map(|n| n.symbolic_name.clone()).unwrap_or_default())
                                .collect();
                            cycles.push(cycle);
                        }
                        Mark::Done => {}
                    }
                }
                if !advanced {
                    marks.insert(node, Mark::Done);
                    path.pop();
                    stack.pop();
                }
            }
        }

        cycles
    }

    /// Clones the graph, adds a candidate node with its edges, and reports
    /// whether the result is still acyclic (used to gate install).
    pub fn validate_candidate(&self, id: u64, symbolic_name: &str, dependency_ids: &[u64]) -> bool {
        let mut clone = self.clone();
        clone.add_node(id, symbolic_name);
        for &dep in dependency_ids {
            clone.add_edge(id, dep);
        }
        !clone.has_cycle()
    }
}

/// Builds and owns the dependency graph, and turns it into start/stop
/// orders. Backed by a [`ModuleRegistry`] (spec §4.5).
pub struct DependencyResolver {
    graph: parking_lot::RwLock<DependencyGraph>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self { graph: parking_lot::RwLock::new(DependencyGraph::new()) }
    }

    /// Rebuilds the graph from scratch against the current registry
    /// contents. Non-optional deps that can't be satisfied simply don't get
    /// an edge (leaving the depending module unresolved, not an error
    /// here); only a real cycle among satisfied edges is fatal.
    pub fn rebuild(&self, registry: &ModuleRegistry) -> Result<(), ModuleException> {
        let modules = registry.get_all();
        let mut graph = DependencyGraph::new();
        for module in &modules {
            graph.add_node(module.id(), module.symbolic_name());
        }
        for module in &modules {
            let manifest = module.manifest();
            for dep in manifest.required_dependencies() {
                match registry.find_compatible(&dep.symbolic_name, &dep.range) {
                    Some(target) => graph.add_edge(module.id(), target.id()),
                    None => {
                        warn!(
                            module = %module.symbolic_name(),
                            dependency = %dep.symbolic_name,
                            range = %dep.range,
                            "unsatisfied required dependency"
                        );
                    }
                }
            }
        }

        let cycles = graph.detect_cycles();
        if !cycles.is_empty() {
            let description = cycles
                .iter()
                .map(|c| c.join(" -> "))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ModuleException::CyclicDependency(description));
        }

        *self.graph.write() = graph;
        Ok(())
    }

    /// Whether every non-optional dependency of `module` currently
    /// resolves to some module in the registry (used to decide
    /// `Installed` vs `Resolved` on install and update).
    pub fn dependencies_satisfied(&self, manifest: &crate::manifest::ModuleManifest, registry: &ModuleRegistry) -> bool {
        manifest
            .required_dependencies()
            .all(|dep| registry.find_compatible(&dep.symbolic_name, &dep.range).is_some())
    }

    /// Clone-and-check gate used before a candidate module is actually
    /// registered.
    pub fn validate_candidate(&self, id: u64, symbolic_name: &str, dependency_ids: &[u64]) -> bool {
        self.graph.read().validate_candidate(id, symbolic_name, dependency_ids)
    }

    pub fn get_start_order(&self) -> Option<Vec<u64>> {
        self.graph.read().topological_sort()
    }

    pub fn get_stop_order(&self) -> Option<Vec<u64>> {
        self.get_start_order().map(|mut order| {
            order.reverse();
            order
        })
    }

    pub fn dependencies_of(&self, id: u64) -> Vec<u64> {
        self.graph.read().dependencies_of(id)
    }

    pub fn dependents_of(&self, id: u64) -> Vec<u64> {
        self.graph.read().dependents_of(id)
    }
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves a module's non-optional dependency ids against a registry,
/// used both by the resolver's rebuild step and by install-time
/// validation. Returns `None` entries dropped (unsatisfied), matching the
/// "edge omitted, not fatal" rule.
pub fn resolve_dependency_ids(
    manifest: &crate::manifest::ModuleManifest,
    registry: &ModuleRegistry,
) -> Vec<u64> {
    manifest
        .required_dependencies()
        .filter_map(|dep| registry.find_compatible(&dep.symbolic_name, &dep.range).map(|m| m.id()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topological_sort_respects_edges() {
        let mut g = DependencyGraph::new();
        g.add_node(1, "a");
        g.add_node(2, "b");
        g.add_node(3, "c");
        // c depends on b depends on a
        g.add_edge(3, 2);
        g.add_edge(2, 1);
        let order = g.topological_sort().unwrap();
        let pos = |id: u64| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(1) < pos(2));
        assert!(pos(2) < pos(3));
    }

    #[test]
    fn detects_simple_cycle() {
        let mut g = DependencyGraph::new();
        g.add_node(1, "a");
        g.add_node(2, "b");
        g.add_edge(1, 2);
        g.add_edge(2, 1);
        assert!(g.has_cycle());
        let cycles = g.detect_cycles();
        assert!(!cycles.is_empty());
    }

    #[test]
    fn acyclic_graph_has_no_cycles() {
        let mut g = DependencyGraph::new();
        g.add_node(1, "a");
        g.add_node(2, "b");
        g.add_edge(2, 1);
        assert!(!g.has_cycle());
    }

    #[test]
    fn validate_candidate_rejects_would_be_cycle() {
        let mut g = DependencyGraph::new();
        g.add_node(1, "a");
        g.add_node(2, "b");
        g.add_edge(1, 2); // a depends on b
        // candidate c (id 3) depended on by b would be fine...
        assert!(g.validate_candidate(3, "c", &[1])); // c depends on a: fine, no cycle
    }

    #[test]
    fn stop_order_is_exact_reverse_of_start_order() {
        let resolver = DependencyResolver::new();
        let registry = ModuleRegistry::new();
        resolver.rebuild(&registry).unwrap();
        // empty graph: both orders are empty and trivially reverses of each other
        assert_eq!(resolver.get_start_order(), Some(vec![]));
        assert_eq!(resolver.get_stop_order(), Some(vec![]));
    }
}
