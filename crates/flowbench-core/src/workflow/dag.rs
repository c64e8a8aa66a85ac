//! Dependency graph, topological ordering, and cycle reporting.
//!
//! Uses `petgraph` to model step dependencies as a directed graph with edges
//! from dependency to dependent. `toposort` orders the steps; when it finds
//! a cycle, `tarjan_scc` isolates the strongly connected component and a DFS
//! walks it so the error can name every step on the cycle.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

/// Step id to the ids it depends on.
pub type DependencyMap = BTreeMap<String, BTreeSet<String>>;

/// Directed step graph (dependency -> dependent).
pub struct StepGraph {
    graph: DiGraph<String, ()>,
    /// Declaration order of each node, for stable reporting.
    position: HashMap<NodeIndex, usize>,
}

impl StepGraph {
    /// Build the graph. `ids` gives declaration order; every dependency in
    /// `deps` must name an id in `ids`.
    pub fn build(ids: &[String], deps: &DependencyMap) -> Self {
        let mut graph = DiGraph::<String, ()>::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
        let mut position = HashMap::new();
        for (i, id) in ids.iter().enumerate() {
            let node = graph.add_node(id.clone());
            nodes.insert(id.as_str(), node);
            position.insert(node, i);
        }
        for id in ids {
            let to = nodes[id.as_str()];
            for dep in deps.get(id).into_iter().flatten() {
                if let Some(&from) = nodes.get(dep.as_str()) {
                    graph.add_edge(from, to, ());
                }
            }
        }
        Self { graph, position }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Topological order of step ids, or the steps of one cycle.
    pub fn topological_order(&self) -> Result<Vec<String>, Vec<String>> {
        match toposort(&self.graph, None) {
            Ok(sorted) => Ok(sorted.into_iter().map(|n| self.graph[n].clone()).collect()),
            Err(_) => Err(self.find_cycle()),
        }
    }

    /// Steps of the first cyclic component (by declaration order), in cycle
    /// order starting from its earliest-declared member.
    fn find_cycle(&self) -> Vec<String> {
        let mut components: Vec<Vec<NodeIndex>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
            .collect();
        for scc in &mut components {
            scc.sort_by_key(|n| self.position[n]);
        }
        components.sort_by_key(|scc| self.position[&scc[0]]);

        let Some(scc) = components.first() else {
            return Vec::new();
        };
        let members: BTreeSet<NodeIndex> = scc.iter().copied().collect();
        let start = scc[0];

        let mut path = vec![start];
        let mut visited = BTreeSet::from([start]);
        if !self.walk_cycle(start, start, &members, &mut path, &mut visited) {
            path = scc.clone();
        }
        // Members on other cycles of the same component follow the walked cycle.
        for node in scc {
            if !path.contains(node) {
                path.push(*node);
            }
        }
        path.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    fn walk_cycle(
        &self,
        current: NodeIndex,
        start: NodeIndex,
        members: &BTreeSet<NodeIndex>,
        path: &mut Vec<NodeIndex>,
        visited: &mut BTreeSet<NodeIndex>,
    ) -> bool {
        let mut next: Vec<NodeIndex> = self
            .graph
            .neighbors(current)
            .filter(|n| members.contains(n))
            .collect();
        next.sort_by_key(|n| self.position[n]);
        for n in next {
            if n == start {
                return true;
            }
            if visited.insert(n) {
                path.push(n);
                if self.walk_cycle(n, start, members, path, visited) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }
}

/// Group a topological order into waves: every step in a wave depends only
/// on steps of earlier waves.
pub fn execution_waves(order: &[String], deps: &DependencyMap) -> Vec<Vec<String>> {
    let mut depth: HashMap<&str, usize> = HashMap::new();
    let mut waves: Vec<Vec<String>> = Vec::new();
    for id in order {
        let d = deps
            .get(id)
            .into_iter()
            .flatten()
            .map(|dep| depth.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depth.insert(id.as_str(), d);
        if waves.len() <= d {
            waves.resize_with(d + 1, Vec::new);
        }
        waves[d].push(id.clone());
    }
    waves
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn deps(edges: &[(&str, &[&str])]) -> DependencyMap {
        edges
            .iter()
            .map(|(id, ds)| (id.to_string(), ds.iter().map(|d| d.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_linear_chain_order() {
        let ids = ids(&["c", "b", "a"]);
        let deps = deps(&[("b", &["a"]), ("c", &["b"])]);
        let order = StepGraph::build(&ids, &deps).topological_order().unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(
            execution_waves(&order, &deps),
            vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
        );
    }

    #[test]
    fn test_diamond_waves() {
        let ids = ids(&["a", "b", "c", "d"]);
        let deps = deps(&[("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        let order = StepGraph::build(&ids, &deps).topological_order().unwrap();
        let waves = execution_waves(&order, &deps);
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[1].len(), 2);
        assert_eq!(waves[2], vec!["d".to_string()]);
    }

    #[test]
    fn test_cycle_names_every_step_in_order() {
        let ids = ids(&["entry", "a", "b", "c"]);
        let deps = deps(&[("a", &["c", "entry"]), ("b", &["a"]), ("c", &["b"])]);
        let cycle = StepGraph::build(&ids, &deps).topological_order().unwrap_err();
        assert_eq!(cycle, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let ids = ids(&["a", "b"]);
        let deps = deps(&[("b", &["b"])]);
        let cycle = StepGraph::build(&ids, &deps).topological_order().unwrap_err();
        assert_eq!(cycle, vec!["b"]);
    }

    #[test]
    fn test_component_with_two_cycles_names_all_members() {
        // a -> b -> a and b -> c -> b share b.
        let ids = ids(&["a", "b", "c"]);
        let deps = deps(&[("a", &["b"]), ("b", &["a", "c"]), ("c", &["b"])]);
        let cycle = StepGraph::build(&ids, &deps).topological_order().unwrap_err();
        let mut sorted = cycle.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["a", "b", "c"]);
        assert_eq!(cycle[0], "a");
    }
}
