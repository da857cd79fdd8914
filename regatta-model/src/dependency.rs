use std::collections::{BTreeMap, BTreeSet};

use crate::path::PathId;

/// Directed dependency graph over run specs, stored by id so the group tree
/// stays free of back references. An edge `a -> b` in `deps` means `a`
/// depends on `b`.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    deps: BTreeMap<PathId, BTreeSet<PathId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl DependencyGraph {
    pub fn new(deps: BTreeMap<PathId, BTreeSet<PathId>>) -> Self {
        DependencyGraph { deps }
    }

    pub fn dependencies_of(&self, id: &PathId) -> impl Iterator<Item = &PathId> {
        self.deps.get(id).into_iter().flatten()
    }

    pub fn is_acyclic(&self) -> bool {
        self.find_cycle().is_none()
    }

    /// A witness cycle, if any: a vertex sequence where each entry depends on
    /// the next and the last equals the first.
    pub fn find_cycle(&self) -> Option<Vec<PathId>> {
        let mut marks: BTreeMap<&PathId, Mark> = BTreeMap::new();
        for start in self.deps.keys() {
            if marks.contains_key(start) {
                continue;
            }
            let mut trail: Vec<&PathId> = Vec::new();
            if let Some(cycle) = self.visit(start, &mut marks, &mut trail) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        vertex: &'a PathId,
        marks: &mut BTreeMap<&'a PathId, Mark>,
        trail: &mut Vec<&'a PathId>,
    ) -> Option<Vec<PathId>> {
        match marks.get(vertex) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => {
                let start = trail.iter().position(|v| *v == vertex).unwrap_or(0);
                let mut cycle: Vec<PathId> = trail[start..].iter().map(|v| (*v).clone()).collect();
                cycle.push(vertex.clone());
                return Some(cycle);
            }
            None => {}
        }
        marks.insert(vertex, Mark::Visiting);
        trail.push(vertex);
        for dep in self.dependencies_of(vertex) {
            if let Some(cycle) = self.visit(dep, marks, trail) {
                return Some(cycle);
            }
        }
        trail.pop();
        marks.insert(vertex, Mark::Done);
        None
    }

    /// Length of the longest dependency chain hanging off `id`: 0 for a spec
    /// with no dependencies, `1 + max(chain of deps)` otherwise. The planner
    /// layers deployment steps by this number, ascending, so dependencies are
    /// always handled no later than their dependents.
    pub fn longest_chain(&self, id: &PathId) -> usize {
        let mut memo: BTreeMap<&PathId, usize> = BTreeMap::new();
        self.chain_length(id, &mut memo)
    }

    fn chain_length<'a>(&'a self, id: &'a PathId, memo: &mut BTreeMap<&'a PathId, usize>) -> usize {
        if let Some(&len) = memo.get(id) {
            return len;
        }
        // pre-mark so a cycle (rejected by validation anyway) cannot recurse
        memo.insert(id, 0);
        let len = self
            .dependencies_of(id)
            .map(|dep| 1 + self.chain_length(dep, memo))
            .max()
            .unwrap_or(0);
        memo.insert(id, len);
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> PathId {
        PathId::parse(raw).unwrap()
    }

    fn graph(edges: &[(&str, &[&str])]) -> DependencyGraph {
        let deps = edges
            .iter()
            .map(|(from, tos)| (id(from), tos.iter().map(|t| id(t)).collect()))
            .collect();
        DependencyGraph::new(deps)
    }

    #[test]
    fn test_acyclic_chain() {
        let g = graph(&[("/a", &["/b"]), ("/b", &["/c"]), ("/c", &[])]);
        assert!(g.is_acyclic());
    }

    #[test]
    fn test_detects_cycle() {
        let g = graph(&[("/a", &["/b"]), ("/b", &["/c"]), ("/c", &["/a"])]);
        let cycle = g.find_cycle().expect("cycle");
        // first and last entries close the loop
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.len() >= 3);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let g = graph(&[("/a", &["/a"])]);
        assert!(!g.is_acyclic());
    }

    #[test]
    fn test_longest_chain_counts_edges() {
        let g = graph(&[
            ("/app", &["/cache", "/db"]),
            ("/cache", &["/db"]),
            ("/db", &[]),
        ]);
        assert_eq!(g.longest_chain(&id("/db")), 0);
        assert_eq!(g.longest_chain(&id("/cache")), 1);
        // app -> cache -> db is longer than app -> db
        assert_eq!(g.longest_chain(&id("/app")), 2);
    }

    #[test]
    fn test_chain_of_unknown_vertex_is_zero() {
        let g = graph(&[("/a", &[])]);
        assert_eq!(g.longest_chain(&id("/missing")), 0);
    }
}
