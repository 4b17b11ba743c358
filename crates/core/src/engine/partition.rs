//! # Graph Partitioner
//!
//! Splits a namespace dependency graph into flow groups: the connected
//! components of the undirected graph, restricted to known namespaces.
//!
//! ## Determinism
//!
//! Names are sorted and mapped to arena indices before any union happens,
//! and a union always keeps the smaller index as root. Since index order is
//! name order, the root of every component is its lexicographically smallest
//! member no matter which order the edges arrive in.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::structure::{DependencyGraph, Namespace, StructureResult};

/// A connected subgraph of namespaces forming one data flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowGroup {
    /// Deterministic name, `flow-<last segment of first member>`
    pub name: String,
    /// Members, sorted by name
    pub namespaces: Vec<Namespace>,
    /// Members with no internal dependency of their own
    pub entry_points: Vec<String>,
    /// Members no other member depends on
    pub exit_points: Vec<String>,
    /// Dependency edges with both endpoints inside the group
    pub internal_deps: BTreeMap<String, Vec<String>>,
}

impl FlowGroup {
    /// Build a group from its members, deriving the internal topology.
    ///
    /// `deps_of` yields the outgoing edges of a member; edges leaving the
    /// member set are dropped.
    pub fn from_members<'a, F>(name: String, mut members: Vec<Namespace>, deps_of: F) -> Self
    where
        F: Fn(&str) -> &'a [String],
    {
        members.sort_by(|a, b| a.name.cmp(&b.name));
        let member_set: BTreeSet<&str> = members.iter().map(|ns| ns.name.as_str()).collect();

        let mut internal_deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for ns in &members {
            let deps: BTreeSet<&str> = deps_of(ns.name.as_str())
                .iter()
                .map(String::as_str)
                .filter(|dep| member_set.contains(dep))
                .collect();
            if !deps.is_empty() {
                internal_deps.insert(
                    ns.name.clone(),
                    deps.into_iter().map(str::to_string).collect(),
                );
            }
        }

        let required_by_others: BTreeSet<&str> = internal_deps
            .values()
            .flatten()
            .map(String::as_str)
            .collect();

        let entry_points = member_set
            .iter()
            .filter(|name| !internal_deps.contains_key(**name))
            .map(|name| name.to_string())
            .collect();
        let exit_points = member_set
            .iter()
            .filter(|name| !required_by_others.contains(**name))
            .map(|name| name.to_string())
            .collect();

        Self {
            name,
            namespaces: members,
            entry_points,
            exit_points,
            internal_deps,
        }
    }

    /// Member names in group order
    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.namespaces.iter().map(|ns| ns.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

/// Arena union-find over namespace indices
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            // path halving
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// The smaller index (smaller name) always becomes the root
    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[child] = root;
    }
}

/// Partition namespaces into flow groups.
///
/// Edges whose target is not one of `namespaces` (external libraries) are
/// ignored. The result covers every namespace exactly once and is sorted by
/// component root name.
pub fn partition(namespaces: &[Namespace], graph: &DependencyGraph) -> Vec<FlowGroup> {
    if namespaces.is_empty() {
        return Vec::new();
    }

    // Duplicate names collapse to the record with the smallest path
    let mut by_name: BTreeMap<&str, &Namespace> = BTreeMap::new();
    for ns in namespaces {
        by_name
            .entry(ns.name.as_str())
            .and_modify(|kept| {
                if ns.path < kept.path {
                    *kept = ns;
                }
            })
            .or_insert(ns);
    }

    let names: Vec<&str> = by_name.keys().copied().collect();
    let index: BTreeMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (*n, i)).collect();

    let mut set = DisjointSet::new(names.len());
    for (i, name) in names.iter().enumerate() {
        for dep in deps_of(graph, by_name[name], name) {
            if let Some(&j) = index.get(dep.as_str()) {
                set.union(i, j);
            }
        }
    }

    let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for i in 0..names.len() {
        let root = set.find(i);
        components.entry(root).or_default().push(i);
    }

    // BTreeMap iteration by root index is ascending root name
    components
        .into_values()
        .map(|members| {
            let group_name = format!("flow-{}", short_segment(names[members[0]]));
            let members: Vec<Namespace> = members
                .into_iter()
                .map(|i| by_name[names[i]].clone())
                .collect();
            FlowGroup::from_members(group_name, members, |name| {
                by_name
                    .get(name)
                    .map(|ns| deps_of(graph, *ns, name))
                    .unwrap_or(&[])
            })
        })
        .collect()
}

/// Partition the namespaces of an extraction result
pub fn partition_flow_groups(structure: &StructureResult) -> Vec<FlowGroup> {
    partition(&structure.namespaces, &structure.dependency_map)
}

/// Outgoing edges for a namespace: the graph entry wins over the record's own requires
fn deps_of<'a>(graph: &'a DependencyGraph, ns: &'a Namespace, name: &str) -> &'a [String] {
    graph
        .get(name)
        .map(Vec::as_slice)
        .unwrap_or(ns.requires.as_slice())
}

fn short_segment(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn ns(name: &str) -> Namespace {
        Namespace::new(name, format!("src/{}.clj", name.replace('.', "/")))
    }

    fn graph(edges: &[(&str, Vec<&str>)]) -> DependencyGraph {
        edges
            .iter()
            .map(|(from, to)| (from.to_string(), to.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_empty_input() {
        assert!(partition(&[], &DependencyGraph::new()).is_empty());
    }

    #[test]
    fn test_singleton_is_entry_and_exit() {
        let groups = partition(&[ns("svc.lonely")], &DependencyGraph::new());
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "flow-lonely");
        assert_eq!(groups[0].entry_points, vec!["svc.lonely"]);
        assert_eq!(groups[0].exit_points, vec!["svc.lonely"]);
        assert!(groups[0].internal_deps.is_empty());
    }

    #[test]
    fn test_chain_entry_and_exit_points() {
        // controller requires logic requires model
        let namespaces = vec![
            ns("svc.controller.orders"),
            ns("svc.logic.orders"),
            ns("svc.model.order"),
        ];
        let g = graph(&[
            ("svc.controller.orders", vec!["svc.logic.orders"]),
            ("svc.logic.orders", vec!["svc.model.order"]),
            ("svc.model.order", vec![]),
        ]);
        let groups = partition(&namespaces, &g);
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.name, "flow-orders");
        // model depends on nothing inside the group
        assert_eq!(group.entry_points, vec!["svc.model.order"]);
        // nothing inside the group depends on the controller
        assert_eq!(group.exit_points, vec!["svc.controller.orders"]);
        assert_eq!(group.internal_deps.len(), 2);
    }

    #[test]
    fn test_external_edges_are_dropped() {
        let namespaces = vec![ns("svc.a"), ns("svc.b")];
        let g = graph(&[
            ("svc.a", vec!["clojure.string", "schema.core"]),
            ("svc.b", vec!["clojure.string"]),
        ]);
        let groups = partition(&namespaces, &g);
        // shared external dependency does not connect them
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.internal_deps.is_empty()));
    }

    #[test]
    fn test_groups_sorted_by_root() {
        let namespaces = vec![ns("z.one"), ns("m.two"), ns("a.three"), ns("a.four")];
        let g = graph(&[("z.one", vec!["a.four"])]);
        let groups = partition(&namespaces, &g);
        let names: Vec<_> = groups.iter().map(|g| g.name.as_str()).collect();
        // roots: a.four (with z.one), a.three, m.two
        assert_eq!(names, vec!["flow-four", "flow-three", "flow-two"]);
        let first: Vec<_> = groups[0].member_names().collect();
        assert_eq!(first, vec!["a.four", "z.one"]);
    }

    #[test]
    fn test_reversed_input_is_identical() {
        let namespaces = vec![ns("b"), ns("c"), ns("a"), ns("d"), ns("e")];
        let g = graph(&[("c", vec!["a"]), ("e", vec!["d", "b"]), ("b", vec!["e"])]);
        let forward = partition(&namespaces, &g);
        let mut reversed_ns = namespaces.clone();
        reversed_ns.reverse();
        let backward = partition(&reversed_ns, &g);
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_duplicate_internal_edges_deduplicated() {
        let namespaces = vec![ns("a"), ns("b")];
        let g = graph(&[("a", vec!["b", "b"])]);
        let groups = partition(&namespaces, &g);
        assert_eq!(groups[0].internal_deps["a"], vec!["b"]);
    }

    #[test]
    fn test_falls_back_to_namespace_requires() {
        let namespaces = vec![ns("a").with_requires(["b"]), ns("b")];
        let groups = partition(&namespaces, &DependencyGraph::new());
        assert_eq!(groups.len(), 1);
    }

    fn arb_graph() -> impl Strategy<Value = (Vec<String>, Vec<(usize, usize)>)> {
        (1usize..24).prop_flat_map(|n| {
            let names = (0..n).map(|i| format!("ns.n{:02}", i)).collect::<Vec<_>>();
            let edges = proptest::collection::vec((0..n, 0..n), 0..(n * 2));
            (Just(names), edges)
        })
    }

    fn build(names: &[String], edges: &[(usize, usize)]) -> (Vec<Namespace>, DependencyGraph) {
        let namespaces = names.iter().map(|n| ns(n)).collect();
        let mut g = DependencyGraph::new();
        for (a, b) in edges {
            g.entry(names[*a].clone()).or_default().push(names[*b].clone());
        }
        (namespaces, g)
    }

    /// Reachability over the undirected edge set, by plain BFS
    fn connected(names: &[String], edges: &[(usize, usize)], a: usize, b: usize) -> bool {
        let mut seen = vec![false; names.len()];
        let mut queue = vec![a];
        seen[a] = true;
        while let Some(x) = queue.pop() {
            if x == b {
                return true;
            }
            for (p, q) in edges {
                let next = if *p == x {
                    *q
                } else if *q == x {
                    *p
                } else {
                    continue;
                };
                if !seen[next] {
                    seen[next] = true;
                    queue.push(next);
                }
            }
        }
        false
    }

    proptest! {
        #[test]
        fn prop_partition_is_complete((names, edges) in arb_graph()) {
            let (namespaces, g) = build(&names, &edges);
            let groups = partition(&namespaces, &g);
            let mut seen = HashSet::new();
            for group in &groups {
                for member in group.member_names() {
                    prop_assert!(seen.insert(member.to_string()), "duplicate member {}", member);
                }
            }
            let expected: HashSet<String> = names.iter().cloned().collect();
            prop_assert_eq!(seen, expected);
        }

        #[test]
        fn prop_partition_matches_connectivity((names, edges) in arb_graph()) {
            let (namespaces, g) = build(&names, &edges);
            let groups = partition(&namespaces, &g);
            let group_of = |name: &str| groups.iter().position(|g| g.member_names().any(|m| m == name));
            for a in 0..names.len() {
                for b in 0..names.len() {
                    let same = group_of(&names[a]) == group_of(&names[b]);
                    prop_assert_eq!(same, connected(&names, &edges, a, b));
                }
            }
        }

        #[test]
        fn prop_partition_ignores_input_order((names, edges) in arb_graph()) {
            let (namespaces, g) = build(&names, &edges);
            let mut reversed = namespaces.clone();
            reversed.reverse();
            prop_assert_eq!(partition(&namespaces, &g), partition(&reversed, &g));
        }
    }
}
