//! # Group Splitter
//!
//! Breaks flow groups whose combined source exceeds a character budget into
//! `-partN` sub-groups of equal member count. Sub-group topology is
//! recomputed from the parent's internal edges, scoped to the part.

use super::partition::FlowGroup;

/// Default per-group source budget, in characters
pub const DEFAULT_MAX_SOURCE_CHARS: usize = 500_000;

/// Split every group whose total member size exceeds `budget`.
///
/// Groups within budget are re-emitted as-is. An oversized group of `n`
/// members becomes `ceil(total / budget)` parts of `ceil(n / parts)` members
/// each, taken in name order. A budget of zero disables splitting.
pub fn split_oversized<F>(groups: &[FlowGroup], size_of: F, budget: usize) -> Vec<FlowGroup>
where
    F: Fn(&str) -> usize,
{
    let mut result = Vec::with_capacity(groups.len());

    for group in groups {
        let total: usize = group.member_names().map(&size_of).sum();
        if budget == 0 || total <= budget || group.len() <= 1 {
            if budget > 0 && total > budget {
                tracing::warn!(
                    group = %group.name,
                    chars = total,
                    budget,
                    "Single namespace exceeds the source budget"
                );
            }
            result.push(group.clone());
            continue;
        }

        let num_splits = total.div_ceil(budget).min(group.len());
        let chunk_size = group.len().div_ceil(num_splits);

        let mut members = group.namespaces.clone();
        members.sort_by(|a, b| a.name.cmp(&b.name));

        for (k, chunk) in members.chunks(chunk_size).enumerate() {
            let part = FlowGroup::from_members(
                format!("{}-part{}", group.name, k + 1),
                chunk.to_vec(),
                |name| {
                    group
                        .internal_deps
                        .get(name)
                        .map(Vec::as_slice)
                        .unwrap_or(&[])
                },
            );
            let part_chars: usize = part.member_names().map(&size_of).sum();
            if part_chars > budget {
                tracing::warn!(
                    group = %part.name,
                    chars = part_chars,
                    budget,
                    "Sub-group still exceeds the source budget"
                );
            }
            tracing::info!(
                group = %part.name,
                members = part.len(),
                chars = part_chars,
                "Split oversized flow group"
            );
            result.push(part);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::partition::partition;
    use crate::structure::{DependencyGraph, Namespace};
    use std::collections::{BTreeSet, HashMap};

    /// One connected chain `ns.m00 -> ns.m01 -> ... -> ns.m{n-1}`
    fn chain(n: usize) -> FlowGroup {
        let names: Vec<String> = (0..n).map(|i| format!("ns.m{:02}", i)).collect();
        let namespaces: Vec<Namespace> = names
            .iter()
            .map(|n| Namespace::new(n.clone(), format!("{}.clj", n)))
            .collect();
        let mut graph = DependencyGraph::new();
        for pair in names.windows(2) {
            graph.insert(pair[0].clone(), vec![pair[1].clone()]);
        }
        let mut groups = partition(&namespaces, &graph);
        assert_eq!(groups.len(), 1);
        groups.remove(0)
    }

    #[test]
    fn test_under_budget_passes_through() {
        let group = chain(4);
        let out = split_oversized(&[group.clone()], |_| 10, 100);
        assert_eq!(out, vec![group]);
    }

    #[test]
    fn test_split_count_and_names() {
        let group = chain(10);
        // total 1000 over budget 300 -> 4 parts of ceil(10/4) = 3 members
        let out = split_oversized(&[group], |_| 100, 300);
        let names: Vec<_> = out.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["flow-m00-part1", "flow-m00-part2", "flow-m00-part3", "flow-m00-part4"]
        );
        let sizes: Vec<_> = out.iter().map(FlowGroup::len).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[test]
    fn test_no_part_exceeds_budget() {
        let group = chain(12);
        let sizes: HashMap<String, usize> = group
            .member_names()
            .enumerate()
            .map(|(i, n)| (n.to_string(), 20 + i))
            .collect();
        // 306 chars over budget 100 -> 4 parts of 3
        let budget = 100;
        let out = split_oversized(&[group], |n| sizes[n], budget);
        for part in &out {
            let total: usize = part.member_names().map(|n| sizes[n]).sum();
            assert!(total <= budget, "{} has {} chars", part.name, total);
        }
    }

    #[test]
    fn test_parts_recover_original_membership() {
        let group = chain(7);
        let original: BTreeSet<String> = group.member_names().map(str::to_string).collect();
        let out = split_oversized(&[group], |_| 50, 120);
        assert!(out.len() > 1);
        let merged: Vec<String> = out
            .iter()
            .flat_map(|g| g.member_names().map(str::to_string))
            .collect();
        assert_eq!(merged.len(), original.len());
        assert_eq!(merged.into_iter().collect::<BTreeSet<_>>(), original);
    }

    #[test]
    fn test_part_topology_is_scoped() {
        let group = chain(4);
        // 2 parts: [m00, m01], [m02, m03]
        let out = split_oversized(&[group], |_| 10, 20);
        assert_eq!(out.len(), 2);

        let first = &out[0];
        assert_eq!(first.internal_deps.len(), 1);
        assert_eq!(first.internal_deps["ns.m00"], vec!["ns.m01"]);
        // m01's edge to m02 left the part
        assert_eq!(first.entry_points, vec!["ns.m01"]);
        assert_eq!(first.exit_points, vec!["ns.m00"]);

        let second = &out[1];
        assert_eq!(second.entry_points, vec!["ns.m03"]);
        assert_eq!(second.exit_points, vec!["ns.m02"]);
    }

    #[test]
    fn test_oversized_singleton_kept() {
        let group = chain(1);
        let out = split_oversized(&[group.clone()], |_| 1_000, 10);
        assert_eq!(out, vec![group]);
    }

    #[test]
    fn test_order_of_groups_preserved() {
        let a = chain(2);
        let mut b = chain(2);
        b.name = "flow-z".to_string();
        let out = split_oversized(&[b.clone(), a.clone()], |_| 1, 100);
        assert_eq!(out[0].name, "flow-z");
        assert_eq!(out[1].name, a.name);
    }
}
