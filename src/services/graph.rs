//! Service graph algorithms: startup tiering and cycle detection.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use thiserror::Error;

/// Error from tiering a graph that contains a cycle.
#[derive(Debug, Error)]
#[error("cycle among: {}", .members.join(", "))]
pub struct CycleError {
    /// Nodes left with unresolved prerequisites.
    pub members: Vec<String>,
}

/// Group nodes into startup tiers with Kahn's algorithm.
///
/// `edges[n]` lists the prerequisites of `n`; every node in a tier has all
/// of its prerequisites in earlier tiers. Nodes within a tier are sorted
/// lexicographically so output is deterministic.
pub fn topological_tiers(
    nodes: &BTreeSet<String>,
    edges: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<Vec<String>>, CycleError> {
    let mut indegree: BTreeMap<&str, usize> = nodes.iter().map(|n| (n.as_str(), 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (node, prereqs) in edges {
        if !nodes.contains(node) {
            continue;
        }
        for prereq in prereqs {
            if !nodes.contains(prereq) {
                continue;
            }
            *indegree.entry(node.as_str()).or_default() += 1;
            dependents.entry(prereq.as_str()).or_default().push(node.as_str());
        }
    }

    let mut tiers: Vec<Vec<String>> = Vec::new();
    let mut ready: Vec<&str> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(node, _)| *node)
        .collect();
    let mut placed = 0usize;

    while !ready.is_empty() {
        ready.sort_unstable();
        let tier: Vec<String> = ready.iter().map(|n| (*n).to_string()).collect();
        placed += tier.len();

        let mut next: Vec<&str> = Vec::new();
        for node in ready {
            indegree.remove(node);
            if let Some(children) = dependents.get(node) {
                for child in children {
                    if let Some(degree) = indegree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(child);
                        }
                    }
                }
            }
        }
        tiers.push(tier);
        ready = next;
    }

    if placed != nodes.len() {
        let members: Vec<String> = indegree.keys().map(|n| (*n).to_string()).collect();
        return Err(CycleError { members });
    }

    Ok(tiers)
}

/// Find one cycle in the graph, if any, returned as the path of nodes in
/// edge order with the starting node repeated at the end (`a -> b -> a`).
pub fn find_cycle(
    nodes: &BTreeSet<String>,
    edges: &BTreeMap<String, Vec<String>>,
) -> Option<Vec<String>> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut on_stack: HashSet<&str> = HashSet::new();
    let mut path: Vec<&str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        edges: &'a BTreeMap<String, Vec<String>>,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        on_stack.insert(node);
        path.push(node);

        if let Some(neighbors) = edges.get(node) {
            for neighbor in neighbors {
                if on_stack.contains(neighbor.as_str()) {
                    let start = path.iter().position(|n| *n == neighbor.as_str())?;
                    let mut cycle: Vec<String> = path[start..].iter().map(|n| (*n).to_string()).collect();
                    cycle.push(neighbor.clone());
                    return Some(cycle);
                }
                if !visited.contains(neighbor.as_str()) {
                    if let Some(cycle) = visit(neighbor, edges, visited, on_stack, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        on_stack.remove(node);
        path.pop();
        None
    }

    for node in nodes {
        if !visited.contains(node.as_str()) {
            if let Some(cycle) = visit(node, edges, &mut visited, &mut on_stack, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Map each node to the tier index it landed in. Handy for assertions.
pub fn tier_index(tiers: &[Vec<String>]) -> HashMap<String, usize> {
    let mut index = HashMap::new();
    for (i, tier) in tiers.iter().enumerate() {
        for node in tier {
            index.insert(node.clone(), i);
        }
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| (*n).to_string()).collect()
    }

    fn edges(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(n, deps)| ((*n).to_string(), deps.iter().map(|d| (*d).to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_single_tier() {
        let tiers = topological_tiers(&nodes(&["a", "b"]), &BTreeMap::new()).unwrap();
        assert_eq!(tiers, vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[test]
    fn test_chain() {
        let tiers = topological_tiers(
            &nodes(&["a", "b", "c"]),
            &edges(&[("b", &["a"]), ("c", &["b"])]),
        )
        .unwrap();
        assert_eq!(tiers.len(), 3);
        assert_eq!(tiers[0], vec!["a"]);
        assert_eq!(tiers[2], vec!["c"]);
    }

    #[test]
    fn test_diamond_is_deterministic() {
        let tiers = topological_tiers(
            &nodes(&["a", "b", "c", "d"]),
            &edges(&[("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]),
        )
        .unwrap();
        assert_eq!(
            tiers,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ]
        );
    }

    #[test]
    fn test_cycle_rejected() {
        let err = topological_tiers(
            &nodes(&["a", "b"]),
            &edges(&[("a", &["b"]), ("b", &["a"])]),
        )
        .unwrap_err();
        assert_eq!(err.members, vec!["a", "b"]);
    }

    #[test]
    fn test_find_cycle_reports_path() {
        let cycle = find_cycle(
            &nodes(&["a", "b", "c"]),
            &edges(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]),
        )
        .unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn test_find_cycle_none() {
        assert!(find_cycle(&nodes(&["a", "b"]), &edges(&[("b", &["a"])])).is_none());
    }

    #[test]
    fn test_tier_index() {
        let tiers = vec![vec!["a".to_string()], vec!["b".to_string()]];
        let index = tier_index(&tiers);
        assert_eq!(index["a"], 0);
        assert_eq!(index["b"], 1);
    }
}
