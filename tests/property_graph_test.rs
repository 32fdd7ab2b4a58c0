//! Property tests for the service graph tiering.

use std::collections::{BTreeMap, BTreeSet};

use initrunner::services::graph::{tier_index, topological_tiers};
use proptest::prelude::*;

/// Random DAGs: edges only point from lower-numbered to higher-numbered
/// nodes, so the graph is acyclic by construction.
fn arbitrary_dag() -> impl Strategy<Value = (BTreeSet<String>, BTreeMap<String, Vec<String>>)> {
    (2usize..12).prop_flat_map(|n| {
        let names: Vec<String> = (0..n).map(|i| format!("svc{i:02}")).collect();
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|hi| (0..hi).map(move |lo| (lo, hi)))
            .collect();
        let edge_mask = proptest::collection::vec(any::<bool>(), pairs.len());
        edge_mask.prop_map(move |mask| {
            let mut edges: BTreeMap<String, Vec<String>> =
                names.iter().map(|name| (name.clone(), Vec::new())).collect();
            for ((lo, hi), keep) in pairs.iter().zip(mask) {
                if keep {
                    edges
                        .get_mut(&names[*hi])
                        .unwrap()
                        .push(names[*lo].clone());
                }
            }
            (names.iter().cloned().collect(), edges)
        })
    })
}

proptest! {
    #[test]
    fn prop_every_dependency_lands_in_an_earlier_tier((nodes, edges) in arbitrary_dag()) {
        let tiers = topological_tiers(&nodes, &edges).expect("acyclic by construction");
        let index = tier_index(&tiers);

        // Every node is placed exactly once.
        let placed: usize = tiers.iter().map(Vec::len).sum();
        prop_assert_eq!(placed, nodes.len());

        // Each prerequisite sits strictly earlier than its dependent.
        for (node, prereqs) in &edges {
            for prereq in prereqs {
                prop_assert!(index[prereq] < index[node],
                    "{} (tier {}) must precede {} (tier {})",
                    prereq, index[prereq], node, index[node]);
            }
        }
    }

    #[test]
    fn prop_tiers_are_sorted_and_disjoint((nodes, edges) in arbitrary_dag()) {
        let tiers = topological_tiers(&nodes, &edges).expect("acyclic by construction");
        let mut seen = BTreeSet::new();
        for tier in &tiers {
            let mut sorted = tier.clone();
            sorted.sort();
            prop_assert_eq!(&sorted, tier);
            for node in tier {
                prop_assert!(seen.insert(node.clone()), "{} placed twice", node);
            }
        }
    }
}
