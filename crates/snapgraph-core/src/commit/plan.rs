//! Write ordering for one unit of work

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Order `nodes` so every node comes after the nodes it depends on
///
/// Dependencies outside `nodes` are ignored. Ties keep input order. Nodes
/// on a cycle are appended in input order once nothing else can be placed.
pub fn dependency_order<T>(nodes: &[(T, Vec<T>)]) -> Vec<T>
where
    T: Clone + Eq + Hash,
{
    let position: HashMap<&T, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (node, _))| (node, i))
        .collect();

    let mut pending = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, (_, deps)) in nodes.iter().enumerate() {
        let mut seen = Vec::new();
        for dep in deps {
            let Some(&j) = position.get(dep) else {
                continue;
            };
            if j == i || seen.contains(&j) {
                continue;
            }
            seen.push(j);
            pending[i] += 1;
            dependents[j].push(i);
        }
    }

    let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|i| pending[*i] == 0).collect();
    let mut placed = vec![false; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());
    loop {
        while let Some(i) = ready.pop_front() {
            placed[i] = true;
            order.push(nodes[i].0.clone());
            let mut released: Vec<usize> = Vec::new();
            for &d in &dependents[i] {
                if placed[d] || pending[d] == 0 {
                    continue;
                }
                pending[d] -= 1;
                if pending[d] == 0 {
                    released.push(d);
                }
            }
            released.sort_unstable();
            ready.extend(released);
        }
        // cycle: force the earliest unplaced node
        match (0..nodes.len()).find(|i| !placed[*i] && pending[*i] > 0) {
            Some(i) => {
                pending[i] = 0;
                ready.push_back(i);
            }
            None => break,
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_referenced_before_referencing() {
        // painting -> artist, artist has no deps
        let nodes = vec![("painting", vec!["artist"]), ("artist", vec![])];
        assert_eq!(dependency_order(&nodes), vec!["artist", "painting"]);
    }

    #[test]
    fn test_independent_nodes_keep_input_order() {
        let nodes = vec![("b", vec![]), ("a", vec![]), ("c", vec![])];
        assert_eq!(dependency_order(&nodes), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_chain() {
        let nodes = vec![
            ("artist_exhibit", vec!["exhibit", "artist"]),
            ("exhibit", vec!["gallery"]),
            ("gallery", vec![]),
            ("artist", vec![]),
        ];
        let order = dependency_order(&nodes);
        let at = |n: &str| order.iter().position(|x| *x == n).unwrap();
        assert!(at("gallery") < at("exhibit"));
        assert!(at("exhibit") < at("artist_exhibit"));
        assert!(at("artist") < at("artist_exhibit"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_external_and_self_dependencies_ignored() {
        let nodes = vec![("a", vec!["a", "outside"]), ("b", vec!["a"])];
        assert_eq!(dependency_order(&nodes), vec!["a", "b"]);
    }

    #[test]
    fn test_cycle_still_places_everything() {
        let nodes = vec![("a", vec!["b"]), ("b", vec!["a"]), ("c", vec![])];
        let order = dependency_order(&nodes);
        assert_eq!(order.len(), 3);
        assert_eq!(order[0], "c");
    }
}
