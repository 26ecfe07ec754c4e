//! Kahn's algorithm over a generic `node -> predecessors` graph.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;

/// Topologically sort `graph`, a map of each node to the list of nodes it
/// depends on (its predecessors). Returns nodes in an order where every
/// predecessor appears before its successor. Tie-breaking among
/// simultaneously-ready nodes is unspecified.
///
/// Returns the first node found to be part of a cycle if the graph is
/// not acyclic -- Kahn's algorithm detects this because such nodes never
/// reach in-degree zero.
pub fn kahn<N>(graph: &HashMap<N, Vec<N>>) -> Result<Vec<N>, N>
where
    N: Eq + Hash + Clone,
{
    // successors[d] = nodes that depend on d
    let mut successors: HashMap<N, Vec<N>> = HashMap::new();
    let mut in_degree: HashMap<N, usize> = HashMap::new();

    for node in graph.keys() {
        in_degree.entry(node.clone()).or_insert(0);
    }
    for (node, deps) in graph {
        *in_degree.entry(node.clone()).or_insert(0) += deps.len();
        for dep in deps {
            successors.entry(dep.clone()).or_default().push(node.clone());
            in_degree.entry(dep.clone()).or_insert(0);
        }
    }

    let mut ready: VecDeque<N> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(node, _)| node.clone())
        .collect();

    let mut order = Vec::with_capacity(in_degree.len());
    let mut remaining = in_degree.clone();

    while let Some(node) = ready.pop_front() {
        order.push(node.clone());
        if let Some(succs) = successors.get(&node) {
            for succ in succs {
                let deg = remaining.get_mut(succ).expect("successor tracked in-degree");
                *deg -= 1;
                if *deg == 0 {
                    ready.push_back(succ.clone());
                }
            }
        }
    }

    if order.len() == remaining.len() {
        Ok(order)
    } else {
        let emitted: HashSet<&N> = order.iter().collect();
        let stuck = remaining
            .keys()
            .find(|node| !emitted.contains(node))
            .expect("order is short, so a stuck node exists")
            .clone();
        Err(stuck)
    }
}
