//! Dependency ordering for plugin registration.
//!
//! Builds a directed graph with an edge from each dependency to its
//! dependent and hands it to petgraph's toposort, which visits nodes in
//! insertion order so ties break deterministically. Dependency names that
//! resolve to no known node are logged and skipped.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::prelude::StableDiGraph;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq)]
pub enum SortError {
    #[error("Circular dependency detected involving `{0}`")]
    Cycle(String),
}

/// Order `nodes` so every name appears after all of its dependencies.
/// `edges` maps a name to the names it depends on.
pub fn sort(
    nodes: &[String],
    edges: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>, SortError> {
    let mut graph = StableDiGraph::<String, ()>::new();
    let mut index_of = HashMap::new();

    for name in nodes {
        if !index_of.contains_key(name) {
            let ix = graph.add_node(name.clone());
            index_of.insert(name.clone(), ix);
        }
    }

    for name in nodes {
        let Some(deps) = edges.get(name) else { continue };
        let nix = index_of[name];
        for dep in deps {
            match index_of.get(dep) {
                Some(&dix) => {
                    graph.add_edge(dix, nix, ());
                }
                None => {
                    warn!(node = %name, dependency = %dep, "unknown dependency, treating as absent");
                }
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(|ix| graph[ix].clone()).collect()),
        Err(cycle) => Err(SortError::Cycle(graph[cycle.node_id()].clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn edge_map(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(n, deps)| (n.to_string(), names(deps)))
            .collect()
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn dependencies_precede_dependents() {
        let nodes = names(&["A", "B", "C", "D"]);
        let edges = edge_map(&[("B", &["A"]), ("C", &["B"]), ("D", &["A", "C"])]);
        let order = sort(&nodes, &edges).unwrap();
        assert_eq!(order.len(), 4);
        assert!(position(&order, "A") < position(&order, "B"));
        assert!(position(&order, "B") < position(&order, "C"));
        assert!(position(&order, "A") < position(&order, "D"));
        assert!(position(&order, "C") < position(&order, "D"));
    }

    #[test]
    fn cycle_is_an_error() {
        let nodes = names(&["X", "Y", "Z"]);
        let edges = edge_map(&[("X", &["Z"]), ("Y", &["X"]), ("Z", &["Y"])]);
        let err = sort(&nodes, &edges).unwrap_err();
        assert!(err.to_string().contains("Circular dependency"));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let nodes = names(&["A"]);
        let edges = edge_map(&[("A", &["A"])]);
        assert_eq!(sort(&nodes, &edges), Err(SortError::Cycle("A".into())));
    }

    #[test]
    fn unknown_dependency_is_skipped() {
        let nodes = names(&["A", "B"]);
        let edges = edge_map(&[("B", &["A", "ghost"])]);
        let order = sort(&nodes, &edges).unwrap();
        assert_eq!(order.len(), 2);
        assert!(position(&order, "A") < position(&order, "B"));
    }

    #[test]
    fn independent_nodes_keep_insertion_order() {
        let nodes = names(&["one", "two", "three"]);
        let order = sort(&nodes, &HashMap::new()).unwrap();
        assert_eq!(order, names(&["one", "two", "three"]));
    }
}
