//! Primary/foreign-key sidecar loader.
//!
//! Declared key relationships arrive as a six-column CSV
//! `(child_table, child_column, is_pk_flag, _, parent_table, parent_column)`
//! with a header row. A `Y` flag marks the child column as a primary-key
//! contributor; a non-empty parent pair declares a foreign-key equality
//! edge. Edges are closed transitively into cliques, which the join
//! extractor later partitions into the actual join graph.

use std::collections::BTreeMap;
use std::path::Path;

use crate::context::AttrRef;
use crate::error::UnveilError;

/// Parsed sidecar contents.
#[derive(Debug, Clone, Default)]
pub struct KeySidecar {
    /// Primary-key columns per table, in declaration order.
    pub primary_keys: BTreeMap<String, Vec<String>>,
    /// Foreign-key equivalence cliques, transitively closed, restricted to
    /// known relations, singletons dropped.
    pub cliques: Vec<Vec<AttrRef>>,
}

/// Load and close the key file against the set of known relations.
pub fn load_key_file(path: &Path, db_relations: &[String]) -> Result<KeySidecar, UnveilError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| UnveilError::KeyFile(format!("cannot open {}: {e}", path.display())))?;

    let mut primary_keys: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut edges: Vec<(AttrRef, AttrRef)> = Vec::new();
    let mut nodes: Vec<AttrRef> = Vec::new();

    for record in reader.records() {
        let record =
            record.map_err(|e| UnveilError::KeyFile(format!("{}: {e}", path.display())))?;
        let field = |i: usize| record.get(i).unwrap_or("").trim().to_string();

        let child_table = field(0);
        let child_column = field(1);
        let pk_flag = field(2);
        let parent_table = field(4);
        let parent_column = field(5);

        if child_table.is_empty() {
            continue;
        }

        if pk_flag.eq_ignore_ascii_case("y") {
            let cols = primary_keys.entry(child_table.clone()).or_default();
            if !cols.contains(&child_column) {
                cols.push(child_column.clone());
            }
        }

        let child: AttrRef = (child_table, child_column);
        if !nodes.contains(&child) {
            nodes.push(child.clone());
        }
        if !parent_table.is_empty() {
            let parent: AttrRef = (parent_table, parent_column);
            if !nodes.contains(&parent) {
                nodes.push(parent.clone());
            }
            edges.push((child, parent));
        }
    }

    let cliques = close_cliques(&nodes, &edges, db_relations);
    Ok(KeySidecar {
        primary_keys,
        cliques,
    })
}

/// Union the declared equality edges into transitively-closed cliques.
///
/// Members are restricted to relations that exist in the database, and
/// cliques that shrink below two members are dropped — a join needs at
/// least two sides. Output order is sorted for deterministic probing.
fn close_cliques(
    nodes: &[AttrRef],
    edges: &[(AttrRef, AttrRef)],
    db_relations: &[String],
) -> Vec<Vec<AttrRef>> {
    let index: BTreeMap<&AttrRef, usize> =
        nodes.iter().enumerate().map(|(i, n)| (n, i)).collect();
    let mut parent: Vec<usize> = (0..nodes.len()).collect();

    fn find(parent: &mut Vec<usize>, i: usize) -> usize {
        let mut root = i;
        while parent[root] != root {
            root = parent[root];
        }
        let mut cur = i;
        while parent[cur] != root {
            let next = parent[cur];
            parent[cur] = root;
            cur = next;
        }
        root
    }

    for (a, b) in edges {
        let (ia, ib) = (index[a], index[b]);
        let (ra, rb) = (find(&mut parent, ia), find(&mut parent, ib));
        if ra != rb {
            parent[rb] = ra;
        }
    }

    let mut groups: BTreeMap<usize, Vec<AttrRef>> = BTreeMap::new();
    for (i, node) in nodes.iter().enumerate() {
        let root = find(&mut parent, i);
        groups.entry(root).or_default().push(node.clone());
    }

    let mut cliques: Vec<Vec<AttrRef>> = groups
        .into_values()
        .map(|mut members| {
            members.retain(|(table, _)| db_relations.iter().any(|r| r == table));
            members.sort();
            members
        })
        .filter(|members| members.len() > 1)
        .collect();
    cliques.sort();
    cliques
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clique_of(raw: &[(&str, &str)]) -> Vec<AttrRef> {
        raw.iter()
            .map(|(t, a)| (t.to_string(), a.to_string()))
            .collect()
    }

    #[test]
    fn test_transitive_closure_merges_chains() {
        let nodes = clique_of(&[
            ("customer", "c_custkey"),
            ("orders", "o_custkey"),
            ("history", "h_custkey"),
        ]);
        let edges = vec![
            (nodes[1].clone(), nodes[0].clone()),
            (nodes[2].clone(), nodes[1].clone()),
        ];
        let rels: Vec<String> = ["customer", "orders", "history"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let cliques = close_cliques(&nodes, &edges, &rels);
        assert_eq!(cliques.len(), 1);
        assert_eq!(cliques[0].len(), 3);
    }

    #[test]
    fn test_unknown_relations_are_dropped() {
        let nodes = clique_of(&[("orders", "o_custkey"), ("ghost", "g_custkey")]);
        let edges = vec![(nodes[0].clone(), nodes[1].clone())];
        let rels = vec!["orders".to_string()];
        // Restriction leaves a singleton, which is not a joinable clique.
        assert!(close_cliques(&nodes, &edges, &rels).is_empty());
    }

    #[test]
    fn test_disjoint_edges_stay_separate() {
        let nodes = clique_of(&[
            ("customer", "c_custkey"),
            ("orders", "o_custkey"),
            ("orders", "o_orderkey"),
            ("lineitem", "l_orderkey"),
        ]);
        let edges = vec![
            (nodes[1].clone(), nodes[0].clone()),
            (nodes[3].clone(), nodes[2].clone()),
        ];
        let rels: Vec<String> = ["customer", "orders", "lineitem"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let cliques = close_cliques(&nodes, &edges, &rels);
        assert_eq!(cliques.len(), 2);
        assert!(cliques.iter().all(|c| c.len() == 2));
    }
}
