//! Equi-join graph recovery.
//!
//! Declared key cliques over-approximate the joins the hidden query
//! actually performs. For each clique, every nontrivial bipartition
//! `(L, R)` is probed by assigning one constant to all attributes in `L`
//! and a different constant to all attributes in `R` (type-appropriate
//! pair). If the oracle goes empty for every partition, the equality is
//! load-bearing and the clique survives whole; if some partition leaves
//! the oracle non-empty, the equality does not couple the two sides and
//! the halves are re-examined independently.

use tracing::{debug, info};

use crate::context::{AttrRef, ExtractionContext};
use crate::db::{self, Session};
use crate::error::UnveilError;
use crate::values::SqlValue;

pub fn run(ctx: &mut ExtractionContext, session: &mut Session) -> Result<(), UnveilError> {
    let core_relations = ctx.core_relations()?.to_vec();
    let hidden = ctx.hidden_query.clone();

    let mut worklist: Vec<Vec<AttrRef>> = ctx.key_cliques()?.to_vec();
    let mut join_graph: Vec<Vec<AttrRef>> = Vec::new();

    while let Some(clique) = worklist.pop() {
        // Only attributes of relations the query actually reads matter.
        let clique: Vec<AttrRef> = clique
            .into_iter()
            .filter(|(table, _)| core_relations.contains(table))
            .collect();
        if clique.len() <= 1 {
            continue;
        }
        debug!(clique = ?clique, "probing clique");

        let ty = ctx.attr_type(&clique[0].0, &clique[0].1)?;
        let (v1, v2) = ty.dummy_pair();

        let mut split = false;
        for (left, right) in bipartitions(&clique) {
            let survives = db::probe(session.client(), |tx| {
                assign_constant(tx, &left, &v1)?;
                assign_constant(tx, &right, &v2)?;
                db::result_is_empty(tx, &hidden)
            })?;
            debug!(left = ?left, right = ?right, coupled = survives, "bipartition probe");

            if !survives {
                // The equality across this cut is not part of the query;
                // examine each side on its own.
                worklist.push(left);
                worklist.push(right);
                split = true;
                break;
            }
        }

        if !split {
            join_graph.push(clique);
        }
    }

    join_graph.sort();
    info!(edges = join_graph.len(), "join graph recovered");
    ctx.set_join_extractor(join_graph);
    Ok(())
}

/// Nontrivial bipartitions of a clique. The left side always contains the
/// first member, which enumerates each unordered split exactly once.
fn bipartitions(clique: &[AttrRef]) -> Vec<(Vec<AttrRef>, Vec<AttrRef>)> {
    let n = clique.len();
    let mut result = Vec::new();
    if n < 2 {
        return result;
    }
    let full: u64 = (1 << (n - 1)) - 1;
    for mask in 0..full {
        let mut left = vec![clique[0].clone()];
        let mut right = Vec::new();
        for (i, member) in clique.iter().enumerate().skip(1) {
            if mask & (1 << (i - 1)) != 0 {
                left.push(member.clone());
            } else {
                right.push(member.clone());
            }
        }
        result.push((left, right));
    }
    result
}

fn assign_constant(
    tx: &mut postgres::Transaction<'_>,
    members: &[AttrRef],
    value: &SqlValue,
) -> Result<(), UnveilError> {
    for (table, attribute) in members {
        db::run(
            tx,
            &format!("UPDATE {table} SET {attribute} = {};", value.literal()),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(raw: &[(&str, &str)]) -> Vec<AttrRef> {
        raw.iter()
            .map(|(t, a)| (t.to_string(), a.to_string()))
            .collect()
    }

    #[test]
    fn test_bipartition_count() {
        // A clique of n members has 2^(n-1) - 1 nontrivial bipartitions.
        let clique = attrs(&[("a", "x"), ("b", "y"), ("c", "z")]);
        assert_eq!(bipartitions(&clique).len(), 3);

        let clique4 = attrs(&[("a", "x"), ("b", "y"), ("c", "z"), ("d", "w")]);
        assert_eq!(bipartitions(&clique4).len(), 7);
    }

    #[test]
    fn test_bipartitions_are_proper() {
        let clique = attrs(&[("a", "x"), ("b", "y"), ("c", "z")]);
        for (left, right) in bipartitions(&clique) {
            assert!(!left.is_empty());
            assert!(!right.is_empty());
            assert_eq!(left.len() + right.len(), clique.len());
            // The first member anchors the left side.
            assert_eq!(left[0], clique[0]);
        }
    }

    #[test]
    fn test_pair_has_single_partition() {
        let clique = attrs(&[("a", "x"), ("b", "y")]);
        let parts = bipartitions(&clique);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0, attrs(&[("a", "x")]));
        assert_eq!(parts[0].1, attrs(&[("b", "y")]));
    }
}
