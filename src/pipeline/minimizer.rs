//! Witness-row minimization.
//!
//! Reduces each active relation to the smallest row set that keeps the
//! hidden query non-empty. Two phases:
//!
//! 1. *Attribute pinning* — for each relation, compute the value-frequency
//!    distribution over the not-yet-pinned attributes and, most frequent
//!    value first, try deleting every row that disagrees with it. A probe
//!    that keeps the oracle non-empty commits and pins the attribute;
//!    otherwise it rolls back. Repeats until a full pass over all relations
//!    produces no reduction.
//! 2. *Row deletion* — attempt to delete every remaining row in its own
//!    transaction, keeping only rows whose removal empties the oracle.
//!
//! Commits here are permanent for the rest of the run; the backup copies
//! restore the original contents at teardown.

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::context::ExtractionContext;
use crate::db::{self, Session};
use crate::error::UnveilError;
use crate::values::SqlValue;

pub fn run(ctx: &mut ExtractionContext, session: &mut Session) -> Result<(), UnveilError> {
    let core_relations = ctx.core_relations()?.to_vec();
    let hidden = ctx.hidden_query.clone();

    let mut pinned: BTreeMap<String, Vec<String>> = core_relations
        .iter()
        .map(|t| (t.clone(), Vec::new()))
        .collect();

    // Phase 1: attribute pinning until quiescence.
    loop {
        let mut reduced_any = false;
        for table in &core_relations {
            debug!(relation = %table, "pinning pass");
            let candidates =
                frequency_sorted_values(ctx, session, table, &pinned[table])?;

            for (attribute, value, _freq) in candidates {
                debug!(relation = %table, attribute = %attribute, value = %value.literal(), "trying pin");
                let mut tx = session.client().transaction()?;
                db::run(
                    &mut tx,
                    &format!(
                        "DELETE FROM {table} WHERE {attribute} != {};",
                        value.literal()
                    ),
                )?;
                if db::result_is_empty(&mut tx, &hidden)? {
                    tx.rollback()?;
                    continue;
                }
                tx.commit()?;
                pinned.entry(table.clone()).or_default().push(attribute);
                reduced_any = true;
                break;
            }
        }
        if !reduced_any {
            break;
        }
    }

    // Phase 2: per-row deletion.
    for table in &core_relations {
        let ctids: Vec<String> = db::rows(
            session.client(),
            &format!("SELECT ctid::text FROM {table};"),
        )?
        .iter()
        .map(|r| r.get::<_, String>(0))
        .collect();

        for ctid in ctids {
            let mut tx = session.client().transaction()?;
            db::run(&mut tx, &format!("DELETE FROM {table} WHERE ctid = '{ctid}';"))?;
            if db::result_is_empty(&mut tx, &hidden)? {
                tx.rollback()?;
            } else {
                tx.commit()?;
            }
        }
        let remaining =
            db::scalar_i64(session.client(), &format!("SELECT COUNT(*) FROM {table};"))?;
        debug!(relation = %table, rows = remaining, "relation minimized");
    }

    info!("minimization complete");
    ctx.set_minimizer(pinned);
    Ok(())
}

/// All `(attribute, value, frequency)` triples of a relation's unpinned
/// attributes, most frequent first. Frequency ties keep attribute order,
/// so iteration stays deterministic.
fn frequency_sorted_values(
    ctx: &ExtractionContext,
    session: &mut Session,
    table: &str,
    pinned: &[String],
) -> Result<Vec<(String, SqlValue, i64)>, UnveilError> {
    let mut entries: Vec<(String, SqlValue, i64)> = Vec::new();
    for attribute in ctx.attributes(table)? {
        if pinned.contains(attribute) {
            continue;
        }
        let rows = db::rows(
            session.client(),
            &format!("SELECT {attribute}, COUNT(*) FROM {table} GROUP BY {attribute};"),
        )?;
        for row in &rows {
            let value = db::value_at(row, 0)?;
            if value.is_null() {
                continue;
            }
            let freq: i64 = row.get(1);
            entries.push((attribute.clone(), value, freq));
        }
    }
    entries.sort_by(|a, b| b.2.cmp(&a.2));
    Ok(entries)
}
