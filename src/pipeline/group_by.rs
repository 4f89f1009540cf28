//! Grouping-attribute detection.
//!
//! After minimization every active relation holds its witness row(s). For
//! each pinned attribute, clone the relation's rows with the attribute
//! nudged by ±1 (type-aware) and append the clones; when the attribute is
//! joined, the same nudge propagates across its join edge so the clones
//! still join. If the oracle then returns exactly two rows — one per
//! distinct value — the attribute partitions groups, i.e. it appears in
//! GROUP BY. Every attribute joined to a detected one is skipped, since
//! the edge's members are interchangeable.

use tracing::{debug, info};

use crate::context::{AttrRef, ExtractionContext};
use crate::db::{self, Session};
use crate::error::UnveilError;
use crate::values::SqlValue;

pub fn run(ctx: &mut ExtractionContext, session: &mut Session) -> Result<(), UnveilError> {
    let core_relations = ctx.core_relations()?.to_vec();
    let hidden = ctx.hidden_query.clone();

    let mut group_by: Vec<AttrRef> = Vec::new();
    let mut skip: Vec<AttrRef> = Vec::new();

    for table in &core_relations {
        let candidates = ctx.pinned_attributes(table)?.to_vec();
        for attribute in candidates {
            if skip.iter().any(|(t, a)| t == table && *a == attribute) {
                continue;
            }

            let ty = ctx.attr_type(table, &attribute)?;
            let row = db::first_row(
                session.client(),
                &format!("SELECT DISTINCT({attribute}) FROM {table};"),
            )?
            .ok_or_else(|| {
                UnveilError::Internal(format!("witness relation {table} is empty"))
            })?;
            let value = db::value_at(&row, 0)?;
            if value.is_null() {
                continue;
            }

            let plus = ty.step(&value, 1)?;
            let minus = ty.step(&value, -1)?;
            debug!(
                relation = %table, attribute = %attribute,
                value = %value.literal(), "group-by probe"
            );

            let is_grouping = splits_into_two_groups(ctx, session, &hidden, table, &attribute, &plus)?
                || splits_into_two_groups(ctx, session, &hidden, table, &attribute, &minus)?;

            if is_grouping {
                group_by.push((table.clone(), attribute.clone()));
                let mut edge_members = ctx.join_partners(table, &attribute);
                edge_members.push((table.clone(), attribute.clone()));
                skip.extend(edge_members);
            }
        }
    }

    info!(group_by = ?group_by, "grouping attributes identified");
    ctx.set_groupby_extractor(group_by);
    Ok(())
}

/// Clone the witness rows with `attribute = value` (propagating across the
/// join edge) and check whether the oracle now reports two groups.
fn splits_into_two_groups(
    ctx: &ExtractionContext,
    session: &mut Session,
    hidden: &str,
    table: &str,
    attribute: &str,
    value: &SqlValue,
) -> Result<bool, UnveilError> {
    let mut targets: Vec<AttrRef> = vec![(table.to_string(), attribute.to_string())];
    targets.extend(ctx.join_partners(table, attribute));

    db::probe(session.client(), |tx| {
        for (t, a) in &targets {
            append_cloned_rows(tx, t, a, value)?;
        }
        let rows = db::rows(tx, hidden)?;
        Ok(rows.len() == 2)
    })
}

/// Duplicate every row of `table` with `attribute` rewritten to `value`.
fn append_cloned_rows(
    tx: &mut postgres::Transaction<'_>,
    table: &str,
    attribute: &str,
    value: &SqlValue,
) -> Result<(), UnveilError> {
    db::run(tx, &format!("CREATE TABLE {table}_tmp AS SELECT * FROM {table};"))?;
    db::run(
        tx,
        &format!("UPDATE {table}_tmp SET {attribute} = {};", value.literal()),
    )?;
    db::run(tx, &format!("INSERT INTO {table} SELECT * FROM {table}_tmp;"))?;
    db::run(tx, &format!("DROP TABLE {table}_tmp;"))?;
    Ok(())
}
