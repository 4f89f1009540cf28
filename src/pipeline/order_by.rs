//! Best-effort ORDER BY recovery.
//!
//! The witness instance yields one output row, which carries no ordering
//! information. This stage synthesizes a multi-row result by cloning the
//! witness rows with a *driver* attribute nudged to fresh values — a
//! grouping attribute when one exists, otherwise a projected single-
//! dependency attribute — then inspects how each output column is ordered
//! across the observed rows. Columns that are consistently ordered emit
//! `name asc`/`name desc` entries, in projection order, stopping at the
//! first column with no consistent order.
//!
//! Recovery is best-effort by design: any failure, tie, or single-row
//! outcome degrades to "no ORDER BY" with a warning, never an error.

use std::cmp::Ordering;

use tracing::{debug, info, warn};

use crate::context::{AttrRef, ExtractionContext};
use crate::db::{self, Session};
use crate::error::UnveilError;
use crate::values::SqlValue;

pub fn run(ctx: &mut ExtractionContext, session: &mut Session) -> Result<(), UnveilError> {
    match recover(ctx, session) {
        Ok(Some(orderby)) => {
            info!(orderby = %orderby, "order-by recovered");
            ctx.has_orderby = true;
            ctx.orderby_string = orderby;
        }
        Ok(None) => {
            debug!("no order-by observed");
            ctx.has_orderby = false;
        }
        Err(e) if e.is_recoverable() => {
            warn!(error = %e, "order-by recovery degraded");
            ctx.has_orderby = false;
        }
        Err(e) => {
            // Ordering is a bonus; even hard probe errors only cost it.
            warn!(error = %e, "order-by recovery failed");
            ctx.has_orderby = false;
        }
    }
    Ok(())
}

fn recover(
    ctx: &ExtractionContext,
    session: &mut Session,
) -> Result<Option<String>, UnveilError> {
    let Some(driver) = pick_driver(ctx)? else {
        return Ok(None);
    };
    let (table, attribute) = &driver;
    let ty = ctx.attr_type(table, attribute)?;

    let Some(row) = db::first_row(
        session.client(),
        &format!("SELECT {attribute} FROM {table};"),
    )?
    else {
        return Ok(None);
    };
    let seed = db::value_at(&row, 0)?;
    if seed.is_null() {
        return Ok(None);
    }

    let mut targets: Vec<AttrRef> = vec![driver.clone()];
    targets.extend(ctx.join_partners(table, attribute));

    // Three distinct driver values give two comparisons per column.
    let hidden = ctx.hidden_query.clone();
    let observed = db::probe(session.client(), |tx| {
        for delta in [1i64, 2] {
            let value = ty.step(&seed, delta)?;
            for (t, a) in &targets {
                clone_rows_with(tx, t, a, &value)?;
            }
        }
        db::grid(tx, &hidden)
    })?;

    if observed.len() < 2 {
        return Ok(None);
    }

    let slots = ctx.projections()?;
    let mut parts = Vec::new();
    for (idx, slot) in slots.iter().enumerate() {
        let column: Vec<&SqlValue> = observed.iter().filter_map(|r| r.get(idx)).collect();
        match column_direction(&column) {
            Some(ColumnOrder::Ascending) => parts.push(format!("{} asc", slot.name)),
            Some(ColumnOrder::Descending) => parts.push(format!("{} desc", slot.name)),
            Some(ColumnOrder::Tied) => continue,
            None => break,
        }
    }

    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parts.join(", ")))
    }
}

/// The attribute whose mutation multiplies the output rows: the first
/// grouping attribute, or for SPJ queries the first projected
/// single-dependency attribute outside any equality predicate.
fn pick_driver(ctx: &ExtractionContext) -> Result<Option<AttrRef>, UnveilError> {
    let group_by = ctx.group_by()?;
    if let Some(first) = group_by.first() {
        return Ok(Some(first.clone()));
    }
    for slot in ctx.projections()? {
        if slot.dependencies.len() == 1 {
            return Ok(Some(slot.dependencies[0].clone()));
        }
    }
    Ok(None)
}

fn clone_rows_with(
    tx: &mut postgres::Transaction<'_>,
    table: &str,
    attribute: &str,
    value: &SqlValue,
) -> Result<(), UnveilError> {
    db::run(
        tx,
        &format!("CREATE TABLE {table}_ob AS SELECT * FROM {table} LIMIT 1;"),
    )?;
    db::run(
        tx,
        &format!("UPDATE {table}_ob SET {attribute} = {};", value.literal()),
    )?;
    db::run(tx, &format!("INSERT INTO {table} SELECT * FROM {table}_ob;"))?;
    db::run(tx, &format!("DROP TABLE {table}_ob;"))?;
    Ok(())
}

enum ColumnOrder {
    Ascending,
    Descending,
    /// All observed values equal; the column says nothing about ordering.
    Tied,
}

/// Direction of a column across observed rows; `None` when inconsistent.
fn column_direction(column: &[&SqlValue]) -> Option<ColumnOrder> {
    let mut non_increasing = true;
    let mut non_decreasing = true;
    let mut all_equal = true;
    for pair in column.windows(2) {
        match pair[0].compare(pair[1]) {
            Some(Ordering::Less) => {
                non_increasing = false;
                all_equal = false;
            }
            Some(Ordering::Greater) => {
                non_decreasing = false;
                all_equal = false;
            }
            Some(Ordering::Equal) => {}
            None => return None,
        }
    }
    if all_equal {
        Some(ColumnOrder::Tied)
    } else if non_decreasing {
        Some(ColumnOrder::Ascending)
    } else if non_increasing {
        Some(ColumnOrder::Descending)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(vals: &[i64]) -> Vec<SqlValue> {
        vals.iter().map(|&v| SqlValue::Int(v)).collect()
    }

    #[test]
    fn test_column_direction() {
        let col = ints(&[1, 2, 3]);
        let refs: Vec<&SqlValue> = col.iter().collect();
        assert!(matches!(
            column_direction(&refs),
            Some(ColumnOrder::Ascending)
        ));

        let col = ints(&[9, 5, 5]);
        let refs: Vec<&SqlValue> = col.iter().collect();
        assert!(matches!(
            column_direction(&refs),
            Some(ColumnOrder::Descending)
        ));

        let col = ints(&[4, 4, 4]);
        let refs: Vec<&SqlValue> = col.iter().collect();
        assert!(matches!(column_direction(&refs), Some(ColumnOrder::Tied)));

        let col = ints(&[1, 3, 2]);
        let refs: Vec<&SqlValue> = col.iter().collect();
        assert!(column_direction(&refs).is_none());
    }

    #[test]
    fn test_mixed_domains_are_unordered() {
        let a = SqlValue::Int(1);
        let b = SqlValue::Text("x".into());
        assert!(column_direction(&[&a, &b]).is_none());
    }
}
