//! Aggregation identification.
//!
//! For each projection slot with a numeric dependency `(R, A)`, the
//! extractor materializes a two-row instance of `R`: α copies of a row with
//! `A = s1` and one row with `A = s2`, where `s1, s2` straddle any known
//! bounds. Reading the join-only subquery for each row alone gives `o1` and
//! `o2`; the full query's output `p` is then matched against the five
//! candidate values
//!
//! ```text
//! SUM = α·o1 + o2    AVG = (α·o1 + o2)/(α+1)    MIN = min(o1, o2)
//! MAX = max(o1, o2)  COUNT = α+1
//! ```
//!
//! α must avoid the *forbidden set* where two candidates collapse; starting
//! at 3, a forbidden α escalates as `α ← 2α+1` under a safety cap.
//!
//! SUM-carrying HAVING attributes on other relations are rebalanced to
//! `value/(α+1)` so the replicated instance still satisfies its group
//! constraints. Slots whose expression is the COUNT sentinel (empty string)
//! get a dedicated replication probe instead.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::{Aggregate, AttrRef, CompareOp, ExtractionContext, HavingAggregate};
use crate::db::{self, Session};
use crate::error::UnveilError;
use crate::values::{AttrType, SqlValue};

pub fn run(
    ctx: &mut ExtractionContext,
    session: &mut Session,
    cfg: &Config,
) -> Result<(), UnveilError> {
    let slots = ctx.projections()?.to_vec();
    let hidden = ctx.hidden_query.clone();

    let mut aggregations: Vec<Option<Aggregate>> = Vec::with_capacity(slots.len());
    for (idx, slot) in slots.iter().enumerate() {
        // A slot named after its single dependency is the column itself,
        // typically a grouping attribute.
        if slot.dependencies.len() == 1 && slot.dependencies[0].1 == slot.name {
            debug!(column = %slot.name, "verbatim column, no aggregation");
            aggregations.push(None);
            continue;
        }

        // COUNT sentinel: no dependency, witness value 1.
        if slot.expression.is_empty() && slot.dependencies.is_empty() {
            let found = probe_count(ctx, session, &hidden, idx)?;
            debug!(column = %slot.name, count = found.is_some(), "sentinel slot probed");
            aggregations.push(found);
            continue;
        }

        let mut found: Option<Aggregate> = None;
        for dep in &slot.dependencies {
            let ty = ctx.attr_type(&dep.0, &dep.1)?;
            if !matches!(ty, AttrType::Integer | AttrType::Numeric) {
                // Dates and strings carry no aggregation here.
                break;
            }

            let (has_sum, lower, upper) = bound_info(ctx, dep);
            if lower.is_none() && upper.is_none() {
                found =
                    fingerprint(ctx, session, cfg, &hidden, idx, dep, SqlValue::Int(1), SqlValue::Int(100))?;
                break;
            }
            if has_sum {
                // The dependency itself carries a SUM constraint; the
                // straddling instance cannot satisfy it.
                warn!(
                    relation = %dep.0, attribute = %dep.1,
                    "SUM-constrained dependency, skipping aggregation probe"
                );
                continue;
            }
            let s1 = match &lower {
                Some(l) => l.clone(),
                None => ty.step(upper.as_ref().expect("at least one bound"), -100)?,
            };
            let s2 = match &upper {
                Some(u) => u.clone(),
                None => ty.step(lower.as_ref().expect("at least one bound"), 100)?,
            };
            found = fingerprint(ctx, session, cfg, &hidden, idx, dep, s1, s2)?;
            break;
        }

        if let Some(agg) = found {
            info!(column = %slot.name, aggregation = agg.as_sql(), "aggregation identified");
        } else {
            debug!(column = %slot.name, "no aggregation identified");
        }
        aggregations.push(found);
    }

    ctx.set_aggregation_extractor(aggregations);
    Ok(())
}

/// SUM-carrying HAVING attributes of a relation, with their bound values.
pub(crate) fn sum_having_attributes(
    ctx: &ExtractionContext,
    relation: &str,
) -> Vec<(String, Decimal)> {
    let mut out: Vec<(String, Decimal)> = Vec::new();
    for h in &ctx.having_predicates {
        if h.relation != relation {
            continue;
        }
        if h.aggregate != HavingAggregate::Known(Aggregate::Sum) {
            continue;
        }
        if out.iter().any(|(a, _)| *a == h.attribute) {
            continue;
        }
        if let Some(value) = h.value.as_decimal() {
            out.push((h.attribute.clone(), value));
        }
    }
    out
}

/// Bounds and SUM involvement of an attribute across both predicate lists.
fn bound_info(
    ctx: &ExtractionContext,
    dep: &AttrRef,
) -> (bool, Option<SqlValue>, Option<SqlValue>) {
    let mut lower = None;
    let mut upper = None;
    let mut has_sum = false;
    for f in &ctx.filter_predicates {
        if f.relation == dep.0 && f.attribute == dep.1 {
            match f.op {
                CompareOp::Le => upper = Some(f.value.clone()),
                CompareOp::Ge => lower = Some(f.value.clone()),
                CompareOp::Eq => {}
            }
        }
    }
    for h in &ctx.having_predicates {
        if h.relation == dep.0 && h.attribute == dep.1 {
            match h.op {
                CompareOp::Le => upper = Some(h.value.clone()),
                CompareOp::Ge => lower = Some(h.value.clone()),
                CompareOp::Eq => {}
            }
            if h.aggregate == HavingAggregate::Known(Aggregate::Sum) {
                has_sum = true;
            }
        }
    }
    (has_sum, lower, upper)
}

/// The join-only subquery: recovered projections over the core relations
/// and join equalities, with one relation's FROM entry swapped for a probe
/// table (`{relation}_{suffix}`). No GROUP BY, no HAVING.
fn join_only_query(
    ctx: &ExtractionContext,
    swap: (&str, &str),
) -> Result<String, UnveilError> {
    let (swapped_table, suffix) = swap;
    let relations = ctx
        .core_relations()?
        .iter()
        .map(|r| {
            if r == swapped_table {
                format!("{r}_{suffix}")
            } else {
                r.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    let projections = ctx
        .projections()?
        .iter()
        .map(|slot| {
            if slot.expression.is_empty() {
                "1".to_string()
            } else {
                slot.expression.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(", ");

    let mut predicates = Vec::new();
    for edge in ctx.join_graph()? {
        let renamed: Vec<AttrRef> = edge
            .iter()
            .map(|(t, a)| {
                if t == swapped_table {
                    (format!("{t}_{suffix}"), a.clone())
                } else {
                    (t.clone(), a.clone())
                }
            })
            .collect();
        for pair in renamed.windows(2) {
            predicates.push(format!(
                "{}.{} = {}.{}",
                pair[0].0, pair[0].1, pair[1].0, pair[1].1
            ));
        }
    }

    let mut query = format!("SELECT {projections} FROM {relations}");
    if !predicates.is_empty() {
        query.push_str(&format!(" WHERE {}", predicates.join(" AND ")));
    }
    query.push(';');
    Ok(query)
}

enum ProbeOutcome {
    /// The replicated instance produced more (or fewer) than one output
    /// row: the slot carries no aggregation.
    NoAggregation,
    /// `(o1, o2, observed)` for the fingerprint match.
    Values(Decimal, Decimal, Decimal),
}

/// One α-replication probe plus the forbidden-set escalation loop.
#[allow(clippy::too_many_arguments)]
fn fingerprint(
    ctx: &ExtractionContext,
    session: &mut Session,
    cfg: &Config,
    hidden: &str,
    idx: usize,
    dep: &AttrRef,
    s1: SqlValue,
    s2: SqlValue,
) -> Result<Option<Aggregate>, UnveilError> {
    let core_relations = ctx.core_relations()?.to_vec();
    let (table, attribute) = (dep.0.clone(), dep.1.clone());
    let q1 = join_only_query(ctx, (&table, "t1"))?;
    let q2 = join_only_query(ctx, (&table, "t2"))?;
    let own_sums = sum_having_attributes(ctx, &table);

    let mut alpha: i64 = 3;
    for _ in 0..cfg.extraction.forbidden_alpha_cap {
        debug!(alpha, relation = %table, attribute = %attribute, "replication probe");
        let outcome = db::probe(session.client(), |tx| {
            // Rebalance SUM constraints on the other relations so the
            // replicated join still satisfies them.
            for other in core_relations.iter().filter(|r| **r != table) {
                for (sum_attr, sum_value) in sum_having_attributes(ctx, other) {
                    db::run(
                        tx,
                        &format!("ALTER TABLE {other} ALTER COLUMN {sum_attr} TYPE numeric;"),
                    )?;
                    let balanced = sum_value / Decimal::from(alpha + 1);
                    db::run(
                        tx,
                        &format!("UPDATE {other} SET {sum_attr} = {balanced};"),
                    )?;
                }
            }

            db::run(tx, &format!("CREATE TABLE {table}_t1 (LIKE {table});"))?;
            db::run(tx, &format!("CREATE TABLE {table}_t2 (LIKE {table});"))?;
            db::run(
                tx,
                &format!("INSERT INTO {table}_t1 (SELECT * FROM {table} LIMIT 1);"),
            )?;
            db::run(
                tx,
                &format!("INSERT INTO {table}_t2 (SELECT * FROM {table} LIMIT 1);"),
            )?;

            // t1: the replicated row. Its own SUM attributes take -1 so α
            // copies plus t2 total the original bound value.
            db::run(
                tx,
                &format!("UPDATE {table}_t1 SET {attribute} = {};", s1.literal()),
            )?;
            for (sum_attr, _) in &own_sums {
                db::run(tx, &format!("UPDATE {table}_t1 SET {sum_attr} = -1;"))?;
            }
            let o1 = match db::first_row(tx, &q1)? {
                Some(row) => db::value_at(&row, idx)?.as_decimal(),
                None => None,
            };

            // t2: the balancing row.
            db::run(
                tx,
                &format!("UPDATE {table}_t2 SET {attribute} = {};", s2.literal()),
            )?;
            for (sum_attr, sum_value) in &own_sums {
                let balanced = *sum_value + Decimal::from(alpha);
                db::run(
                    tx,
                    &format!("UPDATE {table}_t2 SET {sum_attr} = {balanced};"),
                )?;
            }
            let o2 = match db::first_row(tx, &q2)? {
                Some(row) => db::value_at(&row, idx)?.as_decimal(),
                None => None,
            };

            let (Some(o1), Some(o2)) = (o1, o2) else {
                return Ok(ProbeOutcome::NoAggregation);
            };

            db::run(tx, &format!("DELETE FROM {table};"))?;
            for _ in 0..alpha {
                db::run(
                    tx,
                    &format!("INSERT INTO {table} (SELECT * FROM {table}_t1 LIMIT 1);"),
                )?;
            }
            db::run(
                tx,
                &format!("INSERT INTO {table} (SELECT * FROM {table}_t2 LIMIT 1);"),
            )?;

            let result = db::rows(tx, hidden)?;
            if result.len() != 1 {
                return Ok(ProbeOutcome::NoAggregation);
            }
            match db::value_at(&result[0], idx)?.as_decimal() {
                Some(observed) => Ok(ProbeOutcome::Values(o1, o2, observed)),
                None => Ok(ProbeOutcome::NoAggregation),
            }
        })?;

        match outcome {
            ProbeOutcome::NoAggregation => return Ok(None),
            ProbeOutcome::Values(o1, o2, observed) => {
                let o1_f = o1.to_f64().unwrap_or(0.0);
                let o2_f = o2.to_f64().unwrap_or(0.0);
                if is_forbidden(alpha, o1_f, o2_f) {
                    debug!(alpha, "forbidden replication factor, escalating");
                    alpha = 2 * alpha + 1;
                    continue;
                }
                debug!(%o1, %o2, %observed, alpha, "fingerprint values");
                return Ok(identify(alpha, o1, o2, observed));
            }
        }
    }

    warn!(
        relation = %table, attribute = %attribute,
        "forbidden-set escalation exhausted; recording no aggregation"
    );
    Ok(None)
}

/// Replication counts at which two or more aggregate candidates collapse.
fn forbidden_alphas(o1: f64, o2: f64) -> Vec<f64> {
    let mut out = vec![0.0, o1, o2, o1 - 1.0, o2 - 1.0];
    if o1 != 0.0 {
        out.push((o1 - o2) / o1);
    }
    if o1 != 1.0 {
        out.push((1.0 - o2) / (o1 - 1.0));
    }
    let discriminant = (o1 - 2.0).powi(2) - 4.0 * (1.0 - o2);
    if discriminant >= 0.0 {
        out.push(((o1 - 2.0) + discriminant.sqrt()) / 2.0);
        out.push(((o1 - 2.0) - discriminant.sqrt()) / 2.0);
    }
    out
}

fn is_forbidden(alpha: i64, o1: f64, o2: f64) -> bool {
    forbidden_alphas(o1, o2)
        .iter()
        .any(|f| (alpha as f64 - f).abs() < 1e-6)
}

/// Match the observed output against the five candidate values.
fn identify(alpha: i64, o1: Decimal, o2: Decimal, observed: Decimal) -> Option<Aggregate> {
    let a = Decimal::from(alpha);
    let p = observed.round_dp(2);

    if p == (a * o1 + o2).round_dp(2) {
        return Some(Aggregate::Sum);
    }
    if p == ((a * o1 + o2) / (a + Decimal::ONE)).round_dp(2) {
        return Some(Aggregate::Avg);
    }
    if p == o1.min(o2).round_dp(2) {
        return Some(Aggregate::Min);
    }
    if p == o1.max(o2).round_dp(2) {
        return Some(Aggregate::Max);
    }
    if p == Decimal::from(alpha + 1) {
        return Some(Aggregate::Count);
    }
    None
}

/// COUNT probe for sentinel slots: replicate the witness rows of the first
/// core relation and check whether the slot reports `α+1`.
fn probe_count(
    ctx: &ExtractionContext,
    session: &mut Session,
    hidden: &str,
    idx: usize,
) -> Result<Option<Aggregate>, UnveilError> {
    let core_relations = ctx.core_relations()?;
    let Some(table) = core_relations.first().cloned() else {
        return Ok(None);
    };
    let alpha: i64 = 3;

    db::probe(session.client(), |tx| {
        db::run(
            tx,
            &format!("CREATE TABLE {table}_tmp AS SELECT * FROM {table};"),
        )?;
        for _ in 0..alpha {
            db::run(tx, &format!("INSERT INTO {table} SELECT * FROM {table}_tmp;"))?;
        }
        db::run(tx, &format!("DROP TABLE {table}_tmp;"))?;

        let result = db::rows(tx, hidden)?;
        if result.len() != 1 {
            return Ok(None);
        }
        let observed = db::value_at(&result[0], idx)?.as_decimal();
        Ok((observed == Some(Decimal::from(alpha + 1))).then_some(Aggregate::Count))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_each_aggregate() {
        let o1 = Decimal::from(7);
        let o2 = Decimal::from(20);
        let alpha = 3;
        // SUM = 3*7 + 20 = 41
        assert_eq!(
            identify(alpha, o1, o2, Decimal::from(41)),
            Some(Aggregate::Sum)
        );
        // AVG = 41/4 = 10.25
        assert_eq!(
            identify(alpha, o1, o2, Decimal::new(1025, 2)),
            Some(Aggregate::Avg)
        );
        assert_eq!(
            identify(alpha, o1, o2, Decimal::from(7)),
            Some(Aggregate::Min)
        );
        assert_eq!(
            identify(alpha, o1, o2, Decimal::from(20)),
            Some(Aggregate::Max)
        );
        assert_eq!(
            identify(alpha, o1, o2, Decimal::from(4)),
            Some(Aggregate::Count)
        );
        assert_eq!(identify(alpha, o1, o2, Decimal::from(999)), None);
    }

    #[test]
    fn test_forbidden_set_contains_collapsing_alphas() {
        // α = o1 makes COUNT and ... collide; the set must contain it.
        assert!(is_forbidden(7, 7.0, 20.0));
        assert!(is_forbidden(19, 7.0, 20.0)); // o2 - 1
        assert!(!is_forbidden(3, 7.0, 20.0));
    }

    #[test]
    fn test_forbidden_set_quadratic_roots() {
        // Roots of α² - (o1-2)·α + (1-o2) = 0 for o1=4, o2=1: α ∈ {0, 2}.
        assert!(is_forbidden(2, 4.0, 1.0));
        let set = forbidden_alphas(4.0, 1.0);
        assert!(set.iter().any(|f| (f - 2.0).abs() < 1e-9));
        assert!(set.iter().any(|f| f.abs() < 1e-9));
    }

    #[test]
    fn test_forbidden_set_guards_degenerate_denominators() {
        // o1 = 0 and o1 = 1 must not divide by zero.
        let set = forbidden_alphas(0.0, 5.0);
        assert!(set.iter().all(|f| f.is_finite()));
        let set = forbidden_alphas(1.0, 5.0);
        assert!(set.iter().all(|f| f.is_finite()));
    }
}
