//! MIN/MAX-versus-filter disambiguation.
//!
//! The predicate extractor cannot tell `MIN(a) <= b` from `a <= b` (nor
//! `MAX(a) >= b` from `a >= b`): on a one-row group both behave
//! identically. This stage resolves each recorded ambiguity with a two-row
//! instance at the bound — one row exactly at `b`, one just past it — and
//! compares the join-only subquery (joins + GROUP BY, no HAVING) against
//! the full hidden query. Agreement means the out-of-bound row was dropped
//! row-wise: a plain filter. Disagreement means the aggregate saw both
//! rows: genuinely MIN (or MAX).
//!
//! As its final act the stage rewrites the context's predicate lists — the
//! one sanctioned post-hoc revision in the pipeline.

use tracing::{debug, info};

use crate::context::{
    Aggregate, CompareOp, ExtractionContext, FilterPredicate, HavingAggregate, HavingPredicate,
    SeparablePredicate,
};
use crate::db::{self, Session};
use crate::error::UnveilError;
use crate::pipeline::aggregates::sum_having_attributes;
use crate::values::SqlValue;

pub fn run(ctx: &mut ExtractionContext, session: &mut Session) -> Result<(), UnveilError> {
    ctx.predicates_done()?;
    let separable = ctx.separable_predicates.clone();
    debug!(count = separable.len(), "predicates to separate");

    let hidden = ctx.hidden_query.clone();
    let subquery = grouped_join_query(ctx)?;

    let mut filters = ctx.filter_predicates.clone();
    let mut having = ctx.having_predicates.clone();

    for sp in &separable {
        match sp.kind {
            HavingAggregate::MinOrFilter => {
                let Some(upper) = sp.upper.clone() else {
                    continue;
                };
                let ty = ctx.attr_type(&sp.relation, &sp.attribute)?;
                let past = ty.step(&upper, 1)?;
                let agrees =
                    probe_agreement(ctx, session, &hidden, &subquery, sp, &upper, &past)?;
                if agrees {
                    debug!(
                        relation = %sp.relation, attribute = %sp.attribute,
                        "bound is a plain filter"
                    );
                    resolve_as_filter(&mut filters, &mut having, sp, CompareOp::Le, upper);
                } else {
                    debug!(
                        relation = %sp.relation, attribute = %sp.attribute,
                        "bound is HAVING MIN"
                    );
                    resolve_as_having(&mut having, sp, Aggregate::Min);
                }
            }
            HavingAggregate::MaxOrFilter => {
                let Some(lower) = sp.lower.clone() else {
                    continue;
                };
                let ty = ctx.attr_type(&sp.relation, &sp.attribute)?;
                let past = ty.step(&lower, -1)?;
                let agrees =
                    probe_agreement(ctx, session, &hidden, &subquery, sp, &lower, &past)?;
                if agrees {
                    debug!(
                        relation = %sp.relation, attribute = %sp.attribute,
                        "bound is a plain filter"
                    );
                    resolve_as_filter(&mut filters, &mut having, sp, CompareOp::Ge, lower);
                } else {
                    debug!(
                        relation = %sp.relation, attribute = %sp.attribute,
                        "bound is HAVING MAX"
                    );
                    resolve_as_having(&mut having, sp, Aggregate::Max);
                }
            }
            HavingAggregate::Known(_) => continue,
        }
    }

    info!(
        filters = filters.len(),
        having = having.len(),
        "predicate separation done"
    );
    ctx.set_predicate_separator(filters, having);
    Ok(())
}

/// The join-only subquery of the separator: recovered projections with
/// their aggregations, join equalities, GROUP BY — but no HAVING.
fn grouped_join_query(ctx: &ExtractionContext) -> Result<String, UnveilError> {
    let relations = ctx.core_relations()?.join(", ");
    let projections = ctx
        .projections()?
        .iter()
        .zip(ctx.aggregations()?.iter())
        .map(|(slot, agg)| match agg {
            Some(Aggregate::Count) if slot.expression.is_empty() => "COUNT(*)".to_string(),
            Some(agg) => format!("{}({})", agg.as_sql(), slot.expression),
            None => slot.expression.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ");

    let mut predicates = Vec::new();
    for edge in ctx.join_graph()? {
        for pair in edge.windows(2) {
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
    let group_by = ctx.group_by()?;
    if !group_by.is_empty() {
        let list = group_by
            .iter()
            .map(|(t, a)| format!("{t}.{a}"))
            .collect::<Vec<_>>()
            .join(", ");
        query.push_str(&format!(" GROUP BY {list}"));
    }
    query.push(';');
    Ok(query)
}

/// Insert two probe rows at `at_bound` and `past_bound` and compare the
/// no-HAVING subquery's first row with the hidden query's. Rollback-
/// terminated.
fn probe_agreement(
    ctx: &ExtractionContext,
    session: &mut Session,
    hidden: &str,
    subquery: &str,
    sp: &SeparablePredicate,
    at_bound: &SqlValue,
    past_bound: &SqlValue,
) -> Result<bool, UnveilError> {
    let table = sp.relation.clone();
    let attribute = sp.attribute.clone();
    let core_relations = ctx.core_relations()?.to_vec();

    db::probe(session.client(), |tx| {
        // Halve SUM-constrained attributes so witness + both probe rows
        // still total their bound.
        for relation in &core_relations {
            for (sum_attr, sum_value) in sum_having_attributes(ctx, relation) {
                db::run(
                    tx,
                    &format!("ALTER TABLE {relation} ALTER COLUMN {sum_attr} TYPE numeric;"),
                )?;
                let halved = sum_value / rust_decimal::Decimal::from(2);
                db::run(
                    tx,
                    &format!("UPDATE {relation} SET {sum_attr} = {halved};"),
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

        db::run(
            tx,
            &format!(
                "UPDATE {table}_t1 SET {attribute} = {};",
                at_bound.literal()
            ),
        )?;
        db::run(tx, &format!("INSERT INTO {table} (SELECT * FROM {table}_t1);"))?;
        let reference = db::grid(tx, subquery)?.into_iter().next();

        db::run(
            tx,
            &format!(
                "UPDATE {table}_t2 SET {attribute} = {};",
                past_bound.literal()
            ),
        )?;
        db::run(tx, &format!("INSERT INTO {table} (SELECT * FROM {table}_t2);"))?;
        let truth = db::grid(tx, hidden)?.into_iter().next();

        Ok(reference == truth)
    })
}

/// Drop the ambiguous HAVING entries and emit the row-level bounds.
fn resolve_as_filter(
    filters: &mut Vec<FilterPredicate>,
    having: &mut Vec<HavingPredicate>,
    sp: &SeparablePredicate,
    op: CompareOp,
    bound: SqlValue,
) {
    having.retain(|h| !(h.relation == sp.relation && h.attribute == sp.attribute));
    filters.push(FilterPredicate {
        relation: sp.relation.clone(),
        attribute: sp.attribute.clone(),
        op,
        value: bound,
    });
    let other = match op {
        CompareOp::Le => sp.lower.clone().map(|v| (CompareOp::Ge, v)),
        _ => sp.upper.clone().map(|v| (CompareOp::Le, v)),
    };
    if let Some((op, value)) = other {
        filters.push(FilterPredicate {
            relation: sp.relation.clone(),
            attribute: sp.attribute.clone(),
            op,
            value,
        });
    }
}

/// Rewrite the ambiguous HAVING entries with the resolved aggregate.
fn resolve_as_having(
    having: &mut Vec<HavingPredicate>,
    sp: &SeparablePredicate,
    aggregate: Aggregate,
) {
    having.retain(|h| !(h.relation == sp.relation && h.attribute == sp.attribute));
    if let Some(upper) = sp.upper.clone() {
        having.push(HavingPredicate {
            relation: sp.relation.clone(),
            attribute: sp.attribute.clone(),
            aggregate: HavingAggregate::Known(aggregate),
            op: CompareOp::Le,
            value: upper,
        });
    }
    if let Some(lower) = sp.lower.clone() {
        having.push(HavingPredicate {
            relation: sp.relation.clone(),
            attribute: sp.attribute.clone(),
            aggregate: HavingAggregate::Known(aggregate),
            op: CompareOp::Ge,
            value: lower,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn separable(lower: Option<i64>, upper: Option<i64>) -> SeparablePredicate {
        SeparablePredicate {
            relation: "lineitem".into(),
            attribute: "l_quantity".into(),
            kind: HavingAggregate::MinOrFilter,
            lower: lower.map(SqlValue::Int),
            upper: upper.map(SqlValue::Int),
        }
    }

    fn ambiguous_having(op: CompareOp, value: i64) -> HavingPredicate {
        HavingPredicate {
            relation: "lineitem".into(),
            attribute: "l_quantity".into(),
            aggregate: HavingAggregate::MinOrFilter,
            op,
            value: SqlValue::Int(value),
        }
    }

    #[test]
    fn test_resolve_as_filter_moves_both_bounds() {
        let mut filters = Vec::new();
        let mut having = vec![
            ambiguous_having(CompareOp::Le, 123),
            ambiguous_having(CompareOp::Ge, 5),
        ];
        let sp = separable(Some(5), Some(123));

        resolve_as_filter(&mut filters, &mut having, &sp, CompareOp::Le, SqlValue::Int(123));

        assert!(having.is_empty());
        assert_eq!(filters.len(), 2);
        assert!(filters
            .iter()
            .any(|f| f.op == CompareOp::Le && f.value == SqlValue::Int(123)));
        assert!(filters
            .iter()
            .any(|f| f.op == CompareOp::Ge && f.value == SqlValue::Int(5)));
    }

    #[test]
    fn test_resolve_as_having_rewrites_aggregate() {
        let mut having = vec![ambiguous_having(CompareOp::Le, 123)];
        let sp = separable(None, Some(123));

        resolve_as_having(&mut having, &sp, Aggregate::Min);

        assert_eq!(having.len(), 1);
        assert_eq!(
            having[0].aggregate,
            HavingAggregate::Known(Aggregate::Min)
        );
        assert_eq!(having[0].op, CompareOp::Le);
    }

    #[test]
    fn test_resolve_preserves_other_attributes() {
        let mut filters = Vec::new();
        let mut having = vec![
            ambiguous_having(CompareOp::Le, 123),
            HavingPredicate {
                relation: "lineitem".into(),
                attribute: "l_extendedprice".into(),
                aggregate: HavingAggregate::Known(Aggregate::Sum),
                op: CompareOp::Ge,
                value: SqlValue::Int(212),
            },
        ];
        let sp = separable(None, Some(123));

        resolve_as_filter(&mut filters, &mut having, &sp, CompareOp::Le, SqlValue::Int(123));

        assert_eq!(having.len(), 1);
        assert_eq!(having[0].attribute, "l_extendedprice");
    }
}
