//! Final SQL rendering.
//!
//! Composes the recovered facts — core relations, join graph, predicates,
//! projections, aggregations, group-by attributes and the optional order-by
//! string — into a single SELECT statement. Joins render as chained
//! equalities within each edge; the COUNT sentinel (empty expression)
//! renders as `COUNT(*)`.

use crate::context::{Aggregate, ExtractionContext};
use crate::error::UnveilError;

/// Render the reconstructed query from a fully-populated context.
pub fn query_from_context(ctx: &ExtractionContext) -> Result<String, UnveilError> {
    let core_relations = ctx.core_relations()?;
    let projections = ctx.projections()?;
    let aggregations = ctx.aggregations()?;

    let projection_list = projections
        .iter()
        .zip(aggregations.iter())
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
    for f in &ctx.filter_predicates {
        predicates.push(format!(
            "{}.{} {} {}",
            f.relation,
            f.attribute,
            f.op.as_sql(),
            f.value.literal()
        ));
    }

    let mut query = format!(
        "SELECT {} FROM {}",
        projection_list,
        core_relations.join(", ")
    );
    if !predicates.is_empty() {
        query.push_str(&format!("\n\tWHERE {}", predicates.join(" AND ")));
    }

    let group_by = ctx.group_by()?;
    if !group_by.is_empty() {
        let list = group_by
            .iter()
            .map(|(t, a)| format!("{t}.{a}"))
            .collect::<Vec<_>>()
            .join(", ");
        query.push_str(&format!("\n\tGROUP BY {list}"));
    }

    if !ctx.having_predicates.is_empty() {
        let list = ctx
            .having_predicates
            .iter()
            .map(|h| {
                format!(
                    "{}({}.{}) {} {}",
                    h.aggregate.as_sql(),
                    h.relation,
                    h.attribute,
                    h.op.as_sql(),
                    h.value.literal()
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        query.push_str(&format!("\n\tHAVING {list}"));
    }

    if ctx.has_orderby {
        query.push_str(&format!("\n\tORDER BY {}", ctx.orderby_string));
    }

    query.push(';');
    Ok(query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{
        CompareOp, FilterPredicate, HavingAggregate, HavingPredicate, ProjectionSlot,
    };
    use crate::values::SqlValue;
    use std::collections::BTreeMap;

    fn slot(name: &str, expression: &str) -> ProjectionSlot {
        ProjectionSlot {
            name: name.into(),
            expression: expression.into(),
            dependencies: vec![],
            solution: vec![],
        }
    }

    fn base_ctx(relations: &[&str]) -> ExtractionContext {
        let mut ctx = ExtractionContext::new("hidden");
        ctx.set_from_extractor(relations.iter().map(|s| s.to_string()).collect());
        ctx.set_join_extractor(vec![]);
        ctx.set_groupby_extractor(vec![]);
        ctx
    }

    #[test]
    fn test_simple_filter_query() {
        // SELECT ps_partkey FROM partsupp WHERE ps_availqty <= 20000;
        let mut ctx = base_ctx(&["partsupp"]);
        ctx.set_predicate_extractor(
            vec![FilterPredicate {
                relation: "partsupp".into(),
                attribute: "ps_availqty".into(),
                op: CompareOp::Le,
                value: SqlValue::Int(20000),
            }],
            vec![],
            vec![],
            BTreeMap::new(),
        );
        ctx.set_projection_extractor(vec![slot("ps_partkey", "ps_partkey")]);
        ctx.set_aggregation_extractor(vec![None]);

        assert_eq!(
            query_from_context(&ctx).unwrap(),
            "SELECT ps_partkey FROM partsupp\n\tWHERE partsupp.ps_availqty <= 20000;"
        );
    }

    #[test]
    fn test_groupby_having_query() {
        // SELECT ps_partkey FROM partsupp GROUP BY ps_partkey
        //   HAVING SUM(ps_availqty) <= 20000;
        let mut ctx = base_ctx(&["partsupp"]);
        ctx.set_groupby_extractor(vec![("partsupp".into(), "ps_partkey".into())]);
        ctx.set_predicate_extractor(
            vec![],
            vec![HavingPredicate {
                relation: "partsupp".into(),
                attribute: "ps_availqty".into(),
                aggregate: HavingAggregate::Known(Aggregate::Sum),
                op: CompareOp::Le,
                value: SqlValue::Int(20000),
            }],
            vec![],
            BTreeMap::new(),
        );
        ctx.set_projection_extractor(vec![slot("ps_partkey", "ps_partkey")]);
        ctx.set_aggregation_extractor(vec![None]);

        let q = query_from_context(&ctx).unwrap();
        assert!(q.contains("GROUP BY partsupp.ps_partkey"));
        assert!(q.contains("HAVING SUM(partsupp.ps_availqty) <= 20000"));
    }

    #[test]
    fn test_join_edges_render_as_chained_equalities() {
        let mut ctx = base_ctx(&["customer", "orders", "lineitem"]);
        ctx.set_join_extractor(vec![
            vec![
                ("customer".into(), "c_custkey".into()),
                ("orders".into(), "o_custkey".into()),
            ],
            vec![
                ("lineitem".into(), "l_orderkey".into()),
                ("orders".into(), "o_orderkey".into()),
            ],
        ]);
        ctx.set_projection_extractor(vec![slot(
            "revenue",
            "l_extendedprice*(1 - l_discount) + l_quantity",
        )]);
        ctx.set_aggregation_extractor(vec![Some(Aggregate::Sum)]);

        let q = query_from_context(&ctx).unwrap();
        assert!(q.contains("customer.c_custkey = orders.o_custkey"));
        assert!(q.contains("lineitem.l_orderkey = orders.o_orderkey"));
        assert!(q.contains("SUM(l_extendedprice*(1 - l_discount) + l_quantity)"));
    }

    #[test]
    fn test_count_sentinel_renders_star() {
        let mut ctx = base_ctx(&["orders"]);
        ctx.set_projection_extractor(vec![slot("count", "")]);
        ctx.set_aggregation_extractor(vec![Some(Aggregate::Count)]);

        let q = query_from_context(&ctx).unwrap();
        assert!(q.starts_with("SELECT COUNT(*) FROM orders"));
    }

    #[test]
    fn test_orderby_appended() {
        let mut ctx = base_ctx(&["orders"]);
        ctx.set_projection_extractor(vec![slot("o_orderdate", "o_orderdate")]);
        ctx.set_aggregation_extractor(vec![None]);
        ctx.has_orderby = true;
        ctx.orderby_string = "o_orderdate asc".into();

        let q = query_from_context(&ctx).unwrap();
        assert!(q.ends_with("ORDER BY o_orderdate asc;"));
    }

    #[test]
    fn test_no_predicates_renders_bare_query() {
        let mut ctx = base_ctx(&["region"]);
        ctx.set_projection_extractor(vec![slot("r_name", "r_name")]);
        ctx.set_aggregation_extractor(vec![None]);

        assert_eq!(
            query_from_context(&ctx).unwrap(),
            "SELECT r_name FROM region;"
        );
    }
}
