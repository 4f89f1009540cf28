//! End-to-end rendering tests over hand-built extraction contexts,
//! mirroring the reference scenarios the extractor must reproduce.

use std::collections::BTreeMap;

use pg_unveil::context::{
    Aggregate, CompareOp, ExtractionContext, FilterPredicate, HavingAggregate, HavingPredicate,
    ProjectionSlot,
};
use pg_unveil::query_from_context;
use pg_unveil::values::SqlValue;

use chrono::NaiveDate;
use rust_decimal::Decimal;

fn slot(name: &str, expression: &str) -> ProjectionSlot {
    ProjectionSlot {
        name: name.into(),
        expression: expression.into(),
        dependencies: vec![],
        solution: vec![],
    }
}

#[test]
fn test_spj_filter_scenario() {
    // Hidden: SELECT ps_partkey FROM partsupp WHERE ps_availqty <= 20000;
    let mut ctx = ExtractionContext::new("hidden");
    ctx.set_from_extractor(vec!["partsupp".into()]);
    ctx.set_join_extractor(vec![]);
    ctx.set_groupby_extractor(vec![]);
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

    let sql = query_from_context(&ctx).unwrap();
    assert_eq!(
        sql,
        "SELECT ps_partkey FROM partsupp\n\tWHERE partsupp.ps_availqty <= 20000;"
    );
}

#[test]
fn test_groupby_having_scenario() {
    // Hidden: SELECT ps_partkey FROM partsupp GROUP BY ps_partkey
    //           HAVING SUM(ps_availqty) <= 20000;
    let mut ctx = ExtractionContext::new("hidden");
    ctx.set_from_extractor(vec!["partsupp".into()]);
    ctx.set_join_extractor(vec![]);
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

    let sql = query_from_context(&ctx).unwrap();
    assert_eq!(
        sql,
        "SELECT ps_partkey FROM partsupp\n\tGROUP BY partsupp.ps_partkey\n\tHAVING SUM(partsupp.ps_availqty) <= 20000;"
    );
}

#[test]
fn test_three_way_join_revenue_scenario() {
    // The customer/orders/lineitem revenue query with date and quantity
    // bounds, segment/date/priority grouping, and an ordered output.
    let mut ctx = ExtractionContext::new("hidden");
    ctx.set_from_extractor(vec![
        "customer".into(),
        "orders".into(),
        "lineitem".into(),
    ]);
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
    ctx.set_groupby_extractor(vec![
        ("customer".into(), "c_mktsegment".into()),
        ("orders".into(), "o_orderdate".into()),
        ("orders".into(), "o_shippriority".into()),
    ]);
    ctx.set_predicate_extractor(
        vec![
            FilterPredicate {
                relation: "orders".into(),
                attribute: "o_orderdate".into(),
                op: CompareOp::Le,
                value: SqlValue::Date(NaiveDate::from_ymd_opt(1995, 10, 13).unwrap()),
            },
            FilterPredicate {
                relation: "lineitem".into(),
                attribute: "l_quantity".into(),
                op: CompareOp::Le,
                value: SqlValue::Numeric(Decimal::from(123)),
            },
        ],
        vec![HavingPredicate {
            relation: "lineitem".into(),
            attribute: "l_extendedprice".into(),
            aggregate: HavingAggregate::Known(Aggregate::Sum),
            op: CompareOp::Ge,
            value: SqlValue::Int(212),
        }],
        vec![],
        BTreeMap::new(),
    );
    ctx.set_projection_extractor(vec![
        slot("c_mktsegment", "c_mktsegment"),
        slot("revenue", "l_extendedprice*(1 - l_discount) + l_quantity"),
        slot("o_orderdate", "o_orderdate"),
        slot("o_shippriority", "o_shippriority"),
    ]);
    ctx.set_aggregation_extractor(vec![None, Some(Aggregate::Sum), None, None]);
    ctx.has_orderby = true;
    ctx.orderby_string = "revenue desc, o_orderdate asc, o_shippriority asc".into();

    let sql = query_from_context(&ctx).unwrap();
    assert!(sql.starts_with(
        "SELECT c_mktsegment, SUM(l_extendedprice*(1 - l_discount) + l_quantity), o_orderdate, o_shippriority FROM customer, orders, lineitem"
    ));
    assert!(sql.contains("customer.c_custkey = orders.o_custkey"));
    assert!(sql.contains("lineitem.l_orderkey = orders.o_orderkey"));
    assert!(sql.contains("orders.o_orderdate <= '1995-10-13'"));
    assert!(sql.contains("lineitem.l_quantity <= 123"));
    assert!(sql.contains(
        "GROUP BY customer.c_mktsegment, orders.o_orderdate, orders.o_shippriority"
    ));
    assert!(sql.contains("HAVING SUM(lineitem.l_extendedprice) >= 212"));
    assert!(sql.ends_with("ORDER BY revenue desc, o_orderdate asc, o_shippriority asc;"));
}

#[test]
fn test_separated_min_filter_scenario() {
    // HAVING MIN(l_quantity) <= 123 vs. WHERE l_quantity <= 123: after the
    // separator resolves to a filter, the HAVING list must be empty.
    let mut ctx = ExtractionContext::new("hidden");
    ctx.set_from_extractor(vec!["lineitem".into()]);
    ctx.set_join_extractor(vec![]);
    ctx.set_groupby_extractor(vec![("lineitem".into(), "l_linestatus".into())]);
    ctx.set_predicate_extractor(
        vec![],
        vec![HavingPredicate {
            relation: "lineitem".into(),
            attribute: "l_quantity".into(),
            aggregate: HavingAggregate::MinOrFilter,
            op: CompareOp::Le,
            value: SqlValue::Int(123),
        }],
        vec![],
        BTreeMap::new(),
    );
    ctx.set_projection_extractor(vec![slot("l_linestatus", "l_linestatus")]);
    ctx.set_aggregation_extractor(vec![None]);
    ctx.set_predicate_separator(
        vec![FilterPredicate {
            relation: "lineitem".into(),
            attribute: "l_quantity".into(),
            op: CompareOp::Le,
            value: SqlValue::Int(123),
        }],
        vec![],
    );

    let sql = query_from_context(&ctx).unwrap();
    assert!(sql.contains("WHERE lineitem.l_quantity <= 123"));
    assert!(!sql.contains("HAVING"));
}

#[test]
fn test_empty_join_graph_single_relation() {
    let mut ctx = ExtractionContext::new("hidden");
    ctx.set_from_extractor(vec!["region".into()]);
    ctx.set_join_extractor(vec![]);
    ctx.set_groupby_extractor(vec![]);
    ctx.set_projection_extractor(vec![slot("r_name", "r_name")]);
    ctx.set_aggregation_extractor(vec![None]);

    assert_eq!(
        query_from_context(&ctx).unwrap(),
        "SELECT r_name FROM region;"
    );
}
