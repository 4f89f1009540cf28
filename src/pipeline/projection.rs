//! Projection recovery.
//!
//! Three steps per output column of the hidden query:
//!
//! 1. *Dependency discovery* — mutate each attribute away from its witness
//!    value (co-mutating join partners) and record which output columns
//!    moved. Attributes under a range predicate swap to the opposite bound
//!    so the mutation stays inside the satisfiable window.
//! 2. *Classification* — no dependencies and a non-1 value is a literal
//!    constant; no dependencies and value 1 is the COUNT sentinel (empty
//!    expression, resolved by the aggregation extractor); a single
//!    non-numeric dependency is that attribute verbatim.
//! 3. *Polynomial solve* — everything else is an affine combination over
//!    the product basis of its numeric dependencies. A `2^n × 2^n` system
//!    is assembled from the witness row plus random in-range assignments
//!    and solved by Gaussian elimination. If the matrix rank fails to grow
//!    for two consecutive assignments the probe is abandoned and the slot
//!    degrades to its raw dependency list.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::{AttrRef, CompareOp, ExtractionContext, ProjectionSlot};
use crate::db::{self, Session};
use crate::error::UnveilError;
use crate::pipeline::solver;
use crate::values::{AttrType, SqlValue};

pub fn run(
    ctx: &mut ExtractionContext,
    session: &mut Session,
    cfg: &Config,
) -> Result<(), UnveilError> {
    let names = session.column_names(&ctx.hidden_query)?;
    debug!(columns = ?names, "projection names");

    let mut discovery = discover_dependencies(ctx, session, &names)?;
    if dependencies_incomplete(&names, &discovery.deps) {
        // Too few columns moved: diversify the witness with the probe
        // values and re-run discovery once.
        debug!("dependency discovery incomplete; diversifying witness");
        for (table, attribute, value) in &discovery.s_values {
            if let Some(value) = value {
                set_attribute(session, table, attribute, value)?;
            }
        }
        discovery = discover_dependencies(ctx, session, &names)?;
    }

    let core_relations = ctx.core_relations()?.to_vec();
    let witness = witness_values(session, &core_relations)?;

    let mut slots = Vec::with_capacity(names.len());
    for (idx, name) in names.iter().enumerate() {
        let deps = discovery.deps[idx].clone();
        let mut solution = Vec::new();

        let expression = if deps.is_empty() {
            let observed = discovery
                .base
                .first()
                .and_then(|row| row.get(idx))
                .cloned()
                .unwrap_or(SqlValue::Null);
            if is_one(&observed) {
                // COUNT sentinel: value 1 with no dependency could be the
                // count of a single witness group.
                String::new()
            } else {
                observed.literal()
            }
        } else if deps.len() == 1 && !is_numeric(ctx.attr_type(&deps[0].0, &deps[0].1)?) {
            deps[0].1.clone()
        } else if deps
            .iter()
            .any(|(t, a)| !is_numeric(ctx.attr_type(t, a).unwrap_or(AttrType::Text)))
        {
            warn!(column = %name, deps = ?deps, "non-numeric multi-attribute column; recording raw dependencies");
            raw_dependency_list(&deps)
        } else {
            match solve_column(ctx, session, cfg, idx, &deps, &witness)? {
                Some((expr, sol)) => {
                    solution = sol;
                    expr
                }
                None => {
                    warn!(column = %name, "projection solve degraded to raw dependencies");
                    raw_dependency_list(&deps)
                }
            }
        };

        debug!(column = %name, expression = %expression, deps = ?deps, "projection slot");
        slots.push(ProjectionSlot {
            name: name.clone(),
            expression,
            dependencies: deps,
            solution,
        });
    }

    info!(slots = slots.len(), "projection extraction done");
    ctx.set_projection_extractor(slots);
    Ok(())
}

fn is_numeric(ty: AttrType) -> bool {
    matches!(ty, AttrType::Integer | AttrType::Numeric)
}

fn is_one(value: &SqlValue) -> bool {
    match value {
        SqlValue::Text(s) => s == "1",
        other => other
            .as_decimal()
            .map(|d| d == Decimal::ONE)
            .unwrap_or(false),
    }
}

fn raw_dependency_list(deps: &[AttrRef]) -> String {
    deps.iter()
        .map(|(_, a)| a.clone())
        .collect::<Vec<_>>()
        .join(" + ")
}

// ── Dependency discovery ───────────────────────────────────────────────────

struct Discovery {
    /// Per output column: the attributes whose mutation moved it.
    deps: Vec<Vec<AttrRef>>,
    /// Result grid on the untouched witness instance.
    base: Vec<Vec<SqlValue>>,
    /// The probe value used per attribute, for the diversification retry.
    s_values: Vec<(String, String, Option<SqlValue>)>,
}

fn discover_dependencies(
    ctx: &ExtractionContext,
    session: &mut Session,
    names: &[String],
) -> Result<Discovery, UnveilError> {
    let hidden = ctx.hidden_query.clone();
    let core_relations = ctx.core_relations()?.to_vec();

    let base = db::grid(session.client(), &hidden)?;
    if base.is_empty() {
        return Err(UnveilError::Internal(
            "hidden query is empty on the witness instance".into(),
        ));
    }

    let joined: Vec<AttrRef> = ctx.join_graph()?.iter().flatten().cloned().collect();

    let mut deps: Vec<Vec<AttrRef>> = vec![Vec::new(); names.len()];
    let mut s_values: Vec<(String, String, Option<SqlValue>)> = Vec::new();
    let mut skip: Vec<AttrRef> = Vec::new();
    let mut dummy = DummyValues::new();

    for table in &core_relations {
        for attribute in ctx.attributes(table)?.to_vec() {
            let key: AttrRef = (table.clone(), attribute.clone());

            if joined.contains(&key) {
                if skip.contains(&key) {
                    continue;
                }
                // Joined attributes co-mutate with their edge.
                let prev = current_value(session, table, &attribute)?;
                let value = different_value(ctx, &mut dummy, table, &attribute, &prev)?;
                let mut targets = vec![key.clone()];
                targets.extend(ctx.join_partners(table, &attribute));

                for (t, a) in &targets {
                    set_attribute(session, t, a, &value)?;
                }
                let probed = db::grid(session.client(), &hidden)?;
                for (t, a) in &targets {
                    set_attribute(session, t, a, &prev)?;
                }

                if !probed.is_empty() {
                    record_differences(&base, &probed, &key, &mut deps);
                }
                for partner in targets.iter().skip(1) {
                    skip.push(partner.clone());
                    s_values.push((partner.0.clone(), partner.1.clone(), Some(value.clone())));
                }
                s_values.push((table.clone(), attribute.clone(), Some(value)));
            } else {
                // An equality filter leaves no second satisfiable value.
                let equality_filtered = ctx.filter_predicates.iter().any(|f| {
                    f.relation == *table && f.attribute == attribute && f.op == CompareOp::Eq
                });
                if equality_filtered {
                    s_values.push((table.clone(), attribute.clone(), None));
                    continue;
                }

                let prev = current_value(session, table, &attribute)?;
                if prev.is_null() {
                    s_values.push((table.clone(), attribute.clone(), None));
                    continue;
                }
                let value = different_value(ctx, &mut dummy, table, &attribute, &prev)?;
                if value == prev {
                    debug!(relation = %table, attribute = %attribute, "no alternative probe value");
                    s_values.push((table.clone(), attribute.clone(), None));
                    continue;
                }

                set_attribute(session, table, &attribute, &value)?;
                let probed = db::grid(session.client(), &hidden)?;
                set_attribute(session, table, &attribute, &prev)?;

                if probed.is_empty() {
                    debug!(relation = %table, attribute = %attribute, "probe emptied the oracle");
                } else {
                    record_differences(&base, &probed, &key, &mut deps);
                }
                s_values.push((table.clone(), attribute.clone(), Some(value)));
            }
        }
    }

    Ok(Discovery {
        deps,
        base,
        s_values,
    })
}

/// More than two output columns but fewer than two with any dependency:
/// the witness likely sits on a degenerate point.
fn dependencies_incomplete(names: &[String], deps: &[Vec<AttrRef>]) -> bool {
    if names.len() <= 2 {
        return false;
    }
    deps.iter().filter(|d| !d.is_empty()).count() < 2
}

fn record_differences(
    base: &[Vec<SqlValue>],
    probed: &[Vec<SqlValue>],
    key: &AttrRef,
    deps: &mut [Vec<AttrRef>],
) {
    for (base_row, probed_row) in base.iter().zip(probed.iter()) {
        for (i, (old, new)) in base_row.iter().zip(probed_row.iter()).enumerate() {
            if old != new && !deps[i].contains(key) {
                deps[i].push(key.clone());
            }
        }
    }
}

fn current_value(
    session: &mut Session,
    table: &str,
    attribute: &str,
) -> Result<SqlValue, UnveilError> {
    match db::first_row(
        session.client(),
        &format!("SELECT {attribute} FROM {table};"),
    )? {
        Some(row) => db::value_at(&row, 0),
        None => Ok(SqlValue::Null),
    }
}

fn set_attribute(
    session: &mut Session,
    table: &str,
    attribute: &str,
    value: &SqlValue,
) -> Result<(), UnveilError> {
    db::run(
        session.client(),
        &format!("UPDATE {table} SET {attribute} = {};", value.literal()),
    )
}

/// A value different from `prev` that the hidden query can still accept.
///
/// Attributes under a predicate swap between their extracted bounds;
/// unconstrained attributes draw from the dummy-value sequence.
fn different_value(
    ctx: &ExtractionContext,
    dummy: &mut DummyValues,
    table: &str,
    attribute: &str,
    prev: &SqlValue,
) -> Result<SqlValue, UnveilError> {
    let ty = ctx.attr_type(table, attribute)?;
    let constrained = predicate_window(ctx, table, attribute);

    match ty {
        AttrType::Integer | AttrType::Numeric | AttrType::Date => match constrained {
            Some((lower, upper)) => {
                let lower = lower.map(Ok).unwrap_or_else(|| ty.min_value())?;
                let upper = upper.map(Ok).unwrap_or_else(|| ty.max_value())?;
                Ok(if *prev == lower { upper } else { lower })
            }
            None => Ok(dummy.unused(ty, prev)),
        },
        AttrType::Text => match constrained {
            Some(_) => Ok(SqlValue::Text("b".into())),
            None => Ok(dummy.unused(ty, prev)),
        },
    }
}

/// The `(lower, upper)` bounds of any predicate on the attribute, or `None`
/// when it is unconstrained.
fn predicate_window(
    ctx: &ExtractionContext,
    table: &str,
    attribute: &str,
) -> Option<(Option<SqlValue>, Option<SqlValue>)> {
    let mut lower = None;
    let mut upper = None;
    let mut found = false;
    for f in &ctx.filter_predicates {
        if f.relation == table && f.attribute == attribute {
            found = true;
            match f.op {
                CompareOp::Le => upper = Some(f.value.clone()),
                CompareOp::Ge => lower = Some(f.value.clone()),
                CompareOp::Eq => {}
            }
        }
    }
    for h in &ctx.having_predicates {
        if h.relation == table && h.attribute == attribute {
            found = true;
            match h.op {
                CompareOp::Le => upper = Some(h.value.clone()),
                CompareOp::Ge => lower = Some(h.value.clone()),
                CompareOp::Eq => {}
            }
        }
    }
    found.then_some((lower, upper))
}

/// Deterministic dummy-value sequence: integers from 2, single characters
/// from 'A' (wrapping after 'Z'), dates from 1000-01-01.
struct DummyValues {
    next_int: i64,
    next_char: u8,
    next_date: NaiveDate,
}

impl DummyValues {
    fn new() -> Self {
        DummyValues {
            next_int: 2,
            next_char: b'A',
            next_date: NaiveDate::from_ymd_opt(1000, 1, 1).expect("valid date"),
        }
    }

    fn unused(&mut self, ty: AttrType, used: &SqlValue) -> SqlValue {
        match ty {
            AttrType::Integer | AttrType::Numeric => {
                let mut v = self.next_int;
                while *used == SqlValue::Int(v) {
                    v += 1;
                }
                self.next_int = v;
                match ty {
                    AttrType::Integer => SqlValue::Int(v),
                    _ => SqlValue::Numeric(Decimal::from(v)),
                }
            }
            AttrType::Date => {
                let mut d = self.next_date;
                while *used == SqlValue::Date(d) {
                    d = d
                        .succ_opt()
                        .unwrap_or_else(|| NaiveDate::from_ymd_opt(1000, 1, 1).expect("valid date"));
                }
                self.next_date = d;
                SqlValue::Date(d)
            }
            AttrType::Text => {
                if self.next_char > b'Z' {
                    self.next_char = b'A';
                }
                let mut c = self.next_char;
                while *used == SqlValue::Text((c as char).to_string()) {
                    c += 1;
                    if c > b'Z' {
                        c = b'A';
                    }
                }
                self.next_char = c;
                SqlValue::Text((c as char).to_string())
            }
        }
    }
}

// ── Polynomial solve ───────────────────────────────────────────────────────

/// Witness cell values per `(relation, attribute)`, for row 0 of the system.
fn witness_values(
    session: &mut Session,
    core_relations: &[String],
) -> Result<BTreeMap<AttrRef, SqlValue>, UnveilError> {
    let mut map = BTreeMap::new();
    for table in core_relations {
        if let Some(row) = db::first_row(session.client(), &format!("SELECT * FROM {table};"))? {
            for (i, column) in row.columns().iter().enumerate() {
                let value = db::value_at(&row, i).unwrap_or(SqlValue::Null);
                map.insert((table.clone(), column.name().to_string()), value);
            }
        }
    }
    Ok(map)
}

/// Solve one output column as an affine combination over the product basis
/// of its dependencies. Returns `None` on a rank stall.
fn solve_column(
    ctx: &ExtractionContext,
    session: &mut Session,
    cfg: &Config,
    idx: usize,
    deps: &[AttrRef],
    witness: &BTreeMap<AttrRef, SqlValue>,
) -> Result<Option<(String, Vec<f64>)>, UnveilError> {
    let n = deps.len();
    let dim = 1usize << n;
    let hidden = ctx.hidden_query.clone();

    // Per-dependency type, mutation targets (join edge), assignment window.
    let mut dep_info: Vec<(AttrType, Vec<AttrRef>, f64, f64)> = Vec::with_capacity(n);
    for dep in deps {
        let ty = ctx.attr_type(&dep.0, &dep.1)?;
        let mut targets = vec![dep.clone()];
        targets.extend(ctx.join_partners(&dep.0, &dep.1));
        let (lo, hi) = assignment_window(ctx, cfg, dep)?;
        dep_info.push((ty, targets, lo, hi));
    }

    let mut matrix = vec![vec![0.0f64; dim]; dim];
    let mut singles = vec![0.0f64; n];
    for (j, dep) in deps.iter().enumerate() {
        singles[j] = witness
            .get(dep)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| {
                UnveilError::Internal(format!("no numeric witness value for {}.{}", dep.0, dep.1))
            })?;
    }
    fill_product_row(&mut matrix[0], &singles);

    // Random in-window rows until the system is fully determined. Two
    // consecutive assignments that fail to grow the rank abandon the solve.
    let mut rng = rand::rng();
    let mut current_rank = 1usize;
    let mut row_idx = 1usize;
    let mut stalls = 0u32;
    while row_idx < dim {
        for (j, (ty, _, lo, hi)) in dep_info.iter().enumerate() {
            singles[j] = match ty {
                AttrType::Integer => rng.random_range((*lo as i64)..=(*hi as i64)) as f64,
                _ => (rng.random_range(*lo..=*hi) * 100.0).round() / 100.0,
            };
        }
        fill_product_row(&mut matrix[row_idx], &singles);
        let rank = solver::rank(&matrix);
        if rank > current_rank {
            current_rank = rank;
            row_idx += 1;
            stalls = 0;
        } else {
            stalls += 1;
            if stalls >= 2 {
                return Ok(None);
            }
        }
    }

    // Observe the oracle under each assignment.
    let mut rhs = vec![0.0f64; dim];
    for (i, row) in matrix.iter().enumerate() {
        let observed = db::probe(session.client(), |tx| {
            for (j, (ty, targets, _, _)) in dep_info.iter().enumerate() {
                let value = match ty {
                    AttrType::Integer => SqlValue::Int(row[j] as i64),
                    _ => Decimal::from_f64(row[j])
                        .map(|d| SqlValue::Numeric(d.round_dp(2)))
                        .unwrap_or(SqlValue::Null),
                };
                for (t, a) in targets {
                    db::run(tx, &format!("UPDATE {t} SET {a} = {};", value.literal()))?;
                }
            }
            let result = db::grid(tx, &hidden)?;
            Ok(result
                .first()
                .and_then(|r| r.get(idx).cloned())
                .and_then(|v| v.as_f64()))
        })?;
        rhs[i] = observed.unwrap_or(0.0);
    }

    let Some(mut solution) = solver::solve(&matrix, &rhs) else {
        return Ok(None);
    };
    for c in solution.iter_mut() {
        *c = (*c * 100.0).round() / 100.0;
    }
    let expression = build_expression(deps, &solution);
    Ok(Some((expression, solution)))
}

/// Value window for random assignments: the attribute's extracted bound
/// window when it has one, the configured default range otherwise.
fn assignment_window(
    ctx: &ExtractionContext,
    cfg: &Config,
    dep: &AttrRef,
) -> Result<(f64, f64), UnveilError> {
    if let Some((lower, upper)) = ctx.filter_bounds.get(dep) {
        let lo = lower.as_f64().ok_or_else(|| {
            UnveilError::Internal(format!("non-numeric bound on {}.{}", dep.0, dep.1))
        })?;
        let hi = upper.as_f64().ok_or_else(|| {
            UnveilError::Internal(format!("non-numeric bound on {}.{}", dep.0, dep.1))
        })?;
        Ok((lo, hi))
    } else {
        Ok((
            cfg.extraction.solve_range_min as f64,
            cfg.extraction.solve_range_max as f64,
        ))
    }
}

/// Non-empty subsets of `0..n`, shortest first, lexicographic within a
/// length. Defines the monomial column order of the solve.
fn subsets_by_len(n: usize) -> Vec<Vec<usize>> {
    fn combos(n: usize, len: usize, start: usize, cur: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if cur.len() == len {
            out.push(cur.clone());
            return;
        }
        for i in start..n {
            cur.push(i);
            combos(n, len, i + 1, cur, out);
            cur.pop();
        }
    }
    let mut out = Vec::new();
    for len in 1..=n {
        combos(n, len, 0, &mut Vec::new(), &mut out);
    }
    out
}

/// Expand single-attribute assignments into the full product-basis row:
/// one column per monomial, constant column last.
fn fill_product_row(row: &mut [f64], singles: &[f64]) {
    let n = singles.len();
    for (j, subset) in subsets_by_len(n).iter().enumerate() {
        row[j] = subset.iter().map(|&k| singles[k]).product();
    }
    let last = row.len() - 1;
    row[last] = 1.0;
}

/// Assemble the canonical expression string from the rounded coefficients.
fn build_expression(deps: &[AttrRef], solution: &[f64]) -> String {
    let monomials: Vec<String> = subsets_by_len(deps.len())
        .iter()
        .map(|subset| {
            subset
                .iter()
                .map(|&k| deps[k].1.clone())
                .collect::<Vec<_>>()
                .join("*")
        })
        .collect();

    let mut out = String::new();
    for (i, &coeff) in solution.iter().enumerate() {
        if coeff == 0.0 {
            continue;
        }
        let is_constant = i == solution.len() - 1;
        let term = if is_constant {
            format_coefficient(coeff)
        } else if (coeff - 1.0).abs() < 1e-9 {
            monomials[i].clone()
        } else {
            format!("{}*{}", format_coefficient(coeff), monomials[i])
        };
        if !out.is_empty() && coeff > 0.0 {
            out.push('+');
        }
        out.push_str(&term);
    }
    if out.is_empty() {
        out.push('0');
    }
    out
}

fn format_coefficient(c: f64) -> String {
    let mut s = format!("{c:.2}");
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsets_order() {
        assert_eq!(
            subsets_by_len(3),
            vec![
                vec![0],
                vec![1],
                vec![2],
                vec![0, 1],
                vec![0, 2],
                vec![1, 2],
                vec![0, 1, 2],
            ]
        );
        assert_eq!(subsets_by_len(1), vec![vec![0]]);
    }

    #[test]
    fn test_fill_product_row() {
        let mut row = vec![0.0; 4];
        fill_product_row(&mut row, &[3.0, 5.0]);
        assert_eq!(row, vec![3.0, 5.0, 15.0, 1.0]);
    }

    #[test]
    fn test_build_expression_affine() {
        let deps: Vec<AttrRef> = vec![
            ("t".into(), "a".into()),
            ("t".into(), "b".into()),
        ];
        // 2.5*a + b + -1*a*b + 7
        let expr = build_expression(&deps, &[2.5, 1.0, -1.0, 7.0]);
        assert_eq!(expr, "2.5*a+b-1*a*b+7");
    }

    #[test]
    fn test_build_expression_skips_zeros() {
        let deps: Vec<AttrRef> = vec![("t".into(), "a".into())];
        assert_eq!(build_expression(&deps, &[1.0, 0.0]), "a");
        assert_eq!(build_expression(&deps, &[0.0, 0.0]), "0");
        assert_eq!(build_expression(&deps, &[2.0, 3.0]), "2*a+3");
    }

    #[test]
    fn test_is_one_sentinel() {
        assert!(is_one(&SqlValue::Int(1)));
        assert!(is_one(&SqlValue::Numeric(Decimal::ONE)));
        assert!(is_one(&SqlValue::Text("1".into())));
        assert!(!is_one(&SqlValue::Int(2)));
        assert!(!is_one(&SqlValue::Null));
    }

    #[test]
    fn test_dummy_values_avoid_used() {
        let mut dummy = DummyValues::new();
        let v = dummy.unused(AttrType::Integer, &SqlValue::Int(2));
        assert_eq!(v, SqlValue::Int(3));
        let v = dummy.unused(AttrType::Integer, &SqlValue::Int(99));
        assert_eq!(v, SqlValue::Int(3));
        let v = dummy.unused(AttrType::Text, &SqlValue::Text("A".into()));
        assert_eq!(v, SqlValue::Text("B".into()));
    }

    #[test]
    fn test_format_coefficient() {
        assert_eq!(format_coefficient(2.0), "2");
        assert_eq!(format_coefficient(2.5), "2.5");
        assert_eq!(format_coefficient(-0.25), "-0.25");
    }
}
