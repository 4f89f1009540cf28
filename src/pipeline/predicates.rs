//! Filter and HAVING bound extraction.
//!
//! The heaviest stage of the pipeline. For every non-key, non-grouping
//! attribute of a rangey type it decides whether the hidden query carries a
//! lower bound, an upper bound, or both, and whether each bound acts on
//! rows (WHERE) or on group aggregates (HAVING).
//!
//! Bound detection probes the type's MIN/MAX sentinels, then binary-searches
//! the surviving side: a coarse pass at integer (or day) granularity and,
//! for numerics, a refined pass that narrows to the configured decimal
//! precision with directional rounding.
//!
//! With no grouping attributes the query is plain SPJ and only row-level
//! bounds exist (fast path). Otherwise the extracted candidates go through
//! *deflation* — each relation collapsed to one witness row carrying the
//! candidate bound values, committed after a sanity check — and an
//! aggregate fingerprinting pass that distinguishes SUM/MAX/AVG/MIN by
//! two-row probe instances. The two genuinely ambiguous outcomes
//! (MIN-vs-filter on an upper bound, MAX-vs-filter on a lower bound) are
//! recorded for the separator stage.

use std::collections::BTreeMap;

use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::{
    Aggregate, AttrRef, CompareOp, ExtractionContext, FilterPredicate, HavingAggregate,
    HavingPredicate, SeparablePredicate,
};
use crate::db::{self, Session};
use crate::error::UnveilError;
use crate::values::{AttrType, SqlValue};

/// A `(relation, attribute)` pair with the raw bounds found in pass 1,
/// before the HAVING-vs-filter decision.
#[derive(Debug, Clone)]
struct BoundCandidate {
    relation: String,
    attribute: String,
    ty: AttrType,
    lower: Option<SqlValue>,
    upper: Option<SqlValue>,
}

impl BoundCandidate {
    /// The representative value used when materializing probe instances.
    fn seed_value(&self) -> SqlValue {
        self.lower
            .clone()
            .or_else(|| self.upper.clone())
            .unwrap_or(SqlValue::Null)
    }
}

pub fn run(
    ctx: &mut ExtractionContext,
    session: &mut Session,
    cfg: &Config,
) -> Result<(), UnveilError> {
    let core_relations = ctx.core_relations()?.to_vec();
    let group_by = ctx.group_by()?.to_vec();
    let hidden = ctx.hidden_query.clone();
    let precision = cfg.extraction.numeric_precision;

    let mut filters: Vec<FilterPredicate> = Vec::new();
    let mut having: Vec<HavingPredicate> = Vec::new();
    let mut separable: Vec<SeparablePredicate> = Vec::new();
    let mut bounds: BTreeMap<AttrRef, (SqlValue, SqlValue)> = BTreeMap::new();

    // SPJ fast path: no groups means no HAVING machinery, only row filters.
    if group_by.is_empty() {
        for table in &core_relations {
            for attribute in ctx.attributes(table)?.to_vec() {
                if ctx.is_primary_key(table, &attribute) {
                    continue;
                }
                let ty = ctx.attr_type(table, &attribute)?;
                if !ty.supports_bounds() {
                    continue;
                }
                if let Some(found) = simple_filter_bounds(
                    session, &hidden, table, &attribute, ty, precision, &mut bounds,
                )? {
                    filters.extend(found);
                }
            }
        }
        info!(filters = filters.len(), "predicate extraction (SPJ path) done");
        ctx.set_predicate_extractor(filters, having, separable, bounds);
        return Ok(());
    }

    // Grouping attributes can only carry row-level bounds.
    for (table, attribute) in &group_by {
        if ctx.is_primary_key(table, attribute) {
            continue;
        }
        let ty = ctx.attr_type(table, attribute)?;
        if !ty.supports_bounds() {
            continue;
        }
        if let Some(found) =
            simple_filter_bounds(session, &hidden, table, attribute, ty, precision, &mut bounds)?
        {
            filters.extend(found);
        }
    }

    // Pass 1: bound detection on the remaining attributes.
    let mut candidates: Vec<BoundCandidate> = Vec::new();
    for table in &core_relations {
        for attribute in ctx.attributes(table)?.to_vec() {
            let ty = ctx.attr_type(table, &attribute)?;
            if !ty.supports_bounds() {
                continue;
            }
            if ctx.is_group_by(table, &attribute) {
                continue;
            }
            // Key attributes carry joins, not range predicates.
            if ctx.is_key_attribute(table, &attribute) {
                continue;
            }

            // Dates only ever appear as row filters.
            if ty == AttrType::Date {
                if let Some(found) = simple_filter_bounds(
                    session, &hidden, table, &attribute, ty, precision, &mut bounds,
                )? {
                    filters.extend(found);
                }
                continue;
            }

            let lower = rowwise_lower_bound(session, &hidden, table, &attribute, ty, precision)?;
            let upper = rowwise_upper_bound(session, &hidden, table, &attribute, ty, precision)?;
            debug!(
                relation = %table, attribute = %attribute,
                lower = ?lower, upper = ?upper, "bound detection"
            );

            bounds.insert(
                (table.clone(), attribute.clone()),
                (
                    lower.clone().map(Ok).unwrap_or_else(|| ty.min_value())?,
                    upper.clone().map(Ok).unwrap_or_else(|| ty.max_value())?,
                ),
            );

            if lower.is_some() || upper.is_some() {
                candidates.push(BoundCandidate {
                    relation: table.clone(),
                    attribute: attribute.clone(),
                    ty,
                    lower,
                    upper,
                });
            }
        }
    }
    debug!(candidates = ?candidates, "bound candidates");

    // Collapse every relation to a single witness row carrying the candidate
    // values. Committed; the rest of the stage probes against this instance.
    deflate(session, &core_relations, &candidates, &hidden)?;

    // Pass 2: aggregate fingerprinting.
    for cand in &candidates {
        let ty = cand.ty;
        let mut aggregate: Option<HavingAggregate> = None;
        let mut ambiguous = false;

        if let Some(ub) = &cand.upper {
            // SUM collapses two rows summing to exactly the bound.
            if check_predicate(session, &hidden, &candidates, cand, ub, ub)? {
                aggregate = Some(HavingAggregate::Known(Aggregate::Sum));
            }
            if aggregate.is_none() {
                let k1 = ty.step(ub, -1)?;
                let k2 = ty.step(ub, 1)?;
                if check_predicate(session, &hidden, &candidates, cand, &k1, &k2)? {
                    aggregate = Some(HavingAggregate::Known(Aggregate::Max));
                }
            }
            if aggregate.is_none() {
                let k2 = ty.step(ub, 2)?;
                if check_predicate(session, &hidden, &candidates, cand, ub, &k2)? {
                    aggregate = Some(HavingAggregate::Known(Aggregate::Avg));
                }
            }
            if aggregate.is_none() {
                // MIN and a plain filter behave identically here; defer.
                ambiguous = true;
                aggregate = Some(HavingAggregate::MinOrFilter);
            }
        } else if let Some(lb) = &cand.lower {
            let k1 = ty.step(lb, -1)?;
            let k2 = ty.step(lb, 1)?;
            if check_predicate(session, &hidden, &candidates, cand, &k1, &k2)? {
                aggregate = Some(HavingAggregate::Known(Aggregate::Min));
            }
            if aggregate.is_none() {
                let k1 = ty.step(lb, -3)?;
                let k2 = ty.step(lb, 1)?;
                if check_predicate(session, &hidden, &candidates, cand, &k1, &k2)? {
                    aggregate = Some(HavingAggregate::Known(Aggregate::Avg));
                }
            }
            if aggregate.is_none() {
                // The SUM test on a lower bound is inverted relative to the
                // others: a NON-empty result implies SUM.
                let k1 = ty.step(lb, -1)?;
                let k2 = one_of(ty);
                if !check_predicate(session, &hidden, &candidates, cand, &k1, &k2)? {
                    aggregate = Some(HavingAggregate::Known(Aggregate::Sum));
                }
            }
            if aggregate.is_none() {
                ambiguous = true;
                aggregate = Some(HavingAggregate::MaxOrFilter);
            }
        }

        let aggregate = aggregate.ok_or_else(|| {
            UnveilError::Internal(format!(
                "candidate {}.{} has neither bound",
                cand.relation, cand.attribute
            ))
        })?;
        debug!(
            relation = %cand.relation, attribute = %cand.attribute,
            aggregate = ?aggregate, ambiguous, "fingerprinted"
        );

        if let Some(ub) = &cand.upper {
            having.push(HavingPredicate {
                relation: cand.relation.clone(),
                attribute: cand.attribute.clone(),
                aggregate,
                op: CompareOp::Le,
                value: ub.clone(),
            });
        }
        if let Some(lb) = &cand.lower {
            having.push(HavingPredicate {
                relation: cand.relation.clone(),
                attribute: cand.attribute.clone(),
                aggregate,
                op: CompareOp::Ge,
                value: lb.clone(),
            });
        }
        if ambiguous {
            separable.push(SeparablePredicate {
                relation: cand.relation.clone(),
                attribute: cand.attribute.clone(),
                kind: aggregate,
                lower: cand.lower.clone(),
                upper: cand.upper.clone(),
            });
        }
    }

    info!(
        filters = filters.len(),
        having = having.len(),
        separable = separable.len(),
        "predicate extraction done"
    );
    ctx.set_predicate_extractor(filters, having, separable, bounds);
    Ok(())
}

/// Literal 1 in the candidate's value domain.
fn one_of(ty: AttrType) -> SqlValue {
    match ty {
        AttrType::Numeric => SqlValue::Numeric(Decimal::ONE),
        _ => SqlValue::Int(1),
    }
}

// ── Probing primitives ─────────────────────────────────────────────────────

/// Set the attribute (whole relation or one row) and check whether the
/// oracle empties. Rollback-terminated.
fn empties_with_value(
    session: &mut Session,
    hidden: &str,
    table: &str,
    attribute: &str,
    value: &SqlValue,
    ctid: Option<&str>,
) -> Result<bool, UnveilError> {
    db::probe(session.client(), |tx| {
        match ctid {
            Some(ctid) => db::run(
                tx,
                &format!(
                    "UPDATE {table} SET {attribute} = {} WHERE ctid = '{ctid}';",
                    value.literal()
                ),
            )?,
            None => db::run(
                tx,
                &format!("UPDATE {table} SET {attribute} = {};", value.literal()),
            )?,
        }
        db::result_is_empty(tx, hidden)
    })
}

/// Smallest value in `[low, seed]` that keeps the oracle non-empty.
///
/// Coarse phase at integer/day granularity; numeric results are refined to
/// `precision` decimal places with floor rounding.
#[allow(clippy::too_many_arguments)]
fn search_lower(
    session: &mut Session,
    hidden: &str,
    table: &str,
    attribute: &str,
    ty: AttrType,
    low: &SqlValue,
    seed: &SqlValue,
    ctid: Option<&str>,
    precision: u32,
) -> Result<SqlValue, UnveilError> {
    let max_v = ty.max_value()?;
    let mut l = low.clone();
    let mut h = seed.clone();
    while l.lt(&h) {
        let m = ty.midpoint_floor(&l, &h)?;
        if !empties_with_value(session, hidden, table, attribute, &m, ctid)? {
            h = m;
        } else {
            l = ty.step(&m, 1)?.min_with(&max_v);
        }
    }
    if ty == AttrType::Numeric {
        h = refine_lower(session, hidden, table, attribute, &h, ty, ctid, precision)?;
    }
    Ok(h)
}

/// Largest value in `[seed, high]` that keeps the oracle non-empty.
#[allow(clippy::too_many_arguments)]
fn search_upper(
    session: &mut Session,
    hidden: &str,
    table: &str,
    attribute: &str,
    ty: AttrType,
    seed: &SqlValue,
    high: &SqlValue,
    ctid: Option<&str>,
    precision: u32,
) -> Result<SqlValue, UnveilError> {
    let min_v = ty.min_value()?;
    let mut l = seed.clone();
    let mut h = high.clone();
    while l.lt(&h) {
        let m = ty.midpoint_ceil(&l, &h)?;
        if !empties_with_value(session, hidden, table, attribute, &m, ctid)? {
            l = m;
        } else {
            h = ty.step(&m, -1)?.max_with(&min_v);
        }
    }
    if ty == AttrType::Numeric {
        l = refine_upper(session, hidden, table, attribute, &l, ty, ctid, precision)?;
    }
    Ok(l)
}

/// Half-interval bisection below the coarse result, floor-rounded to the
/// decimal quantum.
#[allow(clippy::too_many_arguments)]
fn refine_lower(
    session: &mut Session,
    hidden: &str,
    table: &str,
    attribute: &str,
    coarse: &SqlValue,
    ty: AttrType,
    ctid: Option<&str>,
    precision: u32,
) -> Result<SqlValue, UnveilError> {
    let quantum = Decimal::new(1, precision);
    let min_v = ty
        .min_value()?
        .as_decimal()
        .ok_or_else(|| UnveilError::Internal("numeric sentinel".into()))?;
    let max_v = ty
        .max_value()?
        .as_decimal()
        .ok_or_else(|| UnveilError::Internal("numeric sentinel".into()))?;
    let coarse = coarse
        .as_decimal()
        .ok_or_else(|| UnveilError::Internal("numeric coarse bound".into()))?;

    let mut l = (coarse - Decimal::ONE).max(min_v);
    let mut h = coarse;
    while l < h {
        let m = ((l + h) / Decimal::from(2))
            .round_dp_with_strategy(precision, RoundingStrategy::ToNegativeInfinity);
        if !empties_with_value(
            session,
            hidden,
            table,
            attribute,
            &SqlValue::Numeric(m),
            ctid,
        )? {
            h = m;
        } else {
            l = (m + quantum).min(max_v);
        }
    }
    Ok(SqlValue::Numeric(h))
}

/// Half-interval bisection above the coarse result, ceiling-rounded.
#[allow(clippy::too_many_arguments)]
fn refine_upper(
    session: &mut Session,
    hidden: &str,
    table: &str,
    attribute: &str,
    coarse: &SqlValue,
    ty: AttrType,
    ctid: Option<&str>,
    precision: u32,
) -> Result<SqlValue, UnveilError> {
    let quantum = Decimal::new(1, precision);
    let max_v = ty
        .max_value()?
        .as_decimal()
        .ok_or_else(|| UnveilError::Internal("numeric sentinel".into()))?;
    let coarse = coarse
        .as_decimal()
        .ok_or_else(|| UnveilError::Internal("numeric coarse bound".into()))?;

    let mut l = coarse;
    let mut h = (coarse + Decimal::ONE).min(max_v);
    while l < h {
        let m = ((l + h) / Decimal::from(2))
            .round_dp_with_strategy(precision, RoundingStrategy::ToPositiveInfinity);
        if !empties_with_value(
            session,
            hidden,
            table,
            attribute,
            &SqlValue::Numeric(m),
            ctid,
        )? {
            l = m;
        } else {
            h = m - quantum;
        }
    }
    Ok(SqlValue::Numeric(l))
}

// ── Row-level bound extraction ─────────────────────────────────────────────

/// Detect and pin down row-level bounds on an attribute by whole-relation
/// mutation. Used on the SPJ fast path, grouping attributes, and dates.
fn simple_filter_bounds(
    session: &mut Session,
    hidden: &str,
    table: &str,
    attribute: &str,
    ty: AttrType,
    precision: u32,
    bounds: &mut BTreeMap<AttrRef, (SqlValue, SqlValue)>,
) -> Result<Option<Vec<FilterPredicate>>, UnveilError> {
    let min_v = ty.min_value()?;
    let max_v = ty.max_value()?;

    let Some(row) = db::first_row(
        session.client(),
        &format!("SELECT DISTINCT({attribute}) FROM {table};"),
    )?
    else {
        return Ok(None);
    };
    let seed = db::value_at(&row, 0)?;
    if seed.is_null() {
        return Ok(None);
    }

    let has_lower = empties_with_value(session, hidden, table, attribute, &min_v, None)?;
    let has_upper = empties_with_value(session, hidden, table, attribute, &max_v, None)?;
    if !has_lower && !has_upper {
        return Ok(None);
    }

    let mut predicates = Vec::new();
    let mut lower = None;
    let mut upper = None;
    if has_lower {
        let l = search_lower(
            session, hidden, table, attribute, ty, &min_v, &seed, None, precision,
        )?;
        predicates.push(FilterPredicate {
            relation: table.to_string(),
            attribute: attribute.to_string(),
            op: CompareOp::Ge,
            value: l.clone(),
        });
        lower = Some(l);
    }
    if has_upper {
        let u = search_upper(
            session, hidden, table, attribute, ty, &seed, &max_v, None, precision,
        )?;
        predicates.push(FilterPredicate {
            relation: table.to_string(),
            attribute: attribute.to_string(),
            op: CompareOp::Le,
            value: u.clone(),
        });
        upper = Some(u);
    }

    debug!(
        relation = %table, attribute = %attribute,
        lower = ?lower, upper = ?upper, "row-level bounds"
    );
    bounds.insert(
        (table.to_string(), attribute.to_string()),
        (lower.unwrap_or(min_v), upper.unwrap_or(max_v)),
    );
    Ok(Some(predicates))
}

// ── Per-row bound extraction (grouped queries) ─────────────────────────────

/// Search each witness row for a lower bound, pinning the found value into
/// the row as it goes. The per-row assignments commit (restored only at
/// pipeline teardown); the searches themselves roll back.
///
/// The raw search result is then validated: under grouping, the binary
/// search may land on an aggregate artifact, so the column's SUM and AVG
/// join the found value as candidate bounds and the smallest candidate
/// that keeps a single-row instance non-empty wins.
fn rowwise_lower_bound(
    session: &mut Session,
    hidden: &str,
    table: &str,
    attribute: &str,
    ty: AttrType,
    precision: u32,
) -> Result<Option<SqlValue>, UnveilError> {
    let min_v = ty.min_value()?;
    let rows = ctid_values_sorted(session, table, attribute)?;

    let mut found: Option<SqlValue> = None;
    for (ctid, value) in &rows {
        if value.is_null() {
            continue;
        }
        let v = search_lower(
            session,
            hidden,
            table,
            attribute,
            ty,
            &min_v,
            value,
            Some(ctid.as_str()),
            precision,
        )?;
        pin_row_value(session, table, attribute, ctid, &v)?;
        if v == min_v {
            continue;
        }
        found = Some(v);
        break;
    }

    let Some(v) = found.map(|v| v.quantized(precision)) else {
        return Ok(None);
    };

    let mut candidates = vec![v.clone()];
    for agg in ["SUM", "AVG"] {
        if let Some(row) = db::first_row(
            session.client(),
            &format!("SELECT {agg}({table}.{attribute}) FROM {table};"),
        )? {
            let val = db::value_at(&row, 0)?;
            if !val.is_null() {
                candidates.push(val.quantized(precision));
            }
        }
    }
    candidates.sort_by(|a, b| a.compare(b).unwrap_or(std::cmp::Ordering::Equal));

    for cand in &candidates {
        if single_row_accepts(session, hidden, table, attribute, cand)? {
            return Ok(Some(cand.clone()));
        }
    }
    Ok(Some(v))
}

/// Mirror of [`rowwise_lower_bound`] toward the type maximum.
fn rowwise_upper_bound(
    session: &mut Session,
    hidden: &str,
    table: &str,
    attribute: &str,
    ty: AttrType,
    precision: u32,
) -> Result<Option<SqlValue>, UnveilError> {
    let max_v = ty.max_value()?;
    let rows = ctid_values_sorted(session, table, attribute)?;

    let mut found: Option<SqlValue> = None;
    for (ctid, value) in rows.iter().rev() {
        if value.is_null() {
            continue;
        }
        let v = search_upper(
            session,
            hidden,
            table,
            attribute,
            ty,
            value,
            &max_v,
            Some(ctid.as_str()),
            precision,
        )?;
        pin_row_value(session, table, attribute, ctid, &v)?;
        if v == max_v {
            continue;
        }
        found = Some(v);
        break;
    }

    let Some(v) = found.map(|v| v.quantized(precision)) else {
        return Ok(None);
    };

    let mut candidates = vec![v.clone()];
    for agg in ["SUM", "AVG"] {
        if let Some(row) = db::first_row(
            session.client(),
            &format!("SELECT {agg}({table}.{attribute}) FROM {table};"),
        )? {
            let val = db::value_at(&row, 0)?;
            if !val.is_null() {
                candidates.push(val.quantized(precision));
            }
        }
    }
    candidates.sort_by(|a, b| b.compare(a).unwrap_or(std::cmp::Ordering::Equal));

    for cand in &candidates {
        if single_row_accepts(session, hidden, table, attribute, cand)? {
            return Ok(Some(cand.clone()));
        }
    }
    Ok(Some(v))
}

fn ctid_values_sorted(
    session: &mut Session,
    table: &str,
    attribute: &str,
) -> Result<Vec<(String, SqlValue)>, UnveilError> {
    let rows = db::rows(
        session.client(),
        &format!("SELECT ctid::text, {attribute} FROM {table} ORDER BY {attribute};"),
    )?;
    rows.iter()
        .map(|row| {
            let ctid: String = row.get(0);
            let value = db::value_at(row, 1)?;
            Ok((ctid, value))
        })
        .collect()
}

/// Committed per-row assignment of a searched bound.
fn pin_row_value(
    session: &mut Session,
    table: &str,
    attribute: &str,
    ctid: &str,
    value: &SqlValue,
) -> Result<(), UnveilError> {
    db::run(
        session.client(),
        &format!(
            "UPDATE {table} SET {attribute} = {} WHERE ctid = '{ctid}';",
            value.literal()
        ),
    )
}

/// Whether a one-row instance whose only non-NULL value of the attribute is
/// `candidate` keeps the oracle non-empty.
fn single_row_accepts(
    session: &mut Session,
    hidden: &str,
    table: &str,
    attribute: &str,
    candidate: &SqlValue,
) -> Result<bool, UnveilError> {
    db::probe(session.client(), |tx| {
        db::run(tx, &format!("UPDATE {table} SET {attribute} = NULL;"))?;
        let row = db::first_row(
            tx,
            &format!("SELECT ctid::text FROM {table} ORDER BY {attribute} LIMIT 1;"),
        )?;
        let Some(row) = row else {
            return Ok(false);
        };
        let ctid: String = row.get(0);
        db::run(
            tx,
            &format!(
                "UPDATE {table} SET {attribute} = {} WHERE ctid = '{ctid}';",
                candidate.literal()
            ),
        )?;
        Ok(!db::result_is_empty(tx, hidden)?)
    })
}

// ── Deflation ──────────────────────────────────────────────────────────────

/// Collapse each core relation to one row carrying the candidate bound
/// values, then verify the oracle still answers. The one committed step of
/// this stage; an empty oracle afterwards is an invariant violation.
fn deflate(
    session: &mut Session,
    core_relations: &[String],
    candidates: &[BoundCandidate],
    hidden: &str,
) -> Result<(), UnveilError> {
    let mut tx = session.client().transaction()?;
    for table in core_relations {
        db::run(&mut tx, &format!("ALTER TABLE {table} RENAME TO {table}_tmp;"))?;
        db::run(&mut tx, &format!("CREATE TABLE {table} (LIKE {table}_tmp);"))?;
        db::run(
            &mut tx,
            &format!("INSERT INTO {table} (SELECT * FROM {table}_tmp LIMIT 1);"),
        )?;
        db::run(&mut tx, &format!("DROP TABLE {table}_tmp;"))?;

        for cand in candidates.iter().filter(|c| c.relation == *table) {
            db::run(
                &mut tx,
                &format!(
                    "UPDATE {table} SET {} = {};",
                    cand.attribute,
                    cand.seed_value().literal()
                ),
            )?;
        }
    }

    if db::result_is_empty(&mut tx, hidden)? {
        tx.rollback()?;
        warn!("deflated instance no longer satisfies the hidden query");
        return Err(UnveilError::DeflationFailed(
            "hidden query is empty on the deflated instance".into(),
        ));
    }
    tx.commit()?;
    debug!("deflation committed");
    Ok(())
}

// ── Aggregate fingerprinting ───────────────────────────────────────────────

/// Materialize a two-row instance of the candidate's relation where the
/// probed attribute takes `k1` and `k2`, other candidate attributes take
/// NULL-safe defaults, and report whether the oracle empties.
///
/// Runs entirely inside one rollback-terminated transaction; the insert
/// probes nest as savepoints.
fn check_predicate(
    session: &mut Session,
    hidden: &str,
    candidates: &[BoundCandidate],
    cand: &BoundCandidate,
    k1: &SqlValue,
    k2: &SqlValue,
) -> Result<bool, UnveilError> {
    let table = &cand.relation;
    let attribute = &cand.attribute;
    let same_relation: Vec<&BoundCandidate> = candidates
        .iter()
        .filter(|c| c.relation == *table)
        .collect();

    db::probe(session.client(), |tx| {
        db::run(
            tx,
            &format!("UPDATE {table} SET {attribute} = {};", k1.literal()),
        )?;
        db::run(tx, &format!("CREATE TABLE {table}_tmp (LIKE {table});"))?;
        db::run(
            tx,
            &format!("INSERT INTO {table}_tmp SELECT * FROM {table};"),
        )?;

        // Blank out every candidate attribute in the template row...
        for c in &same_relation {
            db::run(
                tx,
                &format!("UPDATE {table}_tmp SET {} = NULL;", c.attribute),
            )?;
        }
        // ...then restore each sibling bound value unless doing so would
        // empty the oracle for the combined instance.
        for c in same_relation.iter().filter(|c| c.attribute != *attribute) {
            db::run(
                tx,
                &format!(
                    "UPDATE {table}_tmp SET {} = {};",
                    c.attribute,
                    c.seed_value().literal()
                ),
            )?;
            let empties = db::probe(tx, |sp| {
                db::run(sp, &format!("INSERT INTO {table} SELECT * FROM {table}_tmp;"))?;
                db::result_is_empty(sp, hidden)
            })?;
            if empties {
                db::run(
                    tx,
                    &format!("UPDATE {table}_tmp SET {} = NULL;", c.attribute),
                )?;
            }
        }

        // The fingerprint itself: second row carries k2.
        db::probe(tx, |sp| {
            db::run(
                sp,
                &format!("UPDATE {table}_tmp SET {attribute} = {};", k2.literal()),
            )?;
            db::run(sp, &format!("INSERT INTO {table} SELECT * FROM {table}_tmp;"))?;
            db::result_is_empty(sp, hidden)
        })
    })
}
