//! Shared extraction state.
//!
//! [`ExtractionContext`] is the single mutable object the pipeline threads
//! through its stages. Each stage reads facts recorded by its predecessors
//! and records its own through a `set_*` method that flips the stage's done
//! flag; accessors return [`UnveilError::StageOrder`] when a fact is read
//! before its owning stage has run. Fields are never revised after being
//! set, with one sanctioned exception: the predicate separator rewrites the
//! filter and HAVING lists as its final act.

use std::collections::BTreeMap;

use crate::error::UnveilError;
use crate::values::{AttrType, SqlValue};

/// A `(relation, attribute)` pair. Strings are opaque identifiers.
pub type AttrRef = (String, String);

/// Row-level comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Le,
    Ge,
    Eq,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Le => "<=",
            CompareOp::Ge => ">=",
            CompareOp::Eq => "=",
        }
    }
}

/// Aggregation functions the extractor can identify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl Aggregate {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Aggregate::Sum => "SUM",
            Aggregate::Avg => "AVG",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
            Aggregate::Count => "COUNT",
        }
    }
}

/// Aggregate attached to a HAVING bound. Before the separator runs this may
/// still be one of the two ambiguous flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HavingAggregate {
    Known(Aggregate),
    /// Upper bound that is either `MIN(a) <= b` or a plain filter.
    MinOrFilter,
    /// Lower bound that is either `MAX(a) >= b` or a plain filter.
    MaxOrFilter,
}

impl HavingAggregate {
    pub fn as_sql(&self) -> &'static str {
        match self {
            HavingAggregate::Known(agg) => agg.as_sql(),
            HavingAggregate::MinOrFilter => "MIN",
            HavingAggregate::MaxOrFilter => "MAX",
        }
    }
}

/// Row-level predicate: `relation.attribute op value`.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterPredicate {
    pub relation: String,
    pub attribute: String,
    pub op: CompareOp,
    pub value: SqlValue,
}

/// Group-level predicate: `AGG(relation.attribute) op value`.
#[derive(Debug, Clone, PartialEq)]
pub struct HavingPredicate {
    pub relation: String,
    pub attribute: String,
    pub aggregate: HavingAggregate,
    pub op: CompareOp,
    pub value: SqlValue,
}

/// A bound whose aggregate flavor the separator must still resolve.
#[derive(Debug, Clone, PartialEq)]
pub struct SeparablePredicate {
    pub relation: String,
    pub attribute: String,
    pub kind: HavingAggregate,
    pub lower: Option<SqlValue>,
    pub upper: Option<SqlValue>,
}

/// One output column of the hidden query.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionSlot {
    /// Output column name as reported by the oracle.
    pub name: String,
    /// Recovered expression. The empty string is the COUNT sentinel: no
    /// dependency was found and the observed value was 1.
    pub expression: String,
    /// Attributes whose mutation changed this column.
    pub dependencies: Vec<AttrRef>,
    /// Coefficient vector of the polynomial solve, when one ran.
    pub solution: Vec<f64>,
}

/// The single shared state object of the pipeline.
#[derive(Debug, Default)]
pub struct ExtractionContext {
    /// The hidden query string submitted to the oracle.
    pub hidden_query: String,

    // Metadata-I
    db_relations: Option<Vec<String>>,

    // From extractor
    core_relations: Option<Vec<String>>,

    // Metadata-II
    metadata2_done: bool,
    relation_sizes: BTreeMap<String, i64>,
    primary_keys: BTreeMap<String, Vec<String>>,
    key_cliques: Vec<Vec<AttrRef>>,
    attr_types: BTreeMap<String, BTreeMap<String, AttrType>>,
    attr_max_len: BTreeMap<String, BTreeMap<String, i32>>,
    attributes: BTreeMap<String, Vec<String>>,

    // Sampler
    pub sampling_degraded: bool,

    // Minimizer
    minimizer_done: bool,
    pinned_attributes: BTreeMap<String, Vec<String>>,

    // Join extractor
    join_graph: Option<Vec<Vec<AttrRef>>>,

    // GroupBy extractor
    group_by: Option<Vec<AttrRef>>,

    // Predicate extractor
    predicates_done: bool,
    pub filter_predicates: Vec<FilterPredicate>,
    pub having_predicates: Vec<HavingPredicate>,
    pub separable_predicates: Vec<SeparablePredicate>,
    /// Effective `(lower, upper)` value window per attribute, defaulted to
    /// the type sentinels where a side is unbounded. Consumed by the
    /// projection solve's random assignment.
    pub filter_bounds: BTreeMap<AttrRef, (SqlValue, SqlValue)>,

    // Projection extractor
    projections: Option<Vec<ProjectionSlot>>,

    // Aggregation extractor
    aggregations: Option<Vec<Option<Aggregate>>>,

    // Predicate separator
    separator_done: bool,

    // Order-by recovery (best effort)
    pub has_orderby: bool,
    pub orderby_string: String,
}

impl ExtractionContext {
    pub fn new(hidden_query: impl Into<String>) -> Self {
        ExtractionContext {
            hidden_query: hidden_query.into(),
            ..Default::default()
        }
    }

    // ── Stage setters ──────────────────────────────────────────────────

    pub fn set_metadata1(&mut self, db_relations: Vec<String>) {
        self.db_relations = Some(db_relations);
    }

    pub fn set_from_extractor(&mut self, core_relations: Vec<String>) {
        self.core_relations = Some(core_relations);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_metadata2(
        &mut self,
        relation_sizes: BTreeMap<String, i64>,
        primary_keys: BTreeMap<String, Vec<String>>,
        key_cliques: Vec<Vec<AttrRef>>,
        attr_types: BTreeMap<String, BTreeMap<String, AttrType>>,
        attr_max_len: BTreeMap<String, BTreeMap<String, i32>>,
        attributes: BTreeMap<String, Vec<String>>,
    ) {
        self.metadata2_done = true;
        self.relation_sizes = relation_sizes;
        self.primary_keys = primary_keys;
        self.key_cliques = key_cliques;
        self.attr_types = attr_types;
        self.attr_max_len = attr_max_len;
        self.attributes = attributes;
    }

    pub fn set_minimizer(&mut self, pinned: BTreeMap<String, Vec<String>>) {
        self.minimizer_done = true;
        self.pinned_attributes = pinned;
    }

    pub fn set_join_extractor(&mut self, join_graph: Vec<Vec<AttrRef>>) {
        self.join_graph = Some(join_graph);
    }

    pub fn set_groupby_extractor(&mut self, group_by: Vec<AttrRef>) {
        self.group_by = Some(group_by);
    }

    pub fn set_predicate_extractor(
        &mut self,
        filters: Vec<FilterPredicate>,
        having: Vec<HavingPredicate>,
        separable: Vec<SeparablePredicate>,
        bounds: BTreeMap<AttrRef, (SqlValue, SqlValue)>,
    ) {
        self.predicates_done = true;
        self.filter_predicates = filters;
        self.having_predicates = having;
        self.separable_predicates = separable;
        self.filter_bounds = bounds;
    }

    pub fn set_projection_extractor(&mut self, projections: Vec<ProjectionSlot>) {
        self.projections = Some(projections);
    }

    pub fn set_aggregation_extractor(&mut self, aggregations: Vec<Option<Aggregate>>) {
        self.aggregations = Some(aggregations);
    }

    /// The separator's final rewrite of the predicate lists. The only
    /// sanctioned post-hoc revision in the pipeline.
    pub fn set_predicate_separator(
        &mut self,
        filters: Vec<FilterPredicate>,
        having: Vec<HavingPredicate>,
    ) {
        self.separator_done = true;
        self.filter_predicates = filters;
        self.having_predicates = having;
    }

    // ── Flag-guarded accessors ─────────────────────────────────────────

    pub fn db_relations(&self) -> Result<&[String], UnveilError> {
        self.db_relations
            .as_deref()
            .ok_or_else(|| UnveilError::StageOrder("metadata stage 1 has not run".into()))
    }

    pub fn core_relations(&self) -> Result<&[String], UnveilError> {
        self.core_relations
            .as_deref()
            .ok_or_else(|| UnveilError::StageOrder("from-clause extraction has not run".into()))
    }

    fn require_metadata2(&self) -> Result<(), UnveilError> {
        if self.metadata2_done {
            Ok(())
        } else {
            Err(UnveilError::StageOrder("metadata stage 2 has not run".into()))
        }
    }

    pub fn relation_size(&self, relation: &str) -> Result<i64, UnveilError> {
        self.require_metadata2()?;
        self.relation_sizes.get(relation).copied().ok_or_else(|| {
            UnveilError::Internal(format!("no recorded size for relation {relation}"))
        })
    }

    /// Sizes are refreshed by the sampler once the active relations hold
    /// their sampled contents.
    pub fn update_relation_size(&mut self, relation: &str, size: i64) {
        self.relation_sizes.insert(relation.to_string(), size);
    }

    pub fn primary_key(&self, relation: &str) -> &[String] {
        self.primary_keys
            .get(relation)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_primary_key(&self, relation: &str, attribute: &str) -> bool {
        self.primary_key(relation).iter().any(|a| a == attribute)
    }

    pub fn key_cliques(&self) -> Result<&[Vec<AttrRef>], UnveilError> {
        self.require_metadata2()?;
        Ok(&self.key_cliques)
    }

    /// Whether the attribute participates in any declared key clique.
    pub fn is_key_attribute(&self, relation: &str, attribute: &str) -> bool {
        self.key_cliques.iter().any(|clique| {
            clique
                .iter()
                .any(|(t, a)| t == relation && a == attribute)
        })
    }

    pub fn attr_type(&self, relation: &str, attribute: &str) -> Result<AttrType, UnveilError> {
        self.require_metadata2()?;
        self.attr_types
            .get(relation)
            .and_then(|m| m.get(attribute))
            .copied()
            .ok_or_else(|| {
                UnveilError::Internal(format!("no recorded type for {relation}.{attribute}"))
            })
    }

    pub fn attr_max_len(&self, relation: &str, attribute: &str) -> i32 {
        self.attr_max_len
            .get(relation)
            .and_then(|m| m.get(attribute))
            .copied()
            .unwrap_or(0)
    }

    /// Ordered attribute list of a core relation.
    pub fn attributes(&self, relation: &str) -> Result<&[String], UnveilError> {
        self.require_metadata2()?;
        self.attributes
            .get(relation)
            .map(|v| v.as_slice())
            .ok_or_else(|| {
                UnveilError::Internal(format!("no recorded attributes for {relation}"))
            })
    }

    pub fn pinned_attributes(&self, relation: &str) -> Result<&[String], UnveilError> {
        if !self.minimizer_done {
            return Err(UnveilError::StageOrder("minimizer has not run".into()));
        }
        Ok(self
            .pinned_attributes
            .get(relation)
            .map(|v| v.as_slice())
            .unwrap_or(&[]))
    }

    pub fn join_graph(&self) -> Result<&[Vec<AttrRef>], UnveilError> {
        self.join_graph
            .as_deref()
            .ok_or_else(|| UnveilError::StageOrder("join extraction has not run".into()))
    }

    /// The other members of the join edge containing `(relation, attribute)`.
    pub fn join_partners(&self, relation: &str, attribute: &str) -> Vec<AttrRef> {
        let Some(graph) = self.join_graph.as_deref() else {
            return Vec::new();
        };
        for edge in graph {
            if edge.iter().any(|(t, a)| t == relation && a == attribute) {
                return edge
                    .iter()
                    .filter(|(t, a)| !(t == relation && a == attribute))
                    .cloned()
                    .collect();
            }
        }
        Vec::new()
    }

    pub fn group_by(&self) -> Result<&[AttrRef], UnveilError> {
        self.group_by
            .as_deref()
            .ok_or_else(|| UnveilError::StageOrder("group-by extraction has not run".into()))
    }

    pub fn is_group_by(&self, relation: &str, attribute: &str) -> bool {
        self.group_by
            .as_deref()
            .map(|attrs| attrs.iter().any(|(t, a)| t == relation && a == attribute))
            .unwrap_or(false)
    }

    pub fn predicates_done(&self) -> Result<(), UnveilError> {
        if self.predicates_done {
            Ok(())
        } else {
            Err(UnveilError::StageOrder(
                "predicate extraction has not run".into(),
            ))
        }
    }

    pub fn projections(&self) -> Result<&[ProjectionSlot], UnveilError> {
        self.projections
            .as_deref()
            .ok_or_else(|| UnveilError::StageOrder("projection extraction has not run".into()))
    }

    pub fn aggregations(&self) -> Result<&[Option<Aggregate>], UnveilError> {
        self.aggregations
            .as_deref()
            .ok_or_else(|| UnveilError::StageOrder("aggregation extraction has not run".into()))
    }

    pub fn separator_done(&self) -> bool {
        self.separator_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors_guard_stage_order() {
        let ctx = ExtractionContext::new("select 1;");
        assert!(matches!(
            ctx.db_relations(),
            Err(UnveilError::StageOrder(_))
        ));
        assert!(matches!(
            ctx.core_relations(),
            Err(UnveilError::StageOrder(_))
        ));
        assert!(matches!(ctx.join_graph(), Err(UnveilError::StageOrder(_))));
        assert!(matches!(ctx.group_by(), Err(UnveilError::StageOrder(_))));
        assert!(matches!(
            ctx.projections(),
            Err(UnveilError::StageOrder(_))
        ));
    }

    #[test]
    fn test_setters_unlock_accessors() {
        let mut ctx = ExtractionContext::new("select 1;");
        ctx.set_metadata1(vec!["partsupp".into()]);
        assert_eq!(ctx.db_relations().unwrap(), ["partsupp".to_string()]);

        ctx.set_from_extractor(vec!["partsupp".into()]);
        assert_eq!(ctx.core_relations().unwrap(), ["partsupp".to_string()]);
    }

    #[test]
    fn test_join_partners() {
        let mut ctx = ExtractionContext::new("select 1;");
        ctx.set_join_extractor(vec![vec![
            ("customer".into(), "c_custkey".into()),
            ("orders".into(), "o_custkey".into()),
        ]]);
        let partners = ctx.join_partners("customer", "c_custkey");
        assert_eq!(partners, vec![("orders".into(), "o_custkey".into())]);
        assert!(ctx.join_partners("orders", "o_orderkey").is_empty());
    }

    #[test]
    fn test_predicate_lists_rewritten_by_separator() {
        let mut ctx = ExtractionContext::new("select 1;");
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
        ctx.set_predicate_separator(
            vec![FilterPredicate {
                relation: "lineitem".into(),
                attribute: "l_quantity".into(),
                op: CompareOp::Le,
                value: SqlValue::Int(123),
            }],
            vec![],
        );
        assert!(ctx.having_predicates.is_empty());
        assert_eq!(ctx.filter_predicates.len(), 1);
        assert!(ctx.separator_done());
    }
}
