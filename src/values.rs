//! Value domain for probe construction.
//!
//! Every attribute the extractor touches is classified into one of four
//! semantic types: integer, numeric, date, or text. All probe arithmetic —
//! sentinel bounds, type-aware increments, binary-search midpoints, dummy
//! test constants — dispatches on [`AttrType`]. Concrete cell values travel
//! as [`SqlValue`], which also knows how to render itself as a SQL literal
//! for embedding into dynamically-built probe statements.

use std::cmp::Ordering;

use chrono::{Duration, NaiveDate};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::UnveilError;

/// Semantic attribute type. Normalized from `information_schema` type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    Integer,
    Numeric,
    Date,
    Text,
}

// PostgreSQL INT4 domain; NUMERIC probing is bounded to the same interval.
const MIN_INT: i64 = -2_147_483_648;
const MAX_INT: i64 = 2_147_483_647;

fn min_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1, 1, 1).expect("valid date")
}

fn max_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(9999, 12, 31).expect("valid date")
}

impl AttrType {
    /// Normalize an `information_schema.columns.data_type` string.
    pub fn from_pg(data_type: &str) -> Self {
        match data_type.to_ascii_lowercase().as_str() {
            "integer" | "int" | "int4" | "bigint" | "int8" | "smallint" | "int2" => {
                AttrType::Integer
            }
            "numeric" | "decimal" | "real" | "double precision" | "float" | "float4" | "float8" => {
                AttrType::Numeric
            }
            "date" => AttrType::Date,
            _ => AttrType::Text,
        }
    }

    /// Whether range predicates (bounds) make sense for this type.
    pub fn supports_bounds(&self) -> bool {
        !matches!(self, AttrType::Text)
    }

    /// Smallest representable probe value.
    ///
    /// Text has no ordered domain; asking for its sentinel is an error.
    pub fn min_value(&self) -> Result<SqlValue, UnveilError> {
        match self {
            AttrType::Integer => Ok(SqlValue::Int(MIN_INT)),
            AttrType::Numeric => Ok(SqlValue::Numeric(Decimal::from(MIN_INT))),
            AttrType::Date => Ok(SqlValue::Date(min_date())),
            AttrType::Text => Err(UnveilError::UnsupportedType(
                "text has no minimum sentinel".into(),
            )),
        }
    }

    /// Largest representable probe value.
    pub fn max_value(&self) -> Result<SqlValue, UnveilError> {
        match self {
            AttrType::Integer => Ok(SqlValue::Int(MAX_INT)),
            AttrType::Numeric => Ok(SqlValue::Numeric(Decimal::from(MAX_INT))),
            AttrType::Date => Ok(SqlValue::Date(max_date())),
            AttrType::Text => Err(UnveilError::UnsupportedType(
                "text has no maximum sentinel".into(),
            )),
        }
    }

    /// The distinct constant pair used by the join extractor to decouple
    /// partition sides.
    pub fn dummy_pair(&self) -> (SqlValue, SqlValue) {
        match self {
            AttrType::Integer => (SqlValue::Int(2), SqlValue::Int(3)),
            AttrType::Numeric => (
                SqlValue::Numeric(Decimal::from(2)),
                SqlValue::Numeric(Decimal::from(3)),
            ),
            AttrType::Date => (
                SqlValue::Date(NaiveDate::from_ymd_opt(1000, 1, 1).expect("valid date")),
                SqlValue::Date(NaiveDate::from_ymd_opt(1000, 1, 2).expect("valid date")),
            ),
            AttrType::Text => (SqlValue::Text("a".into()), SqlValue::Text("b".into())),
        }
    }

    /// `value + delta` in this type's unit (days for dates).
    ///
    /// For text the delta direction is ignored and the value toggles between
    /// the two dummy constants, matching the group-by probe's needs.
    pub fn step(&self, value: &SqlValue, delta: i64) -> Result<SqlValue, UnveilError> {
        match (self, value) {
            (AttrType::Integer, SqlValue::Int(v)) => {
                Ok(SqlValue::Int(v.saturating_add(delta).clamp(MIN_INT, MAX_INT)))
            }
            (AttrType::Integer, SqlValue::Numeric(d)) => {
                let v = d.to_i64().unwrap_or(0);
                Ok(SqlValue::Int(v.saturating_add(delta).clamp(MIN_INT, MAX_INT)))
            }
            (AttrType::Numeric, v) => {
                let d = v.as_decimal().ok_or_else(|| {
                    UnveilError::UnsupportedType(format!("cannot step non-numeric value {v:?}"))
                })?;
                Ok(SqlValue::Numeric(d + Decimal::from(delta)))
            }
            (AttrType::Date, SqlValue::Date(d)) => Ok(SqlValue::Date(
                d.checked_add_signed(Duration::days(delta)).unwrap_or(*d),
            )),
            (AttrType::Text, SqlValue::Text(s)) => {
                if s == "a" {
                    Ok(SqlValue::Text("b".into()))
                } else {
                    Ok(SqlValue::Text("a".into()))
                }
            }
            (ty, v) => Err(UnveilError::UnsupportedType(format!(
                "cannot step {v:?} as {ty:?}"
            ))),
        }
    }

    /// Floor midpoint of `[l, h]` at integer (or day) granularity.
    pub fn midpoint_floor(&self, l: &SqlValue, h: &SqlValue) -> Result<SqlValue, UnveilError> {
        match self {
            AttrType::Integer | AttrType::Numeric => {
                let (a, b) = decimal_pair(l, h)?;
                let mid = ((a + b) / Decimal::from(2)).floor();
                Ok(self.wrap_decimal(mid))
            }
            AttrType::Date => {
                let (a, b) = date_pair(l, h)?;
                let half = (b - a).num_days().div_euclid(2);
                Ok(SqlValue::Date(a + Duration::days(half)))
            }
            AttrType::Text => Err(UnveilError::UnsupportedType(
                "text has no midpoint".into(),
            )),
        }
    }

    /// Ceiling midpoint of `[l, h]` at integer (or day) granularity.
    pub fn midpoint_ceil(&self, l: &SqlValue, h: &SqlValue) -> Result<SqlValue, UnveilError> {
        match self {
            AttrType::Integer | AttrType::Numeric => {
                let (a, b) = decimal_pair(l, h)?;
                let mid = ((a + b) / Decimal::from(2)).ceil();
                Ok(self.wrap_decimal(mid))
            }
            AttrType::Date => {
                let (a, b) = date_pair(l, h)?;
                let days = (b - a).num_days();
                let half = days.div_euclid(2) + if days.rem_euclid(2) != 0 { 1 } else { 0 };
                Ok(SqlValue::Date(a + Duration::days(half)))
            }
            AttrType::Text => Err(UnveilError::UnsupportedType(
                "text has no midpoint".into(),
            )),
        }
    }

    /// Re-wrap a decimal into the canonical variant for this type.
    pub fn wrap_decimal(&self, d: Decimal) -> SqlValue {
        match self {
            AttrType::Integer => SqlValue::Int(d.to_i64().unwrap_or(0)),
            _ => SqlValue::Numeric(d),
        }
    }
}

fn decimal_pair(l: &SqlValue, h: &SqlValue) -> Result<(Decimal, Decimal), UnveilError> {
    match (l.as_decimal(), h.as_decimal()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(UnveilError::UnsupportedType(format!(
            "expected numeric pair, got {l:?} and {h:?}"
        ))),
    }
}

fn date_pair(l: &SqlValue, h: &SqlValue) -> Result<(NaiveDate, NaiveDate), UnveilError> {
    match (l, h) {
        (SqlValue::Date(a), SqlValue::Date(b)) => Ok((*a, *b)),
        _ => Err(UnveilError::UnsupportedType(format!(
            "expected date pair, got {l:?} and {h:?}"
        ))),
    }
}

/// A single cell value observed from, or destined for, the database.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Int(i64),
    Numeric(Decimal),
    Date(NaiveDate),
    Text(String),
    Bool(bool),
    Null,
}

impl SqlValue {
    /// Render as a SQL literal, quoting where the type requires it.
    pub fn literal(&self) -> String {
        match self {
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Numeric(d) => d.to_string(),
            SqlValue::Date(d) => format!("'{d}'"),
            SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            SqlValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            SqlValue::Null => "NULL".to_string(),
        }
    }

    /// Numeric view across the Int/Numeric variants.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            SqlValue::Int(v) => Some(Decimal::from(*v)),
            SqlValue::Numeric(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Int(v) => Some(*v as f64),
            SqlValue::Numeric(d) => d.to_f64(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Quantize numeric values to `dp` decimal places; other variants pass
    /// through unchanged.
    pub fn quantized(&self, dp: u32) -> SqlValue {
        match self {
            SqlValue::Numeric(d) => {
                SqlValue::Numeric(d.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero))
            }
            other => other.clone(),
        }
    }

    /// Total order within comparable domains (numeric with numeric, date
    /// with date, text with text). Cross-domain comparisons yield `None`.
    pub fn compare(&self, other: &SqlValue) -> Option<Ordering> {
        match (self, other) {
            (SqlValue::Date(a), SqlValue::Date(b)) => Some(a.cmp(b)),
            (SqlValue::Text(a), SqlValue::Text(b)) => Some(a.cmp(b)),
            (SqlValue::Bool(a), SqlValue::Bool(b)) => Some(a.cmp(b)),
            _ => match (self.as_decimal(), other.as_decimal()) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => None,
            },
        }
    }

    pub fn lt(&self, other: &SqlValue) -> bool {
        matches!(self.compare(other), Some(Ordering::Less))
    }

    /// The smaller of two comparable values; `self` when incomparable.
    pub fn min_with(&self, other: &SqlValue) -> SqlValue {
        match self.compare(other) {
            Some(Ordering::Greater) => other.clone(),
            _ => self.clone(),
        }
    }

    /// The larger of two comparable values; `self` when incomparable.
    pub fn max_with(&self, other: &SqlValue) -> SqlValue {
        match self.compare(other) {
            Some(Ordering::Less) => other.clone(),
            _ => self.clone(),
        }
    }
}

impl PartialEq for SqlValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SqlValue::Null, SqlValue::Null) => true,
            (SqlValue::Date(a), SqlValue::Date(b)) => a == b,
            (SqlValue::Text(a), SqlValue::Text(b)) => a == b,
            (SqlValue::Bool(a), SqlValue::Bool(b)) => a == b,
            _ => match (self.as_decimal(), other.as_decimal()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_normalization() {
        assert_eq!(AttrType::from_pg("integer"), AttrType::Integer);
        assert_eq!(AttrType::from_pg("bigint"), AttrType::Integer);
        assert_eq!(AttrType::from_pg("numeric"), AttrType::Numeric);
        assert_eq!(AttrType::from_pg("double precision"), AttrType::Numeric);
        assert_eq!(AttrType::from_pg("date"), AttrType::Date);
        assert_eq!(AttrType::from_pg("character varying"), AttrType::Text);
        assert_eq!(AttrType::from_pg("text"), AttrType::Text);
    }

    #[test]
    fn test_literals() {
        assert_eq!(SqlValue::Int(-7).literal(), "-7");
        assert_eq!(
            SqlValue::Numeric(Decimal::new(12345, 2)).literal(),
            "123.45"
        );
        assert_eq!(
            SqlValue::Date(NaiveDate::from_ymd_opt(1995, 10, 13).unwrap()).literal(),
            "'1995-10-13'"
        );
        assert_eq!(SqlValue::Text("o'brien".into()).literal(), "'o''brien'");
        assert_eq!(SqlValue::Null.literal(), "NULL");
    }

    #[test]
    fn test_step_date() {
        let ty = AttrType::Date;
        let d = SqlValue::Date(NaiveDate::from_ymd_opt(1995, 12, 31).unwrap());
        let next = ty.step(&d, 1).unwrap();
        assert_eq!(
            next,
            SqlValue::Date(NaiveDate::from_ymd_opt(1996, 1, 1).unwrap())
        );
        let prev = ty.step(&d, -1).unwrap();
        assert_eq!(
            prev,
            SqlValue::Date(NaiveDate::from_ymd_opt(1995, 12, 30).unwrap())
        );
    }

    #[test]
    fn test_step_text_toggles() {
        let ty = AttrType::Text;
        assert_eq!(
            ty.step(&SqlValue::Text("a".into()), 1).unwrap(),
            SqlValue::Text("b".into())
        );
        assert_eq!(
            ty.step(&SqlValue::Text("x".into()), -1).unwrap(),
            SqlValue::Text("a".into())
        );
    }

    #[test]
    fn test_midpoints() {
        let ty = AttrType::Integer;
        let m = ty
            .midpoint_floor(&SqlValue::Int(1), &SqlValue::Int(4))
            .unwrap();
        assert_eq!(m, SqlValue::Int(2));
        let m = ty
            .midpoint_ceil(&SqlValue::Int(1), &SqlValue::Int(4))
            .unwrap();
        assert_eq!(m, SqlValue::Int(3));

        // Negative interval floors toward -inf.
        let m = ty
            .midpoint_floor(&SqlValue::Int(-5), &SqlValue::Int(0))
            .unwrap();
        assert_eq!(m, SqlValue::Int(-3));
    }

    #[test]
    fn test_midpoint_dates() {
        let ty = AttrType::Date;
        let a = SqlValue::Date(NaiveDate::from_ymd_opt(2000, 1, 1).unwrap());
        let b = SqlValue::Date(NaiveDate::from_ymd_opt(2000, 1, 10).unwrap());
        assert_eq!(
            ty.midpoint_floor(&a, &b).unwrap(),
            SqlValue::Date(NaiveDate::from_ymd_opt(2000, 1, 5).unwrap())
        );
        assert_eq!(
            ty.midpoint_ceil(&a, &b).unwrap(),
            SqlValue::Date(NaiveDate::from_ymd_opt(2000, 1, 6).unwrap())
        );
    }

    #[test]
    fn test_cross_variant_equality() {
        assert_eq!(SqlValue::Int(3), SqlValue::Numeric(Decimal::from(3)));
        assert_ne!(SqlValue::Int(3), SqlValue::Text("3".into()));
        assert_eq!(SqlValue::Null, SqlValue::Null);
    }

    #[test]
    fn test_sentinels() {
        assert_eq!(
            AttrType::Integer.min_value().unwrap(),
            SqlValue::Int(-2147483648)
        );
        assert_eq!(
            AttrType::Integer.max_value().unwrap(),
            SqlValue::Int(2147483647)
        );
        assert!(AttrType::Text.min_value().is_err());
    }

    #[test]
    fn test_min_max_with() {
        let a = SqlValue::Int(3);
        let b = SqlValue::Numeric(Decimal::from(5));
        assert_eq!(a.min_with(&b), SqlValue::Int(3));
        assert_eq!(a.max_with(&b), SqlValue::Numeric(Decimal::from(5)));
    }
}
