//! pg_unveil — hidden-query extraction for PostgreSQL.
//!
//! Given opaque oracle access to a hidden SELECT-Project-Join-GroupBy-
//! Having-OrderBy query over a database whose contents may be freely
//! mutated, pg_unveil reconstructs a semantically equivalent query by
//! systematically probing how the result changes under controlled
//! database states.
//!
//! # Theoretical Basis
//!
//! - **UNMASQUE**: Khan et al., "UNMASQUE: a hidden SQL query extractor",
//!   PVLDB 2020. Non-invasive extraction of SPJ/GroupBy/Having query
//!   clauses from result-set observations alone.
//!
//! The pipeline lives in [`pipeline`]; stages share an
//! [`context::ExtractionContext`] and communicate only through it. The
//! final SQL is rendered by [`builder::query_from_context`].
//!
//! Every probe mutates data inside a rollback-terminated transaction; the
//! only committing steps are the minimizer's reductions and the predicate
//! extractor's deflation, both undone at teardown by the backup/restore
//! bracket. The database at pipeline exit is byte-identical to its state
//! at entry.

pub mod builder;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod keys;
pub mod pipeline;
pub mod values;

pub use builder::query_from_context;
pub use config::Config;
pub use context::ExtractionContext;
pub use error::{UnveilError, UnveilErrorKind};
pub use pipeline::{CancelToken, Pipeline, PipelineResult};
