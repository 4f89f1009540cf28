//! Error types for pg_unveil.
//!
//! All errors that can occur during an extraction run are represented by
//! [`UnveilError`] and propagated via `Result<T, UnveilError>` throughout
//! the codebase.
//!
//! # Error Classification
//!
//! Errors are classified into three categories that determine how the
//! pipeline reacts:
//! - **Config** — connection refused, missing key file, a type the chosen
//!   operation cannot handle. Surfaced to the caller; restore still runs.
//! - **Algorithmic** — the sampler exhausted its attempts, the projection
//!   solve stalled, the replication-factor search hit its cap. Each is
//!   recoverable at the stage that raised it; the stage records a degraded
//!   result and the pipeline continues.
//! - **Invariant** — a sanity check failed or a stage ran before its
//!   prerequisites. Indicates a bug or a query outside the supported
//!   fragment. Fatal; raised to the caller.

use std::fmt;

/// Primary error type for the extractor.
#[derive(Debug, thiserror::Error)]
pub enum UnveilError {
    // ── Configuration errors — fatal, surfaced to the caller ─────────────
    /// The SQL driver reported an error (connection or statement level).
    #[error("database error: {0}")]
    Database(#[from] postgres::Error),

    /// The primary/foreign-key sidecar file could not be read or parsed.
    #[error("key file error: {0}")]
    KeyFile(String),

    /// An operation was requested on a type that cannot support it.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    /// Invalid run configuration (missing query, bad precision, ...).
    #[error("configuration error: {0}")]
    Config(String),

    // ── Algorithmic failures — recovered by the owning stage ─────────────
    /// The correlated sampler never produced a non-empty oracle result.
    #[error("sampling exhausted: {0}")]
    SamplingExhausted(String),

    /// The projection solve's coefficient matrix stopped gaining rank.
    #[error("rank stall while solving projection {0}")]
    RankStall(String),

    /// Every candidate replication factor fell in the forbidden set.
    #[error("replication factor search exhausted for {0}")]
    ForbiddenAlphaExhausted(String),

    // ── Invariant violations — fatal ─────────────────────────────────────
    /// The deflated instance no longer satisfies the hidden query.
    #[error("deflation sanity check failed: {0}")]
    DeflationFailed(String),

    /// A stage was entered before its prerequisites completed.
    #[error("stage ordering violation: {0}")]
    StageOrder(String),

    /// The run was cancelled at a stage boundary.
    #[error("extraction cancelled")]
    Cancelled,

    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Classification of error severity/kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnveilErrorKind {
    Config,
    Algorithmic,
    Invariant,
}

impl fmt::Display for UnveilErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnveilErrorKind::Config => write!(f, "CONFIG"),
            UnveilErrorKind::Algorithmic => write!(f, "ALGORITHMIC"),
            UnveilErrorKind::Invariant => write!(f, "INVARIANT"),
        }
    }
}

impl UnveilError {
    /// Classify the error for logging and propagation decisions.
    pub fn kind(&self) -> UnveilErrorKind {
        match self {
            UnveilError::Database(_)
            | UnveilError::KeyFile(_)
            | UnveilError::UnsupportedType(_)
            | UnveilError::Config(_) => UnveilErrorKind::Config,

            UnveilError::SamplingExhausted(_)
            | UnveilError::RankStall(_)
            | UnveilError::ForbiddenAlphaExhausted(_) => UnveilErrorKind::Algorithmic,

            UnveilError::DeflationFailed(_)
            | UnveilError::StageOrder(_)
            | UnveilError::Cancelled
            | UnveilError::Internal(_) => UnveilErrorKind::Invariant,
        }
    }

    /// Whether the owning stage may recover locally by flagging a degraded
    /// result instead of aborting the pipeline.
    pub fn is_recoverable(&self) -> bool {
        self.kind() == UnveilErrorKind::Algorithmic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            UnveilError::KeyFile("missing".into()).kind(),
            UnveilErrorKind::Config
        );
        assert_eq!(
            UnveilError::SamplingExhausted("x".into()).kind(),
            UnveilErrorKind::Algorithmic
        );
        assert_eq!(
            UnveilError::DeflationFailed("x".into()).kind(),
            UnveilErrorKind::Invariant
        );
        assert_eq!(
            UnveilError::StageOrder("x".into()).kind(),
            UnveilErrorKind::Invariant
        );
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(UnveilError::RankStall("revenue".into()).is_recoverable());
        assert!(UnveilError::ForbiddenAlphaExhausted("x".into()).is_recoverable());
        assert!(!UnveilError::Config("x".into()).is_recoverable());
        assert!(!UnveilError::Internal("x".into()).is_recoverable());
        assert!(!UnveilError::Cancelled.is_recoverable());
    }
}
