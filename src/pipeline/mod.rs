//! The extraction pipeline.
//!
//! A strict linear composition of stages sharing one
//! [`ExtractionContext`]: metadata, active-relation detection, backup,
//! correlated sampling, minimization, join-graph recovery, group-by
//! detection, predicate extraction, projection recovery, aggregation
//! identification, predicate separation, and best-effort order-by
//! recovery. Stages run strictly sequentially over one exclusively-owned
//! connection; each depends on the exact database state its predecessors
//! leave behind.
//!
//! [`Pipeline::execute`] guarantees teardown: whatever a stage returns,
//! the active relations are restored from their backups before the run
//! result is surfaced. Cancellation is honored at stage boundaries only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::Config;
use crate::context::ExtractionContext;
use crate::db::{self, Session};
use crate::error::UnveilError;

pub mod aggregates;
pub mod from_clause;
pub mod group_by;
pub mod joins;
pub mod metadata;
pub mod minimizer;
pub mod order_by;
pub mod predicates;
pub mod projection;
pub mod sampler;
pub mod separator;
pub mod solver;

/// Cooperative cancellation, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Wall-clock of one completed stage.
#[derive(Debug, Clone)]
pub struct StageTiming {
    pub name: &'static str,
    pub elapsed: Duration,
}

/// Outcome of a completed run.
pub struct PipelineResult {
    pub ctx: ExtractionContext,
    pub timings: Vec<StageTiming>,
}

/// Owns a run: the context, the stage sequence, and the backup/restore
/// bracket around them.
pub struct Pipeline<'a> {
    session: &'a mut Session,
    cfg: &'a Config,
    ctx: ExtractionContext,
    cancel: CancelToken,
    timings: Vec<StageTiming>,
    backed_up: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        session: &'a mut Session,
        cfg: &'a Config,
        hidden_query: impl Into<String>,
        cancel: CancelToken,
    ) -> Self {
        Pipeline {
            session,
            cfg,
            ctx: ExtractionContext::new(hidden_query),
            cancel,
            timings: Vec::new(),
            backed_up: false,
        }
    }

    /// Run all stages. The restore bracket runs whatever the stages
    /// return; a stage error takes precedence over a restore error.
    pub fn execute(mut self) -> Result<PipelineResult, UnveilError> {
        let run_result = self.run_stages();
        let restore_result = self.restore_tables();

        match (run_result, restore_result) {
            (Ok(()), Ok(())) => Ok(PipelineResult {
                ctx: self.ctx,
                timings: self.timings,
            }),
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(e),
        }
    }

    fn run_stages(&mut self) -> Result<(), UnveilError> {
        self.stage("metadata-1", |p| {
            metadata::run_stage1(&mut p.ctx, p.session)
        })?;
        self.stage("from-clause", |p| from_clause::run(&mut p.ctx, p.session))?;
        self.stage("metadata-2", |p| {
            metadata::run_stage2(&mut p.ctx, p.session, p.cfg)
        })?;
        self.stage("backup", |p| p.backup_tables())?;
        self.stage("sampler", |p| {
            if !sampler::run(&mut p.ctx, p.session, p.cfg)? {
                warn!("correlated sampling failed; using the full instance");
            }
            Ok(())
        })?;
        self.stage("minimizer", |p| minimizer::run(&mut p.ctx, p.session))?;
        self.stage("join-graph", |p| joins::run(&mut p.ctx, p.session))?;
        self.stage("group-by", |p| group_by::run(&mut p.ctx, p.session))?;
        self.stage("predicates", |p| {
            predicates::run(&mut p.ctx, p.session, p.cfg)
        })?;
        self.stage("projection", |p| {
            projection::run(&mut p.ctx, p.session, p.cfg)
        })?;
        self.stage("aggregation", |p| {
            aggregates::run(&mut p.ctx, p.session, p.cfg)
        })?;
        self.stage("separator", |p| separator::run(&mut p.ctx, p.session))?;
        if self.cfg.extraction.recover_order_by {
            self.stage("order-by", |p| order_by::run(&mut p.ctx, p.session))?;
        }
        Ok(())
    }

    fn stage(
        &mut self,
        name: &'static str,
        body: impl FnOnce(&mut Self) -> Result<(), UnveilError>,
    ) -> Result<(), UnveilError> {
        if self.cancel.is_cancelled() {
            return Err(UnveilError::Cancelled);
        }
        info!(stage = name, "starting");
        let start = Instant::now();
        let out = body(self);
        let elapsed = start.elapsed();
        self.timings.push(StageTiming { name, elapsed });
        match &out {
            Ok(()) => info!(stage = name, elapsed_ms = elapsed.as_millis() as u64, "finished"),
            Err(e) => error!(stage = name, kind = %e.kind(), error = %e, "failed"),
        }
        out
    }

    /// Rename each active relation aside and stand up an empty same-schema
    /// clone for the sampler to fill.
    fn backup_tables(&mut self) -> Result<(), UnveilError> {
        let core_relations = self.ctx.core_relations()?.to_vec();
        let mut tx = self.session.client().transaction()?;
        for table in &core_relations {
            db::run(&mut tx, &format!("ALTER TABLE {table} RENAME TO {table}_restore;"))?;
            db::run(&mut tx, &format!("CREATE TABLE {table} (LIKE {table}_restore);"))?;
        }
        tx.commit()?;
        self.backed_up = true;
        info!(relations = core_relations.len(), "active relations backed up");
        Ok(())
    }

    /// Put every active relation back exactly as it was, in one
    /// transaction. After a sampler fallback the active relations already
    /// hold the full contents, so restoration copies instead of renaming.
    fn restore_tables(&mut self) -> Result<(), UnveilError> {
        if !self.backed_up {
            return Ok(());
        }
        let core_relations = self.ctx.core_relations()?.to_vec();
        info!("restoring active relations");

        let copy_back = self.ctx.sampling_degraded;
        let mut tx = self.session.client().transaction()?;
        for table in &core_relations {
            db::run(&mut tx, &format!("DROP TABLE {table};"))?;
            if copy_back {
                db::run(&mut tx, &format!("CREATE TABLE {table} (LIKE {table}_restore);"))?;
                db::run(
                    &mut tx,
                    &format!("INSERT INTO {table} SELECT * FROM {table}_restore;"),
                )?;
                db::run(&mut tx, &format!("DROP TABLE {table}_restore;"))?;
            } else {
                db::run(&mut tx, &format!("ALTER TABLE {table}_restore RENAME TO {table};"))?;
            }
        }
        tx.commit()?;
        self.backed_up = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
