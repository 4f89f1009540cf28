//! Correlated sampling.
//!
//! The active relations were emptied at backup time; this stage refills
//! them with a small, key-consistent sub-instance drawn from the `_restore`
//! copies. Within each key clique the largest relation is sampled first and
//! the others are filled by key membership against it, so joins survive the
//! downsampling. Clique-free relations are sampled independently.
//!
//! After each attempt the hidden query is re-evaluated; an empty result
//! escalates the sample percentage and retries. When every attempt fails,
//! the stage copies the full contents back and reports a degraded (but
//! usable) state — all subsequent probing simply runs on the full instance.

use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::ExtractionContext;
use crate::db::{self, Session};
use crate::error::UnveilError;

/// Returns `Ok(true)` when sampling produced a non-empty oracle result,
/// `Ok(false)` when the stage fell back to the full instance.
pub fn run(
    ctx: &mut ExtractionContext,
    session: &mut Session,
    cfg: &Config,
) -> Result<bool, UnveilError> {
    let core_relations = ctx.core_relations()?.to_vec();
    let cliques = ctx.key_cliques()?.to_vec();
    let hidden = ctx.hidden_query.clone();

    let mut percent = cfg.sampler.initial_percent;
    for attempt in 0..cfg.sampler.max_attempts {
        debug!(attempt, percent, "sampling attempt");

        let mut sampled: BTreeSet<String> = BTreeSet::new();

        // Clique-correlated fill: base relation by TABLESAMPLE, partners by
        // key membership against the base.
        for clique in &cliques {
            let Some(base_idx) = clique
                .iter()
                .enumerate()
                .max_by_key(|(_, (table, _))| ctx.relation_size(table).unwrap_or(0))
                .map(|(i, _)| i)
            else {
                continue;
            };
            let (base_table, base_key) = &clique[base_idx];

            if core_relations.contains(base_table) {
                let limit = ctx.relation_size(base_table)?;
                db::run(
                    session.client(),
                    &format!(
                        "INSERT INTO {base_table} \
                         SELECT * FROM {base_table}_restore TABLESAMPLE SYSTEM({percent}) \
                         WHERE ({base_key}) NOT IN (SELECT DISTINCT({base_key}) FROM {base_table}) \
                         LIMIT {limit};"
                    ),
                )?;
                sampled.insert(base_table.clone());
                let n = db::scalar_i64(
                    session.client(),
                    &format!("SELECT COUNT(*) FROM {base_table};"),
                )?;
                debug!(relation = %base_table, rows = n, "sampled base relation");
            }

            for (table, key) in clique {
                if table == base_table || !core_relations.contains(table) {
                    continue;
                }
                let limit = ctx.relation_size(table)?;
                db::run(
                    session.client(),
                    &format!(
                        "INSERT INTO {table} \
                         SELECT * FROM {table}_restore \
                         WHERE {key} IN (SELECT DISTINCT({base_key}) FROM {base_table}) \
                         AND {key} NOT IN (SELECT DISTINCT({key}) FROM {table}) \
                         LIMIT {limit};"
                    ),
                )?;
                sampled.insert(table.clone());
                let n = db::scalar_i64(
                    session.client(),
                    &format!("SELECT COUNT(*) FROM {table};"),
                )?;
                debug!(relation = %table, rows = n, "sampled clique partner");
            }
        }

        // Relations no clique touches are sampled independently.
        for table in &core_relations {
            if sampled.contains(table) {
                continue;
            }
            db::run(
                session.client(),
                &format!(
                    "INSERT INTO {table} \
                     SELECT * FROM {table}_restore TABLESAMPLE SYSTEM({percent});"
                ),
            )?;
            let n = db::scalar_i64(
                session.client(),
                &format!("SELECT COUNT(*) FROM {table};"),
            )?;
            debug!(relation = %table, rows = n, "sampled independent relation");
        }

        if !db::result_is_empty(session.client(), &hidden)? {
            for table in &core_relations {
                let size = db::scalar_i64(
                    session.client(),
                    &format!("SELECT COUNT(*) FROM {table};"),
                )?;
                ctx.update_relation_size(table, size);
            }
            info!(attempt, "correlated sample satisfies the hidden query");
            return Ok(true);
        }

        warn!(attempt, percent, "sampling attempt left the oracle empty");
        percent *= cfg.sampler.multiplier;
    }

    // Exhausted: fall back to the full instance.
    warn!("correlated sampling exhausted; continuing on the full instance");
    for table in &core_relations {
        db::run(
            session.client(),
            &format!("DELETE FROM {table};"),
        )?;
        db::run(
            session.client(),
            &format!("INSERT INTO {table} SELECT * FROM {table}_restore;"),
        )?;
    }
    ctx.sampling_degraded = true;
    Ok(false)
}
