//! Active-relation detection.
//!
//! A relation is *core* iff emptying it empties the hidden query's result.
//! Each relation is probed in its own rollback-terminated transaction:
//! rename it aside, stand up an empty same-schema clone, run the oracle,
//! roll everything back. Sound because the hidden query's FROM is a
//! conjunction of relations.

use tracing::{debug, info};

use crate::context::ExtractionContext;
use crate::db::{self, Session};
use crate::error::UnveilError;

pub fn run(ctx: &mut ExtractionContext, session: &mut Session) -> Result<(), UnveilError> {
    let db_relations = ctx.db_relations()?.to_vec();
    let hidden = ctx.hidden_query.clone();

    let mut core_relations = Vec::new();
    for table in &db_relations {
        let empties_result = db::probe(session.client(), |tx| {
            db::run(tx, &format!("ALTER TABLE {table} RENAME TO {table}_tmp;"))?;
            db::run(tx, &format!("CREATE TABLE {table} (LIKE {table}_tmp);"))?;
            db::result_is_empty(tx, &hidden)
        })?;
        debug!(relation = %table, core = empties_result, "emptiness probe");
        if empties_result {
            core_relations.push(table.clone());
        }
    }

    info!(core = ?core_relations, "core relations identified");
    ctx.set_from_extractor(core_relations);
    Ok(())
}
