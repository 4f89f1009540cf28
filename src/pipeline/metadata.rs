//! Metadata extraction — stages I and II.
//!
//! Stage I enumerates the database's relations. Stage II runs after the
//! from-clause extractor and records row counts for every relation, type
//! and max-length facts for the core relations' attributes (in ordinal
//! order, so later probing iterates deterministically), and the declared
//! key structure from the sidecar file.

use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::Config;
use crate::context::ExtractionContext;
use crate::db::{self, Session};
use crate::error::UnveilError;
use crate::keys;
use crate::values::AttrType;

/// Stage I: relation inventory.
pub fn run_stage1(
    ctx: &mut ExtractionContext,
    session: &mut Session,
) -> Result<(), UnveilError> {
    debug!("fetching relation names");
    let tables = session.table_names()?;
    info!(relations = tables.len(), "database relations enumerated");
    ctx.set_metadata1(tables);
    Ok(())
}

/// Stage II: sizes, key structure, attribute types.
pub fn run_stage2(
    ctx: &mut ExtractionContext,
    session: &mut Session,
    cfg: &Config,
) -> Result<(), UnveilError> {
    let db_relations = ctx.db_relations()?.to_vec();
    let core_relations = ctx.core_relations()?.to_vec();

    debug!("fetching relation row counts");
    let mut sizes = BTreeMap::new();
    for table in &db_relations {
        let count = db::scalar_i64(session.client(), &format!("SELECT COUNT(*) FROM {table};"))?;
        sizes.insert(table.clone(), count);
    }

    debug!(path = %cfg.key_file.display(), "loading key sidecar");
    let sidecar = keys::load_key_file(&cfg.key_file, &db_relations)?;
    info!(
        cliques = sidecar.cliques.len(),
        keyed_relations = sidecar.primary_keys.len(),
        "key structure loaded"
    );

    let mut attr_types: BTreeMap<String, BTreeMap<String, AttrType>> = BTreeMap::new();
    let mut attr_max_len: BTreeMap<String, BTreeMap<String, i32>> = BTreeMap::new();
    let mut attributes: BTreeMap<String, Vec<String>> = BTreeMap::new();

    let schema = session.schema.clone();
    let catalog = session.dbname.clone();
    for table in &core_relations {
        // Casts strip the information_schema domain types the driver
        // cannot decode directly.
        let rows = session.client().query(
            "SELECT column_name::text, data_type::text, character_maximum_length::int4 \
             FROM information_schema.columns \
             WHERE table_catalog = $1 AND table_schema = $2 AND table_name = $3 \
             ORDER BY ordinal_position",
            &[&catalog, &schema, table],
        )?;
        let types = attr_types.entry(table.clone()).or_default();
        let lens = attr_max_len.entry(table.clone()).or_default();
        let ordered = attributes.entry(table.clone()).or_default();
        for row in &rows {
            let name: String = row.get(0);
            let data_type: String = row.get(1);
            let max_len: Option<i32> = row.get(2);
            types.insert(name.clone(), AttrType::from_pg(&data_type));
            lens.insert(name.clone(), max_len.unwrap_or(0));
            ordered.push(name);
        }
    }

    ctx.set_metadata2(
        sizes,
        sidecar.primary_keys,
        sidecar.cliques,
        attr_types,
        attr_max_len,
        attributes,
    );
    Ok(())
}
