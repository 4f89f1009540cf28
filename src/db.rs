//! Database session layer.
//!
//! The pipeline owns exactly one [`Session`] for the duration of a run and
//! issues every statement through it sequentially. Probes follow the
//! BEGIN → mutate → query → ROLLBACK discipline via [`probe`]; the handful
//! of committing steps (minimizer pinning, deflation) open transactions
//! explicitly and decide commit/rollback per outcome.
//!
//! All helpers are generic over [`GenericClient`] so the same code runs on
//! the top-level connection, inside a transaction, or inside a savepoint.

use postgres::{Client, GenericClient, NoTls, Row};

use crate::config::DbConfig;
use crate::error::UnveilError;
use crate::values::SqlValue;

/// Exclusive connection to the target database.
pub struct Session {
    client: Client,
    /// Schema scope for metadata queries.
    pub schema: String,
    /// Database name, kept for information_schema scoping.
    pub dbname: String,
}

impl Session {
    /// Connect using the configured parameters.
    pub fn connect(cfg: &DbConfig) -> Result<Self, UnveilError> {
        let client = Client::connect(&cfg.connection_string(), NoTls)?;
        Ok(Session {
            client,
            schema: cfg.schema.clone(),
            dbname: cfg.dbname.clone(),
        })
    }

    /// Terminate the connection.
    pub fn close(self) -> Result<(), UnveilError> {
        self.client.close()?;
        Ok(())
    }

    pub fn client(&mut self) -> &mut Client {
        &mut self.client
    }

    /// Base tables visible in the configured schema, sorted for
    /// deterministic iteration order.
    pub fn table_names(&mut self) -> Result<Vec<String>, UnveilError> {
        // Casts strip the information_schema domain types the driver
        // cannot decode directly.
        let rows = self.client.query(
            "SELECT table_name::text FROM information_schema.tables \
             WHERE table_schema = $1 AND table_type = 'BASE TABLE' \
             ORDER BY table_name",
            &[&self.schema],
        )?;
        Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
    }

    /// Output column names of a query, without executing it.
    pub fn column_names(&mut self, query: &str) -> Result<Vec<String>, UnveilError> {
        let stmt = self.client.prepare(query)?;
        Ok(stmt.columns().iter().map(|c| c.name().to_string()).collect())
    }
}

// ── Statement helpers ──────────────────────────────────────────────────────

/// Execute a statement, discarding the affected-row count.
pub fn run<C: GenericClient>(client: &mut C, sql: &str) -> Result<(), UnveilError> {
    client.execute(sql, &[])?;
    Ok(())
}

/// Run a query and collect its rows.
pub fn rows<C: GenericClient>(client: &mut C, sql: &str) -> Result<Vec<Row>, UnveilError> {
    Ok(client.query(sql, &[])?)
}

/// Whether a query yields zero rows.
pub fn result_is_empty<C: GenericClient>(client: &mut C, sql: &str) -> Result<bool, UnveilError> {
    Ok(client.query(sql, &[])?.is_empty())
}

/// First row of a query, if any.
pub fn first_row<C: GenericClient>(client: &mut C, sql: &str) -> Result<Option<Row>, UnveilError> {
    Ok(client.query(sql, &[])?.into_iter().next())
}

/// A single bigint scalar (e.g. `SELECT COUNT(*) ...`).
pub fn scalar_i64<C: GenericClient>(client: &mut C, sql: &str) -> Result<i64, UnveilError> {
    let row = client.query_one(sql, &[])?;
    Ok(row.get(0))
}

/// Snapshot a full result set as typed values for grid diffing.
pub fn grid<C: GenericClient>(
    client: &mut C,
    sql: &str,
) -> Result<Vec<Vec<SqlValue>>, UnveilError> {
    let rows = client.query(sql, &[])?;
    rows.iter()
        .map(|row| {
            (0..row.len())
                .map(|i| value_at(row, i))
                .collect::<Result<Vec<_>, _>>()
        })
        .collect()
}

/// Decode one cell into the [`SqlValue`] domain.
///
/// Tries the concrete Rust types the driver can produce for the supported
/// PostgreSQL types, widest-integer first. NULL decodes to `SqlValue::Null`
/// whichever branch accepts the column's type.
pub fn value_at(row: &Row, idx: usize) -> Result<SqlValue, UnveilError> {
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;

    if let Ok(v) = row.try_get::<_, Option<i64>>(idx) {
        return Ok(v.map(SqlValue::Int).unwrap_or(SqlValue::Null));
    }
    if let Ok(v) = row.try_get::<_, Option<i32>>(idx) {
        return Ok(v.map(|x| SqlValue::Int(x as i64)).unwrap_or(SqlValue::Null));
    }
    if let Ok(v) = row.try_get::<_, Option<i16>>(idx) {
        return Ok(v.map(|x| SqlValue::Int(x as i64)).unwrap_or(SqlValue::Null));
    }
    if let Ok(v) = row.try_get::<_, Option<Decimal>>(idx) {
        return Ok(v.map(SqlValue::Numeric).unwrap_or(SqlValue::Null));
    }
    if let Ok(v) = row.try_get::<_, Option<f64>>(idx) {
        return Ok(match v {
            Some(x) => Decimal::from_f64(x)
                .map(SqlValue::Numeric)
                .unwrap_or(SqlValue::Null),
            None => SqlValue::Null,
        });
    }
    if let Ok(v) = row.try_get::<_, Option<f32>>(idx) {
        return Ok(match v {
            Some(x) => Decimal::from_f32(x)
                .map(SqlValue::Numeric)
                .unwrap_or(SqlValue::Null),
            None => SqlValue::Null,
        });
    }
    if let Ok(v) = row.try_get::<_, Option<chrono::NaiveDate>>(idx) {
        return Ok(v.map(SqlValue::Date).unwrap_or(SqlValue::Null));
    }
    if let Ok(v) = row.try_get::<_, Option<String>>(idx) {
        return Ok(v.map(SqlValue::Text).unwrap_or(SqlValue::Null));
    }
    if let Ok(v) = row.try_get::<_, Option<bool>>(idx) {
        return Ok(v.map(SqlValue::Bool).unwrap_or(SqlValue::Null));
    }
    Err(UnveilError::UnsupportedType(format!(
        "cannot decode column {idx} of type {}",
        row.columns()
            .get(idx)
            .map(|c| c.type_().to_string())
            .unwrap_or_else(|| "<unknown>".into())
    )))
}

// ── Probe discipline ───────────────────────────────────────────────────────

/// Run `body` inside a rollback-terminated transaction.
///
/// On the top-level client this opens a real transaction; on a transaction
/// it opens a savepoint, so probes nest. The rollback happens whether `body`
/// succeeds or fails; the body's result is returned either way.
pub fn probe<C, T, F>(client: &mut C, body: F) -> Result<T, UnveilError>
where
    C: GenericClient,
    F: FnOnce(&mut postgres::Transaction<'_>) -> Result<T, UnveilError>,
{
    let mut tx = client.transaction()?;
    let out = body(&mut tx);
    // A failed body may have aborted the transaction; rollback is valid in
    // both states. A body error takes precedence over a rollback error.
    match tx.rollback() {
        Ok(()) => out,
        Err(e) => out.and(Err(e.into())),
    }
}
