//! Auth identity transfer.
//!
//! Replaces the target's user and federated-identity records with the
//! source's, preserving credential hashes bit-for-bit. Records travel as JSON
//! and are re-materialized against the target's own row type, so the two
//! instances may run different platform versions with drifted column sets.
//! The target's existing session and token rows are cleared outright (they
//! would otherwise survive the user delete and dangle); every user
//! re-authenticates after migration.
//!
//! Every mutating operation here runs on ONE pinned connection: enforcement
//! suspension is a session property, and a per-operation pool checkout would
//! silently lose it and break identity linkage on insert. If restoring
//! enforcement fails, the connection is discarded rather than returned to the
//! pool.

use deadpool_postgres::{Object, Pool};
use serde_json::json;
use tracing::{info, warn};

use crate::config::SyncOptions;
use crate::error::{Result, SyncError};
use crate::pgtools::SESSION_TABLES;
use crate::sqltext::{is_safe_identifier, quote_ident};

pub const STEP: &str = "sync-auth";

const MAX_LOGGED_ERRORS: usize = 10;

/// Outcome of one table's record import.
#[derive(Debug, Default)]
pub struct ImportCounts {
    pub total: usize,
    pub imported: usize,
    pub errors: Vec<String>,
}

/// Run the auth identity transfer.
pub async fn run(
    source: &Pool,
    target: &Pool,
    options: &SyncOptions,
    dry_run: bool,
) -> Result<serde_json::Value> {
    let users = fetch_records(source, "users").await?;
    let identities = if options.migrate_identities {
        fetch_records(source, "identities").await?
    } else {
        Vec::new()
    };

    info!(
        "source auth store: {} users, {} identities",
        users.len(),
        identities.len()
    );

    if dry_run {
        return Ok(json!({
            "users": users.len(),
            "identities": identities.len(),
            "dry_run": true,
        }));
    }

    let client = target
        .get()
        .await
        .map_err(|e| SyncError::connection(STEP, format!("acquiring auth connection: {e}")))?;

    client
        .batch_execute("SET session_replication_role = 'replica'")
        .await
        .map_err(|e| SyncError::import(STEP, format!("suspending enforcement: {e}")))?;

    let body = import_all(&client, options, &users, &identities).await;
    let restored = client
        .batch_execute("SET session_replication_role = 'origin'")
        .await;

    if let Err(e) = restored {
        warn!("failed to restore enforcement, discarding connection: {}", e);
        let _ = Object::take(client);
    }

    let (user_counts, identity_counts) = body?;

    for err in user_counts.errors.iter().chain(&identity_counts.errors) {
        warn!("auth import error: {}", err);
    }

    Ok(json!({
        "users": user_counts.total,
        "users_imported": user_counts.imported,
        "identities": identity_counts.total,
        "identities_imported": identity_counts.imported,
        "errors": user_counts.errors.len() + identity_counts.errors.len(),
    }))
}

/// Clear existing state, then upsert users and identities, all on the
/// pinned connection.
async fn import_all(
    client: &Object,
    options: &SyncOptions,
    users: &[serde_json::Value],
    identities: &[serde_json::Value],
) -> Result<(ImportCounts, ImportCounts)> {
    for sql in clear_statements() {
        client
            .batch_execute(&sql)
            .await
            .map_err(|e| SyncError::import(STEP, format!("{sql}: {e}")))?;
    }

    let user_counts = upsert_records(client, "users", users).await?;
    let identity_counts = if options.migrate_identities {
        upsert_records(client, "identities", identities).await?
    } else {
        ImportCounts::default()
    };

    Ok((user_counts, identity_counts))
}

/// Delete order for the target's existing auth state. Session and token
/// tables go first, then identities, then users: the replica role keeps
/// ON DELETE cascades from firing, so any session row left behind would
/// reference a user id that no longer exists.
fn clear_statements() -> Vec<String> {
    SESSION_TABLES
        .iter()
        .map(|t| format!("DELETE FROM {t}"))
        .chain([
            "DELETE FROM auth.identities".to_string(),
            "DELETE FROM auth.users".to_string(),
        ])
        .collect()
}

/// Fetch every record of an auth table as JSON.
async fn fetch_records(pool: &Pool, table: &str) -> Result<Vec<serde_json::Value>> {
    let client = pool
        .get()
        .await
        .map_err(|e| SyncError::connection(STEP, e.to_string()))?;

    let sql = format!("SELECT row_to_json(t) FROM auth.{} t", quote_ident(table));
    let rows = client
        .query(&sql, &[])
        .await
        .map_err(|e| SyncError::export(STEP, format!("reading auth.{table}: {e}")))?;

    Ok(rows
        .into_iter()
        .map(|r| r.get::<_, serde_json::Value>(0))
        .collect())
}

/// Upsert records by primary key. Per-record failures are collected, never
/// fatal to the batch.
async fn upsert_records(
    client: &Object,
    table: &str,
    records: &[serde_json::Value],
) -> Result<ImportCounts> {
    let mut counts = ImportCounts {
        total: records.len(),
        ..Default::default()
    };
    if records.is_empty() {
        return Ok(counts);
    }

    let columns = table_columns(client, table).await?;
    let pk = primary_key_columns(client, table).await?;
    if pk.is_empty() {
        return Err(SyncError::import(
            STEP,
            format!("auth.{table} has no primary key"),
        ));
    }

    let sql = build_upsert_sql(table, &columns, &pk);
    let stmt = client
        .prepare(&sql)
        .await
        .map_err(|e| SyncError::import(STEP, format!("preparing auth.{table} upsert: {e}")))?;

    let mut suppressed = 0usize;
    for record in records {
        match client.execute(&stmt, &[record]).await {
            Ok(_) => counts.imported += 1,
            Err(e) => {
                if counts.errors.len() < MAX_LOGGED_ERRORS {
                    let id = record.get("id").map(|v| v.to_string()).unwrap_or_default();
                    counts.errors.push(format!("auth.{table} {id}: {e}"));
                } else {
                    suppressed += 1;
                }
            }
        }
    }
    if suppressed > 0 {
        warn!("{} further auth.{} import errors suppressed", suppressed, table);
        counts
            .errors
            .push(format!("…and {suppressed} more errors"));
    }

    Ok(counts)
}

/// Build the insert-or-update statement for a table from its live column set
/// and primary key. The record parameter is re-typed through the target's row
/// type so credential hashes and metadata pass through byte-identical.
pub fn build_upsert_sql(table: &str, columns: &[String], pk: &[String]) -> String {
    let col_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let pk_list = pk.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");

    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !pk.contains(c))
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();

    let conflict_action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO auth.{table} ({col_list}) \
         SELECT {col_list} FROM json_populate_record(NULL::auth.{table}, $1) \
         ON CONFLICT ({pk_list}) {conflict_action}",
        table = quote_ident(table),
    )
}

/// Live column set of an auth table on the connected instance.
async fn table_columns(client: &Object, table: &str) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = 'auth' AND table_name = $1 \
             ORDER BY ordinal_position",
            &[&table],
        )
        .await
        .map_err(|e| SyncError::import(STEP, format!("introspecting auth.{table}: {e}")))?;

    let columns: Vec<String> = rows
        .into_iter()
        .map(|r| r.get::<_, String>(0))
        .filter(|c| is_safe_identifier(c))
        .collect();

    if columns.is_empty() {
        return Err(SyncError::import(STEP, format!("auth.{table} has no columns")));
    }
    Ok(columns)
}

/// Primary-key columns of an auth table. Introspected rather than hardcoded;
/// the platform changed the identities key across versions.
async fn primary_key_columns(client: &Object, table: &str) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT a.attname \
             FROM pg_index i \
             JOIN pg_class c ON c.oid = i.indrelid \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE n.nspname = 'auth' AND c.relname = $1 AND i.indisprimary \
             ORDER BY array_position(i.indkey, a.attnum)",
            &[&table],
        )
        .await
        .map_err(|e| SyncError::import(STEP, format!("reading auth.{table} primary key: {e}")))?;

    Ok(rows
        .into_iter()
        .map(|r| r.get::<_, String>(0))
        .filter(|c| is_safe_identifier(c))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn upsert_updates_every_non_key_column() {
        let sql = build_upsert_sql(
            "users",
            &cols(&["id", "email", "encrypted_password"]),
            &cols(&["id"]),
        );
        assert!(sql.contains("INSERT INTO auth.\"users\""));
        assert!(sql.contains("ON CONFLICT (\"id\")"));
        assert!(sql.contains("\"email\" = EXCLUDED.\"email\""));
        assert!(sql.contains("\"encrypted_password\" = EXCLUDED.\"encrypted_password\""));
        assert!(!sql.contains("\"id\" = EXCLUDED.\"id\""));
    }

    #[test]
    fn upsert_handles_composite_keys() {
        let sql = build_upsert_sql(
            "identities",
            &cols(&["provider_id", "provider", "identity_data"]),
            &cols(&["provider_id", "provider"]),
        );
        assert!(sql.contains("ON CONFLICT (\"provider_id\", \"provider\")"));
        assert!(sql.contains("\"identity_data\" = EXCLUDED.\"identity_data\""));
    }

    #[test]
    fn upsert_with_only_key_columns_does_nothing_on_conflict() {
        let sql = build_upsert_sql("users", &cols(&["id"]), &cols(&["id"]));
        assert!(sql.ends_with("DO NOTHING"));
    }

    #[test]
    fn records_rematerialize_through_target_row_type() {
        let sql = build_upsert_sql("users", &cols(&["id", "email"]), &cols(&["id"]));
        assert!(sql.contains("json_populate_record(NULL::auth.\"users\", $1)"));
    }

    #[test]
    fn session_state_cleared_before_users() {
        let stmts = clear_statements();
        let users_pos = stmts
            .iter()
            .position(|s| s.ends_with("auth.users"))
            .expect("users delete present");
        assert_eq!(users_pos, stmts.len() - 1, "users must be deleted last");
        for table in SESSION_TABLES {
            let pos = stmts
                .iter()
                .position(|s| s.ends_with(table))
                .unwrap_or_else(|| panic!("{table} not cleared"));
            assert!(pos < users_pos, "{table} cleared after users");
        }
    }
}
