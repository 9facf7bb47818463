//! Data transfer and sequence reconciliation.
//!
//! The reload is a full replacement: export the source's rows, suspend
//! trigger/constraint enforcement on the target, truncate everything in the
//! included schemas, replay the dump, then restore enforcement and bring
//! every sequence in line with the reloaded data.
//!
//! Enforcement suspension is a session property. The truncation phase holds
//! one pinned connection with the suspension active, and the psql apply
//! session sets the same suspension via a leading command; restoration runs
//! in a guaranteed cleanup phase, and a connection whose restore failed is
//! discarded instead of being returned to the pool.

use deadpool_postgres::{Object, Pool};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::SyncOptions;
use crate::error::{Result, SyncError};
use crate::pgtools::{self, SESSION_TABLES};
use crate::sqltext::{is_safe_identifier, quote_qualified};
use crate::tempfiles::TempStore;

pub const STEP: &str = "sync-data";
pub const SEQUENCES_STEP: &str = "reset-sequences";

const SUSPEND_SQL: &str = "SET session_replication_role = 'replica'";
const RESTORE_SQL: &str = "SET session_replication_role = 'origin'";

/// One row-count comparison between source and target.
#[derive(Debug, Clone)]
pub struct CountMismatch {
    pub table: String,
    pub source_rows: i64,
    pub target_rows: i64,
}

/// A sequence owned by a table column, derived fresh from the target catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceDescriptor {
    pub table_schema: String,
    pub table: String,
    pub column: String,
    pub sequence_schema: String,
    pub sequence: String,
}

/// Run the data transfer.
pub async fn run(
    source_db_url: &str,
    target_db_url: &str,
    source: &Pool,
    target: &Pool,
    options: &SyncOptions,
    temp: &TempStore,
    dry_run: bool,
) -> Result<serde_json::Value> {
    let tables = list_tables(STEP, target, options).await?;

    if dry_run {
        let source_tables = list_tables(STEP, source, options).await?;
        info!(
            "dry run: would replace {} target tables with {} source tables",
            tables.len(),
            source_tables.len()
        );
        return Ok(json!({
            "dry_run": true,
            "source_tables": source_tables.len(),
            "target_tables": tables.len(),
        }));
    }

    // Export first: a dump failure must abort before anything destructive.
    let dump_path = temp.create("data.sql")?;
    pgtools::dump_data(
        STEP,
        source_db_url,
        &options.schemas,
        &options.exclude_tables,
        options.exclude_sessions,
        &dump_path,
    )
    .await?;

    let client = target
        .get()
        .await
        .map_err(|e| SyncError::connection(STEP, format!("acquiring reload connection: {e}")))?;

    client
        .batch_execute(SUSPEND_SQL)
        .await
        .map_err(|e| SyncError::import(STEP, format!("suspending enforcement: {e}")))?;

    // Truncate and reload under suspension; restore runs regardless of the
    // body's outcome before the result is surfaced.
    let body = reload(target_db_url, &client, &tables, &dump_path).await;
    let restored = client.batch_execute(RESTORE_SQL).await;

    if let Err(e) = restored {
        // The session is permanently weakened; keep it out of the pool.
        warn!("failed to restore enforcement, discarding connection: {}", e);
        let _ = Object::take(client);
    }

    let outcome = body?;

    let (mismatches, count_failures) = if options.verify_counts {
        verify_counts(source, target, &tables).await
    } else {
        (Vec::new(), Vec::new())
    };

    for m in &mismatches {
        warn!(
            "row count mismatch for {}: source={} target={}",
            m.table, m.source_rows, m.target_rows
        );
    }
    for f in &count_failures {
        warn!("row count check failed for {}", f);
    }

    Ok(json!({
        "tables_truncated": tables.len(),
        "apply_errors": outcome.errors,
        "apply_errors_sampled": outcome.sampled,
        "row_count_mismatches": mismatches
            .iter()
            .map(|m| json!({
                "table": m.table,
                "source_rows": m.source_rows,
                "target_rows": m.target_rows,
            }))
            .collect::<Vec<_>>(),
        "count_check_failures": count_failures,
    }))
}

/// Destructive replacement: cascade-truncate every included table, then
/// replay the dump on a psql session that shares the suspension setting.
async fn reload(
    target_db_url: &str,
    client: &Object,
    tables: &[(String, String)],
    dump_path: &std::path::Path,
) -> Result<pgtools::ApplyOutcome> {
    if !tables.is_empty() {
        let list = tables
            .iter()
            .map(|(s, t)| quote_qualified(s, t))
            .collect::<Vec<_>>()
            .join(", ");
        info!("truncating {} tables", tables.len());
        client
            .batch_execute(&format!("TRUNCATE TABLE {list} CASCADE"))
            .await
            .map_err(|e| SyncError::import(STEP, format!("truncating target tables: {e}")))?;
    }

    pgtools::apply_script(STEP, target_db_url, dump_path, &[SUSPEND_SQL]).await
}

/// Enumerate tables in the included schemas, minus exclusions and session
/// tables. Only identifier-safe names are eligible for dynamic statements.
async fn list_tables(
    step: &str,
    pool: &Pool,
    options: &SyncOptions,
) -> Result<Vec<(String, String)>> {
    let client = pool
        .get()
        .await
        .map_err(|e| SyncError::connection(step, e.to_string()))?;

    let rows = client
        .query(
            "SELECT schemaname, tablename FROM pg_tables \
             WHERE schemaname = ANY($1) ORDER BY schemaname, tablename",
            &[&options.schemas],
        )
        .await
        .map_err(|e| SyncError::import(step, format!("listing tables: {e}")))?;

    let mut tables = Vec::with_capacity(rows.len());
    for row in rows {
        let schema: String = row.get(0);
        let name: String = row.get(1);
        let qualified = format!("{schema}.{name}");

        if options.exclude_tables.contains(&qualified) || SESSION_TABLES.contains(&qualified.as_str())
        {
            continue;
        }
        if !is_safe_identifier(&schema) || !is_safe_identifier(&name) {
            warn!("skipping table with unsafe name: {:?}", qualified);
            continue;
        }
        tables.push((schema, name));
    }
    Ok(tables)
}

/// Outcome of one table's count comparison. A failed count query on either
/// side is its own outcome; it never masquerades as a match.
enum CountCheck {
    Match(i64),
    Mismatch(CountMismatch),
    Failed(String),
}

fn compare_counts(table: &str, source: Result<i64>, target: Result<i64>) -> CountCheck {
    match (source, target) {
        (Ok(s), Ok(t)) if s == t => CountCheck::Match(s),
        (Ok(s), Ok(t)) => CountCheck::Mismatch(CountMismatch {
            table: table.to_string(),
            source_rows: s,
            target_rows: t,
        }),
        (source, target) => {
            let mut parts = Vec::new();
            if let Err(e) = &source {
                parts.push(format!("source: {e}"));
            }
            if let Err(e) = &target {
                parts.push(format!("target: {e}"));
            }
            CountCheck::Failed(format!("{table}: {}", parts.join("; ")))
        }
    }
}

/// Compare per-table row counts between source and target. Returns the
/// mismatches and, separately, the tables whose counts could not be read.
async fn verify_counts(
    source: &Pool,
    target: &Pool,
    tables: &[(String, String)],
) -> (Vec<CountMismatch>, Vec<String>) {
    let mut mismatches = Vec::new();
    let mut failures = Vec::new();
    for (schema, name) in tables {
        let qualified = quote_qualified(schema, name);
        let table = format!("{schema}.{name}");
        let source_rows = count_rows(source, &qualified).await;
        let target_rows = count_rows(target, &qualified).await;
        match compare_counts(&table, source_rows, target_rows) {
            CountCheck::Match(n) => debug!("{}: {} rows (match)", table, n),
            CountCheck::Mismatch(m) => mismatches.push(m),
            CountCheck::Failed(f) => failures.push(f),
        }
    }
    (mismatches, failures)
}

async fn count_rows(pool: &Pool, qualified: &str) -> Result<i64> {
    let client = pool
        .get()
        .await
        .map_err(|e| SyncError::connection(STEP, e.to_string()))?;
    let row = client
        .query_one(&format!("SELECT COUNT(*) FROM {qualified}"), &[])
        .await
        .map_err(|e| SyncError::import(STEP, e.to_string()))?;
    Ok(row.get(0))
}

/// Recompute every sequence from live data so the next generated value cannot
/// collide with reloaded rows.
pub async fn reset_sequences(
    target: &Pool,
    options: &SyncOptions,
    dry_run: bool,
) -> Result<serde_json::Value> {
    let descriptors = list_sequences(target, &options.schemas).await?;
    info!("found {} owned sequences", descriptors.len());

    if dry_run {
        return Ok(json!({ "sequences": descriptors.len(), "dry_run": true }));
    }

    let client = target
        .get()
        .await
        .map_err(|e| SyncError::connection(SEQUENCES_STEP, e.to_string()))?;

    let mut reset = 0usize;
    let mut errors: Vec<String> = Vec::new();
    for d in &descriptors {
        let seq = quote_qualified(&d.sequence_schema, &d.sequence);
        let max_sql = format!(
            "SELECT MAX({})::bigint FROM {}",
            crate::sqltext::quote_ident(&d.column),
            quote_qualified(&d.table_schema, &d.table),
        );

        let result = async {
            let row = client.query_one(&max_sql, &[]).await?;
            let max: Option<i64> = row.get(0);
            match max {
                // Next value is max + 1.
                Some(max) => {
                    client
                        .query_one("SELECT setval($1::regclass, $2, true)", &[&seq, &max])
                        .await?
                }
                // Empty table: park at 1, not yet called, so nextval yields 1.
                None => {
                    client
                        .query_one("SELECT setval($1::regclass, 1, false)", &[&seq])
                        .await?
                }
            };
            Ok::<(), tokio_postgres::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                debug!("reset sequence {}", seq);
                reset += 1;
            }
            Err(e) => {
                warn!("failed to reset sequence {}: {}", seq, e);
                errors.push(format!("{seq}: {e}"));
            }
        }
    }

    Ok(json!({
        "sequences": descriptors.len(),
        "reset": reset,
        "errors": errors,
    }))
}

/// Derive sequence descriptors from catalog dependency metadata. Never
/// cached; ownership can change between runs.
async fn list_sequences(pool: &Pool, schemas: &[String]) -> Result<Vec<SequenceDescriptor>> {
    let client = pool
        .get()
        .await
        .map_err(|e| SyncError::connection(SEQUENCES_STEP, e.to_string()))?;

    let rows = client
        .query(
            "SELECT tn.nspname, t.relname, a.attname, sn.nspname, s.relname \
             FROM pg_class s \
             JOIN pg_namespace sn ON sn.oid = s.relnamespace \
             JOIN pg_depend d ON d.objid = s.oid AND d.deptype IN ('a', 'i') \
             JOIN pg_class t ON t.oid = d.refobjid \
             JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = d.refobjsubid \
             JOIN pg_namespace tn ON tn.oid = t.relnamespace \
             WHERE s.relkind = 'S' AND tn.nspname = ANY($1) \
             ORDER BY tn.nspname, t.relname, a.attname",
            &[&schemas],
        )
        .await
        .map_err(|e| SyncError::import(SEQUENCES_STEP, format!("introspecting sequences: {e}")))?;

    let mut descriptors = Vec::with_capacity(rows.len());
    for row in rows {
        let d = SequenceDescriptor {
            table_schema: row.get(0),
            table: row.get(1),
            column: row.get(2),
            sequence_schema: row.get(3),
            sequence: row.get(4),
        };
        let all_safe = [
            &d.table_schema,
            &d.table,
            &d.column,
            &d.sequence_schema,
            &d.sequence,
        ]
        .iter()
        .all(|n| is_safe_identifier(n));
        if !all_safe {
            warn!("skipping sequence with unsafe identifiers: {:?}", d);
            continue;
        }
        descriptors.push(d);
    }
    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_tables_are_schema_qualified() {
        for table in SESSION_TABLES {
            assert!(table.starts_with("auth."), "{table} not in auth schema");
        }
    }

    #[test]
    fn suspend_and_restore_are_paired_session_settings() {
        assert!(SUSPEND_SQL.contains("replica"));
        assert!(RESTORE_SQL.contains("origin"));
    }

    #[test]
    fn count_failure_on_both_sides_is_not_a_match() {
        let check = compare_counts(
            "public.orders",
            Err(SyncError::connection(STEP, "refused")),
            Err(SyncError::connection(STEP, "refused")),
        );
        match check {
            CountCheck::Failed(f) => {
                assert!(f.contains("public.orders"));
                assert!(f.contains("source:"));
                assert!(f.contains("target:"));
            }
            _ => panic!("failed counts must be reported, not compared"),
        }
    }

    #[test]
    fn count_failure_on_one_side_is_reported() {
        let check = compare_counts(
            "public.orders",
            Ok(42),
            Err(SyncError::timeout(STEP, "statement timeout")),
        );
        assert!(matches!(check, CountCheck::Failed(_)));
    }

    #[test]
    fn equal_counts_match_and_unequal_counts_mismatch() {
        assert!(matches!(
            compare_counts("public.t", Ok(7), Ok(7)),
            CountCheck::Match(7)
        ));
        match compare_counts("public.t", Ok(7), Ok(3)) {
            CountCheck::Mismatch(m) => {
                assert_eq!(m.source_rows, 7);
                assert_eq!(m.target_rows, 3);
            }
            _ => panic!("differing counts must mismatch"),
        }
    }

    #[test]
    fn sequence_descriptor_equality() {
        let d = SequenceDescriptor {
            table_schema: "public".into(),
            table: "orders".into(),
            column: "id".into(),
            sequence_schema: "public".into(),
            sequence: "orders_id_seq".into(),
        };
        assert_eq!(d.clone(), d);
    }
}
