//! Drivers for the external Postgres client tools.
//!
//! Dumps are generated with `pg_dump`/`pg_dumpall` and applied with `psql`.
//! Dump generation failures are fatal; application is best-effort, with
//! statement-level errors counted from psql's stderr rather than aborting.

use std::path::Path;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

/// How many apply errors are kept verbatim; the remainder is only counted.
pub const MAX_LOGGED_ERRORS: usize = 10;

/// Live-session tables that must never cross instances.
pub const SESSION_TABLES: &[&str] = &[
    "auth.sessions",
    "auth.refresh_tokens",
    "auth.mfa_amr_claims",
    "auth.flow_state",
    "auth.one_time_tokens",
];

/// Outcome of a tolerant script application.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    /// Total statement errors reported by psql.
    pub errors: usize,
    /// Of those, errors that were "already exists" conditions.
    pub already_exists: usize,
    /// First [`MAX_LOGGED_ERRORS`] error lines, verbatim.
    pub sampled: Vec<String>,
}

impl ApplyOutcome {
    /// Errors that are not benign "already exists" conditions.
    pub fn hard_errors(&self) -> usize {
        self.errors - self.already_exists
    }
}

/// Build pg_dump arguments for a schema-only dump.
pub fn schema_dump_args(db_url: &str, schemas: &[String], out: &Path) -> Vec<String> {
    let mut args = vec![
        "--schema-only".to_string(),
        "--no-owner".to_string(),
        "--no-privileges".to_string(),
    ];
    for schema in schemas {
        args.push("--schema".to_string());
        args.push(schema.clone());
    }
    args.push("--file".to_string());
    args.push(out.display().to_string());
    args.push("--dbname".to_string());
    args.push(db_url.to_string());
    args
}

/// Build pg_dump arguments for a data-only dump.
///
/// `--column-inserts` emits one INSERT per row so a single malformed row
/// cannot poison a multi-row statement during the tolerant apply.
pub fn data_dump_args(
    db_url: &str,
    schemas: &[String],
    exclude_tables: &[String],
    exclude_sessions: bool,
    out: &Path,
) -> Vec<String> {
    let mut args = vec![
        "--data-only".to_string(),
        "--column-inserts".to_string(),
        "--no-owner".to_string(),
        "--no-privileges".to_string(),
    ];
    for schema in schemas {
        args.push("--schema".to_string());
        args.push(schema.clone());
    }
    if exclude_sessions {
        for table in SESSION_TABLES {
            args.push("--exclude-table-data".to_string());
            args.push((*table).to_string());
        }
    }
    for table in exclude_tables {
        args.push("--exclude-table-data".to_string());
        args.push(table.clone());
    }
    args.push("--file".to_string());
    args.push(out.display().to_string());
    args.push("--dbname".to_string());
    args.push(db_url.to_string());
    args
}

/// Generate a schema-only dump. Fatal on any tool failure.
pub async fn dump_schema(step: &str, db_url: &str, schemas: &[String], out: &Path) -> Result<()> {
    run_dump_tool(step, "pg_dump", &schema_dump_args(db_url, schemas, out)).await
}

/// Generate a data-only dump. Fatal on any tool failure.
pub async fn dump_data(
    step: &str,
    db_url: &str,
    schemas: &[String],
    exclude_tables: &[String],
    exclude_sessions: bool,
    out: &Path,
) -> Result<()> {
    let args = data_dump_args(db_url, schemas, exclude_tables, exclude_sessions, out);
    run_dump_tool(step, "pg_dump", &args).await
}

/// Generate a roles-only dump via pg_dumpall. Fatal on any tool failure.
pub async fn dump_roles(step: &str, db_url: &str, out: &Path) -> Result<()> {
    let args = vec![
        "--roles-only".to_string(),
        "--no-role-passwords".to_string(),
        "--file".to_string(),
        out.display().to_string(),
        "--dbname".to_string(),
        db_url.to_string(),
    ];
    run_dump_tool(step, "pg_dumpall", &args).await
}

/// Apply a script with psql, tolerating statement-level errors.
///
/// `session_setup` commands run before the script on the same psql session
/// (psql executes `--command`/`--file` arguments in order on one connection),
/// which is how enforcement suspension reaches the apply session.
pub async fn apply_script(
    step: &str,
    db_url: &str,
    script: &Path,
    session_setup: &[&str],
) -> Result<ApplyOutcome> {
    let mut args = vec![
        "--no-psqlrc".to_string(),
        "--quiet".to_string(),
        "-v".to_string(),
        "ON_ERROR_STOP=0".to_string(),
    ];
    for cmd in session_setup {
        args.push("--command".to_string());
        args.push((*cmd).to_string());
    }
    args.push("--file".to_string());
    args.push(script.display().to_string());
    args.push("--dbname".to_string());
    args.push(db_url.to_string());

    debug!("running psql for {:?}", script);
    let output = Command::new("psql")
        .args(&args)
        .output()
        .await
        .map_err(|e| tool_spawn_error(step, "psql", e))?;

    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        // psql only exits non-zero here for connection/startup failures,
        // since ON_ERROR_STOP is off.
        return Err(SyncError::connection(
            step,
            format!("psql failed: {}", tail(&stderr, 500)),
        ));
    }

    let outcome = parse_psql_errors(&stderr);
    for line in &outcome.sampled {
        warn!("apply error: {}", line);
    }
    if outcome.errors > outcome.sampled.len() {
        warn!(
            "{} further apply errors suppressed",
            outcome.errors - outcome.sampled.len()
        );
    }
    Ok(outcome)
}

/// Count ERROR lines in psql stderr, sampling the first few verbatim.
pub fn parse_psql_errors(stderr: &str) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    for line in stderr.lines() {
        let trimmed = line.trim_start();
        // psql prefixes errors either bare or with "psql:<file>:<line>:".
        let is_error = trimmed.starts_with("ERROR:")
            || (trimmed.starts_with("psql:") && trimmed.contains("ERROR:"));
        if !is_error {
            continue;
        }
        outcome.errors += 1;
        if trimmed.contains("already exists") {
            outcome.already_exists += 1;
        }
        if outcome.sampled.len() < MAX_LOGGED_ERRORS {
            outcome.sampled.push(trimmed.to_string());
        }
    }
    outcome
}

async fn run_dump_tool(step: &str, program: &str, args: &[String]) -> Result<()> {
    debug!("running {} {:?}", program, args);
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| tool_spawn_error(step, program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SyncError::export(
            step,
            format!("{} exited with {}: {}", program, output.status, tail(&stderr, 500)),
        ));
    }
    Ok(())
}

fn tool_spawn_error(step: &str, program: &str, e: std::io::Error) -> SyncError {
    if e.kind() == std::io::ErrorKind::NotFound {
        SyncError::validation(step, format!("'{program}' not found in PATH"))
    } else {
        SyncError::export(step, format!("failed to run {program}: {e}"))
    }
}

fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.trim_end().to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", s[start..].trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn schema_args_cover_all_schemas() {
        let args = schema_dump_args(
            "postgres://u@h/db",
            &["public".into(), "extensions".into()],
            &PathBuf::from("/tmp/schema.sql"),
        );
        assert!(args.contains(&"--schema-only".to_string()));
        assert!(args.contains(&"--no-owner".to_string()));
        assert_eq!(args.iter().filter(|a| *a == "--schema").count(), 2);
        assert!(args.contains(&"extensions".to_string()));
    }

    #[test]
    fn data_args_exclude_session_tables() {
        let args = data_dump_args(
            "postgres://u@h/db",
            &["public".into(), "auth".into()],
            &["public.audit_log".into()],
            true,
            &PathBuf::from("/tmp/data.sql"),
        );
        assert!(args.contains(&"--column-inserts".to_string()));
        assert!(args.contains(&"auth.sessions".to_string()));
        assert!(args.contains(&"auth.refresh_tokens".to_string()));
        assert!(args.contains(&"public.audit_log".to_string()));
    }

    #[test]
    fn session_tables_stay_when_exclusion_disabled() {
        let args = data_dump_args(
            "postgres://u@h/db",
            &["auth".into()],
            &[],
            false,
            &PathBuf::from("/tmp/data.sql"),
        );
        assert!(!args.contains(&"auth.sessions".to_string()));
    }

    #[test]
    fn psql_error_parsing_counts_and_samples() {
        let stderr = "\
psql:data.sql:10: ERROR:  duplicate key value violates unique constraint \"t_pkey\"
NOTICE:  truncate cascades to table \"child\"
psql:data.sql:42: ERROR:  relation \"widgets\" already exists
ERROR:  invalid input syntax for type integer: \"abc\"
";
        let outcome = parse_psql_errors(stderr);
        assert_eq!(outcome.errors, 3);
        assert_eq!(outcome.already_exists, 1);
        assert_eq!(outcome.hard_errors(), 2);
        assert_eq!(outcome.sampled.len(), 3);
    }

    #[test]
    fn psql_error_sampling_is_capped() {
        let stderr = (0..25)
            .map(|i| format!("ERROR:  failure number {i}\n"))
            .collect::<String>();
        let outcome = parse_psql_errors(&stderr);
        assert_eq!(outcome.errors, 25);
        assert_eq!(outcome.sampled.len(), MAX_LOGGED_ERRORS);
    }
}
