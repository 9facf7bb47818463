//! Roles transfer: dump role definitions, drop platform-reserved roles,
//! apply best-effort.
//!
//! Role conflicts on the target are expected (both instances ship the same
//! stock roles), so this step never fails on apply errors.

use serde_json::json;
use tracing::{info, warn};

use crate::error::Result;
use crate::pgtools;
use crate::sqltext::{split_statements, statement_head};
use crate::tempfiles::TempStore;

pub const STEP: &str = "sync-roles";

/// Stock roles owned by the platform; their definitions must not cross
/// instances.
pub const RESERVED_ROLES: &[&str] = &[
    "postgres",
    "supabase_admin",
    "supabase_auth_admin",
    "supabase_storage_admin",
    "supabase_functions_admin",
    "supabase_replication_admin",
    "supabase_read_only_user",
    "authenticator",
    "anon",
    "authenticated",
    "service_role",
    "dashboard_user",
    "pgbouncer",
];

/// Run the roles transfer.
pub async fn run(
    source_db_url: &str,
    target_db_url: &str,
    temp: &TempStore,
    dry_run: bool,
) -> Result<serde_json::Value> {
    let raw_path = temp.create("roles.sql")?;
    pgtools::dump_roles(STEP, source_db_url, &raw_path).await?;

    let raw = std::fs::read_to_string(&raw_path)?;
    let (filtered, removed) = filter_reserved(&raw);
    let kept = split_statements(&filtered).len();

    info!("roles dump: {} statements kept, {} reserved-role statements removed", kept, removed);

    if dry_run {
        return Ok(json!({ "statements": kept, "reserved_removed": removed, "dry_run": true }));
    }

    let filtered_path = temp.create("roles.filtered.sql")?;
    std::fs::write(&filtered_path, &filtered)?;

    let outcome = pgtools::apply_script(STEP, target_db_url, &filtered_path, &[]).await?;
    if outcome.errors > 0 {
        warn!("roles apply finished with {} non-fatal errors", outcome.errors);
    }

    Ok(json!({
        "statements": kept,
        "reserved_removed": removed,
        "apply_errors": outcome.errors,
    }))
}

/// Remove every `CREATE ROLE`/`ALTER ROLE`/`COMMENT ON ROLE` statement whose
/// subject is a reserved role. Non-role statements and custom roles pass
/// through untouched.
pub fn filter_reserved(script: &str) -> (String, usize) {
    let statements = split_statements(script);
    let total = statements.len();
    let kept: Vec<String> = statements
        .into_iter()
        .filter(|stmt| !targets_reserved_role(stmt))
        .collect();
    let removed = total - kept.len();
    (kept.join("\n") + "\n", removed)
}

fn targets_reserved_role(stmt: &str) -> bool {
    let head = statement_head(stmt);
    let subject = if let Some(rest) = head.strip_prefix("CREATE ROLE ") {
        rest
    } else if let Some(rest) = head.strip_prefix("ALTER ROLE ") {
        rest
    } else if let Some(rest) = head.strip_prefix("COMMENT ON ROLE ") {
        rest
    } else {
        return false;
    };

    let name = subject
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_end_matches(';')
        .trim_matches('"')
        .to_ascii_lowercase();

    RESERVED_ROLES.contains(&name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "\
--
-- Roles
--

CREATE ROLE anon;
ALTER ROLE anon WITH NOLOGIN NOSUPERUSER;
CREATE ROLE app_reporting;
ALTER ROLE app_reporting WITH LOGIN PASSWORD 'md5abc';
CREATE ROLE \"supabase_admin\";
ALTER ROLE supabase_auth_admin WITH LOGIN;
COMMENT ON ROLE app_reporting IS 'read-only reporting';
";

    #[test]
    fn reserved_roles_fully_removed() {
        let (out, removed) = filter_reserved(DUMP);
        assert_eq!(removed, 4);
        for reserved in ["anon", "supabase_admin", "supabase_auth_admin"] {
            assert!(
                !out.to_ascii_lowercase().contains(reserved),
                "reserved role {reserved} survived filtering"
            );
        }
    }

    #[test]
    fn custom_roles_preserved() {
        let (out, _) = filter_reserved(DUMP);
        assert!(out.contains("CREATE ROLE app_reporting;"));
        assert!(out.contains("PASSWORD 'md5abc'"));
        assert!(out.contains("COMMENT ON ROLE app_reporting"));
    }

    #[test]
    fn quoted_subjects_matched() {
        let (_, removed) = filter_reserved("CREATE ROLE \"service_role\";");
        assert_eq!(removed, 1);
    }

    #[test]
    fn prefix_names_are_not_reserved() {
        let (out, removed) = filter_reserved("CREATE ROLE anonymizer;");
        assert_eq!(removed, 0);
        assert!(out.contains("anonymizer"));
    }
}
