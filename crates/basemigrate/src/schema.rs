//! Schema transfer: dump DDL from the source, sanitize it, apply to target.
//!
//! Application is advisory-strict: repeated runs against a non-empty target
//! are expected, so "already exists" conditions are benign and other
//! statement errors are logged without failing the step.

use std::path::Path;

use serde_json::json;
use tracing::{info, warn};

use crate::config::SyncOptions;
use crate::error::Result;
use crate::pgtools;
use crate::sqltext::{split_statements, statement_head};
use crate::tempfiles::TempStore;

pub const STEP: &str = "sync-schema";

/// Schemas whose row-level-security policies are managed by the platform and
/// recreated by the target environment itself.
pub const PLATFORM_SCHEMAS: &[&str] = &[
    "auth",
    "storage",
    "realtime",
    "extensions",
    "graphql",
    "graphql_public",
    "pgsodium",
    "vault",
    "supabase_functions",
];

/// Run the schema transfer.
pub async fn run(
    source_db_url: &str,
    target_db_url: &str,
    options: &SyncOptions,
    temp: &TempStore,
    dry_run: bool,
) -> Result<serde_json::Value> {
    let raw_path = temp.create("schema.sql")?;
    pgtools::dump_schema(STEP, source_db_url, &options.schemas, &raw_path).await?;

    let raw = std::fs::read_to_string(&raw_path)?;
    let (sanitized, stripped) = sanitize(&raw);
    let statements = split_statements(&sanitized).len();

    info!(
        "schema dump: {} statements kept, {} environment-specific statements stripped",
        statements, stripped
    );

    if dry_run {
        return Ok(json!({
            "statements": statements,
            "stripped": stripped,
            "dry_run": true,
        }));
    }

    let sanitized_path = temp.create("schema.sanitized.sql")?;
    std::fs::write(&sanitized_path, &sanitized)?;

    let outcome = pgtools::apply_script(STEP, target_db_url, &sanitized_path, &[]).await?;
    if outcome.hard_errors() > 0 {
        warn!(
            "schema apply finished with {} errors ({} benign 'already exists')",
            outcome.errors, outcome.already_exists
        );
    }

    Ok(json!({
        "statements": statements,
        "stripped": stripped,
        "apply_errors": outcome.hard_errors(),
        "already_exists": outcome.already_exists,
    }))
}

/// Remove statements that must not cross environments.
///
/// Returns the sanitized script and the number of statements stripped.
pub fn sanitize(script: &str) -> (String, usize) {
    let statements = split_statements(script);
    let total = statements.len();
    let kept: Vec<String> = statements
        .into_iter()
        .filter(|stmt| !is_environment_specific(stmt))
        .collect();
    let stripped = total - kept.len();
    (kept.join("\n\n") + "\n", stripped)
}

fn is_environment_specific(stmt: &str) -> bool {
    let head = statement_head(stmt);

    if head.starts_with("CREATE EXTENSION") || head.starts_with("COMMENT ON EXTENSION") {
        return true;
    }
    if head.starts_with("GRANT ") || head.starts_with("REVOKE ") {
        return true;
    }
    if head.starts_with("ALTER ") && stmt.to_ascii_uppercase().contains(" OWNER TO ") {
        return true;
    }
    if head.starts_with("CREATE PUBLICATION") || head.starts_with("ALTER PUBLICATION") {
        return true;
    }
    if head.starts_with("CREATE POLICY")
        || head.starts_with("ALTER POLICY")
        || head.starts_with("DROP POLICY")
    {
        return policy_on_platform_schema(stmt);
    }

    false
}

/// Whether a policy statement targets a table in a platform-managed schema.
fn policy_on_platform_schema(stmt: &str) -> bool {
    let upper = stmt.to_ascii_uppercase();
    PLATFORM_SCHEMAS.iter().any(|schema| {
        let needle = format!(" ON {}.", schema.to_ascii_uppercase());
        let quoted = format!(" ON \"{}\".", schema.to_ascii_uppercase());
        upper.contains(&needle) || upper.contains(&quoted)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_extension_statements() {
        let script = "CREATE EXTENSION IF NOT EXISTS \"uuid-ossp\" WITH SCHEMA extensions;\nCREATE TABLE public.t (id int);";
        let (out, stripped) = sanitize(script);
        assert_eq!(stripped, 1);
        assert!(out.contains("CREATE TABLE"));
        assert!(!out.contains("CREATE EXTENSION"));
    }

    #[test]
    fn strips_ownership_and_privileges() {
        let script = "\
ALTER TABLE public.t OWNER TO postgres;
GRANT ALL ON TABLE public.t TO anon;
REVOKE ALL ON SCHEMA public FROM public;
CREATE INDEX t_idx ON public.t (id);";
        let (out, stripped) = sanitize(script);
        assert_eq!(stripped, 3);
        assert!(out.contains("CREATE INDEX"));
    }

    #[test]
    fn keeps_non_owner_alters() {
        let script = "ALTER TABLE public.t ADD CONSTRAINT t_pk PRIMARY KEY (id);";
        let (out, stripped) = sanitize(script);
        assert_eq!(stripped, 0);
        assert!(out.contains("PRIMARY KEY"));
    }

    #[test]
    fn strips_platform_schema_policies_only() {
        let script = "\
CREATE POLICY \"own objects\" ON storage.objects FOR SELECT USING (true);
CREATE POLICY user_rows ON public.profiles FOR SELECT USING (auth.uid() = id);";
        let (out, stripped) = sanitize(script);
        assert_eq!(stripped, 1);
        assert!(out.contains("public.profiles"));
        assert!(!out.contains("storage.objects"));
    }

    #[test]
    fn strips_publications() {
        let script = "CREATE PUBLICATION realtime_pub FOR ALL TABLES;\nSELECT 1;";
        let (_, stripped) = sanitize(script);
        assert_eq!(stripped, 1);
    }

    #[test]
    fn function_bodies_survive_sanitation() {
        let script = "\
CREATE FUNCTION public.f() RETURNS void AS $$
BEGIN
  -- GRANT inside a body is not a grant statement
  RAISE NOTICE 'GRANT ALL';
END;
$$ LANGUAGE plpgsql;";
        let (out, stripped) = sanitize(script);
        assert_eq!(stripped, 0);
        assert!(out.contains("RAISE NOTICE"));
    }
}
