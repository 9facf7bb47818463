//! Configuration validation rules.

use super::{Config, ProjectConfig};
use crate::error::{Result, SyncError};

const STEP: &str = "config";

/// Validate a full configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_project("source", &config.source)?;
    validate_project("target", &config.target)?;

    if config.sync.schemas.is_empty() {
        return Err(SyncError::validation(
            STEP,
            "sync.schemas must list at least one schema",
        ));
    }

    if config.sync.storage_concurrency == 0 {
        return Err(SyncError::validation(
            STEP,
            "sync.storage_concurrency must be at least 1",
        ));
    }

    for entry in &config.sync.exclude_tables {
        if !entry.contains('.') {
            return Err(SyncError::validation(
                STEP,
                format!("sync.exclude_tables entry '{entry}' must be schema-qualified (schema.table)"),
            ));
        }
    }

    Ok(())
}

fn validate_project(which: &str, project: &ProjectConfig) -> Result<()> {
    project
        .db_url
        .parse::<tokio_postgres::Config>()
        .map_err(|e| {
            SyncError::validation(STEP, format!("{which}.db_url is not a valid connection string: {e}"))
        })?;

    if !project.api_url.starts_with("http://") && !project.api_url.starts_with("https://") {
        return Err(SyncError::validation(
            STEP,
            format!("{which}.api_url must be an http(s) URL"),
        ));
    }

    match (&project.service_key, &project.secret_key) {
        (Some(_), Some(_)) => Err(SyncError::validation(
            STEP,
            format!("{which}: service_key and secret_key are mutually exclusive"),
        )),
        (None, None) => Err(SyncError::validation(
            STEP,
            format!("{which}: either service_key or secret_key is required"),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;

    fn base_yaml() -> String {
        r#"
source:
  db_url: postgres://postgres:pw@db.src.example.com:5432/postgres
  api_url: https://src.example.com
  service_key: sk-source
target:
  db_url: postgres://postgres:pw@db.dst.example.com:5432/postgres
  api_url: https://dst.example.com
  secret_key: sb_secret_target
"#
        .to_string()
    }

    #[test]
    fn minimal_config_is_valid() {
        let config = Config::from_yaml(&base_yaml()).unwrap();
        assert_eq!(config.sync.schemas, vec!["public"]);
        assert_eq!(config.sync.storage_concurrency, 8);
        assert!(config.sync.components.storage);
        assert!(config.sync.exclude_sessions);
    }

    #[test]
    fn mixed_credential_schemes_rejected() {
        let yaml = base_yaml().replace(
            "  service_key: sk-source",
            "  service_key: sk-source\n  secret_key: also-set",
        );
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn missing_credentials_rejected() {
        let yaml = base_yaml().replace("  service_key: sk-source\n", "");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn bad_db_url_rejected() {
        let yaml = base_yaml().replace(
            "postgres://postgres:pw@db.src.example.com:5432/postgres",
            "not a url at all %%",
        );
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("db_url"));
    }

    #[test]
    fn unqualified_exclude_table_rejected() {
        let yaml = format!("{}sync:\n  exclude_tables: [\"orders\"]\n", base_yaml());
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let yaml = format!("{}sync:\n  storage_concurrency: 0\n", base_yaml());
        assert!(Config::from_yaml(&yaml).is_err());
    }
}
