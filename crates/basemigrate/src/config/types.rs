//! Configuration type definitions.

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source platform instance (read from).
    pub source: ProjectConfig,

    /// Target platform instance (written to).
    pub target: ProjectConfig,

    /// Sync behavior configuration.
    #[serde(default)]
    pub sync: SyncOptions,
}

/// Connection descriptor for one platform instance.
///
/// Exactly one credential scheme must be set: the legacy service key pair or
/// the newer secret key pair. Mixing schemes is rejected by validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Postgres connection string (libpq URL form).
    pub db_url: String,

    /// Base URL of the platform API (storage, auth admin).
    pub api_url: String,

    /// Legacy credential scheme: service-role API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_key: Option<String>,

    /// Newer credential scheme: secret API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

impl ProjectConfig {
    /// The API credential, whichever scheme is configured.
    pub fn api_credential(&self) -> Option<&str> {
        self.secret_key.as_deref().or(self.service_key.as_deref())
    }

    /// Whether the legacy key scheme is in use (affects request headers).
    pub fn uses_legacy_keys(&self) -> bool {
        self.service_key.is_some()
    }
}

/// Which pipeline components run and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Per-component enable flags.
    #[serde(default)]
    pub components: Components,

    /// Schemas included in schema/data transfer.
    #[serde(default = "default_schemas")]
    pub schemas: Vec<String>,

    /// Tables excluded from data transfer, as `schema.table`.
    #[serde(default)]
    pub exclude_tables: Vec<String>,

    /// Buckets excluded from storage transfer.
    #[serde(default)]
    pub exclude_buckets: Vec<String>,

    /// Maximum simultaneous object copies.
    #[serde(default = "default_storage_concurrency")]
    pub storage_concurrency: usize,

    /// Whether federated identity records are migrated along with users.
    #[serde(default = "default_true")]
    pub migrate_identities: bool,

    /// Whether live session/refresh-token tables are excluded from the data
    /// dump. Sessions never survive a migration; users re-authenticate.
    #[serde(default = "default_true")]
    pub exclude_sessions: bool,

    /// Compare per-table row counts after the data reload.
    #[serde(default = "default_true")]
    pub verify_counts: bool,

    /// Directory for transient dump artifacts. Defaults to the system temp dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<std::path::PathBuf>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            components: Components::default(),
            schemas: default_schemas(),
            exclude_tables: Vec::new(),
            exclude_buckets: Vec::new(),
            storage_concurrency: default_storage_concurrency(),
            migrate_identities: true,
            exclude_sessions: true,
            verify_counts: true,
            temp_dir: None,
        }
    }
}

/// Enable flags for each pipeline step. Everything defaults to on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Components {
    #[serde(default = "default_true")]
    pub roles: bool,

    #[serde(default = "default_true")]
    pub schema: bool,

    #[serde(default = "default_true")]
    pub auth: bool,

    #[serde(default = "default_true")]
    pub data: bool,

    #[serde(default = "default_true")]
    pub sequences: bool,

    #[serde(default = "default_true")]
    pub storage: bool,
}

impl Default for Components {
    fn default() -> Self {
        Self {
            roles: true,
            schema: true,
            auth: true,
            data: true,
            sequences: true,
            storage: true,
        }
    }
}

fn default_schemas() -> Vec<String> {
    vec!["public".to_string()]
}

fn default_storage_concurrency() -> usize {
    8
}

fn default_true() -> bool {
    true
}
