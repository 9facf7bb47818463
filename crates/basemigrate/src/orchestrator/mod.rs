//! Migration orchestrator - runs the ordered step pipeline.
//!
//! The pipeline is a statically known, linearly ordered list of tagged steps
//! evaluated in a fixed loop, each gated by a configuration flag. Order is a
//! correctness requirement: auth runs before data because identity creation
//! can trigger target-side side effects (auto-created dependent rows) that
//! the full data reload must then overwrite with source-of-truth values.

use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::connect::{self, SslPreferences};
use crate::error::{Result, SyncError};
use crate::storage::StorageClient;
use crate::tempfiles::TempStore;
use crate::{auth, data, roles, schema, storage};

/// The fixed step topology. Dependencies between steps are simple and total,
/// so a linear order is always correct; this is intentionally not a DAG
/// scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Validate,
    Roles,
    Schema,
    Auth,
    Data,
    Sequences,
    Storage,
}

/// Pipeline order. `Validate` is always first and cannot be disabled.
pub const PIPELINE: &[StepKind] = &[
    StepKind::Validate,
    StepKind::Roles,
    StepKind::Schema,
    StepKind::Auth,
    StepKind::Data,
    StepKind::Sequences,
    StepKind::Storage,
];

impl StepKind {
    /// Step name as reported in results and logs.
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Validate => "validate",
            StepKind::Roles => roles::STEP,
            StepKind::Schema => schema::STEP,
            StepKind::Auth => auth::STEP,
            StepKind::Data => data::STEP,
            StepKind::Sequences => data::SEQUENCES_STEP,
            StepKind::Storage => storage::STEP,
        }
    }
}

/// Result of a single executed step. Immutable once recorded.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub name: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Result of a full pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// Whether every executed step succeeded.
    pub success: bool,

    /// Whether this was a dry run.
    pub dry_run: bool,

    /// Ordered results of the executed steps.
    pub steps: Vec<StepResult>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Errors from failed steps, in order.
    pub errors: Vec<String>,
}

impl RunResult {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Live resources for one run, created by the validate step and torn down in
/// cleanup.
#[derive(Default)]
struct RunContext {
    source_db: Option<Pool>,
    target_db: Option<Pool>,
    source_storage: Option<StorageClient>,
    target_storage: Option<StorageClient>,
}

impl RunContext {
    fn source_db(&self) -> Result<&Pool> {
        self.source_db
            .as_ref()
            .ok_or_else(|| SyncError::unknown("pipeline", "source pool not initialized"))
    }

    fn target_db(&self) -> Result<&Pool> {
        self.target_db
            .as_ref()
            .ok_or_else(|| SyncError::unknown("pipeline", "target pool not initialized"))
    }
}

/// Migration orchestrator.
pub struct Orchestrator {
    config: Config,
    dry_run: bool,
    ssl_prefs: SslPreferences,
}

impl Orchestrator {
    /// Create a new orchestrator for a validated configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            dry_run: false,
            ssl_prefs: SslPreferences::new(),
        }
    }

    /// Enable dry-run mode: every mutating step becomes a read-only preview.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn temp_root(&self) -> PathBuf {
        self.config
            .sync
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
            .join(format!("basemigrate-{}", std::process::id()))
    }

    /// Whether a step is enabled by configuration.
    pub fn step_enabled(&self, kind: StepKind) -> bool {
        let c = &self.config.sync.components;
        match kind {
            StepKind::Validate => true,
            StepKind::Roles => c.roles,
            StepKind::Schema => c.schema,
            StepKind::Auth => c.auth,
            StepKind::Data => c.data,
            StepKind::Sequences => c.sequences,
            StepKind::Storage => c.storage,
        }
    }

    /// Run the full pipeline once. Never returns an error: all failures are
    /// captured in the returned result, and a step failure aborts the
    /// remaining steps after best-effort cleanup.
    pub async fn execute(&self) -> RunResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut steps: Vec<StepResult> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        let mut ctx = RunContext::default();

        let temp = match TempStore::new(self.temp_root()) {
            Ok(temp) => temp,
            Err(e) => {
                return self.finish(started_at, start, steps, vec![e.to_string()], false);
            }
        };

        if self.dry_run {
            info!("dry run: no changes will be made to the target");
        }

        let mut failed = false;
        for kind in PIPELINE {
            if !self.step_enabled(*kind) {
                info!("skipping disabled step: {}", kind.name());
                continue;
            }

            let step_start = Instant::now();
            info!("step {} starting", kind.name());
            let outcome = self.run_step(*kind, &mut ctx, &temp).await;
            let duration_ms = step_start.elapsed().as_millis() as u64;

            match outcome {
                Ok(detail) => {
                    info!("step {} completed in {}ms", kind.name(), duration_ms);
                    steps.push(StepResult {
                        name: kind.name().to_string(),
                        success: true,
                        duration_ms,
                        error: None,
                        detail: Some(detail),
                    });
                }
                Err(e) => {
                    error!("step {} failed: {}", kind.name(), e);
                    errors.push(e.to_string());
                    steps.push(StepResult {
                        name: kind.name().to_string(),
                        success: false,
                        duration_ms,
                        error: Some(e.to_string()),
                        detail: None,
                    });
                    failed = true;
                    break;
                }
            }
        }

        // Best-effort cleanup on every exit path.
        if let Some(pool) = ctx.source_db.take() {
            pool.close();
        }
        if let Some(pool) = ctx.target_db.take() {
            pool.close();
        }
        temp.cleanup();

        self.finish(started_at, start, steps, errors, !failed)
    }

    fn finish(
        &self,
        started_at: DateTime<Utc>,
        start: Instant,
        steps: Vec<StepResult>,
        errors: Vec<String>,
        success: bool,
    ) -> RunResult {
        let completed_at = Utc::now();
        let duration_seconds = start.elapsed().as_secs_f64();
        let result = RunResult {
            success: success && errors.is_empty(),
            dry_run: self.dry_run,
            steps,
            duration_seconds,
            started_at,
            completed_at,
            errors,
        };
        if result.success {
            info!(
                "run completed: {} steps in {:.1}s",
                result.steps.len(),
                result.duration_seconds
            );
        } else {
            warn!(
                "run failed after {:.1}s: {}",
                result.duration_seconds,
                result.errors.join("; ")
            );
        }
        result
    }

    async fn run_step(
        &self,
        kind: StepKind,
        ctx: &mut RunContext,
        temp: &TempStore,
    ) -> Result<serde_json::Value> {
        let options = &self.config.sync;
        match kind {
            StepKind::Validate => self.validate(ctx).await,
            StepKind::Roles => {
                roles::run(
                    &self.config.source.db_url,
                    &self.config.target.db_url,
                    temp,
                    self.dry_run,
                )
                .await
            }
            StepKind::Schema => {
                schema::run(
                    &self.config.source.db_url,
                    &self.config.target.db_url,
                    options,
                    temp,
                    self.dry_run,
                )
                .await
            }
            StepKind::Auth => {
                auth::run(ctx.source_db()?, ctx.target_db()?, options, self.dry_run).await
            }
            StepKind::Data => {
                data::run(
                    &self.config.source.db_url,
                    &self.config.target.db_url,
                    ctx.source_db()?,
                    ctx.target_db()?,
                    options,
                    temp,
                    self.dry_run,
                )
                .await
            }
            StepKind::Sequences => {
                data::reset_sequences(ctx.target_db()?, options, self.dry_run).await
            }
            StepKind::Storage => {
                let source = ctx
                    .source_storage
                    .as_ref()
                    .ok_or_else(|| SyncError::unknown("pipeline", "source storage client missing"))?;
                let target = ctx
                    .target_storage
                    .as_ref()
                    .ok_or_else(|| SyncError::unknown("pipeline", "target storage client missing"))?;
                storage::run(source, target, ctx.target_db()?, options, self.dry_run).await
            }
        }
    }

    /// Validate both endpoints: pooled database connections (with SSL
    /// negotiation) and, when storage is enabled, the storage APIs.
    async fn validate(&self, ctx: &mut RunContext) -> Result<serde_json::Value> {
        let step = StepKind::Validate.name();

        let source_db =
            connect::build_pool(step, "source", &self.config.source.db_url, &self.ssl_prefs)
                .await?;
        let target_db =
            connect::build_pool(step, "target", &self.config.target.db_url, &self.ssl_prefs)
                .await?;

        let mut detail = serde_json::json!({
            "source_db": "ok",
            "target_db": "ok",
        });

        if self.config.sync.components.storage {
            let source_storage = StorageClient::new(&self.config.source)?;
            let target_storage = StorageClient::new(&self.config.target)?;
            let source_buckets = source_storage.list_buckets().await?.len();
            let target_buckets = target_storage.list_buckets().await?.len();
            detail["source_buckets"] = source_buckets.into();
            detail["target_buckets"] = target_buckets.into();
            ctx.source_storage = Some(source_storage);
            ctx.target_storage = Some(target_storage);
        }

        ctx.source_db = Some(source_db);
        ctx.target_db = Some(target_db);
        Ok(detail)
    }

    /// Connection check only: both databases and both storage APIs.
    pub async fn check(&self) -> Result<()> {
        let mut ctx = RunContext::default();
        self.validate(&mut ctx).await?;
        if let Some(pool) = ctx.source_db.take() {
            pool.close();
        }
        if let Some(pool) = ctx.target_db.take() {
            pool.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config(yaml_extra: &str) -> Config {
        let yaml = format!(
            r#"
source:
  db_url: postgres://postgres:pw@db.src.example.com:5432/postgres
  api_url: https://src.example.com
  service_key: sk-source
target:
  db_url: postgres://postgres:pw@db.dst.example.com:5432/postgres
  api_url: https://dst.example.com
  secret_key: sb-secret
{yaml_extra}"#
        );
        Config::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn pipeline_order_is_fixed() {
        let names: Vec<&str> = PIPELINE.iter().map(|k| k.name()).collect();
        assert_eq!(
            names,
            vec![
                "validate",
                "sync-roles",
                "sync-schema",
                "sync-auth",
                "sync-data",
                "reset-sequences",
                "sync-storage",
            ]
        );
    }

    #[test]
    fn validate_cannot_be_disabled() {
        let config = test_config(
            "sync:\n  components:\n    roles: false\n    schema: false\n    auth: false\n    data: false\n    sequences: false\n    storage: false\n",
        );
        let orchestrator = Orchestrator::new(config);
        assert!(orchestrator.step_enabled(StepKind::Validate));
        assert!(!orchestrator.step_enabled(StepKind::Roles));
        assert!(!orchestrator.step_enabled(StepKind::Storage));
    }

    #[test]
    fn component_flags_gate_their_steps() {
        let config = test_config("sync:\n  components:\n    storage: false\n");
        let orchestrator = Orchestrator::new(config);
        assert!(orchestrator.step_enabled(StepKind::Data));
        assert!(!orchestrator.step_enabled(StepKind::Storage));
    }

    #[test]
    fn run_result_serializes() {
        let result = RunResult {
            success: true,
            dry_run: false,
            steps: vec![StepResult {
                name: "validate".into(),
                success: true,
                duration_ms: 12,
                error: None,
                detail: None,
            }],
            duration_seconds: 0.5,
            started_at: Utc::now(),
            completed_at: Utc::now(),
            errors: vec![],
        };
        let json = result.to_json().unwrap();
        assert!(json.contains("\"validate\""));
        assert!(!json.contains("\"error\""));
    }

    #[tokio::test]
    async fn failed_validate_aborts_and_reports() {
        // Unroutable port: connection refused fast, no SSL involved.
        let yaml = r#"
source:
  db_url: postgres://postgres:pw@127.0.0.1:1/postgres
  api_url: https://src.example.com
  service_key: sk
target:
  db_url: postgres://postgres:pw@127.0.0.1:1/postgres
  api_url: https://dst.example.com
  service_key: sk
sync:
  components:
    storage: false
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let result = Orchestrator::new(config).execute().await;
        assert!(!result.success);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].name, "validate");
        assert!(!result.steps[0].success);
        assert!(!result.errors.is_empty());
    }
}
