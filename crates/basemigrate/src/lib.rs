//! # basemigrate
//!
//! One-shot, full-replacement migration of a platform instance to another:
//! database schema, row data, roles and sequences; the auth user store with
//! credential hashes intact; and the object-storage hierarchy with reference
//! rewriting.
//!
//! The library's core is the migration pipeline: an ordered sequence of
//! interdependent, partially-destructive steps against two live Postgres
//! databases and two storage services, designed to leave the target usable
//! even when individual sub-operations fail.
//!
//! ## Example
//!
//! ```rust,no_run
//! use basemigrate::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::load("config.yaml").expect("config");
//!     let result = Orchestrator::new(config).execute().await;
//!     for step in &result.steps {
//!         println!("{}: {}", step.name, if step.success { "ok" } else { "failed" });
//!     }
//! }
//! ```

pub mod auth;
pub mod config;
pub mod connect;
pub mod data;
pub mod error;
pub mod orchestrator;
pub mod pgtools;
pub mod roles;
pub mod schema;
pub mod sqltext;
pub mod storage;
pub mod tempfiles;

// Re-exports for convenient access
pub use config::{Components, Config, ProjectConfig, SyncOptions};
pub use error::{Result, SyncError};
pub use orchestrator::{Orchestrator, RunResult, StepKind, StepResult, PIPELINE};
pub use storage::StorageClient;
