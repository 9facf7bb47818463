//! Error types for the sync library.

use thiserror::Error;

/// Main error type for sync operations.
///
/// Every variant carries the name of the pipeline step it originated from so
/// the final run report can attribute failures without re-deriving context.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Could not reach or establish a session with a database or API endpoint.
    #[error("[{step}] connection error: {message}")]
    Connection { step: String, message: String },

    /// The endpoint rejected the supplied credentials.
    #[error("[{step}] authentication error: {message}")]
    Authentication { step: String, message: String },

    /// The session is valid but lacks privileges for an operation.
    #[error("[{step}] permission error: {message}")]
    Permission { step: String, message: String },

    /// Configuration or input failed validation.
    #[error("[{step}] validation error: {message}")]
    Validation { step: String, message: String },

    /// Dump generation on the source failed.
    #[error("[{step}] export error: {message}")]
    Export { step: String, message: String },

    /// Applying exported content to the target failed.
    #[error("[{step}] import error: {message}")]
    Import { step: String, message: String },

    /// Object storage operation failed.
    #[error("[{step}] storage error: {message}")]
    Storage { step: String, message: String },

    /// An operation exceeded its deadline.
    #[error("[{step}] timeout: {message}")]
    Timeout { step: String, message: String },

    /// Anything that doesn't fit the taxonomy above.
    #[error("[{step}] error: {message}")]
    Unknown { step: String, message: String },
}

macro_rules! ctor {
    ($name:ident, $variant:ident) => {
        pub fn $name(step: impl Into<String>, message: impl ToString) -> Self {
            SyncError::$variant {
                step: step.into(),
                message: message.to_string(),
            }
        }
    };
}

impl SyncError {
    ctor!(connection, Connection);
    ctor!(authentication, Authentication);
    ctor!(permission, Permission);
    ctor!(validation, Validation);
    ctor!(export, Export);
    ctor!(import, Import);
    ctor!(storage, Storage);
    ctor!(timeout, Timeout);
    ctor!(unknown, Unknown);

    /// Name of the pipeline step this error originated from.
    pub fn step(&self) -> &str {
        match self {
            SyncError::Connection { step, .. }
            | SyncError::Authentication { step, .. }
            | SyncError::Permission { step, .. }
            | SyncError::Validation { step, .. }
            | SyncError::Export { step, .. }
            | SyncError::Import { step, .. }
            | SyncError::Storage { step, .. }
            | SyncError::Timeout { step, .. }
            | SyncError::Unknown { step, .. } => step,
        }
    }

    /// Whether the operation that produced this error may be retried safely.
    ///
    /// Import and storage failures are per-item and best-effort by design;
    /// everything else requires operator intervention.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Import { .. } | SyncError::Storage { .. } | SyncError::Timeout { .. }
        )
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Validation { .. } => 2,
            SyncError::Connection { .. } => 3,
            SyncError::Authentication { .. } | SyncError::Permission { .. } => 4,
            SyncError::Export { .. } => 5,
            SyncError::Import { .. } => 6,
            SyncError::Storage { .. } => 7,
            SyncError::Timeout { .. } => 8,
            SyncError::Unknown { .. } => 1,
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::unknown("io", e)
    }
}

impl From<serde_yaml::Error> for SyncError {
    fn from(e: serde_yaml::Error) -> Self {
        SyncError::validation("config", e)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::unknown("json", e)
    }
}

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_name_is_preserved() {
        let e = SyncError::export("sync-data", "pg_dump exited with status 1");
        assert_eq!(e.step(), "sync-data");
        assert!(e.to_string().contains("sync-data"));
    }

    #[test]
    fn recoverability_follows_taxonomy() {
        assert!(SyncError::import("sync-data", "bad row").recoverable());
        assert!(SyncError::storage("sync-storage", "upload failed").recoverable());
        assert!(!SyncError::connection("validate", "refused").recoverable());
        assert!(!SyncError::export("sync-schema", "dump failed").recoverable());
    }

    #[test]
    fn exit_codes_are_distinct_per_category() {
        assert_eq!(SyncError::validation("config", "x").exit_code(), 2);
        assert_eq!(SyncError::connection("validate", "x").exit_code(), 3);
        assert_ne!(
            SyncError::export("s", "x").exit_code(),
            SyncError::import("s", "x").exit_code()
        );
    }
}
