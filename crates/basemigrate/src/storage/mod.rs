//! Storage transfer: mirror buckets and objects, then repoint persisted
//! references to the new endpoint.

mod client;

pub use client::{encode_path, Bucket, ObjectInfo, StorageClient};

use std::sync::Arc;

use deadpool_postgres::Pool;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::SyncOptions;
use crate::error::{Result, SyncError};
use crate::sqltext::{is_safe_identifier, quote_ident, quote_qualified};

pub const STEP: &str = "sync-storage";

/// Per-bucket transfer outcome.
#[derive(Debug, Clone)]
pub struct BucketReport {
    pub bucket: String,
    pub objects: usize,
    pub copied: usize,
    pub failed: usize,
}

/// Run the storage transfer.
pub async fn run(
    source: &StorageClient,
    target: &StorageClient,
    target_db: &Pool,
    options: &SyncOptions,
    dry_run: bool,
) -> Result<serde_json::Value> {
    let buckets: Vec<Bucket> = source
        .list_buckets()
        .await?
        .into_iter()
        .filter(|b| !options.exclude_buckets.contains(&b.name))
        .collect();

    info!("{} buckets to mirror", buckets.len());

    if dry_run {
        let mut preview = Vec::new();
        for bucket in &buckets {
            let objects = source.list_all_objects(&bucket.name).await?;
            preview.push(json!({ "bucket": bucket.name, "objects": objects.len() }));
        }
        return Ok(json!({ "buckets": preview, "dry_run": true }));
    }

    let mut reports = Vec::new();
    for bucket in &buckets {
        target.create_bucket(bucket).await?;
        let report = mirror_bucket(source, target, &bucket.name, options.storage_concurrency).await;
        reports.push(report);
    }

    let rewritten = rewrite_references(
        target_db,
        &options.schemas,
        source.endpoint(),
        target.endpoint(),
    )
    .await?;

    Ok(json!({
        "buckets": reports
            .iter()
            .map(|r| json!({
                "bucket": r.bucket,
                "objects": r.objects,
                "copied": r.copied,
                "failed": r.failed,
            }))
            .collect::<Vec<_>>(),
        "references_rewritten": rewritten,
    }))
}

/// Copy every object of one bucket under the concurrency bound. Failures are
/// isolated per object and never cancel sibling transfers.
async fn mirror_bucket(
    source: &StorageClient,
    target: &StorageClient,
    bucket: &str,
    concurrency: usize,
) -> BucketReport {
    let objects = match source.list_all_objects(bucket).await {
        Ok(objects) => objects,
        Err(e) => {
            warn!("failed to list bucket {}: {}", bucket, e);
            return BucketReport {
                bucket: bucket.to_string(),
                objects: 0,
                copied: 0,
                failed: 1,
            };
        }
    };

    let total = objects.len();
    info!("{}: {} objects", bucket, total);

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::with_capacity(total);

    for object in objects {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed");
        let source = source.clone();
        let target = target.clone();
        let bucket = bucket.to_string();

        let handle = tokio::spawn(async move {
            let _permit = permit;
            let content = source.download(&bucket, &object.path).await?;
            target
                .upload(&bucket, &object.path, content, object.content_type.as_deref())
                .await?;
            Ok::<String, SyncError>(object.path)
        });
        handles.push(handle);
    }

    let mut copied = 0usize;
    let mut failed = 0usize;
    for handle in handles {
        match handle.await {
            Ok(Ok(path)) => {
                debug!("{}: copied {}", bucket, path);
                copied += 1;
            }
            Ok(Err(e)) => {
                warn!("{}: object copy failed: {}", bucket, e);
                failed += 1;
            }
            Err(e) => {
                warn!("{}: copy task panicked: {}", bucket, e);
                failed += 1;
            }
        }
    }

    BucketReport {
        bucket: bucket.to_string(),
        objects: total,
        copied,
        failed,
    }
}

/// Repoint persisted textual references from the old storage endpoint to the
/// new one. A no-op when the endpoints are identical.
pub async fn rewrite_references(
    target_db: &Pool,
    schemas: &[String],
    old_endpoint: &str,
    new_endpoint: &str,
) -> Result<u64> {
    if old_endpoint == new_endpoint {
        debug!("endpoints identical, skipping reference rewrite");
        return Ok(0);
    }

    let client = target_db
        .get()
        .await
        .map_err(|e| SyncError::connection(STEP, e.to_string()))?;

    let mut rewritten: u64 = 0;

    // Known reference field: user metadata on auth records (avatar URLs and
    // the like live inside the JSON payload).
    match client
        .execute(
            "UPDATE auth.users \
             SET raw_user_meta_data = replace(raw_user_meta_data::text, $1, $2)::jsonb \
             WHERE raw_user_meta_data::text LIKE '%' || $1 || '%'",
            &[&old_endpoint, &new_endpoint],
        )
        .await
    {
        Ok(n) => rewritten += n,
        Err(e) => warn!("failed to rewrite auth metadata references: {}", e),
    }

    // Heuristic pass: text columns whose names mention "url" in the data
    // schemas. Identifiers come from the catalog and are validated before
    // interpolation.
    let columns = client
        .query(
            "SELECT table_schema, table_name, column_name \
             FROM information_schema.columns \
             WHERE table_schema = ANY($1) \
               AND data_type IN ('text', 'character varying') \
               AND column_name ILIKE '%url%'",
            &[&schemas],
        )
        .await
        .map_err(|e| SyncError::storage(STEP, format!("scanning url columns: {e}")))?;

    for row in columns {
        let schema: String = row.get(0);
        let table: String = row.get(1);
        let column: String = row.get(2);

        if !is_safe_identifier(&schema) || !is_safe_identifier(&table) || !is_safe_identifier(&column)
        {
            warn!(
                "skipping reference rewrite for unsafe identifier {}.{}.{}",
                schema, table, column
            );
            continue;
        }

        let sql = format!(
            "UPDATE {table} SET {col} = $2 || substr({col}, char_length($1) + 1) \
             WHERE {col} LIKE $1 || '%'",
            table = quote_qualified(&schema, &table),
            col = quote_ident(&column),
        );
        match client.execute(&sql, &[&old_endpoint, &new_endpoint]).await {
            Ok(n) => {
                if n > 0 {
                    info!("rewrote {} references in {}.{}.{}", n, schema, table, column);
                }
                rewritten += n;
            }
            Err(e) => warn!("failed to rewrite {}.{}.{}: {}", schema, table, column, e),
        }
    }

    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_exclusion_by_name() {
        let buckets = vec![
            Bucket {
                id: "avatars".into(),
                name: "avatars".into(),
                public: true,
                file_size_limit: None,
                allowed_mime_types: None,
            },
            Bucket {
                id: "internal".into(),
                name: "internal".into(),
                public: false,
                file_size_limit: Some(1024),
                allowed_mime_types: None,
            },
        ];
        let excluded = vec!["internal".to_string()];
        let kept: Vec<_> = buckets
            .into_iter()
            .filter(|b| !excluded.contains(&b.name))
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "avatars");
    }
}
