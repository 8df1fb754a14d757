//! S3-compatible object storage backend.
//!
//! The engine is synchronous end-to-end, so this backend owns a
//! current-thread tokio runtime and blocks on each SDK call. Works against
//! AWS S3 and S3-compatible services (MinIO, R2, Backblaze) via the
//! `endpoint` override.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use tokio::runtime::Runtime;
use tracing::{debug, info, trace, warn};

use super::{StorageBackend, StorageKind};
use crate::error::StorageError;

/// Documented DeleteObjects ceiling for S3-compatible APIs.
const MAX_DELETE_BATCH: usize = 1000;

/// Transient-error retry budget, standard exponential backoff.
const MAX_RETRY_ATTEMPTS: u32 = 10;

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    /// Optional key prefix acting as a virtual directory inside the bucket.
    pub bucket_path: Option<String>,
    pub region: String,
    /// Custom endpoint URL for S3-compatible services.
    pub endpoint: Option<String>,
}

/// Stores archives as objects in an S3-compatible bucket.
pub struct S3Storage {
    client: Client,
    runtime: Runtime,
    bucket: String,
    bucket_path: Option<String>,
}

impl S3Storage {
    /// Build a client and probe the bucket location.
    ///
    /// Rejected credentials or an unreachable bucket surface as
    /// [`StorageError::Unreachable`] and abort the run.
    pub fn new(config: S3Config) -> Result<Self, StorageError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "packrat-config",
        );
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .retry_config(RetryConfig::standard().with_max_attempts(MAX_RETRY_ATTEMPTS))
            .force_path_style(true);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        let client = Client::from_conf(builder.build());

        let location = runtime
            .block_on(client.get_bucket_location().bucket(&config.bucket).send())
            .map_err(|e| StorageError::Unreachable(format!("bucket '{}': {e}", config.bucket)))?;
        debug!("S3 bucket location: {:?}", location.location_constraint());

        Ok(Self {
            client,
            runtime,
            bucket: config.bucket,
            bucket_path: config.bucket_path,
        })
    }

    fn full_key(&self, id: &str) -> String {
        compose_key(self.bucket_path.as_deref(), id)
    }
}

/// Join the configured key prefix onto an id. Tolerates callers that already
/// supply the prefixed form.
fn compose_key(prefix: Option<&str>, id: &str) -> String {
    match prefix {
        None => id.to_string(),
        Some(prefix) => {
            let normalized = format!("{}/", prefix.trim_end_matches('/'));
            if id.starts_with(&normalized) {
                id.to_string()
            } else {
                format!("{normalized}{id}")
            }
        }
    }
}

/// Drop the configured key prefix from a wire key; public ids never carry it.
fn strip_key<'a>(prefix: Option<&str>, key: &'a str) -> &'a str {
    match prefix {
        None => key,
        Some(prefix) => {
            let normalized = format!("{}/", prefix.trim_end_matches('/'));
            key.strip_prefix(&normalized).unwrap_or(key)
        }
    }
}

impl StorageBackend for S3Storage {
    fn kind(&self) -> StorageKind {
        StorageKind::Aws
    }

    fn root(&self) -> String {
        match &self.bucket_path {
            Some(prefix) => format!("s3://{}/{}", self.bucket, prefix.trim_end_matches('/')),
            None => format!("s3://{}", self.bucket),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let full_prefix = self.full_key(prefix);
        self.runtime.block_on(async {
            let mut ids = Vec::new();
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix)
                .into_paginator()
                .send();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|e| {
                    StorageError::Transport(format!("list '{full_prefix}': {e}"))
                })?;
                for object in page.contents() {
                    if let Some(key) = object.key() {
                        ids.push(strip_key(self.bucket_path.as_deref(), key).to_string());
                    }
                }
            }
            Ok(ids)
        })
    }

    fn exists(&self, id: &str) -> Result<bool, StorageError> {
        let key = self.full_key(id);
        let result = self
            .runtime
            .block_on(self.client.head_object().bucket(&self.bucket).key(&key).send());
        match result {
            Ok(_) => {
                trace!("S3 file exists: '{key}'");
                Ok(true)
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    debug!("S3: '{key}' does not exist");
                    Ok(false)
                } else {
                    Err(StorageError::Transport(format!("head '{key}': {service_err}")))
                }
            }
        }
    }

    fn put(&self, local_path: &Path, id: &str) -> Result<(), StorageError> {
        let key = self.full_key(id);
        self.runtime.block_on(async {
            let body = ByteStream::from_path(local_path).await.map_err(|e| {
                StorageError::Transport(format!("read {}: {e}", local_path.display()))
            })?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(body)
                .send()
                .await
                .map_err(|e| StorageError::Transport(format!("put '{key}': {e}")))?;
            Ok::<(), StorageError>(())
        })?;
        debug!("S3 upload: {id}");
        Ok(())
    }

    /// Streams the object body into `local_path` chunk by chunk.
    fn get(&self, id: &str, local_path: &Path) -> Result<PathBuf, StorageError> {
        let key = self.full_key(id);
        self.runtime.block_on(async {
            let response = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| StorageError::Transport(format!("get '{key}': {e}")))?;

            let mut file = File::create(local_path)?;
            let mut body = response.body;
            while let Some(chunk) = body
                .try_next()
                .await
                .map_err(|e| StorageError::Transport(e.to_string()))?
            {
                file.write_all(&chunk)?;
            }
            Ok::<(), StorageError>(())
        })?;
        Ok(local_path.to_path_buf())
    }

    /// Copy, read the new key back, and only then delete the source. A copy
    /// that cannot be verified leaves the source untouched.
    fn rename(&self, old_id: &str, new_id: &str) -> Result<(), StorageError> {
        let old_key = self.full_key(old_id);
        let new_key = self.full_key(new_id);
        trace!("S3: rename '{old_key}' -> '{new_key}'");

        self.runtime
            .block_on(
                self.client
                    .copy_object()
                    .bucket(&self.bucket)
                    .copy_source(format!("{}/{}", self.bucket, old_key))
                    .key(&new_key)
                    .send(),
            )
            .map_err(|e| {
                StorageError::Transport(format!("copy '{old_key}' -> '{new_key}': {e}"))
            })?;

        if !self.exists(&new_key)? {
            return Err(StorageError::CopyNotVerified(new_key));
        }

        self.runtime
            .block_on(
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&old_key)
                    .send(),
            )
            .map_err(|e| StorageError::Transport(format!("delete '{old_key}': {e}")))?;
        debug!("S3: renamed '{old_id}' -> '{new_id}'");
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), StorageError> {
        let key = self.full_key(id);
        self.runtime
            .block_on(
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send(),
            )
            .map_err(|e| StorageError::Transport(format!("delete '{key}': {e}")))?;
        info!("S3: Delete {id}");
        Ok(())
    }

    fn delete_many(&self, ids: &[String]) -> Result<(), StorageError> {
        if ids.is_empty() {
            warn!("S3: no keys provided for deletion");
            return Ok(());
        }
        if ids.len() > MAX_DELETE_BATCH {
            return Err(StorageError::BatchTooLarge(ids.len()));
        }

        let mut objects = Vec::with_capacity(ids.len());
        for id in ids {
            let object = ObjectIdentifier::builder()
                .key(self.full_key(id))
                .build()
                .map_err(|e| StorageError::Transport(e.to_string()))?;
            objects.push(object);
        }
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(false)
            .build()
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        let response = self
            .runtime
            .block_on(
                self.client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send(),
            )
            .map_err(|e| StorageError::Transport(format!("batch delete: {e}")))?;

        let errors = response.errors();
        if !errors.is_empty() {
            for error in errors {
                warn!(
                    "S3: failed to delete '{}': {} - {}",
                    error.key().unwrap_or(""),
                    error.code().unwrap_or(""),
                    error.message().unwrap_or("")
                );
            }
            return Err(StorageError::Transport(format!(
                "{} objects failed to delete",
                errors.len()
            )));
        }
        info!("S3: deleted {} objects", response.deleted().len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_key_without_prefix() {
        assert_eq!(compose_key(None, "foo.tgz"), "foo.tgz");
    }

    #[test]
    fn test_compose_key_prepends_prefix() {
        assert_eq!(compose_key(Some("backups"), "foo.tgz"), "backups/foo.tgz");
        assert_eq!(compose_key(Some("backups/"), "foo.tgz"), "backups/foo.tgz");
    }

    #[test]
    fn test_compose_key_is_idempotent() {
        let once = compose_key(Some("backups"), "foo.tgz");
        assert_eq!(compose_key(Some("backups"), &once), once);
    }

    #[test]
    fn test_strip_key_drops_prefix() {
        assert_eq!(strip_key(Some("backups"), "backups/foo.tgz"), "foo.tgz");
        assert_eq!(strip_key(Some("backups/"), "backups/foo.tgz"), "foo.tgz");
        assert_eq!(strip_key(Some("backups"), "foo.tgz"), "foo.tgz");
        assert_eq!(strip_key(None, "foo.tgz"), "foo.tgz");
    }

    #[test]
    fn test_strip_then_compose_round_trip() {
        let prefix = Some("nested/prefix");
        let bare = strip_key(prefix, "nested/prefix/foo-20240102T030405.tgz");
        assert_eq!(bare, "foo-20240102T030405.tgz");
        assert_eq!(
            compose_key(prefix, bare),
            "nested/prefix/foo-20240102T030405.tgz"
        );
    }
}
