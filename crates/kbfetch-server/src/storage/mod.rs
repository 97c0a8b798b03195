//! Remote archive storage
//!
//! Each session carries its own storage account, so the pipeline asks a
//! [`BlobStoreFactory`] for a [`BlobStore`] per session rather than holding
//! one client for the whole process.

use crate::config::StorageConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    types::{BucketLocationConstraint, CreateBucketConfiguration},
    Client,
};
use kbfetch_common::types::StorageAccount;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Object storage reachable with one set of credentials
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create `container` if missing. An existing container is success.
    async fn ensure_container(&self, container: &str) -> Result<()>;

    /// Upload the file at `path` as `container/key`
    async fn put(&self, container: &str, key: &str, path: &Path) -> Result<()>;
}

/// Builds a [`BlobStore`] for a session's storage account
pub trait BlobStoreFactory: Send + Sync {
    fn connect(&self, account: &StorageAccount) -> Result<Arc<dyn BlobStore>>;
}

/// S3-compatible storage client
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    region: String,
}

impl S3BlobStore {
    pub fn new(config: &StorageConfig, account: &StorageAccount) -> Self {
        let credentials = Credentials::new(
            &account.name,
            &account.key,
            None,
            None,
            "kbfetch-session",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
            region: config.region.clone(),
        }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self))]
    async fn ensure_container(&self, container: &str) -> Result<()> {
        let mut request = self.client.create_bucket().bucket(container);
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!(container, "Created container");
                Ok(())
            },
            Err(err) => {
                let service_error = err.into_service_error();
                if service_error.is_bucket_already_owned_by_you()
                    || service_error.is_bucket_already_exists()
                {
                    debug!(container, "Container already exists");
                    Ok(())
                } else {
                    Err(anyhow::Error::new(service_error))
                        .with_context(|| format!("Failed to create container {}", container))
                }
            },
        }
    }

    #[instrument(skip(self))]
    async fn put(&self, container: &str, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("Failed to open {} for upload", path.display()))?;

        self.client
            .put_object()
            .bucket(container)
            .key(key)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload s3://{}/{}", container, key))?;

        info!(container, key, "Uploaded object");
        Ok(())
    }
}

/// Builds [`S3BlobStore`]s against the configured endpoint
#[derive(Debug, Clone)]
pub struct S3BlobStoreFactory {
    config: StorageConfig,
}

impl S3BlobStoreFactory {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }
}

impl BlobStoreFactory for S3BlobStoreFactory {
    fn connect(&self, account: &StorageAccount) -> Result<Arc<dyn BlobStore>> {
        if account.name.is_empty() || account.key.is_empty() {
            anyhow::bail!("Storage account credentials are incomplete");
        }
        Ok(Arc::new(S3BlobStore::new(&self.config, account)))
    }
}
