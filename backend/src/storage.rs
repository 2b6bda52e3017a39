use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use object_store::{aws::AmazonS3Builder, path::Path, ObjectStore};
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::health::StorageProbe;

/// S3 (or S3-compatible) client for the configured bucket
pub fn build_object_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(&config.bucket)
        .with_region(&config.region);

    if config.is_custom_endpoint() {
        if let Some(endpoint) = &config.endpoint {
            // MinIO and friends want path-style requests
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(endpoint.starts_with("http://"));
        }
    }

    if let Some(key) = &config.access_key_id {
        builder = builder.with_access_key_id(key);
    }
    if let Some(secret) = &config.secret_access_key {
        builder = builder.with_secret_access_key(secret);
    }

    let store = builder
        .build()
        .map_err(|e| anyhow::anyhow!("S3 client for bucket '{}': {}", config.bucket, e))?;
    Ok(Arc::new(store))
}

/// Lists under a fixed prefix to prove the bucket is reachable
pub struct ObjectStorageProbe {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
}

impl ObjectStorageProbe {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: Path::from(prefix),
        }
    }
}

#[async_trait]
impl StorageProbe for ObjectStorageProbe {
    async fn list_probe_prefix(&self, max_keys: usize) -> anyhow::Result<usize> {
        let listed: Vec<_> = self
            .store
            .list(Some(&self.prefix))
            .take(max_keys)
            .try_collect()
            .await?;
        Ok(listed.len())
    }
}
