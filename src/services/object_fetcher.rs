//! Opens byte streams for archived objects in the remote content store.

use crate::config::S3Config;
use anyhow::Context;
use bytes::Bytes;
use futures::stream::BoxStream;
use object_store::{ObjectStore, aws::AmazonS3Builder, path::Path};
use std::sync::Arc;
use thiserror::Error;

/// Chunks of one object's payload, in order.
pub type ObjectStream = BoxStream<'static, object_store::Result<Bytes>>;

#[derive(Debug, Error)]
#[error("Error downloading \"{object_path}\": {cause}")]
pub struct FetchError {
    pub object_path: String,
    #[source]
    pub cause: object_store::Error,
}

/// Thin handle over the bucket that holds archived objects. There is no retry
/// here; a failed open is final for that entry.
#[derive(Clone)]
pub struct ObjectFetcher {
    store: Arc<dyn ObjectStore>,
}

impl ObjectFetcher {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Build an S3 client scoped to the configured bucket.
    pub fn from_config(cfg: &S3Config) -> anyhow::Result<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&cfg.bucket)
            .with_region(&cfg.region)
            .with_access_key_id(&cfg.access_key)
            .with_secret_access_key(&cfg.secret_key)
            .with_virtual_hosted_style_request(!cfg.force_path_style);
        if let Some(endpoint) = &cfg.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder
            .build()
            .with_context(|| format!("configuring S3 client for bucket `{}`", cfg.bucket))?;
        Ok(Self::new(Arc::new(store)))
    }

    /// Start reading `object_path`. The key is used as stored, without any
    /// percent-encoding. The returned stream is released when dropped.
    pub async fn open(&self, object_path: &str) -> Result<ObjectStream, FetchError> {
        let failed = |cause: object_store::Error| FetchError {
            object_path: object_path.to_string(),
            cause,
        };
        let location = Path::parse(object_path).map_err(|err| failed(err.into()))?;
        match self.store.get(&location).await {
            Ok(result) => Ok(result.into_stream()),
            Err(cause) => Err(failed(cause)),
        }
    }
}
