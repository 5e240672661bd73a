//! Resolves an opaque archive reference into its list of file descriptors.
//!
//! References live in the key-value backend under `zip:{ref}`. A missing key
//! is the normal outcome for an expired or forged link.

use crate::{config::RedisConfig, models::descriptor::FileDescriptor};
use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use deadpool_redis::{Manager, Pool, Runtime};
use redis::IntoConnectionInfo;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const REFERENCE_KEY_PREFIX: &str = "zip:";

/// Layout of the `modified` field, always UTC.
pub const MODIFIED_LAYOUT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Access Denied (sorry your link has timed out)")]
    NotFoundOrExpired,
    #[error("Access Denied (the stored file list could not be read)")]
    MalformedRecord {
        raw: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Access Denied (reference store unavailable: {0})")]
    Store(#[from] StoreError),
    #[error("request cancelled while resolving reference")]
    Cancelled,
}

/// Read side of the key-value backend.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Fetch the raw value stored under `key`, `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Round-trip a liveness check.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Redis-backed [`ReferenceStore`] using a bounded deadpool.
///
/// Deadpool's redis manager sends `PING` before handing an idle connection
/// back out, so a dead connection is dropped instead of reused.
#[derive(Clone)]
pub struct RedisReferenceStore {
    pool: Pool,
}

impl RedisReferenceStore {
    pub fn connect(cfg: &RedisConfig) -> anyhow::Result<Self> {
        let url = if cfg.url.contains("://") {
            cfg.url.clone()
        } else {
            format!("redis://{}", cfg.url)
        };
        let mut info = url
            .as_str()
            .into_connection_info()
            .with_context(|| format!("parsing REDIS_URL `{}`", cfg.url))?;
        if let Some(auth) = &cfg.auth {
            info.redis.password = Some(auth.clone());
        }

        let manager = Manager::new(info).context("creating redis connection manager")?;
        let pool = Pool::builder(manager)
            .max_size(cfg.max_connections)
            .wait_timeout(Some(cfg.wait_timeout))
            .create_timeout(Some(cfg.wait_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .context("building redis connection pool")?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl ReferenceStore for RedisReferenceStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.pool.get().await?;
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Turns references into ordered descriptor lists.
#[derive(Clone)]
pub struct ReferenceResolver {
    store: Arc<dyn ReferenceStore>,
}

impl ReferenceResolver {
    pub fn new(store: Arc<dyn ReferenceStore>) -> Self {
        Self { store }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }

    /// Look up `zip:{reference}` and decode the stored list.
    ///
    /// Each descriptor's `modified_at` is parsed with [`MODIFIED_LAYOUT`];
    /// a value that does not parse leaves `modified_time` unset and does not
    /// fail the call.
    pub async fn resolve(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileDescriptor>, ResolveError> {
        let key = format!("{}{}", REFERENCE_KEY_PREFIX, reference);
        let value = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
            value = self.store.get(&key) => value?,
        };
        let raw = value.ok_or(ResolveError::NotFoundOrExpired)?;

        // A stored JSON `null` is an empty list.
        let mut files: Vec<FileDescriptor> =
            match serde_json::from_slice::<Option<Vec<FileDescriptor>>>(&raw) {
                Ok(files) => files.unwrap_or_default(),
                Err(source) => {
                    let raw = String::from_utf8_lossy(&raw).into_owned();
                    warn!("Error decoding reference record {}: {} ({})", key, source, raw);
                    return Err(ResolveError::MalformedRecord { raw, source });
                }
            };

        for file in &mut files {
            file.modified_time = parse_modified(&file.modified_at);
        }
        Ok(files)
    }
}

fn parse_modified(raw: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    match NaiveDateTime::parse_from_str(raw, MODIFIED_LAYOUT) {
        Ok(naive) => Some(naive.and_utc()),
        Err(err) => {
            if !raw.is_empty() {
                debug!("unparsable modified timestamp `{}`: {}", raw, err);
            }
            None
        }
    }
}
