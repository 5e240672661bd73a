use anyhow::Result;
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use services::{
    archive_streamer::ArchiveStreamer,
    object_fetcher::ObjectFetcher,
    reference_resolver::{RedisReferenceStore, ReferenceResolver},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config ---
    let cfg = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting s3-zipper with config: {:?}", cfg);

    // --- Backends ---
    let store = RedisReferenceStore::connect(&cfg.redis)?;
    tracing::debug!("Redis pool ready for {}", cfg.redis.url);
    let resolver = ReferenceResolver::new(Arc::new(store));

    let fetcher = ObjectFetcher::from_config(&cfg.s3)?;
    tracing::debug!("S3 client ready for bucket {}", cfg.s3.bucket);

    // --- Initialize core service ---
    let streamer = ArchiveStreamer::new(resolver, fetcher, cfg.archive_options());

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(streamer);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Running on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
