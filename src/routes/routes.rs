//! Defines the service routes.
//!
//! - `GET /`          usage hint
//! - `GET /s3zipper`  stream the archive for `?ref=` (optional `&downloadas=`)
//! - `GET /healthz`   liveness
//! - `GET /readyz`    readiness (reference store reachable)

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        zip_handlers::{download_zip, index},
    },
    services::archive_streamer::ArchiveStreamer,
};
use axum::{Router, routing::get};

/// Build and return the router.
///
/// The router carries shared state (`ArchiveStreamer`) to all handlers.
pub fn routes() -> Router<ArchiveStreamer> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/", get(index))
        .route("/s3zipper", get(download_zip))
}
