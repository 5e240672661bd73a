//! HTTP handlers for archive downloads.
//!
//! The reference is resolved before any response is committed so lookup
//! failures still get a proper status. The archive itself is written by a
//! spawned task into an in-process pipe whose read half is the response body.

use crate::{
    errors::AppError,
    services::{archive_streamer::ArchiveStreamer, path_builder::sanitize_or},
};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use std::{
    io,
    time::{Duration, Instant},
};
use tokio::sync::oneshot;
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

pub const DEFAULT_DOWNLOAD_NAME: &str = "download.zip";
const PIPE_CAPACITY: usize = 64 * 1024;
const USAGE: &str = "S3 File Zipper. Pass ?ref= to use.";

#[derive(Debug, Deserialize)]
pub struct ZipQuery {
    #[serde(rename = "ref")]
    pub reference: Option<String>,
    pub downloadas: Option<String>,
}

/// `GET /`: usage hint.
pub async fn index(uri: Uri) -> impl IntoResponse {
    info!("Request to root path: {}. Sending instructions.", uri);
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "This is the s3zipper service. Use the /s3zipper endpoint with the 'ref' query parameter to create a zip file.",
    )
}

/// `GET /s3zipper?ref=...&downloadas=...`: stream the referenced archive.
pub async fn download_zip(
    State(service): State<ArchiveStreamer>,
    Query(q): Query<ZipQuery>,
    uri: Uri,
) -> Result<Response, AppError> {
    let start = Instant::now();
    let reference = q
        .reference
        .filter(|r| !r.is_empty())
        .ok_or_else(|| AppError::bad_request(USAGE))?;
    let download_as = sanitize_or(q.downloadas.as_deref().unwrap_or(""), DEFAULT_DOWNLOAD_NAME);

    let span = info_span!("archive", request_id = %Uuid::new_v4());
    let cancel = CancellationToken::new();
    // Cancels the deadline watcher on every exit path, including errors below.
    let guard = cancel.clone().drop_guard();
    if let Some(limit) = service.options().request_timeout {
        spawn_deadline(cancel.clone(), limit);
    }

    let prepared = match service
        .prepare(&reference, &cancel)
        .instrument(span.clone())
        .await
    {
        Ok(prepared) => prepared,
        Err(err) => {
            warn!(parent: &span, "GET\t{}\t{}", uri, err);
            return Err(err.into());
        }
    };
    info!(parent: &span, "Found {} files for ref '{}'", prepared.len(), reference);

    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let (done_tx, done_rx) = oneshot::channel::<Result<(), String>>();
    tokio::spawn(
        async move {
            let _guard = guard;
            let outcome = match prepared.write_to(writer, &cancel).await {
                Ok(result) => {
                    info!(
                        "GET\t{}\t{:?}\tattempted={} succeeded={} failed={}",
                        uri,
                        start.elapsed(),
                        result.attempted,
                        result.succeeded,
                        result.failed
                    );
                    Ok(())
                }
                Err(err) => {
                    warn!("GET\t{}\tarchive aborted after {:?}: {}", uri, start.elapsed(), err);
                    Err(err.to_string())
                }
            };
            let _ = done_tx.send(outcome);
        }
        .instrument(span),
    );

    // After the pipe drains, fail the body if the archive was aborted so the
    // client sees a broken transfer instead of a short file.
    let tail = futures::stream::once(done_rx).filter_map(|outcome| async move {
        let item: Option<io::Result<Bytes>> = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(msg)) => Some(Err(io::Error::other(msg))),
            Err(_) => Some(Err(io::Error::other("archive task ended unexpectedly"))),
        };
        item
    });
    let body = Body::from_stream(ReaderStream::new(reader).chain(tail));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&download_as));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/zip"),
    );
    Ok(response)
}

fn content_disposition(download_as: &str) -> HeaderValue {
    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", download_as))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"download.zip\""))
}

fn spawn_deadline(cancel: CancellationToken, limit: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(limit) => {
                warn!("request deadline of {:?} reached, cancelling", limit);
                cancel.cancel();
            }
        }
    });
}
