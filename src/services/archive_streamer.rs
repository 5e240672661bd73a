//! ArchiveStreamer: assembles a ZIP archive on the fly.
//!
//! For a resolved reference each descriptor is, in list order, given an
//! archive path, opened in the content store and copied chunk by chunk into a
//! streaming ZIP writer. A failing entry is logged and skipped unless the
//! streamer runs in strict mode. Nothing is buffered beyond one chunk.

use crate::{
    models::descriptor::FileDescriptor,
    services::{
        object_fetcher::{FetchError, ObjectFetcher},
        path_builder::{self, ArchiveNameRegistry, DedupScope},
        reference_resolver::{ReferenceResolver, ResolveError},
    },
};
use async_zip::{
    Compression, ZipDateTime, ZipEntryBuilder, base::write::ZipFileWriter, error::ZipError,
};
use futures::{AsyncWriteExt as _, StreamExt};
use std::{
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Skip failed entries and keep going. When false the first failure
    /// aborts the archive without finalizing it.
    pub continue_on_entry_error: bool,
    pub dedup_scope: DedupScope,
    /// Largest slice handed to the ZIP writer in one call.
    pub chunk_size: usize,
    /// Deadline for a whole request, observed through its cancellation token.
    pub request_timeout: Option<Duration>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            continue_on_entry_error: true,
            dedup_scope: DedupScope::BaseName,
            chunk_size: 64 * 1024,
            request_timeout: None,
        }
    }
}

/// Per-request tally of processed descriptors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveResult {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Why a single entry could not be written.
#[derive(Debug, Error)]
pub enum EntryError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("creating zip header: {0}")]
    Header(#[source] ZipError),
    #[error("reading object mid-stream: {0}")]
    Copy(#[source] object_store::Error),
    #[error("writing entry data: {0}")]
    Write(#[source] io::Error),
    #[error("finishing entry: {0}")]
    Finish(#[source] ZipError),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("No files found for the given reference.")]
    NoFiles,
    #[error("entry `{path}` failed: {source}")]
    EntryAborted {
        path: String,
        #[source]
        source: EntryError,
    },
    #[error("archive output closed by the receiver")]
    OutputClosed,
    #[error("closing archive output: {0}")]
    Output(#[source] io::Error),
    #[error("finalizing archive: {0}")]
    Container(#[from] ZipError),
    #[error("archive streaming cancelled")]
    Cancelled,
}

/// Orchestrates resolver, path builder and fetcher for each request.
#[derive(Clone)]
pub struct ArchiveStreamer {
    resolver: ReferenceResolver,
    fetcher: ObjectFetcher,
    options: ArchiveOptions,
}

/// A resolved, non-empty descriptor list ready to be streamed.
pub struct PreparedArchive {
    streamer: ArchiveStreamer,
    descriptors: Vec<FileDescriptor>,
}

impl ArchiveStreamer {
    pub fn new(resolver: ReferenceResolver, fetcher: ObjectFetcher, options: ArchiveOptions) -> Self {
        Self {
            resolver,
            fetcher,
            options,
        }
    }

    pub fn resolver(&self) -> &ReferenceResolver {
        &self.resolver
    }

    pub fn options(&self) -> &ArchiveOptions {
        &self.options
    }

    /// Resolve `reference` without touching any output, so the caller can
    /// still answer with an error status.
    pub async fn prepare(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<PreparedArchive, ArchiveError> {
        let descriptors = self.resolver.resolve(reference, cancel).await?;
        if descriptors.is_empty() {
            return Err(ArchiveError::NoFiles);
        }
        Ok(PreparedArchive {
            streamer: self.clone(),
            descriptors,
        })
    }

    /// Resolve `reference` and stream its archive into `out`.
    ///
    /// The HTTP handler calls `prepare` and `write_to` separately so it can
    /// answer with a status between the two.
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn stream<W>(
        &self,
        reference: &str,
        out: W,
        cancel: &CancellationToken,
    ) -> Result<ArchiveResult, ArchiveError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.prepare(reference, cancel)
            .await?
            .write_to(out, cancel)
            .await
    }

    async fn write_entry<Z>(
        &self,
        zip: &mut ZipFileWriter<Z>,
        descriptor: &FileDescriptor,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, EntryError>
    where
        Z: futures::AsyncWrite + Unpin,
    {
        let mut object = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EntryError::Cancelled),
            opened = self.fetcher.open(&descriptor.object_path) => opened?,
        };

        let mut header = ZipEntryBuilder::new(path.to_string().into(), Compression::Deflate);
        if let Some(modified) = &descriptor.modified_time {
            header = header.last_modification_date(ZipDateTime::from_chrono(modified));
        }
        let mut entry = zip
            .write_entry_stream(header)
            .await
            .map_err(EntryError::Header)?;

        // An error below drops `entry` unclosed: its bytes stay in the stream
        // but it never reaches the central directory.
        let mut written = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EntryError::Cancelled),
                next = object.next() => next,
            };
            let chunk = match next {
                Some(chunk) => chunk.map_err(EntryError::Copy)?,
                None => break,
            };
            for piece in chunk.chunks(self.options.chunk_size.max(1)) {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(EntryError::Cancelled),
                    res = entry.write_all(piece) => res.map_err(EntryError::Write)?,
                }
                written += piece.len() as u64;
            }
        }

        entry.close().await.map_err(EntryError::Finish)?;
        Ok(written)
    }
}

impl PreparedArchive {
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Write every entry into `out`, finalize the archive and shut `out` down.
    ///
    /// Once the first byte is written the response is committed; per-entry
    /// failures only show up in the returned tally and the logs.
    pub async fn write_to<W>(
        self,
        out: W,
        cancel: &CancellationToken,
    ) -> Result<ArchiveResult, ArchiveError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let streamer = &self.streamer;
        let broken = Arc::new(AtomicBool::new(false));
        let mut zip = ZipFileWriter::with_tokio(OutputGuard::new(out, broken.clone()));
        let mut registry = ArchiveNameRegistry::new(streamer.options.dedup_scope);
        let mut tally = ArchiveResult::default();

        for descriptor in &self.descriptors {
            if cancel.is_cancelled() {
                return Err(ArchiveError::Cancelled);
            }
            tally.attempted += 1;
            let path = path_builder::build_path(descriptor, &mut registry);
            debug!(
                "Processing file {}: S3Path='{}', ZipPath='{}'",
                descriptor.file_id, descriptor.object_path, path
            );

            match streamer.write_entry(&mut zip, descriptor, &path, cancel).await {
                Ok(bytes) => {
                    tally.succeeded += 1;
                    debug!("added {} ({} bytes)", path, bytes);
                }
                Err(EntryError::Cancelled) => return Err(ArchiveError::Cancelled),
                Err(_) if broken.load(Ordering::Relaxed) => {
                    return Err(ArchiveError::OutputClosed);
                }
                Err(err) => {
                    tally.failed += 1;
                    warn!(
                        "skipping {} (object {}): {}",
                        path, descriptor.object_path, err
                    );
                    if !streamer.options.continue_on_entry_error {
                        return Err(ArchiveError::EntryAborted { path, source: err });
                    }
                }
            }
        }

        let finished = zip.close().await;
        if broken.load(Ordering::Relaxed) {
            return Err(ArchiveError::OutputClosed);
        }
        let mut out = finished?.into_inner();
        out.shutdown().await.map_err(ArchiveError::Output)?;
        Ok(tally)
    }
}

/// Passes writes through and remembers whether the receiver ever failed one.
struct OutputGuard<W> {
    inner: W,
    broken: Arc<AtomicBool>,
}

impl<W> OutputGuard<W> {
    fn new(inner: W, broken: Arc<AtomicBool>) -> Self {
        Self { inner, broken }
    }

    fn record<T>(&self, polled: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        if let Poll::Ready(Err(_)) = &polled {
            self.broken.store(true, Ordering::Relaxed);
        }
        polled
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for OutputGuard<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.record(polled)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_flush(cx);
        this.record(polled)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_shutdown(cx);
        this.record(polled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        object_fetcher::testing::{Script, ScriptedStore},
        reference_resolver::testing::MemoryReferenceStore,
    };
    use bytes::Bytes;
    use object_store::{ObjectStore, PutPayload, memory::InMemory, path::Path};
    use std::io::{Cursor, Read};

    struct Entry {
        name: String,
        data: Vec<u8>,
        modified: zip::DateTime,
    }

    async fn streamer(
        record: serde_json::Value,
        objects: &[(&str, &[u8])],
        options: ArchiveOptions,
    ) -> ArchiveStreamer {
        let store = InMemory::new();
        for (key, data) in objects {
            store
                .put(&Path::parse(*key).unwrap(), PutPayload::from(data.to_vec()))
                .await
                .unwrap();
        }
        streamer_over(record, Arc::new(store), options)
    }

    fn streamer_over(
        record: serde_json::Value,
        store: Arc<dyn ObjectStore>,
        options: ArchiveOptions,
    ) -> ArchiveStreamer {
        let references =
            MemoryReferenceStore::default().with_reference("ref", record.to_string());
        ArchiveStreamer::new(
            ReferenceResolver::new(Arc::new(references)),
            ObjectFetcher::new(store),
            options,
        )
    }

    fn read_entries(bytes: &[u8]) -> Vec<Entry> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).unwrap();
        (0..archive.len())
            .map(|i| {
                let mut file = archive.by_index(i).unwrap();
                let mut data = Vec::new();
                file.read_to_end(&mut data).unwrap();
                Entry {
                    name: file.name().to_string(),
                    data,
                    modified: file.last_modified(),
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn builds_hierarchical_paths_in_list_order() {
        let record = serde_json::json!([
            {"FileName": "a.pdf", "Folder": "", "S3Path": "1/a.pdf", "ProjectID": "23216", "ProjectName": "Superman"},
            {"FileName": "a1.jpg", "Folder": "Level 1/Level 2", "S3Path": "1/a1.jpg", "ProjectID": "23216", "ProjectName": "Superman"},
        ]);
        let streamer = streamer(
            record,
            &[("1/a.pdf", b"pdf bytes".as_slice()), ("1/a1.jpg", b"jpg bytes".as_slice())],
            ArchiveOptions::default(),
        )
        .await;

        let mut out = Vec::new();
        let result = streamer
            .stream("ref", &mut out, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            result,
            ArchiveResult {
                attempted: 2,
                succeeded: 2,
                failed: 0
            }
        );
        let entries = read_entries(&out);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            ["23216.Superman/a.pdf", "23216.Superman/Level 1/Level 2/a1.jpg"]
        );
        assert_eq!(entries[0].data, b"pdf bytes");
        assert_eq!(entries[1].data, b"jpg bytes");
    }

    #[tokio::test]
    async fn unfetchable_object_is_skipped() {
        let record = serde_json::json!([
            {"FileName": "here.txt", "S3Path": "here"},
            {"FileName": "gone.txt", "S3Path": "gone"},
        ]);
        let streamer = streamer(record, &[("here", b"present".as_slice())], ArchiveOptions::default()).await;

        let mut out = Vec::new();
        let result = streamer
            .stream("ref", &mut out, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            result,
            ArchiveResult {
                attempted: 2,
                succeeded: 1,
                failed: 1
            }
        );
        let entries = read_entries(&out);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "here.txt");
    }

    #[tokio::test]
    async fn read_failure_mid_object_drops_only_that_entry() {
        let record = serde_json::json!([
            {"FileName": "a.txt", "S3Path": "a"},
            {"FileName": "b.txt", "S3Path": "bad"},
            {"FileName": "c.txt", "S3Path": "c"},
        ]);
        let store = ScriptedStore::default()
            .with_object("a", b"hello")
            .await
            .with_object("c", b"hello")
            .await
            .with_script("bad", Script::FailAfter(Bytes::from(vec![7u8; 100_000])))
            .await;
        let streamer = streamer_over(record, Arc::new(store), ArchiveOptions::default());

        let mut out = Vec::new();
        let result = streamer
            .stream("ref", &mut out, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            result,
            ArchiveResult {
                attempted: 3,
                succeeded: 2,
                failed: 1
            }
        );
        let entries = read_entries(&out);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a.txt", "c.txt"]);
        assert!(entries.iter().all(|e| e.data == b"hello"));
    }

    #[tokio::test]
    async fn strict_mode_aborts_on_read_failure() {
        let record = serde_json::json!([{"FileName": "b.txt", "S3Path": "bad"}]);
        let store = ScriptedStore::default()
            .with_script("bad", Script::FailAfter(Bytes::from_static(b"partial")))
            .await;
        let options = ArchiveOptions {
            continue_on_entry_error: false,
            ..ArchiveOptions::default()
        };
        let streamer = streamer_over(record, Arc::new(store), options);

        let mut out = Vec::new();
        let err = streamer
            .stream("ref", &mut out, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::EntryAborted {
                source: EntryError::Copy(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn strict_mode_aborts_on_first_failure() {
        let record = serde_json::json!([
            {"FileName": "gone.txt", "S3Path": "gone"},
            {"FileName": "here.txt", "S3Path": "here"},
        ]);
        let options = ArchiveOptions {
            continue_on_entry_error: false,
            ..ArchiveOptions::default()
        };
        let streamer = streamer(record, &[("here", b"present".as_slice())], options).await;

        let mut out = Vec::new();
        let err = streamer
            .stream("ref", &mut out, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ArchiveError::EntryAborted { path, source } => {
                assert_eq!(path, "gone.txt");
                assert!(matches!(source, EntryError::Fetch(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn modification_time_round_trips() {
        let record = serde_json::json!([
            {"FileName": "dated.txt", "S3Path": "dated", "modified": "2015-07-18T02:05:04Z"},
            {"FileName": "undated.txt", "S3Path": "undated", "modified": ""},
        ]);
        let streamer = streamer(
            record,
            &[("dated", b"1".as_slice()), ("undated", b"2".as_slice())],
            ArchiveOptions::default(),
        )
        .await;

        let mut out = Vec::new();
        streamer
            .stream("ref", &mut out, &CancellationToken::new())
            .await
            .unwrap();

        let entries = read_entries(&out);
        let dated = &entries[0].modified;
        assert_eq!(
            (dated.year(), dated.month(), dated.day()),
            (2015, 7, 18)
        );
        assert_eq!(
            (dated.hour(), dated.minute(), dated.second()),
            (2, 5, 4)
        );
        // The writer's zero DOS timestamp.
        assert_eq!(entries[1].modified.year(), 1980);
    }

    #[tokio::test]
    async fn utf8_names_round_trip() {
        let record = serde_json::json!([
            {"FileName": "Zürich 北京.txt", "Folder": "Répertoire", "S3Path": "u"},
        ]);
        let streamer = streamer(record, &[("u", b"unicode".as_slice())], ArchiveOptions::default()).await;

        let mut out = Vec::new();
        streamer
            .stream("ref", &mut out, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(read_entries(&out)[0].name, "Répertoire/Zürich 北京.txt");
    }

    #[tokio::test]
    async fn large_objects_are_copied_in_chunks() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let record = serde_json::json!([{"FileName": "big.bin", "S3Path": "big"}]);
        let options = ArchiveOptions {
            chunk_size: 4096,
            ..ArchiveOptions::default()
        };
        let streamer = streamer(record, &[("big", payload.as_slice())], options).await;

        let mut out = Vec::new();
        streamer
            .stream("ref", &mut out, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(read_entries(&out)[0].data, payload);
    }

    #[tokio::test]
    async fn unknown_reference_writes_nothing() {
        let streamer = streamer(serde_json::json!([]), &[], ArchiveOptions::default()).await;

        let mut out = Vec::new();
        let err = streamer
            .stream("other", &mut out, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::Resolve(ResolveError::NotFoundOrExpired)
        ));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn empty_list_reports_no_files() {
        let streamer = streamer(serde_json::json!([]), &[], ArchiveOptions::default()).await;

        let mut out = Vec::new();
        let err = streamer
            .stream("ref", &mut out, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::NoFiles));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn closed_output_stops_the_archive() {
        let record = serde_json::json!([
            {"FileName": "a.txt", "S3Path": "a"},
            {"FileName": "b.txt", "S3Path": "b"},
        ]);
        let streamer = streamer(
            record,
            &[("a", b"aaaa".as_slice()), ("b", b"bbbb".as_slice())],
            ArchiveOptions::default(),
        )
        .await;

        let (writer, reader) = tokio::io::duplex(16);
        drop(reader);
        let err = streamer
            .stream("ref", writer, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::OutputClosed));
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_entry() {
        let record = serde_json::json!([{"FileName": "a.txt", "S3Path": "a"}]);
        let streamer = streamer(record, &[("a", b"aaaa".as_slice())], ArchiveOptions::default()).await;

        let cancel = CancellationToken::new();
        let prepared = streamer.prepare("ref", &cancel).await.unwrap();
        assert_eq!(prepared.len(), 1);

        cancel.cancel();
        let mut out = Vec::new();
        let err = prepared.write_to(&mut out, &cancel).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Cancelled));
    }
}
