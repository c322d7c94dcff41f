use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use oci_spec::image::{Descriptor, Digest};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant},
};
use tokio_util::sync::CancellationToken;

use super::handlers::Handler;
use crate::{
    distribution::Fetcher,
    oci::{truncate_id, DescriptorKind, Reference},
    ContentStore, PlugfetchError, PlugfetchResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often a watcher polls the content store for write status.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Capacity of the progress event channel.
const PROGRESS_CHANNEL_CAPACITY: usize = 100;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One record of the progress stream.
///
/// Serialized as newline-delimited JSON. Top-level messages carry an empty `id`; per-blob
/// events use the truncated digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// The truncated digest this event belongs to, or empty for top-level messages.
    #[serde(default)]
    pub id: String,

    /// What is happening, e.g. `Downloading` or `Already exists`.
    pub action: String,

    /// Bytes done so far, when the action has a measurable position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<i64>,

    /// Expected total bytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,

    /// Marks the final event for this `id`.
    #[serde(default)]
    pub last_update: bool,
}

/// The sending half of a pull's progress stream.
///
/// Clones share the same channel; a sink created with [`ProgressSink::discard`] swallows
/// everything, which is how a `None` progress output is represented.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

/// Handle used by the orchestrator to drain the progress writer before returning.
#[derive(Debug)]
pub struct ProgressFlush {
    handle: Option<JoinHandle<()>>,
}

/// The set of watcher tasks spawned for one pull, joined before the pull returns.
#[derive(Debug, Clone, Default)]
pub struct ProgressWatchers {
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Handler that translates content-store write activity into progress events.
///
/// Manifests get the top-line `Pulling from …` and `Digest: …` messages; layers get a
/// per-blob watcher task. Everything else passes through silently.
pub struct ProgressHandler<S: ContentStore> {
    store: S,
    sink: ProgressSink,
    reference: Reference,
    fetcher: Arc<dyn Fetcher>,
    cancel: CancellationToken,
    watchers: ProgressWatchers,
}

/// Wraps a blob reader, emitting a progress event for every chunk consumed.
pub(crate) struct ProgressReader<R> {
    inner: R,
    sink: ProgressSink,
    id: String,
    action: &'static str,
    total: i64,
    current: i64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProgressSink {
    /// A sink that discards every event.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Sends an event, ignoring a closed or discarded channel.
    pub async fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }

    /// Sends a plain `{id, action}` event.
    pub async fn update(&self, id: impl Into<String>, action: impl Into<String>) {
        self.send(ProgressEvent {
            id: id.into(),
            action: action.into(),
            ..Default::default()
        })
        .await;
    }

    /// Sends a top-level message with an empty id.
    pub async fn message(&self, action: impl Into<String>) {
        self.update("", action).await;
    }

    /// Sends an event without waiting for channel capacity, dropping it when full.
    ///
    /// For synchronous contexts like `poll_read`; progress is lossy by nature.
    pub fn try_send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(event);
        }
    }
}

impl ProgressFlush {
    /// A flush handle for a discarded sink; `done` resolves immediately.
    pub fn noop() -> Self {
        Self { handle: None }
    }

    /// Waits until every emitted event has reached the caller's writer.
    ///
    /// Resolves only after all sink clones are dropped, so callers drop theirs first.
    pub async fn done(self) {
        if let Some(handle) = self.handle {
            let _ = handle.await;
        }
    }
}

impl ProgressWatchers {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, handle: JoinHandle<()>) {
        self.handles.lock().unwrap().push(handle);
    }

    /// Joins every watcher spawned so far, including ones registered while waiting.
    pub async fn wait_all(&self) {
        loop {
            let handle = self.handles.lock().unwrap().pop();
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }
}

impl<S: ContentStore> ProgressHandler<S> {
    /// Creates the progress registrar for one pull.
    pub fn new(
        store: S,
        sink: ProgressSink,
        reference: Reference,
        fetcher: Arc<dyn Fetcher>,
        cancel: CancellationToken,
        watchers: ProgressWatchers,
    ) -> Self {
        Self {
            store,
            sink,
            reference,
            fetcher,
            cancel,
            watchers,
        }
    }
}

impl<R> ProgressReader<R> {
    pub(crate) fn new(inner: R, sink: ProgressSink, id: String, action: &'static str, total: i64) -> Self {
        Self {
            inner,
            sink,
            id,
            action,
            total,
            current: 0,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl<S: ContentStore> Handler for ProgressHandler<S> {
    async fn handle(&self, descriptor: &Descriptor) -> PlugfetchResult<Vec<Descriptor>> {
        match DescriptorKind::of(descriptor) {
            DescriptorKind::Manifest => {
                self.sink
                    .update(
                        self.reference.tag_or_default(),
                        format!("Pulling from {}", self.reference.familiar()),
                    )
                    .await;
                self.sink
                    .message(format!("Digest: {}", descriptor.digest()))
                    .await;
                return Ok(Vec::new());
            }
            kind if kind.tracks_progress() => {}
            _ => return Ok(Vec::new()),
        }

        let id = truncate_id(descriptor.digest());

        if self.store.info(descriptor.digest()).await.is_ok() {
            self.sink
                .send(ProgressEvent {
                    id,
                    action: "Already exists".to_string(),
                    last_update: true,
                    ..Default::default()
                })
                .await;
            return Ok(Vec::new());
        }

        self.sink.update(id.as_str(), "Waiting").await;

        self.watchers.register(spawn_status_watcher(
            self.store.clone(),
            self.sink.clone(),
            id,
            descriptor.digest().clone(),
            self.fetcher.ref_key(descriptor),
            self.cancel.clone(),
        ));

        Ok(Vec::new())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    this.current += n as i64;
                    this.sink.try_send(ProgressEvent {
                        id: this.id.clone(),
                        action: this.action.to_string(),
                        current: Some(this.current),
                        total: Some(this.total),
                        ..Default::default()
                    });
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Sets up the progress channel over a caller-supplied byte sink.
///
/// A single writer task serializes events as newline-delimited JSON, so concurrent
/// watchers never interleave partial records. The returned [`ProgressFlush`] is the done
/// barrier the orchestrator waits on.
pub fn progress_channel(
    mut out: Pin<Box<dyn AsyncWrite + Send>>,
) -> (ProgressSink, ProgressFlush) {
    let (tx, mut rx) = mpsc::channel::<ProgressEvent>(PROGRESS_CHANNEL_CAPACITY);

    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let mut line = match serde_json::to_vec(&event) {
                Ok(line) => line,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to serialize progress event");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(err) = out.write_all(&line).await {
                tracing::warn!(error = %err, "progress output closed, discarding remaining events");
                break;
            }
        }
        let _ = out.flush().await;
    });

    (
        ProgressSink { tx: Some(tx) },
        ProgressFlush {
            handle: Some(handle),
        },
    )
}

/// Spawns the background watcher for one layer's write status.
///
/// The watcher polls the store on a 100 ms cadence. Cancellation of the pull is observed,
/// but does not stop the polling by itself: a fetch in flight commits asynchronously, and
/// a pull that was aborted can still produce a committed blob that deserves its
/// `Download complete`. The watcher terminates on completion, on
/// not-in-flight + not-committed + cancelled, or on any store error.
fn spawn_status_watcher<S: ContentStore>(
    store: S,
    sink: ProgressSink,
    id: String,
    digest: Digest,
    ref_key: String,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval_at(
            Instant::now() + STATUS_POLL_INTERVAL,
            STATUS_POLL_INTERVAL,
        );
        let mut pulling = false;
        let mut ctx_err: Option<String> = None;

        loop {
            if ctx_err.is_none() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        ctx_err = Some(PlugfetchError::Cancelled.to_string());
                    }
                    _ = interval.tick() => {}
                }
            } else {
                interval.tick().await;
            }

            match store.status(&ref_key).await {
                Ok(status) => {
                    if !pulling {
                        sink.update(id.as_str(), "Pulling fs layer").await;
                        pulling = true;
                    }

                    if status.offset == status.total {
                        sink.send(ProgressEvent {
                            id,
                            action: "Download complete".to_string(),
                            current: Some(status.offset as i64),
                            last_update: true,
                            ..Default::default()
                        })
                        .await;
                        return;
                    }

                    sink.send(ProgressEvent {
                        id: id.clone(),
                        action: "Downloading".to_string(),
                        current: Some(status.offset as i64),
                        total: Some(status.total as i64),
                        ..Default::default()
                    })
                    .await;
                }
                Err(err) if err.is_not_found() => {
                    if store.info(&digest).await.is_ok() {
                        sink.send(ProgressEvent {
                            id,
                            action: "Download complete".to_string(),
                            last_update: true,
                            ..Default::default()
                        })
                        .await;
                        return;
                    }

                    if let Some(reason) = ctx_err.take() {
                        sink.update(id.as_str(), reason).await;
                        return;
                    }
                }
                Err(err) => {
                    tracing::error!(
                        layer_digest = %digest,
                        error = %err,
                        "error looking up status of plugin layer pull"
                    );
                    sink.update(id.as_str(), err.to_string()).await;
                    return;
                }
            }
        }
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bytes::Bytes;
    use oci_spec::image::{DescriptorBuilder, MediaType};
    use sha2::{Digest as _, Sha256};

    use super::*;
    use crate::{MemoryStore, WriterLease};

    #[test]
    fn test_progress_event_wire_format() {
        let event = ProgressEvent {
            id: "aaaaaaaaaaaa".to_string(),
            action: "Downloading".to_string(),
            current: Some(512),
            total: Some(1024),
            last_update: false,
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"id":"aaaaaaaaaaaa","action":"Downloading","current":512,"total":1024,"lastUpdate":false}"#
        );

        // Positionless events leave current/total out entirely.
        let event = ProgressEvent {
            id: "aaaaaaaaaaaa".to_string(),
            action: "Already exists".to_string(),
            last_update: true,
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"id":"aaaaaaaaaaaa","action":"Already exists","lastUpdate":true}"#
        );
    }

    #[tokio::test]
    async fn test_progress_channel_writes_ndjson_and_flushes() {
        let (write_half, mut read_half) = tokio::io::duplex(4096);
        let (sink, flush) = progress_channel(Box::pin(write_half));

        sink.message("Pulling from vendor/plugin").await;
        sink.update("aaaaaaaaaaaa", "Waiting").await;
        drop(sink);
        flush.done().await;

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut read_half, &mut out)
            .await
            .unwrap();
        let lines: Vec<_> = out.split(|b| *b == b'\n').filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 2);

        let first: ProgressEvent = serde_json::from_slice(lines[0]).unwrap();
        assert_eq!(first.id, "");
        assert_eq!(first.action, "Pulling from vendor/plugin");

        let second: ProgressEvent = serde_json::from_slice(lines[1]).unwrap();
        assert_eq!(second.id, "aaaaaaaaaaaa");
        assert_eq!(second.action, "Waiting");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_progress_watcher_reports_download_lifecycle() {
        let store = MemoryStore::new();
        let payload = b"watched layer bytes".to_vec();
        let digest = Digest::from_str(&format!(
            "sha256:{}",
            hex::encode(Sha256::digest(&payload))
        ))
        .unwrap();
        let descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageLayerGzip)
            .digest(digest.clone())
            .size(payload.len() as u64)
            .build()
            .unwrap();

        let (write_half, mut read_half) = tokio::io::duplex(16 * 1024);
        let (sink, flush) = progress_channel(Box::pin(write_half));

        let mut writer = match store.writer("layer-key", &descriptor).await.unwrap() {
            WriterLease::Primary(w) => w,
            WriterLease::Observer(_) => panic!("expected primary lease"),
        };

        let watcher = spawn_status_watcher(
            store.clone(),
            sink.clone(),
            "watchedlayer".to_string(),
            digest,
            "layer-key".to_string(),
            CancellationToken::new(),
        );

        // Let the watcher see the write mid-flight, then finish it.
        writer
            .write_chunk(Bytes::from(payload[..5].to_vec()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        writer
            .write_chunk(Bytes::from(payload[5..].to_vec()))
            .await
            .unwrap();
        writer.commit().await.unwrap();

        watcher.await.unwrap();
        drop(sink);
        flush.done().await;

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut read_half, &mut out)
            .await
            .unwrap();
        let events: Vec<ProgressEvent> = out
            .split(|b| *b == b'\n')
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_slice(l).unwrap())
            .collect();

        let actions: Vec<_> = events.iter().map(|e| e.action.as_str()).collect();
        let pulling = actions.iter().position(|a| *a == "Pulling fs layer");
        let complete = actions.iter().position(|a| *a == "Download complete");
        assert!(pulling.is_some(), "missing 'Pulling fs layer' in {actions:?}");
        assert!(complete.is_some(), "missing 'Download complete' in {actions:?}");
        assert!(pulling < complete);
        assert!(events.last().unwrap().last_update);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_progress_watcher_cancelled_without_write_reports_context() {
        let store = MemoryStore::new();
        let digest = Digest::from_str(
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        )
        .unwrap();

        let (write_half, mut read_half) = tokio::io::duplex(4096);
        let (sink, flush) = progress_channel(Box::pin(write_half));
        let cancel = CancellationToken::new();

        let watcher = spawn_status_watcher(
            store,
            sink.clone(),
            "cancelledblob".to_string(),
            digest,
            "layer-key".to_string(),
            cancel.clone(),
        );

        cancel.cancel();
        watcher.await.unwrap();
        drop(sink);
        flush.done().await;

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut read_half, &mut out)
            .await
            .unwrap();
        let events: Vec<ProgressEvent> = out
            .split(|b| *b == b'\n')
            .filter(|l| !l.is_empty())
            .map(|l| serde_json::from_slice(l).unwrap())
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, PlugfetchError::Cancelled.to_string());
    }
}
