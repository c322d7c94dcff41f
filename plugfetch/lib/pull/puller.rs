use std::{
    path::Path,
    pin::Pin,
    sync::{Arc, Mutex},
};

use oci_spec::image::ImageManifest;
use reqwest::header::HeaderMap;
use tokio::io::{AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;

use super::{
    apply::{apply_layers, LayerApplier, TarLayerApplier},
    handlers::{dispatch, ChildrenHandler, FetchHandler, FetchMeta, Handler, Handlers, MetadataHandler},
    progress::{progress_channel, ProgressFlush, ProgressHandler, ProgressSink, ProgressWatchers},
};
use crate::{
    distribution::{CredentialProvider, RegistryResolver, Resolver},
    oci::Reference,
    ContentStore, PlugfetchError, PlugfetchResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Orchestrates the acquisition of one plugin image: resolve, walk, validate, apply.
///
/// The content store is shared process-wide; everything else about a pull (its progress
/// channel, its watchers, its layer application) belongs to the single [`pull`] call.
///
/// [`pull`]: PluginPuller::pull
pub struct PluginPuller<S: ContentStore> {
    store: S,
    applier: Arc<dyn LayerApplier>,
    tail_handlers: Vec<Arc<dyn Handler>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<S: ContentStore> PluginPuller<S> {
    /// Creates a puller over the shared store with the built-in tar applier.
    pub fn new(store: S) -> Self {
        Self::with_applier(store, Arc::new(TarLayerApplier::new()))
    }

    /// Creates a puller that extracts layers through the given applier, typically the
    /// engine's chroot-isolated primitive.
    pub fn with_applier(store: S, applier: Arc<dyn LayerApplier>) -> Self {
        Self {
            store,
            applier,
            tail_handlers: Vec::new(),
        }
    }

    /// Appends a handler run after the standard chain for every visited descriptor.
    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.tail_handlers.push(handler);
        self
    }

    /// Pulls a plugin image and applies its layers to `target_dir`.
    ///
    /// Progress events are streamed as newline-delimited JSON to `progress_out`; pass
    /// `None` to discard them. Returns the image manifest on success.
    pub async fn pull(
        &self,
        reference: &str,
        resolver: &dyn Resolver,
        progress_out: Option<Pin<Box<dyn AsyncWrite + Send>>>,
        target_dir: impl AsRef<Path>,
    ) -> PlugfetchResult<ImageManifest> {
        self.pull_with_cancellation(
            reference,
            resolver,
            progress_out,
            target_dir,
            CancellationToken::new(),
        )
        .await
    }

    /// Like [`pull`](PluginPuller::pull), with a caller-controlled cancellation token.
    ///
    /// Cancellation aborts the walk and surfaces as [`PlugfetchError::Cancelled`]. The
    /// call still waits for its progress watchers to reach their terminal states and for
    /// the progress writer to drain before returning.
    pub async fn pull_with_cancellation(
        &self,
        reference: &str,
        resolver: &dyn Resolver,
        progress_out: Option<Pin<Box<dyn AsyncWrite + Send>>>,
        target_dir: impl AsRef<Path>,
        cancel: CancellationToken,
    ) -> PlugfetchResult<ImageManifest> {
        let reference: Reference = reference.parse()?;

        let (sink, flush) = match progress_out {
            Some(out) => progress_channel(out),
            None => (ProgressSink::discard(), ProgressFlush::noop()),
        };
        let watchers = ProgressWatchers::new();

        // Watchers observe a child token: they must keep polling while the walk runs
        // even if it outlives individual fetches, but once the walk ends nothing new can
        // commit, so they are released. A committed blob still reports its completion.
        let watcher_cancel = cancel.child_token();

        let result = self
            .run(
                &reference,
                resolver,
                &sink,
                target_dir.as_ref(),
                &cancel,
                &watcher_cancel,
                &watchers,
            )
            .await;

        // The done barrier: watchers hold sink clones and must reach their terminal
        // states first; only then can the writer task see the channel close and drain.
        watcher_cancel.cancel();
        watchers.wait_all().await;
        drop(sink);
        flush.done().await;

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        reference: &Reference,
        resolver: &dyn Resolver,
        sink: &ProgressSink,
        target_dir: &Path,
        cancel: &CancellationToken,
        watcher_cancel: &CancellationToken,
        watchers: &ProgressWatchers,
    ) -> PlugfetchResult<ImageManifest> {
        let resolved = tokio::select! {
            _ = cancel.cancelled() => return Err(PlugfetchError::Cancelled),
            resolved = resolver.resolve(reference) => resolved?,
        };
        tracing::debug!(canonical = %resolved.get_canonical(), "resolved plugin reference");

        let fetcher = resolver.fetcher(reference).await?;

        let meta = Arc::new(Mutex::new(FetchMeta::default()));
        let mut chain: Vec<Arc<dyn Handler>> = vec![
            Arc::new(ProgressHandler::new(
                self.store.clone(),
                sink.clone(),
                reference.clone(),
                fetcher.clone(),
                watcher_cancel.clone(),
                watchers.clone(),
            )),
            Arc::new(FetchHandler::new(
                self.store.clone(),
                fetcher.clone(),
                cancel.clone(),
            )),
            Arc::new(MetadataHandler::new(meta.clone())),
            Arc::new(ChildrenHandler::new(self.store.clone())),
        ];
        chain.extend(self.tail_handlers.iter().cloned());
        let chain = Handlers::new(chain);

        dispatch(&chain, resolved.get_descriptor(), cancel).await?;

        let meta = meta.lock().unwrap().clone();
        meta.validate()?;
        let manifest_descriptor = match meta.get_manifest() {
            Some(descriptor) => descriptor.clone(),
            None => return Err(PlugfetchError::IncompleteManifest { missing: "manifest" }),
        };

        apply_layers(
            &self.store,
            self.applier.as_ref(),
            meta.get_layers(),
            target_dir,
            sink,
        )
        .await?;

        let mut reader = self.store.reader_at(&manifest_descriptor).await?;
        let mut bytes = Vec::with_capacity(manifest_descriptor.size() as usize);
        reader.read_to_end(&mut bytes).await?;
        let manifest: ImageManifest = serde_json::from_slice(&bytes).map_err(|e| {
            PlugfetchError::InvalidManifest(format!(
                "manifest {} did not parse: {e}",
                manifest_descriptor.digest()
            ))
        })?;

        Ok(manifest)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Pulls a plugin image from its registry in one call.
///
/// Wires a [`RegistryResolver`] from the credential provider and meta headers, pulls
/// `reference` through the shared store, applies the layers to `target_dir`, and returns
/// the manifest. Streams progress to `progress_out` as newline-delimited JSON; `None`
/// discards it.
pub async fn pull_plugin<S: ContentStore>(
    store: S,
    reference: &str,
    credentials: Arc<dyn CredentialProvider>,
    meta_headers: HeaderMap,
    progress_out: Option<Pin<Box<dyn AsyncWrite + Send>>>,
    target_dir: impl AsRef<Path>,
) -> PlugfetchResult<ImageManifest> {
    let resolver = RegistryResolver::new(credentials).with_meta_headers(meta_headers);
    PluginPuller::new(store)
        .pull(reference, &resolver, progress_out, target_dir)
        .await
}
