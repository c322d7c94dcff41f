use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt, StreamExt};
use getset::Getters;
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::{
    distribution::Fetcher,
    oci::DescriptorKind,
    BlobWriter, ContentStore, PlugfetchError, PlugfetchResult, WriterLease,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A left-to-right composition of handlers.
///
/// Each handler in the chain runs for every descriptor; the children they emit are
/// concatenated. Standard handlers return no children because expansion is the children
/// handler's job, but caller-supplied tail handlers may add their own.
pub struct Handlers {
    chain: Vec<Arc<dyn Handler>>,
}

/// Handler that fetches a descriptor's blob into the content store.
///
/// A blob already committed is skipped outright; an in-flight write under the same ref key
/// is joined rather than duplicated, which is what makes concurrent pulls of the same
/// reference cost one transfer per digest.
pub struct FetchHandler<S: ContentStore> {
    store: S,
    fetcher: Arc<dyn Fetcher>,
    cancel: CancellationToken,
}

/// What the walk learned about the plugin image, in traversal order.
#[derive(Debug, Clone, Default, Getters)]
#[getset(get = "pub with_prefix")]
pub struct FetchMeta {
    /// The manifest descriptor, exactly one per well-formed image.
    manifest: Option<Descriptor>,

    /// The plugin config descriptor, exactly one per well-formed image.
    config: Option<Descriptor>,

    /// Layer descriptors in manifest order, foreign layers included.
    layers: Vec<Descriptor>,
}

/// Handler that classifies visited descriptors into a [`FetchMeta`].
pub struct MetadataHandler {
    meta: Arc<Mutex<FetchMeta>>,
}

/// Handler that expands manifests and indexes into their child descriptors.
///
/// The plugin config is the terminal node: the walk stops there without ever parsing its
/// bytes as a manifest.
pub struct ChildrenHandler<S: ContentStore> {
    store: S,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// One stage of the descriptor pipeline.
///
/// Returns the children to walk next, or an empty list to go no deeper from this handler's
/// point of view. Errors short-circuit the walk.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Processes a descriptor and returns its children.
    async fn handle(&self, descriptor: &Descriptor) -> PlugfetchResult<Vec<Descriptor>>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Handlers {
    /// Composes handlers left to right.
    pub fn new(chain: Vec<Arc<dyn Handler>>) -> Self {
        Self { chain }
    }
}

impl<S: ContentStore> FetchHandler<S> {
    /// Creates the fetch handler for one pull.
    pub fn new(store: S, fetcher: Arc<dyn Fetcher>, cancel: CancellationToken) -> Self {
        Self {
            store,
            fetcher,
            cancel,
        }
    }

    async fn transfer(
        &self,
        descriptor: &Descriptor,
        mut writer: Box<dyn BlobWriter>,
    ) -> PlugfetchResult<()> {
        let digest = descriptor.digest().to_string();

        let stream = tokio::select! {
            _ = self.cancel.cancelled() => {
                writer.abort().await;
                return Err(PlugfetchError::Cancelled);
            }
            stream = self.fetcher.fetch(descriptor) => match stream {
                Ok(stream) => stream,
                Err(err) => {
                    writer.abort().await;
                    return Err(err);
                }
            },
        };
        let mut stream = stream;

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => {
                    writer.abort().await;
                    return Err(PlugfetchError::Cancelled);
                }
                chunk = stream.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    if let Err(err) = writer.write_chunk(bytes).await {
                        writer.abort().await;
                        return Err(PlugfetchError::FetchFailed {
                            digest,
                            reason: err.to_string(),
                        });
                    }
                }
                Some(Err(err)) => {
                    writer.abort().await;
                    return Err(PlugfetchError::FetchFailed {
                        digest,
                        reason: err.to_string(),
                    });
                }
                None => break,
            }
        }

        writer
            .commit()
            .await
            .map_err(|err| PlugfetchError::FetchFailed {
                digest,
                reason: err.to_string(),
            })?;
        Ok(())
    }
}

impl FetchMeta {
    /// Checks the walk produced a complete plugin image.
    ///
    /// An empty layer list is fine (a scratch plugin); a missing manifest or config is not.
    pub fn validate(&self) -> PlugfetchResult<()> {
        if self.config.is_none() {
            return Err(PlugfetchError::IncompleteManifest { missing: "config" });
        }
        if self.manifest.is_none() {
            return Err(PlugfetchError::IncompleteManifest { missing: "manifest" });
        }
        Ok(())
    }
}

impl MetadataHandler {
    /// Creates a collector writing into the shared meta record.
    pub fn new(meta: Arc<Mutex<FetchMeta>>) -> Self {
        Self { meta }
    }
}

impl<S: ContentStore> ChildrenHandler<S> {
    /// Creates an expander reading manifests back out of the store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    async fn read_blob(&self, descriptor: &Descriptor) -> PlugfetchResult<Vec<u8>> {
        let mut reader = self.store.reader_at(descriptor).await?;
        let mut bytes = Vec::with_capacity(descriptor.size() as usize);
        reader.read_to_end(&mut bytes).await?;
        Ok(bytes)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Handler for Handlers {
    async fn handle(&self, descriptor: &Descriptor) -> PlugfetchResult<Vec<Descriptor>> {
        let mut children = Vec::new();
        for handler in &self.chain {
            children.extend(handler.handle(descriptor).await?);
        }
        Ok(children)
    }
}

#[async_trait]
impl<S: ContentStore> Handler for FetchHandler<S> {
    async fn handle(&self, descriptor: &Descriptor) -> PlugfetchResult<Vec<Descriptor>> {
        if DescriptorKind::of(descriptor) == DescriptorKind::ForeignLayer {
            tracing::debug!(digest = %descriptor.digest(), "skipping foreign layer fetch");
            return Ok(Vec::new());
        }

        if self.store.info(descriptor.digest()).await.is_ok() {
            tracing::debug!(digest = %descriptor.digest(), "content already in store");
            return Ok(Vec::new());
        }

        let ref_key = self.fetcher.ref_key(descriptor);
        match self.store.writer(&ref_key, descriptor).await? {
            WriterLease::Primary(writer) => {
                self.transfer(descriptor, writer).await?;
            }
            WriterLease::Observer(observer) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(PlugfetchError::Cancelled),
                    outcome = observer.wait() => { outcome?; }
                }
            }
        }

        Ok(Vec::new())
    }
}

#[async_trait]
impl Handler for MetadataHandler {
    async fn handle(&self, descriptor: &Descriptor) -> PlugfetchResult<Vec<Descriptor>> {
        let mut meta = self.meta.lock().unwrap();
        match DescriptorKind::of(descriptor) {
            DescriptorKind::ImageLayer | DescriptorKind::ForeignLayer => {
                meta.layers.push(descriptor.clone());
            }
            DescriptorKind::Manifest => {
                meta.manifest = Some(descriptor.clone());
            }
            DescriptorKind::PluginConfig => {
                meta.config = Some(descriptor.clone());
            }
            _ => {}
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl<S: ContentStore> Handler for ChildrenHandler<S> {
    async fn handle(&self, descriptor: &Descriptor) -> PlugfetchResult<Vec<Descriptor>> {
        match DescriptorKind::of(descriptor) {
            DescriptorKind::Manifest => {
                let bytes = self.read_blob(descriptor).await?;
                let manifest: ImageManifest = serde_json::from_slice(&bytes).map_err(|e| {
                    PlugfetchError::InvalidManifest(format!(
                        "manifest {} did not parse: {e}",
                        descriptor.digest()
                    ))
                })?;

                let mut children = vec![manifest.config().clone()];
                children.extend(manifest.layers().iter().cloned());
                Ok(children)
            }
            DescriptorKind::ManifestIndex => {
                let bytes = self.read_blob(descriptor).await?;
                let index: ImageIndex = serde_json::from_slice(&bytes).map_err(|e| {
                    PlugfetchError::InvalidManifest(format!(
                        "index {} did not parse: {e}",
                        descriptor.digest()
                    ))
                })?;
                Ok(index.manifests().clone())
            }
            // The plugin config is terminal, and layers have no children to begin with.
            _ => Ok(Vec::new()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Drives a depth-first walk of the descriptor DAG from `root`.
///
/// For each node the handler chain runs once; every child it returns is walked in order
/// before its siblings. Cancellation is checked between nodes and aborts the walk.
pub async fn dispatch(
    handler: &dyn Handler,
    root: &Descriptor,
    cancel: &CancellationToken,
) -> PlugfetchResult<()> {
    walk(handler, root, cancel).await
}

fn walk<'a>(
    handler: &'a dyn Handler,
    descriptor: &'a Descriptor,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, PlugfetchResult<()>> {
    async move {
        if cancel.is_cancelled() {
            return Err(PlugfetchError::Cancelled);
        }

        let children = handler.handle(descriptor).await?;
        for child in &children {
            walk(handler, child, cancel).await?;
        }
        Ok(())
    }
    .boxed()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
