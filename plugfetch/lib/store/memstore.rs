use std::{
    collections::HashMap,
    io::Cursor,
    pin::Pin,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use bytes::Bytes;
use oci_spec::image::{Descriptor, Digest, DigestAlgorithm};
use sha2::{Digest as _, Sha256, Sha384, Sha512};
use tokio::{io::AsyncRead, sync::watch};

use super::{BlobInfo, BlobWriter, CommitObserver, ContentStore, WriteStatus, WriterLease};
use crate::{PlugfetchError, PlugfetchResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-memory content store.
///
/// Blobs live on the heap keyed by digest; in-flight writes are tracked per ref key with a
/// completion signal that observers and the progress tracker watch. Clones share the same
/// underlying maps, so one instance can back every pull in a process.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Shelves>>,
}

#[derive(Debug, Default)]
struct Shelves {
    /// Committed blobs keyed by digest string.
    committed: HashMap<String, CommittedBlob>,

    /// In-flight writes keyed by ref key.
    in_flight: HashMap<String, InflightWrite>,
}

#[derive(Debug, Clone)]
struct CommittedBlob {
    bytes: Bytes,
    info: BlobInfo,
}

#[derive(Debug)]
struct InflightWrite {
    offset: u64,
    total: u64,
    outcome: watch::Sender<WriteOutcome>,
}

#[derive(Debug, Clone)]
enum WriteOutcome {
    Pending,
    Committed(BlobInfo),
    Failed(String),
}

/// The primary writer for a ref key in a [`MemoryStore`].
struct MemoryWriter {
    store: MemoryStore,
    ref_key: String,
    expected: Descriptor,
    buf: Vec<u8>,
    finished: bool,
}

/// An observer of someone else's write in a [`MemoryStore`].
enum MemoryObserver {
    /// The blob was already committed when the lease was requested.
    Ready(BlobInfo),

    /// Waiting on an in-flight write.
    Waiting {
        rx: watch::Receiver<WriteOutcome>,
        digest: String,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits a blob directly, bypassing the writer lease.
    ///
    /// Used to preseed a store with content that arrived through another channel.
    pub fn put(&self, digest: &Digest, bytes: impl Into<Bytes>) {
        let bytes = bytes.into();
        let info = BlobInfo::new(digest.clone(), bytes.len() as u64);
        let mut shelves = self.inner.write().unwrap();
        shelves
            .committed
            .insert(digest.to_string(), CommittedBlob { bytes, info });
    }

    /// The number of committed blobs.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().committed.len()
    }

    /// Whether the store holds no committed blobs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fail_write(&self, ref_key: &str, reason: &str) {
        let mut shelves = self.inner.write().unwrap();
        if let Some(write) = shelves.in_flight.remove(ref_key) {
            write.outcome.send_replace(WriteOutcome::Failed(reason.to_string()));
        }
    }
}

impl MemoryWriter {
    fn verify(&self) -> PlugfetchResult<()> {
        let expected_digest = self.expected.digest();
        let actual = match expected_digest.algorithm() {
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(&self.buf)),
            DigestAlgorithm::Sha384 => hex::encode(Sha384::digest(&self.buf)),
            DigestAlgorithm::Sha512 => hex::encode(Sha512::digest(&self.buf)),
            other => {
                return Err(PlugfetchError::UnsupportedDigestAlgorithm(other.to_string()));
            }
        };

        if actual != expected_digest.digest() {
            return Err(PlugfetchError::DigestMismatch {
                expected: expected_digest.to_string(),
                actual: format!("{}:{}", expected_digest.algorithm(), actual),
            });
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ContentStore for MemoryStore {
    async fn info(&self, digest: &Digest) -> PlugfetchResult<BlobInfo> {
        let shelves = self.inner.read().unwrap();
        shelves
            .committed
            .get(&digest.to_string())
            .map(|blob| blob.info.clone())
            .ok_or_else(|| PlugfetchError::BlobNotFound(digest.clone()))
    }

    async fn status(&self, ref_key: &str) -> PlugfetchResult<WriteStatus> {
        let shelves = self.inner.read().unwrap();
        shelves
            .in_flight
            .get(ref_key)
            .map(|write| WriteStatus {
                offset: write.offset,
                total: write.total,
            })
            .ok_or_else(|| PlugfetchError::StatusNotFound(ref_key.to_string()))
    }

    async fn reader_at(
        &self,
        descriptor: &Descriptor,
    ) -> PlugfetchResult<Pin<Box<dyn AsyncRead + Send>>> {
        let shelves = self.inner.read().unwrap();
        let blob = shelves
            .committed
            .get(&descriptor.digest().to_string())
            .ok_or_else(|| PlugfetchError::BlobNotFound(descriptor.digest().clone()))?;
        Ok(Box::pin(Cursor::new(blob.bytes.clone())))
    }

    async fn writer(&self, ref_key: &str, expected: &Descriptor) -> PlugfetchResult<WriterLease> {
        let mut shelves = self.inner.write().unwrap();

        if let Some(write) = shelves.in_flight.get(ref_key) {
            return Ok(WriterLease::Observer(Box::new(MemoryObserver::Waiting {
                rx: write.outcome.subscribe(),
                digest: expected.digest().to_string(),
            })));
        }

        if let Some(blob) = shelves.committed.get(&expected.digest().to_string()) {
            return Ok(WriterLease::Observer(Box::new(MemoryObserver::Ready(
                blob.info.clone(),
            ))));
        }

        let (outcome, _) = watch::channel(WriteOutcome::Pending);
        shelves.in_flight.insert(
            ref_key.to_string(),
            InflightWrite {
                offset: 0,
                total: expected.size(),
                outcome,
            },
        );

        Ok(WriterLease::Primary(Box::new(MemoryWriter {
            store: self.clone(),
            ref_key: ref_key.to_string(),
            expected: expected.clone(),
            buf: Vec::with_capacity(expected.size() as usize),
            finished: false,
        })))
    }
}

#[async_trait]
impl BlobWriter for MemoryWriter {
    async fn write_chunk(&mut self, chunk: Bytes) -> PlugfetchResult<()> {
        self.buf.extend_from_slice(&chunk);
        let mut shelves = self.store.inner.write().unwrap();
        if let Some(write) = shelves.in_flight.get_mut(&self.ref_key) {
            write.offset = self.buf.len() as u64;
        }
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> PlugfetchResult<BlobInfo> {
        self.finished = true;

        if let Err(err) = self.verify() {
            self.store.fail_write(&self.ref_key, &err.to_string());
            return Err(err);
        }

        let digest = self.expected.digest().clone();
        let bytes = Bytes::from(std::mem::take(&mut self.buf));
        let info = BlobInfo::new(digest.clone(), bytes.len() as u64);

        let mut shelves = self.store.inner.write().unwrap();
        shelves
            .committed
            .insert(digest.to_string(), CommittedBlob {
                bytes,
                info: info.clone(),
            });
        if let Some(write) = shelves.in_flight.remove(&self.ref_key) {
            write.outcome.send_replace(WriteOutcome::Committed(info.clone()));
        }

        Ok(info)
    }

    async fn abort(mut self: Box<Self>) {
        self.finished = true;
        self.store.fail_write(&self.ref_key, "write aborted");
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.store.fail_write(&self.ref_key, "write abandoned");
        }
    }
}

#[async_trait]
impl CommitObserver for MemoryObserver {
    async fn wait(self: Box<Self>) -> PlugfetchResult<BlobInfo> {
        match *self {
            MemoryObserver::Ready(info) => Ok(info),
            MemoryObserver::Waiting { mut rx, digest } => loop {
                let outcome = rx.borrow_and_update().clone();
                match outcome {
                    WriteOutcome::Committed(info) => return Ok(info),
                    WriteOutcome::Failed(reason) => {
                        return Err(PlugfetchError::FetchFailed { digest, reason });
                    }
                    WriteOutcome::Pending => {
                        if rx.changed().await.is_err() {
                            return Err(PlugfetchError::FetchFailed {
                                digest,
                                reason: "write abandoned".to_string(),
                            });
                        }
                    }
                }
            },
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use oci_spec::image::{DescriptorBuilder, MediaType};
    use tokio::io::AsyncReadExt;

    use super::*;

    fn layer_descriptor(bytes: &[u8]) -> Descriptor {
        let digest = Digest::from_str(&format!("sha256:{}", hex::encode(Sha256::digest(bytes))))
            .unwrap();
        DescriptorBuilder::default()
            .media_type(MediaType::ImageLayerGzip)
            .digest(digest)
            .size(bytes.len() as u64)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_memstore_write_commit_and_read_back() {
        let store = MemoryStore::new();
        let payload = b"layer bytes".to_vec();
        let desc = layer_descriptor(&payload);

        assert!(store.info(desc.digest()).await.unwrap_err().is_not_found());

        let lease = store.writer("layer-key", &desc).await.unwrap();
        let mut writer = match lease {
            WriterLease::Primary(w) => w,
            WriterLease::Observer(_) => panic!("first lease should be primary"),
        };

        writer.write_chunk(Bytes::from(payload.clone())).await.unwrap();
        let info = writer.commit().await.unwrap();
        assert_eq!(*info.get_size(), payload.len() as u64);

        let info = store.info(desc.digest()).await.unwrap();
        assert_eq!(info.get_digest(), desc.digest());

        let mut reader = store.reader_at(&desc).await.unwrap();
        let mut read_back = Vec::new();
        reader.read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, payload);
    }

    #[tokio::test]
    async fn test_memstore_status_tracks_offset() {
        let store = MemoryStore::new();
        let payload = b"0123456789".to_vec();
        let desc = layer_descriptor(&payload);

        let mut writer = match store.writer("layer-key", &desc).await.unwrap() {
            WriterLease::Primary(w) => w,
            WriterLease::Observer(_) => panic!("first lease should be primary"),
        };

        let status = store.status("layer-key").await.unwrap();
        assert_eq!(status, WriteStatus { offset: 0, total: 10 });

        writer.write_chunk(Bytes::from(payload[..4].to_vec())).await.unwrap();
        let status = store.status("layer-key").await.unwrap();
        assert_eq!(status, WriteStatus { offset: 4, total: 10 });

        writer.write_chunk(Bytes::from(payload[4..].to_vec())).await.unwrap();
        writer.commit().await.unwrap();

        // Committed writes no longer report in-flight status.
        assert!(store.status("layer-key").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_memstore_second_lease_observes_first() {
        let store = MemoryStore::new();
        let payload = b"shared layer".to_vec();
        let desc = layer_descriptor(&payload);

        let mut primary = match store.writer("layer-key", &desc).await.unwrap() {
            WriterLease::Primary(w) => w,
            WriterLease::Observer(_) => panic!("first lease should be primary"),
        };

        let observer = match store.writer("layer-key", &desc).await.unwrap() {
            WriterLease::Observer(o) => o,
            WriterLease::Primary(_) => panic!("second lease should observe"),
        };

        let waiter = tokio::spawn(observer.wait());

        primary.write_chunk(Bytes::from(payload.clone())).await.unwrap();
        primary.commit().await.unwrap();

        let info = waiter.await.unwrap().unwrap();
        assert_eq!(*info.get_size(), payload.len() as u64);
    }

    #[tokio::test]
    async fn test_memstore_committed_blob_gives_ready_observer() {
        let store = MemoryStore::new();
        let payload = b"cached".to_vec();
        let desc = layer_descriptor(&payload);
        store.put(desc.digest(), payload.clone());

        match store.writer("layer-key", &desc).await.unwrap() {
            WriterLease::Observer(o) => {
                let info = o.wait().await.unwrap();
                assert_eq!(*info.get_size(), payload.len() as u64);
            }
            WriterLease::Primary(_) => panic!("committed blob should not re-open a write"),
        }
    }

    #[tokio::test]
    async fn test_memstore_digest_mismatch_fails_commit_and_observers() {
        let store = MemoryStore::new();
        let desc = layer_descriptor(b"the real bytes");

        let mut primary = match store.writer("layer-key", &desc).await.unwrap() {
            WriterLease::Primary(w) => w,
            WriterLease::Observer(_) => panic!("first lease should be primary"),
        };
        let observer = match store.writer("layer-key", &desc).await.unwrap() {
            WriterLease::Observer(o) => o,
            WriterLease::Primary(_) => panic!("second lease should observe"),
        };

        primary.write_chunk(Bytes::from_static(b"corrupted bytes")).await.unwrap();
        let err = primary.commit().await.unwrap_err();
        assert!(matches!(err, PlugfetchError::DigestMismatch { .. }));

        let err = observer.wait().await.unwrap_err();
        assert!(matches!(err, PlugfetchError::FetchFailed { .. }));

        // Nothing was committed and the key is free again.
        assert!(store.info(desc.digest()).await.unwrap_err().is_not_found());
        assert!(matches!(
            store.writer("layer-key", &desc).await.unwrap(),
            WriterLease::Primary(_)
        ));
    }

    #[tokio::test]
    async fn test_memstore_dropped_writer_releases_key() {
        let store = MemoryStore::new();
        let desc = layer_descriptor(b"bytes");

        let lease = store.writer("layer-key", &desc).await.unwrap();
        drop(lease);

        assert!(store.status("layer-key").await.unwrap_err().is_not_found());
        assert!(matches!(
            store.writer("layer-key", &desc).await.unwrap(),
            WriterLease::Primary(_)
        ));
    }
}
