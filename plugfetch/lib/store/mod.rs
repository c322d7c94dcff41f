//! Content-addressed blob storage.
//!
//! The store keys committed blobs by digest and in-flight writes by ref key. The writer
//! call hands out a lease: the first caller for a ref key gets the primary writer and is
//! responsible for streaming the bytes; everyone else gets an observer that waits on the
//! same write, so a blob crosses the network at most once no matter how many pulls want it.

mod memstore;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use getset::Getters;
use oci_spec::image::{Descriptor, Digest};
use tokio::io::AsyncRead;

use crate::PlugfetchResult;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use memstore::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Metadata for a blob that is fully committed to the store.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct BlobInfo {
    /// The digest of the committed bytes.
    digest: Digest,

    /// The committed size in bytes.
    size: u64,

    /// When the blob was committed.
    created_at: DateTime<Utc>,
}

/// Progress of an in-flight write, as reported under its ref key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStatus {
    /// Bytes received so far.
    pub offset: u64,

    /// Expected total, taken from the descriptor the write was opened with.
    pub total: u64,
}

/// The two sides of the writer lease for a ref key.
pub enum WriterLease {
    /// This caller owns the write: it streams the bytes and commits.
    Primary(Box<dyn BlobWriter>),

    /// Another caller owns the write; this observer resolves when that write commits.
    Observer(Box<dyn CommitObserver>),
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A content-addressed blob repository shared by every pull in the process.
///
/// Implementations serialize writes per ref key internally; at most one caller at any
/// instant is pushing bytes for a given key.
#[async_trait]
pub trait ContentStore: Clone + Send + Sync + 'static {
    /// Looks up a fully committed blob.
    ///
    /// Returns [`PlugfetchError::BlobNotFound`](crate::PlugfetchError::BlobNotFound) when
    /// the digest has never been committed, which callers use as the "do we need to fetch
    /// this at all" test.
    async fn info(&self, digest: &Digest) -> PlugfetchResult<BlobInfo>;

    /// Reports the progress of the in-flight write under a ref key.
    ///
    /// Returns [`PlugfetchError::StatusNotFound`](crate::PlugfetchError::StatusNotFound)
    /// when no writer is currently active under the key.
    async fn status(&self, ref_key: &str) -> PlugfetchResult<WriteStatus>;

    /// Opens a reader over a committed blob.
    async fn reader_at(
        &self,
        descriptor: &Descriptor,
    ) -> PlugfetchResult<Pin<Box<dyn AsyncRead + Send>>>;

    /// Opens or joins the unique write for a ref key.
    ///
    /// The first caller gets [`WriterLease::Primary`]; concurrent callers with the same key
    /// get [`WriterLease::Observer`] and share the outcome of the primary's write.
    async fn writer(&self, ref_key: &str, expected: &Descriptor) -> PlugfetchResult<WriterLease>;
}

/// The primary side of a writer lease.
#[async_trait]
pub trait BlobWriter: Send {
    /// Appends a chunk to the write, advancing the offset that `status` reports.
    async fn write_chunk(&mut self, chunk: Bytes) -> PlugfetchResult<()>;

    /// Verifies the received bytes against the expected digest and commits them.
    async fn commit(self: Box<Self>) -> PlugfetchResult<BlobInfo>;

    /// Discards the write, releasing the ref key and failing any observers.
    async fn abort(self: Box<Self>);
}

/// The observing side of a writer lease.
#[async_trait]
pub trait CommitObserver: Send {
    /// Resolves once the primary write commits, or fails if it is aborted.
    async fn wait(self: Box<Self>) -> PlugfetchResult<BlobInfo>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BlobInfo {
    /// Creates blob metadata stamped with the current time.
    pub fn new(digest: Digest, size: u64) -> Self {
        Self {
            digest,
            size,
            created_at: Utc::now(),
        }
    }
}
