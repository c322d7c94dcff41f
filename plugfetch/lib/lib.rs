//! `plugfetch` is the plugin image acquisition core of a container engine.
//!
//! # Overview
//!
//! Given a human-supplied plugin reference such as
//! `registry.example.com/vendor/plugin:tag`, plugfetch resolves it against an
//! OCI-compatible registry, downloads the manifest and every referenced blob into a local
//! content-addressed store, validates that a well-formed plugin image was received, and
//! extracts the filesystem layers to a target directory while streaming progress events
//! to a caller-provided sink.
//!
//! # Architecture
//!
//! The pull is organized as a handler pipeline over the DAG of content descriptors:
//!
//! - **Resolver** — authenticates (with the plugin-specific pull scope), negotiates
//!   manifest media types with a fallback for legacy registries, and produces the root
//!   descriptor plus a fetcher bound to the repository.
//! - **Handler pipeline** — walks the DAG depth-first; the standard chain registers
//!   progress, fetches blobs into the store, collects metadata, and expands children.
//!   The plugin config media type is the terminal node.
//! - **Content store** — content-addressed and deduplicating: concurrent fetches of the
//!   same blob share one write through a per-ref-key writer lease.
//! - **Progress tracker** — detached watchers poll the store's write status and emit
//!   phase transitions independently of the fetch lifecycle.
//! - **Layer applier** — streams blobs out of the store and applies them strictly in
//!   manifest order.
//!
//! # Usage Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use plugfetch::{
//!     distribution::{AnonymousCredentials, RegistryResolver},
//!     pull::PluginPuller,
//!     store::MemoryStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let resolver = RegistryResolver::new(Arc::new(AnonymousCredentials));
//!     let puller = PluginPuller::new(MemoryStore::new());
//!
//!     let manifest = puller
//!         .pull("vendor/sample-plugin:latest", &resolver, None, "/tmp/plugin-rootfs")
//!         .await?;
//!     println!("pulled plugin with {} layer(s)", manifest.layers().len());
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`oci`] - Reference parsing and descriptor classification
//! - [`store`] - Content-addressed blob storage
//! - [`distribution`] - Registry protocol client: auth, resolve, fetch
//! - [`pull`] - Handler pipeline, progress tracking, layer application

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod distribution;
pub mod oci;
pub mod pull;
pub mod store;

pub use error::*;
pub use store::{BlobInfo, BlobWriter, CommitObserver, ContentStore, MemoryStore, WriteStatus, WriterLease};
