use std::{
    io::{BufRead, BufReader, Read},
    path::{Component, Path, PathBuf},
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use oci_spec::image::Descriptor;
use tar::Archive;
use tokio::io::AsyncRead;
use tokio_util::io::SyncIoBridge;

use super::progress::{ProgressEvent, ProgressReader, ProgressSink};
use crate::{oci, oci::DescriptorKind, ContentStore, PlugfetchError, PlugfetchResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const WHITEOUT_PREFIX: &str = ".wh.";
const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

/// The gzip magic bytes, used to sniff layer compression.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A layer applier that untars blobs directly into the target directory.
///
/// Compression is sniffed from the stream rather than trusted from the media type, and
/// whiteout markers are processed the way layered filesystems expect: `.wh.name` removes
/// `name`, `.wh..wh..opq` clears the directory it appears in. Entries that would escape
/// the target directory are rejected.
///
/// The container engine's chroot-isolated primitive can be substituted through the
/// [`LayerApplier`] trait; this implementation does not chroot.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarLayerApplier;

struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Applies one filesystem layer to a directory.
#[async_trait]
pub trait LayerApplier: Send + Sync {
    /// Extracts the layer carried by `reader` into `target_dir`, returning the number of
    /// uncompressed bytes applied.
    async fn apply(
        &self,
        target_dir: &Path,
        reader: Pin<Box<dyn AsyncRead + Send>>,
    ) -> PlugfetchResult<u64>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TarLayerApplier {
    /// Creates the applier.
    pub fn new() -> Self {
        Self
    }

    fn extract(target_dir: &Path, reader: impl Read) -> PlugfetchResult<u64> {
        let mut buffered = BufReader::new(reader);

        let head = buffered.fill_buf()?;
        let gzipped = head.starts_with(&GZIP_MAGIC);

        let applied = Arc::new(AtomicU64::new(0));
        let tar_stream: Box<dyn Read> = if gzipped {
            Box::new(CountingReader {
                inner: GzDecoder::new(buffered),
                count: applied.clone(),
            })
        } else {
            Box::new(CountingReader {
                inner: buffered,
                count: applied.clone(),
            })
        };

        let mut archive = Archive::new(tar_stream);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();

            let file_name = match path.file_name().and_then(|name| name.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };

            if file_name == WHITEOUT_OPAQUE {
                let dir = path.parent().unwrap_or_else(|| Path::new(""));
                if let Some(dir) = safe_join(target_dir, dir) {
                    clear_directory(&dir)?;
                }
                continue;
            }

            if let Some(target) = file_name.strip_prefix(WHITEOUT_PREFIX) {
                let parent = path.parent().unwrap_or_else(|| Path::new(""));
                if let Some(victim) = safe_join(target_dir, &parent.join(target)) {
                    remove_path(&victim)?;
                }
                continue;
            }

            let _ = entry.unpack_in(target_dir)?;
        }

        Ok(applied.load(Ordering::Relaxed))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl LayerApplier for TarLayerApplier {
    async fn apply(
        &self,
        target_dir: &Path,
        reader: Pin<Box<dyn AsyncRead + Send>>,
    ) -> PlugfetchResult<u64> {
        let target_dir = target_dir.to_path_buf();
        let bridge = SyncIoBridge::new(reader);

        tokio::task::spawn_blocking(move || Self::extract(&target_dir, bridge))
            .await
            .map_err(PlugfetchError::custom)?
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Applies the fetched layers to the target directory, strictly in manifest order.
///
/// Layer N may overwrite or white-out paths written by layer N-1, so parallel extraction
/// is not an option. Foreign layers are recorded in the metadata but never applied.
pub async fn apply_layers<S: ContentStore>(
    store: &S,
    applier: &dyn LayerApplier,
    layers: &[Descriptor],
    target_dir: &Path,
    sink: &ProgressSink,
) -> PlugfetchResult<()> {
    tokio::fs::create_dir_all(target_dir).await?;

    for descriptor in layers {
        if DescriptorKind::of(descriptor) == DescriptorKind::ForeignLayer {
            tracing::debug!(digest = %descriptor.digest(), "not applying foreign layer");
            continue;
        }

        let reader = store.reader_at(descriptor).await?;
        let id = oci::truncate_id(descriptor.digest());
        let reader = ProgressReader::new(
            reader,
            sink.clone(),
            id.clone(),
            "Extracting",
            descriptor.size() as i64,
        );

        let applied = applier
            .apply(target_dir, Box::pin(reader))
            .await
            .map_err(|err| PlugfetchError::LayerApplyFailed {
                digest: descriptor.digest().to_string(),
                reason: err.to_string(),
            })?;

        tracing::debug!(digest = %descriptor.digest(), applied, "layer applied");
        sink.send(ProgressEvent {
            id,
            action: "Complete".to_string(),
            last_update: true,
            ..Default::default()
        })
        .await;
    }

    Ok(())
}

/// Joins a relative archive path onto the target directory, rejecting anything that
/// would land outside it.
fn safe_join(target_dir: &Path, relative: &Path) -> Option<PathBuf> {
    let mut joined = target_dir.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(joined)
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn clear_directory(dir: &Path) -> std::io::Result<()> {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries {
                remove_path(&entry?.path())?;
            }
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use flate2::{write::GzEncoder, Compression};
    use tempfile::tempdir;

    use super::*;

    fn tar_layer(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            // `set_path` rejects ".." components; write the raw name bytes
            // directly so tests can still exercise path-traversal rejection.
            let name_bytes = path.as_bytes();
            header.as_old_mut().name[..name_bytes.len()].copy_from_slice(name_bytes);
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_apply_plain_tar_layer() {
        let dir = tempdir().unwrap();
        let layer = tar_layer(&[("etc/plugin.conf", b"socket = /run/plugin.sock\n")]);

        let applied = TarLayerApplier::new()
            .apply(dir.path(), Box::pin(Cursor::new(layer)))
            .await
            .unwrap();

        assert!(applied > 0, "applied bytes should be counted");
        let content = std::fs::read_to_string(dir.path().join("etc/plugin.conf")).unwrap();
        assert_eq!(content, "socket = /run/plugin.sock\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_apply_gzip_layer_is_sniffed() {
        let dir = tempdir().unwrap();
        let layer = gzip(&tar_layer(&[("rootfs/bin/plugin", b"#!/bin/sh\n")]));

        TarLayerApplier::new()
            .apply(dir.path(), Box::pin(Cursor::new(layer)))
            .await
            .unwrap();

        assert!(dir.path().join("rootfs/bin/plugin").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_apply_whiteout_removes_lower_file() {
        let dir = tempdir().unwrap();
        let applier = TarLayerApplier::new();

        let lower = tar_layer(&[
            ("etc/keep.conf", b"keep".as_slice()),
            ("etc/gone.conf", b"gone".as_slice()),
        ]);
        applier
            .apply(dir.path(), Box::pin(Cursor::new(lower)))
            .await
            .unwrap();

        let upper = tar_layer(&[("etc/.wh.gone.conf", b"".as_slice())]);
        applier
            .apply(dir.path(), Box::pin(Cursor::new(upper)))
            .await
            .unwrap();

        assert!(dir.path().join("etc/keep.conf").exists());
        assert!(!dir.path().join("etc/gone.conf").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_apply_opaque_whiteout_clears_directory() {
        let dir = tempdir().unwrap();
        let applier = TarLayerApplier::new();

        let lower = tar_layer(&[
            ("data/old-a", b"a".as_slice()),
            ("data/old-b", b"b".as_slice()),
        ]);
        applier
            .apply(dir.path(), Box::pin(Cursor::new(lower)))
            .await
            .unwrap();

        let upper = tar_layer(&[
            ("data/.wh..wh..opq", b"".as_slice()),
            ("data/new", b"new".as_slice()),
        ]);
        applier
            .apply(dir.path(), Box::pin(Cursor::new(upper)))
            .await
            .unwrap();

        assert!(!dir.path().join("data/old-a").exists());
        assert!(!dir.path().join("data/old-b").exists());
        assert!(dir.path().join("data/new").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_apply_rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let outside = dir.path().join("outside-marker");

        let layer = tar_layer(&[("../outside-marker", b"escape".as_slice())]);
        let result = TarLayerApplier::new()
            .apply(dir.path().join("root").as_path(), Box::pin(Cursor::new(layer)))
            .await;

        // Whether the entry is rejected with an error or silently skipped, nothing may
        // land outside the target directory.
        let _ = result;
        assert!(!outside.exists());
    }

    #[test]
    fn test_safe_join_rejects_parent_components() {
        let base = Path::new("/tmp/target");
        assert_eq!(
            safe_join(base, Path::new("etc/conf")),
            Some(PathBuf::from("/tmp/target/etc/conf"))
        );
        assert!(safe_join(base, Path::new("../etc")).is_none());
        assert!(safe_join(base, Path::new("/etc")).is_none());
    }
}
