use std::collections::HashMap;

use oci_spec::image::{Descriptor, MediaType};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The MIME type for Docker Registry v2 image manifests.
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// The MIME type for Docker Registry v2 manifest lists.
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// The MIME type for OCI image manifests.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// The MIME type for OCI image indexes.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// The MIME type for gzip-compressed Docker rootfs layers.
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// The MIME type for uncompressed Docker rootfs layers.
pub const MEDIA_TYPE_DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// The MIME type for uncompressed OCI image layers.
pub const MEDIA_TYPE_OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";

/// The MIME type for gzip-compressed OCI image layers.
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// The MIME type for foreign Docker layers, hosted outside the registry.
pub const MEDIA_TYPE_DOCKER_LAYER_FOREIGN_GZIP: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

/// The MIME type for Docker plugin configurations, the terminal node of a plugin image.
pub const MEDIA_TYPE_PLUGIN_CONFIG: &str = "application/vnd.docker.plugin.v1+json";

/// The MIME type for OCI image configurations.
pub const MEDIA_TYPE_OCI_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// The MIME type for Docker image configurations.
pub const MEDIA_TYPE_DOCKER_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

/// The ref-key prefix registered for the plugin config media type, so in-flight writes of the
/// config show up under a meaningful key instead of `unknown`.
pub const PLUGIN_CONFIG_REF_PREFIX: &str = "docker-plugin";

/// Length of the truncated digest form used as a progress event id.
const TRUNCATED_ID_LEN: usize = 12;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The normalized media-type classification of a descriptor.
///
/// Computed once per descriptor; every behavior table in the pull pipeline (which nodes have
/// children, which are layers, which get progress watchers) keys off this instead of comparing
/// media-type strings in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// A single-image manifest, Docker schema 2 or OCI.
    Manifest,

    /// A manifest list or OCI image index.
    ManifestIndex,

    /// A rootfs layer that is fetched and extracted.
    ImageLayer,

    /// A layer hosted outside the registry, recorded but neither fetched nor extracted.
    ForeignLayer,

    /// The plugin configuration, the terminal node of the walk.
    PluginConfig,

    /// An ordinary image configuration. A plugin image must not carry one in place of the
    /// plugin config.
    ImageConfig,

    /// Anything else.
    Other,
}

/// Maps media types to the prefixes used when deriving content-store ref keys.
///
/// Two concurrent walks of the same manifest derive identical ref keys from this table, which
/// is what lets the second walk observe the first's in-flight write instead of starting a
/// duplicate fetch.
#[derive(Debug, Clone)]
pub struct RefKeyTable {
    prefixes: HashMap<String, String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DescriptorKind {
    /// Classifies a descriptor by its media type.
    pub fn of(descriptor: &Descriptor) -> Self {
        Self::from_media_type(descriptor.media_type())
    }

    /// Classifies a media type.
    pub fn from_media_type(media_type: &MediaType) -> Self {
        match media_type {
            MediaType::ImageManifest => DescriptorKind::Manifest,
            MediaType::ImageIndex => DescriptorKind::ManifestIndex,
            MediaType::ImageLayer | MediaType::ImageLayerGzip => DescriptorKind::ImageLayer,
            MediaType::ImageConfig => DescriptorKind::ImageConfig,
            other => Self::from_media_type_str(&other.to_string()),
        }
    }

    fn from_media_type_str(media_type: &str) -> Self {
        match media_type {
            MEDIA_TYPE_DOCKER_MANIFEST | MEDIA_TYPE_OCI_MANIFEST => DescriptorKind::Manifest,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST | MEDIA_TYPE_OCI_INDEX => DescriptorKind::ManifestIndex,
            MEDIA_TYPE_DOCKER_LAYER_GZIP
            | MEDIA_TYPE_DOCKER_LAYER
            | MEDIA_TYPE_OCI_LAYER
            | MEDIA_TYPE_OCI_LAYER_GZIP => DescriptorKind::ImageLayer,
            MEDIA_TYPE_DOCKER_LAYER_FOREIGN_GZIP => DescriptorKind::ForeignLayer,
            MEDIA_TYPE_PLUGIN_CONFIG => DescriptorKind::PluginConfig,
            MEDIA_TYPE_OCI_IMAGE_CONFIG | MEDIA_TYPE_DOCKER_IMAGE_CONFIG => {
                DescriptorKind::ImageConfig
            }
            _ => DescriptorKind::Other,
        }
    }

    /// Whether descriptors of this kind are rootfs layers.
    pub fn is_layer(&self) -> bool {
        matches!(self, DescriptorKind::ImageLayer | DescriptorKind::ForeignLayer)
    }

    /// Whether the walk stops at descriptors of this kind.
    ///
    /// Only manifests and indexes have children to expand; everything else is a leaf.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DescriptorKind::Manifest | DescriptorKind::ManifestIndex)
    }

    /// Whether descriptors of this kind get a per-blob progress watcher.
    pub fn tracks_progress(&self) -> bool {
        matches!(self, DescriptorKind::ImageLayer)
    }
}

impl RefKeyTable {
    /// Creates a table with the standard prefixes for manifests, indexes, layers, and configs.
    pub fn new() -> Self {
        Self {
            prefixes: HashMap::new(),
        }
    }

    /// Registers a prefix for a media type, overriding the kind-derived default.
    pub fn register(&mut self, media_type: impl Into<String>, prefix: impl Into<String>) {
        self.prefixes.insert(media_type.into(), prefix.into());
    }

    /// Derives the content-store ref key for a descriptor.
    ///
    /// Explicit registrations win; otherwise the prefix follows the descriptor kind, and
    /// unrecognized media types fall back to `unknown`.
    pub fn ref_key(&self, descriptor: &Descriptor) -> String {
        let media_type = descriptor.media_type().to_string();
        let prefix = match self.prefixes.get(&media_type) {
            Some(prefix) => prefix.as_str(),
            None => match DescriptorKind::of(descriptor) {
                DescriptorKind::Manifest => "manifest",
                DescriptorKind::ManifestIndex => "index",
                DescriptorKind::ImageLayer | DescriptorKind::ForeignLayer => "layer",
                DescriptorKind::PluginConfig | DescriptorKind::ImageConfig => "config",
                DescriptorKind::Other => "unknown",
            },
        };
        format!("{}-{}", prefix, descriptor.digest())
    }
}

impl Default for RefKeyTable {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Truncates a digest to the 12-hex-char form used as a progress event id.
pub fn truncate_id(digest: &oci_spec::image::Digest) -> String {
    let hex = digest.digest();
    hex[..TRUNCATED_ID_LEN.min(hex.len())].to_string()
}

/// Parses a media-type string, producing the proper enum variant for OCI types and
/// wrapping everything else (the Docker types included) as [`MediaType::Other`].
pub fn media_type_from_str(media_type: &str) -> MediaType {
    match media_type {
        MEDIA_TYPE_OCI_MANIFEST => MediaType::ImageManifest,
        MEDIA_TYPE_OCI_INDEX => MediaType::ImageIndex,
        MEDIA_TYPE_OCI_LAYER => MediaType::ImageLayer,
        MEDIA_TYPE_OCI_LAYER_GZIP => MediaType::ImageLayerGzip,
        MEDIA_TYPE_OCI_IMAGE_CONFIG => MediaType::ImageConfig,
        other => MediaType::Other(other.to_string()),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
