use std::{
    error::Error,
    fmt::{self, Display},
};

use oci_spec::image::Digest;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a plugfetch-related operation.
pub type PlugfetchResult<T> = Result<T, PlugfetchError>;

/// An error that occurred while acquiring or applying a plugin image.
#[derive(Debug, Error)]
pub enum PlugfetchError {
    /// The supplied plugin reference did not parse.
    #[error("invalid plugin reference: {0}")]
    InvalidReference(String),

    /// The registry rejected our credentials, or no acceptable credentials were available.
    #[error("authentication failed for {host}: {reason}")]
    AuthenticationFailed {
        /// The registry host the credentials were presented to.
        host: String,

        /// Why the registry turned us away.
        reason: String,
    },

    /// The manifest could not be located, even after the legacy Accept-header fallback.
    #[error("failed to resolve {reference}: {reason}")]
    ResolveFailed {
        /// The reference that was being resolved.
        reference: String,

        /// The underlying failure, including the original error when a fallback was attempted.
        reason: String,
    },

    /// A blob or manifest download aborted before the content was committed.
    #[error("fetch failed for {digest}: {reason}")]
    FetchFailed {
        /// Digest of the content that failed to arrive.
        digest: String,

        /// The underlying failure.
        reason: String,
    },

    /// The descriptor walk finished without producing a complete plugin image.
    #[error("fetched plugin image but {missing} is missing")]
    IncompleteManifest {
        /// Which required piece was absent, `"config"` or `"manifest"`.
        missing: &'static str,
    },

    /// Extraction of a specific layer failed.
    #[error("failed to apply layer {digest}: {reason}")]
    LayerApplyFailed {
        /// Digest of the layer that failed to extract.
        digest: String,

        /// The underlying failure.
        reason: String,
    },

    /// The caller aborted the pull.
    #[error("context canceled")]
    Cancelled,

    /// The content store holds no committed blob for the digest.
    #[error("blob not found: {0}")]
    BlobNotFound(Digest),

    /// The content store has no active write under the ref key.
    #[error("no active write for key: {0}")]
    StatusNotFound(String),

    /// Committed bytes did not hash to the expected digest.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest the descriptor promised.
        expected: String,

        /// The digest the received bytes actually hash to.
        actual: String,
    },

    /// The digest names a hash algorithm the store cannot verify.
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigestAlgorithm(String),

    /// A fetched manifest or index did not parse into its declared media type.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// An error that occurred during an IO operation.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that occurred serializing or deserializing JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error raised by the HTTP client.
    #[error("http error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// An error raised by the HTTP middleware stack.
    #[error("http error: {0}")]
    ReqwestMiddleware(#[from] reqwest_middleware::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PlugfetchError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> PlugfetchError {
        PlugfetchError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Whether this error means "the thing does not exist" rather than "the lookup broke".
    ///
    /// The progress watcher dispatches on this to tell a finished write apart from a
    /// failing store.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PlugfetchError::BlobNotFound(_) | PlugfetchError::StatusNotFound(_)
        )
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `PlugfetchResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> PlugfetchResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_error_not_found_classification() {
        let digest = Digest::from_str(
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        )
        .unwrap();

        assert!(PlugfetchError::BlobNotFound(digest).is_not_found());
        assert!(PlugfetchError::StatusNotFound("layer-sha256:abc".into()).is_not_found());
        assert!(!PlugfetchError::Cancelled.is_not_found());
        assert!(!PlugfetchError::IncompleteManifest { missing: "config" }.is_not_found());
    }

    #[test]
    fn test_error_incomplete_manifest_message() {
        let err = PlugfetchError::IncompleteManifest { missing: "config" };
        assert_eq!(
            err.to_string(),
            "fetched plugin image but config is missing"
        );
    }
}
