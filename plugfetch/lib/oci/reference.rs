use std::{fmt, str::FromStr, sync::LazyLock};

use getset::Getters;
use oci_spec::image::Digest;
use regex::Regex;

use crate::PlugfetchError;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The registry assumed when the reference does not name one.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// The namespace prepended to single-segment repository names.
pub const DEFAULT_REPOSITORY_NAMESPACE: &str = "library";

/// The tag assumed when the reference carries neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// Registries contain only alphanumerics, dashes, dots, and an optional port.
static REGISTRY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9.-]+(:[0-9]+)?$").unwrap());

/// Repository path components are lowercase alphanumerics joined by `._-`, separated by `/`.
static REPOSITORY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9]+(?:[._-][a-z0-9]+)*)(/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$").unwrap()
});

/// Tags start with a word character and run up to 128 characters of `[\w.-]`.
static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\w[\w.-]{0,127}$").unwrap());

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A normalized plugin image reference.
///
/// Parsing fills in the pieces a human leaves out: a missing registry becomes
/// [`DEFAULT_REGISTRY`], a single-segment repository gains the [`DEFAULT_REPOSITORY_NAMESPACE`]
/// prefix, and the selector records whether a tag or digest was actually written.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Reference {
    /// The registry hosting the plugin.
    registry: String,

    /// The repository path of the plugin.
    repository: String,

    /// What the reference selects within the repository.
    selector: ReferenceSelector,
}

/// The selector part of a plugin reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceSelector {
    /// A named tag, with an optional pinning digest (`name:tag@digest`).
    ///
    /// When the digest is present it wins for identity; the tag is kept as display text.
    Tag {
        /// The image tag.
        tag: String,

        /// The optional pinning digest.
        digest: Option<Digest>,
    },

    /// A bare digest (`name@digest`).
    Digest(Digest),

    /// Nothing was written; the registry's default tag applies.
    DefaultTag,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Reference {
    /// The tag to present to humans and registries, falling back to [`DEFAULT_TAG`].
    pub fn tag_or_default(&self) -> &str {
        match &self.selector {
            ReferenceSelector::Tag { tag, .. } => tag,
            ReferenceSelector::Digest(_) | ReferenceSelector::DefaultTag => DEFAULT_TAG,
        }
    }

    /// The digest pinning this reference, if one was written.
    pub fn digest(&self) -> Option<&Digest> {
        match &self.selector {
            ReferenceSelector::Tag { digest, .. } => digest.as_ref(),
            ReferenceSelector::Digest(digest) => Some(digest),
            ReferenceSelector::DefaultTag => None,
        }
    }

    /// The identity to resolve against the registry: the digest when present, else the tag.
    pub fn identity(&self) -> String {
        match self.digest() {
            Some(digest) => digest.to_string(),
            None => self.tag_or_default().to_string(),
        }
    }

    /// The short human form used in progress messages: the default registry and the
    /// `library/` namespace are elided.
    pub fn familiar(&self) -> String {
        let repository = if self.registry == DEFAULT_REGISTRY {
            self.repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository)
        } else {
            &self.repository
        };

        if self.registry == DEFAULT_REGISTRY {
            repository.to_string()
        } else {
            format!("{}/{}", self.registry, repository)
        }
    }

    /// The authorization scope for pulling from a plugin repository.
    ///
    /// Plugin repositories live in a distinct resource class, so a token obtained for the
    /// plain image scope is not guaranteed to be accepted here.
    pub fn pull_scope(&self) -> String {
        format!("repository(plugin):{}:pull", self.repository)
    }

    /// The canonical form pinned to a resolved digest.
    pub fn canonical(&self, digest: &Digest) -> String {
        format!("{}/{}@{}", self.registry, self.repository, digest)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Reference {
    type Err = PlugfetchError;

    /// Parses a string into a normalized plugin [`Reference`].
    ///
    /// Supported forms:
    /// - `"registry/repository:tag"`
    /// - `"repository:tag"`
    /// - `"repository"`
    /// - `"registry/repository@digest"`
    /// - `"registry/repository:tag@digest"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PlugfetchError::InvalidReference(
                "input string is empty".into(),
            ));
        }

        let (pre, digest) = match s.find('@') {
            Some(at_idx) => {
                let digest_str = &s[at_idx + 1..];
                if !digest_str.contains(':') {
                    return Err(PlugfetchError::InvalidReference(format!(
                        "invalid digest: {}",
                        digest_str
                    )));
                }
                let digest = digest_str.parse::<Digest>().map_err(|e| {
                    PlugfetchError::InvalidReference(format!("invalid digest: {}", e))
                })?;
                (&s[..at_idx], Some(digest))
            }
            None => (s, None),
        };

        let (registry, remainder) = extract_registry_and_path(pre);
        let (repository, tag) = extract_repository_and_tag(remainder)?;

        validate_registry(&registry)?;
        validate_repository(&repository)?;
        if let Some(tag) = &tag {
            validate_tag(tag)?;
        }

        let selector = match (tag, digest) {
            (Some(tag), digest) => ReferenceSelector::Tag { tag, digest },
            (None, Some(digest)) => ReferenceSelector::Digest(digest),
            (None, None) => ReferenceSelector::DefaultTag,
        };

        Ok(Reference {
            registry,
            repository,
            selector,
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match &self.selector {
            ReferenceSelector::Tag {
                tag,
                digest: Some(d),
            } => write!(f, ":{}@{}", tag, d),
            ReferenceSelector::Tag { tag, digest: None } => write!(f, ":{}", tag),
            ReferenceSelector::Digest(d) => write!(f, "@{}", d),
            ReferenceSelector::DefaultTag => write!(f, ":{}", DEFAULT_TAG),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Validates the registry component.
fn validate_registry(registry: &str) -> Result<(), PlugfetchError> {
    if REGISTRY_REGEX.is_match(registry) {
        Ok(())
    } else {
        Err(PlugfetchError::InvalidReference(format!(
            "invalid registry: {}",
            registry
        )))
    }
}

/// Validates the repository path.
fn validate_repository(repository: &str) -> Result<(), PlugfetchError> {
    if REPOSITORY_REGEX.is_match(repository) {
        Ok(())
    } else {
        Err(PlugfetchError::InvalidReference(format!(
            "invalid repository: {}",
            repository
        )))
    }
}

/// Validates the tag component.
fn validate_tag(tag: &str) -> Result<(), PlugfetchError> {
    if TAG_REGEX.is_match(tag) {
        Ok(())
    } else {
        Err(PlugfetchError::InvalidReference(format!(
            "invalid tag: {}",
            tag
        )))
    }
}

/// Splits the registry off the front of a reference.
///
/// The first segment is a registry only when it looks like a host: it contains a `.` or a
/// `:`, or it is `localhost`.
fn extract_registry_and_path(reference: &str) -> (String, &str) {
    let segments: Vec<&str> = reference.splitn(2, '/').collect();
    if segments.len() > 1
        && (segments[0].contains('.') || segments[0].contains(':') || segments[0] == "localhost")
    {
        (segments[0].to_string(), segments[1])
    } else {
        (DEFAULT_REGISTRY.to_string(), reference)
    }
}

/// Splits the repository path from an optional trailing tag, prepending the default
/// namespace to single-segment repositories.
fn extract_repository_and_tag(path: &str) -> Result<(String, Option<String>), PlugfetchError> {
    let (repo_part, tag) = match path.rfind(':') {
        Some(idx) => (&path[..idx], Some(path[idx + 1..].to_string())),
        None => (path, None),
    };

    if repo_part.is_empty() {
        return Err(PlugfetchError::InvalidReference(
            "repository is empty".into(),
        ));
    }

    let repository = if !repo_part.contains('/') {
        format!("{}/{}", DEFAULT_REPOSITORY_NAMESPACE, repo_part)
    } else {
        repo_part.to_string()
    };

    Ok((repository, tag))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_DIGEST_HEX: &str = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";

    #[test]
    fn test_reference_with_registry_and_tag() {
        let reference = "registry.example.com/vendor/plugin:1.2".parse::<Reference>().unwrap();
        assert_eq!(reference.get_registry(), "registry.example.com");
        assert_eq!(reference.get_repository(), "vendor/plugin");
        match reference.get_selector() {
            ReferenceSelector::Tag { tag, digest } => {
                assert_eq!(tag, "1.2");
                assert!(digest.is_none());
            }
            _ => panic!("expected Tag selector"),
        }
        assert_eq!(reference.to_string(), "registry.example.com/vendor/plugin:1.2");
    }

    #[test]
    fn test_reference_bare_name_gets_defaults() {
        let reference = "myplugin".parse::<Reference>().unwrap();
        assert_eq!(reference.get_registry(), DEFAULT_REGISTRY);
        assert_eq!(reference.get_repository(), "library/myplugin");
        assert_eq!(reference.get_selector(), &ReferenceSelector::DefaultTag);
        assert_eq!(reference.tag_or_default(), DEFAULT_TAG);
        assert_eq!(reference.to_string(), "docker.io/library/myplugin:latest");
    }

    #[test]
    fn test_reference_short_name_keeps_namespace() {
        let reference = "vendor/plugin".parse::<Reference>().unwrap();
        assert_eq!(reference.get_registry(), DEFAULT_REGISTRY);
        assert_eq!(reference.get_repository(), "vendor/plugin");
        assert_eq!(reference.get_selector(), &ReferenceSelector::DefaultTag);
    }

    #[test]
    fn test_reference_digest_only() {
        let s = format!("registry.example.com/vendor/plugin@sha256:{}", VALID_DIGEST_HEX);
        let reference = s.parse::<Reference>().unwrap();
        match reference.get_selector() {
            ReferenceSelector::Digest(d) => {
                assert_eq!(d.to_string(), format!("sha256:{}", VALID_DIGEST_HEX));
            }
            _ => panic!("expected Digest selector"),
        }
        assert_eq!(reference.identity(), format!("sha256:{}", VALID_DIGEST_HEX));
        assert_eq!(reference.to_string(), s);
    }

    #[test]
    fn test_reference_tag_and_digest_digest_wins_identity() {
        let s = format!(
            "registry.example.com/vendor/plugin:stable@sha256:{}",
            VALID_DIGEST_HEX
        );
        let reference = s.parse::<Reference>().unwrap();
        match reference.get_selector() {
            ReferenceSelector::Tag { tag, digest } => {
                assert_eq!(tag, "stable");
                assert!(digest.is_some());
            }
            _ => panic!("expected Tag selector with digest"),
        }
        assert_eq!(reference.tag_or_default(), "stable");
        assert_eq!(reference.identity(), format!("sha256:{}", VALID_DIGEST_HEX));
    }

    #[test]
    fn test_reference_registry_with_port() {
        let reference = "localhost:5000/vendor/plugin:dev".parse::<Reference>().unwrap();
        assert_eq!(reference.get_registry(), "localhost:5000");
        assert_eq!(reference.get_repository(), "vendor/plugin");
    }

    #[test]
    fn test_reference_localhost_is_a_registry() {
        let reference = "localhost/plugin".parse::<Reference>().unwrap();
        assert_eq!(reference.get_registry(), "localhost");
        assert_eq!(reference.get_repository(), "library/plugin");
    }

    #[test]
    fn test_reference_plain_first_segment_is_a_namespace() {
        // No dot, colon, or "localhost": the first segment is part of the repository.
        let reference = "vendor/plugin:1.0".parse::<Reference>().unwrap();
        assert_eq!(reference.get_registry(), DEFAULT_REGISTRY);
        assert_eq!(reference.get_repository(), "vendor/plugin");
    }

    #[test]
    fn test_reference_familiar_elides_defaults() {
        let reference = "myplugin".parse::<Reference>().unwrap();
        assert_eq!(reference.familiar(), "myplugin");

        let reference = "vendor/plugin:1.0".parse::<Reference>().unwrap();
        assert_eq!(reference.familiar(), "vendor/plugin");

        let reference = "registry.example.com/vendor/plugin:1.0".parse::<Reference>().unwrap();
        assert_eq!(reference.familiar(), "registry.example.com/vendor/plugin");
    }

    #[test]
    fn test_reference_pull_scope() {
        let reference = "registry.example.com/vendor/plugin:1.0".parse::<Reference>().unwrap();
        assert_eq!(reference.pull_scope(), "repository(plugin):vendor/plugin:pull");
    }

    #[test]
    fn test_reference_empty_input() {
        let err = "".parse::<Reference>().unwrap_err();
        assert!(err.to_string().contains("input string is empty"));
    }

    #[test]
    fn test_reference_empty_repository() {
        let err = "registry.example.com/:tag".parse::<Reference>().unwrap_err();
        assert!(err.to_string().contains("repository is empty"));
    }

    #[test]
    fn test_reference_invalid_digest() {
        let err = "vendor/plugin@notadigest".parse::<Reference>().unwrap_err();
        assert!(err.to_string().contains("invalid digest"));
    }

    #[test]
    fn test_reference_invalid_repository() {
        let err = "docker.io/Vendor/plugin:1.0".parse::<Reference>().unwrap_err();
        assert!(err.to_string().contains("invalid repository"));
    }

    #[test]
    fn test_reference_invalid_tag() {
        let err = "vendor/plugin:t!ag".parse::<Reference>().unwrap_err();
        assert!(err.to_string().contains("invalid tag"));
    }

    #[test]
    fn test_reference_tag_length_limit() {
        let long_tag = "a".repeat(129);
        let err = format!("vendor/plugin:{}", long_tag)
            .parse::<Reference>()
            .unwrap_err();
        assert!(err.to_string().contains("invalid tag"));
    }

    #[test]
    fn test_reference_canonical_pins_digest() {
        let digest: Digest = format!("sha256:{}", VALID_DIGEST_HEX).parse().unwrap();
        let reference = "vendor/plugin:1.0".parse::<Reference>().unwrap();
        assert_eq!(
            reference.canonical(&digest),
            format!("docker.io/vendor/plugin@sha256:{}", VALID_DIGEST_HEX)
        );
    }
}
