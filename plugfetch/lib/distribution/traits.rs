use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use getset::Getters;
use oci_spec::image::Descriptor;
use serde::{Deserialize, Serialize};

use crate::{oci::Reference, PlugfetchResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Credentials for a registry host.
///
/// All fields empty means anonymous access; the registry may still hand out an anonymous
/// pull token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    /// The account name for Basic authentication against the token service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// The password paired with `username`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// A refresh token previously issued by the registry, used in place of a password.
    #[serde(rename = "identitytoken", skip_serializing_if = "Option::is_none")]
    pub identity_token: Option<String>,

    /// A bearer token to present directly, bypassing the token service.
    #[serde(rename = "registrytoken", skip_serializing_if = "Option::is_none")]
    pub registry_token: Option<String>,
}

/// The outcome of resolving a reference against a registry.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ResolvedPlugin {
    /// The reference pinned to the resolved digest, e.g. `registry.example.com/vendor/plugin@sha256:…`.
    canonical: String,

    /// The root descriptor the walk starts from.
    descriptor: Descriptor,
}

/// A credential provider that always answers with anonymous access.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousCredentials;

/// A credential provider that hands out one fixed set of credentials for every host.
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider {
    auth: RegistryAuth,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Supplies credentials for registry hosts.
///
/// Consumed by the resolver; the outer engine wires this to its credential store.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns the credentials to use for `host`.
    async fn credentials(&self, host: &str) -> PlugfetchResult<RegistryAuth>;
}

/// Turns a normalized reference into a root descriptor plus a fetcher bound to that
/// repository.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolves the reference to its canonical form and root descriptor.
    async fn resolve(&self, reference: &Reference) -> PlugfetchResult<ResolvedPlugin>;

    /// Returns a fetcher for blobs of the resolved repository.
    async fn fetcher(&self, reference: &Reference) -> PlugfetchResult<Arc<dyn Fetcher>>;
}

/// Streams raw blobs for descriptors of one repository.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Opens a byte stream for the blob behind a descriptor.
    async fn fetch(
        &self,
        descriptor: &Descriptor,
    ) -> PlugfetchResult<BoxStream<'static, PlugfetchResult<Bytes>>>;

    /// Derives the content-store ref key under which a fetch of this descriptor is tracked.
    fn ref_key(&self, descriptor: &Descriptor) -> String;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryAuth {
    /// Credentials for anonymous access.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Basic username/password credentials.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..Self::default()
        }
    }

    /// A pre-issued bearer token.
    pub fn bearer(registry_token: impl Into<String>) -> Self {
        Self {
            registry_token: Some(registry_token.into()),
            ..Self::default()
        }
    }

    /// Whether no credential material is present at all.
    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
            && self.password.is_none()
            && self.identity_token.is_none()
            && self.registry_token.is_none()
    }
}

impl ResolvedPlugin {
    /// Creates a resolved plugin record.
    pub fn new(canonical: impl Into<String>, descriptor: Descriptor) -> Self {
        Self {
            canonical: canonical.into(),
            descriptor,
        }
    }
}

impl StaticCredentialProvider {
    /// Creates a provider that answers every host with `auth`.
    pub fn new(auth: RegistryAuth) -> Self {
        Self { auth }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl CredentialProvider for AnonymousCredentials {
    async fn credentials(&self, _host: &str) -> PlugfetchResult<RegistryAuth> {
        Ok(RegistryAuth::anonymous())
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn credentials(&self, _host: &str) -> PlugfetchResult<RegistryAuth> {
        Ok(self.auth.clone())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_auth_anonymous() {
        assert!(RegistryAuth::anonymous().is_anonymous());
        assert!(!RegistryAuth::basic("user", "pass").is_anonymous());
        assert!(!RegistryAuth::bearer("token").is_anonymous());
    }

    #[tokio::test]
    async fn test_static_provider_answers_every_host() {
        let provider = StaticCredentialProvider::new(RegistryAuth::basic("user", "pass"));
        let a = provider.credentials("registry.example.com").await.unwrap();
        let b = provider.credentials("localhost:5000").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.username.as_deref(), Some("user"));
    }
}
