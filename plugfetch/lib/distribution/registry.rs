use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use oci_spec::image::{Descriptor, DescriptorBuilder, Digest};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE},
    Client, StatusCode,
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use sha2::{Digest as _, Sha256};

use super::{
    auth::{parse_www_authenticate, request_token, TokenCache},
    CredentialProvider, Fetcher, ResolvedPlugin, Resolver,
};
use crate::{
    oci::{
        media_type_from_str, DescriptorKind, RefKeyTable, Reference, DEFAULT_REGISTRY,
        MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX,
        MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_PLUGIN_CONFIG, PLUGIN_CONFIG_REF_PREFIX,
    },
    PlugfetchError, PlugfetchResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The host that actually serves `docker.io` references.
const DOCKER_REGISTRY_HOST: &str = "registry-1.docker.io";

/// The manifest media types named in the `Accept` header, in preference order.
const MANIFEST_ACCEPT_TYPES: [&str; 4] = [
    MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_OCI_INDEX,
];

/// The content-type prefix shared by both schema-1 manifest flavors.
const MEDIA_TYPE_DOCKER_SCHEMA1_PREFIX: &str = "application/vnd.docker.distribution.manifest.v1";

/// The header carrying the registry's digest for a served manifest.
const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How the manifest media types are spread over `Accept` header lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptStyle {
    /// One header line with a comma-separated list; the normal form.
    Joined,

    /// One header line per media type, for registries that never learned to split the list.
    Split,
}

/// The shared HTTP plumbing behind the resolver and its fetchers: client, credential
/// provider, caller meta headers, and the token cache.
#[derive(Clone)]
struct RegistryTransport {
    client: ClientWithMiddleware,
    credentials: Arc<dyn CredentialProvider>,
    meta_headers: HeaderMap,
    tokens: Arc<TokenCache>,
    plain_http: bool,
}

/// Resolves plugin references against an OCI distribution registry.
///
/// Construction mirrors the rest of the HTTP stack here: a reqwest client behind retry
/// middleware, with credentials pulled on demand from the [`CredentialProvider`].
pub struct RegistryResolver {
    transport: RegistryTransport,
}

/// Streams blobs of one repository out of the registry the resolver bound it to.
pub struct RegistryFetcher {
    transport: RegistryTransport,
    registry: String,
    repository: String,
    scope: String,
    ref_keys: RefKeyTable,
}

/// A failed resolve attempt, remembering whether the failure shape points at a legacy
/// registry that cannot parse comma-joined `Accept` lists.
struct AttemptError {
    legacy: bool,
    error: PlugfetchError,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryTransport {
    fn base_url(&self, registry: &str) -> String {
        let host = if registry == DEFAULT_REGISTRY {
            DOCKER_REGISTRY_HOST
        } else {
            registry
        };
        let scheme = if self.plain_http { "http" } else { "https" };
        format!("{}://{}", scheme, host)
    }

    fn build_get(
        &self,
        url: &str,
        headers: &HeaderMap,
        bearer: Option<String>,
    ) -> PlugfetchResult<reqwest::Request> {
        let mut builder = self
            .client
            .get(url)
            .headers(self.meta_headers.clone())
            .headers(headers.clone());
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        Ok(builder.build()?)
    }

    /// Issues a GET, answering a bearer challenge once with a token for `scope`.
    async fn get_with_auth(
        &self,
        registry: &str,
        scope: &str,
        url: &str,
        headers: &HeaderMap,
    ) -> PlugfetchResult<reqwest::Response> {
        let request = self.build_get(url, headers, self.tokens.get(registry, scope))?;
        let response = self.client.execute(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_www_authenticate)
            .ok_or_else(|| PlugfetchError::AuthenticationFailed {
                host: registry.to_string(),
                reason: "registry denied access without a bearer challenge".to_string(),
            })?;

        let auth = self.credentials.credentials(registry).await?;
        let token = match &auth.registry_token {
            Some(token) => token.clone(),
            None => {
                let (token, expires_in) =
                    request_token(&self.client, &challenge, scope, &auth, registry).await?;
                self.tokens.insert(registry, scope, token.clone(), expires_in);
                token
            }
        };

        let request = self.build_get(url, headers, Some(token))?;
        let response = self.client.execute(request).await?;
        if response.status() == StatusCode::UNAUTHORIZED
            || response.status() == StatusCode::FORBIDDEN
        {
            return Err(PlugfetchError::AuthenticationFailed {
                host: registry.to_string(),
                reason: format!("registry rejected the token: {}", response.status()),
            });
        }

        Ok(response)
    }
}

impl RegistryResolver {
    /// Creates a resolver with retrying HTTP transport and the given credential provider.
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            transport: RegistryTransport {
                client,
                credentials,
                meta_headers: HeaderMap::new(),
                tokens: Arc::new(TokenCache::new()),
                plain_http: false,
            },
        }
    }

    /// Attaches caller-supplied headers sent on every registry request.
    pub fn with_meta_headers(mut self, meta_headers: HeaderMap) -> Self {
        self.transport.meta_headers = meta_headers;
        self
    }

    /// Talks plain HTTP instead of HTTPS; only sensible for local test registries.
    pub fn with_plain_http(mut self, plain_http: bool) -> Self {
        self.transport.plain_http = plain_http;
        self
    }

    async fn resolve_attempt(
        &self,
        reference: &Reference,
        style: AcceptStyle,
    ) -> Result<ResolvedPlugin, AttemptError> {
        let registry = reference.get_registry();
        let scope = reference.pull_scope();
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.transport.base_url(registry),
            reference.get_repository(),
            reference.identity()
        );

        let response = self
            .transport
            .get_with_auth(registry, &scope, &url, &accept_headers(style))
            .await
            .map_err(AttemptError::fatal)?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let digest_header = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| AttemptError::fatal(e.into()))?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body).into_owned();
            return Err(AttemptError {
                legacy: is_legacy_manifest_signal(status, content_type.as_deref(), &text),
                error: PlugfetchError::custom(anyhow::anyhow!(
                    "registry returned {status} for {url}: {text}"
                )),
            });
        }

        if let Some(content_type) = content_type
            .as_deref()
            .filter(|ct| ct.starts_with(MEDIA_TYPE_DOCKER_SCHEMA1_PREFIX))
        {
            return Err(AttemptError {
                legacy: true,
                error: PlugfetchError::custom(anyhow::anyhow!(
                    "registry served a schema-1 manifest ({content_type}), which cannot carry a plugin config"
                )),
            });
        }

        let digest = match digest_header {
            Some(header) => Digest::from_str(&header).map_err(|e| {
                AttemptError::fatal(PlugfetchError::InvalidManifest(format!(
                    "bad {DOCKER_CONTENT_DIGEST} header: {e}"
                )))
            })?,
            None => Digest::from_str(&format!("sha256:{}", hex::encode(Sha256::digest(&body))))
                .expect("sha256 hex digest always parses"),
        };

        if let Some(pinned) = reference.digest() {
            if pinned != &digest {
                return Err(AttemptError::fatal(PlugfetchError::DigestMismatch {
                    expected: pinned.to_string(),
                    actual: digest.to_string(),
                }));
            }
        }

        let media_type = media_type_from_str(
            content_type.as_deref().unwrap_or(MEDIA_TYPE_DOCKER_MANIFEST),
        );
        let descriptor = DescriptorBuilder::default()
            .media_type(media_type)
            .digest(digest.clone())
            .size(body.len() as u64)
            .build()
            .map_err(|e| AttemptError::fatal(PlugfetchError::custom(e)))?;

        Ok(ResolvedPlugin::new(reference.canonical(&digest), descriptor))
    }
}

impl RegistryFetcher {
    fn content_url(&self, descriptor: &Descriptor) -> String {
        let kind = DescriptorKind::of(descriptor);
        let endpoint = match kind {
            DescriptorKind::Manifest | DescriptorKind::ManifestIndex => "manifests",
            _ => "blobs",
        };
        format!(
            "{}/v2/{}/{}/{}",
            self.transport.base_url(&self.registry),
            self.repository,
            endpoint,
            descriptor.digest()
        )
    }
}

impl AttemptError {
    /// A failure that no Accept-header reshuffling will fix.
    fn fatal(error: PlugfetchError) -> Self {
        Self {
            legacy: false,
            error,
        }
    }

    /// Surfaces the attempt's error, keeping authentication failures recognizable.
    fn surface(self, reference: &Reference) -> PlugfetchError {
        match self.error {
            err @ PlugfetchError::AuthenticationFailed { .. } => err,
            err => PlugfetchError::ResolveFailed {
                reference: reference.to_string(),
                reason: err.to_string(),
            },
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Resolver for RegistryResolver {
    async fn resolve(&self, reference: &Reference) -> PlugfetchResult<ResolvedPlugin> {
        match self.resolve_attempt(reference, AcceptStyle::Joined).await {
            Ok(resolved) => Ok(resolved),
            Err(original) if original.legacy => {
                // Older registries never learned to split a comma-joined Accept list; they
                // fall back to schema-1, which cannot express a plugin config. Retry once
                // with one Accept line per media type.
                tracing::debug!(
                    reference = %reference,
                    error = %original.error,
                    "resolve failed with a legacy manifest signal, retrying with split accept headers"
                );
                match self.resolve_attempt(reference, AcceptStyle::Split).await {
                    Ok(resolved) => Ok(resolved),
                    Err(retry) => {
                        tracing::debug!(
                            reference = %reference,
                            error = %retry.error,
                            "resolve failed again with split accept headers"
                        );
                        Err(original.surface(reference))
                    }
                }
            }
            Err(original) => Err(original.surface(reference)),
        }
    }

    async fn fetcher(&self, reference: &Reference) -> PlugfetchResult<Arc<dyn Fetcher>> {
        let mut ref_keys = RefKeyTable::new();
        // Without this the plugin config's in-flight write is tracked under "unknown".
        ref_keys.register(MEDIA_TYPE_PLUGIN_CONFIG, PLUGIN_CONFIG_REF_PREFIX);

        Ok(Arc::new(RegistryFetcher {
            transport: self.transport.clone(),
            registry: reference.get_registry().clone(),
            repository: reference.get_repository().clone(),
            scope: reference.pull_scope(),
            ref_keys,
        }))
    }
}

#[async_trait]
impl Fetcher for RegistryFetcher {
    async fn fetch(
        &self,
        descriptor: &Descriptor,
    ) -> PlugfetchResult<BoxStream<'static, PlugfetchResult<Bytes>>> {
        if DescriptorKind::of(descriptor) == DescriptorKind::ForeignLayer {
            return Err(PlugfetchError::FetchFailed {
                digest: descriptor.digest().to_string(),
                reason: "foreign layers are hosted outside the registry".to_string(),
            });
        }

        let url = self.content_url(descriptor);
        tracing::debug!(url = %url, digest = %descriptor.digest(), "fetching content");

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_str(&descriptor.media_type().to_string())
                .map_err(PlugfetchError::custom)?,
        );

        let response = self
            .transport
            .get_with_auth(&self.registry, &self.scope, &url, &headers)
            .await?;
        if !response.status().is_success() {
            return Err(PlugfetchError::FetchFailed {
                digest: descriptor.digest().to_string(),
                reason: format!("registry returned {}", response.status()),
            });
        }

        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(PlugfetchError::from));
        Ok(stream.boxed())
    }

    fn ref_key(&self, descriptor: &Descriptor) -> String {
        self.ref_keys.ref_key(descriptor)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the `Accept` headers for a resolve attempt.
fn accept_headers(style: AcceptStyle) -> HeaderMap {
    let mut headers = HeaderMap::new();
    match style {
        AcceptStyle::Joined => {
            headers.insert(
                ACCEPT,
                HeaderValue::from_str(&MANIFEST_ACCEPT_TYPES.join(", "))
                    .expect("static media types form a valid header"),
            );
        }
        AcceptStyle::Split => {
            for media_type in MANIFEST_ACCEPT_TYPES {
                headers.append(ACCEPT, HeaderValue::from_static(media_type));
            }
        }
    }
    headers
}

/// Whether a failed resolve response looks like a registry that mis-parsed the
/// comma-joined `Accept` list: it either fell back to schema-1 outright or rejected the
/// request as an unsupported manifest type.
fn is_legacy_manifest_signal(status: StatusCode, content_type: Option<&str>, body: &str) -> bool {
    if content_type
        .map(|ct| ct.starts_with(MEDIA_TYPE_DOCKER_SCHEMA1_PREFIX))
        .unwrap_or(false)
    {
        return true;
    }

    let body = body.to_ascii_lowercase();
    status.is_client_error() && (body.contains("unsupported") || body.contains("manifest_invalid"))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
