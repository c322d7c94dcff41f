use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, Instant},
};

use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;

use super::RegistryAuth;
use crate::{PlugfetchError, PlugfetchResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long a token is assumed to stay valid when the token service does not say.
///
/// Docker Hub tokens expire after 300 seconds; re-authenticating a little early is harmless.
const ASSUMED_TOKEN_VALIDITY: Duration = Duration::from_secs(300);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A parsed `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    /// The token service URL.
    pub realm: String,

    /// The service name to pass along to the token service.
    pub service: Option<String>,
}

/// Caches bearer tokens per `(registry, scope)` pair.
#[derive(Debug, Default)]
pub struct TokenCache {
    tokens: RwLock<HashMap<String, CachedToken>>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// The token service's answer; some services use `token`, some `access_token`.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TokenCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached token for a registry and scope, if it is still valid.
    pub fn get(&self, registry: &str, scope: &str) -> Option<String> {
        let tokens = self.tokens.read().unwrap();
        tokens
            .get(&cache_key(registry, scope))
            .filter(|cached| cached.expires_at > Instant::now())
            .map(|cached| cached.token.clone())
    }

    /// Stores a token for a registry and scope.
    pub fn insert(&self, registry: &str, scope: &str, token: String, expires_in: Option<u64>) {
        let validity = expires_in
            .map(Duration::from_secs)
            .unwrap_or(ASSUMED_TOKEN_VALIDITY);
        let mut tokens = self.tokens.write().unwrap();
        tokens.insert(
            cache_key(registry, scope),
            CachedToken {
                token,
                expires_at: Instant::now() + validity,
            },
        );
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a `WWW-Authenticate` header into a bearer challenge.
///
/// Expected shape: `Bearer realm="…",service="…",scope="…"`. Non-bearer schemes return
/// `None`.
pub fn parse_www_authenticate(header: &str) -> Option<BearerChallenge> {
    let header = header.trim();
    let params_str = header.strip_prefix("Bearer ")?;

    let mut params = HashMap::new();
    for part in params_str.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            params.insert(key.to_string(), value.trim_matches('"').to_string());
        }
    }

    Some(BearerChallenge {
        realm: params.remove("realm")?,
        service: params.remove("service"),
    })
}

/// Requests a bearer token from the challenge's token service.
///
/// Basic credentials (or an identity token standing in for the password) are attached when
/// the provider supplied them; otherwise the request is anonymous and public registries
/// answer with an anonymous pull token.
pub async fn request_token(
    client: &ClientWithMiddleware,
    challenge: &BearerChallenge,
    scope: &str,
    auth: &RegistryAuth,
    host: &str,
) -> PlugfetchResult<(String, Option<u64>)> {
    let mut request = client
        .get(challenge.realm.as_str())
        .query(&[("scope", scope)]);

    if let Some(service) = &challenge.service {
        request = request.query(&[("service", service)]);
    }

    if let Some(username) = &auth.username {
        let password = auth.password.as_deref().or(auth.identity_token.as_deref());
        request = request.basic_auth(username, password);
    }

    let response = client.execute(request.build()?).await?;
    if !response.status().is_success() {
        return Err(PlugfetchError::AuthenticationFailed {
            host: host.to_string(),
            reason: format!("token service returned {}", response.status()),
        });
    }

    let token_response = response.json::<TokenResponse>().await?;
    let token = token_response
        .token
        .or(token_response.access_token)
        .ok_or_else(|| PlugfetchError::AuthenticationFailed {
            host: host.to_string(),
            reason: "token service response carried no token".to_string(),
        })?;

    Ok((token, token_response.expires_in))
}

fn cache_key(registry: &str, scope: &str) -> String {
    format!("{}|{}", registry, scope)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
