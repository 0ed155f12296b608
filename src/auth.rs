//! Bearer-token verification against the identity provider's JWKS, plus the
//! Auth0 Management API client backing the `/users` passthrough.
//!
//! Every verification failure collapses to one generic 401 response; the
//! underlying cause is only visible in debug-level logs so callers cannot
//! learn which check failed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::AppConfig;
use crate::error::AppError;

/// Verifies a bearer token and yields the authenticated subject identifier.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<String, AppError>;
}

/// A single JSON Web Key from the provider's published set.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kid: Option<String>,
    pub n: String,
    pub e: String,
}

/// The provider's published key set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Finds an RSA key by identifier in a fetched key set.
pub fn find_key<'a>(jwks: &'a Jwks, kid: &str) -> Option<&'a Jwk> {
    jwks.keys.iter().find(|key| key.kid.as_deref() == Some(kid))
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

struct CachedJwks {
    jwks: Jwks,
    fetched_at: Instant,
}

/// Fetches the provider's current key set. Seam between the verifier's cache
/// logic and the network.
#[async_trait]
trait JwksSource: Send + Sync {
    async fn fetch(&self) -> Result<Jwks, AppError>;
}

/// Production source: GETs the tenant's published JWKS document.
struct HttpJwksSource {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl JwksSource for HttpJwksSource {
    async fn fetch(&self) -> Result<Jwks, AppError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| rejected(format!("JWKS fetch failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(rejected(format!("JWKS fetch returned {status}")));
        }

        response
            .json()
            .await
            .map_err(|err| rejected(format!("invalid JWKS document: {err}")))
    }
}

/// JWKS-backed RS256 verifier with a time-bounded key cache.
///
/// A cache entry older than the configured lifetime is refetched; a `kid`
/// absent from a cached set triggers one forced refresh before the token is
/// rejected, so key rotation does not strand clients for the cache lifetime.
pub struct JwksVerifier {
    source: Arc<dyn JwksSource>,
    issuer: String,
    audience: String,
    cache_ttl: Duration,
    cache: RwLock<Option<CachedJwks>>,
}

impl JwksVerifier {
    pub fn new(client: reqwest::Client, cfg: &AppConfig) -> Self {
        Self::from_source(
            Arc::new(HttpJwksSource {
                client,
                url: cfg.jwks_url(),
            }),
            cfg.auth0_issuer(),
            cfg.auth0_audience.clone(),
            Duration::from_secs(cfg.jwks_cache_secs),
        )
    }

    fn from_source(
        source: Arc<dyn JwksSource>,
        issuer: String,
        audience: String,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            source,
            issuer,
            audience,
            cache_ttl,
            cache: RwLock::new(None),
        }
    }

    async fn cached_key(&self, kid: &str) -> Option<Jwk> {
        let guard = self.cache.read().await;
        let cached = guard.as_ref()?;
        if cached.fetched_at.elapsed() >= self.cache_ttl {
            return None;
        }
        find_key(&cached.jwks, kid).cloned()
    }

    async fn refresh(&self) -> Result<Jwks, AppError> {
        let jwks = self.source.fetch().await?;
        let mut guard = self.cache.write().await;
        *guard = Some(CachedJwks {
            jwks: jwks.clone(),
            fetched_at: Instant::now(),
        });
        Ok(jwks)
    }

    async fn key_for(&self, kid: &str) -> Result<Jwk, AppError> {
        if let Some(key) = self.cached_key(kid).await {
            return Ok(key);
        }
        let jwks = self.refresh().await?;
        find_key(&jwks, kid)
            .cloned()
            .ok_or_else(|| rejected(format!("no key matches kid {kid:?}")))
    }
}

#[async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify(&self, token: &str) -> Result<String, AppError> {
        let header = decode_header(token)
            .map_err(|err| rejected(format!("malformed token header: {err}")))?;
        let kid = header
            .kid
            .ok_or_else(|| rejected("token header has no kid"))?;

        let key = self.key_for(&kid).await?;
        let decoding_key = DecodingKey::from_rsa_components(&key.n, &key.e)
            .map_err(|err| rejected(format!("unusable JWKS key {kid:?}: {err}")))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.issuer]);

        let data = decode::<Claims>(token, &decoding_key, &validation)
            .map_err(|err| rejected(format!("token validation failed: {err}")))?;

        Ok(data.claims.sub)
    }
}

fn rejected(cause: impl std::fmt::Display) -> AppError {
    debug!("rejecting bearer token: {cause}");
    AppError::unauthorized("invalid token")
}

/// A user record from the identity provider's directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub created_at: Option<String>,
}

/// Lists users known to the identity provider.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn list_users(&self) -> Result<Vec<DirectoryUser>, AppError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Auth0 Management API client using the client-credentials grant.
pub struct ManagementClient {
    client: reqwest::Client,
    domain: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl ManagementClient {
    pub fn new(client: reqwest::Client, cfg: &AppConfig) -> Self {
        Self {
            client,
            domain: cfg.auth0_domain.clone(),
            client_id: cfg.auth0_client_id.clone(),
            client_secret: cfg.auth0_client_secret.clone(),
        }
    }

    async fn management_token(&self) -> Result<String, AppError> {
        let (client_id, client_secret) = match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) => (id, secret),
            _ => {
                return Err(AppError::internal(
                    "AUTH0_CLIENT_ID and AUTH0_CLIENT_SECRET are required for user listing",
                ));
            }
        };

        let url = format!("https://{}/oauth/token", self.domain);
        let body = json!({
            "client_id": client_id,
            "client_secret": client_secret,
            "audience": format!("https://{}/api/v2/", self.domain),
            "grant_type": "client_credentials",
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| AppError::upstream(format!("management token request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::upstream(format!(
                "management token request returned {status}: {detail}"
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|err| AppError::upstream(format!("invalid token response: {err}")))?;
        Ok(parsed.access_token)
    }
}

#[async_trait]
impl UserDirectory for ManagementClient {
    async fn list_users(&self) -> Result<Vec<DirectoryUser>, AppError> {
        let token = self.management_token().await?;
        let url = format!("https://{}/api/v2/users", self.domain);

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| AppError::upstream(format!("user listing failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::upstream(format!(
                "user listing returned {status}: {detail}"
            )));
        }

        response
            .json::<Vec<DirectoryUser>>()
            .await
            .map_err(|err| AppError::upstream(format!("invalid user listing response: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::{find_key, Jwks, JwksSource, JwksVerifier, TokenVerifier};
    use crate::error::AppError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// RS256 header naming a `kid` no sample set contains; validation never
    /// reaches the signature.
    const UNKNOWN_KID_TOKEN: &str = "eyJhbGciOiJSUzI1NiIsInR5cCI6IkpXVCIsImtpZCI6InJvdGF0ZWQtYXdheSJ9.eyJzdWIiOiJhdXRoMHxhbGljZSJ9.sig";

    fn sample_jwks() -> Jwks {
        serde_json::from_str(
            r#"{"keys": [
                {"kty": "RSA", "kid": "key-1", "use": "sig", "n": "abc", "e": "AQAB"},
                {"kty": "RSA", "kid": "key-2", "use": "sig", "n": "def", "e": "AQAB"}
            ]}"#,
        )
        .expect("jwks json")
    }

    struct ScriptedSource {
        jwks: Mutex<Jwks>,
        fetches: AtomicUsize,
    }

    impl ScriptedSource {
        fn serving(jwks: Jwks) -> Arc<Self> {
            Arc::new(Self {
                jwks: Mutex::new(jwks),
                fetches: AtomicUsize::new(0),
            })
        }

        fn rotate_to(&self, jwks: Jwks) {
            *self.jwks.lock().expect("jwks lock") = jwks;
        }

        fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JwksSource for ScriptedSource {
        async fn fetch(&self) -> Result<Jwks, AppError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.jwks.lock().expect("jwks lock").clone())
        }
    }

    fn verifier(source: Arc<ScriptedSource>, cache_ttl: Duration) -> JwksVerifier {
        JwksVerifier::from_source(
            source,
            "https://tenant.example.auth0.com/".to_string(),
            "https://api.example.com".to_string(),
            cache_ttl,
        )
    }

    #[tokio::test]
    async fn fresh_cache_serves_repeat_lookups_without_refetch() {
        let source = ScriptedSource::serving(sample_jwks());
        let verifier = verifier(Arc::clone(&source), Duration::from_secs(300));

        let first = verifier.key_for("key-1").await.expect("key present");
        assert_eq!(first.n, "abc");
        assert_eq!(source.fetch_count(), 1);

        let second = verifier.key_for("key-2").await.expect("key present");
        assert_eq!(second.n, "def");
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn expired_cache_entry_is_refetched() {
        let source = ScriptedSource::serving(sample_jwks());
        let verifier = verifier(Arc::clone(&source), Duration::ZERO);

        verifier.key_for("key-1").await.expect("key present");
        verifier.key_for("key-1").await.expect("key present");
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn rotated_key_is_found_after_forced_refresh() {
        let source = ScriptedSource::serving(sample_jwks());
        let verifier = verifier(Arc::clone(&source), Duration::from_secs(300));

        verifier.key_for("key-1").await.expect("key present");
        assert_eq!(source.fetch_count(), 1);

        source.rotate_to(
            serde_json::from_str(
                r#"{"keys": [{"kty": "RSA", "kid": "key-3", "n": "ghi", "e": "AQAB"}]}"#,
            )
            .expect("jwks json"),
        );

        let rotated = verifier.key_for("key-3").await.expect("key present");
        assert_eq!(rotated.n, "ghi");
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn token_with_unknown_kid_is_rejected_after_one_refresh() {
        let source = ScriptedSource::serving(sample_jwks());
        let verifier = verifier(Arc::clone(&source), Duration::from_secs(300));

        let err = verifier
            .verify(UNKNOWN_KID_TOKEN)
            .await
            .expect_err("must be rejected");
        assert!(matches!(err, AppError::Unauthorized(_)));
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn malformed_token_is_rejected_without_fetching_keys() {
        let source = ScriptedSource::serving(sample_jwks());
        let verifier = verifier(Arc::clone(&source), Duration::from_secs(300));

        let err = verifier
            .verify("not-a-jwt")
            .await
            .expect_err("must be rejected");
        assert!(matches!(err, AppError::Unauthorized(_)));
        assert_eq!(source.fetch_count(), 0);
    }

    #[test]
    fn find_key_matches_by_kid() {
        let jwks = sample_jwks();
        let key = find_key(&jwks, "key-2").expect("key present");
        assert_eq!(key.n, "def");
    }

    #[test]
    fn find_key_returns_none_for_unknown_kid() {
        let jwks = sample_jwks();
        assert!(find_key(&jwks, "rotated-away").is_none());
    }

    #[test]
    fn empty_key_set_never_matches() {
        let jwks = Jwks::default();
        assert!(find_key(&jwks, "key-1").is_none());
    }
}
