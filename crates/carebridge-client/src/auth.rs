use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use carebridge_core::{Error, Result};

use crate::source::AuthMode;

/// Tokens are never served within this window of their expiry.
const EXPIRY_SKEW: Duration = Duration::seconds(30);

/// JWT assertions are valid for five minutes, per RFC 7523 guidance.
const ASSERTION_LIFETIME_SECONDS: i64 = 300;

/// A cached OAuth2 access token.
#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub access_token: String,
    pub expires_at: OffsetDateTime,
    pub scopes: Option<String>,
}

impl Token {
    fn is_fresh(&self, now: OffsetDateTime) -> bool {
        now + EXPIRY_SKEW < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    scope: Option<String>,
}

/// Claims for the RS256 client assertion posted to the token endpoint.
#[derive(Debug, Serialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    aud: String,
    jti: String,
    iat: i64,
    exp: i64,
}

/// Freshness of a source's cached token, for status introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenFreshness {
    /// The source does not authenticate.
    Unauthenticated,
    /// No token has been fetched yet.
    Absent,
    /// A cached token is within its validity window.
    Fresh,
    /// The cached token is past (or within skew of) its expiry.
    Expired,
}

/// Per-source OAuth2 token lifecycle.
///
/// One token is cached per source; refreshes are serialised through a latch
/// so concurrent requests share a single in-flight fetch. A failed fetch is
/// retried once before surfacing `AuthenticationFailed`.
pub struct TokenManager {
    auth: AuthMode,
    http: reqwest::Client,
    cached: RwLock<Option<Token>>,
    latch: Mutex<()>,
}

impl TokenManager {
    pub fn new(auth: AuthMode, http: reqwest::Client) -> Self {
        Self {
            auth,
            http,
            cached: RwLock::new(None),
            latch: Mutex::new(()),
        }
    }

    /// The bearer token to attach, fetching or refreshing when needed.
    /// Returns `None` for unauthenticated sources.
    pub async fn bearer(&self) -> Result<Option<String>> {
        if matches!(self.auth, AuthMode::None) {
            return Ok(None);
        }

        let now = OffsetDateTime::now_utc();
        if let Some(token) = self.cached.read().await.as_ref() {
            if token.is_fresh(now) {
                return Ok(Some(token.access_token.clone()));
            }
        }

        // Serialise the refresh; whoever wins re-checks the cache so the
        // queued callers reuse the winner's token.
        let _latch = self.latch.lock().await;
        if let Some(token) = self.cached.read().await.as_ref() {
            if token.is_fresh(OffsetDateTime::now_utc()) {
                return Ok(Some(token.access_token.clone()));
            }
        }

        let token = self.fetch_with_retry().await?;
        let access_token = token.access_token.clone();
        *self.cached.write().await = Some(token);
        Ok(Some(access_token))
    }

    /// Drop the cached token so the next request fetches a fresh one.
    /// Called after an upstream 401.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    pub async fn freshness(&self) -> TokenFreshness {
        if matches!(self.auth, AuthMode::None) {
            return TokenFreshness::Unauthenticated;
        }
        match self.cached.read().await.as_ref() {
            None => TokenFreshness::Absent,
            Some(token) if token.is_fresh(OffsetDateTime::now_utc()) => TokenFreshness::Fresh,
            Some(_) => TokenFreshness::Expired,
        }
    }

    async fn fetch_with_retry(&self) -> Result<Token> {
        match self.fetch().await {
            Ok(token) => Ok(token),
            Err(first) => {
                warn!(error = %first, "Token fetch failed, retrying once");
                self.fetch().await.map_err(|second| {
                    Error::authentication_failed(format!(
                        "token fetch failed twice: {first}; then: {second}"
                    ))
                })
            }
        }
    }

    async fn fetch(&self) -> Result<Token> {
        let (token_url, form) = match &self.auth {
            AuthMode::None => {
                return Err(Error::internal("token fetch on unauthenticated source"));
            }
            AuthMode::ClientCredentials {
                client_id,
                client_secret,
                token_url,
                scope,
                ..
            } => {
                let form = vec![
                    ("grant_type".to_string(), "client_credentials".to_string()),
                    ("client_id".to_string(), client_id.clone()),
                    ("client_secret".to_string(), client_secret.clone()),
                    ("scope".to_string(), scope.clone()),
                ];
                (token_url.clone(), form)
            }
            AuthMode::JwtAssertion {
                client_id,
                private_key_path,
                token_url,
                scope,
                audience,
            } => {
                let audience = audience
                    .clone()
                    .unwrap_or_else(|| token_url.as_str().to_string());
                let assertion =
                    build_assertion(client_id, private_key_path, &audience).await?;
                let form = vec![
                    ("grant_type".to_string(), "client_credentials".to_string()),
                    (
                        "client_assertion_type".to_string(),
                        "urn:ietf:params:oauth:client-assertion-type:jwt-bearer".to_string(),
                    ),
                    ("client_assertion".to_string(), assertion),
                    ("scope".to_string(), scope.clone()),
                ];
                (token_url.clone(), form)
            }
        };

        let response = self
            .http
            .post(token_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::authentication_failed(format!("token endpoint error: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::authentication_failed(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::invalid_response(format!("token response: {e}")))?;

        debug!(token_url = %token_url, expires_in = parsed.expires_in, "Fetched access token");
        Ok(Token {
            access_token: parsed.access_token,
            expires_at: OffsetDateTime::now_utc() + Duration::seconds(parsed.expires_in),
            scopes: parsed.scope,
        })
    }

    /// Scopes granted with the cached token, if any.
    pub async fn granted_scopes(&self) -> Option<String> {
        self.cached.read().await.as_ref()?.scopes.clone()
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("auth", &self.auth.label())
            .finish_non_exhaustive()
    }
}

/// Build an RS256-signed client assertion from the PEM key at
/// `private_key_path`.
async fn build_assertion(
    client_id: &str,
    private_key_path: &std::path::Path,
    audience: &str,
) -> Result<String> {
    let pem = tokio::fs::read(private_key_path).await.map_err(|e| {
        Error::authentication_failed(format!(
            "cannot read private key {}: {e}",
            private_key_path.display()
        ))
    })?;
    let key = jsonwebtoken::EncodingKey::from_rsa_pem(&pem)
        .map_err(|e| Error::authentication_failed(format!("invalid private key: {e}")))?;

    let now = OffsetDateTime::now_utc().unix_timestamp();
    let claims = AssertionClaims {
        iss: client_id.to_string(),
        sub: client_id.to_string(),
        aud: audience.to_string(),
        jti: Uuid::new_v4().to_string(),
        iat: now,
        exp: now + ASSERTION_LIFETIME_SECONDS,
    };

    let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256);
    jsonwebtoken::encode(&header, &claims, &key)
        .map_err(|e| Error::authentication_failed(format!("cannot sign assertion: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_freshness_respects_skew() {
        let now = OffsetDateTime::now_utc();
        let fresh = Token {
            access_token: "tk".into(),
            expires_at: now + Duration::seconds(3600),
            scopes: None,
        };
        assert!(fresh.is_fresh(now));

        // Inside the 30 s skew window counts as expired.
        let nearly_expired = Token {
            access_token: "tk".into(),
            expires_at: now + Duration::seconds(10),
            scopes: None,
        };
        assert!(!nearly_expired.is_fresh(now));
    }

    #[tokio::test]
    async fn test_unauthenticated_source_has_no_bearer() {
        let manager = TokenManager::new(AuthMode::None, reqwest::Client::new());
        assert_eq!(manager.bearer().await.unwrap(), None);
        assert_eq!(manager.freshness().await, TokenFreshness::Unauthenticated);
    }

    #[tokio::test]
    async fn test_freshness_absent_before_first_fetch() {
        let auth = AuthMode::ClientCredentials {
            client_id: "abc".into(),
            client_secret: "xyz".into(),
            token_url: url::Url::parse("https://auth.example.com/t").unwrap(),
            scope: crate::source::DEFAULT_SCOPE.into(),
            audience: None,
        };
        let manager = TokenManager::new(auth, reqwest::Client::new());
        assert_eq!(manager.freshness().await, TokenFreshness::Absent);
    }

    #[test]
    fn test_assertion_claims_shape() {
        let claims = AssertionClaims {
            iss: "abc".into(),
            sub: "abc".into(),
            aud: "https://auth/t".into(),
            jti: "j1".into(),
            iat: 1000,
            exp: 1300,
        };
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["iss"], json["sub"]);
        assert_eq!(json["exp"].as_i64().unwrap() - json["iat"].as_i64().unwrap(), 300);
    }
}
