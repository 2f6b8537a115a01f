use std::collections::HashMap;
use std::path::PathBuf;

use url::Url;

use carebridge_core::{Error, Result};

/// Default OAuth2 scope requested when a connection string names none.
pub const DEFAULT_SCOPE: &str = "system/*.read system/*.write";

/// How a source authenticates to its FHIR server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// No authentication; requests carry no Authorization header.
    None,
    /// OAuth2 client-credentials grant with a shared secret.
    ClientCredentials {
        client_id: String,
        client_secret: String,
        token_url: Url,
        scope: String,
        audience: Option<String>,
    },
    /// OAuth2 client-credentials grant authenticated by an RS256-signed
    /// JWT assertion (SMART Backend Services style).
    JwtAssertion {
        client_id: String,
        private_key_path: PathBuf,
        token_url: Url,
        scope: String,
        audience: Option<String>,
    },
}

impl AuthMode {
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ClientCredentials { .. } => "client-credentials",
            Self::JwtAssertion { .. } => "jwt-assertion",
        }
    }
}

/// A named outbound FHIR endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    /// Unique name within a pool; primary key.
    pub name: String,
    /// HTTP base the resource paths are joined onto.
    pub base_url: Url,
    pub auth: AuthMode,
}

impl SourceConfig {
    /// An unauthenticated source; used directly by tests and trusted
    /// internal deployments.
    pub fn new(name: impl Into<String>, base_url: Url) -> Self {
        Self {
            name: name.into(),
            base_url,
            auth: AuthMode::None,
        }
    }

    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    /// Parse a `fhir://` connection string.
    ///
    /// Grammar: `fhir://host[:port]/base-path?client_id=..&token_url=..
    /// [&client_secret=..|&client_secret_path=..][&scope=..]
    /// [&use_jwt_assertion=true][&audience=..]`.
    ///
    /// `fhir://` maps to an `https` base; `fhir+http://` maps to plain
    /// `http` for test rigs. All validation happens here, before any
    /// network I/O.
    pub fn parse(name: impl Into<String>, connection_string: &str) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::invalid_argument("source name must not be empty"));
        }

        let parsed = Url::parse(connection_string)
            .map_err(|e| Error::invalid_argument(format!("invalid connection string: {e}")))?;

        let scheme = match parsed.scheme() {
            "fhir" => "https",
            "fhir+http" => "http",
            other => {
                return Err(Error::invalid_argument(format!(
                    "connection string scheme must be fhir:// or fhir+http://, got {other}://"
                )));
            }
        };

        let host = parsed
            .host_str()
            .ok_or_else(|| Error::invalid_argument("connection string is missing a host"))?;

        let mut base = format!("{scheme}://{host}");
        if let Some(port) = parsed.port() {
            base.push_str(&format!(":{port}"));
        }
        base.push_str(parsed.path());
        let base_url = Url::parse(&base)?;

        let params: HashMap<String, String> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let client_id = params
            .get("client_id")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| Error::invalid_argument("connection string is missing client_id"))?;

        let token_url = params
            .get("token_url")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::invalid_argument("connection string is missing token_url"))?;
        let token_url = Url::parse(token_url)
            .map_err(|e| Error::invalid_argument(format!("invalid token_url: {e}")))?;

        let scope = params
            .get("scope")
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string());
        let audience = params.get("audience").filter(|v| !v.is_empty()).cloned();

        let client_secret = params.get("client_secret").filter(|v| !v.is_empty());
        let client_secret_path = params.get("client_secret_path").filter(|v| !v.is_empty());
        if client_secret.is_some() && client_secret_path.is_some() {
            return Err(Error::invalid_argument(
                "client_secret and client_secret_path are mutually exclusive",
            ));
        }

        let use_jwt_assertion = params
            .get("use_jwt_assertion")
            .map(|v| matches!(v.as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);

        let auth = if use_jwt_assertion {
            let path = client_secret_path.ok_or_else(|| {
                Error::invalid_argument("use_jwt_assertion requires client_secret_path")
            })?;
            AuthMode::JwtAssertion {
                client_id,
                private_key_path: PathBuf::from(path),
                token_url,
                scope,
                audience,
            }
        } else {
            let secret = client_secret.ok_or_else(|| {
                Error::invalid_argument("connection string is missing client_secret")
            })?;
            AuthMode::ClientCredentials {
                client_id,
                client_secret: secret.clone(),
                token_url,
                scope,
                audience,
            }
        };

        Ok(Self {
            name,
            base_url,
            auth,
        })
    }

    /// Build a source from `<NAME>_CLIENT_ID`, `<NAME>_CLIENT_SECRET`,
    /// `<NAME>_TOKEN_URL`, `<NAME>_BASE_URL` and `<NAME>_SCOPE` environment
    /// variables. Dashes in the name become underscores.
    pub fn from_env(name: &str) -> Result<Self> {
        let prefix = name.to_ascii_uppercase().replace('-', "_");
        let var = |suffix: &str| std::env::var(format!("{prefix}_{suffix}")).ok();

        let base_url = var("BASE_URL")
            .ok_or_else(|| Error::invalid_argument(format!("{prefix}_BASE_URL is not set")))?;
        let base_url = Url::parse(&base_url)
            .map_err(|e| Error::invalid_argument(format!("invalid {prefix}_BASE_URL: {e}")))?;

        let auth = match (var("CLIENT_ID"), var("CLIENT_SECRET"), var("TOKEN_URL")) {
            (Some(client_id), Some(client_secret), Some(token_url)) => {
                let token_url = Url::parse(&token_url).map_err(|e| {
                    Error::invalid_argument(format!("invalid {prefix}_TOKEN_URL: {e}"))
                })?;
                AuthMode::ClientCredentials {
                    client_id,
                    client_secret,
                    token_url,
                    scope: var("SCOPE").unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
                    audience: None,
                }
            }
            (None, None, None) => AuthMode::None,
            _ => {
                return Err(Error::invalid_argument(format!(
                    "{prefix}_CLIENT_ID, {prefix}_CLIENT_SECRET and {prefix}_TOKEN_URL must be set together"
                )));
            }
        };

        Ok(Self {
            name: name.to_string(),
            base_url,
            auth,
        })
    }

    /// URL of `{base}/{segments...}` with the base path preserved.
    pub fn resource_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| Error::invalid_argument("source base URL cannot be a base"))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }
}
