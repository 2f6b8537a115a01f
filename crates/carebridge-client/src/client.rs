use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use carebridge_core::{
    Bundle, Error, EventContext, EventDispatcher, Resource, ResourceType, Result,
};

use crate::auth::{TokenFreshness, TokenManager};
use crate::pool::{ConnectionPool, PoolConfig, PoolStatus};
use crate::source::SourceConfig;

/// Backoff schedule for connect failures and retriable statuses without a
/// `Retry-After` hint.
const RETRY_BACKOFF: [Duration; 2] = [Duration::from_millis(250), Duration::from_secs(1)];

pub(crate) struct Source {
    pub config: SourceConfig,
    pub http: reqwest::Client,
    pub tokens: TokenManager,
}

impl Source {
    pub fn name(&self) -> &str {
        &self.config.name
    }
}

/// Auth freshness for one source, reported by gateway status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SourceAuthStatus {
    pub name: String,
    pub auth_mode: &'static str,
    pub token: TokenFreshness,
}

struct UpstreamResponse {
    status: StatusCode,
    body: String,
    location: Option<String>,
}

struct Inner {
    pool: ConnectionPool,
    sources: DashMap<String, Arc<Source>>,
    dispatcher: Option<Arc<EventDispatcher>>,
    pub(crate) locks: DashMap<(String, String, String), Arc<tokio::sync::Mutex<()>>>,
}

/// Authenticated, connection-bounded CRUD against named FHIR servers.
///
/// Cloning is cheap; all clones share the same sources, pool accounting,
/// token caches and transaction lock table.
#[derive(Clone)]
pub struct FhirClientPool {
    inner: Arc<Inner>,
}

impl FhirClientPool {
    pub fn new(config: PoolConfig) -> Self {
        Self::build(config, None)
    }

    /// A pool that reports every operation to `dispatcher`.
    pub fn with_dispatcher(config: PoolConfig, dispatcher: Arc<EventDispatcher>) -> Self {
        Self::build(config, Some(dispatcher))
    }

    fn build(config: PoolConfig, dispatcher: Option<Arc<EventDispatcher>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool: ConnectionPool::new(config),
                sources: DashMap::new(),
                dispatcher,
                locks: DashMap::new(),
            }),
        }
    }

    /// Register a source from a `fhir://` connection string. Fails on a
    /// malformed string or duplicate name, before any network I/O.
    pub fn add_source(&self, name: impl Into<String>, connection_string: &str) -> Result<()> {
        let config = SourceConfig::parse(name, connection_string)?;
        self.add_source_config(config)
    }

    /// Register an already-built source descriptor.
    pub fn add_source_config(&self, config: SourceConfig) -> Result<()> {
        if self.inner.sources.contains_key(&config.name) {
            return Err(Error::invalid_argument(format!(
                "source '{}' is already registered",
                config.name
            )));
        }

        let pool_cfg = self.inner.pool.config();
        let http = reqwest::Client::builder()
            .timeout(pool_cfg.request_timeout)
            .pool_max_idle_per_host(pool_cfg.max_keepalive_connections)
            .pool_idle_timeout(pool_cfg.keepalive_expiry)
            .build()
            .map_err(|e| Error::internal(format!("cannot build HTTP client: {e}")))?;

        let tokens = TokenManager::new(config.auth.clone(), http.clone());
        let name = config.name.clone();
        self.inner.pool.register_source(&name);
        self.inner.sources.insert(
            name.clone(),
            Arc::new(Source {
                config,
                http,
                tokens,
            }),
        );
        debug!(source = %name, "Registered FHIR source");
        Ok(())
    }

    pub fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .sources
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn source_count(&self) -> usize {
        self.inner.sources.len()
    }

    pub fn dispatcher(&self) -> Option<&Arc<EventDispatcher>> {
        self.inner.dispatcher.as_ref()
    }

    /// Pool snapshot: sources, open/in-use counts, keepalive per source.
    pub fn pool_status(&self) -> PoolStatus {
        self.inner.pool.status()
    }

    /// Per-source auth freshness for status endpoints.
    pub async fn auth_status(&self) -> Vec<SourceAuthStatus> {
        let sources: Vec<Arc<Source>> = self
            .inner
            .sources
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut statuses = Vec::with_capacity(sources.len());
        for source in sources {
            statuses.push(SourceAuthStatus {
                name: source.name().to_string(),
                auth_mode: source.config.auth.label(),
                token: source.tokens.freshness().await,
            });
        }
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Close the pool: no further acquisitions, keepalive entries dropped.
    pub fn close(&self) {
        self.inner.pool.close();
    }

    pub(crate) fn resolve(&self, source: Option<&str>) -> Result<Arc<Source>> {
        match source {
            Some(name) => self
                .inner
                .sources
                .get(name)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| Error::not_registered(format!("source '{name}'"))),
            None => match self.inner.sources.len() {
                0 => Err(Error::not_registered("no FHIR sources registered")),
                1 => Ok(self
                    .inner
                    .sources
                    .iter()
                    .next()
                    .expect("len checked")
                    .value()
                    .clone()),
                _ => Err(Error::invalid_argument(
                    "source name required when multiple sources are registered",
                )),
            },
        }
    }

    pub(crate) fn lock_for(
        &self,
        source: &str,
        resource_type: &str,
        id: &str,
    ) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .locks
            .entry((
                source.to_string(),
                resource_type.to_string(),
                id.to_string(),
            ))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // ------------------------------------------------------------------
    // CRUD operations
    // ------------------------------------------------------------------

    /// `GET {base}/{type}/{id}`.
    pub async fn read(
        &self,
        resource_type: &str,
        id: &str,
        source: Option<&str>,
    ) -> Result<Resource> {
        let src = self.resolve(source)?;
        let result = self.do_read(&src, resource_type, id).await;
        self.report(
            "read",
            resource_type,
            Some(id),
            result.as_ref().ok().map(Resource::to_json),
            src.name(),
            &result,
        )
        .await;
        result
    }

    async fn do_read(&self, src: &Arc<Source>, resource_type: &str, id: &str) -> Result<Resource> {
        let url = src.config.resource_url(&[resource_type, id])?;
        let response = self.execute(src, Method::GET, url, None).await?;
        if response.status == StatusCode::NOT_FOUND {
            return Err(Error::not_found(resource_type, id));
        }
        let body = ok_body(response)?;
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| Error::invalid_response(format!("malformed resource body: {e}")))?;
        Resource::from_json(value)
    }

    /// `POST {base}/{type}`; the server-assigned id is copied into the
    /// returned resource.
    pub async fn create(&self, resource: Resource, source: Option<&str>) -> Result<Resource> {
        let src = self.resolve(source)?;
        let resource_type = resource.resource_type.as_str().to_string();
        let result = self.do_create(&src, resource).await;
        let id = result.as_ref().ok().and_then(|r| r.id.clone());
        self.report(
            "create",
            &resource_type,
            id.as_deref(),
            result.as_ref().ok().map(Resource::to_json),
            src.name(),
            &result,
        )
        .await;
        result
    }

    async fn do_create(&self, src: &Arc<Source>, resource: Resource) -> Result<Resource> {
        let resource_type = resource.resource_type.as_str().to_string();
        let url = src.config.resource_url(&[&resource_type])?;
        let payload = resource.to_json();
        let response = self
            .execute(src, Method::POST, url, Some(&payload))
            .await?;
        let location = response.location.clone();
        let body = ok_body(response)?;

        // Prefer the server's rendition of the resource; fall back to the
        // submitted one when the server returns no body.
        let mut created = match serde_json::from_str::<Value>(&body).ok() {
            Some(value) if value.get("resourceType").is_some() => Resource::from_json(value)?,
            _ => resource,
        };

        if created.id.is_none() {
            if let Some(id) = location.as_deref().and_then(id_from_location) {
                created.set_id(id);
            }
        }
        if created.id.is_none() {
            return Err(Error::invalid_response(
                "create response carried no resource id",
            ));
        }
        Ok(created)
    }

    /// `PUT {base}/{type}/{id}`; the resource must already carry an id.
    pub async fn update(&self, resource: Resource, source: Option<&str>) -> Result<Resource> {
        let src = self.resolve(source)?;
        let resource_type = resource.resource_type.as_str().to_string();
        let id = resource.id.clone();
        let result = match id.as_deref() {
            Some(id) => self.do_update(&src, resource, id).await,
            None => Err(Error::invalid_argument(
                "update requires a resource with an id",
            )),
        };
        self.report(
            "update",
            &resource_type,
            id.as_deref(),
            result.as_ref().ok().map(Resource::to_json),
            src.name(),
            &result,
        )
        .await;
        result
    }

    async fn do_update(&self, src: &Arc<Source>, resource: Resource, id: &str) -> Result<Resource> {
        let resource_type = resource.resource_type.as_str().to_string();
        let url = src.config.resource_url(&[&resource_type, id])?;
        let payload = resource.to_json();
        let response = self.execute(src, Method::PUT, url, Some(&payload)).await?;
        if response.status == StatusCode::NOT_FOUND {
            return Err(Error::not_found(resource_type, id));
        }
        let body = ok_body(response)?;
        match serde_json::from_str::<Value>(&body).ok() {
            Some(value) if value.get("resourceType").is_some() => Resource::from_json(value),
            _ => Ok(resource),
        }
    }

    /// `DELETE {base}/{type}/{id}`; a 404 reports `false` rather than an
    /// error.
    pub async fn delete(
        &self,
        resource_type: &str,
        id: &str,
        source: Option<&str>,
    ) -> Result<bool> {
        let src = self.resolve(source)?;
        let result = self.do_delete(&src, resource_type, id).await;
        self.report("delete", resource_type, Some(id), None, src.name(), &result)
            .await;
        result
    }

    async fn do_delete(&self, src: &Arc<Source>, resource_type: &str, id: &str) -> Result<bool> {
        let url = src.config.resource_url(&[resource_type, id])?;
        let response = self.execute(src, Method::DELETE, url, None).await?;
        if response.status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ok_body(response)?;
        Ok(true)
    }

    /// `GET {base}/{type}?…`; entry order of the returned bundle follows
    /// the upstream response.
    pub async fn search(
        &self,
        resource_type: &str,
        params: &[(&str, &str)],
        source: Option<&str>,
    ) -> Result<Bundle> {
        let src = self.resolve(source)?;
        let result = self.do_search(&src, resource_type, params).await;
        self.report("search", resource_type, None, None, src.name(), &result)
            .await;
        result
    }

    async fn do_search(
        &self,
        src: &Arc<Source>,
        resource_type: &str,
        params: &[(&str, &str)],
    ) -> Result<Bundle> {
        let mut url = src.config.resource_url(&[resource_type])?;
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        let response = self.execute(src, Method::GET, url, None).await?;
        let body = ok_body(response)?;
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| Error::invalid_response(format!("malformed bundle body: {e}")))?;
        Bundle::from_json(value)
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    /// Send one request with the standard retry policy: connect failures
    /// back off twice, 429/5xx honour `Retry-After` twice, a 401 forces
    /// exactly one token refresh, everything else surfaces.
    async fn execute(
        &self,
        src: &Arc<Source>,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<UpstreamResponse> {
        let mut permit = self.inner.pool.acquire(src.name()).await?;

        let mut connect_retries = 0usize;
        let mut status_retries = 0usize;
        let mut refreshed = false;

        loop {
            let mut request = src.http.request(method.clone(), url.clone());
            if let Some(bearer) = src.tokens.bearer().await? {
                request = request.bearer_auth(bearer);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    permit.discard();
                    return Err(Error::request_timeout(format!("{method} {url}: {e}")));
                }
                Err(e) if e.is_connect() && connect_retries < RETRY_BACKOFF.len() => {
                    warn!(source = %src.name(), error = %e, "Connect failure, backing off");
                    tokio::time::sleep(RETRY_BACKOFF[connect_retries]).await;
                    connect_retries += 1;
                    continue;
                }
                Err(e) => {
                    permit.discard();
                    return Err(Error::upstream(502, format!("{method} {url}: {e}")));
                }
            };

            let status = response.status();

            if status == StatusCode::UNAUTHORIZED {
                if refreshed {
                    permit.discard();
                    return Err(Error::authentication_failed(format!(
                        "source '{}' rejected a freshly-minted token",
                        src.name()
                    )));
                }
                debug!(source = %src.name(), "401 from upstream, forcing token refresh");
                src.tokens.invalidate().await;
                refreshed = true;
                continue;
            }

            let retriable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
            if retriable && status_retries < RETRY_BACKOFF.len() {
                let delay = retry_after(&response).unwrap_or(RETRY_BACKOFF[status_retries]);
                warn!(source = %src.name(), %status, ?delay, "Retriable upstream status");
                tokio::time::sleep(delay).await;
                status_retries += 1;
                continue;
            }

            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response
                .text()
                .await
                .map_err(|e| Error::invalid_response(format!("reading upstream body: {e}")))?;

            permit.keep();
            return Ok(UpstreamResponse {
                status,
                body,
                location,
            });
        }
    }

    // ------------------------------------------------------------------
    // Event reporting
    // ------------------------------------------------------------------

    /// Emit `fhir.<op>` + `fhir.<resource>.<op>` on success, or
    /// `fhir.<op>.error` with the error kind on failure.
    async fn report<T>(
        &self,
        op: &str,
        resource_type: &str,
        resource_id: Option<&str>,
        resource: Option<Value>,
        source: &str,
        result: &Result<T>,
    ) {
        let Some(dispatcher) = &self.inner.dispatcher else {
            return;
        };

        let mut context = EventContext::operation(op)
            .with_resource_type(resource_type)
            .with_source(source);
        if let Some(id) = resource_id {
            context = context.with_resource_id(id);
        }

        match result {
            Ok(_) => {
                if let Some(resource) = resource {
                    context = context.with_resource(resource);
                }
                let payload = dispatcher.create_payload(&context);
                let segment = ResourceType::from(resource_type).topic_segment();
                let _ = dispatcher.emit(&format!("fhir.{op}"), payload.clone()).await;
                let _ = dispatcher
                    .emit(&format!("fhir.{segment}.{op}"), payload)
                    .await;
            }
            Err(err) => {
                let mut payload = dispatcher.create_payload(&context);
                if let Some(object) = payload.as_object_mut() {
                    object.insert("error".into(), Value::String(err.kind().as_str().into()));
                }
                let _ = dispatcher.emit(&format!("fhir.{op}.error"), payload).await;
            }
        }
    }
}

impl std::fmt::Debug for FhirClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FhirClientPool")
            .field("sources", &self.source_names())
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

/// Map a non-success status to the error taxonomy; 404 must be handled by
/// the caller before this point.
fn ok_body(response: UpstreamResponse) -> Result<String> {
    let status = response.status;
    if status.is_success() {
        return Ok(response.body);
    }
    Err(match status.as_u16() {
        400 => Error::invalid_argument(format!("upstream rejected request: {}", response.body)),
        409 => Error::conflict(format!("upstream reported a conflict: {}", response.body)),
        code => Error::upstream(code, truncate(&response.body, 512)),
    })
}

fn truncate(body: &str, limit: usize) -> String {
    if body.chars().count() <= limit {
        body.to_string()
    } else {
        let head: String = body.chars().take(limit).collect();
        format!("{head}…")
    }
}

/// `Retry-After` as either delta-seconds or an HTTP-date.
fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    let raw = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?;
    if let Ok(seconds) = raw.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = httpdate::parse_http_date(raw).ok()?;
    when.duration_since(std::time::SystemTime::now()).ok()
}

/// Extract the logical id from a `Location: …/{type}/{id}[/_history/{vid}]`
/// header.
fn id_from_location(location: &str) -> Option<String> {
    let trimmed = location.trim_end_matches('/');
    let segments: Vec<&str> = trimmed.split('/').collect();
    match segments.as_slice() {
        [.., _type, id, "_history", _vid] => Some((*id).to_string()),
        [.., _type, id] => Some((*id).to_string()),
        _ => None,
    }
}

/// Pool snapshot combined with per-source auth freshness, used by gateway
/// status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub pool: PoolStatus,
    pub auth: Vec<SourceAuthStatus>,
}

impl FhirClientPool {
    pub async fn status(&self) -> ClientStatus {
        ClientStatus {
            pool: self.pool_status(),
            auth: self.auth_status().await,
        }
    }

    /// Keepalive snapshot keyed by source; convenience for tests.
    pub fn keepalive_snapshot(&self) -> HashMap<String, usize> {
        self.pool_status().keepalive_connections_per_source
    }
}
