//! CDS Hooks 1.x server surface.
//!
//! Implements discovery (`GET /cds-services`) and hook execution
//! (`POST /cds-services/{id}`) over a registry of consumer-supplied
//! handlers. Request validation failures map to 400 with the specific
//! failure; handler errors map to 500 with an `{"error": "internal"}` body
//! per the CDS Hooks contract.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use carebridge_core::{Error, EventContext, EventDispatcher, Result};

use crate::error::ApiError;
use crate::{Gateway, GatewayKind, GatewayStatus};

/// Longest allowed card summary, per the CDS Hooks specification.
const MAX_SUMMARY_CHARS: usize = 140;

/// A CDS Hooks request as received on the execution endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CdsRequest {
    pub hook: String,
    #[serde(rename = "hookInstance")]
    pub hook_instance: String,
    #[serde(rename = "fhirServer", default)]
    pub fhir_server: Option<String>,
    pub context: Value,
    #[serde(default)]
    pub prefetch: Map<String, Value>,
}

/// Urgency of a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Indicator {
    Info,
    Warning,
    Critical,
}

/// Attribution block of a card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardSource {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A decision-support recommendation returned by a hook handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub summary: String,
    pub indicator: Indicator,
    pub source: CardSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Value>,
}

impl Card {
    pub fn new(
        summary: impl Into<String>,
        indicator: Indicator,
        source_label: impl Into<String>,
    ) -> Self {
        Self {
            summary: summary.into(),
            indicator,
            source: CardSource {
                label: source_label.into(),
                url: None,
            },
            detail: None,
            suggestions: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn info(summary: impl Into<String>, source_label: impl Into<String>) -> Self {
        Self::new(summary, Indicator::Info, source_label)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_link(mut self, link: Value) -> Self {
        self.links.push(link);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.summary.chars().count() > MAX_SUMMARY_CHARS {
            return Err(Error::internal(format!(
                "card summary exceeds {MAX_SUMMARY_CHARS} characters"
            )));
        }
        Ok(())
    }
}

/// Type alias for hook handler functions.
pub type CdsHandler =
    Arc<dyn Fn(CdsRequest) -> BoxFuture<'static, Result<Vec<Card>>> + Send + Sync>;

/// Wrap an async closure as a [`CdsHandler`].
pub fn cds_handler<F, Fut>(f: F) -> CdsHandler
where
    F: Fn(CdsRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Card>>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

struct HookEntry {
    hook: String,
    title: Option<String>,
    description: String,
    prefetch: Option<Value>,
    handler: CdsHandler,
}

/// Builder assembling the service's immutable hook registry.
pub struct CdsHooksServiceBuilder {
    name: String,
    dispatcher: Option<Arc<EventDispatcher>>,
    hooks: IndexMap<String, HookEntry>,
}

impl CdsHooksServiceBuilder {
    /// Register a handler for `hook_name` under the service id `id`.
    /// Duplicate ids are a conflict.
    pub fn hook(
        self,
        hook_name: impl Into<String>,
        id: impl Into<String>,
        handler: CdsHandler,
    ) -> Result<Self> {
        let hook_name = hook_name.into();
        let description = format!("{hook_name} decision support");
        self.hook_full(hook_name, id, None, description, None, handler)
    }

    /// Register a handler with full discovery metadata.
    pub fn hook_full(
        mut self,
        hook_name: impl Into<String>,
        id: impl Into<String>,
        title: Option<String>,
        description: impl Into<String>,
        prefetch: Option<Value>,
        handler: CdsHandler,
    ) -> Result<Self> {
        let id = id.into();
        if self.hooks.contains_key(&id) {
            return Err(Error::conflict(format!(
                "CDS service '{id}' already registered"
            )));
        }
        self.hooks.insert(
            id,
            HookEntry {
                hook: hook_name.into(),
                title,
                description: description.into(),
                prefetch,
                handler,
            },
        );
        Ok(self)
    }

    pub fn build(self) -> Arc<CdsHooksService> {
        debug!(service = %self.name, hooks = self.hooks.len(), "Built CDS Hooks service");
        Arc::new(CdsHooksService {
            name: self.name,
            dispatcher: self.dispatcher,
            hooks: self.hooks,
        })
    }
}

/// CDS Hooks service gateway.
pub struct CdsHooksService {
    name: String,
    dispatcher: Option<Arc<EventDispatcher>>,
    hooks: IndexMap<String, HookEntry>,
}

impl CdsHooksService {
    pub fn builder(name: impl Into<String>) -> CdsHooksServiceBuilder {
        CdsHooksServiceBuilder {
            name: name.into(),
            dispatcher: None,
            hooks: IndexMap::new(),
        }
    }

    /// A builder whose service reports executions to `dispatcher`.
    pub fn builder_with_dispatcher(
        name: impl Into<String>,
        dispatcher: Arc<EventDispatcher>,
    ) -> CdsHooksServiceBuilder {
        CdsHooksServiceBuilder {
            name: name.into(),
            dispatcher: Some(dispatcher),
            hooks: IndexMap::new(),
        }
    }

    /// Discovery document listing each registered service exactly once.
    fn discovery(&self) -> Value {
        let services: Vec<Value> = self
            .hooks
            .iter()
            .map(|(id, entry)| {
                let mut service = Map::new();
                service.insert("id".into(), json!(id));
                service.insert("hook".into(), json!(entry.hook));
                if let Some(title) = &entry.title {
                    service.insert("title".into(), json!(title));
                }
                service.insert("description".into(), json!(entry.description));
                if let Some(prefetch) = &entry.prefetch {
                    service.insert("prefetch".into(), prefetch.clone());
                }
                Value::Object(service)
            })
            .collect();
        json!({ "services": services })
    }

    /// `cds.patient.view`-style topic for a hook name.
    fn topic_for(hook: &str) -> String {
        format!("cds.{}", hook.replace('-', "."))
    }

    async fn emit(&self, topic: &str, context: &EventContext) {
        if let Some(dispatcher) = &self.dispatcher {
            let payload = dispatcher.create_payload(context);
            let _ = dispatcher.emit(topic, payload).await;
        }
    }
}

#[async_trait]
impl Gateway for Arc<CdsHooksService> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GatewayKind {
        GatewayKind::Service
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/cds-services", get(discovery_route))
            .route("/cds-services/{id}", post(execute_route))
            .with_state(self.clone())
    }

    async fn status(&self) -> GatewayStatus {
        GatewayStatus {
            name: self.name.clone(),
            kind: GatewayKind::Service,
            active: true,
            sources: Vec::new(),
            operations: self
                .hooks
                .iter()
                .map(|(id, entry)| format!("{}:{id}", entry.hook))
                .collect(),
            pool: None,
            events_enabled: self.dispatcher.is_some(),
        }
    }
}

async fn discovery_route(State(service): State<Arc<CdsHooksService>>) -> Json<Value> {
    Json(service.discovery())
}

async fn execute_route(
    State(service): State<Arc<CdsHooksService>>,
    Path(id): Path<String>,
    body: std::result::Result<Json<Value>, axum::extract::rejection::JsonRejection>,
) -> Response {
    let entry = match service.hooks.get(&id) {
        Some(entry) => entry,
        None => {
            return ApiError(Error::not_registered(format!("CDS service '{id}'")))
                .into_response();
        }
    };

    let Json(raw) = match body {
        Ok(json) => json,
        Err(rejection) => {
            return ApiError(Error::invalid_argument(format!(
                "request body is not valid JSON: {rejection}"
            )))
            .into_response();
        }
    };

    let request = match validate_request(raw, &entry.hook) {
        Ok(request) => request,
        Err(err) => return ApiError(err).into_response(),
    };

    let topic = CdsHooksService::topic_for(&entry.hook);
    let context = EventContext::operation(&entry.hook)
        .with_resource_id(request.hook_instance.clone());

    match (entry.handler)(request).await {
        Ok(cards) => {
            if let Some(invalid) = cards.iter().find_map(|card| card.validate().err()) {
                warn!(service = %id, error = %invalid, "Hook handler produced an invalid card");
                return internal_error();
            }
            service.emit(&topic, &context).await;
            (StatusCode::OK, Json(json!({ "cards": cards }))).into_response()
        }
        Err(err) => {
            warn!(service = %id, error = %err, "Hook handler failed");
            service.emit(&format!("{topic}.error"), &context).await;
            internal_error()
        }
    }
}

/// Handler failures surface exactly as `{"error": "internal"}`.
fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal"})),
    )
        .into_response()
}

fn validate_request(raw: Value, expected_hook: &str) -> Result<CdsRequest> {
    let hook = raw
        .get("hook")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_argument("request is missing 'hook'"))?;
    if hook != expected_hook {
        return Err(Error::invalid_argument(format!(
            "request hook '{hook}' does not match service hook '{expected_hook}'"
        )));
    }
    if raw.get("hookInstance").and_then(Value::as_str).is_none() {
        return Err(Error::invalid_argument("request is missing 'hookInstance'"));
    }
    if !raw.get("context").is_some_and(Value::is_object) {
        return Err(Error::invalid_argument(
            "request is missing a 'context' object",
        ));
    }
    serde_json::from_value(raw)
        .map_err(|e| Error::invalid_argument(format!("malformed CDS request: {e}")))
}
