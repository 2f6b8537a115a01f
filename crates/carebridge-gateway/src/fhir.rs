//! FHIR REST mediation gateway.
//!
//! Hosts consumer-supplied transform and aggregate handlers keyed by FHIR
//! resource type. Handlers reach upstream servers through the shared
//! client pool, so every read/search/update they perform emits the usual
//! `fhir.*` events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use carebridge_client::{ClientStatus, FhirClientPool};
use carebridge_core::{Bundle, Error, Resource, Result};

use crate::error::ApiError;
use crate::{Gateway, GatewayKind, GatewayStatus};

/// Type alias for transform handler functions.
///
/// A transform receives the shared client pool, the logical id from the
/// path and the optional `source` query parameter, and returns the
/// enriched resource that becomes the HTTP 200 body.
pub type TransformHandler = Arc<
    dyn Fn(FhirClientPool, String, Option<String>) -> BoxFuture<'static, Result<Resource>>
        + Send
        + Sync,
>;

/// Type alias for aggregate handler functions.
///
/// An aggregate receives the pool and the request's query parameters and
/// returns a Bundle synthesised across sources.
pub type AggregateHandler = Arc<
    dyn Fn(FhirClientPool, HashMap<String, String>) -> BoxFuture<'static, Result<Bundle>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a [`TransformHandler`].
pub fn transform_handler<F, Fut>(f: F) -> TransformHandler
where
    F: Fn(FhirClientPool, String, Option<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resource>> + Send + 'static,
{
    Arc::new(move |client, id, source| Box::pin(f(client, id, source)))
}

/// Wrap an async closure as an [`AggregateHandler`].
pub fn aggregate_handler<F, Fut>(f: F) -> AggregateHandler
where
    F: Fn(FhirClientPool, HashMap<String, String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bundle>> + Send + 'static,
{
    Arc::new(move |client, params| Box::pin(f(client, params)))
}

/// Declared query parameter of an aggregate endpoint, surfaced through
/// `GET /metadata`.
#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    pub name: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            description: None,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            description: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

struct TransformEntry {
    description: Option<String>,
    handler: TransformHandler,
}

struct AggregateEntry {
    description: Option<String>,
    params: Vec<ParamSpec>,
    handler: AggregateHandler,
}

/// Builder assembling the gateway's immutable handler registries.
pub struct FhirGatewayBuilder {
    name: String,
    client: FhirClientPool,
    transforms: IndexMap<String, TransformEntry>,
    aggregates: IndexMap<String, AggregateEntry>,
}

impl FhirGatewayBuilder {
    /// Register a transform handler for `resource_type`, mounted at
    /// `GET /transform/{resource_type}/{id}`. Duplicate registration for a
    /// resource type is a conflict.
    pub fn transform(
        mut self,
        resource_type: impl Into<String>,
        handler: TransformHandler,
    ) -> Result<Self> {
        let resource_type = resource_type.into();
        if self.transforms.contains_key(&resource_type) {
            return Err(Error::conflict(format!(
                "transform handler for {resource_type} already registered"
            )));
        }
        self.transforms.insert(
            resource_type,
            TransformEntry {
                description: None,
                handler,
            },
        );
        Ok(self)
    }

    /// Register an aggregate handler for `resource_type`, mounted at
    /// `GET /aggregate/{resource_type}` with the declared parameters.
    pub fn aggregate(
        mut self,
        resource_type: impl Into<String>,
        params: Vec<ParamSpec>,
        handler: AggregateHandler,
    ) -> Result<Self> {
        let resource_type = resource_type.into();
        if self.aggregates.contains_key(&resource_type) {
            return Err(Error::conflict(format!(
                "aggregate handler for {resource_type} already registered"
            )));
        }
        self.aggregates.insert(
            resource_type,
            AggregateEntry {
                description: None,
                params,
                handler,
            },
        );
        Ok(self)
    }

    /// Attach a description to the most recently registered transform.
    pub fn describe_transform(mut self, resource_type: &str, text: impl Into<String>) -> Self {
        if let Some(entry) = self.transforms.get_mut(resource_type) {
            entry.description = Some(text.into());
        }
        self
    }

    /// Attach a description to the most recently registered aggregate.
    pub fn describe_aggregate(mut self, resource_type: &str, text: impl Into<String>) -> Self {
        if let Some(entry) = self.aggregates.get_mut(resource_type) {
            entry.description = Some(text.into());
        }
        self
    }

    pub fn build(self) -> Arc<FhirGateway> {
        debug!(
            gateway = %self.name,
            transforms = self.transforms.len(),
            aggregates = self.aggregates.len(),
            "Built FHIR gateway"
        );
        Arc::new(FhirGateway {
            name: self.name,
            client: self.client,
            transforms: self.transforms,
            aggregates: self.aggregates,
        })
    }
}

/// REST mediation gateway over the shared FHIR client pool.
pub struct FhirGateway {
    name: String,
    client: FhirClientPool,
    transforms: IndexMap<String, TransformEntry>,
    aggregates: IndexMap<String, AggregateEntry>,
}

impl FhirGateway {
    pub fn builder(name: impl Into<String>, client: FhirClientPool) -> FhirGatewayBuilder {
        FhirGatewayBuilder {
            name: name.into(),
            client,
            transforms: IndexMap::new(),
            aggregates: IndexMap::new(),
        }
    }

    pub fn client(&self) -> &FhirClientPool {
        &self.client
    }

    /// CapabilityStatement-shaped document enumerating the registered
    /// transform and aggregate endpoints.
    fn metadata(&self) -> Value {
        let transforms: Vec<Value> = self
            .transforms
            .iter()
            .map(|(resource_type, entry)| {
                json!({
                    "name": format!("transform/{resource_type}"),
                    "resource": resource_type,
                    "documentation": entry.description,
                    "parameters": [
                        {"name": "id", "in": "path", "required": true},
                        {"name": "source", "in": "query", "required": false}
                    ],
                })
            })
            .collect();

        let aggregates: Vec<Value> = self
            .aggregates
            .iter()
            .map(|(resource_type, entry)| {
                json!({
                    "name": format!("aggregate/{resource_type}"),
                    "resource": resource_type,
                    "documentation": entry.description,
                    "parameters": entry.params,
                })
            })
            .collect();

        json!({
            "resourceType": "CapabilityStatement",
            "status": "active",
            "kind": "instance",
            "software": {
                "name": self.name,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "format": ["application/fhir+json"],
            "rest": [{
                "mode": "server",
                "operation": transforms.into_iter().chain(aggregates).collect::<Vec<_>>(),
            }],
        })
    }

    fn operations(&self) -> Vec<String> {
        self.transforms
            .keys()
            .map(|resource_type| format!("transform/{resource_type}"))
            .chain(
                self.aggregates
                    .keys()
                    .map(|resource_type| format!("aggregate/{resource_type}")),
            )
            .collect()
    }
}

#[async_trait]
impl Gateway for Arc<FhirGateway> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GatewayKind {
        GatewayKind::Fhir
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/metadata", get(metadata_route))
            .route("/status", get(status_route))
            .route("/transform/{resource_type}/{id}", get(transform_route))
            .route("/aggregate/{resource_type}", get(aggregate_route))
            .with_state(self.clone())
    }

    async fn status(&self) -> GatewayStatus {
        GatewayStatus {
            name: self.name.clone(),
            kind: GatewayKind::Fhir,
            active: true,
            sources: self.client.source_names(),
            operations: self.operations(),
            pool: Some(self.client.pool_status()),
            events_enabled: self.client.dispatcher().is_some(),
        }
    }
}

async fn metadata_route(State(gateway): State<Arc<FhirGateway>>) -> Json<Value> {
    Json(gateway.metadata())
}

/// Pool snapshot plus per-source auth freshness.
async fn status_route(State(gateway): State<Arc<FhirGateway>>) -> Json<ClientStatus> {
    Json(gateway.client.status().await)
}

async fn transform_route(
    State(gateway): State<Arc<FhirGateway>>,
    Path((resource_type, id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> std::result::Result<Json<Value>, ApiError> {
    let entry = gateway.transforms.get(&resource_type).ok_or_else(|| {
        Error::not_registered(format!("no transform handler for {resource_type}"))
    })?;
    let source = query.get("source").cloned();
    let resource = (entry.handler)(gateway.client.clone(), id, source).await?;
    Ok(Json(resource.to_json()))
}

async fn aggregate_route(
    State(gateway): State<Arc<FhirGateway>>,
    Path(resource_type): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> std::result::Result<Json<Value>, ApiError> {
    let entry = gateway.aggregates.get(&resource_type).ok_or_else(|| {
        Error::not_registered(format!("no aggregate handler for {resource_type}"))
    })?;

    for param in entry.params.iter().filter(|p| p.required) {
        if !query.contains_key(&param.name) {
            return Err(Error::invalid_argument(format!(
                "missing required parameter '{}'",
                param.name
            ))
            .into());
        }
    }

    let bundle = (entry.handler)(gateway.client.clone(), query).await?;
    Ok(Json(bundle.to_json()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use carebridge_client::PoolConfig;
    use carebridge_core::{BundleType, ResourceType};

    fn test_pool() -> FhirClientPool {
        FhirClientPool::new(PoolConfig::default())
    }

    fn noop_transform() -> TransformHandler {
        transform_handler(|_client, id, _source| async move {
            Ok(Resource::new(ResourceType::Patient).with_id(id))
        })
    }

    fn noop_aggregate() -> AggregateHandler {
        aggregate_handler(|_client, _params| async move {
            Ok(Bundle::new(BundleType::Searchset))
        })
    }

    #[test]
    fn test_duplicate_transform_rejected() {
        let builder = FhirGateway::builder("fhir", test_pool())
            .transform("Patient", noop_transform())
            .unwrap();
        let err = match builder.transform("Patient", noop_transform()) {
            Err(err) => err,
            Ok(_) => panic!("expected duplicate transform to be rejected"),
        };
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_duplicate_aggregate_rejected() {
        let builder = FhirGateway::builder("fhir", test_pool())
            .aggregate("Observation", vec![], noop_aggregate())
            .unwrap();
        let err = match builder.aggregate("Observation", vec![], noop_aggregate()) {
            Err(err) => err,
            Ok(_) => panic!("expected duplicate aggregate to be rejected"),
        };
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_metadata_enumerates_registrations() {
        let gateway = FhirGateway::builder("fhir", test_pool())
            .transform("Patient", noop_transform())
            .unwrap()
            .aggregate(
                "Observation",
                vec![ParamSpec::required("patient")],
                noop_aggregate(),
            )
            .unwrap()
            .build();

        let metadata = gateway.metadata();
        assert_eq!(metadata["resourceType"], "CapabilityStatement");
        let operations = metadata["rest"][0]["operation"].as_array().unwrap();
        assert_eq!(operations.len(), 2);
        assert_eq!(operations[0]["name"], "transform/Patient");
        assert_eq!(operations[1]["name"], "aggregate/Observation");
        assert_eq!(operations[1]["parameters"][0]["name"], "patient");
        assert_eq!(operations[1]["parameters"][0]["required"], true);
    }

    #[tokio::test]
    async fn test_status_reports_operations() {
        let gateway = FhirGateway::builder("fhir", test_pool())
            .transform("Patient", noop_transform())
            .unwrap()
            .build();

        let status = Gateway::status(&gateway).await;
        assert_eq!(status.name, "fhir");
        assert!(status.active);
        assert_eq!(status.operations, vec!["transform/Patient"]);
        assert!(status.pool.is_some());
        assert!(!status.events_enabled);
    }
}
