//! Gateway registry and host-level HTTP surface.
//!
//! The host owns one event dispatcher and a registration-ordered registry
//! of gateways and services. Registration happens before serving; the
//! resulting router is immutable. Gateways and services share one registry
//! and one namespace; the distinction is semantic only.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use indexmap::IndexMap;
use serde_json::{Value, json};
use tracing::info;

use carebridge_core::{Error, EventDispatcher, Result};
use carebridge_gateway::{Gateway, GatewayStatus};

use crate::middleware;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registration {
    Gateway,
    Service,
}

struct Entry {
    registration: Registration,
    prefix: String,
    gateway: Arc<dyn Gateway>,
}

/// The host application: gateway registry, DI lookups and root endpoints.
pub struct HostApp {
    name: String,
    version: String,
    dispatcher: Arc<EventDispatcher>,
    entries: IndexMap<String, Entry>,
}

impl HostApp {
    pub fn new(name: impl Into<String>, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            dispatcher,
            entries: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Register a CRUD-mediating gateway under its declared name, mounted
    /// at `prefix` (default `/{name}`). Must be called before serving.
    pub fn register_gateway<G>(&mut self, gateway: G, prefix: Option<&str>) -> Result<()>
    where
        G: Gateway + 'static,
    {
        self.register(Registration::Gateway, gateway, prefix)
    }

    /// Identical contract for non-CRUD services (CDS, SOAP).
    pub fn register_service<G>(&mut self, service: G, prefix: Option<&str>) -> Result<()>
    where
        G: Gateway + 'static,
    {
        self.register(Registration::Service, service, prefix)
    }

    fn register<G>(
        &mut self,
        registration: Registration,
        gateway: G,
        prefix: Option<&str>,
    ) -> Result<()>
    where
        G: Gateway + 'static,
    {
        let name = gateway.name().to_string();
        if self.entries.contains_key(&name) {
            return Err(Error::conflict(format!(
                "a gateway named '{name}' is already registered"
            )));
        }

        let prefix = match prefix {
            Some(prefix) if prefix.starts_with('/') && prefix.len() > 1 => {
                prefix.trim_end_matches('/').to_string()
            }
            Some(other) => {
                return Err(Error::invalid_argument(format!(
                    "mount prefix '{other}' must start with '/' and not be the root"
                )));
            }
            None => format!("/{name}"),
        };
        if self.entries.values().any(|entry| entry.prefix == prefix) {
            return Err(Error::conflict(format!(
                "mount prefix '{prefix}' is already in use"
            )));
        }

        info!(gateway = %name, prefix = %prefix, "Registered gateway");
        self.entries.insert(
            name,
            Entry {
                registration,
                prefix,
                gateway: Arc::new(gateway),
            },
        );
        Ok(())
    }

    /// DI lookup by name.
    pub fn gateway(&self, name: &str) -> Result<Arc<dyn Gateway>> {
        self.entries
            .get(name)
            .map(|entry| entry.gateway.clone())
            .ok_or_else(|| Error::not_registered(format!("gateway '{name}'")))
    }

    /// All registered gateways and services, in registration order.
    pub fn gateways(&self) -> HashMap<String, Arc<dyn Gateway>> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.gateway.clone()))
            .collect()
    }

    pub fn gateway_names(&self) -> Vec<String> {
        self.names(Registration::Gateway)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.names(Registration::Service)
    }

    fn names(&self, registration: Registration) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.registration == registration)
            .map(|(name, _)| name.clone())
            .collect()
    }

    async fn statuses(&self) -> IndexMap<String, GatewayStatus> {
        let mut statuses = IndexMap::new();
        for (name, entry) in &self.entries {
            statuses.insert(name.clone(), entry.gateway.status().await);
        }
        statuses
    }

    /// Build the complete application router: host endpoints plus every
    /// gateway nested at its prefix. Mount conflicts abort startup.
    pub fn router(self: Arc<Self>) -> Router {
        let mut router = Router::new()
            .route("/", get(root))
            .route("/health", get(health))
            .route("/gateway/status", get(gateway_status))
            .route("/gateway/status/{name}", get(single_gateway_status))
            .with_state(self.clone());

        for entry in self.entries.values() {
            router = router.nest(&entry.prefix, entry.gateway.router());
        }

        router.layer(axum::middleware::from_fn(middleware::request_id))
    }
}

impl std::fmt::Debug for HostApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostApp")
            .field("name", &self.name)
            .field("gateways", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

async fn root(State(host): State<Arc<HostApp>>) -> Json<Value> {
    Json(json!({
        "name": host.name,
        "version": host.version,
        "gateways": host.gateway_names(),
        "services": host.service_names(),
    }))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

async fn gateway_status(State(host): State<Arc<HostApp>>) -> Json<Value> {
    let statuses = host.statuses().await;
    Json(json!({ "gateways": statuses }))
}

async fn single_gateway_status(
    State(host): State<Arc<HostApp>>,
    axum::extract::Path(name): axum::extract::Path<String>,
) -> std::result::Result<Json<GatewayStatus>, carebridge_gateway::ApiError> {
    let gateway = host.gateway(&name)?;
    Ok(Json(gateway.status().await))
}
