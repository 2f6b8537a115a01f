//! Protocol gateways for the Carebridge host.
//!
//! Each gateway is a self-contained axum router plus registries of
//! consumer-supplied handlers, built once through a builder and immutable
//! afterwards. The host mounts gateways at path prefixes and injects the
//! shared event dispatcher and FHIR client pool at construction time.

pub mod cds;
pub mod error;
pub mod fhir;
pub mod interop;
pub mod soap;
pub mod wsdl;

use async_trait::async_trait;
use serde::Serialize;

use carebridge_client::PoolStatus;

pub use cds::{Card, CardSource, CdsHooksService, CdsRequest, Indicator, cds_handler};
pub use error::ApiError;
pub use fhir::{FhirGateway, ParamSpec, aggregate_handler, transform_handler};
pub use interop::{ClinicalDocument, ClinicalSection, DocumentFormat, InteropEngine};
pub use soap::{CdaRequest, CdaResponse, NoteReaderService, soap_handler};

/// Whether a gateway mediates FHIR CRUD or a non-CRUD protocol surface.
/// The distinction is purely semantic; the host treats both alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    Fhir,
    Service,
}

/// Introspection snapshot reported through `GET /gateway/status`.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub name: String,
    pub kind: GatewayKind,
    pub active: bool,
    /// FHIR sources visible to this gateway, if it holds a client pool.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    /// Registered hooks, SOAP methods, or handler selectors.
    pub operations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStatus>,
    pub events_enabled: bool,
}

/// A mountable protocol gateway.
///
/// Implementations hold their state behind an `Arc` so `router()` can hand
/// axum a cheap clone.
#[async_trait]
pub trait Gateway: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> GatewayKind;

    /// The routes this gateway advertises, relative to its mount prefix.
    fn router(&self) -> axum::Router;

    /// Point-in-time status for host introspection.
    async fn status(&self) -> GatewayStatus;
}
