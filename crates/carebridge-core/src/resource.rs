use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// FHIR resource types the gateways route on.
///
/// Unknown types are carried verbatim in the `Other` variant; validation of
/// clinical content lives in the interop collaborator, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Patient,
    Practitioner,
    Organization,
    Encounter,
    Observation,
    Condition,
    DiagnosticReport,
    Medication,
    MedicationRequest,
    Procedure,
    DocumentReference,
    Bundle,
    CapabilityStatement,
    OperationOutcome,
    #[serde(untagged)]
    Other(String),
}

impl ResourceType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Patient => "Patient",
            Self::Practitioner => "Practitioner",
            Self::Organization => "Organization",
            Self::Encounter => "Encounter",
            Self::Observation => "Observation",
            Self::Condition => "Condition",
            Self::DiagnosticReport => "DiagnosticReport",
            Self::Medication => "Medication",
            Self::MedicationRequest => "MedicationRequest",
            Self::Procedure => "Procedure",
            Self::DocumentReference => "DocumentReference",
            Self::Bundle => "Bundle",
            Self::CapabilityStatement => "CapabilityStatement",
            Self::OperationOutcome => "OperationOutcome",
            Self::Other(name) => name.as_str(),
        }
    }

    /// Lowercased form used in event topics (`fhir.patient.read`).
    pub fn topic_segment(&self) -> String {
        self.as_str().to_ascii_lowercase()
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&str> for ResourceType {
    fn from(s: &str) -> Self {
        match s {
            "Patient" => Self::Patient,
            "Practitioner" => Self::Practitioner,
            "Organization" => Self::Organization,
            "Encounter" => Self::Encounter,
            "Observation" => Self::Observation,
            "Condition" => Self::Condition,
            "DiagnosticReport" => Self::DiagnosticReport,
            "Medication" => Self::Medication,
            "MedicationRequest" => Self::MedicationRequest,
            "Procedure" => Self::Procedure,
            "DocumentReference" => Self::DocumentReference,
            "Bundle" => Self::Bundle,
            "CapabilityStatement" => Self::CapabilityStatement,
            "OperationOutcome" => Self::OperationOutcome,
            other => Self::Other(other.to_string()),
        }
    }
}

impl FromStr for ResourceType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

/// Resource metadata; `versionId` is opaque to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Meta {
    #[serde(rename = "versionId", skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    #[serde(rename = "lastUpdated", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A parsed FHIR resource.
///
/// The body is carried losslessly in the flattened `data` map; only the
/// routing-relevant fields are lifted out. Immutable outside a resource
/// transaction scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "resourceType")]
    pub resource_type: ResourceType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Resource {
    pub fn new(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            id: None,
            meta: None,
            data: Map::new(),
        }
    }

    /// Parse a resource from a JSON value. Fails when `resourceType` is
    /// missing or the value is not an object.
    pub fn from_json(value: Value) -> Result<Self> {
        if value.get("resourceType").and_then(Value::as_str).is_none() {
            return Err(Error::invalid_response(
                "resource payload missing resourceType",
            ));
        }
        serde_json::from_value(value).map_err(|e| Error::invalid_response(e.to_string()))
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.id = Some(id.into());
    }

    pub fn version_id(&self) -> Option<&str> {
        self.meta.as_ref()?.version_id.as_deref()
    }

    pub fn set_version_id(&mut self, version_id: impl Into<String>) {
        self.meta.get_or_insert_with(Meta::default).version_id = Some(version_id.into());
    }

    pub fn get_field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }
}

/// Bundle container types used by the gateway surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleType {
    Searchset,
    Collection,
    Batch,
    BatchResponse,
    Transaction,
    TransactionResponse,
    History,
    Document,
}

/// A single bundle entry; order within a bundle is significant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleEntry {
    #[serde(rename = "fullUrl", skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BundleEntry {
    pub fn new(resource: Resource) -> Self {
        Self {
            full_url: None,
            resource: Some(resource),
            extra: Map::new(),
        }
    }

    pub fn with_full_url(mut self, full_url: impl Into<String>) -> Self {
        self.full_url = Some(full_url.into());
        self
    }
}

fn bundle_resource_type() -> String {
    "Bundle".to_string()
}

/// FHIR Bundle preserving entry order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(rename = "resourceType", default = "bundle_resource_type")]
    resource_type: String,
    #[serde(rename = "type")]
    pub bundle_type: BundleType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry: Vec<BundleEntry>,
}

impl Bundle {
    pub fn new(bundle_type: BundleType) -> Self {
        Self {
            resource_type: bundle_resource_type(),
            bundle_type,
            total: None,
            entry: Vec::new(),
        }
    }

    /// Searchset bundle from resources, preserving the given order.
    pub fn searchset(resources: Vec<Resource>) -> Self {
        let mut bundle = Self::new(BundleType::Searchset);
        bundle.total = Some(resources.len() as u64);
        bundle.entry = resources.into_iter().map(BundleEntry::new).collect();
        bundle
    }

    pub fn from_json(value: Value) -> Result<Self> {
        match value.get("resourceType").and_then(Value::as_str) {
            Some("Bundle") => {
                serde_json::from_value(value).map_err(|e| Error::invalid_response(e.to_string()))
            }
            Some(other) => Err(Error::invalid_response(format!(
                "expected Bundle, got {other}"
            ))),
            None => Err(Error::invalid_response("bundle payload missing resourceType")),
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn push(&mut self, resource: Resource) {
        self.entry.push(BundleEntry::new(resource));
    }

    /// Resources in entry order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.entry.iter().filter_map(|e| e.resource.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_empty()
    }
}
