//! Interoperability collaborator interface.
//!
//! CDA parsing and rendering are delegated to an engine supplied by the
//! embedding application; the gateways depend only on this trait and never
//! interpret clinical content themselves.

use async_trait::async_trait;

use carebridge_core::{Resource, Result};

/// Destination formats for [`InteropEngine::from_fhir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Cda,
    FhirJson,
}

/// One clinical section of a parsed document, in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClinicalSection {
    pub title: String,
    /// Section code (e.g. LOINC), when the source document carries one.
    pub code: Option<String>,
    pub narrative: String,
}

/// A parsed clinical document exposing its sections.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClinicalDocument {
    pub id: Option<String>,
    pub sections: Vec<ClinicalSection>,
}

impl ClinicalDocument {
    pub fn section(&self, title: &str) -> Option<&ClinicalSection> {
        self.sections.iter().find(|s| s.title == title)
    }
}

/// Template/terminology engine converting between CDA and FHIR.
///
/// Consumed, never implemented, by this crate: handlers receive an engine
/// from the embedding application.
#[async_trait]
pub trait InteropEngine: Send + Sync {
    fn parse_cda(&self, xml: &str) -> Result<ClinicalDocument>;

    fn render_cda(&self, document: &ClinicalDocument) -> Result<String>;

    async fn to_fhir(&self, document: &ClinicalDocument) -> Result<Vec<Resource>>;

    async fn from_fhir(&self, resources: &[Resource], format: DocumentFormat) -> Result<String>;
}
