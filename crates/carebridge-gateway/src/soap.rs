//! NoteReader SOAP/CDA service.
//!
//! Accepts SOAP 1.1 and 1.2 envelopes on `POST /`, dispatches on the
//! SOAPAction header (falling back to the body root element's local name),
//! and marshals the embedded CDA document in and out of consumer-supplied
//! method handlers. `GET /?wsdl` serves a generated WSDL for the
//! registered methods.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{RawQuery, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event as XmlEvent;
use tracing::{debug, warn};

use carebridge_core::{Error, EventContext, EventDispatcher, Result};

use crate::{Gateway, GatewayKind, GatewayStatus};

const SOAP11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const SOAP12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

/// A CDA-bearing request; the XML document is opaque to the core.
#[derive(Debug, Clone, PartialEq)]
pub struct CdaRequest {
    pub document: String,
}

/// A CDA-bearing response; same shape as the request.
#[derive(Debug, Clone, PartialEq)]
pub struct CdaResponse {
    pub document: String,
}

/// Type alias for SOAP method handler functions.
pub type SoapHandler =
    Arc<dyn Fn(CdaRequest) -> BoxFuture<'static, Result<CdaResponse>> + Send + Sync>;

/// Wrap an async closure as a [`SoapHandler`].
pub fn soap_handler<F, Fut>(f: F) -> SoapHandler
where
    F: Fn(CdaRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CdaResponse>> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SoapVersion {
    Soap11,
    Soap12,
}

impl SoapVersion {
    fn namespace(self) -> &'static str {
        match self {
            Self::Soap11 => SOAP11_NS,
            Self::Soap12 => SOAP12_NS,
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            Self::Soap11 => "text/xml; charset=utf-8",
            Self::Soap12 => "application/soap+xml; charset=utf-8",
        }
    }
}

struct ParsedEnvelope {
    version: SoapVersion,
    /// Local name of the body's first child element.
    body_action: String,
    document: Option<String>,
}

/// Builder assembling the service's immutable method registry.
pub struct NoteReaderServiceBuilder {
    name: String,
    dispatcher: Option<Arc<EventDispatcher>>,
    methods: IndexMap<String, SoapHandler>,
}

impl NoteReaderServiceBuilder {
    /// Register a method handler. Duplicate method names are a conflict.
    pub fn method(mut self, name: impl Into<String>, handler: SoapHandler) -> Result<Self> {
        let name = name.into();
        if self.methods.contains_key(&name) {
            return Err(Error::conflict(format!(
                "SOAP method '{name}' already registered"
            )));
        }
        self.methods.insert(name, handler);
        Ok(self)
    }

    pub fn build(self) -> Arc<NoteReaderService> {
        debug!(service = %self.name, methods = self.methods.len(), "Built NoteReader service");
        Arc::new(NoteReaderService {
            name: self.name,
            dispatcher: self.dispatcher,
            methods: self.methods,
        })
    }
}

/// SOAP endpoint dispatching to method-named handlers.
pub struct NoteReaderService {
    name: String,
    dispatcher: Option<Arc<EventDispatcher>>,
    methods: IndexMap<String, SoapHandler>,
}

impl NoteReaderService {
    pub fn builder(name: impl Into<String>) -> NoteReaderServiceBuilder {
        NoteReaderServiceBuilder {
            name: name.into(),
            dispatcher: None,
            methods: IndexMap::new(),
        }
    }

    /// A builder whose service reports dispatches to `dispatcher`.
    pub fn builder_with_dispatcher(
        name: impl Into<String>,
        dispatcher: Arc<EventDispatcher>,
    ) -> NoteReaderServiceBuilder {
        NoteReaderServiceBuilder {
            name: name.into(),
            dispatcher: Some(dispatcher),
            methods: IndexMap::new(),
        }
    }

    pub fn method_names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    /// Resolve the method to dispatch: SOAPAction (or the SOAP 1.2
    /// `action` content-type parameter) first, then the body root's local
    /// name.
    fn resolve_method(&self, headers: &HeaderMap, body_action: &str) -> Option<String> {
        if let Some(action) = header_action(headers) {
            if self.methods.contains_key(&action) {
                return Some(action);
            }
        }
        self.methods
            .contains_key(body_action)
            .then(|| body_action.to_string())
    }

    async fn emit_success(&self, method: &str) {
        let topic = match method {
            "ProcessDocument" => "notereader.process.note",
            "SignDocument" => "notereader.sign.note",
            // Methods outside the NoteReader vocabulary report generically.
            _ => "ehr.generic",
        };
        self.emit(topic, method).await;
    }

    async fn emit_error(&self, method: &str) {
        self.emit("notereader.process.note.error", method).await;
    }

    async fn emit(&self, topic: &str, method: &str) {
        if let Some(dispatcher) = &self.dispatcher {
            let context = EventContext::operation(method);
            let payload = dispatcher.create_payload(&context);
            let _ = dispatcher.emit(topic, payload).await;
        }
    }
}

#[async_trait]
impl Gateway for Arc<NoteReaderService> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> GatewayKind {
        GatewayKind::Service
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/", get(wsdl_route).post(dispatch_route))
            .with_state(self.clone())
    }

    async fn status(&self) -> GatewayStatus {
        GatewayStatus {
            name: self.name.clone(),
            kind: GatewayKind::Service,
            active: true,
            sources: Vec::new(),
            operations: self.method_names(),
            pool: None,
            events_enabled: self.dispatcher.is_some(),
        }
    }
}

async fn wsdl_route(
    State(service): State<Arc<NoteReaderService>>,
    RawQuery(query): RawQuery,
) -> Response {
    let wants_wsdl = query
        .as_deref()
        .map(|q| q.split('&').any(|p| p == "wsdl" || p.starts_with("wsdl=")))
        .unwrap_or(false);
    if !wants_wsdl {
        return (
            StatusCode::BAD_REQUEST,
            "POST a SOAP envelope, or GET ?wsdl for the service description",
        )
            .into_response();
    }

    let methods: Vec<&str> = service.methods.keys().map(String::as_str).collect();
    let wsdl = crate::wsdl::generate_wsdl(&service.name, &methods);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        wsdl,
    )
        .into_response()
}

async fn dispatch_route(
    State(service): State<Arc<NoteReaderService>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let envelope = match parse_envelope(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(error = %err, "Rejected malformed SOAP envelope");
            return fault(SoapVersion::Soap11, FaultSide::Client, &err.to_string());
        }
    };

    let method = match service.resolve_method(&headers, &envelope.body_action) {
        Some(method) => method,
        None => {
            warn!(action = %envelope.body_action, "No handler for SOAP action");
            return fault(
                envelope.version,
                FaultSide::Client,
                &format!("no handler registered for action '{}'", envelope.body_action),
            );
        }
    };

    let request = CdaRequest {
        document: envelope.document.unwrap_or_default(),
    };

    match service.methods[&method](request).await {
        Ok(response) => {
            service.emit_success(&method).await;
            let xml = render_response(envelope.version, &method, &response.document);
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, envelope.version.content_type())],
                xml,
            )
                .into_response()
        }
        Err(err) => {
            warn!(method = %method, error = %err, "SOAP handler failed");
            service.emit_error(&method).await;
            fault(envelope.version, FaultSide::Server, &err.to_string())
        }
    }
}

/// Extract the action's trailing name from the SOAPAction header or the
/// SOAP 1.2 content-type `action` parameter.
fn header_action(headers: &HeaderMap) -> Option<String> {
    let raw = headers
        .get("soapaction")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            let content_type = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
            content_type.split(';').find_map(|part| {
                let part = part.trim();
                part.strip_prefix("action=").map(str::to_string)
            })
        })?;

    let trimmed = raw.trim().trim_matches('"');
    if trimmed.is_empty() {
        return None;
    }
    // Actions are often URIs (`urn:epic#ProcessDocument`); keep the tail.
    let name = trimmed
        .rsplit(['/', '#', ':'])
        .next()
        .unwrap_or(trimmed)
        .to_string();
    (!name.is_empty()).then_some(name)
}

fn parse_envelope(xml: &str) -> Result<ParsedEnvelope> {
    let version = if xml.contains(SOAP12_NS) {
        SoapVersion::Soap12
    } else if xml.contains(SOAP11_NS) {
        SoapVersion::Soap11
    } else {
        return Err(Error::invalid_argument("payload is not a SOAP envelope"));
    };

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut in_body = false;
    let mut body_action: Option<String> = None;
    let mut in_document = false;
    let mut document = String::new();
    let mut saw_document = false;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(element)) => {
                let local = String::from_utf8_lossy(element.local_name().as_ref()).to_string();
                if local == "Body" {
                    in_body = true;
                } else if in_body && body_action.is_none() {
                    body_action = Some(local);
                } else if in_body && local == "document" {
                    in_document = true;
                    saw_document = true;
                }
            }
            Ok(XmlEvent::Text(text)) if in_document => {
                let unescaped = text.unescape().map_err(|e| {
                    Error::invalid_argument(format!("malformed document content: {e}"))
                })?;
                document.push_str(&unescaped);
            }
            Ok(XmlEvent::CData(cdata)) if in_document => {
                document.push_str(&String::from_utf8_lossy(&cdata.into_inner()));
            }
            Ok(XmlEvent::End(element)) => {
                if element.local_name().as_ref() == b"document" {
                    in_document = false;
                }
            }
            Ok(XmlEvent::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(Error::invalid_argument(format!(
                    "malformed SOAP envelope: {e}"
                )));
            }
        }
    }

    let body_action =
        body_action.ok_or_else(|| Error::invalid_argument("SOAP body carries no operation"))?;

    Ok(ParsedEnvelope {
        version,
        body_action,
        document: saw_document.then_some(document),
    })
}

fn render_response(version: SoapVersion, method: &str, document: &str) -> String {
    let ns = version.namespace();
    let escaped = escape(document);
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <soapenv:Envelope xmlns:soapenv=\"{ns}\">\
         <soapenv:Body>\
         <{method}Response><document>{escaped}</document></{method}Response>\
         </soapenv:Body>\
         </soapenv:Envelope>"
    )
}

#[derive(Debug, Clone, Copy)]
enum FaultSide {
    Client,
    Server,
}

fn fault(version: SoapVersion, side: FaultSide, message: &str) -> Response {
    let ns = version.namespace();
    let escaped = escape(message);
    let (status, body) = match version {
        SoapVersion::Soap11 => {
            let code = match side {
                FaultSide::Client => "soapenv:Client",
                FaultSide::Server => "soapenv:Server",
            };
            let body = format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <soapenv:Envelope xmlns:soapenv=\"{ns}\">\
                 <soapenv:Body><soapenv:Fault>\
                 <faultcode>{code}</faultcode>\
                 <faultstring>{escaped}</faultstring>\
                 </soapenv:Fault></soapenv:Body>\
                 </soapenv:Envelope>"
            );
            (StatusCode::INTERNAL_SERVER_ERROR, body)
        }
        SoapVersion::Soap12 => {
            let (status, code) = match side {
                FaultSide::Client => (StatusCode::BAD_REQUEST, "soapenv:Sender"),
                FaultSide::Server => (StatusCode::INTERNAL_SERVER_ERROR, "soapenv:Receiver"),
            };
            let body = format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <soapenv:Envelope xmlns:soapenv=\"{ns}\">\
                 <soapenv:Body><soapenv:Fault>\
                 <soapenv:Code><soapenv:Value>{code}</soapenv:Value></soapenv:Code>\
                 <soapenv:Reason><soapenv:Text xml:lang=\"en\">{escaped}</soapenv:Text></soapenv:Reason>\
                 </soapenv:Fault></soapenv:Body>\
                 </soapenv:Envelope>"
            );
            (status, body)
        }
    };
    (
        status,
        [(header::CONTENT_TYPE, version.content_type())],
        body,
    )
        .into_response()
}
