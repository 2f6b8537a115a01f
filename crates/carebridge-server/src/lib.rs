//! Carebridge host application.
//!
//! Composes the protocol gateways, the event dispatcher and the FHIR
//! client pool into one HTTP process with root metadata, health and
//! introspection endpoints, and a clean shutdown path.

pub mod config;
pub mod host;
pub mod middleware;
pub mod observability;
pub mod server;

pub use config::AppConfig;
pub use host::HostApp;
pub use observability::{apply_logging_level, init_tracing, init_tracing_with_level};
pub use server::{CarebridgeServer, build_default_host};
